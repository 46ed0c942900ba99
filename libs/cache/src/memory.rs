use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ingest_api::ServiceError;

use crate::{CacheCommand, CacheConnection, CacheConnector, CacheReply, DatabaseIndex};

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const INVALID_EXPIRE: &str = "ERR invalid expire time in 'expire' command";

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Keyspace = HashMap<String, Entry>;

#[derive(Default)]
struct CacheState {
    databases: Mutex<HashMap<DatabaseIndex, Keyspace>>,
    refused: Mutex<HashSet<DatabaseIndex>>,
    failing_quit: Mutex<HashSet<DatabaseIndex>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("memory cache lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// In-process кэш с раздельными keyspace'ами на каждую базу.
/// Expiry ленивый: просроченный ключ удаляется при следующем обращении.
#[derive(Clone, Default)]
pub struct MemoryCache {
    state: Arc<CacheState>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Отказывать в соединении с базой `db`.
    pub fn refuse_database(&self, db: DatabaseIndex) {
        lock(&self.state.refused).insert(db);
    }

    /// QUIT на базе `db` завершается ошибкой.
    pub fn fail_quit(&self, db: DatabaseIndex) {
        lock(&self.state.failing_quit).insert(db);
    }

    fn run(&self, db: DatabaseIndex, command: &CacheCommand) -> Result<CacheReply, ServiceError> {
        let mut databases = lock(&self.state.databases);
        let keyspace = databases.entry(db).or_default();
        let now = Instant::now();
        keyspace.retain(|_, entry| !entry.is_expired(now));
        apply(keyspace, command, now)
    }
}

fn wrong_type() -> ServiceError {
    ServiceError::new(WRONG_TYPE)
}

fn apply(ks: &mut Keyspace, command: &CacheCommand, now: Instant) -> Result<CacheReply, ServiceError> {
    let reply = match command {
        CacheCommand::Get { key } => match ks.get(key).map(|e| &e.value) {
            None => CacheReply::Nil,
            Some(Value::Text(s)) => CacheReply::Text(s.clone()),
            Some(_) => return Err(wrong_type()),
        },
        CacheCommand::Set { key, value } => {
            ks.insert(key.clone(), Entry { value: Value::Text(value.clone()), expires_at: None });
            CacheReply::Ok
        }
        CacheCommand::LPush { key, value } | CacheCommand::RPush { key, value } => {
            let entry = ks.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            let Value::List(list) = &mut entry.value else {
                return Err(wrong_type());
            };
            if matches!(command, CacheCommand::LPush { .. }) {
                list.push_front(value.clone());
            } else {
                list.push_back(value.clone());
            }
            CacheReply::Integer(list.len() as i64)
        }
        CacheCommand::LPop { key } | CacheCommand::RPop { key } => {
            let Some(entry) = ks.get_mut(key) else {
                return Ok(CacheReply::Nil);
            };
            let Value::List(list) = &mut entry.value else {
                return Err(wrong_type());
            };
            let popped = if matches!(command, CacheCommand::LPop { .. }) {
                list.pop_front()
            } else {
                list.pop_back()
            };
            if list.is_empty() {
                ks.remove(key);
            }
            popped.map_or(CacheReply::Nil, CacheReply::Text)
        }
        CacheCommand::SAdd { key, member } => {
            let entry = ks.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::Set(BTreeSet::new()),
                expires_at: None,
            });
            let Value::Set(set) = &mut entry.value else {
                return Err(wrong_type());
            };
            CacheReply::Integer(i64::from(set.insert(member.clone())))
        }
        CacheCommand::SMembers { key } => match ks.get(key).map(|e| &e.value) {
            None => CacheReply::List(Vec::new()),
            Some(Value::Set(set)) => CacheReply::List(set.iter().cloned().collect()),
            Some(_) => return Err(wrong_type()),
        },
        CacheCommand::HSet { key, field, value } => {
            let entry = ks.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type());
            };
            let added = hash.insert(field.clone(), value.clone()).is_none();
            CacheReply::Integer(i64::from(added))
        }
        CacheCommand::HGet { key, field } => match ks.get(key).map(|e| &e.value) {
            None => CacheReply::Nil,
            Some(Value::Hash(hash)) => hash.get(field).cloned().map_or(CacheReply::Nil, CacheReply::Text),
            Some(_) => return Err(wrong_type()),
        },
        CacheCommand::HDel { key, field } => {
            let Some(entry) = ks.get_mut(key) else {
                return Ok(CacheReply::Integer(0));
            };
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type());
            };
            let removed = hash.remove(field).is_some();
            if hash.is_empty() {
                ks.remove(key);
            }
            CacheReply::Integer(i64::from(removed))
        }
        CacheCommand::Keys { pattern } => {
            let mut keys: Vec<String> = ks.keys().filter(|k| glob_match(pattern, k)).cloned().collect();
            keys.sort();
            CacheReply::List(keys)
        }
        CacheCommand::Del { key } => CacheReply::Integer(i64::from(ks.remove(key).is_some())),
        CacheCommand::Exists { key } => CacheReply::Integer(i64::from(ks.contains_key(key))),
        CacheCommand::Expire { key, seconds } => {
            if *seconds <= 0 {
                return Ok(CacheReply::Integer(i64::from(ks.remove(key).is_some())));
            }
            let expires_at = now
                .checked_add(Duration::from_secs(seconds.unsigned_abs()))
                .ok_or_else(|| ServiceError::new(INVALID_EXPIRE))?;
            match ks.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = Some(expires_at);
                    CacheReply::Integer(1)
                }
                None => CacheReply::Integer(0),
            }
        }
    };
    Ok(reply)
}

/// Glob в стиле KEYS: `*`, `?`, `[abc]`, `[^abc]`, `[a-z]`, `\` экранирует.
///
/// Итеративный matcher с одной точкой возврата к последней `*`: O(len(p) * len(t)).
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if p.get(pi) == Some(&'*') {
            star = Some((pi, ti));
            pi += 1;
            continue;
        }
        if let Some(next) = match_one(&p, pi, t[ti]) {
            pi = next;
            ti += 1;
            continue;
        }
        match star {
            Some((star_pi, star_ti)) => {
                pi = star_pi + 1;
                ti = star_ti + 1;
                star = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Сопоставить один токен pattern'а, начинающийся в `pi`, с символом `c`.
/// Возвращает позицию следующего токена.
fn match_one(p: &[char], pi: usize, c: char) -> Option<usize> {
    match *p.get(pi)? {
        '?' => Some(pi + 1),
        '\\' if pi + 1 < p.len() => (p[pi + 1] == c).then_some(pi + 2),
        '[' => match_class(p, pi, c),
        literal => (literal == c).then_some(pi + 1),
    }
}

fn match_class(p: &[char], start: usize, c: char) -> Option<usize> {
    let mut i = start + 1;
    let negate = p.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] { (p[i], p[i + 2]) } else { (p[i + 2], p[i]) };
            matched |= (lo..=hi).contains(&c);
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }

    // Незакрытая `[` сравнивается как обычный символ.
    if i >= p.len() {
        return (c == '[').then_some(start + 1);
    }
    (matched != negate).then_some(i + 1)
}

// ═══════════════════════════════════════════════════════════════
//  Connector / connection
// ═══════════════════════════════════════════════════════════════

impl CacheConnector for MemoryCache {
    fn connect<'a>(
        &'a self,
        _uri: &'a str,
        db: DatabaseIndex,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn CacheConnection>, ServiceError>> + Send + 'a>>
    {
        Box::pin(async move {
            if lock(&self.state.refused).contains(&db) {
                return Err(ServiceError::connection(format!("memory cache refused {db}")));
            }
            Ok(Box::new(MemoryConnection {
                cache: self.clone(),
                db,
                closed: AtomicBool::new(false),
            }) as Box<dyn CacheConnection>)
        })
    }
}

struct MemoryConnection {
    cache: MemoryCache,
    db: DatabaseIndex,
    closed: AtomicBool,
}

impl CacheConnection for MemoryConnection {
    fn execute<'a>(
        &'a self,
        command: &'a CacheCommand,
    ) -> Pin<Box<dyn Future<Output = Result<CacheReply, ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(ServiceError::connection("connection is closed"));
            }
            self.cache.run(self.db, command)
        })
    }

    fn quit(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            if lock(&self.cache.state.failing_quit).contains(&self.db) {
                return Err(ServiceError::io(format!("QUIT failed on {}", self.db)));
            }
            Ok(())
        })
    }
}
