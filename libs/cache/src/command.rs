use crate::CacheError;

// ═══════════════════════════════════════════════════════════════
//  Database index
// ═══════════════════════════════════════════════════════════════

/// Номер логической базы кэша.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseIndex(pub u8);

impl DatabaseIndex {
    pub const DEFAULT: DatabaseIndex = DatabaseIndex(0);

    pub fn get(self) -> u8 {
        self.0
    }
}

impl From<u8> for DatabaseIndex {
    fn from(value: u8) -> Self {
        DatabaseIndex(value)
    }
}

impl std::fmt::Display for DatabaseIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DB{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Commands
// ═══════════════════════════════════════════════════════════════

/// Операция, которую пул маршрутизирует в соединение нужной базы.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCommand {
    Get { key: String },
    Set { key: String, value: String },
    LPush { key: String, value: String },
    RPush { key: String, value: String },
    LPop { key: String },
    RPop { key: String },
    SAdd { key: String, member: String },
    SMembers { key: String },
    HSet { key: String, field: String, value: String },
    HGet { key: String, field: String },
    HDel { key: String, field: String },
    Keys { pattern: String },
    Del { key: String },
    Exists { key: String },
    Expire { key: String, seconds: i64 },
}

impl CacheCommand {
    /// Имя команды в wire-протоколе.
    pub fn name(&self) -> &'static str {
        match self {
            CacheCommand::Get { .. } => "GET",
            CacheCommand::Set { .. } => "SET",
            CacheCommand::LPush { .. } => "LPUSH",
            CacheCommand::RPush { .. } => "RPUSH",
            CacheCommand::LPop { .. } => "LPOP",
            CacheCommand::RPop { .. } => "RPOP",
            CacheCommand::SAdd { .. } => "SADD",
            CacheCommand::SMembers { .. } => "SMEMBERS",
            CacheCommand::HSet { .. } => "HSET",
            CacheCommand::HGet { .. } => "HGET",
            CacheCommand::HDel { .. } => "HDEL",
            CacheCommand::Keys { .. } => "KEYS",
            CacheCommand::Del { .. } => "DEL",
            CacheCommand::Exists { .. } => "EXISTS",
            CacheCommand::Expire { .. } => "EXPIRE",
        }
    }

    /// Ключ (или pattern для KEYS): для логов.
    pub fn key(&self) -> &str {
        match self {
            CacheCommand::Keys { pattern } => pattern,
            CacheCommand::Get { key }
            | CacheCommand::Set { key, .. }
            | CacheCommand::LPush { key, .. }
            | CacheCommand::RPush { key, .. }
            | CacheCommand::LPop { key }
            | CacheCommand::RPop { key }
            | CacheCommand::SAdd { key, .. }
            | CacheCommand::SMembers { key }
            | CacheCommand::HSet { key, .. }
            | CacheCommand::HGet { key, .. }
            | CacheCommand::HDel { key, .. }
            | CacheCommand::Del { key }
            | CacheCommand::Exists { key }
            | CacheCommand::Expire { key, .. } => key,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Replies
// ═══════════════════════════════════════════════════════════════

/// Ответ соединения, без интерпретации.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheReply {
    Nil,
    Ok,
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl CacheReply {
    pub fn into_unit(self, command: &'static str) -> Result<(), CacheError> {
        match self {
            CacheReply::Ok | CacheReply::Integer(_) => Ok(()),
            other => Err(CacheError::unexpected(command, &other)),
        }
    }

    pub fn into_optional_text(self, command: &'static str) -> Result<Option<String>, CacheError> {
        match self {
            CacheReply::Nil => Ok(None),
            CacheReply::Text(s) => Ok(Some(s)),
            other => Err(CacheError::unexpected(command, &other)),
        }
    }

    pub fn into_integer(self, command: &'static str) -> Result<i64, CacheError> {
        match self {
            CacheReply::Integer(n) => Ok(n),
            other => Err(CacheError::unexpected(command, &other)),
        }
    }

    pub fn into_list(self, command: &'static str) -> Result<Vec<String>, CacheError> {
        match self {
            CacheReply::List(items) => Ok(items),
            CacheReply::Nil => Ok(Vec::new()),
            other => Err(CacheError::unexpected(command, &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_name_and_key() {
        let cmd = CacheCommand::HSet { key: "user:1".into(), field: "name".into(), value: "x".into() };
        assert_eq!(cmd.name(), "HSET");
        assert_eq!(cmd.key(), "user:1");

        let cmd = CacheCommand::Keys { pattern: "user:*".into() };
        assert_eq!(cmd.key(), "user:*");
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(CacheReply::Nil.into_optional_text("GET").unwrap(), None);
        assert_eq!(CacheReply::Integer(3).into_integer("LPUSH").unwrap(), 3);
        assert!(CacheReply::Nil.into_list("SMEMBERS").unwrap().is_empty());

        let err = CacheReply::Text("x".into()).into_integer("DEL").unwrap_err();
        assert!(matches!(err, CacheError::UnexpectedReply { command: "DEL", .. }));
    }

    #[test]
    fn test_database_index_display() {
        assert_eq!(DatabaseIndex(3).to_string(), "DB3");
        assert_eq!(DatabaseIndex::DEFAULT, DatabaseIndex::from(0));
    }
}
