use std::future::Future;
use std::pin::Pin;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, IntoConnectionInfo, RedisError};

use ingest_api::ServiceError;

use crate::{CacheCommand, CacheConnection, CacheConnector, CacheReply, DatabaseIndex};

fn map_err(err: RedisError) -> ServiceError {
    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
        ServiceError::io(err.to_string())
    } else {
        ServiceError::new(err.to_string())
    }
}

/// Redis: одно multiplexed соединение на логическую базу.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

impl CacheConnector for RedisConnector {
    fn connect<'a>(
        &'a self,
        uri: &'a str,
        db: DatabaseIndex,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn CacheConnection>, ServiceError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut info = uri
                .into_connection_info()
                .map_err(|e| ServiceError::config(format!("invalid cache uri: {e}")))?;
            info.redis.db = i64::from(db.get());

            let client = redis::Client::open(info).map_err(map_err)?;
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| ServiceError::connection(e.to_string()))?;
            Ok(Box::new(RedisConnection { conn }) as Box<dyn CacheConnection>)
        })
    }
}

struct RedisConnection {
    conn: MultiplexedConnection,
}

impl CacheConnection for RedisConnection {
    fn execute<'a>(
        &'a self,
        command: &'a CacheCommand,
    ) -> Pin<Box<dyn Future<Output = Result<CacheReply, ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            // MultiplexedConnection дешёво клонируется; команды требуют &mut.
            let mut conn = self.conn.clone();
            let reply = match command {
                CacheCommand::Get { key } => {
                    let value: Option<String> = conn.get(key).await.map_err(map_err)?;
                    value.map_or(CacheReply::Nil, CacheReply::Text)
                }
                CacheCommand::Set { key, value } => {
                    let _: () = conn.set(key, value).await.map_err(map_err)?;
                    CacheReply::Ok
                }
                CacheCommand::LPush { key, value } => {
                    let len: i64 = conn.lpush(key, value).await.map_err(map_err)?;
                    CacheReply::Integer(len)
                }
                CacheCommand::RPush { key, value } => {
                    let len: i64 = conn.rpush(key, value).await.map_err(map_err)?;
                    CacheReply::Integer(len)
                }
                CacheCommand::LPop { key } => {
                    let value: Option<String> = conn.lpop(key, None).await.map_err(map_err)?;
                    value.map_or(CacheReply::Nil, CacheReply::Text)
                }
                CacheCommand::RPop { key } => {
                    let value: Option<String> = conn.rpop(key, None).await.map_err(map_err)?;
                    value.map_or(CacheReply::Nil, CacheReply::Text)
                }
                CacheCommand::SAdd { key, member } => {
                    let added: i64 = conn.sadd(key, member).await.map_err(map_err)?;
                    CacheReply::Integer(added)
                }
                CacheCommand::SMembers { key } => {
                    let members: Vec<String> = conn.smembers(key).await.map_err(map_err)?;
                    CacheReply::List(members)
                }
                CacheCommand::HSet { key, field, value } => {
                    let added: i64 = conn.hset(key, field, value).await.map_err(map_err)?;
                    CacheReply::Integer(added)
                }
                CacheCommand::HGet { key, field } => {
                    let value: Option<String> = conn.hget(key, field).await.map_err(map_err)?;
                    value.map_or(CacheReply::Nil, CacheReply::Text)
                }
                CacheCommand::HDel { key, field } => {
                    let removed: i64 = conn.hdel(key, field).await.map_err(map_err)?;
                    CacheReply::Integer(removed)
                }
                CacheCommand::Keys { pattern } => {
                    let keys: Vec<String> = conn.keys(pattern).await.map_err(map_err)?;
                    CacheReply::List(keys)
                }
                CacheCommand::Del { key } => {
                    let removed: i64 = conn.del(key).await.map_err(map_err)?;
                    CacheReply::Integer(removed)
                }
                CacheCommand::Exists { key } => {
                    let count: i64 = conn.exists(key).await.map_err(map_err)?;
                    CacheReply::Integer(count)
                }
                CacheCommand::Expire { key, seconds } => {
                    let applied: i64 = conn.expire(key, *seconds).await.map_err(map_err)?;
                    CacheReply::Integer(applied)
                }
            };
            Ok(reply)
        })
    }

    fn quit(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = redis::cmd("QUIT").query_async(&mut conn).await.map_err(map_err)?;
            Ok(())
        })
    }
}
