//  src/db/redis.rs

use std::{sync::Arc, time::Instant};

use redis::{
    aio::ConnectionManager,
    streams::{StreamMaxlen, StreamReadOptions, StreamReadReply},
    AsyncCommands, Client, RedisError, ToRedisArgs,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;

/// Thin, cheap-to-clone handle over the Bus connection.
#[derive(Clone)]
pub struct RedisPool {
    manager: Arc<ConnectionManager>,
}

impl RedisPool {
    /// Build once at start-up and share across the spawned components.
    pub async fn new(url: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager: Arc::new(manager),
        })
    }

    pub(crate) fn manager(&self) -> Arc<ConnectionManager> {
        self.manager.clone()
    }

    fn conn(&self) -> ConnectionManager {
        self.manager().as_ref().clone()
    }

    // ─── Key/value helpers ──────────────────────────────────────────────
    pub async fn set_json<K, T>(&self, key: K, value: &T, ttl_secs: usize) -> Result<(), RedisError>
    where
        K: ToRedisArgs + Send + Sync,
        T: Serialize,
    {
        let mut con = self.conn();
        let payload = serde_json::to_string(value)
            .map_err(|e| RedisError::from((redis::ErrorKind::TypeError, "serde", e.to_string())))?;

        let started = Instant::now();
        if ttl_secs == 0 {
            redis::cmd("SET")
                .arg(key)
                .arg(payload)
                .query_async::<_, ()>(&mut con)
                .await?;
        } else {
            redis::cmd("SET")
                .arg(key)
                .arg(payload)
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<_, ()>(&mut con)
                .await?;
        }
        log::debug!("redis SET took {:?}", started.elapsed());
        Ok(())
    }

    pub async fn get_json<K, T>(&self, key: K) -> Result<Option<T>, RedisError>
    where
        K: ToRedisArgs + Send + Sync,
        T: DeserializeOwned,
    {
        let mut con = self.conn();
        let raw: Option<String> = con.get(key).await?;

        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s).map_err(|e| {
                RedisError::from((redis::ErrorKind::TypeError, "serde", e.to_string()))
            })?)),
            None => Ok(None),
        }
    }

    pub async fn set_string<K>(&self, key: K, value: &str, ttl_secs: usize) -> Result<(), RedisError>
    where
        K: ToRedisArgs + Send + Sync,
    {
        let mut con = self.conn();
        if ttl_secs == 0 {
            con.set(key, value).await
        } else {
            con.set_ex(key, value, ttl_secs as u64).await
        }
    }

    pub async fn get_string<K>(&self, key: K) -> Result<Option<String>, RedisError>
    where
        K: ToRedisArgs + Send + Sync,
    {
        let mut con = self.conn();
        con.get(key).await
    }

    pub async fn delete<K>(&self, key: K) -> Result<(), RedisError>
    where
        K: ToRedisArgs + Send + Sync,
    {
        let mut con = self.conn();
        con.del(key).await
    }

    /// Paginated MGET; the caller gets back raw JSON strings aligned
    /// with the requested keys (None for misses).
    pub async fn mget_raw(&self, keys: &[String]) -> Result<Vec<Option<String>>, RedisError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.conn();
        if keys.len() == 1 {
            // redis MGET with one key still works, but keep the reply shape uniform
            let v: Option<String> = con.get(&keys[0]).await?;
            return Ok(vec![v]);
        }
        con.mget(keys).await
    }

    /// SCAN + DEL every key matching `pattern`. Returns deleted count.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<usize, RedisError> {
        let mut con = self.conn();
        let keys: Vec<String> = {
            let mut iter = con.scan_match::<_, String>(pattern).await?;
            let mut keys = Vec::new();
            while let Some(k) = iter.next_item().await {
                keys.push(k);
            }
            keys
        };
        if keys.is_empty() {
            return Ok(0);
        }
        let mut con = self.conn();
        for chunk in keys.chunks(500) {
            con.del::<_, ()>(chunk.to_vec()).await?;
        }
        Ok(keys.len())
    }

    // ─── Hash helpers ───────────────────────────────────────────────────
    pub async fn hset_all<K>(
        &self,
        key: K,
        fields: &[(&str, String)],
        ttl_secs: usize,
    ) -> Result<(), RedisError>
    where
        K: ToRedisArgs + Send + Sync + Copy,
    {
        let mut con = self.conn();
        con.hset_multiple::<_, _, _, ()>(key, fields).await?;
        if ttl_secs > 0 {
            con.expire::<_, ()>(key, ttl_secs as i64).await?;
        }
        Ok(())
    }

    pub async fn hget_all<K>(&self, key: K) -> Result<HashMap<String, String>, RedisError>
    where
        K: ToRedisArgs + Send + Sync,
    {
        let mut con = self.conn();
        con.hgetall(key).await
    }

    // ─── Set helpers ────────────────────────────────────────────────────
    pub async fn replace_set(
        &self,
        key: &str,
        members: &[String],
        ttl_secs: usize,
    ) -> Result<(), RedisError> {
        let mut con = self.conn();
        con.del::<_, ()>(key).await?;
        if !members.is_empty() {
            con.sadd::<_, _, ()>(key, members).await?;
            if ttl_secs > 0 {
                con.expire::<_, ()>(key, ttl_secs as i64).await?;
            }
        }
        Ok(())
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, RedisError> {
        let mut con = self.conn();
        con.smembers(key).await
    }

    // ─── Stream helpers ─────────────────────────────────────────────────
    /// XADD with approximate MAXLEN trimming; a slow consumer loses the
    /// oldest entries, never blocks the writer.
    pub async fn xadd_maxlen(
        &self,
        stream: &str,
        maxlen: usize,
        fields: &[(&str, String)],
    ) -> Result<String, RedisError> {
        let mut con = self.conn();
        con.xadd_maxlen(stream, StreamMaxlen::Approx(maxlen), "*", fields)
            .await
    }

    /// XGROUP CREATE ... MKSTREAM, tolerating an already-existing group.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), RedisError> {
        let mut con = self.conn();
        match con
            .xgroup_create_mkstream::<_, _, _, ()>(stream, group, "$")
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Blocking XREADGROUP for one consumer.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<StreamReadReply, RedisError> {
        let mut con = self.conn();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        con.xread_options(&[stream], &[">"], &opts).await
    }

    pub async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), RedisError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut con = self.conn();
        con.xack(stream, group, ids).await
    }

    pub async fn stream_len(&self, stream: &str) -> Result<usize, RedisError> {
        let mut con = self.conn();
        con.xlen(stream).await
    }

    // ─── Pub/sub ────────────────────────────────────────────────────────
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), RedisError> {
        let mut con = self.conn();
        con.publish(channel, payload).await
    }

    /// Uniformly name-spaces keys:  `"atr:AAPL"`
    pub fn with_prefix(&self, prefix: &str, key: impl AsRef<str>) -> String {
        format!("{prefix}:{}", key.as_ref())
    }
}

/// Pull one string field out of a stream entry.
pub fn entry_field(id: &redis::streams::StreamId, key: &str) -> Option<String> {
    id.get::<String>(key)
}

/// Numeric stream field, tolerant of int/float encodings.
pub fn entry_f64(id: &redis::streams::StreamId, key: &str) -> Option<f64> {
    entry_field(id, key).and_then(|s| s.parse::<f64>().ok())
}
