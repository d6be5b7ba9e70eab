//! src/services/redis_kv.rs
//!
//! Redis-backed [`KvStore`]. Operations that must be atomic (write + expiry,
//! increment + conditional expiry, pattern sweeps) run as Lua scripts so no
//! partial state is ever visible to concurrent requests.

use super::kv::{KvResult, KvStore, Ttl};
use async_trait::async_trait;
use bytes::Bytes;
use fred::prelude::*;
use std::{collections::HashMap, time::Duration};

const HASH_SET_LUA: &str = r#"
local ttl = tonumber(ARGV[1])
for i = 2, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
if ttl > 0 then
    redis.call('EXPIRE', KEYS[1], ttl)
end
return 1
"#;

const INCR_WINDOW_LUA: &str = r#"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('TTL', KEYS[1]) < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return value
"#;

const KEYS_LUA: &str = "return redis.call('KEYS', ARGV[1])";

const DELETE_PERSISTENT_LUA: &str = r#"
local removed = 0
for _, key in ipairs(redis.call('KEYS', ARGV[1])) do
    if redis.call('TTL', key) == -1 then
        redis.call('DEL', key)
        removed = removed + 1
    end
end
return removed
"#;

pub struct RedisKv {
    client: RedisClient,
}

impl RedisKv {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`) and wait for the
    /// first connection to be established.
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = RedisClient::new(RedisConfig::from_url(url)?, None, None, None);
        client.connect();
        client.wait_for_connect().await?;
        Ok(Self { client })
    }
}

/// Redis expiries are whole seconds; anything shorter still expires.
fn whole_seconds(duration: Duration) -> i64 {
    duration.as_secs().max(1) as i64
}

/// `ARGV` for [`HASH_SET_LUA`]: the TTL (0 for none), then field/value pairs.
fn hash_set_args(fields: Vec<(String, Bytes)>, ttl: Option<Duration>) -> Vec<RedisValue> {
    let mut args = Vec::with_capacity(1 + fields.len() * 2);
    args.push(RedisValue::Integer(ttl.map(whole_seconds).unwrap_or(0)));
    for (field, value) in fields {
        args.push(RedisValue::from(field));
        args.push(RedisValue::Bytes(value));
    }
    args
}

#[async_trait]
impl KvStore for RedisKv {
    async fn ping(&self) -> KvResult<()> {
        let _: i64 = self
            .client
            .eval("return 1", Vec::<String>::new(), Vec::<String>::new())
            .await?;
        Ok(())
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> KvResult<()> {
        let _: i64 = self
            .client
            .eval(HASH_SET_LUA, vec![key.to_string()], hash_set_args(fields, ttl))
            .await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> KvResult<Option<Bytes>> {
        let value: Option<Vec<u8>> = self.client.hget(key, field).await?;
        Ok(value.map(Bytes::from))
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, Bytes>> {
        let values: HashMap<String, Vec<u8>> = self.client.hgetall(key).await?;
        Ok(values
            .into_iter()
            .map(|(field, value)| (field, Bytes::from(value)))
            .collect())
    }

    async fn hash_len(&self, key: &str) -> KvResult<u64> {
        Ok(self.client.hlen(key).await?)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> KvResult<()> {
        let _: i64 = self.client.hdel(key, field).await?;
        Ok(())
    }

    async fn counter(&self, key: &str) -> KvResult<i64> {
        let value: Option<i64> = self.client.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn incr_within_window(&self, key: &str, by: i64, window: Duration) -> KvResult<i64> {
        let args = vec![by.to_string(), whole_seconds(window).to_string()];
        Ok(self
            .client
            .eval(INCR_WINDOW_LUA, vec![key.to_string()], args)
            .await?)
    }

    async fn ttl(&self, key: &str) -> KvResult<Ttl> {
        let seconds: i64 = self.client.ttl(key).await?;
        Ok(match seconds {
            -2 => Ttl::Missing,
            -1 => Ttl::Persistent,
            secs => Ttl::Expires(Duration::from_secs(secs.max(0) as u64)),
        })
    }

    async fn delete(&self, keys: &[String]) -> KvResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let _: i64 = self.client.del(keys.to_vec()).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        Ok(self
            .client
            .eval(KEYS_LUA, Vec::<String>::new(), vec![pattern.to_string()])
            .await?)
    }

    async fn delete_persistent(&self, pattern: &str) -> KvResult<u64> {
        Ok(self
            .client
            .eval(
                DELETE_PERSISTENT_LUA,
                Vec::<String>::new(),
                vec![pattern.to_string()],
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttls_round_to_at_least_one_second() {
        assert_eq!(whole_seconds(Duration::from_millis(10)), 1);
        assert_eq!(whole_seconds(Duration::from_millis(3_900)), 3);
        assert_eq!(whole_seconds(Duration::from_secs(3_600)), 3_600);
    }

    #[test]
    fn hash_set_args_lead_with_the_ttl() {
        let args = hash_set_args(
            vec![
                ("chunk:0".into(), Bytes::from_static(b"a")),
                ("chunk:1".into(), Bytes::from_static(b"b")),
            ],
            Some(Duration::from_secs(90)),
        );
        assert_eq!(
            args,
            vec![
                RedisValue::Integer(90),
                RedisValue::from("chunk:0"),
                RedisValue::Bytes(Bytes::from_static(b"a")),
                RedisValue::from("chunk:1"),
                RedisValue::Bytes(Bytes::from_static(b"b")),
            ]
        );

        let persistent = hash_set_args(vec![("k".into(), Bytes::new())], None);
        assert_eq!(persistent[0], RedisValue::Integer(0));
    }

    /// Runs the Lua paths against a real server:
    /// `TRANSFER_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`
    #[tokio::test]
    #[ignore = "needs a Redis server"]
    async fn lua_scripts_against_redis() {
        let Ok(url) = std::env::var("TRANSFER_TEST_REDIS_URL") else {
            return;
        };
        let kv = RedisKv::connect(&url).await.unwrap();
        let prefix = format!("kv-test:{}", uuid::Uuid::new_v4().simple());
        let hash = format!("{prefix}:hash");
        let counter = format!("{prefix}:counter");
        let persistent = format!("{prefix}:persistent");

        kv.ping().await.unwrap();
        kv.hash_set(
            &hash,
            vec![("f".into(), Bytes::from_static(b"v"))],
            Some(Duration::from_secs(60)),
        )
        .await
        .unwrap();
        assert_eq!(
            kv.hash_get(&hash, "f").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
        assert!(matches!(kv.ttl(&hash).await.unwrap(), Ttl::Expires(_)));

        assert_eq!(
            kv.incr_within_window(&counter, 5, Duration::from_secs(60))
                .await
                .unwrap(),
            5
        );
        assert_eq!(
            kv.incr_within_window(&counter, 7, Duration::from_secs(600))
                .await
                .unwrap(),
            12
        );
        match kv.ttl(&counter).await.unwrap() {
            Ttl::Expires(left) => assert!(left <= Duration::from_secs(60)),
            other => panic!("counter lost its window: {other:?}"),
        }

        kv.hash_set(&persistent, vec![("f".into(), Bytes::new())], None)
            .await
            .unwrap();
        assert_eq!(kv.delete_persistent(&format!("{prefix}:*")).await.unwrap(), 1);
        assert_eq!(kv.ttl(&persistent).await.unwrap(), Ttl::Missing);

        kv.delete(&[hash, counter]).await.unwrap();
    }
}
