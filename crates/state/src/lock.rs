//! Distributed locks over `SET NX EX`.
//!
//! Each acquisition writes a random fence token; release runs a
//! compare-and-delete script so a lock that expired and was re-acquired
//! by another replica is never deleted by the old holder.
//!
//! Used for the startup bootstrap (`startup_lock` + `startup_done`
//! completion flag) and the heartbeat scanner mutex
//! (`lock:task_heartbeat_check`).

use redis::Script;

use tm_domain::Result;

use crate::store::{redis_err, StateStore};

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct DistributedLock {
    store: StateStore,
}

/// A held lock. Not a guard: Redis cannot release on drop from sync
/// context, so callers release explicitly (the TTL is the backstop).
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub key: String,
    token: String,
}

impl DistributedLock {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Try to acquire `key` for `ttl_secs`. Returns None if another
    /// holder has it.
    pub async fn acquire(&self, key: &str, ttl_secs: u64) -> Result<Option<LockHandle>> {
        let token = uuid::Uuid::new_v4().to_string();
        let mut conn = self.store.conn().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        if acquired.is_some() {
            tracing::debug!(key, "lock acquired");
            Ok(Some(LockHandle {
                key: key.to_owned(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Release a held lock. A lock lost to TTL expiry is a no-op.
    pub async fn release(&self, handle: &LockHandle) -> Result<bool> {
        let mut conn = self.store.conn().await?;
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(&handle.key)
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if deleted == 0 {
            tracing::warn!(key = %handle.key, "lock was not held at release (expired?)");
        }
        Ok(deleted > 0)
    }
}
