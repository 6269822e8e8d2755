//! Worker heartbeat keys.
//!
//! Workers refresh `sandbox:heartbeat:{task_id}` with a unix timestamp on
//! a short TTL. Absence past the grace period means the worker is dead
//! (OOM-killed containers stop heartbeating without any callback).

use tm_domain::Result;

use crate::store::StateStore;

fn heartbeat_key(task_id: i64) -> String {
    format!("sandbox:heartbeat:{task_id}")
}

#[derive(Clone)]
pub struct HeartbeatStore {
    store: StateStore,
    ttl_secs: u64,
}

impl HeartbeatStore {
    pub fn new(store: StateStore, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    /// Refresh the heartbeat (called by the callback path on behalf of
    /// workers that report over HTTP).
    pub async fn update(&self, task_id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.store
            .set_string(&heartbeat_key(task_id), &now.to_string(), Some(self.ttl_secs))
            .await
    }

    /// True while the heartbeat key is alive.
    pub async fn is_alive(&self, task_id: i64) -> Result<bool> {
        self.store.exists(&heartbeat_key(task_id)).await
    }

    /// Last recorded timestamp; None once the key expired.
    pub async fn last_seen(&self, task_id: i64) -> Result<Option<i64>> {
        Ok(self
            .store
            .get_string(&heartbeat_key(task_id))
            .await?
            .and_then(|raw| raw.parse().ok()))
    }

    pub async fn delete(&self, task_id: i64) -> Result<()> {
        self.store.delete(&heartbeat_key(task_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(heartbeat_key(42), "sandbox:heartbeat:42");
    }
}
