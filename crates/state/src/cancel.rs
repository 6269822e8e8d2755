//! Stream cancellation: a Redis flag for cross-worker visibility plus a
//! local `CancellationToken` fast path for streams owned by this process.
//!
//! Contract (checked on the streaming hot path):
//! - `register_stream` clears any stale flag (retry reuses subtask ids)
//!   and returns the local token
//! - `cancel_stream` sets the Redis flag (TTL-bounded) and the token
//! - `is_cancelled` consults the token first, then Redis, back-filling
//!   the token so later checks stay local
//! - `unregister_stream` removes both

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use tm_domain::Result;

use crate::store::StateStore;

fn cancel_key(subtask_id: i64) -> String {
    format!("chat:cancel:{subtask_id}")
}

#[derive(Clone)]
pub struct CancelRegistry {
    store: StateStore,
    flag_ttl_secs: u64,
    local: Arc<Mutex<HashMap<i64, CancellationToken>>>,
}

impl CancelRegistry {
    pub fn new(store: StateStore, flag_ttl_secs: u64) -> Self {
        Self {
            store,
            flag_ttl_secs,
            local: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a new stream and get its cancellation token.
    pub async fn register_stream(&self, subtask_id: i64) -> Result<CancellationToken> {
        let token = CancellationToken::new();
        self.local.lock().insert(subtask_id, token.clone());

        if let Err(e) = self.store.delete(&cancel_key(subtask_id)).await {
            tracing::warn!(subtask_id, error = %e, "failed to clear stale cancel flag");
        }
        Ok(token)
    }

    /// Request cancellation. Returns false if the Redis write failed
    /// (the local token is still triggered).
    pub async fn cancel_stream(&self, subtask_id: i64) -> bool {
        if let Some(token) = self.local.lock().get(&subtask_id) {
            token.cancel();
        }

        match self
            .store
            .set_string(&cancel_key(subtask_id), "1", Some(self.flag_ttl_secs))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(subtask_id, error = %e, "failed to set cancel flag");
                false
            }
        }
    }

    pub async fn is_cancelled(&self, subtask_id: i64) -> bool {
        let token = self.local.lock().get(&subtask_id).cloned();
        if let Some(token) = &token {
            if token.is_cancelled() {
                return true;
            }
        }

        match self.store.exists(&cancel_key(subtask_id)).await {
            Ok(true) => {
                if let Some(token) = token {
                    token.cancel();
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(subtask_id, error = %e, "cancel flag check failed");
                false
            }
        }
    }

    pub async fn unregister_stream(&self, subtask_id: i64) {
        self.local.lock().remove(&subtask_id);
        if let Err(e) = self.store.delete(&cancel_key(subtask_id)).await {
            tracing::warn!(subtask_id, error = %e, "failed to delete cancel flag");
        }
    }

    /// Token for a stream owned by this process, if any.
    pub fn local_token(&self, subtask_id: i64) -> Option<CancellationToken> {
        self.local.lock().get(&subtask_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(cancel_key(7), "chat:cancel:7");
    }

    #[test]
    fn token_clone_shares_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
