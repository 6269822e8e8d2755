//! Shared application state.
//!
//! Everything the original kept as module-level singletons — ws
//! emitter, dispatcher, router, session manager, cancel registry,
//! running-task tracker — is a field here, built once at startup and
//! passed through this handle. Background tasks reach sockets only via
//! `ws`.

use std::sync::Arc;

use tm_domain::config::Config;
use tm_domain::Result;
use tm_state::{
    CancelRegistry, DistributedLock, HeartbeatStore, QueueType, RunningTaskTracker, SessionCache,
    StateStore, TaskQueue,
};

use crate::auth::TokenMinter;
use crate::data::DataService;
use crate::execution::{Dispatcher, StreamServices, TaskRequestBuilder};
use crate::ws::rooms::{RoomRegistry, WsEmitter};

#[derive(Clone)]
pub struct AppState {
    // ── Configuration ─────────────────────────────────────────────────
    pub config: Arc<Config>,

    // ── Redis-backed state ────────────────────────────────────────────
    pub store: StateStore,
    pub sessions: SessionCache,
    pub cancels: CancelRegistry,
    pub tracker: RunningTaskTracker,
    pub heartbeats: HeartbeatStore,
    pub locks: DistributedLock,
    pub online_queue: TaskQueue,
    pub offline_queue: TaskQueue,

    // ── Resource store ────────────────────────────────────────────────
    pub data: Arc<dyn DataService>,

    // ── Sockets ───────────────────────────────────────────────────────
    pub rooms: Arc<RoomRegistry>,
    pub ws: Arc<WsEmitter>,

    // ── Execution pipeline ────────────────────────────────────────────
    pub dispatcher: Arc<Dispatcher>,
    pub builder: Arc<TaskRequestBuilder>,
    pub minter: Arc<TokenMinter>,
}

impl AppState {
    /// Construct the full component graph in dependency order.
    pub fn build(config: Arc<Config>, data: Arc<dyn DataService>) -> Result<Self> {
        let store = StateStore::new(&config.redis.url)?;
        let sessions = SessionCache::new(store.clone(), config.cache.clone());
        let cancels = CancelRegistry::new(store.clone(), config.cache.cancel_ttl_secs);
        let tracker = RunningTaskTracker::new(store.clone());
        let heartbeats = HeartbeatStore::new(store.clone(), config.heartbeat.ttl_secs);
        let locks = DistributedLock::new(store.clone());
        let online_queue = TaskQueue::new(
            store.clone(),
            QueueType::Online,
            &config.queue.service_pool,
            config.queue.max_retries,
        );
        let offline_queue = TaskQueue::new(
            store.clone(),
            QueueType::Offline,
            &config.queue.service_pool,
            config.queue.max_retries,
        );

        let rooms = Arc::new(RoomRegistry::new());
        let ws = Arc::new(WsEmitter::new(rooms.clone()));

        let services = StreamServices {
            sessions: sessions.clone(),
            cancels: cancels.clone(),
            tracker: tracker.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            &config.executors,
            data.clone(),
            ws.clone(),
            services,
        )?);

        let minter = Arc::new(TokenMinter::new(
            &config.auth.jwt_secret,
            config.auth.user_token_ttl_hours,
        ));
        let builder = Arc::new(TaskRequestBuilder::new(
            data.clone(),
            minter.clone(),
            &config.auth,
            &config.executors.task_api_domain,
        )?);

        Ok(Self {
            config,
            store,
            sessions,
            cancels,
            tracker,
            heartbeats,
            locks,
            online_queue,
            offline_queue,
            data,
            rooms,
            ws,
            dispatcher,
            builder,
            minter,
        })
    }

    pub fn stream_services(&self) -> StreamServices {
        StreamServices {
            sessions: self.sessions.clone(),
            cancels: self.cancels.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::data::MemoryDataService;

    /// State over an in-memory data service and an unreachable Redis;
    /// suitable for handler tests that stay off the cache paths (cache
    /// writes fail and are tolerated by contract).
    pub fn test_state() -> (AppState, Arc<MemoryDataService>) {
        let mut config = Config::default();
        config.auth.jwt_secret = "test-secret".into();
        config.redis.url = "redis://127.0.0.1:1/".into();
        let data = Arc::new(MemoryDataService::new());
        let state =
            AppState::build(Arc::new(config), data.clone()).expect("test state");
        (state, data)
    }
}
