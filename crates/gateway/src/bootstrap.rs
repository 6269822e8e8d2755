//! Startup bootstrap under a distributed lock.
//!
//! Multi-replica deployments must run one-time startup work (schema
//! migrations, seed data — performed by external tooling invoked here)
//! exactly once. The winner takes `startup_lock`, runs the work, and
//! records `startup_done`; losers wait for the flag and move on.

use std::future::Future;
use std::time::Duration;

use tm_domain::{Error, Result};
use tm_state::DistributedLock;
use tm_state::StateStore;

const STARTUP_LOCK_KEY: &str = "startup_lock";
const STARTUP_DONE_KEY: &str = "startup_done";
/// Long enough for the slowest bootstrap step.
const STARTUP_LOCK_TTL_SECS: u64 = 300;
/// Completion flag outlives any rolling deploy window.
const STARTUP_DONE_TTL_SECS: u64 = 86_400;

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const WAIT_MAX_POLLS: u32 = 150;

pub async fn run_bootstrap<F, Fut>(store: &StateStore, locks: &DistributedLock, work: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if store.exists(STARTUP_DONE_KEY).await? {
        tracing::info!("startup bootstrap already completed, skipping");
        return Ok(());
    }

    match locks.acquire(STARTUP_LOCK_KEY, STARTUP_LOCK_TTL_SECS).await? {
        Some(handle) => {
            tracing::info!("running startup bootstrap");
            let outcome = work().await;
            if outcome.is_ok() {
                store
                    .set_string(STARTUP_DONE_KEY, "1", Some(STARTUP_DONE_TTL_SECS))
                    .await?;
                tracing::info!("startup bootstrap completed");
            }
            let _ = locks.release(&handle).await;
            outcome
        }
        None => {
            // Another replica is bootstrapping; wait for its flag.
            tracing::info!("startup bootstrap running elsewhere, waiting");
            for _ in 0..WAIT_MAX_POLLS {
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
                if store.exists(STARTUP_DONE_KEY).await? {
                    return Ok(());
                }
            }
            Err(Error::Timeout(
                "startup bootstrap did not complete on any replica".into(),
            ))
        }
    }
}
