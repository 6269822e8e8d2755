//! Running-task registry for heartbeat-based crash detection.
//!
//! Every task handed to a container worker is recorded in a sorted set
//! (score = start time) plus a per-task metadata hash. The heartbeat
//! scanner walks this registry; the callback path removes entries when
//! a terminal event arrives.

use std::collections::HashMap;

use redis::AsyncCommands;

use tm_domain::Result;

use crate::store::{redis_err, StateStore};

const RUNNING_TASKS_ZSET: &str = "running_tasks:heartbeat";

/// Metadata TTL; generous because offline tasks can run for hours.
const META_TTL_SECS: i64 = 86_400;

fn meta_key(task_id: i64) -> String {
    format!("running_task:meta:{task_id}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunningTaskMeta {
    pub task_id: i64,
    pub subtask_id: i64,
    pub executor_name: String,
    pub task_type: String,
    pub start_time: f64,
}

impl RunningTaskMeta {
    fn from_hash(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            task_id: fields.get("task_id")?.parse().ok()?,
            subtask_id: fields.get("subtask_id")?.parse().ok()?,
            executor_name: fields.get("executor_name").cloned().unwrap_or_default(),
            task_type: fields
                .get("task_type")
                .cloned()
                .unwrap_or_else(|| "online".into()),
            start_time: fields
                .get("start_time")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
        })
    }
}

#[derive(Clone)]
pub struct RunningTaskTracker {
    store: StateStore,
}

impl RunningTaskTracker {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub async fn add(
        &self,
        task_id: i64,
        subtask_id: i64,
        executor_name: &str,
        task_type: &str,
    ) -> Result<()> {
        let start_time = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let mut conn = self.store.conn().await?;

        conn.zadd::<_, _, _, ()>(RUNNING_TASKS_ZSET, task_id.to_string(), start_time)
            .await
            .map_err(redis_err)?;

        let key = meta_key(task_id);
        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("task_id", task_id.to_string()),
                ("subtask_id", subtask_id.to_string()),
                ("executor_name", executor_name.to_owned()),
                ("task_type", task_type.to_owned()),
                ("start_time", start_time.to_string()),
            ],
        )
        .await
        .map_err(redis_err)?;
        conn.expire::<_, ()>(&key, META_TTL_SECS)
            .await
            .map_err(redis_err)?;

        tracing::info!(task_id, subtask_id, executor_name, "running task registered");
        Ok(())
    }

    /// Remove a task from the registry (terminal callback, cancel, or
    /// heartbeat-declared death).
    pub async fn remove(&self, task_id: i64) -> Result<()> {
        let mut conn = self.store.conn().await?;
        conn.zrem::<_, _, ()>(RUNNING_TASKS_ZSET, task_id.to_string())
            .await
            .map_err(redis_err)?;
        conn.del::<_, ()>(meta_key(task_id)).await.map_err(redis_err)?;
        tracing::debug!(task_id, "running task removed");
        Ok(())
    }

    pub async fn running_ids(&self) -> Result<Vec<i64>> {
        let mut conn = self.store.conn().await?;
        let ids: Vec<String> = conn
            .zrange(RUNNING_TASKS_ZSET, 0, -1)
            .await
            .map_err(redis_err)?;
        Ok(ids.into_iter().filter_map(|s| s.parse().ok()).collect())
    }

    pub async fn meta(&self, task_id: i64) -> Result<Option<RunningTaskMeta>> {
        let mut conn = self.store.conn().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(meta_key(task_id))
            .await
            .map_err(redis_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(RunningTaskMeta::from_hash(&fields))
    }

    pub async fn all_with_meta(&self) -> Result<Vec<RunningTaskMeta>> {
        let mut out = Vec::new();
        for task_id in self.running_ids().await? {
            if let Some(meta) = self.meta(task_id).await? {
                out.push(meta);
            }
        }
        Ok(out)
    }

    /// Tasks whose start time is at or before `cutoff_unix` (stuck-task
    /// inspection).
    pub async fn started_before(&self, cutoff_unix: f64) -> Result<Vec<RunningTaskMeta>> {
        let mut conn = self.store.conn().await?;
        let ids: Vec<String> = conn
            .zrangebyscore(RUNNING_TASKS_ZSET, "-inf", cutoff_unix)
            .await
            .map_err(redis_err)?;
        let mut out = Vec::new();
        for id in ids {
            if let Ok(task_id) = id.parse() {
                if let Some(meta) = self.meta(task_id).await? {
                    out.push(meta);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(meta_key(42), "running_task:meta:42");
    }

    #[test]
    fn meta_from_hash() {
        let mut fields = HashMap::new();
        fields.insert("task_id".to_string(), "42".to_string());
        fields.insert("subtask_id".to_string(), "7".to_string());
        fields.insert("executor_name".to_string(), "task-alice-42-7".to_string());
        fields.insert("task_type".to_string(), "offline".to_string());
        fields.insert("start_time".to_string(), "1700000000.5".to_string());

        let meta = RunningTaskMeta::from_hash(&fields).unwrap();
        assert_eq!(meta.task_id, 42);
        assert_eq!(meta.subtask_id, 7);
        assert_eq!(meta.executor_name, "task-alice-42-7");
        assert_eq!(meta.task_type, "offline");
        assert!((meta.start_time - 1_700_000_000.5).abs() < f64::EPSILON);
    }

    #[test]
    fn meta_from_hash_defaults() {
        let mut fields = HashMap::new();
        fields.insert("task_id".to_string(), "1".to_string());
        fields.insert("subtask_id".to_string(), "2".to_string());

        let meta = RunningTaskMeta::from_hash(&fields).unwrap();
        assert_eq!(meta.task_type, "online");
        assert_eq!(meta.executor_name, "");
        assert_eq!(meta.start_time, 0.0);
    }

    #[test]
    fn meta_from_hash_requires_ids() {
        let mut fields = HashMap::new();
        fields.insert("task_id".to_string(), "not-a-number".to_string());
        fields.insert("subtask_id".to_string(), "2".to_string());
        assert!(RunningTaskMeta::from_hash(&fields).is_none());
    }
}
