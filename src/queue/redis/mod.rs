//! Redis queue implementation for anvilq.
//!
//! Partitions are spread over one or more Redis nodes (`partition % nodes`)
//! and every node holds, under the configured key prefix:
//!
//! - `{prefix}:q:{WORKER_TYPE}:{partition}:{PRIORITY}`: list of task ids
//! - `{prefix}:tasks`: hash of task id to task JSON
//! - `{prefix}:delayed`: sorted set of retries scored by due time (ms)
//! - `{prefix}:inflight`: sorted set of popped tasks scored by visibility deadline (ms)
//! - `{prefix}:dlq`: hash of task id to dead letter JSON
//! - `{prefix}:corrupt`: task records that failed to decode, set aside on pop
//! - `{prefix}:lock:{name}`: lock keys, placed on a node by name hash
//!
//! Sorted set members are `{list key}|{task id}` so promotion knows which
//! list to append to. Scripts only move ids; task JSON is never rewritten
//! server-side, so a promoted retry keeps its `RETRYING` record until a
//! worker picks it up.

use super::{
    QueueBackend, QueueConfig, QueueKey, RetentionReport, expired_dead_letters, expired_tasks,
};
use crate::config::{RedisConfig, RetentionPolicy};
use crate::core::router::{node_for_key, node_for_partition};
use crate::error::{AnvilError, AnvilResult};
use crate::task::{
    DeadLetterEntry, DeadLetterFilter, PartitionId, Task, TaskFilter, TaskId, TaskPriority,
    WorkerType,
};
use crate::utils::unix_millis;
use async_trait::async_trait;
use redis::{AsyncCommands, Client, RedisError, RedisResult, Script, aio::ConnectionManager};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Due entries moved per promotion call
const PROMOTE_BATCH: usize = 100;

/// Stale ids a single pop may skip before reporting an empty lane
const MAX_STALE_SKIPS: usize = 16;

/// Redis queue backend implementation
pub struct RedisQueue {
    /// One connection manager per node, in configuration order
    nodes: Vec<ConnectionManager>,
    config: RedisConfig,
    queue_config: QueueConfig,
    scripts: RedisScripts,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("nodes", &self.config.nodes)
            .field("key_prefix", &self.config.key_prefix)
            .field("queue_config", &self.queue_config)
            .finish_non_exhaustive()
    }
}

/// Lua scripts for the multi-key steps that must be atomic
struct RedisScripts {
    /// Append due retries and expired in-flight tasks to their lists
    promote: Script,
    /// Pop the first non-empty list and mark the id in flight
    pop: Script,
    /// Compare-and-delete on a lock key
    unlock: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            promote: Script::new(
                r#"
                local now = ARGV[1]
                local limit = tonumber(ARGV[2])
                local moved = {0, 0}

                for i = 1, 2 do
                    local due = redis.call('ZRANGEBYSCORE', KEYS[i], '-inf', now, 'LIMIT', 0, limit)
                    for _, member in ipairs(due) do
                        redis.call('ZREM', KEYS[i], member)
                        local list_key, task_id = string.match(member, '^(.*)|([^|]*)$')
                        if list_key then
                            redis.call('RPUSH', list_key, task_id)
                            moved[i] = moved[i] + 1
                        end
                    end
                end

                return moved
            "#,
            ),
            pop: Script::new(
                r#"
                local inflight_key = KEYS[1]
                local tasks_key = KEYS[2]
                local visible_at = ARGV[1]

                for i = 3, #KEYS do
                    local task_id = redis.call('LPOP', KEYS[i])
                    if task_id then
                        redis.call('ZADD', inflight_key, visible_at, KEYS[i] .. '|' .. task_id)
                        return {KEYS[i], task_id, redis.call('HGET', tasks_key, task_id)}
                    end
                end

                return false
            "#,
            ),
            unlock: Script::new(
                r#"
                if redis.call('GET', KEYS[1]) == ARGV[1] then
                    return redis.call('DEL', KEYS[1])
                end
                return 0
            "#,
            ),
        }
    }
}

/// Connection-level failures mean the store is unreachable; the rest are
/// ordinary queue errors.
fn store_error(message: impl Into<String>, err: RedisError) -> AnvilError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        AnvilError::exhausted(message, err)
    } else {
        AnvilError::queue(message, err)
    }
}

/// Decode stored JSON values, skipping corrupt entries.
fn decode_all<T: DeserializeOwned>(values: Vec<String>, what: &str) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|raw| match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Skipping unreadable {} record: {}", what, e);
                None
            }
        })
        .collect()
}

impl RedisQueue {
    /// Connect to every configured node.
    ///
    /// A node that cannot be reached within `connect_timeout_secs` yields
    /// [`AnvilError::ResourceExhausted`].
    pub async fn connect(config: RedisConfig, queue_config: QueueConfig) -> AnvilResult<Self> {
        if config.nodes.is_empty() {
            return Err(AnvilError::config("Redis queue requires at least one node"));
        }

        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let mut nodes = Vec::with_capacity(config.nodes.len());
        for url in &config.nodes {
            let client = Client::open(url.as_str()).map_err(|e| {
                AnvilError::config(format!("Invalid Redis node URL '{}': {}", url, e))
            })?;

            let conn = timeout(connect_timeout, client.get_connection_manager())
                .await
                .map_err(|e| {
                    AnvilError::exhausted(format!("Timed out connecting to Redis node {}", url), e)
                })?
                .map_err(|e| store_error(format!("Failed to connect to Redis node {}", url), e))?;
            nodes.push(conn);
        }

        info!(
            "🔨 Connected to {} Redis node(s) with prefix '{}'",
            nodes.len(),
            config.key_prefix
        );

        Ok(Self {
            nodes,
            config,
            queue_config,
            scripts: RedisScripts::new(),
        })
    }

    fn node(&self, index: usize) -> ConnectionManager {
        self.nodes[index].clone()
    }

    fn node_of(&self, partition: PartitionId) -> usize {
        node_for_partition(partition, self.nodes.len())
    }

    fn list_key(&self, key: QueueKey) -> String {
        format!("{}:q:{}", self.config.key_prefix, key)
    }

    fn tasks_key(&self) -> String {
        format!("{}:tasks", self.config.key_prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.config.key_prefix)
    }

    fn inflight_key(&self) -> String {
        format!("{}:inflight", self.config.key_prefix)
    }

    fn dlq_key(&self) -> String {
        format!("{}:dlq", self.config.key_prefix)
    }

    fn corrupt_key(&self) -> String {
        format!("{}:corrupt", self.config.key_prefix)
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:lock:{}", self.config.key_prefix, name)
    }

    fn member(&self, task: &Task) -> String {
        format!("{}|{}", self.list_key(QueueKey::of(task)), task.id)
    }

    /// Run one Redis call under the operation timeout.
    async fn call<T, F>(&self, op: &str, fut: F) -> AnvilResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let op_timeout = Duration::from_millis(self.queue_config.operation_timeout_ms);
        match timeout(op_timeout, fut).await {
            Ok(result) => result.map_err(|e| store_error(format!("Redis {} failed", op), e)),
            Err(elapsed) => Err(AnvilError::exhausted(
                format!("Redis {} timed out", op),
                elapsed,
            )),
        }
    }

    /// Values of `key` on every node, tagged with the node index.
    async fn hvals_all(&self, key: &str, op: &str) -> AnvilResult<Vec<(usize, String)>> {
        let mut values = Vec::new();
        for index in 0..self.nodes.len() {
            let mut conn = self.node(index);
            let node_values: Vec<String> = self.call(op, conn.hvals(key)).await?;
            values.extend(node_values.into_iter().map(|v| (index, v)));
        }
        Ok(values)
    }

    /// First node holding `field` in hash `key`.
    async fn hget_any(&self, key: &str, field: &str, op: &str) -> AnvilResult<Option<String>> {
        for index in 0..self.nodes.len() {
            let mut conn = self.node(index);
            let value: Option<String> = self.call(op, conn.hget(key, field)).await?;
            if value.is_some() {
                return Ok(value);
            }
        }
        Ok(None)
    }

    async fn promote(&self, node: usize) -> AnvilResult<()> {
        let mut conn = self.node(node);
        let now = unix_millis(SystemTime::now());
        let (promoted, redelivered): (usize, usize) = self
            .call(
                "promote",
                self.scripts
                    .promote
                    .key(self.delayed_key())
                    .key(self.inflight_key())
                    .arg(now)
                    .arg(PROMOTE_BATCH)
                    .invoke_async(&mut conn),
            )
            .await?;

        if promoted > 0 {
            debug!("Promoted {} delayed task(s) on node {}", promoted, node);
        }
        if redelivered > 0 {
            warn!(
                "{} task(s) exceeded the visibility timeout on node {}, redelivering",
                redelivered, node
            );
        }
        Ok(())
    }

    /// Node whose best non-empty queue comes first in scan order.
    async fn pick_node(&self, by_node: &[Vec<(usize, QueueKey)>]) -> AnvilResult<Option<usize>> {
        let candidates: Vec<usize> = (0..by_node.len())
            .filter(|i| !by_node[*i].is_empty())
            .collect();
        if candidates.len() <= 1 {
            return Ok(candidates.first().copied());
        }

        let mut best: Option<(usize, usize)> = None;
        for node in candidates {
            let keys = &by_node[node];
            let mut pipe = redis::pipe();
            for (_, key) in keys {
                pipe.llen(self.list_key(*key));
            }
            let mut conn = self.node(node);
            let lens: Vec<usize> = self.call("peek", pipe.query_async(&mut conn)).await?;

            let first = keys.iter().zip(lens).find(|(_, len)| *len > 0);
            if let Some(((rank, _), _)) = first {
                if best.is_none_or(|(best_rank, _)| *rank < best_rank) {
                    best = Some((*rank, node));
                }
            }
        }
        Ok(best.map(|(_, node)| node))
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    fn kind(&self) -> &'static str {
        "redis"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_config.poll_interval_ms.max(1))
    }

    async fn push(&self, task: &Task) -> AnvilResult<()> {
        let data = serde_json::to_string(task)?;
        let mut conn = self.node(self.node_of(task.partition));

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.tasks_key(), &task.id, data)
            .ignore()
            .rpush(self.list_key(QueueKey::of(task)), &task.id)
            .ignore();
        self.call("push", pipe.query_async::<()>(&mut conn)).await?;

        debug!("Enqueued task {} on {}", task.id, QueueKey::of(task));
        Ok(())
    }

    async fn push_delayed(&self, task: &Task, ready_at: SystemTime) -> AnvilResult<()> {
        let data = serde_json::to_string(task)?;
        let mut conn = self.node(self.node_of(task.partition));

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.tasks_key(), &task.id, data)
            .ignore()
            .zadd(self.delayed_key(), self.member(task), unix_millis(ready_at))
            .ignore();
        self.call("push_delayed", pipe.query_async::<()>(&mut conn))
            .await?;

        debug!("Delayed task {} on {}", task.id, QueueKey::of(task));
        Ok(())
    }

    async fn try_pop(
        &self,
        worker_type: WorkerType,
        partitions: &[PartitionId],
    ) -> AnvilResult<Option<Task>> {
        // Keys per node, each tagged with its global scan rank
        let mut by_node: Vec<Vec<(usize, QueueKey)>> = vec![Vec::new(); self.nodes.len()];
        for (rank, key) in QueueKey::scan_order(worker_type, partitions).enumerate() {
            by_node[self.node_of(key.partition)].push((rank, key));
        }

        for node in 0..by_node.len() {
            if !by_node[node].is_empty() {
                self.promote(node).await?;
            }
        }

        let Some(node) = self.pick_node(&by_node).await? else {
            return Ok(None);
        };

        let visibility = Duration::from_secs(self.queue_config.visibility_timeout_secs);
        let visible_at = unix_millis(SystemTime::now() + visibility);
        let mut conn = self.node(node);

        for _ in 0..MAX_STALE_SKIPS {
            let mut invocation = self.scripts.pop.prepare_invoke();
            invocation.key(self.inflight_key()).key(self.tasks_key());
            for (_, key) in &by_node[node] {
                invocation.key(self.list_key(*key));
            }
            invocation.arg(visible_at);

            let popped: Option<(String, String, Option<String>)> = self
                .call("pop", invocation.invoke_async(&mut conn))
                .await?;
            let Some((list_key, task_id, data)) = popped else {
                return Ok(None);
            };

            let task = match data {
                Some(raw) => match serde_json::from_str::<Task>(&raw) {
                    Ok(task) => Some(task),
                    Err(e) => {
                        warn!("Quarantining unreadable task record {}: {}", task_id, e);
                        let mut pipe = redis::pipe();
                        pipe.atomic()
                            .hset(self.corrupt_key(), &task_id, raw)
                            .ignore()
                            .hdel(self.tasks_key(), &task_id)
                            .ignore();
                        self.call("quarantine", pipe.query_async::<()>(&mut conn))
                            .await?;
                        None
                    }
                },
                None => None,
            };
            match task {
                Some(task) if !task.state.is_terminal() => {
                    debug!("Dequeued task {} from {}", task.id, list_key);
                    return Ok(Some(task));
                }
                // Records evicted, finished or unreadable are skipped.
                _ => {
                    let member = format!("{}|{}", list_key, task_id);
                    self.call(
                        "ack",
                        conn.zrem::<_, _, ()>(self.inflight_key(), member),
                    )
                    .await?;
                }
            }
        }

        Ok(None)
    }

    async fn ack(&self, task: &Task) -> AnvilResult<()> {
        let mut conn = self.node(self.node_of(task.partition));
        self.call(
            "ack",
            conn.zrem::<_, _, ()>(self.inflight_key(), self.member(task)),
        )
        .await
    }

    async fn queue_len(&self, key: QueueKey) -> AnvilResult<usize> {
        let mut conn = self.node(self.node_of(key.partition));
        self.call("queue_len", conn.llen(self.list_key(key))).await
    }

    async fn queue_depths(
        &self,
        partitions: &[PartitionId],
    ) -> AnvilResult<HashMap<QueueKey, usize>> {
        let mut by_node: Vec<Vec<QueueKey>> = vec![Vec::new(); self.nodes.len()];
        for worker_type in WorkerType::ALL {
            for priority in TaskPriority::ALL_DESCENDING {
                for partition in partitions {
                    let key = QueueKey::new(worker_type, *partition, priority);
                    by_node[self.node_of(*partition)].push(key);
                }
            }
        }

        let mut depths = HashMap::new();
        for (node, keys) in by_node.iter().enumerate() {
            if keys.is_empty() {
                continue;
            }
            let mut pipe = redis::pipe();
            for key in keys {
                pipe.llen(self.list_key(*key));
            }
            let mut conn = self.node(node);
            let lens: Vec<usize> = self
                .call("queue_depths", pipe.query_async(&mut conn))
                .await?;
            depths.extend(keys.iter().copied().zip(lens).filter(|(_, len)| *len > 0));
        }
        Ok(depths)
    }

    async fn save_task(&self, task: &Task) -> AnvilResult<()> {
        let data = serde_json::to_string(task)?;
        let mut conn = self.node(self.node_of(task.partition));
        self.call(
            "save_task",
            conn.hset::<_, _, _, ()>(self.tasks_key(), &task.id, data),
        )
        .await
    }

    async fn get_task(&self, task_id: &TaskId) -> AnvilResult<Option<Task>> {
        let raw = self.hget_any(&self.tasks_key(), task_id, "get_task").await?;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> AnvilResult<Vec<Task>> {
        let values = self.hvals_all(&self.tasks_key(), "list_tasks").await?;
        let mut tasks: Vec<Task> = decode_all(values.into_iter().map(|(_, v)| v).collect(), "task");
        tasks.retain(|t| filter.matches(t));
        tasks.sort_by_key(|t| t.created_at);
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn put_dead_letter(&self, entry: &DeadLetterEntry) -> AnvilResult<()> {
        let data = serde_json::to_string(entry)?;
        let mut conn = self.node(self.node_of(entry.task.partition));
        self.call(
            "put_dead_letter",
            conn.hset::<_, _, _, ()>(self.dlq_key(), entry.task_id(), data),
        )
        .await
    }

    async fn get_dead_letter(&self, task_id: &TaskId) -> AnvilResult<Option<DeadLetterEntry>> {
        let raw = self
            .hget_any(&self.dlq_key(), task_id, "get_dead_letter")
            .await?;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> AnvilResult<Vec<DeadLetterEntry>> {
        let values = self.hvals_all(&self.dlq_key(), "list_dead_letters").await?;
        let mut entries: Vec<DeadLetterEntry> =
            decode_all(values.into_iter().map(|(_, v)| v).collect(), "dead letter");
        entries.retain(|e| filter.matches(e));
        entries.sort_by_key(|e| e.dead_lettered_at);
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn remove_dead_letter(&self, task_id: &TaskId) -> AnvilResult<bool> {
        let mut removed = 0usize;
        for index in 0..self.nodes.len() {
            let mut conn = self.node(index);
            let count: usize = self
                .call("remove_dead_letter", conn.hdel(self.dlq_key(), task_id))
                .await?;
            removed += count;
        }
        Ok(removed > 0)
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> AnvilResult<bool> {
        let mut conn = self.node(node_for_key(name, self.nodes.len()));
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let reply: Option<String> = self
            .call(
                "try_lock",
                redis::cmd("SET")
                    .arg(self.lock_key(name))
                    .arg(token)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, name: &str, token: &str) -> AnvilResult<bool> {
        let mut conn = self.node(node_for_key(name, self.nodes.len()));
        let deleted: i64 = self
            .call(
                "unlock",
                self.scripts
                    .unlock
                    .key(self.lock_key(name))
                    .arg(token)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn enforce_retention(&self, policy: &RetentionPolicy) -> AnvilResult<RetentionReport> {
        let now = SystemTime::now();
        let mut report = RetentionReport::default();

        let values = self.hvals_all(&self.tasks_key(), "retention").await?;
        let tasks: Vec<(usize, Task)> = values
            .into_iter()
            .filter_map(|(node, raw)| serde_json::from_str(&raw).ok().map(|t| (node, t)))
            .collect();
        let owners: HashMap<&TaskId, usize> = tasks.iter().map(|(n, t)| (&t.id, *n)).collect();
        for task_id in expired_tasks(tasks.iter().map(|(_, t)| t), policy, now) {
            if let Some(node) = owners.get(&task_id) {
                let mut conn = self.node(*node);
                self.call("retention", conn.hdel::<_, _, ()>(self.tasks_key(), &task_id))
                    .await?;
                report.tasks_evicted += 1;
            }
        }

        let values = self.hvals_all(&self.dlq_key(), "retention").await?;
        let letters: Vec<(usize, DeadLetterEntry)> = values
            .into_iter()
            .filter_map(|(node, raw)| serde_json::from_str(&raw).ok().map(|e| (node, e)))
            .collect();
        let owners: HashMap<&TaskId, usize> =
            letters.iter().map(|(n, e)| (e.task_id(), *n)).collect();
        for task_id in expired_dead_letters(letters.iter().map(|(_, e)| e), policy, now) {
            if let Some(node) = owners.get(&task_id) {
                let mut conn = self.node(*node);
                self.call("retention", conn.hdel::<_, _, ()>(self.dlq_key(), &task_id))
                    .await?;
                report.dead_letters_evicted += 1;
            }
        }

        Ok(report)
    }

    async fn health_check(&self) -> AnvilResult<()> {
        for index in 0..self.nodes.len() {
            let mut conn = self.node(index);
            let _: String = self
                .call("health_check", redis::cmd("PING").query_async(&mut conn))
                .await?;
        }
        Ok(())
    }
}
