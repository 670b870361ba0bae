//! In-process driver implementation.
//!
//! A complete, single-process stand-in for the remote pipeline service:
//! per-step visibility leases with redelivery on expiry, route management,
//! route logs, and dot-path decoration merges. Backs the test suite and
//! embedded deployments where the pipeline runs inside the consumer process.

use crate::errors::{Result, SteplineError};
use crate::message::{Decoration, Message, RouteLogEntry};
use crate::options::ReceiveOptions;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::Driver;

/// How often a blocking recv re-checks for visible messages.
const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct MessageState {
    payload: String,
    decorated: serde_json::Value,
    route: Vec<String>,
    route_log: Vec<RouteLogEntry>,
    completed: Vec<String>,
    acked: HashSet<String>,
    /// Per-step visibility lease: the message is withheld from fetches for
    /// the step until the instant passes.
    leases: HashMap<String, Instant>,
}

impl MessageState {
    fn new(payload: String, route: Vec<String>) -> Self {
        let decorated =
            serde_json::from_str(&payload).unwrap_or_else(|_| serde_json::json!({}));
        Self {
            payload,
            decorated,
            route,
            route_log: Vec::new(),
            completed: Vec::new(),
            acked: HashSet::new(),
            leases: HashMap::new(),
        }
    }

    /// The first route step not yet completed, if any.
    fn current_step(&self) -> Option<&str> {
        self.route
            .iter()
            .map(String::as_str)
            .find(|step| !self.completed.iter().any(|c| c == step))
    }

    fn visible_for(&self, step: &str, now: Instant) -> bool {
        if self.current_step() != Some(step) {
            return false;
        }
        if self.acked.contains(step) {
            return false;
        }
        match self.leases.get(step) {
            Some(until) => *until <= now,
            None => true,
        }
    }

    fn snapshot(&self, id: &str, options: &ReceiveOptions) -> Message {
        Message {
            id: id.to_string(),
            route: if options.exclude_routing {
                Vec::new()
            } else {
                self.route.clone()
            },
            route_log: if options.exclude_route_log {
                Vec::new()
            } else {
                self.route_log.clone()
            },
            payload: self.payload.clone(),
            decorated_payload: if options.exclude_decorated_payload {
                String::new()
            } else {
                self.decorated.to_string()
            },
            completed: self.completed.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Message state by id, with insertion order kept for FIFO fetches.
    messages: HashMap<String, MessageState>,
    order: Vec<String>,
}

/// An in-process [`Driver`] holding all pipeline state in memory.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    inner: Mutex<Inner>,
}

impl MemoryDriver {
    /// Creates an empty in-process driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of messages held, visible or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Returns true if the driver holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }

    /// Returns the route log of a message, for test assertions.
    pub fn route_log(&self, id: &str) -> Result<Vec<RouteLogEntry>> {
        let inner = self.inner.lock();
        let state = inner
            .messages
            .get(id)
            .ok_or_else(|| SteplineError::NotFound(id.to_string()))?;
        Ok(state.route_log.clone())
    }

    /// Returns the completed steps of a message, for test assertions.
    pub fn completed_steps(&self, id: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let state = inner
            .messages
            .get(id)
            .ok_or_else(|| SteplineError::NotFound(id.to_string()))?;
        Ok(state.completed.clone())
    }

    fn take_visible(&self, options: &ReceiveOptions) -> Vec<Message> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Inner { messages, order } = &mut *inner;

        let mut batch = Vec::new();
        for id in order.iter() {
            if batch.len() >= options.count.max(1) as usize {
                break;
            }
            let Some(state) = messages.get_mut(id) else {
                continue;
            };
            if !state.visible_for(&options.step, now) {
                continue;
            }
            state
                .leases
                .insert(options.step.clone(), now + options.redelivery_timeout);
            if options.auto_ack {
                state.acked.insert(options.step.clone());
            }
            batch.push(state.snapshot(id, options));
        }
        batch
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn send(&self, payload: &str, route: &[String]) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let state = MessageState::new(payload.to_string(), route.to_vec());

        let mut inner = self.inner.lock();
        inner.messages.insert(id.clone(), state);
        inner.order.push(id.clone());
        Ok(id)
    }

    async fn recv(&self, options: &ReceiveOptions) -> Result<Vec<Message>> {
        let batch = self.take_visible(options);
        if !batch.is_empty() || !options.block {
            return Ok(batch);
        }

        let deadline = Instant::now() + options.timeout;
        loop {
            tokio::time::sleep(BLOCK_POLL_INTERVAL).await;
            let batch = self.take_visible(options);
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
        }
    }

    async fn ack(&self, id: &str, step: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| SteplineError::NotFound(id.to_string()))?;
        // Repeated acks are a no-op.
        state.acked.insert(step.to_string());
        Ok(())
    }

    async fn complete(&self, id: &str, step: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| SteplineError::NotFound(id.to_string()))?;

        if state.completed.iter().any(|c| c == step) {
            return Err(SteplineError::AlreadyCompleted {
                id: id.to_string(),
                step: step.to_string(),
            });
        }
        if !state.route.iter().any(|s| s == step) {
            return Err(SteplineError::StepNotOnRoute {
                id: id.to_string(),
                step: step.to_string(),
            });
        }

        state.completed.push(step.to_string());
        state.leases.remove(step);
        Ok(())
    }

    async fn append_log(&self, id: &str, step: &str, code: i32, text: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| SteplineError::NotFound(id.to_string()))?;
        state.route_log.push(RouteLogEntry::new(step, code, text));
        Ok(())
    }

    async fn add_steps_after(&self, id: &str, after: &str, steps: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| SteplineError::NotFound(id.to_string()))?;

        let position = state
            .route
            .iter()
            .position(|s| s == after)
            .ok_or_else(|| SteplineError::StepNotOnRoute {
                id: id.to_string(),
                step: after.to_string(),
            })?;

        for (offset, step) in steps.iter().enumerate() {
            state.route.insert(position + 1 + offset, step.clone());
        }
        Ok(())
    }

    async fn decorate(&self, id: &str, decorations: &[Decoration]) -> Vec<Result<()>> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.messages.get_mut(id) else {
            return decorations
                .iter()
                .map(|_| Err(SteplineError::NotFound(id.to_string())))
                .collect();
        };

        decorations
            .iter()
            .map(|decoration| {
                let Some(raw) = decoration.value.as_deref() else {
                    return Err(SteplineError::invalid_input(format!(
                        "decoration '{}' has no value",
                        decoration.key
                    )));
                };
                let value: serde_json::Value = serde_json::from_str(raw)?;
                set_path(&mut state.decorated, &decoration.key, value);
                Ok(())
            })
            .collect()
    }

    async fn get_decorations(&self, id: &str, keys: &[String]) -> Result<Vec<Decoration>> {
        let inner = self.inner.lock();
        let state = inner
            .messages
            .get(id)
            .ok_or_else(|| SteplineError::NotFound(id.to_string()))?;

        Ok(keys
            .iter()
            .map(|key| match get_path(&state.decorated, key) {
                Some(value) => Decoration::new(key.clone(), value.to_string()),
                None => Decoration::absent(key.clone()),
            })
            .collect())
    }
}

/// Writes `value` at a dot-path, creating intermediate objects as needed.
/// Non-object intermediates are overwritten.
fn set_path(target: &mut serde_json::Value, path: &str, value: serde_json::Value) {
    if !target.is_object() {
        *target = serde_json::json!({});
    }
    let serde_json::Value::Object(map) = target else {
        return;
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| serde_json::json!({}));
            set_path(child, rest, value);
        }
    }
}

/// Reads the value at a dot-path, if present.
fn get_path<'a>(source: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = source;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn opts(step: &str) -> ReceiveOptions {
        ReceiveOptions::new(step)
            .with_block(false)
            .with_redelivery_timeout(Duration::from_millis(50))
    }

    fn route(steps: &[&str]) -> Vec<String> {
        steps.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_send_then_recv_round_trip() {
        let driver = MemoryDriver::new();
        let id = driver
            .send(r#"{"a":1}"#, &route(&["x", "y"]))
            .await
            .unwrap();

        let batch = driver.recv(&opts("x")).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].payload, r#"{"a":1}"#);
        assert_eq!(batch[0].route, route(&["x", "y"]));
    }

    #[tokio::test]
    async fn test_recv_only_for_current_step() {
        let driver = MemoryDriver::new();
        driver.send("{}", &route(&["x", "y"])).await.unwrap();

        let batch = driver.recv(&opts("y")).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_recv_leases_until_redelivery_timeout() {
        let driver = MemoryDriver::new();
        driver.send("{}", &route(&["x"])).await.unwrap();

        let first = driver.recv(&opts("x")).await.unwrap();
        assert_eq!(first.len(), 1);

        // Leased: an immediate second fetch sees nothing.
        let second = driver.recv(&opts("x")).await.unwrap();
        assert!(second.is_empty());

        // After the lease expires the message is redelivered.
        tokio::time::sleep(Duration::from_millis(70)).await;
        let third = driver.recv(&opts("x")).await.unwrap();
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn test_acked_message_is_not_redelivered() {
        let driver = MemoryDriver::new();
        let id = driver.send("{}", &route(&["x"])).await.unwrap();

        driver.recv(&opts("x")).await.unwrap();
        driver.ack(&id, "x").await.unwrap();

        tokio::time::sleep(Duration::from_millis(70)).await;
        let batch = driver.recv(&opts("x")).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_auto_ack_fetch_prevents_redelivery() {
        let driver = MemoryDriver::new();
        driver.send("{}", &route(&["x"])).await.unwrap();

        let batch = driver.recv(&opts("x").with_auto_ack(true)).await.unwrap();
        assert_eq!(batch.len(), 1);

        // Acked on fetch: the lease expiring changes nothing.
        tokio::time::sleep(Duration::from_millis(70)).await;
        let again = driver.recv(&opts("x")).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let driver = MemoryDriver::new();
        let id = driver.send("{}", &route(&["x"])).await.unwrap();

        driver.ack(&id, "x").await.unwrap();
        driver.ack(&id, "x").await.unwrap();
    }

    #[tokio::test]
    async fn test_double_complete_fails() {
        let driver = MemoryDriver::new();
        let id = driver.send("{}", &route(&["x", "y"])).await.unwrap();

        driver.complete(&id, "x").await.unwrap();
        let err = driver.complete(&id, "x").await.unwrap_err();
        assert!(matches!(err, SteplineError::AlreadyCompleted { .. }));
    }

    #[tokio::test]
    async fn test_complete_advances_to_next_step() {
        let driver = MemoryDriver::new();
        let id = driver.send("{}", &route(&["x", "y"])).await.unwrap();

        driver.recv(&opts("x")).await.unwrap();
        driver.complete(&id, "x").await.unwrap();

        let batch = driver.recv(&opts("y")).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].completed, route(&["x"]));
    }

    #[tokio::test]
    async fn test_add_steps_inserted_after_not_appended() {
        let driver = MemoryDriver::new();
        let id = driver.send("{}", &route(&["a", "b"])).await.unwrap();

        driver
            .add_steps_after(&id, "a", &route(&["s1", "s2"]))
            .await
            .unwrap();

        let batch = driver.recv(&opts("a")).await.unwrap();
        assert_eq!(batch[0].route, route(&["a", "s1", "s2", "b"]));
    }

    #[tokio::test]
    async fn test_add_steps_after_unknown_step_fails() {
        let driver = MemoryDriver::new();
        let id = driver.send("{}", &route(&["a"])).await.unwrap();

        let err = driver
            .add_steps_after(&id, "missing", &route(&["s1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SteplineError::StepNotOnRoute { .. }));
    }

    #[tokio::test]
    async fn test_decorate_last_write_wins() {
        let driver = MemoryDriver::new();
        let id = driver.send(r#"{"a":1}"#, &route(&["x"])).await.unwrap();

        let results = driver.decorate(&id, &[Decoration::new("k", "1")]).await;
        assert!(results.iter().all(Result::is_ok));
        driver.decorate(&id, &[Decoration::new("k", "2")]).await;

        let decorations = driver
            .get_decorations(&id, &route(&["k"]))
            .await
            .unwrap();
        assert_eq!(decorations[0].value.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_decorate_dot_path_merges_nested() {
        let driver = MemoryDriver::new();
        let id = driver.send(r#"{"a":1}"#, &route(&["x"])).await.unwrap();

        driver
            .decorate(&id, &[Decoration::new("user.city", r#""berlin""#)])
            .await;

        let batch = driver.recv(&opts("x")).await.unwrap();
        let decorated = batch[0].decorated_json().unwrap();
        assert_eq!(decorated["a"], 1);
        assert_eq!(decorated["user"]["city"], "berlin");
    }

    #[tokio::test]
    async fn test_decorate_reports_per_key_failures() {
        let driver = MemoryDriver::new();
        let id = driver.send("{}", &route(&["x"])).await.unwrap();

        let results = driver
            .decorate(
                &id,
                &[
                    Decoration::new("good", "1"),
                    Decoration::new("bad", "not json"),
                ],
            )
            .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());

        // The good key landed despite the bad one.
        let decorations = driver
            .get_decorations(&id, &route(&["good"]))
            .await
            .unwrap();
        assert_eq!(decorations[0].value.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_get_decorations_absent_key_marker() {
        let driver = MemoryDriver::new();
        let id = driver.send("{}", &route(&["x"])).await.unwrap();

        let decorations = driver
            .get_decorations(&id, &route(&["never_set"]))
            .await
            .unwrap();
        assert_eq!(decorations.len(), 1);
        assert_eq!(decorations[0].key, "never_set");
        assert!(decorations[0].value.is_none());
    }

    #[tokio::test]
    async fn test_append_log() {
        let driver = MemoryDriver::new();
        let id = driver.send("{}", &route(&["x"])).await.unwrap();

        driver.append_log(&id, "x", -1, "boom").await.unwrap();
        driver.append_log(&id, "x", 0, "done").await.unwrap();

        let log = driver.route_log(&id).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].is_failure());
        assert_eq!(log[1].code, 0);
    }

    #[tokio::test]
    async fn test_blocking_recv_waits_for_message() {
        let driver = std::sync::Arc::new(MemoryDriver::new());
        let options = ReceiveOptions::new("x")
            .with_block(true)
            .with_timeout(Duration::from_secs(1));

        let sender = driver.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sender.send("{}", &route(&["x"])).await.unwrap();
        });

        let batch = driver.recv(&options).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_exclusion_flags() {
        let driver = MemoryDriver::new();
        driver.send(r#"{"a":1}"#, &route(&["x"])).await.unwrap();

        let options = opts("x")
            .with_exclude_routing(true)
            .with_exclude_route_log(true)
            .with_exclude_decorated_payload(true);
        let batch = driver.recv(&options).await.unwrap();

        assert!(batch[0].route.is_empty());
        assert!(batch[0].route_log.is_empty());
        assert!(batch[0].decorated_payload.is_empty());
        assert_eq!(batch[0].payload, r#"{"a":1}"#);
    }
}
