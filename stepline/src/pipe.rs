//! Per-step buffered pipeline client.
//!
//! A [`Pipe`] owns one step's receive configuration, a bounded buffer of
//! pre-fetched messages, and a background fetch task. The buffer decouples
//! network latency from processing throughput: the fetch task fills it ahead
//! of consumption and blocks when it is full, so backpressure lands on the
//! feeder rather than on the server.

use crate::driver::Driver;
use crate::errors::{Result, SteplineError};
use crate::message::{Decoration, Message};
use crate::options::ReceiveOptions;
use crate::retry::{with_retry, Backoff, RetryConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Builder for a [`Pipe`].
pub struct PipeBuilder {
    driver: Arc<dyn Driver>,
    step: String,
    options: ReceiveOptions,
    send_retry: RetryConfig,
    fetch_retry: RetryConfig,
}

impl PipeBuilder {
    /// Sets the initial receive options.
    ///
    /// The step and count are normalized as in [`Pipe::set_receive_options`].
    #[must_use]
    pub fn with_receive_options(mut self, options: ReceiveOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the retry policy for sends.
    #[must_use]
    pub fn with_send_retry(mut self, config: RetryConfig) -> Self {
        self.send_retry = config;
        self
    }

    /// Sets the backoff policy for the fetch loop.
    #[must_use]
    pub fn with_fetch_retry(mut self, config: RetryConfig) -> Self {
        self.fetch_retry = config;
        self
    }

    /// Builds the pipe. The buffer is sized by the receive options' count.
    #[must_use]
    pub fn build(self) -> Arc<Pipe> {
        let options = self.options.normalized_for(&self.step);
        let capacity = options.count as usize;
        let (tx, rx) = mpsc::channel(capacity);
        let (stop_tx, _) = watch::channel(false);

        Arc::new(Pipe {
            driver: self.driver,
            step: self.step,
            options: parking_lot::RwLock::new(options),
            send_retry: self.send_retry,
            fetch_retry: self.fetch_retry,
            running: AtomicBool::new(false),
            stop_tx,
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            depth: AtomicUsize::new(0),
            current: parking_lot::Mutex::new(None),
            fetch_task: parking_lot::Mutex::new(None),
        })
    }
}

/// A buffered fetch/ack/complete client bound to one pipeline step.
pub struct Pipe {
    driver: Arc<dyn Driver>,
    step: String,
    options: parking_lot::RwLock<ReceiveOptions>,
    send_retry: RetryConfig,
    fetch_retry: RetryConfig,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    tx: parking_lot::Mutex<Option<mpsc::Sender<Message>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    depth: AtomicUsize,
    current: parking_lot::Mutex<Option<Message>>,
    fetch_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Pipe {
    /// Creates a pipe for `step` with default options and retry policies.
    ///
    /// Sends use a constant short delay with a high attempt count; fetches
    /// use a linearly growing backoff capped at ten seconds.
    #[must_use]
    pub fn new(driver: Arc<dyn Driver>, step: impl Into<String>) -> Arc<Self> {
        Self::builder(driver, step).build()
    }

    /// Returns a builder for custom options and retry policies.
    #[must_use]
    pub fn builder(driver: Arc<dyn Driver>, step: impl Into<String>) -> PipeBuilder {
        let step = step.into();
        PipeBuilder {
            driver,
            options: ReceiveOptions::new(&step),
            step,
            send_retry: RetryConfig::new()
                .with_max_attempts(10)
                .with_base_delay(Duration::from_millis(100))
                .with_backoff(Backoff::Constant),
            fetch_retry: RetryConfig::new()
                .with_base_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_secs(10))
                .with_backoff(Backoff::Linear),
        }
    }

    /// The step this pipe is bound to.
    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Returns a copy of the active receive options.
    #[must_use]
    pub fn receive_options(&self) -> ReceiveOptions {
        self.options.read().clone()
    }

    /// Replaces the active receive configuration.
    ///
    /// The step field is forced to this pipe's step and the count to at
    /// least 1. Takes effect on the next fetch cycle; already-buffered
    /// messages are unaffected.
    pub fn set_receive_options(&self, options: ReceiveOptions) {
        *self.options.write() = options.normalized_for(&self.step);
    }

    /// Submits a payload with a route, returning the assigned message id.
    ///
    /// Fails permanently only after retry exhaustion.
    pub async fn send(&self, payload: &str, route: &[String]) -> Result<String> {
        if payload.is_empty() {
            return Err(SteplineError::invalid_input("payload required"));
        }
        if route.is_empty() {
            return Err(SteplineError::invalid_input(
                "route must have at least 1 step",
            ));
        }

        with_retry(&self.send_retry, || async {
            self.driver.send(payload, route).await
        })
        .await
    }

    /// Starts the background fetch loop.
    ///
    /// Fails if the pipe is already running or was stopped.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.tx.lock().is_none() {
            return Err(SteplineError::invalid_input("pipe is stopped"));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SteplineError::AlreadyRunning("pipe"));
        }

        let pipe = Arc::clone(self);
        let handle = tokio::spawn(async move {
            pipe.fetch_loop().await;
        });
        *self.fetch_task.lock() = Some(handle);
        Ok(())
    }

    /// Stops the pipe and closes the buffer.
    ///
    /// Buffered messages are still delivered; a blocked consumer then
    /// unblocks with `None`. Stop is cooperative: an in-flight fetch is
    /// allowed to finish. Double-stop is a no-op.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
        self.tx.lock().take();
    }

    /// Dequeues the next buffered message in FIFO order.
    ///
    /// Blocks until a message is available or the pipe is stopped and
    /// drained, in which case `None` is returned.
    pub async fn next(&self) -> Option<Message> {
        let mut rx = self.rx.lock().await;
        let message = rx.recv().await;
        drop(rx);

        if let Some(ref m) = message {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            *self.current.lock() = Some(m.clone());
        }
        message
    }

    /// Returns the message most recently dequeued and not yet completed.
    #[must_use]
    pub fn current_message(&self) -> Option<Message> {
        self.current.lock().clone()
    }

    /// Acknowledges a message for this step.
    ///
    /// Idempotent from the caller's perspective.
    pub async fn ack(&self, id: &str) -> Result<()> {
        self.driver.ack(id, &self.step).await
    }

    /// Marks this step complete for a message.
    ///
    /// Completing an already-completed step fails. Clears the cached current
    /// message when it matches.
    pub async fn complete(&self, id: &str) -> Result<()> {
        self.driver.complete(id, &self.step).await?;

        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|m| m.id == id) {
            *current = None;
        }
        Ok(())
    }

    /// Appends a route-log entry tagged with this pipe's step.
    ///
    /// Code 0 marks success, negative codes mark failures.
    pub async fn log(&self, id: &str, code: i32, text: &str) -> Result<()> {
        if text.is_empty() {
            return Err(SteplineError::invalid_input("log text required"));
        }
        self.driver.append_log(id, &self.step, code, text).await
    }

    /// Inserts steps into the message's route immediately after this pipe's
    /// step, rerouting it through additional stages before its original
    /// downstream steps.
    pub async fn add_steps(&self, id: &str, steps: &[String]) -> Result<()> {
        if steps.is_empty() {
            return Err(SteplineError::invalid_input(
                "steps must have at least 1 element",
            ));
        }
        self.driver.add_steps_after(id, &self.step, steps).await
    }

    /// Merges decorations into the message's decorated payload.
    ///
    /// Returns one result slot per decoration; partial failure is reported
    /// per key. Overwriting keys is allowed and encouraged; the last value
    /// written wins for downstream steps.
    pub async fn decorate(&self, id: &str, decorations: &[Decoration]) -> Vec<Result<()>> {
        if decorations.is_empty() {
            return vec![Err(SteplineError::invalid_input(
                "decorations must have at least 1 element",
            ))];
        }
        self.driver.decorate(id, decorations).await
    }

    /// Returns, per requested key in order, the decoration's JSON-encoded
    /// value or an absent marker.
    pub async fn get_decorations(&self, id: &str, keys: &[String]) -> Result<Vec<Decoration>> {
        if keys.is_empty() {
            return Err(SteplineError::invalid_input(
                "keys must have at least 1 element",
            ));
        }
        self.driver.get_decorations(id, keys).await
    }

    /// Best-effort check that the local buffer is empty.
    ///
    /// Racy by design; used for shutdown heuristics, not correctness.
    #[must_use]
    pub fn idle(&self) -> bool {
        self.depth.load(Ordering::SeqCst) == 0
    }

    /// The fetch loop: fill the buffer, back off against an empty or failing
    /// queue, and never terminate on error. Exits only when stopped.
    async fn fetch_loop(&self) {
        let sender = self.tx.lock().clone();
        let Some(sender) = sender else {
            return;
        };
        let mut stop_rx = self.stop_tx.subscribe();
        let mut attempt: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            let options = self.options.read().clone();
            let batch = match self.driver.recv(&options).await {
                Ok(batch) => batch,
                Err(error) => {
                    debug!(step = %self.step, error = %error, "fetch failed, backing off");
                    Vec::new()
                }
            };

            if batch.is_empty() {
                let delay = self.fetch_retry.delay_for(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = stop_rx.wait_for(|stopped| *stopped) => return,
                }
                continue;
            }

            attempt = 0;
            debug!(step = %self.step, count = batch.len(), "buffering fetched messages");
            for message in batch {
                // Counted before the handoff: the consumer's decrement in
                // next() must never observe the message ahead of the add.
                self.depth.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    sent = sender.send(message) => {
                        if sent.is_err() {
                            self.depth.fetch_sub(1, Ordering::SeqCst);
                            return;
                        }
                    }
                    _ = stop_rx.wait_for(|stopped| *stopped) => {
                        self.depth.fetch_sub(1, Ordering::SeqCst);
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("step", &self.step)
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("idle", &self.idle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use pretty_assertions::assert_eq;

    fn fast_pipe(driver: Arc<MemoryDriver>, step: &str) -> Arc<Pipe> {
        Pipe::builder(driver, step)
            .with_receive_options(
                ReceiveOptions::new(step)
                    .with_block(false)
                    .with_redelivery_timeout(Duration::from_secs(5)),
            )
            .with_fetch_retry(
                RetryConfig::new()
                    .with_base_delay(Duration::from_millis(5))
                    .with_max_delay(Duration::from_millis(20)),
            )
            .build()
    }

    fn route(steps: &[&str]) -> Vec<String> {
        steps.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_send_rejects_empty_payload() {
        let pipe = Pipe::new(Arc::new(MemoryDriver::new()), "x");
        let err = pipe.send("", &route(&["x"])).await.unwrap_err();
        assert!(matches!(err, SteplineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_send_rejects_empty_route() {
        let pipe = Pipe::new(Arc::new(MemoryDriver::new()), "x");
        let err = pipe.send("{}", &[]).await.unwrap_err();
        assert!(matches!(err, SteplineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_send_returns_id() {
        let pipe = Pipe::new(Arc::new(MemoryDriver::new()), "x");
        let id = pipe.send("{}", &route(&["x"])).await.unwrap();
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let pipe = fast_pipe(Arc::new(MemoryDriver::new()), "x");
        pipe.start().unwrap();
        let err = pipe.start().unwrap_err();
        assert!(matches!(err, SteplineError::AlreadyRunning("pipe")));
        pipe.stop();
    }

    #[tokio::test]
    async fn test_fetch_loop_delivers_in_order() {
        let driver = Arc::new(MemoryDriver::new());
        let pipe = fast_pipe(driver.clone(), "x");

        let first = pipe.send(r#"{"n":1}"#, &route(&["x"])).await.unwrap();
        let second = pipe.send(r#"{"n":2}"#, &route(&["x"])).await.unwrap();

        pipe.start().unwrap();
        let a = pipe.next().await.unwrap();
        let b = pipe.next().await.unwrap();
        pipe.stop();

        assert_eq!(a.id, first);
        assert_eq!(b.id, second);
    }

    #[tokio::test]
    async fn test_stop_unblocks_consumer_with_none() {
        let pipe = fast_pipe(Arc::new(MemoryDriver::new()), "x");
        pipe.start().unwrap();

        let consumer = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.next().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        pipe.stop();

        let message = consumer.await.unwrap();
        assert!(message.is_none());
    }

    #[test]
    fn test_next_is_pending_until_stopped() {
        let pipe = fast_pipe(Arc::new(MemoryDriver::new()), "x");

        let mut next = tokio_test::task::spawn(pipe.next());
        tokio_test::assert_pending!(next.poll());

        pipe.stop();
        assert!(next.is_woken());
        tokio_test::assert_ready_eq!(next.poll(), None);
    }

    #[tokio::test]
    async fn test_double_stop_is_noop() {
        let pipe = fast_pipe(Arc::new(MemoryDriver::new()), "x");
        pipe.start().unwrap();
        pipe.stop();
        pipe.stop();
    }

    #[tokio::test]
    async fn test_start_after_stop_fails() {
        let pipe = fast_pipe(Arc::new(MemoryDriver::new()), "x");
        pipe.stop();
        let err = pipe.start().unwrap_err();
        assert!(matches!(err, SteplineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_set_receive_options_forces_step_and_count() {
        let pipe = Pipe::new(Arc::new(MemoryDriver::new()), "mine");
        pipe.set_receive_options(ReceiveOptions::new("other").with_count(0));

        let options = pipe.receive_options();
        assert_eq!(options.step, "mine");
        assert_eq!(options.count, 1);
    }

    #[tokio::test]
    async fn test_log_rejects_empty_text() {
        let pipe = Pipe::new(Arc::new(MemoryDriver::new()), "x");
        let err = pipe.log("id", 0, "").await.unwrap_err();
        assert!(matches!(err, SteplineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_add_steps_rejects_empty() {
        let pipe = Pipe::new(Arc::new(MemoryDriver::new()), "x");
        let err = pipe.add_steps("id", &[]).await.unwrap_err();
        assert!(matches!(err, SteplineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_decorate_rejects_empty() {
        let pipe = Pipe::new(Arc::new(MemoryDriver::new()), "x");
        let results = pipe.decorate("id", &[]).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[tokio::test]
    async fn test_get_decorations_rejects_empty_keys() {
        let pipe = Pipe::new(Arc::new(MemoryDriver::new()), "x");
        let err = pipe.get_decorations("id", &[]).await.unwrap_err();
        assert!(matches!(err, SteplineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_complete_clears_current_message() {
        let driver = Arc::new(MemoryDriver::new());
        let pipe = fast_pipe(driver.clone(), "x");

        let id = pipe.send("{}", &route(&["x"])).await.unwrap();
        pipe.start().unwrap();

        let message = pipe.next().await.unwrap();
        assert_eq!(pipe.current_message().map(|m| m.id), Some(id.clone()));

        pipe.complete(&message.id).await.unwrap();
        assert!(pipe.current_message().is_none());
        pipe.stop();
    }

    #[tokio::test]
    async fn test_ack_is_idempotent_through_pipe() {
        let driver = Arc::new(MemoryDriver::new());
        let pipe = fast_pipe(driver, "x");

        let id = pipe.send("{}", &route(&["x"])).await.unwrap();
        pipe.ack(&id).await.unwrap();
        pipe.ack(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_immediately_after_fast_consume() {
        // The buffered count is incremented before the channel handoff, so a
        // consumer that dequeues the instant a message lands sees an empty
        // buffer, never a wrapped counter.
        for _ in 0..20 {
            let driver = Arc::new(MemoryDriver::new());
            let pipe = fast_pipe(driver, "x");
            pipe.send("{}", &route(&["x"])).await.unwrap();

            pipe.start().unwrap();
            pipe.next().await.unwrap();
            assert!(pipe.idle());
            pipe.stop();
        }
    }

    #[tokio::test]
    async fn test_idle_reflects_buffer() {
        let driver = Arc::new(MemoryDriver::new());
        let pipe = fast_pipe(driver, "x");
        assert!(pipe.idle());

        pipe.send("{}", &route(&["x"])).await.unwrap();
        pipe.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pipe.idle());

        pipe.next().await.unwrap();
        assert!(pipe.idle());
        pipe.stop();
    }
}
