//! Handler-chain dispatch runtime on top of a pipe.
//!
//! A [`Worker`] drains its pipe's buffer one message at a time and runs the
//! registered handlers strictly in registration order. The first handler
//! error stops the chain; what happens next is decided by the escalation
//! policy: registered error handlers take over completion responsibility,
//! otherwise the worker's policy flags decide between completing anyway,
//! acknowledging without completing, or leaving the message for server-side
//! redelivery.
//!
//! Completion policy without error handlers, per flag combination:
//!
//! - `complete_on_error` (default): the failure is logged and the message is
//!   still completed, so the pipeline advances; the failure is recorded but
//!   non-blocking.
//! - `ack_on_error` only: the message is acknowledged, preventing immediate
//!   redelivery, but not completed; something out-of-band must intervene.
//! - neither: the message is left untouched and the server redelivers it
//!   after the redelivery timeout. This is the application-level
//!   at-least-once retry loop.

use crate::message::{Message, LOG_FAILURE, LOG_SUCCESS};
use crate::pipe::Pipe;
use crate::errors::{Result, SteplineError};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors returned by application handlers.
///
/// Deliberately opaque to the runtime: a handler error is logged to the
/// message's route log and routed through the escalation policy, never
/// through the transport error taxonomy.
pub type HandlerError = anyhow::Error;

/// A unit of application logic run against each fetched message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one message. Returning an error stops the chain.
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError>;
}

/// An escalation callback invoked when the handler chain fails.
///
/// When any error handler is registered the worker does not complete failed
/// messages itself; an error handler must call [`Pipe::complete`] explicitly
/// if the message should advance, or do nothing to leave it for redelivery.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Called with the failed message and the handler error.
    async fn on_error(&self, message: &Message, error: &HandlerError);
}

#[async_trait]
impl<T: MessageHandler + ?Sized> MessageHandler for Arc<T> {
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        (**self).handle(message).await
    }
}

#[async_trait]
impl<T: ErrorHandler + ?Sized> ErrorHandler for Arc<T> {
    async fn on_error(&self, message: &Message, error: &HandlerError) {
        (**self).on_error(message, error).await;
    }
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    /// Wraps the closure.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        (self.func)(message.clone()).await
    }
}

/// Adapts an async closure into an [`ErrorHandler`].
///
/// The closure receives the message and the rendered error text.
pub struct FnErrorHandler<F, Fut>
where
    F: Fn(Message, String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnErrorHandler<F, Fut>
where
    F: Fn(Message, String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    /// Wraps the closure.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> ErrorHandler for FnErrorHandler<F, Fut>
where
    F: Fn(Message, String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn on_error(&self, message: &Message, error: &HandlerError) {
        (self.func)(message.clone(), format!("{error:#}")).await;
    }
}

/// Construction options for a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Propagated into the pipe's receive options: how long the server
    /// withholds re-delivery of an unacknowledged, uncompleted message.
    pub redelivery_timeout: Duration,
    /// Acknowledge (but do not complete) after a failure when no error
    /// handlers are registered.
    pub ack_on_error: bool,
    /// Complete after a failure when no error handlers are registered.
    /// Takes precedence over `ack_on_error`.
    pub complete_on_error: bool,
    /// When set, a failed route-log append blocks the automatic
    /// completion or acknowledgement for that message.
    pub strict_logging: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            redelivery_timeout: Duration::from_secs(30),
            ack_on_error: false,
            complete_on_error: true,
            strict_logging: false,
        }
    }
}

impl WorkerOptions {
    /// Creates options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the redelivery timeout.
    #[must_use]
    pub fn with_redelivery_timeout(mut self, timeout: Duration) -> Self {
        self.redelivery_timeout = timeout;
        self
    }

    /// Sets the ack-on-error flag.
    #[must_use]
    pub fn with_ack_on_error(mut self, ack: bool) -> Self {
        self.ack_on_error = ack;
        self
    }

    /// Sets the complete-on-error flag.
    #[must_use]
    pub fn with_complete_on_error(mut self, complete: bool) -> Self {
        self.complete_on_error = complete;
        self
    }

    /// Sets the strict-logging flag.
    #[must_use]
    pub fn with_strict_logging(mut self, strict: bool) -> Self {
        self.strict_logging = strict;
        self
    }
}

/// Outcome of running the handler chain for one message.
#[derive(Debug)]
pub enum Dispatch {
    /// Every handler succeeded.
    Success,
    /// A handler failed; subsequent handlers were skipped.
    Failed {
        /// Index of the failed handler in registration order.
        index: usize,
        /// The handler's error.
        error: HandlerError,
    },
}

/// A handler-chain dispatcher owning a [`Pipe`].
///
/// One worker processes messages sequentially; concurrency across steps is
/// achieved by running multiple workers, each with its own pipe and fetch
/// task. Multiple workers for the same step may run across processes; the
/// remote service guarantees at-most-once delivery per message within a
/// redelivery window.
pub struct Worker {
    pipe: Arc<Pipe>,
    options: WorkerOptions,
    handlers: parking_lot::RwLock<Vec<Arc<dyn MessageHandler>>>,
    error_handlers: parking_lot::RwLock<Vec<Arc<dyn ErrorHandler>>>,
    running: AtomicBool,
}

impl Worker {
    /// Creates a worker on the given pipe.
    ///
    /// The options' redelivery timeout is written into the pipe's receive
    /// configuration.
    #[must_use]
    pub fn new(pipe: Arc<Pipe>, options: WorkerOptions) -> Arc<Self> {
        let receive = pipe
            .receive_options()
            .with_redelivery_timeout(options.redelivery_timeout);
        pipe.set_receive_options(receive);

        Arc::new(Self {
            pipe,
            options,
            handlers: parking_lot::RwLock::new(Vec::new()),
            error_handlers: parking_lot::RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// The worker's pipe.
    ///
    /// Useful inside error handlers that conditionally complete a message,
    /// and for decorating messages from handlers.
    #[must_use]
    pub fn pipe(&self) -> Arc<Pipe> {
        Arc::clone(&self.pipe)
    }

    /// Appends a handler to the ordered chain.
    pub fn on_message(&self, handler: impl MessageHandler + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Appends an async closure to the ordered chain.
    pub fn on_message_fn<F, Fut>(&self, func: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.on_message(FnHandler::new(func));
    }

    /// Registers an error handler.
    ///
    /// Once any error handler is registered, failed messages are no longer
    /// completed automatically.
    pub fn on_error(&self, handler: impl ErrorHandler + 'static) {
        self.error_handlers.write().push(Arc::new(handler));
    }

    /// Registers an async closure as an error handler.
    pub fn on_error_fn<F, Fut>(&self, func: F)
    where
        F: Fn(Message, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_error(FnErrorHandler::new(func));
    }

    /// Starts the pipe (if needed) and dispatches messages until stopped.
    ///
    /// Fails if the worker is already running. Processing is synchronous
    /// within the loop: a slow handler stalls this worker's throughput but
    /// not other workers.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SteplineError::AlreadyRunning("worker"));
        }

        match self.pipe.start() {
            Ok(()) | Err(SteplineError::AlreadyRunning(_)) => {}
            Err(error) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(error);
            }
        }

        while self.running.load(Ordering::SeqCst) {
            let Some(message) = self.pipe.next().await else {
                break;
            };
            self.handle_message(&message).await;
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Runs the worker on a background task.
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<()>> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run().await })
    }

    /// Halts the dispatch loop and the underlying pipe.
    ///
    /// Cooperative: an in-flight handler finishes before the loop observes
    /// the stop. Double-stop is a no-op.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.pipe.stop();
    }

    /// Waits until the pipe's buffer is drained, then stops.
    pub async fn stop_when_idle(&self) {
        while !self.pipe.idle() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.stop();
    }

    /// Runs the handler chain for one message, stopping at the first error.
    async fn dispatch(&self, message: &Message) -> Dispatch {
        let handlers: Vec<_> = self.handlers.read().clone();
        for (index, handler) in handlers.iter().enumerate() {
            if let Err(error) = handler.handle(message).await {
                return Dispatch::Failed { index, error };
            }
        }
        Dispatch::Success
    }

    async fn handle_message(&self, message: &Message) {
        let step = self.pipe.step().to_string();
        debug!(step = %step, id = %message.id, "handling message");

        match self.dispatch(message).await {
            Dispatch::Success => {
                let logged = self
                    .try_log(&message.id, LOG_SUCCESS, &format!("completed step {step}"))
                    .await;
                if logged || !self.options.strict_logging {
                    self.try_complete(&message.id).await;
                }
            }
            Dispatch::Failed { index, error } => {
                let logged = self
                    .try_log(
                        &message.id,
                        LOG_FAILURE,
                        &format!("failed to complete handler {index}, with error {error:#}"),
                    )
                    .await;

                let error_handlers: Vec<_> = self.error_handlers.read().clone();
                if !error_handlers.is_empty() {
                    for handler in &error_handlers {
                        handler.on_error(message, &error).await;
                    }
                    return;
                }

                if self.options.strict_logging && !logged {
                    return;
                }
                if self.options.complete_on_error {
                    self.try_complete(&message.id).await;
                } else if self.options.ack_on_error {
                    self.try_ack(&message.id).await;
                }
            }
        }
    }

    async fn try_log(&self, id: &str, code: i32, text: &str) -> bool {
        match self.pipe.log(id, code, text).await {
            Ok(()) => true,
            Err(error) => {
                warn!(id = %id, error = %error, "failed to append route log");
                false
            }
        }
    }

    async fn try_complete(&self, id: &str) {
        if let Err(error) = self.pipe.complete(id).await {
            warn!(id = %id, error = %error, "failed to complete message");
        }
    }

    async fn try_ack(&self, id: &str) {
        if let Err(error) = self.pipe.ack(id).await {
            warn!(id = %id, error = %error, "failed to ack message");
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("step", &self.pipe.step())
            .field("handlers", &self.handlers.read().len())
            .field("error_handlers", &self.error_handlers.read().len())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}
