//! # Stepline
//!
//! A consumer-side runtime for pull-based, step-oriented message pipelines.
//!
//! Messages travel a declared route of named steps, held by a remote
//! pipeline service. Stepline provides the worker side:
//!
//! - **Pipes**: per-step buffered clients that pre-fetch messages in the
//!   background and expose ack, complete, log, reroute, and decoration
//!   operations with retry-with-backoff on the unreliable edges
//! - **Workers**: ordered handler chains dispatched per message, with
//!   first-failure short-circuiting and a configurable escalation policy
//!   (error handlers, complete-on-error, ack-on-error, or server-side
//!   redelivery)
//! - **Drivers**: a transport trait with an in-process implementation for
//!   tests and an HTTP implementation (behind the `http` feature) for the
//!   real service
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stepline::prelude::*;
//!
//! let driver = Arc::new(HttpDriver::new("https://pipeline.example", api_key));
//! let pipe = Pipe::new(driver, "resize");
//!
//! let worker = Worker::new(pipe, WorkerOptions::default());
//! worker.on_message_fn(|message| async move {
//!     let payload = message.decorated_json()?;
//!     process(&payload).await
//! });
//! worker.run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod driver;
pub mod errors;
pub mod message;
pub mod observability;
pub mod options;
pub mod pipe;
pub mod retry;
pub mod testing;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::driver::{Driver, MemoryDriver};
    pub use crate::errors::{Result, SteplineError};
    pub use crate::message::{
        Decoration, Message, RouteLogEntry, LOG_FAILURE, LOG_SUCCESS,
    };
    pub use crate::options::ReceiveOptions;
    pub use crate::pipe::{Pipe, PipeBuilder};
    pub use crate::retry::{with_retry, Backoff, Jitter, RetryConfig};
    pub use crate::worker::{
        Dispatch, ErrorHandler, FnErrorHandler, FnHandler, HandlerError,
        MessageHandler, Worker, WorkerOptions,
    };

    #[cfg(feature = "http")]
    pub use crate::driver::HttpDriver;
}
