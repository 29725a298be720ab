//! Token-bucket admission throttle.
//!
//! Callers ask a [`Throttle`] for permission to proceed at some cost. A single
//! worker task owns the bucket, refills it as time passes and admits requests
//! strictly in the order they were queued.
//!
//! ```no_run
//! use std::time::Duration;
//! use throttle::{Throttle, ThrottleConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> throttle::Result<()> {
//! let throttle = Throttle::new(CancellationToken::new(), ThrottleConfig::default())?;
//! // one token every 100ms, default cost
//! throttle.take(Duration::from_millis(100), None).await?;
//! # Ok(())
//! # }
//! ```
mod bucket;
pub mod config;
mod error;
pub mod options;
mod throttle;
pub mod utils;

pub use crate::bucket::{BucketSnapshot, Rate};
pub use crate::config::ThrottleConfig;
pub use crate::error::{Error, Result};
pub use crate::options::ThrottleOptions;
pub use crate::throttle::{Receipt, Throttle, Ticket};
pub use crate::utils::Json;
