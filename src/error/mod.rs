use std::io;

/// Errors in throttle
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configure: {0}")]
    Config(String),
    /// Non-blocking submission found the queue at `max_queue_depth`.
    #[error("Admission queue is full")]
    QueueFull,
    /// The throttle stopped before the request could be admitted.
    #[error("Throttle canceled")]
    Canceled,
    #[error("Fail to decode config: {0}")]
    Decode(String),
    /// Error reading a config file.
    #[error("Filesys I/O: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

/// Format an error message as a `Config` error, logging it on the way out
macro_rules! err_config {
    ($($fmt_args:tt)*) => {{
        let msg = format!($($fmt_args)*);
        log::error!("{msg}");
        $crate::error::Error::Config(msg)
    }};
}
pub(crate) use err_config;
