use thiserror::Error;

/// Error surface for the scheduler runtimes.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(#[from] confsync_core::ConfigError),

    #[error("resource error: {0}")]
    Resource(#[from] confsync_template::ResourceError),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("scheduler task panicked: {0}")]
    Join(String),
}
