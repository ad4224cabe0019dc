use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors surfaced by configuration loading and validation.
///
/// Per-flow runtime errors (transient, peer-closed, fatal-per-connection) are
/// handled inline in `passt-net`/`passt-tap` and never reach this type; only
/// init-time and config-time failures are user-visible.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("toml parse: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
