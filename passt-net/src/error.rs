use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Init-time and resource-exhaustion failures that are user-visible.
/// Per-flow errors (transient / peer-closed / fatal) are handled inline
/// at the connection or port-entry boundary and never constructed as
/// this type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("syscall failed: {0}")]
    Nix(#[from] nix::Error),
    #[error("namespace entry failed: {0}")]
    Namespace(String),
    #[error("connection table full ({0} entries)")]
    TableFull(usize),
    #[error("pipe probing failed below the minimum usable size")]
    PipeProbeExhausted,
}
