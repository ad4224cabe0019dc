use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("syscall failed: {0}")]
    Nix(#[from] nix::Error),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("tuntap device setup failed: {0}")]
    TunSetup(String),
}
