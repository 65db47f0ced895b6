use std::io;

/// Report a violated internal invariant and abort.
///
/// Used for conditions that can only arise from a broken upstream
/// precondition (malformed descriptors, unregistered dependencies,
/// dispatch through an abstract slot). The release profile aborts on
/// panic, so these never unwind into generated code.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        log::error!("fatal: {message}");
        panic!("fatal: {message}");
    }};
}

/// The collector could not satisfy an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("allocation of {size} bytes failed")]
pub struct AllocError {
    pub size: usize,
}

/// Recoverable failures while building native images.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

impl From<AllocError> for RuntimeError {
    fn from(err: AllocError) -> Self {
        Self::OutOfMemory(err.to_string())
    }
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// Language-level signals raised by the monitor protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("current thread does not own the monitor")]
    IllegalMonitorState,
    #[error("thread interrupted while waiting")]
    Interrupted,
    #[error("monitor table exhausted")]
    OutOfMemory,
}

/// Failures while saving or reloading an ahead-of-time module.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("invalid module magic")]
    BadMagic,
    #[error("unsupported module version {0}")]
    Version(u32),
    #[error("module references unknown class `{0}`")]
    UnknownClass(String),
    #[error("unresolved symbol `{0}`")]
    UnresolvedSymbol(String),
    #[error("malformed module: {0}")]
    Malformed(String),
}
