use thiserror::Error;

/// Why a lock could not be taken.
///
/// Contention and connectivity are separate variants; callers typically
/// retry the former and alert on the latter.
#[derive(Debug, Error)]
pub enum Error {
    /// The record stayed held by someone else for the whole wait window.
    #[error("lock `{name}` not acquired within {waited_ms}ms")]
    AcquireTimeout { name: String, waited_ms: u64 },

    /// The key-value backend could not carry out an operation.
    #[error("lock backend unavailable: {0:#}")]
    Backend(anyhow::Error),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Backend(err)
    }
}
