use std::io;

/// Errors surfaced by cache operations.
///
/// Cache misses and failed stores are *outcomes*, not errors: `read`/`delete`
/// return `None` and `write` returns [`WriteOutcome::NotStored`] for those.
/// Everything here is an actual failure.
///
/// [`WriteOutcome::NotStored`]: crate::WriteOutcome::NotStored
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Rejected configuration (out-of-range sizes, unusable paths).
    #[error("bad cache option: {0}")]
    Config(String),

    /// An OS-level operation on the backing file failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A locked page failed validation. The caller may give up the page's
    /// contents and recover it with `Cache::reformat_page`.
    #[error("page {page} failed validation: {reason}")]
    CorruptPage { page: usize, reason: String },

    /// API misuse: locking while locked, operating without a lock, etc.
    #[error("{0}")]
    Usage(String),
}

impl CacheError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        CacheError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
