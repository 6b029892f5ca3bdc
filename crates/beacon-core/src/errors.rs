/// Invariant violations on the shared versioned state.
///
/// These are fatal: callers are expected to abort rather than keep serving
/// a counter that can no longer advance.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("version counter overflow at {0}")]
    VersionOverflow(u64),
}

impl StateError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::VersionOverflow(_) => "version_overflow",
        }
    }
}
