/// Verdict of the post-run result callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// All requested datasets were read and persisted.
    LoadSuccessful,
    /// At least one dataset could not be read or persisted.
    LoadFailure,
    /// The realization's report steps disagree with the experiment time map.
    TimeMapFailure,
}

/// Outcome of loading one realization's outputs into storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    /// Overall verdict.
    pub status: LoadStatus,
    /// Accumulated human-readable diagnostics; empty on success.
    pub message: String,
}

impl LoadResult {
    /// A successful result with no diagnostics.
    pub fn success() -> Self {
        Self {
            status: LoadStatus::LoadSuccessful,
            message: String::new(),
        }
    }

    /// A [`LoadStatus::LoadFailure`] result carrying `message`.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: LoadStatus::LoadFailure,
            message: message.into(),
        }
    }

    /// Whether the load succeeded.
    pub fn is_success(&self) -> bool {
        self.status == LoadStatus::LoadSuccessful
    }
}
