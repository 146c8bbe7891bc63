use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("duplicate in-flight job for fingerprint {fingerprint}")]
    DuplicateJobInFlight { fingerprint: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("invalid transition: job {job_id} is {from}, cannot move to {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("job cancelled: {0}")]
    Cancelled(String),

    #[error("processing failure: {0}")]
    Processing(String),
}

impl EngineError {
    /// True for the refusal a client can resolve by awaiting the other job
    /// instead of retrying.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateJobInFlight { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_is_distinguishable() {
        let err = EngineError::DuplicateJobInFlight {
            fingerprint: "abc123".into(),
        };
        assert!(err.is_duplicate());
        assert!(err.to_string().contains("abc123"));

        let other = EngineError::Processing("boom".into());
        assert!(!other.is_duplicate());
    }

    #[test]
    fn display_carries_detail() {
        let err = EngineError::InvalidTransition {
            job_id: "j1".into(),
            from: "COMPLETED".into(),
            to: "CANCELLED".into(),
        };
        let text = err.to_string();
        assert!(text.contains("j1"));
        assert!(text.contains("COMPLETED"));
    }
}
