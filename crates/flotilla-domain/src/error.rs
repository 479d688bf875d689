use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid owner reference: {0}")]
    InvalidOwnerRef(String),

    #[error("invalid resource name: {0}")]
    InvalidResourceName(String),

    #[error("invalid OS image reference: {0}")]
    InvalidImageRef(String),

    #[error("invalid cron schedule '{schedule}': {message}")]
    InvalidSchedule { schedule: String, message: String },

    #[error("invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("invalid config provider '{provider}': {message}")]
    InvalidConfigProvider { provider: String, message: String },

    #[error("invalid application '{name}': {message}")]
    InvalidApplication { name: String, message: String },

    #[error("invalid rollout policy: {0}")]
    InvalidRolloutPolicy(String),

    #[error("invalid batch limit: {0}")]
    InvalidBatchLimit(String),

    #[error("invalid repository spec: {0}")]
    InvalidRepositorySpec(String),

    #[error("multiple validation errors")]
    Multiple(Vec<DomainError>),
}

impl DomainError {
    /// Collapse a list of validation errors into a single error, if any.
    pub fn from_errors(mut errors: Vec<DomainError>) -> Result<(), DomainError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DomainError::Multiple(errors)),
        }
    }

    /// Flattened human-readable message, joining nested errors.
    pub fn describe(&self) -> String {
        match self {
            DomainError::Multiple(errors) => errors
                .iter()
                .map(|e| e.describe())
                .collect::<Vec<_>>()
                .join("; "),
            other => other.to_string(),
        }
    }
}
