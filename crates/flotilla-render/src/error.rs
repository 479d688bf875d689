use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// Template syntax error, reference to a non-whitelisted field, or an
    /// undefined label key without a default.
    #[error("template error in '{template}': {message}")]
    Template { template: String, message: String },

    #[error("rendered spec is not a valid device spec: {0}")]
    InvalidRenderedSpec(#[from] serde_json::Error),
}
