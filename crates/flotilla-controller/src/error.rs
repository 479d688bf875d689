use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Store(#[from] flotilla_store::StoreError),

    #[error("render error: {0}")]
    Render(#[from] flotilla_render::RenderError),

    #[error("repository error: {0}")]
    Repo(#[from] flotilla_repo::RepoError),

    #[error("manifest error: {0}")]
    Manifest(#[from] flotilla_manifest::ManifestError),

    #[error("domain error: {0}")]
    Domain(#[from] flotilla_domain::DomainError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Optimistic-concurrency losers requeue instead of counting as
    /// failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Store(e) if e.is_conflict())
    }
}
