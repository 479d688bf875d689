use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use flotilla_domain::RepositorySpec;

use crate::error::RepoError;

/// A successful checkout of one revision.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Resolved commit hash at the fetched revision.
    pub commit: String,
    /// Directory holding the checked-out tree.
    pub checkout: PathBuf,
}

/// Fetches repository content for the sync controller and answers
/// accessibility probes for repository resources.
#[async_trait]
pub trait RepoFetcher: Send + Sync + 'static {
    /// Fetch `revision` and return the resolved commit plus a local checkout.
    async fn fetch(&self, spec: &RepositorySpec, revision: &str)
        -> Result<FetchResult, RepoError>;

    /// Cheap reachability probe; does not materialize a checkout.
    async fn check(&self, spec: &RepositorySpec) -> Result<(), RepoError>;
}

// ── Stub fetcher ─────────────────────────────────────────────────────────────

/// A fetcher that serves pre-registered local directories and performs no
/// I/O. Suitable for tests.
#[derive(Debug, Default)]
pub struct StubFetcher {
    repos: Mutex<HashMap<String, (String, PathBuf)>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the content served for `url`: a commit hash and a local
    /// directory standing in for the checkout.
    pub fn serve(&self, url: impl Into<String>, commit: impl Into<String>, dir: impl Into<PathBuf>) {
        self.repos
            .lock()
            .expect("stub fetcher lock")
            .insert(url.into(), (commit.into(), dir.into()));
    }

    fn lookup(&self, url: &str) -> Result<(String, PathBuf), RepoError> {
        self.repos
            .lock()
            .expect("stub fetcher lock")
            .get(url)
            .cloned()
            .ok_or_else(|| RepoError::Inaccessible {
                url: url.to_string(),
                message: "no such repository registered".to_string(),
            })
    }
}

#[async_trait]
impl RepoFetcher for StubFetcher {
    async fn fetch(
        &self,
        spec: &RepositorySpec,
        _revision: &str,
    ) -> Result<FetchResult, RepoError> {
        let (commit, checkout) = self.lookup(spec.url())?;
        Ok(FetchResult { commit, checkout })
    }

    async fn check(&self, spec: &RepositorySpec) -> Result<(), RepoError> {
        self.lookup(spec.url()).map(|_| ())
    }
}
