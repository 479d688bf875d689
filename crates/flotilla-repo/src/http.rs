use std::time::Duration;

use flotilla_domain::RepositorySpec;
use tracing::debug;

use crate::error::RepoError;

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accessibility probes for HTTP repositories: a GET of the configured URL
/// with the spec's credentials and TLS settings. Used by the repository
/// checker; git-over-https fetching goes through the git fetcher instead.
#[derive(Debug, Clone)]
pub struct HttpRepoClient {
    timeout: Duration,
}

impl Default for HttpRepoClient {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl HttpRepoClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn check(&self, spec: &RepositorySpec) -> Result<(), RepoError> {
        let RepositorySpec::Http {
            url,
            username,
            password,
            tls_verify,
        } = spec
        else {
            return Err(RepoError::Internal(
                "http probe on a non-http repository".to_string(),
            ));
        };

        let inaccessible = |message: String| RepoError::Inaccessible {
            url: url.clone(),
            message,
        };

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(!tls_verify)
            .build()
            .map_err(|e| RepoError::Internal(format!("build http client: {}", e)))?;

        let mut request = client.get(url);
        if let (Some(user), Some(pass)) = (username, password) {
            request = request.basic_auth(user, Some(pass));
        }

        debug!(%url, "probing http repository");
        let response = request.send().await.map_err(|e| inaccessible(e.to_string()))?;
        if !response.status().is_success() {
            return Err(inaccessible(format!("status {}", response.status())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_spec(url: String, credentials: Option<(&str, &str)>) -> RepositorySpec {
        RepositorySpec::Http {
            url,
            username: credentials.map(|(u, _)| u.to_string()),
            password: credentials.map(|(_, p)| p.to_string()),
            tls_verify: true,
        }
    }

    #[tokio::test]
    async fn reachable_repository_passes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repo"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpRepoClient::new();
        let spec = http_spec(format!("{}/repo", server.uri()), None);
        assert!(client.check(&spec).await.is_ok());
    }

    #[tokio::test]
    async fn credentials_are_sent_as_basic_auth() {
        let server = MockServer::start().await;
        // base64("ops:hunter2")
        Mock::given(method("GET"))
            .and(path("/repo"))
            .and(header("authorization", "Basic b3BzOmh1bnRlcjI="))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpRepoClient::new();
        let spec = http_spec(format!("{}/repo", server.uri()), Some(("ops", "hunter2")));
        assert!(client.check(&spec).await.is_ok());
    }

    #[tokio::test]
    async fn missing_repository_is_inaccessible() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpRepoClient::new();
        let spec = http_spec(format!("{}/gone", server.uri()), None);
        let err = client.check(&spec).await.unwrap_err();
        assert!(matches!(err, RepoError::Inaccessible { .. }));
    }
}
