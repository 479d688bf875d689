use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use flotilla_domain::RepositorySpec;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::RepoError;
use crate::fetcher::{FetchResult, RepoFetcher};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches repositories by driving the `git` binary.
///
/// Checkouts are cached under `workdir` keyed by (url, revision); repeated
/// fetches reuse the clone and only refresh the remote. SSH keys and known
/// hosts are materialized as files next to the checkout; HTTP credentials are
/// passed as an auth header and never written to disk.
pub struct GitCliFetcher {
    workdir: PathBuf,
    timeout: Duration,
}

impl GitCliFetcher {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn cache_dir(&self, url: &str, revision: &str) -> PathBuf {
        self.workdir.join(short_digest(&format!("{}\n{}", url, revision)))
    }

    /// Per-spec command configuration: `-c` arguments and environment.
    async fn auth(&self, spec: &RepositorySpec) -> Result<GitAuth, RepoError> {
        let mut auth = GitAuth::default();
        match spec {
            RepositorySpec::Generic { .. } => {}
            RepositorySpec::Http {
                username,
                password,
                tls_verify,
                ..
            } => {
                if let (Some(user), Some(pass)) = (username, password) {
                    let token = base64::engine::general_purpose::STANDARD
                        .encode(format!("{}:{}", user, pass));
                    auth.config
                        .push(format!("http.extraHeader=Authorization: Basic {}", token));
                }
                if !tls_verify {
                    auth.env.push(("GIT_SSL_NO_VERIFY".into(), "true".into()));
                }
            }
            RepositorySpec::Ssh {
                url,
                private_key,
                known_hosts,
            } => {
                let key_dir = self.workdir.join("keys");
                tokio::fs::create_dir_all(&key_dir)
                    .await
                    .map_err(|e| RepoError::Internal(format!("create {:?}: {}", key_dir, e)))?;

                let digest = short_digest(url);
                let key_path = key_dir.join(&digest);
                tokio::fs::write(&key_path, private_key)
                    .await
                    .map_err(|e| RepoError::Internal(format!("write ssh key: {}", e)))?;
                restrict_permissions(&key_path).await?;

                let mut ssh_command = format!("ssh -i {} -o IdentitiesOnly=yes", key_path.display());
                match known_hosts {
                    Some(hosts) => {
                        let hosts_path = key_dir.join(format!("{}.hosts", digest));
                        tokio::fs::write(&hosts_path, hosts)
                            .await
                            .map_err(|e| RepoError::Internal(format!("write known hosts: {}", e)))?;
                        ssh_command
                            .push_str(&format!(" -o UserKnownHostsFile={}", hosts_path.display()));
                    }
                    None => ssh_command.push_str(" -o StrictHostKeyChecking=accept-new"),
                }
                auth.env.push(("GIT_SSH_COMMAND".into(), ssh_command));
            }
        }
        Ok(auth)
    }

    /// Run a git sub-command, capturing stdout. Non-zero exit maps to the
    /// given error constructor with trimmed stderr as the message.
    async fn run_git(
        &self,
        cwd: Option<&Path>,
        auth: &GitAuth,
        args: &[&str],
    ) -> Result<String, RepoError> {
        debug!(?args, cwd = ?cwd, "running git");

        let mut cmd = Command::new("git");
        for config in &auth.config {
            cmd.arg("-c").arg(config);
        }
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // never fall back to interactive credential prompts
            .env("GIT_TERMINAL_PROMPT", "0")
            .envs(auth.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| RepoError::Timeout {
                url: args.last().copied().unwrap_or("").to_string(),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| RepoError::Internal(format!("spawn git: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            warn!(code = output.status.code(), "git exited non-zero");
            return Err(RepoError::Internal(stderr));
        }
        Ok(stdout)
    }
}

#[derive(Debug, Default)]
struct GitAuth {
    config: Vec<String>,
    env: Vec<(String, String)>,
}

fn short_digest(input: &str) -> String {
    let hex = format!("{:x}", Sha256::digest(input.as_bytes()));
    hex[..16].to_string()
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), RepoError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| RepoError::Internal(format!("chmod ssh key: {}", e)))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), RepoError> {
    Ok(())
}

#[async_trait]
impl RepoFetcher for GitCliFetcher {
    async fn fetch(
        &self,
        spec: &RepositorySpec,
        revision: &str,
    ) -> Result<FetchResult, RepoError> {
        let url = spec.url();
        let auth = self.auth(spec).await?;
        let dest = self.cache_dir(url, revision);

        let fetch_failed = |message: String| RepoError::FetchFailed {
            url: url.to_string(),
            revision: revision.to_string(),
            message,
        };

        if !dest.join(".git").exists() {
            tokio::fs::create_dir_all(&dest)
                .await
                .map_err(|e| RepoError::Internal(format!("create {:?}: {}", dest, e)))?;
            self.run_git(Some(&dest), &auth, &["init", "--quiet"])
                .await
                .map_err(|e| fetch_failed(e.to_string()))?;
            self.run_git(Some(&dest), &auth, &["remote", "add", "origin", url])
                .await
                .map_err(|e| fetch_failed(e.to_string()))?;
        } else {
            // url may have changed for a cached (url, revision) collision-free dir;
            // keep the remote current anyway
            self.run_git(Some(&dest), &auth, &["remote", "set-url", "origin", url])
                .await
                .map_err(|e| fetch_failed(e.to_string()))?;
        }

        self.run_git(
            Some(&dest),
            &auth,
            &["fetch", "--depth", "1", "--force", "--quiet", "origin", revision],
        )
        .await
        .map_err(|e| fetch_failed(e.to_string()))?;

        self.run_git(
            Some(&dest),
            &auth,
            &["checkout", "--force", "--detach", "--quiet", "FETCH_HEAD"],
        )
        .await
        .map_err(|e| fetch_failed(e.to_string()))?;

        let commit = self
            .run_git(Some(&dest), &auth, &["rev-parse", "HEAD"])
            .await
            .map_err(|e| fetch_failed(e.to_string()))?
            .trim()
            .to_string();

        Ok(FetchResult {
            commit,
            checkout: dest,
        })
    }

    async fn check(&self, spec: &RepositorySpec) -> Result<(), RepoError> {
        let url = spec.url();
        let auth = self.auth(spec).await?;
        self.run_git(None, &auth, &["ls-remote", "--quiet", url, "HEAD"])
            .await
            .map(|_| ())
            .map_err(|e| RepoError::Inaccessible {
                url: url.to_string(),
                message: e.to_string(),
            })
    }
}
