//! Where the leaderboard reads submissions from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const GITHUB_API: &str = "https://api.github.com";

/// Error type for leaderboard sources and output
#[derive(Debug, Error)]
pub enum LeaderboardError {
    #[error("GITHUB_REPOSITORY is not set")]
    MissingRepository,
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Cannot address {0} as a URL")]
    InvalidUrl(String),
    #[error("Unexpected listing for {path}: {reason}")]
    Listing { path: String, reason: String },
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    /// `dir` or `file`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl ListingEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == "dir"
    }

    pub fn is_file(&self) -> bool {
        self.kind == "file"
    }
}

/// Read access to a submission tree addressed by `/`-separated paths
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubmissionSource: Send + Sync {
    /// Directory entries; a missing directory lists as empty
    async fn list(&self, path: &str) -> Result<Vec<ListingEntry>, LeaderboardError>;

    /// Parsed JSON file, or `None` when the file does not exist
    async fn read_json(&self, path: &str) -> Result<Option<Value>, LeaderboardError>;
}

/// GitHub contents API on one branch
pub struct GithubContents {
    client: reqwest::Client,
    api: String,
    repository: String,
    reference: String,
}

impl GithubContents {
    pub fn new(repository: &str, reference: &str, token: Option<&str>, timeout: Duration) -> Result<Self, LeaderboardError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static("2022-11-28"));
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| LeaderboardError::Listing {
                path: "GITHUB_TOKEN".to_string(),
                reason: e.to_string(),
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("energy-testbed/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            api: GITHUB_API.to_string(),
            repository: repository.to_string(),
            reference: reference.to_string(),
        })
    }

    /// Configure from `GITHUB_REPOSITORY`, `GITHUB_REF_NAME` and `GITHUB_TOKEN`
    pub fn from_env(timeout: Duration) -> Result<Self, LeaderboardError> {
        let repository = std::env::var("GITHUB_REPOSITORY")
            .ok()
            .filter(|r| !r.is_empty())
            .ok_or(LeaderboardError::MissingRepository)?;
        let reference = std::env::var("GITHUB_REF_NAME")
            .ok()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "main".to_string());
        let token = std::env::var("GITHUB_TOKEN").ok();
        Self::new(&repository, &reference, token.as_deref(), timeout)
    }

    /// `{api}/repos/{owner}/{repo}/contents/{path}` with every segment escaped
    fn contents_url(&self, path: &str) -> Result<Url, LeaderboardError> {
        let mut url = Url::parse(&self.api).map_err(|_| LeaderboardError::InvalidUrl(self.api.clone()))?;
        url.path_segments_mut()
            .map_err(|_| LeaderboardError::InvalidUrl(self.api.clone()))?
            .pop_if_empty()
            .push("repos")
            .extend(self.repository.split('/'))
            .push("contents")
            .extend(path.split('/').filter(|part| !part.is_empty()));
        Ok(url)
    }

    async fn contents(&self, path: &str) -> Result<Option<Value>, LeaderboardError> {
        let url = self.contents_url(path)?;
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .query(&[("ref", self.reference.as_str())])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json::<Value>().await?))
    }
}

#[async_trait]
impl SubmissionSource for GithubContents {
    async fn list(&self, path: &str) -> Result<Vec<ListingEntry>, LeaderboardError> {
        match self.contents(path).await? {
            None => Ok(Vec::new()),
            Some(listing @ Value::Array(_)) => Ok(serde_json::from_value(listing)?),
            Some(_) => Err(LeaderboardError::Listing {
                path: path.to_string(),
                reason: "not a directory".to_string(),
            }),
        }
    }

    async fn read_json(&self, path: &str) -> Result<Option<Value>, LeaderboardError> {
        let Some(meta) = self.contents(path).await? else {
            return Ok(None);
        };
        let Some(url) = meta.get("download_url").and_then(Value::as_str) else {
            return Ok(None);
        };
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(Some(response.json::<Value>().await?))
    }
}

/// A checked-out submission tree on disk
pub struct LocalTree {
    root: PathBuf,
}

impl LocalTree {
    /// `root` is the directory that contains `submission/`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> LeaderboardError {
    LeaderboardError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl SubmissionSource for LocalTree {
    async fn list(&self, path: &str) -> Result<Vec<ListingEntry>, LeaderboardError> {
        let dir = self.resolve(path);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let file_type = entry.file_type().await.map_err(|e| io_error(&entry.path(), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let (kind, download_url) = if file_type.is_dir() {
                ("dir", None)
            } else {
                ("file", Some(format!("{}/{}", path.trim_end_matches('/'), name)))
            };
            entries.push(ListingEntry {
                name,
                kind: kind.to_string(),
                download_url,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read_json(&self, path: &str) -> Result<Option<Value>, LeaderboardError> {
        let file = self.resolve(path);
        match tokio::fs::read_to_string(&file).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&file, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_listing_entry_from_github_json() {
        let entries: Vec<ListingEntry> = serde_json::from_str(
            r#"[{"name": "alice", "type": "dir", "download_url": null, "sha": "abc"},
                {"name": "manifest.json", "type": "file", "download_url": "https://raw.example/m.json"}]"#,
        )
        .unwrap();
        assert!(entries[0].is_dir());
        assert!(entries[1].is_file());
        assert_eq!(entries[1].download_url.as_deref(), Some("https://raw.example/m.json"));
    }

    #[test]
    fn test_contents_url_escapes_segments() {
        let github = GithubContents::new("owner/repo", "main", None, Duration::from_secs(1)).unwrap();

        let url = github.contents_url("submission/a#x/r?1").unwrap();
        assert_eq!(url.path(), "/repos/owner/repo/contents/submission/a%23x/r%3F1");
        assert_eq!(url.fragment(), None);
        assert_eq!(url.query(), None);

        let url = github.contents_url("submission").unwrap();
        assert_eq!(url.as_str(), "https://api.github.com/repos/owner/repo/contents/submission");
    }

    #[tokio::test]
    async fn test_local_tree_listing_and_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let run = tmp.path().join("submission/alice/run-1");
        fs::create_dir_all(run.join("energy")).unwrap();
        fs::write(run.join("manifest.json"), r#"{"run_id": "run-1"}"#).unwrap();

        let tree = LocalTree::new(tmp.path());
        let users = tree.list("submission").await.unwrap();
        assert_eq!(users.len(), 1);
        assert!(users[0].is_dir());

        let files = tree.list("submission/alice/run-1").await.unwrap();
        let names: Vec<&str> = files.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["energy", "manifest.json"]);
        assert_eq!(
            files[1].download_url.as_deref(),
            Some("submission/alice/run-1/manifest.json")
        );

        let manifest = tree.read_json("submission/alice/run-1/manifest.json").await.unwrap();
        assert_eq!(manifest.unwrap()["run_id"], "run-1");
        assert!(tree.read_json("submission/alice/missing.json").await.unwrap().is_none());
        assert!(tree.list("submission/nobody").await.unwrap().is_empty());
    }
}
