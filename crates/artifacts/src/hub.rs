//! Minimal repository-host client.
//!
//! The host is assumed to answer three things: repo metadata (current
//! revision plus file list), a tree query with per-file byte sizes, and
//! per-file binary GETs that honor `Range` for resume. A bearer token from
//! `HF_TOKEN` is attached when present.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use lmn_domain::{Error, Result};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Connect timeout for every request; transfers themselves are unbounded
/// and watched by the low-speed watchdog instead.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    /// Revision identifier recorded in `refs/main`.
    pub sha: String,
    #[serde(default)]
    pub siblings: Vec<Sibling>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sibling {
    pub rfilename: String,
}

impl RepoInfo {
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.siblings.iter().map(|s| s.rfilename.clone()).collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "type", default)]
    kind: String,
}

pub struct HubClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HubClient {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("building hub client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: lmn_domain::config::env::hf_token(),
        })
    }

    /// Repo metadata: current revision and file list.
    pub async fn repo_info(&self, repo_id: &str) -> Result<RepoInfo> {
        let url = format!("{}/api/models/{repo_id}", self.endpoint);
        let resp = self.get(&url).await?;
        resp.json().await.map_err(|e| {
            Error::Http(format!("parsing repo metadata for {repo_id}: {e}"))
        })
    }

    /// Per-file byte sizes at a revision. Missing sizes stay absent so the
    /// validator only checks what the host declared.
    pub async fn tree_sizes(&self, repo_id: &str, revision: &str) -> Result<HashMap<String, u64>> {
        let url = format!(
            "{}/api/models/{repo_id}/tree/{revision}?recursive=true",
            self.endpoint
        );
        let resp = self.get(&url).await?;
        let entries: Vec<TreeEntry> = resp.json().await.map_err(|e| {
            Error::Http(format!("parsing tree for {repo_id}@{revision}: {e}"))
        })?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind != "directory" && e.size > 0)
            .map(|e| (e.path, e.size))
            .collect())
    }

    /// The binary GET URL for one file at one revision.
    pub fn file_url(&self, repo_id: &str, revision: &str, path: &str) -> String {
        format!("{}/{repo_id}/resolve/{revision}/{path}", self.endpoint)
    }

    /// Ranged binary GET; `offset > 0` asks the host to resume.
    pub async fn get_file(&self, url: &str, offset: u64) -> Result<reqwest::Response> {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if offset > 0 {
            req = req.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Http(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!("GET {url}: HTTP {}", resp.status())));
        }
        Ok(resp)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Http(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!("GET {url}: HTTP {}", resp.status())));
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_url_shape() {
        let hub = HubClient::with_endpoint("https://hub.example").unwrap();
        assert_eq!(
            hub.file_url("org/repo", "abc123", "sub/model.gguf"),
            "https://hub.example/org/repo/resolve/abc123/sub/model.gguf"
        );
    }

    #[test]
    fn repo_info_parses_siblings_sorted() {
        let raw = r#"{"sha": "abc", "siblings": [{"rfilename": "b.gguf"}, {"rfilename": "a.gguf"}]}"#;
        let info: RepoInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.sha, "abc");
        assert_eq!(info.file_names(), vec!["a.gguf", "b.gguf"]);
    }
}
