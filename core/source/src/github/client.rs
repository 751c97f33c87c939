//! GitHub REST API client.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use assetsync_common::{Error, Result};

/// Media type requested from the API.
const GITHUB_ACCEPT: &str = "application/vnd.github+json";
/// Pinned REST API version.
const GITHUB_API_VERSION: &str = "2022-11-28";

/// Branch metadata; only the head commit is used.
#[derive(Debug, Clone, Deserialize)]
pub struct Branch {
    pub name: String,
    pub commit: CommitRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitRef {
    pub sha: String,
}

/// One entry of a recursive git tree listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
}

impl TreeEntry {
    pub fn is_blob(&self) -> bool {
        self.kind == "blob"
    }
}

/// Recursive git tree of one commit.
#[derive(Debug, Clone, Deserialize)]
pub struct Tree {
    pub sha: String,
    pub tree: Vec<TreeEntry>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Deserialize)]
struct Blob {
    content: String,
    encoding: String,
}

#[derive(Debug, Deserialize)]
struct ContentFile {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PutContentsResponse {
    content: ContentFile,
}

#[derive(Debug, Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DeleteContentsRequest<'a> {
    message: &'a str,
    sha: &'a str,
    branch: &'a str,
}

/// Outcome of a guarded contents API write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was accepted; carries the new blob sha.
    Written(String),
    /// The API rejected the sha guard (HTTP 409/422).
    Rejected,
}

/// Thin client over the endpoints the source needs.
pub struct GitHubClient {
    http: Client,
    api_url: Url,
    owner: String,
    repo: String,
    token: String,
}

impl GitHubClient {
    /// Create a new client for `owner/repo`.
    ///
    /// # Errors
    /// - `Config` if `api_url` is not a valid base URL or the HTTP client
    ///   cannot be built
    pub fn new(api_url: &str, owner: &str, repo: &str, token: &str) -> Result<Self> {
        let api_url = Url::parse(api_url)
            .map_err(|e| Error::Config(format!("Invalid GitHub API url '{}': {}", api_url, e)))?;
        if api_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "GitHub API url '{}' cannot be used as a base",
                api_url
            )));
        }

        let http = Client::builder()
            .user_agent(concat!("assetsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_url,
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
        })
    }

    /// Build `{api}/repos/{owner}/{repo}/{segments...}` with each segment
    /// percent-encoded.
    pub fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.api_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.push("repos");
            path.push(&self.owner);
            path.push(&self.repo);
            path.extend(segments);
        }
        url
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(url))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(header::ACCEPT, GITHUB_ACCEPT)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
    }

    /// Check the repository is reachable with the configured token.
    pub async fn get_repository(&self) -> Result<serde_json::Value> {
        let mut url = self.api_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(["repos", self.owner.as_str(), self.repo.as_str()]);
        }
        let response = self
            .get(url)
            .send()
            .await
            .map_err(|e| transport("get repository", e))?;
        self.handle_response(response).await
    }

    /// Get branch metadata, including its head commit.
    pub async fn get_branch(&self, branch: &str) -> Result<Branch> {
        let response = self
            .get(self.endpoint(["branches", branch]))
            .send()
            .await
            .map_err(|e| transport("get branch", e))?;
        self.handle_response(response).await
    }

    /// Get the full recursive tree of a commit.
    pub async fn get_tree(&self, commit_sha: &str) -> Result<Tree> {
        let response = self
            .get(self.endpoint(["git", "trees", commit_sha]))
            .query(&[("recursive", "1")])
            .send()
            .await
            .map_err(|e| transport("get tree", e))?;
        self.handle_response(response).await
    }

    /// Download and decode a blob.
    pub async fn get_blob(&self, blob_sha: &str) -> Result<Vec<u8>> {
        let response = self
            .get(self.endpoint(["git", "blobs", blob_sha]))
            .send()
            .await
            .map_err(|e| transport("get blob", e))?;
        let blob: Blob = self.handle_response(response).await?;
        decode_blob(&blob.content, &blob.encoding)
    }

    /// Current blob sha of a file on `branch`, if it exists.
    pub async fn get_content_sha(&self, path: &[String], branch: &str) -> Result<Option<String>> {
        let url = self.endpoint(std::iter::once("contents").chain(path.iter().map(String::as_str)));
        let response = self
            .get(url)
            .query(&[("ref", branch)])
            .send()
            .await
            .map_err(|e| transport("get contents", e))?;

        match self.handle_response::<ContentFile>(response).await {
            Ok(file) => Ok(Some(file.sha)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create or update a file through the contents API.
    ///
    /// `sha == None` creates the file.
    pub async fn put_contents(
        &self,
        path: &[String],
        content: &[u8],
        sha: Option<&str>,
        branch: &str,
        message: &str,
    ) -> Result<WriteOutcome> {
        let url = self.endpoint(std::iter::once("contents").chain(path.iter().map(String::as_str)));
        let body = PutContentsRequest {
            message,
            content: STANDARD.encode(content),
            branch,
            sha,
        };
        let response = self
            .authorize(self.http.put(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport("put contents", e))?;

        if is_guard_rejection(response.status()) {
            return Ok(WriteOutcome::Rejected);
        }
        let put: PutContentsResponse = self.handle_response(response).await?;
        Ok(WriteOutcome::Written(put.content.sha))
    }

    /// Delete a file through the contents API.
    pub async fn delete_contents(
        &self,
        path: &[String],
        sha: &str,
        branch: &str,
        message: &str,
    ) -> Result<WriteOutcome> {
        let url = self.endpoint(std::iter::once("contents").chain(path.iter().map(String::as_str)));
        let body = DeleteContentsRequest {
            message,
            sha,
            branch,
        };
        let response = self
            .authorize(self.http.delete(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport("delete contents", e))?;

        if is_guard_rejection(response.status()) {
            return Ok(WriteOutcome::Rejected);
        }
        let _: serde_json::Value = self.handle_response(response).await?;
        Ok(WriteOutcome::Written(sha.to_string()))
    }

    /// Handle API response and map status codes onto the error taxonomy.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::SourceUnavailable(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound(format!(
                "GitHub resource not found in {}/{}",
                self.owner, self.repo
            )))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(status_error(status, &body))
        }
    }
}

fn transport(operation: &str, e: reqwest::Error) -> Error {
    Error::SourceUnavailable(format!("Failed to {}: {}", operation, e))
}

fn is_guard_rejection(status: StatusCode) -> bool {
    status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY
}

/// Map a non-success, non-404 status to an error.
pub(crate) fn status_error(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED => {
            Error::SourceUnavailable("GitHub rejected the token (401)".to_string())
        }
        StatusCode::FORBIDDEN => Error::SourceUnavailable(format!(
            "GitHub denied access or rate limited the request (403): {}",
            body
        )),
        StatusCode::TOO_MANY_REQUESTS => {
            Error::SourceUnavailable("GitHub rate limit exceeded (429)".to_string())
        }
        s if s.is_server_error() => {
            Error::SourceUnavailable(format!("GitHub server error: {} - {}", s, body))
        }
        s => Error::SourceUnavailable(format!("GitHub API error: {} - {}", s, body)),
    }
}

/// Decode blob content as returned by the git blobs API.
pub(crate) fn decode_blob(content: &str, encoding: &str) -> Result<Vec<u8>> {
    match encoding {
        "base64" => {
            let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            STANDARD
                .decode(compact)
                .map_err(|e| Error::Serialization(format!("Invalid base64 blob: {}", e)))
        }
        "utf-8" | "utf8" => Ok(content.as_bytes().to_vec()),
        other => Err(Error::Serialization(format!(
            "Unsupported blob encoding '{}'",
            other
        ))),
    }
}
