use crate::{
    error::{ModError, Result},
    http::HttpClient,
    version::pick_latest_tag,
};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct Commit {
    sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSource {
    Release,
    Tag,
    Commit { git_ref: String },
}

/// The version token of a repository and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVersion {
    pub token: String,
    pub source: VersionSource,
}

#[derive(Clone)]
pub struct GitHubClient {
    http: HttpClient,
    api_base: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(http: HttpClient, api_base: &str, token: Option<String>) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Version token without downloading the payload: the commit of a pinned
    /// ref, else the latest release, else the highest tag, else the default
    /// branch HEAD.
    pub fn resolve_version(&self, owner: &str, repo: &str, git_ref: Option<&str>) -> Result<RemoteVersion> {
        if let Some(git_ref) = git_ref {
            return Ok(RemoteVersion {
                token: self.commit_sha(owner, repo, git_ref)?,
                source: VersionSource::Commit {
                    git_ref: git_ref.to_string(),
                },
            });
        }

        if let Some(tag) = self.latest_release_tag(owner, repo)? {
            return Ok(RemoteVersion {
                token: tag,
                source: VersionSource::Release,
            });
        }

        let tags = self.tags(owner, repo)?;
        if let Some(tag) = pick_latest_tag(&tags) {
            return Ok(RemoteVersion {
                token: tag.to_string(),
                source: VersionSource::Tag,
            });
        }

        let branch = self.default_branch(owner, repo)?;
        Ok(RemoteVersion {
            token: self.commit_sha(owner, repo, &branch)?,
            source: VersionSource::Commit { git_ref: branch },
        })
    }

    pub fn latest_release_tag(&self, owner: &str, repo: &str) -> Result<Option<String>> {
        match self.get_json::<Release>(&format!("/repos/{owner}/{repo}/releases/latest")) {
            Ok(release) if release.prerelease || release.draft => Ok(None),
            Ok(release) => Ok(Some(release.tag_name)),
            Err(ModError::Fetch {
                status: Some(404), ..
            }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn tags(&self, owner: &str, repo: &str) -> Result<Vec<String>> {
        let tags: Vec<Tag> = self.get_json(&format!("/repos/{owner}/{repo}/tags?per_page=100"))?;
        Ok(tags.into_iter().map(|tag| tag.name).collect())
    }

    pub fn default_branch(&self, owner: &str, repo: &str) -> Result<String> {
        let repository: Repository = self.get_json(&format!("/repos/{owner}/{repo}"))?;
        Ok(repository.default_branch)
    }

    pub fn commit_sha(&self, owner: &str, repo: &str, git_ref: &str) -> Result<String> {
        let commit: Commit = self.get_json(&format!("/repos/{owner}/{repo}/commits/{git_ref}"))?;
        Ok(commit.sha)
    }

    pub fn archive_url(&self, owner: &str, repo: &str, token: &str) -> String {
        format!("{}/repos/{owner}/{repo}/zipball/{token}", self.api_base)
    }

    pub fn download_archive(&self, owner: &str, repo: &str, token: &str) -> Result<Vec<u8>> {
        let url = self.archive_url(owner, repo, token);
        Ok(self.http.get(&url, &self.headers())?.body)
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Accept".to_string(), "application/vnd.github+json".to_string()),
            ("X-GitHub-Api-Version".to_string(), "2022-11-28".to_string()),
        ];
        if let Some(token) = &self.token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        headers
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.api_base);
        debug!(url, "github api request");
        let response = self.http.get(&url, &self.headers())?;
        serde_json::from_slice(&response.body).map_err(|err| ModError::Fetch {
            url,
            message: "unexpected response from GitHub".to_string(),
            status: Some(response.status),
            retryable: false,
            cause: Some(Box::new(err)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RetryPolicy,
        error::ErrorKind,
        http::{testing::ScriptedTransport, HttpResponse},
    };
    use std::sync::Arc;

    const API: &str = "https://api.test";

    fn client(transport: &Arc<ScriptedTransport>) -> GitHubClient {
        let http = HttpClient::new(transport.clone(), RetryPolicy::none());
        GitHubClient::new(http, API, None)
    }

    #[test]
    fn prefers_latest_release() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            &format!("{API}/repos/o/r/releases/latest"),
            HttpResponse::new(200, r#"{"tag_name":"v1.2","prerelease":false}"#),
        );
        let version = client(&transport).resolve_version("o", "r", None).unwrap();
        assert_eq!(version.token, "v1.2");
        assert_eq!(version.source, VersionSource::Release);
    }

    #[test]
    fn falls_back_to_tags_then_default_branch() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            &format!("{API}/repos/o/r/tags?per_page=100"),
            HttpResponse::new(200, r#"[{"name":"v0.9"},{"name":"v0.10"}]"#),
        );
        let version = client(&transport).resolve_version("o", "r", None).unwrap();
        assert_eq!(version.token, "v0.10");
        assert_eq!(version.source, VersionSource::Tag);

        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(&format!("{API}/repos/o/r/tags?per_page=100"), HttpResponse::new(200, "[]"));
        transport.respond(
            &format!("{API}/repos/o/r"),
            HttpResponse::new(200, r#"{"default_branch":"main"}"#),
        );
        transport.respond(
            &format!("{API}/repos/o/r/commits/main"),
            HttpResponse::new(200, r#"{"sha":"0a1b2c3d"}"#),
        );
        let version = client(&transport).resolve_version("o", "r", None).unwrap();
        assert_eq!(version.token, "0a1b2c3d");
        assert_eq!(
            version.source,
            VersionSource::Commit {
                git_ref: "main".to_string()
            }
        );
    }

    #[test]
    fn pinned_ref_resolves_to_its_commit() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            &format!("{API}/repos/o/r/commits/dev"),
            HttpResponse::new(200, r#"{"sha":"ffee"}"#),
        );
        let version = client(&transport).resolve_version("o", "r", Some("dev")).unwrap();
        assert_eq!(version.token, "ffee");
        assert_eq!(transport.hits(&format!("{API}/repos/o/r/releases/latest")), 0);
    }

    #[test]
    fn rate_limit_surfaces_unchanged() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            &format!("{API}/repos/o/r/releases/latest"),
            HttpResponse::new(403, r#"{"message":"API rate limit exceeded"}"#)
                .with_header("x-ratelimit-remaining", "0")
                .with_header("x-ratelimit-reset", "0"),
        );
        let err = client(&transport).resolve_version("o", "r", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }
}
