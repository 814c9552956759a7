use crate::{
    archive::{self, Signature},
    error::{IoContext, ModError, Result},
    github::GitHubClient,
    http::HttpClient,
    payload::{copy_dir, make_temp_dir, strip_single_root, StagedPayload, StagingGuard},
    registry::ModOrigin,
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;
use url::Url;

const ARCHIVE_SUFFIXES: &[&str] = &[
    ".tar.gz", ".tar.bz2", ".tgz", ".tbz2", ".tbz", ".tar", ".zip", ".xpi", ".css",
];

/// What a user-supplied reference points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    SingleFile(PathBuf),
    LocalFolder(PathBuf),
    DirectUrl(String),
    GitHubRepo {
        owner: String,
        repo: String,
        git_ref: Option<String>,
    },
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::SingleFile(_) => "file",
            SourceKind::LocalFolder(_) => "folder",
            SourceKind::DirectUrl(_) => "url",
            SourceKind::GitHubRepo { .. } => "github",
        }
    }
}

/// Classifies `reference`: GitHub repository URL, then any other absolute URL,
/// then an existing directory, then an existing file.
pub fn classify(reference: &str) -> Result<SourceKind> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return Err(ModError::invalid_source(reference, "empty reference"));
    }

    if let Ok(url) = Url::parse(trimmed) {
        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| ModError::invalid_source(reference, "malformed file URL"))?;
            return classify_path(reference, &path);
        }
        if url.has_host() {
            return Ok(match github_target(&url) {
                Some(GitHubTarget::Repo {
                    owner,
                    repo,
                    git_ref,
                }) => SourceKind::GitHubRepo {
                    owner,
                    repo,
                    git_ref,
                },
                Some(GitHubTarget::Raw(raw)) => SourceKind::DirectUrl(raw),
                None => SourceKind::DirectUrl(trimmed.to_string()),
            });
        }
    }

    classify_path(reference, Path::new(trimmed))
}

fn classify_path(reference: &str, path: &Path) -> Result<SourceKind> {
    if path.is_dir() {
        Ok(SourceKind::LocalFolder(path.to_path_buf()))
    } else if path.is_file() {
        Ok(SourceKind::SingleFile(path.to_path_buf()))
    } else {
        Err(ModError::invalid_source(
            reference,
            "not a URL and no such file or directory",
        ))
    }
}

enum GitHubTarget {
    Repo {
        owner: String,
        repo: String,
        git_ref: Option<String>,
    },
    Raw(String),
}

fn github_target(url: &Url) -> Option<GitHubTarget> {
    let host = url.host_str()?.to_ascii_lowercase();
    if host != "github.com" && host != "www.github.com" {
        return None;
    }
    let segments: Vec<&str> = url.path_segments()?.filter(|part| !part.is_empty()).collect();
    let (owner, repo) = match segments.as_slice() {
        [owner, repo, ..] => (owner.to_string(), repo.trim_end_matches(".git").to_string()),
        _ => return None,
    };
    if repo.is_empty() {
        return None;
    }

    match &segments[2..] {
        [] => Some(GitHubTarget::Repo {
            owner,
            repo,
            git_ref: None,
        }),
        ["tree", rest @ ..] if !rest.is_empty() => Some(GitHubTarget::Repo {
            owner,
            repo,
            git_ref: Some(rest.join("/")),
        }),
        ["blob", git_ref, path @ ..] if !path.is_empty() => Some(GitHubTarget::Raw(format!(
            "https://raw.githubusercontent.com/{owner}/{repo}/{git_ref}/{}",
            path.join("/")
        ))),
        _ => None,
    }
}

/// Turns a reference into a [`StagedPayload`] under `staging_root`.
#[derive(Clone)]
pub struct SourceResolver {
    http: HttpClient,
    github: GitHubClient,
    staging_root: PathBuf,
}

impl SourceResolver {
    pub fn new(http: HttpClient, github: GitHubClient, staging_root: PathBuf) -> Self {
        Self {
            http,
            github,
            staging_root,
        }
    }

    pub fn github(&self) -> &GitHubClient {
        &self.github
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn resolve(&self, reference: &str) -> Result<StagedPayload> {
        let kind = classify(reference)?;
        info!(reference, kind = kind.label(), "resolving mod source");
        self.stage(&kind)
    }

    /// Fetches the current content of a remote origin again.
    pub fn resolve_origin(&self, origin: &ModOrigin) -> Result<StagedPayload> {
        let kind = match origin {
            ModOrigin::Local => {
                return Err(ModError::invalid_source(
                    origin.describe(),
                    "mod has no remote origin",
                ))
            }
            ModOrigin::DirectUrl { url } => SourceKind::DirectUrl(url.clone()),
            ModOrigin::GithubRepo {
                owner,
                repo,
                git_ref,
            } => SourceKind::GitHubRepo {
                owner: owner.clone(),
                repo: repo.clone(),
                git_ref: git_ref.clone(),
            },
        };
        self.stage(&kind)
    }

    pub fn stage(&self, kind: &SourceKind) -> Result<StagedPayload> {
        match kind {
            SourceKind::SingleFile(path) => {
                let guard = make_temp_dir(&self.staging_root, "file")?;
                let name = file_name_of(path);
                self.unpack(guard, path, &name, ModOrigin::Local, None)
            }
            SourceKind::LocalFolder(path) => self.stage_folder(path),
            SourceKind::DirectUrl(url) => self.stage_url(url),
            SourceKind::GitHubRepo {
                owner,
                repo,
                git_ref,
            } => self.stage_github(owner, repo, git_ref.as_deref()),
        }
    }

    fn stage_folder(&self, path: &Path) -> Result<StagedPayload> {
        let guard = make_temp_dir(&self.staging_root, "folder")?;
        let content = guard.path().join("content");
        copy_dir(path, &content)?;
        let name = file_name_of(path);
        StagedPayload::seal(guard, content, ModOrigin::Local, None, name)
    }

    fn stage_url(&self, url: &str) -> Result<StagedPayload> {
        let response = self.http.get(url, &[])?;
        if response.body.is_empty() {
            return Err(ModError::fetch_permanent(url, "downloaded file is empty"));
        }

        let guard = make_temp_dir(&self.staging_root, "url")?;
        let name = url_file_name(url);
        let download = write_download(&guard, &name, &response.body)?;
        info!(url, bytes = response.body.len(), "downloaded mod");
        let origin = ModOrigin::DirectUrl {
            url: url.to_string(),
        };
        self.unpack(guard, &download, &name, origin, None)
    }

    fn stage_github(&self, owner: &str, repo: &str, git_ref: Option<&str>) -> Result<StagedPayload> {
        let version = self.github.resolve_version(owner, repo, git_ref)?;
        info!(owner, repo, version = %version.token, "resolved GitHub version");
        let body = self.github.download_archive(owner, repo, &version.token)?;
        if body.is_empty() {
            return Err(ModError::fetch_permanent(
                self.github.archive_url(owner, repo, &version.token),
                "downloaded archive is empty",
            ));
        }

        let guard = make_temp_dir(&self.staging_root, "github")?;
        let download = write_download(&guard, &format!("{repo}.zip"), &body)?;
        let origin = ModOrigin::GithubRepo {
            owner: owner.to_string(),
            repo: repo.to_string(),
            git_ref: git_ref.map(str::to_string),
        };
        self.unpack(guard, &download, repo, origin, Some(version.token))
    }

    /// Extracts an archive or stages a lone stylesheet into `guard/content`.
    fn unpack(
        &self,
        guard: StagingGuard,
        file: &Path,
        name: &str,
        origin: ModOrigin,
        version: Option<String>,
    ) -> Result<StagedPayload> {
        let content = guard.path().join("content");
        match archive::detect(file)? {
            Signature::Archive(_) => {
                archive::extract(file, &content)?;
            }
            Signature::Unsupported(signature) => {
                return Err(ModError::UnsupportedFormat {
                    signature: signature.to_string(),
                })
            }
            Signature::Unknown => {
                if !name.to_ascii_lowercase().ends_with(".css") {
                    return Err(ModError::invalid_source(
                        name,
                        "not a CSS file or a supported archive",
                    ));
                }
                fs::create_dir_all(&content).io_context("create staging content dir")?;
                fs::copy(file, content.join(name)).io_context("stage stylesheet")?;
            }
        }
        let root = strip_single_root(&content)?;
        StagedPayload::seal(guard, root, origin, version, display_stem(name))
    }
}

fn write_download(guard: &StagingGuard, name: &str, body: &[u8]) -> Result<PathBuf> {
    let dir = guard.path().join("download");
    fs::create_dir_all(&dir).io_context("create download dir")?;
    let path = dir.join(name);
    fs::write(&path, body).io_context("write download")?;
    Ok(path)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mod".to_string())
}

/// Last path segment of `url`, made safe to use as a file name.
fn url_file_name(url: &str) -> String {
    let segment = Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| "download".to_string());
    segment
        .chars()
        .map(|ch| if ch.is_alphanumeric() || "._-".contains(ch) { ch } else { '_' })
        .collect()
}

fn display_stem(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    for suffix in ARCHIVE_SUFFIXES {
        if lower.ends_with(suffix) && lower.len() > suffix.len() {
            return name[..name.len() - suffix.len()].to_string();
        }
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        archive::testing::write_zip,
        config::RetryPolicy,
        error::ErrorKind,
        http::{testing::ScriptedTransport, HttpResponse},
    };
    use std::sync::Arc;

    const API: &str = "https://api.test";

    fn resolver(transport: &Arc<ScriptedTransport>, staging: &Path) -> SourceResolver {
        let http = HttpClient::new(transport.clone(), RetryPolicy::none());
        let github = GitHubClient::new(http.clone(), API, None);
        SourceResolver::new(http, github, staging.to_path_buf())
    }

    fn zip_bytes(dir: &Path, entries: &[(&str, &[u8])]) -> Vec<u8> {
        let path = dir.join("fixture.zip");
        write_zip(&path, entries);
        let bytes = fs::read(&path).unwrap();
        fs::remove_file(path).unwrap();
        bytes
    }

    #[test]
    fn classifies_github_urls() {
        assert_eq!(
            classify("https://github.com/MrOtherGuy/firefox-csshacks").unwrap(),
            SourceKind::GitHubRepo {
                owner: "MrOtherGuy".to_string(),
                repo: "firefox-csshacks".to_string(),
                git_ref: None,
            }
        );
        assert_eq!(
            classify("https://www.github.com/o/r.git/tree/release/2.x").unwrap(),
            SourceKind::GitHubRepo {
                owner: "o".to_string(),
                repo: "r".to_string(),
                git_ref: Some("release/2.x".to_string()),
            }
        );
        assert_eq!(
            classify("https://github.com/o/r/blob/main/chrome/tabs.css").unwrap(),
            SourceKind::DirectUrl("https://raw.githubusercontent.com/o/r/main/chrome/tabs.css".to_string())
        );
        assert_eq!(
            classify("https://github.com/o/r/releases/download/v1/theme.zip").unwrap(),
            SourceKind::DirectUrl("https://github.com/o/r/releases/download/v1/theme.zip".to_string())
        );
    }

    #[test]
    fn classifies_paths_and_rejects_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let css = dir.path().join("tabs.css");
        fs::write(&css, "tab {}").unwrap();
        let css_ref = css.to_string_lossy().into_owned();
        let dir_ref = dir.path().to_string_lossy().into_owned();

        assert_eq!(classify(&dir_ref).unwrap(), SourceKind::LocalFolder(dir.path().to_path_buf()));
        assert_eq!(classify(&css_ref).unwrap(), SourceKind::SingleFile(css.clone()));
        assert_eq!(classify(&css_ref).unwrap(), classify(&css_ref).unwrap());
        let file_url = Url::from_file_path(&css).unwrap().to_string();
        assert_eq!(classify(&file_url).unwrap(), SourceKind::SingleFile(css));

        let missing = dir.path().join("nope.css").to_string_lossy().into_owned();
        assert_eq!(classify(&missing).unwrap_err().kind(), ErrorKind::InvalidSource);
        assert_eq!(classify("   ").unwrap_err().kind(), ErrorKind::InvalidSource);
    }

    #[test]
    fn stages_direct_url_zip_with_checksum_version() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let transport = Arc::new(ScriptedTransport::default());
        let url = "https://example.com/files/my-mod.zip";
        transport.respond(
            url,
            HttpResponse::new(
                200,
                zip_bytes(dir.path(), &[("style.css", b"a {}"), ("resources/bg.png", b"png")]),
            ),
        );

        let staged = resolver(&transport, &staging).resolve(url).unwrap();
        assert_eq!(staged.origin, ModOrigin::DirectUrl { url: url.to_string() });
        assert_eq!(staged.entry_points, vec![PathBuf::from("style.css")]);
        assert_eq!(staged.version, staged.checksum);
        assert_eq!(staged.suggested_name, "my-mod");
        assert!(staged.root().join("resources/bg.png").is_file());

        let staging_dir = staged.staging_dir().to_path_buf();
        drop(staged);
        assert!(!staging_dir.exists());
    }

    #[test]
    fn stages_github_repo_after_resolving_version() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            &format!("{API}/repos/o/theme/releases/latest"),
            HttpResponse::new(200, r#"{"tag_name":"v1.0"}"#),
        );
        transport.respond(
            &format!("{API}/repos/o/theme/zipball/v1.0"),
            HttpResponse::new(
                200,
                zip_bytes(
                    dir.path(),
                    &[("o-theme-1a2b/chrome/userChrome.css", b"a {}"), ("o-theme-1a2b/README.md", b"hi")],
                ),
            ),
        );

        let staged = resolver(&transport, &dir.path().join("staging"))
            .resolve("https://github.com/o/theme")
            .unwrap();
        assert_eq!(staged.version, "v1.0");
        assert_eq!(staged.entry_points, vec![PathBuf::from("chrome/userChrome.css")]);
        assert!(staged.root().join("README.md").is_file());
    }

    #[test]
    fn rejects_payloads_without_css_and_empty_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            "https://example.com/icons.zip",
            HttpResponse::new(200, zip_bytes(dir.path(), &[("icon.png", b"png")])),
        );
        transport.respond("https://example.com/empty.css", HttpResponse::new(200, ""));
        transport.respond("https://example.com/page.html", HttpResponse::new(200, "<html>"));
        let resolver = resolver(&transport, &staging);

        let err = resolver.resolve("https://example.com/icons.zip").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSource);
        let err = resolver.resolve("https://example.com/empty.css").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FetchError);
        let err = resolver.resolve("https://example.com/page.html").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSource);

        let leftovers = fs::read_dir(&staging).map(|entries| entries.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn stages_single_stylesheet_and_folder() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let transport = Arc::new(ScriptedTransport::default());
        let resolver = resolver(&transport, &staging);

        let css = dir.path().join("compact-tabs.css");
        fs::write(&css, "tab { height: 24px }").unwrap();
        let staged = resolver.resolve(&css.to_string_lossy()).unwrap();
        assert_eq!(staged.origin, ModOrigin::Local);
        assert_eq!(staged.suggested_name, "compact-tabs");
        assert_eq!(staged.entry_points, vec![PathBuf::from("compact-tabs.css")]);

        let folder = dir.path().join("Sidebery Theme");
        fs::create_dir_all(folder.join(".git")).unwrap();
        fs::write(folder.join(".git/HEAD"), "ref").unwrap();
        fs::write(folder.join("userChrome.css"), "a {}").unwrap();
        let staged = resolver.resolve(&folder.to_string_lossy()).unwrap();
        assert_eq!(staged.suggested_name, "Sidebery Theme");
        assert!(!staged.root().join(".git").exists());
    }
}
