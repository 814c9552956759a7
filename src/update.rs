use crate::{
    error::{ModError, Result},
    registry::{ModEntry, ModOrigin},
    source::SourceResolver,
    version::is_update,
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate { version: String },
    UpdateAvailable { current: String, latest: String },
}

impl UpdateStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, UpdateStatus::UpdateAvailable { .. })
    }

    pub fn latest(&self) -> &str {
        match self {
            UpdateStatus::UpToDate { version } => version,
            UpdateStatus::UpdateAvailable { latest, .. } => latest,
        }
    }

    fn compare(current: &str, latest: String) -> Self {
        if is_update(current, &latest) {
            UpdateStatus::UpdateAvailable {
                current: current.to_string(),
                latest,
            }
        } else {
            UpdateStatus::UpToDate {
                version: current.to_string(),
            }
        }
    }
}

pub type CheckResult = Result<UpdateStatus>;

/// Cancels a running batch as a whole or one entry at a time. Checks only read
/// remote state, so a cancelled entry simply reports `Cancelled`.
#[derive(Debug, Clone, Default)]
pub struct CheckCancel {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    all: AtomicBool,
    ids: Mutex<HashSet<String>>,
}

impl CheckCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_all(&self) {
        self.inner.all.store(true, Ordering::SeqCst);
    }

    pub fn cancel(&self, id: &str) {
        self.inner
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.inner.all.load(Ordering::SeqCst)
            || self
                .inner
                .ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(id)
    }
}

pub struct UpdateChecker {
    resolver: SourceResolver,
    concurrency: usize,
    github_limited: Mutex<Option<(String, Option<Duration>)>>,
}

impl UpdateChecker {
    pub fn new(resolver: SourceResolver, concurrency: usize) -> Self {
        Self {
            resolver,
            concurrency: concurrency.max(1),
            github_limited: Mutex::new(None),
        }
    }

    /// Compares one entry against its origin. GitHub origins only fetch the
    /// version token; direct URLs are downloaded again and compared by checksum.
    pub fn check(&self, entry: &ModEntry) -> CheckResult {
        match &entry.origin {
            ModOrigin::Local => Err(ModError::invalid_source(
                entry.id.clone(),
                "mod has no remote origin",
            )),
            ModOrigin::GithubRepo {
                owner,
                repo,
                git_ref,
            } => {
                if let Some((url, retry_after)) = self.limited().clone() {
                    return Err(ModError::RateLimited { url, retry_after });
                }
                let remote = self
                    .resolver
                    .github()
                    .resolve_version(owner, repo, git_ref.as_deref())
                    .inspect_err(|err| {
                        if let ModError::RateLimited { url, retry_after } = err {
                            *self.limited() = Some((url.clone(), *retry_after));
                        }
                    })?;
                Ok(UpdateStatus::compare(&entry.version, remote.token))
            }
            ModOrigin::DirectUrl { .. } => {
                let staged = self.resolver.resolve_origin(&entry.origin)?;
                if staged.checksum == entry.checksum {
                    Ok(UpdateStatus::UpToDate {
                        version: entry.version.clone(),
                    })
                } else {
                    Ok(UpdateStatus::UpdateAvailable {
                        current: entry.version.clone(),
                        latest: staged.checksum.clone(),
                    })
                }
            }
        }
    }

    /// Checks every entry with at most `concurrency` requests in flight. One
    /// failing entry never stops the others.
    pub fn check_all(&self, entries: &[ModEntry], cancel: &CheckCancel) -> BTreeMap<String, CheckResult> {
        *self.limited() = None;
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();
        let workers = self.concurrency.min(entries.len());

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(entry) = entries.get(index) else {
                        break;
                    };
                    let result = if cancel.is_cancelled(&entry.id) {
                        Err(ModError::Cancelled)
                    } else {
                        let result = self.check(entry);
                        if cancel.is_cancelled(&entry.id) {
                            Err(ModError::Cancelled)
                        } else {
                            result
                        }
                    };
                    debug!(id = %entry.id, ok = result.is_ok(), "checked mod");
                    if tx.send((entry.id.clone(), result)).is_err() {
                        break;
                    }
                });
            }
        });
        drop(tx);

        let results: BTreeMap<String, CheckResult> = rx.into_iter().collect();
        let available = results
            .values()
            .filter(|result| matches!(result, Ok(status) if status.is_available()))
            .count();
        let failed = results.values().filter(|result| result.is_err()).count();
        if failed > 0 {
            warn!(failed, "some update checks failed");
        }
        info!(checked = results.len(), available, "update check finished");
        results
    }

    fn limited(&self) -> std::sync::MutexGuard<'_, Option<(String, Option<Duration>)>> {
        self.github_limited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RetryPolicy,
        error::ErrorKind,
        github::GitHubClient,
        http::{testing::ScriptedTransport, HttpClient, HttpResponse},
        registry::testing::entry,
    };
    use std::path::Path;

    const API: &str = "https://api.test";

    fn checker(transport: &Arc<ScriptedTransport>, staging: &Path) -> UpdateChecker {
        let http = HttpClient::new(transport.clone(), RetryPolicy::none());
        let github = GitHubClient::new(http.clone(), API, None);
        UpdateChecker::new(SourceResolver::new(http, github, staging.to_path_buf()), 2)
    }

    fn github_entry(id: &str, repo: &str, version: &str) -> ModEntry {
        let mut entry = entry(id, &[format!("{id}/").as_str()]);
        entry.origin = ModOrigin::GithubRepo {
            owner: "o".to_string(),
            repo: repo.to_string(),
            git_ref: None,
        };
        entry.version = version.to_string();
        entry
    }

    fn release(transport: &ScriptedTransport, repo: &str, tag: &str) {
        transport.respond(
            &format!("{API}/repos/o/{repo}/releases/latest"),
            HttpResponse::new(200, format!(r#"{{"tag_name":"{tag}"}}"#)),
        );
    }

    #[test]
    fn newer_release_is_offered_and_same_tag_is_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        release(&transport, "moved", "v1.2");
        release(&transport, "same", "v1.0");
        let checker = checker(&transport, dir.path());

        assert_eq!(
            checker.check(&github_entry("a", "moved", "v1.0")).unwrap(),
            UpdateStatus::UpdateAvailable {
                current: "v1.0".to_string(),
                latest: "v1.2".to_string(),
            }
        );
        assert_eq!(
            checker.check(&github_entry("b", "same", "v1.0")).unwrap(),
            UpdateStatus::UpToDate {
                version: "v1.0".to_string()
            }
        );
    }

    #[test]
    fn direct_url_compares_content_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let url = "https://example.com/tabs.css";
        transport.respond(url, HttpResponse::new(200, "tab { color: red }"));
        transport.respond(url, HttpResponse::new(200, "tab { color: red }"));
        transport.respond(url, HttpResponse::new(200, "tab { color: blue }"));
        let checker = checker(&transport, &dir.path().join("staging"));

        let staged = checker
            .resolver
            .resolve_origin(&ModOrigin::DirectUrl { url: url.to_string() })
            .unwrap();
        let mut installed = entry("tabs", &["tabs.css"]);
        installed.origin = staged.origin.clone();
        installed.checksum = staged.checksum.clone();
        installed.version = staged.version.clone();
        drop(staged);

        assert!(!checker.check(&installed).unwrap().is_available());

        let status = checker.check(&installed).unwrap();
        assert!(status.is_available());
        assert_ne!(status.latest(), installed.checksum);
    }

    #[test]
    fn batch_reports_each_entry_independently() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        release(&transport, "one", "v2.0");
        release(&transport, "two", "v1.0");
        transport.respond(&format!("{API}/repos/o/broken/releases/latest"), HttpResponse::new(500, ""));
        let checker = checker(&transport, dir.path());

        let entries = vec![
            github_entry("one", "one", "v1.0"),
            github_entry("broken", "broken", "v1.0"),
            github_entry("two", "two", "v1.0"),
            entry("local", &["local.css"]),
        ];
        let results = checker.check_all(&entries, &CheckCancel::new());

        assert_eq!(results.len(), 4);
        assert!(results["one"].as_ref().unwrap().is_available());
        assert!(!results["two"].as_ref().unwrap().is_available());
        assert_eq!(results["broken"].as_ref().unwrap_err().kind(), ErrorKind::FetchError);
        assert_eq!(results["local"].as_ref().unwrap_err().kind(), ErrorKind::InvalidSource);
    }

    #[test]
    fn cancelled_entries_report_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        release(&transport, "one", "v2.0");
        release(&transport, "two", "v2.0");
        let checker = checker(&transport, dir.path());
        let entries = vec![github_entry("one", "one", "v1.0"), github_entry("two", "two", "v1.0")];

        let cancel = CheckCancel::new();
        cancel.cancel("two");
        let results = checker.check_all(&entries, &cancel);
        assert!(results["one"].is_ok());
        assert_eq!(results["two"].as_ref().unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(transport.hits(&format!("{API}/repos/o/two/releases/latest")), 0);

        cancel.cancel_all();
        let results = checker.check_all(&entries, &cancel);
        assert!(results.values().all(|result| result.is_err()));
    }

    #[test]
    fn rate_limit_stops_further_github_requests() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            &format!("{API}/repos/o/one/releases/latest"),
            HttpResponse::new(429, "").with_header("Retry-After", "60"),
        );
        release(&transport, "two", "v2.0");
        let http = HttpClient::new(transport.clone(), RetryPolicy::none());
        let github = GitHubClient::new(http.clone(), API, None);
        let checker = UpdateChecker::new(SourceResolver::new(http, github, dir.path().to_path_buf()), 1);

        let entries = vec![github_entry("one", "one", "v1.0"), github_entry("two", "two", "v1.0")];
        let results = checker.check_all(&entries, &CheckCancel::new());
        match results["two"].as_ref().unwrap_err() {
            ModError::RateLimited { retry_after, .. } => {
                assert_eq!(*retry_after, Some(Duration::from_secs(60)))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.hits(&format!("{API}/repos/o/two/releases/latest")), 0);
    }
}
