use crate::{
    apply::{Applier, OrphanedBackup, ProfileLayout, RepairOutcome, UpdateReport, VerifyReport},
    config::{AppConfig, PlacementChoice},
    error::{IoContext, ModError, Result},
    github::GitHubClient,
    http::{HttpClient, HttpTransport, UreqTransport},
    payload::now_timestamp,
    registry::{ModEntry, ModRegistry, Placement},
    source::SourceResolver,
    update::{CheckCancel, CheckResult, UpdateChecker},
    userchrome::{self, DesiredImport, USERCHROME_FILE},
};
use std::{collections::BTreeMap, fs, path::Path, sync::Arc};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverAction {
    Restore,
    Discard,
}

/// Work an earlier run left unfinished, found when the profile was opened.
#[derive(Debug, Clone, Default)]
pub struct PendingRecovery {
    /// Backups of updates that never committed; see [`App::recover`].
    pub interrupted_updates: Vec<OrphanedBackup>,
    /// Entries whose removal stopped partway; see [`App::repair`].
    pub inconsistent: Vec<String>,
}

impl PendingRecovery {
    pub fn is_empty(&self) -> bool {
        self.interrupted_updates.is_empty() && self.inconsistent.is_empty()
    }
}

/// Front door for one profile: resolves sources, applies changes and keeps
/// `userChrome.css` in step with the registry.
pub struct App {
    config: AppConfig,
    registry: Arc<ModRegistry>,
    resolver: SourceResolver,
    applier: Applier,
    checker: UpdateChecker,
    pending: PendingRecovery,
}

impl App {
    pub fn open(config: AppConfig, chrome_dir: &Path) -> Result<Self> {
        let transport = Arc::new(UreqTransport::new(&config));
        Self::with_transport(config, chrome_dir, transport)
    }

    /// Same as [`App::open`] with a caller-supplied HTTP transport.
    pub fn with_transport(config: AppConfig, chrome_dir: &Path, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        fs::create_dir_all(chrome_dir).io_context("create chrome directory")?;
        let chrome_dir = chrome_dir
            .canonicalize()
            .io_context(format!("resolve {}", chrome_dir.display()))?;
        let layout = ProfileLayout::for_chrome_dir(&chrome_dir)?;
        let registry = Arc::new(ModRegistry::open(layout.registry_file())?);

        let http = HttpClient::new(transport, config.retry_policy());
        let github = GitHubClient::new(
            http.clone(),
            &config.github_api_url,
            config.effective_github_token(),
        );
        let resolver = SourceResolver::new(http, github, layout.staging_dir());
        let checker = UpdateChecker::new(resolver.clone(), config.check_concurrency);
        let applier = Applier::new(registry.clone(), layout);

        if let Err(err) = applier.purge_stale_staging() {
            warn!(error = %err, "could not purge stale staging data");
        }
        let pending = PendingRecovery {
            interrupted_updates: applier.find_orphaned_backups()?,
            inconsistent: registry
                .list()
                .into_iter()
                .filter(|entry| entry.inconsistent.is_some())
                .map(|entry| entry.id)
                .collect(),
        };
        if !pending.is_empty() {
            warn!(
                interrupted_updates = pending.interrupted_updates.len(),
                inconsistent = pending.inconsistent.len(),
                "profile needs recovery"
            );
        }
        info!(
            chrome_dir = %chrome_dir.display(),
            mods = registry.list().len(),
            "opened profile"
        );
        Ok(Self {
            config,
            registry,
            resolver,
            applier,
            checker,
            pending,
        })
    }

    /// What needed recovery when the profile was opened.
    pub fn pending_recovery(&self) -> &PendingRecovery {
        &self.pending
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn layout(&self) -> &ProfileLayout {
        self.applier.layout()
    }

    /// Resolves `reference` and installs it. Without an explicit placement the
    /// configured default is used, named after the payload; a payload shipping
    /// its own top-level `userChrome.css` always gets a subfolder then.
    pub fn resolve_and_install(&self, reference: &str, placement: Option<Placement>) -> Result<ModEntry> {
        let staged = self.resolver.resolve(reference)?;
        let placement = placement.unwrap_or_else(|| {
            let choice = if staged.ships_userchrome() {
                PlacementChoice::Subfolder
            } else {
                self.config.default_placement
            };
            choice.to_placement(&staged.suggested_name)
        });
        self.applier.install(staged, &placement)
    }

    pub fn list_mods(&self) -> Vec<ModEntry> {
        self.registry.list()
    }

    /// Checks `ids`, or every entry with a remote origin when `ids` is empty.
    pub fn check_updates(&self, ids: &[String]) -> BTreeMap<String, CheckResult> {
        self.check_updates_with(ids, &CheckCancel::new())
    }

    pub fn check_updates_with(&self, ids: &[String], cancel: &CheckCancel) -> BTreeMap<String, CheckResult> {
        let mut results = BTreeMap::new();
        let entries: Vec<ModEntry> = if ids.is_empty() {
            self.registry
                .list()
                .into_iter()
                .filter(|entry| entry.origin.is_remote())
                .collect()
        } else {
            ids.iter()
                .filter_map(|id| {
                    let entry = self.registry.get(id);
                    if entry.is_none() {
                        results.insert(id.clone(), Err(ModError::NotFound(id.clone())));
                    }
                    entry
                })
                .collect()
        };

        let checked = self.checker.check_all(&entries, cancel);
        self.stamp_checked(&entries, &checked);
        results.extend(checked);
        results
    }

    pub fn apply_update(&self, id: &str) -> Result<UpdateReport> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| ModError::NotFound(id.to_string()))?;
        let staged = self.resolver.resolve_origin(&entry.origin)?;
        self.applier.update(id, staged)
    }

    /// Checks every remote entry and applies the available updates one by one.
    pub fn update_all(&self) -> Vec<(String, Result<UpdateReport>)> {
        let available: Vec<String> = self
            .check_updates(&[])
            .into_iter()
            .filter_map(|(id, result)| match result {
                Ok(status) if status.is_available() => Some(id),
                Ok(_) => None,
                Err(err) => {
                    warn!(id = %id, error = %err, "skipping update");
                    None
                }
            })
            .collect();
        self.applier.update_batch(&self.resolver, &available)
    }

    pub fn toggle(&self, id: &str, enabled: bool) -> Result<()> {
        self.applier.toggle(id, enabled).map(|_| ())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let entry = self.applier.remove(id)?;
        if let Err(err) = userchrome::sync_file(self.layout().chrome_dir(), &[], &entry.entry_points) {
            warn!(id, error = %err, "could not drop import lines");
        }
        Ok(())
    }

    /// Rewrites the `userChrome.css` import list from the registry: enabled
    /// mods active, disabled mods commented out.
    pub fn sync_imports(&self) -> Result<bool> {
        let _lock = self.registry.lock_profile();
        let desired: Vec<DesiredImport> = self
            .registry
            .list()
            .into_iter()
            .flat_map(|entry| {
                let enabled = entry.enabled;
                entry
                    .entry_points
                    .into_iter()
                    .filter(|path| !path.eq_ignore_ascii_case(USERCHROME_FILE))
                    .map(move |path| DesiredImport { path, enabled })
            })
            .collect();
        userchrome::sync_file(self.layout().chrome_dir(), &desired, &[])
    }

    pub fn verify(&self, id: &str) -> Result<VerifyReport> {
        self.applier.verify(id)
    }

    pub fn verify_all(&self) -> Vec<(String, Result<VerifyReport>)> {
        self.registry
            .list()
            .into_iter()
            .map(|entry| {
                let report = self.applier.verify(&entry.id);
                (entry.id, report)
            })
            .collect()
    }

    pub fn repair(&self, id: &str) -> Result<RepairOutcome> {
        self.applier.repair(id)
    }

    pub fn orphaned_backups(&self) -> Result<Vec<OrphanedBackup>> {
        self.applier.find_orphaned_backups()
    }

    /// Restores or discards every interrupted update; returns how many were handled.
    pub fn recover(&self, action: RecoverAction) -> Result<usize> {
        let orphans = self.applier.find_orphaned_backups()?;
        for orphan in &orphans {
            match action {
                RecoverAction::Restore => self.applier.restore_orphan(orphan)?,
                RecoverAction::Discard => self.applier.discard_orphan(orphan)?,
            }
        }
        Ok(orphans.len())
    }

    fn stamp_checked(&self, entries: &[ModEntry], results: &BTreeMap<String, CheckResult>) {
        let _lock = self.registry.lock_profile();
        let now = now_timestamp();
        for entry in entries {
            if !matches!(results.get(&entry.id), Some(Ok(_))) {
                continue;
            }
            match entry.installed_checksum(self.layout().chrome_dir()) {
                Ok(actual) if actual == entry.checksum => {
                    if let Err(err) = self.registry.touch_checked(&entry.id, now) {
                        warn!(id = %entry.id, error = %err, "could not record check time");
                    }
                }
                Ok(_) => warn!(id = %entry.id, "installed files differ from the recorded checksum"),
                Err(err) => warn!(id = %entry.id, error = %err, "could not read installed files"),
            }
        }
    }
}
