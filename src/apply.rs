use crate::{
    error::{IoContext, ModError, Result},
    payload::{copy_path, make_temp_dir, move_path, now_timestamp, remove_path, sanitize_name, StagedPayload},
    registry::{paths_overlap, write_atomic, ModEntry, ModRegistry, Placement},
    source::SourceResolver,
    userchrome::USERCHROME_FILE,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use time::{macros::format_description, OffsetDateTime};
use tracing::{debug, error, info, warn};

const OPERATION_FILE: &str = "operation.json";
const REMOVAL_FILE: &str = "removal.json";
const BACKUP_FILES: &str = "files";
const REMOVAL_PENDING: &str = "removal in progress";
const REGISTRY_FILE: &str = "chromesmith-registry.json";
const WORK_DIR: &str = ".chromesmith";

/// Where one profile's managed state lives. The registry and the work dir sit
/// next to `chrome/`, never inside it, and on the same filesystem so moves
/// between staging and the chrome dir are renames.
#[derive(Debug, Clone)]
pub struct ProfileLayout {
    chrome_dir: PathBuf,
    registry_file: PathBuf,
    work_dir: PathBuf,
}

impl ProfileLayout {
    pub fn for_chrome_dir(chrome_dir: &Path) -> Result<Self> {
        let profile = chrome_dir
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .ok_or_else(|| {
                ModError::invalid_source(
                    chrome_dir.display().to_string(),
                    "chrome directory has no parent profile directory",
                )
            })?;
        Ok(Self {
            chrome_dir: chrome_dir.to_path_buf(),
            registry_file: profile.join(REGISTRY_FILE),
            work_dir: profile.join(WORK_DIR),
        })
    }

    pub fn chrome_dir(&self) -> &Path {
        &self.chrome_dir
    }

    pub fn registry_file(&self) -> &Path {
        &self.registry_file
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.work_dir.join("staging")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.work_dir.join("backups")
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.work_dir.join("trash")
    }
}

/// Steps of an update. `RolledBack` is reachable from `BackedUp` and `Swapped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyState {
    Staged,
    BackedUp,
    Swapped,
    Committed,
    RolledBack,
}

/// Persisted as `operation.json` in the backup dir while an update runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub state: ApplyState,
    pub started_at: i64,
    pub previous: ModEntry,
    pub new_paths: Vec<String>,
    /// Checksum of the payload being placed.
    #[serde(default)]
    pub new_checksum: String,
}

/// Persisted as `removal.json` in a trash dir while its files are moved out.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemovalRecord {
    id: String,
    paths: Vec<String>,
}

/// A backup left behind by an update that never finished.
#[derive(Debug, Clone)]
pub struct OrphanedBackup {
    pub dir: PathBuf,
    pub record: OperationRecord,
}

#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub entry: ModEntry,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub id: String,
    pub expected: String,
    pub actual: String,
    pub missing: Vec<String>,
}

impl VerifyReport {
    pub fn is_intact(&self) -> bool {
        self.missing.is_empty() && self.expected == self.actual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    NothingToRepair,
    Removed,
}

struct Operation {
    dir: PathBuf,
    record: OperationRecord,
}

/// Steps where tests inject a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), allow(dead_code))]
enum FailPoint {
    AfterBackup,
    AfterSwap,
    Restore,
    /// Before moving the install path at this index to the trash.
    Trash(usize),
}

/// Places staged payloads into the chrome dir and keeps the registry in step.
/// Every public operation holds the profile lock for its whole duration.
pub struct Applier {
    registry: Arc<ModRegistry>,
    layout: ProfileLayout,
    #[cfg(test)]
    fail_at: std::sync::Mutex<Vec<FailPoint>>,
}

impl Applier {
    pub fn new(registry: Arc<ModRegistry>, layout: ProfileLayout) -> Self {
        Self {
            registry,
            layout,
            #[cfg(test)]
            fail_at: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn layout(&self) -> &ProfileLayout {
        &self.layout
    }

    pub fn install(&self, staged: StagedPayload, placement: &Placement) -> Result<ModEntry> {
        let _lock = self.registry.lock_profile();
        let chrome = self.layout.chrome_dir();
        fs::create_dir_all(chrome).io_context("create chrome directory")?;

        let (placement, install_paths, id) = match placement {
            Placement::Subfolder(name) => {
                let folder = self.unique_folder(&sanitize_name(name));
                let id = self.unique_id(&folder);
                (Placement::Subfolder(folder.clone()), vec![format!("{folder}/")], id)
            }
            Placement::Direct => {
                refuse_direct_userchrome(&staged)?;
                let items = staged.top_level_items()?;
                self.check_direct_conflicts(None, &items, &[])?;
                let stem = staged
                    .entry_points
                    .first()
                    .and_then(|sheet| sheet.file_stem())
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| staged.suggested_name.clone());
                let id = self.unique_id(&sanitize_name(&stem));
                (Placement::Direct, items, id)
            }
        };
        self.refuse_if_orphaned(&id, &install_paths)?;

        let now = now_timestamp();
        let entry = ModEntry {
            id,
            display_name: staged.suggested_name.clone(),
            install_paths,
            entry_points: placed_entry_points(&placement, &staged),
            placement,
            origin: staged.origin.clone(),
            version: staged.version.clone(),
            enabled: true,
            checksum: staged.checksum.clone(),
            installed_at: now,
            last_checked_at: Some(now),
            inconsistent: None,
        };

        let placed = self
            .place(&staged, &entry.placement, &entry.install_paths)
            .and_then(|()| self.verify_placed(&entry, &staged))
            .and_then(|()| self.registry.upsert(entry.clone()));
        if let Err(err) = placed {
            warn!(id = %entry.id, error = %err, "install failed, removing placed files");
            self.remove_placed(&entry.install_paths);
            return Err(err);
        }

        info!(
            id = %entry.id,
            origin = %entry.origin.describe(),
            version = %entry.version,
            "installed mod"
        );
        Ok(entry)
    }

    /// Replaces the files of `id` with `staged`, keeping its placement. On any
    /// failure after the backup the previous files come back and the registry
    /// entry is left untouched.
    pub fn update(&self, id: &str, staged: StagedPayload) -> Result<UpdateReport> {
        let _lock = self.registry.lock_profile();
        let current = self
            .registry
            .get(id)
            .ok_or_else(|| ModError::NotFound(id.to_string()))?;
        self.refuse_if_orphaned(id, &current.install_paths)?;

        let mut warnings = Vec::new();
        if let Some(warning) = self.drift_warning(&current) {
            warn!(id, "{warning}");
            warnings.push(warning);
        }

        let new_paths = match &current.placement {
            Placement::Subfolder(folder) => vec![format!("{folder}/")],
            Placement::Direct => {
                refuse_direct_userchrome(&staged)?;
                let items = staged.top_level_items()?;
                self.check_direct_conflicts(Some(id), &items, &current.install_paths)?;
                items
            }
        };

        let mut operation = self
            .back_up(&current, &new_paths, &staged.checksum)
            .map_err(|err| ModError::update_failed(id, err))?;

        match self.swap_and_commit(&mut operation, &current, &staged) {
            Ok(entry) => {
                self.finish(operation);
                info!(id, version = %entry.version, "updated mod");
                Ok(UpdateReport { entry, warnings })
            }
            Err(err) => Err(self.roll_back(operation, err)),
        }
    }

    /// Deletes the files of `id`, then its record. The entry carries an
    /// `inconsistent` marker while its files sit in the trash, so a crash or a
    /// failed move leaves it for [`Applier::repair`] instead of dropping it.
    pub fn remove(&self, id: &str) -> Result<ModEntry> {
        let _lock = self.registry.lock_profile();
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| ModError::NotFound(id.to_string()))?;
        self.refuse_if_orphaned(id, &entry.install_paths)?;

        let trash = self.move_to_trash(&entry)?;
        if let Err(err) = self.registry.remove(id) {
            if let Err(restore) = self.restore_from_trash(&trash, &entry) {
                error!(id, error = %restore, trash = %trash.display(), "could not put removed files back");
            }
            return Err(err);
        }
        if let Err(err) = remove_path(&trash) {
            warn!(dir = %trash.display(), error = %err, "could not empty trash");
        }
        info!(id, "removed mod");
        Ok(entry)
    }

    /// Marks `entry` as being removed, then moves its files into a fresh trash
    /// dir next to a `removal.json` naming them.
    fn move_to_trash(&self, entry: &ModEntry) -> Result<PathBuf> {
        let id = entry.id.as_str();
        self.registry.mark_inconsistent(id, REMOVAL_PENDING)?;

        let prepared = make_temp_dir(&self.layout.trash_dir(), id).and_then(|mut guard| {
            let record = RemovalRecord {
                id: id.to_string(),
                paths: entry.install_paths.clone(),
            };
            let path = guard.path().join(REMOVAL_FILE);
            let raw = serde_json::to_vec_pretty(&record).map_err(|source| ModError::Corrupt {
                path: path.clone(),
                source,
            })?;
            write_atomic(&path, &raw)?;
            guard.disarm();
            Ok(guard.path().to_path_buf())
        });
        let trash = match prepared {
            Ok(trash) => trash,
            Err(err) => {
                if let Err(revert) = self.registry.upsert(entry.clone()) {
                    warn!(id, error = %revert, "could not clear removal marker");
                }
                return Err(err);
            }
        };

        let chrome = self.layout.chrome_dir();
        let files = trash.join(BACKUP_FILES);
        for (index, path) in entry.install_paths.iter().enumerate() {
            let rel = path.trim_end_matches('/');
            let source = chrome.join(rel);
            if fs::symlink_metadata(&source).is_err() {
                continue;
            }
            let moved = self
                .fail_point(FailPoint::Trash(index))
                .and_then(|()| move_path(&source, &files.join(rel)));
            if let Err(err) = moved {
                let reason = format!("could not remove {path}: {err}");
                warn!(id, %reason, "removal stopped partway");
                self.registry.mark_inconsistent(id, &reason)?;
                return Err(ModError::Inconsistent {
                    id: id.to_string(),
                    reason,
                });
            }
        }
        Ok(trash)
    }

    fn restore_from_trash(&self, trash: &Path, entry: &ModEntry) -> Result<()> {
        let chrome = self.layout.chrome_dir();
        let files = trash.join(BACKUP_FILES);
        for path in &entry.install_paths {
            let rel = path.trim_end_matches('/');
            let saved = files.join(rel);
            if fs::symlink_metadata(&saved).is_ok() {
                move_path(&saved, &chrome.join(rel))?;
            }
        }
        self.registry.upsert(entry.clone())?;
        remove_path(trash)
    }

    /// Enables or disables `id`. Never touches the filesystem.
    pub fn toggle(&self, id: &str, enabled: bool) -> Result<ModEntry> {
        let _lock = self.registry.lock_profile();
        let entry = self.registry.set_enabled(id, enabled)?;
        debug!(id, enabled, "toggled mod");
        Ok(entry)
    }

    /// Resolves each origin again and updates the entries one after another.
    pub fn update_batch(&self, resolver: &SourceResolver, ids: &[String]) -> Vec<(String, Result<UpdateReport>)> {
        ids.iter()
            .map(|id| {
                let result = self
                    .registry
                    .get(id)
                    .ok_or_else(|| ModError::NotFound(id.clone()))
                    .and_then(|entry| resolver.resolve_origin(&entry.origin))
                    .and_then(|staged| self.update(id, staged));
                if let Err(err) = &result {
                    warn!(id = %id, error = %err, "batch update entry failed");
                }
                (id.clone(), result)
            })
            .collect()
    }

    pub fn verify(&self, id: &str) -> Result<VerifyReport> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| ModError::NotFound(id.to_string()))?;
        let chrome = self.layout.chrome_dir();
        let missing = entry
            .install_paths
            .iter()
            .filter(|path| fs::symlink_metadata(chrome.join(path.trim_end_matches('/'))).is_err())
            .cloned()
            .collect();
        Ok(VerifyReport {
            id: entry.id.clone(),
            actual: entry.installed_checksum(chrome)?,
            expected: entry.checksum,
            missing,
        })
    }

    /// Retries the deletion of an entry left inconsistent by a failed removal.
    pub fn repair(&self, id: &str) -> Result<RepairOutcome> {
        let _lock = self.registry.lock_profile();
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| ModError::NotFound(id.to_string()))?;
        if entry.inconsistent.is_none() {
            return Ok(RepairOutcome::NothingToRepair);
        }

        let chrome = self.layout.chrome_dir();
        let failures: Vec<String> = entry
            .install_paths
            .iter()
            .filter_map(|path| {
                remove_path(&chrome.join(path.trim_end_matches('/')))
                    .err()
                    .map(|err| format!("{path}: {err}"))
            })
            .collect();
        if !failures.is_empty() {
            let reason = failures.join("; ");
            self.registry.mark_inconsistent(id, &reason)?;
            return Err(ModError::Inconsistent {
                id: id.to_string(),
                reason,
            });
        }

        self.registry.remove(id)?;
        for (dir, record) in self.trash_records() {
            if record.is_some_and(|record| record.id == id) {
                if let Err(err) = remove_path(&dir) {
                    warn!(dir = %dir.display(), error = %err, "could not empty trash");
                }
            }
        }
        info!(id, "repaired inconsistent entry");
        Ok(RepairOutcome::Removed)
    }

    pub fn find_orphaned_backups(&self) -> Result<Vec<OrphanedBackup>> {
        let root = self.layout.backups_dir();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut orphans = Vec::new();
        for item in fs::read_dir(&root).io_context("list backups")? {
            let dir = item.io_context("list backups")?.path();
            let record_path = dir.join(OPERATION_FILE);
            let raw = match fs::read_to_string(&record_path) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "backup without operation record");
                    continue;
                }
            };
            match serde_json::from_str::<OperationRecord>(&raw) {
                Ok(record) => orphans.push(OrphanedBackup { dir, record }),
                Err(err) => warn!(dir = %dir.display(), error = %err, "unreadable operation record"),
            }
        }
        orphans.sort_by_key(|orphan| orphan.record.started_at);
        Ok(orphans)
    }

    /// Puts an interrupted update's previous files and record back. Backups
    /// whose chrome dir was never touched, or whose update already committed,
    /// are only deleted. Refuses when the registry entry has moved on from both
    /// the previous and the interrupted version.
    pub fn restore_orphan(&self, orphan: &OrphanedBackup) -> Result<()> {
        let _lock = self.registry.lock_profile();
        let record = &orphan.record;
        match record.state {
            ApplyState::BackedUp | ApplyState::Swapped => {
                let current = self.registry.get(&record.id);
                let left_by_update = current.as_ref().is_some_and(|entry| {
                    (entry.checksum == record.previous.checksum && entry.version == record.previous.version)
                        || (!record.new_checksum.is_empty() && entry.checksum == record.new_checksum)
                });
                if !left_by_update {
                    return Err(ModError::Inconsistent {
                        id: record.id.clone(),
                        reason: format!(
                            "the registry entry changed after the interrupted update; discard the backup at {}",
                            orphan.dir.display()
                        ),
                    });
                }
                self.restore_files(&orphan.record, &orphan.dir)?;
                self.registry.upsert(orphan.record.previous.clone())?;
                info!(id = %orphan.record.id, "restored interrupted update");
            }
            ApplyState::Staged | ApplyState::Committed | ApplyState::RolledBack => {
                debug!(id = %orphan.record.id, state = ?orphan.record.state, "nothing to restore");
            }
        }
        remove_path(&orphan.dir)
    }

    pub fn discard_orphan(&self, orphan: &OrphanedBackup) -> Result<()> {
        let _lock = self.registry.lock_profile();
        info!(id = %orphan.record.id, dir = %orphan.dir.display(), "discarding backup");
        remove_path(&orphan.dir)
    }

    /// Clears staging and every trash dir except those of a removal that is
    /// still pending, which [`Applier::repair`] finishes. Returns how many dirs
    /// were deleted.
    pub fn purge_stale_staging(&self) -> Result<usize> {
        let _lock = self.registry.lock_profile();
        let mut purged = 0;
        if let Ok(items) = fs::read_dir(self.layout.staging_dir()) {
            for item in items {
                remove_path(&item.io_context("list staging")?.path())?;
                purged += 1;
            }
        }
        for (dir, record) in self.trash_records() {
            let Some(record) = record else {
                warn!(dir = %dir.display(), "trash dir without removal record left in place");
                continue;
            };
            let pending = self
                .registry
                .get(&record.id)
                .is_some_and(|entry| entry.inconsistent.is_some());
            if pending {
                warn!(id = %record.id, dir = %dir.display(), "interrupted removal kept for repair");
                continue;
            }
            remove_path(&dir)?;
            purged += 1;
        }
        if purged > 0 {
            info!(purged, "removed stale staging data");
        }
        Ok(purged)
    }

    fn trash_records(&self) -> Vec<(PathBuf, Option<RemovalRecord>)> {
        let Ok(items) = fs::read_dir(self.layout.trash_dir()) else {
            return Vec::new();
        };
        items
            .filter_map(|item| item.ok().map(|item| item.path()))
            .map(|dir| {
                let record: Option<RemovalRecord> = fs::read(dir.join(REMOVAL_FILE))
                    .ok()
                    .and_then(|raw| serde_json::from_slice(&raw).ok());
                (dir, record)
            })
            .collect()
    }

    /// Fails while an interrupted update for `id`, or for any of `paths`,
    /// still waits for `recover`.
    fn refuse_if_orphaned(&self, id: &str, paths: &[String]) -> Result<()> {
        let blocking = self.find_orphaned_backups()?.into_iter().find(|orphan| {
            let record = &orphan.record;
            record.id == id
                || record
                    .previous
                    .install_paths
                    .iter()
                    .chain(&record.new_paths)
                    .any(|owned| paths.iter().any(|path| paths_overlap(owned, path)))
        });
        match blocking {
            Some(orphan) => Err(ModError::Inconsistent {
                id: id.to_string(),
                reason: format!(
                    "an interrupted update of '{}' left a backup at {}; run recover first",
                    orphan.record.id,
                    orphan.dir.display()
                ),
            }),
            None => Ok(()),
        }
    }

    fn place(&self, staged: &StagedPayload, placement: &Placement, paths: &[String]) -> Result<()> {
        let chrome = self.layout.chrome_dir();
        match placement {
            Placement::Subfolder(folder) => move_path(staged.root(), &chrome.join(folder)),
            Placement::Direct => {
                for item in paths {
                    let rel = item.trim_end_matches('/');
                    move_path(&staged.root().join(rel), &chrome.join(rel))?;
                }
                Ok(())
            }
        }
    }

    fn verify_placed(&self, entry: &ModEntry, staged: &StagedPayload) -> Result<()> {
        let actual = entry.installed_checksum(self.layout.chrome_dir())?;
        if actual == staged.checksum {
            return Ok(());
        }
        Err(ModError::Inconsistent {
            id: entry.id.clone(),
            reason: "placed files do not match the staged payload".to_string(),
        })
    }

    fn remove_placed(&self, paths: &[String]) {
        for path in paths {
            let target = self.layout.chrome_dir().join(path.trim_end_matches('/'));
            if let Err(err) = remove_path(&target) {
                error!(path = %target.display(), error = %err, "could not clean up placed file");
            }
        }
    }

    fn check_direct_conflicts(&self, owner: Option<&str>, items: &[String], own_paths: &[String]) -> Result<()> {
        for other in self.registry.list() {
            if Some(other.id.as_str()) == owner {
                continue;
            }
            if let Some(path) = other.overlapping(items) {
                return Err(ModError::PathConflict {
                    path: path.clone(),
                    owner: other.id,
                });
            }
        }
        for item in items {
            if own_paths.iter().any(|owned| paths_overlap(owned, item)) {
                continue;
            }
            let on_disk = self.layout.chrome_dir().join(item.trim_end_matches('/'));
            if fs::symlink_metadata(on_disk).is_ok() {
                return Err(ModError::PathConflict {
                    path: item.clone(),
                    owner: "an unmanaged file".to_string(),
                });
            }
        }
        Ok(())
    }

    fn unique_folder(&self, base: &str) -> String {
        let mods = self.registry.list();
        let taken = |candidate: &str| {
            let rel = format!("{candidate}/");
            fs::symlink_metadata(self.layout.chrome_dir().join(candidate)).is_ok()
                || mods
                    .iter()
                    .any(|entry| entry.install_paths.iter().any(|path| paths_overlap(path, &rel)))
        };
        with_suffix(base, taken)
    }

    fn unique_id(&self, base: &str) -> String {
        with_suffix(base, |candidate| self.registry.contains(candidate))
    }

    fn drift_warning(&self, entry: &ModEntry) -> Option<String> {
        match entry.installed_checksum(self.layout.chrome_dir()) {
            Ok(actual) if actual == entry.checksum => None,
            Ok(_) => Some(format!(
                "installed files of '{}' were modified outside chromesmith; the update replaces them",
                entry.id
            )),
            Err(err) => Some(format!("could not read installed files of '{}': {err}", entry.id)),
        }
    }

    fn back_up(&self, current: &ModEntry, new_paths: &[String], new_checksum: &str) -> Result<Operation> {
        let dir = self.backup_dir(&current.id)?;
        let mut operation = Operation {
            dir,
            record: OperationRecord {
                id: current.id.clone(),
                state: ApplyState::Staged,
                started_at: now_timestamp(),
                previous: current.clone(),
                new_paths: new_paths.to_vec(),
                new_checksum: new_checksum.to_string(),
            },
        };

        let copied = self.persist(&operation).and_then(|()| {
            let files = operation.dir.join(BACKUP_FILES);
            fs::create_dir_all(&files).io_context("create backup dir")?;
            for path in &current.install_paths {
                let rel = path.trim_end_matches('/');
                let source = self.layout.chrome_dir().join(rel);
                if fs::symlink_metadata(&source).is_ok() {
                    copy_path(&source, &files.join(rel))?;
                }
            }
            Ok(())
        });
        let advanced = copied.and_then(|()| self.advance(&mut operation, ApplyState::BackedUp));
        if let Err(err) = advanced {
            let _ = remove_path(&operation.dir);
            return Err(err);
        }
        Ok(operation)
    }

    fn swap_and_commit(&self, operation: &mut Operation, current: &ModEntry, staged: &StagedPayload) -> Result<ModEntry> {
        self.fail_point(FailPoint::AfterBackup)?;
        let chrome = self.layout.chrome_dir();
        for path in &current.install_paths {
            remove_path(&chrome.join(path.trim_end_matches('/')))?;
        }
        self.place(staged, &current.placement, &operation.record.new_paths)?;
        self.advance(operation, ApplyState::Swapped)?;
        self.fail_point(FailPoint::AfterSwap)?;

        let entry = ModEntry {
            install_paths: operation.record.new_paths.clone(),
            entry_points: placed_entry_points(&current.placement, staged),
            origin: staged.origin.clone(),
            version: staged.version.clone(),
            checksum: staged.checksum.clone(),
            last_checked_at: Some(now_timestamp()),
            inconsistent: None,
            ..current.clone()
        };
        self.verify_placed(&entry, staged)?;
        self.registry.upsert(entry.clone())?;
        Ok(entry)
    }

    fn finish(&self, mut operation: Operation) {
        if let Err(err) = self.advance(&mut operation, ApplyState::Committed) {
            warn!(id = %operation.record.id, error = %err, "could not record commit");
        }
        if let Err(err) = remove_path(&operation.dir) {
            warn!(dir = %operation.dir.display(), error = %err, "could not delete backup");
        }
    }

    fn roll_back(&self, mut operation: Operation, cause: ModError) -> ModError {
        let id = operation.record.id.clone();
        warn!(id = %id, error = %cause, "update failed, rolling back");
        match self.restore_files(&operation.record, &operation.dir) {
            Ok(()) => {
                if let Err(err) = self.advance(&mut operation, ApplyState::RolledBack) {
                    warn!(id = %id, error = %err, "could not record rollback");
                }
                if let Err(err) = remove_path(&operation.dir) {
                    warn!(dir = %operation.dir.display(), error = %err, "could not delete backup");
                }
                info!(id = %id, "rolled back");
                ModError::update_failed(id, cause)
            }
            Err(err) => {
                error!(id = %id, error = %err, backup = %operation.dir.display(), "rollback failed");
                ModError::RollbackFailed {
                    id,
                    reason: err.to_string(),
                    backup: operation.dir,
                    cause: Some(Box::new(cause)),
                }
            }
        }
    }

    fn restore_files(&self, record: &OperationRecord, dir: &Path) -> Result<()> {
        self.fail_point(FailPoint::Restore)?;
        let chrome = self.layout.chrome_dir();
        for path in record.new_paths.iter().chain(&record.previous.install_paths) {
            remove_path(&chrome.join(path.trim_end_matches('/')))?;
        }
        let files = dir.join(BACKUP_FILES);
        for path in &record.previous.install_paths {
            let rel = path.trim_end_matches('/');
            let saved = files.join(rel);
            if fs::symlink_metadata(&saved).is_ok() {
                copy_path(&saved, &chrome.join(rel))?;
            }
        }
        Ok(())
    }

    fn advance(&self, operation: &mut Operation, state: ApplyState) -> Result<()> {
        debug!(id = %operation.record.id, from = ?operation.record.state, to = ?state, "update state");
        operation.record.state = state;
        self.persist(operation)
    }

    fn persist(&self, operation: &Operation) -> Result<()> {
        let path = operation.dir.join(OPERATION_FILE);
        let raw = serde_json::to_vec_pretty(&operation.record).map_err(|source| ModError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &raw)
    }

    fn backup_dir(&self, id: &str) -> Result<PathBuf> {
        let root = self.layout.backups_dir();
        fs::create_dir_all(&root).io_context("create backups dir")?;
        let stamp = OffsetDateTime::now_utc()
            .format(format_description!("[year][month][day]-[hour][minute][second]"))
            .unwrap_or_else(|_| now_timestamp().to_string());
        let name = with_suffix(&format!("{id}-{stamp}"), |candidate| root.join(candidate).exists());
        Ok(root.join(name))
    }

    #[cfg(test)]
    fn fail_point(&self, point: FailPoint) -> Result<()> {
        let armed = self
            .fail_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&point);
        if armed {
            return Err(ModError::io(
                "simulated failure",
                std::io::Error::new(std::io::ErrorKind::Other, "injected"),
            ));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn fail_point(&self, _point: FailPoint) -> Result<()> {
        Ok(())
    }

    #[cfg(test)]
    fn fail_at(&self, points: &[FailPoint]) {
        *self
            .fail_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = points.to_vec();
    }
}

/// A top-level `userChrome.css` would take over the file the import list lives in.
fn refuse_direct_userchrome(staged: &StagedPayload) -> Result<()> {
    if staged.ships_userchrome() {
        return Err(ModError::PathConflict {
            path: USERCHROME_FILE.to_string(),
            owner: "the profile import list".to_string(),
        });
    }
    Ok(())
}

fn placed_entry_points(placement: &Placement, staged: &StagedPayload) -> Vec<String> {
    staged
        .entry_points
        .iter()
        .map(|sheet| {
            let rel = slash_path(sheet);
            match placement {
                Placement::Subfolder(folder) => format!("{folder}/{rel}"),
                Placement::Direct => rel,
            }
        })
        .collect()
}

fn with_suffix(base: &str, taken: impl Fn(&str) -> bool) -> String {
    let mut candidate = base.to_string();
    let mut counter = 1;
    while taken(&candidate) {
        counter += 1;
        candidate = format!("{base}-{counter}");
    }
    candidate
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
