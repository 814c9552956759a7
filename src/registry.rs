use crate::{
    error::{IoContext, ModError, Result},
    payload::{items_checksum, tree_checksum},
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

const REGISTRY_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModOrigin {
    /// Imported from a local file or folder, or placed by hand.
    #[serde(rename = "none")]
    Local,
    DirectUrl { url: String },
    GithubRepo {
        owner: String,
        repo: String,
        #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
        git_ref: Option<String>,
    },
}

impl ModOrigin {
    pub fn is_remote(&self) -> bool {
        !matches!(self, ModOrigin::Local)
    }

    pub fn describe(&self) -> String {
        match self {
            ModOrigin::Local => "local".to_string(),
            ModOrigin::DirectUrl { url } => url.clone(),
            ModOrigin::GithubRepo {
                owner,
                repo,
                git_ref: Some(git_ref),
            } => format!("github:{owner}/{repo}@{git_ref}"),
            ModOrigin::GithubRepo { owner, repo, .. } => format!("github:{owner}/{repo}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "folder", rename_all = "snake_case")]
pub enum Placement {
    /// Files land straight in the chrome directory.
    Direct,
    /// Files land in `chrome/<folder>/`.
    Subfolder(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModEntry {
    pub id: String,
    pub display_name: String,
    /// Paths relative to the chrome dir, `/`-separated; directories end in `/`.
    pub install_paths: Vec<String>,
    pub placement: Placement,
    /// Main stylesheets relative to the chrome dir, used for the import list.
    #[serde(default)]
    pub entry_points: Vec<String>,
    pub origin: ModOrigin,
    pub version: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub checksum: String,
    pub installed_at: i64,
    #[serde(default)]
    pub last_checked_at: Option<i64>,
    /// Set when a removal failed partway; holds the reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inconsistent: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ModEntry {
    /// The first of `paths` that overlaps one of this entry's paths.
    pub fn overlapping<'a>(&self, paths: &'a [String]) -> Option<&'a String> {
        paths.iter().find(|candidate| {
            self.install_paths
                .iter()
                .any(|owned| paths_overlap(owned, candidate))
        })
    }

    /// Checksum of what is currently on disk for this entry.
    pub fn installed_checksum(&self, chrome_dir: &Path) -> Result<String> {
        match &self.placement {
            Placement::Subfolder(folder) => tree_checksum(&chrome_dir.join(folder)),
            Placement::Direct => items_checksum(chrome_dir, &self.install_paths),
        }
    }
}

/// Two relative paths overlap when they name the same item or one contains the
/// other. Compared case-insensitively since chrome dirs often live on
/// case-insensitive filesystems.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a = a.trim_end_matches('/').to_lowercase();
    let b = b.trim_end_matches('/').to_lowercase();
    a == b || b.starts_with(&format!("{a}/")) || a.starts_with(&format!("{b}/"))
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default = "current_format")]
    version: u32,
    #[serde(default)]
    mods: Vec<ModEntry>,
}

fn current_format() -> u32 {
    REGISTRY_FORMAT
}

/// Held for the whole of a multi-step operation on one profile.
pub struct ProfileLock<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Installed mods of one profile, persisted as pretty JSON next to the chrome
/// directory. Each mutation rewrites the file with write-then-rename and only
/// updates the in-memory list once the rename has succeeded.
#[derive(Debug)]
pub struct ModRegistry {
    path: PathBuf,
    mods: Mutex<Vec<ModEntry>>,
    operation: Mutex<()>,
}

impl ModRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mods = if path.exists() {
            let raw = fs::read_to_string(&path).io_context("read registry")?;
            let file: RegistryFile = serde_json::from_str(&raw).map_err(|source| ModError::Corrupt {
                path: path.clone(),
                source,
            })?;
            file.mods
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), mods = mods.len(), "opened registry");
        Ok(Self {
            path,
            mods: Mutex::new(mods),
            operation: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_profile(&self) -> ProfileLock<'_> {
        ProfileLock {
            _guard: self.operation.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Entries in insertion order.
    pub fn list(&self) -> Vec<ModEntry> {
        self.state().clone()
    }

    pub fn get(&self, id: &str) -> Option<ModEntry> {
        self.state().iter().find(|entry| entry.id == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state().iter().any(|entry| entry.id == id)
    }

    /// Inserts a new entry at the end or replaces the entry with the same id in
    /// place. Fails with `PathConflict` if its paths overlap another entry.
    pub fn upsert(&self, entry: ModEntry) -> Result<()> {
        self.mutate(|mods| {
            let conflict = mods
                .iter()
                .filter(|other| other.id != entry.id)
                .find_map(|other| {
                    let path = other.overlapping(&entry.install_paths)?;
                    Some((path.clone(), other.id.clone()))
                });
            if let Some((path, owner)) = conflict {
                return Err(ModError::PathConflict { path, owner });
            }
            match mods.iter_mut().find(|existing| existing.id == entry.id) {
                Some(existing) => *existing = entry,
                None => mods.push(entry),
            }
            Ok(())
        })
    }

    pub fn remove(&self, id: &str) -> Result<ModEntry> {
        self.mutate(|mods| {
            let index = mods
                .iter()
                .position(|entry| entry.id == id)
                .ok_or_else(|| ModError::NotFound(id.to_string()))?;
            Ok(mods.remove(index))
        })
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<ModEntry> {
        let current = self.get(id).ok_or_else(|| ModError::NotFound(id.to_string()))?;
        if current.enabled == enabled {
            return Ok(current);
        }
        self.update_entry(id, |entry| entry.enabled = enabled)
    }

    pub fn mark_inconsistent(&self, id: &str, reason: &str) -> Result<ModEntry> {
        self.update_entry(id, |entry| entry.inconsistent = Some(reason.to_string()))
    }

    pub fn touch_checked(&self, id: &str, at: i64) -> Result<ModEntry> {
        self.update_entry(id, |entry| entry.last_checked_at = Some(at))
    }

    fn update_entry(&self, id: &str, apply: impl FnOnce(&mut ModEntry)) -> Result<ModEntry> {
        self.mutate(|mods| {
            let entry = mods
                .iter_mut()
                .find(|entry| entry.id == id)
                .ok_or_else(|| ModError::NotFound(id.to_string()))?;
            apply(entry);
            Ok(entry.clone())
        })
    }

    fn mutate<T>(&self, change: impl FnOnce(&mut Vec<ModEntry>) -> Result<T>) -> Result<T> {
        let mut state = self.state();
        let mut next = state.clone();
        let out = change(&mut next)?;
        let file = RegistryFile {
            version: REGISTRY_FORMAT,
            mods: next,
        };
        let raw = serde_json::to_string_pretty(&file).map_err(|source| ModError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, raw.as_bytes())?;
        *state = file.mods;
        Ok(out)
    }

    fn state(&self) -> MutexGuard<'_, Vec<ModEntry>> {
        self.mods.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Writes `<path>.tmp`, flushes it to disk, then renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).io_context("create parent dir")?;
    }
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp_path).io_context(format!("create {}", tmp_path.display()))?;
    file.write_all(bytes).io_context(format!("write {}", tmp_path.display()))?;
    file.sync_all().io_context(format!("sync {}", tmp_path.display()))?;
    drop(file);
    fs::rename(&tmp_path, path).map_err(|err| {
        let _ = fs::remove_file(&tmp_path);
        ModError::io(format!("replace {}", path.display()), err)
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn entry(id: &str, paths: &[&str]) -> ModEntry {
        ModEntry {
            id: id.to_string(),
            display_name: id.to_string(),
            install_paths: paths.iter().map(|path| path.to_string()).collect(),
            placement: Placement::Direct,
            entry_points: Vec::new(),
            origin: ModOrigin::Local,
            version: "1".to_string(),
            enabled: true,
            checksum: "abc".to_string(),
            installed_at: 1_700_000_000,
            last_checked_at: None,
            inconsistent: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::entry;
    use super::*;
    use crate::error::ErrorKind;
    use std::{sync::Arc, thread};

    #[test]
    fn keeps_insertion_order_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chromesmith-registry.json");
        let registry = ModRegistry::open(&path).unwrap();
        for id in ["zeta", "alpha", "mid"] {
            registry.upsert(entry(id, &[format!("{id}/").as_str()])).unwrap();
        }
        let mut replaced = entry("alpha", &["alpha/"]);
        replaced.version = "2".to_string();
        registry.upsert(replaced).unwrap();

        let reopened = ModRegistry::open(&path).unwrap();
        let ids: Vec<String> = reopened.list().into_iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
        assert_eq!(reopened.get("alpha").unwrap().version, "2");
        assert!(!dir.path().join("chromesmith-registry.json.tmp").exists());
    }

    #[test]
    fn rejects_overlapping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModRegistry::open(dir.path().join("registry.json")).unwrap();
        registry.upsert(entry("theme", &["theme/"])).unwrap();

        let err = registry
            .upsert(entry("icons", &["Theme/icons/"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathConflict);
        assert!(registry.get("icons").is_none());

        registry.upsert(entry("themes", &["themes/"])).unwrap();
    }

    #[test]
    fn toggling_is_idempotent_and_needs_known_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModRegistry::open(dir.path().join("registry.json")).unwrap();
        registry.upsert(entry("a", &["a.css"])).unwrap();

        registry.set_enabled("a", false).unwrap();
        let once = registry.list();
        let raw_once = fs::read(registry.path()).unwrap();
        registry.set_enabled("a", false).unwrap();
        assert_eq!(registry.list(), once);
        assert_eq!(fs::read(registry.path()).unwrap(), raw_once);

        let err = registry.set_enabled("missing", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn corrupt_file_is_reported_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "{ \"mods\": [ {").unwrap();
        let err = ModRegistry::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ \"mods\": [ {");
    }

    #[test]
    fn stale_temp_file_does_not_shadow_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = ModRegistry::open(&path).unwrap();
        registry.upsert(entry("a", &["a.css"])).unwrap();
        fs::write(dir.path().join("registry.json.tmp"), "{ half written").unwrap();

        let reopened = ModRegistry::open(&path).unwrap();
        assert_eq!(reopened.list().len(), 1);
    }

    #[test]
    fn serialized_mutations_from_threads_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ModRegistry::open(dir.path().join("registry.json")).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|index| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let _lock = registry.lock_profile();
                    let id = format!("mod-{index}");
                    registry.upsert(entry(&id, &[format!("{id}/").as_str()])).unwrap();
                    registry.set_enabled(&id, false).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reopened = ModRegistry::open(registry.path()).unwrap();
        assert_eq!(reopened.list().len(), 8);
        assert!(reopened.list().iter().all(|entry| !entry.enabled));
    }

    #[test]
    fn origin_serializes_as_tagged_record() {
        let origin = ModOrigin::GithubRepo {
            owner: "aris-t2".to_string(),
            repo: "customcssforfx".to_string(),
            git_ref: None,
        };
        let json = serde_json::to_value(&origin).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "kind": "github_repo", "owner": "aris-t2", "repo": "customcssforfx" })
        );
        let local: ModOrigin = serde_json::from_str(r#"{ "kind": "none" }"#).unwrap();
        assert_eq!(local, ModOrigin::Local);
    }
}
