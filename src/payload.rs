use crate::{
    error::{IoContext, ModError, Result},
    registry::ModOrigin,
    userchrome,
};
use filetime::{set_file_mtime, FileTime};
use sha2::{Digest, Sha256};
use std::{
    collections::HashSet,
    fs::{self, File},
    io::Read,
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use walkdir::WalkDir;

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Removes its directory on drop unless disarmed.
#[derive(Debug)]
pub(crate) struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

pub(crate) fn make_temp_dir(root: &Path, label: &str) -> Result<StagingGuard> {
    fs::create_dir_all(root).io_context("create staging root")?;

    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let name = format!("{}-{nanos}-{counter}", sanitize_label(label));
    let temp_dir = root.join(name);
    fs::create_dir_all(&temp_dir).io_context("create staging dir")?;
    Ok(StagingGuard::new(temp_dir))
}

/// Resolved content waiting to be placed into a chrome directory. Dropping it
/// deletes everything that was staged.
#[derive(Debug)]
pub struct StagedPayload {
    guard: StagingGuard,
    root: PathBuf,
    /// Main stylesheets relative to `root`, in import order.
    pub entry_points: Vec<PathBuf>,
    pub stylesheets: Vec<PathBuf>,
    pub origin: ModOrigin,
    pub version: String,
    pub checksum: String,
    pub suggested_name: String,
}

impl StagedPayload {
    /// Validates the content under `root` (which lives inside `guard`) and
    /// fills in the stylesheet pointer and checksum. Without an advertised
    /// version the checksum doubles as the version token.
    pub(crate) fn seal(
        guard: StagingGuard,
        root: PathBuf,
        origin: ModOrigin,
        version: Option<String>,
        suggested_name: String,
    ) -> Result<Self> {
        let stylesheets = find_stylesheets(&root)?;
        let entry_points = main_stylesheets(&root, &stylesheets);
        if entry_points.is_empty() {
            return Err(ModError::invalid_source(
                suggested_name,
                "no CSS files found in the payload",
            ));
        }
        let checksum = tree_checksum(&root)?;
        let version = version.unwrap_or_else(|| checksum.clone());
        Ok(Self {
            guard,
            root,
            entry_points,
            stylesheets,
            origin,
            version,
            checksum,
            suggested_name,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> &Path {
        self.guard.path()
    }

    /// Whether a `userChrome.css` sits at the top of the payload.
    pub fn ships_userchrome(&self) -> bool {
        self.entry_points.iter().any(|sheet| {
            sheet.components().count() == 1
                && sheet
                    .to_string_lossy()
                    .eq_ignore_ascii_case(userchrome::USERCHROME_FILE)
        })
    }

    /// Top-level names of the payload, directories suffixed with `/`.
    pub fn top_level_items(&self) -> Result<Vec<String>> {
        top_level_items(&self.root)
    }
}

pub fn top_level_items(root: &Path) -> Result<Vec<String>> {
    let mut items = Vec::new();
    for entry in fs::read_dir(root).io_context("list staged payload")? {
        let entry = entry.io_context("list staged payload")?;
        let path = entry.path();
        if is_ignored_path(Path::new(&entry.file_name())) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_dir() {
            items.push(format!("{name}/"));
        } else {
            items.push(name);
        }
    }
    items.sort();
    Ok(items)
}

pub(crate) fn is_ignored_path(path: &Path) -> bool {
    path.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part == ".git"
            || part == ".svn"
            || part == ".vscode"
    })
}

fn is_ignored_below(root: &Path, path: &Path) -> bool {
    is_ignored_path(path.strip_prefix(root).unwrap_or(path))
}

/// If `root` holds exactly one directory and nothing else, that directory is
/// the real content root (GitHub zipballs, `name/...` archives).
pub(crate) fn strip_single_root(root: &Path) -> Result<PathBuf> {
    let mut only_dir = None;
    for entry in fs::read_dir(root).io_context("inspect extracted payload")? {
        let entry = entry.io_context("inspect extracted payload")?;
        if is_ignored_path(Path::new(&entry.file_name())) {
            continue;
        }
        if only_dir.is_some() || !entry.path().is_dir() {
            return Ok(root.to_path_buf());
        }
        only_dir = Some(entry.path());
    }
    Ok(only_dir.unwrap_or_else(|| root.to_path_buf()))
}

/// Stylesheets below `root`, shallowest first, then by path.
pub fn find_stylesheets(root: &Path) -> Result<Vec<PathBuf>> {
    let mut sheets = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_ignored_below(root, entry.path()))
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_css = entry
            .path()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("css"));
        if !is_css {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            sheets.push(rel.to_path_buf());
        }
    }
    sheets.sort_by(|a, b| {
        a.components()
            .count()
            .cmp(&b.components().count())
            .then_with(|| a.cmp(b))
    });
    Ok(sheets)
}

/// Stylesheets the browser should import: every `userChrome.css` when the
/// payload ships one, else every sheet no other sheet imports. If each sheet
/// is imported by another, all of them are returned.
pub fn main_stylesheets(root: &Path, sheets: &[PathBuf]) -> Vec<PathBuf> {
    let named: Vec<PathBuf> = sheets
        .iter()
        .filter(|sheet| {
            sheet
                .file_name()
                .is_some_and(|name| name.to_string_lossy().eq_ignore_ascii_case(userchrome::USERCHROME_FILE))
        })
        .cloned()
        .collect();
    if !named.is_empty() {
        return named;
    }

    let mut imported = HashSet::new();
    for sheet in sheets {
        let Ok(content) = fs::read(root.join(sheet)) else {
            continue;
        };
        let content = String::from_utf8_lossy(&content);
        let base = sheet.parent().unwrap_or_else(|| Path::new(""));
        for line in userchrome::parse_imports(&content) {
            if !line.enabled {
                continue;
            }
            imported.insert(normalize_relative(&base.join(userchrome::normalize_import_path(&line.path))));
        }
    }

    let main: Vec<PathBuf> = sheets
        .iter()
        .filter(|sheet| !imported.contains(&normalize_relative(sheet)))
        .cloned()
        .collect();
    if main.is_empty() {
        sheets.to_vec()
    } else {
        main
    }
}

fn normalize_relative(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

/// SHA-256 over every file below `root`, keyed by relative path. A missing
/// `root` hashes like an empty tree.
pub fn tree_checksum(root: &Path) -> Result<String> {
    let mut files = Vec::new();
    match fs::symlink_metadata(root) {
        Ok(_) => collect_files(root, root, &mut files)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ModError::io(format!("inspect {}", root.display()), err)),
    }
    hash_files(files)
}

/// Same digest as [`tree_checksum`], restricted to the listed top-level items
/// of `base`. Missing items are skipped so drift shows up as a mismatch.
pub fn items_checksum(base: &Path, items: &[String]) -> Result<String> {
    let mut files = Vec::new();
    for item in items {
        let path = base.join(item.trim_end_matches('/'));
        if path.is_dir() {
            collect_files(base, &path, &mut files)?;
        } else if path.is_file() {
            files.push((rel_key(base, &path), path));
        }
    }
    hash_files(files)
}

fn collect_files(base: &Path, dir: &Path, files: &mut Vec<(String, PathBuf)>) -> Result<()> {
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_ignored_below(base, entry.path()))
    {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push((rel_key(base, entry.path()), entry.path().to_path_buf()));
        }
    }
    Ok(())
}

fn rel_key(base: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn hash_files(mut files: Vec<(String, PathBuf)>) -> Result<String> {
    files.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    for (key, path) in files {
        let mut file = File::open(&path).io_context(format!("open {} for checksum", path.display()))?;
        let len = file.metadata().io_context("stat file for checksum")?.len();
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(len.to_le_bytes());
        loop {
            let read = file.read(&mut buffer).io_context("read file for checksum")?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub(crate) fn copy_dir(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_ignored_below(source, entry.path()))
    {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).io_context("create dir")?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).io_context("create file dir")?;
            }
            fs::copy(entry.path(), &target).io_context(format!("copy {}", entry.path().display()))?;
            preserve_mtime(entry.path(), &target);
        }
    }
    Ok(())
}

/// Copies a file or a whole directory tree.
pub(crate) fn copy_path(source: &Path, dest: &Path) -> Result<()> {
    if source.is_dir() {
        return copy_dir(source, dest);
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).io_context("create file dir")?;
    }
    fs::copy(source, dest).io_context(format!("copy {}", source.display()))?;
    preserve_mtime(source, dest);
    Ok(())
}

/// Renames `source` to `dest`, copying when the rename crosses filesystems.
pub(crate) fn move_path(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).io_context("create target parent")?;
    }
    if fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    copy_path(source, dest)?;
    remove_path(source)
}

pub(crate) fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(ModError::io(format!("inspect {}", path.display()), err)),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).io_context(format!("remove {}", path.display()))
    } else {
        fs::remove_file(path).io_context(format!("remove {}", path.display()))
    }
}

fn preserve_mtime(source: &Path, dest: &Path) {
    let Ok(meta) = fs::metadata(source) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let Ok(duration) = modified.duration_since(UNIX_EPOCH) else {
        return;
    };
    let mtime = FileTime::from_unix_time(duration.as_secs() as i64, 0);
    let _ = set_file_mtime(dest, mtime);
}

/// Folder-safe version of a display name.
pub fn sanitize_name(value: &str) -> String {
    let mapped: String = value
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches(|ch| ch == '-' || ch == '.');
    if trimmed.is_empty() {
        "mod".to_string()
    } else {
        trimmed.to_string()
    }
}

fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

pub(crate) fn now_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn prefers_userchrome_then_unimported_sheets() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "parts/tabs.css", "tab {}");
        write(dir.path(), "theme.css", "@import url(\"parts/tabs.css\");");
        write(dir.path(), "hide_sidebar.css", "#sidebar-box { display: none }");
        let sheets = find_stylesheets(dir.path()).unwrap();
        assert_eq!(
            main_stylesheets(dir.path(), &sheets),
            vec![PathBuf::from("hide_sidebar.css"), PathBuf::from("theme.css")]
        );

        write(dir.path(), "parts/a.css", "@import \"../theme.css\";");
        write(dir.path(), "chrome/UserChrome.css", "");
        let sheets = find_stylesheets(dir.path()).unwrap();
        assert_eq!(
            main_stylesheets(dir.path(), &sheets),
            vec![PathBuf::from("chrome/UserChrome.css")]
        );
    }

    #[test]
    fn sheets_importing_each_other_are_all_main() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.css", "@import \"b.css\";");
        write(dir.path(), "b.css", "@import \"a.css\";");
        let sheets = find_stylesheets(dir.path()).unwrap();
        assert_eq!(main_stylesheets(dir.path(), &sheets), sheets);
    }

    #[test]
    fn staging_guard_cleans_up_unless_disarmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let guard = make_temp_dir(dir.path(), "install url").unwrap();
            assert!(guard.path().exists());
            guard.path().to_path_buf()
        };
        assert!(!path.exists());

        let mut guard = make_temp_dir(dir.path(), "keep").unwrap();
        guard.disarm();
        let kept = guard.path().to_path_buf();
        drop(guard);
        assert!(kept.exists());
    }

    #[test]
    fn checksum_matches_between_tree_and_items() {
        let staged = tempfile::tempdir().unwrap();
        write(staged.path(), "style.css", "a {}");
        write(staged.path(), "resources/bg.png", "png");

        let chrome = tempfile::tempdir().unwrap();
        write(chrome.path(), "style.css", "a {}");
        write(chrome.path(), "resources/bg.png", "png");
        write(chrome.path(), "unrelated.css", "b {}");

        let items = top_level_items(staged.path()).unwrap();
        assert_eq!(items, vec!["resources/".to_string(), "style.css".to_string()]);
        assert_eq!(
            tree_checksum(staged.path()).unwrap(),
            items_checksum(chrome.path(), &items).unwrap()
        );

        write(chrome.path(), "resources/bg.png", "tampered");
        assert_ne!(
            tree_checksum(staged.path()).unwrap(),
            items_checksum(chrome.path(), &items).unwrap()
        );
    }

    #[test]
    fn strips_only_a_lone_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "owner-repo-abc123/userChrome.css", "");
        write(dir.path(), "__MACOSX/._userChrome.css", "");
        assert_eq!(
            strip_single_root(dir.path()).unwrap(),
            dir.path().join("owner-repo-abc123")
        );

        write(dir.path(), "README.md", "");
        assert_eq!(strip_single_root(dir.path()).unwrap(), dir.path());
    }

    #[test]
    fn sanitizes_folder_names() {
        assert_eq!(sanitize_name("My Cool Theme!"), "My-Cool-Theme");
        assert_eq!(sanitize_name("my-mod"), "my-mod");
        assert_eq!(sanitize_name("../.."), "mod");
    }
}
