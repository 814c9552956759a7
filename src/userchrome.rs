//! `userChrome.css` import list. The browser loads this one file; each mod's
//! main stylesheets are pulled in with an `@import url("...");` line, and a
//! disabled mod keeps its line wrapped in a comment.

use crate::{
    error::{IoContext, Result},
    registry::write_atomic,
};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

pub const USERCHROME_FILE: &str = "userChrome.css";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportLine {
    pub path: String,
    pub enabled: bool,
    /// 1-based line number in the source file.
    pub line: usize,
}

/// One import the file should contain after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredImport {
    pub path: String,
    pub enabled: bool,
}

pub fn normalize_import_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    path.strip_prefix("./").unwrap_or(&path).to_string()
}

pub fn parse_imports(content: &str) -> Vec<ImportLine> {
    let mut imports = Vec::new();
    let mut seen = HashSet::new();
    let mut in_comment = false;

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        let (commented, rest) = if in_comment {
            (true, line)
        } else if let Some(rest) = line.strip_prefix("/*") {
            (true, rest.trim_start())
        } else {
            (false, line)
        };
        if commented {
            in_comment = !line.contains("*/");
        }

        let Some(target) = import_target(rest) else {
            continue;
        };
        let normalized = normalize_import_path(&target);
        if seen.insert(normalized) {
            imports.push(ImportLine {
                path: target,
                enabled: !commented,
                line: index + 1,
            });
        }
    }
    imports
}

fn import_target(line: &str) -> Option<String> {
    let rest = line.strip_prefix("@import")?.trim_start();
    if let Some(inner) = rest.strip_prefix("url(") {
        let end = inner.find(')')?;
        let target = inner[..end].trim().trim_matches(|ch| ch == '"' || ch == '\'');
        return (!target.is_empty()).then(|| target.to_string());
    }
    let quote = rest.chars().next().filter(|ch| *ch == '"' || *ch == '\'')?;
    let inner = &rest[1..];
    let end = inner.find(quote)?;
    let target = &inner[..end];
    (!target.is_empty()).then(|| target.to_string())
}

fn render(path: &str, enabled: bool) -> String {
    if enabled {
        format!("@import url(\"{path}\");")
    } else {
        format!("/* @import url(\"{path}\"); */")
    }
}

/// Rewrites `content` so every `desired` import is present in the requested
/// state and every path in `dropped` is gone. Lines that are not single-line
/// imports are left untouched; new imports go after the last existing import,
/// or at the top of the file.
pub fn reconcile(content: &str, desired: &[DesiredImport], dropped: &[String]) -> String {
    let wanted: Vec<(String, &DesiredImport)> = desired
        .iter()
        .map(|import| (normalize_import_path(&import.path), import))
        .collect();
    let dropped: HashSet<String> = dropped.iter().map(|path| normalize_import_path(path)).collect();

    let mut lines: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    let mut last_import = None;
    let mut in_comment = false;
    let mut drop_blank = false;

    for raw in content.lines() {
        let trimmed = raw.trim();
        let after_top_drop = std::mem::take(&mut drop_blank);
        let single_line_comment = trimmed.starts_with("/*") && trimmed.contains("*/");
        let target = if in_comment {
            None
        } else if single_line_comment {
            trimmed
                .strip_prefix("/*")
                .and_then(|rest| import_target(rest.trim_start()))
        } else {
            import_target(trimmed)
        };
        if !in_comment && trimmed.starts_with("/*") && !trimmed.contains("*/") {
            in_comment = true;
        } else if in_comment && trimmed.contains("*/") {
            in_comment = false;
        }

        let Some(target) = target else {
            if after_top_drop && trimmed.is_empty() {
                continue;
            }
            lines.push(raw.to_string());
            continue;
        };
        let normalized = normalize_import_path(&target);
        if dropped.contains(&normalized) {
            // the separator written after a top-of-file import goes with it
            drop_blank = lines.is_empty();
            continue;
        }
        if let Some((_, import)) = wanted.iter().find(|(path, _)| *path == normalized) {
            if !seen.insert(normalized) {
                continue;
            }
            lines.push(render(&import.path, import.enabled));
        } else {
            lines.push(raw.to_string());
        }
        last_import = Some(lines.len());
    }

    let missing: Vec<String> = wanted
        .iter()
        .filter(|(path, _)| !seen.contains(path))
        .map(|(_, import)| render(&import.path, import.enabled))
        .collect();
    if !missing.is_empty() {
        match last_import {
            Some(at) => {
                lines.splice(at..at, missing);
            }
            None => {
                let mut head = missing;
                if !lines.is_empty() {
                    head.push(String::new());
                }
                lines.splice(0..0, head);
            }
        }
    }

    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// The existing `userChrome.css` (matched case-insensitively) or the default name.
pub fn userchrome_path(chrome_dir: &Path) -> PathBuf {
    if let Ok(entries) = fs::read_dir(chrome_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().eq_ignore_ascii_case(USERCHROME_FILE) && entry.path().is_file() {
                return entry.path();
            }
        }
    }
    chrome_dir.join(USERCHROME_FILE)
}

pub fn read_imports(chrome_dir: &Path) -> Result<Vec<ImportLine>> {
    Ok(parse_imports(&read_userchrome(chrome_dir)?))
}

fn read_userchrome(chrome_dir: &Path) -> Result<String> {
    let path = userchrome_path(chrome_dir);
    if !path.exists() {
        return Ok(String::new());
    }
    let raw = fs::read(&path).io_context("read userChrome.css")?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Applies [`reconcile`] to the profile's `userChrome.css`; returns whether
/// the file changed.
pub fn sync_file(chrome_dir: &Path, desired: &[DesiredImport], dropped: &[String]) -> Result<bool> {
    let current = read_userchrome(chrome_dir)?;
    let updated = reconcile(&current, desired, dropped);
    if updated == current {
        return Ok(false);
    }
    fs::create_dir_all(chrome_dir).io_context("create chrome dir")?;
    write_atomic(&userchrome_path(chrome_dir), updated.as_bytes())?;
    info!(
        imports = desired.len(),
        dropped = dropped.len(),
        "updated userChrome.css imports"
    );
    Ok(true)
}
