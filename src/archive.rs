use crate::{
    error::{IoContext, ModError, Result},
    payload::{is_ignored_path, StagingGuard},
};
use bzip2::read::BzDecoder;
use filetime::{set_file_mtime, FileTime};
use flate2::read::GzDecoder;
use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};
use tracing::{debug, info};

const SNIFF_LEN: usize = 512;
const USTAR_OFFSET: usize = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Zip and zip-based containers (`.xpi`, `.jar`).
    Zip,
    Tar,
    TarGz,
    TarBz2,
}

impl ArchiveFormat {
    pub fn label(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    Archive(ArchiveFormat),
    /// A recognised container this engine does not unpack.
    Unsupported(&'static str),
    /// No archive magic at all; most likely a plain stylesheet.
    Unknown,
}

pub fn detect(path: &Path) -> Result<Signature> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    open(path)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .io_context(format!("read {}", path.display()))?;

    let signature = if head.starts_with(b"PK\x03\x04")
        || head.starts_with(b"PK\x05\x06")
        || head.starts_with(b"PK\x07\x08")
    {
        Signature::Archive(ArchiveFormat::Zip)
    } else if head.starts_with(&[0x1f, 0x8b]) {
        if sniff_tar(GzDecoder::new(open(path)?)) {
            Signature::Archive(ArchiveFormat::TarGz)
        } else {
            Signature::Unsupported("gzip without a tar stream")
        }
    } else if head.starts_with(b"BZh") {
        if sniff_tar(BzDecoder::new(open(path)?)) {
            Signature::Archive(ArchiveFormat::TarBz2)
        } else {
            Signature::Unsupported("bzip2 without a tar stream")
        }
    } else if has_ustar_magic(&head) {
        Signature::Archive(ArchiveFormat::Tar)
    } else if head.starts_with(&[0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c]) {
        Signature::Unsupported("7z")
    } else if head.starts_with(b"Rar!\x1a\x07") {
        Signature::Unsupported("rar")
    } else if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Signature::Unsupported("xz")
    } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Signature::Unsupported("zstd")
    } else {
        Signature::Unknown
    };
    debug!(path = %path.display(), ?signature, "sniffed payload");
    Ok(signature)
}

fn sniff_tar(reader: impl Read) -> bool {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    match reader.take(SNIFF_LEN as u64).read_to_end(&mut head) {
        Ok(_) => has_ustar_magic(&head),
        Err(_) => false,
    }
}

fn has_ustar_magic(head: &[u8]) -> bool {
    head.get(USTAR_OFFSET..USTAR_OFFSET + 5) == Some(b"ustar".as_slice())
}

/// Unpacks `archive` into `dest`, which must not exist yet. Entries are written
/// to a hidden sibling directory first and renamed into place only once every
/// entry has been extracted, so a rejected archive leaves nothing behind.
pub fn extract(archive: &Path, dest: &Path) -> Result<ArchiveFormat> {
    let format = match detect(archive)? {
        Signature::Archive(format) => format,
        Signature::Unsupported(name) => {
            return Err(ModError::UnsupportedFormat {
                signature: name.to_string(),
            })
        }
        Signature::Unknown => {
            return Err(ModError::UnsupportedFormat {
                signature: format!("unrecognized ({})", hex_prefix(archive)),
            })
        }
    };
    if dest.exists() {
        return Err(ModError::io(
            format!("extract into {}", dest.display()),
            io::Error::new(io::ErrorKind::AlreadyExists, "destination already exists"),
        ));
    }

    let partial = partial_dir(dest)?;
    if partial.exists() {
        fs::remove_dir_all(&partial).io_context("clear stale extraction dir")?;
    }
    fs::create_dir_all(&partial).io_context("create extraction dir")?;
    let mut guard = StagingGuard::new(partial.clone());

    match format {
        ArchiveFormat::Zip => extract_zip(archive, &partial)?,
        ArchiveFormat::Tar => extract_tar(open(archive)?, &partial)?,
        ArchiveFormat::TarGz => extract_tar(GzDecoder::new(open(archive)?), &partial)?,
        ArchiveFormat::TarBz2 => extract_tar(BzDecoder::new(open(archive)?), &partial)?,
    }

    fs::rename(&partial, dest).io_context("move extracted files into place")?;
    guard.disarm();
    info!(
        archive = %archive.display(),
        format = format.label(),
        "extracted archive"
    );
    Ok(format)
}

fn open(path: &Path) -> Result<File> {
    File::open(path).io_context(format!("open {}", path.display()))
}

fn partial_dir(dest: &Path) -> Result<PathBuf> {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ModError::io("extract", io::Error::new(io::ErrorKind::InvalidInput, "destination has no name")))?;
    Ok(dest.with_file_name(format!(".{name}.partial")))
}

/// Lexically resolves an entry name below the extraction root. `Ok(None)` is the
/// root itself; anything absolute or climbing out with `..` is rejected.
pub fn safe_entry_path(name: &str) -> Result<Option<PathBuf>> {
    let normalized = name.replace('\\', "/");
    let unsafe_entry = |reason: &str| ModError::UnsafeArchiveEntry {
        entry: name.to_string(),
        reason: reason.to_string(),
    };

    if normalized.starts_with('/') {
        return Err(unsafe_entry("absolute path"));
    }
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(unsafe_entry("absolute path"));
    }

    let mut out = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(unsafe_entry("escapes the destination directory")),
            part if part.contains('\0') => return Err(unsafe_entry("contains a NUL byte")),
            part => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(out))
    }
}

fn extract_zip(path: &Path, dest: &Path) -> Result<()> {
    let file = open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(zip_error)?;

    let mut planned = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index).map_err(zip_error)?;
        let target = safe_entry_path(entry.name())?;
        planned.push((index, target, entry.is_dir()));
    }

    for (index, target, is_dir) in planned {
        let Some(rel) = target else {
            continue;
        };
        if is_ignored_path(&rel) {
            continue;
        }
        let out_path = dest.join(&rel);
        if is_dir {
            fs::create_dir_all(&out_path).io_context("create zip dir")?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).io_context("create zip dir")?;
        }

        let mut entry = archive.by_index(index).map_err(zip_error)?;
        let mut out_file = File::create(&out_path).io_context("write zip entry")?;
        io::copy(&mut entry, &mut out_file).io_context("extract zip entry")?;
        if let Some(mtime) = entry.last_modified().and_then(zip_time_to_unix) {
            let _ = set_file_mtime(&out_path, FileTime::from_unix_time(mtime, 0));
        }
    }
    Ok(())
}

fn zip_error(err: zip::result::ZipError) -> ModError {
    match err {
        zip::result::ZipError::Io(err) => ModError::io("read zip", err),
        other => ModError::UnsupportedFormat {
            signature: format!("zip ({other})"),
        },
    }
}

fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().io_context("read tar entries")? {
        let mut entry = entry.io_context("read tar entry")?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            return Err(ModError::UnsafeArchiveEntry {
                entry: name,
                reason: "links are not allowed".to_string(),
            });
        }
        let Some(rel) = safe_entry_path(&name)? else {
            continue;
        };
        if is_ignored_path(&rel) {
            continue;
        }

        let out_path = dest.join(&rel);
        if kind.is_dir() {
            fs::create_dir_all(&out_path).io_context("create tar dir")?;
            continue;
        }
        if !kind.is_file() {
            // pax/gnu metadata records
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).io_context("create tar dir")?;
        }
        let mut out_file = File::create(&out_path).io_context("write tar entry")?;
        io::copy(&mut entry, &mut out_file).io_context("extract tar entry")?;
        if let Ok(mtime) = entry.header().mtime() {
            let _ = set_file_mtime(&out_path, FileTime::from_unix_time(mtime as i64, 0));
        }
    }
    Ok(())
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    let datetime = PrimitiveDateTime::new(date, time).assume_utc();
    Some(datetime.unix_timestamp())
}

fn hex_prefix(path: &Path) -> String {
    let mut head = [0u8; 8];
    let read = File::open(path)
        .and_then(|mut file| file.read(&mut head))
        .unwrap_or(0);
    head[..read]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{fs::File, io::Write, path::Path};
    use zip::write::SimpleFileOptions;

    pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    pub fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_ustar();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            let raw = &mut header.as_old_mut().name;
            raw[..name.len()].copy_from_slice(name.as_bytes());
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }
}
