use std::cmp::Ordering;

/// A `major.minor[.patch][-pre][+build]` tag, optionally prefixed with `v`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Vec<Identifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Numeric(u64),
    Alpha(String),
}

impl SemVer {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let core_and_pre = trimmed.split('+').next()?;
        let (core, pre) = match core_and_pre.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (core_and_pre, None),
        };

        let mut parts = core.split('.');
        let major = parse_number(parts.next()?)?;
        let minor = parse_number(parts.next()?)?;
        let patch = match parts.next() {
            Some(part) => parse_number(part)?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }

        let prerelease = match pre {
            Some(pre) => pre
                .split('.')
                .map(|part| {
                    if part.is_empty() || !part.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-') {
                        None
                    } else if let Ok(value) = part.parse::<u64>() {
                        Some(Identifier::Numeric(value))
                    } else {
                        Some(Identifier::Alpha(part.to_string()))
                    }
                })
                .collect::<Option<Vec<_>>>()?,
            None => Vec::new(),
        };

        Some(Self {
            major,
            minor,
            patch,
            prerelease,
        })
    }
}

fn parse_number(part: &str) -> Option<u64> {
    if part.is_empty() || !part.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Identifier::Numeric(a), Identifier::Numeric(b)) => a.cmp(b),
            (Identifier::Numeric(_), Identifier::Alpha(_)) => Ordering::Less,
            (Identifier::Alpha(_), Identifier::Numeric(_)) => Ordering::Greater,
            (Identifier::Alpha(a), Identifier::Alpha(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (self.prerelease.is_empty(), other.prerelease.is_empty()) {
                (true, true) => Ordering::Equal,
                // a release outranks any of its prereleases
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.prerelease.cmp(&other.prerelease),
            })
    }
}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Whether `latest` should be offered over `current`. Semver tags are ordered;
/// anything else (commit SHAs, content hashes, free-form tags) is compared for
/// inequality only.
pub fn is_update(current: &str, latest: &str) -> bool {
    match (SemVer::parse(current), SemVer::parse(latest)) {
        (Some(current), Some(latest)) => latest > current,
        _ => current.trim() != latest.trim(),
    }
}

/// Highest semver tag in `tags`, falling back to the first entry.
pub fn pick_latest_tag<'a>(tags: &'a [String]) -> Option<&'a str> {
    tags.iter()
        .filter_map(|tag| SemVer::parse(tag).map(|parsed| (parsed, tag)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, tag)| tag.as_str())
        .or_else(|| tags.first().map(String::as_str))
}
