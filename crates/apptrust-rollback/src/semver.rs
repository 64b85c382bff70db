use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PreId {
    Numeric(u64),
    AlphaNum(String),
}

impl PreId {
    fn cmp_precedence(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PreId::Numeric(a), PreId::Numeric(b)) => a.cmp(b),
            (PreId::Numeric(_), PreId::AlphaNum(_)) => Ordering::Less,
            (PreId::AlphaNum(_), PreId::Numeric(_)) => Ordering::Greater,
            (PreId::AlphaNum(a), PreId::AlphaNum(b)) => a.as_bytes().cmp(b.as_bytes()),
        }
    }
}

impl fmt::Display for PreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreId::Numeric(n) => write!(f, "{n}"),
            PreId::AlphaNum(s) => f.write_str(s),
        }
    }
}

/// A parsed semantic version.
///
/// Equality and ordering follow SemVer precedence only: the literal the value was parsed
/// from and any build metadata are kept for display but never compared.
#[derive(Debug, Clone)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Vec<PreId>,
    original: String,
}

impl Version {
    /// Parses `[v]MAJOR.MINOR.PATCH[-PRE][+BUILD]`, tolerating surrounding whitespace.
    pub fn parse(version: &str) -> Option<Version> {
        let trimmed = version.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let (core_and_pre, build) = match body.split_once('+') {
            Some((a, b)) => (a, Some(b)),
            None => (body, None),
        };
        if let Some(build) = build {
            if !build.split('.').all(is_valid_build_identifier) {
                return None;
            }
        }
        let (core, pre) = match core_and_pre.split_once('-') {
            Some((a, b)) => (a, Some(b)),
            None => (core_and_pre, None),
        };

        let mut parts = core.split('.');
        let major = parse_numeric_identifier(parts.next()?)?;
        let minor = parse_numeric_identifier(parts.next()?)?;
        let patch = parse_numeric_identifier(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }

        let mut pre_ids = Vec::new();
        if let Some(pre) = pre {
            for raw in pre.split('.') {
                pre_ids.push(parse_prerelease_identifier(raw)?);
            }
        }

        Some(Version {
            major,
            minor,
            patch,
            pre: pre_ids,
            original: version.to_string(),
        })
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| self.patch.cmp(&other.patch))
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    for (a, b) in self.pre.iter().zip(&other.pre) {
                        let c = a.cmp_precedence(b);
                        if c != Ordering::Equal {
                            return c;
                        }
                    }
                    self.pre.len().cmp(&other.pre.len())
                }
            })
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        for (i, id) in self.pre.iter().enumerate() {
            f.write_str(if i == 0 { "-" } else { "." })?;
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

/// Sorts version strings highest first, dropping the ones that do not parse.
pub fn sort_versions_desc<S: AsRef<str>>(versions: &[S]) -> Vec<String> {
    let mut parsed: Vec<Version> = versions
        .iter()
        .filter_map(|v| Version::parse(v.as_ref()))
        .collect();
    parsed.sort_by(|a, b| b.cmp(a));
    parsed.into_iter().map(|v| v.original).collect()
}

fn parse_numeric_identifier(id: &str) -> Option<u64> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if id != "0" && id.starts_with('0') {
        return None;
    }
    id.parse::<u64>().ok()
}

fn parse_prerelease_identifier(id: &str) -> Option<PreId> {
    if id.is_empty() {
        return None;
    }
    if id.bytes().all(|b| b.is_ascii_digit()) {
        return parse_numeric_identifier(id).map(PreId::Numeric);
    }
    id.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        .then(|| PreId::AlphaNum(id.to_string()))
}

fn is_valid_build_identifier(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}
