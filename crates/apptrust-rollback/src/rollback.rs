//! PROD rollback: quarantine one application version and, if it held `latest`, hand the
//! tag to the next SemVer-highest eligible version.
//!
//! Every tag change is sent together with a backup of the previous tag
//! (`original_tag_before_quarantine` / `original_tag_before_latest`) in a single patch, so a
//! human can reverse the rollback from the registry alone.

use std::fmt;

use apptrust_client::{RegistryClient, VersionPatch, VersionRecord};
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::semver::Version;

pub const RELEASED: &str = "RELEASED";
pub const TRUSTED_RELEASE: &str = "TRUSTED_RELEASE";
pub const BACKUP_BEFORE_QUARANTINE: &str = "original_tag_before_quarantine";
pub const BACKUP_BEFORE_LATEST: &str = "original_tag_before_latest";

/// A version tag. `latest` and `quarantine` are reserved; the wire form is plain text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    Untagged,
    Latest,
    Quarantine,
    Other(String),
}

impl Tag {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "" => Tag::Untagged,
            "latest" => Tag::Latest,
            "quarantine" => Tag::Quarantine,
            other => Tag::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Tag::Untagged => "",
            Tag::Latest => "latest",
            Tag::Quarantine => "quarantine",
            Tag::Other(s) => s,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Release statuses that make a version part of the PROD set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseStatus {
    Released,
    TrustedRelease,
}

impl ReleaseStatus {
    /// `None` for every status outside the PROD set.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            RELEASED => Some(ReleaseStatus::Released),
            TRUSTED_RELEASE => Some(ReleaseStatus::TrustedRelease),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseStatus::Released => RELEASED,
            ReleaseStatus::TrustedRelease => TRUSTED_RELEASE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProdVersion {
    pub version: String,
    pub tag: Tag,
    pub status: ReleaseStatus,
    pub semver: Option<Version>,
}

/// The eligible versions of one application, SemVer-descending.
///
/// Versions that do not parse are kept apart: they can still be looked up by literal but
/// never take part in ordering or successor selection.
#[derive(Debug, Clone, Default)]
pub struct ProdSnapshot {
    ordered: Vec<ProdVersion>,
    unordered: Vec<ProdVersion>,
}

impl ProdSnapshot {
    pub fn from_records(records: impl IntoIterator<Item = VersionRecord>) -> Self {
        let mut ordered = Vec::new();
        let mut unordered = Vec::new();
        for record in records {
            let Some(status) = ReleaseStatus::from_wire(&record.release_status) else {
                continue;
            };
            let entry = ProdVersion {
                semver: Version::parse(&record.version),
                tag: Tag::from_wire(&record.tag),
                version: record.version,
                status,
            };
            if entry.semver.is_some() {
                ordered.push(entry);
            } else {
                debug!(version = %entry.version, "not semver; excluded from ordering");
                unordered.push(entry);
            }
        }
        // Stable: equal-precedence records keep their registry order.
        ordered.sort_by(|a, b| b.semver.cmp(&a.semver));
        debug!(
            ordered = ordered.len(),
            unordered = unordered.len(),
            "built PROD snapshot"
        );
        Self { ordered, unordered }
    }

    /// Parseable versions, highest first.
    pub fn ordered(&self) -> impl Iterator<Item = &ProdVersion> {
        self.ordered.iter()
    }

    /// Record whose version string is exactly `version`; the last one listed wins on duplicates.
    pub fn find(&self, version: &str) -> Option<&ProdVersion> {
        self.ordered
            .iter()
            .chain(&self.unordered)
            .rev()
            .find(|v| v.version == version)
    }
}

/// Picks the version that should inherit `latest` once `exclude_version` is gone.
///
/// Quarantined records never qualify. When several records share the winning version
/// string, a `TRUSTED_RELEASE` one is preferred over the first one seen.
pub fn pick_next_latest<'a>(
    snapshot: &'a ProdSnapshot,
    exclude_version: &str,
) -> Option<&'a ProdVersion> {
    let mut groups: Vec<(&str, Vec<&'a ProdVersion>)> = Vec::new();
    for entry in snapshot.ordered() {
        if entry.version == exclude_version || entry.tag == Tag::Quarantine {
            continue;
        }
        match groups.iter_mut().find(|(v, _)| *v == entry.version) {
            Some((_, members)) => members.push(entry),
            None => groups.push((entry.version.as_str(), vec![entry])),
        }
    }

    let (_, candidates) = groups.into_iter().next()?;
    candidates
        .iter()
        .find(|c| c.status == ReleaseStatus::TrustedRelease)
        .or_else(|| candidates.first())
        .copied()
}

/// A tag change plus the backup of the tag it replaces; always sent as one patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagMutation {
    pub version: String,
    pub backup_key: &'static str,
    pub previous_tag: Tag,
    pub new_tag: Tag,
}

impl TagMutation {
    pub fn to_patch(&self) -> VersionPatch {
        VersionPatch::tag_only(self.new_tag.as_str()).with_property(
            self.backup_key,
            vec![self.previous_tag.as_str().to_string()],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LatestChange {
    /// The target did not hold `latest`.
    Unchanged,
    Reassigned {
        mutation: TagMutation,
        release_status: ReleaseStatus,
    },
    /// The target held `latest` and nothing can take over; `latest` is now unset.
    NoSuccessor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    pub app: String,
    pub target: String,
    pub dry_run: bool,
    pub had_latest: bool,
    pub quarantine: TagMutation,
    pub latest: LatestChange,
}

impl RollbackOutcome {
    pub fn successor(&self) -> Option<&str> {
        match &self.latest {
            LatestChange::Reassigned { mutation, .. } => Some(&mutation.version),
            LatestChange::Unchanged | LatestChange::NoSuccessor => None,
        }
    }

    /// Patches in the order they were (or, in a dry run, would have been) sent.
    pub fn mutations(&self) -> Vec<&TagMutation> {
        let mut out = vec![&self.quarantine];
        if let LatestChange::Reassigned { mutation, .. } = &self.latest {
            out.push(mutation);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ListVersions,
    Quarantine,
    ReassignLatest,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::ListVersions => "list versions",
            Phase::Quarantine => "quarantine",
            Phase::ReassignLatest => "reassign latest",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("target version not found in PROD set: {version} (application {app})")]
    TargetNotFound { app: String, version: String },

    #[error("{phase} failed for application {app}{}: {detail}{}", version_suffix(.version), partial_suffix(.partial))]
    Transport {
        phase: Phase,
        app: String,
        version: Option<String>,
        detail: String,
        partial: Option<String>,
    },
}

fn version_suffix(version: &Option<String>) -> String {
    version
        .as_deref()
        .map(|v| format!(" version {v}"))
        .unwrap_or_default()
}

fn partial_suffix(partial: &Option<String>) -> String {
    partial
        .as_deref()
        .map(|p| format!(" ({p})"))
        .unwrap_or_default()
}

impl RollbackError {
    pub fn code(&self) -> &'static str {
        match self {
            RollbackError::InvalidInput(_) => "APPTRUST_INVALID_INPUT",
            RollbackError::TargetNotFound { .. } => "APPTRUST_TARGET_NOT_FOUND",
            RollbackError::Transport { .. } => "APPTRUST_TRANSPORT",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            RollbackError::InvalidInput(_) => 2,
            RollbackError::TargetNotFound { .. } | RollbackError::Transport { .. } => 1,
        }
    }

    fn transport(
        phase: Phase,
        app: &str,
        version: Option<&str>,
        err: anyhow::Error,
        partial: Option<String>,
    ) -> Self {
        RollbackError::Transport {
            phase,
            app: app.to_string(),
            version: version.map(str::to_string),
            detail: format!("{err:#}"),
            partial,
        }
    }
}

/// Rolls `target_version` of `app_key` back in PROD.
///
/// 1. Backs up the target's tag to `original_tag_before_quarantine` and tags it `quarantine`.
/// 2. If the target held `latest`, backs up the successor's tag to
///    `original_tag_before_latest` and tags it `latest`.
///
/// With `dry_run` every decision is still made and returned, but no patch is sent. The first
/// failing call aborts the run; completed patches are left in place.
pub fn rollback_in_prod(
    client: &dyn RegistryClient,
    app_key: &str,
    target_version: &str,
    dry_run: bool,
) -> Result<RollbackOutcome, RollbackError> {
    if app_key.trim().is_empty() {
        return Err(RollbackError::InvalidInput(
            "application key must be non-empty".to_string(),
        ));
    }
    if target_version.trim().is_empty() {
        return Err(RollbackError::InvalidInput(
            "target version must be non-empty".to_string(),
        ));
    }

    let records = client
        .list_versions(app_key)
        .map_err(|err| RollbackError::transport(Phase::ListVersions, app_key, None, err, None))?;
    let snapshot = ProdSnapshot::from_records(records);

    let Some(target) = snapshot.find(target_version) else {
        return Err(RollbackError::TargetNotFound {
            app: app_key.to_string(),
            version: target_version.to_string(),
        });
    };
    let had_latest = target.tag == Tag::Latest;
    if target.tag == Tag::Quarantine {
        // Accepted as-is: the backup will record `quarantine` as the original tag.
        warn!(app = app_key, version = target_version, "target is already quarantined");
    }

    let quarantine = TagMutation {
        version: target.version.clone(),
        backup_key: BACKUP_BEFORE_QUARANTINE,
        previous_tag: target.tag.clone(),
        new_tag: Tag::Quarantine,
    };
    submit(client, app_key, &quarantine, dry_run).map_err(|err| {
        RollbackError::transport(Phase::Quarantine, app_key, Some(target_version), err, None)
    })?;

    let latest = if !had_latest {
        info!(app = app_key, version = target_version, "target did not hold latest");
        LatestChange::Unchanged
    } else {
        match pick_next_latest(&snapshot, target_version) {
            None => {
                info!(app = app_key, "no successor for latest");
                LatestChange::NoSuccessor
            }
            Some(successor) => {
                info!(
                    app = app_key,
                    version = %successor.version,
                    release_status = successor.status.as_str(),
                    "selected successor for latest"
                );
                let mutation = TagMutation {
                    version: successor.version.clone(),
                    backup_key: BACKUP_BEFORE_LATEST,
                    previous_tag: successor.tag.clone(),
                    new_tag: Tag::Latest,
                };
                submit(client, app_key, &mutation, dry_run).map_err(|err| {
                    warn!(
                        app = app_key,
                        version = target_version,
                        "target quarantined but latest reassignment failed"
                    );
                    RollbackError::transport(
                        Phase::ReassignLatest,
                        app_key,
                        Some(&successor.version),
                        err,
                        Some(format!(
                            "{target_version} is already quarantined and no version holds latest; \
                             its previous tag is in {BACKUP_BEFORE_QUARANTINE}"
                        )),
                    )
                })?;
                LatestChange::Reassigned {
                    mutation,
                    release_status: successor.status,
                }
            }
        }
    };

    Ok(RollbackOutcome {
        app: app_key.to_string(),
        target: target_version.to_string(),
        dry_run,
        had_latest,
        quarantine,
        latest,
    })
}

fn submit(
    client: &dyn RegistryClient,
    app_key: &str,
    mutation: &TagMutation,
    dry_run: bool,
) -> anyhow::Result<()> {
    let patch = mutation.to_patch();
    if dry_run {
        info!(
            app = app_key,
            version = %mutation.version,
            tag = %mutation.new_tag,
            backup_key = mutation.backup_key,
            "dry run: patch not sent"
        );
        return Ok(());
    }
    info!(
        app = app_key,
        version = %mutation.version,
        tag = %mutation.new_tag,
        backup_key = mutation.backup_key,
        "patching tag with backup"
    );
    client.patch_version(app_key, &mutation.version, &patch)
}
