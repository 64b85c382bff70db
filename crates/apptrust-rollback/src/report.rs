use serde::Serialize;

use crate::rollback::{LatestChange, RollbackError, RollbackOutcome};

pub const COMMAND: &str = "rollback";

#[derive(Debug, Serialize)]
pub struct ReportError {
    pub code: String,
    pub message: String,
}

/// Machine-readable result printed with `--json`.
#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub ok: bool,
    pub command: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'a RollbackOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
}

impl<'a> Report<'a> {
    pub fn success(outcome: &'a RollbackOutcome) -> Self {
        Self {
            ok: true,
            command: COMMAND,
            result: Some(outcome),
            error: None,
        }
    }

    pub fn failure(err: &RollbackError) -> Self {
        Self {
            ok: false,
            command: COMMAND,
            result: None,
            error: Some(ReportError {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// Human status lines for a finished rollback, in the order the work happened.
pub fn status_lines(outcome: &RollbackOutcome) -> Vec<String> {
    let prefix = if outcome.dry_run { "[DRY-RUN] " } else { "" };
    let mut lines = Vec::new();
    for mutation in outcome.mutations() {
        let patch = mutation.to_patch();
        let props = serde_json::to_string(&patch.properties).unwrap_or_default();
        lines.push(format!(
            "{prefix}PATCH backup+tag: app={} version={} props={props} tag={}",
            outcome.app, mutation.version, mutation.new_tag
        ));
    }
    lines.push(match &outcome.latest {
        LatestChange::Reassigned { mutation, .. } => {
            format!("Reassigned latest to {}", mutation.version)
        }
        LatestChange::NoSuccessor => {
            "No successor found for latest; system will have no 'latest' until next promote."
                .to_string()
        }
        LatestChange::Unchanged => {
            "Rolled back non-latest version; 'latest' unchanged.".to_string()
        }
    });
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::{
        ReleaseStatus, Tag, TagMutation, BACKUP_BEFORE_LATEST, BACKUP_BEFORE_QUARANTINE,
    };

    fn outcome(dry_run: bool, latest: LatestChange) -> RollbackOutcome {
        RollbackOutcome {
            app: "web".to_string(),
            target: "1.4.0".to_string(),
            dry_run,
            had_latest: !matches!(latest, LatestChange::Unchanged),
            quarantine: TagMutation {
                version: "1.4.0".to_string(),
                backup_key: BACKUP_BEFORE_QUARANTINE,
                previous_tag: Tag::Latest,
                new_tag: Tag::Quarantine,
            },
            latest,
        }
    }

    fn reassigned() -> LatestChange {
        LatestChange::Reassigned {
            mutation: TagMutation {
                version: "1.3.2".to_string(),
                backup_key: BACKUP_BEFORE_LATEST,
                previous_tag: Tag::Untagged,
                new_tag: Tag::Latest,
            },
            release_status: ReleaseStatus::Released,
        }
    }

    #[test]
    fn dry_run_lines_show_each_intended_patch() {
        let lines = status_lines(&outcome(true, reassigned()));
        assert_eq!(
            lines,
            vec![
                r#"[DRY-RUN] PATCH backup+tag: app=web version=1.4.0 props={"original_tag_before_quarantine":["latest"]} tag=quarantine"#,
                r#"[DRY-RUN] PATCH backup+tag: app=web version=1.3.2 props={"original_tag_before_latest":[""]} tag=latest"#,
                "Reassigned latest to 1.3.2",
            ]
        );
    }

    #[test]
    fn live_lines_for_no_successor() {
        let lines = status_lines(&outcome(false, LatestChange::NoSuccessor));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("PATCH backup+tag: app=web version=1.4.0"));
        assert_eq!(
            lines[1],
            "No successor found for latest; system will have no 'latest' until next promote."
        );
    }

    #[test]
    fn json_report_shape() {
        let out = outcome(false, reassigned());
        let v = serde_json::to_value(Report::success(&out)).unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(v["command"], "rollback");
        assert!(v.get("error").is_none());
        assert_eq!(v["result"]["quarantine"]["previous_tag"], "latest");
        assert_eq!(v["result"]["latest"]["kind"], "reassigned");
        assert_eq!(v["result"]["latest"]["mutation"]["version"], "1.3.2");
        assert_eq!(v["result"]["latest"]["release_status"], "RELEASED");

        let err = RollbackError::TargetNotFound {
            app: "web".to_string(),
            version: "9.9.9".to_string(),
        };
        let v = serde_json::to_value(Report::failure(&err)).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "APPTRUST_TARGET_NOT_FOUND");
        assert!(v.get("result").is_none());
    }
}
