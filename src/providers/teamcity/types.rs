//! Wire shapes of the TeamCity REST API and their normalization.
//!
//! TeamCity is loose about a few shapes: ids are numbers, collections that hold
//! one element sometimes arrive as a bare object, and nested sections are
//! omitted instead of empty. Everything is normalized here, once.

use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};

use crate::build::{BuildState, BuildStatus, TestCounts};
use crate::queue::{QueueEntry, QueuedBuild};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%z";

/// A field that is either a single object or an array of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(super) enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub(super) fn into_vec(self) -> Vec<T> {
        match self {
            Self::Many(items) => items,
            Self::One(item) => vec![item],
        }
    }
}

/// Accepts ids serialized as either JSON numbers or strings.
fn string_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Number(i64),
        Text(String),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Number(n) => n.to_string(),
        Id::Text(s) => s,
    })
}

/// Parses TeamCity's compact timestamp (`20240101T120000+0000`), falling
/// back to RFC 3339.
pub(super) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct BuildRef {
    #[serde(deserialize_with = "string_id")]
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(super) struct BuildRefs {
    #[serde(default)]
    pub build: OneOrMany<BuildRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RunningInfo {
    pub percentage_complete: Option<f64>,
    pub elapsed_seconds: Option<f64>,
    pub estimated_total_seconds: Option<f64>,
    pub current_stage_text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(super) struct UserRef {
    pub username: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(super) struct Triggered {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub user: Option<UserRef>,
}

impl Triggered {
    fn describe(&self) -> String {
        self.user
            .as_ref()
            .and_then(|u| u.username.clone().or_else(|| u.name.clone()))
            .or_else(|| self.kind.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(super) struct TestOccurrences {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub ignored: u32,
    #[serde(default)]
    pub muted: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct ProblemOccurrence {
    pub details: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ProblemOccurrences {
    #[serde(default)]
    pub problem_occurrence: OneOrMany<ProblemOccurrence>,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct Property {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(super) struct Properties {
    #[serde(default)]
    pub property: OneOrMany<Property>,
}

impl Properties {
    pub(super) fn into_map(self) -> IndexMap<String, String> {
        self.property
            .into_vec()
            .into_iter()
            .map(|p| (p.name, p.value))
            .collect()
    }
}

/// Build object as returned by `builds/...` and `buildQueue/...`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct BuildPayload {
    #[serde(deserialize_with = "string_id")]
    pub id: String,
    #[serde(default)]
    pub build_type_id: String,
    pub state: Option<String>,
    pub status: Option<String>,
    pub status_text: Option<String>,
    pub percentage_complete: Option<f64>,
    pub branch_name: Option<String>,
    pub web_url: Option<String>,
    pub queued_date: Option<String>,
    pub start_date: Option<String>,
    pub finish_date: Option<String>,
    pub start_estimate: Option<String>,
    pub wait_reason: Option<String>,
    pub queue_position: Option<u32>,
    #[serde(default)]
    pub personal: bool,
    #[serde(rename = "running-info")]
    pub running_info: Option<RunningInfo>,
    pub canceled_info: Option<serde_json::Value>,
    pub triggered: Option<Triggered>,
    #[serde(rename = "snapshot-dependencies")]
    pub snapshot_dependencies: Option<BuildRefs>,
    pub test_occurrences: Option<TestOccurrences>,
    pub problem_occurrences: Option<ProblemOccurrences>,
    pub properties: Option<Properties>,
}

impl BuildPayload {
    fn dependency_ids(&self) -> Vec<String> {
        self.snapshot_dependencies
            .clone()
            .map(|deps| deps.build.into_vec().into_iter().map(|b| b.id).collect())
            .unwrap_or_default()
    }

    pub(super) fn into_status(self) -> BuildStatus {
        let state = self
            .state
            .as_deref()
            .and_then(BuildState::parse)
            .unwrap_or(BuildState::Queued);
        let running = self.running_info.unwrap_or_default();

        let percentage_complete = match state {
            BuildState::Finished => Some(100.0),
            _ => running.percentage_complete.or(self.percentage_complete),
        };

        BuildStatus {
            build_id: self.id,
            build_type_id: self.build_type_id,
            state,
            status: self.status,
            status_text: self.status_text,
            canceled: self.canceled_info.is_some(),
            percentage_complete,
            current_stage_text: running.current_stage_text.filter(|s| !s.is_empty()),
            elapsed_seconds: running.elapsed_seconds,
            estimated_total_seconds: running.estimated_total_seconds,
            queue_position: self.queue_position,
            wait_reason: self.wait_reason,
            web_url: self.web_url,
            branch_name: self.branch_name,
            start_date: self.start_date.as_deref().and_then(parse_timestamp),
            finish_date: self.finish_date.as_deref().and_then(parse_timestamp),
            tests: self.test_occurrences.map(|t| TestCounts {
                total: t.count,
                passed: t.passed,
                failed: t.failed,
                ignored: t.ignored,
                muted: t.muted,
            }),
            problems: self.problem_occurrences.map(|p| {
                p.problem_occurrence
                    .into_vec()
                    .into_iter()
                    .filter_map(|o| o.details.or(o.kind))
                    .collect()
            }),
        }
    }

    pub(super) fn into_queue_entry(self) -> QueueEntry {
        let snapshot_dependencies = self.dependency_ids();
        QueueEntry {
            build_id: self.id,
            build_type_id: self.build_type_id,
            queued_date: self.queued_date.as_deref().and_then(parse_timestamp),
            estimated_start_time: self.start_estimate.as_deref().and_then(parse_timestamp),
            wait_reason: self.wait_reason,
            snapshot_dependencies,
        }
    }

    pub(super) fn into_queued_build(self, queue_position: u32) -> QueuedBuild {
        let estimated_duration = self
            .running_info
            .as_ref()
            .and_then(|r| r.estimated_total_seconds);

        QueuedBuild {
            queue_position: self.queue_position.unwrap_or(queue_position),
            queued_date: self
                .queued_date
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
            estimated_start_time: self.start_estimate.as_deref().and_then(parse_timestamp),
            estimated_duration,
            web_url: self.web_url.unwrap_or_default(),
            personal: self.personal,
            triggered_by: self.triggered.map(|t| t.describe()).unwrap_or_default(),
            parameters: self.properties.map(Properties::into_map).unwrap_or_default(),
            build_id: self.id,
            build_type_id: self.build_type_id,
            branch_name: self.branch_name,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(super) struct BuildList {
    #[serde(default)]
    pub build: OneOrMany<BuildPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(super) struct CountResponse {
    #[serde(default)]
    pub count: usize,
}
