use crate::errors::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CaseType {
    Person,
    Company,
    #[serde(rename = "Threat Intel")]
    ThreatIntel,
    Event,
}

impl CaseType {
    pub const ALL: [CaseType; 4] = [Self::Person, Self::Company, Self::ThreatIntel, Self::Event];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "Person",
            Self::Company => "Company",
            Self::ThreatIntel => "Threat Intel",
            Self::Event => "Event",
        }
    }
}

impl fmt::Display for CaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseType {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| AppError::Invalid(format!("unknown case type '{}'", value)))
    }
}

/// A case as the registry hands it out. The folder is not part of the record;
/// it is always derived from `case_id` and the configured cases root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub case_id: String,
    pub case_type: CaseType,
    pub client_ref: Option<i64>,
    /// Joined from the clients table on read; never written.
    pub client_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseUpdate {
    pub case_id: Option<String>,
    pub client_ref: Option<Option<i64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaseSortKey {
    CaseId,
    CaseType,
    Client,
    #[default]
    CreatedAt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: i64,
    pub name: String,
    pub point_of_contact: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClient {
    pub name: String,
    pub point_of_contact: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPatch {
    pub name: Option<String>,
    pub point_of_contact: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

impl ClientPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.point_of_contact.is_none()
            && self.phone_number.is_none()
            && self.email.is_none()
    }
}

/// Free-form tool parameters. Ordered so the generated command line is stable.
pub type ToolParameters = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ToolRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRunSnapshot {
    pub run_id: String,
    pub tool_name: String,
    pub case_id: String,
    pub status: ToolRunStatus,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRunReport {
    pub run_id: String,
    pub tool_name: String,
    pub case_id: String,
    pub status: ToolRunStatus,
    pub exit_code: Option<i32>,
    /// Final locations inside the case folder.
    pub output_paths: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_type_parses_display_names_case_insensitively() {
        assert_eq!("threat intel".parse::<CaseType>().expect("parse"), CaseType::ThreatIntel);
        assert_eq!(" Company ".parse::<CaseType>().expect("parse"), CaseType::Company);
        let error = "Vehicle".parse::<CaseType>().expect_err("unknown type");
        assert_eq!(error.kind(), "INVALID_INPUT");
    }

    #[test]
    fn case_type_serializes_as_display_name() {
        let json = serde_json::to_string(&CaseType::ThreatIntel).expect("serialize");
        assert_eq!(json, "\"Threat Intel\"");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ToolRunStatus::Pending.is_terminal());
        assert!(!ToolRunStatus::Running.is_terminal());
        assert!(ToolRunStatus::Succeeded.is_terminal());
        assert!(ToolRunStatus::Failed.is_terminal());
    }
}
