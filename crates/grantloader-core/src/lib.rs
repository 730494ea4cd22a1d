//! Core entity model for the grant loader: the flat source records handed over by a
//! connector and the Funder / Person / Grant resources they are reconciled into.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "grantloader-core";

/// One flat source row. Absent and blank values are both treated as "no value".
pub type Record = BTreeMap<String, String>;

/// Canonical record field names produced by every connector.
pub mod fields {
    pub const GRANT_LOCAL_KEY: &str = "GRANT_NUMBER";
    pub const GRANT_AWARD_NUMBER: &str = "AWARD_ID";
    pub const GRANT_AWARD_STATUS: &str = "AWARD_STATUS";
    pub const GRANT_PROJECT_NAME: &str = "TITLE";
    pub const GRANT_AWARD_DATE: &str = "AWARD_DATE";
    pub const GRANT_START_DATE: &str = "AWARD_START";
    pub const GRANT_END_DATE: &str = "AWARD_END";
    pub const GRANT_UPDATE_TIMESTAMP: &str = "UPDATE_TIMESTAMP";

    pub const DIRECT_FUNDER_LOCAL_KEY: &str = "SPONSOR_CODE";
    pub const DIRECT_FUNDER_NAME: &str = "SPONSOR";
    pub const DIRECT_FUNDER_POLICY: &str = "SPONSOR_POLICY";
    pub const PRIMARY_FUNDER_LOCAL_KEY: &str = "PRIME_SPONSOR_CODE";
    pub const PRIMARY_FUNDER_NAME: &str = "PRIME_SPONSOR";
    pub const PRIMARY_FUNDER_POLICY: &str = "PRIME_SPONSOR_POLICY";

    pub const USER_FIRST_NAME: &str = "FIRST_NAME";
    pub const USER_MIDDLE_NAME: &str = "MIDDLE_NAME";
    pub const USER_LAST_NAME: &str = "LAST_NAME";
    pub const USER_EMAIL: &str = "EMAIL_ADDRESS";
    pub const USER_EMPLOYEE_ID: &str = "EMPLOYEE_ID";
    pub const USER_INSTITUTION_ID: &str = "INSTITUTION_ID";
    pub const USER_LOGIN: &str = "LOGIN_ID";
    pub const USER_UPDATE_TIMESTAMP: &str = "USER_UPDATE_TIMESTAMP";
    pub const ABBREVIATED_ROLE: &str = "ABBREVIATED_ROLE";
}

/// Returns the trimmed value of `field`, or `None` when it is missing or blank.
pub fn record_value<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record
        .get(field)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Opaque identifier assigned by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(String);

impl RepoId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Funder,
    Person,
    Grant,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Funder => "funder",
            EntityKind::Person => "person",
            EntityKind::Grant => "grant",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AwardStatus {
    Active,
    PreAward,
    Terminated,
    #[default]
    Unknown,
}

impl AwardStatus {
    /// Unrecognized codes map to `Unknown` instead of failing the record.
    pub fn parse(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "active" => AwardStatus::Active,
            "pre-award" | "pre award" | "preaward" => AwardStatus::PreAward,
            "terminated" => AwardStatus::Terminated,
            _ => AwardStatus::Unknown,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, AwardStatus::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvestigatorRole {
    Primary,
    Secondary,
    Unknown,
}

impl InvestigatorRole {
    /// `P` marks the PI. Any other investigator code (`C`, `K`, `COI`, ...) is a Co-PI.
    /// Blank or non-alphabetic codes are `Unknown`.
    pub fn parse(code: &str) -> Self {
        let code = code.trim().to_ascii_uppercase();
        match code.as_str() {
            "P" | "PI" => InvestigatorRole::Primary,
            "" => InvestigatorRole::Unknown,
            other if other.chars().all(|c| c.is_ascii_alphabetic() || c == '-') => {
                InvestigatorRole::Secondary
            }
            _ => InvestigatorRole::Unknown,
        }
    }
}

/// Which kind of source system produced a batch. Decides column mapping and merge policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceProfile {
    /// Institutional grants database export; supplies every field.
    #[default]
    Coeus,
    /// Periodic spreadsheet export; has no middle names, award status, policies or timestamps.
    Spreadsheet,
}

impl SourceProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceProfile::Coeus => "coeus",
            SourceProfile::Spreadsheet => "spreadsheet",
        }
    }
}

impl FromStr for SourceProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coeus" => Ok(SourceProfile::Coeus),
            "spreadsheet" | "csv" => Ok(SourceProfile::Spreadsheet),
            other => Err(format!("unknown source profile {other:?}")),
        }
    }
}

/// Identifier namespaces used in person locator ids, most reliable first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierType {
    EmployeeId,
    UniqueId,
    Eppn,
}

impl IdentifierType {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierType::EmployeeId => "employeeid",
            IdentifierType::UniqueId => "unique-id",
            IdentifierType::Eppn => "eppn",
        }
    }
}

pub fn locator_id(domain: &str, id_type: IdentifierType, value: &str) -> String {
    format!("{domain}:{}:{value}", id_type.as_str())
}

pub fn grant_local_key(domain: &str, key: &str) -> String {
    format!("{domain}:grant:{key}")
}

pub fn funder_local_key(domain: &str, key: &str) -> String {
    format!("{domain}:funder:{key}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonRole {
    Admin,
    Submitter,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Funder {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RepoId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<RepoId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RepoId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Ordered most to least reliable; entries are unique.
    #[serde(default)]
    pub locator_ids: Vec<String>,
    #[serde(default)]
    pub roles: BTreeSet<PersonRole>,
}

impl Person {
    /// Highest-priority locator id, used as the per-batch natural key.
    pub fn natural_key(&self) -> Option<&str> {
        self.locator_ids.first().map(String::as_str)
    }

    /// Appends `id` unless it is already present.
    pub fn push_locator_id(&mut self, id: String) {
        if !self.locator_ids.contains(&id) {
            self.locator_ids.push(id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RepoId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub award_number: Option<String>,
    #[serde(default, skip_serializing_if = "AwardStatus::is_unknown")]
    pub award_status: AwardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub award_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_funder: Option<RepoId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_funder: Option<RepoId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pi: Option<RepoId>,
    #[serde(default)]
    pub co_pis: Vec<RepoId>,
}

impl Grant {
    /// Sets the PI unless one is already assigned. Returns whether the PI changed.
    pub fn assign_pi(&mut self, person: RepoId) -> bool {
        if self.pi.is_some() {
            return false;
        }
        self.co_pis.retain(|id| id != &person);
        self.pi = Some(person);
        true
    }

    /// Adds a Co-PI unless it is the PI or already listed. Returns whether it was added.
    pub fn add_co_pi(&mut self, person: RepoId) -> bool {
        if self.pi.as_ref() == Some(&person) || self.co_pis.contains(&person) {
            return false;
        }
        self.co_pis.push(person);
        true
    }
}

/// A repository resource of any supported kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Resource {
    Funder(Funder),
    Person(Person),
    Grant(Grant),
}

impl Resource {
    pub fn kind(&self) -> EntityKind {
        match self {
            Resource::Funder(_) => EntityKind::Funder,
            Resource::Person(_) => EntityKind::Person,
            Resource::Grant(_) => EntityKind::Grant,
        }
    }

    pub fn id(&self) -> Option<&RepoId> {
        match self {
            Resource::Funder(f) => f.id.as_ref(),
            Resource::Person(p) => p.id.as_ref(),
            Resource::Grant(g) => g.id.as_ref(),
        }
    }

    pub fn set_id(&mut self, id: RepoId) {
        match self {
            Resource::Funder(f) => f.id = Some(id),
            Resource::Person(p) => p.id = Some(id),
            Resource::Grant(g) => g.id = Some(id),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized timestamp {0:?}; expected yyyy-mm-dd hh:mm:ss[.f] or mm/dd/yyyy")]
pub struct TimestampError(pub String);

/// Parses the two timestamp layouts source systems emit into a comparable UTC instant.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, TimestampError> {
    let trimmed = text.trim();
    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, layout) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%m/%d/%Y") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(TimestampError(text.to_string()))
}
