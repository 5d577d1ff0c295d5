//! Core domain model for the CSLB license collector.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cslb-core";

/// Public license-detail page; the license number is appended verbatim.
pub const LICENSE_DETAIL_URL: &str =
    "https://www2.cslb.ca.gov/OnlineServices/CheckLicenseII/LicenseDetail.aspx?LicNum=";

pub const POSTAL_CODE_LEN: usize = 5;

/// Postal code → affiliate and affiliate → agency tables. Loaded once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupTables {
    postal_to_affiliate: HashMap<String, String>,
    affiliate_to_agency: HashMap<String, String>,
}

impl LookupTables {
    pub fn new(
        postal_to_affiliate: HashMap<String, String>,
        affiliate_to_agency: HashMap<String, String>,
    ) -> Self {
        Self {
            postal_to_affiliate,
            affiliate_to_agency,
        }
    }

    pub fn affiliate_for(&self, postal_code: &str) -> Option<&str> {
        self.postal_to_affiliate.get(postal_code).map(String::as_str)
    }

    pub fn agency_for(&self, affiliate_id: &str) -> Option<&str> {
        self.affiliate_to_agency.get(affiliate_id).map(String::as_str)
    }

    pub fn postal_code_count(&self) -> usize {
        self.postal_to_affiliate.len()
    }

    pub fn affiliate_count(&self) -> usize {
        self.affiliate_to_agency.len()
    }
}

/// One row of the master file as published. Every column is optional here;
/// validation happens when a [`CanonicalRecord`] is built from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLicenseRow {
    #[serde(rename = "LicenseNo", default)]
    pub license_no: Option<String>,
    #[serde(rename = "ZIPCode", default)]
    pub zip_code: Option<String>,
    #[serde(rename = "FullBusinessName", default)]
    pub full_business_name: Option<String>,
    #[serde(rename = "BusinessName", default)]
    pub business_name: Option<String>,
    #[serde(rename = "MailingAddress", default)]
    pub mailing_address: Option<String>,
    #[serde(rename = "City", default)]
    pub city: Option<String>,
    #[serde(rename = "State", default)]
    pub state: Option<String>,
    #[serde(rename = "IssueDate", default)]
    pub issue_date: Option<String>,
    #[serde(rename = "BusinessPhone", default)]
    pub business_phone: Option<String>,
    #[serde(rename = "ExpirationDate", default)]
    pub expiration_date: Option<String>,
    #[serde(rename = "PrimaryStatus", default)]
    pub primary_status: Option<String>,
    #[serde(rename = "Classifications(s)", default)]
    pub classifications: Option<String>,
}

impl RawLicenseRow {
    /// First five characters of the trimmed ZIP column, or `None` when blank.
    pub fn postal_code(&self) -> Option<String> {
        let zip = non_blank(self.zip_code.as_deref())?;
        Some(zip.chars().take(POSTAL_CODE_LEN).collect())
    }

    pub fn license_number(&self) -> Option<&str> {
        non_blank(self.license_no.as_deref())
    }

    fn display_business_name(&self) -> &str {
        non_blank(self.full_business_name.as_deref())
            .or_else(|| non_blank(self.business_name.as_deref()))
            .unwrap_or_default()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn copy_through(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidLicense {
    #[error("license number is missing or blank")]
    Missing,
    #[error("identity {identity:?} contains a null marker")]
    NullMarker { identity: String },
}

/// Identity of a record in both tables: agency id followed directly by the
/// license number. There is no delimiter, so an agency id that is a prefix of
/// another agency id can collide; see DESIGN.md.
pub fn compose_identity(agency_id: &str, license_number: &str) -> String {
    format!("{agency_id}{license_number}")
}

/// `None` anywhere, or `nan` in any case, marks a value that was null upstream.
pub fn contains_null_marker(identity: &str) -> bool {
    identity.contains("None") || identity.to_ascii_lowercase().contains("nan")
}

pub fn license_detail_url(license_number: &str) -> String {
    format!("{LICENSE_DETAIL_URL}{license_number}")
}

/// Resolved license record, identical in shape to a row of the staging and
/// permanent tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub identity: String,
    pub affiliate_id: String,
    pub agency_id: String,
    pub license_number: String,
    pub source_url: String,
    pub business_name: String,
    pub street: String,
    pub city: String,
    pub zip: String,
    pub state_established: String,
    pub date_established: String,
    pub phone_number: String,
    pub license_expiration: String,
    pub license_status: String,
    pub reportable_data: bool,
    pub agency_name: String,
    pub category: String,
}

impl CanonicalRecord {
    /// Builds the record for a row whose affiliate and agency are already resolved.
    ///
    /// The source URL is always derived from the license number; nothing
    /// URL-shaped in the row is consulted.
    pub fn from_row(
        row: &RawLicenseRow,
        affiliate_id: &str,
        agency_id: &str,
        agency_name: &str,
    ) -> Result<Self, InvalidLicense> {
        let license_number = row.license_number().ok_or(InvalidLicense::Missing)?;
        let identity = compose_identity(agency_id, license_number);
        if contains_null_marker(&identity) {
            return Err(InvalidLicense::NullMarker { identity });
        }

        Ok(Self {
            identity,
            affiliate_id: affiliate_id.to_string(),
            agency_id: agency_id.to_string(),
            license_number: license_number.to_string(),
            source_url: license_detail_url(license_number),
            business_name: row.display_business_name().to_string(),
            street: copy_through(&row.mailing_address),
            city: copy_through(&row.city),
            zip: copy_through(&row.zip_code),
            state_established: copy_through(&row.state),
            date_established: copy_through(&row.issue_date),
            phone_number: copy_through(&row.business_phone),
            license_expiration: copy_through(&row.expiration_date),
            license_status: copy_through(&row.primary_status),
            reportable_data: false,
            agency_name: agency_name.to_string(),
            category: copy_through(&row.classifications),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoAffiliate,
    NoAgency,
    InvalidLicense,
    MalformedRow,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoAffiliate => "no_affiliate",
            SkipReason::NoAgency => "no_agency",
            SkipReason::InvalidLicense => "invalid_license",
            SkipReason::MalformedRow => "malformed_row",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    pub no_affiliate: usize,
    pub no_agency: usize,
    pub invalid_license: usize,
    pub malformed_row: usize,
}

impl SkipCounts {
    pub fn record(&mut self, reason: SkipReason) {
        *self.slot(reason) += 1;
    }

    pub fn get(&self, reason: SkipReason) -> usize {
        match reason {
            SkipReason::NoAffiliate => self.no_affiliate,
            SkipReason::NoAgency => self.no_agency,
            SkipReason::InvalidLicense => self.invalid_license,
            SkipReason::MalformedRow => self.malformed_row,
        }
    }

    pub fn total(&self) -> usize {
        self.no_affiliate + self.no_agency + self.invalid_license + self.malformed_row
    }

    fn slot(&mut self, reason: SkipReason) -> &mut usize {
        match reason {
            SkipReason::NoAffiliate => &mut self.no_affiliate,
            SkipReason::NoAgency => &mut self.no_agency,
            SkipReason::InvalidLicense => &mut self.invalid_license,
            SkipReason::MalformedRow => &mut self.malformed_row,
        }
    }
}

/// Row-level accounting produced by resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveReport {
    pub rows_seen: usize,
    pub valid_records: usize,
    /// Rows replaced by a later row carrying the same identity.
    pub superseded: usize,
    pub skipped: SkipCounts,
    pub unresolved_postal_codes: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Config,
    Collect,
    Process,
    Upload,
    Merge,
    Cleanup,
    Complete,
    Cancelled,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Config => "config",
            Phase::Collect => "collect",
            Phase::Process => "process",
            Phase::Upload => "upload",
            Phase::Merge => "merge",
            Phase::Cleanup => "cleanup",
            Phase::Complete => "complete",
            Phase::Cancelled => "cancelled",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// At least one staging batch failed; everything else was merged.
    PartiallyCompleted,
    /// Stopped by the operator before the merge.
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::PartiallyCompleted => "partially_completed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub index: usize,
    /// Position of the batch's first record in the staged sequence.
    pub offset: usize,
    pub len: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub snapshot_path: Option<String>,
    pub rows_seen: usize,
    pub valid_records: usize,
    pub superseded: usize,
    pub skipped: SkipCounts,
    pub unresolved_postal_codes: Vec<String>,
    pub staged: u64,
    pub failed_records: usize,
    pub failed_batches: Vec<BatchFailure>,
    pub merged: u64,
}

/// Reporting collaborator. The pipeline only ever talks to this interface.
pub trait ProgressReporter: Send + Sync {
    fn phase(&self, phase: Phase, detail: &str);
    fn record_processed(&self, n: usize);
    fn error(&self, error: &(dyn std::error::Error + 'static), context: &str);
    fn summary(&self, summary: &RunSummary);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {
    fn phase(&self, _phase: Phase, _detail: &str) {}
    fn record_processed(&self, _n: usize) {}
    fn error(&self, _error: &(dyn std::error::Error + 'static), _context: &str) {}
    fn summary(&self, _summary: &RunSummary) {}
}
