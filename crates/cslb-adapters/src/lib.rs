//! Mapping-table loading and master-file row resolution.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cslb_core::{
    CanonicalRecord, InvalidLicense, LookupTables, ProgressReporter, RawLicenseRow, ResolveReport,
    SkipReason,
};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "cslb-adapters";

const BOM: char = '\u{feff}';

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("mapping source not found: {}", path.display())]
    MissingMappingSource { path: PathBuf },
    #[error("reading mapping source {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Loads both lookup tables. Neither is read unless both exist.
pub fn load_lookup_tables(
    postal_source: &Path,
    affiliate_source: &Path,
) -> Result<LookupTables, MappingError> {
    for path in [postal_source, affiliate_source] {
        if !path.is_file() {
            return Err(MappingError::MissingMappingSource {
                path: path.to_path_buf(),
            });
        }
    }

    let postal_to_affiliate = read_key_value_pairs(postal_source, false)?;
    info!(
        path = %postal_source.display(),
        entries = postal_to_affiliate.len(),
        "loaded postal code mappings"
    );
    let affiliate_to_agency = read_key_value_pairs(affiliate_source, true)?;
    info!(
        path = %affiliate_source.display(),
        entries = affiliate_to_agency.len(),
        "loaded agency mappings"
    );

    Ok(LookupTables::new(postal_to_affiliate, affiliate_to_agency))
}

/// Column 0 is the key, column 1 the value; shorter rows are ignored and a
/// repeated key keeps the last value seen.
fn read_key_value_pairs(
    path: &Path,
    strip_bom: bool,
) -> Result<HashMap<String, String>, MappingError> {
    let read_err = |source| MappingError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(read_err)?;

    let mut pairs = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(read_err)?;
        if record.len() < 2 {
            continue;
        }
        let key = if strip_bom {
            record[0].trim_start_matches(BOM)
        } else {
            &record[0]
        };
        pairs.insert(key.to_string(), record[1].to_string());
    }
    Ok(pairs)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unresolved {
    #[error("no affiliate for postal code {postal_code:?}")]
    NoAffiliate { postal_code: Option<String> },
    #[error("no agency for affiliate {affiliate_id}")]
    NoAgency { affiliate_id: String },
    #[error(transparent)]
    InvalidLicense(#[from] InvalidLicense),
}

impl Unresolved {
    pub fn reason(&self) -> SkipReason {
        match self {
            Unresolved::NoAffiliate { .. } => SkipReason::NoAffiliate,
            Unresolved::NoAgency { .. } => SkipReason::NoAgency,
            Unresolved::InvalidLicense(_) => SkipReason::InvalidLicense,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// One record per identity, in order of first appearance.
    pub records: Vec<CanonicalRecord>,
    pub report: ResolveReport,
}

pub struct RecordResolver<'a> {
    tables: &'a LookupTables,
    agency_name: &'a str,
}

impl<'a> RecordResolver<'a> {
    pub fn new(tables: &'a LookupTables, agency_name: &'a str) -> Self {
        Self {
            tables,
            agency_name,
        }
    }

    pub fn resolve_row(&self, row: &RawLicenseRow) -> Result<CanonicalRecord, Unresolved> {
        let postal_code = row.postal_code();
        let affiliate_id = postal_code
            .as_deref()
            .and_then(|zip| self.tables.affiliate_for(zip))
            .ok_or_else(|| Unresolved::NoAffiliate {
                postal_code: postal_code.clone(),
            })?;
        let agency_id = self
            .tables
            .agency_for(affiliate_id)
            .ok_or_else(|| Unresolved::NoAgency {
                affiliate_id: affiliate_id.to_string(),
            })?;
        Ok(CanonicalRecord::from_row(
            row,
            affiliate_id,
            agency_id,
            self.agency_name,
        )?)
    }

    /// Resolves every row in source order. Rows that fail to parse or resolve
    /// are counted and skipped; nothing here aborts the run.
    pub fn resolve<I, E>(&self, rows: I, reporter: &dyn ProgressReporter) -> Resolution
    where
        I: IntoIterator<Item = Result<RawLicenseRow, E>>,
        E: std::fmt::Display,
    {
        let mut resolution = Resolution::default();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for (index, row) in rows.into_iter().enumerate() {
            resolution.report.rows_seen += 1;
            reporter.record_processed(1);

            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    debug!(row = index, error = %err, "malformed master file row");
                    resolution.report.skipped.record(SkipReason::MalformedRow);
                    continue;
                }
            };

            match self.resolve_row(&row) {
                Ok(record) => {
                    resolution.report.valid_records += 1;
                    match positions.get(&record.identity) {
                        Some(&pos) => {
                            resolution.records[pos] = record;
                            resolution.report.superseded += 1;
                        }
                        None => {
                            positions.insert(record.identity.clone(), resolution.records.len());
                            resolution.records.push(record);
                        }
                    }
                }
                Err(unresolved) => {
                    if let Unresolved::NoAffiliate {
                        postal_code: Some(zip),
                    } = &unresolved
                    {
                        resolution
                            .report
                            .unresolved_postal_codes
                            .insert(zip.clone());
                    }
                    resolution.report.skipped.record(unresolved.reason());
                }
            }
        }

        resolution
    }
}

/// Reads a persisted snapshot as text, dropping a leading byte-order mark.
pub fn read_snapshot(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    Ok(match text.strip_prefix(BOM) {
        Some(stripped) => stripped.to_string(),
        None => text,
    })
}

pub fn resolve_snapshot(
    path: &Path,
    resolver: &RecordResolver<'_>,
    reporter: &dyn ProgressReporter,
) -> Result<Resolution> {
    let text = read_snapshot(path)?;
    // Short rows are padded: missing trailing columns read as absent.
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());
    reader
        .headers()
        .with_context(|| format!("reading header row of {}", path.display()))?;

    let resolution = resolver.resolve(reader.deserialize::<RawLicenseRow>(), reporter);
    info!(
        path = %path.display(),
        rows = resolution.report.rows_seen,
        records = resolution.records.len(),
        skipped = resolution.report.skipped.total(),
        "resolved snapshot"
    );
    Ok(resolution)
}
