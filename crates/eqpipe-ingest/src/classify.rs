//! Field classification: routes raw payload keys to stable or volatile storage
//! and normalizes them into column identifiers.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use eqpipe_core::{ClassifiedRecord, ColumnValue, EntityPayload};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_MAX_VOLATILE_FIELDS: usize = 300;

/// Columns the engine writes itself. Payload keys that normalize to one of
/// these are stored under a `src_` prefix instead.
pub const RESERVED_COLUMNS: [&str; 5] = ["symbol", "as_of_date", "source", "ingested_at", "extra_payload"];

/// Descriptive equity attributes that change rarely (address, sector, listing metadata).
pub const DEFAULT_STABLE_FIELDS: &[&str] = &[
    "address1",
    "address2",
    "city",
    "zip",
    "country",
    "phone",
    "fax",
    "website",
    "industry",
    "industryKey",
    "industryDisp",
    "sector",
    "sectorKey",
    "sectorDisp",
    "longBusinessSummary",
    "companyOfficers",
    "governanceEpochDate",
    "compensationAsOfEpochDate",
    "irWebsite",
    "executiveTeam",
    "maxAge",
    "currency",
    "tradeable",
    "lastFiscalYearEnd",
    "nextFiscalYearEnd",
    "mostRecentQuarter",
    "lastSplitFactor",
    "lastSplitDate",
    "quoteType",
    "financialCurrency",
    "symbol",
    "language",
    "region",
    "typeDisp",
    "quoteSourceName",
    "triggerable",
    "customPriceAlertConfidence",
    "exchange",
    "messageBoardId",
    "exchangeTimezoneName",
    "exchangeTimezoneShortName",
    "gmtOffSetMilliseconds",
    "market",
    "esgPopulated",
    "shortName",
    "longName",
    "hasPrePostMarketData",
    "firstTradeDateMilliseconds",
    "fullExchangeName",
    "earningsTimestamp",
    "earningsTimestampStart",
    "earningsTimestampEnd",
    "earningsCallTimestampStart",
    "earningsCallTimestampEnd",
    "isEarningsDateEstimate",
    "sourceInterval",
    "exchangeDataDelayedBy",
    "cryptoTradeable",
];

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("fields {first:?} and {second:?} both map to column {column}")]
    NameCollision {
        column: String,
        first: String,
        second: String,
    },
    #[error("field name {0:?} normalizes to an empty identifier")]
    EmptyName(String),
    #[error("reading {path}: {source}")]
    RulesIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    RulesParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Deserialize)]
struct FieldRulesFile {
    stable_fields: Vec<String>,
}

/// Maps a raw field name to a storage-safe identifier: anything outside
/// `[A-Za-z0-9_]` becomes `_`, a leading digit gains an `f_` prefix, and the
/// result is lowercased.
pub fn normalize_field_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "f_");
    }
    name.to_ascii_lowercase()
}

fn storage_name(raw: &str) -> Result<String, ClassifyError> {
    let name = normalize_field_name(raw);
    if name.is_empty() {
        return Err(ClassifyError::EmptyName(raw.to_string()));
    }
    if RESERVED_COLUMNS.contains(&name.as_str()) {
        return Ok(format!("src_{name}"));
    }
    Ok(name)
}

#[derive(Debug, Clone)]
pub struct FieldClassifier {
    stable: BTreeSet<String>,
    max_volatile: usize,
}

impl Default for FieldClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_STABLE_FIELDS.iter().copied(), DEFAULT_MAX_VOLATILE_FIELDS)
    }
}

impl FieldClassifier {
    pub fn new<I, S>(stable_fields: I, max_volatile: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stable: stable_fields.into_iter().map(Into::into).collect(),
            max_volatile,
        }
    }

    /// Loads the stable-field list from a YAML file of the form
    /// `stable_fields: [..]`.
    pub fn from_rules_file(path: &Path, max_volatile: usize) -> Result<Self, ClassifyError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ClassifyError::RulesIo {
            path: display.clone(),
            source,
        })?;
        let rules: FieldRulesFile = serde_yaml::from_str(&text).map_err(|source| ClassifyError::RulesParse {
            path: display,
            source,
        })?;
        info!(path = %path.display(), fields = rules.stable_fields.len(), "loaded stable field rules");
        Ok(Self::new(rules.stable_fields, max_volatile))
    }

    /// Uses `rules/fields.yaml` under `root` when present, the built-in list otherwise.
    pub fn from_workspace_root(root: &Path, max_volatile: usize) -> Result<Self, ClassifyError> {
        let path: PathBuf = root.join("rules").join("fields.yaml");
        if path.exists() {
            Self::from_rules_file(&path, max_volatile)
        } else {
            debug!(path = %path.display(), "no field rules file; using built-in stable fields");
            Ok(Self::default().with_max_volatile(max_volatile))
        }
    }

    pub fn with_max_volatile(mut self, max_volatile: usize) -> Self {
        self.max_volatile = max_volatile;
        self
    }

    pub fn max_volatile(&self) -> usize {
        self.max_volatile
    }

    pub fn is_stable(&self, raw_key: &str) -> bool {
        self.stable.contains(raw_key)
    }

    /// Splits `payload` into stable, volatile and overflow groups.
    ///
    /// Two keys mapping to the same column reject the whole payload. When the
    /// volatile group exceeds the ceiling it moves wholesale into overflow.
    pub fn classify(&self, payload: &EntityPayload) -> Result<ClassifiedRecord, ClassifyError> {
        let mut owners: BTreeMap<String, &str> = BTreeMap::new();
        let mut record = ClassifiedRecord::default();

        for (raw_key, raw_value) in &payload.fields {
            let column = storage_name(raw_key)?;
            if let Some(first) = owners.insert(column.clone(), raw_key) {
                return Err(ClassifyError::NameCollision {
                    column,
                    first: first.to_string(),
                    second: raw_key.clone(),
                });
            }

            let value = ColumnValue::from(raw_value);
            if self.is_stable(raw_key) {
                record.stable.insert(column, value);
            } else {
                record.volatile.insert(column, value);
            }
        }

        if record.volatile.len() > self.max_volatile {
            debug!(
                entity = %payload.entity_id,
                volatile = record.volatile.len(),
                ceiling = self.max_volatile,
                "volatile fields exceed ceiling; storing as overflow"
            );
            record.overflow = std::mem::take(&mut record.volatile);
        }
        Ok(record)
    }
}
