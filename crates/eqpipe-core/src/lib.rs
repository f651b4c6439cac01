//! Core domain model for the equity pipeline: runs, ingestion records, facts.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "eqpipe-core";

/// Terminal (or in-flight) status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step statuses share the run vocabulary; a step is `Running` until finalized.
pub type StepStatus = RunStatus;

/// Outcome of one named step inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub attempts: u32,
    pub duration: Duration,
    pub status: StepStatus,
    pub error: Option<String>,
}

impl StepResult {
    pub fn started(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attempts: 0,
            duration: Duration::ZERO,
            status: StepStatus::Running,
            error: None,
        }
    }

    pub fn finalize(
        &mut self,
        status: StepStatus,
        attempts: u32,
        duration: Duration,
        error: Option<String>,
    ) {
        self.status = status;
        self.attempts = attempts;
        self.duration = duration;
        self.error = error;
    }
}

/// One end-to-end execution of an ordered step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
}

impl Run {
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            steps: Vec::new(),
        }
    }

    /// Marks the run terminal. The finish time is set at most once and never
    /// precedes the start time; later calls are ignored and return `false`.
    pub fn finish(&mut self, status: RunStatus) -> bool {
        if self.finished_at.is_some() {
            return false;
        }
        self.finished_at = Some(Utc::now().max(self.started_at));
        self.status = status;
        true
    }

    pub fn total_duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Raw field map fetched for one entity in one ingestion pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityPayload {
    pub entity_id: String,
    pub fields: BTreeMap<String, JsonValue>,
}

impl EntityPayload {
    pub fn new(entity_id: impl Into<String>, fields: BTreeMap<String, JsonValue>) -> Self {
        Self {
            entity_id: entity_id.into(),
            fields,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A storage-ready scalar. Structured JSON values are carried as canonical text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

impl From<&JsonValue> for ColumnValue {
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Integer(i64::from(*b)),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map(Self::Real).unwrap_or(Self::Null),
            },
            JsonValue::String(s) => Self::Text(s.clone()),
            // serde_json maps are ordered, so this encoding is canonical.
            structured => Self::Text(structured.to_string()),
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Column name -> value, ordered for deterministic SQL generation.
pub type ColumnMap = BTreeMap<String, ColumnValue>;

/// Payload split into its three disjoint storage groups.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassifiedRecord {
    pub stable: ColumnMap,
    pub volatile: ColumnMap,
    pub overflow: ColumnMap,
}

impl ClassifiedRecord {
    pub fn has_overflow(&self) -> bool {
        !self.overflow.is_empty()
    }

    /// Overflow fields serialized as one opaque JSON object, if any.
    pub fn overflow_payload(&self) -> Option<String> {
        if self.overflow.is_empty() {
            return None;
        }
        serde_json::to_string(&self.overflow).ok()
    }
}

/// Statement families persisted as fact tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    BalanceSheet,
    IncomeStatement,
    CashFlow,
}

impl StatementKind {
    pub const ALL: [StatementKind; 3] = [Self::BalanceSheet, Self::IncomeStatement, Self::CashFlow];

    pub fn table_name(self) -> &'static str {
        match self {
            Self::BalanceSheet => "raw_stock_balancesheet",
            Self::IncomeStatement => "raw_stock_incomestmt",
            Self::CashFlow => "raw_stock_cashflowstmt",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Self::BalanceSheet => "balance_sheet",
            Self::IncomeStatement => "income_statement",
            Self::CashFlow => "cash_flow",
        }
    }
}

/// One reported (metric, period) cell as delivered by a statement source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementCell {
    pub metric_name: String,
    pub period: String,
    pub value: Option<f64>,
}

/// A single (symbol, metric, fiscal year) numeric observation.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub symbol: String,
    pub metric_name: String,
    pub fiscal_year: i32,
    pub fiscal_date: NaiveDate,
    pub value: f64,
    pub source: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Success,
    Failed,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

/// Table name recorded when an entity failed before touching any table.
pub const AUDIT_ALL_TABLES: &str = "ALL";

/// Append-only record of one (entity, table) write attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub stage: String,
    pub symbol: String,
    pub table_name: String,
    pub recorded_at: DateTime<Utc>,
    pub item_count: i64,
    pub status: AuditStatus,
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn success(stage: &str, symbol: &str, table_name: &str, item_count: usize) -> Self {
        Self {
            stage: stage.to_string(),
            symbol: symbol.to_string(),
            table_name: table_name.to_string(),
            recorded_at: Utc::now(),
            item_count: item_count as i64,
            status: AuditStatus::Success,
            error: None,
        }
    }

    pub fn failure(stage: &str, symbol: &str, table_name: &str, error: impl fmt::Display) -> Self {
        Self {
            stage: stage.to_string(),
            symbol: symbol.to_string(),
            table_name: table_name.to_string(),
            recorded_at: Utc::now(),
            item_count: 0,
            status: AuditStatus::Failed,
            error: Some(error.to_string()),
        }
    }
}

/// One listed equity from the exchange universe snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseRecord {
    pub symbol: String,
    pub name_of_company: Option<String>,
    pub series: Option<String>,
    pub date_of_listing: Option<String>,
    pub paid_up_value: Option<f64>,
    pub market_lot: Option<f64>,
    pub isin_number: Option<String>,
    pub face_value: Option<f64>,
}
