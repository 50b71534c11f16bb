//! Core domain model for the fieldops reconciliation engine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fieldops-core";

/// Two-valued trade classification derived from business-unit names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trade {
    Hvac,
    Plumbing,
}

impl Trade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trade::Hvac => "hvac",
            Trade::Plumbing => "plumbing",
        }
    }
}

impl std::str::FromStr for Trade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hvac" => Ok(Trade::Hvac),
            "plumbing" => Ok(Trade::Plumbing),
            other => Err(format!("unknown trade {other:?}")),
        }
    }
}

/// Upstream job record. Immutable within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalJob {
    pub id: i64,
    pub job_number: String,
    pub job_status: String,
    pub business_unit_id: Option<i64>,
    /// Name carried on the job record itself; taxonomy fallback of last resort.
    #[serde(default)]
    pub business_unit_name: Option<String>,
    pub customer_id: Option<i64>,
    pub location_id: Option<i64>,
    pub job_type_id: Option<i64>,
    #[serde(default)]
    pub job_type_name: Option<String>,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub completed_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub invoice_id: Option<i64>,
}

/// Upstream appointment; `end` may be absent for unscheduled slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: i64,
    pub job_id: i64,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

/// One technician slot on an appointment. List order defines the primary
/// technician when no timesheet data exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentAssignment {
    pub appointment_id: i64,
    pub technician_id: i64,
    #[serde(default)]
    pub technician_name: Option<String>,
}

/// Paid-duration timesheet item; authoritative hours actually worked, as
/// opposed to scheduled appointment duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimesheetEntry {
    pub job_id: i64,
    pub employee_id: i64,
    pub paid_duration_hours: f64,
}

/// Upstream technician reference record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnicianRecord {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    pub business_unit_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessUnit {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobType {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: i64,
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: i64,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
}

impl Location {
    /// Single-line address from the non-empty parts, or `None` when the
    /// record carries no address at all.
    pub fn formatted_address(&self) -> Option<String> {
        let parts: Vec<&str> = [&self.street, &self.city, &self.state, &self.zip]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .filter(|p| !p.trim().is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: i64,
    #[serde(default, rename = "invoiceNumber")]
    pub number: Option<String>,
    #[serde(default)]
    pub invoice_date: Option<NaiveDate>,
}

fn default_true() -> bool {
    true
}

/// Canonical persisted row, one per external job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalJobRecord {
    pub job_id: i64,
    pub job_number: String,
    pub job_status: String,
    pub trade: Trade,
    pub business_unit_id: Option<i64>,
    pub business_unit_name: Option<String>,
    pub job_type_name: Option<String>,
    pub summary: Option<String>,
    pub customer_id: Option<i64>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub location_id: Option<i64>,
    pub location_address: Option<String>,
    pub scheduled_date: Option<NaiveDate>,
    pub completed_date: Option<NaiveDate>,
    pub total: Option<f64>,
    pub invoice_id: Option<i64>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub labor_hours: Option<f64>,
    pub labor_cost: Option<f64>,
    pub technician_count: Option<i32>,
    pub primary_technician_id: Option<i64>,
    pub synced_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Freshly computed candidate for one job, produced by a reconciliation run.
/// Enrichment-only fields (customer/location/invoice detail) are written
/// separately and are absent here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJobRecord {
    pub job_id: i64,
    pub job_number: String,
    pub job_status: String,
    pub trade: Trade,
    pub business_unit_id: Option<i64>,
    pub business_unit_name: Option<String>,
    pub job_type_name: Option<String>,
    pub summary: Option<String>,
    pub customer_id: Option<i64>,
    pub location_id: Option<i64>,
    pub scheduled_date: Option<NaiveDate>,
    pub completed_date: Option<NaiveDate>,
    pub total: Option<f64>,
    pub invoice_id: Option<i64>,
    pub labor_hours: Option<f64>,
    pub labor_cost: Option<f64>,
    pub technician_count: Option<i32>,
    pub primary_technician_id: Option<i64>,
    pub synced_at: DateTime<Utc>,
}

impl NewJobRecord {
    /// First sight of this job id: nulls are acceptable on creation.
    pub fn into_record(self) -> CanonicalJobRecord {
        CanonicalJobRecord {
            job_id: self.job_id,
            job_number: self.job_number,
            job_status: self.job_status,
            trade: self.trade,
            business_unit_id: self.business_unit_id,
            business_unit_name: self.business_unit_name,
            job_type_name: self.job_type_name,
            summary: self.summary,
            customer_id: self.customer_id,
            customer_name: None,
            customer_phone: None,
            customer_email: None,
            location_id: self.location_id,
            location_address: None,
            scheduled_date: self.scheduled_date,
            completed_date: self.completed_date,
            total: self.total,
            invoice_id: self.invoice_id,
            invoice_number: None,
            invoice_date: None,
            labor_hours: self.labor_hours,
            labor_cost: self.labor_cost,
            technician_count: self.technician_count,
            primary_technician_id: self.primary_technician_id,
            synced_at: self.synced_at,
            updated_at: self.synced_at,
        }
    }

    /// Update rule for an existing row: identity fields always follow the
    /// fresh fetch; every optional field writes only when non-null, otherwise
    /// the stored value survives. Absent data in one run must never erase
    /// previously-known information.
    pub fn apply_to(&self, existing: &mut CanonicalJobRecord) {
        existing.job_number = self.job_number.clone();
        existing.job_status = self.job_status.clone();
        existing.trade = self.trade;
        prefer_new(&self.business_unit_id, &mut existing.business_unit_id);
        prefer_new(&self.business_unit_name, &mut existing.business_unit_name);
        prefer_new(&self.job_type_name, &mut existing.job_type_name);
        prefer_new(&self.summary, &mut existing.summary);
        prefer_new(&self.customer_id, &mut existing.customer_id);
        prefer_new(&self.location_id, &mut existing.location_id);
        prefer_new(&self.scheduled_date, &mut existing.scheduled_date);
        prefer_new(&self.completed_date, &mut existing.completed_date);
        prefer_new(&self.total, &mut existing.total);
        prefer_new(&self.invoice_id, &mut existing.invoice_id);
        prefer_new(&self.labor_hours, &mut existing.labor_hours);
        prefer_new(&self.labor_cost, &mut existing.labor_cost);
        prefer_new(&self.technician_count, &mut existing.technician_count);
        prefer_new(&self.primary_technician_id, &mut existing.primary_technician_id);
        existing.synced_at = self.synced_at;
        existing.updated_at = self.synced_at;
    }
}

fn prefer_new<T: Clone>(new: &Option<T>, current: &mut Option<T>) {
    if new.is_some() {
        *current = new.clone();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status {other:?}")),
        }
    }
}

/// One persisted execution of the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub run_type: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub jobs_processed: i32,
    pub jobs_created: i32,
    pub jobs_updated: i32,
    /// Newline-joined per-job error list.
    pub errors: Option<String>,
}

/// What a completed run reports back to its trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub jobs_processed: i32,
    pub jobs_created: i32,
    pub jobs_updated: i32,
    pub errors: Vec<String>,
}
