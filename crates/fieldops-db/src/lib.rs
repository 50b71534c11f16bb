//! Postgres persistence for canonical jobs, technicians and the run log.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldops_core::{Customer, Invoice, Location, NewJobRecord, RunStatus, SyncRun, Trade};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fieldops-db";

pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("connecting to database")
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .context("applying migrations")
}

/// Technician row as written by a sync run. `hourly_rate` is deliberately
/// absent: that column is maintained by hand and never synced.
#[derive(Debug, Clone, PartialEq)]
pub struct TechnicianUpsert {
    pub external_id: i64,
    pub name: String,
    pub active: bool,
    pub business_unit_id: Option<i64>,
    pub business_unit_name: Option<String>,
}

/// Everything the reconciliation engine needs from the relational store.
/// Engine tests implement this in memory.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn existing_job_ids(&self, ids: &[i64]) -> Result<HashSet<i64>>;
    async fn upsert_job(&self, record: &NewJobRecord) -> Result<()>;
    async fn upsert_technicians(&self, technicians: &[TechnicianUpsert]) -> Result<()>;
    async fn technician_rates(&self) -> Result<HashMap<i64, f64>>;
    async fn trade_overrides(&self) -> Result<HashMap<String, Trade>>;
    async fn jobs_missing_invoice_number(&self, ids: &[i64]) -> Result<Vec<i64>>;
    async fn apply_customer_details(&self, customer: &Customer) -> Result<()>;
    async fn apply_location_details(&self, location: &Location) -> Result<()>;
    async fn apply_invoice_details(&self, invoice: &Invoice) -> Result<()>;
    async fn insert_run(&self, run: &SyncRun) -> Result<()>;
    async fn update_run_counters(
        &self,
        run_id: Uuid,
        processed: i32,
        created: i32,
        updated: i32,
    ) -> Result<()>;
    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        processed: i32,
        created: i32,
        updated: i32,
        errors: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRun>>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SyncStore for PgStore {
    async fn existing_job_ids(&self, ids: &[i64]) -> Result<HashSet<i64>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query("SELECT job_id FROM jobs WHERE job_id = ANY($1)")
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await
            .context("loading existing job ids")?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get::<i64, _>("job_id")?);
        }
        Ok(out)
    }

    async fn upsert_job(&self, record: &NewJobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, job_number, job_status, trade,
                business_unit_id, business_unit_name, job_type_name, summary,
                customer_id, location_id, scheduled_date, completed_date,
                total, invoice_id, labor_hours, labor_cost,
                technician_count, primary_technician_id, synced_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, now())
            ON CONFLICT (job_id) DO UPDATE SET
                job_number            = EXCLUDED.job_number,
                job_status            = EXCLUDED.job_status,
                trade                 = EXCLUDED.trade,
                business_unit_id      = COALESCE(EXCLUDED.business_unit_id, jobs.business_unit_id),
                business_unit_name    = COALESCE(EXCLUDED.business_unit_name, jobs.business_unit_name),
                job_type_name         = COALESCE(EXCLUDED.job_type_name, jobs.job_type_name),
                summary               = COALESCE(EXCLUDED.summary, jobs.summary),
                customer_id           = COALESCE(EXCLUDED.customer_id, jobs.customer_id),
                location_id           = COALESCE(EXCLUDED.location_id, jobs.location_id),
                scheduled_date        = COALESCE(EXCLUDED.scheduled_date, jobs.scheduled_date),
                completed_date        = COALESCE(EXCLUDED.completed_date, jobs.completed_date),
                total                 = COALESCE(EXCLUDED.total, jobs.total),
                invoice_id            = COALESCE(EXCLUDED.invoice_id, jobs.invoice_id),
                labor_hours           = COALESCE(EXCLUDED.labor_hours, jobs.labor_hours),
                labor_cost            = COALESCE(EXCLUDED.labor_cost, jobs.labor_cost),
                technician_count      = COALESCE(EXCLUDED.technician_count, jobs.technician_count),
                primary_technician_id = COALESCE(EXCLUDED.primary_technician_id, jobs.primary_technician_id),
                synced_at             = EXCLUDED.synced_at,
                updated_at            = now()
            "#,
        )
        .bind(record.job_id)
        .bind(&record.job_number)
        .bind(&record.job_status)
        .bind(record.trade.as_str())
        .bind(record.business_unit_id)
        .bind(&record.business_unit_name)
        .bind(&record.job_type_name)
        .bind(&record.summary)
        .bind(record.customer_id)
        .bind(record.location_id)
        .bind(record.scheduled_date)
        .bind(record.completed_date)
        .bind(record.total)
        .bind(record.invoice_id)
        .bind(record.labor_hours)
        .bind(record.labor_cost)
        .bind(record.technician_count)
        .bind(record.primary_technician_id)
        .bind(record.synced_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting job {}", record.job_id))?;
        Ok(())
    }

    async fn upsert_technicians(&self, technicians: &[TechnicianUpsert]) -> Result<()> {
        for tech in technicians {
            sqlx::query(
                r#"
                INSERT INTO technicians (external_id, name, active, business_unit_id, business_unit_name, updated_at)
                VALUES ($1, $2, $3, $4, $5, now())
                ON CONFLICT (external_id) DO UPDATE SET
                    name               = EXCLUDED.name,
                    active             = EXCLUDED.active,
                    business_unit_id   = COALESCE(EXCLUDED.business_unit_id, technicians.business_unit_id),
                    business_unit_name = COALESCE(EXCLUDED.business_unit_name, technicians.business_unit_name),
                    updated_at         = now()
                "#,
            )
            .bind(tech.external_id)
            .bind(&tech.name)
            .bind(tech.active)
            .bind(tech.business_unit_id)
            .bind(&tech.business_unit_name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("upserting technician {}", tech.external_id))?;
        }
        Ok(())
    }

    async fn technician_rates(&self) -> Result<HashMap<i64, f64>> {
        let rows =
            sqlx::query("SELECT external_id, hourly_rate FROM technicians WHERE hourly_rate IS NOT NULL")
                .fetch_all(&self.pool)
                .await
                .context("loading technician rates")?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(
                row.try_get::<i64, _>("external_id")?,
                row.try_get::<f64, _>("hourly_rate")?,
            );
        }
        Ok(out)
    }

    async fn trade_overrides(&self) -> Result<HashMap<String, Trade>> {
        let rows = sqlx::query("SELECT name, value FROM trade_overrides")
            .fetch_all(&self.pool)
            .await
            .context("loading trade overrides")?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let value: serde_json::Value = row.try_get("value")?;
            let Some(trade) = value.get("trade").and_then(|v| v.as_str()) else {
                tracing::warn!(%name, "trade override row without a trade value; skipping");
                continue;
            };
            match Trade::from_str(trade) {
                Ok(trade) => {
                    out.insert(name, trade);
                }
                Err(err) => tracing::warn!(%name, %err, "ignoring malformed trade override"),
            }
        }
        Ok(out)
    }

    async fn jobs_missing_invoice_number(&self, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT job_id FROM jobs WHERE job_id = ANY($1) AND invoice_number IS NULL",
        )
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await
        .context("finding jobs without an invoice number")?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get::<i64, _>("job_id")?);
        }
        Ok(out)
    }

    async fn apply_customer_details(&self, customer: &Customer) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
               SET customer_name  = COALESCE($2, customer_name),
                   customer_phone = COALESCE($3, customer_phone),
                   customer_email = COALESCE($4, customer_email),
                   updated_at     = now()
             WHERE customer_id = $1
            "#,
        )
        .bind(customer.id)
        .bind(&customer.name)
        .bind(&customer.phone)
        .bind(&customer.email)
        .execute(&self.pool)
        .await
        .with_context(|| format!("applying customer detail {}", customer.id))?;
        Ok(())
    }

    async fn apply_location_details(&self, location: &Location) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
               SET location_address = COALESCE($2, location_address),
                   updated_at       = now()
             WHERE location_id = $1
            "#,
        )
        .bind(location.id)
        .bind(location.formatted_address())
        .execute(&self.pool)
        .await
        .with_context(|| format!("applying location detail {}", location.id))?;
        Ok(())
    }

    async fn apply_invoice_details(&self, invoice: &Invoice) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
               SET invoice_number = COALESCE($2, invoice_number),
                   invoice_date   = COALESCE($3, invoice_date),
                   updated_at     = now()
             WHERE invoice_id = $1
            "#,
        )
        .bind(invoice.id)
        .bind(&invoice.number)
        .bind(invoice.invoice_date)
        .execute(&self.pool)
        .await
        .with_context(|| format!("applying invoice detail {}", invoice.id))?;
        Ok(())
    }

    async fn insert_run(&self, run: &SyncRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, run_type, status, started_at, jobs_processed, jobs_created, jobs_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.id)
        .bind(&run.run_type)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.jobs_processed)
        .bind(run.jobs_created)
        .bind(run.jobs_updated)
        .execute(&self.pool)
        .await
        .context("inserting sync run")?;
        Ok(())
    }

    async fn update_run_counters(
        &self,
        run_id: Uuid,
        processed: i32,
        created: i32,
        updated: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_runs
               SET jobs_processed = $2, jobs_created = $3, jobs_updated = $4
             WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(processed)
        .bind(created)
        .bind(updated)
        .execute(&self.pool)
        .await
        .context("updating run counters")?;
        Ok(())
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        processed: i32,
        created: i32,
        updated: i32,
        errors: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        // The status guard makes the terminal transition single-shot even if
        // two finalize attempts race.
        sqlx::query(
            r#"
            UPDATE sync_runs
               SET status = $2,
                   jobs_processed = $3,
                   jobs_created = $4,
                   jobs_updated = $5,
                   errors = $6,
                   completed_at = $7
             WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(processed)
        .bind(created)
        .bind(updated)
        .bind(errors)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .context("finalizing sync run")?;
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_type, status, started_at, completed_at,
                   jobs_processed, jobs_created, jobs_updated, errors
              FROM sync_runs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("loading recent runs")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let status = RunStatus::from_str(&status)
                .map_err(|err| anyhow::anyhow!("sync_runs row: {err}"))?;
            out.push(SyncRun {
                id: row.try_get("id")?,
                run_type: row.try_get("run_type")?,
                status,
                started_at: row.try_get("started_at")?,
                completed_at: row.try_get("completed_at")?,
                jobs_processed: row.try_get("jobs_processed")?,
                jobs_created: row.try_get("jobs_created")?,
                jobs_updated: row.try_get("jobs_updated")?,
                errors: row.try_get("errors")?,
            });
        }
        Ok(out)
    }
}
