//! Authenticated, paginated client for the upstream field-service API.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use fieldops_core::{
    Appointment, AppointmentAssignment, BusinessUnit, Customer, ExternalJob, Invoice, JobType,
    Location, TechnicianRecord, TimesheetEntry,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;

pub const CRATE_NAME: &str = "fieldops-client";

const PAGE_SIZE: u32 = 100;
const ASSIGNMENT_ID_CHUNK: usize = 50;
/// Refresh the bearer credential this long before it actually expires.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub app_key: String,
    pub timeout: Duration,
    pub max_concurrency: usize,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("credential exchange failed: {0}")]
    Auth(String),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream status {status} for {url}")]
    Status { status: u16, url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Standard paged envelope: `{"data": [...], "hasMore": bool}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: i64,
}

fn default_token_lifetime() -> i64 {
    900
}

#[derive(Debug, Clone)]
struct CachedToken {
    bearer: String,
    expires_at: DateTime<Utc>,
}

/// A cached token is refreshed proactively, inside the expiry buffer, never
/// reactively on a 401.
fn token_needs_refresh(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> bool {
    now >= expires_at - chrono::Duration::seconds(TOKEN_EXPIRY_BUFFER_SECS)
}

fn date_param(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn join_id_chunks(ids: &[i64], chunk_size: usize) -> Vec<String> {
    ids.chunks(chunk_size.max(1))
        .map(|chunk| {
            chunk
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect()
}

/// The seam the reconciliation engine consumes; implemented over HTTP here
/// and by in-memory fakes in engine tests.
#[async_trait]
pub trait FieldServiceApi: Send + Sync {
    async fn business_units(&self) -> Result<Vec<BusinessUnit>, ApiError>;
    async fn business_unit(&self, id: i64) -> Result<BusinessUnit, ApiError>;
    async fn job_types(&self) -> Result<Vec<JobType>, ApiError>;
    async fn technicians(&self) -> Result<Vec<TechnicianRecord>, ApiError>;
    async fn jobs_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExternalJob>, ApiError>;
    async fn jobs_completed_since(&self, since: DateTime<Utc>)
        -> Result<Vec<ExternalJob>, ApiError>;
    async fn appointments_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, ApiError>;
    async fn appointment_assignments(
        &self,
        appointment_ids: &[i64],
    ) -> Result<Vec<AppointmentAssignment>, ApiError>;
    async fn timesheets_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimesheetEntry>, ApiError>;
    async fn customer(&self, id: i64) -> Result<Customer, ApiError>;
    async fn location(&self, id: i64) -> Result<Location, ApiError>;
    async fn invoice(&self, id: i64) -> Result<Invoice, ApiError>;
}

/// HTTP implementation. Holds its own credential cache and request limiter;
/// constructed once per run and shared by reference.
pub struct HttpFieldServiceClient {
    http: reqwest::Client,
    config: ApiConfig,
    token: Mutex<Option<CachedToken>>,
    limit: Semaphore,
    backoff: BackoffPolicy,
}

impl HttpFieldServiceClient {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        use anyhow::Context;
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        let limit = Semaphore::new(config.max_concurrency.max(1));
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
            limit,
            backoff: BackoffPolicy::default(),
        })
    }

    fn tenant_path(&self, module: &str, resource: &str) -> String {
        format!("{module}/v2/tenant/{}/{resource}", self.config.tenant_id)
    }

    async fn bearer_token(&self) -> Result<String, ApiError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if !token_needs_refresh(Utc::now(), cached.expires_at) {
                return Ok(cached.bearer.clone());
            }
        }

        let response = self
            .http
            .post(self.config.auth_url.as_str())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|err| ApiError::Auth(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ApiError::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| ApiError::Auth(err.to_string()))?;
        let expires_at = Utc::now() + chrono::Duration::seconds(body.expires_in);
        *guard = Some(CachedToken {
            bearer: body.access_token.clone(),
            expires_at,
        });
        Ok(body.access_token)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<T, ApiError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);

        let span = info_span!("api_fetch", %url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let token = self.bearer_token().await?;
            let result = self
                .http
                .get(url.as_str())
                .bearer_auth(&token)
                .header("X-App-Key", &self.config.app_key)
                .query(params)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(ApiError::Request);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(ApiError::Status {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ApiError::Request(err));
                }
            }
        }

        Err(ApiError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    /// Lazy, restartable page cursor over a list endpoint.
    pub fn paged<T: DeserializeOwned>(
        &self,
        path: String,
        params: Vec<(String, String)>,
    ) -> PageCursor<'_, T> {
        PageCursor {
            client: self,
            path,
            params,
            page: 1,
            exhausted: false,
            _marker: PhantomData,
        }
    }

    async fn collect_paged<T: DeserializeOwned>(
        &self,
        path: String,
        params: Vec<(String, String)>,
    ) -> Result<Vec<T>, ApiError> {
        self.paged(path, params).collect_all().await
    }
}

/// Advances a page index until the upstream reports no further pages.
pub struct PageCursor<'a, T> {
    client: &'a HttpFieldServiceClient,
    path: String,
    params: Vec<(String, String)>,
    page: u32,
    exhausted: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> PageCursor<'_, T> {
    /// Next page of results, or `None` once the sequence is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>, ApiError> {
        if self.exhausted {
            return Ok(None);
        }
        let mut params = self.params.clone();
        params.push(("page".to_string(), self.page.to_string()));
        params.push(("pageSize".to_string(), PAGE_SIZE.to_string()));

        let page: Page<T> = self.client.get_json(&self.path, &params).await?;
        self.page += 1;
        if !page.has_more {
            self.exhausted = true;
        }
        Ok(Some(page.data))
    }

    /// Rewind to the first page; the sequence is restartable.
    pub fn restart(&mut self) {
        self.page = 1;
        self.exhausted = false;
    }

    pub async fn collect_all(mut self) -> Result<Vec<T>, ApiError> {
        let mut out = Vec::new();
        while let Some(batch) = self.next_page().await? {
            out.extend(batch);
        }
        Ok(out)
    }
}

#[async_trait]
impl FieldServiceApi for HttpFieldServiceClient {
    async fn business_units(&self) -> Result<Vec<BusinessUnit>, ApiError> {
        self.collect_paged(self.tenant_path("settings", "business-units"), Vec::new())
            .await
    }

    async fn business_unit(&self, id: i64) -> Result<BusinessUnit, ApiError> {
        let path = self.tenant_path("settings", &format!("business-units/{id}"));
        self.get_json(&path, &[]).await
    }

    async fn job_types(&self) -> Result<Vec<JobType>, ApiError> {
        self.collect_paged(self.tenant_path("jpm", "job-types"), Vec::new())
            .await
    }

    async fn technicians(&self) -> Result<Vec<TechnicianRecord>, ApiError> {
        self.collect_paged(self.tenant_path("settings", "technicians"), Vec::new())
            .await
    }

    async fn jobs_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExternalJob>, ApiError> {
        let params = vec![
            ("firstAppointmentStartsOnOrAfter".to_string(), date_param(from)),
            ("firstAppointmentStartsBefore".to_string(), date_param(to)),
        ];
        self.collect_paged(self.tenant_path("jpm", "jobs"), params).await
    }

    async fn jobs_completed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExternalJob>, ApiError> {
        let params = vec![
            ("completedOnOrAfter".to_string(), date_param(since)),
            ("jobStatus".to_string(), "Completed".to_string()),
        ];
        self.collect_paged(self.tenant_path("jpm", "jobs"), params).await
    }

    async fn appointments_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, ApiError> {
        let params = vec![
            ("startsOnOrAfter".to_string(), date_param(from)),
            ("startsBefore".to_string(), date_param(to)),
        ];
        self.collect_paged(self.tenant_path("jpm", "appointments"), params)
            .await
    }

    async fn appointment_assignments(
        &self,
        appointment_ids: &[i64],
    ) -> Result<Vec<AppointmentAssignment>, ApiError> {
        let mut out = Vec::new();
        for chunk in join_id_chunks(appointment_ids, ASSIGNMENT_ID_CHUNK) {
            let params = vec![("appointmentIds".to_string(), chunk)];
            let batch: Vec<AppointmentAssignment> = self
                .collect_paged(self.tenant_path("dispatch", "appointment-assignments"), params)
                .await?;
            out.extend(batch);
        }
        Ok(out)
    }

    async fn timesheets_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimesheetEntry>, ApiError> {
        let params = vec![
            ("startedOnOrAfter".to_string(), date_param(from)),
            ("startedBefore".to_string(), date_param(to)),
        ];
        self.collect_paged(self.tenant_path("payroll", "timesheets"), params)
            .await
    }

    async fn customer(&self, id: i64) -> Result<Customer, ApiError> {
        let path = self.tenant_path("crm", &format!("customers/{id}"));
        self.get_json(&path, &[]).await
    }

    async fn location(&self, id: i64) -> Result<Location, ApiError> {
        let path = self.tenant_path("crm", &format!("locations/{id}"));
        self.get_json(&path, &[]).await
    }

    async fn invoice(&self, id: i64) -> Result<Invoice, ApiError> {
        let path = self.tenant_path("accounting", &format!("invoices/{id}"));
        self.get_json(&path, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn token_refresh_honors_expiry_buffer() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).single().unwrap();

        // Well inside the token lifetime: keep the cached credential.
        assert!(!token_needs_refresh(now, now + chrono::Duration::seconds(300)));
        // Inside the 60-second buffer: refresh proactively.
        assert!(token_needs_refresh(now, now + chrono::Duration::seconds(59)));
        assert!(token_needs_refresh(now, now + chrono::Duration::seconds(60)));
        // Already expired.
        assert!(token_needs_refresh(now, now - chrono::Duration::seconds(1)));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retry_classification_by_status() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn paged_envelope_decodes_camel_case() {
        let raw = r#"{"data": [{"id": 9, "jobId": 12, "start": "2026-03-02T22:00:00Z"}], "hasMore": true}"#;
        let page: Page<Appointment> = serde_json::from_str(raw).unwrap();
        assert!(page.has_more);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].job_id, 12);
        assert_eq!(page.data[0].end, None);

        // hasMore defaults to false when the upstream omits it.
        let last: Page<Appointment> = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert!(!last.has_more);
    }

    #[test]
    fn assignment_ids_chunk_into_comma_joined_groups() {
        let ids: Vec<i64> = (1..=5).collect();
        let chunks = join_id_chunks(&ids, 2);
        assert_eq!(chunks, vec!["1,2", "3,4", "5"]);
        assert!(join_id_chunks(&[], 2).is_empty());
    }
}
