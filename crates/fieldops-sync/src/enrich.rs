//! Best-effort enrichment of customer, location and invoice detail.
//!
//! Everything here is non-fatal: failures are logged and the same jobs are
//! picked up again by the next run, because every write only overwrites
//! null columns.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fieldops_client::FieldServiceApi;
use fieldops_core::ExternalJob;
use fieldops_db::SyncStore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::warn;

/// Fetch customer and location detail for jobs created this run. The whole
/// task group races one wall-clock deadline; results landing before it are
/// applied, the rest are aborted and left for the next run.
pub async fn customers_and_locations(
    api: Arc<dyn FieldServiceApi>,
    store: Arc<dyn SyncStore>,
    jobs: &[ExternalJob],
    created: &HashSet<i64>,
    deadline: Duration,
) {
    let mut customer_ids = BTreeSet::new();
    let mut location_ids = BTreeSet::new();
    for job in jobs.iter().filter(|job| created.contains(&job.id)) {
        if let Some(id) = job.customer_id {
            customer_ids.insert(id);
        }
        if let Some(id) = job.location_id {
            location_ids.insert(id);
        }
    }
    if customer_ids.is_empty() && location_ids.is_empty() {
        return;
    }

    let mut tasks = JoinSet::new();
    for id in customer_ids {
        let api = api.clone();
        let store = store.clone();
        tasks.spawn(async move {
            match api.customer(id).await {
                Ok(customer) => {
                    if let Err(err) = store.apply_customer_details(&customer).await {
                        warn!(customer_id = id, error = %format!("{err:#}"), "customer enrichment write failed");
                    }
                }
                Err(err) => warn!(customer_id = id, error = %err, "customer lookup failed"),
            }
        });
    }
    for id in location_ids {
        let api = api.clone();
        let store = store.clone();
        tasks.spawn(async move {
            match api.location(id).await {
                Ok(location) => {
                    if let Err(err) = store.apply_location_details(&location).await {
                        warn!(location_id = id, error = %format!("{err:#}"), "location enrichment write failed");
                    }
                }
                Err(err) => warn!(location_id = id, error = %err, "location lookup failed"),
            }
        });
    }

    let drained = timeout(deadline, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tasks.abort_all();
        warn!("customer/location enrichment exceeded its deadline; abandoned until the next run");
    }
}

/// Fetch invoice detail for jobs that carry an upstream invoice id but have
/// no locally-known invoice number yet. Expected to be a small batch; no
/// deadline, each task settles on its own.
pub async fn invoices(
    api: Arc<dyn FieldServiceApi>,
    store: Arc<dyn SyncStore>,
    jobs: &[ExternalJob],
) {
    let invoice_bearing: Vec<i64> = jobs
        .iter()
        .filter(|job| job.invoice_id.is_some())
        .map(|job| job.id)
        .collect();
    if invoice_bearing.is_empty() {
        return;
    }

    let missing: HashSet<i64> = match store.jobs_missing_invoice_number(&invoice_bearing).await {
        Ok(ids) => ids.into_iter().collect(),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "could not determine jobs missing invoice numbers");
            return;
        }
    };

    let invoice_ids: BTreeSet<i64> = jobs
        .iter()
        .filter(|job| missing.contains(&job.id))
        .filter_map(|job| job.invoice_id)
        .collect();

    let mut tasks = JoinSet::new();
    for id in invoice_ids {
        let api = api.clone();
        let store = store.clone();
        tasks.spawn(async move {
            match api.invoice(id).await {
                Ok(invoice) => {
                    if let Err(err) = store.apply_invoice_details(&invoice).await {
                        warn!(invoice_id = id, error = %format!("{err:#}"), "invoice enrichment write failed");
                    }
                }
                Err(err) => warn!(invoice_id = id, error = %err, "invoice lookup failed"),
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}
