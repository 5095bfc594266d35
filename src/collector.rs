//! Refresh cycle: concurrent per-account fetch, then one exclusive publish.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::billing::{build_query, CostSource};
use crate::config::{AwsAccount, MetricConfig};
use crate::error::AppError;
use crate::models::CostResult;
use crate::snapshot::MetricsSnapshot;

/// An account together with the billing client built for it.
pub struct AccountClient {
    pub account: AwsAccount,
    pub source: Arc<dyn CostSource>,
}

/// One gauge row before label realization.
#[derive(Debug, Clone, PartialEq)]
pub struct CostRow {
    pub keys: Vec<String>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub accounts_published: usize,
    pub rows_published: usize,
    pub rows_skipped: usize,
}

pub struct CostCollector {
    snapshot: Arc<MetricsSnapshot>,
    metrics: Arc<Vec<MetricConfig>>,
    accounts: Vec<AccountClient>,
    refresh_lock: Mutex<()>,
}

impl CostCollector {
    pub fn new(
        snapshot: Arc<MetricsSnapshot>,
        metrics: Vec<MetricConfig>,
        accounts: Vec<AccountClient>,
    ) -> Self {
        for account_id in drifted_accounts(&snapshot, &accounts) {
            tracing::warn!(
                account_id = %account_id,
                "account label keys differ from the gauge labels; its rows will be skipped"
            );
        }

        Self {
            snapshot,
            metrics: Arc::new(metrics),
            accounts,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> &Arc<MetricsSnapshot> {
        &self.snapshot
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Fetches every account concurrently and republishes the snapshot.
    ///
    /// Accounts that fail are left out of this cycle's snapshot and reported
    /// through [`AppError::Refresh`] once the others have been published.
    /// Concurrent calls are serialized.
    pub async fn refresh(&self) -> Result<RefreshReport, AppError> {
        let _running = self.refresh_lock.lock().await;
        let _timer = self.snapshot.start_timer();

        let mut tasks = JoinSet::new();
        for (index, client) in self.accounts.iter().enumerate() {
            let source = Arc::clone(&client.source);
            let metrics = Arc::clone(&self.metrics);
            tasks.spawn(async move { (index, fetch_account(source.as_ref(), &metrics).await) });
        }

        let mut fetched: Vec<(usize, Vec<CostResult>)> = Vec::with_capacity(self.accounts.len());
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(results))) => fetched.push((index, results)),
                Ok((index, Err(e))) => {
                    tracing::error!(
                        account_id = %self.accounts[index].account.account_id,
                        error = %e,
                        "failed to fetch costs"
                    );
                    self.snapshot.record_error();
                    failed += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "account fetch task did not complete");
                    self.snapshot.record_error();
                    failed += 1;
                }
            }
        }
        fetched.sort_by_key(|(index, _)| *index);

        let mut report = RefreshReport {
            accounts_published: fetched.len(),
            ..RefreshReport::default()
        };

        {
            let publication = self.snapshot.begin_publish();
            for (index, results) in &fetched {
                let account = &self.accounts[*index].account;
                for (metric, result) in self.metrics.iter().zip(results) {
                    for row in cost_rows(metric, result) {
                        match publication.set(metric, account, &row.keys, row.value) {
                            Ok(()) => report.rows_published += 1,
                            Err(e) => {
                                tracing::warn!(error = %e, "skipping inconsistent row");
                                report.rows_skipped += 1;
                            }
                        }
                    }
                }
            }
        }

        for _ in 0..report.rows_skipped {
            self.snapshot.record_error();
        }

        tracing::info!(
            accounts = self.accounts.len(),
            failed,
            rows = report.rows_published,
            skipped = report.rows_skipped,
            "cost data refreshed"
        );

        if failed > 0 {
            return Err(AppError::Refresh {
                failed,
                total: self.accounts.len(),
            });
        }
        Ok(report)
    }
}

/// Accounts whose label keys do not match the ones the gauges were declared with.
fn drifted_accounts<'a>(snapshot: &MetricsSnapshot, accounts: &'a [AccountClient]) -> Vec<&'a str> {
    accounts
        .iter()
        .filter(|client| !snapshot.fits_account(&client.account))
        .map(|client| client.account.account_id.as_str())
        .collect()
}

/// Fetches every metric for one account. Any failure discards the
/// account's other results for this cycle.
async fn fetch_account(
    source: &dyn CostSource,
    metrics: &[MetricConfig],
) -> Result<Vec<CostResult>, AppError> {
    let mut results = Vec::with_capacity(metrics.len());
    for metric in metrics {
        let query = build_query(metric);
        results.push(source.fetch_costs(&query).await?);
    }
    Ok(results)
}

/// Turns a fetch result into gauge rows, rolling groups below the merge
/// threshold into a single placeholder row.
pub fn cost_rows(metric: &MetricConfig, result: &CostResult) -> Vec<CostRow> {
    let groups = metric.active_groups();
    if groups.is_empty() {
        return vec![CostRow {
            keys: Vec::new(),
            value: result.total,
        }];
    }

    let merge = metric.merge_policy();
    let mut rows = Vec::with_capacity(result.groups.len() + 1);
    let mut merged_minor = 0.0;

    for group in &result.groups {
        if let Some(policy) = merge {
            if group.amount < policy.threshold {
                merged_minor += group.amount;
                continue;
            }
        }
        rows.push(CostRow {
            keys: group.keys.clone(),
            value: group.amount,
        });
    }

    if let Some(policy) = merge {
        if merged_minor > 0.0 {
            rows.push(CostRow {
                keys: vec![policy.tag_value.clone(); groups.len()],
                value: merged_minor,
            });
        }
    }

    rows
}
