//! The exposed metric snapshot.
//!
//! Owns its own prometheus [`Registry`] (nothing is registered globally).
//! Scrapes render under a shared lock; a refresh publishes under the
//! exclusive lock, so a reader sees either the previous or the new values
//! of every gauge, never a half-cleared one.

use std::collections::HashMap;

use parking_lot::{RwLock, RwLockWriteGuard};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramTimer, IntCounter, Opts, Registry,
    TextEncoder,
};

use crate::config::{AwsAccount, MetricConfig};
use crate::error::AppError;
use crate::labels::LabelSchema;

pub const SCRAPE_ERRORS_METRIC: &str = "aws_cost_exporter_scrape_errors_total";
pub const SCRAPE_DURATION_METRIC: &str = "aws_cost_exporter_scrape_duration_seconds";

struct CostGauge {
    gauge: GaugeVec,
    schema: LabelSchema,
}

pub struct MetricsSnapshot {
    registry: Registry,
    gauges: RwLock<HashMap<String, CostGauge>>,
    scrape_errors: IntCounter,
    scrape_duration: Histogram,
}

impl MetricsSnapshot {
    /// Registers one gauge per metric, with label names derived from `sample`.
    pub fn new(metrics: &[MetricConfig], sample: Option<&AwsAccount>) -> Result<Self, AppError> {
        let registry = Registry::new();
        let mut gauges = HashMap::with_capacity(metrics.len());

        for metric in metrics {
            let schema = LabelSchema::build(sample, metric);
            let names: Vec<&str> = schema.names().iter().map(String::as_str).collect();
            let gauge = GaugeVec::new(Opts::new(metric.metric_name.clone(), metric.help()), &names)
                .and_then(|gauge| {
                    registry.register(Box::new(gauge.clone()))?;
                    Ok(gauge)
                })
                .map_err(|e| {
                    AppError::Config(format!("metric '{}': {e}", metric.metric_name))
                })?;
            gauges.insert(metric.metric_name.clone(), CostGauge { gauge, schema });
        }

        let scrape_errors = IntCounter::new(SCRAPE_ERRORS_METRIC, "Total number of scrape errors")?;
        let scrape_duration = Histogram::with_opts(HistogramOpts::new(
            SCRAPE_DURATION_METRIC,
            "Duration of cost data scraping",
        ))?;
        registry.register(Box::new(scrape_errors.clone()))?;
        registry.register(Box::new(scrape_duration.clone()))?;

        Ok(Self {
            registry,
            gauges: RwLock::new(gauges),
            scrape_errors,
            scrape_duration,
        })
    }

    #[cfg(test)]
    pub fn label_names(&self, metric: &str) -> Option<Vec<String>> {
        self.gauges
            .read()
            .get(metric)
            .map(|g| g.schema.names().to_vec())
    }

    /// Whether `account` carries the label keys every gauge was declared with.
    pub fn fits_account(&self, account: &AwsAccount) -> bool {
        self.gauges
            .read()
            .values()
            .all(|cost| cost.schema.fits_account(account))
    }

    pub fn record_error(&self) {
        self.scrape_errors.inc();
    }

    #[cfg(test)]
    pub fn scrape_errors(&self) -> u64 {
        self.scrape_errors.get()
    }

    /// Observes the scrape duration when dropped.
    pub fn start_timer(&self) -> HistogramTimer {
        self.scrape_duration.start_timer()
    }

    /// Takes the exclusive lock and clears every gauge. Rows set through the
    /// returned guard become visible together once it is dropped.
    pub fn begin_publish(&self) -> Publication<'_> {
        let gauges = self.gauges.write();
        for cost in gauges.values() {
            cost.gauge.reset();
        }
        Publication { gauges }
    }

    /// Renders every registered metric in the text exposition format.
    pub fn render(&self) -> Result<String, AppError> {
        let _gauges = self.gauges.read();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Current rows of `metric` as (label pairs, value).
    #[cfg(test)]
    pub fn rows(&self, metric: &str) -> Vec<(Vec<(String, String)>, f64)> {
        let _gauges = self.gauges.read();
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == metric)
            .flat_map(|family| family.get_metric().iter())
            .map(|m| {
                let labels = m
                    .get_label()
                    .iter()
                    .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
                    .collect();
                (labels, m.get_gauge().get_value())
            })
            .collect()
    }
}

pub struct Publication<'a> {
    gauges: RwLockWriteGuard<'a, HashMap<String, CostGauge>>,
}

impl Publication<'_> {
    /// Sets one row of `metric` for `account`; `keys` are the raw group keys
    /// (empty for ungrouped metrics).
    pub fn set(
        &self,
        metric: &MetricConfig,
        account: &AwsAccount,
        keys: &[String],
        value: f64,
    ) -> Result<(), AppError> {
        let cost = self.gauges.get(&metric.metric_name).ok_or_else(|| {
            AppError::PublishInconsistency {
                metric: metric.metric_name.clone(),
                account_id: account.account_id.clone(),
                detail: "metric is not registered".into(),
            }
        })?;

        let values = cost.schema.realize(account, metric, keys)?;
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        cost.gauge.get_metric_with_label_values(&values)?.set(value);
        Ok(())
    }
}
