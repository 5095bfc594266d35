use crate::config::{MetricConfig, TagFilter, DEFAULT_RECORD_TYPE};
use crate::error::AppError;
use crate::models::{CostQuery, CostResult, GroupDefinition};
use crate::period::period_for;
use async_trait::async_trait;

pub mod aws;

/// A per-account handle on the billing API.
#[async_trait]
pub trait CostSource: Send + Sync {
    async fn fetch_costs(&self, query: &CostQuery) -> Result<CostResult, AppError>;
}

pub fn build_query(metric: &MetricConfig) -> CostQuery {
    let period = period_for(metric.granularity, metric.data_delay_days);
    let group_by = metric
        .active_groups()
        .iter()
        .map(|g| GroupDefinition {
            group_type: g.group_type,
            key: g.key.clone(),
        })
        .collect();

    CostQuery {
        metric_name: metric.metric_name.clone(),
        start: period.start,
        end: period.end,
        granularity: metric.granularity,
        metric_type: metric.metric_type.clone(),
        record_types: metric.record_types.clone(),
        group_by,
        tag_filters: metric.tag_filters.clone(),
    }
}

/// Provider-neutral form of the query filter: a record-type dimension
/// filter, ANDed with one equality filter per configured tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSpec {
    RecordTypes(Vec<String>),
    And {
        record_types: Vec<String>,
        tags: Vec<TagFilter>,
    },
}

pub fn filter_spec(record_types: &[String], tag_filters: &[TagFilter]) -> FilterSpec {
    let record_types = if record_types.is_empty() {
        vec![DEFAULT_RECORD_TYPE.to_string()]
    } else {
        record_types.to_vec()
    };

    if tag_filters.is_empty() {
        FilterSpec::RecordTypes(record_types)
    } else {
        FilterSpec::And {
            record_types,
            tags: tag_filters.to_vec(),
        }
    }
}

/// Parses a Cost Explorer amount string.
pub fn parse_amount(raw: &str) -> Result<f64, String> {
    raw.trim()
        .parse::<f64>()
        .map_err(|e| format!("parsing cost amount {raw:?}: {e}"))
}
