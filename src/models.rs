use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::TagFilter;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Granularity {
    Daily,
    Monthly,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Daily => "DAILY",
            Granularity::Monthly => "MONTHLY",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupType {
    Dimension,
    Tag,
    CostCategory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDefinition {
    pub group_type: GroupType,
    pub key: String,
}

/// A single Cost Explorer request, built fresh for every (account, metric) fetch.
#[derive(Debug, Clone)]
pub struct CostQuery {
    pub metric_name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity: Granularity,
    pub metric_type: String,
    pub record_types: Vec<String>,
    pub group_by: Vec<GroupDefinition>,
    pub tag_filters: Vec<TagFilter>,
}

impl CostQuery {
    #[cfg(test)]
    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostGroup {
    pub keys: Vec<String>,
    pub amount: f64,
    pub unit: String,
}

/// Flattened result of a paginated query: either a running total or the grouped rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostResult {
    pub total: f64,
    pub groups: Vec<CostGroup>,
}
