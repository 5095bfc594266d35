//! Label schema for the cost gauges.
//!
//! Every gauge carries, in order: `account_id`, the account's custom label
//! keys (sorted), `charge_type`, then one label per group-by entry, each
//! immediately followed by its alias label when one is configured. The names
//! are fixed at startup; only values change between refreshes.

use crate::config::{AwsAccount, MetricConfig, DEFAULT_RECORD_TYPE};
use crate::error::AppError;
use crate::models::GroupType;

pub const ACCOUNT_ID_LABEL: &str = "account_id";
pub const CHARGE_TYPE_LABEL: &str = "charge_type";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSchema {
    names: Vec<String>,
    account_label_keys: Vec<String>,
}

impl LabelSchema {
    /// Derives the label names of `metric` using `sample` as the source of
    /// account label keys.
    pub fn build(sample: Option<&AwsAccount>, metric: &MetricConfig) -> Self {
        let account_label_keys: Vec<String> = sample
            .map(|account| account.labels.keys().cloned().collect())
            .unwrap_or_default();

        let mut names = Vec::with_capacity(account_label_keys.len() + 2);
        names.push(ACCOUNT_ID_LABEL.to_string());
        names.extend(account_label_keys.iter().cloned());
        names.push(CHARGE_TYPE_LABEL.to_string());

        for group in metric.active_groups() {
            names.push(group.label_name.clone());
            if let Some(alias) = &group.alias {
                names.push(alias.label_name.clone());
            }
        }

        Self {
            names,
            account_label_keys,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Whether `account` carries exactly the label keys this schema was built from.
    pub fn fits_account(&self, account: &AwsAccount) -> bool {
        account.labels.len() == self.account_label_keys.len()
            && account
                .labels
                .keys()
                .zip(&self.account_label_keys)
                .all(|(a, b)| a == b)
    }

    /// Realizes the label values for one row, rejecting rows whose shape
    /// does not line up with the declared names.
    pub fn realize(
        &self,
        account: &AwsAccount,
        metric: &MetricConfig,
        keys: &[String],
    ) -> Result<Vec<String>, AppError> {
        if !self.fits_account(account) {
            return Err(AppError::PublishInconsistency {
                metric: metric.metric_name.clone(),
                account_id: account.account_id.clone(),
                detail: format!(
                    "account label keys [{}] differ from schema keys [{}]",
                    account.labels.keys().cloned().collect::<Vec<_>>().join(","),
                    self.account_label_keys.join(",")
                ),
            });
        }

        let values = build_label_values(account, metric, keys);
        if values.len() != self.names.len() {
            return Err(AppError::PublishInconsistency {
                metric: metric.metric_name.clone(),
                account_id: account.account_id.clone(),
                detail: format!(
                    "realized {} label values for {} label names",
                    values.len(),
                    self.names.len()
                ),
            });
        }
        Ok(values)
    }
}

pub fn charge_type(metric: &MetricConfig) -> String {
    if metric.record_types.is_empty() {
        DEFAULT_RECORD_TYPE.to_string()
    } else {
        metric.record_types.join(",")
    }
}

/// Cost Explorer reports tag group keys as `tagKey$value`.
pub fn strip_tag_prefix<'a>(tag_key: &str, value: &'a str) -> &'a str {
    value
        .strip_prefix(tag_key)
        .and_then(|rest| rest.strip_prefix('$'))
        .unwrap_or(value)
}

pub fn build_label_values(
    account: &AwsAccount,
    metric: &MetricConfig,
    keys: &[String],
) -> Vec<String> {
    let mut values = Vec::with_capacity(account.labels.len() + 2 + keys.len() * 2);
    values.push(account.account_id.clone());
    values.extend(account.labels.values().cloned());
    values.push(charge_type(metric));

    for (i, group) in metric.active_groups().iter().enumerate() {
        let raw = keys.get(i).map(String::as_str).unwrap_or("");
        let value = match group.group_type {
            GroupType::Tag => strip_tag_prefix(&group.key, raw),
            GroupType::Dimension | GroupType::CostCategory => raw,
        };
        values.push(value.to_string());
        if let Some(alias) = &group.alias {
            values.push(alias.resolve(value).to_string());
        }
    }

    values
}
