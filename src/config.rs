use crate::error::AppError;
use crate::models::{Granularity, GroupType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

pub const ENV_PREFIX: &str = "AWS_COST_EXPORTER";
pub const DEFAULT_RECORD_TYPE: &str = "Usage";

fn default_exporter_port() -> u16 {
    9090
}

fn default_polling_interval_seconds() -> u64 {
    28800
}

fn default_aws_region() -> String {
    "us-east-1".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[serde(default = "default_exporter_port")]
    #[validate(range(min = 1))]
    pub exporter_port: u16,
    /// At most one year.
    #[serde(default = "default_polling_interval_seconds")]
    #[validate(range(min = 1, max = 31_536_000))]
    pub polling_interval_seconds: u64,
    #[serde(default = "default_aws_region")]
    #[validate(length(min = 1))]
    pub aws_region: String,
    /// Exclude accounts whose client cannot be built instead of aborting startup.
    #[serde(default)]
    pub skip_failed_accounts: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    #[validate(length(min = 1), nested)]
    pub metrics: Vec<MetricConfig>,
    #[serde(default)]
    #[validate(length(min = 1), nested)]
    pub target_aws_accounts: Vec<AwsAccount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MetricConfig {
    #[validate(length(min = 1))]
    pub metric_name: String,
    #[serde(default)]
    pub metric_description: String,
    pub granularity: Granularity,
    #[serde(default)]
    pub data_delay_days: u32,
    #[validate(length(min = 1))]
    pub metric_type: String,
    #[serde(default)]
    pub record_types: Vec<String>,
    #[serde(default)]
    #[validate(nested)]
    pub group_by: Option<GroupByConfig>,
    #[serde(default)]
    #[validate(nested)]
    pub tag_filters: Vec<TagFilter>,
}

impl MetricConfig {
    /// Group-by entries in effect; empty when grouping is absent or disabled.
    pub fn active_groups(&self) -> &[GroupConfig] {
        match &self.group_by {
            Some(group_by) if group_by.enabled => &group_by.groups,
            _ => &[],
        }
    }

    pub fn merge_policy(&self) -> Option<&MergeConfig> {
        match &self.group_by {
            Some(group_by) if group_by.enabled => {
                group_by.merge_minor_cost.as_ref().filter(|m| m.enabled)
            }
            _ => None,
        }
    }

    pub fn help(&self) -> &str {
        if self.metric_description.trim().is_empty() {
            &self.metric_name
        } else {
            &self.metric_description
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GroupByConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    #[validate(length(max = 2), nested)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub merge_minor_cost: Option<MergeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GroupConfig {
    #[serde(rename = "type")]
    pub group_type: GroupType,
    #[validate(length(min = 1))]
    pub key: String,
    #[validate(length(min = 1))]
    pub label_name: String,
    #[serde(default)]
    #[validate(nested)]
    pub alias: Option<AliasConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AliasConfig {
    #[validate(length(min = 1))]
    pub label_name: String,
    #[serde(default)]
    pub map: BTreeMap<String, String>,
}

impl AliasConfig {
    /// Mapped value for `key`, or `key` itself when unmapped.
    pub fn resolve<'a>(&'a self, key: &'a str) -> &'a str {
        if key.is_empty() {
            return key;
        }
        self.map.get(key).map(String::as_str).unwrap_or(key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub threshold: f64,
    #[serde(default)]
    pub tag_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct TagFilter {
    #[validate(length(min = 1))]
    pub tag_key: String,
    #[validate(length(min = 1))]
    pub tag_values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AwsAccount {
    #[validate(length(min = 1))]
    pub account_id: String,
    #[validate(length(min = 1))]
    pub assumed_role_name: String,
    /// Extra gauge dimensions; the map keeps them sorted by key.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl AwsAccount {
    pub fn role_arn(&self) -> String {
        format!(
            "arn:aws:iam::{}:role/{}",
            self.account_id, self.assumed_role_name
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
    Pretty,
}

impl AppConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_seconds)
    }

    /// Cross-field rules the derive attributes cannot express.
    fn check(&self) -> Result<(), AppError> {
        let mut names = HashSet::new();
        for metric in &self.metrics {
            if !names.insert(metric.metric_name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate metric_name '{}'",
                    metric.metric_name
                )));
            }

            if let Some(merge) = metric.merge_policy() {
                if !merge.threshold.is_finite() || merge.threshold < 0.0 {
                    return Err(AppError::Config(format!(
                        "metric '{}': merge_minor_cost.threshold must be a non-negative number",
                        metric.metric_name
                    )));
                }
                if merge.tag_value.is_empty() {
                    return Err(AppError::Config(format!(
                        "metric '{}': merge_minor_cost.tag_value is required when enabled",
                        metric.metric_name
                    )));
                }
            }

            let sample = self.target_aws_accounts.first();
            let labels = crate::labels::LabelSchema::build(sample, metric);
            let mut seen = HashSet::new();
            for name in labels.names() {
                if !seen.insert(name.as_str()) {
                    return Err(AppError::Config(format!(
                        "metric '{}': label '{}' is declared more than once",
                        metric.metric_name, name
                    )));
                }
            }
        }
        Ok(())
    }
}

pub fn parse_config(raw: &str) -> Result<AppConfig, AppError> {
    let settings = config::Config::builder()
        .add_source(config::File::from_str(raw, config::FileFormat::Yaml))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let cfg: AppConfig = settings.try_deserialize()?;
    cfg.validate()?;
    cfg.check()?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<AppConfig, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("reading config {}: {e}", path.display()))
    })?;
    parse_config(&raw)
}
