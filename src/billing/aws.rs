//! AWS Cost Explorer implementation of [`CostSource`].
//!
//! Each target account gets its own client whose credentials come from
//! assuming `arn:aws:iam::<account>:role/<role>` with the exporter's base
//! credentials. The role is assumed once, when the client is built.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_costexplorer::error::DisplayErrorContext;
use aws_sdk_costexplorer::types::{
    DateInterval, Dimension, DimensionValues, Expression, Granularity as CeGranularity,
    GroupDefinition as CeGroupDefinition, GroupDefinitionType, MatchOption, ResultByTime,
    TagValues,
};
use aws_sdk_costexplorer::Client;

use crate::billing::{filter_spec, parse_amount, CostSource, FilterSpec};
use crate::config::AwsAccount;
use crate::error::AppError;
use crate::models::{CostGroup, CostQuery, CostResult, Granularity, GroupType};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Loads the exporter's own AWS configuration (default credential chain).
pub async fn load_base_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}

pub struct CostExplorerSource {
    client: Client,
    account_id: String,
}

impl CostExplorerSource {
    pub async fn connect(base: &SdkConfig, account: &AwsAccount) -> Result<Self, AppError> {
        let provider = AssumeRoleProvider::builder(account.role_arn())
            .session_name(format!("aws-cost-exporter-{}", account.account_id))
            .configure(base)
            .build()
            .await;

        provider
            .provide_credentials()
            .await
            .map_err(|e| AppError::ClientInit {
                account_id: account.account_id.clone(),
                message: format!(
                    "assuming role {}: {}",
                    account.role_arn(),
                    DisplayErrorContext(&e)
                ),
            })?;

        let conf = aws_sdk_costexplorer::config::Builder::from(base)
            .credentials_provider(provider)
            .build();

        Ok(Self {
            client: Client::from_conf(conf),
            account_id: account.account_id.clone(),
        })
    }

    fn fetch_error(&self, query: &CostQuery, message: String) -> AppError {
        AppError::Fetch {
            account_id: self.account_id.clone(),
            metric: query.metric_name.clone(),
            message,
        }
    }
}

#[async_trait]
impl CostSource for CostExplorerSource {
    async fn fetch_costs(&self, query: &CostQuery) -> Result<CostResult, AppError> {
        let interval = DateInterval::builder()
            .start(query.start.format(DATE_FORMAT).to_string())
            .end(query.end.format(DATE_FORMAT).to_string())
            .build()
            .map_err(|e| self.fetch_error(query, format!("building date interval: {e}")))?;

        let group_by: Vec<CeGroupDefinition> = query
            .group_by
            .iter()
            .map(|g| {
                CeGroupDefinition::builder()
                    .r#type(group_type(g.group_type))
                    .key(g.key.clone())
                    .build()
            })
            .collect();
        let filter = expression(filter_spec(&query.record_types, &query.tag_filters));

        let result = collect_pages(&query.metric_type, |token| {
            let request = self
                .client
                .get_cost_and_usage()
                .time_period(interval.clone())
                .granularity(granularity(query.granularity))
                .metrics(query.metric_type.clone())
                .set_group_by((!group_by.is_empty()).then(|| group_by.clone()))
                .filter(filter.clone())
                .set_next_page_token(token);
            async move {
                let page = request
                    .send()
                    .await
                    .map_err(|e| format!("fetching cost data: {}", DisplayErrorContext(&e)))?;
                Ok(Page {
                    results: page.results_by_time().to_vec(),
                    next_page_token: page.next_page_token().map(str::to_string),
                })
            }
        })
        .await
        .map_err(|message| self.fetch_error(query, message))?;

        tracing::debug!(
            account_id = %self.account_id,
            metric = %query.metric_name,
            groups = result.groups.len(),
            total = result.total,
            "fetched cost data"
        );

        Ok(result)
    }
}

fn granularity(g: Granularity) -> CeGranularity {
    match g {
        Granularity::Daily => CeGranularity::Daily,
        Granularity::Monthly => CeGranularity::Monthly,
    }
}

fn group_type(t: GroupType) -> GroupDefinitionType {
    match t {
        GroupType::Dimension => GroupDefinitionType::Dimension,
        GroupType::Tag => GroupDefinitionType::Tag,
        GroupType::CostCategory => GroupDefinitionType::CostCategory,
    }
}

fn record_type_expression(record_types: Vec<String>) -> Expression {
    Expression::builder()
        .dimensions(
            DimensionValues::builder()
                .key(Dimension::RecordType)
                .set_values(Some(record_types))
                .build(),
        )
        .build()
}

fn expression(spec: FilterSpec) -> Expression {
    match spec {
        FilterSpec::RecordTypes(record_types) => record_type_expression(record_types),
        FilterSpec::And { record_types, tags } => {
            let mut all = Vec::with_capacity(tags.len() + 1);
            all.push(record_type_expression(record_types));
            all.extend(tags.into_iter().map(|tag| {
                Expression::builder()
                    .tags(
                        TagValues::builder()
                            .key(tag.tag_key)
                            .set_values(Some(tag.tag_values))
                            .match_options(MatchOption::Equals)
                            .build(),
                    )
                    .build()
            }));
            Expression::builder().set_and(Some(all)).build()
        }
    }
}

/// One `GetCostAndUsage` response page.
struct Page {
    results: Vec<ResultByTime>,
    next_page_token: Option<String>,
}

/// Requests pages until the continuation token is absent or empty.
async fn collect_pages<F, Fut>(metric_type: &str, mut fetch_page: F) -> Result<CostResult, String>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page, String>>,
{
    let mut pages = PageAccumulator::default();
    let mut token = None;
    loop {
        let page = fetch_page(token.take()).await?;
        pages.add(&page.results, metric_type)?;
        match page.next_page_token {
            Some(next) if !next.is_empty() => token = Some(next),
            _ => return Ok(pages.result),
        }
    }
}

/// Folds result pages into one [`CostResult`]. Rows with the same group keys
/// (one per time bucket) are summed.
#[derive(Debug, Default)]
struct PageAccumulator {
    result: CostResult,
    index: HashMap<Vec<String>, usize>,
}

impl PageAccumulator {
    fn add(&mut self, results: &[ResultByTime], metric_type: &str) -> Result<(), String> {
        for by_time in results {
            for group in by_time.groups() {
                let Some(metric) = group.metrics().and_then(|m| m.get(metric_type)) else {
                    continue;
                };
                let Some(raw) = metric.amount() else {
                    continue;
                };
                let amount = parse_amount(raw)?;
                let keys = group.keys().to_vec();

                match self.index.get(&keys) {
                    Some(&pos) => self.result.groups[pos].amount += amount,
                    None => {
                        self.index.insert(keys.clone(), self.result.groups.len());
                        self.result.groups.push(CostGroup {
                            keys,
                            amount,
                            unit: metric.unit().unwrap_or_default().to_string(),
                        });
                    }
                }
            }

            if by_time.groups().is_empty() {
                if let Some(raw) = by_time
                    .total()
                    .and_then(|t| t.get(metric_type))
                    .and_then(|m| m.amount())
                {
                    self.result.total += parse_amount(raw)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_costexplorer::types::{Group, MetricValue};

    fn value(amount: &str) -> MetricValue {
        MetricValue::builder().amount(amount).unit("USD").build()
    }

    fn grouped(keys: &[&str], metric: &str, amount: &str) -> Group {
        let mut builder = Group::builder().metrics(metric, value(amount));
        for key in keys {
            builder = builder.keys(*key);
        }
        builder.build()
    }

    fn page(amount: &str, next: Option<&str>) -> Page {
        Page {
            results: vec![ResultByTime::builder()
                .total("UnblendedCost", value(amount))
                .build()],
            next_page_token: next.map(str::to_string),
        }
    }

    async fn drain(pages: Vec<Page>) -> (Result<CostResult, String>, Vec<Option<String>>) {
        let mut pending = pages.into_iter();
        let mut tokens = Vec::new();
        let result = collect_pages("UnblendedCost", |token| {
            tokens.push(token);
            let next = pending.next().ok_or_else(|| "no more pages".to_string());
            async move { next }
        })
        .await;
        (result, tokens)
    }

    #[tokio::test]
    async fn follows_tokens_until_empty() {
        let (result, tokens) = drain(vec![
            page("1", Some("p2")),
            page("2", Some("p3")),
            page("4", Some("")),
            page("100", None),
        ])
        .await;
        assert_eq!(result.expect("pages").total, 7.0);
        assert_eq!(tokens, vec![None, Some("p2".into()), Some("p3".into())]);
    }

    #[tokio::test]
    async fn absent_token_stops_after_first_page() {
        let (result, tokens) = drain(vec![page("3", None), page("100", None)]).await;
        assert_eq!(result.expect("pages").total, 3.0);
        assert_eq!(tokens, vec![None]);
    }

    #[tokio::test]
    async fn failed_page_request_fails_the_fetch() {
        let (result, tokens) = drain(vec![page("1", Some("p2"))]).await;
        assert_eq!(result.expect_err("second page missing"), "no more pages");
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn accumulates_grouped_rows_across_pages() {
        let mut pages = PageAccumulator::default();
        let first = ResultByTime::builder()
            .groups(grouped(&["AmazonEC2", "team$payments"], "UnblendedCost", "10.5"))
            .build();
        let second = ResultByTime::builder()
            .groups(grouped(&["AmazonS3", "team$"], "UnblendedCost", "1.25"))
            .build();

        pages.add(&[first], "UnblendedCost").expect("first page");
        pages.add(&[second], "UnblendedCost").expect("second page");

        assert_eq!(pages.result.groups.len(), 2);
        assert_eq!(pages.result.groups[0].keys, vec!["AmazonEC2", "team$payments"]);
        assert_eq!(pages.result.groups[0].amount, 10.5);
        assert_eq!(pages.result.groups[1].unit, "USD");
        assert_eq!(pages.result.total, 0.0);
    }

    #[test]
    fn sums_same_keys_from_different_time_buckets() {
        let mut pages = PageAccumulator::default();
        let day1 = ResultByTime::builder()
            .groups(grouped(&["AmazonEC2"], "UnblendedCost", "2"))
            .build();
        let day2 = ResultByTime::builder()
            .groups(grouped(&["AmazonEC2"], "UnblendedCost", "3"))
            .build();
        pages.add(&[day1, day2], "UnblendedCost").expect("pages");
        assert_eq!(pages.result.groups.len(), 1);
        assert_eq!(pages.result.groups[0].amount, 5.0);
    }

    #[test]
    fn only_configured_metric_type_is_read() {
        let mut pages = PageAccumulator::default();
        let page = ResultByTime::builder()
            .groups(grouped(&["AmazonEC2"], "BlendedCost", "99"))
            .groups(Group::builder().keys("AmazonS3").build())
            .build();
        pages.add(&[page], "UnblendedCost").expect("page");
        assert!(pages.result.groups.is_empty());
    }

    #[test]
    fn accumulates_ungrouped_totals() {
        let mut pages = PageAccumulator::default();
        let a = ResultByTime::builder()
            .total("UnblendedCost", value("4.5"))
            .build();
        let b = ResultByTime::builder()
            .total("UnblendedCost", value("0.5"))
            .total("AmortizedCost", value("100"))
            .build();
        pages.add(&[a, b], "UnblendedCost").expect("pages");
        assert_eq!(pages.result.total, 5.0);
        assert!(pages.result.groups.is_empty());
    }

    #[test]
    fn malformed_amount_fails_the_fetch() {
        let mut pages = PageAccumulator::default();
        let page = ResultByTime::builder()
            .groups(grouped(&["AmazonEC2"], "UnblendedCost", "n/a"))
            .build();
        let err = pages.add(&[page], "UnblendedCost").expect_err("malformed");
        assert!(err.contains("n/a"));
    }

    #[test]
    fn expression_ands_tag_filters() {
        let spec = FilterSpec::And {
            record_types: vec!["Usage".into()],
            tags: vec![crate::config::TagFilter {
                tag_key: "env".into(),
                tag_values: vec!["prod".into()],
            }],
        };
        let expr = expression(spec);
        let and = expr.and();
        assert_eq!(and.len(), 2);
        let dims = and[0].dimensions().expect("record type filter");
        assert_eq!(dims.key(), Some(&Dimension::RecordType));
        assert_eq!(dims.values(), ["Usage"]);
        let tags = and[1].tags().expect("tag filter");
        assert_eq!(tags.key(), Some("env"));
        assert_eq!(tags.match_options(), [MatchOption::Equals]);
    }

    #[test]
    fn expression_without_tags_is_a_plain_dimension_filter() {
        let expr = expression(FilterSpec::RecordTypes(vec!["Usage".into()]));
        assert!(expr.and().is_empty());
        assert!(expr.dimensions().is_some());
    }
}
