use crate::billing::aws::{load_base_config, CostExplorerSource};
use crate::collector::{AccountClient, CostCollector};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::poller::Poller;
use crate::server;
use crate::snapshot::MetricsSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// How long in-flight scrapes may take to finish once shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct ExporterService {
    config: AppConfig,
    collector: Arc<CostCollector>,
}

impl ExporterService {
    /// Builds one Cost Explorer client per target account.
    pub async fn new(config: AppConfig) -> Result<Self, AppError> {
        let base = load_base_config(&config.aws_region).await;
        let mut accounts = Vec::with_capacity(config.target_aws_accounts.len());

        for account in &config.target_aws_accounts {
            match CostExplorerSource::connect(&base, account).await {
                Ok(source) => accounts.push(AccountClient {
                    account: account.clone(),
                    source: Arc::new(source),
                }),
                Err(e) if config.skip_failed_accounts => {
                    tracing::error!(
                        account_id = %account.account_id,
                        error = %e,
                        "excluding account from all refresh cycles"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Self::with_accounts(config, accounts)
    }

    pub fn with_accounts(config: AppConfig, accounts: Vec<AccountClient>) -> Result<Self, AppError> {
        if accounts.is_empty() {
            return Err(AppError::Config("no usable target AWS accounts".into()));
        }

        let snapshot = Arc::new(MetricsSnapshot::new(
            &config.metrics,
            config.target_aws_accounts.first(),
        )?);
        let collector = Arc::new(CostCollector::new(
            snapshot,
            config.metrics.clone(),
            accounts,
        ));

        Ok(Self { config, collector })
    }

    #[cfg(test)]
    pub fn collector(&self) -> &Arc<CostCollector> {
        &self.collector
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), AppError> {
        let listener = server::bind(self.config.exporter_port).await?;
        self.run_with_listener(listener, cancel).await
    }

    /// Runs the HTTP server and the poller until `cancel` fires or either
    /// task stops on its own.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), AppError> {
        tracing::info!(
            port = self.config.exporter_port,
            polling_interval_seconds = self.config.polling_interval_seconds,
            accounts = self.collector.account_count(),
            metrics = self.config.metrics.len(),
            "starting exporter"
        );

        let mut server = tokio::spawn(server::serve(
            listener,
            Arc::clone(self.collector.snapshot()),
            cancel.clone(),
        ));
        let mut poller = tokio::spawn(
            Poller::new(Arc::clone(&self.collector), self.config.polling_interval())
                .run(cancel.clone()),
        );

        let exit = tokio::select! {
            _ = cancel.cancelled() => Exit::Cancelled,
            joined = &mut server => Exit::Server(joined),
            joined = &mut poller => Exit::Poller(joined),
        };
        cancel.cancel();

        let result = match exit {
            Exit::Server(joined) => {
                tracing::error!("HTTP server exited unexpectedly");
                let result = flatten(joined);
                stop_poller(poller).await;
                result
            }
            Exit::Poller(joined) => {
                let reason = match joined {
                    Ok(()) => "poller stopped unexpectedly".to_string(),
                    Err(e) => format!("poller task failed: {e}"),
                };
                tracing::error!(reason = %reason, "stopping exporter");
                let _ = drain_server(server).await;
                Err(AppError::Io(std::io::Error::other(reason)))
            }
            Exit::Cancelled => {
                tracing::info!("shutdown signal received");
                let result = drain_server(server).await;
                stop_poller(poller).await;
                result
            }
        };

        tracing::info!("exporter stopped");
        result
    }
}

enum Exit {
    Cancelled,
    Server(Result<Result<(), AppError>, JoinError>),
    Poller(Result<(), JoinError>),
}

async fn drain_server(server: JoinHandle<Result<(), AppError>>) -> Result<(), AppError> {
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(joined) => flatten(joined),
        Err(_) => {
            tracing::warn!("HTTP server did not drain within the shutdown grace period");
            Ok(())
        }
    }
}

async fn stop_poller(poller: JoinHandle<()>) {
    if let Err(e) = poller.await {
        tracing::warn!(error = %e, "poller task did not stop cleanly");
    }
}

fn flatten(joined: Result<Result<(), AppError>, JoinError>) -> Result<(), AppError> {
    joined.map_err(|e| AppError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::CostSource;
    use crate::config::parse_config;
    use crate::config::tests::SAMPLE;
    use crate::models::{CostQuery, CostResult};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FixedSource;

    #[async_trait]
    impl CostSource for FixedSource {
        async fn fetch_costs(&self, query: &CostQuery) -> Result<CostResult, AppError> {
            Ok(CostResult {
                total: if query.is_grouped() { 0.0 } else { 8.5 },
                groups: vec![],
            })
        }
    }

    fn service() -> ExporterService {
        let config = parse_config(SAMPLE).expect("sample config");
        let accounts = config
            .target_aws_accounts
            .iter()
            .map(|account| AccountClient {
                account: account.clone(),
                source: Arc::new(FixedSource),
            })
            .collect();
        ExporterService::with_accounts(config, accounts).expect("service")
    }

    #[test]
    fn with_accounts_requires_at_least_one_client() {
        let config = parse_config(SAMPLE).expect("sample config");
        assert!(matches!(
            ExporterService::with_accounts(config, vec![]),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn stopped_poller_ends_the_exporter() {
        let mut service = service();
        service.config.polling_interval_seconds = u64::MAX;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let cancel = CancellationToken::new();

        let result = tokio::time::timeout(
            Duration::from_secs(15),
            service.run_with_listener(listener, cancel.clone()),
        )
        .await
        .expect("exporter should stop without a shutdown signal");

        assert!(matches!(result, Err(AppError::Io(_))));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn serves_refreshed_metrics_until_cancelled() {
        let service = service();
        let collector = Arc::clone(service.collector());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        let running = tokio::spawn(service.run_with_listener(listener, cancel.clone()));

        for _ in 0..100 {
            if !collector.snapshot().rows("aws_monthly_cost_usd").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write request");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read response");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("aws_monthly_cost_usd{"));
        assert!(response.contains("} 8.5"));

        cancel.cancel();
        running.await.expect("join").expect("clean shutdown");
    }
}
