use std::sync::Arc;

use clap::Parser;
use container_log_agent::cli::Cli;
use container_log_agent::collector::processor::{Record, RecordSink};
use container_log_agent::concurrency::{self, GateCapacities};
use container_log_agent::k8s::auth;
use container_log_agent::k8s::client::HttpKubernetesClient;
use container_log_agent::node_collector::NodeCollector;
use container_log_agent::trace;
use tracing::info;

/// Stand-in for the remote-write transport, which is out of scope for this
/// crate: logs every assembled record at debug level instead of shipping it.
struct LoggingSink;

impl RecordSink for LoggingSink {
    fn emit(&self, record: Record) {
        tracing::debug!(
            message = "assembled log record",
            time = %record.time,
            stream = ?record.stream,
            msg = %record.msg,
        );
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    trace::init(cli.log_format);

    concurrency::init(GateCapacities {
        read: cli.read_concurrency.unwrap_or_else(|| GateCapacities::default_for_platform().read),
        process: cli
            .process_concurrency
            .unwrap_or_else(|| GateCapacities::default_for_platform().process),
    });

    let (api_config, from_kubeconfig) = auth::load_kube_api_config(cli.kubeconfig.clone())
        .await
        .unwrap_or_else(|error| {
            container_log_agent::fatal!(message = "cannot resolve control-plane credentials", %error)
        });
    info!(message = "resolved control-plane credentials", from_kubeconfig, server = %api_config.server);

    let client = HttpKubernetesClient::new(api_config).unwrap_or_else(|error| {
        container_log_agent::fatal!(message = "cannot build control-plane HTTP client", %error)
    });

    let exclude_filter = cli.exclude_filter();

    let collector = NodeCollector::start(
        Arc::new(client),
        cli.node_name.clone(),
        cli.logs_dir.clone(),
        cli.checkpoints_path.clone(),
        exclude_filter,
        Arc::new(LoggingSink),
    )
    .await
    .unwrap_or_else(|error| container_log_agent::fatal!(message = "cannot start node collector", %error));

    info!(message = "container-log-agent started", node_name = %cli.node_name, logs_dir = %cli.logs_dir.display());

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(message = "cannot listen for shutdown signal", %error);
    }

    info!(message = "shutting down");
    collector.stop().await;
}
