//! Command-line surface. One binary, one mode: run the collector until
//! killed. Flags mirror the config this crate needs to resolve a node,
//! locate logs, and persist checkpoints; there is no subcommand tree.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "container-log-agent", about = "Tails container logs on a node and forwards structured records")]
pub struct Cli {
    /// Name of the node this process runs on, used to scope the pod list
    /// and watch to containers scheduled here.
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Directory containing the per-container log symlinks.
    #[arg(long, default_value = "/var/log/containers")]
    pub logs_dir: PathBuf,

    /// Path to the durable checkpoints file.
    #[arg(long, default_value = "/var/lib/container-log-agent/checkpoints.json")]
    pub checkpoints_path: PathBuf,

    /// Path to a kubeconfig file to use instead of in-cluster credentials.
    /// Falls back to `$KUBECONFIG` or `~/.kube/config` when unset.
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Exclude containers in this namespace. Repeatable.
    #[arg(long = "exclude-namespace")]
    pub exclude_namespaces: Vec<String>,

    /// Exclude a specific `<namespace>/<pod>` from log collection. Repeatable.
    #[arg(long = "exclude-pod")]
    pub exclude_pods: Vec<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Maximum number of files read concurrently. Defaults to the number of
    /// available CPUs.
    #[arg(long)]
    pub read_concurrency: Option<usize>,

    /// Maximum number of line-processing batches running concurrently.
    /// Defaults to the number of available CPUs.
    #[arg(long)]
    pub process_concurrency: Option<usize>,
}

impl Cli {
    /// A closure matching containers against `--exclude-namespace`/
    /// `--exclude-pod`, or `None` if neither was given.
    pub fn exclude_filter(&self) -> Option<crate::collector::file_collector::ExcludeFilter> {
        if self.exclude_namespaces.is_empty() && self.exclude_pods.is_empty() {
            return None;
        }

        let namespaces = self.exclude_namespaces.clone();
        let pods = self.exclude_pods.clone();

        Some(std::sync::Arc::new(move |fields: &[(String, String)]| {
            let field = |name: &str| {
                fields
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.as_str())
                    .unwrap_or("")
            };
            let namespace = field("kubernetes.pod_namespace");
            let pod_name = field("kubernetes.pod_name");

            if namespaces.iter().any(|ns| ns == namespace) {
                return true;
            }
            pods.iter()
                .any(|entry| entry == &format!("{namespace}/{pod_name}"))
        }))
    }
}
