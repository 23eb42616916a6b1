//! Binds the checkpoint store, file collector, and control-plane client
//! together: seeds readers from the current pod list, then reacts to watch
//! events for the lifetime of the process. Grounded on `kubernetesCollector`
//! in `collector.go`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backoff::BackoffTimer;
use crate::collector::file_collector::{CommonFields, ExcludeFilter, FileCollector, ProcessorFactory};
use crate::collector::processor::{ContainerLogLineProcessor, RecordSink};
use crate::fatal;
use crate::k8s::client::{ClientError, KubernetesClient};
use crate::k8s::types::{ApiStatus, ContainerStatus, Node, Pod, PodStatus, WatchEvent};

const WATCH_BACKOFF_FLOOR: Duration = Duration::from_millis(200);
const WATCH_BACKOFF_CEILING: Duration = Duration::from_secs(30);
const EOF_THROTTLE_WINDOW: Duration = Duration::from_secs(60);

/// Field names matching vector.dev's `kubernetes_logs` source, for easy
/// migration. The first three form the stream key.
const STREAM_KEY_LEN: usize = 3;

pub struct NodeCollector {
    file_collector: Arc<FileCollector>,
    watch_task: Option<JoinHandle<()>>,
    stop_tx: tokio::sync::watch::Sender<bool>,
}

impl NodeCollector {
    /// Verify `logs_dir` exists, fetch node + pod state, seed readers, clean
    /// stale checkpoints, then start the watch loop. Returns a handle whose
    /// `stop()` tears everything down.
    pub async fn start(
        client: Arc<dyn KubernetesClient>,
        node_name: String,
        logs_dir: PathBuf,
        checkpoints_path: PathBuf,
        exclude_filter: Option<ExcludeFilter>,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self, crate::errors::StartError> {
        if tokio::fs::metadata(&logs_dir).await.is_err() {
            return Err(crate::errors::StartError::LogsDirMissing {
                path: logs_dir.clone(),
            });
        }

        let current_node = client
            .get_node_by_name(&node_name)
            .await
            .map_err(|source| crate::errors::StartError::GetNode {
                node_name: node_name.clone(),
                source,
            })?;

        let new_processor: ProcessorFactory = {
            let sink = Arc::clone(&sink);
            Arc::new(move |common_fields: CommonFields, path: &Path| {
                Box::new(ContainerLogLineProcessor::new(
                    common_fields,
                    STREAM_KEY_LEN,
                    Arc::clone(&sink),
                    path.to_string_lossy().to_string(),
                )) as Box<dyn crate::collector::processor::LineProcessor>
            })
        };

        let file_collector = Arc::new(
            FileCollector::start(checkpoints_path, exclude_filter, new_processor)
                .await
                .unwrap_or_else(|error| {
                    fatal!(message = "cannot start checkpoint store", %error)
                }),
        );

        let pod_list = client
            .get_node_pods(&node_name)
            .await
            .map_err(|source| crate::errors::StartError::GetPods {
                node_name: node_name.clone(),
                source,
            })?;

        for pod in &pod_list.items {
            start_read_pod_logs(&file_collector, &current_node, pod, &logs_dir);
        }
        file_collector.cleanup_checkpoints();

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let watch_task = spawn_watch_task(
            client,
            current_node,
            node_name,
            logs_dir,
            Arc::clone(&file_collector),
            pod_list.metadata.resource_version,
            stop_rx,
        );

        Ok(NodeCollector {
            file_collector,
            watch_task: Some(watch_task),
            stop_tx,
        })
    }

    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.watch_task.take() {
            if let Err(error) = task.await {
                warn!(message = "watch task panicked", %error);
            }
        }
        self.file_collector.stop().await;
    }
}

fn start_read_pod_logs(file_collector: &FileCollector, node: &Node, pod: &Pod, logs_dir: &Path) {
    for container in &pod.spec.containers {
        if let Some(cs) = pod.status.find_container_status(&container.name) {
            if !cs.container_id.is_empty() {
                start_read_one(file_collector, node, pod, cs, logs_dir);
            }
        }
    }
    for container in &pod.spec.init_containers {
        if let Some(cs) = pod.status.find_init_container_status(&container.name) {
            if !cs.container_id.is_empty() {
                start_read_one(file_collector, node, pod, cs, logs_dir);
            }
        }
    }
}

fn start_read_one(file_collector: &FileCollector, node: &Node, pod: &Pod, cs: &ContainerStatus, logs_dir: &Path) {
    let common_fields = Arc::new(common_fields(node, pod, &pod.status, cs));
    let path = log_file_path(logs_dir, pod, cs);
    file_collector.start_read(path, common_fields);
}

/// Stable ordered field set enriching every record; the first
/// [`STREAM_KEY_LEN`] entries form the stream key and must stay in this
/// order. Field names follow vector.dev's `kubernetes_logs` source.
fn common_fields(node: &Node, pod: &Pod, status: &PodStatus, cs: &ContainerStatus) -> Vec<(String, String)> {
    let mut fields = vec![
        ("kubernetes.container_name".to_string(), cs.name.clone()),
        ("kubernetes.pod_name".to_string(), pod.metadata.name.clone()),
        (
            "kubernetes.pod_namespace".to_string(),
            pod.metadata.namespace.clone(),
        ),
        (
            "kubernetes.container_id".to_string(),
            cs.container_id.clone(),
        ),
        ("kubernetes.pod_ip".to_string(), status.pod_ip.clone()),
        (
            "kubernetes.pod_node_name".to_string(),
            pod.spec.node_name.clone(),
        ),
    ];

    for (k, v) in &pod.metadata.labels {
        fields.push((format!("kubernetes.pod_labels.{k}"), v.clone()));
    }
    for (k, v) in &pod.metadata.annotations {
        fields.push((format!("kubernetes.pod_annotations.{k}"), v.clone()));
    }
    for (k, v) in &node.metadata.labels {
        fields.push((format!("kubernetes.node_labels.{k}"), v.clone()));
    }
    for (k, v) in &node.metadata.annotations {
        fields.push((format!("kubernetes.node_annotations.{k}"), v.clone()));
    }

    debug_assert_eq!(fields[0].0, "kubernetes.container_name");
    debug_assert_eq!(fields[1].0, "kubernetes.pod_name");
    debug_assert_eq!(fields[2].0, "kubernetes.pod_namespace");

    fields
}

/// `<logsDir>/<podName>_<podNamespace>_<containerName>-<containerID>.log`,
/// stripping a runtime scheme prefix (`docker://`, `containerd://`) from the
/// container ID if present.
fn log_file_path(logs_dir: &Path, pod: &Pod, cs: &ContainerStatus) -> PathBuf {
    let container_id = match cs.container_id.find("://") {
        Some(idx) => &cs.container_id[idx + 3..],
        None => &cs.container_id,
    };

    if pod.metadata.name.is_empty()
        || pod.metadata.namespace.is_empty()
        || cs.name.is_empty()
        || container_id.is_empty()
    {
        fatal!(
            message = "got invalid container info from the control plane",
            pod_name = %pod.metadata.name,
            pod_namespace = %pod.metadata.namespace,
            container_name = %cs.name,
            container_id,
        );
    }

    let filename = format!(
        "{}_{}_{}-{}.log",
        pod.metadata.name, pod.metadata.namespace, cs.name, container_id
    );
    logs_dir.join(filename)
}

#[allow(clippy::too_many_arguments)]
fn spawn_watch_task(
    client: Arc<dyn KubernetesClient>,
    node: Node,
    node_name: String,
    logs_dir: PathBuf,
    file_collector: Arc<FileCollector>,
    initial_resource_version: String,
    mut stop_rx: tokio::sync::watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut resource_version = initial_resource_version;
        let mut backoff = BackoffTimer::new(WATCH_BACKOFF_FLOOR, WATCH_BACKOFF_CEILING);
        let mut error_fired = false;
        let mut last_eof: Option<Instant> = None;

        loop {
            if *stop_rx.borrow() {
                return;
            }

            let mut stream = match client.watch_node_pods(&node_name, &resource_version).await {
                Ok(stream) => stream,
                Err(error) => {
                    error_fired = true;
                    warn!(
                        message = "failed to start watching pods on node",
                        node_name,
                        %error,
                        retry_in = ?backoff.current_delay(),
                    );
                    backoff.wait(&mut stop_rx).await;
                    continue;
                }
            };

            if error_fired {
                info!(message = "re-established watching pods on node", node_name);
            }
            error_fired = false;
            backoff.reset();

            let mut got_410 = false;
            let result = stream
                .read_events(|event| {
                    handle_watch_event(
                        event,
                        &node,
                        &logs_dir,
                        &file_collector,
                        &mut resource_version,
                        &mut got_410,
                    )
                })
                .await;
            stream.close();

            if got_410 {
                resource_version.clear();
                continue;
            }

            match result {
                Ok(()) => {}
                Err(ClientError::StreamEof { .. }) => {
                    let now = Instant::now();
                    let throttled = last_eof.is_some_and(|t| now.duration_since(t) < EOF_THROTTLE_WINDOW);
                    if !throttled {
                        last_eof = Some(now);
                        continue;
                    }
                    warn!(message = "watch stream ended repeatedly within a minute", node_name);
                    error_fired = true;
                }
                Err(error) => {
                    error!(message = "failed to read the pod watch stream", node_name, %error);
                    error_fired = true;
                }
            }
        }
    })
}

/// Returns whether the watch loop should keep delivering events from this
/// connection (mirrors the handler-continues contract on `EventStream`).
fn handle_watch_event(
    event: WatchEvent,
    node: &Node,
    logs_dir: &Path,
    file_collector: &FileCollector,
    resource_version: &mut String,
    got_410: &mut bool,
) -> bool {
    match event.event_type.as_str() {
        "ADDED" | "MODIFIED" => {
            let pod: Pod = match serde_json::from_value(event.object) {
                Ok(pod) => pod,
                Err(error) => fatal!(message = "cannot parse pod from watch event", %error),
            };
            start_read_pod_logs(file_collector, node, &pod, logs_dir);
            *resource_version = pod.metadata.resource_version.clone();
            true
        }
        "DELETED" => true,
        "ERROR" => {
            let status: ApiStatus = serde_json::from_value(event.object).unwrap_or_default();
            if status.code == 410 {
                *got_410 = true;
                return false;
            }
            error!(
                message = "got an error event from the control plane",
                code = status.code,
                status_message = %status.message,
            );
            true
        }
        other => {
            error!(message = "unexpected watch event type, restarting stream", event_type = other);
            false
        }
    }
}
