//! Fatal-error handling.
//!
//! A handful of conditions in this crate are true bugs or environment
//! corruption: a symlink's target disappears between a `stat` and an `open`,
//! the checkpoint store can't start, the control plane hands back a
//! container with no ID. The Go implementation this crate is modeled on
//! calls `logger.Panicf`, which logs and aborts the process. A bare `panic!`
//! doesn't have the same effect here: most of these conditions are detected
//! inside a `tokio::spawn`'d task, and an unhandled panic there only kills
//! that task, not the process. `fatal!` logs at `error` and exits instead.

/// Log a fatal diagnostic and terminate the process.
///
/// Never returns. Use for conditions spec'd as "fatal / programmer error":
/// invariant violations and environment corruption that the caller has no
/// reasonable way to recover from.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        tracing::error!($($arg)+);
        std::process::exit(1);
    }};
}

use std::path::PathBuf;

use snafu::Snafu;

use crate::k8s::client::ClientError;

/// Failures that can prevent a [`crate::node_collector::NodeCollector`] from
/// starting at all. Unlike `fatal!`, these are reported back to `main` so it
/// can exit with a clear message instead of a panic from deep inside a task.
#[derive(Debug, Snafu)]
pub enum StartError {
    #[snafu(display("logs directory {} does not exist or is not accessible", path.display()))]
    LogsDirMissing { path: PathBuf },

    #[snafu(display("cannot get information about current node {node_name:?}: {source}"))]
    GetNode {
        node_name: String,
        source: ClientError,
    },

    #[snafu(display("cannot get pods on node {node_name:?}: {source}"))]
    GetPods {
        node_name: String,
        source: ClientError,
    },
}
