//! The tailing subsystem: checkpoints, fingerprinting, per-file reading,
//! line processing, and the file collector that owns one reader per
//! tracked path. See `crate::node_collector` for how these are wired to
//! the control-plane client.

pub mod checkpoint;
pub mod file_collector;
pub mod fingerprint;
pub mod log_file;
pub mod processor;
