//! The line processor: the capability set a `LogFile` calls into for every
//! reassembled line (`tryAddLine`/`mustClose` in `file_collector.go`), and
//! the one mandatory implementation — a container-runtime log-line parser
//! that reassembles `P`/`F`-tagged chunks into logical records.
//!
//! The wire format this parses (`<timestamp> <stream> <P|F> <payload>`) is
//! the CRI log format emitted by containerd/CRI-O. Record delivery past
//! this point (the actual remote-write transport) is out of scope; `emit`
//! is the seam a shipper hangs off of.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

/// Capability set a `LogFile` drives for every line it reassembles.
pub trait LineProcessor: Send {
    /// Handle one complete line (no trailing `\n`). Returns whether the
    /// reader's commit pointer may advance past it.
    fn try_add_line(&mut self, line: &[u8]) -> bool;

    /// Flush any buffered partial record and release resources. Called when
    /// a reader is torn down (rotation switch, deletion, or shutdown).
    fn must_close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A fully assembled, ready-to-ship log record.
#[derive(Debug, Clone)]
pub struct Record {
    pub common_fields: Arc<Vec<(String, String)>>,
    pub stream_key_len: usize,
    pub time: DateTime<Utc>,
    pub stream: Stream,
    pub msg: String,
}

/// Where assembled records go. The concrete transport (remote-write to the
/// log store) is an external collaborator; this trait is the seam.
pub trait RecordSink: Send + Sync {
    fn emit(&self, record: Record);
}

struct PartialAccumulator {
    time: DateTime<Utc>,
    buf: String,
}

/// Parses CRI-formatted log lines and accumulates consecutive `P`-tagged
/// chunks into one logical record before emitting. Stdout and stderr are
/// interleaved in the same file, so each stream gets its own pending
/// accumulator — a `P` chunk only ever joins a chunk from its own stream.
pub struct ContainerLogLineProcessor {
    common_fields: Arc<Vec<(String, String)>>,
    stream_key_len: usize,
    sink: Arc<dyn RecordSink>,
    path: String,
    stdout_partial: Option<PartialAccumulator>,
    stderr_partial: Option<PartialAccumulator>,
}

impl ContainerLogLineProcessor {
    pub fn new(
        common_fields: Arc<Vec<(String, String)>>,
        stream_key_len: usize,
        sink: Arc<dyn RecordSink>,
        path: impl Into<String>,
    ) -> Self {
        ContainerLogLineProcessor {
            common_fields,
            stream_key_len,
            sink,
            path: path.into(),
            stdout_partial: None,
            stderr_partial: None,
        }
    }

    fn emit(&self, time: DateTime<Utc>, stream: Stream, msg: String) {
        self.sink.emit(Record {
            common_fields: Arc::clone(&self.common_fields),
            stream_key_len: self.stream_key_len,
            time,
            stream,
            msg,
        });
    }

    fn partial_slot(&mut self, stream: Stream) -> &mut Option<PartialAccumulator> {
        match stream {
            Stream::Stdout => &mut self.stdout_partial,
            Stream::Stderr => &mut self.stderr_partial,
        }
    }
}

impl LineProcessor for ContainerLogLineProcessor {
    fn try_add_line(&mut self, line: &[u8]) -> bool {
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(_) => {
                warn!(message = "log line is not valid UTF-8, dropping it", path = %self.path);
                return true;
            }
        };

        let Some(parsed) = parse_cri_line(line) else {
            warn!(message = "malformed log line, dropping it", path = %self.path, line);
            return true;
        };

        match parsed.tag {
            Tag::Full => {
                let slot = self.partial_slot(parsed.stream);
                let (time, msg) = match slot.take() {
                    Some(mut acc) => {
                        acc.buf.push_str(parsed.payload);
                        (acc.time, acc.buf)
                    }
                    None => (parsed.time, parsed.payload.to_string()),
                };
                self.emit(time, parsed.stream, msg);
                true
            }
            Tag::Partial => {
                let slot = self.partial_slot(parsed.stream);
                match slot {
                    Some(acc) => acc.buf.push_str(parsed.payload),
                    None => {
                        *slot = Some(PartialAccumulator {
                            time: parsed.time,
                            buf: parsed.payload.to_string(),
                        })
                    }
                }
                false
            }
        }
    }

    fn must_close(&mut self) {
        if let Some(acc) = self.stdout_partial.take() {
            self.emit(acc.time, Stream::Stdout, acc.buf);
        }
        if let Some(acc) = self.stderr_partial.take() {
            self.emit(acc.time, Stream::Stderr, acc.buf);
        }
    }
}

enum Tag {
    Partial,
    Full,
}

struct ParsedLine<'a> {
    time: DateTime<Utc>,
    stream: Stream,
    tag: Tag,
    payload: &'a str,
}

/// Parse one `<RFC3339Nano timestamp> <stdout|stderr> <P|F> <payload>` line.
fn parse_cri_line(line: &str) -> Option<ParsedLine<'_>> {
    let mut parts = line.splitn(4, ' ');
    let timestamp = parts.next()?;
    let stream = parts.next()?;
    let tag = parts.next()?;
    let payload = parts.next().unwrap_or("");

    let time = DateTime::parse_from_rfc3339(timestamp).ok()?.with_timezone(&Utc);
    let stream = match stream {
        "stdout" => Stream::Stdout,
        "stderr" => Stream::Stderr,
        _ => return None,
    };
    let tag = match tag {
        "F" => Tag::Full,
        "P" => Tag::Partial,
        _ => return None,
    };

    Some(ParsedLine {
        time,
        stream,
        tag,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectSink(Mutex<Vec<Record>>);

    impl RecordSink for CollectSink {
        fn emit(&self, record: Record) {
            self.0.lock().unwrap().push(record);
        }
    }

    fn processor(sink: Arc<CollectSink>) -> ContainerLogLineProcessor {
        ContainerLogLineProcessor::new(
            Arc::new(vec![("kubernetes.container_name".to_string(), "app".to_string())]),
            3,
            sink,
            "/var/log/containers/app.log",
        )
    }

    #[test]
    fn full_line_emits_immediately_and_commits() {
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        let mut proc = processor(Arc::clone(&sink));

        let commit = proc.try_add_line(b"2025-10-16T15:37:36.1Z stdout F full line");
        assert!(commit);

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].msg, "full line");
        assert_eq!(records[0].stream, Stream::Stdout);
    }

    #[test]
    fn partial_lines_accumulate_until_full() {
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        let mut proc = processor(Arc::clone(&sink));

        assert!(!proc.try_add_line(b"2025-10-16T15:37:36.1Z stdout P foo "));
        assert!(!proc.try_add_line(b"2025-10-16T15:37:36.2Z stdout P bar "));
        assert!(proc.try_add_line(b"2025-10-16T15:37:36.3Z stdout F buz"));

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].msg, "foo bar buz");
        assert_eq!(records[0].time.to_rfc3339(), "2025-10-16T15:37:36.100+00:00");
    }

    #[test]
    fn malformed_line_is_dropped_but_commits() {
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        let mut proc = processor(Arc::clone(&sink));

        let commit = proc.try_add_line(b"not a cri line");
        assert!(commit);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn must_close_flushes_dangling_partial() {
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        let mut proc = processor(Arc::clone(&sink));

        proc.try_add_line(b"2025-10-16T15:37:36.1Z stdout P unfinished");
        proc.must_close();

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].msg, "unfinished");
    }

    #[test]
    fn interleaved_streams_accumulate_independently() {
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        let mut proc = processor(Arc::clone(&sink));

        assert!(!proc.try_add_line(b"2025-10-16T15:37:36.1Z stdout P out-foo "));
        assert!(!proc.try_add_line(b"2025-10-16T15:37:36.2Z stderr P err-foo "));
        assert!(proc.try_add_line(b"2025-10-16T15:37:36.3Z stderr F err-bar"));
        assert!(proc.try_add_line(b"2025-10-16T15:37:36.4Z stdout F out-bar"));

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stream, Stream::Stderr);
        assert_eq!(records[0].msg, "err-foo err-bar");
        assert_eq!(records[1].stream, Stream::Stdout);
        assert_eq!(records[1].msg, "out-foo out-bar");
    }

    #[test]
    fn must_close_flushes_both_streams_pending_partials() {
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        let mut proc = processor(Arc::clone(&sink));

        proc.try_add_line(b"2025-10-16T15:37:36.1Z stdout P out-unfinished");
        proc.try_add_line(b"2025-10-16T15:37:36.2Z stderr P err-unfinished");
        proc.must_close();

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].msg, "out-unfinished");
        assert_eq!(records[1].msg, "err-unfinished");
    }
}
