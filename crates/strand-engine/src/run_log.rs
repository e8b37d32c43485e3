use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use strand_core::event::EventBus;
use strand_core::types::{EngineEvent, ExecutionId};

/// JSONL runtime logger.
///
/// Subscribes to the EventBus and writes one JSON object per line for a
/// single run and its subgraph runs. Every line is flushed as it is written,
/// so a crash mid-run leaves all earlier entries intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `log_dir` is the base directory; logs are written to
    /// `{log_dir}/{execution_id}/{timestamp}.jsonl`.
    /// `level` controls verbosity: 1=run summary, 2=node events, 3=progress.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe to `event_bus` now and write on a background task.
    ///
    /// The subscription exists before this returns, so a run started
    /// afterwards is logged from its first event.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, execution_id, cancel))
    }

    /// Write JSONL until cancellation or until the run ends.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<EngineEvent>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) {
        let run_dir = self.log_dir.join(sanitize(execution_id.as_str()));
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if !belongs_to(&execution_id, event.execution_id()) {
                                continue;
                            }
                            let entry = match self.event_to_entry(&event) {
                                Some(e) => e,
                                None => continue,
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            // Subgraph runs end long before their parent
                            if event.is_run_end() && event.execution_id() == &execution_id {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an EngineEvent to a log entry (returns None if filtered by level).
    fn event_to_entry(&self, event: &EngineEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, node_id: Option<&str>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: event.execution_id().to_string(),
            event_type: event_type.to_string(),
            node_id: node_id.map(str::to_string),
            detail,
        };

        match event {
            // L1: run summary
            EngineEvent::RunStarted { .. } => Some(entry("run_started", None, None)),
            EngineEvent::RunRecovered { replayed, .. } => Some(entry(
                "run_recovered",
                None,
                Some(serde_json::json!({ "replayed": replayed })),
            )),
            EngineEvent::RunCompleted { .. } => Some(entry("run_completed", None, None)),
            EngineEvent::RunFailed { error, .. } => Some(entry(
                "run_failed",
                None,
                Some(serde_json::json!({ "error": error })),
            )),
            EngineEvent::RunCancelled { .. } => Some(entry("run_cancelled", None, None)),

            // L2: node events
            EngineEvent::NodeStarted { node_id, .. } if self.level >= 2 => {
                Some(entry("node_started", Some(node_id.as_str()), None))
            }
            EngineEvent::NodeCompleted {
                node_id, elapsed_ms, ..
            } if self.level >= 2 => Some(entry(
                "node_completed",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "elapsed_ms": elapsed_ms })),
            )),
            EngineEvent::NodeFailed { node_id, error, .. } if self.level >= 2 => Some(entry(
                "node_failed",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "error": truncate_str(error, 500) })),
            )),
            EngineEvent::ParallelDispatched {
                node_id, branches, ..
            } if self.level >= 2 => Some(entry(
                "parallel_dispatched",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "branches": branches })),
            )),
            EngineEvent::SubgraphStarted {
                node_id, child_id, ..
            } if self.level >= 2 => Some(entry(
                "subgraph_started",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "child_id": child_id.as_str() })),
            )),

            // L3: progress fragments
            EngineEvent::NodeProgress { node_id, .. } if self.level >= 3 => {
                Some(entry("node_progress", Some(node_id.as_str()), None))
            }

            _ => None,
        }
    }
}

/// Whether `candidate` is `root` or one of its subgraph runs.
fn belongs_to(root: &ExecutionId, candidate: &ExecutionId) -> bool {
    candidate == root
        || candidate
            .as_str()
            .strip_prefix(root.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Child ids contain `/` and `#`; keep the directory name flat.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c == '/' || c == '#' { '_' } else { c })
        .collect()
}

/// Truncate a string for logging.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ExecutionId {
        ExecutionId::from_string(s)
    }

    #[test]
    fn test_jsonl_entry_format() {
        let entry = LogEntry {
            timestamp: "2026-02-24T12:00:00Z".to_string(),
            execution_id: "run-1".to_string(),
            event_type: "run_started".to_string(),
            node_id: None,
            detail: None,
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("run_started"));
        assert!(json.contains("run-1"));
        assert!(!json.contains("node_id"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let started = EngineEvent::RunStarted { execution_id: id("r") };
        let node = EngineEvent::NodeStarted {
            execution_id: id("r"),
            node_id: "a".into(),
        };
        let progress = EngineEvent::NodeProgress {
            execution_id: id("r"),
            node_id: "a".into(),
        };

        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(logger.event_to_entry(&started).is_some());
        assert!(logger.event_to_entry(&node).is_none());
        assert!(logger.event_to_entry(&progress).is_none());

        let logger2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = logger2.event_to_entry(&node).unwrap();
        assert_eq!(entry.node_id.as_deref(), Some("a"));
        assert!(logger2.event_to_entry(&progress).is_none());

        let logger3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(logger3.event_to_entry(&progress).is_some());
    }

    #[test]
    fn test_child_runs_belong_to_root() {
        let root = id("run-1");
        assert!(belongs_to(&root, &id("run-1")));
        assert!(belongs_to(&root, &root.child("sub", 2)));
        assert!(!belongs_to(&root, &id("run-10")));
        assert!(!belongs_to(&root, &id("other")));
    }

    #[test]
    fn test_sanitize_child_id() {
        assert_eq!(sanitize("run-1/sub#2"), "run-1_sub_2");
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("short", 50), "short");
    }

    #[tokio::test]
    async fn test_writes_until_run_end() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let root = id("run-1");
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let task = logger.spawn(&bus, root.clone(), CancellationToken::new());

        // Published before the task has had a chance to run
        bus.publish(EngineEvent::RunStarted { execution_id: root.clone() });
        bus.publish(EngineEvent::RunStarted { execution_id: id("unrelated") });
        bus.publish(EngineEvent::RunCompleted {
            execution_id: root.child("sub", 1),
        });
        bus.publish(EngineEvent::RunCompleted { execution_id: root.clone() });
        task.await.unwrap();

        let run_dir = dir.path().join("run-1");
        let file = std::fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("run_started"));
        assert!(lines[1].contains("run-1/sub#1"));
        assert!(lines[2].contains("run_completed"));
    }

    #[tokio::test]
    async fn test_cancel_stops_logger() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let cancel = CancellationToken::new();
        let task = RunLogger::new(dir.path().to_path_buf(), 1).spawn(&bus, id("run-2"), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
