//! Ingest progress reporting.
//!
//! The ingest pipeline emits a [`ProgressEvent`] at every stage change and
//! after each embedded chunk. Reporters must not block: the human and JSON
//! reporters write a single line to **stderr** (so stdout remains parseable
//! for scripts) and [`ChannelProgress`] forwards events to an unbounded
//! channel for front ends that render progress themselves.

use std::fmt;
use std::io::Write;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::DocumentId;

/// Pipeline stage a progress event refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decoding,
    Chunking,
    Embedding,
    Indexed,
    Failed,
    Cancelled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Decoding => "decoding",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::Indexed => "indexed",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A single progress event for one document.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub document_id: DocumentId,
    /// Completion of the document's pipeline, 0 to 100.
    pub percent: u8,
}

impl ProgressEvent {
    pub fn new(stage: Stage, document_id: DocumentId, percent: u8) -> Self {
        Self {
            stage,
            document_id,
            percent: percent.min(100),
        }
    }

    /// Embedding progress: `done` of `total` chunks, scaled into 30..=95 so
    /// the decode and chunk stages keep their share of the bar.
    pub fn embedding(document_id: DocumentId, done: usize, total: usize) -> Self {
        let fraction = if total == 0 { 1.0 } else { done as f32 / total as f32 };
        Self::new(Stage::Embedding, document_id, 30 + (fraction * 65.0) as u8)
    }
}

/// Receives progress events. Called from the ingest pipeline; must return
/// promptly.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "ingest 3f2a…  embedding  64%".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = format!(
            "ingest {}  {:<9}  {:>3}%\n",
            event.document_id, event.stage, event.percent
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "document_id": event.document_id,
            "stage": event.stage,
            "percent": event.percent,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards events to an unbounded channel. Events sent after the receiver
/// is dropped are discarded.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_is_clamped() {
        let id = DocumentId::new();
        assert_eq!(ProgressEvent::new(Stage::Indexed, id, 250).percent, 100);
        assert_eq!(ProgressEvent::embedding(id, 0, 4).percent, 30);
        assert_eq!(ProgressEvent::embedding(id, 4, 4).percent, 95);
        assert_eq!(ProgressEvent::embedding(id, 0, 0).percent, 95);
    }

    #[tokio::test]
    async fn test_channel_reporter_never_blocks() {
        let (reporter, mut rx) = ChannelProgress::new();
        let id = DocumentId::new();
        for _ in 0..1000 {
            reporter.report(ProgressEvent::new(Stage::Chunking, id, 20));
        }
        assert_eq!(rx.recv().await.unwrap().stage, Stage::Chunking);
        drop(rx);
        reporter.report(ProgressEvent::new(Stage::Indexed, id, 100));
    }
}
