use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One progress notification for the client that submitted a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: String,
    pub session_id: String,
    pub percent: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.percent >= 100
    }
}

/// Transport that delivers events to a client session
pub trait ProgressSink: Send + Sync {
    fn send(&self, session_id: &str, event: &ProgressEvent) -> Result<()>;
}

/// Producer side shared by all workers
#[derive(Clone)]
pub struct ProgressHub {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressHub {
    /// Create the hub and the receiver the transport consumes
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProgressHub { tx }, rx)
    }

    /// Emitter for a single job
    pub fn emitter(&self, job_id: &str, session_id: &str) -> ProgressEmitter {
        ProgressEmitter {
            job_id: job_id.to_string(),
            session_id: session_id.to_string(),
            tx: self.tx.clone(),
            last_percent: 0,
            finished: false,
        }
    }
}

/// Per-job emitter enforcing ordering: percentages never go down and
/// nothing is sent after the terminal (100%) event
pub struct ProgressEmitter {
    job_id: String,
    session_id: String,
    tx: mpsc::UnboundedSender<ProgressEvent>,
    last_percent: u8,
    finished: bool,
}

impl ProgressEmitter {
    /// Send a milestone; returns false when the event was dropped
    pub fn emit(&mut self, percent: u8, message: &str) -> bool {
        self.send(percent, message, None)
    }

    /// Send the terminal event
    pub fn finish(&mut self, message: &str, download_url: Option<String>) -> bool {
        self.send(100, message, download_url)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }

    fn send(&mut self, percent: u8, message: &str, download_url: Option<String>) -> bool {
        if self.finished {
            debug!("Job {}: dropping progress after terminal event: {}", self.job_id, message);
            return false;
        }
        let percent = percent.min(100);
        if percent < self.last_percent {
            debug!("Job {}: dropping out-of-order progress {}% < {}%", self.job_id, percent, self.last_percent);
            return false;
        }

        self.last_percent = percent;
        self.finished = percent == 100;

        let event = ProgressEvent {
            job_id: self.job_id.clone(),
            session_id: self.session_id.clone(),
            percent,
            message: message.to_string(),
            download_url,
            timestamp: Utc::now(),
        };

        // Fire-and-forget: a closed transport just means nobody is listening
        if self.tx.send(event).is_err() {
            debug!("Job {}: progress transport closed", self.job_id);
        }
        true
    }
}

/// Forward events from the hub to a sink until every producer is gone
pub fn spawn_transport(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    sink: Arc<dyn ProgressSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = sink.send(&event.session_id, &event) {
                debug!("Progress for session {} not delivered: {:#}", event.session_id, e);
            }
        }
    })
}

/// Appends each session's events as JSON lines to `<dir>/<session>.jsonl`
pub struct JsonlProgressSink {
    dir: PathBuf,
}

impl JsonlProgressSink {
    pub fn new(dir: PathBuf) -> Self {
        JsonlProgressSink { dir }
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.jsonl", safe))
    }
}

impl ProgressSink for JsonlProgressSink {
    fn send(&self, session_id: &str, event: &ProgressEvent) -> Result<()> {
        match &event.download_url {
            Some(url) => info!("[{}] {}% {} ({})", session_id, event.percent, event.message, url),
            None => info!("[{}] {}% {}", session_id, event.percent, event.message),
        }

        let path = self.session_path(session_id);
        let mut line = serde_json::to_string(event).context("Failed to serialize progress event")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open progress stream: {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to write progress stream: {}", path.display()))?;
        Ok(())
    }
}
