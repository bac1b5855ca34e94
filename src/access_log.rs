//! Structured request log
//! One JSON object per line, written to stdout or appended to a file

use hyper::http::request::Parts;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
}

impl LogEntry {
    /// Snapshot of a request head; `body` is only meaningful for body-bearing methods
    pub fn from_parts(parts: &Parts, body: Option<&[u8]>) -> Self {
        let mut headers = BTreeMap::new();
        for (name, value) in parts.headers.iter() {
            // Keep the first value per name
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            method: parts.method.to_string(),
            url: parts.uri.to_string(),
            headers,
            body: body
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default(),
        }
    }
}

/// Destination for request log entries
pub struct AccessLog {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl AccessLog {
    pub fn stdout() -> Self {
        Self::from_writer(io::stdout())
    }

    /// Append to the file at `path`, creating it if needed
    pub fn file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(file))
    }

    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn record(&self, entry: &LogEntry) {
        let mut line = match serde_json::to_vec(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode request log entry: {}", e);
                return;
            }
        };
        line.push(b'\n');

        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_all(&line).and_then(|_| writer.flush()) {
            warn!("Failed to write request log entry: {}", e);
        }
    }
}
