//! Append-only JSON-lines capture store.

use std::io::{BufRead, Write};
use std::path::Path;

use super::sink::{CaptureSink, MemoryStore};
use super::{CapturedExchange, RecordId, Request, Response, TunnelPayload};
use crate::error::{Error, Result};

/// File-backed [`CaptureSink`]: one JSON object per line, plus an in-memory
/// index for reads.
///
/// Uses `std::fs::File` behind a `std::sync::Mutex`; callers on the async
/// side run `put` on a blocking task.
pub struct JsonlStore {
    writer: std::sync::Mutex<Appender>,
    index: MemoryStore,
}

/// Unbuffered line appender. Each record goes out in a single write, so a
/// failed `put` leaves nothing queued for the next one.
struct Appender {
    file: std::fs::File,
    /// A previous write failed part-way; start the next record on a fresh line.
    torn: bool,
}

impl Appender {
    fn append_line(&mut self, json: &str) -> std::io::Result<()> {
        let mut line = String::with_capacity(json.len() + 2);
        if self.torn {
            line.push('\n');
        }
        line.push_str(json);
        line.push('\n');

        match self.file.write_all(line.as_bytes()) {
            Ok(()) => {
                self.torn = false;
                Ok(())
            }
            Err(e) => {
                self.torn = true;
                Err(e)
            }
        }
    }
}

impl JsonlStore {
    /// Open (or create) the store, loading any records already in the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let records = if path.exists() {
            load_records(path)?
        } else {
            Vec::new()
        };

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                Error::persistence(format!("Failed to open '{}': {}", path.display(), e))
            })?;

        tracing::debug!(path = %path.display(), records = records.len(), "Capture store opened");

        Ok(Self {
            writer: std::sync::Mutex::new(Appender { file, torn: false }),
            index: MemoryStore::with_records(records),
        })
    }
}

fn load_records(path: &Path) -> Result<Vec<CapturedExchange>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::persistence(format!("Failed to read '{}': {}", path.display(), e)))?;

    let mut records = Vec::new();
    for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CapturedExchange>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping unreadable capture record"
                );
            }
        }
    }
    Ok(records)
}

impl CaptureSink for JsonlStore {
    fn put(
        &self,
        request: Request,
        response: Response,
        tunnel: Option<TunnelPayload>,
    ) -> Result<RecordId> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| Error::persistence(format!("capture file lock poisoned: {}", e)))?;

        // Allocated under the writer lock so the file stays in id order.
        let exchange = self.index.allocate(request, response, tunnel);
        let json = serde_json::to_string(&exchange)
            .map_err(|e| Error::persistence(format!("Failed to serialize record: {}", e)))?;

        writer
            .append_line(&json)
            .map_err(|e| Error::persistence(format!("Failed to write record: {}", e)))?;

        self.index.insert(exchange)
    }

    fn get_all(&self) -> Result<Vec<CapturedExchange>> {
        self.index.get_all()
    }

    fn get_by_id(&self, id: RecordId) -> Result<CapturedExchange> {
        self.index.get_by_id(id)
    }
}
