//! Operations on stored exchanges, keyed by record id.
//!
//! These are the calls an API layer makes: list, get, repeat, scan. None of
//! them modify the store.

use crate::capture::{CaptureSink, CapturedExchange, RecordId};
use crate::error::Result;
use crate::replay::{Replayer, ScanReport, Scanner};

/// Every stored exchange, oldest first.
pub fn list(sink: &dyn CaptureSink) -> Result<Vec<CapturedExchange>> {
    sink.get_all()
}

/// One stored exchange.
pub fn get(sink: &dyn CaptureSink, id: RecordId) -> Result<CapturedExchange> {
    sink.get_by_id(id)
}

/// Re-issue a stored request and return the (truncated) response body.
pub async fn repeat(sink: &dyn CaptureSink, replayer: &Replayer, id: RecordId) -> Result<String> {
    let exchange = sink.get_by_id(id)?;
    replayer.replay(&exchange.request).await
}

/// Scan a stored request for command injection.
pub async fn scan(sink: &dyn CaptureSink, scanner: &Scanner, id: RecordId) -> Result<ScanReport> {
    let exchange = sink.get_by_id(id)?;
    Ok(scanner.scan(&exchange.request).await)
}
