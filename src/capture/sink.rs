//! The persistence contract consumed by the relays and the replay operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{now_rfc3339, CapturedExchange, RecordId, Request, Response, TunnelPayload};
use crate::error::{Error, Result};

/// Insert-only store of captured exchanges.
///
/// Implementations are shared by every connection handler, so they must be
/// safe to call concurrently. Each insert is independent of every other.
pub trait CaptureSink: Send + Sync {
    /// Persist a new exchange. The store assigns the id and `created_at`.
    fn put(
        &self,
        request: Request,
        response: Response,
        tunnel: Option<TunnelPayload>,
    ) -> Result<RecordId>;

    /// All stored exchanges in insertion order.
    fn get_all(&self) -> Result<Vec<CapturedExchange>>;

    /// A single exchange, or [`Error::NotFound`].
    fn get_by_id(&self, id: RecordId) -> Result<CapturedExchange>;
}

/// In-memory [`CaptureSink`].
#[derive(Debug)]
pub struct MemoryStore {
    records: RwLock<Vec<CapturedExchange>>,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Seed a store with existing records; new ids continue after the highest one.
    pub(crate) fn with_records(records: Vec<CapturedExchange>) -> Self {
        let next = records.iter().map(|r| r.id.0).max().unwrap_or(0) + 1;
        Self {
            records: RwLock::new(records),
            next_id: AtomicU64::new(next),
        }
    }

    pub(crate) fn allocate(
        &self,
        request: Request,
        response: Response,
        tunnel: Option<TunnelPayload>,
    ) -> CapturedExchange {
        CapturedExchange {
            id: RecordId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            request,
            response,
            created_at: now_rfc3339(),
            tunnel,
        }
    }

    pub(crate) fn insert(&self, exchange: CapturedExchange) -> Result<RecordId> {
        let id = exchange.id;
        let mut records = self
            .records
            .write()
            .map_err(|e| Error::persistence(format!("capture store lock poisoned: {}", e)))?;
        records.push(exchange);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CaptureSink for MemoryStore {
    fn put(
        &self,
        request: Request,
        response: Response,
        tunnel: Option<TunnelPayload>,
    ) -> Result<RecordId> {
        let exchange = self.allocate(request, response, tunnel);
        self.insert(exchange)
    }

    fn get_all(&self) -> Result<Vec<CapturedExchange>> {
        let records = self
            .records
            .read()
            .map_err(|e| Error::persistence(format!("capture store lock poisoned: {}", e)))?;
        let mut all = records.clone();
        all.sort_by_key(|r| r.id);
        Ok(all)
    }

    fn get_by_id(&self, id: RecordId) -> Result<CapturedExchange> {
        let records = self
            .records
            .read()
            .map_err(|e| Error::persistence(format!("capture store lock poisoned: {}", e)))?;
        records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found(id))
    }
}
