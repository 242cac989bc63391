//! Transport that calls a session handler in the same process.

use crate::SessionHandler;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uba_ipc::{IpcError, Transport};

/// Delivers requests straight to a shared [`SessionHandler`] and counts
/// every round trip.
#[derive(Clone)]
pub struct InProcessTransport {
    handler: Arc<Mutex<SessionHandler>>,
    calls: Arc<AtomicU64>,
}

impl InProcessTransport {
    pub fn new(handler: Arc<Mutex<SessionHandler>>) -> Self {
        Self {
            handler,
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn handler(&self) -> &Arc<Mutex<SessionHandler>> {
        &self.handler
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for InProcessTransport {
    fn call(&mut self, request: &[u8]) -> Result<Vec<u8>, IpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut handler = self
            .handler
            .lock()
            .map_err(|_| IpcError::Unavailable("session handler lock poisoned".into()))?;
        handler
            .handle_bytes(request)
            .map_err(|e| IpcError::Unavailable(e.to_string()))
    }
}
