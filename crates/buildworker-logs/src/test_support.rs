use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::part::LogPart;
use crate::transport::{LogPartTransport, TransportError, TransportErrorKind};

/// Transport keeping every published batch, optionally failing.
#[derive(Debug, Default)]
pub(crate) struct RecordingTransport {
    pub batches: Mutex<Vec<Vec<LogPart>>>,
    pub failing: AtomicBool,
}

impl RecordingTransport {
    pub fn parts(&self) -> Vec<LogPart> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogPartTransport for RecordingTransport {
    async fn publish(&self, parts: &[LogPart]) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportErrorKind::UnexpectedStatus { status: 500 }.into());
        }
        self.batches.lock().push(parts.to_vec());
        Ok(())
    }
}
