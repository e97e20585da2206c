//! Outbound buffer with watermark-driven backpressure.

use tokio::sync::watch;
use tracing::debug;

/// Pending bytes above which writers are asked to pause.
pub const HIGH_WATERMARK: usize = 64 * 1_024;

/// Pending bytes at or below which a paused writer may resume.
pub const LOW_WATERMARK: usize = 16 * 1_024;

/// FIFO of bytes accepted by `Transport::write` but not yet handed to the
/// socket (or to the TLS engine). Bytes leave strictly in the order they were
/// pushed, whether or not a pause is in effect.
#[derive(Debug)]
pub struct WriteBuffer {
    pending: Vec<u8>,
    high: usize,
    low: usize,
    paused: watch::Sender<bool>,
}

impl WriteBuffer {
    pub fn new(high: usize, low: usize) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            pending: Vec::new(),
            high,
            low: low.min(high),
            paused,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        if !self.is_paused() && self.pending.len() > self.high {
            debug!(pending = self.pending.len(), high = self.high, "Write buffer above high watermark, pausing writer");
            self.paused.send_replace(true);
        }
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Drop the first `n` bytes after they were written out.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.pending.len());
        self.pending.drain(..n);
        if self.is_paused() && self.pending.len() <= self.low {
            debug!(pending = self.pending.len(), low = self.low, "Write buffer below low watermark, resuming writer");
            self.paused.send_replace(false);
        }
    }

    pub fn clear(&mut self) {
        let len = self.pending.len();
        self.consume(len);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// `true` while the writer should hold off.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new(HIGH_WATERMARK, LOW_WATERMARK)
    }
}
