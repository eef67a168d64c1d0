//! In-order delivery of decided values to the application.
//!
//! Success messages arrive in any order. [`OrderedDelivery`] buffers them by
//! sequence number and hands the application each real value exactly once,
//! strictly in sequence order. No-ops advance the cursor without being
//! delivered.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::types::{SeqNo, Value};

/// Receiver of decided application values.
pub trait Application: Send {
    /// Called exactly once per decided application value, in sequence order.
    fn receive(&mut self, seq_no: SeqNo, payload: Vec<u8>);
}

impl<F> Application for F
where
    F: FnMut(SeqNo, Vec<u8>) + Send,
{
    fn receive(&mut self, seq_no: SeqNo, payload: Vec<u8>) {
        self(seq_no, payload)
    }
}

impl Application for mpsc::UnboundedSender<(SeqNo, Vec<u8>)> {
    fn receive(&mut self, seq_no: SeqNo, payload: Vec<u8>) {
        if self.send((seq_no, payload)).is_err() {
            debug!(seq_no = %seq_no, "application receiver dropped");
        }
    }
}

/// Reordering buffer between Success messages and the application.
#[derive(Debug)]
pub struct OrderedDelivery {
    next: SeqNo,
    pending: BTreeMap<SeqNo, Value>,
}

impl Default for OrderedDelivery {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedDelivery {
    /// A buffer expecting [`SeqNo::FIRST`].
    pub fn new() -> Self {
        Self {
            next: SeqNo::FIRST,
            pending: BTreeMap::new(),
        }
    }

    /// Offer a decided value, then deliver every contiguous value now ready.
    ///
    /// Returns the number of application values delivered. Values for
    /// sequence numbers already delivered or already buffered are dropped.
    pub fn offer(&mut self, seq_no: SeqNo, value: Value, app: &mut dyn Application) -> usize {
        if seq_no < self.next {
            trace!(seq_no = %seq_no, "already delivered");
            return 0;
        }
        self.pending.entry(seq_no).or_insert(value);

        let mut delivered = 0;
        while let Some(value) = self.pending.remove(&self.next) {
            let seq_no = self.next;
            self.next = seq_no.next();
            match value {
                Value::NoOp => trace!(seq_no = %seq_no, "skipping no-op"),
                Value::App(payload) => {
                    debug!(seq_no = %seq_no, len = payload.len(), "delivering");
                    app.receive(seq_no, payload);
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Next sequence number the application is waiting for.
    pub fn next_expected(&self) -> SeqNo {
        self.next
    }

    /// Number of values buffered behind a gap.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
