//! Unreliable datagram transport abstraction.
//!
//! The protocol assumes nothing from the network beyond "bytes in equal
//! bytes out if delivered at all". Datagrams may be lost, duplicated or
//! reordered; quorum-round resends and client retries absorb all of it.
//!
//! [`Transport`] is the raw byte seam, implemented by
//! [`UdpTransport`](crate::udp::UdpTransport), by the fragmenting wrapper and
//! by the simulation network. [`Messenger`] sits on top and speaks
//! [`Message`]s.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::codec::{JsonCodec, MessageCodec};
use crate::membership::Member;
use crate::message::Message;
use crate::types::PaxcastError;

/// Errors from a single datagram send.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying socket failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

/// Fire-and-forget datagram sender.
///
/// Implementations must not block: a send that cannot complete immediately
/// is a lost datagram.
pub trait Transport: Send + Sync {
    /// Send one datagram to `to`.
    fn send_to(&self, to: Member, bytes: &[u8]) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send_to(&self, to: Member, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send_to(to, bytes)
    }
}

/// Encodes protocol messages and hands them to the transport.
///
/// A failed send is logged and otherwise treated as message loss.
#[derive(Clone)]
pub struct Messenger {
    transport: Arc<dyn Transport>,
    codec: JsonCodec,
}

impl Messenger {
    /// Wrap a transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            codec: JsonCodec,
        }
    }

    /// Send `msg` to a single member.
    pub fn send(&self, to: Member, msg: &Message) {
        match self.codec.encode(msg) {
            Ok(bytes) => self.send_bytes(to, msg, &bytes),
            Err(e) => warn!(kind = msg.kind(), error = %e, "failed to encode message"),
        }
    }

    /// Send `msg` to every member of `to`, encoding it once.
    pub fn send_all<'a>(&self, to: impl IntoIterator<Item = &'a Member>, msg: &Message) {
        let bytes = match self.codec.encode(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "failed to encode message");
                return;
            }
        };
        for member in to {
            self.send_bytes(*member, msg, &bytes);
        }
    }

    /// Decode an inbound payload.
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, PaxcastError> {
        Ok(self.codec.decode(bytes)?)
    }

    fn send_bytes(&self, to: Member, msg: &Message, bytes: &[u8]) {
        trace!(to = %to, kind = msg.kind(), len = bytes.len(), "send");
        if let Err(e) = self.transport.send_to(to, bytes) {
            warn!(to = %to, kind = msg.kind(), error = %e, "send failed, treating as lost");
        }
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording transport used by unit tests across the crate.

    use std::sync::Mutex;

    use super::*;

    /// Captures every datagram as a decoded `(destination, Message)` pair.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        sent: Mutex<Vec<(Member, Vec<u8>)>>,
    }

    impl RecordingTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Drain everything sent so far.
        pub(crate) fn take(&self) -> Vec<(Member, Message)> {
            let raw = std::mem::take(&mut *self.sent.lock().expect("lock"));
            raw.into_iter()
                .map(|(to, bytes)| {
                    let msg = JsonCodec.decode(&bytes).expect("recorded message decodes");
                    (to, msg)
                })
                .collect()
        }

        /// Drain raw payloads.
        pub(crate) fn take_raw(&self) -> Vec<(Member, Vec<u8>)> {
            std::mem::take(&mut *self.sent.lock().expect("lock"))
        }
    }

    impl Transport for RecordingTransport {
        fn send_to(&self, to: Member, bytes: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().expect("lock").push((to, bytes.to_vec()));
            Ok(())
        }
    }

    /// A transport whose every send fails.
    pub(crate) struct BrokenTransport;

    impl Transport for BrokenTransport {
        fn send_to(&self, _to: Member, _bytes: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }
    }
}
