use crate::error::ChannelError;
use crate::event::Emitter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ordered duplex transport of opaque byte messages.
pub trait Channel: Send + Sync {
    fn send(&self, bytes: Vec<u8>) -> Result<(), ChannelError>;
    fn on_message(&self) -> &Emitter<Vec<u8>>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// In-memory channel pair. A message sent on one side is delivered to the
/// other side's listeners before `send` returns.
pub struct LoopbackChannel {
    inbox: Arc<Emitter<Vec<u8>>>,
    peer: Arc<Emitter<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl LoopbackChannel {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let left = Arc::new(Emitter::new());
        let right = Arc::new(Emitter::new());
        let closed = Arc::new(AtomicBool::new(false));
        (
            Arc::new(Self {
                inbox: left.clone(),
                peer: right.clone(),
                closed: closed.clone(),
            }),
            Arc::new(Self {
                inbox: right,
                peer: left,
                closed,
            }),
        )
    }
}

impl Channel for LoopbackChannel {
    fn send(&self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.peer.fire(&bytes);
        Ok(())
    }

    fn on_message(&self) -> &Emitter<Vec<u8>> {
        &self.inbox
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
