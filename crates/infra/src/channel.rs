//! In-process [`BackgroundChannel`] for engines living in the same process

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tidemark_core::ports::{BackgroundChannel, BackgroundMessage, ChannelError};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 64;

/// One end of a connected pair; what one end sends the other receives
#[derive(Debug, Clone)]
pub struct InProcessChannel {
    outgoing: broadcast::Sender<BackgroundMessage>,
    incoming: broadcast::Sender<BackgroundMessage>,
    open: Arc<AtomicBool>,
}

impl InProcessChannel {
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_CAPACITY)
    }

    /// Receivers that fall more than `capacity` messages behind skip ahead
    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (a_to_b, _) = broadcast::channel(capacity.max(1));
        let (b_to_a, _) = broadcast::channel(capacity.max(1));
        let open = Arc::new(AtomicBool::new(true));
        let a = Self { outgoing: a_to_b.clone(), incoming: b_to_a.clone(), open: Arc::clone(&open) };
        let b = Self { outgoing: b_to_a, incoming: a_to_b, open };
        (a, b)
    }

    /// Close both ends; later sends fail and neither end reports available
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[async_trait]
impl BackgroundChannel for InProcessChannel {
    fn is_available(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, message: BackgroundMessage) -> Result<(), ChannelError> {
        if !self.is_available() {
            return Err(ChannelError::Closed);
        }
        match self.outgoing.send(message) {
            Ok(receivers) => {
                trace!(receivers, "background message sent");
                Ok(())
            }
            // Nobody on the other end is listening
            Err(_) => Err(ChannelError::Unavailable),
        }
    }

    fn incoming(&self) -> Option<broadcast::Receiver<BackgroundMessage>> {
        self.is_available().then(|| self.incoming.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ends_see_only_the_other_side() {
        let (a, b) = InProcessChannel::pair();
        let mut a_rx = a.incoming().unwrap();
        let mut b_rx = b.incoming().unwrap();

        a.send(BackgroundMessage::SyncRequested).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), BackgroundMessage::SyncRequested);
        assert!(a_rx.try_recv().is_err());

        let queued = BackgroundMessage::OperationQueued { operation_id: "op-1".into() };
        b.send(queued.clone()).await.unwrap();
        assert_eq!(a_rx.recv().await.unwrap(), queued);
    }

    #[tokio::test]
    async fn send_without_listener_is_unavailable() {
        let (a, _b) = InProcessChannel::pair();
        assert_eq!(a.send(BackgroundMessage::SyncRequested).await, Err(ChannelError::Unavailable));
    }

    #[tokio::test]
    async fn close_shuts_both_ends() {
        let (a, b) = InProcessChannel::pair();
        let _rx = b.incoming().unwrap();
        b.close();
        assert!(!a.is_available());
        assert!(a.incoming().is_none());
        assert_eq!(a.send(BackgroundMessage::SyncRequested).await, Err(ChannelError::Closed));
    }
}
