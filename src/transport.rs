use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{EventBus, Result, SipMessage, Subscription};

/// Signaling client consumed by call sessions.
///
/// One client is shared by every session of a softphone. It owns the
/// WebSocket connection and registration, correlates requests with their
/// replies, and publishes every inbound [`SipMessage`] on [`messages`].
///
/// [`messages`]: LocalSignalingClient::messages
#[trait_variant::make(SignalingClient: Send)]
pub trait LocalSignalingClient {
    /// Connect and register; fails when either cannot be completed.
    async fn start(&self) -> Result<()>;

    /// Send a request and resolve with its first correlated final reply.
    async fn request(&self, message: SipMessage) -> Result<SipMessage>;

    /// Send a request that expects no reply (ACK, fire-and-forget INFO).
    async fn send(&self, message: SipMessage) -> Result<()>;

    /// Send a response; nothing further is correlated.
    async fn reply(&self, message: SipMessage) -> Result<()>;

    async fn dispose(&self) -> Result<()>;

    /// Inbound message channel; emits `SipMessage` in arrival order.
    fn messages(&self) -> &Arc<EventBus>;
}

/// Inbound messages accepted by a filter, delivered in arrival order.
///
/// Messages the filter rejects stay on the bus for other handlers. Dropping
/// the stream releases the underlying handler.
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<SipMessage>,
    subscription: Option<Subscription>,
}

impl MessageStream {
    pub fn new<F>(bus: &Arc<EventBus>, filter: F) -> Self
    where
        F: Fn(&SipMessage) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = bus.subscribe::<SipMessage, _>(move |message| {
            if filter(message) {
                let _ = tx.send(message.clone());
            }
        });

        MessageStream {
            rx,
            subscription: Some(subscription),
        }
    }

    pub async fn next(&mut self) -> Option<SipMessage> {
        if self.subscription.is_none() {
            return None;
        }
        self.rx.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.is_none()
    }

    /// Unregister now; messages already queued are discarded.
    pub fn close(&mut self) {
        self.subscription.take();
        self.rx.close();
    }
}
