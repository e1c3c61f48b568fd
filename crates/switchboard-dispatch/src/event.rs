//! Code for exporting lifecycle events from the dispatcher.

use std::sync::Mutex;

use educe::Educe;
use futures::{Stream, StreamExt};
use postage::broadcast;
use postage::sink::Sink as _;
use tracing::trace;

use switchboard_bus::{ObjectPath, UniqueName};

use crate::err::ChannelError;

/// How many events we keep buffered for slow subscribers.
const EVENT_BUFFER: usize = 128;

/// Something that happened in the dispatcher.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DispatchEvent {
    /// A channel was admitted into the dispatcher.
    ChannelAdded {
        /// The channel's path.
        channel: ObjectPath,
    },
    /// A channel left the dispatcher (it aborted, or was rejected).
    ChannelRemoved {
        /// The channel's path.
        channel: ObjectPath,
    },
    /// A channel ended up owned by an endpoint.
    Dispatched {
        /// The channel's path.
        channel: ObjectPath,
        /// The unique name of the endpoint now handling it.
        handler: UniqueName,
    },
    /// A channel could not be dispatched.
    DispatchFailed {
        /// The channel's path.
        channel: ObjectPath,
        /// Why dispatch failed.
        error: ChannelError,
    },
}

/// A stream of [`DispatchEvent`]s.
///
/// Subscribers only see events emitted after they subscribed, and the
/// stream is lossy: a subscriber that falls more than a buffer's worth
/// behind misses the oldest events.
#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct DispatchEvents {
    /// The receiver that implements this stream.
    #[educe(Debug(ignore))]
    inner: broadcast::Receiver<DispatchEvent>,
}

impl Stream for DispatchEvents {
    type Item = DispatchEvent;
    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Sender side of the dispatcher's event stream.
pub(crate) struct DispatchEventSender {
    /// The broadcast sender, behind a lock because sending needs `&mut`.
    sender: Mutex<broadcast::Sender<DispatchEvent>>,
}

impl DispatchEventSender {
    /// Emit `event` to every current subscriber.
    ///
    /// Emission is best-effort; an unwatched or saturated stream drops
    /// events silently.
    pub(crate) fn emit(&self, event: DispatchEvent) {
        let mut sender = self.sender.lock().expect("lock poisoned");
        if let Err(e) = sender.try_send(event) {
            trace!("dropping dispatch event: {:?}", e);
        }
    }
}

/// Create a new dispatcher event stream, returning both halves.
pub(crate) fn channel() -> (DispatchEventSender, DispatchEvents) {
    let (sender, receiver) = broadcast::channel(EVENT_BUFFER);
    (
        DispatchEventSender {
            sender: Mutex::new(sender),
        },
        DispatchEvents { inner: receiver },
    )
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn events_reach_subscribers() {
        let (sender, events) = channel();
        let mut events = events;
        sender.emit(DispatchEvent::ChannelAdded {
            channel: ObjectPath::new("/chan/0").unwrap(),
        });
        sender.emit(DispatchEvent::ChannelRemoved {
            channel: ObjectPath::new("/chan/0").unwrap(),
        });
        block_on(async {
            assert!(matches!(
                events.next().await,
                Some(DispatchEvent::ChannelAdded { .. })
            ));
            assert!(matches!(
                events.next().await,
                Some(DispatchEvent::ChannelRemoved { .. })
            ));
        });
    }

    #[test]
    fn emission_without_subscribers_is_harmless() {
        let (sender, events) = channel();
        drop(events);
        sender.emit(DispatchEvent::ChannelAdded {
            channel: ObjectPath::new("/chan/1").unwrap(),
        });
    }
}
