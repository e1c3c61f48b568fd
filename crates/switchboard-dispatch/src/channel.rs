//! Passive record of one communication channel under dispatch.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;

use educe::Educe;
use futures::{Stream, StreamExt};
use postage::watch;
use tracing::debug;

use switchboard_bus::{ObjectPath, PropertyMap, Value};

use crate::err::ChannelError;

/// Property key under which a channel's type tag is published.
pub const PROP_CHANNEL_TYPE: &str = "org.switchboard.Channel.Type";

/// Property key telling clients whether the channel was requested locally.
pub const PROP_REQUESTED: &str = "org.switchboard.Channel.Requested";

/// The type tag of a channel, like `org.switchboard.Channel.Type.Text`.
///
/// Filter chains are grouped by this tag; it is not interpreted further by
/// the dispatcher.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelType(String);

impl ChannelType {
    /// Wrap `tag` as a channel type.
    pub fn new(tag: impl Into<String>) -> Self {
        ChannelType(tag.into())
    }

    /// Return this type as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelType {
    fn from(tag: &str) -> Self {
        ChannelType::new(tag)
    }
}

/// Which way a channel was opened.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, derive_more::Display)]
#[non_exhaustive]
pub enum Direction {
    /// The channel arrived from the network.
    #[display("incoming")]
    Incoming,
    /// The channel was opened from this side.
    #[display("outgoing")]
    Outgoing,
}

/// Where a channel stands in the dispatch process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, derive_more::Display)]
#[non_exhaustive]
pub enum ChannelStatus {
    /// Not yet seen by the dispatcher.
    #[default]
    #[display("undispatched")]
    Undispatched,
    /// Owned by a dispatch operation; observers and approvers may be
    /// running.
    #[display("dispatching")]
    Dispatching,
    /// `HandleChannels` has been issued but has not yet returned.
    #[display("handler-invoked")]
    HandlerInvoked,
    /// A handler (or claimer) has taken responsibility.
    #[display("dispatched")]
    Dispatched,
    /// The underlying channel has closed.  Terminal.
    #[display("aborted")]
    Aborted,
}

/// The `(path, properties)` pair describing one channel to a client.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct ChannelDetails {
    /// The channel's object path.
    pub path: ObjectPath,
    /// The channel's immutable properties.
    pub properties: PropertyMap,
}

/// One active communication session surfaced by a connection manager.
///
/// A `Channel` is a passive record: the dispatcher and its dispatch
/// operations mutate nothing here except the dispatch status, and the
/// connection glue calls [`Channel::abort`] when the underlying session
/// closes.  Everything else is fixed at construction.
///
/// Construct one with [`Channel::builder`].
pub struct Channel {
    /// The channel's bus path.  Stable until abort.
    object_path: ObjectPath,
    /// The channel's type tag.
    channel_type: ChannelType,
    /// Whether the channel is incoming or outgoing.
    direction: Direction,
    /// The immutable properties clients filter against.
    properties: PropertyMap,
    /// Path of the connection this channel belongs to, if known.
    connection: Option<ObjectPath>,
    /// Path of the account this channel belongs to, if known.
    account: Option<ObjectPath>,
    /// Mutable state, behind a lock that is never held across an await.
    inner: Mutex<Inner>,
}

/// Mutable portion of a [`Channel`].
struct Inner {
    /// Where the channel stands in the dispatch process.
    status: ChannelStatus,
    /// The error recorded at abort time, if any.  First error wins.
    error: Option<ChannelError>,
    /// Paths of user-visible channel requests this channel fulfils.
    satisfied_requests: BTreeSet<ObjectPath>,
    /// Sender half of the status stream.
    status_tx: watch::Sender<ChannelStatus>,
    /// Receiver kept only so that new subscribers can be cloned off it.
    status_rx: watch::Receiver<ChannelStatus>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("object_path", &self.object_path)
            .field("channel_type", &self.channel_type)
            .field("direction", &self.direction)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Return a builder for constructing a channel.
    pub fn builder(
        object_path: ObjectPath,
        channel_type: ChannelType,
        direction: Direction,
    ) -> ChannelBuilder {
        ChannelBuilder {
            object_path,
            channel_type,
            direction,
            properties: PropertyMap::new(),
            connection: None,
            account: None,
            satisfied_requests: BTreeSet::new(),
        }
    }

    /// Return this channel's object path.
    pub fn object_path(&self) -> &ObjectPath {
        &self.object_path
    }

    /// Return this channel's type tag.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Return whether this channel is incoming or outgoing.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Return this channel's immutable properties.
    pub fn immutable_properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// Return the path of the connection this channel belongs to, if known.
    pub fn connection(&self) -> Option<&ObjectPath> {
        self.connection.as_ref()
    }

    /// Return the path of the account this channel belongs to, if known.
    pub fn account(&self) -> Option<&ObjectPath> {
        self.account.as_ref()
    }

    /// Return this channel's current dispatch status.
    pub fn status(&self) -> ChannelStatus {
        self.inner.lock().expect("lock poisoned").status
    }

    /// Return the error recorded when this channel aborted, if any.
    pub fn error(&self) -> Option<ChannelError> {
        self.inner.lock().expect("lock poisoned").error.clone()
    }

    /// Return the channel-request paths this channel fulfils.
    pub fn satisfied_requests(&self) -> Vec<ObjectPath> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .satisfied_requests
            .iter()
            .cloned()
            .collect()
    }

    /// Note that this channel fulfils the channel request at `path`.
    pub fn add_satisfied_request(&self, path: ObjectPath) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .satisfied_requests
            .insert(path);
    }

    /// Return a stream of status changes for this channel.
    ///
    /// The stream yields the current status immediately, and is lossy: a
    /// slow reader sees the most recent status, not every intermediate one.
    pub fn status_events(&self) -> ChannelStatusEvents {
        ChannelStatusEvents {
            inner: self.inner.lock().expect("lock poisoned").status_rx.clone(),
        }
    }

    /// Return the `(path, properties)` pair describing this channel.
    pub fn details(&self) -> ChannelDetails {
        ChannelDetails {
            path: self.object_path.clone(),
            properties: self.properties.clone(),
        }
    }

    /// Move this channel to `status`.
    ///
    /// Transitions away from `Aborted` are ignored: abort is terminal.
    pub(crate) fn set_status(&self, status: ChannelStatus) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.status == ChannelStatus::Aborted || inner.status == status {
            return;
        }
        debug!(
            "channel {}: {} -> {}",
            self.object_path, inner.status, status
        );
        inner.status = status;
        *inner.status_tx.borrow_mut() = status;
    }

    /// Record that the underlying channel has closed.
    ///
    /// The first recorded error wins; aborting an already-aborted channel
    /// does nothing.  Every subscriber of [`Channel::status_events`] is
    /// notified.
    pub fn abort(&self, error: ChannelError) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.status == ChannelStatus::Aborted {
            return;
        }
        debug!("channel {} aborted: {}", self.object_path, error);
        inner.error.get_or_insert(error);
        inner.status = ChannelStatus::Aborted;
        *inner.status_tx.borrow_mut() = ChannelStatus::Aborted;
    }
}

/// Builder for a [`Channel`].
#[derive(Debug)]
#[must_use]
pub struct ChannelBuilder {
    /// See [`Channel::object_path`].
    object_path: ObjectPath,
    /// See [`Channel::channel_type`].
    channel_type: ChannelType,
    /// See [`Channel::direction`].
    direction: Direction,
    /// See [`Channel::immutable_properties`].
    properties: PropertyMap,
    /// See [`Channel::connection`].
    connection: Option<ObjectPath>,
    /// See [`Channel::account`].
    account: Option<ObjectPath>,
    /// See [`Channel::satisfied_requests`].
    satisfied_requests: BTreeSet<ObjectPath>,
}

impl ChannelBuilder {
    /// Replace the whole immutable property map.
    pub fn properties(mut self, properties: PropertyMap) -> Self {
        self.properties = properties;
        self
    }

    /// Add one immutable property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the owning connection's path.
    pub fn connection(mut self, path: ObjectPath) -> Self {
        self.connection = Some(path);
        self
    }

    /// Set the owning account's path.
    pub fn account(mut self, path: ObjectPath) -> Self {
        self.account = Some(path);
        self
    }

    /// Note a channel request that this channel fulfils.
    pub fn satisfied_request(mut self, path: ObjectPath) -> Self {
        self.satisfied_requests.insert(path);
        self
    }

    /// Construct the channel.
    ///
    /// The standard `Type` and `Requested` properties are filled in from
    /// the builder's type and direction unless explicitly overridden.
    pub fn build(mut self) -> Channel {
        self.properties
            .entry(PROP_CHANNEL_TYPE.to_owned())
            .or_insert_with(|| Value::from(self.channel_type.as_str()));
        self.properties
            .entry(PROP_REQUESTED.to_owned())
            .or_insert_with(|| Value::from(self.direction == Direction::Outgoing));
        let (status_tx, status_rx) = watch::channel();
        Channel {
            object_path: self.object_path,
            channel_type: self.channel_type,
            direction: self.direction,
            properties: self.properties,
            connection: self.connection,
            account: self.account,
            inner: Mutex::new(Inner {
                status: ChannelStatus::Undispatched,
                error: None,
                satisfied_requests: self.satisfied_requests,
                status_tx,
                status_rx,
            }),
        }
    }
}

/// A stream of [`ChannelStatus`] values for one channel.
///
/// Yields the current status immediately on subscription, then each
/// subsequent change.  Lossy under a slow reader.
#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct ChannelStatusEvents {
    /// The receiver that implements this stream.
    #[educe(Debug(ignore))]
    inner: watch::Receiver<ChannelStatus>,
}

impl Stream for ChannelStatusEvents {
    type Item = ChannelStatus;
    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
