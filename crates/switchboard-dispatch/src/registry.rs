//! Registry of the client endpoints known to the dispatcher.
//!
//! Clients advertise up to three capabilities — observer, approver,
//! handler — together with a filter list per capability saying which
//! channels interest them.  The registry is shared, read-mostly state: the
//! dispatch operations look clients up by well-known name and iterate over
//! snapshots, never holding the registry lock across an out-call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use educe::Educe;
use postage::watch;
use thiserror::Error;
use tracing::debug;

use switchboard_bus::{ObjectPath, PropertyMap, UniqueName, WellKnownName};

use crate::channel::ChannelDetails;

/// An error reported by a client in response to an out-call.
///
/// The dispatcher mostly logs these: observer and approver failures never
/// veto dispatch, and handler failures just move selection along.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CallError {
    /// The client returned an error.
    #[error("client call failed: {0}")]
    Failed(String),
    /// The client disappeared from the bus before replying.
    #[error("client is gone")]
    Gone,
}

/// The capability flags a client endpoint may advertise.
///
/// These are independent flags, not subtypes: one endpoint may be all
/// three at once.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct ClientRoles {
    /// The endpoint wants to observe channels, passively.
    pub observer: bool,
    /// The endpoint wants to approve (or steer) unrequested channels.
    pub approver: bool,
    /// The endpoint can take ownership of channels.
    pub handler: bool,
}

/// One channel filter: a set of property constraints.
///
/// A filter matches a channel when every entry equals the corresponding
/// immutable property (with integer coercion; see
/// [`Value::matches`](switchboard_bus::Value::matches)).  An *empty*
/// filter matches every channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(PropertyMap);

impl Filter {
    /// Wrap a property-constraint map as a filter.
    pub fn new(constraints: PropertyMap) -> Self {
        Filter(constraints)
    }

    /// Return true if `properties` satisfies every constraint.
    pub fn matches(&self, properties: &PropertyMap) -> bool {
        self.0
            .iter()
            .all(|(key, want)| properties.get(key).is_some_and(|got| want.matches(got)))
    }
}

impl From<PropertyMap> for Filter {
    fn from(constraints: PropertyMap) -> Self {
        Filter::new(constraints)
    }
}

/// Return true if any filter in `filters` matches `properties`.
///
/// An empty filter *list* matches nothing: a client with no filters for a
/// capability is not interested in any channel through that capability.
pub(crate) fn any_filter_matches(filters: &[Filter], properties: &PropertyMap) -> bool {
    filters.iter().any(|f| f.matches(properties))
}

/// The out-calls the dispatcher makes to one client endpoint.
///
/// Implementations wrap a bus proxy; the dispatcher core never sees the
/// wire.  Each call should resolve when the client replies — the core
/// imposes no timeout of its own, so implementations that want one must
/// wrap it here.
#[async_trait]
pub trait ClientProxy: Send + Sync {
    /// Tell an observer about channels being dispatched.
    ///
    /// `dispatch_operation` is the operation's path, or the root path when
    /// no approval phase will follow.
    async fn observe_channels(
        &self,
        account: ObjectPath,
        connection: ObjectPath,
        channels: Vec<ChannelDetails>,
        dispatch_operation: ObjectPath,
        satisfied_requests: Vec<ObjectPath>,
        info: PropertyMap,
    ) -> Result<(), CallError>;

    /// Ask an approver to weigh in on a dispatch operation.
    async fn add_dispatch_operation(
        &self,
        channels: Vec<ChannelDetails>,
        dispatch_operation: ObjectPath,
        properties: PropertyMap,
    ) -> Result<(), CallError>;

    /// Hand channels to a handler.
    async fn handle_channels(
        &self,
        account: ObjectPath,
        channels: Vec<ChannelDetails>,
        handle_with_time: i64,
        info: PropertyMap,
    ) -> Result<(), CallError>;
}

/// One registered client endpoint.
///
/// Construct with [`ClientHandle::builder`].
#[derive(Educe)]
#[educe(Debug)]
pub struct ClientHandle {
    /// The client's well-known bus name.
    well_known_name: WellKnownName,
    /// The client's current unique name, if it is running.
    ///
    /// Activatable clients may be registered before they are running, in
    /// which case this stays unset until the bus reports an owner.
    unique_name: Mutex<Option<UniqueName>>,
    /// The capabilities this client advertises.
    roles: ClientRoles,
    /// Channels this client wants to observe.
    observer_filters: Vec<Filter>,
    /// Channels this client wants to approve.
    approver_filters: Vec<Filter>,
    /// Channels this client can handle.
    handler_filters: Vec<Filter>,
    /// True if dispatch may skip approval when this handler is the best
    /// candidate.
    bypass_approval: bool,
    /// The proxy used for out-calls to this client.
    #[educe(Debug(ignore))]
    proxy: Arc<dyn ClientProxy>,
}

impl ClientHandle {
    /// Return a builder for a client handle.
    pub fn builder(well_known_name: WellKnownName, proxy: Arc<dyn ClientProxy>) -> ClientBuilder {
        ClientBuilder {
            well_known_name,
            unique_name: None,
            roles: ClientRoles::default(),
            observer_filters: Vec::new(),
            approver_filters: Vec::new(),
            handler_filters: Vec::new(),
            bypass_approval: false,
            proxy,
        }
    }

    /// Return this client's well-known name.
    pub fn name(&self) -> &WellKnownName {
        &self.well_known_name
    }

    /// Return this client's current unique name, if it is running.
    pub fn unique_name(&self) -> Option<UniqueName> {
        self.unique_name.lock().expect("lock poisoned").clone()
    }

    /// Record that the bus has assigned this client a unique name.
    pub fn set_unique_name(&self, unique: UniqueName) {
        *self.unique_name.lock().expect("lock poisoned") = Some(unique);
    }

    /// Return the capabilities this client advertises.
    pub fn roles(&self) -> ClientRoles {
        self.roles
    }

    /// Return true if this handler asks dispatch to skip approval.
    pub fn bypass_approval(&self) -> bool {
        self.bypass_approval
    }

    /// Return the proxy used for out-calls to this client.
    pub fn proxy(&self) -> Arc<dyn ClientProxy> {
        Arc::clone(&self.proxy)
    }

    /// Return true if this client wants to observe a channel with
    /// `properties`.
    pub fn observer_matches(&self, properties: &PropertyMap) -> bool {
        self.roles.observer && any_filter_matches(&self.observer_filters, properties)
    }

    /// Return true if this client wants to approve a channel with
    /// `properties`.
    pub fn approver_matches(&self, properties: &PropertyMap) -> bool {
        self.roles.approver && any_filter_matches(&self.approver_filters, properties)
    }

    /// Return true if this client can handle a channel with `properties`.
    pub fn handler_matches(&self, properties: &PropertyMap) -> bool {
        self.roles.handler && any_filter_matches(&self.handler_filters, properties)
    }
}

/// Builder for a [`ClientHandle`].
#[derive(Educe)]
#[educe(Debug)]
#[must_use]
pub struct ClientBuilder {
    /// See [`ClientHandle::name`].
    well_known_name: WellKnownName,
    /// See [`ClientHandle::unique_name`].
    unique_name: Option<UniqueName>,
    /// See [`ClientHandle::roles`].
    roles: ClientRoles,
    /// See [`ClientHandle::observer_matches`].
    observer_filters: Vec<Filter>,
    /// See [`ClientHandle::approver_matches`].
    approver_filters: Vec<Filter>,
    /// See [`ClientHandle::handler_matches`].
    handler_filters: Vec<Filter>,
    /// See [`ClientHandle::bypass_approval`].
    bypass_approval: bool,
    /// See [`ClientHandle::proxy`].
    #[educe(Debug(ignore))]
    proxy: Arc<dyn ClientProxy>,
}

impl ClientBuilder {
    /// Advertise the observer capability with `filters`.
    pub fn observer(mut self, filters: Vec<Filter>) -> Self {
        self.roles.observer = true;
        self.observer_filters = filters;
        self
    }

    /// Advertise the approver capability with `filters`.
    pub fn approver(mut self, filters: Vec<Filter>) -> Self {
        self.roles.approver = true;
        self.approver_filters = filters;
        self
    }

    /// Advertise the handler capability with `filters`.
    pub fn handler(mut self, filters: Vec<Filter>) -> Self {
        self.roles.handler = true;
        self.handler_filters = filters;
        self
    }

    /// Ask dispatch to skip approval when this handler is the best
    /// candidate.
    pub fn bypass_approval(mut self, bypass: bool) -> Self {
        self.bypass_approval = bypass;
        self
    }

    /// Record the client's current unique name.
    pub fn unique_name(mut self, unique: UniqueName) -> Self {
        self.unique_name = Some(unique);
        self
    }

    /// Construct the client handle.
    pub fn build(self) -> Arc<ClientHandle> {
        Arc::new(ClientHandle {
            well_known_name: self.well_known_name,
            unique_name: Mutex::new(self.unique_name),
            roles: self.roles,
            observer_filters: self.observer_filters,
            approver_filters: self.approver_filters,
            handler_filters: self.handler_filters,
            bypass_approval: self.bypass_approval,
            proxy: self.proxy,
        })
    }
}

/// The process-wide index of currently-known client endpoints.
#[derive(Educe)]
#[educe(Debug)]
pub struct ClientRegistry {
    /// The registered clients, by well-known name.
    ///
    /// Registration order is preserved so that handler selection is
    /// stable when nothing else distinguishes two handlers.
    clients: Mutex<Vec<Arc<ClientHandle>>>,
    /// Index into `clients` by well-known name.
    by_name: Mutex<HashMap<WellKnownName, Arc<ClientHandle>>>,
    /// Sender half of the client-count stream.
    #[educe(Debug(ignore))]
    count_tx: Mutex<watch::Sender<usize>>,
    /// Receiver kept to clone for subscribers.
    #[educe(Debug(ignore))]
    count_rx: watch::Receiver<usize>,
}

impl ClientRegistry {
    /// Make a new, empty registry.
    pub fn new() -> Arc<Self> {
        let (count_tx, count_rx) = watch::channel();
        Arc::new(ClientRegistry {
            clients: Mutex::new(Vec::new()),
            by_name: Mutex::new(HashMap::new()),
            count_tx: Mutex::new(count_tx),
            count_rx,
        })
    }

    /// Add `client` to the registry, replacing any earlier registration
    /// under the same well-known name.
    pub fn register(&self, client: Arc<ClientHandle>) {
        debug!("registering client {}", client.name());
        let mut clients = self.clients.lock().expect("lock poisoned");
        let mut by_name = self.by_name.lock().expect("lock poisoned");
        if by_name
            .insert(client.name().clone(), Arc::clone(&client))
            .is_some()
        {
            clients.retain(|c| c.name() != client.name());
        }
        clients.push(client);
        *self
            .count_tx
            .lock()
            .expect("lock poisoned")
            .borrow_mut() = clients.len();
    }

    /// Remove the client registered under `name`, if any.
    ///
    /// Called when a client falls off the bus.
    pub fn unregister(&self, name: &WellKnownName) -> Option<Arc<ClientHandle>> {
        let mut clients = self.clients.lock().expect("lock poisoned");
        let mut by_name = self.by_name.lock().expect("lock poisoned");
        let removed = by_name.remove(name);
        if removed.is_some() {
            debug!("unregistering client {}", name);
            clients.retain(|c| c.name() != name);
            *self
                .count_tx
                .lock()
                .expect("lock poisoned")
                .borrow_mut() = clients.len();
        }
        removed
    }

    /// Look up the client registered under `name`.
    pub fn lookup(&self, name: &WellKnownName) -> Option<Arc<ClientHandle>> {
        self.by_name
            .lock()
            .expect("lock poisoned")
            .get(name)
            .cloned()
    }

    /// Return a snapshot of every registered client, in registration
    /// order.
    pub fn clients(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.lock().expect("lock poisoned").clone()
    }

    /// Return the number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.lock().expect("lock poisoned").len()
    }

    /// Return true if no clients are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return a stream of client counts, updated on every registration
    /// change.
    pub fn count_events(&self) -> watch::Receiver<usize> {
        self.count_rx.clone()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::testing::NullProxy;

    fn name(s: &str) -> WellKnownName {
        WellKnownName::new(s).unwrap()
    }

    fn props(pairs: &[(&str, &str)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).into()))
            .collect()
    }

    #[test]
    fn filter_matching() {
        let filter = Filter::new(props(&[("type", "text")]));
        assert!(filter.matches(&props(&[("type", "text"), ("x", "y")])));
        assert!(!filter.matches(&props(&[("type", "call")])));
        assert!(!filter.matches(&props(&[])));

        // The empty filter matches everything...
        assert!(Filter::default().matches(&props(&[])));
        // ...but the empty filter list matches nothing.
        assert!(!any_filter_matches(&[], &props(&[("type", "text")])));
    }

    #[test]
    fn roles_and_filters() {
        let client = ClientHandle::builder(
            name("org.switchboard.Client.Gossip"),
            Arc::new(NullProxy),
        )
        .observer(vec![Filter::default()])
        .handler(vec![Filter::new(props(&[("type", "text")]))])
        .build();

        assert!(client.roles().observer);
        assert!(!client.roles().approver);
        assert!(client.observer_matches(&props(&[("type", "call")])));
        assert!(!client.approver_matches(&props(&[("type", "call")])));
        assert!(client.handler_matches(&props(&[("type", "text")])));
        assert!(!client.handler_matches(&props(&[("type", "call")])));
    }

    #[test]
    fn register_lookup_unregister() {
        let registry = ClientRegistry::new();
        assert!(registry.is_empty());

        let a = ClientHandle::builder(name("org.example.A"), Arc::new(NullProxy)).build();
        let b = ClientHandle::builder(name("org.example.B"), Arc::new(NullProxy)).build();
        registry.register(a);
        registry.register(b);
        assert_eq!(registry.len(), 2);

        let found = registry.lookup(&name("org.example.A")).unwrap();
        assert_eq!(found.name(), &name("org.example.A"));

        assert!(registry.unregister(&name("org.example.A")).is_some());
        assert!(registry.lookup(&name("org.example.A")).is_none());
        assert!(registry.unregister(&name("org.example.A")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reregistration_replaces() {
        let registry = ClientRegistry::new();
        let old = ClientHandle::builder(name("org.example.A"), Arc::new(NullProxy)).build();
        registry.register(old);
        let new = ClientHandle::builder(name("org.example.A"), Arc::new(NullProxy))
            .handler(vec![Filter::default()])
            .build();
        registry.register(new);
        assert_eq!(registry.len(), 1);
        assert!(
            registry
                .lookup(&name("org.example.A"))
                .unwrap()
                .roles()
                .handler
        );
    }

    #[test]
    fn snapshot_keeps_registration_order() {
        let registry = ClientRegistry::new();
        for n in ["org.example.C", "org.example.A", "org.example.B"] {
            registry.register(ClientHandle::builder(name(n), Arc::new(NullProxy)).build());
        }
        let names: Vec<_> = registry
            .clients()
            .iter()
            .map(|c| c.name().as_str().to_owned())
            .collect();
        assert_eq!(names, ["org.example.C", "org.example.A", "org.example.B"]);
    }

    #[test]
    fn unique_names_can_arrive_late() {
        let client =
            ClientHandle::builder(name("org.example.Late"), Arc::new(NullProxy)).build();
        assert!(client.unique_name().is_none());
        client.set_unique_name(UniqueName::new(":1.99").unwrap());
        assert_eq!(client.unique_name().unwrap().as_str(), ":1.99");
    }
}
