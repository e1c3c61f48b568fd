//! The dispatcher: admits new channels, runs the filter chains, and owns
//! the dispatch operations.

use std::sync::{Arc, Mutex};

use futures::task::{Spawn, SpawnExt};
use futures::StreamExt;
use tracing::{debug, warn};

use switchboard_bus::{ObjectPath, WellKnownName};

use crate::bus::Bus;
use crate::channel::{Channel, ChannelStatus, ChannelType};
use crate::config::DispatchConfig;
use crate::err::{ChannelError, Error};
use crate::event::{self, DispatchEvent, DispatchEventSender, DispatchEvents};
use crate::filters::{FilterChains, FilterVerdict};
use crate::handler_map::HandlerMap;
use crate::operation::{DispatchOperation, DispatchOutcome};
use crate::registry::ClientRegistry;
use crate::Result;

/// The per-process owner of dispatch operations.
///
/// Connection glue hands newly-surfaced channels to
/// [`dispatch_channel`](Dispatcher::dispatch_channel) (or several at once
/// to [`dispatch_batch`](Dispatcher::dispatch_batch)); the dispatcher runs
/// the registered [filter chains](FilterChains), computes the best-first
/// handler list, and drives a [`DispatchOperation`] over the survivors.
pub struct Dispatcher {
    /// The shared client registry.
    registry: Arc<ClientRegistry>,
    /// The shared handler map.
    handler_map: Arc<HandlerMap>,
    /// The bus glue.
    bus: Arc<dyn Bus>,
    /// Task spawner shared with the operations.
    spawner: Arc<dyn Spawn + Send + Sync>,
    /// Dispatcher configuration.
    config: Arc<DispatchConfig>,
    /// The in-process filter chains.
    filters: FilterChains,
    /// Sender half of the lifecycle event stream.
    events_tx: DispatchEventSender,
    /// Receiver kept to clone for subscribers.
    events_rx: DispatchEvents,
    /// Everything that changes after construction.
    inner: Mutex<Inner>,
}

/// Mutable state of a [`Dispatcher`].
struct Inner {
    /// Every channel currently known to the dispatcher.
    channels: Vec<Arc<Channel>>,
    /// The operations still running.
    operations: Vec<Arc<DispatchOperation>>,
}

impl Dispatcher {
    /// Construct a new dispatcher.
    pub fn new(
        registry: Arc<ClientRegistry>,
        handler_map: Arc<HandlerMap>,
        bus: Arc<dyn Bus>,
        spawner: Arc<dyn Spawn + Send + Sync>,
        config: Arc<DispatchConfig>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = event::channel();
        Arc::new(Dispatcher {
            registry,
            handler_map,
            bus,
            spawner,
            config,
            filters: FilterChains::new(),
            events_tx,
            events_rx,
            inner: Mutex::new(Inner {
                channels: Vec::new(),
                operations: Vec::new(),
            }),
        })
    }

    /// Return the shared client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Return the shared handler map.
    pub fn handler_map(&self) -> &Arc<HandlerMap> {
        &self.handler_map
    }

    /// Return the dispatcher's filter chains, for registration.
    pub fn filters(&self) -> &FilterChains {
        &self.filters
    }

    /// Return a new subscription to the dispatcher's lifecycle events.
    pub fn events(&self) -> DispatchEvents {
        self.events_rx.clone()
    }

    /// Return the operations still running.
    pub fn active_operations(&self) -> Vec<Arc<DispatchOperation>> {
        self.inner.lock().expect("lock poisoned").operations.clone()
    }

    /// Return the running operation exported at `path`, if any.
    pub fn operation_at(&self, path: &ObjectPath) -> Option<Arc<DispatchOperation>> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .operations
            .iter()
            .find(|op| op.object_path() == path)
            .cloned()
    }

    /// Resolve the operation at `path` in favour of dispatch, as a
    /// duplicate (pre-approved) channel request does.
    ///
    /// Returns false if no such operation is running.
    pub fn approve_operation(&self, path: &ObjectPath) -> bool {
        match self.operation_at(path) {
            Some(op) => {
                op.approve();
                true
            }
            None => false,
        }
    }

    /// Return how many active channels have type `channel_type`.
    pub fn channel_type_usage(&self, channel_type: &ChannelType) -> usize {
        self.inner
            .lock()
            .expect("lock poisoned")
            .channels
            .iter()
            .filter(|c| c.channel_type() == channel_type)
            .count()
    }

    /// Dispatch a single channel.  See
    /// [`dispatch_batch`](Self::dispatch_batch).
    pub fn dispatch_channel(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        requested: bool,
        observe_only: bool,
    ) -> Result<Arc<DispatchOperation>> {
        self.dispatch_batch(vec![channel], requested, observe_only)
    }

    /// Dispatch a batch of channels as one operation.
    ///
    /// Channels already known to the dispatcher are skipped; the rest are
    /// admitted and run through the filter chains, and the survivors get
    /// a [`DispatchOperation`].  `requested` channels skip approval
    /// (their existence was asked for locally); `observe_only` stops
    /// after the observers and needs no handlers.
    ///
    /// Filter rejection fails the channel.  If no channels survive, or no
    /// registered handler can take them, every survivor is failed and an
    /// error is returned.
    pub fn dispatch_batch(
        self: &Arc<Self>,
        channels: Vec<Arc<Channel>>,
        requested: bool,
        observe_only: bool,
    ) -> Result<Arc<DispatchOperation>> {
        let mut survivors = Vec::new();
        for channel in channels {
            if !self.admit(&channel)? {
                continue;
            }
            match self.filters.run(&channel) {
                FilterVerdict::Accept => survivors.push(channel),
                FilterVerdict::Reject => {
                    debug!("filters rejected channel {}", channel.object_path());
                    channel.abort(ChannelError::filtered());
                }
            }
        }
        if survivors.is_empty() {
            return Err(Error::NoChannels);
        }

        let possible_handlers = if observe_only {
            Vec::new()
        } else {
            let possible = self.possible_handlers_for(&survivors);
            if possible.is_empty() {
                // Nothing registered can take these channels at all.
                warn!("no registered handler matches; failing the batch");
                for channel in &survivors {
                    self.events_tx.emit(DispatchEvent::DispatchFailed {
                        channel: channel.object_path().clone(),
                        error: ChannelError::handler_unavailable(),
                    });
                    channel.abort(ChannelError::handler_unavailable());
                }
                return Err(Error::NoPossibleHandlers);
            }
            possible
        };

        let needs_approval = !requested && !observe_only;
        let op = DispatchOperation::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.handler_map),
            Arc::clone(&self.bus),
            Arc::clone(&self.spawner),
            Arc::clone(&self.config),
            needs_approval,
            observe_only,
            survivors.clone(),
            possible_handlers,
        )?;

        self.inner
            .lock()
            .expect("lock poisoned")
            .operations
            .push(Arc::clone(&op));
        self.spawn_finish_watcher(&op, survivors)?;
        op.run_clients();
        Ok(op)
    }

    /// Admit `channel` into the dispatcher's active list.
    ///
    /// Returns false for channels that are already known (a channel can
    /// legitimately be offered twice when a user re-requests something
    /// that is still being dispatched).
    fn admit(self: &Arc<Self>, channel: &Arc<Channel>) -> Result<bool> {
        {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner
                .channels
                .iter()
                .any(|c| c.object_path() == channel.object_path())
            {
                debug!("channel {} is already in dispatcher", channel.object_path());
                return Ok(false);
            }
            inner.channels.push(Arc::clone(channel));
        }
        self.events_tx.emit(DispatchEvent::ChannelAdded {
            channel: channel.object_path().clone(),
        });

        // Drop the channel from the active list once it aborts.
        let dispatcher = Arc::clone(self);
        let chan = Arc::clone(channel);
        self.spawner
            .spawn(async move {
                let mut status = chan.status_events().fuse();
                while let Some(status) = status.next().await {
                    if status == ChannelStatus::Aborted {
                        dispatcher.forget_channel(&chan);
                        break;
                    }
                }
            })
            .map_err(|e| Error::from_spawn("channel removal watcher", e))?;
        Ok(true)
    }

    /// Remove an aborted channel from the active list.
    fn forget_channel(&self, channel: &Arc<Channel>) {
        debug!("removing channel {} from list", channel.object_path());
        self.inner
            .lock()
            .expect("lock poisoned")
            .channels
            .retain(|c| !Arc::ptr_eq(c, channel));
        self.events_tx.emit(DispatchEvent::ChannelRemoved {
            channel: channel.object_path().clone(),
        });
    }

    /// Compute the best-first candidate handler list for `channels`.
    ///
    /// Handlers whose filters match any of the channels qualify; handlers
    /// with bypass-approval sort first, registration order breaks ties.
    fn possible_handlers_for(&self, channels: &[Arc<Channel>]) -> Vec<WellKnownName> {
        let mut candidates: Vec<_> = self
            .registry
            .clients()
            .into_iter()
            .filter(|client| {
                channels
                    .iter()
                    .any(|c| client.handler_matches(c.immutable_properties()))
            })
            .collect();
        candidates.sort_by_key(|client| !client.bypass_approval());
        candidates.into_iter().map(|c| c.name().clone()).collect()
    }

    /// Watch for `op` finishing: withdraw it from the bus, forget it, and
    /// report the outcome as lifecycle events.
    fn spawn_finish_watcher(
        self: &Arc<Self>,
        op: &Arc<DispatchOperation>,
        original: Vec<Arc<Channel>>,
    ) -> Result<()> {
        let dispatcher = Arc::clone(self);
        let op = Arc::clone(op);
        let mut finished = op.finished_watch();
        self.spawner
            .spawn(async move {
                while let Some(done) = finished.next().await {
                    if done {
                        dispatcher.operation_finished(&op, &original);
                        break;
                    }
                }
            })
            .map_err(|e| Error::from_spawn("operation finish watcher", e))
    }

    /// Tidy up after `op` has finished.
    fn operation_finished(&self, op: &Arc<DispatchOperation>, original: &[Arc<Channel>]) {
        debug!("operation {} finished", op.unique_name());
        self.inner
            .lock()
            .expect("lock poisoned")
            .operations
            .retain(|o| !Arc::ptr_eq(o, op));
        if op.is_published() {
            self.bus.retract_operation(op.object_path());
        }

        match op.outcome() {
            Some(DispatchOutcome::Handled(_)) | Some(DispatchOutcome::Claimed(_)) => {
                for channel in op.channels() {
                    if let Some(handler) = self.handler_map.handler_of(channel.object_path()) {
                        self.events_tx.emit(DispatchEvent::Dispatched {
                            channel: channel.object_path().clone(),
                            handler,
                        });
                    }
                }
            }
            Some(DispatchOutcome::NoHandlersLeft) => {
                for channel in original {
                    self.events_tx.emit(DispatchEvent::DispatchFailed {
                        channel: channel.object_path().clone(),
                        error: channel
                            .error()
                            .unwrap_or_else(ChannelError::handler_unavailable),
                    });
                }
            }
            // Observe-only operations (and batches that drained away)
            // have no outcome to report.
            None => {}
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("lock poisoned");
        f.debug_struct("Dispatcher")
            .field("channels", &inner.channels.len())
            .field("operations", &inner.operations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::channel::Direction;
    use crate::filters::{ChannelFilter, PRIORITY_DEFAULT};
    use crate::registry::{ClientHandle, ClientProxy, Filter};
    use crate::testing::{
        call_log, calls_to, CallLog, FakeProxy, RecordingBus, TestExecutor, HANDLE_CHANNELS,
    };
    use futures::FutureExt;
    use switchboard_bus::UniqueName;

    /// A dispatcher with its collaborators, wired for tests.
    struct Fixture {
        exec: TestExecutor,
        dispatcher: Arc<Dispatcher>,
        bus: Arc<RecordingBus>,
        log: CallLog,
    }

    impl Fixture {
        fn new() -> Self {
            let exec = TestExecutor::new();
            let registry = ClientRegistry::new();
            let handler_map = HandlerMap::new(exec.spawner());
            let bus = RecordingBus::new();
            let dispatcher = Dispatcher::new(
                registry,
                handler_map,
                Arc::clone(&bus) as Arc<dyn Bus>,
                exec.spawner(),
                Arc::new(DispatchConfig::default()),
            );
            Fixture {
                exec,
                dispatcher,
                bus,
                log: call_log(),
            }
        }

        fn add_handler(&self, short: &str, bypass: bool) -> Arc<FakeProxy> {
            let name = WellKnownName::new(format!("org.switchboard.Client.{}", short)).unwrap();
            let proxy = FakeProxy::new(name.as_str(), &self.log);
            let unique = UniqueName::new(format!(
                ":1.{}",
                self.dispatcher.registry().len() + 20
            ))
            .unwrap();
            self.dispatcher.registry().register(
                ClientHandle::builder(name, Arc::clone(&proxy) as Arc<dyn ClientProxy>)
                    .handler(vec![Filter::default()])
                    .bypass_approval(bypass)
                    .unique_name(unique)
                    .build(),
            );
            proxy
        }

        fn channel(&self, path: &str) -> Arc<Channel> {
            Arc::new(
                Channel::builder(
                    ObjectPath::new(path).unwrap(),
                    ChannelType::new("org.switchboard.Channel.Type.Text"),
                    Direction::Incoming,
                )
                .connection(ObjectPath::new("/conn/0").unwrap())
                .account(ObjectPath::new("/account/a").unwrap())
                .build(),
            )
        }

        fn run(&mut self) {
            self.exec.run_until_stalled();
        }
    }

    /// Drain every event currently queued on `events`.
    fn drain(events: &mut DispatchEvents) -> Vec<DispatchEvent> {
        let mut out = Vec::new();
        while let Some(Some(ev)) = events.next().now_or_never() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn requested_channel_dispatches_without_approval() {
        let mut fix = Fixture::new();
        fix.add_handler("H1", false);
        let mut events = fix.dispatcher.events();

        let chan = fix.channel("/chan/0");
        let op = fix
            .dispatcher
            .dispatch_channel(Arc::clone(&chan), true, false)
            .unwrap();
        assert!(!op.needs_approval());
        assert_eq!(fix.dispatcher.active_operations().len(), 1);
        fix.run();

        assert_eq!(calls_to(&fix.log, "org.switchboard.Client.H1", HANDLE_CHANNELS), 1);
        assert!(op.is_finished());
        // The finished operation is forgotten again.
        assert!(fix.dispatcher.active_operations().is_empty());
        assert_eq!(chan.status(), ChannelStatus::Dispatched);

        let events = drain(&mut events);
        assert!(matches!(events[0], DispatchEvent::ChannelAdded { .. }));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, DispatchEvent::Dispatched { .. }))
        );
    }

    #[test]
    fn unrequested_channel_is_published_for_approval() {
        let mut fix = Fixture::new();
        fix.add_handler("H1", false);

        let chan = fix.channel("/chan/0");
        let op = fix
            .dispatcher
            .dispatch_channel(chan, false, false)
            .unwrap();
        assert!(op.needs_approval());
        assert!(op.is_published());
        assert_eq!(
            fix.dispatcher.operation_at(op.object_path()).unwrap().unique_name(),
            op.unique_name()
        );
        fix.run();

        // Nobody approved or steered it yet, but default-allow (there
        // are no approvers) let it through; it is retracted after
        // finishing.
        assert!(op.is_finished());
        assert!(fix.dispatcher.operation_at(op.object_path()).is_none());
        let records = fix.bus.records();
        assert!(records.contains(&crate::testing::BusRecord::Retracted(
            op.object_path().clone()
        )));
    }

    #[test]
    fn filter_rejection_fails_the_channel() {
        let mut fix = Fixture::new();
        fix.add_handler("H1", false);
        let mut events = fix.dispatcher.events();

        struct RejectAll;
        impl ChannelFilter for RejectAll {
            fn run(&self, _channel: &Arc<Channel>) -> FilterVerdict {
                FilterVerdict::Reject
            }
        }
        fix.dispatcher.filters().register(
            Arc::new(RejectAll),
            ChannelType::new("org.switchboard.Channel.Type.Text"),
            Direction::Incoming,
            PRIORITY_DEFAULT,
        );

        let chan = fix.channel("/chan/0");
        let result = fix.dispatcher.dispatch_channel(Arc::clone(&chan), true, false);
        assert!(matches!(result, Err(Error::NoChannels)));
        assert_eq!(chan.status(), ChannelStatus::Aborted);
        assert_eq!(chan.error().unwrap().name(), ChannelError::NOT_CAPABLE);
        fix.run();

        let events = drain(&mut events);
        assert!(matches!(events[0], DispatchEvent::ChannelAdded { .. }));
        assert!(matches!(events[1], DispatchEvent::ChannelRemoved { .. }));
    }

    #[test]
    fn bypass_handlers_sort_first() {
        let fix = Fixture::new();
        fix.add_handler("Plain", false);
        fix.add_handler("Urgent", true);

        let op = fix
            .dispatcher
            .dispatch_channel(fix.channel("/chan/0"), true, false)
            .unwrap();
        let possible = op.possible_handlers();
        assert_eq!(possible[0].as_str(), "org.switchboard.Client.Urgent");
        assert_eq!(possible[1].as_str(), "org.switchboard.Client.Plain");
    }

    #[test]
    fn duplicate_channels_are_not_readmitted() {
        let mut fix = Fixture::new();
        fix.add_handler("H1", false);
        let mut events = fix.dispatcher.events();

        let chan = fix.channel("/chan/0");
        fix.dispatcher
            .dispatch_channel(Arc::clone(&chan), true, false)
            .unwrap();
        let second = fix.dispatcher.dispatch_channel(Arc::clone(&chan), true, false);
        assert!(matches!(second, Err(Error::NoChannels)));
        fix.run();

        let added = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, DispatchEvent::ChannelAdded { .. }))
            .count();
        assert_eq!(added, 1);
    }

    #[test]
    fn no_matching_handler_fails_the_batch() {
        let mut fix = Fixture::new();
        let mut events = fix.dispatcher.events();

        let chan = fix.channel("/chan/0");
        let result = fix.dispatcher.dispatch_channel(Arc::clone(&chan), true, false);
        assert!(matches!(result, Err(Error::NoPossibleHandlers)));
        assert_eq!(chan.status(), ChannelStatus::Aborted);
        fix.run();

        assert!(
            drain(&mut events)
                .iter()
                .any(|e| matches!(e, DispatchEvent::DispatchFailed { .. }))
        );
    }

    #[test]
    fn observe_only_needs_no_handlers() {
        let mut fix = Fixture::new();
        let chan = fix.channel("/chan/0");
        let op = fix
            .dispatcher
            .dispatch_channel(Arc::clone(&chan), true, true)
            .unwrap();
        assert!(op.observe_only());
        fix.run();
        // Still running; it lingers until its channel goes away.
        assert_eq!(fix.dispatcher.active_operations().len(), 1);
        chan.abort(ChannelError::terminated());
        fix.run();
        assert!(fix.dispatcher.active_operations().is_empty());
    }

    #[test]
    fn channel_type_usage_counts_active_channels() {
        let mut fix = Fixture::new();
        fix.add_handler("H1", false);
        let text = ChannelType::new("org.switchboard.Channel.Type.Text");

        let chan = fix.channel("/chan/0");
        fix.dispatcher
            .dispatch_channel(Arc::clone(&chan), true, false)
            .unwrap();
        fix.run();
        assert_eq!(fix.dispatcher.channel_type_usage(&text), 1);
        assert_eq!(
            fix.dispatcher
                .channel_type_usage(&ChannelType::new("other")),
            0
        );

        chan.abort(ChannelError::terminated());
        fix.run();
        assert_eq!(fix.dispatcher.channel_type_usage(&text), 0);
    }

    #[test]
    fn approve_operation_routes_to_the_operation() {
        let mut fix = Fixture::new();
        fix.add_handler("H1", false);

        let op = fix
            .dispatcher
            .dispatch_channel(fix.channel("/chan/0"), false, false)
            .unwrap();
        assert!(fix.dispatcher.approve_operation(op.object_path()));
        fix.run();
        assert!(op.is_finished());

        // Once finished (and forgotten), approval no longer routes.
        assert!(!fix.dispatcher.approve_operation(op.object_path()));
    }
}
