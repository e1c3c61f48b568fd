//! The channel dispatch operation: one batch of channels moving through
//! observe → approve → handle.
//!
//! A [`DispatchOperation`] owns its channels for the duration of dispatch.
//! It fans out `ObserveChannels` to every matching observer, optionally
//! gates progress behind approvers, and then picks exactly one handler —
//! all while remaining steerable from the bus (`HandleWith`, `Claim`) and
//! tolerant of channels aborting under it.
//!
//! # Client locks
//!
//! The operation may not finish while any observer or approver call is
//! outstanding.  Two counters (`observers_pending`, `approvers_pending`)
//! track the outstanding calls; every spawned completion task captures a
//! strong reference to the operation, so a positive counter also keeps the
//! operation alive.  All four of the conditions checked by
//! [`check_client_locks`](DispatchOperation::check_client_locks) must hold
//! before handler selection runs.
//!
//! State lives behind a mutex that is never held across an await; each
//! transition runs to completion within one executor turn.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::channel::oneshot;
use futures::select_biased;
use futures::task::{Spawn, SpawnExt};
use futures::StreamExt;
use postage::watch;
use tracing::{debug, info, warn};

use switchboard_bus::{ObjectPath, PropertyMap, UniqueName, Value, WellKnownName};

use crate::bus::{Bus, DISPATCH_OPERATION_INTERFACE};
use crate::channel::{Channel, ChannelDetails, ChannelStatus};
use crate::config::DispatchConfig;
use crate::err::{ChannelError, Error};
use crate::handler_map::HandlerMap;
use crate::registry::{CallError, ClientHandle, ClientRegistry};
use crate::Result;

/// Process-wide counter from which operation names are allocated.
static NEXT_OPERATION: AtomicU64 = AtomicU64::new(0);

/// How one dispatch operation ended.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum DispatchOutcome {
    /// A handler accepted the channels.
    Handled(WellKnownName),
    /// A bus caller claimed the channels without any handler running.
    Claimed(UniqueName),
    /// Every possible handler was gone; the channels were failed.
    NoHandlersLeft,
}

/// One channel dispatch operation.
///
/// Constructed by the [`Dispatcher`](crate::Dispatcher) over a non-empty
/// batch of channels.  Bus glue forwards `HandleWith` and `Claim` calls to
/// the methods of the same name here, and reads the exported properties
/// through [`properties`](DispatchOperation::properties) and
/// [`channel_details`](DispatchOperation::channel_details).
pub struct DispatchOperation {
    /// The trailing segment of `object_path`, like `do7`.
    unique_name: String,
    /// Where this operation is (or would be) exported on the bus.
    object_path: ObjectPath,
    /// If true, approvers run and the operation is published on the bus.
    needs_approval: bool,
    /// If true, the operation stops after observers; no handler runs.
    observe_only: bool,
    /// The shared client registry.
    registry: Arc<ClientRegistry>,
    /// The shared handler map.
    handler_map: Arc<HandlerMap>,
    /// The bus glue used for publication and signals.
    bus: Arc<dyn Bus>,
    /// Task spawner for out-call completions and loss watchers.
    spawner: Arc<dyn Spawn + Send + Sync>,
    /// Dispatcher configuration (client prefix, path base).
    config: Arc<DispatchConfig>,
    /// Connection of the first channel, if it had one.
    connection: Option<ObjectPath>,
    /// Account of the first channel, if it had one.
    account: Option<ObjectPath>,
    /// The exported immutable properties, built on first request.
    properties: OnceLock<PropertyMap>,
    /// Everything that changes after construction.
    state: Mutex<State>,
}

/// Mutable state of a [`DispatchOperation`].
///
/// The lock over this is never held across an await, and never held while
/// calling back into another locking component.
struct State {
    /// Channels still owned by this operation.
    channels: Vec<Arc<Channel>>,
    /// Channels that aborted while we could not signal it, newest first.
    lost_channels: Vec<Arc<Channel>>,
    /// Candidate handlers, best first.
    possible_handlers: Vec<WellKnownName>,
    /// Handlers that already failed for this operation.
    failed_handlers: HashSet<WellKnownName>,
    /// Observers that have not yet returned.  Client lock.
    observers_pending: usize,
    /// Approvers that have not yet returned.  Client lock.
    approvers_pending: usize,
    /// True once observers and approvers have been dispatched.
    invoked_early_clients: bool,
    /// True once the operation may proceed to the handler stage.
    approved: bool,
    /// True while at least one approver has accepted and none has yet
    /// resolved the operation.
    awaiting_approval: bool,
    /// True once the operation will finish as soon as its locks drain.
    wants_to_finish: bool,
    /// True once handler selection is settled, one way or another.
    channels_handled: bool,
    /// True if an owning channel request was cancelled.
    cancelled: bool,
    /// Handler chosen via `HandleWith`, stored prefix-stripped.
    chosen_handler: Option<String>,
    /// Wall-clock seconds at which `HandleWith` was invoked.
    handle_with_time: i64,
    /// The unique name of a successful `Claim` caller.
    claimer: Option<UniqueName>,
    /// The pending reply to `Claim`, completed at finish.
    claim_reply: Option<oneshot::Sender<()>>,
    /// How the operation ended, once known.
    outcome: Option<DispatchOutcome>,
    /// True if publication on the bus succeeded.
    published: bool,
    /// Sender half of the finished flag.
    finished_tx: watch::Sender<bool>,
    /// Receiver kept to clone for watchers.
    finished_rx: watch::Receiver<bool>,
}

impl State {
    /// Return true if the operation is allowed to finish right now.
    fn may_finish(&self) -> bool {
        self.observers_pending == 0 && self.approvers_pending == 0
    }

    /// Return true if the handler stage may be entered.
    fn is_approved(&self, needs_approval: bool) -> bool {
        self.approved || !needs_approval
    }
}

impl std::fmt::Debug for DispatchOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchOperation")
            .field("object_path", &self.object_path)
            .field("needs_approval", &self.needs_approval)
            .field("observe_only", &self.observe_only)
            .finish_non_exhaustive()
    }
}

impl DispatchOperation {
    /// Construct a new dispatch operation over `channels`.
    ///
    /// `possible_handlers` must be ordered best-first and non-empty unless
    /// `observe_only`; `needs_approval` and `observe_only` are mutually
    /// exclusive.  If `needs_approval`, the operation is published on the
    /// bus; a publication failure is logged and dispatch continues
    /// in-process.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<ClientRegistry>,
        handler_map: Arc<HandlerMap>,
        bus: Arc<dyn Bus>,
        spawner: Arc<dyn Spawn + Send + Sync>,
        config: Arc<DispatchConfig>,
        needs_approval: bool,
        observe_only: bool,
        channels: Vec<Arc<Channel>>,
        possible_handlers: Vec<WellKnownName>,
    ) -> Result<Arc<Self>> {
        if needs_approval && observe_only {
            return Err(Error::ApprovalForbidden);
        }
        if !observe_only && possible_handlers.is_empty() {
            return Err(Error::NoPossibleHandlers);
        }
        let Some(first) = channels.first() else {
            return Err(Error::NoChannels);
        };

        let n = NEXT_OPERATION.fetch_add(1, Ordering::Relaxed);
        let unique_name = format!("do{}", n);
        let object_path = config
            .operation_base()
            .child(&unique_name)
            .map_err(|_| Error::Internal("operation base path unusable"))?;

        let connection = first.connection().cloned();
        if connection.is_none() {
            warn!("{}: first channel has no connection", unique_name);
        }
        let account = first.account().cloned();
        if account.is_none() {
            warn!("{}: first channel has no account", unique_name);
        }

        debug!("{}: needs_approval={}", unique_name, needs_approval);

        let (finished_tx, finished_rx) = watch::channel();
        let op = Arc::new(DispatchOperation {
            unique_name,
            object_path,
            needs_approval,
            observe_only,
            registry,
            handler_map,
            bus,
            spawner,
            config,
            connection,
            account,
            properties: OnceLock::new(),
            state: Mutex::new(State {
                channels: channels.clone(),
                lost_channels: Vec::new(),
                possible_handlers,
                failed_handlers: HashSet::new(),
                observers_pending: 0,
                approvers_pending: 0,
                invoked_early_clients: false,
                approved: false,
                awaiting_approval: false,
                wants_to_finish: false,
                channels_handled: false,
                cancelled: false,
                chosen_handler: None,
                handle_with_time: 0,
                claimer: None,
                claim_reply: None,
                outcome: None,
                published: false,
                finished_tx,
                finished_rx,
            }),
        });

        for channel in &channels {
            channel.set_status(ChannelStatus::Dispatching);
            op.spawn_loss_watcher(channel)?;
        }

        // If approval is not needed we stay off the bus, and approvers
        // never run.
        if needs_approval {
            match op.bus.publish_operation(&op) {
                Ok(()) => op.state.lock().expect("lock poisoned").published = true,
                Err(e) => info!("{}: staying off-bus: {}", op.unique_name, e),
            }
        }

        Ok(op)
    }

    /// Spawn the task that turns `channel`'s abort into a
    /// [`channel_aborted`](Self::channel_aborted) call.
    ///
    /// The task exits once the channel aborts or the operation finishes,
    /// whichever comes first.
    fn spawn_loss_watcher(self: &Arc<Self>, channel: &Arc<Channel>) -> Result<()> {
        let op = Arc::clone(self);
        let chan = Arc::clone(channel);
        let mut finished = self.finished_watch().fuse();
        let mut status = channel.status_events().fuse();
        self.spawner
            .spawn(async move {
                loop {
                    select_biased! {
                        fin = finished.next() => match fin {
                            None | Some(true) => break,
                            Some(false) => {}
                        },
                        st = status.next() => match st {
                            None => break,
                            Some(ChannelStatus::Aborted) => {
                                op.channel_aborted(&chan);
                                break;
                            }
                            Some(_) => {}
                        },
                    }
                }
            })
            .map_err(|e| Error::from_spawn("channel loss watcher", e))
    }

    /// Return the trailing segment of this operation's path, like `do7`.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Return the path at which this operation is (or would be) exported.
    pub fn object_path(&self) -> &ObjectPath {
        &self.object_path
    }

    /// Return true if this operation runs approvers and appears on the
    /// bus.
    pub fn needs_approval(&self) -> bool {
        self.needs_approval
    }

    /// Return true if this operation stops after observers.
    pub fn observe_only(&self) -> bool {
        self.observe_only
    }

    /// Return true if publication on the bus succeeded.
    pub fn is_published(&self) -> bool {
        self.state.lock().expect("lock poisoned").published
    }

    /// Return the owning connection's path, or the root path if unknown.
    pub fn connection_path(&self) -> ObjectPath {
        self.connection.clone().unwrap_or_else(ObjectPath::root)
    }

    /// Return the owning account's path, or the root path if unknown.
    pub fn account_path(&self) -> ObjectPath {
        self.account.clone().unwrap_or_else(ObjectPath::root)
    }

    /// Return the channels this operation still owns.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.state.lock().expect("lock poisoned").channels.clone()
    }

    /// Return true if `channel` is one of the channels this operation
    /// still owns.
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .channels
            .iter()
            .any(|c| Arc::ptr_eq(c, channel))
    }

    /// Return the candidate handlers for this operation, best first.
    pub fn possible_handlers(&self) -> Vec<WellKnownName> {
        self.state
            .lock()
            .expect("lock poisoned")
            .possible_handlers
            .clone()
    }

    /// Return true if an owning channel request was cancelled.
    pub fn cancelled(&self) -> bool {
        self.state.lock().expect("lock poisoned").cancelled
    }

    /// Return how this operation ended, once it has.
    ///
    /// `None` until the handler stage settles, and forever for
    /// observe-only operations.
    pub fn outcome(&self) -> Option<DispatchOutcome> {
        self.state.lock().expect("lock poisoned").outcome.clone()
    }

    /// Return true if this operation has finished.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state.wants_to_finish && state.may_finish()
    }

    /// Return a watch over the finished flag.
    pub(crate) fn finished_watch(&self) -> watch::Receiver<bool> {
        self.state.lock().expect("lock poisoned").finished_rx.clone()
    }

    /// Return the exported immutable properties of this operation.
    ///
    /// Built on first request.  The mutable `Channels` property is
    /// deliberately absent; read it through
    /// [`channel_details`](Self::channel_details) instead.
    pub fn properties(&self) -> &PropertyMap {
        self.properties.get_or_init(|| {
            let mut props = PropertyMap::new();
            let key = |name: &str| format!("{}.{}", DISPATCH_OPERATION_INTERFACE, name);
            props.insert(
                key("Interfaces"),
                Value::StrList(vec![DISPATCH_OPERATION_INTERFACE.to_owned()]),
            );
            props.insert(key("Connection"), Value::Path(self.connection_path()));
            props.insert(key("Account"), Value::Path(self.account_path()));
            props.insert(
                key("PossibleHandlers"),
                Value::StrList(
                    self.possible_handlers()
                        .iter()
                        .map(|h| h.as_str().to_owned())
                        .collect(),
                ),
            );
            props
        })
    }

    /// Return the `(path, properties)` pair for each channel still owned.
    ///
    /// This is the bus surface's mutable `Channels` property.
    pub fn channel_details(&self) -> Vec<ChannelDetails> {
        self.channels().iter().map(|c| c.details()).collect()
    }

    //
    // Client-lock bookkeeping.
    //

    /// Add one to the observer lock, unless the operation is finishing.
    ///
    /// Returns false (and makes no change) in that case; the caller must
    /// then not issue the call it was counting.
    fn try_inc_observers(&self) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.wants_to_finish {
            warn!("{}: observer call after finish started", self.unique_name);
            return false;
        }
        debug!(
            "{}: observers {} -> {}",
            self.unique_name,
            state.observers_pending,
            state.observers_pending + 1
        );
        state.observers_pending += 1;
        true
    }

    /// Drop one from the observer lock and re-run the checks.
    fn dec_observers(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            debug!(
                "{}: observers {} -> {}",
                self.unique_name,
                state.observers_pending,
                state.observers_pending.saturating_sub(1)
            );
            debug_assert!(state.observers_pending > 0);
            state.observers_pending = state.observers_pending.saturating_sub(1);
        }
        self.check_finished();
        self.check_client_locks();
    }

    /// Add one to the approver lock, unless the operation is finishing.
    fn try_inc_approvers(&self) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.wants_to_finish {
            warn!("{}: approver call after finish started", self.unique_name);
            return false;
        }
        debug!(
            "{}: approvers {} -> {}",
            self.unique_name,
            state.approvers_pending,
            state.approvers_pending + 1
        );
        state.approvers_pending += 1;
        true
    }

    /// Drop one from the approver lock and re-run the checks.
    ///
    /// When the last approver returns without any of them having
    /// accepted, the operation is considered approved: the default-allow
    /// policy for systems with no (interested) approver.
    fn dec_approvers(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            debug!(
                "{}: approvers {} -> {}",
                self.unique_name,
                state.approvers_pending,
                state.approvers_pending.saturating_sub(1)
            );
            debug_assert!(state.approvers_pending > 0);
            state.approvers_pending = state.approvers_pending.saturating_sub(1);
            if state.approvers_pending == 0 && !state.awaiting_approval {
                debug!(
                    "{}: no approver accepted the channels; considering them approved",
                    self.unique_name
                );
                state.approved = true;
            }
        }
        self.check_finished();
        self.check_client_locks();
    }

    /// Run the handler stage if every client lock has drained and the
    /// operation is approved.
    ///
    /// Checked on every counter decrement, on approval, and once after
    /// `run_clients`.  Enters handler selection exactly once.
    fn check_client_locks(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            let ready = state.invoked_early_clients
                && state.approvers_pending == 0
                && state.observers_pending == 0
                && state.is_approved(self.needs_approval);
            if !(ready && !state.channels_handled && !self.observe_only) {
                return;
            }
            state.channels_handled = true;
        }
        self.run_handlers();
    }

    //
    // Channel loss.
    //

    /// React to `channel` aborting while owned by this operation.
    ///
    /// Safe to call redundantly: a channel that is no longer (or never
    /// was) in this operation's list is ignored.
    pub(crate) fn channel_aborted(self: &Arc<Self>, channel: &Arc<Channel>) {
        debug!(
            "channel {} aborted while in a dispatch operation",
            channel.object_path()
        );
        // If the channel request behind this channel was cancelled, the
        // whole operation counts as cancelled; it still runs to a normal
        // finish so that observers get their notification.
        if channel.error().is_some_and(|e| e.is_cancellation()) {
            self.state.lock().expect("lock poisoned").cancelled = true;
        }
        self.lose_channel(channel);
    }

    /// Remove `channel` from this operation, signalling `ChannelLost` now
    /// or once the client locks allow it.
    fn lose_channel(self: &Arc<Self>, channel: &Arc<Channel>) {
        let emit_now;
        let empty_now;
        {
            let mut state = self.state.lock().expect("lock poisoned");
            let Some(at) = state
                .channels
                .iter()
                .position(|c| Arc::ptr_eq(c, channel))
            else {
                return;
            };
            state.channels.remove(at);
            if state.may_finish() {
                emit_now = true;
            } else {
                // Clients are still being invoked, so we may not talk
                // about this yet.  Save the signal for later.
                debug!(
                    "{}: not losing channel {} just yet",
                    self.unique_name,
                    channel.object_path()
                );
                state.lost_channels.push(Arc::clone(channel));
                emit_now = false;
            }
            empty_now = state.channels.is_empty();
        }
        if emit_now {
            self.emit_channel_lost(channel);
        }
        if empty_now {
            // No channels left, so the operation finishes (if it hasn't
            // already).
            self.finish();
        }
    }

    /// Emit `ChannelLost` for `channel`, if this operation is on the bus.
    fn emit_channel_lost(&self, channel: &Arc<Channel>) {
        let error = channel.error().unwrap_or_else(ChannelError::terminated);
        debug!(
            "{}: losing channel {}: {}",
            self.unique_name,
            channel.object_path(),
            error
        );
        if self.is_published() {
            self.bus
                .emit_channel_lost(&self.object_path, channel.object_path(), &error);
        }
    }

    /// Drain deferred `ChannelLost` signals and finish, as far as the
    /// client locks allow.
    fn check_finished(self: &Arc<Self>) {
        let (lost, finish_now) = {
            let mut state = self.state.lock().expect("lock poisoned");
            if !state.may_finish() {
                return;
            }
            // Deferred losses drain in chronological order: the reverse
            // of the order they were pushed.
            let mut lost = std::mem::take(&mut state.lost_channels);
            lost.reverse();
            (lost, state.wants_to_finish)
        };
        for channel in &lost {
            self.emit_channel_lost(channel);
        }
        if finish_now {
            debug!("{}: finished", self.unique_name);
            self.actually_finish();
        }
    }

    //
    // Finish semantics.
    //

    /// Latch the intention to finish; the finish step runs now if the
    /// client locks allow, or from whichever decrement drains them.
    fn finish(self: &Arc<Self>) {
        let now = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.wants_to_finish {
                debug!("{}: already finished (or about to)", self.unique_name);
                return;
            }
            state.wants_to_finish = true;
            state.may_finish()
        };
        if now {
            debug!("{}: has finished", self.unique_name);
            self.actually_finish();
        } else {
            debug!("{}: not finishing just yet", self.unique_name);
        }
    }

    /// The finish step: emit `Finished` and settle claims and approval.
    fn actually_finish(self: &Arc<Self>) {
        let (published, claim_work, claim_reply, was_awaiting) = {
            let mut state = self.state.lock().expect("lock poisoned");
            *state.finished_tx.borrow_mut() = true;

            if state.channels.is_empty() {
                state.channels_handled = true;
            }
            let claimer = state.claimer.clone();
            let claim_work = match claimer {
                Some(claimer) if !state.channels_handled => {
                    // We do not release the client-lock machinery into
                    // the handler stage; instead every remaining channel
                    // is marked as dispatched to the claimer.
                    state.channels_handled = true;
                    state.outcome = Some(DispatchOutcome::Claimed(claimer.clone()));
                    Some((claimer, state.channels.clone()))
                }
                Some(claimer) => {
                    // Handler selection (or an emptied channel list) got
                    // there first; the claim still wins the reply, but
                    // must not overwrite the handler map.
                    if state.outcome.is_none() {
                        state.outcome = Some(DispatchOutcome::Claimed(claimer));
                    }
                    None
                }
                None => None,
            };
            let was_awaiting = state.awaiting_approval;
            state.awaiting_approval = false;
            (
                state.published,
                claim_work,
                state.claim_reply.take(),
                was_awaiting,
            )
        };

        if published {
            self.bus.emit_finished(&self.object_path);
        }

        if let Some((claimer, channels)) = claim_work {
            for channel in &channels {
                self.set_channel_handled_by(channel, claimer.clone());
            }
        }

        if was_awaiting {
            // An approver resolved the operation; latch approval so a
            // re-entry into the lock check cannot try to run approvers
            // again.
            self.set_approved();
        }

        if let Some(reply) = claim_reply {
            debug!("{}: replying to claim", self.unique_name);
            let _ = reply.send(());
        }
    }

    //
    // Observer and approver fan-out.
    //

    /// Invoke observers and (if needed) approvers, then check the locks.
    ///
    /// Called exactly once, by the dispatcher, after construction.
    pub(crate) fn run_clients(self: &Arc<Self>) {
        self.run_observers();

        // If the channels were not requested locally, start the
        // approvers — unless the best live handler bypasses approval, in
        // which case its existence constitutes approval.
        if self.needs_approval {
            if self.handlers_can_bypass_approval() {
                self.set_approved();
            }
            if !self.state.lock().expect("lock poisoned").is_approved(true) {
                self.run_approvers();
            }
        }

        self.state
            .lock()
            .expect("lock poisoned")
            .invoked_early_clients = true;
        self.check_client_locks();
    }

    /// Fan `ObserveChannels` out to every matching observer.
    ///
    /// Observer failures are logged and otherwise ignored; they never
    /// veto dispatch.
    fn run_observers(self: &Arc<Self>) {
        let channels = self.channels();
        // The observer learns whether an approval phase will follow from
        // this argument: the operation's path if so, the root path if
        // not.
        let op_path = if self.needs_approval {
            self.object_path.clone()
        } else {
            ObjectPath::root()
        };

        for client in self.registry.clients() {
            let observed: Vec<Arc<Channel>> = channels
                .iter()
                .filter(|c| client.observer_matches(c.immutable_properties()))
                .cloned()
                .collect();
            if observed.is_empty() {
                continue;
            }
            if !self.try_inc_observers() {
                continue;
            }

            debug!(
                "calling ObserveChannels on {} for {}",
                client.name(),
                self.unique_name
            );
            let op = Arc::clone(self);
            let proxy = client.proxy();
            let name = client.name().clone();
            let account = self.account_path();
            let connection = self.connection_path();
            let details: Vec<ChannelDetails> = observed.iter().map(|c| c.details()).collect();
            let satisfied = collect_satisfied_requests(&observed);
            let dispatch_op = op_path.clone();
            let call = async move {
                let outcome = proxy
                    .observe_channels(
                        account,
                        connection,
                        details,
                        dispatch_op,
                        satisfied,
                        PropertyMap::new(),
                    )
                    .await;
                match &outcome {
                    // We log the error just for debugging; it changes
                    // nothing.
                    Err(e) => debug!("observer {} returned error: {}", name, e),
                    Ok(()) => debug!("success from observer {}", name),
                }
                op.dec_observers();
            };
            if let Err(e) = self.spawner.spawn(call) {
                warn!("unable to spawn observer call: {}", e);
                self.dec_observers();
            }
        }
    }

    /// Fan `AddDispatchOperation` out to every matching approver.
    ///
    /// A temporary extra lock keeps the counter from draining while the
    /// fan-out is still in progress.
    fn run_approvers(self: &Arc<Self>) {
        if !self.try_inc_approvers() {
            return;
        }

        let channels = self.channels();
        let details: Vec<ChannelDetails> = channels.iter().map(|c| c.details()).collect();
        let properties = self.properties().clone();

        for client in self.registry.clients() {
            if !channels
                .iter()
                .any(|c| client.approver_matches(c.immutable_properties()))
            {
                continue;
            }
            if !self.try_inc_approvers() {
                continue;
            }

            debug!(
                "calling AddDispatchOperation on approver {} for {}",
                client.name(),
                self.unique_name
            );
            let op = Arc::clone(self);
            let proxy = client.proxy();
            let name = client.name().clone();
            let details = details.clone();
            let properties = properties.clone();
            let path = self.object_path.clone();
            let call = async move {
                let outcome = proxy.add_dispatch_operation(details, path, properties).await;
                match &outcome {
                    Err(e) => debug!("AddDispatchOperation on {} failed: {}", name, e),
                    Ok(()) => {
                        debug!("approver {} accepted {}", name, op.unique_name);
                        op.state.lock().expect("lock poisoned").awaiting_approval = true;
                    }
                }
                // If every approver fails, we behave as if none was
                // registered and keep dispatching; if at least one
                // accepted, dispatch stalls until it resolves us.
                op.dec_approvers();
            };
            if let Err(e) = self.spawner.spawn(call) {
                warn!("unable to spawn approver call: {}", e);
                self.dec_approvers();
            }
        }

        // Matches the extra lock taken at the top.
        self.dec_approvers();
    }

    /// Return true if the best still-registered handler bypasses
    /// approval.
    ///
    /// Handlers are ordered best-first and bypassing handlers sort
    /// earlier, so the first live candidate decides for everyone.
    fn handlers_can_bypass_approval(&self) -> bool {
        let possible = self.possible_handlers();
        for name in &possible {
            if let Some(handler) = self.registry.lookup(name) {
                let bypass = handler.bypass_approval();
                debug!("{} has bypass_approval={}", name, bypass);
                return bypass;
            }
        }
        // If no handler still exists we do not bypass approval, although
        // in that case we are basically doomed anyway.
        false
    }

    /// Latch approval and re-run the lock check.
    fn set_approved(self: &Arc<Self>) {
        self.state.lock().expect("lock poisoned").approved = true;
        self.check_client_locks();
    }

    /// Resolve this operation in favour of dispatch, without a bus
    /// caller.
    ///
    /// Used when a duplicate channel request effectively pre-approves the
    /// channels: if an approval phase is in flight it is terminated as if
    /// by an empty `HandleWith`, otherwise approval is simply latched.
    pub(crate) fn approve(self: &Arc<Self>) {
        debug!("{}: approve", self.unique_name);
        let (in_approval, finishing) = {
            let state = self.state.lock().expect("lock poisoned");
            (
                state.approvers_pending > 0 || state.awaiting_approval,
                state.wants_to_finish,
            )
        };
        if in_approval {
            if finishing {
                return;
            }
            self.finish();
        } else {
            self.set_approved();
        }
    }

    //
    // Handler selection and invocation.
    //

    /// Pick a handler and invoke it, or fail every remaining channel.
    ///
    /// A handler named via `HandleWith` takes precedence; otherwise the
    /// candidates are tried in their best-first order, skipping ones that
    /// already failed.  Entered with `channels_handled` already latched.
    fn run_handlers(self: &Arc<Self>) {
        let (chosen, failed, possible) = {
            let state = self.state.lock().expect("lock poisoned");
            (
                state.chosen_handler.clone(),
                state.failed_handlers.clone(),
                state.possible_handlers.clone(),
            )
        };

        // If an approver chose a handler, it's the only one we'll
        // consider...
        if let Some(short) = chosen.filter(|s| !s.is_empty()) {
            if let Ok(name) = self.config.client_name(&short) {
                let handler = self.registry.lookup(&name);
                let failed_already = failed.contains(&name);
                debug!(
                    "approved handler is {} (still exists: {}, already failed: {})",
                    name,
                    handler.is_some(),
                    failed_already
                );
                if let Some(handler) = handler {
                    if !failed_already {
                        self.handle_channels(&handler);
                        return;
                    }
                }
            }
            // ...but if it has vanished (or already failed) since they
            // chose it, recover by dispatching to *something*.
        }

        for name in &possible {
            let handler = self.registry.lookup(name);
            let failed_already = failed.contains(name);
            debug!(
                "possible handler: {} (still exists: {}, already failed: {})",
                name,
                handler.is_some(),
                failed_already
            );
            if let Some(handler) = handler {
                if !failed_already {
                    self.handle_channels(&handler);
                    return;
                }
            }
        }

        // Every usable handler vanished while we were thinking about it.
        debug!("{}: no possible handler still exists, giving up", self.unique_name);
        self.state.lock().expect("lock poisoned").outcome = Some(DispatchOutcome::NoHandlersLeft);
        for channel in self.channels() {
            channel.abort(ChannelError::handler_unavailable());
            self.channel_aborted(&channel);
        }
    }

    /// Issue `HandleChannels` to `handler`.
    fn handle_channels(self: &Arc<Self>, handler: &Arc<ClientHandle>) {
        let channels = self.channels();
        for channel in &channels {
            channel.set_status(ChannelStatus::HandlerInvoked);
        }
        let handle_with_time = self.state.lock().expect("lock poisoned").handle_with_time;

        debug!(
            "calling HandleChannels on {} for {}",
            handler.name(),
            self.unique_name
        );
        let op = Arc::clone(self);
        let client = Arc::clone(handler);
        let proxy = handler.proxy();
        let account = self.account_path();
        let details: Vec<ChannelDetails> = channels.iter().map(|c| c.details()).collect();
        let call = async move {
            let outcome = proxy
                .handle_channels(account, details, handle_with_time, PropertyMap::new())
                .await;
            op.handler_returned(&client, outcome);
        };
        if let Err(e) = self.spawner.spawn(call) {
            warn!("unable to spawn handler call: {}", e);
            self.state
                .lock()
                .expect("lock poisoned")
                .failed_handlers
                .insert(handler.name().clone());
            self.run_handlers();
        }
    }

    /// React to `HandleChannels` completing.
    fn handler_returned(
        self: &Arc<Self>,
        handler: &Arc<ClientHandle>,
        outcome: std::result::Result<(), CallError>,
    ) {
        if let Err(e) = outcome {
            debug!("handler {} failed: {}", handler.name(), e);
            self.state
                .lock()
                .expect("lock poisoned")
                .failed_handlers
                .insert(handler.name().clone());
            // Try again with the next candidate.
            self.run_handlers();
            return;
        }

        let unique = handler.unique_name();
        for channel in self.channels() {
            match &unique {
                None => {
                    // The handler replied but the bus never told us its
                    // unique name: a name-activation race.  Closing the
                    // channel at least fails visibly instead of leaking
                    // it.
                    warn!(
                        "client {} returned successfully but doesn't exist?",
                        handler.name()
                    );
                    warn!("closing channel {} as a result", channel.object_path());
                    channel.abort(ChannelError::new(
                        ChannelError::NOT_AVAILABLE,
                        "Handler's unique name is unknown",
                    ));
                    self.channel_aborted(&channel);
                }
                Some(unique) => self.set_channel_handled_by(&channel, unique.clone()),
            }
        }
        if unique.is_some() {
            self.state.lock().expect("lock poisoned").outcome =
                Some(DispatchOutcome::Handled(handler.name().clone()));
        }

        // Emit `Finished`, if we haven't already.
        self.finish();
    }

    /// Mark `channel` dispatched and record it in the handler map.
    fn set_channel_handled_by(&self, channel: &Arc<Channel>, unique: UniqueName) {
        channel.set_status(ChannelStatus::Dispatched);
        self.handler_map.set_channel_handled(channel, unique);
    }

    //
    // External control.
    //

    /// Check whether a `HandleWith(handler_name)` call is acceptable.
    fn check_handle_with(&self, handler_name: &str) -> Result<()> {
        if self.state.lock().expect("lock poisoned").wants_to_finish {
            debug!("{}: NotYours: already finished", self.unique_name);
            return Err(Error::NotYours);
        }
        if handler_name.is_empty() {
            return Ok(());
        }
        if self.config.strip_client_prefix(handler_name).is_none()
            || WellKnownName::new(handler_name).is_err()
        {
            debug!(
                "{}: InvalidArgument: handler name {:?} is bad",
                self.unique_name, handler_name
            );
            return Err(Error::InvalidHandlerName(handler_name.to_owned()));
        }
        Ok(())
    }

    /// Bus method: resolve this operation toward `handler_name`.
    ///
    /// An empty name lets the dispatcher pick from the possible handlers
    /// as usual.  A non-empty name must be a well-formed well-known name
    /// in the clients' reserved namespace.  Fails with
    /// [`Error::NotYours`] once the operation is already finishing.
    pub fn handle_with(self: &Arc<Self>, handler_name: &str) -> Result<()> {
        debug!("{}: HandleWith({:?})", self.unique_name, handler_name);
        self.check_handle_with(handler_name)?;

        {
            let mut state = self.state.lock().expect("lock poisoned");
            state.handle_with_time = unix_time_now();
            if !handler_name.is_empty() {
                state.chosen_handler = self
                    .config
                    .strip_client_prefix(handler_name)
                    .map(str::to_owned);
            }
        }
        self.finish();
        Ok(())
    }

    /// Bus method: take ownership of the channels without any handler
    /// running.
    ///
    /// The reply is delayed until the operation finishes: the returned
    /// receiver resolves once every remaining channel has been assigned
    /// to `caller` in the handler map.  Fails with [`Error::NotYours`]
    /// once the operation is already finishing — in particular, for the
    /// loser of a `Claim`/`HandleWith` race.
    pub fn claim(self: &Arc<Self>, caller: UniqueName) -> Result<oneshot::Receiver<()>> {
        let receiver = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.wants_to_finish {
                debug!("{}: giving NotYours to {}", self.unique_name, caller);
                return Err(Error::NotYours);
            }
            debug_assert!(state.claimer.is_none());
            debug!("{}: claiming on behalf of {}", self.unique_name, caller);
            state.claimer = Some(caller);
            let (tx, rx) = oneshot::channel();
            state.claim_reply = Some(tx);
            rx
        };
        self.finish();
        Ok(receiver)
    }
}

/// Collect the deduplicated satisfied-request paths across `channels`.
fn collect_satisfied_requests(channels: &[Arc<Channel>]) -> Vec<ObjectPath> {
    let mut set = std::collections::BTreeSet::new();
    for channel in channels {
        set.extend(channel.satisfied_requests());
    }
    set.into_iter().collect()
}

/// The current wall-clock time in whole seconds since the epoch.
fn unix_time_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
