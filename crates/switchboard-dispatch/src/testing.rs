//! Helpers shared by this crate's tests: fake clients, a recording bus,
//! and a deterministic single-threaded executor.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::executor::LocalPool;
use futures::task::{FutureObj, LocalSpawn, LocalSpawnExt, Spawn, SpawnError};
use futures::StreamExt;

use switchboard_bus::{ObjectPath, PropertyMap};

use crate::bus::{Bus, BusUnavailable};
use crate::channel::ChannelDetails;
use crate::err::ChannelError;
use crate::operation::DispatchOperation;
use crate::registry::{CallError, ClientProxy};

/// A single-threaded executor whose spawner is `Send + Sync`.
///
/// The dispatcher wants an `Arc<dyn Spawn + Send + Sync>`, but
/// `LocalPool`'s own spawner is thread-bound; so we hand out a forwarding
/// spawner that queues `FutureObj`s over a channel, and a pump task on
/// the pool spawns whatever arrives.  Everything still runs on one
/// thread, so `run_until_stalled` makes each test's interleaving
/// deterministic.
pub(crate) struct TestExecutor {
    /// The pool that actually runs everything.
    pool: LocalPool,
    /// The forwarding spawner handed to the code under test.
    spawner: Arc<ForwardSpawner>,
}

/// The `Send + Sync` face of a [`TestExecutor`].
struct ForwardSpawner {
    /// Queue feeding the pump task on the pool.
    tx: mpsc::UnboundedSender<FutureObj<'static, ()>>,
}

impl Spawn for ForwardSpawner {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        self.tx
            .unbounded_send(future)
            .map_err(|_| SpawnError::shutdown())
    }
}

impl TestExecutor {
    /// Make a new executor with its pump task already running.
    pub(crate) fn new() -> Self {
        let pool = LocalPool::new();
        let (tx, mut rx) = mpsc::unbounded::<FutureObj<'static, ()>>();
        let pump_spawner = pool.spawner();
        pool.spawner()
            .spawn_local(async move {
                while let Some(fut) = rx.next().await {
                    let _ = pump_spawner.spawn_local_obj(fut.into());
                }
            })
            .expect("spawning pump task");
        TestExecutor {
            pool,
            spawner: Arc::new(ForwardSpawner { tx }),
        }
    }

    /// Return the spawner to hand to the code under test.
    pub(crate) fn spawner(&self) -> Arc<dyn Spawn + Send + Sync> {
        Arc::clone(&self.spawner) as Arc<dyn Spawn + Send + Sync>
    }

    /// Run every runnable task to quiescence.
    pub(crate) fn run_until_stalled(&mut self) {
        self.pool.run_until_stalled();
    }
}

/// A proxy whose calls all succeed immediately and record nothing.
pub(crate) struct NullProxy;

#[async_trait]
impl ClientProxy for NullProxy {
    async fn observe_channels(
        &self,
        _account: ObjectPath,
        _connection: ObjectPath,
        _channels: Vec<ChannelDetails>,
        _dispatch_operation: ObjectPath,
        _satisfied_requests: Vec<ObjectPath>,
        _info: PropertyMap,
    ) -> Result<(), CallError> {
        Ok(())
    }
    async fn add_dispatch_operation(
        &self,
        _channels: Vec<ChannelDetails>,
        _dispatch_operation: ObjectPath,
        _properties: PropertyMap,
    ) -> Result<(), CallError> {
        Ok(())
    }
    async fn handle_channels(
        &self,
        _account: ObjectPath,
        _channels: Vec<ChannelDetails>,
        _handle_with_time: i64,
        _info: PropertyMap,
    ) -> Result<(), CallError> {
        Ok(())
    }
}

/// One out-call as seen by a [`FakeProxy`].
#[derive(Debug, Clone)]
pub(crate) struct CallRecord {
    /// The well-known name of the client that was called.
    pub(crate) client: String,
    /// Which method was called.
    pub(crate) method: &'static str,
    /// The dispatch-operation path argument (root when not applicable).
    pub(crate) operation: ObjectPath,
    /// The channel paths passed to the call.
    pub(crate) channels: Vec<ObjectPath>,
    /// The satisfied-request paths (observers only).
    pub(crate) satisfied: Vec<ObjectPath>,
    /// The `handle_with_time` argument (handlers only).
    pub(crate) handle_with_time: i64,
}

/// A log of calls, shared between every fake proxy in one test.
pub(crate) type CallLog = Arc<Mutex<Vec<CallRecord>>>;

/// Make a new, empty call log.
pub(crate) fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Count how many calls to `method` reached `client`.
pub(crate) fn calls_to(log: &CallLog, client: &str, method: &str) -> usize {
    log.lock()
        .expect("lock poisoned")
        .iter()
        .filter(|r| r.client == client && r.method == method)
        .count()
}

/// How a scripted call should complete.
pub(crate) enum Reply {
    /// Complete immediately with this result.
    Now(Result<(), CallError>),
    /// Complete when the test sends on the paired channel.
    Wait(oneshot::Receiver<Result<(), CallError>>),
}

/// A scriptable client proxy that records every call.
///
/// Calls complete with `Ok(())` unless a reply has been scripted for the
/// method via [`FakeProxy::fail_next`] or [`FakeProxy::delay_next`].
pub(crate) struct FakeProxy {
    /// The client name recorded with each call.
    name: String,
    /// Where calls are recorded.
    log: CallLog,
    /// Scripted replies, consumed in order per method.
    scripted: Mutex<HashMap<&'static str, VecDeque<Reply>>>,
}

/// Method name of `ObserveChannels`, as recorded in the call log.
pub(crate) const OBSERVE_CHANNELS: &str = "ObserveChannels";
/// Method name of `AddDispatchOperation`, as recorded in the call log.
pub(crate) const ADD_DISPATCH_OPERATION: &str = "AddDispatchOperation";
/// Method name of `HandleChannels`, as recorded in the call log.
pub(crate) const HANDLE_CHANNELS: &str = "HandleChannels";

impl FakeProxy {
    /// Make a new fake proxy recording into `log` as `name`.
    pub(crate) fn new(name: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(FakeProxy {
            name: name.to_owned(),
            log: Arc::clone(log),
            scripted: Mutex::new(HashMap::new()),
        })
    }

    /// Script the next call to `method` to fail immediately.
    pub(crate) fn fail_next(&self, method: &'static str) {
        self.script(
            method,
            Reply::Now(Err(CallError::Failed("scripted failure".to_owned()))),
        );
    }

    /// Script the next call to `method` to stall until the returned
    /// sender fires.
    pub(crate) fn delay_next(
        &self,
        method: &'static str,
    ) -> oneshot::Sender<Result<(), CallError>> {
        let (tx, rx) = oneshot::channel();
        self.script(method, Reply::Wait(rx));
        tx
    }

    /// Append `reply` to the script for `method`.
    fn script(&self, method: &'static str, reply: Reply) {
        self.scripted
            .lock()
            .expect("lock poisoned")
            .entry(method)
            .or_default()
            .push_back(reply);
    }

    /// Record one call and complete it per the script.
    async fn call(&self, record: CallRecord) -> Result<(), CallError> {
        let method = record.method;
        self.log.lock().expect("lock poisoned").push(record);
        let reply = self
            .scripted
            .lock()
            .expect("lock poisoned")
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        match reply {
            None => Ok(()),
            Some(Reply::Now(result)) => result,
            Some(Reply::Wait(rx)) => rx.await.unwrap_or(Err(CallError::Gone)),
        }
    }
}

#[async_trait]
impl ClientProxy for FakeProxy {
    async fn observe_channels(
        &self,
        _account: ObjectPath,
        _connection: ObjectPath,
        channels: Vec<ChannelDetails>,
        dispatch_operation: ObjectPath,
        satisfied_requests: Vec<ObjectPath>,
        _info: PropertyMap,
    ) -> Result<(), CallError> {
        self.call(CallRecord {
            client: self.name.clone(),
            method: OBSERVE_CHANNELS,
            operation: dispatch_operation,
            channels: channels.into_iter().map(|d| d.path).collect(),
            satisfied: satisfied_requests,
            handle_with_time: 0,
        })
        .await
    }

    async fn add_dispatch_operation(
        &self,
        channels: Vec<ChannelDetails>,
        dispatch_operation: ObjectPath,
        _properties: PropertyMap,
    ) -> Result<(), CallError> {
        self.call(CallRecord {
            client: self.name.clone(),
            method: ADD_DISPATCH_OPERATION,
            operation: dispatch_operation,
            channels: channels.into_iter().map(|d| d.path).collect(),
            satisfied: Vec::new(),
            handle_with_time: 0,
        })
        .await
    }

    async fn handle_channels(
        &self,
        _account: ObjectPath,
        channels: Vec<ChannelDetails>,
        handle_with_time: i64,
        _info: PropertyMap,
    ) -> Result<(), CallError> {
        self.call(CallRecord {
            client: self.name.clone(),
            method: HANDLE_CHANNELS,
            operation: ObjectPath::root(),
            channels: channels.into_iter().map(|d| d.path).collect(),
            satisfied: Vec::new(),
            handle_with_time,
        })
        .await
    }
}

/// One thing the core asked the bus to do.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BusRecord {
    /// An operation was exported.
    Published(ObjectPath),
    /// An operation was withdrawn.
    Retracted(ObjectPath),
    /// `ChannelLost` was emitted.
    ChannelLost {
        /// The operation the signal was emitted on.
        operation: ObjectPath,
        /// The lost channel.
        channel: ObjectPath,
        /// The error name carried by the signal.
        error_name: String,
    },
    /// `Finished` was emitted.
    Finished(ObjectPath),
}

/// A [`Bus`] that records everything and always succeeds.
pub(crate) struct RecordingBus {
    /// Everything the core asked of us, in order.
    records: Mutex<Vec<BusRecord>>,
}

impl RecordingBus {
    /// Make a new recording bus.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RecordingBus {
            records: Mutex::new(Vec::new()),
        })
    }

    /// Return everything recorded so far, in order.
    pub(crate) fn records(&self) -> Vec<BusRecord> {
        self.records.lock().expect("lock poisoned").clone()
    }

    /// Return the signals (`ChannelLost` and `Finished`) recorded for
    /// `operation`, in order.
    pub(crate) fn signals_for(&self, operation: &ObjectPath) -> Vec<BusRecord> {
        self.records()
            .into_iter()
            .filter(|r| match r {
                BusRecord::ChannelLost { operation: op, .. } => op == operation,
                BusRecord::Finished(op) => op == operation,
                _ => false,
            })
            .collect()
    }
}

impl Bus for RecordingBus {
    fn publish_operation(&self, operation: &Arc<DispatchOperation>) -> Result<(), BusUnavailable> {
        self.records
            .lock()
            .expect("lock poisoned")
            .push(BusRecord::Published(operation.object_path().clone()));
        Ok(())
    }
    fn retract_operation(&self, path: &ObjectPath) {
        self.records
            .lock()
            .expect("lock poisoned")
            .push(BusRecord::Retracted(path.clone()));
    }
    fn emit_channel_lost(
        &self,
        operation: &ObjectPath,
        channel: &ObjectPath,
        error: &ChannelError,
    ) {
        self.records
            .lock()
            .expect("lock poisoned")
            .push(BusRecord::ChannelLost {
                operation: operation.clone(),
                channel: channel.clone(),
                error_name: error.name().to_owned(),
            });
    }
    fn emit_finished(&self, operation: &ObjectPath) {
        self.records
            .lock()
            .expect("lock poisoned")
            .push(BusRecord::Finished(operation.clone()));
    }
}
