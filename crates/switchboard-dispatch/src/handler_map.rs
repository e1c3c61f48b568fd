//! Record of which endpoint currently owns which channel.
//!
//! The handler map outlives any single dispatch operation: entries are
//! created when a handler accepts a channel (or a claimer takes it) and
//! removed when the channel aborts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::task::{Spawn, SpawnExt};
use futures::StreamExt;
use tracing::{debug, warn};

use switchboard_bus::{ObjectPath, UniqueName};

use crate::channel::{Channel, ChannelStatus};

/// What we remember about one handled channel.
#[derive(Debug, Clone)]
struct HandledEntry {
    /// The unique name of the endpoint handling the channel.
    handler: UniqueName,
    /// The account the channel belonged to, if known.
    account: Option<ObjectPath>,
}

/// The process-wide map from active channel to handling endpoint.
pub struct HandlerMap {
    /// Task spawner used for the per-entry abort watchers.
    spawner: Arc<dyn Spawn + Send + Sync>,
    /// The entries, by channel path.
    inner: Mutex<HashMap<ObjectPath, HandledEntry>>,
}

impl HandlerMap {
    /// Make a new, empty handler map.
    pub fn new(spawner: Arc<dyn Spawn + Send + Sync>) -> Arc<Self> {
        Arc::new(HandlerMap {
            spawner,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Record that `channel` is now handled by the endpoint with unique
    /// name `handler`.
    ///
    /// The entry is removed again, automatically, when the channel
    /// aborts.
    pub fn set_channel_handled(self: &Arc<Self>, channel: &Arc<Channel>, handler: UniqueName) {
        let path = channel.object_path().clone();
        debug!("channel {} handled by {}", path, handler);
        let replaced = self
            .inner
            .lock()
            .expect("lock poisoned")
            .insert(
                path.clone(),
                HandledEntry {
                    handler,
                    account: channel.account().cloned(),
                },
            )
            .is_some();
        if replaced {
            // The previous entry's watcher is still alive and will fire on
            // the same abort, so don't spawn a second one.
            return;
        }

        let map = Arc::clone(self);
        let chan = Arc::clone(channel);
        let watcher = async move {
            let mut events = chan.status_events();
            while let Some(status) = events.next().await {
                if status == ChannelStatus::Aborted {
                    map.remove(chan.object_path());
                    break;
                }
            }
        };
        if let Err(e) = self.spawner.spawn(watcher) {
            // Without the watcher the entry would never be cleaned up;
            // take it out now rather than leak it.
            warn!("unable to spawn handler-map watcher: {}", e);
            self.remove(&path);
        }
    }

    /// Forget the entry for the channel at `path`.
    fn remove(&self, path: &ObjectPath) {
        if self
            .inner
            .lock()
            .expect("lock poisoned")
            .remove(path)
            .is_some()
        {
            debug!("channel {} no longer handled", path);
        }
    }

    /// Return the unique name handling the channel at `path`, if any.
    pub fn handler_of(&self, path: &ObjectPath) -> Option<UniqueName> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .get(path)
            .map(|ent| ent.handler.clone())
    }

    /// Return the account recorded for the channel at `path`, if any.
    pub fn account_of(&self, path: &ObjectPath) -> Option<ObjectPath> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .get(path)
            .and_then(|ent| ent.account.clone())
    }

    /// Return true if the endpoint with unique name `handler` is
    /// currently handling anything.
    pub fn is_handling(&self, handler: &UniqueName) -> bool {
        self.inner
            .lock()
            .expect("lock poisoned")
            .values()
            .any(|ent| &ent.handler == handler)
    }

    /// Return the number of handled channels.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").len()
    }

    /// Return true if no channels are currently handled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandlerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerMap")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
