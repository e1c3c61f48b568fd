//! The account-storage plug-in API.
//!
//! Account parameters live outside the dispatcher core: backends register
//! an [`AccountStorage`] implementation with the [`StorageRegistry`], and
//! the account manager consults them in priority order.  Only the
//! interface is defined here; actual backends (keyrings, config files)
//! are plug-ins.

use std::sync::{Arc, Mutex};

use educe::Educe;
use futures::{Stream, StreamExt};
use postage::broadcast;
use postage::sink::Sink as _;
use tracing::{debug, trace};

use switchboard_bus::{PropertyMap, Value};

/// Priority of the default (always-available) storage backend.
pub const PRIORITY_DEFAULT: i32 = 0;
/// Priority at and above which backends hold secrets (keyrings).
pub const PRIORITY_KEYRING: i32 = 10_000;
/// Priority below which backends are read-only providers.
pub const PRIORITY_READONLY: i32 = -1;

/// How many storage events we keep buffered for slow subscribers.
const EVENT_BUFFER: usize = 64;

/// What an account-storage backend will not let the user change.
///
/// Capability flags, not subtypes: a backend may restrict any
/// combination.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct StorageRestrictions {
    /// Account parameters cannot be changed.
    pub cannot_set_parameters: bool,
    /// The account cannot be enabled or disabled.
    pub cannot_set_enabled: bool,
    /// The requested presence cannot be changed.
    pub cannot_set_presence: bool,
    /// The service tag cannot be changed.
    pub cannot_set_service: bool,
}

/// A change reported by an account-storage backend.
///
/// `Altered` means "re-read everything about this account";
/// `AlteredOne` names the single setting that changed.  They are distinct
/// events with distinct payloads.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum StorageEvent {
    /// A new account appeared in a backend.
    Created {
        /// The account's name.
        account: String,
    },
    /// An account changed in some unspecified way.
    Altered {
        /// The account's name.
        account: String,
    },
    /// One setting of an account changed.
    AlteredOne {
        /// The account's name.
        account: String,
        /// The setting that changed.
        key: String,
    },
    /// An account was enabled or disabled behind our back.
    Toggled {
        /// The account's name.
        account: String,
        /// The new enabled state.
        enabled: bool,
    },
    /// An account disappeared from a backend.
    Deleted {
        /// The account's name.
        account: String,
    },
}

/// An account-parameter storage backend.
///
/// Backends are consulted in descending [`priority`](Self::priority)
/// order; the first backend that answers wins.  All methods are
/// synchronous: backends are expected to keep a cache and write behind on
/// [`commit`](Self::commit).
pub trait AccountStorage: Send + Sync {
    /// A short name for this backend, used in log messages.
    fn name(&self) -> &str;

    /// A human-readable description of this backend.
    fn description(&self) -> &str {
        ""
    }

    /// The bus name of the backend's provider, if any.
    fn provider(&self) -> &str {
        ""
    }

    /// Where this backend sorts among its peers.  Higher wins.
    fn priority(&self) -> i32 {
        PRIORITY_DEFAULT
    }

    /// Look up one setting of `account`.
    fn get(&self, account: &str, key: &str) -> Option<Value>;

    /// Store one setting of `account`.
    ///
    /// Returns false if this backend does not accept the account, in
    /// which case lower-priority backends are offered the write.
    fn set(&self, account: &str, key: &str, value: Value) -> bool;

    /// Delete one setting of `account`, or the whole account if `key` is
    /// `None`.  Returns false if this backend holds nothing to delete.
    fn delete(&self, account: &str, key: Option<&str>) -> bool;

    /// Flush every pending write.  Returns false if nothing could be
    /// committed.
    fn commit(&self) -> bool {
        false
    }

    /// Flush pending writes for one account.
    ///
    /// The default asks the backend to commit everything.
    fn commit_one(&self, _account: &str) -> bool {
        self.commit()
    }

    /// List the accounts this backend knows about.
    fn list(&self) -> Vec<String>;

    /// Called once the account manager is ready for change events.
    fn ready(&self) {}

    /// A backend-specific stable identifier for `account`, if any.
    fn identifier(&self, _account: &str) -> Option<String> {
        None
    }

    /// Backend-specific metadata about `account`.
    fn additional_info(&self, _account: &str) -> PropertyMap {
        PropertyMap::new()
    }

    /// What this backend will not let the user change about `account`.
    fn restrictions(&self, _account: &str) -> StorageRestrictions {
        StorageRestrictions::default()
    }
}

/// A stream of [`StorageEvent`]s from every registered backend.
#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct StorageEvents {
    /// The receiver that implements this stream.
    #[educe(Debug(ignore))]
    inner: broadcast::Receiver<StorageEvent>,
}

impl Stream for StorageEvents {
    type Item = StorageEvent;
    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// The ordered collection of account-storage backends.
pub struct StorageRegistry {
    /// The backends, sorted by descending priority.
    plugins: Mutex<Vec<Arc<dyn AccountStorage>>>,
    /// Sender half of the event stream.
    events_tx: Mutex<broadcast::Sender<StorageEvent>>,
    /// Receiver kept to clone for subscribers.
    events_rx: broadcast::Receiver<StorageEvent>,
}

impl StorageRegistry {
    /// Make a new, empty storage registry.
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = broadcast::channel(EVENT_BUFFER);
        Arc::new(StorageRegistry {
            plugins: Mutex::new(Vec::new()),
            events_tx: Mutex::new(events_tx),
            events_rx,
        })
    }

    /// Add `plugin`, keeping the collection sorted by descending
    /// priority.  Backends registered earlier win ties.
    pub fn add_plugin(&self, plugin: Arc<dyn AccountStorage>) {
        debug!(
            "registering account storage {} (priority {})",
            plugin.name(),
            plugin.priority()
        );
        let mut plugins = self.plugins.lock().expect("lock poisoned");
        let at = plugins
            .iter()
            .position(|p| p.priority() < plugin.priority())
            .unwrap_or(plugins.len());
        plugins.insert(at, plugin);
    }

    /// Return a snapshot of the backends, best first.
    pub fn plugins(&self) -> Vec<Arc<dyn AccountStorage>> {
        self.plugins.lock().expect("lock poisoned").clone()
    }

    /// Look up one setting of `account` in the best backend that has it.
    pub fn get(&self, account: &str, key: &str) -> Option<Value> {
        self.plugins()
            .iter()
            .find_map(|p| p.get(account, key))
    }

    /// Store one setting of `account` in the best backend that accepts
    /// it, and announce the change.
    ///
    /// Returns false if no backend accepted the write.
    pub fn set(&self, account: &str, key: &str, value: Value) -> bool {
        for plugin in self.plugins() {
            if plugin.set(account, key, value.clone()) {
                trace!("{} accepted {}/{}", plugin.name(), account, key);
                self.announce(StorageEvent::AlteredOne {
                    account: account.to_owned(),
                    key: key.to_owned(),
                });
                return true;
            }
        }
        false
    }

    /// Delete a setting (or, with `key` `None`, the whole account) from
    /// every backend holding it, and announce the change.
    pub fn delete(&self, account: &str, key: Option<&str>) -> bool {
        let mut deleted = false;
        for plugin in self.plugins() {
            deleted |= plugin.delete(account, key);
        }
        if deleted {
            self.announce(match key {
                Some(key) => StorageEvent::AlteredOne {
                    account: account.to_owned(),
                    key: key.to_owned(),
                },
                None => StorageEvent::Deleted {
                    account: account.to_owned(),
                },
            });
        }
        deleted
    }

    /// Flush pending writes in every backend.
    pub fn commit(&self) -> bool {
        let mut committed = false;
        for plugin in self.plugins() {
            committed |= plugin.commit();
        }
        committed
    }

    /// List every account known to any backend, deduplicated, best
    /// backend first.
    pub fn list(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        for plugin in self.plugins() {
            for account in plugin.list() {
                if seen.insert(account.clone()) {
                    out.push(account);
                }
            }
        }
        out
    }

    /// Tell every backend the account manager is ready.
    pub fn ready(&self) {
        for plugin in self.plugins() {
            plugin.ready();
        }
    }

    /// Return a new subscription to storage change events.
    pub fn events(&self) -> StorageEvents {
        StorageEvents {
            inner: self.events_rx.clone(),
        }
    }

    /// Broadcast `event` to every subscriber.
    ///
    /// Backends call this to report changes that happened behind the
    /// account manager's back.
    pub fn announce(&self, event: StorageEvent) {
        let mut sender = self.events_tx.lock().expect("lock poisoned");
        if let Err(e) = sender.try_send(event) {
            trace!("dropping storage event: {:?}", e);
        }
    }
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("plugins", &self.plugins().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use futures::FutureExt;
    use std::collections::HashMap;

    /// A backend over a plain in-memory map.
    struct MapStorage {
        name: &'static str,
        priority: i32,
        accept: bool,
        data: Mutex<HashMap<(String, String), Value>>,
    }

    impl MapStorage {
        fn new(name: &'static str, priority: i32, accept: bool) -> Arc<Self> {
            Arc::new(MapStorage {
                name,
                priority,
                accept,
                data: Mutex::new(HashMap::new()),
            })
        }

        fn preload(&self, account: &str, key: &str, value: Value) {
            self.data
                .lock()
                .unwrap()
                .insert((account.to_owned(), key.to_owned()), value);
        }
    }

    impl AccountStorage for MapStorage {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn get(&self, account: &str, key: &str) -> Option<Value> {
            self.data
                .lock()
                .unwrap()
                .get(&(account.to_owned(), key.to_owned()))
                .cloned()
        }
        fn set(&self, account: &str, key: &str, value: Value) -> bool {
            if !self.accept {
                return false;
            }
            self.data
                .lock()
                .unwrap()
                .insert((account.to_owned(), key.to_owned()), value);
            true
        }
        fn delete(&self, account: &str, key: Option<&str>) -> bool {
            let mut data = self.data.lock().unwrap();
            let before = data.len();
            match key {
                Some(key) => {
                    data.remove(&(account.to_owned(), key.to_owned()));
                }
                None => data.retain(|(a, _), _| a != account),
            }
            data.len() != before
        }
        fn list(&self) -> Vec<String> {
            let mut accounts: Vec<String> = self
                .data
                .lock()
                .unwrap()
                .keys()
                .map(|(a, _)| a.clone())
                .collect();
            accounts.sort();
            accounts.dedup();
            accounts
        }
    }

    #[test]
    fn higher_priority_wins_reads() {
        let registry = StorageRegistry::new();
        let keyring = MapStorage::new("keyring", PRIORITY_KEYRING, true);
        let default = MapStorage::new("default", PRIORITY_DEFAULT, true);
        keyring.preload("alice", "password", "sekrit".into());
        default.preload("alice", "password", "stale".into());
        registry.add_plugin(default);
        registry.add_plugin(keyring);

        assert_eq!(registry.get("alice", "password"), Some("sekrit".into()));
        assert_eq!(
            registry.plugins()[0].name(),
            "keyring",
            "plugins must be sorted best-first"
        );
    }

    #[test]
    fn writes_fall_through_to_an_accepting_backend() {
        let registry = StorageRegistry::new();
        registry.add_plugin(MapStorage::new("readonly", PRIORITY_KEYRING, false));
        let fallback = MapStorage::new("fallback", PRIORITY_DEFAULT, true);
        registry.add_plugin(Arc::clone(&fallback) as Arc<dyn AccountStorage>);

        assert!(registry.set("bob", "nick", "bobby".into()));
        assert_eq!(fallback.get("bob", "nick"), Some("bobby".into()));
    }

    #[test]
    fn no_backend_accepting_fails_the_write() {
        let registry = StorageRegistry::new();
        registry.add_plugin(MapStorage::new("readonly", PRIORITY_READONLY, false));
        assert!(!registry.set("bob", "nick", "bobby".into()));
    }

    #[test]
    fn list_unions_and_deduplicates() {
        let registry = StorageRegistry::new();
        let a = MapStorage::new("a", 5, true);
        let b = MapStorage::new("b", 1, true);
        a.preload("alice", "k", "v".into());
        a.preload("bob", "k", "v".into());
        b.preload("bob", "k", "v".into());
        b.preload("carol", "k", "v".into());
        registry.add_plugin(a);
        registry.add_plugin(b);

        assert_eq!(registry.list(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn altered_and_altered_one_are_distinct() {
        let registry = StorageRegistry::new();
        registry.add_plugin(MapStorage::new("m", 0, true));
        let mut events = registry.events();

        registry.set("alice", "nick", "al".into());
        registry.announce(StorageEvent::Altered {
            account: "alice".to_owned(),
        });
        registry.delete("alice", None);

        let ev1 = events.next().now_or_never().unwrap().unwrap();
        assert_eq!(
            ev1,
            StorageEvent::AlteredOne {
                account: "alice".to_owned(),
                key: "nick".to_owned()
            }
        );
        let ev2 = events.next().now_or_never().unwrap().unwrap();
        assert_eq!(
            ev2,
            StorageEvent::Altered {
                account: "alice".to_owned()
            }
        );
        let ev3 = events.next().now_or_never().unwrap().unwrap();
        assert_eq!(
            ev3,
            StorageEvent::Deleted {
                account: "alice".to_owned()
            }
        );
    }
}
