//! In-process filter chains, run before a channel is dispatched.
//!
//! Filters are grouped by channel type and direction, and run in priority
//! order (lowest number first) within one chain.  They run synchronously,
//! to completion, inside the turn that admits the channel; a single
//! rejection stops the chain and fails the channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::channel::{Channel, ChannelType, Direction};

/// Priority for filters that must run before everything else.
pub const PRIORITY_CRITICAL: u32 = 0;
/// Priority for filters belonging to the daemon itself.
pub const PRIORITY_SYSTEM: u32 = 1000;
/// Priority for ordinary filters.
pub const PRIORITY_DEFAULT: u32 = 2000;
/// Priority for filters that want to see every other filter's outcome.
pub const PRIORITY_LATE: u32 = 3000;

/// What one filter decided about a channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum FilterVerdict {
    /// Let the channel continue toward dispatch.
    Accept,
    /// Drop the channel; it will be failed instead of dispatched.
    Reject,
}

/// One in-process filter hook.
pub trait ChannelFilter: Send + Sync {
    /// Inspect `channel` and decide whether dispatch may continue.
    fn run(&self, channel: &Arc<Channel>) -> FilterVerdict;
}

/// A filter together with its registration priority.
#[derive(Clone)]
struct RegisteredFilter {
    /// Position in the chain; lower runs earlier.
    priority: u32,
    /// The filter itself.
    filter: Arc<dyn ChannelFilter>,
}

/// The dispatcher's filter chains, one per `(type, direction)` pair.
#[derive(Default)]
pub struct FilterChains {
    /// The chains.  A missing entry means "no filters": accept.
    chains: Mutex<HashMap<(ChannelType, Direction), Vec<RegisteredFilter>>>,
}

impl FilterChains {
    /// Make a new, empty set of chains.
    pub fn new() -> Self {
        FilterChains::default()
    }

    /// Register `filter` for channels of `channel_type` going `direction`,
    /// at `priority`.
    ///
    /// Within one chain, filters run lowest-priority-number first; a
    /// filter registered at the same priority as an existing one runs
    /// before it.
    pub fn register(
        &self,
        filter: Arc<dyn ChannelFilter>,
        channel_type: ChannelType,
        direction: Direction,
        priority: u32,
    ) {
        let mut chains = self.chains.lock().expect("lock poisoned");
        let chain = chains.entry((channel_type, direction)).or_default();
        let at = chain
            .iter()
            .position(|f| f.priority >= priority)
            .unwrap_or(chain.len());
        chain.insert(at, RegisteredFilter { priority, filter });
    }

    /// Register several `(filter, priority)` pairs at once.
    pub fn register_batch(
        &self,
        filters: impl IntoIterator<Item = (Arc<dyn ChannelFilter>, u32)>,
        channel_type: ChannelType,
        direction: Direction,
    ) {
        for (filter, priority) in filters {
            self.register(filter, channel_type.clone(), direction, priority);
        }
    }

    /// Remove every registration of `filter` from the chain for
    /// `(channel_type, direction)`.
    ///
    /// Filters are compared by identity.  When the chain becomes empty its
    /// entry is dropped.
    pub fn unregister(
        &self,
        filter: &Arc<dyn ChannelFilter>,
        channel_type: &ChannelType,
        direction: Direction,
    ) {
        let mut chains = self.chains.lock().expect("lock poisoned");
        let key = (channel_type.clone(), direction);
        if let Some(chain) = chains.get_mut(&key) {
            chain.retain(|f| !Arc::ptr_eq(&f.filter, filter));
            if chain.is_empty() {
                chains.remove(&key);
            }
        } else {
            debug!(
                "no filter chain for {}/{} to unregister from",
                channel_type, direction
            );
        }
    }

    /// Run the chain matching `channel` and return the combined verdict.
    ///
    /// An empty (or missing) chain accepts.
    pub fn run(&self, channel: &Arc<Channel>) -> FilterVerdict {
        let chain = {
            let chains = self.chains.lock().expect("lock poisoned");
            match chains.get(&(channel.channel_type().clone(), channel.direction())) {
                None => {
                    debug!(
                        "no filters for {}/{}",
                        channel.channel_type(),
                        channel.direction()
                    );
                    return FilterVerdict::Accept;
                }
                Some(chain) => chain.clone(),
            }
        };
        for registered in &chain {
            if registered.filter.run(channel) == FilterVerdict::Reject {
                debug!(
                    "filter at priority {} rejected channel {}",
                    registered.priority,
                    channel.object_path()
                );
                return FilterVerdict::Reject;
            }
        }
        FilterVerdict::Accept
    }
}

impl std::fmt::Debug for FilterChains {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let chains = self.chains.lock().expect("lock poisoned");
        f.debug_struct("FilterChains")
            .field("chains", &chains.len())
            .finish_non_exhaustive()
    }
}
