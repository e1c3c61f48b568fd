//! The bus surface of the dispatcher.
//!
//! The dispatcher core never touches the wire.  Whatever bus glue the
//! daemon links in implements [`Bus`]; the core calls it to export
//! dispatch operations and to emit their two signals.  Calls arriving
//! *from* the bus (`HandleWith`, `Claim`, property reads) are forwarded by
//! the glue to the methods on
//! [`DispatchOperation`](crate::DispatchOperation) directly.

use std::sync::Arc;

use thiserror::Error;

use switchboard_bus::ObjectPath;

use crate::err::ChannelError;
use crate::operation::DispatchOperation;

/// The interface name under which dispatch operations are exported.
pub const DISPATCH_OPERATION_INTERFACE: &str = "org.switchboard.DispatchOperation";

/// Error: the process's bus connection is not available.
///
/// This happens during graceful shutdown, when the daemon has fallen off
/// the bus but channels are still draining.  Dispatch carries on
/// in-process; only external visibility is lost.
#[derive(Debug, Clone, Error)]
#[error("message bus connection unavailable")]
#[non_exhaustive]
pub struct BusUnavailable;

/// How the dispatcher core talks to the process's bus connection.
pub trait Bus: Send + Sync {
    /// Export `operation` at its object path.
    ///
    /// On failure the operation stays reachable in-process and dispatch
    /// continues without it ever appearing on the bus.
    fn publish_operation(&self, operation: &Arc<DispatchOperation>) -> Result<(), BusUnavailable>;

    /// Withdraw the object at `path` from the bus.
    ///
    /// Called once the operation has finished.  Must be harmless for
    /// paths that were never published.
    fn retract_operation(&self, path: &ObjectPath);

    /// Emit `ChannelLost(channel, error-name, error-message)` on the
    /// operation exported at `operation`.
    fn emit_channel_lost(&self, operation: &ObjectPath, channel: &ObjectPath, error: &ChannelError);

    /// Emit `Finished` on the operation exported at `operation`.
    ///
    /// This is always the last signal emitted for any one operation.
    fn emit_finished(&self, operation: &ObjectPath);
}

/// A [`Bus`] for daemons running without a bus connection.
///
/// Publication fails (so operations stay in-process, exactly as during a
/// graceful shutdown) and signals go nowhere.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct OfflineBus;

impl Bus for OfflineBus {
    fn publish_operation(&self, _operation: &Arc<DispatchOperation>) -> Result<(), BusUnavailable> {
        Err(BusUnavailable)
    }
    fn retract_operation(&self, _path: &ObjectPath) {}
    fn emit_channel_lost(
        &self,
        _operation: &ObjectPath,
        _channel: &ObjectPath,
        _error: &ChannelError,
    ) {
    }
    fn emit_finished(&self, _operation: &ObjectPath) {}
}
