#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// Standard lint list, kept in sync across the workspace.
#![allow(renamed_and_removed_lints)]
#![allow(unknown_lints)]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]

pub mod bus;
mod channel;
mod config;
mod dispatcher;
mod err;
mod event;
mod filters;
mod handler_map;
mod operation;
mod registry;
pub mod storage;
#[cfg(test)]
mod testing;

pub use channel::{
    Channel, ChannelBuilder, ChannelDetails, ChannelStatus, ChannelStatusEvents, ChannelType,
    Direction, PROP_CHANNEL_TYPE, PROP_REQUESTED,
};
pub use config::DispatchConfig;
pub use dispatcher::Dispatcher;
pub use err::{ChannelError, Error};
pub use event::{DispatchEvent, DispatchEvents};
pub use filters::{
    ChannelFilter, FilterChains, FilterVerdict, PRIORITY_CRITICAL, PRIORITY_DEFAULT, PRIORITY_LATE,
    PRIORITY_SYSTEM,
};
pub use handler_map::HandlerMap;
pub use operation::{DispatchOperation, DispatchOutcome};
pub use registry::{
    CallError, ClientBuilder, ClientHandle, ClientProxy, ClientRegistry, ClientRoles, Filter,
};

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;
