//! TwinLink reconciliation and dispatch engine
//!
//! The reusable core shared by the device agent and the hub:
//! - Writable property reconciliation with bounded numeric setpoints
//! - Inbound command dispatch to typed handlers
//! - Outbound command issuing with deadline-bound reply correlation
//!
//! The engine consumes and produces plain data; transports and twin
//! storage live outside it.

pub mod dispatch;
pub mod error;
pub mod outbound;
pub mod reconcile;

pub use dispatch::{CommandDispatcher, DispatchReply};
pub use error::TwinError;
pub use outbound::{CommandClient, CommandReply, CommandSink, OutboundCommand, ReplyStatus};
pub use reconcile::{
    AckOutcome, Bounds, PropertyHandler, PropertyRouter, ReconcileAck, SetpointReconciler,
    SetpointSink, WriteRequest,
};
