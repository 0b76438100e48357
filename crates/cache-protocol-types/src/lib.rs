//! Wire protocol types for the cache service.
//!
//! This crate provides:
//! - [`Value`], the native value model for command arguments and replies
//! - Buffer-aware marshaling between [`Value`] and JSON
//! - Request, response, batch and authentication message shapes
//! - The [`TransportFrame`] envelope used on the WebSocket wire
//!
//! Nothing here performs I/O.

mod marshal;
mod messages;
mod value;

pub use marshal::{
    marshal, marshal_args, try_marshal_args, unmarshal, MarshalError, MarshalResult,
};
pub use messages::{
    actions, events, AuthRequest, BatchEntry, BatchReply, CommandRequest, CommandResponse,
    NetworkAddresses, TransportFrame,
};
pub use value::Value;
