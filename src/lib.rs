// Copyright 2020 Joyent, Inc.

//! Remote object invocation over the Fast protocol.
//!
//! A caller holds a [`Proxy`] for an interface and invokes methods on it; the
//! call travels to a server where a [`Dispatcher`] routes it to the target
//! object and sends back exactly one outcome, a value or a fault. Remote
//! objects are named by URL-shaped [`Handle`]s that can be stored, passed
//! around inside call arguments and results, and resolved to a proxy on
//! first use. A [`NamingResolver`] walks a server's naming nodes to find
//! handles by path.
//!
//! Wire format
//!
//! Every connection carries a single call. The client writes a text
//! preamble, `FAST/1 <path>[?id=<objectId>]` followed by `Name: value`
//! attribute lines and a blank line, and then one Fast message:
//!
//! * VERSION   1-byte integer.  The only supported value is "1".
//!
//! * TYPE      1-byte integer.  The only supported value is TYPE_JSON (0x1),
//!           indicating that the data payload is an encoded JSON object.
//!
//! * STATUS    1-byte integer.  The only supported values are:
//!
//!     * STATUS_DATA  0x1  a call, or a value reply
//!
//!     * STATUS_END   0x2  end of the reply stream
//!
//!     * STATUS_ERROR 0x3  a fault reply
//!
//! * MSGID1...MSGID4    4-byte big-endian unsigned integer, a unique identifier
//!                    for this message
//!
//! * CRC1...CRC4        4-byte big-endian unsigned integer representing the CRC16
//!                     value of the data payload
//!
//! * DLEN0...DLEN4      4-byte big-endian unsigned integer representing the number
//!                    of bytes of data payload that follow
//!
//! * DATA0...DATAN      `{"m": {"uts": ..., "name": <method>}, "d": <payload>}`.
//!                    A call's payload is the argument array, a value reply's
//!                    is `[value]` and a fault's is
//!                    `{"name", "message", "detail", "cause"}`.
//!
//! The server answers `FAST/1 <status> <reason>` and a blank line. With 200,
//! one reply frame and an END frame follow; with any other status, plain text
//! describing the failure follows up to the end of the stream.
//!
//! Message IDs are allocated sequentially from a circular 31-bit space.

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod identity;
pub mod interface;
pub mod marshal;
pub mod naming;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod transport;

pub use crate::config::Config;
pub use crate::container::{ClientContainer, ContainerRegistry};
pub use crate::dispatch::{
    Call, Dispatcher, Exported, ObjectServer, ObjectSource, ObjectStore, RemoteTarget,
    Skeleton,
};
pub use crate::error::Error;
pub use crate::handle::{Handle, HandleEncoder, HomeHandle};
pub use crate::identity::{IdentityCodec, KeyShape, PrimaryKey};
pub use crate::interface::InterfaceDef;
pub use crate::naming::{NamingEntry, NamingResolver};
pub use crate::proxy::Proxy;
pub use crate::registry::Registry;
pub use crate::transport::{LoopbackTransport, TcpTransport, Transport};
