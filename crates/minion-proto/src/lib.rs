//! # Minion Protocol
//!
//! Wire types, the length-prefixed frame codec and the channel multiplexer
//! shared by every minion connection.

#![warn(missing_docs)]

/// Frame structure and serialization
pub mod frame;

/// RPC values, calls, replies and handshake records
pub mod message;

/// Frame codec for async streams
pub mod codec;

/// Logical channel multiplexing over one byte stream
pub mod stream;

/// Error types for protocol operations
pub mod error;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags};
pub use message::{Call, ErrorCode, ErrorDetails, Hello, HelloReply, Message, Reply, Value};
pub use stream::{ChannelHandler, ChannelReceiver, ChannelSender, Multiplexer, Side};
