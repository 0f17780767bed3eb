//! Control channel protocol definitions
//!
//! This crate defines the frames exchanged between a private edge client and the
//! public relay over the single multiplexed control channel, and the JSON codec
//! used to put them on the wire.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, FrameCodec};
pub use messages::*;

/// Namespace path of the control channel on the relay endpoint
pub const CONTROL_PATH: &str = "/control";

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Event names as they appear in the `event` field of the envelope
pub mod events {
    // Relay -> client
    pub const CONNECT: &str = "connect";
    pub const DATA: &str = "data";
    pub const SOCKET_ERROR: &str = "socket_error";
    pub const END: &str = "end";
    pub const REGISTERED: &str = "registered";

    // Older relays still emit these names
    pub const LEGACY_CONNECT: &str = "create_connection";
    pub const LEGACY_END: &str = "_end";
    pub const LEGACY_REGISTERED: &str = "hostRegistered";

    // Client -> relay
    pub const REGISTER_SERVER: &str = "register_server";
    pub const ERROR: &str = "error";
    pub const DISCONNECT_CLIENT: &str = "disconnect_client";
    pub const ABORT_CLIENT: &str = "abort_client";
}
