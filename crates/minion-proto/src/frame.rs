//! Frame structure and serialization

use serde::{Deserialize, Serialize};
use bytes::Bytes;
use crate::ProtocolError;

/// Channel id reserved for handshake records exchanged before multiplexing starts
pub const CONTROL_CHANNEL: u32 = 0;

/// Frame flags for protocol control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// No special flags
    pub const NONE: Self = Self(0);
    /// The payload is an encoded [`ErrorDetails`](crate::ErrorDetails) rather than a reply
    pub const ERROR: Self = Self(2);
    /// Handshake record on the control channel
    pub const CONTROL: Self = Self(8);

    /// Check if a flag is set
    pub fn has_flag(self, flag: FrameFlags) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Set a flag
    pub fn set_flag(&mut self, flag: FrameFlags) {
        self.0 |= flag.0;
    }

    /// Clear a flag
    pub fn clear_flag(&mut self, flag: FrameFlags) {
        self.0 &= !flag.0;
    }
}

/// Protocol frame structure
///
/// One frame carries one whole request or response; `channel_id` routes it
/// back to the logical channel it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Logical channel identifier
    pub channel_id: u32,
    /// Frame flags
    pub flags: FrameFlags,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(channel_id: u32, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            channel_id,
            flags,
            payload,
        }
    }

    /// Create a data frame
    pub fn data(channel_id: u32, payload: Bytes) -> Self {
        Self::new(channel_id, FrameFlags::NONE, payload)
    }

    /// Create an error frame
    pub fn error(channel_id: u32, payload: Bytes) -> Self {
        Self::new(channel_id, FrameFlags::ERROR, payload)
    }

    /// Create a handshake frame on the control channel
    pub fn control(payload: Bytes) -> Self {
        Self::new(CONTROL_CHANNEL, FrameFlags::CONTROL, payload)
    }

    /// Serialize frame to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize frame from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Get the payload size
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Check if this is an error frame
    pub fn is_error(&self) -> bool {
        self.flags.has_flag(FrameFlags::ERROR)
    }

    /// Check if this is a handshake frame
    pub fn is_control(&self) -> bool {
        self.flags.has_flag(FrameFlags::CONTROL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_flags() {
        let mut flags = FrameFlags::NONE;
        assert!(!flags.has_flag(FrameFlags::ERROR));

        flags.set_flag(FrameFlags::ERROR);
        assert!(flags.has_flag(FrameFlags::ERROR));
        assert!(!flags.has_flag(FrameFlags::CONTROL));

        flags.clear_flag(FrameFlags::ERROR);
        assert!(!flags.has_flag(FrameFlags::ERROR));
    }

    #[test]
    fn test_frame_creation() {
        let payload = Bytes::from("test payload");
        let frame = Frame::data(7, payload.clone());

        assert_eq!(frame.channel_id, 7);
        assert_eq!(frame.flags, FrameFlags::NONE);
        assert_eq!(frame.payload, payload);
        assert!(!frame.is_error());
        assert!(!frame.is_control());
    }

    #[test]
    fn test_error_frame() {
        let payload = Bytes::from("error message");
        let frame = Frame::error(3, payload.clone());
        assert!(frame.is_error());
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_control_frame_uses_reserved_channel() {
        let frame = Frame::control(Bytes::from_static(b"hello"));
        assert_eq!(frame.channel_id, CONTROL_CHANNEL);
        assert!(frame.is_control());
    }

    proptest! {
        #[test]
        fn test_frame_roundtrip_properties(
            channel_id in any::<u32>(),
            flags in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 0..1024)
        ) {
            let frame = Frame::new(channel_id, FrameFlags(flags), Bytes::from(payload));

            let serialized = frame.to_msgpack().unwrap();
            let deserialized = Frame::from_msgpack(&serialized).unwrap();

            prop_assert_eq!(frame.channel_id, deserialized.channel_id);
            prop_assert_eq!(frame.flags, deserialized.flags);
            prop_assert_eq!(frame.payload, deserialized.payload);
        }
    }
}
