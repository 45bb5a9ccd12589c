//! Message wire formats
//!
//! The four message types carried over UDP:
//! - Type 1: Handshake Initiation (148 bytes)
//! - Type 2: Handshake Response (92 bytes)
//! - Type 3: Cookie Reply (64 bytes)
//! - Type 4: Transport Data (32 bytes minimum)
//!
//! All multi-byte integers are little-endian. Each message starts with a
//! 1-byte type discriminator followed by 3 reserved zero bytes.

use crate::error::ProtocolError;

/// Message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

/// Handshake Initiation message (148 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | ephemeral_public(32) |
/// encrypted_static(48) | encrypted_timestamp(28) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_static: [u8; 48],    // 32 bytes static + 16 bytes tag
    pub encrypted_timestamp: [u8; 28], // 12 bytes TAI64N + 16 bytes tag
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    /// Exact wire size
    pub const SIZE: usize = 148;

    /// Create a new initiation; MACs are zeroed and computed separately
    pub fn new(
        sender_index: u32,
        ephemeral_public: [u8; 32],
        encrypted_static: [u8; 48],
        encrypted_timestamp: [u8; 28],
    ) -> Self {
        Self {
            sender_index,
            ephemeral_public,
            encrypted_static,
            encrypted_timestamp,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        buf[0] = MessageType::HandshakeInitiation as u8;
        // buf[1..4] reserved (zeros)
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral_public);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);

        buf
    }

    /// Bytes covered by mac1 (everything before it)
    pub fn bytes_for_mac1(&self) -> [u8; 116] {
        let full = self.to_bytes();
        let mut result = [0u8; 116];
        result.copy_from_slice(&full[..116]);
        result
    }

    /// Bytes covered by mac2 (everything before it, mac1 included)
    pub fn bytes_for_mac2(&self) -> [u8; 132] {
        let full = self.to_bytes();
        let mut result = [0u8; 132];
        result.copy_from_slice(&full[..132]);
        result
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }

        if data[0] != MessageType::HandshakeInitiation as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }

        let sender_index = u32::from_le_bytes(data[4..8].try_into().unwrap());

        let mut ephemeral_public = [0u8; 32];
        ephemeral_public.copy_from_slice(&data[8..40]);

        let mut encrypted_static = [0u8; 48];
        encrypted_static.copy_from_slice(&data[40..88]);

        let mut encrypted_timestamp = [0u8; 28];
        encrypted_timestamp.copy_from_slice(&data[88..116]);

        let mut mac1 = [0u8; 16];
        mac1.copy_from_slice(&data[116..132]);

        let mut mac2 = [0u8; 16];
        mac2.copy_from_slice(&data[132..148]);

        Ok(Self {
            sender_index,
            ephemeral_public,
            encrypted_static,
            encrypted_timestamp,
            mac1,
            mac2,
        })
    }
}

/// Handshake Response message (92 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | receiver_index(4) |
/// ephemeral_public(32) | encrypted_nothing(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_nothing: [u8; 16], // just the auth tag
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    /// Exact wire size
    pub const SIZE: usize = 92;

    /// Create a new response; MACs are zeroed and computed separately
    pub fn new(
        sender_index: u32,
        receiver_index: u32,
        ephemeral_public: [u8; 32],
        encrypted_nothing: [u8; 16],
    ) -> Self {
        Self {
            sender_index,
            receiver_index,
            ephemeral_public,
            encrypted_nothing,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        buf[0] = MessageType::HandshakeResponse as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral_public);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);

        buf
    }

    /// Bytes covered by mac1
    pub fn bytes_for_mac1(&self) -> [u8; 60] {
        let full = self.to_bytes();
        let mut result = [0u8; 60];
        result.copy_from_slice(&full[..60]);
        result
    }

    /// Bytes covered by mac2
    pub fn bytes_for_mac2(&self) -> [u8; 76] {
        let full = self.to_bytes();
        let mut result = [0u8; 76];
        result.copy_from_slice(&full[..76]);
        result
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }

        if data[0] != MessageType::HandshakeResponse as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }

        let sender_index = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let receiver_index = u32::from_le_bytes(data[8..12].try_into().unwrap());

        let mut ephemeral_public = [0u8; 32];
        ephemeral_public.copy_from_slice(&data[12..44]);

        let mut encrypted_nothing = [0u8; 16];
        encrypted_nothing.copy_from_slice(&data[44..60]);

        let mut mac1 = [0u8; 16];
        mac1.copy_from_slice(&data[60..76]);

        let mut mac2 = [0u8; 16];
        mac2.copy_from_slice(&data[76..92]);

        Ok(Self {
            sender_index,
            receiver_index,
            ephemeral_public,
            encrypted_nothing,
            mac1,
            mac2,
        })
    }
}

/// Cookie Reply message (64 bytes)
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | nonce(24) | encrypted_cookie(32)
/// ```
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 32], // 16 bytes cookie + 16 bytes tag
}

impl CookieReply {
    /// Exact wire size
    pub const SIZE: usize = 64;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        buf[0] = MessageType::CookieReply as u8;
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);

        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }

        if data[0] != MessageType::CookieReply as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }

        let receiver_index = u32::from_le_bytes(data[4..8].try_into().unwrap());

        let mut nonce = [0u8; 24];
        nonce.copy_from_slice(&data[8..32]);

        let mut encrypted_cookie = [0u8; 32];
        encrypted_cookie.copy_from_slice(&data[32..64]);

        Ok(Self {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }
}

/// Transport Data message header (16 bytes, followed by encrypted payload)
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | counter(8) | ciphertext || tag(16)
/// ```
#[derive(Debug, Clone)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    /// Header size (not including encrypted payload)
    pub const SIZE: usize = 16;

    /// Minimum size of a transport message: header plus the tag of an
    /// empty payload (a keepalive)
    pub const MIN_SIZE: usize = Self::SIZE + 16;

    /// Build a complete transport message from an encrypted payload
    pub fn build_message(receiver_index: u32, counter: u64, encrypted_payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + encrypted_payload.len());

        buf.push(MessageType::TransportData as u8);
        buf.extend_from_slice(&[0, 0, 0]); // reserved
        buf.extend_from_slice(&receiver_index.to_le_bytes());
        buf.extend_from_slice(&counter.to_le_bytes());
        buf.extend_from_slice(encrypted_payload);

        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::MIN_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::MIN_SIZE,
                got: data.len(),
            });
        }

        if data[0] != MessageType::TransportData as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }

        let receiver_index = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let counter = u64::from_le_bytes(data[8..16].try_into().unwrap());

        Ok(Self {
            receiver_index,
            counter,
        })
    }

    /// The encrypted payload of a transport message
    pub fn payload(data: &[u8]) -> &[u8] {
        &data[Self::SIZE..]
    }
}

/// The message type of a datagram
pub fn get_message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::InvalidMessageLength {
            expected: 4,
            got: data.len(),
        });
    }
    MessageType::try_from(data[0])
}

/// Length of a plaintext after zero-padding to a 16-byte boundary,
/// capped at the interface MTU
pub fn padded_len(len: usize, mtu: usize) -> usize {
    let want = len + (16 - len % 16) % 16;
    want.min(mtu).max(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_initiation_roundtrip() {
        let init = HandshakeInitiation {
            sender_index: 0x12345678,
            ephemeral_public: [1u8; 32],
            encrypted_static: [2u8; 48],
            encrypted_timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        };

        let bytes = init.to_bytes();
        assert_eq!(bytes.len(), HandshakeInitiation::SIZE);
        assert_eq!(bytes[0], 1);

        let parsed = HandshakeInitiation::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sender_index, init.sender_index);
        assert_eq!(parsed.ephemeral_public, init.ephemeral_public);
        assert_eq!(parsed.mac1, init.mac1);
    }

    #[test]
    fn test_handshake_response_roundtrip() {
        let mut resp = HandshakeResponse::new(0x11223344, 0x55667788, [7u8; 32], [8u8; 16]);
        resp.mac1 = [9u8; 16];

        let bytes = resp.to_bytes();
        assert_eq!(bytes.len(), HandshakeResponse::SIZE);
        assert_eq!(bytes[0], 2);

        let parsed = HandshakeResponse::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sender_index, 0x11223344);
        assert_eq!(parsed.receiver_index, 0x55667788);
        assert_eq!(parsed.mac1, resp.mac1);
    }

    #[test]
    fn test_cookie_reply_roundtrip() {
        let reply = CookieReply {
            receiver_index: 99,
            nonce: [1u8; 24],
            encrypted_cookie: [2u8; 32],
        };

        let bytes = reply.to_bytes();
        assert_eq!(bytes.len(), CookieReply::SIZE);
        assert_eq!(bytes[0], 3);

        let parsed = CookieReply::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.receiver_index, 99);
        assert_eq!(parsed.nonce, reply.nonce);
    }

    #[test]
    fn test_transport_build() {
        let payload = vec![0xAA; 100];
        let msg = TransportHeader::build_message(42, 1234, &payload);

        assert_eq!(msg[0], 4);
        assert_eq!(msg.len(), TransportHeader::SIZE + payload.len());

        let header = TransportHeader::from_bytes(&msg).unwrap();
        assert_eq!(header.receiver_index, 42);
        assert_eq!(header.counter, 1234);
        assert_eq!(TransportHeader::payload(&msg), &payload[..]);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let mut data = [0u8; HandshakeInitiation::SIZE + 1];
        data[0] = 1;
        assert!(HandshakeInitiation::from_bytes(&data).is_err());

        let mut data = [0u8; HandshakeResponse::SIZE - 1];
        data[0] = 2;
        assert!(HandshakeResponse::from_bytes(&data).is_err());
    }

    #[test]
    fn test_invalid_message_type() {
        let data = [99u8; 100];
        assert!(get_message_type(&data).is_err());
    }

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(0, 1420), 0);
        assert_eq!(padded_len(1, 1420), 16);
        assert_eq!(padded_len(16, 1420), 16);
        assert_eq!(padded_len(17, 1420), 32);
        // Padding never exceeds the MTU
        assert_eq!(padded_len(1415, 1420), 1420);
        assert_eq!(padded_len(1420, 1420), 1420);
    }
}
