//! Transport message framing.
//!
//! ```text
//!  0               1               2               3
//! +---------------+---------------+---------------+---------------+
//! |  Type (0x04)  |              Reserved (zero)                  |
//! +---------------+---------------+---------------+---------------+
//! |                    Receiver index (u32 LE)                    |
//! +---------------+---------------+---------------+---------------+
//! |                                                               |
//! |                       Counter (u64 LE)                        |
//! +---------------+---------------+---------------+---------------+
//! |               Ciphertext ... || Tag (16 bytes)                |
//! +---------------+---------------+---------------+---------------+
//! ```
//!
//! The counter is the nonce the sender used; the receiver feeds it back into
//! the session cipher unchanged.

use bytes::{Buf, BufMut};

use crate::CoreError;

/// Message type byte for transport data.
pub const MESSAGE_TRANSPORT_TYPE: u8 = 4;

/// Header bytes preceding the ciphertext.
pub const TRANSPORT_HEADER_SIZE: usize = 16;

/// Poly1305 authentication tag length.
pub const AEAD_TAG_SIZE: usize = 16;

/// An empty (keepalive) transport message: header plus tag.
pub const MIN_TRANSPORT_MESSAGE_SIZE: usize = TRANSPORT_HEADER_SIZE + AEAD_TAG_SIZE;

/// Total wire length of a transport message carrying `plaintext_len` bytes.
pub const fn sealed_message_len(plaintext_len: usize) -> usize {
    TRANSPORT_HEADER_SIZE + plaintext_len + AEAD_TAG_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    pub fn new(receiver_index: u32, counter: u64) -> Self {
        Self {
            receiver_index,
            counter,
        }
    }

    /// Append the header to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(MESSAGE_TRANSPORT_TYPE);
        buf.put_bytes(0, 3);
        buf.put_u32_le(self.receiver_index);
        buf.put_u64_le(self.counter);
    }

    /// Write the header over the first 16 bytes of `message`.
    pub fn write_into(&self, message: &mut [u8]) -> Result<(), CoreError> {
        if message.len() < TRANSPORT_HEADER_SIZE {
            return Err(CoreError::Capacity {
                requested: TRANSPORT_HEADER_SIZE,
                available: message.len(),
            });
        }
        let mut cursor = &mut message[..TRANSPORT_HEADER_SIZE];
        self.encode(&mut cursor);
        Ok(())
    }

    /// Parse the header of a complete transport message.
    ///
    /// Messages that cannot hold at least an authentication tag are rejected
    /// here so the cipher never sees them.
    pub fn parse(message: &[u8]) -> Result<Self, CoreError> {
        if message.len() < MIN_TRANSPORT_MESSAGE_SIZE {
            return Err(CoreError::TooShort(message.len()));
        }

        let mut cursor = message;
        let message_type = cursor.get_u8();
        if message_type != MESSAGE_TRANSPORT_TYPE {
            return Err(CoreError::InvalidMessageType(message_type));
        }
        cursor.advance(3);

        Ok(Self {
            receiver_index: cursor.get_u32_le(),
            counter: cursor.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        TransportHeader::new(0x0102_0304, 0x1122_3344_5566_7788).encode(&mut buf);

        assert_eq!(buf.len(), TRANSPORT_HEADER_SIZE);
        assert_eq!(&buf[0..4], &[4, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn test_parse_reads_back_header() {
        let mut message = vec![0u8; sealed_message_len(10)];
        TransportHeader::new(9, 77).write_into(&mut message).unwrap();

        let header = TransportHeader::parse(&message).unwrap();
        assert_eq!(header.receiver_index, 9);
        assert_eq!(header.counter, 77);
    }

    #[test]
    fn test_parse_rejects_short_message() {
        let message = vec![MESSAGE_TRANSPORT_TYPE; MIN_TRANSPORT_MESSAGE_SIZE - 1];
        assert_eq!(
            TransportHeader::parse(&message),
            Err(CoreError::TooShort(MIN_TRANSPORT_MESSAGE_SIZE - 1))
        );
    }

    #[test]
    fn test_parse_rejects_wrong_type() {
        let mut message = vec![0u8; MIN_TRANSPORT_MESSAGE_SIZE];
        message[0] = 1;
        assert_eq!(
            TransportHeader::parse(&message),
            Err(CoreError::InvalidMessageType(1))
        );
    }

    #[test]
    fn test_write_into_small_buffer() {
        let mut small = [0u8; 8];
        assert!(matches!(
            TransportHeader::new(1, 1).write_into(&mut small),
            Err(CoreError::Capacity { requested: 16, available: 8 })
        ));
    }
}
