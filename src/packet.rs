//! The wire format of the signed and encrypted packets exchanged by peers.
//!
//! ```text
//! frame   = len:u32 BE | payload
//! payload = version:u8 | sig_len:u32 BE | sig | digest_len:u32 BE | digest
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// The size of the length prefix of every frame.
pub const FRAME_HEADER_LEN: usize = 4;
/// The current version of the packet serialization.
pub const PACKET_VERSION: u8 = 1;
/// The overhead of the packet serialization on top of the signature and digest lengths.
pub const PACKET_OVERHEAD: usize = 1 + 4 + 4;

/// A signed, encrypted unit of communication between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// The signature over `digest`.
    pub signature: Bytes,
    /// The ciphertext.
    pub digest: Bytes,
}

impl Packet {
    /// Returns the length of the serialized packet, i.e. the frame payload.
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.signature.len(), self.digest.len())
    }

    /// Deserializes a frame payload.
    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if !payload.has_remaining() {
            return Err(Error::MalformedPacket("empty payload"));
        }
        if payload.get_u8() != PACKET_VERSION {
            return Err(Error::MalformedPacket("unsupported version"));
        }

        let signature = read_field(&mut payload)?;
        let digest = read_field(&mut payload)?;

        if payload.has_remaining() {
            return Err(Error::MalformedPacket("trailing bytes"));
        }

        Ok(Self { signature, digest })
    }
}

/// Returns the length of a serialized packet with the given field lengths.
pub fn encoded_len(signature_len: usize, digest_len: usize) -> usize {
    PACKET_OVERHEAD + signature_len + digest_len
}

/// Serializes a packet with its length prefix into `dst`, returning the number of bytes written.
pub fn encode_frame(signature: &[u8], digest: &[u8], dst: &mut BytesMut) -> Result<usize> {
    let payload_len = encoded_len(signature.len(), digest.len());
    let (Ok(len), Ok(sig_len), Ok(digest_len)) = (
        u32::try_from(payload_len),
        u32::try_from(signature.len()),
        u32::try_from(digest.len()),
    ) else {
        return Err(Error::MaxPayloadExceeded {
            declared: payload_len,
            max: u32::MAX as usize,
        });
    };

    dst.reserve(FRAME_HEADER_LEN + payload_len);
    dst.put_u32(len);
    dst.put_u8(PACKET_VERSION);
    dst.put_u32(sig_len);
    dst.put_slice(signature);
    dst.put_u32(digest_len);
    dst.put_slice(digest);

    Ok(FRAME_HEADER_LEN + payload_len)
}

fn read_field(src: &mut &[u8]) -> Result<Bytes> {
    if src.remaining() < 4 {
        return Err(Error::MalformedPacket("truncated field length"));
    }
    let len = src.get_u32() as usize;
    if src.remaining() < len {
        return Err(Error::MalformedPacket("truncated field"));
    }

    Ok(src.copy_to_bytes(len))
}
