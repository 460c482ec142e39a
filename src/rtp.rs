/*! RTP header codec for the UDP audio path.

Only the fixed 12-byte header is supported; the bridge neither sends
nor understands CSRC lists or extensions.
*/
use crate::{Error, Result};

/// Encoded RTP header length.
pub const RTP_HEADER_LENGTH_BYTES: usize = 12;

/// Payload type used for G.711 audio frames.
pub const RTP_G711_PAYLOAD_TYPE: u8 = 100;

/// Sequence number that signals end of call; egress wraps to 0 before
/// ever emitting it as a voice frame.
pub const RTP_END_OF_CALL_SEQ: u16 = 65535;

/// RTP clock rate of the audio path.
pub const RTP_GENERIC_CLOCK_RATE: u32 = 8000;

/// Timestamp value meaning "not yet established".
pub const INVALID_TS: u32 = u32::MAX;

/// Fixed RTP header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RtpHeader {
    /// Marker bit.
    pub marker: bool,
    /// Payload type, 7 bits.
    pub payload_type: u8,
    /// Sequence number.
    pub sequence: u16,
    /// Media timestamp.
    pub timestamp: u32,
    /// Synchronisation source; the bridge uses its peer id.
    pub ssrc: u32,
}

impl RtpHeader {
    /// Serialise into the first 12 bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0] = 0x80; // version 2, no padding, no extension, no CSRC
        buf[1] = (self.payload_type & 0x7F) | if self.marker { 0x80 } else { 0 };
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
    }

    /// Parse the first 12 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RTP_HEADER_LENGTH_BYTES {
            return Err(Error::Frame("short RTP header".into()));
        }
        if buf[0] >> 6 != 2 {
            return Err(Error::Frame(format!("RTP version {}", buf[0] >> 6)));
        }
        Ok(Self {
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7F,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}
