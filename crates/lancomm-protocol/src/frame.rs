//! UDP audio datagrams.
//!
//! Upstream (beltpack → server):
//! ```text
//! [channel_id: u32 BE] [user_id: u32 BE] [sequence: u32 BE] [PCM: i16 LE]
//! ```
//! Downstream (server → beltpack):
//! ```text
//! [channel_id: u32 BE] [reserved: 8 zero bytes] [PCM: i16 LE]
//! ```
//! PCM is 16-bit little-endian mono at 48 kHz; a full frame is 960
//! samples. Receivers pad or truncate to that length, so the codecs here
//! decode whatever complete samples are present.

use crate::error::ProtocolError;
use crate::types::{ChannelId, UserId};

/// Header bytes preceding PCM in both directions.
pub const HEADER_SIZE: usize = 12;

/// An upstream audio datagram from a keyed talker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFrame {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    /// Rolling sender sequence; only the low 16 bits are significant.
    pub sequence: u32,
    pub pcm: Vec<i16>,
}

/// A downstream audio datagram carrying one listener's mix-minus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamFrame {
    pub channel_id: ChannelId,
    pub pcm: Vec<i16>,
}

fn encode_pcm(buf: &mut Vec<u8>, pcm: &[i16]) {
    for sample in pcm {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
}

fn decode_pcm(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

impl UpstreamFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.pcm.len() * 2);
        buf.extend_from_slice(&self.channel_id.to_be_bytes());
        buf.extend_from_slice(&self.user_id.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        encode_pcm(&mut buf, &self.pcm);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::PacketTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            channel_id: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            user_id: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            sequence: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            pcm: decode_pcm(&data[HEADER_SIZE..]),
        })
    }
}

impl DownstreamFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.pcm.len() * 2);
        buf.extend_from_slice(&self.channel_id.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        encode_pcm(&mut buf, &self.pcm);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::PacketTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            channel_id: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            pcm: decode_pcm(&data[HEADER_SIZE..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FRAME_SAMPLES;

    #[test]
    fn roundtrip_upstream() {
        let pcm: Vec<i16> = (0..FRAME_SAMPLES as i16).collect();
        let original = UpstreamFrame {
            channel_id: 3,
            user_id: 7,
            sequence: 0x0001_FFFF,
            pcm: pcm.clone(),
        };
        let bytes = original.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + FRAME_SAMPLES * 2);
        let decoded = UpstreamFrame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn roundtrip_downstream() {
        let original = DownstreamFrame {
            channel_id: 9,
            pcm: vec![-32767, 0, 32767],
        };
        let decoded = DownstreamFrame::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn downstream_reserved_bytes_are_zero() {
        let frame = DownstreamFrame { channel_id: 1, pcm: vec![5] };
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[4..12], &[0u8; 8]);
    }

    #[test]
    fn header_is_big_endian() {
        let frame = UpstreamFrame {
            channel_id: 0x0102_0304,
            user_id: 0x0506_0708,
            sequence: 0x090A_0B0C,
            pcm: Vec::new(),
        };
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..8], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[8..12], &[0x09, 0x0A, 0x0B, 0x0C]);
    }

    #[test]
    fn pcm_is_little_endian() {
        let frame = DownstreamFrame { channel_id: 0, pcm: vec![0x0102] };
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[12..], &[0x02, 0x01]);
    }

    #[test]
    fn extreme_samples_survive() {
        let pcm = vec![i16::MIN, -32767, -1, 0, 1, 32767, i16::MAX];
        let frame = UpstreamFrame { channel_id: 0, user_id: 1, sequence: 2, pcm: pcm.clone() };
        let decoded = UpstreamFrame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(decoded.pcm, pcm);
    }

    #[test]
    fn too_short_rejected() {
        assert!(UpstreamFrame::from_bytes(&[0u8; 11]).is_err());
        assert!(DownstreamFrame::from_bytes(&[0u8; 4]).is_err());
        assert!(UpstreamFrame::from_bytes(&[0u8; 12]).is_ok());
    }

    #[test]
    fn odd_trailing_byte_ignored() {
        let mut bytes = UpstreamFrame {
            channel_id: 0,
            user_id: 1,
            sequence: 0,
            pcm: vec![100, 200],
        }
        .to_bytes();
        bytes.push(0xAB);
        let decoded = UpstreamFrame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.pcm, vec![100, 200]);
    }
}
