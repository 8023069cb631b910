//! CAN frame codec.
//!
//! A CAN 2.0B extended arbitration identifier (29 bits) packs the routing
//! tuple for every message on the bus:
//!
//! ```text
//! | 28 .. 18       | 17 .. 10   | 9 .. 4 | 3 .. 0        |
//! | positioner_id  | command_id | uid    | response_code |
//! ```
//!
//! Payloads are at most 8 bytes per frame. Logical payloads longer than 8
//! bytes are chunked into frames of `1 + 7` bytes, where byte 0 carries the
//! frame sequence number and a terminating flag in the high bit. The layout
//! is fixed by the positioner firmware and must round-trip bit-exactly.

use crate::commands::{CommandID, ResponseCode};
use crate::error::DecodeError;

pub const MAX_FRAME_DATA: usize = 8;
/// Data bytes available per frame of a chunked payload.
pub const CHUNK_DATA: usize = MAX_FRAME_DATA - 1;

const POSITIONER_ID_SHIFT: u32 = 18;
const COMMAND_ID_SHIFT: u32 = 10;
const UID_SHIFT: u32 = 4;

const POSITIONER_ID_MASK: u32 = 0x7FF;
const COMMAND_ID_MASK: u32 = 0xFF;
const UID_MASK: u32 = 0x3F;
const RESPONSE_CODE_MASK: u32 = 0xF;

/// High bit of the chunk prefix byte: this is the final frame.
pub const CHUNK_LAST: u8 = 0x80;
const CHUNK_SEQ_MASK: u8 = 0x7F;

pub type FrameData = heapless::Vec<u8, MAX_FRAME_DATA>;

/// A raw frame as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub arbitration_id: u32,
    pub data: FrameData,
}

/// The routing tuple unpacked from an arbitration identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifier {
    pub positioner_id: u16,
    pub command_id: CommandID,
    pub uid: u8,
    pub response_code: ResponseCode,
}

impl Identifier {
    pub fn pack(&self) -> u32 {
        (u32::from(self.positioner_id) & POSITIONER_ID_MASK) << POSITIONER_ID_SHIFT
            | (self.command_id as u32 & COMMAND_ID_MASK) << COMMAND_ID_SHIFT
            | (u32::from(self.uid) & UID_MASK) << UID_SHIFT
            | (self.response_code as u32 & RESPONSE_CODE_MASK)
    }

    pub fn unpack(raw: u32) -> Result<Identifier, DecodeError> {
        if raw >= 1 << 29 {
            return Err(DecodeError::BadArbitration { raw });
        }

        let command_raw = ((raw >> COMMAND_ID_SHIFT) & COMMAND_ID_MASK) as u8;
        let command_id =
            CommandID::from_u8(command_raw).ok_or(DecodeError::UnknownCommand { raw })?;

        let response_raw = (raw & RESPONSE_CODE_MASK) as u8;
        let response_code =
            ResponseCode::from_u8(response_raw).ok_or(DecodeError::BadArbitration { raw })?;

        Ok(Identifier {
            positioner_id: ((raw >> POSITIONER_ID_SHIFT) & POSITIONER_ID_MASK) as u16,
            command_id,
            uid: ((raw >> UID_SHIFT) & UID_MASK) as u8,
            response_code,
        })
    }
}

/// Number of frames a logical payload of `len` bytes occupies.
pub fn frame_count(len: usize) -> usize {
    if len <= MAX_FRAME_DATA {
        1
    } else {
        len.div_ceil(CHUNK_DATA)
    }
}

/// Splits a logical payload into frame-sized chunks.
///
/// Payloads of up to 8 bytes travel raw in a single frame; longer payloads
/// get the sequence-byte prefix on every frame.
pub fn chunk_payload(payload: &[u8]) -> Vec<FrameData> {
    if payload.len() <= MAX_FRAME_DATA {
        let mut data = FrameData::new();
        data.extend_from_slice(payload).expect("payload fits one frame");
        return vec![data];
    }

    let chunks: Vec<&[u8]> = payload.chunks(CHUNK_DATA).collect();
    let last = chunks.len() - 1;

    chunks
        .iter()
        .enumerate()
        .map(|(seq, chunk)| {
            let mut data = FrameData::new();
            let mut prefix = (seq as u8) & CHUNK_SEQ_MASK;
            if seq == last {
                prefix |= CHUNK_LAST;
            }
            data.push(prefix).expect("prefix fits");
            data.extend_from_slice(chunk).expect("chunk fits");
            data
        })
        .collect()
}

/// Reassembles a chunked payload, validating sequence numbers and the
/// terminating flag. The inverse of `chunk_payload` for multi-frame payloads.
pub fn assemble_payload(frames: &[FrameData]) -> Result<Vec<u8>, DecodeError> {
    let mut payload = Vec::new();

    for (index, frame) in frames.iter().enumerate() {
        if frame.is_empty() {
            return Err(DecodeError::MissingChunk { expected: index as u8 });
        }

        let prefix = frame[0];
        if prefix & CHUNK_SEQ_MASK != index as u8 {
            return Err(DecodeError::MissingChunk { expected: index as u8 });
        }

        let is_last = prefix & CHUNK_LAST != 0;
        if is_last != (index == frames.len() - 1) {
            return Err(DecodeError::MissingChunk {
                expected: index as u8 + 1,
            });
        }

        payload.extend_from_slice(&frame[1..]);
    }

    Ok(payload)
}

/// Encodes one outbound command into wire frames for a single positioner.
pub fn encode(
    command_id: CommandID,
    positioner_id: u16,
    uid: u8,
    payload: &[u8],
) -> Vec<CanFrame> {
    let identifier = Identifier {
        positioner_id,
        command_id,
        uid,
        response_code: ResponseCode::CommandAccepted,
    };
    let arbitration_id = identifier.pack();

    chunk_payload(payload)
        .into_iter()
        .map(|data| CanFrame {
            arbitration_id,
            data,
        })
        .collect()
}

/// Decodes an incoming frame into its routing tuple and raw data bytes.
pub fn decode(frame: &CanFrame) -> Result<(Identifier, FrameData), DecodeError> {
    if frame.data.len() > MAX_FRAME_DATA {
        return Err(DecodeError::BadPayloadLength {
            len: frame.data.len(),
        });
    }
    let identifier = Identifier::unpack(frame.arbitration_id)?;
    Ok((identifier, frame.data.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_round_trip() {
        for (pid, cmd, uid, code) in [
            (0u16, CommandID::GetFirmwareVersion, 0u8, ResponseCode::CommandAccepted),
            (4, CommandID::GetStatus, 17, ResponseCode::CommandAccepted),
            (1200, CommandID::StartTrajectory, 63, ResponseCode::InvalidTrajectory),
            (2047, CommandID::SendTrajectoryData, 1, ResponseCode::ValueOutOfRange),
        ] {
            let identifier = Identifier {
                positioner_id: pid,
                command_id: cmd,
                uid,
                response_code: code,
            };
            let raw = identifier.pack();
            assert!(raw < 1 << 29);
            assert_eq!(Identifier::unpack(raw).unwrap(), identifier);
        }
    }

    #[test]
    fn test_unpack_rejects_out_of_range() {
        assert!(matches!(
            Identifier::unpack(1 << 29),
            Err(DecodeError::BadArbitration { .. })
        ));
    }

    #[test]
    fn test_unpack_rejects_unknown_command() {
        // Command id 0xFF is unassigned.
        let raw = 0xFFu32 << COMMAND_ID_SHIFT;
        assert!(matches!(
            Identifier::unpack(raw),
            Err(DecodeError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn test_short_payload_is_single_raw_frame() {
        let frames = chunk_payload(&[1, 2, 3, 4]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &[1, 2, 3, 4]);

        let frames = chunk_payload(&[0; 8]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 8);
    }

    #[test]
    fn test_chunk_round_trip() {
        for len in [9usize, 14, 15, 40, 64, 200] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frames = chunk_payload(&payload);
            assert_eq!(frames.len(), frame_count(len));
            assert!(frames.iter().all(|f| f.len() <= MAX_FRAME_DATA));
            assert_eq!(assemble_payload(&frames).unwrap(), payload);
        }
    }

    #[test]
    fn test_assemble_detects_missing_chunk() {
        let payload: Vec<u8> = (0..40).collect();
        let mut frames = chunk_payload(&payload);
        frames.remove(2);
        assert!(assemble_payload(&frames).is_err());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let frames = encode(CommandID::GetStatus, 12, 5, &[]);
        assert_eq!(frames.len(), 1);
        let (identifier, data) = decode(&frames[0]).unwrap();
        assert_eq!(identifier.positioner_id, 12);
        assert_eq!(identifier.command_id, CommandID::GetStatus);
        assert_eq!(identifier.uid, 5);
        assert!(data.is_empty());
    }
}
