/*! DFSI voice frame packing.

An LDU travels on the wire as nine fixed-length voice frames, each
tagged with its frame type (0x62..0x6A for LDU1, 0x6B..0x73 for LDU2).
The 17-byte frames carry three metadata bytes right after the tag:

* LDU1 voice 3..5 carry the link control record, voice 6..7 carry the
  Hamming(10,6,3) parity over its six-bit groups, voice 8 is reserved;
* LDU2 voice 12..14 carry the message indicator, voice 15 carries
  algorithm id and key id, voice 16..17 carry the Hamming parity over
  the MI groups.

Voice 9/18 carry the low speed data. The unpacker writes the nine IMBE
codewords straight into the 225-byte superframe buffer at their fixed
offsets.
*/
use crate::crypto::Ldu;
use crate::hamming;
use crate::lc::{LinkControl, LowSpeedData};
use crate::{Error, MI_LENGTH_BYTES, RAW_IMBE_LENGTH_BYTES, Result, bits};

/// Frame type tag of LDU1 voice 1.
pub const LDU1_VOICE1: u8 = 0x62;
/// Frame type tag of LDU2 voice 10.
pub const LDU2_VOICE10: u8 = 0x6B;

/// Wire length of each voice frame within an LDU.
pub const VOICE_FRAME_LENGTHS: [usize; 9] = [22, 14, 17, 17, 17, 17, 17, 17, 16];

/// Offset of each voice frame within the LDU payload (cumulative sums
/// of [`VOICE_FRAME_LENGTHS`]).
pub const VOICE_FRAME_OFFSETS: [usize; 9] = [0, 22, 36, 53, 70, 87, 104, 121, 138];

/// Total DFSI payload length of one LDU.
pub const LDU_PAYLOAD_LENGTH: usize = 154;

/// Payload offset of the algorithm id in an LDU2 (voice 15 metadata).
pub const LDU2_ALGO_OFFSET: usize = 88;

/// Superframe buffer length: nine 25-byte slots.
pub const SUPERFRAME_BYTES: usize = 9 * 25;

/// IMBE codeword offsets inside a superframe buffer.
pub const IMBE_OFFSETS: [usize; 9] = [10, 26, 55, 80, 105, 130, 155, 180, 204];

/// The well-known IMBE silence pattern.
pub const NULL_IMBE: [u8; RAW_IMBE_LENGTH_BYTES] = [
    0x04, 0x0C, 0xFD, 0x7B, 0xFB, 0x7D, 0xF2, 0x7B, 0x3D, 0x9E, 0x45,
];

/// IMBE silence as it appears inside an encrypted stream.
pub const ENCRYPTED_NULL_IMBE: [u8; RAW_IMBE_LENGTH_BYTES] = [
    0xFC, 0xE9, 0x32, 0x63, 0xB9, 0xE8, 0x70, 0x80, 0x2B, 0xB9, 0x2E,
];

/// IMBE byte position inside voice frame `n` of an LDU.
const IMBE_FRAME_OFFSETS: [usize; 9] = [10, 1, 5, 5, 5, 5, 5, 5, 1];

/// Frame type tag for voice position `n` (0..9) of the given LDU.
pub const fn frame_type(ldu: Ldu, n: usize) -> u8 {
    match ldu {
        Ldu::Ldu1 => LDU1_VOICE1 + n as u8,
        Ldu::Ldu2 => LDU2_VOICE10 + n as u8,
    }
}

/// Map the superframe counter N (0..18) to its LDU and the IMBE byte
/// offset inside that LDU's superframe buffer.
pub const fn superframe_slot(n: usize) -> (Ldu, usize) {
    assert!(n < 18);
    if n < 9 {
        (Ldu::Ldu1, IMBE_OFFSETS[n])
    } else {
        (Ldu::Ldu2, IMBE_OFFSETS[n - 9])
    }
}

/// Quick structural check: do all nine frame type tags sit at their
/// expected payload offsets?
pub fn tags_valid(payload: &[u8], ldu: Ldu) -> bool {
    if payload.len() < LDU_PAYLOAD_LENGTH {
        return false;
    }
    VOICE_FRAME_OFFSETS
        .iter()
        .enumerate()
        .all(|(n, &off)| payload[off] == frame_type(ldu, n))
}

/// Hamming(10,6,3) parity over the six-bit groups of a 9-byte block:
/// twelve codewords, four parity bits each, packed into six bytes.
fn hamming_parity(data: &[u8; 9]) -> [u8; 6] {
    let mut parity = [0u8; 6];
    for g in 0..12 {
        let mut cw = [false; 10];
        for (j, b) in cw.iter_mut().take(6).enumerate() {
            *b = bits::read_bit(data, g * 6 + j);
        }
        hamming::encode1063(&mut cw);
        for j in 0..4 {
            bits::write_bit(&mut parity, g * 4 + j, cw[6 + j]);
        }
    }
    parity
}

/// Correct single bit errors in a 9-byte block given its parity bytes.
fn hamming_correct(data: &mut [u8; 9], parity: &[u8; 6]) {
    for g in 0..12 {
        let mut cw = [false; 10];
        for (j, b) in cw.iter_mut().take(6).enumerate() {
            *b = bits::read_bit(data, g * 6 + j);
        }
        for j in 0..4 {
            cw[6 + j] = bits::read_bit(parity, g * 4 + j);
        }
        hamming::decode1063(&mut cw);
        for (j, &b) in cw.iter().take(6).enumerate() {
            bits::write_bit(data, g * 6 + j, b);
        }
    }
}

/// Serialise one LDU: nine IMBE codewords out of the superframe buffer
/// plus link control or encryption sync and low speed data, into the
/// fixed 154-byte DFSI payload.
pub fn pack_ldu(
    ldu: Ldu,
    lc: &LinkControl,
    lsd: &LowSpeedData,
    superframe: &[u8; SUPERFRAME_BYTES],
) -> Vec<u8> {
    let mut record = [0u8; 9];
    match ldu {
        Ldu::Ldu1 => record = lc.encode_record(),
        Ldu::Ldu2 => record.copy_from_slice(&lc.mi),
    }
    let parity = hamming_parity(&record);

    let mut payload = vec![0u8; LDU_PAYLOAD_LENGTH];
    for n in 0..9 {
        let off = VOICE_FRAME_OFFSETS[n];
        let len = VOICE_FRAME_LENGTHS[n];
        let frame = &mut payload[off..off + len];
        frame[0] = frame_type(ldu, n);

        let at = IMBE_FRAME_OFFSETS[n];
        frame[at..at + RAW_IMBE_LENGTH_BYTES]
            .copy_from_slice(&superframe[IMBE_OFFSETS[n]..IMBE_OFFSETS[n] + RAW_IMBE_LENGTH_BYTES]);

        match n {
            2..=4 => frame[1..4].copy_from_slice(&record[(n - 2) * 3..(n - 2) * 3 + 3]),
            5 => match ldu {
                Ldu::Ldu1 => frame[1..4].copy_from_slice(&parity[..3]),
                Ldu::Ldu2 => {
                    frame[1] = lc.alg_id;
                    frame[2] = (lc.k_id >> 8) as u8;
                    frame[3] = lc.k_id as u8;
                }
            },
            6 => match ldu {
                Ldu::Ldu1 => frame[1..4].copy_from_slice(&parity[3..6]),
                Ldu::Ldu2 => frame[1..4].copy_from_slice(&parity[..3]),
            },
            7 => match ldu {
                Ldu::Ldu1 => {}
                Ldu::Ldu2 => frame[1..4].copy_from_slice(&parity[3..6]),
            },
            8 => {
                frame[12] = lsd.lsd1;
                frame[13] = lsd.lsd2;
            }
            _ => {}
        }
    }
    payload
}

/// Deserialise one LDU payload: IMBE codewords into the superframe
/// buffer, link control or encryption sync and LSD out. For LDU1 the
/// returned link control carries the full record; for LDU2 only the
/// encryption sync fields are meaningful.
pub fn unpack_ldu(
    ldu: Ldu,
    payload: &[u8],
    superframe: &mut [u8; SUPERFRAME_BYTES],
) -> Result<(LinkControl, LowSpeedData)> {
    if payload.len() < LDU_PAYLOAD_LENGTH {
        return Err(Error::Frame(format!(
            "short LDU payload: {} bytes",
            payload.len()
        )));
    }
    if !tags_valid(payload, ldu) {
        return Err(Error::Frame("DFSI voice frame tags out of place".into()));
    }

    let mut record = [0u8; 9];
    let mut parity = [0u8; 6];
    let mut sync = [0u8; 3];
    let mut lsd = LowSpeedData::default();
    for n in 0..9 {
        let off = VOICE_FRAME_OFFSETS[n];
        let len = VOICE_FRAME_LENGTHS[n];
        let frame = &payload[off..off + len];

        let at = IMBE_FRAME_OFFSETS[n];
        superframe[IMBE_OFFSETS[n]..IMBE_OFFSETS[n] + RAW_IMBE_LENGTH_BYTES]
            .copy_from_slice(&frame[at..at + RAW_IMBE_LENGTH_BYTES]);

        match n {
            2..=4 => record[(n - 2) * 3..(n - 2) * 3 + 3].copy_from_slice(&frame[1..4]),
            5 => match ldu {
                Ldu::Ldu1 => parity[..3].copy_from_slice(&frame[1..4]),
                Ldu::Ldu2 => sync.copy_from_slice(&frame[1..4]),
            },
            6 => match ldu {
                Ldu::Ldu1 => parity[3..6].copy_from_slice(&frame[1..4]),
                Ldu::Ldu2 => parity[..3].copy_from_slice(&frame[1..4]),
            },
            7 => {
                if ldu == Ldu::Ldu2 {
                    parity[3..6].copy_from_slice(&frame[1..4]);
                }
            }
            8 => {
                lsd.lsd1 = frame[12];
                lsd.lsd2 = frame[13];
            }
            _ => {}
        }
    }
    hamming_correct(&mut record, &parity);

    let lc = match ldu {
        Ldu::Ldu1 => LinkControl::decode_record(&record)?,
        Ldu::Ldu2 => {
            let mut lc = LinkControl {
                alg_id: sync[0],
                ..LinkControl::default()
            };
            if lc.alg_id != crate::lc::ALGO_UNENCRYPT {
                lc.mi.copy_from_slice(&record[..MI_LENGTH_BYTES]);
                lc.k_id = u16::from_be_bytes([sync[1], sync[2]]);
                lc.encrypted = true;
            }
            lc
        }
    };
    Ok((lc, lsd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lc::ALGO_ARC4;
    use crate::tests::patterned;

    fn test_superframe(seed: u8) -> [u8; SUPERFRAME_BYTES] {
        let mut sf = [0u8; SUPERFRAME_BYTES];
        for (n, &off) in IMBE_OFFSETS.iter().enumerate() {
            let imbe = patterned(RAW_IMBE_LENGTH_BYTES, seed.wrapping_add(n as u8));
            sf[off..off + RAW_IMBE_LENGTH_BYTES].copy_from_slice(&imbe);
        }
        sf
    }

    #[test]
    fn table_is_consistent() {
        let mut off = 0;
        for n in 0..9 {
            assert_eq!(VOICE_FRAME_OFFSETS[n], off);
            off += VOICE_FRAME_LENGTHS[n];
            // The IMBE plus trailing byte always fit the frame.
            assert!(IMBE_FRAME_OFFSETS[n] + RAW_IMBE_LENGTH_BYTES < VOICE_FRAME_LENGTHS[n]);
        }
        assert_eq!(off, LDU_PAYLOAD_LENGTH);
        assert_eq!(frame_type(Ldu::Ldu1, 8), 0x6A);
        assert_eq!(frame_type(Ldu::Ldu2, 0), 0x6B);
        assert_eq!(frame_type(Ldu::Ldu2, 8), 0x73);
        // The encryption sync sits where the engine reads it.
        assert_eq!(VOICE_FRAME_OFFSETS[5] + 1, LDU2_ALGO_OFFSET);
    }

    #[test]
    fn superframe_slots_walk_both_ldus() {
        assert_eq!(superframe_slot(0), (Ldu::Ldu1, 10));
        assert_eq!(superframe_slot(8), (Ldu::Ldu1, 204));
        assert_eq!(superframe_slot(9), (Ldu::Ldu2, 10));
        assert_eq!(superframe_slot(17), (Ldu::Ldu2, 204));
    }

    #[test]
    fn ldu1_roundtrip() -> Result<()> {
        let mut lc = LinkControl::group(700_000, 42);
        lc.emergency = true;
        let lsd = LowSpeedData {
            lsd1: 0xAB,
            lsd2: 0xCD,
        };
        let sf = test_superframe(5);

        let payload = pack_ldu(Ldu::Ldu1, &lc, &lsd, &sf);
        assert_eq!(payload.len(), LDU_PAYLOAD_LENGTH);
        assert!(tags_valid(&payload, Ldu::Ldu1));
        assert!(!tags_valid(&payload, Ldu::Ldu2));

        let mut out = [0u8; SUPERFRAME_BYTES];
        let (got, got_lsd) = unpack_ldu(Ldu::Ldu1, &payload, &mut out)?;
        assert_eq!(got.src_id, 700_000);
        assert_eq!(got.dst_id, 42);
        assert!(got.emergency);
        assert_eq!(got_lsd, lsd);
        for &off in &IMBE_OFFSETS {
            assert_eq!(
                &out[off..off + RAW_IMBE_LENGTH_BYTES],
                &sf[off..off + RAW_IMBE_LENGTH_BYTES]
            );
        }
        Ok(())
    }

    #[test]
    fn ldu2_roundtrip_carries_encryption_sync() -> Result<()> {
        let mut lc = LinkControl::group(1, 2);
        lc.alg_id = ALGO_ARC4;
        lc.k_id = 0x2601;
        lc.mi = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x00];
        let sf = test_superframe(9);

        let payload = pack_ldu(Ldu::Ldu2, &lc, &LowSpeedData::default(), &sf);
        assert_eq!(payload[LDU2_ALGO_OFFSET], ALGO_ARC4);
        let mut out = [0u8; SUPERFRAME_BYTES];
        let (got, _) = unpack_ldu(Ldu::Ldu2, &payload, &mut out)?;
        assert_eq!(got.alg_id, ALGO_ARC4);
        assert_eq!(got.k_id, 0x2601);
        assert_eq!(got.mi, lc.mi);
        Ok(())
    }

    #[test]
    fn record_survives_bit_errors() -> Result<()> {
        let lc = LinkControl::group(123_456, 77);
        let sf = test_superframe(1);
        let mut payload = pack_ldu(Ldu::Ldu1, &lc, &LowSpeedData::default(), &sf);

        // One bit flip in each record carrier byte; every six-bit
        // group sees at most a single error.
        payload[VOICE_FRAME_OFFSETS[2] + 1] ^= 0x80;
        payload[VOICE_FRAME_OFFSETS[3] + 2] ^= 0x02;
        payload[VOICE_FRAME_OFFSETS[4] + 3] ^= 0x01;

        let mut out = [0u8; SUPERFRAME_BYTES];
        let (got, _) = unpack_ldu(Ldu::Ldu1, &payload, &mut out)?;
        assert_eq!(got.src_id, 123_456);
        assert_eq!(got.dst_id, 77);
        Ok(())
    }

    #[test]
    fn misplaced_tag_is_rejected() {
        let lc = LinkControl::group(1, 2);
        let sf = test_superframe(0);
        let mut payload = pack_ldu(Ldu::Ldu1, &lc, &LowSpeedData::default(), &sf);
        payload[VOICE_FRAME_OFFSETS[4]] = 0x00;
        let mut out = [0u8; SUPERFRAME_BYTES];
        assert!(unpack_ldu(Ldu::Ldu1, &payload, &mut out).is_err());
    }
}
