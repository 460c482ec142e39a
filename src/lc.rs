/*! Link control records.

A [`LinkControl`] is built for every call-carrying frame and thrown
away afterwards. It serialises into three fixed layouts:

* the HDU record (message indicator, MFID, algorithm, key id,
  destination) under RS(36,20,17) with per-group Golay(18,6,8),
* the LDU1 record (opcode dependent addressing and service options)
  under RS(24,12,13) with per-group Hamming(10,6,3),
* the LDU2 record (encryption sync) under RS(24,16,9) with the same
  Hamming protection,

plus the terminator-with-LC variant under Golay(24,12,8).

Vendor extensions are carried opaquely: a non-standard MFID packs and
unpacks the 64-bit record remainder verbatim through `rs_value`, and
the opcode collapses to GROUP on decode so downstream dispatch always
sees a canonical opcode.
*/
use crate::bits;
use crate::golay;
use crate::hamming;
use crate::reed_solomon::{rs_24_12_13, rs_24_16_9, rs_36_20_17};
use crate::{Error, MI_LENGTH_BYTES, Result};

/// Link control opcodes handled by the bridge.
pub mod lco {
    /// Group voice channel user.
    pub const GROUP: u8 = 0x00;
    /// Group voice channel update.
    pub const GROUP_UPDT: u8 = 0x02;
    /// Unit-to-unit voice channel user.
    pub const PRIVATE: u8 = 0x03;
    /// Telephone interconnect voice channel user.
    pub const TEL_INT_VCH_USER: u8 = 0x04;
    /// Explicit source id carrying network and system id.
    pub const EXPLICIT_SOURCE_ID: u8 = 0x07;
    /// RF subsystem status broadcast.
    pub const RFSS_STS_BCAST: u8 = 0x20;
}

/// Standard manufacturer id.
pub const MFG_STANDARD: u8 = 0x00;
/// Alternate standard manufacturer id.
pub const MFG_STANDARD_ALT: u8 = 0x01;

/// Default network id (WACN).
pub const WACN_STD_DEFAULT: u32 = 0xBB800;
/// Default system id.
pub const SID_STD_DEFAULT: u32 = 0x001;

/// Algorithm id for clear traffic.
pub const ALGO_UNENCRYPT: u8 = 0x80;
/// Algorithm id for DES-OFB.
pub const ALGO_DES: u8 = 0x81;
/// Algorithm id for AES-256.
pub const ALGO_AES_256: u8 = 0x84;
/// Algorithm id for ARC4 ("ADP").
pub const ALGO_ARC4: u8 = 0xAA;

/// Packed link control record length before FEC.
pub const LC_RECORD_BYTES: usize = 9;
/// Air frame sized to hold the Golay protected header record.
pub const HDU_FRAME_LENGTH_BYTES: usize = 128;
/// Air frame sized to hold an LDU.
pub const LDU_FRAME_LENGTH_BYTES: usize = 196;
/// Air frame sized to hold the terminator with link control.
pub const TDULC_FRAME_LENGTH_BYTES: usize = 66;

/// Bit position of the header record in the HDU air frame.
const HDU_CELL_START: usize = 114;
/// Bit position of the terminator record in the TDULC air frame.
const TDULC_CELL_START: usize = 114;

/// LDU link control cells: protocol start bit and payload bit count.
/// Together the cells carry the Hamming protected 24-byte RS codeword.
const LDU_CELLS: [(usize, usize); 6] = [
    (410, 60),
    (600, 60),
    (788, 50),
    (978, 50),
    (1168, 50),
    (1356, 50),
];

/// Low speed data bytes riding along with each LDU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LowSpeedData {
    /// First LSD byte.
    pub lsd1: u8,
    /// Second LSD byte.
    pub lsd2: u8,
}

/// Link control data for HDU, LDU1 and LDU2 frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkControl {
    /// Link control opcode, 6 bits.
    pub lco: u8,
    /// Protect flag.
    pub protect: bool,
    /// Manufacturer id.
    pub mfid: u8,
    /// Source radio address, 24 bits.
    pub src_id: u32,
    /// Destination address: talkgroup or unit, up to 24 bits.
    pub dst_id: u32,
    /// Second talkgroup of a group update.
    pub dst_id_b: u32,
    /// Voice channel number of a group update.
    pub grp_vch_no: u32,
    /// Second voice channel number of a group update.
    pub grp_vch_no_b: u32,
    /// Channel identity used by group updates.
    pub chan_id: u8,
    /// Explicit source id flag.
    pub explicit_id: bool,
    /// Network id, 20 bits, for explicit LCs.
    pub net_id: u32,
    /// System id, 12 bits, for explicit LCs.
    pub sys_id: u32,
    /// Emergency flag.
    pub emergency: bool,
    /// Encrypted flag.
    pub encrypted: bool,
    /// Priority, 3 bits, never 0 after decode.
    pub priority: u8,
    /// Group (vs unit-to-unit) flag.
    pub group: bool,
    /// Call timer of a telephone interconnect, units of 100 ms.
    pub call_timer: u16,
    /// Encryption algorithm id.
    pub alg_id: u8,
    /// Encryption key id.
    pub k_id: u16,
    /// Message indicator.
    pub mi: [u8; MI_LENGTH_BYTES],
    /// Packed record remainder, carried verbatim for vendor MFIDs.
    pub rs_value: u64,
}

impl Default for LinkControl {
    fn default() -> Self {
        Self {
            lco: lco::GROUP,
            protect: false,
            mfid: MFG_STANDARD,
            src_id: 0,
            dst_id: 0,
            dst_id_b: 0,
            grp_vch_no: 0,
            grp_vch_no_b: 0,
            chan_id: 0,
            explicit_id: false,
            net_id: WACN_STD_DEFAULT,
            sys_id: SID_STD_DEFAULT,
            emergency: false,
            encrypted: false,
            priority: 4,
            group: true,
            call_timer: 0,
            alg_id: ALGO_UNENCRYPT,
            k_id: 0,
            mi: [0; MI_LENGTH_BYTES],
            rs_value: 0,
        }
    }
}

impl LinkControl {
    /// Group call link control with the usual defaults.
    pub fn group(src_id: u32, dst_id: u32) -> Self {
        Self {
            src_id,
            dst_id,
            ..Self::default()
        }
    }

    /// Whether the MFID is one of the two standard values.
    pub fn is_standard_mfid(&self) -> bool {
        self.mfid == MFG_STANDARD || self.mfid == MFG_STANDARD_ALT
    }

    /// Pack the 9-byte link control record: opcode byte plus a 64-bit
    /// remainder whose layout depends on the opcode.
    pub fn encode_record(&self) -> [u8; LC_RECORD_BYTES] {
        let mut rs = [0u8; LC_RECORD_BYTES];
        rs[0] = self.lco & 0x3F;
        if self.protect {
            rs[0] |= 0x80;
        }

        let value: u64;
        if !self.is_standard_mfid() {
            // Vendor opcode: pass the packed record through untouched.
            value = self.rs_value;
        } else {
            let svc = (if self.emergency { 0x80u64 } else { 0 })
                + (if self.encrypted { 0x40 } else { 0 })
                + u64::from(self.priority & 0x07);
            match self.lco {
                lco::GROUP => {
                    let mut v = u64::from(self.mfid);
                    v = (v << 8) + svc;
                    v = (v << 8) + u64::from(self.explicit_id);
                    v = (v << 16) + u64::from(self.dst_id & 0xFFFF);
                    value = (v << 24) + u64::from(self.src_id & 0xFF_FFFF);
                }
                lco::GROUP_UPDT => {
                    rs[0] |= 0x40;
                    let mut v = u64::from(self.chan_id & 0x0F);
                    v = (v << 12) + u64::from(self.grp_vch_no & 0xFFF);
                    v = (v << 16) + u64::from(self.dst_id & 0xFFFF);
                    v = (v << 4) + u64::from(self.chan_id & 0x0F);
                    v = (v << 12) + u64::from(self.grp_vch_no_b & 0xFFF);
                    value = (v << 16) + u64::from(self.dst_id_b & 0xFFFF);
                }
                lco::PRIVATE => {
                    let mut v = u64::from(self.mfid);
                    v = (v << 8) + svc;
                    v = (v << 24) + u64::from(self.dst_id & 0xFF_FFFF);
                    value = (v << 24) + u64::from(self.src_id & 0xFF_FFFF);
                }
                lco::TEL_INT_VCH_USER => {
                    rs[0] |= 0x40;
                    let mut v = svc;
                    v = (v << 16) + u64::from(self.call_timer);
                    value = (v << 24) + u64::from(self.src_id & 0xFF_FFFF);
                }
                lco::EXPLICIT_SOURCE_ID => {
                    rs[0] |= 0x40;
                    let mut v = u64::from(self.net_id & 0xF_FFFF);
                    v = (v << 12) + u64::from(self.sys_id & 0xFFF);
                    value = (v << 24) + u64::from(self.src_id & 0xFF_FFFF);
                }
                _ => {
                    // Unknown standard opcode: encode an empty record,
                    // the decoder on the far end rejects it anyway.
                    value = 0;
                }
            }
        }

        rs[1..9].copy_from_slice(&value.to_be_bytes());
        rs
    }

    /// Unpack a 9-byte link control record.
    ///
    /// A non-standard MFID yields an opaque record: `rs_value` holds
    /// the remainder bit-exact and the opcode collapses to GROUP so
    /// higher level dispatch stays uniform.
    pub fn decode_record(rs: &[u8]) -> Result<Self> {
        let mut lc = Self {
            protect: rs[0] & 0x80 == 0x80,
            lco: rs[0] & 0x3F,
            ..Self::default()
        };

        let value = u64::from_be_bytes(rs[1..9].try_into().unwrap());
        lc.rs_value = value;

        let implicit = rs[0] & 0x40 == 0x40;
        lc.mfid = if implicit { MFG_STANDARD } else { rs[1] };

        if !lc.is_standard_mfid() {
            lc.lco = lco::GROUP;
            return Ok(lc);
        }

        let svc = rs[2];
        match lc.lco {
            lco::GROUP => {
                lc.mfid = rs[1];
                lc.group = true;
                lc.emergency = svc & 0x80 == 0x80;
                lc.encrypted = svc & 0x40 == 0x40;
                lc.priority = svc & 0x07;
                lc.explicit_id = rs[3] & 0x01 == 0x01;
                lc.dst_id = ((value >> 24) & 0xFFFF) as u32;
                lc.src_id = (value & 0xFF_FFFF) as u32;
            }
            lco::GROUP_UPDT => {
                lc.group = true;
                lc.chan_id = ((value >> 60) & 0x0F) as u8;
                lc.grp_vch_no = ((value >> 48) & 0xFFF) as u32;
                lc.dst_id = ((value >> 32) & 0xFFFF) as u32;
                lc.grp_vch_no_b = ((value >> 16) & 0xFFF) as u32;
                lc.dst_id_b = (value & 0xFFFF) as u32;
            }
            lco::PRIVATE => {
                lc.mfid = rs[1];
                lc.group = false;
                lc.emergency = svc & 0x80 == 0x80;
                lc.encrypted = svc & 0x40 == 0x40;
                lc.priority = svc & 0x07;
                lc.dst_id = ((value >> 24) & 0xFF_FFFF) as u32;
                lc.src_id = (value & 0xFF_FFFF) as u32;
            }
            lco::TEL_INT_VCH_USER => {
                let svc = ((value >> 40) & 0xFF) as u8;
                lc.emergency = svc & 0x80 == 0x80;
                lc.encrypted = svc & 0x40 == 0x40;
                lc.priority = svc & 0x07;
                lc.call_timer = ((value >> 24) & 0xFFFF) as u16;
                lc.src_id = (value & 0xFF_FFFF) as u32;
            }
            lco::EXPLICIT_SOURCE_ID => {
                lc.net_id = ((value >> 36) & 0xF_FFFF) as u32;
                lc.sys_id = ((value >> 24) & 0xFFF) as u32;
                lc.src_id = (value & 0xFF_FFFF) as u32;
            }
            _ => {
                return Err(Error::Frame(format!(
                    "unknown LC value, mfId = ${:02X}, lco = ${:02X}",
                    lc.mfid, lc.lco
                )));
            }
        }

        // Priority 0 is reserved; remap to the default.
        if lc.priority == 0 {
            lc.priority = 4;
        }

        Ok(lc)
    }

    /// Encode a header data unit air frame.
    pub fn encode_hdu(&self) -> [u8; HDU_FRAME_LENGTH_BYTES] {
        let codec = rs_36_20_17();
        let mut rs = [0u8; 36];
        rs[..MI_LENGTH_BYTES].copy_from_slice(&self.mi);
        rs[9] = self.mfid;
        rs[10] = self.alg_id;
        rs[11] = (self.k_id >> 8) as u8;
        rs[12] = self.k_id as u8;
        rs[13] = (self.dst_id >> 8) as u8;
        rs[14] = self.dst_id as u8;
        codec.encode(&mut rs);

        let raw = golay_protect(&rs);
        let mut frame = [0u8; HDU_FRAME_LENGTH_BYTES];
        bits::insert(&mut frame, HDU_CELL_START, 36 * 8 * 3, &raw);
        frame
    }

    /// Decode a header data unit air frame.
    pub fn decode_hdu(frame: &[u8]) -> Result<Self> {
        let mut raw = vec![0u8; 36 * 3];
        bits::extract(frame, HDU_CELL_START, 36 * 8 * 3, &mut raw);
        let mut rs = golay_unprotect(&raw);
        rs_36_20_17().decode(&mut rs)?;

        let mut lc = Self {
            mfid: rs[9],
            alg_id: rs[10],
            ..Self::default()
        };
        if lc.alg_id != ALGO_UNENCRYPT {
            lc.mi.copy_from_slice(&rs[..MI_LENGTH_BYTES]);
            lc.k_id = u16::from_be_bytes([rs[11], rs[12]]);
            lc.encrypted = true;
        } else {
            lc.k_id = 0;
            lc.encrypted = false;
        }
        lc.dst_id = u32::from(u16::from_be_bytes([rs[13], rs[14]]));
        Ok(lc)
    }

    /// Encode an LDU1 link control air frame.
    pub fn encode_ldu1(&self, frame: &mut [u8]) {
        let codec = rs_24_12_13();
        let mut rs = [0u8; 24];
        rs[..LC_RECORD_BYTES].copy_from_slice(&self.encode_record());
        codec.encode(&mut rs);
        write_ldu_cells(frame, &rs);
    }

    /// Decode an LDU1 link control air frame.
    pub fn decode_ldu1(frame: &[u8]) -> Result<Self> {
        let mut rs = read_ldu_cells(frame);
        rs_24_12_13().decode(&mut rs)?;
        Self::decode_record(&rs)
    }

    /// Encode an LDU2 link control (encryption sync) air frame.
    pub fn encode_ldu2(&self, frame: &mut [u8]) {
        let codec = rs_24_16_9();
        let mut rs = [0u8; 24];
        rs[..MI_LENGTH_BYTES].copy_from_slice(&self.mi);
        rs[9] = self.alg_id;
        rs[10] = (self.k_id >> 8) as u8;
        rs[11] = self.k_id as u8;
        codec.encode(&mut rs);
        write_ldu_cells(frame, &rs);
    }

    /// Decode an LDU2 link control air frame into this LC, updating
    /// the encryption sync fields.
    pub fn decode_ldu2(&mut self, frame: &[u8]) -> Result<()> {
        let mut rs = read_ldu_cells(frame);
        rs_24_16_9().decode(&mut rs)?;

        self.alg_id = rs[9];
        if self.alg_id != ALGO_UNENCRYPT {
            self.mi.copy_from_slice(&rs[..MI_LENGTH_BYTES]);
            self.k_id = u16::from_be_bytes([rs[10], rs[11]]);
            self.encrypted = true;
        } else {
            self.mi = [0; MI_LENGTH_BYTES];
            self.k_id = 0;
            self.encrypted = false;
        }
        Ok(())
    }

    /// Encode a terminator-with-LC air frame.
    pub fn encode_tdulc(&self) -> [u8; TDULC_FRAME_LENGTH_BYTES] {
        let codec = rs_24_12_13();
        let mut rs = [0u8; 24];
        rs[..LC_RECORD_BYTES].copy_from_slice(&self.encode_record());
        codec.encode(&mut rs);

        // Sixteen 12-bit groups under the full Golay.
        let mut raw = [0u8; 48];
        for g in 0..16 {
            let mut data = 0u16;
            for j in 0..12 {
                data = (data << 1) | u16::from(bits::read_bit(&rs, g * 12 + j));
            }
            let cw = golay::encode24128(data);
            for j in 0..24 {
                bits::write_bit(&mut raw, g * 24 + j, cw & (1 << (23 - j)) != 0);
            }
        }

        let mut frame = [0u8; TDULC_FRAME_LENGTH_BYTES];
        bits::insert(&mut frame, TDULC_CELL_START, 16 * 24, &raw);
        frame
    }

    /// Decode a terminator-with-LC air frame.
    pub fn decode_tdulc(frame: &[u8]) -> Result<Self> {
        let mut raw = [0u8; 48];
        bits::extract(frame, TDULC_CELL_START, 16 * 24, &mut raw);

        let mut rs = [0u8; 24];
        for g in 0..16 {
            let mut cw = 0u32;
            for j in 0..24 {
                cw = (cw << 1) | u32::from(bits::read_bit(&raw, g * 24 + j));
            }
            // On Golay failure keep the raw data bits; the outer RS
            // still gets a shot at the symbol.
            let data = golay::decode24128(cw).unwrap_or(((cw >> 12) & 0xFFF) as u16);
            for j in 0..12 {
                bits::write_bit(&mut rs, g * 12 + j, data & (1 << (11 - j)) != 0);
            }
        }
        rs_24_12_13().decode(&mut rs)?;
        Self::decode_record(&rs)
    }
}

/// Golay protect a byte buffer as consecutive six-bit groups.
fn golay_protect(data: &[u8]) -> Vec<u8> {
    let groups = data.len() * 8 / 6;
    let mut out = vec![0u8; (groups * 18).div_ceil(8)];
    for g in 0..groups {
        let mut six = 0u8;
        for j in 0..6 {
            six = (six << 1) | u8::from(bits::read_bit(data, g * 6 + j));
        }
        let cw = golay::encode1868(six);
        for j in 0..18 {
            bits::write_bit(&mut out, g * 18 + j, cw & (1 << (17 - j)) != 0);
        }
    }
    out
}

/// Undo [`golay_protect`]. Groups that fail to decode fall back to
/// their raw data bits so the outer Reed-Solomon can finish the job.
fn golay_unprotect(raw: &[u8]) -> Vec<u8> {
    let groups = raw.len() * 8 / 18;
    let mut out = vec![0u8; groups * 6 / 8];
    for g in 0..groups {
        let mut cw = 0u32;
        for j in 0..18 {
            cw = (cw << 1) | u32::from(bits::read_bit(raw, g * 18 + j));
        }
        let six = golay::decode1868(cw).unwrap_or(((cw >> 12) & 0x3F) as u8);
        for j in 0..6 {
            bits::write_bit(&mut out, g * 6 + j, six & (1 << (5 - j)) != 0);
        }
    }
    out
}

/// Hamming protect the 24-byte RS codeword and spread it over the six
/// link control cells of an LDU air frame.
fn write_ldu_cells(frame: &mut [u8], rs: &[u8; 24]) {
    let mut protected = [0u8; 40];
    let mut n = 0;
    for g in 0..32 {
        let mut cw = [false; 10];
        for (j, b) in cw.iter_mut().take(6).enumerate() {
            *b = bits::read_bit(rs, g * 6 + j);
        }
        hamming::encode1063(&mut cw);
        for b in cw {
            bits::write_bit(&mut protected, n, b);
            n += 1;
        }
    }

    let mut off = 0;
    for (start, count) in LDU_CELLS {
        let mut cell = [0u8; 8];
        for j in 0..count {
            bits::write_bit(&mut cell, j, bits::read_bit(&protected, off + j));
        }
        bits::insert(frame, start, count, &cell);
        off += count;
    }
}

/// Gather the six link control cells of an LDU air frame and strip the
/// Hamming protection back to the 24-byte RS codeword.
fn read_ldu_cells(frame: &[u8]) -> [u8; 24] {
    let mut protected = [0u8; 40];
    let mut off = 0;
    for (start, count) in LDU_CELLS {
        let mut cell = [0u8; 8];
        bits::extract(frame, start, count, &mut cell);
        for j in 0..count {
            bits::write_bit(&mut protected, off + j, bits::read_bit(&cell, j));
        }
        off += count;
    }

    let mut rs = [0u8; 24];
    let mut n = 0;
    for g in 0..32 {
        let mut cw = [false; 10];
        for b in cw.iter_mut() {
            *b = bits::read_bit(&protected, n);
            n += 1;
        }
        hamming::decode1063(&mut cw);
        for (j, &b) in cw.iter().take(6).enumerate() {
            bits::write_bit(&mut rs, g * 6 + j, b);
        }
    }
    rs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip_group() -> Result<()> {
        let mut lc = LinkControl::group(3_112_456, 4099);
        lc.emergency = true;
        lc.priority = 6;
        lc.encrypted = true;
        let rs = lc.encode_record();
        let got = LinkControl::decode_record(&rs)?;
        assert_eq!(got.lco, lco::GROUP);
        assert_eq!(got.src_id, 3_112_456);
        assert_eq!(got.dst_id, 4099);
        assert!(got.emergency);
        assert!(got.encrypted);
        assert_eq!(got.priority, 6);
        assert!(got.group);
        Ok(())
    }

    #[test]
    fn record_roundtrip_private() -> Result<()> {
        let mut lc = LinkControl::group(99, 12_000_345);
        lc.lco = lco::PRIVATE;
        lc.group = false;
        let rs = lc.encode_record();
        let got = LinkControl::decode_record(&rs)?;
        assert_eq!(got.lco, lco::PRIVATE);
        assert!(!got.group);
        assert_eq!(got.dst_id, 12_000_345);
        assert_eq!(got.src_id, 99);
        Ok(())
    }

    #[test]
    fn record_roundtrip_tel_int() -> Result<()> {
        let mut lc = LinkControl::group(555, 0);
        lc.lco = lco::TEL_INT_VCH_USER;
        lc.call_timer = 3000;
        let got = LinkControl::decode_record(&lc.encode_record())?;
        assert_eq!(got.lco, lco::TEL_INT_VCH_USER);
        assert_eq!(got.call_timer, 3000);
        assert_eq!(got.src_id, 555);
        Ok(())
    }

    #[test]
    fn record_roundtrip_explicit_source() -> Result<()> {
        let mut lc = LinkControl::group(777, 0);
        lc.lco = lco::EXPLICIT_SOURCE_ID;
        lc.net_id = 0xABCDE;
        lc.sys_id = 0x123;
        let got = LinkControl::decode_record(&lc.encode_record())?;
        assert_eq!(got.lco, lco::EXPLICIT_SOURCE_ID);
        assert_eq!(got.net_id, 0xABCDE);
        assert_eq!(got.sys_id, 0x123);
        assert_eq!(got.src_id, 777);
        Ok(())
    }

    #[test]
    fn record_roundtrip_group_update() -> Result<()> {
        let mut lc = LinkControl::group(0, 100);
        lc.lco = lco::GROUP_UPDT;
        lc.chan_id = 0x0A;
        lc.grp_vch_no = 0x123;
        lc.grp_vch_no_b = 0x456;
        lc.dst_id_b = 200;
        let got = LinkControl::decode_record(&lc.encode_record())?;
        assert_eq!(got.lco, lco::GROUP_UPDT);
        assert_eq!(got.chan_id, 0x0A);
        assert_eq!(got.grp_vch_no, 0x123);
        assert_eq!(got.dst_id, 100);
        assert_eq!(got.grp_vch_no_b, 0x456);
        assert_eq!(got.dst_id_b, 200);
        Ok(())
    }

    #[test]
    fn priority_zero_remaps_to_four() -> Result<()> {
        let mut lc = LinkControl::group(1, 2);
        lc.priority = 0;
        let got = LinkControl::decode_record(&lc.encode_record())?;
        assert_eq!(got.priority, 4);
        Ok(())
    }

    #[test]
    fn vendor_mfid_is_opaque_and_collapses_to_group() -> Result<()> {
        let mut lc = LinkControl::group(1, 2);
        lc.lco = 0x2A;
        lc.mfid = 0x90;
        lc.rs_value = 0x90DE_AD00_BEEF_1234;
        let rs = lc.encode_record();
        let got = LinkControl::decode_record(&rs)?;
        assert_eq!(got.lco, lco::GROUP);
        assert_eq!(got.mfid, 0x90);
        assert_eq!(got.rs_value, 0x90DE_AD00_BEEF_1234);
        Ok(())
    }

    #[test]
    fn unknown_standard_lco_is_an_error() {
        let mut rs = [0u8; 9];
        rs[0] = 0x3F;
        rs[1] = MFG_STANDARD;
        assert!(LinkControl::decode_record(&rs).is_err());
    }

    #[test]
    fn hdu_air_frame_roundtrip() -> Result<()> {
        let mut lc = LinkControl::group(0, 10);
        lc.alg_id = ALGO_AES_256;
        lc.k_id = 0x1234;
        lc.mi = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0x01];
        let frame = lc.encode_hdu();
        let got = LinkControl::decode_hdu(&frame)?;
        assert_eq!(got.alg_id, ALGO_AES_256);
        assert_eq!(got.k_id, 0x1234);
        assert_eq!(got.mi, lc.mi);
        assert_eq!(got.dst_id, 10);
        assert!(got.encrypted);
        Ok(())
    }

    #[test]
    fn hdu_clear_zeroes_key_material() -> Result<()> {
        let mut lc = LinkControl::group(0, 10);
        lc.alg_id = ALGO_UNENCRYPT;
        lc.k_id = 0xBEEF;
        lc.mi = [0xFF; 9];
        let got = LinkControl::decode_hdu(&lc.encode_hdu())?;
        assert_eq!(got.k_id, 0);
        assert_eq!(got.mi, [0; 9]);
        assert!(!got.encrypted);
        Ok(())
    }

    #[test]
    fn hdu_survives_bit_errors() -> Result<()> {
        let mut lc = LinkControl::group(0, 42);
        lc.alg_id = ALGO_DES;
        lc.k_id = 0x0042;
        lc.mi = [9, 8, 7, 6, 5, 4, 3, 2, 1];
        let mut frame = lc.encode_hdu();
        // Smash a couple of full Golay groups; RS mops up.
        for n in [200usize, 201, 202, 260, 261] {
            let b = bits::read_bit(&frame, n);
            bits::write_bit(&mut frame, n, !b);
        }
        let got = LinkControl::decode_hdu(&frame)?;
        assert_eq!(got.k_id, 0x0042);
        assert_eq!(got.mi, lc.mi);
        Ok(())
    }

    #[test]
    fn ldu1_air_frame_roundtrip_with_errors() -> Result<()> {
        let mut lc = LinkControl::group(1_234_567, 999);
        lc.emergency = true;
        let mut frame = vec![0u8; LDU_FRAME_LENGTH_BYTES];
        lc.encode_ldu1(&mut frame);

        // One flipped bit per cell: Hamming corrects all of them.
        for n in [412usize, 603, 793, 980, 1170, 1358] {
            let b = bits::read_bit(&frame, n);
            bits::write_bit(&mut frame, n, !b);
        }

        let got = LinkControl::decode_ldu1(&frame)?;
        assert_eq!(got.src_id, 1_234_567);
        assert_eq!(got.dst_id, 999);
        assert!(got.emergency);
        Ok(())
    }

    #[test]
    fn ldu2_air_frame_roundtrip() -> Result<()> {
        let mut lc = LinkControl::group(1, 2);
        lc.alg_id = ALGO_ARC4;
        lc.k_id = 0x55AA;
        lc.mi = [1, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut frame = vec![0u8; LDU_FRAME_LENGTH_BYTES];
        lc.encode_ldu2(&mut frame);

        let mut got = LinkControl::group(1, 2);
        got.decode_ldu2(&frame)?;
        assert_eq!(got.alg_id, ALGO_ARC4);
        assert_eq!(got.k_id, 0x55AA);
        assert_eq!(got.mi, lc.mi);
        Ok(())
    }

    #[test]
    fn ldu2_clear_forces_mi_zero() -> Result<()> {
        let mut lc = LinkControl::group(1, 2);
        lc.alg_id = ALGO_UNENCRYPT;
        lc.mi = [0xAA; 9];
        lc.k_id = 7;
        let mut frame = vec![0u8; LDU_FRAME_LENGTH_BYTES];
        lc.encode_ldu2(&mut frame);
        let mut got = LinkControl::group(1, 2);
        got.mi = [1; 9];
        got.decode_ldu2(&frame)?;
        assert_eq!(got.mi, [0; 9]);
        assert_eq!(got.k_id, 0);
        Ok(())
    }

    #[test]
    fn tdulc_air_frame_roundtrip() -> Result<()> {
        let lc = LinkControl::group(31337, 10);
        let frame = lc.encode_tdulc();
        let got = LinkControl::decode_tdulc(&frame)?;
        assert_eq!(got.src_id, 31337);
        assert_eq!(got.dst_id, 10);
        Ok(())
    }

    #[test]
    fn corrupt_ldu1_reports_uncorrectable() {
        let lc = LinkControl::group(1, 2);
        let mut frame = vec![0u8; LDU_FRAME_LENGTH_BYTES];
        lc.encode_ldu1(&mut frame);
        // Stomp whole cells; way past what the FEC chain tolerates.
        for byte in frame.iter_mut().skip(50).take(130) {
            *byte ^= 0xA7;
        }
        assert!(LinkControl::decode_ldu1(&frame).is_err());
    }
}
