/*! Per-call keystream state for the voice ciphers.

Three traffic encryption algorithms, all applied as keystream XOR over
the 88 bits of each IMBE codeword:

* AES-256 in OFB mode, IV derived from the message indicator,
* ARC4 ("ADP"), RC4 seeded from TEK ‖ MI with the leading keystream
  discarded,
* DES in OFB mode seeded from the low 8 MI bytes.

One keystream covers one superframe (an LDU1/LDU2 pair): LDU1 voice
frames consume the first 99 bytes, LDU2 frames start 101 bytes in (the
air interface spends two bytes on low speed data between them). At the
superframe boundary the MI advances through the air-interface LFSR and
the keystream regenerates.
*/
use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use log::debug;
use rand::RngCore;

use crate::lc::{ALGO_AES_256, ALGO_ARC4, ALGO_DES, ALGO_UNENCRYPT};
use crate::{Error, MI_LENGTH_BYTES, RAW_IMBE_LENGTH_BYTES, Result};

/// Which logical data unit a voice frame belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ldu {
    /// Voice frames 1-9.
    Ldu1,
    /// Voice frames 10-18.
    Ldu2,
}

/// Keystream bytes consumed by one LDU's voice frames plus the low
/// speed data that follows LDU1 on the air.
const LDU2_KEYSTREAM_OFFSET: usize = 9 * RAW_IMBE_LENGTH_BYTES + 2;

/// RC4 keystream bytes discarded before use, per the ADP definition.
const ARC4_DISCARD: usize = 267;

/// Keystream bytes needed to cover a full superframe.
const SUPERFRAME_KEYSTREAM: usize = LDU2_KEYSTREAM_OFFSET + 9 * RAW_IMBE_LENGTH_BYTES;

/// Advance the 64-bit MI shift register one full cycle (64 clocks).
///
/// Taps at 64, 62, 46, 38, 27 and 15, the LFSR the air interface uses
/// both to roll the MI between superframes and to widen it into the
/// AES IV.
fn lfsr64(mut reg: u64) -> u64 {
    for _ in 0..64 {
        let fb = ((reg >> 63) ^ (reg >> 61) ^ (reg >> 45) ^ (reg >> 37) ^ (reg >> 26) ^ (reg >> 14))
            & 1;
        reg = (reg << 1) | fb;
    }
    reg
}

/// Compute the message indicator of the next superframe.
pub fn next_mi(mi: &[u8; MI_LENGTH_BYTES]) -> [u8; MI_LENGTH_BYTES] {
    let reg = u64::from_be_bytes(mi[..8].try_into().unwrap());
    let mut out = [0u8; MI_LENGTH_BYTES];
    out[..8].copy_from_slice(&lfsr64(reg).to_be_bytes());
    out
}

/// Widen a message indicator into the 128-bit AES IV: the 64-bit MI
/// register followed by one further LFSR cycle of it.
fn expand_mi(mi: &[u8; MI_LENGTH_BYTES]) -> [u8; 16] {
    let reg = u64::from_be_bytes(mi[..8].try_into().unwrap());
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&mi[..8]);
    iv[8..].copy_from_slice(&lfsr64(reg).to_be_bytes());
    iv
}

fn rc4_keystream(key: &[u8], discard: usize, len: usize) -> Vec<u8> {
    let mut s: [u8; 256] = std::array::from_fn(|i| i as u8);
    let mut j = 0u8;
    for i in 0..256 {
        j = j
            .wrapping_add(s[i])
            .wrapping_add(key[i % key.len()]);
        s.swap(i, j as usize);
    }

    let mut out = Vec::with_capacity(len);
    let (mut i, mut j) = (0u8, 0u8);
    for n in 0..discard + len {
        i = i.wrapping_add(1);
        j = j.wrapping_add(s[i as usize]);
        s.swap(i as usize, j as usize);
        let k = s[(s[i as usize].wrapping_add(s[j as usize])) as usize];
        if n >= discard {
            out.push(k);
        }
    }
    out
}

/// Per-call keystream state: negotiated TEK, current MI and the cached
/// superframe keystream.
pub struct Keystream {
    algo_id: u8,
    key_id: u16,
    tek: Vec<u8>,
    mi: [u8; MI_LENGTH_BYTES],
    has_mi: bool,
    ks: Vec<u8>,
}

impl Default for Keystream {
    fn default() -> Self {
        Self::new()
    }
}

impl Keystream {
    /// New state with no TEK loaded.
    pub fn new() -> Self {
        Self {
            algo_id: ALGO_UNENCRYPT,
            key_id: 0,
            tek: Vec::new(),
            mi: [0; MI_LENGTH_BYTES],
            has_mi: false,
            ks: Vec::new(),
        }
    }

    /// Load a traffic encryption key. The key length must match the
    /// algorithm exactly; a short key is a configuration error, never
    /// silently widened.
    pub fn set_tek(&mut self, algo_id: u8, key_id: u16, key: &[u8]) -> Result<()> {
        let expected: &[usize] = match algo_id {
            ALGO_AES_256 => &[32],
            ALGO_DES => &[8],
            ALGO_ARC4 => &[5, 13, 16, 32],
            _ => {
                return Err(Error::Config(format!(
                    "unsupported TEK algorithm, algId = ${algo_id:02X}"
                )));
            }
        };
        if !expected.contains(&key.len()) {
            return Err(Error::Config(format!(
                "TEK length {} invalid for algId = ${:02X}",
                key.len(),
                algo_id
            )));
        }
        self.algo_id = algo_id;
        self.key_id = key_id;
        self.tek = key.to_vec();
        self.ks.clear();
        Ok(())
    }

    /// Drop the TEK and all derived state.
    pub fn clear_tek(&mut self) {
        self.algo_id = ALGO_UNENCRYPT;
        self.key_id = 0;
        self.tek.clear();
        self.ks.clear();
        self.clear_mi();
    }

    /// Loaded TEK length in bytes, 0 when none.
    pub fn tek_len(&self) -> usize {
        self.tek.len()
    }

    /// Algorithm id of the loaded TEK.
    pub fn algo_id(&self) -> u8 {
        self.algo_id
    }

    /// Key id of the loaded TEK.
    pub fn key_id(&self) -> u16 {
        self.key_id
    }

    /// Set the current message indicator.
    pub fn set_mi(&mut self, mi: &[u8; MI_LENGTH_BYTES]) {
        self.mi = *mi;
        self.has_mi = true;
    }

    /// Current message indicator.
    pub fn mi(&self) -> [u8; MI_LENGTH_BYTES] {
        self.mi
    }

    /// Whether a message indicator is loaded.
    pub fn has_valid_mi(&self) -> bool {
        self.has_mi
    }

    /// Forget the message indicator.
    pub fn clear_mi(&mut self) {
        self.mi = [0; MI_LENGTH_BYTES];
        self.has_mi = false;
    }

    /// Generate a fresh random message indicator for a new TX call.
    pub fn generate_mi(&mut self) {
        rand::rng().fill_bytes(&mut self.mi[..8]);
        self.mi[8] = 0;
        self.has_mi = true;
        debug!(
            "generated MI = {:02X?}",
            &self.mi[..MI_LENGTH_BYTES]
        );
    }

    /// Roll the message indicator to the next superframe's value.
    pub fn generate_next_mi(&mut self) {
        self.mi = next_mi(&self.mi);
    }

    /// Whether a superframe keystream is cached.
    pub fn has_valid_keystream(&self) -> bool {
        !self.ks.is_empty()
    }

    /// Invalidate the cached keystream.
    pub fn reset_keystream(&mut self) {
        self.ks.clear();
    }

    /// Generate the keystream for one superframe from the current MI.
    pub fn generate_keystream(&mut self) -> Result<()> {
        if self.tek.is_empty() {
            return Err(Error::Config("no TEK loaded".into()));
        }
        self.ks = match self.algo_id {
            ALGO_AES_256 => {
                let cipher = Aes256::new(GenericArray::from_slice(&self.tek));
                let mut block = GenericArray::clone_from_slice(&expand_mi(&self.mi));
                // OFB: the first block is discarded.
                let mut out = Vec::with_capacity(SUPERFRAME_KEYSTREAM);
                cipher.encrypt_block(&mut block);
                while out.len() < SUPERFRAME_KEYSTREAM {
                    cipher.encrypt_block(&mut block);
                    out.extend_from_slice(&block);
                }
                out
            }
            ALGO_DES => {
                let cipher = Des::new(GenericArray::from_slice(&self.tek));
                let mut block = GenericArray::clone_from_slice(&self.mi[..8]);
                let mut out = Vec::with_capacity(SUPERFRAME_KEYSTREAM);
                cipher.encrypt_block(&mut block);
                while out.len() < SUPERFRAME_KEYSTREAM {
                    cipher.encrypt_block(&mut block);
                    out.extend_from_slice(&block);
                }
                out
            }
            ALGO_ARC4 => {
                let mut key = self.tek.clone();
                key.extend_from_slice(&self.mi[..8]);
                rc4_keystream(&key, ARC4_DISCARD, SUPERFRAME_KEYSTREAM)
            }
            other => {
                return Err(Error::Config(format!(
                    "unsupported TEK algorithm, algId = ${other:02X}"
                )));
            }
        };
        Ok(())
    }

    /// XOR the keystream for voice position `n` of the given LDU into
    /// an IMBE codeword. Symmetric, so this both encrypts and
    /// decrypts.
    pub fn crypt_imbe(&self, imbe: &mut [u8], ldu: Ldu, n: usize) -> Result<()> {
        assert!(n < 9);
        assert!(imbe.len() >= RAW_IMBE_LENGTH_BYTES);
        if self.ks.is_empty() {
            return Err(Error::Config("no keystream generated".into()));
        }
        let base = match ldu {
            Ldu::Ldu1 => 0,
            Ldu::Ldu2 => LDU2_KEYSTREAM_OFFSET,
        } + n * RAW_IMBE_LENGTH_BYTES;
        for (b, k) in imbe[..RAW_IMBE_LENGTH_BYTES]
            .iter_mut()
            .zip(&self.ks[base..base + RAW_IMBE_LENGTH_BYTES])
        {
            *b ^= k;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MI: [u8; 9] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0x01];

    #[test]
    fn rc4_core_matches_published_vector() {
        // Classic check: key "Key" -> keystream EB9F7781...
        let ks = rc4_keystream(b"Key", 0, 9);
        assert_eq!(
            ks,
            vec![0xEB, 0x9F, 0x77, 0x81, 0xB7, 0x34, 0xCA, 0x72, 0xA7]
        );
    }

    #[test]
    fn zero_mi_is_the_lfsr_fixed_point() {
        assert_eq!(next_mi(&[0; 9]), [0; 9]);
    }

    #[test]
    fn mi_roll_is_deterministic_and_moves() {
        let a = next_mi(&TEST_MI);
        let b = next_mi(&TEST_MI);
        assert_eq!(a, b);
        assert_ne!(a, TEST_MI);
        // And keeps moving.
        assert_ne!(next_mi(&a), a);
    }

    #[test]
    fn aes_iv_prefix_is_the_mi() {
        let iv = expand_mi(&TEST_MI);
        assert_eq!(&iv[..8], &TEST_MI[..8]);
        assert_ne!(&iv[8..], &[0u8; 8]);
    }

    fn roundtrip(algo: u8, key: &[u8]) -> Result<()> {
        let mut tx = Keystream::new();
        tx.set_tek(algo, 0x1234, key)?;
        tx.set_mi(&TEST_MI);
        tx.generate_keystream()?;

        let mut rx = Keystream::new();
        rx.set_tek(algo, 0x1234, key)?;
        rx.set_mi(&TEST_MI);
        rx.generate_keystream()?;

        for ldu in [Ldu::Ldu1, Ldu::Ldu2] {
            for n in 0..9 {
                let plain: [u8; 11] = std::array::from_fn(|i| (i as u8) * 17 + n as u8);
                let mut buf = plain;
                tx.crypt_imbe(&mut buf, ldu, n)?;
                assert_ne!(buf, plain, "keystream was all zero");
                rx.crypt_imbe(&mut buf, ldu, n)?;
                assert_eq!(buf, plain);
            }
        }
        Ok(())
    }

    #[test]
    fn aes_roundtrips() -> Result<()> {
        let key: [u8; 32] = std::array::from_fn(|i| i as u8);
        roundtrip(ALGO_AES_256, &key)
    }

    #[test]
    fn des_roundtrips() -> Result<()> {
        roundtrip(ALGO_DES, &[0x13, 0x34, 0x57, 0x79, 0x9B, 0xBC, 0xDF, 0xF1])
    }

    #[test]
    fn arc4_roundtrips() -> Result<()> {
        roundtrip(ALGO_ARC4, &[0xDE, 0xAD, 0xBE, 0xEF, 0x42])
    }

    #[test]
    fn ldu_positions_use_distinct_keystream() -> Result<()> {
        let key: [u8; 32] = std::array::from_fn(|i| i as u8);
        let mut ks = Keystream::new();
        ks.set_tek(ALGO_AES_256, 1, &key)?;
        ks.set_mi(&TEST_MI);
        ks.generate_keystream()?;

        let mut a = [0u8; 11];
        let mut b = [0u8; 11];
        ks.crypt_imbe(&mut a, Ldu::Ldu1, 0)?;
        ks.crypt_imbe(&mut b, Ldu::Ldu2, 0)?;
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn wrong_key_length_is_refused() {
        let mut ks = Keystream::new();
        assert!(ks.set_tek(ALGO_AES_256, 1, &[0u8; 16]).is_err());
        assert!(ks.set_tek(ALGO_DES, 1, &[0u8; 7]).is_err());
        assert!(ks.set_tek(0x80, 1, &[0u8; 32]).is_err());
    }

    #[test]
    fn mi_roll_changes_keystream() -> Result<()> {
        let key: [u8; 32] = std::array::from_fn(|i| (i * 3) as u8);
        let mut ks = Keystream::new();
        ks.set_tek(ALGO_AES_256, 1, &key)?;
        ks.set_mi(&TEST_MI);
        ks.generate_keystream()?;
        let mut first = [0u8; 11];
        ks.crypt_imbe(&mut first, Ldu::Ldu1, 0)?;

        ks.generate_next_mi();
        ks.generate_keystream()?;
        let mut second = [0u8; 11];
        ks.crypt_imbe(&mut second, Ldu::Ldu1, 0)?;
        assert_ne!(first, second);
        Ok(())
    }
}
