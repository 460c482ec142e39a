/*! Hamming codes used by the link control layer.

Two variants: Hamming(10,6,3) protecting the six-bit groups of the
Reed-Solomon encoded LC data in LDU1/LDU2 frames, and the extended
Hamming(8,4,4) protecting Phase 2 DUID nibbles.

Both operate on bool slices, data bits first, parity appended.
*/

/// Append the four Hamming(10,6,3) parity bits to `d[0..6]`.
pub fn encode1063(d: &mut [bool; 10]) {
    d[6] = d[0] ^ d[1] ^ d[2] ^ d[5];
    d[7] = d[0] ^ d[1] ^ d[3] ^ d[5];
    d[8] = d[0] ^ d[2] ^ d[3] ^ d[4];
    d[9] = d[1] ^ d[2] ^ d[3] ^ d[4];
}

/// Correct a single bit error in a Hamming(10,6,3) codeword in place.
/// Returns true if a correction was applied.
pub fn decode1063(d: &mut [bool; 10]) -> bool {
    let c0 = d[0] ^ d[1] ^ d[2] ^ d[5];
    let c1 = d[0] ^ d[1] ^ d[3] ^ d[5];
    let c2 = d[0] ^ d[2] ^ d[3] ^ d[4];
    let c3 = d[1] ^ d[2] ^ d[3] ^ d[4];

    let mut n = 0u8;
    n |= if c0 != d[6] { 0x01 } else { 0x00 };
    n |= if c1 != d[7] { 0x02 } else { 0x00 };
    n |= if c2 != d[8] { 0x04 } else { 0x00 };
    n |= if c3 != d[9] { 0x08 } else { 0x00 };

    match n {
        // parity bit errors
        0x01 => d[6] = !d[6],
        0x02 => d[7] = !d[7],
        0x04 => d[8] = !d[8],
        0x08 => d[9] = !d[9],

        // data bit errors
        0x07 => d[0] = !d[0],
        0x0B => d[1] = !d[1],
        0x0D => d[2] = !d[2],
        0x0E => d[3] = !d[3],
        0x0C => d[4] = !d[4],
        0x03 => d[5] = !d[5],

        _ => return false,
    }
    true
}

/// Append the four extended Hamming(8,4,4) parity bits to `d[0..4]`.
pub fn encode844(d: &mut [bool; 8]) {
    d[4] = d[0] ^ d[1] ^ d[2];
    d[5] = d[1] ^ d[2] ^ d[3];
    d[6] = d[0] ^ d[1] ^ d[3];
    d[7] = d[0] ^ d[2] ^ d[3];
}

/// Correct a single bit error in a Hamming(8,4,4) codeword in place.
/// Returns true if a correction was applied.
pub fn decode844(d: &mut [bool; 8]) -> bool {
    let c0 = d[0] ^ d[1] ^ d[2];
    let c1 = d[1] ^ d[2] ^ d[3];
    let c2 = d[0] ^ d[1] ^ d[3];
    let c3 = d[0] ^ d[2] ^ d[3];

    let mut n = 0u8;
    n |= if c0 != d[4] { 0x01 } else { 0x00 };
    n |= if c1 != d[5] { 0x02 } else { 0x00 };
    n |= if c2 != d[6] { 0x04 } else { 0x00 };
    n |= if c3 != d[7] { 0x08 } else { 0x00 };

    match n {
        0x01 => d[4] = !d[4],
        0x02 => d[5] = !d[5],
        0x04 => d[6] = !d[6],
        0x08 => d[7] = !d[7],

        0x0D => d[0] = !d[0],
        0x07 => d[1] = !d[1],
        0x0B => d[2] = !d[2],
        0x0E => d[3] = !d[3],

        _ => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bools6(v: u8) -> [bool; 10] {
        let mut d = [false; 10];
        for (i, b) in d.iter_mut().take(6).enumerate() {
            *b = (v >> (5 - i)) & 1 == 1;
        }
        d
    }

    #[test]
    fn hamming1063_corrects_all_single_errors() {
        for v in 0..64u8 {
            let mut cw = bools6(v);
            encode1063(&mut cw);
            let clean = cw;
            for e in 0..10 {
                let mut noisy = clean;
                noisy[e] = !noisy[e];
                assert!(decode1063(&mut noisy), "value {v} error at {e}");
                assert_eq!(noisy, clean, "value {v} error at {e}");
            }
            // No error means no correction.
            let mut untouched = clean;
            assert!(!decode1063(&mut untouched));
            assert_eq!(untouched, clean);
        }
    }

    #[test]
    fn hamming844_corrects_all_single_errors() {
        for v in 0..16u8 {
            let mut cw = [false; 8];
            for (i, b) in cw.iter_mut().take(4).enumerate() {
                *b = (v >> (3 - i)) & 1 == 1;
            }
            encode844(&mut cw);
            let clean = cw;
            for e in 0..8 {
                let mut noisy = clean;
                noisy[e] = !noisy[e];
                assert!(decode844(&mut noisy), "value {v} error at {e}");
                assert_eq!(noisy, clean, "value {v} error at {e}");
            }
        }
    }

    #[test]
    fn hamming844_detects_double_errors() {
        // Minimum distance 4: a double error is detected, never
        // mistaken for a correctable single error.
        let mut cw = [false; 8];
        cw[0] = true;
        cw[2] = true;
        encode844(&mut cw);
        let clean = cw;
        for e1 in 0..8 {
            for e2 in (e1 + 1)..8 {
                let mut noisy = clean;
                noisy[e1] = !noisy[e1];
                noisy[e2] = !noisy[e2];
                assert!(!decode844(&mut noisy), "errors at {e1},{e2}");
            }
        }
    }
}
