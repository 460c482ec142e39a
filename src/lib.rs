#![warn(missing_docs)]
/*! This crate bridges a P25 (Project 25 Phase 1) trunking network peer
to local and/or UDP audio endpoints.

Framed voice and signalling arrive from the network peer, get
classified by DUID, have their link control (LC) decoded with
Reed-Solomon and Golay/Hamming FEC, are optionally decrypted, and the
IMBE codewords are handed to a vocoder for conversion to 8 kHz 16-bit
PCM. The reverse path gates PCM on VOX or COR, encodes it to IMBE,
optionally encrypts, and packs DFSI superframes back onto the network.

# Architecture overview

Leaves first:

* [`golay`], [`hamming`], [`reed_solomon`] — pure FEC codecs.
* [`lc`] — link control records for HDU, LDU1, LDU2 and TDULC.
* [`crypto`] — per-call keystream state (AES-256, ARC4, DES-OFB) and
  message indicator chaining.
* [`dfsi`] — fixed-length DFSI voice frame packing.
* [`engine`] — the call state machines driving both directions.
* [`bridge`] — the worker threads, shared rings and watchdog.

A typical deployment:

```text
   [ trunking network peer ]
            ↕
      [ call engine ]
            ↕
  [ audio rings + workers ]
        ↕         ↕
 [ sound device ] [ UDP peer ]
```

The audio device and UDP peer are optional, but at least one must be
present for the bridge to do anything useful.
*/

pub mod bits;
pub mod bridge;
pub mod config;
pub mod crypto;
pub mod dfsi;
pub mod engine;
pub mod golay;
pub mod hamming;
pub mod lc;
pub mod mulaw;
pub mod net;
pub mod reed_solomon;
pub mod ring;
pub mod rtp;
pub mod timer;
pub mod tone;
pub mod udp;
pub mod vocoder;

#[cfg(feature = "audio")]
pub mod audio;

/// Audio sample rate. The vocoder and all PCM paths run at 8 kHz.
pub const SAMPLE_RATE: u32 = 8000;

/// Samples per voice frame: 20 ms at 8 kHz.
pub const AUDIO_SAMPLES_LENGTH: usize = 160;

/// Bytes per voice frame of 16-bit PCM.
pub const AUDIO_SAMPLES_LENGTH_BYTES: usize = AUDIO_SAMPLES_LENGTH * 2;

/// Number of voice frames each sample ring can hold.
pub const NUMBER_OF_BUFFERS: usize = 32;

/// Bytes in one raw 88-bit IMBE codeword (11 bytes, last nibble unused).
pub const RAW_IMBE_LENGTH_BYTES: usize = 11;

/// Bytes in a message indicator.
pub const MI_LENGTH_BYTES: usize = 9;

/// Bridge error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wrapped I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// FEC decode failed with more errors than the code can correct.
    /// Carries the name of the code that gave up.
    #[error("uncorrectable {0}")]
    Uncorrectable(&'static str),

    /// A frame failed structural validation.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// Bad or conflicting configuration. The bridge refuses to start.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation valid for the protocol but not supported by this
    /// bridge (e.g. a non-P25 transmit mode).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Device level audio failure.
    #[error("audio device: {0}")]
    Audio(String),
}

/// Bridge result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
pub mod tests {
    //! Test helper functions.

    /// Deterministic pseudorandom bytes for tests that want varied but
    /// repeatable input, without pulling in an RNG seed dance.
    pub fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (seed as usize).wrapping_mul(31).wrapping_add(i * 7) as u8)
            .collect()
    }
}
