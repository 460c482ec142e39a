/*! Bridge configuration.

Loaded from JSON, validated once at startup. Validation is strict:
conflicting UDP options are normalised the way the hardware bridges do
it, but anything unrecoverable (zero ids, out-of-range ids, a TEK that
does not match its algorithm) refuses to start rather than limping
along with surprising behavior.
*/
use log::warn;
use serde::{Deserialize, Serialize};

use crate::lc::{ALGO_AES_256, ALGO_ARC4, ALGO_DES, ALGO_UNENCRYPT};
use crate::{Error, Result};

/// Transmit mode of the bridge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxMode {
    /// DMR voice (not implemented by this bridge).
    Dmr,
    /// P25 Phase 1 voice.
    #[default]
    P25,
    /// Analog voice (not implemented by this bridge).
    Analog,
}

/// Traffic encryption settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TekConfig {
    /// Whether traffic encryption is requested.
    pub enable: bool,
    /// Algorithm name: "aes", "arc4" or "des".
    pub algo: String,
    /// Key id, 16 bits.
    pub key_id: u32,
    /// Key material as hex; may be omitted when the key arrives over
    /// the network instead.
    pub key: Option<String>,
}

/// Everything the bridge reads at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Free-form identity string for logs.
    pub identity: String,
    /// Network peer id.
    pub peer_id: u32,
    /// Source radio id used for locally originated traffic.
    pub src_id: u32,
    /// Destination talkgroup/unit this bridge serves.
    pub dst_id: u32,
    /// Transmit mode; only P25 is supported.
    pub tx_mode: TxMode,

    /// Gain applied to received (network to audio) PCM.
    pub rx_audio_gain: f32,
    /// Gain applied to transmitted (audio to network) PCM.
    pub tx_audio_gain: f32,
    /// Gain hint handed to the vocoder decoder.
    pub vocoder_decoder_audio_gain: f32,
    /// Gain hint handed to the vocoder encoder.
    pub vocoder_encoder_audio_gain: f32,

    /// VOX trigger level in peak-sample units of 1/1000.
    pub vox_sample_level: f32,
    /// Drop timer in milliseconds.
    pub drop_time_ms: u64,

    /// Whether a local audio device is in use.
    pub local_audio: bool,
    /// Whether to lead received calls with a single tone.
    pub preamble_leader_tone: bool,
    /// Preamble tone frequency in Hz.
    pub preamble_tone: u16,
    /// Preamble tone length in milliseconds.
    pub preamble_length: u16,
    /// Whether TX call starts emit a grant demand terminator.
    pub grant_demand: bool,

    /// Whether UDP audio is in use.
    pub udp_audio: bool,
    /// Whether UDP frames carry trailing src/dst metadata.
    pub udp_metadata: bool,
    /// UDP audio egress address.
    pub udp_send_address: String,
    /// UDP audio egress port.
    pub udp_send_port: u16,
    /// UDP audio ingress address.
    pub udp_receive_address: String,
    /// UDP audio ingress port.
    pub udp_receive_port: u16,
    /// RTP framing on the UDP path.
    pub udp_rtp_frames: bool,
    /// Process RTP frames as they arrive instead of by timestamp.
    pub udp_ignore_rtp_timing: bool,
    /// µ-law payloads (requires RTP framing).
    pub udp_use_ulaw: bool,
    /// USRP framing on the UDP path.
    pub udp_usrp: bool,
    /// Pace UDP ingress to one frame per 20 ms.
    pub udp_frame_timing: bool,

    /// Adopt the source id announced by MDC signalling.
    pub override_source_id_from_mdc: bool,
    /// Adopt the source id from UDP frame metadata.
    pub override_source_id_from_udp: bool,
    /// Restart the call when the UDP source id changes.
    pub reset_call_for_source_id_change: bool,

    /// Assert serial RTS while audio plays out.
    pub rts_ptt_enable: bool,
    /// Serial port for RTS PTT.
    pub rts_ptt_port: String,
    /// PTT release hold-off after the last audio frame.
    pub rts_ptt_holdoff_ms: u64,
    /// Gate transmit on serial CTS instead of VOX.
    pub cts_cor_enable: bool,
    /// Serial port for CTS COR.
    pub cts_cor_port: String,
    /// Invert the CTS sense.
    pub cts_cor_invert: bool,
    /// Drop delay after COR releases.
    pub cts_cor_holdoff_ms: u64,

    /// Traffic encryption.
    pub tek: TekConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: "BRIDGE".into(),
            peer_id: 9_000_100,
            src_id: 1,
            dst_id: 1,
            tx_mode: TxMode::P25,
            rx_audio_gain: 1.0,
            tx_audio_gain: 1.0,
            vocoder_decoder_audio_gain: 3.0,
            vocoder_encoder_audio_gain: 3.0,
            vox_sample_level: 30.0,
            drop_time_ms: 180,
            local_audio: true,
            preamble_leader_tone: false,
            preamble_tone: 2175,
            preamble_length: 200,
            grant_demand: false,
            udp_audio: false,
            udp_metadata: false,
            udp_send_address: "127.0.0.1".into(),
            udp_send_port: 34001,
            udp_receive_address: "127.0.0.1".into(),
            udp_receive_port: 32001,
            udp_rtp_frames: false,
            udp_ignore_rtp_timing: false,
            udp_use_ulaw: false,
            udp_usrp: false,
            udp_frame_timing: false,
            override_source_id_from_mdc: false,
            override_source_id_from_udp: false,
            reset_call_for_source_id_change: false,
            rts_ptt_enable: false,
            rts_ptt_port: "/dev/ttyUSB0".into(),
            rts_ptt_holdoff_ms: 250,
            cts_cor_enable: false,
            cts_cor_port: "/dev/ttyUSB0".into(),
            cts_cor_invert: false,
            cts_cor_holdoff_ms: 250,
            tek: TekConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a JSON configuration file.
    pub fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut cfg: Config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("cannot parse {path}: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate and normalise. Mutates the UDP mode selectors the same
    /// way the rest of the fleet does, so every deployment agrees on
    /// what a given file means.
    pub fn validate(&mut self) -> Result<()> {
        if self.src_id == 0 {
            return Err(Error::Config("source ID cannot be 0".into()));
        }
        if self.dst_id == 0 {
            return Err(Error::Config("destination ID cannot be 0".into()));
        }
        if self.dst_id > 16_777_215 {
            return Err(Error::Config(
                "destination ID cannot be greater than 16777215".into(),
            ));
        }
        if self.peer_id > 999_999_999 {
            return Err(Error::Config(
                "peer ID cannot be greater than 999999999".into(),
            ));
        }
        if !self.local_audio && !self.udp_audio {
            return Err(Error::Config(
                "must enable at least local audio or UDP audio".into(),
            ));
        }

        // USRP always has its own metadata and framing.
        if self.udp_usrp {
            self.udp_metadata = false;
            self.udp_rtp_frames = false;
            self.udp_use_ulaw = false;
        }
        if self.udp_rtp_frames {
            self.udp_usrp = false;
            self.udp_frame_timing = false;
        } else if self.udp_use_ulaw {
            warn!("uLaw encoding can only be used with RTP frames, disabling.");
            self.udp_use_ulaw = false;
        }
        if !self.udp_metadata || !self.override_source_id_from_udp {
            self.reset_call_for_source_id_change = false;
        }

        if self.tx_mode == TxMode::P25 && self.udp_audio && self.drop_time_ms != 360 {
            warn!("When using UDP audio, the drop time is fixed to 360ms. (1 P25 audio superframe.)");
            self.drop_time_ms = 360;
        }

        if self.tek.enable {
            let _ = self.tek_algo_id()?;
            if self.tek.key_id == 0 || self.tek.key_id > 0xFFFF {
                return Err(Error::Config("TEK key ID must be 1..65535".into()));
            }
            // A configured key must parse and match the algorithm now,
            // not at the first encrypted call.
            let _ = self.tek_key()?;
        }
        Ok(())
    }

    /// Resolve the configured TEK algorithm name to its algorithm id.
    pub fn tek_algo_id(&self) -> Result<u8> {
        if !self.tek.enable {
            return Ok(ALGO_UNENCRYPT);
        }
        match self.tek.algo.to_ascii_lowercase().as_str() {
            "aes" => Ok(ALGO_AES_256),
            "arc4" | "adp" => Ok(ALGO_ARC4),
            "des" => Ok(ALGO_DES),
            other => Err(Error::Config(format!(
                "invalid TEK algorithm {other:?}, must be \"aes\", \"arc4\" or \"des\""
            ))),
        }
    }

    /// Decode the configured TEK key material, when present.
    pub fn tek_key(&self) -> Result<Option<Vec<u8>>> {
        match &self.tek.key {
            None => Ok(None),
            Some(hex) => {
                let bytes = parse_hex(hex)?;
                let want: &[usize] = match self.tek_algo_id()? {
                    ALGO_AES_256 => &[32],
                    ALGO_DES => &[8],
                    ALGO_ARC4 => &[5, 13, 16, 32],
                    _ => &[],
                };
                if !want.contains(&bytes.len()) {
                    return Err(Error::Config(format!(
                        "TEK key is {} bytes, which does not fit algorithm {:?}",
                        bytes.len(),
                        self.tek.algo
                    )));
                }
                Ok(Some(bytes))
            }
        }
    }

    /// Hard watchdog limit: twice the drop timer plus a second.
    pub fn stuck_call_timeout_ms(&self) -> u64 {
        2 * (self.drop_time_ms + 1000)
    }
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Config("invalid hex string".into()));
    }
    Ok((0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() -> Result<()> {
        Config::default().validate()
    }

    #[test]
    fn zero_and_oversized_ids_refused() {
        let mut c = Config::default();
        c.src_id = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.dst_id = 16_777_216;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.peer_id = 1_000_000_000;
        assert!(c.validate().is_err());
    }

    #[test]
    fn udp_forces_superframe_drop_time() -> Result<()> {
        let mut c = Config::default();
        c.udp_audio = true;
        c.drop_time_ms = 180;
        c.validate()?;
        assert_eq!(c.drop_time_ms, 360);
        assert_eq!(c.stuck_call_timeout_ms(), 2720);
        Ok(())
    }

    #[test]
    fn usrp_disables_rtp_ulaw_metadata() -> Result<()> {
        let mut c = Config::default();
        c.udp_audio = true;
        c.udp_usrp = true;
        c.udp_rtp_frames = true;
        c.udp_use_ulaw = true;
        c.udp_metadata = true;
        c.validate()?;
        assert!(c.udp_usrp);
        assert!(!c.udp_rtp_frames);
        assert!(!c.udp_use_ulaw);
        assert!(!c.udp_metadata);
        Ok(())
    }

    #[test]
    fn ulaw_without_rtp_is_dropped() -> Result<()> {
        let mut c = Config::default();
        c.udp_audio = true;
        c.udp_use_ulaw = true;
        c.validate()?;
        assert!(!c.udp_use_ulaw);
        Ok(())
    }

    #[test]
    fn tek_algo_and_key_validation() {
        let mut c = Config::default();
        c.tek.enable = true;
        c.tek.algo = "rot13".into();
        c.tek.key_id = 0x1234;
        assert!(c.validate().is_err());

        c.tek.algo = "aes".into();
        // A 16-byte key is half an AES-256 key; refuse, never widen.
        c.tek.key = Some("00112233445566778899AABBCCDDEEFF".into());
        assert!(c.validate().is_err());

        c.tek.key = Some(
            "00112233445566778899AABBCCDDEEFF00112233445566778899AABBCCDDEEFF".into(),
        );
        assert!(c.validate().is_ok());
    }

    #[test]
    fn json_roundtrip_with_camel_case() -> Result<()> {
        let text = r#"{
            "srcId": 3100,
            "dstId": 10,
            "txMode": "p25",
            "dropTimeMs": 200,
            "udpAudio": false,
            "tek": { "enable": false }
        }"#;
        let mut cfg: Config =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        assert_eq!(cfg.src_id, 3100);
        assert_eq!(cfg.dst_id, 10);
        assert_eq!(cfg.drop_time_ms, 200);
        Ok(())
    }
}
