/*! The P25 call engine.

Two small state machines, one per direction. The RX engine ingests
network frames, classifies the DUID, tracks call ownership by stream
id, unpacks DFSI superframes, decrypts, and produces PCM. The TX
engine gates PCM on VOX or COR, encodes and encrypts IMBE codewords
into the two superframe buffers, and emits LDU1/LDU2/TDU frames at the
superframe boundaries.

Neither engine performs I/O and neither takes a lock: decoded PCM and
frames-to-send come back as values so the workers can route them after
releasing whatever they hold.
*/
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use log::{debug, info, warn};

use crate::bridge::Flags;
use crate::config::{Config, TxMode};
use crate::crypto::{Keystream, Ldu};
use crate::dfsi::{
    self, ENCRYPTED_NULL_IMBE, IMBE_OFFSETS, LDU2_ALGO_OFFSET, NULL_IMBE, SUPERFRAME_BYTES,
};
use crate::lc::{ALGO_UNENCRYPT, LinkControl, LowSpeedData, lco};
use crate::net::{
    Duid, FRAME_TYPE_HDU_VALID, NET_CTRL_GRANT_DEMAND, NET_CTRL_GRANT_DENIAL,
    NET_CTRL_GRANT_ENCRYPT, NET_CTRL_SWITCH_OVER, NET_CTRL_U2U, NetFrame, Peer,
};
use crate::timer::Timer;
use crate::tone;
use crate::vocoder::Vocoder;
use crate::{AUDIO_SAMPLES_LENGTH, Error, RAW_IMBE_LENGTH_BYTES, Result, SAMPLE_RATE};

/// Scale samples in place, saturating at the rails.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for s in samples.iter_mut() {
        *s = (f32::from(*s) * gain).clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    }
}

/// What the RX engine produced for one ingested network frame.
pub enum RxEvent {
    /// One decoded 20 ms PCM frame.
    Pcm {
        /// The decoded samples.
        samples: [i16; AUDIO_SAMPLES_LENGTH],
        /// Source id of the call, for egress metadata.
        src_id: u32,
        /// Destination id of the call.
        dst_id: u32,
    },
    /// Leader tone to prepend to the call's audio.
    Preamble(Vec<i16>),
    /// The call ended; egress stream state should reset.
    CallEnded,
}

/// Network-to-audio half of the call engine.
pub struct RxEngine {
    cfg: Config,
    flags: Arc<Flags>,
    vocoder: Box<dyn Vocoder>,
    crypto: Keystream,
    ldu1: [u8; SUPERFRAME_BYTES],
    ldu2: [u8; SUPERFRAME_BYTES],
    call_algo_id: u8,
    call_key_id: u16,
    rx_start: Option<Instant>,
}

impl RxEngine {
    /// Build the RX engine; loads the configured TEK when present.
    pub fn new(cfg: Config, flags: Arc<Flags>, vocoder: Box<dyn Vocoder>) -> Result<Self> {
        let mut crypto = Keystream::new();
        if let Some(key) = cfg.tek_key()? {
            crypto.set_tek(cfg.tek_algo_id()?, cfg.tek.key_id as u16, &key)?;
        }
        Ok(Self {
            cfg,
            flags,
            vocoder,
            crypto,
            ldu1: [0; SUPERFRAME_BYTES],
            ldu2: [0; SUPERFRAME_BYTES],
            call_algo_id: ALGO_UNENCRYPT,
            call_key_id: 0,
            rx_start: None,
        })
    }

    /// Load a TEK delivered by the network key exchange.
    pub fn load_tek(&mut self, algo_id: u8, key_id: u16, key: &[u8]) -> Result<()> {
        self.crypto.set_tek(algo_id, key_id, key)
    }

    fn tek_active(&self) -> bool {
        self.crypto.algo_id() != ALGO_UNENCRYPT
            && self.crypto.key_id() > 0
            && self.crypto.tek_len() > 0
    }

    /// Process one ingress network frame. Returns the PCM and control
    /// events it produced; an `Err` means this frame was corrupt and
    /// got dropped without touching the call.
    pub fn process_frame(&mut self, buf: &[u8], peer: &mut dyn Peer) -> Result<Vec<RxEvent>> {
        let mut events = Vec::new();
        if self.cfg.tx_mode != TxMode::P25 {
            peer.reset();
            return Ok(events);
        }

        let frame = NetFrame::parse(buf)?;
        let control = frame.control();
        let grant_demand = control & NET_CTRL_GRANT_DEMAND != 0;
        let grant_denial = control & NET_CTRL_GRANT_DENIAL != 0;
        let unit_to_unit = control & NET_CTRL_U2U != 0;
        if grant_denial || unit_to_unit {
            debug!("control byte ${control:02X}, grantDenial = {grant_denial}, u2u = {unit_to_unit}");
        }

        let duid = frame.duid()?;
        if matches!(duid, Duid::Hdu | Duid::Tsdu | Duid::Pdu) {
            return Ok(events);
        }

        let src_id = frame.src_id();
        let dst_id = frame.dst_id();

        // Canonicalise the opcode so everything downstream dispatches
        // the same way.
        let mut control_lc = LinkControl::group(src_id, dst_id);
        control_lc.lco = frame.lco() & 0x3F;
        control_lc.mfid = frame.mfid();
        if !control_lc.is_standard_mfid()
            || control_lc.lco == lco::GROUP_UPDT
            || control_lc.lco == lco::RFSS_STS_BCAST
        {
            control_lc.lco = lco::GROUP;
        }
        if control_lc.lco != lco::GROUP {
            return Ok(events);
        }

        if src_id == 0 {
            peer.reset();
            return Ok(events);
        }

        let terminator = matches!(duid, Duid::Tdu | Duid::Tdulc);
        if terminator && grant_demand {
            peer.reset();
            return Ok(events);
        }

        if dst_id != self.cfg.dst_id {
            peer.reset();
            return Ok(events);
        }

        let stream_id = frame.stream_id();

        // New stream owning the voice channel: call start.
        if stream_id != self.flags.rx_stream_id.load(Ordering::Acquire) && !terminator {
            self.flags.call_in_progress.store(true, Ordering::Release);
            self.call_algo_id = ALGO_UNENCRYPT;
            self.call_key_id = 0;

            if frame.frame_type() == FRAME_TYPE_HDU_VALID {
                if let Some((algo, kid, mi)) = frame.hdu_info() {
                    self.call_algo_id = algo;
                    if algo != ALGO_UNENCRYPT {
                        self.call_key_id = kid;
                        if algo != self.crypto.algo_id() && kid != self.crypto.key_id() {
                            self.call_algo_id = ALGO_UNENCRYPT;
                            self.flags.call_in_progress.store(false, Ordering::Release);
                            self.flags.ignore_call.store(true, Ordering::Release);
                            warn!(
                                "P25, call ignored, using different encryption parameters, callAlgoId = ${:02X}, callKID = ${:04X}, tekAlgoId = ${:02X}, tekKID = ${:04X}",
                                algo,
                                kid,
                                self.crypto.algo_id(),
                                self.crypto.key_id()
                            );
                            peer.reset();
                            return Ok(events);
                        }
                        self.crypto.set_mi(&mi);
                        self.crypto.generate_keystream()?;
                    }
                }
            }

            self.rx_start = Some(Instant::now());
            info!(
                "P25, call start, srcId = {src_id}, dstId = {dst_id}, callAlgoId = ${:02X}, callKID = ${:04X}",
                self.call_algo_id, self.call_key_id
            );
            if self.cfg.preamble_leader_tone && self.cfg.local_audio {
                events.push(RxEvent::Preamble(tone::preamble(
                    SAMPLE_RATE,
                    f64::from(self.cfg.preamble_tone),
                    u32::from(self.cfg.preamble_length),
                    0.2 * f64::from(i16::MAX),
                )));
            }
        }

        // Call termination.
        if terminator {
            self.flags.call_in_progress.store(false, Ordering::Release);
            self.flags.ignore_call.store(false, Ordering::Release);
            self.call_algo_id = ALGO_UNENCRYPT;
            self.call_key_id = 0;

            if let Some(start) = self.rx_start.take() {
                info!(
                    "P25, call end, srcId = {src_id}, dstId = {dst_id}, dur = {}s",
                    start.elapsed().as_secs()
                );
                events.push(RxEvent::CallEnded);
            }

            self.flags.rx_stream_id.store(0, Ordering::Release);
            self.crypto.clear_mi();
            self.crypto.reset_keystream();
            peer.reset();
            return Ok(events);
        }

        if self.flags.ignore_call.load(Ordering::Acquire) && self.call_algo_id == ALGO_UNENCRYPT {
            self.flags.ignore_call.store(false, Ordering::Release);
        }
        if self.flags.ignore_call.load(Ordering::Acquire)
            && self.call_algo_id == self.crypto.algo_id()
        {
            self.flags.ignore_call.store(false, Ordering::Release);
        }

        let payload = frame.payload();
        if duid == Duid::Ldu2
            && !self.flags.ignore_call.load(Ordering::Acquire)
            && payload.len() > LDU2_ALGO_OFFSET + 2
        {
            self.call_algo_id = payload[LDU2_ALGO_OFFSET];
            self.call_key_id = u16::from_be_bytes([
                payload[LDU2_ALGO_OFFSET + 1],
                payload[LDU2_ALGO_OFFSET + 2],
            ]);
        }

        // Unsupported change of encryption parameters during the call.
        if self.call_algo_id != ALGO_UNENCRYPT
            && (self.call_algo_id != self.crypto.algo_id()
                || self.call_key_id != self.crypto.key_id())
        {
            if self.flags.call_in_progress.swap(false, Ordering::AcqRel) {
                warn!(
                    "P25, unsupported change of encryption parameters during call, callAlgoId = ${:02X}, callKID = ${:04X}, tekAlgoId = ${:02X}, tekKID = ${:04X}",
                    self.call_algo_id,
                    self.call_key_id,
                    self.crypto.algo_id(),
                    self.crypto.key_id()
                );
                if let Some(start) = self.rx_start.take() {
                    info!(
                        "P25, call end (T), srcId = {src_id}, dstId = {dst_id}, dur = {}s",
                        start.elapsed().as_secs()
                    );
                }
                events.push(RxEvent::CallEnded);
            }
            self.flags.ignore_call.store(true, Ordering::Release);
            peer.reset();
            return Ok(events);
        }

        if self.flags.ignore_call.load(Ordering::Acquire) {
            peer.reset();
            return Ok(events);
        }

        match duid {
            Duid::Ldu1 if dfsi::tags_valid(payload, Ldu::Ldu1) => {
                dfsi::unpack_ldu(Ldu::Ldu1, payload, &mut self.ldu1)?;
                info!("P25, LDU1 (Logical Link Data Unit 1) audio, srcId = {src_id}, dstId = {dst_id}");
                self.decode_audio(Ldu::Ldu1, src_id, dst_id, &mut events)?;
            }
            Duid::Ldu2 if dfsi::tags_valid(payload, Ldu::Ldu2) => {
                let (sync, _lsd) = dfsi::unpack_ldu(Ldu::Ldu2, payload, &mut self.ldu2)?;
                info!(
                    "P25, LDU2 (Logical Link Data Unit 2) audio, algo = ${:02X}, kid = ${:04X}",
                    sync.alg_id, sync.k_id
                );
                // A late join has no keystream for the superframe in
                // flight; the audio is lost but the encryption sync
                // below still has to be taken.
                if let Err(e) = self.decode_audio(Ldu::Ldu2, src_id, dst_id, &mut events) {
                    warn!("P25, LDU2 audio dropped, {e}");
                }

                // Carry the MI forward for the next superframe.
                if sync.alg_id == self.crypto.algo_id()
                    && sync.k_id == self.crypto.key_id()
                    && self.tek_active()
                {
                    self.crypto.set_mi(&sync.mi);
                    self.crypto.generate_keystream()?;
                } else {
                    self.crypto.clear_mi();
                }
            }
            _ => {}
        }

        self.flags.rx_stream_id.store(stream_id, Ordering::Release);
        Ok(events)
    }

    fn decode_audio(
        &mut self,
        ldu: Ldu,
        src_id: u32,
        dst_id: u32,
        events: &mut Vec<RxEvent>,
    ) -> Result<()> {
        let sf = match ldu {
            Ldu::Ldu1 => self.ldu1,
            Ldu::Ldu2 => self.ldu2,
        };
        for n in 0..9 {
            let off = IMBE_OFFSETS[n];
            let mut imbe = [0u8; RAW_IMBE_LENGTH_BYTES];
            imbe.copy_from_slice(&sf[off..off + RAW_IMBE_LENGTH_BYTES]);

            // Clear calls pass through untouched even with a TEK
            // loaded.
            if self.call_algo_id != ALGO_UNENCRYPT && self.tek_active() {
                self.crypto.crypt_imbe(&mut imbe, ldu, n)?;
            }

            let mut samples = [0i16; AUDIO_SAMPLES_LENGTH];
            self.vocoder.decode(&imbe, &mut samples);
            apply_gain(&mut samples, self.cfg.rx_audio_gain);
            events.push(RxEvent::Pcm {
                samples,
                src_id,
                dst_id,
            });
        }
        Ok(())
    }
}

/// A frame the TX engine wants on the network. Produced under the
/// audio lock, written to the peer after it is released.
pub enum Emit {
    /// LDU1 with its superframe buffer.
    Ldu1 {
        /// Link control.
        lc: LinkControl,
        /// Low speed data.
        lsd: LowSpeedData,
        /// Voice payload.
        superframe: [u8; SUPERFRAME_BYTES],
        /// Frame type marker for the header extension.
        frame_type: u8,
        /// Control byte.
        control: u8,
    },
    /// LDU2 with its superframe buffer.
    Ldu2 {
        /// Link control.
        lc: LinkControl,
        /// Low speed data.
        lsd: LowSpeedData,
        /// Voice payload.
        superframe: [u8; SUPERFRAME_BYTES],
        /// Control byte.
        control: u8,
    },
    /// Terminator; `ends_call` distinguishes a real end from a
    /// grant-demand kick at call start.
    Tdu {
        /// Link control.
        lc: LinkControl,
        /// Low speed data.
        lsd: LowSpeedData,
        /// Control byte.
        control: u8,
        /// Whether the voice stream is over.
        ends_call: bool,
    },
}

/// Audio-to-network half of the call engine.
pub struct TxEngine {
    cfg: Config,
    flags: Arc<Flags>,
    vocoder: Box<dyn Vocoder>,
    crypto: Keystream,
    ldu1: [u8; SUPERFRAME_BYTES],
    ldu2: [u8; SUPERFRAME_BYTES],
    n: u8,
    seq_no: u32,
    /// Source id override learned from MDC signalling.
    pub src_override: u32,
    udp_src_id: u32,
    udp_dst_id: u32,
    traffic_from_udp: bool,
    udp_frame_cnt: u32,
    /// Drop timer for locally sourced audio.
    pub local_drop: Timer,
    /// Drop timer for UDP sourced audio.
    pub udp_drop: Timer,
}

impl TxEngine {
    /// Build the TX engine; loads the configured TEK when present.
    pub fn new(cfg: Config, flags: Arc<Flags>, vocoder: Box<dyn Vocoder>) -> Result<Self> {
        let mut crypto = Keystream::new();
        if let Some(key) = cfg.tek_key()? {
            crypto.set_tek(cfg.tek_algo_id()?, cfg.tek.key_id as u16, &key)?;
        }
        let drop_ms = cfg.drop_time_ms;
        Ok(Self {
            cfg,
            flags,
            vocoder,
            crypto,
            ldu1: [0; SUPERFRAME_BYTES],
            ldu2: [0; SUPERFRAME_BYTES],
            n: 0,
            seq_no: 0,
            src_override: 0,
            udp_src_id: 0,
            udp_dst_id: 0,
            traffic_from_udp: false,
            udp_frame_cnt: 0,
            local_drop: Timer::new(drop_ms),
            udp_drop: Timer::new(drop_ms),
        })
    }

    /// Load a TEK delivered by the network key exchange.
    pub fn load_tek(&mut self, algo_id: u8, key_id: u16, key: &[u8]) -> Result<()> {
        self.crypto.set_tek(algo_id, key_id, key)
    }

    fn tek_active(&self) -> bool {
        self.crypto.algo_id() != ALGO_UNENCRYPT
            && self.crypto.key_id() > 0
            && self.crypto.tek_len() > 0
    }

    fn traffic_type(&self) -> &'static str {
        if self.traffic_from_udp {
            "UDP Traffic"
        } else {
            "Local Traffic"
        }
    }

    fn local_ids(&self) -> (u32, u32) {
        let mut src = self.cfg.src_id;
        if self.src_override != 0 && self.cfg.override_source_id_from_mdc {
            src = self.src_override;
        }
        if self.traffic_from_udp {
            src = self.udp_src_id;
        }
        (src, self.cfg.dst_id)
    }

    fn grant_demand_tdu(&self, src_id: u32, dst_id: u32, switch_over: bool) -> Emit {
        let lc = LinkControl::group(src_id, dst_id);
        let mut control = NET_CTRL_GRANT_DEMAND;
        if self.crypto.algo_id() != ALGO_UNENCRYPT {
            control |= NET_CTRL_GRANT_ENCRYPT;
        }
        if switch_over {
            control |= NET_CTRL_SWITCH_OVER;
        }
        Emit::Tdu {
            lc,
            lsd: LowSpeedData::default(),
            control,
            ends_call: false,
        }
    }

    /// Run VOX gating and, when a call is up, encode one 20 ms frame
    /// of locally captured audio.
    pub fn process_local_frame(
        &mut self,
        samples: &mut [i16; AUDIO_SAMPLES_LENGTH],
    ) -> Result<Vec<Emit>> {
        let mut emits = Vec::new();
        let threshold = self.cfg.vox_sample_level / 1000.0;
        let max_sample = samples
            .iter()
            .map(|s| f32::from(*s).abs())
            .fold(0.0f32, f32::max)
            / 1000.0;

        let (src_id, dst_id) = self.local_ids();
        let cor_active = self.flags.cts_cor_active.load(Ordering::Acquire);

        // VOX only drives the call while COR is not in charge.
        if !cor_active {
            if max_sample > threshold {
                self.flags.audio_detect.store(true, Ordering::Release);
                if self.flags.tx_stream_id.load(Ordering::Acquire) == 0 {
                    self.flags.tx_stream_id.store(1, Ordering::Release);
                    info!(
                        "{}, call start, srcId = {src_id}, dstId = {dst_id}",
                        self.traffic_type()
                    );
                    if self.cfg.grant_demand {
                        emits.push(self.grant_demand_tdu(src_id, dst_id, false));
                    }
                }
                self.local_drop.stop();
            } else {
                if self.local_drop.is_running()
                    && self.local_drop.has_expired()
                    && self.flags.audio_detect.load(Ordering::Acquire)
                {
                    emits.extend(self.call_end(src_id, dst_id)?);
                }
                if !self.local_drop.is_running() {
                    self.local_drop.start();
                }
            }
        }

        if self.flags.audio_detect.load(Ordering::Acquire)
            && !self.flags.call_in_progress.load(Ordering::Acquire)
            && (cor_active || max_sample > threshold)
        {
            emits.extend(self.encode_frame(samples, 0)?);
        }
        Ok(emits)
    }

    /// Handle one 20 ms frame arriving over the UDP audio path,
    /// including the source-id override policy and forced call start.
    pub fn process_udp_frame(
        &mut self,
        samples: &mut [i16; AUDIO_SAMPLES_LENGTH],
        meta_src_id: u32,
    ) -> Result<Vec<Emit>> {
        let mut emits = Vec::new();
        let mut force_call_start = false;
        let prior_tx_stream = self.flags.tx_stream_id.load(Ordering::Acquire);

        if self.cfg.udp_metadata && self.cfg.override_source_id_from_udp {
            if meta_src_id != 0 && self.udp_src_id != 0 {
                if self.cfg.reset_call_for_source_id_change && meta_src_id != self.udp_src_id {
                    info!(
                        "UDP Traffic, call switch over, old srcId = {}, new srcId = {meta_src_id}",
                        self.udp_src_id
                    );
                    emits.extend(self.call_end(self.udp_src_id, self.cfg.dst_id)?);
                    if self.udp_drop.is_running() {
                        self.udp_drop.start();
                    }
                    force_call_start = true;
                }
                self.udp_src_id = meta_src_id;
            } else if self.udp_src_id == 0 {
                self.udp_src_id = if meta_src_id != 0 {
                    meta_src_id
                } else {
                    self.cfg.src_id
                };
            }
        } else {
            self.udp_src_id = self.cfg.src_id;
        }
        self.udp_dst_id = self.cfg.dst_id;

        let idle = !self.flags.audio_detect.load(Ordering::Acquire)
            && !self.flags.call_in_progress.load(Ordering::Acquire);
        if idle || force_call_start {
            self.flags.audio_detect.store(true, Ordering::Release);
            if self.flags.tx_stream_id.load(Ordering::Acquire) == 0 {
                let stream = if force_call_start { prior_tx_stream } else { 1 };
                self.flags.tx_stream_id.store(stream, Ordering::Release);
                info!(
                    "UDP Traffic, call start, srcId = {}, dstId = {}",
                    self.udp_src_id, self.udp_dst_id
                );
                if self.cfg.grant_demand {
                    emits.push(self.grant_demand_tdu(self.udp_src_id, self.udp_dst_id, true));
                }
            }
            self.udp_drop.start();
        }

        self.traffic_from_udp = true;

        if self.flags.audio_detect.load(Ordering::Acquire)
            && !self.flags.call_in_progress.load(Ordering::Acquire)
        {
            self.udp_drop.start();
            let src = self.udp_src_id;
            emits.extend(self.encode_frame(samples, src)?);
        }
        self.udp_frame_cnt += 1;
        Ok(emits)
    }

    /// Encode one PCM frame into the superframe pipeline, emitting
    /// LDU1 at N=8 and LDU2 (plus the MI roll) at N=17.
    fn encode_frame(
        &mut self,
        samples: &mut [i16; AUDIO_SAMPLES_LENGTH],
        forced_src_id: u32,
    ) -> Result<Vec<Emit>> {
        if self.cfg.tx_mode != TxMode::P25 {
            return Err(Error::Unsupported(format!(
                "transmit mode {:?}",
                self.cfg.tx_mode
            )));
        }

        if self.n > 17 {
            self.n = 0;
        }
        if self.n == 0 {
            self.ldu1 = [0; SUPERFRAME_BYTES];
        }
        if self.n == 9 {
            self.ldu2 = [0; SUPERFRAME_BYTES];
        }

        apply_gain(samples, self.cfg.tx_audio_gain);
        let mut imbe = self.vocoder.encode(samples);

        if self.tek_active() {
            // First block of a fresh call: establish MI and keystream.
            if self.n == 0 && !self.crypto.has_valid_keystream() {
                if !self.crypto.has_valid_mi() {
                    self.crypto.generate_mi();
                }
                self.crypto.generate_keystream()?;
            }

            let (ldu, _) = dfsi::superframe_slot(self.n as usize);
            self.crypto.crypt_imbe(&mut imbe, ldu, self.n as usize % 9)?;
        }

        let (_, offset) = dfsi::superframe_slot(self.n as usize);
        let buf = if self.n < 9 {
            &mut self.ldu1
        } else {
            &mut self.ldu2
        };
        buf[offset..offset + RAW_IMBE_LENGTH_BYTES].copy_from_slice(&imbe);

        // On the last block of the LDU2 generate the next MI so the
        // outgoing encryption sync points at the next superframe.
        if self.tek_active() && self.n == 17 {
            self.crypto.generate_next_mi();
            self.crypto.generate_keystream()?;
        }

        let (mut src_id, dst_id) = self.local_ids();
        if forced_src_id > 0 && forced_src_id != self.cfg.src_id {
            src_id = forced_src_id;
        }
        if src_id == 0 {
            src_id = self.cfg.src_id;
        }

        let mut lc = LinkControl::group(src_id, dst_id);
        lc.alg_id = self.crypto.algo_id();
        lc.k_id = self.crypto.key_id();
        lc.mi = self.crypto.mi();
        let lsd = LowSpeedData::default();

        let mut emits = Vec::new();
        if self.n == 8 {
            info!(
                "P25, LDU1 (Logical Link Data Unit 1) audio, srcId = {src_id}, dstId = {dst_id}"
            );
            emits.push(Emit::Ldu1 {
                lc: lc.clone(),
                lsd,
                superframe: self.ldu1,
                frame_type: FRAME_TYPE_HDU_VALID,
                control: NET_CTRL_SWITCH_OVER,
            });
        }
        if self.n == 17 {
            info!(
                "P25, LDU2 (Logical Link Data Unit 2) audio, algo = ${:02X}, kid = ${:04X}",
                lc.alg_id, lc.k_id
            );
            emits.push(Emit::Ldu2 {
                lc,
                lsd,
                superframe: self.ldu2,
                control: NET_CTRL_SWITCH_OVER,
            });
        }

        self.seq_no += 1;
        self.n += 1;
        if self.n > 17 {
            self.n = 0;
        }
        Ok(emits)
    }

    /// Fill the open superframe out to its boundary with silence and
    /// emit it, so the receiver never sees a torn superframe.
    fn pad_silence(&mut self, src_id: u32, dst_id: u32) -> Vec<Emit> {
        let mut emits = Vec::new();
        let null: &[u8; RAW_IMBE_LENGTH_BYTES] = if self.tek_active() {
            &ENCRYPTED_NULL_IMBE
        } else {
            &NULL_IMBE
        };

        if self.n == 0 || self.n == 9 {
            return emits;
        }

        if self.n < 9 {
            warn!(
                "incomplete audio frame, padding {} audio sequences with silence",
                8 - self.n
            );
            for slot in (self.n as usize)..9 {
                let off = IMBE_OFFSETS[slot];
                self.ldu1[off..off + RAW_IMBE_LENGTH_BYTES].copy_from_slice(null);
            }
            self.n = 8;
        } else if self.n < 17 {
            warn!(
                "incomplete audio frame, padding {} audio sequences with silence",
                17 - self.n
            );
            for slot in (self.n as usize - 9)..9 {
                let off = IMBE_OFFSETS[slot];
                self.ldu2[off..off + RAW_IMBE_LENGTH_BYTES].copy_from_slice(null);
            }
            self.n = 17;
        }

        let mut lc = LinkControl::group(src_id, dst_id);
        lc.alg_id = self.crypto.algo_id();
        lc.k_id = self.crypto.key_id();
        lc.mi = self.crypto.mi();
        let lsd = LowSpeedData::default();

        if self.n == 8 {
            info!(
                "P25, LDU1 (Logical Link Data Unit 1) audio (silence padded), srcId = {src_id}, dstId = {dst_id}"
            );
            emits.push(Emit::Ldu1 {
                lc,
                lsd,
                superframe: self.ldu1,
                frame_type: crate::net::FRAME_TYPE_DATA_UNIT,
                control: 0,
            });
            self.n = 9;
        } else if self.n == 17 {
            info!(
                "P25, LDU2 (Logical Link Data Unit 2) audio (silence padded), algo = ${:02X}, kid = ${:04X}",
                lc.alg_id, lc.k_id
            );
            emits.push(Emit::Ldu2 {
                lc,
                lsd,
                superframe: self.ldu2,
                control: 0,
            });
            self.n = 0;
        }
        emits
    }

    /// End the local or UDP call: pad, terminate, and reset all of the
    /// per-call transmit state.
    pub fn call_end(&mut self, src_id: u32, dst_id: u32) -> Result<Vec<Emit>> {
        let mut src_id = src_id;
        if self.traffic_from_udp {
            src_id = self.udp_src_id;
        }

        if src_id == 0
            && !self.flags.audio_detect.load(Ordering::Acquire)
            && (!self.local_drop.is_running() || !self.udp_drop.is_running())
        {
            warn!(
                "{}, call end, ignoring invalid call end, srcId = {src_id}, dstId = {dst_id}",
                self.traffic_type()
            );
            return Ok(Vec::new());
        }

        self.flags.audio_detect.store(false, Ordering::Release);
        self.local_drop.stop();
        self.udp_drop.stop();

        let mut emits = Vec::new();
        if !self.flags.call_in_progress.load(Ordering::Acquire) {
            emits.extend(self.pad_silence(src_id, dst_id));

            let lc = LinkControl::group(src_id, dst_id);
            info!("P25, TDU (Terminator Data Unit)");
            emits.push(Emit::Tdu {
                lc,
                lsd: LowSpeedData::default(),
                control: 0,
                ends_call: true,
            });
        }

        info!(
            "{}, call end, srcId = {src_id}, dstId = {dst_id}",
            self.traffic_type()
        );

        self.src_override = 0;
        self.flags.tx_stream_id.store(0, Ordering::Release);
        self.udp_src_id = 0;
        self.udp_dst_id = 0;
        self.traffic_from_udp = false;
        self.udp_frame_cnt = 0;
        self.seq_no = 0;
        self.n = 0;

        self.crypto.clear_mi();
        self.crypto.reset_keystream();
        Ok(emits)
    }

    /// Pad out the open superframe when the UDP stream goes quiet
    /// between frames.
    pub fn pad_udp_silence(&mut self) -> Vec<Emit> {
        let (src_id, dst_id) = (self.udp_src_id, self.udp_dst_id);
        self.pad_silence(src_id, dst_id)
    }

    /// React to a COR edge. Rising forces a call start; falling arms
    /// the drop timer with the configured hold-off.
    pub fn cor_changed(&mut self, active: bool) -> Result<Vec<Emit>> {
        let mut emits = Vec::new();
        if active {
            let (src_id, dst_id) = self.local_ids();
            if !self.flags.audio_detect.swap(true, Ordering::AcqRel)
                && self.flags.tx_stream_id.load(Ordering::Acquire) == 0
            {
                self.flags.tx_stream_id.store(1, Ordering::Release);
                info!("Local Traffic, call start (CTS COR), srcId = {src_id}, dstId = {dst_id}");
                if self.cfg.grant_demand {
                    emits.push(self.grant_demand_tdu(src_id, dst_id, false));
                }
            }
            self.local_drop.stop();
        } else {
            self.local_drop.set_timeout(self.cfg.cts_cor_holdoff_ms);
            self.local_drop.start();
        }
        Ok(emits)
    }

    /// Watchdog tick: clock the drop timers and force-end stuck or
    /// expired calls. `ms` is measured wall time since the last tick.
    pub fn watchdog_tick(&mut self, ms: u64) -> Result<Vec<Emit>> {
        if self.traffic_from_udp {
            self.udp_drop.clock(ms);
        } else {
            self.local_drop.clock(ms);
        }

        let (src_id, dst_id) = self.local_ids();

        if self.traffic_from_udp {
            if self.udp_drop.is_running() && self.udp_drop.has_expired() {
                return self.call_end(src_id, dst_id);
            }
        } else if !self.flags.cts_cor_active.load(Ordering::Acquire)
            && self.local_drop.is_running()
            && self.local_drop.elapsed() >= self.cfg.stuck_call_timeout_ms()
        {
            info!("{}, terminating stuck call", self.traffic_type());
            return self.call_end(src_id, dst_id);
        }
        Ok(Vec::new())
    }

    /// Superframe counter, for the watchdog's debug output.
    pub fn position(&self) -> u8 {
        self.n
    }
}
