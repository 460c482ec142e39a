/*! The worker fabric that runs the bridge.

Four cooperating workers plus the main loop:

* `bridge:net` pulls frames off the network session and drives the RX
  engine,
* `bridge:audio` consumes the input ring at frame rate and drives the
  TX engine,
* `bridge:udp` drains the UDP ingress queue, paced to the frame rate,
* `bridge:watchdog` clocks the drop timers and the PTT hold-off.

Shared state is two mutexes and a handful of atomics. The audio mutex
guards both sample rings *and* the TX engine, since every writer of TX
state already holds it; the network mutex guards the peer session.
Work done under either lock is bounded, and everything a worker wants
to send comes back as values that are written out after the lock
drops, so neither lock is ever held across I/O or together with the
other.
*/
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{Emit, RxEngine, RxEvent, TxEngine};
use crate::net::Peer;
use crate::ring::SampleRing;
use crate::timer::Timer;
use crate::udp::{PacketRequest, UdpEgress, UdpIngress, bind_socket};
use crate::vocoder::Vocoder;
use crate::{AUDIO_SAMPLES_LENGTH, NUMBER_OF_BUFFERS, Result};

/// Process-wide control surface shared by the workers.
pub struct Flags {
    /// The bridge is up; workers idle until this is set.
    pub running: AtomicBool,
    /// Id of the stream this bridge is transmitting, 0 when idle.
    pub tx_stream_id: AtomicU32,
    /// Id of the stream this bridge is receiving, 0 when idle.
    pub rx_stream_id: AtomicU32,
    /// VOX/COR thinks somebody is talking.
    pub audio_detect: AtomicBool,
    /// Hardware carrier detect is asserted.
    pub cts_cor_active: AtomicBool,
    /// A network call owns the voice channel.
    pub call_in_progress: AtomicBool,
    /// The current network call is not for us.
    pub ignore_call: AtomicBool,
}

impl Flags {
    /// Fresh, all-idle flags.
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            tx_stream_id: AtomicU32::new(0),
            rx_stream_id: AtomicU32::new(0),
            audio_detect: AtomicBool::new(false),
            cts_cor_active: AtomicBool::new(false),
            call_in_progress: AtomicBool::new(false),
            ignore_call: AtomicBool::new(false),
        }
    }
}

impl Default for Flags {
    fn default() -> Self {
        Self::new()
    }
}

/// Token for stopping the bridge from another thread, for example a
/// Ctrl-C handler.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// New, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel. All workers drain and exit within one cadence tick.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Push-to-talk line. The serial implementation lives outside the
/// core; the bridge only needs something to toggle.
pub trait Ptt: Send + Sync {
    /// Key or unkey the transmitter.
    fn set(&self, active: bool);
}

/// PTT that goes nowhere.
pub struct NullPtt;

impl Ptt for NullPtt {
    fn set(&self, _active: bool) {}
}

/// Everything guarded by the audio mutex: both sample rings and the
/// transmit half of the call engine. Operations in here stay O(one
/// frame): no logging, no allocation on the device callback path.
pub struct AudioPath {
    /// Capture ring, device callback to audio worker.
    pub input: SampleRing,
    /// Playback ring, decoders to device callback.
    pub output: SampleRing,
    /// The transmit state machine.
    pub tx: TxEngine,
}

pub(crate) struct PttControl {
    dev: Box<dyn Ptt>,
    enabled: bool,
    holdoff_ms: u64,
    active: AtomicBool,
    last_audio_out_ms: AtomicU64,
}

impl PttControl {
    pub(crate) fn assert(&self, now_ms: u64) {
        self.last_audio_out_ms.store(now_ms, Ordering::Release);
        if self.enabled && !self.active.swap(true, Ordering::AcqRel) {
            self.dev.set(true);
        }
    }

    fn release(&self) {
        if self.enabled && self.active.swap(false, Ordering::AcqRel) {
            self.dev.set(false);
        }
    }
}

/// The assembled bridge, ready to run.
pub struct Bridge {
    cfg: Config,
    flags: Arc<Flags>,
    cancel: CancellationToken,
    epoch: Instant,
    audio: Arc<Mutex<AudioPath>>,
    net: Arc<Mutex<Box<dyn Peer>>>,
    rx: RxEngine,
    ptt: Arc<PttControl>,
    #[cfg(feature = "audio")]
    device: Option<crate::audio::AudioDevice>,
}

impl Bridge {
    /// Assemble a bridge from its parts. `decoder` serves the RX
    /// direction, `encoder` the TX direction.
    pub fn new(
        cfg: Config,
        peer: Box<dyn Peer>,
        decoder: Box<dyn Vocoder>,
        encoder: Box<dyn Vocoder>,
        ptt: Box<dyn Ptt>,
    ) -> Result<Self> {
        let flags = Arc::new(Flags::new());
        let rx = RxEngine::new(cfg.clone(), flags.clone(), decoder)?;
        let tx = TxEngine::new(cfg.clone(), flags.clone(), encoder)?;
        let audio = Arc::new(Mutex::new(AudioPath {
            input: SampleRing::new(AUDIO_SAMPLES_LENGTH * NUMBER_OF_BUFFERS),
            output: SampleRing::new(AUDIO_SAMPLES_LENGTH * NUMBER_OF_BUFFERS),
            tx,
        }));
        let ptt = Arc::new(PttControl {
            dev: ptt,
            enabled: cfg.rts_ptt_enable,
            holdoff_ms: cfg.rts_ptt_holdoff_ms,
            active: AtomicBool::new(false),
            last_audio_out_ms: AtomicU64::new(0),
        });
        Ok(Self {
            cfg,
            flags,
            cancel: CancellationToken::new(),
            epoch: Instant::now(),
            audio,
            net: Arc::new(Mutex::new(peer)),
            rx,
            ptt,
            #[cfg(feature = "audio")]
            device: None,
        })
    }

    /// Token to stop the bridge asynchronously.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shared flags, mostly for embedding and tests.
    pub fn flags(&self) -> Arc<Flags> {
        self.flags.clone()
    }

    /// The audio path, for wiring external capture/playback.
    pub fn audio_path(&self) -> Arc<Mutex<AudioPath>> {
        self.audio.clone()
    }

    /// Attach the local sound device.
    #[cfg(feature = "audio")]
    pub fn attach_audio_device(&mut self) -> Result<()> {
        let dev = crate::audio::AudioDevice::start(
            self.audio.clone(),
            self.flags.clone(),
            self.ptt.clone(),
            self.epoch,
        )?;
        self.device = Some(dev);
        Ok(())
    }

    /// Feed a COR edge into the transmit machine. The serial monitor
    /// itself lives outside the core.
    pub fn set_cor(&self, active: bool) -> Result<()> {
        self.flags.cts_cor_active.store(active, Ordering::Release);
        let emits = {
            let mut a = self.audio.lock().expect("audio lock");
            a.tx.cor_changed(active)?
        };
        send_emits(&self.net, &self.flags, &self.ptt, emits);
        Ok(())
    }

    /// Run until cancelled. Spawns the workers, services the main
    /// loop, and joins everything on the way out.
    pub fn run(mut self) -> Result<()> {
        let (udp_tx, udp_rx) = mpsc::channel::<PacketRequest>();

        let mut udp_ingress = None;
        let mut udp_egress = None;
        if self.cfg.udp_audio {
            let socket = bind_socket(&self.cfg)?;
            udp_ingress = Some(UdpIngress::new(socket.clone(), self.cfg.clone()));
            let peer_id = self.net.lock().expect("network lock").peer_id();
            udp_egress = Some(UdpEgress::new(socket, self.cfg.clone(), peer_id)?);
        }

        let mut workers = Vec::new();

        // Network worker: ingress frames through the RX engine.
        {
            let cancel = self.cancel.clone();
            let flags = self.flags.clone();
            let net = self.net.clone();
            let audio = self.audio.clone();
            let ptt = self.ptt.clone();
            let cfg = self.cfg.clone();
            let epoch = self.epoch;
            let mut rx = self.rx;
            let mut egress = udp_egress;
            workers.push(
                std::thread::Builder::new()
                    .name("bridge:net".into())
                    .spawn(move || {
                        info!("[ OK ] bridge:net");
                        while !cancel.is_canceled() {
                            if !flags.running.load(Ordering::Acquire) {
                                std::thread::sleep(Duration::from_millis(10));
                                continue;
                            }
                            let frame = {
                                let mut peer = net.lock().expect("network lock");
                                peer.read()
                            };
                            let Some(frame) = frame else {
                                std::thread::sleep(Duration::from_millis(1));
                                continue;
                            };
                            let events = {
                                let mut peer = net.lock().expect("network lock");
                                rx.process_frame(&frame, &mut **peer)
                            };
                            let events = match events {
                                Ok(ev) => ev,
                                Err(e) => {
                                    warn!("P25, frame dropped, {e}");
                                    continue;
                                }
                            };
                            route_rx_events(
                                events, &cfg, &audio, &ptt, egress.as_mut(), epoch,
                            );
                        }
                        info!("[STOP] bridge:net");
                    })
                    .expect("spawning network worker"),
            );
        }

        // Audio worker: input ring through the TX engine.
        if self.cfg.local_audio {
            let cancel = self.cancel.clone();
            let flags = self.flags.clone();
            let net = self.net.clone();
            let audio = self.audio.clone();
            let ptt = self.ptt.clone();
            workers.push(
                std::thread::Builder::new()
                    .name("bridge:audio".into())
                    .spawn(move || {
                        info!("[ OK ] bridge:audio");
                        while !cancel.is_canceled() {
                            if !flags.running.load(Ordering::Acquire) {
                                std::thread::sleep(Duration::from_millis(10));
                                continue;
                            }
                            let emits = {
                                let mut a = audio.lock().expect("audio lock");
                                if a.input.data_size() >= AUDIO_SAMPLES_LENGTH {
                                    let mut samples = [0i16; AUDIO_SAMPLES_LENGTH];
                                    a.input.get(&mut samples);
                                    a.tx.process_local_frame(&mut samples)
                                } else {
                                    Ok(Vec::new())
                                }
                            };
                            match emits {
                                Ok(emits) => send_emits(&net, &flags, &ptt, emits),
                                Err(e) => error!("local audio frame failed: {e}"),
                            }
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        info!("[STOP] bridge:audio");
                    })
                    .expect("spawning audio worker"),
            );
        }

        // UDP audio worker: queued frames through the TX engine, paced
        // to the 20 ms frame rate when asked to.
        if self.cfg.udp_audio {
            let cancel = self.cancel.clone();
            let flags = self.flags.clone();
            let net = self.net.clone();
            let audio = self.audio.clone();
            let ptt = self.ptt.clone();
            let cfg = self.cfg.clone();
            let epoch = self.epoch;
            workers.push(
                std::thread::Builder::new()
                    .name("bridge:udp".into())
                    .spawn(move || {
                        info!("[ OK ] bridge:udp");
                        let paced = cfg.udp_frame_timing
                            || (cfg.udp_rtp_frames && !cfg.udp_ignore_rtp_timing);
                        let mut last_frame_ms: u64 = 0;
                        let mut gap = Timer::new(22);
                        let mut last_tick = Instant::now();
                        while !cancel.is_canceled() {
                            if !flags.running.load(Ordering::Acquire) {
                                std::thread::sleep(Duration::from_millis(10));
                                continue;
                            }

                            // Raw streams carry no timing of their own;
                            // a gap gets padded out with silence.
                            if !cfg.udp_rtp_frames && !cfg.udp_usrp {
                                gap.clock(last_tick.elapsed().as_millis() as u64);
                                if gap.is_running() && gap.has_expired() {
                                    gap.stop();
                                    let emits = {
                                        let mut a = audio.lock().expect("audio lock");
                                        a.tx.pad_udp_silence()
                                    };
                                    send_emits(&net, &flags, &ptt, emits);
                                }
                            }
                            last_tick = Instant::now();

                            let Ok(mut req) = udp_rx.recv_timeout(Duration::from_millis(1))
                            else {
                                continue;
                            };

                            if paced {
                                let now = epoch.elapsed().as_millis() as u64;
                                if last_frame_ms != 0 && now < last_frame_ms + 20 {
                                    std::thread::sleep(Duration::from_millis(
                                        last_frame_ms + 20 - now,
                                    ));
                                }
                                last_frame_ms = epoch.elapsed().as_millis() as u64;
                            }

                            let emits = {
                                let mut a = audio.lock().expect("audio lock");
                                a.tx.process_udp_frame(&mut req.samples, req.src_id)
                            };
                            gap.start();
                            match emits {
                                Ok(emits) => send_emits(&net, &flags, &ptt, emits),
                                Err(e) => error!("UDP audio frame failed: {e}"),
                            }
                        }
                        info!("[STOP] bridge:udp");
                    })
                    .expect("spawning UDP worker"),
            );
        }

        // Watchdog: drop timers, stuck calls and the PTT hold-off.
        {
            let cancel = self.cancel.clone();
            let flags = self.flags.clone();
            let net = self.net.clone();
            let audio = self.audio.clone();
            let ptt = self.ptt.clone();
            let epoch = self.epoch;
            workers.push(
                std::thread::Builder::new()
                    .name("bridge:watchdog".into())
                    .spawn(move || {
                        info!("[ OK ] bridge:watchdog");
                        let mut last = Instant::now();
                        while !cancel.is_canceled() {
                            std::thread::sleep(Duration::from_millis(5));
                            if !flags.running.load(Ordering::Acquire) {
                                continue;
                            }
                            let ms = last.elapsed().as_millis() as u64;
                            last = Instant::now();

                            let emits = {
                                let mut a = audio.lock().expect("audio lock");
                                a.tx.watchdog_tick(ms)
                            };
                            match emits {
                                Ok(emits) => send_emits(&net, &flags, &ptt, emits),
                                Err(e) => error!("watchdog call end failed: {e}"),
                            }

                            // Debounced PTT release.
                            if ptt.active.load(Ordering::Acquire) {
                                let now_ms = epoch.elapsed().as_millis() as u64;
                                let idle =
                                    now_ms.saturating_sub(ptt.last_audio_out_ms.load(Ordering::Acquire));
                                if idle >= ptt.holdoff_ms {
                                    ptt.release();
                                }
                            }
                        }
                        info!("[STOP] bridge:watchdog");
                    })
                    .expect("spawning watchdog"),
            );
        }

        info!("Bridge is up and running");
        self.flags.running.store(true, Ordering::Release);

        // Main loop: network clock, audio device health, UDP ingress.
        let mut last = Instant::now();
        while !self.cancel.is_canceled() {
            let ms = last.elapsed().as_millis() as u64;
            last = Instant::now();

            #[cfg(feature = "audio")]
            if let Some(dev) = self.device.as_mut() {
                if !dev.healthy() {
                    error!("audio device state invalid");
                    dev.restart().map_err(|e| {
                        self.cancel.cancel();
                        crate::Error::Audio(format!("failed to reinitialize audio device: {e}"))
                    })?;
                }
            }

            {
                let mut peer = self.net.lock().expect("network lock");
                peer.clock(ms);
            }

            if let Some(ingress) = udp_ingress.as_mut() {
                while let Some(req) = ingress.poll() {
                    if udp_tx.send(req).is_err() {
                        break;
                    }
                }
            }

            if ms < 2 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        self.flags.running.store(false, Ordering::Release);
        for w in workers {
            let name = w.thread().name().unwrap_or("worker").to_string();
            if w.join().is_err() {
                error!("{name} panicked");
            }
        }
        Ok(())
    }
}

/// Deliver RX engine output: PCM to the playback ring and the UDP
/// egress, control events to the stream state.
fn route_rx_events(
    events: Vec<RxEvent>,
    cfg: &Config,
    audio: &Mutex<AudioPath>,
    ptt: &PttControl,
    mut egress: Option<&mut UdpEgress>,
    epoch: Instant,
) {
    let mut overflowed = false;
    for event in events {
        match event {
            RxEvent::Pcm {
                samples,
                src_id,
                dst_id,
            } => {
                if cfg.local_audio {
                    {
                        let mut a = audio.lock().expect("audio lock");
                        overflowed |= !a.output.add_data(&samples);
                    }
                    ptt.assert(epoch.elapsed().as_millis() as u64);
                }
                if let Some(egress) = egress.as_deref_mut() {
                    if let Err(e) = egress.write_audio(src_id, dst_id, &samples) {
                        warn!("UDP audio write failed: {e}");
                    }
                }
            }
            RxEvent::Preamble(samples) => {
                let mut a = audio.lock().expect("audio lock");
                if !a.output.add_data(&samples) {
                    drop(a);
                    error!("failed to generate preamble tone");
                }
            }
            RxEvent::CallEnded => {
                if let Some(egress) = egress.as_deref_mut() {
                    if cfg.udp_usrp {
                        if let Err(e) = egress.send_eot() {
                            warn!("USRP EOT failed: {e}");
                        }
                    }
                    egress.reset();
                }
            }
        }
    }
    if overflowed {
        debug!("output ring full, dropping decoded audio");
    }
}

/// Write engine emissions to the peer. Takes the network lock per
/// frame; never called with the audio lock held.
fn send_emits(
    net: &Mutex<Box<dyn Peer>>,
    flags: &Flags,
    ptt: &PttControl,
    emits: Vec<Emit>,
) {
    for emit in emits {
        let mut peer = net.lock().expect("network lock");
        let result = match emit {
            Emit::Ldu1 {
                lc,
                lsd,
                superframe,
                frame_type,
                control,
            } => {
                let r = peer.write_ldu1(&lc, &lsd, &superframe, frame_type, control);
                flags
                    .tx_stream_id
                    .store(peer.stream_id(), Ordering::Release);
                r
            }
            Emit::Ldu2 {
                lc,
                lsd,
                superframe,
                control,
            } => peer.write_ldu2(&lc, &lsd, &superframe, control),
            Emit::Tdu {
                lc,
                lsd,
                control,
                ends_call,
            } => {
                let r = peer.write_tdu(&lc, &lsd, control);
                if ends_call {
                    peer.reset();
                    ptt.release();
                }
                r
            }
        };
        if let Err(e) = result {
            warn!("network write failed: {e}");
        }
    }
}
