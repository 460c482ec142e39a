/*! UDP audio path.

Three selectable wire formats:

* raw: 4-byte big-endian length ‖ 160 samples of 16-bit LE PCM,
* RTP: 12-byte header (G.711 payload type) ‖ µ-law or PCM payload,
* USRP: 32-byte "USRP" header ‖ 160 samples of PCM.

Raw and RTP can append 4-byte destination and source ids when metadata
is enabled. Ingress parses a datagram into a [`PacketRequest`]; the
UDP worker drains those at frame rate. Egress owns the RTP/USRP
sequence state, so only one thread ever touches it.
*/
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use log::{debug, warn};

use crate::config::Config;
use crate::mulaw;
use crate::rtp::{
    INVALID_TS, RTP_END_OF_CALL_SEQ, RTP_G711_PAYLOAD_TYPE, RTP_GENERIC_CLOCK_RATE,
    RTP_HEADER_LENGTH_BYTES, RtpHeader,
};
use crate::{AUDIO_SAMPLES_LENGTH, AUDIO_SAMPLES_LENGTH_BYTES, Error, Result};

/// USRP header length.
pub const USRP_HEADER_LENGTH: usize = 32;

/// One received UDP audio frame, decoded to linear PCM and queued for
/// the UDP worker.
pub struct PacketRequest {
    /// 20 ms of linear PCM.
    pub samples: [i16; AUDIO_SAMPLES_LENGTH],
    /// RTP header when the path runs RTP framing.
    pub rtp: Option<RtpHeader>,
    /// Source id from metadata, or the configured source.
    pub src_id: u32,
    /// Destination id.
    pub dst_id: u32,
}

/// Bind the shared UDP audio socket.
pub fn bind_socket(cfg: &Config) -> Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind((cfg.udp_receive_address.as_str(), cfg.udp_receive_port))?;
    socket.set_nonblocking(true)?;
    debug!("UDP audio socket bound on {}", socket.local_addr()?);
    Ok(Arc::new(socket))
}

/// Ingress side: reads datagrams, validates sequencing, decodes µ-law.
pub struct UdpIngress {
    socket: Arc<UdpSocket>,
    cfg: Config,
    last_pkt_seq: u16,
}

impl UdpIngress {
    /// New ingress reader over the shared socket.
    pub fn new(socket: Arc<UdpSocket>, cfg: Config) -> Self {
        Self {
            socket,
            cfg,
            last_pkt_seq: 0,
        }
    }

    /// Read and parse at most one datagram.
    pub fn poll(&mut self) -> Option<PacketRequest> {
        let mut buf = [0u8; 2048];
        let len = match self.socket.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                warn!("UDP audio read failed: {e}");
                return None;
            }
        };
        self.parse(&buf[..len])
    }

    fn parse(&mut self, buf: &[u8]) -> Option<PacketRequest> {
        let ulaw = self.cfg.udp_use_ulaw;
        let min_payload = if ulaw {
            AUDIO_SAMPLES_LENGTH
        } else {
            AUDIO_SAMPLES_LENGTH_BYTES
        };

        let payload: &[u8];
        let mut rtp = None;
        if self.cfg.udp_rtp_frames {
            let hdr = match RtpHeader::decode(buf) {
                Ok(h) => h,
                Err(e) => {
                    warn!("bad RTP audio frame: {e}");
                    return None;
                }
            };
            if hdr.payload_type != RTP_G711_PAYLOAD_TYPE {
                warn!("Invalid RTP payload type {}", hdr.payload_type);
                return None;
            }

            let seq = hdr.sequence;
            if seq == RTP_END_OF_CALL_SEQ {
                self.last_pkt_seq = 0;
            } else {
                let last = self.last_pkt_seq;
                if seq >= last || seq == 0 {
                    // A jump past last+1 means frames went missing.
                    if seq != 0 && seq > last + 1 {
                        warn!("audio possible lost frames; got {seq}, expected {}", last + 1);
                    }
                    self.last_pkt_seq = seq;
                } else {
                    warn!("audio out-of-order; got {seq}, expected {}", last + 1);
                    return None;
                }
            }

            if buf.len() < RTP_HEADER_LENGTH_BYTES + min_payload {
                return None;
            }
            payload = &buf[RTP_HEADER_LENGTH_BYTES..RTP_HEADER_LENGTH_BYTES + min_payload];
            rtp = Some(hdr);
        } else if self.cfg.udp_usrp {
            if buf.len() < USRP_HEADER_LENGTH || &buf[..4] != b"USRP" {
                return None;
            }
            // PTT down is a bare end-of-transmission header.
            if buf[15] != 1 || buf.len() < USRP_HEADER_LENGTH + AUDIO_SAMPLES_LENGTH_BYTES {
                return None;
            }
            payload = &buf[USRP_HEADER_LENGTH..USRP_HEADER_LENGTH + AUDIO_SAMPLES_LENGTH_BYTES];
        } else {
            if buf.len() < 4 + min_payload {
                return None;
            }
            payload = &buf[4..4 + min_payload];
        }

        let mut samples = [0i16; AUDIO_SAMPLES_LENGTH];
        if ulaw {
            for (s, &b) in samples.iter_mut().zip(payload) {
                *s = mulaw::decode(b);
            }
        } else {
            for (i, s) in samples.iter_mut().enumerate() {
                *s = i16::from_le_bytes([payload[2 * i], payload[2 * i + 1]]);
            }
        }

        let src_id = if self.cfg.udp_metadata {
            let meta_at = if self.cfg.udp_rtp_frames {
                RTP_HEADER_LENGTH_BYTES + min_payload + 4
            } else {
                4 + min_payload + 4
            };
            if buf.len() >= meta_at + 4 {
                u32::from_be_bytes([buf[meta_at], buf[meta_at + 1], buf[meta_at + 2], buf[meta_at + 3]])
            } else {
                self.cfg.src_id
            }
        } else {
            self.cfg.src_id
        };

        Some(PacketRequest {
            samples,
            rtp,
            src_id,
            dst_id: self.cfg.dst_id,
        })
    }
}

/// Egress side: frames PCM for the configured wire format and owns the
/// RTP/USRP sequence counters.
pub struct UdpEgress {
    socket: Arc<UdpSocket>,
    cfg: Config,
    send_addr: SocketAddr,
    peer_id: u32,
    rtp_seq: u16,
    rtp_timestamp: u32,
    usrp_seq: u32,
}

impl UdpEgress {
    /// New egress writer over the shared socket.
    pub fn new(socket: Arc<UdpSocket>, cfg: Config, peer_id: u32) -> Result<Self> {
        let send_addr = (cfg.udp_send_address.as_str(), cfg.udp_send_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Config("cannot resolve udpSendAddress".into()))?;
        Ok(Self {
            socket,
            cfg,
            send_addr,
            peer_id,
            rtp_seq: 0,
            rtp_timestamp: INVALID_TS,
            usrp_seq: 0,
        })
    }

    /// Frame and send one 20 ms PCM block.
    pub fn write_audio(
        &mut self,
        src_id: u32,
        dst_id: u32,
        samples: &[i16; AUDIO_SAMPLES_LENGTH],
    ) -> Result<()> {
        let mut pcm = Vec::with_capacity(AUDIO_SAMPLES_LENGTH_BYTES);
        if self.cfg.udp_use_ulaw {
            pcm.extend(samples.iter().map(|&s| mulaw::encode(s)));
        } else {
            for &s in samples {
                pcm.extend_from_slice(&s.to_le_bytes());
            }
        }

        let mut out;
        if self.cfg.udp_rtp_frames {
            if self.rtp_timestamp == INVALID_TS {
                self.rtp_timestamp = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or(1);
                debug!("RTP, initial TS = {}, rtpSeq = {}", self.rtp_timestamp, self.rtp_seq);
            } else {
                self.rtp_timestamp = self
                    .rtp_timestamp
                    .wrapping_add(RTP_GENERIC_CLOCK_RATE / AUDIO_SAMPLES_LENGTH as u32);
            }

            let header = RtpHeader {
                marker: false,
                payload_type: RTP_G711_PAYLOAD_TYPE,
                sequence: self.rtp_seq,
                timestamp: self.rtp_timestamp,
                ssrc: self.peer_id,
            };
            out = vec![0u8; RTP_HEADER_LENGTH_BYTES];
            header.encode(&mut out);
            out.extend_from_slice(&pcm);
            if self.cfg.udp_metadata {
                out.extend_from_slice(&dst_id.to_be_bytes());
                out.extend_from_slice(&src_id.to_be_bytes());
            }

            self.rtp_seq = self.rtp_seq.wrapping_add(1);
            if self.rtp_seq == RTP_END_OF_CALL_SEQ {
                self.rtp_seq = 0;
            }
        } else if self.cfg.udp_usrp {
            self.usrp_seq = self.usrp_seq.wrapping_add(1);
            out = vec![0u8; USRP_HEADER_LENGTH];
            out[..4].copy_from_slice(b"USRP");
            out[4..8].copy_from_slice(&self.usrp_seq.to_be_bytes());
            out[15] = 1;
            out.extend_from_slice(&pcm);
        } else {
            out = Vec::with_capacity(4 + pcm.len() + 8);
            out.extend_from_slice(&(pcm.len() as u32).to_be_bytes());
            out.extend_from_slice(&pcm);
            if self.cfg.udp_metadata {
                out.extend_from_slice(&dst_id.to_be_bytes());
                out.extend_from_slice(&src_id.to_be_bytes());
            }
        }

        self.socket.send_to(&out, self.send_addr)?;
        Ok(())
    }

    /// Send a USRP end-of-transmission record and rewind the sequence.
    pub fn send_eot(&mut self) -> Result<()> {
        let mut hdr = [0u8; USRP_HEADER_LENGTH];
        hdr[..4].copy_from_slice(b"USRP");
        self.usrp_seq = 0;
        self.socket.send_to(&hdr, self.send_addr)?;
        Ok(())
    }

    /// Reset the per-call stream counters.
    pub fn reset(&mut self) {
        self.rtp_seq = 0;
        self.rtp_timestamp = INVALID_TS;
    }
}
