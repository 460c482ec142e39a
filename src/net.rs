/*! Network frame format and the peer boundary.

The trunking network hands the bridge byte-addressed frames with a
fixed header layout; everything the call engine needs is at a known
offset. The [`Peer`] trait is the seam between the engine and the
actual transport: production uses a datagram transport, tests use the
in-memory loopback.
*/
use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};

use log::{debug, warn};

use crate::crypto::Ldu;
use crate::dfsi;
use crate::lc::{LinkControl, LowSpeedData};
use crate::{Error, MI_LENGTH_BYTES, Result};

/// Grant demand control flag.
pub const NET_CTRL_GRANT_DEMAND: u8 = 0x80;
/// Grant denial control flag.
pub const NET_CTRL_GRANT_DENIAL: u8 = 0x40;
/// Switch-over control flag.
pub const NET_CTRL_SWITCH_OVER: u8 = 0x10;
/// Encrypted grant control flag.
pub const NET_CTRL_GRANT_ENCRYPT: u8 = 0x08;
/// Unit-to-unit control flag.
pub const NET_CTRL_U2U: u8 = 0x01;

/// Frame type marker: an HDU accompanies this LDU1.
pub const FRAME_TYPE_HDU_VALID: u8 = 0x01;
/// Frame type marker: plain data unit.
pub const FRAME_TYPE_DATA_UNIT: u8 = 0x00;

/// Minimum frame: the fixed header.
pub const NET_HEADER_BYTES: usize = 24;
/// Full voice frame length including the header-extension block.
pub const NET_VOICE_FRAME_BYTES: usize = 193;

/// Data unit id, the low nibble of header byte 22.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Duid {
    /// Header data unit.
    Hdu,
    /// Terminator.
    Tdu,
    /// Logical link data unit 1.
    Ldu1,
    /// VSELP vendor voice 1.
    Vselp1,
    /// Trunking signalling data unit.
    Tsdu,
    /// VSELP vendor voice 2.
    Vselp2,
    /// Logical link data unit 2.
    Ldu2,
    /// Packet data unit.
    Pdu,
    /// Terminator with link control.
    Tdulc,
}

impl Duid {
    /// Classify a header byte.
    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b & 0x0F {
            0x0 => Duid::Hdu,
            0x3 => Duid::Tdu,
            0x5 => Duid::Ldu1,
            0x6 => Duid::Vselp1,
            0x7 => Duid::Tsdu,
            0x9 => Duid::Vselp2,
            0xA => Duid::Ldu2,
            0xC => Duid::Pdu,
            0xF => Duid::Tdulc,
            n => return Err(Error::Frame(format!("unknown DUID ${n:X}"))),
        })
    }

    /// Wire value.
    pub fn to_byte(self) -> u8 {
        match self {
            Duid::Hdu => 0x0,
            Duid::Tdu => 0x3,
            Duid::Ldu1 => 0x5,
            Duid::Vselp1 => 0x6,
            Duid::Tsdu => 0x7,
            Duid::Vselp2 => 0x9,
            Duid::Ldu2 => 0xA,
            Duid::Pdu => 0xC,
            Duid::Tdulc => 0xF,
        }
    }
}

/// Borrowed view of an ingress network frame.
pub struct NetFrame<'a> {
    buf: &'a [u8],
}

impl<'a> NetFrame<'a> {
    /// Validate the minimum header and wrap the buffer.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < NET_HEADER_BYTES {
            return Err(Error::Frame(format!("short network frame: {}", buf.len())));
        }
        Ok(Self { buf })
    }

    /// Data unit id.
    pub fn duid(&self) -> Result<Duid> {
        Duid::from_byte(self.buf[22])
    }

    /// Link control opcode from the header.
    pub fn lco(&self) -> u8 {
        self.buf[4]
    }

    /// Source id, 24 bits big-endian.
    pub fn src_id(&self) -> u32 {
        u32::from_be_bytes([0, self.buf[5], self.buf[6], self.buf[7]])
    }

    /// Destination id, 24 bits big-endian.
    pub fn dst_id(&self) -> u32 {
        u32::from_be_bytes([0, self.buf[8], self.buf[9], self.buf[10]])
    }

    /// Control byte.
    pub fn control(&self) -> u8 {
        self.buf[14]
    }

    /// Manufacturer id.
    pub fn mfid(&self) -> u8 {
        self.buf[15]
    }

    /// Transport stream tag.
    pub fn stream_id(&self) -> u32 {
        u32::from_be_bytes([self.buf[16], self.buf[17], self.buf[18], self.buf[19]])
    }

    /// Low speed data bytes.
    pub fn lsd(&self) -> LowSpeedData {
        LowSpeedData {
            lsd1: self.buf[20],
            lsd2: self.buf[21],
        }
    }

    /// Declared DFSI payload length.
    pub fn payload_len(&self) -> usize {
        self.buf[23] as usize
    }

    /// DFSI payload bytes, empty when the declared length is bogus.
    pub fn payload(&self) -> &'a [u8] {
        let len = self.payload_len();
        if len <= NET_HEADER_BYTES || self.buf.len() < NET_HEADER_BYTES + len {
            &[]
        } else {
            &self.buf[NET_HEADER_BYTES..NET_HEADER_BYTES + len]
        }
    }

    /// Frame type marker at byte 180, when present.
    pub fn frame_type(&self) -> u8 {
        if self.buf.len() > 180 { self.buf[180] } else { 0 }
    }

    /// Algorithm id, key id and MI from the header extension, present
    /// only on frames long enough to carry them.
    pub fn hdu_info(&self) -> Option<(u8, u16, [u8; MI_LENGTH_BYTES])> {
        if self.buf.len() < 184 + MI_LENGTH_BYTES {
            return None;
        }
        let mut mi = [0u8; MI_LENGTH_BYTES];
        mi.copy_from_slice(&self.buf[184..184 + MI_LENGTH_BYTES]);
        Some((
            self.buf[181],
            u16::from_be_bytes([self.buf[182], self.buf[183]]),
            mi,
        ))
    }
}

fn build_header(lc: &LinkControl, lsd: &LowSpeedData, duid: Duid, control: u8, stream_id: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    buf[4] = lc.lco;
    buf[5..8].copy_from_slice(&lc.src_id.to_be_bytes()[1..]);
    buf[8..11].copy_from_slice(&lc.dst_id.to_be_bytes()[1..]);
    buf[14] = control;
    buf[15] = lc.mfid;
    buf[16..20].copy_from_slice(&stream_id.to_be_bytes());
    buf[20] = lsd.lsd1;
    buf[21] = lsd.lsd2;
    buf[22] = duid.to_byte();
    buf
}

/// Build a voice frame (LDU1 or LDU2) with its DFSI payload and header
/// extension block.
pub fn build_ldu_frame(
    ldu: Ldu,
    lc: &LinkControl,
    lsd: &LowSpeedData,
    superframe: &[u8; dfsi::SUPERFRAME_BYTES],
    frame_type: u8,
    control: u8,
    stream_id: u32,
) -> Vec<u8> {
    let duid = match ldu {
        Ldu::Ldu1 => Duid::Ldu1,
        Ldu::Ldu2 => Duid::Ldu2,
    };
    let mut buf = build_header(lc, lsd, duid, control, stream_id, NET_VOICE_FRAME_BYTES);
    let payload = dfsi::pack_ldu(ldu, lc, lsd, superframe);
    buf[23] = payload.len() as u8;
    buf[NET_HEADER_BYTES..NET_HEADER_BYTES + payload.len()].copy_from_slice(&payload);
    buf[180] = frame_type;
    if frame_type == FRAME_TYPE_HDU_VALID {
        buf[181] = lc.alg_id;
        buf[182..184].copy_from_slice(&lc.k_id.to_be_bytes());
        buf[184..184 + MI_LENGTH_BYTES].copy_from_slice(&lc.mi);
    }
    buf
}

/// Build a terminator frame.
pub fn build_tdu_frame(lc: &LinkControl, lsd: &LowSpeedData, control: u8, stream_id: u32) -> Vec<u8> {
    build_header(lc, lsd, Duid::Tdu, control, stream_id, NET_HEADER_BYTES)
}

/// The trunking network session as the call engine sees it.
pub trait Peer: Send {
    /// Our peer id on the network, used as the RTP SSRC.
    fn peer_id(&self) -> u32;

    /// Id of the stream that currently owns the voice channel, 0 when
    /// idle.
    fn stream_id(&self) -> u32;

    /// Reset voice channel state; the next stream gets a fresh id.
    fn reset(&mut self);

    /// Pull the next queued ingress frame.
    fn read(&mut self) -> Option<Vec<u8>>;

    /// Advance the session's internal clock.
    fn clock(&mut self, _ms: u64) {}

    /// Send an LDU1 with its superframe buffer.
    fn write_ldu1(
        &mut self,
        lc: &LinkControl,
        lsd: &LowSpeedData,
        superframe: &[u8; dfsi::SUPERFRAME_BYTES],
        frame_type: u8,
        control: u8,
    ) -> Result<()>;

    /// Send an LDU2 with its superframe buffer.
    fn write_ldu2(
        &mut self,
        lc: &LinkControl,
        lsd: &LowSpeedData,
        superframe: &[u8; dfsi::SUPERFRAME_BYTES],
        control: u8,
    ) -> Result<()>;

    /// Send a terminator.
    fn write_tdu(&mut self, lc: &LinkControl, lsd: &LowSpeedData, control: u8) -> Result<()>;
}

/// In-memory peer: ingress frames are queued by hand, egress frames
/// accumulate for inspection. This is the test and bench transport.
#[derive(Default)]
pub struct LoopbackPeer {
    peer_id: u32,
    stream: u32,
    next_tx_stream: u32,
    ingress: VecDeque<Vec<u8>>,
    /// Every frame written by the engine, in order.
    pub egress: Vec<Vec<u8>>,
}

impl LoopbackPeer {
    /// New loopback with the given peer id.
    pub fn new(peer_id: u32) -> Self {
        Self {
            peer_id,
            next_tx_stream: 0x4000_0000,
            ..Self::default()
        }
    }

    /// Queue an ingress frame belonging to `stream_id`.
    pub fn push_ingress(&mut self, mut frame: Vec<u8>, stream_id: u32) {
        if frame.len() >= NET_HEADER_BYTES {
            frame[16..20].copy_from_slice(&stream_id.to_be_bytes());
        }
        self.stream = stream_id;
        self.ingress.push_back(frame);
    }

    fn tx_stream(&mut self) -> u32 {
        if self.stream == 0 {
            self.next_tx_stream += 1;
            self.stream = self.next_tx_stream;
        }
        self.stream
    }
}

impl Peer for LoopbackPeer {
    fn peer_id(&self) -> u32 {
        self.peer_id
    }

    fn stream_id(&self) -> u32 {
        self.stream
    }

    fn reset(&mut self) {
        self.stream = 0;
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        self.ingress.pop_front()
    }

    fn write_ldu1(
        &mut self,
        lc: &LinkControl,
        lsd: &LowSpeedData,
        superframe: &[u8; dfsi::SUPERFRAME_BYTES],
        frame_type: u8,
        control: u8,
    ) -> Result<()> {
        let stream = self.tx_stream();
        self.egress.push(build_ldu_frame(
            Ldu::Ldu1, lc, lsd, superframe, frame_type, control, stream,
        ));
        Ok(())
    }

    fn write_ldu2(
        &mut self,
        lc: &LinkControl,
        lsd: &LowSpeedData,
        superframe: &[u8; dfsi::SUPERFRAME_BYTES],
        control: u8,
    ) -> Result<()> {
        let stream = self.tx_stream();
        self.egress.push(build_ldu_frame(
            Ldu::Ldu2,
            lc,
            lsd,
            superframe,
            FRAME_TYPE_DATA_UNIT,
            control,
            stream,
        ));
        Ok(())
    }

    fn write_tdu(&mut self, lc: &LinkControl, lsd: &LowSpeedData, control: u8) -> Result<()> {
        let stream = self.tx_stream();
        self.egress.push(build_tdu_frame(lc, lsd, control, stream));
        Ok(())
    }
}

/// Datagram peer: each UDP datagram carries one network frame
/// verbatim. Good enough to interoperate with another bridge or a
/// frame injector on the far side.
pub struct UdpPeer {
    peer_id: u32,
    socket: UdpSocket,
    remote: SocketAddr,
    stream: u32,
    next_tx_stream: u32,
}

impl UdpPeer {
    /// Bind `local` and exchange frames with `remote`.
    pub fn new(peer_id: u32, local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        debug!("peer socket bound on {}", socket.local_addr()?);
        Ok(Self {
            peer_id,
            socket,
            remote,
            stream: 0,
            next_tx_stream: peer_id.wrapping_mul(0x9E3779B9) | 1,
        })
    }

    fn send(&self, frame: &[u8]) -> Result<()> {
        self.socket.send_to(frame, self.remote)?;
        Ok(())
    }

    fn tx_stream(&mut self) -> u32 {
        if self.stream == 0 {
            self.next_tx_stream = self.next_tx_stream.wrapping_add(1);
            self.stream = self.next_tx_stream;
        }
        self.stream
    }
}

impl Peer for UdpPeer {
    fn peer_id(&self) -> u32 {
        self.peer_id
    }

    fn stream_id(&self) -> u32 {
        self.stream
    }

    fn reset(&mut self) {
        self.stream = 0;
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        let mut buf = [0u8; 2048];
        match self.socket.recv_from(&mut buf) {
            Ok((n, _)) if n >= NET_HEADER_BYTES => {
                let frame = buf[..n].to_vec();
                // The transport tags each frame with its stream.
                self.stream = u32::from_be_bytes([frame[16], frame[17], frame[18], frame[19]]);
                Some(frame)
            }
            Ok((n, from)) => {
                warn!("runt frame from {from}: {n} bytes");
                None
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("peer socket read failed: {e}");
                None
            }
        }
    }

    fn write_ldu1(
        &mut self,
        lc: &LinkControl,
        lsd: &LowSpeedData,
        superframe: &[u8; dfsi::SUPERFRAME_BYTES],
        frame_type: u8,
        control: u8,
    ) -> Result<()> {
        let stream = self.tx_stream();
        self.send(&build_ldu_frame(
            Ldu::Ldu1, lc, lsd, superframe, frame_type, control, stream,
        ))
    }

    fn write_ldu2(
        &mut self,
        lc: &LinkControl,
        lsd: &LowSpeedData,
        superframe: &[u8; dfsi::SUPERFRAME_BYTES],
        control: u8,
    ) -> Result<()> {
        let stream = self.tx_stream();
        self.send(&build_ldu_frame(
            Ldu::Ldu2,
            lc,
            lsd,
            superframe,
            FRAME_TYPE_DATA_UNIT,
            control,
            stream,
        ))
    }

    fn write_tdu(&mut self, lc: &LinkControl, lsd: &LowSpeedData, control: u8) -> Result<()> {
        let stream = self.tx_stream();
        self.send(&build_tdu_frame(lc, lsd, control, stream))
    }
}
