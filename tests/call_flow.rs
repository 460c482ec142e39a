//! End-to-end call scenarios: synthetic network streams through the
//! RX engine, microphone audio through the TX engine, and a full
//! encrypted TX-to-RX loop.
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;

use p25bridge::bridge::Flags;
use p25bridge::config::Config;
use p25bridge::crypto::{Keystream, Ldu, next_mi};
use p25bridge::dfsi::{IMBE_OFFSETS, SUPERFRAME_BYTES};
use p25bridge::engine::{Emit, RxEngine, RxEvent, TxEngine};
use p25bridge::lc::{ALGO_AES_256, ALGO_ARC4, ALGO_UNENCRYPT, LinkControl, LowSpeedData};
use p25bridge::net::{
    FRAME_TYPE_HDU_VALID, LoopbackPeer, Peer, build_ldu_frame, build_tdu_frame,
};
use p25bridge::vocoder::NullVocoder;
use p25bridge::{AUDIO_SAMPLES_LENGTH, RAW_IMBE_LENGTH_BYTES};

const TEST_MI: [u8; 9] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0x01];
const AES_KEY_HEX: &str = "000102030405060708090A0B0C0D0E0F101112131415161718191A1B1C1D1E1F";

fn aes_key() -> [u8; 32] {
    std::array::from_fn(|i| i as u8)
}

fn test_imbe(n: usize) -> [u8; RAW_IMBE_LENGTH_BYTES] {
    std::array::from_fn(|i| (n * 13 + i * 7 + 1) as u8)
}

/// Superframe holding the fixed test pattern, position-tagged.
fn pattern_superframe(base: usize) -> [u8; SUPERFRAME_BYTES] {
    let mut sf = [0u8; SUPERFRAME_BYTES];
    for (n, &off) in IMBE_OFFSETS.iter().enumerate() {
        sf[off..off + RAW_IMBE_LENGTH_BYTES].copy_from_slice(&test_imbe(base + n));
    }
    sf
}

fn clear_config() -> Config {
    let mut cfg = Config::default();
    cfg.src_id = 1;
    cfg.dst_id = 10;
    cfg.validate().unwrap();
    cfg
}

fn aes_config() -> Config {
    let mut cfg = clear_config();
    cfg.tek.enable = true;
    cfg.tek.algo = "aes".into();
    cfg.tek.key_id = 0x1234;
    cfg.tek.key = Some(AES_KEY_HEX.into());
    cfg.validate().unwrap();
    cfg
}

fn pcm_of(events: &[RxEvent]) -> Vec<[i16; AUDIO_SAMPLES_LENGTH]> {
    events
        .iter()
        .filter_map(|e| match e {
            RxEvent::Pcm { samples, .. } => Some(*samples),
            _ => None,
        })
        .collect()
}

/// Drive one full clear call through an RX engine and return its PCM.
fn run_clear_rx_call(cfg: Config) -> Result<Vec<[i16; AUDIO_SAMPLES_LENGTH]>> {
    let flags = Arc::new(Flags::new());
    let mut rx = RxEngine::new(cfg, flags.clone(), Box::new(NullVocoder))?;
    let mut peer = LoopbackPeer::new(1);

    let mut lc = LinkControl::group(500, 10);
    lc.alg_id = ALGO_UNENCRYPT;
    let lsd = LowSpeedData::default();

    let mut pcm = Vec::new();
    let ldu1 = build_ldu_frame(
        Ldu::Ldu1,
        &lc,
        &lsd,
        &pattern_superframe(0),
        FRAME_TYPE_HDU_VALID,
        0,
        7001,
    );
    let events = rx.process_frame(&ldu1, &mut peer)?;
    assert!(flags.call_in_progress.load(Ordering::Acquire));
    pcm.extend(pcm_of(&events));

    let ldu2 = build_ldu_frame(Ldu::Ldu2, &lc, &lsd, &pattern_superframe(9), 0, 0, 7001);
    pcm.extend(pcm_of(&rx.process_frame(&ldu2, &mut peer)?));

    let tdu = build_tdu_frame(&lc, &lsd, 0, 7001);
    let events = rx.process_frame(&tdu, &mut peer)?;
    assert!(events.iter().any(|e| matches!(e, RxEvent::CallEnded)));
    assert!(!flags.call_in_progress.load(Ordering::Acquire));
    Ok(pcm)
}

#[test]
fn clear_rx_call_delivers_full_superframes() -> Result<()> {
    let pcm = run_clear_rx_call(clear_config())?;
    // 18 voice frames of 160 samples each.
    assert_eq!(pcm.len(), 18);
    assert!(pcm.iter().any(|f| f.iter().any(|&s| s != 0)));
    Ok(())
}

#[test]
fn aes_rx_call_decodes_to_the_same_audio() -> Result<()> {
    let clear_pcm = run_clear_rx_call(clear_config())?;

    let flags = Arc::new(Flags::new());
    let mut rx = RxEngine::new(aes_config(), flags.clone(), Box::new(NullVocoder))?;
    let mut peer = LoopbackPeer::new(1);

    // Encrypt the same test pattern the way a transmitter would.
    let mut ks = Keystream::new();
    ks.set_tek(ALGO_AES_256, 0x1234, &aes_key())?;
    ks.set_mi(&TEST_MI);
    ks.generate_keystream()?;

    let mut sf1 = [0u8; SUPERFRAME_BYTES];
    let mut sf2 = [0u8; SUPERFRAME_BYTES];
    for (n, &off) in IMBE_OFFSETS.iter().enumerate() {
        let mut imbe = test_imbe(n);
        ks.crypt_imbe(&mut imbe, Ldu::Ldu1, n)?;
        sf1[off..off + RAW_IMBE_LENGTH_BYTES].copy_from_slice(&imbe);

        let mut imbe = test_imbe(9 + n);
        ks.crypt_imbe(&mut imbe, Ldu::Ldu2, n)?;
        sf2[off..off + RAW_IMBE_LENGTH_BYTES].copy_from_slice(&imbe);
    }

    let mut lc = LinkControl::group(500, 10);
    lc.alg_id = ALGO_AES_256;
    lc.k_id = 0x1234;
    lc.mi = TEST_MI;
    let lsd = LowSpeedData::default();

    let mut pcm = Vec::new();
    let ldu1 = build_ldu_frame(Ldu::Ldu1, &lc, &lsd, &sf1, FRAME_TYPE_HDU_VALID, 0, 7002);
    pcm.extend(pcm_of(&rx.process_frame(&ldu1, &mut peer)?));
    assert!(flags.call_in_progress.load(Ordering::Acquire));

    let mut lc2 = lc.clone();
    lc2.mi = next_mi(&TEST_MI);
    let ldu2 = build_ldu_frame(Ldu::Ldu2, &lc2, &lsd, &sf2, 0, 0, 7002);
    pcm.extend(pcm_of(&rx.process_frame(&ldu2, &mut peer)?));

    let tdu = build_tdu_frame(&lc, &lsd, 0, 7002);
    rx.process_frame(&tdu, &mut peer)?;

    // Decryption recovered the exact clear IMBE bits, so the decoded
    // audio is sample-identical to the clear call.
    assert_eq!(pcm, clear_pcm);
    Ok(())
}

#[test]
fn mismatched_hdu_key_is_ignored_up_front() -> Result<()> {
    let flags = Arc::new(Flags::new());
    let mut rx = RxEngine::new(clear_config(), flags.clone(), Box::new(NullVocoder))?;
    let mut peer = LoopbackPeer::new(1);

    let mut lc = LinkControl::group(500, 10);
    lc.alg_id = ALGO_AES_256;
    lc.k_id = 0x4444;
    lc.mi = TEST_MI;
    let ldu1 = build_ldu_frame(
        Ldu::Ldu1,
        &lc,
        &LowSpeedData::default(),
        &pattern_superframe(0),
        FRAME_TYPE_HDU_VALID,
        0,
        7003,
    );
    let events = rx.process_frame(&ldu1, &mut peer)?;
    assert!(pcm_of(&events).is_empty());
    assert!(flags.ignore_call.load(Ordering::Acquire));
    assert!(!flags.call_in_progress.load(Ordering::Acquire));
    Ok(())
}

#[test]
fn wrong_key_mid_call_terminates_and_ignores() -> Result<()> {
    let flags = Arc::new(Flags::new());
    let mut rx = RxEngine::new(clear_config(), flags.clone(), Box::new(NullVocoder))?;
    let mut peer = LoopbackPeer::new(1);

    let lc = LinkControl::group(500, 10);
    let lsd = LowSpeedData::default();

    // Clear call starts normally.
    let ldu1 = build_ldu_frame(
        Ldu::Ldu1,
        &lc,
        &lsd,
        &pattern_superframe(0),
        FRAME_TYPE_HDU_VALID,
        0,
        7004,
    );
    assert_eq!(pcm_of(&rx.process_frame(&ldu1, &mut peer)?).len(), 9);

    // Mid-call the LDU2 announces an unknown ARC4 key.
    let mut bad = lc.clone();
    bad.alg_id = ALGO_ARC4;
    bad.k_id = 0x9999;
    bad.mi = TEST_MI;
    let ldu2 = build_ldu_frame(Ldu::Ldu2, &bad, &lsd, &pattern_superframe(9), 0, 0, 7004);
    let events = rx.process_frame(&ldu2, &mut peer)?;
    assert!(events.iter().any(|e| matches!(e, RxEvent::CallEnded)));
    assert!(pcm_of(&events).is_empty());
    assert!(flags.ignore_call.load(Ordering::Acquire));

    // Later voice on the same stream is ignored.
    let ldu1b = build_ldu_frame(Ldu::Ldu1, &lc, &lsd, &pattern_superframe(0), 0, 0, 7004);
    assert!(pcm_of(&rx.process_frame(&ldu1b, &mut peer)?).is_empty());
    Ok(())
}

fn loud_frame() -> [i16; AUDIO_SAMPLES_LENGTH] {
    // 1 kHz-ish square at peak 6000: plenty for VOX at the default
    // threshold.
    std::array::from_fn(|i| if (i / 4) % 2 == 0 { 6000 } else { -6000 })
}

#[test]
fn vox_tx_call_emits_superframes_then_terminates() -> Result<()> {
    let flags = Arc::new(Flags::new());
    let mut tx = TxEngine::new(clear_config(), flags.clone(), Box::new(NullVocoder))?;
    let mut peer = LoopbackPeer::new(1);

    let mut order = Vec::new();
    // 400 ms of voice.
    for _ in 0..20 {
        let mut frame = loud_frame();
        for emit in tx.process_local_frame(&mut frame)? {
            order.push(send(&mut peer, emit, &flags)?);
        }
    }
    // Silence until the drop timer runs out.
    let mut quiet = [0i16; AUDIO_SAMPLES_LENGTH];
    tx.process_local_frame(&mut quiet)?;
    tx.local_drop.clock(180);
    for emit in tx.process_local_frame(&mut quiet)? {
        order.push(send(&mut peer, emit, &flags)?);
    }

    // LDU1, LDU2, ... then exactly one terminator.
    assert!(order.contains(&'1'));
    assert!(order.contains(&'2'));
    assert_eq!(order.iter().filter(|&&c| c == 'T').count(), 1);
    assert_eq!(order.last(), Some(&'T'));
    let voice: Vec<char> = order.iter().copied().filter(|&c| c != 'T').collect();
    for pair in voice.windows(2) {
        assert_ne!(pair[0], pair[1], "LDU1/LDU2 alternation broken: {order:?}");
    }
    Ok(())
}

/// Write one emit through the peer and label it for sequence checks.
fn send(peer: &mut LoopbackPeer, emit: Emit, flags: &Flags) -> Result<char> {
    Ok(match emit {
        Emit::Ldu1 {
            lc,
            lsd,
            superframe,
            frame_type,
            control,
        } => {
            peer.write_ldu1(&lc, &lsd, &superframe, frame_type, control)?;
            flags
                .tx_stream_id
                .store(peer.stream_id(), Ordering::Release);
            '1'
        }
        Emit::Ldu2 {
            lc,
            lsd,
            superframe,
            control,
        } => {
            peer.write_ldu2(&lc, &lsd, &superframe, control)?;
            '2'
        }
        Emit::Tdu {
            lc,
            lsd,
            control,
            ends_call,
        } => {
            peer.write_tdu(&lc, &lsd, control)?;
            if ends_call {
                peer.reset();
                'T'
            } else {
                'G'
            }
        }
    })
}

#[test]
fn encrypted_tx_loops_back_to_clear_audio() -> Result<()> {
    // A clear transmitter and an encrypted transmitter fed identical
    // audio; both received with matching configs must produce
    // identical PCM, and the encrypted LDU2 must carry the rolled MI.
    let clear_pcm = tx_rx_loop(clear_config(), clear_config())?;
    let aes_pcm = tx_rx_loop(aes_config(), aes_config())?;
    assert_eq!(clear_pcm.len(), 36);
    assert_eq!(clear_pcm, aes_pcm);
    Ok(())
}

fn tx_rx_loop(tx_cfg: Config, rx_cfg: Config) -> Result<Vec<[i16; AUDIO_SAMPLES_LENGTH]>> {
    let tx_flags = Arc::new(Flags::new());
    let mut tx = TxEngine::new(tx_cfg, tx_flags.clone(), Box::new(NullVocoder))?;
    let mut tx_peer = LoopbackPeer::new(1);

    let mut ldu2_mis = Vec::new();
    for _ in 0..36 {
        let mut frame = loud_frame();
        for emit in tx.process_local_frame(&mut frame)? {
            if let Emit::Ldu2 { ref lc, .. } = emit {
                ldu2_mis.push(lc.mi);
            }
            send(&mut tx_peer, emit, &tx_flags)?;
        }
    }
    let mut quiet = [0i16; AUDIO_SAMPLES_LENGTH];
    tx.process_local_frame(&mut quiet)?;
    tx.local_drop.clock(180);
    for emit in tx.process_local_frame(&mut quiet)? {
        send(&mut tx_peer, emit, &tx_flags)?;
    }

    // Two superframes: the second LDU2's MI is the roll of the first.
    assert_eq!(ldu2_mis.len(), 2);
    assert_eq!(ldu2_mis[1], next_mi(&ldu2_mis[0]));

    // Feed everything the transmitter emitted into a receiver.
    let rx_flags = Arc::new(Flags::new());
    let mut rx = RxEngine::new(rx_cfg, rx_flags.clone(), Box::new(NullVocoder))?;
    let mut rx_peer = LoopbackPeer::new(2);
    let mut pcm = Vec::new();
    for frame in tx_peer.egress.iter() {
        let events = rx.process_frame(frame, &mut rx_peer)?;
        pcm.extend(pcm_of(&events));
    }
    Ok(pcm)
}
