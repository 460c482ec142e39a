//! Foreground entry point for the bridge.
//!
//! Usage: `p25bridge <config.json> [-v...] [--local ADDR:PORT] [--remote ADDR:PORT]`
//!
//! The network side speaks raw bridge frames over UDP; point two of
//! these at each other (or at a frame injector) and they will pass
//! voice. A real IMBE vocoder is not bundled; without one the bridge
//! runs with the stand-in codec, which moves audio but does not sound
//! like anything.
use anyhow::{Context, Result, bail};

use p25bridge::bridge::{Bridge, NullPtt};
use p25bridge::config::Config;
use p25bridge::net::UdpPeer;
use p25bridge::vocoder::NullVocoder;

fn main() -> Result<()> {
    let mut config_path = None;
    let mut local = "0.0.0.0:33100".to_string();
    let mut remote = "127.0.0.1:33101".to_string();
    let mut verbosity = 2usize;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--local" => local = args.next().context("--local needs an address")?,
            "--remote" => remote = args.next().context("--remote needs an address")?,
            "-v" => verbosity += 1,
            "-vv" => verbosity += 2,
            "-h" | "--help" => {
                eprintln!(
                    "usage: p25bridge <config.json> [-v] [--local ADDR:PORT] [--remote ADDR:PORT]"
                );
                return Ok(());
            }
            other if config_path.is_none() => config_path = Some(other.to_string()),
            other => bail!("unexpected argument: {other}"),
        }
    }
    let Some(config_path) = config_path else {
        bail!("missing configuration file; see --help");
    };

    stderrlog::new()
        .module(module_path!())
        .module("p25bridge")
        .verbosity(verbosity)
        .init()?;

    let cfg = Config::from_file(&config_path)?;

    let peer = UdpPeer::new(
        cfg.peer_id,
        local.parse().context("bad --local address")?,
        remote.parse().context("bad --remote address")?,
    )?;

    #[allow(unused_mut)]
    let mut bridge = Bridge::new(
        cfg.clone(),
        Box::new(peer),
        Box::new(NullVocoder),
        Box::new(NullVocoder),
        Box::new(NullPtt),
    )?;

    #[cfg(feature = "audio")]
    if cfg.local_audio {
        bridge.attach_audio_device()?;
    }
    #[cfg(not(feature = "audio"))]
    if cfg.local_audio {
        log::warn!("built without the audio feature; local audio device disabled");
    }

    let cancel = bridge.cancel_token();
    ctrlc::set_handler(move || {
        cancel.cancel();
    })
    .expect("failed to set Ctrl-C handler");

    bridge.run()?;
    Ok(())
}
