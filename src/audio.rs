/*! Local sound device hosting.

The device runs full duplex at 8 kHz mono. Its callbacks are kept to
"copy into ring, copy out of ring" under the audio mutex; everything
else happens on the workers.

cpal streams are not `Send`, so a dedicated thread owns them for the
life of the device (the same trick the audio sink in every cpal app
ends up using). The main loop polls [`AudioDevice::healthy`] and asks
for a [`AudioDevice::restart`] when a backend error killed the
streams.
*/
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, info};

use crate::bridge::{AudioPath, CancellationToken, Flags, PttControl};
use crate::{AUDIO_SAMPLES_LENGTH, Error, Result, SAMPLE_RATE};

/// The duplex audio device.
pub struct AudioDevice {
    audio: Arc<Mutex<AudioPath>>,
    flags: Arc<Flags>,
    ptt: Arc<PttControl>,
    epoch: Instant,
    cancel: CancellationToken,
    failed: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioDevice {
    /// Open the default input and output devices and start streaming.
    pub(crate) fn start(
        audio: Arc<Mutex<AudioPath>>,
        flags: Arc<Flags>,
        ptt: Arc<PttControl>,
        epoch: Instant,
    ) -> Result<Self> {
        let mut dev = Self {
            audio,
            flags,
            ptt,
            epoch,
            cancel: CancellationToken::new(),
            failed: Arc::new(AtomicBool::new(false)),
            thread: None,
        };
        dev.spawn()?;
        Ok(dev)
    }

    /// Whether the streams are still believed to be running.
    pub fn healthy(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
    }

    /// Tear down and rebuild the streams after a backend failure.
    pub fn restart(&mut self) -> Result<()> {
        info!("restarting audio device");
        self.stop();
        self.failed.store(false, Ordering::Release);
        self.cancel = CancellationToken::new();
        self.spawn()
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }

    fn spawn(&mut self) -> Result<()> {
        let audio = self.audio.clone();
        let flags = self.flags.clone();
        let ptt = self.ptt.clone();
        let epoch = self.epoch;
        let cancel = self.cancel.clone();
        let failed = self.failed.clone();

        // The streams must be built and owned on the hosting thread;
        // report startup success or failure back over a channel.
        let (tx, rx) = mpsc::channel::<Result<()>>();
        let handle = std::thread::Builder::new()
            .name("bridge:audio-device".into())
            .spawn(move || {
                let streams = build_streams(&audio, &flags, &ptt, epoch, &failed);
                match streams {
                    Err(e) => {
                        tx.send(Err(e)).expect("sending device error");
                    }
                    Ok(_streams) => {
                        tx.send(Ok(())).expect("sending device ready");
                        while !cancel.is_canceled() {
                            std::thread::park();
                        }
                    }
                }
            })
            .map_err(|e| Error::Audio(format!("device thread: {e}")))?;

        match rx.recv() {
            Ok(Ok(())) => {
                self.thread = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(e) => Err(Error::Audio(format!("device thread died: {e}"))),
        }
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_streams(
    audio: &Arc<Mutex<AudioPath>>,
    flags: &Arc<Flags>,
    ptt: &Arc<PttControl>,
    epoch: Instant,
    failed: &Arc<AtomicBool>,
) -> Result<(cpal::Stream, cpal::Stream)> {
    let host = cpal::default_host();
    debug!("audio host: {}", host.id().name());

    let input = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no default input device".into()))?;
    let output = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no default output device".into()))?;
    info!(
        "audio devices: in = {}, out = {}",
        input.name().unwrap_or_else(|_| "<unknown>".into()),
        output.name().unwrap_or_else(|_| "<unknown>".into())
    );

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Fixed(AUDIO_SAMPLES_LENGTH as u32),
    };

    let in_stream = {
        let audio = audio.clone();
        let flags = flags.clone();
        let failed = failed.clone();
        input
            .build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if !flags.running.load(Ordering::Acquire) {
                        return;
                    }
                    let mut a = audio.lock().expect("audio lock");
                    a.input.add_data(data);
                },
                move |e| {
                    error!("audio input stream error: {e}");
                    failed.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(|e| Error::Audio(format!("input stream: {e}")))?
    };

    let out_stream = {
        let audio = audio.clone();
        let flags = flags.clone();
        let failed = failed.clone();
        let ptt = ptt.clone();
        output
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    if !flags.running.load(Ordering::Acquire) {
                        data.fill(0);
                        return;
                    }
                    let filled = {
                        let mut a = audio.lock().expect("audio lock");
                        a.output.get(data)
                    };
                    if filled {
                        ptt.assert(epoch.elapsed().as_millis() as u64);
                    } else {
                        data.fill(0);
                    }
                },
                move |e| {
                    error!("audio output stream error: {e}");
                    failed.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(|e| Error::Audio(format!("output stream: {e}")))?
    };

    in_stream
        .play()
        .map_err(|e| Error::Audio(format!("input play: {e}")))?;
    out_stream
        .play()
        .map_err(|e| Error::Audio(format!("output play: {e}")))?;
    Ok((in_stream, out_stream))
}
