//! Audio output using cpal.
//!
//! The decode session pushes interleaved f32 samples into a bounded ring
//! consumed by the device callback. The ring is the only permitted
//! blocking point: about half a second deep, so a Stop never waits long
//! and pause/resume keeps its position.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("no output device available")]
    NoDevice,
    #[error("device does not support {rate}Hz/{channels}ch")]
    NoConfig { rate: u32, channels: u16 },
    #[error("stream error: {0}")]
    Stream(String),
}

/// Shared between the decode loop and the device callback.
struct Shared {
    ring: Mutex<VecDeque<f32>>,
    space: Condvar,
    capacity: usize,
    channels: usize,
    playing: AtomicBool,
    /// Frames consumed by the callback since the last position reset.
    played_frames: AtomicU64,
    /// Position base in seconds, adjusted on seek.
    base_secs: AtomicI64,
    failed: AtomicBool,
}

pub struct AudioOutput {
    requested: Option<String>,
    device: Option<Device>,
    stream: Option<Stream>,
    rate: u32,
    channels: u16,
    shared: Option<Arc<Shared>>,
}

impl AudioOutput {
    /// Remember the requested device. Nothing is opened until the first
    /// track negotiates parameters.
    pub fn new(device_name: Option<String>) -> AudioOutput {
        AudioOutput {
            requested: device_name,
            device: None,
            stream: None,
            rate: 0,
            channels: 0,
            shared: None,
        }
    }

    /// Negotiate device parameters for a track. A rate within 5% of the
    /// running stream keeps it; anything else stops the stream, applies
    /// the new parameters, and starts again.
    pub fn configure(&mut self, rate: u32, channels: u16) -> Result<(), OutputError> {
        debug!(rate, channels, "negotiating device");

        if self.stream.is_some() && channels == self.channels {
            let tolerance = self.rate / 20;
            if rate >= self.rate.saturating_sub(tolerance) && rate <= self.rate + tolerance {
                return Ok(());
            }
        }

        if self.device.is_none() {
            self.device = Some(open_device(self.requested.as_deref())?);
        }
        let device = self.device.as_ref().expect("device just opened");

        // Stop the old stream before renegotiating.
        self.stream = None;

        let supported = device
            .supported_output_configs()
            .map_err(|e| OutputError::Stream(e.to_string()))?
            .find(|c| {
                c.channels() == channels
                    && c.min_sample_rate().0 <= rate
                    && c.max_sample_rate().0 >= rate
                    && c.sample_format() == SampleFormat::F32
            })
            .ok_or(OutputError::NoConfig { rate, channels })?;

        let config: StreamConfig = supported.with_sample_rate(cpal::SampleRate(rate)).config();

        // Half a second of buffered audio bounds both memory and the
        // latency of a Stop.
        let shared = Arc::new(Shared {
            ring: Mutex::new(VecDeque::new()),
            space: Condvar::new(),
            capacity: (rate as usize / 2) * channels as usize,
            channels: channels as usize,
            playing: AtomicBool::new(false),
            played_frames: AtomicU64::new(0),
            base_secs: AtomicI64::new(0),
            failed: AtomicBool::new(false),
        });

        let cb = Arc::clone(&shared);
        let err = Arc::clone(&shared);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !cb.playing.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }
                    let mut ring = match cb.ring.lock() {
                        Ok(r) => r,
                        Err(_) => {
                            data.fill(0.0);
                            return;
                        }
                    };
                    let n = data.len().min(ring.len());
                    for slot in data[..n].iter_mut() {
                        *slot = ring.pop_front().unwrap_or(0.0);
                    }
                    data[n..].fill(0.0);
                    drop(ring);
                    cb.played_frames
                        .fetch_add((n / cb.channels) as u64, Ordering::Relaxed);
                    cb.space.notify_one();
                },
                move |e| {
                    error!(error = %e, "audio stream failure");
                    err.failed.store(true, Ordering::SeqCst);
                    err.space.notify_all();
                },
                None,
            )
            .map_err(|e| OutputError::Stream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| OutputError::Stream(e.to_string()))?;

        info!(rate, channels, "audio stream started");
        self.stream = Some(stream);
        self.rate = rate;
        self.channels = channels;
        self.shared = Some(shared);
        Ok(())
    }

    fn shared(&self) -> &Arc<Shared> {
        self.shared.as_ref().expect("output not configured")
    }

    /// Push as many samples as currently fit; returns how many went in.
    pub fn push(&self, samples: &[f32]) -> usize {
        let s = self.shared();
        let Ok(mut ring) = s.ring.lock() else { return 0 };
        let room = s.capacity.saturating_sub(ring.len());
        let n = room.min(samples.len());
        ring.extend(samples[..n].iter().copied());
        n
    }

    /// Wait (bounded) for the callback to free some ring space.
    pub fn wait_space(&self, timeout: Duration) {
        let s = self.shared();
        if let Ok(ring) = s.ring.lock() {
            if ring.len() < s.capacity {
                return;
            }
            let _ = s.space.wait_timeout(ring, timeout);
        }
    }

    /// True once every queued sample has been played out.
    pub fn is_idle(&self) -> bool {
        self.shared().ring.lock().map(|r| r.is_empty()).unwrap_or(true)
    }

    /// Silence without losing buffered audio (pause).
    pub fn set_playing(&self, playing: bool) {
        if let Some(s) = &self.shared {
            s.playing.store(playing, Ordering::Relaxed);
        }
    }

    /// Throw away buffered audio (stop, seek).
    pub fn flush(&self) {
        if let Some(s) = &self.shared {
            if let Ok(mut ring) = s.ring.lock() {
                ring.clear();
            }
            s.space.notify_all();
        }
    }

    /// Played position in whole seconds.
    pub fn position_secs(&self) -> i64 {
        let s = self.shared();
        let played = s.played_frames.load(Ordering::Relaxed);
        s.base_secs.load(Ordering::Relaxed) + (played / self.rate.max(1) as u64) as i64
    }

    /// Rebase the position counter after a seek.
    pub fn set_position(&self, secs: i64) {
        let s = self.shared();
        s.played_frames.store(0, Ordering::Relaxed);
        s.base_secs.store(secs, Ordering::Relaxed);
    }

    /// Zero the position counter for a new track.
    pub fn reset_position(&self) {
        if let Some(s) = &self.shared {
            s.played_frames.store(0, Ordering::Relaxed);
            s.base_secs.store(0, Ordering::Relaxed);
        }
    }

    /// The stream reported a device failure; the session is over.
    pub fn failed(&self) -> bool {
        self.shared
            .as_ref()
            .map(|s| s.failed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// Open the requested device, falling back to the default one.
fn open_device(name: Option<&str>) -> Result<Device, OutputError> {
    let host = cpal::default_host();

    if let Some(name) = name {
        let found = host
            .output_devices()
            .map_err(|e| OutputError::Stream(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name));
        match found {
            Some(dev) => {
                info!(device = name, "using requested audio device");
                return Ok(dev);
            }
            None => warn!(device = name, "requested device not found, using default"),
        }
    }

    let dev = host.default_output_device().ok_or(OutputError::NoDevice)?;
    if let Ok(n) = dev.name() {
        info!(device = %n, "using default audio device");
    }
    Ok(dev)
}
