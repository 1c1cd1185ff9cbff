//! The decode session: one track, start to finish.
//!
//! Drives symphonia over the received descriptor, feeds PCM to the audio
//! output, and polls the daemon link between packets and between partial
//! ring writes so Stop, Pause, Seek, and a replacement track are honored
//! promptly.

use crate::link::{Directive, PlayerLink, Track};
use crate::output::AudioOutput;
use crate::sniff;
use canto_common::error::{Error, Result};
use canto_common::proto::SeekRequest;
use std::io::{Read, Seek, SeekFrom};
use std::sync::OnceLock;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecRegistry, Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use symphonia_adapter_libopus::OpusDecoder;
use tracing::{debug, warn};

/// How one session ended, as reported back to the daemon.
pub enum Outcome {
    /// The track played to its end; a Done event follows.
    Finished,
    /// Interrupted by Stop or a replacement track; the daemon already
    /// knows, no event is sent.
    Stopped,
    /// The track could not be played; an Error event follows.
    Error(String),
}

/// Codec registry with Opus support registered alongside the built-in
/// decoders.
fn codec_registry() -> &'static CodecRegistry {
    static REGISTRY: OnceLock<CodecRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = CodecRegistry::new();
        registry.register_all::<OpusDecoder>();
        registry.register_all::<symphonia::default::codecs::MpaDecoder>();
        registry.register_all::<symphonia::default::codecs::VorbisDecoder>();
        registry.register_all::<symphonia::default::codecs::FlacDecoder>();
        registry
    })
}

/// Play one track. Command handling, device negotiation, and position
/// reporting all happen here; the caller only sends the final event.
pub fn play_track(track: Track, link: &mut PlayerLink, output: &mut AudioOutput) -> Result<Outcome> {
    let mut file = track.file;

    let mut head = [0u8; 512];
    let n = match file.read(&mut head) {
        Ok(n) => n,
        Err(e) => return Ok(Outcome::Error(format!("read failed: {}", e))),
    };
    if n < 8 {
        return Ok(Outcome::Error("read failed".into()));
    }
    if file.seek(SeekFrom::Start(0)).is_err() {
        return Ok(Outcome::Error("seek failed".into()));
    }
    let Some(codec) = sniff::sniff(&head[..n]) else {
        return Ok(Outcome::Error("unknown file type".into()));
    };
    debug!(?codec, path = %track.path.display(), "decoding");

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    hint.with_extension(codec.extension());

    let probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(p) => p,
        Err(e) => return Ok(Outcome::Error(format!("probe failed: {}", e))),
    };
    let format = probed.format;

    let Some(audio_track) = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
    else {
        return Ok(Outcome::Error("no audio track".into()));
    };
    let track_id = audio_track.id;
    let params = audio_track.codec_params.clone();

    let Some(sample_rate) = params.sample_rate else {
        return Ok(Outcome::Error("unknown sample rate".into()));
    };
    let Some(channels) = params.channels.map(|c| c.count() as u16) else {
        return Ok(Outcome::Error("unknown channel count".into()));
    };

    let decoder = match codec_registry().make(&params, &DecoderOptions::default()) {
        Ok(d) => d,
        Err(e) => return Ok(Outcome::Error(format!("unsupported codec: {}", e))),
    };

    if let Err(e) = output.configure(sample_rate, channels) {
        return Ok(Outcome::Error(format!("audio setup failed: {}", e)));
    }
    output.reset_position();
    output.flush();
    output.set_playing(true);

    let duration = params
        .n_frames
        .map(|f| (f / sample_rate as u64) as i64)
        .unwrap_or(0);
    link.send_length(duration)?;
    link.send_position(0)?;

    let outcome = {
        let mut session = Session {
            link: &mut *link,
            output: &mut *output,
            format,
            decoder,
            track_id,
            rate: sample_rate,
            channels,
            duration,
            last_reported: 0,
        };
        session.run()
    };
    output.set_playing(false);
    if let Ok(Outcome::Stopped) | Ok(Outcome::Error(_)) = outcome {
        output.flush();
    }
    outcome
}

enum Flow {
    Continue,
    Stop,
}

struct Session<'a> {
    link: &'a mut PlayerLink,
    output: &'a mut AudioOutput,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    rate: u32,
    channels: u16,
    duration: i64,
    last_reported: i64,
}

impl Session<'_> {
    fn run(&mut self) -> Result<Outcome> {
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            if let Flow::Stop = self.pump_commands()? {
                return Ok(Outcome::Stopped);
            }
            if self.output.failed() {
                return Err(Error::Audio("audio device failed".into()));
            }

            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => {
                    return Ok(Outcome::Error("stream reset required".into()));
                }
                Err(e) => return Ok(Outcome::Error(format!("demux error: {}", e))),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // A corrupt packet is skipped, not fatal.
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!(error = %e, "skipping undecodable packet");
                    continue;
                }
                Err(e) => return Ok(Outcome::Error(format!("decode error: {}", e))),
            };

            // A mid-stream parameter change renegotiates the device.
            let spec = *decoded.spec();
            let chans = spec.channels.count() as u16;
            if spec.rate != self.rate || chans != self.channels {
                debug!(rate = spec.rate, channels = chans, "stream parameters changed");
                if let Err(e) = self.output.configure(spec.rate, chans) {
                    return Ok(Outcome::Error(format!("renegotiation failed: {}", e)));
                }
                self.rate = spec.rate;
                self.channels = chans;
                self.output.set_playing(true);
            }

            let cap = decoded.capacity() as u64;
            if sample_buf
                .as_ref()
                .map(|b| b.capacity() < cap as usize)
                .unwrap_or(true)
            {
                sample_buf = Some(SampleBuffer::new(cap, spec));
            }
            let buf = sample_buf.as_mut().expect("just allocated");
            buf.copy_interleaved_ref(decoded);

            if let Flow::Stop = self.write_all(buf.samples().to_vec())? {
                return Ok(Outcome::Stopped);
            }

            self.report_position()?;
        }

        // End of stream: let the ring play out, still honoring commands.
        loop {
            if self.output.is_idle() {
                break;
            }
            if let Flow::Stop = self.pump_commands()? {
                return Ok(Outcome::Stopped);
            }
            self.report_position()?;
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(Outcome::Finished)
    }

    /// Push samples into the ring, handling commands whenever it is full.
    fn write_all(&mut self, samples: Vec<f32>) -> Result<Flow> {
        let mut off = 0;
        while off < samples.len() {
            off += self.output.push(&samples[off..]);
            if off < samples.len() {
                if let Flow::Stop = self.pump_commands()? {
                    return Ok(Flow::Stop);
                }
                if self.output.failed() {
                    return Err(Error::Audio("audio device failed".into()));
                }
                self.report_position()?;
                self.output.wait_space(Duration::from_millis(50));
            }
        }
        Ok(Flow::Continue)
    }

    /// Drain every queued directive without blocking.
    fn pump_commands(&mut self) -> Result<Flow> {
        loop {
            let Some(directive) = self.link.next(false)? else {
                return Ok(Flow::Continue);
            };
            match directive {
                Directive::Stop | Directive::NewTrack => return Ok(Flow::Stop),
                Directive::Resume => {}
                Directive::Seek(req) => self.apply_seek(req)?,
                Directive::Pause => {
                    self.output.set_playing(false);
                    // Blocked until something ends the pause.
                    loop {
                        match self.link.next(true)? {
                            Some(Directive::Resume) => break,
                            Some(Directive::Seek(req)) => {
                                self.apply_seek(req)?;
                                break;
                            }
                            Some(Directive::Stop) | Some(Directive::NewTrack) => {
                                return Ok(Flow::Stop)
                            }
                            Some(Directive::Pause) | None => {}
                        }
                    }
                    self.output.set_playing(true);
                }
            }
        }
    }

    fn apply_seek(&mut self, req: SeekRequest) -> Result<()> {
        let target = seek_target(req, self.output.position_secs(), self.duration);
        let to = SeekTo::Time {
            time: Time::from(target as u64),
            track_id: Some(self.track_id),
        };
        match self.format.seek(SeekMode::Accurate, to) {
            Ok(_) => {
                self.decoder.reset();
                self.output.flush();
                self.output.set_position(target);
                self.last_reported = target;
                self.link.send_position(target)?;
            }
            Err(e) => warn!(seek_to = target, error = %e, "seek failed"),
        }
        Ok(())
    }

    /// Report the played position whenever the second ticks over.
    fn report_position(&mut self) -> Result<()> {
        let secs = self.output.position_secs();
        if secs != self.last_reported {
            self.last_reported = secs;
            self.link.send_position(secs)?;
        }
        Ok(())
    }
}

/// Resolve a seek request against the current position and duration,
/// clamped at the start of the track.
pub fn seek_target(req: SeekRequest, current: i64, duration: i64) -> i64 {
    let target = if req.percent {
        duration * req.offset / 100
    } else if req.relative {
        current + req.offset
    } else {
        req.offset
    };
    target.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seek(offset: i64, relative: bool, percent: bool) -> SeekRequest {
        SeekRequest {
            offset,
            relative,
            percent,
        }
    }

    #[test]
    fn absolute_seek() {
        assert_eq!(seek_target(seek(42, false, false), 10, 60), 42);
    }

    #[test]
    fn relative_seek_adds_current() {
        assert_eq!(seek_target(seek(20, true, false), 10, 60), 30);
        assert_eq!(seek_target(seek(-5, true, false), 10, 60), 5);
    }

    #[test]
    fn percent_seek_scales_duration() {
        assert_eq!(seek_target(seek(50, false, true), 10, 60), 30);
        assert_eq!(seek_target(seek(100, false, true), 0, 60), 60);
    }

    #[test]
    fn seek_clamps_at_zero() {
        assert_eq!(seek_target(seek(-30, true, false), 10, 60), 0);
        assert_eq!(seek_target(seek(-10, false, false), 0, 60), 0);
    }
}
