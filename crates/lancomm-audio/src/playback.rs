//! Headset / 4-wire output.
//!
//! Counterpart to the capture path: the playback device is opened at the
//! fixed 48 kHz wire rate (or not at all), and the cpal callback drains
//! an SPSC ring that [`CpalFrameSink`] fills one 960-sample frame at a
//! time. When the ring runs dry the callback emits silence; the fabric
//! already substitutes silence at frame granularity upstream, so an
//! underrun here is just more of the same.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use tracing::{error, info};

use lancomm_protocol::types::{FRAME_SAMPLES, SAMPLE_RATE};

use crate::device::{self, FrameSink};
use crate::frame::Frame;

/// Frames of headroom between the frame writer and the device callback.
const RING_FRAMES: usize = 12;

/// A device that consumes nothing for this long is treated as failed.
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Keeps the cpal stream alive; dropping it stops playback. Not `Send`:
/// it stays on the thread that opened it.
pub struct PlaybackStream {
    #[allow(dead_code)] // held to keep the stream alive
    stream: cpal::Stream,
}

/// Open the playback device at the wire rate and start draining the
/// ring. Returns the stream handle and the ring producer.
pub fn start_playback(device_index: Option<usize>) -> Result<(PlaybackStream, HeapProd<f32>)> {
    let device = device::get_output_device(device_index)?;
    let supported = device
        .default_output_config()
        .context("output device has no usable config")?;
    let channels = supported.channels() as usize;
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let (producer, mut consumer) = HeapRb::<f32>::new(FRAME_SAMPLES * RING_FRAMES).split();

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // Fan the mono feed out to every hardware channel;
                // silence when the ring is empty.
                for group in data.chunks_mut(channels.max(1)) {
                    let sample = consumer.try_pop().unwrap_or(0.0);
                    group.fill(sample);
                }
            },
            log_stream_error,
            None,
        ),
        other => anyhow::bail!("unsupported playback sample format {other:?}"),
    }
    .with_context(|| {
        format!("playback device cannot run at {SAMPLE_RATE} Hz")
    })?;
    stream.play()?;

    info!(
        device = device.name().unwrap_or_default(),
        channels,
        rate = SAMPLE_RATE,
        "playback running"
    );
    Ok((PlaybackStream { stream }, producer))
}

fn log_stream_error(err: cpal::StreamError) {
    error!("playback stream error: {err}");
}

/// Blocking 960-sample frame writer over a playback ring.
pub struct CpalFrameSink {
    _stream: PlaybackStream,
    producer: HeapProd<f32>,
}

/// Open the output device at `device_index` as a blocking frame sink.
pub fn open_frame_sink(device_index: Option<usize>) -> Result<CpalFrameSink> {
    let (stream, producer) = start_playback(device_index)?;
    Ok(CpalFrameSink { _stream: stream, producer })
}

impl FrameSink for CpalFrameSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let samples: Vec<f32> = frame
            .as_slice()
            .iter()
            .map(|&s| s as f32 / i16::MAX as f32)
            .collect();
        let started = Instant::now();
        let mut written = 0;
        while written < FRAME_SAMPLES {
            let n = self.producer.push_slice(&samples[written..]);
            if n == 0 {
                if started.elapsed() > STALL_TIMEOUT {
                    anyhow::bail!("playback device stalled");
                }
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            written += n;
        }
        Ok(())
    }
}
