//! Microphone capture.
//!
//! The fabric's wire format is fixed: 48 kHz mono int16, 960 samples per
//! datagram. The device is opened at that rate outright; if it cannot
//! run there the open fails, since a resampled or pitch-shifted feed
//! would be worse than a fault the operator can see. The cpal callback
//! feeds an SPSC ring that [`CpalFrameSource`] drains one frame at a
//! time, satisfying the blocking 960-sample device contract.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{error, info};

use lancomm_protocol::types::{FRAME_SAMPLES, SAMPLE_RATE};

use crate::device::{self, FrameSource};
use crate::frame::Frame;

/// Frames of headroom between the device callback and the frame reader.
const RING_FRAMES: usize = 12;

/// A device that delivers nothing for this long is treated as failed.
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Keeps the cpal stream alive; dropping it stops capture. Not `Send`:
/// it stays on the thread that opened it.
pub struct CaptureStream {
    #[allow(dead_code)] // held to keep the stream alive
    stream: cpal::Stream,
}

/// Open the capture device at the wire rate and start pumping samples
/// into a ring. Returns the stream handle and the ring consumer.
pub fn start_capture(device_index: Option<usize>) -> Result<(CaptureStream, HeapCons<f32>)> {
    let device = device::get_input_device(device_index)?;
    let supported = device
        .default_input_config()
        .context("input device has no usable config")?;
    let channels = supported.channels() as usize;
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let (mut producer, consumer) = HeapRb::<f32>::new(FRAME_SAMPLES * RING_FRAMES).split();

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                push_first_channel(&mut producer, data, channels, |s| s);
            },
            log_stream_error,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                push_first_channel(&mut producer, data, channels, |s| {
                    s as f32 / i16::MAX as f32
                });
            },
            log_stream_error,
            None,
        ),
        other => anyhow::bail!("unsupported capture sample format {other:?}"),
    }
    .with_context(|| {
        format!("capture device cannot run at {SAMPLE_RATE} Hz")
    })?;
    stream.play()?;

    info!(
        device = device.name().unwrap_or_default(),
        channels,
        rate = SAMPLE_RATE,
        "capture running"
    );
    Ok((CaptureStream { stream }, consumer))
}

fn log_stream_error(err: cpal::StreamError) {
    error!("capture stream error: {err}");
}

/// Downmix by keeping the first channel of each interleaved group. A
/// full ring drops samples; the frame reader reports the stall if the
/// callback stops entirely.
fn push_first_channel<T: Copy>(
    producer: &mut HeapProd<f32>,
    data: &[T],
    channels: usize,
    convert: impl Fn(T) -> f32,
) {
    for group in data.chunks(channels.max(1)) {
        let _ = producer.try_push(convert(group[0]));
    }
}

/// Blocking 960-sample frame reader over a capture ring.
pub struct CpalFrameSource {
    _stream: CaptureStream,
    consumer: HeapCons<f32>,
    scratch: Vec<f32>,
}

/// Open the input device at `device_index` as a blocking frame source.
pub fn open_frame_source(device_index: Option<usize>) -> Result<CpalFrameSource> {
    let (stream, consumer) = start_capture(device_index)?;
    Ok(CpalFrameSource {
        _stream: stream,
        consumer,
        scratch: Vec::with_capacity(FRAME_SAMPLES),
    })
}

impl FrameSource for CpalFrameSource {
    fn read_frame(&mut self) -> Result<Frame> {
        let mut chunk = [0f32; 256];
        let started = Instant::now();
        while self.scratch.len() < FRAME_SAMPLES {
            let want = (FRAME_SAMPLES - self.scratch.len()).min(chunk.len());
            let got = self.consumer.pop_slice(&mut chunk[..want]);
            if got == 0 {
                if started.elapsed() > STALL_TIMEOUT {
                    anyhow::bail!("capture device stalled");
                }
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            self.scratch.extend_from_slice(&chunk[..got]);
        }

        let pcm: Vec<i16> = self
            .scratch
            .drain(..)
            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect();
        Ok(Frame::from_pcm(&pcm))
    }
}
