//! Mix and mix-minus math.
//!
//! Sums are accumulated in i32 (ten full-scale talkers cannot overflow),
//! averaged per the talker count, scaled by the channel gain, saturated,
//! and quantized back to int16.

use lancomm_protocol::types::FRAME_SAMPLES;

use crate::frame::Frame;

/// Per-sample sum over a set of talker frames.
pub fn sum_frames(frames: &[&Frame]) -> Vec<i32> {
    let mut sum = vec![0i32; FRAME_SAMPLES];
    for frame in frames {
        for (acc, &s) in sum.iter_mut().zip(frame.as_slice()) {
            *acc += s as i32;
        }
    }
    sum
}

fn quantize(value: f32) -> i16 {
    value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// The full mix `M = Σ F_t / |T|`; the divide only happens for more than
/// one talker.
pub fn average(sum: &[i32], count: usize) -> Frame {
    let denom = if count > 1 { count as f32 } else { 1.0 };
    let mut pcm = vec![0i16; FRAME_SAMPLES];
    for (dst, &acc) in pcm.iter_mut().zip(sum) {
        *dst = quantize(acc as f32 / denom);
    }
    Frame::from_pcm(&pcm)
}

/// One listener's output: all talkers except the listener, averaged over
/// the remaining source count, scaled by the channel gain, clipped.
///
/// `own` is the listener's popped frame when the listener is itself a
/// talker this tick; `count` is the total talker count behind `sum`.
/// Returns `None` when no sources remain (the sole talker listening to
/// itself); no packet should be sent.
pub fn mix_minus(sum: &[i32], own: Option<&Frame>, count: usize, gain: f32) -> Option<Frame> {
    let remaining = count - usize::from(own.is_some());
    if remaining == 0 {
        return None;
    }
    let denom = if remaining > 1 { remaining as f32 } else { 1.0 };
    let mut pcm = vec![0i16; FRAME_SAMPLES];
    match own {
        Some(own) => {
            for ((dst, &acc), &mine) in pcm.iter_mut().zip(sum).zip(own.as_slice()) {
                *dst = quantize((acc - mine as i32) as f32 / denom * gain);
            }
        }
        None => {
            for (dst, &acc) in pcm.iter_mut().zip(sum) {
                *dst = quantize(acc as f32 / denom * gain);
            }
        }
    }
    Some(Frame::from_pcm(&pcm))
}

/// Sum frames with per-input gains and clip: the beltpack's local mix
/// (per-channel heads at slot volume, plus sidetone).
pub fn mix_scaled(inputs: &[(&Frame, f32)]) -> Frame {
    let mut acc = vec![0f32; FRAME_SAMPLES];
    for (frame, gain) in inputs {
        for (dst, &s) in acc.iter_mut().zip(frame.as_slice()) {
            *dst += s as f32 * gain;
        }
    }
    let pcm: Vec<i16> = acc.into_iter().map(quantize).collect();
    Frame::from_pcm(&pcm)
}
