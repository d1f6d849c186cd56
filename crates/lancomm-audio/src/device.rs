use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait};

use crate::frame::Frame;

/// A blocking capture endpoint: each call yields exactly one 960-sample
/// 48 kHz mono frame. The fabric makes no other device assumptions.
/// Implementations are owned by the thread that opened them.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame>;
}

/// A blocking playback endpoint: each call consumes exactly one frame.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
}

/// Information about an audio device, for config UIs and logs.
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    /// Position in the host's enumeration order; what the config file stores.
    pub index: usize,
    pub name: String,
    pub is_default: bool,
}

/// List available audio input (microphone / 4-wire receive) devices.
pub fn list_input_devices() -> Result<Vec<AudioDeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    let mut devices = Vec::new();
    for (index, device) in host.input_devices()?.enumerate() {
        if let Ok(name) = device.name() {
            devices.push(AudioDeviceInfo {
                index,
                is_default: name == default_name,
                name,
            });
        }
    }
    Ok(devices)
}

/// List available audio output (headset / 4-wire send) devices.
pub fn list_output_devices() -> Result<Vec<AudioDeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    let mut devices = Vec::new();
    for (index, device) in host.output_devices()?.enumerate() {
        if let Ok(name) = device.name() {
            devices.push(AudioDeviceInfo {
                index,
                is_default: name == default_name,
                name,
            });
        }
    }
    Ok(devices)
}

/// Find an input device by enumeration index, falling back to default.
pub fn get_input_device(index: Option<usize>) -> Result<cpal::Device> {
    let host = cpal::default_host();

    if let Some(index) = index {
        if let Some(device) = host.input_devices()?.nth(index) {
            return Ok(device);
        }
        anyhow::bail!("no input device at index {index}");
    }

    host.default_input_device()
        .ok_or_else(|| anyhow::anyhow!("no input device available"))
}

/// Find an output device by enumeration index, falling back to default.
pub fn get_output_device(index: Option<usize>) -> Result<cpal::Device> {
    let host = cpal::default_host();

    if let Some(index) = index {
        if let Some(device) = host.output_devices()?.nth(index) {
            return Ok(device);
        }
        anyhow::bail!("no output device at index {index}");
    }

    host.default_output_device()
        .ok_or_else(|| anyhow::anyhow!("no output device available"))
}
