//! Talk-button semantics and LED policy.
//!
//! The physical layer (GPIO edges, encoder detents, RGB drivers, the
//! display) is out of scope: it feeds [`HardwareEvent`]s in through a
//! channel and consumes LED updates through the [`LedSink`] trait.

use tracing::debug;

use lancomm_protocol::types::ButtonMode;

/// Events the hardware layer emits.
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(dead_code)] // constructed by the hardware glue
pub enum HardwareEvent {
    /// A talk button edge for slot 0..3.
    Button { slot: u8, pressed: bool },
    /// A rotary encoder detent for a slot's volume, signed.
    Encoder { slot: u8, delta: f32 },
    /// Global LED brightness selection: 25, 50, 75 or 100.
    Brightness(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
    Off,
    Yellow,
    Red,
}

impl LedColor {
    pub fn rgb(self) -> (u8, u8, u8) {
        match self {
            LedColor::Off => (0, 0, 0),
            LedColor::Yellow => (255, 255, 0),
            LedColor::Red => (255, 0, 0),
        }
    }
}

/// Slot LED policy: unassigned → off, assigned → yellow, talking → red.
pub fn led_color(assigned: bool, talking: bool) -> LedColor {
    match (assigned, talking) {
        (false, _) => LedColor::Off,
        (true, false) => LedColor::Yellow,
        (true, true) => LedColor::Red,
    }
}

/// Apply the global brightness scalar to a color.
pub fn scaled_rgb(color: LedColor, brightness_pct: u8) -> (u8, u8, u8) {
    let (r, g, b) = color.rgb();
    let scale = |v: u8| ((v as u16 * brightness_pct.min(100) as u16) / 100) as u8;
    (scale(r), scale(g), scale(b))
}

/// Where LED updates go. Implemented by the hardware glue; the default
/// implementation only logs.
pub trait LedSink: Send {
    fn set_slot(&mut self, slot: u8, rgb: (u8, u8, u8));
    /// Identify-device request from the operator.
    fn flash_all(&mut self);
}

pub struct LogLedSink;

impl LedSink for LogLedSink {
    fn set_slot(&mut self, slot: u8, rgb: (u8, u8, u8)) {
        debug!(slot, r = rgb.0, g = rgb.1, b = rgb.2, "led");
    }

    fn flash_all(&mut self) {
        debug!("flash");
    }
}

/// The talk transition a button edge causes, given the slot's mode and
/// whether its channel is currently keyed. `None` means no change.
pub fn talk_transition(mode: ButtonMode, talking: bool, pressed: bool) -> Option<bool> {
    match mode {
        ButtonMode::Latch => pressed.then_some(!talking),
        ButtonMode::Momentary => {
            if pressed {
                (!talking).then_some(true)
            } else {
                talking.then_some(false)
            }
        }
    }
}
