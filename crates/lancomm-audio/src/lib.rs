//! Audio plumbing for the lancomm fabric: the 20 ms PCM frame type,
//! per-sender jitter queues, mix / mix-minus math, and cpal-backed
//! blocking frame devices.

pub mod capture;
pub mod device;
pub mod frame;
pub mod jitter;
pub mod mixer;
pub mod playback;

pub use frame::Frame;
pub use jitter::JitterQueue;
