//! Session bus packet types and the injected emitter capability.
//!
//! The engine publishes decoded data to a host-owned sink. Within a frame,
//! analog channels arrive in enabled-index order; frame-begin strictly
//! precedes any data and frame-end strictly follows it. `send_end` is the
//! last call of an acquisition.

/// Identifies one scope channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelId {
    /// Analog input, zero-based (`C1` is `Analog(0)`).
    Analog(usize),
    /// Logic-analyzer line, zero-based (`D0`..`D15`).
    Digital(usize),
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelId::Analog(i) => write!(f, "C{}", i + 1),
            ChannelId::Digital(i) => write!(f, "D{i}"),
        }
    }
}

/// Measured quantity of an analog batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Voltage,
}

/// Unit of an analog batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Volt,
}

/// How to interpret the samples of an [`AnalogPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meaning {
    pub quantity: Quantity,
    pub unit: Unit,
    /// Significant decimal digits implied by the vertical sensitivity.
    pub digits: i32,
}

/// A batch of calibrated analog samples for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogPacket {
    pub channel: ChannelId,
    pub samples: Vec<f32>,
    pub meaning: Meaning,
}

/// Bit-packed logic samples for all enabled digital channels.
///
/// Samples are interleaved `[low, high]` words, one pair per sample index:
/// D0..D7 in the low byte, D8..D15 in the high byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicPacket {
    pub data: Vec<u8>,
    /// Bytes per sample; 2 for the 16-line pod.
    pub unit_size: usize,
}

/// Injected session emitter.
///
/// The engine calls these in a strict order per acquisition:
/// `send_frame_begin`, data packets, `send_frame_end` (repeated per frame),
/// then exactly one `send_end`.
pub trait SessionSink {
    fn send_frame_begin(&mut self);
    fn send_frame_end(&mut self);
    fn send_analog(&mut self, packet: AnalogPacket);
    fn send_logic(&mut self, packet: LogicPacket);
    fn send_end(&mut self);
}
