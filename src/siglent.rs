//! Siglent SDS acquisition engine.
//!
//! Drives an SDS-family oscilloscope from idle through arming, trigger or
//! stop waits, per-channel waveform block reads and decoding, and emits
//! calibrated samples on the injected session sink.
//!
//! # Cooperative scheduling
//!
//! The engine owns no threads. A host event loop calls [`AcquisitionEngine::tick`]
//! on I/O readiness or a ~10 ms timer; each call performs bounded work (one
//! wait-predicate poll, one descriptor read, or one payload chunk of at most
//! 10 KiB) and returns. Progress is resumable because all position state
//! lives in the capture record, not on the stack.
//!
//! # Transport quirks
//!
//! USBTMC delivers at most 64-byte packets (52 payload bytes inside a
//! waveform response) and stalls roughly every 60 KiB while the scope
//! refills its output buffer. Stalls surface as [`ReadChunk::Stall`] and are
//! retried on a short back-off; a scope may also acknowledge a fetch with
//! nothing but the two line-feed terminators, which is retried on a longer
//! one before the channel is abandoned.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::DeviceConfig;
use crate::errors::{AcquisitionError, Result, TransportError};
use crate::models::{Model, ScopeFamily, DIGITAL_CHANNELS};
use crate::scpi::{ReadChunk, ScpiCommand, ScpiLink};
use crate::session::{AnalogPacket, ChannelId, LogicPacket, Meaning, Quantity, SessionSink, Unit};

// ============================================================================
// Constants
// ============================================================================

/// Fixed on-wire header length of a waveform response: 15-byte preamble,
/// 346-byte WAVEDESC, 2 separator line feeds.
const SIGLENT_HEADER_SIZE: usize = 363;

/// Offset of the WAVEDESC block inside a waveform response.
const WAVEDESC_OFFSET: usize = 15;

/// WAVEDESC offset of the descriptor block length (u32 LE).
const DESC_LENGTH_OFFSET: usize = 36;

/// WAVEDESC offset of the sample data length (u32 LE).
const DATA_LENGTH_OFFSET: usize = 60;

/// Length of the `FPAR?` frame-parameter block.
const FPAR_BLOCK_SIZE: usize = 200;

/// Offset of the total frame count inside the `FPAR?` block (u32 LE).
const FPAR_FRAMES_OFFSET: usize = 40;

/// Payload budget handled in a single poll callback.
const MAX_BLOCK_READ: usize = 10 * 1024;

/// Upper bound on one wait predicate.
const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause between wait-predicate polls.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Retry budget shared by the stall and empty-waveform envelopes.
const MAX_RETRIES: u32 = 5;

/// Back-off after a transport refill stall.
const STALL_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Back-off after an empty waveform response.
const EMPTY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bytes per emitted logic sample (D0..D7 low, D8..D15 high).
const LOGIC_UNIT_SIZE: usize = 2;

/// `:FRAM` argument large enough to push the history cursor to the last frame.
const HISTORY_FRAME_MAX: u64 = 10_000_000;

// `INR?` state codes.
const DEVICE_STATE_TRIG_RDY: i64 = 8192;
const DEVICE_STATE_DATA_TRIG_RDY: i64 = 8193;

// ============================================================================
// Data Types
// ============================================================================

/// Which capture buffer an acquisition reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSource {
    /// Arm the scope and read the live screen capture.
    #[default]
    Screen,
    /// Replay frames recorded in the scope's history buffer.
    History,
    /// Read whatever the scope currently holds, without arming.
    ReadOnly,
}

/// What the state machine is waiting on before it can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitEvent {
    /// Ready to read; payload streaming is in progress.
    None,
    /// Waiting for the trigger bit in `INR?`.
    Trigger,
    /// Waiting to issue the next channel fetch.
    Block,
    /// Waiting for the scope to report stopped.
    Stop,
}

/// Outcome of one poll callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    /// More work pending; invoke `tick` again on I/O readiness or a timer.
    NeedIo,
    /// The acquisition has finished and the engine is idle.
    Done,
}

/// Header-read outcome.
enum Header {
    /// The response held only the two line-feed terminators.
    Empty,
    /// Parsed descriptor; the block carries this many sample bytes.
    Data(usize),
}

/// Payload-read outcome for one tick.
enum Payload {
    /// Block incomplete; re-enter on the next tick.
    Progress,
    /// First read returned only the terminator pair.
    Empty,
    /// All sample bytes received.
    Complete,
}

/// Mutable state of one running acquisition.
///
/// Created on `start_acquisition`, mutated only by the poll callback,
/// destroyed at stop. The device configuration snapshot inside is read-only
/// for the whole capture.
struct Capture {
    config: DeviceConfig,
    source: DataSource,
    wait_event: WaitEvent,
    /// 0 idle, 1 while a predicate is being polled, 2 once satisfied.
    wait_status: u8,
    num_frames: u64,
    limit_frames: u64,
    /// Expected sample bytes in the current block.
    num_samples: usize,
    /// Sample bytes received so far in the current block.
    num_block_bytes: usize,
    /// Payload reads completed in the current block.
    num_block_read: usize,
    num_header_bytes: usize,
    enabled_channels: Vec<ChannelId>,
    channel_cursor: usize,
    retry_count: u32,
    /// E-series only: leave history mode again when the capture ends.
    close_history: bool,
    in_frame: bool,
    /// Reusable staging area for header and payload bytes.
    buffer: Vec<u8>,
    /// Accumulated logic words for the current frame.
    dig_buffer: Vec<u8>,
}

impl Capture {
    fn new(config: DeviceConfig, limit_frames: u64, source: DataSource, channels: Vec<ChannelId>) -> Self {
        Self {
            config,
            source,
            wait_event: WaitEvent::None,
            wait_status: 0,
            num_frames: 0,
            limit_frames,
            num_samples: 0,
            num_block_bytes: 0,
            num_block_read: 0,
            num_header_bytes: 0,
            enabled_channels: channels,
            channel_cursor: 0,
            retry_count: 0,
            close_history: false,
            in_frame: false,
            buffer: vec![0; MAX_BLOCK_READ],
            dig_buffer: Vec::new(),
        }
    }

    fn current_channel(&self) -> Option<ChannelId> {
        self.enabled_channels.get(self.channel_cursor).copied()
    }

    fn set_wait(&mut self, event: WaitEvent) {
        self.wait_event = event;
        self.wait_status = 0;
    }
}

// ============================================================================
// Acquisition Engine
// ============================================================================

/// Acquisition engine for one SDS oscilloscope.
///
/// Holds the injected SCPI link and session sink for the lifetime of the
/// engine; both are exclusive to the acquisition while it runs.
///
/// # Example
/// ```ignore
/// let model = models::lookup("SDS1204X-E").unwrap();
/// let mut engine = AcquisitionEngine::new(model, Box::new(link), Box::new(sink));
/// engine.start_acquisition(1, DataSource::Screen)?;
/// while engine.tick()? == TickStatus::NeedIo {}
/// ```
pub struct AcquisitionEngine {
    model: &'static Model,
    link: Box<dyn ScpiLink>,
    sink: Box<dyn SessionSink>,
    capture: Option<Capture>,
}

impl AcquisitionEngine {
    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn new(model: &'static Model, link: Box<dyn ScpiLink>, sink: Box<dyn SessionSink>) -> Self {
        Self {
            model,
            link,
            sink,
            capture: None,
        }
    }

    pub fn model(&self) -> &'static Model {
        self.model
    }

    /// Whether an acquisition is currently in progress.
    pub fn is_running(&self) -> bool {
        self.capture.is_some()
    }

    /// Configuration snapshot of the running acquisition, if any.
    pub fn config(&self) -> Option<&DeviceConfig> {
        self.capture.as_ref().map(|c| &c.config)
    }

    /// Refresh the device configuration, arm the scope and open the first frame.
    ///
    /// `limit_frames` of 0 means "as many frames as the history buffer
    /// holds" and is only meaningful for [`DataSource::History`].
    pub fn start_acquisition(&mut self, limit_frames: u64, source: DataSource) -> Result<()> {
        if self.capture.is_some() {
            return Err(AcquisitionError::Protocol(
                "acquisition already running".into(),
            ));
        }

        let config = DeviceConfig::refresh(self.link.as_mut(), self.model)?;

        let mut channels: Vec<ChannelId> = config.enabled_analog().map(ChannelId::Analog).collect();
        if config.la_enabled {
            // One synthetic entry stands in for the bulk digital fetch.
            if let Some(line) = config.first_enabled_digital() {
                channels.push(ChannelId::Digital(line));
            }
        }
        if channels.is_empty() {
            return Err(AcquisitionError::ConfigRead("no enabled channels".into()));
        }
        debug!(
            "starting acquisition: source={source:?}, limit_frames={limit_frames}, channels={channels:?}"
        );

        let mut cap = Capture::new(config, limit_frames, source, channels);
        self.capture_start(&mut cap)?;
        self.sink.send_frame_begin();
        cap.in_frame = true;
        self.capture = Some(cap);
        Ok(())
    }

    /// Stop the acquisition and release its state. Idempotent.
    ///
    /// Emits a frame-end if a frame is open, leaves history mode if this
    /// capture enabled it, and always ends the session stream.
    pub fn stop_acquisition(&mut self) {
        if let Some(mut cap) = self.capture.take() {
            debug!("stopping acquisition after {} frames", cap.num_frames);
            self.teardown(&mut cap);
        }
    }

    /// Advance the acquisition by one bounded step.
    ///
    /// Returns [`TickStatus::NeedIo`] while more data is expected and
    /// [`TickStatus::Done`] once the acquisition has completed (or when the
    /// engine is idle). A fatal error tears the acquisition down before it
    /// is returned.
    pub fn tick(&mut self) -> Result<TickStatus> {
        let mut cap = match self.capture.take() {
            Some(cap) => cap,
            None => return Ok(TickStatus::Done),
        };
        match self.tick_with(&mut cap) {
            Ok(TickStatus::NeedIo) => {
                self.capture = Some(cap);
                Ok(TickStatus::NeedIo)
            }
            Ok(TickStatus::Done) => Ok(TickStatus::Done),
            Err(e) => {
                self.teardown(&mut cap);
                Err(e)
            }
        }
    }

    fn tick_with(&mut self, cap: &mut Capture) -> Result<TickStatus> {
        match cap.wait_event {
            WaitEvent::Trigger => {
                self.wait_for_trigger(cap)?;
                self.channel_start(cap)?;
                Ok(TickStatus::NeedIo)
            }
            WaitEvent::Stop => {
                self.wait_for_stop(cap)?;
                self.channel_start(cap)?;
                Ok(TickStatus::NeedIo)
            }
            WaitEvent::Block => {
                self.channel_start(cap)?;
                Ok(TickStatus::NeedIo)
            }
            WaitEvent::None => match cap.current_channel() {
                Some(ChannelId::Analog(index)) => self.read_analog_tick(cap, index),
                Some(ChannelId::Digital(_)) => self.read_digital_frame(cap),
                None => Err(AcquisitionError::Protocol(
                    "tick with no current channel".into(),
                )),
            },
        }
    }

    fn teardown(&mut self, cap: &mut Capture) {
        debug!(
            "teardown: frames={}, wait_status={}, retries={}",
            cap.num_frames, cap.wait_status, cap.retry_count
        );
        if cap.in_frame {
            self.sink.send_frame_end();
            cap.in_frame = false;
        }
        self.close_history(cap);
        self.sink.send_end();
    }

    // ------------------------------------------------------------------------
    // Arming
    // ------------------------------------------------------------------------

    /// Per-family arming; decides what the first wait is.
    fn capture_start(&mut self, cap: &mut Capture) -> Result<()> {
        debug!(
            "capture start: frame {} of {}",
            cap.num_frames + 1,
            cap.limit_frames
        );
        match self.model.family {
            ScopeFamily::Spo => match cap.source {
                DataSource::Screen => {
                    self.send(ScpiCommand::Arm)?;
                    let state = self.get_int(ScpiCommand::QueryInternalState)?;
                    if state == DEVICE_STATE_TRIG_RDY {
                        cap.set_wait(WaitEvent::Trigger);
                    } else if state == DEVICE_STATE_DATA_TRIG_RDY {
                        debug!("device already holds data, skipping trigger wait");
                        cap.set_wait(WaitEvent::Block);
                    } else {
                        return Err(AcquisitionError::Protocol(format!(
                            "device not ready to arm (INR {state})"
                        )));
                    }
                }
                DataSource::History => {
                    self.send(ScpiCommand::QueryFrameParams)?;
                    let block = self.read_exact_response(FPAR_BLOCK_SIZE)?;
                    let total = u32_le(&block, FPAR_FRAMES_OFFSET)? as u64;
                    if cap.limit_frames == 0 {
                        cap.limit_frames = total;
                    }
                    self.send(ScpiCommand::GotoFrame(cap.num_frames + 1))?;
                    self.channel_start(cap)?;
                    cap.set_wait(WaitEvent::Stop);
                }
                DataSource::ReadOnly => cap.set_wait(WaitEvent::Stop),
            },
            ScopeFamily::Eseries => match cap.source {
                DataSource::Screen => {
                    cap.limit_frames = 1;
                    self.send(ScpiCommand::TriggerModeSingle)?;
                    cap.set_wait(WaitEvent::Stop);
                    cap.close_history = false;
                }
                DataSource::History => {
                    let trmd = self.get_string(ScpiCommand::QueryTriggerMode)?;
                    cap.close_history = trmd.trim() != "STOP";
                    let hsmd = self.get_string(ScpiCommand::QueryHistoryMode)?;
                    if hsmd.trim() == "OFF" {
                        self.send(ScpiCommand::SetHistoryMode(true))?;
                    } else {
                        // Force the cursor past the end to land on the last frame.
                        self.send(ScpiCommand::GotoFrame(HISTORY_FRAME_MAX))?;
                    }
                    let total = self.get_int(ScpiCommand::QueryCurrentFrame)? as u64;
                    cap.limit_frames = total;
                    self.send(ScpiCommand::GotoFrame(1))?;
                    cap.set_wait(WaitEvent::Stop);
                }
                DataSource::ReadOnly => {
                    cap.close_history = false;
                    cap.limit_frames = 1;
                    cap.set_wait(WaitEvent::Stop);
                }
            },
            ScopeFamily::NonSpo => cap.set_wait(WaitEvent::Trigger),
        }
        Ok(())
    }

    /// Issue the fetch for the current channel and reset block counters.
    fn channel_start(&mut self, cap: &mut Capture) -> Result<()> {
        let channel = cap.current_channel().ok_or_else(|| {
            AcquisitionError::Protocol("channel start with exhausted cursor".into())
        })?;
        debug!("channel start: {channel}");
        match channel {
            ChannelId::Analog(index) => self.send(ScpiCommand::FetchAnalogWaveform(index))?,
            ChannelId::Digital(line) => match self.model.family {
                ScopeFamily::NonSpo | ScopeFamily::Spo => {
                    self.send(ScpiCommand::FetchDigitalWaveform(line))?
                }
                // The bulk fetch issues its own per-line commands.
                ScopeFamily::Eseries => {}
            },
        }
        cap.num_header_bytes = 0;
        cap.num_block_bytes = 0;
        cap.num_block_read = 0;
        cap.num_samples = 0;
        cap.set_wait(WaitEvent::None);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Wait predicates
    // ------------------------------------------------------------------------

    fn wait_for_trigger(&mut self, cap: &mut Capture) -> Result<()> {
        cap.wait_status = 1;
        let start = Instant::now();
        loop {
            if start.elapsed() >= WAIT_TIMEOUT {
                return Err(AcquisitionError::Timeout("trigger wait expired".into()));
            }
            let state = self.get_int(ScpiCommand::QueryInternalState)?;
            if state & 1 == 1 {
                break;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
        cap.wait_status = 2;

        // Let the acquisition buffer fill before the fetch; roughly 85% of
        // the sweep for mid-range timebases.
        let timebase = cap.config.timebase;
        if timebase > 0.99e-6 && timebase < 0.51 {
            let settle = timebase * self.model.horizontal_divs as f64 * 1000.0;
            sleep_us(settle as u64);
        }
        Ok(())
    }

    fn wait_for_stop(&mut self, cap: &mut Capture) -> Result<()> {
        cap.wait_status = 1;
        let start = Instant::now();
        loop {
            if start.elapsed() >= WAIT_TIMEOUT {
                return Err(AcquisitionError::Timeout("stop wait expired".into()));
            }
            let stopped = match self.model.family {
                ScopeFamily::Eseries => {
                    self.get_string(ScpiCommand::QueryTriggerMode)?.trim() == "STOP"
                }
                // Older firmware has no reliable stop report; the trigger
                // bit is the best signal available.
                _ => self.get_int(ScpiCommand::QueryInternalState)? & 1 == 1,
            };
            if stopped {
                break;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
        cap.wait_status = 2;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Analog block reader
    // ------------------------------------------------------------------------

    fn read_analog_tick(&mut self, cap: &mut Capture, index: usize) -> Result<TickStatus> {
        if cap.num_samples == 0 {
            self.block_read_begin(cap)?;
            match self.read_header(cap)? {
                Header::Empty => return self.retry_empty(cap),
                Header::Data(len) => cap.num_samples = len,
            }
        }
        match self.read_payload_chunk(cap, index)? {
            Payload::Progress => Ok(TickStatus::NeedIo),
            Payload::Empty => self.retry_empty(cap),
            Payload::Complete => {
                self.finish_block()?;
                self.advance_channel(cap)
            }
        }
    }

    /// Give the scope time to stage its output buffers, then arm the read.
    fn block_read_begin(&mut self, cap: &Capture) -> Result<()> {
        match self.model.family {
            ScopeFamily::NonSpo | ScopeFamily::Spo => {
                // The older models need the wait before the read is armed.
                sleep_us((cap.config.memory_depth_analog as f64 * 2.5) as u64);
                self.link.read_begin().map_err(AcquisitionError::from)?;
            }
            ScopeFamily::Eseries => {
                self.link.read_begin().map_err(AcquisitionError::from)?;
                let sweep = cap.config.timebase * self.model.horizontal_divs as f64;
                sleep_us((sweep * 100_000.0).min(10_000.0) as u64);
            }
        }
        Ok(())
    }

    /// Accumulate and parse the wave descriptor.
    ///
    /// USBTMC yields at most 52 payload bytes per packet, so this loops
    /// until the fixed header length has arrived. Payload accumulation
    /// never starts before the full descriptor has been consumed.
    fn read_header(&mut self, cap: &mut Capture) -> Result<Header> {
        let mut retries = 0u32;
        while cap.num_header_bytes < SIGLENT_HEADER_SIZE {
            let end = SIGLENT_HEADER_SIZE;
            match self
                .link
                .read_data(&mut cap.buffer[cap.num_header_bytes..end])
                .map_err(AcquisitionError::from)?
            {
                ReadChunk::Bytes(2) if cap.num_header_bytes == 0 => {
                    // Two line feeds and nothing else.
                    return Ok(Header::Empty);
                }
                ReadChunk::Bytes(n) => {
                    cap.num_header_bytes += n;
                    retries = 0;
                }
                ReadChunk::End => {
                    return Err(AcquisitionError::MalformedHeader(format!(
                        "response ended after {} header bytes",
                        cap.num_header_bytes
                    )))
                }
                ReadChunk::Stall => {
                    if retries >= MAX_RETRIES {
                        return Err(TransportError::Read("header read stalled".into()).into());
                    }
                    retries += 1;
                    thread::sleep(STALL_RETRY_DELAY);
                }
            }
        }

        let desc = &cap.buffer[WAVEDESC_OFFSET..SIGLENT_HEADER_SIZE];
        let desc_length = u32_le(desc, DESC_LENGTH_OFFSET)? as usize;
        let data_length = u32_le(desc, DATA_LENGTH_OFFSET)? as usize;
        debug!("wave descriptor: desc_length={desc_length}, data_length={data_length}");

        if data_length == 0 {
            let mut probe = [0u8; 3];
            let got = match self.link.read_data(&mut probe) {
                Ok(ReadChunk::Bytes(n)) => n,
                _ => 0,
            };
            if got == 2 {
                return Ok(Header::Empty);
            }
            return Err(AcquisitionError::MalformedHeader(
                "descriptor reports no data".into(),
            ));
        }

        // Descriptors longer than the fixed 346 bytes carry user-text or
        // trigger-time trailers; drain them before payload starts.
        let header_total = desc_length + WAVEDESC_OFFSET + 2;
        let mut scratch = [0u8; 512];
        let mut retries = 0u32;
        while cap.num_header_bytes < header_total {
            let want = (header_total - cap.num_header_bytes).min(scratch.len());
            match self
                .link
                .read_data(&mut scratch[..want])
                .map_err(AcquisitionError::from)?
            {
                ReadChunk::Bytes(n) => {
                    cap.num_header_bytes += n;
                    retries = 0;
                }
                ReadChunk::End => {
                    return Err(AcquisitionError::MalformedHeader(format!(
                        "descriptor trailer ended after {} of {} bytes",
                        cap.num_header_bytes, header_total
                    )))
                }
                ReadChunk::Stall => {
                    if retries >= MAX_RETRIES {
                        return Err(TransportError::Read("header read stalled".into()).into());
                    }
                    retries += 1;
                    thread::sleep(STALL_RETRY_DELAY);
                }
            }
        }

        Ok(Header::Data(data_length))
    }

    /// Stream up to one tick's budget of payload bytes, decode and emit them.
    fn read_payload_chunk(&mut self, cap: &mut Capture, index: usize) -> Result<Payload> {
        let remaining = cap.num_samples - cap.num_block_bytes;
        let budget = MAX_BLOCK_READ.min(remaining);
        let mut got = 0usize;
        while got < budget {
            match self
                .link
                .read_data(&mut cap.buffer[got..budget])
                .map_err(AcquisitionError::from)?
            {
                ReadChunk::Bytes(2) if cap.num_block_read == 0 => {
                    // The scope acknowledged the fetch but sent only the
                    // terminator pair.
                    return Ok(Payload::Empty);
                }
                ReadChunk::Bytes(n) => {
                    got += n;
                    cap.num_block_bytes += n;
                    cap.num_block_read += 1;
                    cap.retry_count = 0;
                }
                ReadChunk::End => {
                    return Err(AcquisitionError::Protocol(format!(
                        "payload ended {} bytes short of {}",
                        cap.num_samples - cap.num_block_bytes,
                        cap.num_samples
                    )))
                }
                ReadChunk::Stall => {
                    if got > 0 {
                        // Emit what arrived; the next tick resumes the block.
                        break;
                    }
                    if cap.retry_count >= MAX_RETRIES {
                        return Err(TransportError::Read("payload read stalled".into()).into());
                    }
                    cap.retry_count += 1;
                    thread::sleep(STALL_RETRY_DELAY);
                    return Ok(Payload::Progress);
                }
            }
        }
        if got > 0 {
            self.emit_analog(cap, index, got);
        }
        if cap.num_block_bytes == cap.num_samples {
            Ok(Payload::Complete)
        } else {
            Ok(Payload::Progress)
        }
    }

    /// Consume the block terminator and verify the response is drained.
    fn finish_block(&mut self) -> Result<()> {
        let mut term = [0u8; 2];
        match self
            .link
            .read_data(&mut term)
            .map_err(AcquisitionError::from)?
        {
            ReadChunk::Bytes(2) => {}
            other => {
                return Err(AcquisitionError::MalformedHeader(format!(
                    "missing block terminator: {other:?}"
                )))
            }
        }
        if !self.link.read_complete() {
            return Err(AcquisitionError::Protocol(
                "response not drained after block terminator".into(),
            ));
        }
        Ok(())
    }

    fn emit_analog(&mut self, cap: &Capture, index: usize, len: usize) {
        let channel = &cap.config.analog[index];
        let samples: Vec<f32> = cap.buffer[..len]
            .iter()
            .map(|&raw| decode_analog(raw, channel.vdiv, channel.vert_offset))
            .collect();
        self.sink.send_analog(AnalogPacket {
            channel: ChannelId::Analog(index),
            samples,
            meaning: Meaning {
                quantity: Quantity::Voltage,
                unit: Unit::Volt,
                digits: vdiv_digits(channel.vdiv),
            },
        });
    }

    /// Re-issue the fetch after an empty response, or abandon the channel.
    fn retry_empty(&mut self, cap: &mut Capture) -> Result<TickStatus> {
        let channel = cap
            .current_channel()
            .ok_or_else(|| AcquisitionError::Protocol("retry with exhausted cursor".into()))?;
        if cap.retry_count < MAX_RETRIES {
            cap.retry_count += 1;
            warn!(
                "empty waveform on {channel}, retry {} of {}",
                cap.retry_count, MAX_RETRIES
            );
            thread::sleep(EMPTY_RETRY_DELAY);
            cap.set_wait(WaitEvent::Block);
            Ok(TickStatus::NeedIo)
        } else {
            warn!("empty waveform on {channel} after {MAX_RETRIES} retries, skipping channel");
            self.advance_channel(cap)
        }
    }

    // ------------------------------------------------------------------------
    // Digital bulk reader
    // ------------------------------------------------------------------------

    /// Fetch every enabled logic line and emit one interleaved logic packet.
    ///
    /// Each line's payload carries one byte per 8 samples, LSB first. Bit
    /// `line % 8` of the low (D0..D7) or high (D8..D15) word of sample `k`
    /// mirrors bit `k & 7` of payload byte `k >> 3`.
    fn read_digital_frame(&mut self, cap: &mut Capture) -> Result<TickStatus> {
        let depth = cap.config.memory_depth_digital as usize;
        let stride = depth.div_ceil(8);
        let mut low = vec![0u8; depth];
        let mut high = vec![0u8; depth];

        for line in 0..DIGITAL_CHANNELS {
            if !cap.config.digital_enabled.get(line).copied().unwrap_or(false) {
                continue;
            }
            self.send(ScpiCommand::FetchDigitalData(line))?;
            self.link.read_begin().map_err(AcquisitionError::from)?;
            let response = self.read_whole_response()?;
            if response.len() < WAVEDESC_OFFSET + stride {
                return Err(AcquisitionError::MalformedHeader(format!(
                    "short logic response for D{line}: {} bytes",
                    response.len()
                )));
            }
            let payload = &response[WAVEDESC_OFFSET..WAVEDESC_OFFSET + stride];
            let bank = if line < 8 { &mut low } else { &mut high };
            let bit = 1u8 << (line % 8);
            for k in 0..depth {
                if (payload[k >> 3] >> (k & 7)) & 1 == 1 {
                    bank[k] |= bit;
                }
            }
        }

        cap.dig_buffer.clear();
        cap.dig_buffer.reserve(depth * LOGIC_UNIT_SIZE);
        for k in 0..depth {
            cap.dig_buffer.push(low[k]);
            cap.dig_buffer.push(high[k]);
        }
        self.sink.send_logic(LogicPacket {
            data: cap.dig_buffer.clone(),
            unit_size: LOGIC_UNIT_SIZE,
        });
        self.advance_channel(cap)
    }

    // ------------------------------------------------------------------------
    // Sequencer
    // ------------------------------------------------------------------------

    fn advance_channel(&mut self, cap: &mut Capture) -> Result<TickStatus> {
        cap.channel_cursor += 1;
        cap.retry_count = 0;
        cap.num_samples = 0;
        cap.num_block_bytes = 0;
        cap.num_block_read = 0;
        cap.num_header_bytes = 0;
        if cap.channel_cursor < cap.enabled_channels.len() {
            cap.set_wait(WaitEvent::Block);
            Ok(TickStatus::NeedIo)
        } else {
            self.frame_boundary(cap)
        }
    }

    fn frame_boundary(&mut self, cap: &mut Capture) -> Result<TickStatus> {
        self.sink.send_frame_end();
        cap.in_frame = false;
        cap.num_frames += 1;
        if cap.num_frames >= cap.limit_frames {
            debug!("acquisition complete after {} frames", cap.num_frames);
            self.close_history(cap);
            self.sink.send_end();
            return Ok(TickStatus::Done);
        }
        cap.channel_cursor = 0;
        match self.model.family {
            ScopeFamily::Eseries => {
                self.send(ScpiCommand::GotoFrame(cap.num_frames + 1))?;
                self.sink.send_frame_begin();
                cap.in_frame = true;
                cap.set_wait(WaitEvent::Block);
            }
            _ => {
                self.capture_start(cap)?;
                self.sink.send_frame_begin();
                cap.in_frame = true;
            }
        }
        Ok(TickStatus::NeedIo)
    }

    fn close_history(&mut self, cap: &Capture) {
        if cap.close_history {
            if let Err(e) = self.send(ScpiCommand::SetHistoryMode(false)) {
                warn!("failed to leave history mode: {e}");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Link helpers
    // ------------------------------------------------------------------------

    fn send(&mut self, command: ScpiCommand) -> Result<()> {
        self.link
            .send(&command.to_string())
            .map_err(AcquisitionError::from)
    }

    fn get_int(&mut self, query: ScpiCommand) -> Result<i64> {
        self.link
            .get_int(&query.to_string())
            .map_err(AcquisitionError::from)
    }

    fn get_string(&mut self, query: ScpiCommand) -> Result<String> {
        self.link
            .get_string(&query.to_string())
            .map_err(AcquisitionError::from)
    }

    /// Read an exactly-sized response block (`FPAR?`).
    fn read_exact_response(&mut self, len: usize) -> Result<Vec<u8>> {
        self.link.read_begin().map_err(AcquisitionError::from)?;
        let mut block = vec![0u8; len];
        let mut got = 0usize;
        let mut retries = 0u32;
        while got < len {
            match self
                .link
                .read_data(&mut block[got..])
                .map_err(AcquisitionError::from)?
            {
                ReadChunk::Bytes(n) => {
                    got += n;
                    retries = 0;
                }
                ReadChunk::End => {
                    return Err(AcquisitionError::Protocol(format!(
                        "response truncated at {got} of {len} bytes"
                    )))
                }
                ReadChunk::Stall => {
                    if retries >= MAX_RETRIES {
                        return Err(TransportError::Read("response read stalled".into()).into());
                    }
                    retries += 1;
                    thread::sleep(STALL_RETRY_DELAY);
                }
            }
        }
        Ok(block)
    }

    /// Drain the current response to its end.
    fn read_whole_response(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 512];
        let mut retries = 0u32;
        loop {
            match self
                .link
                .read_data(&mut chunk)
                .map_err(AcquisitionError::from)?
            {
                ReadChunk::Bytes(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    retries = 0;
                }
                ReadChunk::End => break,
                ReadChunk::Stall => {
                    if retries >= MAX_RETRIES {
                        return Err(TransportError::Read("response read stalled".into()).into());
                    }
                    retries += 1;
                    thread::sleep(STALL_RETRY_DELAY);
                }
            }
        }
        Ok(out)
    }
}

// ============================================================================
// Decoding
// ============================================================================

fn sleep_us(us: u64) {
    if us > 0 {
        thread::sleep(Duration::from_micros(us));
    }
}

/// Convert one raw sample byte to volts.
fn decode_analog(raw: u8, vdiv: f64, vert_offset: f64) -> f32 {
    (vdiv * (raw as i8 as f64) / 25.0 - vert_offset) as f32
}

/// Significant decimal digits implied by the vertical sensitivity.
fn vdiv_digits(vdiv: f64) -> i32 {
    let mut digits = (-vdiv.log10()).floor() as i32;
    if vdiv < 1.0 {
        digits += 1;
    }
    digits
}

fn u32_le(buf: &[u8], offset: usize) -> Result<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| AcquisitionError::Protocol("descriptor too short".into()))
}
