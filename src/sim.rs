//! Software model of an SDS oscilloscope.
//!
//! Answers the SCPI subset the engine speaks from configurable panel state,
//! serves waveform responses in USBTMC-sized slices and offers the fault
//! injection the integration tests need: one-shot mid-payload stalls,
//! empty (`LF LF`) waveform responses, and scripted `INR?`/`:TRMD?` reply
//! sequences. The demo binary runs against it too, so a capture can be
//! exercised end to end without hardware.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::debug;

use crate::errors::TransportError;
use crate::models::{Model, DIGITAL_CHANNELS};
use crate::scpi::{ReadChunk, ScpiLink};

/// Payload bytes one simulated USBTMC packet can carry.
const PACKET_PAYLOAD: usize = 52;

/// Fixed preamble length of a waveform response.
const PREAMBLE_SIZE: usize = 15;

/// Fixed WAVEDESC length the simulator emits.
const WAVEDESC_SIZE: usize = 346;

#[derive(Debug, Clone)]
struct SimChannel {
    enabled: bool,
    vdiv: f64,
    offset: f64,
    coupling: String,
    attenuation: f64,
}

impl Default for SimChannel {
    fn default() -> Self {
        Self {
            enabled: false,
            vdiv: 1.0,
            offset: 0.0,
            coupling: "D1M".into(),
            attenuation: 1.0,
        }
    }
}

struct SimState {
    channels: Vec<SimChannel>,
    digital_enabled: [bool; DIGITAL_CHANNELS],
    la_enabled: bool,
    timebase: f64,
    memory_depth: u64,
    memory_depth_digital: u64,
    trse_reply: String,
    slope: String,
    level: f64,

    trigger_mode: String,
    history_mode: bool,
    history_frames: u64,
    history_cursor: u64,
    inr_replies: VecDeque<i64>,
    inr_default: i64,
    trmd_replies: VecDeque<String>,

    /// Per-channel screen payloads (raw signed sample bytes).
    analog_payloads: Vec<Option<Vec<u8>>>,
    /// Per-frame, per-channel payloads for history replay.
    frame_payloads: Vec<Vec<Option<Vec<u8>>>>,
    /// Per-line bit-packed logic payloads.
    digital_payloads: Vec<Option<Vec<u8>>>,

    response: Vec<u8>,
    response_pos: usize,
    /// One-shot: stall once this many bytes of the current response were served.
    stall_after: Option<usize>,
    served: usize,
    /// Answer this many upcoming analog fetches with a bare terminator.
    empty_fetches: u32,

    /// Every command and query the engine sent, in order.
    log: Vec<String>,
}

/// Cloneable handle to a simulated scope; clones share state, so a test can
/// keep one handle while the engine owns another.
#[derive(Clone)]
pub struct SimulatedScope {
    state: Rc<RefCell<SimState>>,
}

impl SimulatedScope {
    pub fn new(model: &'static Model) -> Self {
        let mut channels = vec![SimChannel::default(); model.analog_channels];
        channels[0].enabled = true;
        Self {
            state: Rc::new(RefCell::new(SimState {
                channels,
                digital_enabled: [false; DIGITAL_CHANNELS],
                la_enabled: false,
                timebase: 1.0e-3,
                memory_depth: 1400,
                memory_depth_digital: 0,
                trse_reply: "EDGE,SR,C1,TI,0.00US".into(),
                slope: "POS".into(),
                level: 0.0,
                trigger_mode: "RUN".into(),
                history_mode: false,
                history_frames: 0,
                history_cursor: 0,
                inr_replies: VecDeque::new(),
                // Data acquired and trigger ready; keeps both the arming
                // check and the bit-0 predicates satisfied by default.
                inr_default: 8193,
                trmd_replies: VecDeque::new(),
                analog_payloads: vec![None; model.analog_channels],
                frame_payloads: Vec::new(),
                digital_payloads: vec![None; DIGITAL_CHANNELS],
                response: Vec::new(),
                response_pos: 0,
                stall_after: None,
                served: 0,
                empty_fetches: 0,
                log: Vec::new(),
            })),
        }
    }

    // ------------------------------------------------------------------------
    // Panel setup
    // ------------------------------------------------------------------------

    pub fn set_channel(&self, index: usize, enabled: bool, vdiv: f64, offset: f64) {
        let mut st = self.state.borrow_mut();
        let ch = &mut st.channels[index];
        ch.enabled = enabled;
        ch.vdiv = vdiv;
        ch.offset = offset;
    }

    pub fn set_logic_analyzer(&self, enabled: bool, depth: u64) {
        let mut st = self.state.borrow_mut();
        st.la_enabled = enabled;
        st.memory_depth_digital = depth;
    }

    pub fn set_digital_line(&self, line: usize, enabled: bool) {
        self.state.borrow_mut().digital_enabled[line] = enabled;
    }

    pub fn set_timebase(&self, seconds_per_div: f64) {
        self.state.borrow_mut().timebase = seconds_per_div;
    }

    pub fn set_memory_depth(&self, depth: u64) {
        self.state.borrow_mut().memory_depth = depth;
    }

    /// Seed the history buffer with per-frame, per-channel payloads.
    pub fn set_history(&self, frames: Vec<Vec<Option<Vec<u8>>>>) {
        let mut st = self.state.borrow_mut();
        st.history_frames = frames.len() as u64;
        st.frame_payloads = frames;
    }

    pub fn set_analog_payload(&self, index: usize, payload: Vec<u8>) {
        self.state.borrow_mut().analog_payloads[index] = Some(payload);
    }

    pub fn set_digital_payload(&self, line: usize, payload: Vec<u8>) {
        self.state.borrow_mut().digital_payloads[line] = Some(payload);
    }

    pub fn set_trigger_mode(&self, mode: &str) {
        self.state.borrow_mut().trigger_mode = mode.into();
    }

    pub fn set_history_mode(&self, on: bool) {
        self.state.borrow_mut().history_mode = on;
    }

    pub fn set_trigger_select_reply(&self, reply: &str) {
        self.state.borrow_mut().trse_reply = reply.into();
    }

    // ------------------------------------------------------------------------
    // Scripting and fault injection
    // ------------------------------------------------------------------------

    /// Queue `INR?` replies; once drained, `INR?` answers with `default`.
    pub fn script_inr(&self, replies: &[i64], default: i64) {
        let mut st = self.state.borrow_mut();
        st.inr_replies = replies.iter().copied().collect();
        st.inr_default = default;
    }

    /// Queue `:TRMD?` replies ahead of the live trigger-mode state.
    pub fn script_trmd(&self, replies: &[&str]) {
        self.state.borrow_mut().trmd_replies = replies.iter().map(|s| s.to_string()).collect();
    }

    /// Stall once after `n` bytes of the next response have been served.
    pub fn inject_stall_after(&self, n: usize) {
        self.state.borrow_mut().stall_after = Some(n);
    }

    /// Answer the next `n` analog fetches with a bare `LF LF` terminator.
    pub fn inject_empty_fetches(&self, n: u32) {
        self.state.borrow_mut().empty_fetches = n;
    }

    /// Everything the engine has sent so far, commands and queries alike.
    pub fn sent(&self) -> Vec<String> {
        self.state.borrow().log.clone()
    }

    pub fn clear_sent(&self) {
        self.state.borrow_mut().log.clear();
    }

    // ------------------------------------------------------------------------
    // Response staging
    // ------------------------------------------------------------------------

    fn stage(st: &mut SimState, response: Vec<u8>) {
        st.response = response;
        st.response_pos = 0;
        st.served = 0;
    }

    fn stage_analog(st: &mut SimState, index: usize) {
        if st.empty_fetches > 0 {
            st.empty_fetches -= 1;
            debug!("sim: answering C{} fetch with empty waveform", index + 1);
            Self::stage(st, b"\n\n".to_vec());
            return;
        }
        let payload = Self::analog_payload(st, index);
        let mut out = Vec::with_capacity(PREAMBLE_SIZE + WAVEDESC_SIZE + 4 + payload.len());
        out.extend_from_slice(&preamble(&format!("C{}:WF ALL,#9", index + 1)));
        let mut desc = [0u8; WAVEDESC_SIZE];
        desc[36..40].copy_from_slice(&(WAVEDESC_SIZE as u32).to_le_bytes());
        desc[60..64].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&desc);
        out.extend_from_slice(b"\n\n");
        out.extend_from_slice(&payload);
        out.extend_from_slice(b"\n\n");
        Self::stage(st, out);
    }

    fn analog_payload(st: &SimState, index: usize) -> Vec<u8> {
        if !st.frame_payloads.is_empty() && st.history_cursor >= 1 {
            let frame = &st.frame_payloads[(st.history_cursor - 1) as usize];
            if let Some(Some(p)) = frame.get(index) {
                return p.clone();
            }
        }
        if let Some(p) = &st.analog_payloads[index] {
            return p.clone();
        }
        // Default trace: one full-scale sine period across the capture.
        let depth = st.memory_depth as usize;
        (0..depth)
            .map(|k| {
                let phase = k as f64 / depth.max(1) as f64 * std::f64::consts::TAU;
                (phase.sin() * 100.0) as i8 as u8
            })
            .collect()
    }

    fn stage_digital(st: &mut SimState, line: usize) {
        let stride = (st.memory_depth_digital as usize).div_ceil(8);
        let payload = match &st.digital_payloads[line] {
            Some(p) => p.clone(),
            None => vec![0u8; stride],
        };
        let mut out = Vec::with_capacity(PREAMBLE_SIZE + payload.len() + 2);
        out.extend_from_slice(&preamble(&format!("D{line}:WF DAT2,#9")));
        out.extend_from_slice(&payload);
        out.extend_from_slice(b"\n\n");
        Self::stage(st, out);
    }

    fn stage_frame_params(st: &mut SimState) {
        let mut out = vec![0u8; 200];
        out[40..44].copy_from_slice(&(st.history_frames as u32).to_le_bytes());
        Self::stage(st, out);
    }

    fn answer(st: &mut SimState, query: &str) -> Option<String> {
        if let Some(rest) = query.strip_prefix('C') {
            if let Some((num, suffix)) = rest.split_once(':') {
                let index = num.parse::<usize>().ok()?.checked_sub(1)?;
                let ch = st.channels.get(index)?;
                return match suffix {
                    "TRA?" => Some(on_off(ch.enabled)),
                    "VDIV?" => Some(format!("{:.2E}", ch.vdiv)),
                    "OFST?" => Some(format!("{:.2E}", ch.offset)),
                    "CPL?" => Some(ch.coupling.clone()),
                    "ATTN?" => Some(format!("{}", ch.attenuation)),
                    "TRSL?" => Some(st.slope.clone()),
                    "TRLV?" => Some(format!("{:.2E}", st.level)),
                    _ => None,
                };
            }
        }
        if let Some(rest) = query.strip_prefix('D') {
            if let Some((num, "TRA?")) = rest.split_once(':') {
                let line = num.parse::<usize>().ok()?;
                return Some(on_off(*st.digital_enabled.get(line)?));
            }
        }
        match query {
            "DI:SW?" => Some(on_off(st.la_enabled)),
            "TDIV?" => Some(format!("{:.2E}", st.timebase)),
            "TRSE?" => Some(st.trse_reply.clone()),
            "SANU? C1" => Some(st.memory_depth.to_string()),
            "SANU? D0" => Some(st.memory_depth_digital.to_string()),
            "INR?" => Some(
                st.inr_replies
                    .pop_front()
                    .unwrap_or(st.inr_default)
                    .to_string(),
            ),
            ":TRMD?" => Some(
                st.trmd_replies
                    .pop_front()
                    .unwrap_or_else(|| st.trigger_mode.clone()),
            ),
            ":HSMD?" => Some(on_off(st.history_mode)),
            ":FRAM?" => Some(st.history_cursor.to_string()),
            _ => None,
        }
    }

    fn apply(st: &mut SimState, command: &str) -> bool {
        if let Some(rest) = command.strip_prefix('C') {
            if let Some((num, "WF? ALL")) = rest.split_once(':') {
                if let Some(index) = num.parse::<usize>().ok().and_then(|n| n.checked_sub(1)) {
                    Self::stage_analog(st, index);
                    return true;
                }
            }
        }
        if let Some(rest) = command.strip_prefix('D') {
            if let Some((num, suffix)) = rest.split_once(':') {
                if let Ok(line) = num.parse::<usize>() {
                    match suffix {
                        "WF? DAT2" => {
                            Self::stage_digital(st, line);
                            return true;
                        }
                        // Legacy fetch; the engine follows up with DAT2 reads.
                        "WF?" => return true,
                        _ => {}
                    }
                }
            }
        }
        if let Some(arg) = command.strip_prefix(":FRAM ") {
            if let Ok(n) = arg.parse::<u64>() {
                st.history_cursor = n.min(st.history_frames.max(1));
                return true;
            }
        }
        match command {
            "ARM" => true,
            ":TRMD SINGLE" => {
                // A single capture completes immediately in simulation.
                st.trigger_mode = "STOP".into();
                true
            }
            ":HSMD ON" => {
                st.history_mode = true;
                // Entering history mode parks the cursor on the last frame.
                st.history_cursor = st.history_frames;
                true
            }
            ":HSMD OFF" => {
                st.history_mode = false;
                true
            }
            "FPAR?" => {
                Self::stage_frame_params(st);
                true
            }
            _ => false,
        }
    }
}

impl ScpiLink for SimulatedScope {
    fn send(&mut self, command: &str) -> Result<(), TransportError> {
        let mut st = self.state.borrow_mut();
        st.log.push(command.to_string());
        if Self::apply(&mut st, command) {
            Ok(())
        } else {
            Err(TransportError::Send(format!(
                "unsupported command: {command:?}"
            )))
        }
    }

    fn get_string(&mut self, query: &str) -> Result<String, TransportError> {
        let mut st = self.state.borrow_mut();
        st.log.push(query.to_string());
        Self::answer(&mut st, query).ok_or_else(|| TransportError::Read(format!(
            "unsupported query: {query:?}"
        )))
    }

    fn read_begin(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn read_data(&mut self, buf: &mut [u8]) -> Result<ReadChunk, TransportError> {
        let mut st = self.state.borrow_mut();
        if let Some(after) = st.stall_after {
            if st.served >= after {
                st.stall_after = None;
                return Ok(ReadChunk::Stall);
            }
        }
        let available = st.response.len() - st.response_pos;
        if available == 0 {
            return Ok(ReadChunk::End);
        }
        let n = available.min(buf.len()).min(PACKET_PAYLOAD);
        if n == 0 {
            return Ok(ReadChunk::End);
        }
        buf[..n].copy_from_slice(&st.response[st.response_pos..st.response_pos + n]);
        st.response_pos += n;
        st.served += n;
        Ok(ReadChunk::Bytes(n))
    }

    fn read_complete(&mut self) -> bool {
        let st = self.state.borrow();
        st.response_pos >= st.response.len()
    }
}

fn on_off(flag: bool) -> String {
    if flag { "ON" } else { "OFF" }.to_string()
}

/// Exactly 15 preamble bytes, zero-padded past the literal prefix.
fn preamble(prefix: &str) -> [u8; PREAMBLE_SIZE] {
    let mut out = [b'0'; PREAMBLE_SIZE];
    let src = prefix.as_bytes();
    let n = src.len().min(PREAMBLE_SIZE);
    out[..n].copy_from_slice(&src[..n]);
    out
}
