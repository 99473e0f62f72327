//! SCPI link capability and typed command builders.
//!
//! The driver core never owns a connection. It talks to the scope through the
//! [`ScpiLink`] trait, which a host injects: a USBTMC tunnel in production, a
//! software scope in the tests and the demo binary. The link is responsible
//! for line termination, reply framing and numeric parsing; the core only
//! decides what to ask and how to interpret the payload bytes.
//!
//! Commands are built through [`ScpiCommand`] rather than ad-hoc format
//! strings, so every argument has an explicit typed slot and the literal
//! wire forms live in one place.

use std::fmt;

use crate::errors::TransportError;

// ============================================================================
// Link capability
// ============================================================================

/// Outcome of a single `read_data` call on a response block.
///
/// USBTMC delivers responses in fixed 64-byte packets and periodically
/// stalls mid-stream while the instrument refills its output buffer. A
/// stall surfaces here as [`ReadChunk::Stall`] and must be treated as
/// retryable, not as a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadChunk {
    /// `n` bytes were placed at the start of the caller's buffer.
    Bytes(usize),
    /// The response is exhausted.
    End,
    /// Transient transport stall; retry after a short delay.
    Stall,
}

/// Injected SCPI transport capability.
///
/// `send` writes one line-terminated ASCII command. The `get_*` helpers
/// send a query and parse the reply. `read_begin`/`read_data`/`read_complete`
/// drive a framed binary response such as a waveform block.
pub trait ScpiLink {
    /// Send a line-terminated ASCII command.
    fn send(&mut self, command: &str) -> Result<(), TransportError>;

    /// Send a query and return the trimmed reply string.
    fn get_string(&mut self, query: &str) -> Result<String, TransportError>;

    /// Send a query and parse the reply as an integer.
    fn get_int(&mut self, query: &str) -> Result<i64, TransportError> {
        let reply = self.get_string(query)?;
        reply
            .trim()
            .parse::<i64>()
            .map_err(|_| TransportError::Parse {
                query: query.to_string(),
                reply,
            })
    }

    /// Send a query and parse the reply as a float.
    fn get_float(&mut self, query: &str) -> Result<f64, TransportError> {
        let reply = self.get_string(query)?;
        parse_float_reply(&reply).ok_or_else(|| TransportError::Parse {
            query: query.to_string(),
            reply,
        })
    }

    /// Send a query and parse the reply as a boolean (`ON`/`OFF`/`1`/`0`).
    fn get_bool(&mut self, query: &str) -> Result<bool, TransportError> {
        let reply = self.get_string(query)?;
        match reply.trim() {
            "ON" | "1" => Ok(true),
            "OFF" | "0" => Ok(false),
            _ => Err(TransportError::Parse {
                query: query.to_string(),
                reply,
            }),
        }
    }

    /// Arm the link to receive a response block.
    fn read_begin(&mut self) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes from the current response block.
    fn read_data(&mut self, buf: &mut [u8]) -> Result<ReadChunk, TransportError>;

    /// Whether the current response block has been fully drained.
    fn read_complete(&mut self) -> bool;
}

/// Parse a numeric reply that may carry a trailing unit (`2.00E+01`, `5.00E-01V`).
fn parse_float_reply(reply: &str) -> Option<f64> {
    let s = reply.trim();
    if let Ok(v) = s.parse::<f64>() {
        return Some(v);
    }
    // Strip a trailing unit suffix and retry.
    let end = s
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_ascii_digit() || *c == '.')
        .map(|(i, _)| i + 1)?;
    s[..end].parse::<f64>().ok()
}

// ============================================================================
// Typed command builders
// ============================================================================

/// One SCPI command or query in the subset the driver speaks.
///
/// Analog channels are zero-based here; the wire forms use the scope's
/// one-based `C1..C4` numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpiCommand {
    /// `ARM` — arm a single screen acquisition (SPO).
    Arm,
    /// `:TRMD SINGLE` — single-shot trigger mode (E-series).
    TriggerModeSingle,
    /// `:TRMD?` — current trigger mode.
    QueryTriggerMode,
    /// `:HSMD ON` / `:HSMD OFF` — history mode switch (E-series).
    SetHistoryMode(bool),
    /// `:HSMD?` — history mode state.
    QueryHistoryMode,
    /// `:FRAM <n>` — move the history cursor to frame `n` (one-based).
    GotoFrame(u64),
    /// `:FRAM?` — current history cursor position.
    QueryCurrentFrame,
    /// `FPAR?` — history frame parameter block (SPO).
    QueryFrameParams,
    /// `INR?` — internal state register.
    QueryInternalState,
    /// `TDIV?` — timebase in seconds per division.
    QueryTimebase,
    /// `TRSE?` — trigger select (type, source, hold parameters).
    QueryTriggerSelect,
    /// `<src>:TRSL?` — trigger slope for a source.
    QueryTriggerSlope(String),
    /// `<src>:TRLV?` — trigger level for a source.
    QueryTriggerLevel(String),
    /// `C<n>:TRA?` — analog channel trace on/off.
    QueryAnalogEnabled(usize),
    /// `C<n>:VDIV?` — vertical sensitivity in volts per division.
    QueryVdiv(usize),
    /// `C<n>:OFST?` — vertical offset in volts.
    QueryOffset(usize),
    /// `C<n>:CPL?` — input coupling.
    QueryCoupling(usize),
    /// `C<n>:ATTN?` — probe attenuation ratio.
    QueryAttenuation(usize),
    /// `DI:SW?` — logic analyzer master switch.
    QueryDigitalMaster,
    /// `D<n>:TRA?` — digital channel trace on/off.
    QueryDigitalEnabled(usize),
    /// `SANU? C1` — analog sample count for the current capture.
    QueryAnalogDepth,
    /// `SANU? D0` — digital sample count for the current capture.
    QueryDigitalDepth,
    /// `C<n>:WF? ALL` — fetch one analog channel's waveform block.
    FetchAnalogWaveform(usize),
    /// `D<n>:WF?` — legacy digital fetch (non-SPO and SPO).
    FetchDigitalWaveform(usize),
    /// `D<n>:WF? DAT2` — bulk digital data fetch.
    FetchDigitalData(usize),
}

impl fmt::Display for ScpiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ScpiCommand::*;
        match self {
            Arm => write!(f, "ARM"),
            TriggerModeSingle => write!(f, ":TRMD SINGLE"),
            QueryTriggerMode => write!(f, ":TRMD?"),
            SetHistoryMode(true) => write!(f, ":HSMD ON"),
            SetHistoryMode(false) => write!(f, ":HSMD OFF"),
            QueryHistoryMode => write!(f, ":HSMD?"),
            GotoFrame(n) => write!(f, ":FRAM {n}"),
            QueryCurrentFrame => write!(f, ":FRAM?"),
            QueryFrameParams => write!(f, "FPAR?"),
            QueryInternalState => write!(f, "INR?"),
            QueryTimebase => write!(f, "TDIV?"),
            QueryTriggerSelect => write!(f, "TRSE?"),
            QueryTriggerSlope(src) => write!(f, "{src}:TRSL?"),
            QueryTriggerLevel(src) => write!(f, "{src}:TRLV?"),
            QueryAnalogEnabled(i) => write!(f, "C{}:TRA?", i + 1),
            QueryVdiv(i) => write!(f, "C{}:VDIV?", i + 1),
            QueryOffset(i) => write!(f, "C{}:OFST?", i + 1),
            QueryCoupling(i) => write!(f, "C{}:CPL?", i + 1),
            QueryAttenuation(i) => write!(f, "C{}:ATTN?", i + 1),
            QueryDigitalMaster => write!(f, "DI:SW?"),
            QueryDigitalEnabled(i) => write!(f, "D{i}:TRA?"),
            QueryAnalogDepth => write!(f, "SANU? C1"),
            QueryDigitalDepth => write!(f, "SANU? D0"),
            FetchAnalogWaveform(i) => write!(f, "C{}:WF? ALL", i + 1),
            FetchDigitalWaveform(i) => write!(f, "D{i}:WF?"),
            FetchDigitalData(i) => write!(f, "D{i}:WF? DAT2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_render_literal_wire_forms() {
        assert_eq!(ScpiCommand::Arm.to_string(), "ARM");
        assert_eq!(ScpiCommand::TriggerModeSingle.to_string(), ":TRMD SINGLE");
        assert_eq!(ScpiCommand::SetHistoryMode(true).to_string(), ":HSMD ON");
        assert_eq!(ScpiCommand::SetHistoryMode(false).to_string(), ":HSMD OFF");
        assert_eq!(ScpiCommand::GotoFrame(10_000_000).to_string(), ":FRAM 10000000");
        assert_eq!(ScpiCommand::QueryAnalogEnabled(0).to_string(), "C1:TRA?");
        assert_eq!(ScpiCommand::QueryVdiv(3).to_string(), "C4:VDIV?");
        assert_eq!(ScpiCommand::QueryDigitalEnabled(9).to_string(), "D9:TRA?");
        assert_eq!(ScpiCommand::QueryAnalogDepth.to_string(), "SANU? C1");
        assert_eq!(ScpiCommand::FetchAnalogWaveform(0).to_string(), "C1:WF? ALL");
        assert_eq!(ScpiCommand::FetchDigitalWaveform(5).to_string(), "D5:WF?");
        assert_eq!(ScpiCommand::FetchDigitalData(9).to_string(), "D9:WF? DAT2");
        assert_eq!(
            ScpiCommand::QueryTriggerSlope("C1".into()).to_string(),
            "C1:TRSL?"
        );
    }

    #[test]
    fn float_replies_tolerate_unit_suffixes() {
        assert_eq!(parse_float_reply("2.00E-03"), Some(2.0e-3));
        assert_eq!(parse_float_reply(" 1.0 "), Some(1.0));
        assert_eq!(parse_float_reply("5.00E-01V"), Some(0.5));
        assert_eq!(parse_float_reply("garbage"), None);
    }
}
