//! Cached device configuration and the query sequence that builds it.
//!
//! The snapshot is refreshed once when an acquisition starts and is
//! read-only while the capture runs. The query ordering is deterministic so
//! a transcript of the exchange is reproducible.

use log::debug;

use crate::errors::{AcquisitionError, Result};
use crate::models::{Model, ScopeFamily, DIGITAL_CHANNELS};
use crate::scpi::{ScpiCommand, ScpiLink};

/// Vertical settings of one analog input.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogChannel {
    pub enabled: bool,
    /// Volts per division.
    pub vdiv: f64,
    /// Vertical offset in volts.
    pub vert_offset: f64,
    pub coupling: String,
    /// Probe attenuation ratio.
    pub attenuation: f64,
}

/// Trigger setup as reported by `TRSE?` and the per-source queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub source: String,
    pub slope: String,
    /// Trigger level in volts; only read for analog sources.
    pub level: f64,
    /// Horizontal trigger position in seconds.
    pub horiz_position: f64,
}

/// Snapshot of the scope state relevant to one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub analog: Vec<AnalogChannel>,
    /// Per-line enables for D0..D15; empty on models without a pod.
    pub digital_enabled: Vec<bool>,
    /// Logic analyzer master switch.
    pub la_enabled: bool,
    /// Seconds per division.
    pub timebase: f64,
    /// Derived samples per second.
    pub samplerate: f64,
    pub memory_depth_analog: u64,
    pub memory_depth_digital: u64,
    pub trigger: Trigger,
}

impl DeviceConfig {
    /// Query the scope and build a fresh snapshot.
    ///
    /// Fails with [`AcquisitionError::ConfigRead`] on any transport failure
    /// or a trigger-select reply with fewer than 4 comma-tokens.
    pub fn refresh(link: &mut dyn ScpiLink, model: &Model) -> Result<Self> {
        let mut analog = Vec::with_capacity(model.analog_channels);
        for i in 0..model.analog_channels {
            let enabled = link
                .get_bool(&ScpiCommand::QueryAnalogEnabled(i).to_string())
                .map_err(config_err)?;
            analog.push(AnalogChannel {
                enabled,
                vdiv: 1.0,
                vert_offset: 0.0,
                coupling: String::new(),
                attenuation: 1.0,
            });
        }

        let mut la_enabled = false;
        let mut digital_enabled = Vec::new();
        if model.has_digital {
            la_enabled = link
                .get_bool(&ScpiCommand::QueryDigitalMaster.to_string())
                .map_err(config_err)?;
            for i in 0..DIGITAL_CHANNELS {
                let on = link
                    .get_bool(&ScpiCommand::QueryDigitalEnabled(i).to_string())
                    .map_err(config_err)?;
                digital_enabled.push(on);
            }
        }

        let timebase = link
            .get_float(&ScpiCommand::QueryTimebase.to_string())
            .map_err(config_err)?;

        for (i, ch) in analog.iter_mut().enumerate() {
            ch.attenuation = link
                .get_float(&ScpiCommand::QueryAttenuation(i).to_string())
                .map_err(config_err)?;
        }
        for (i, ch) in analog.iter_mut().enumerate() {
            ch.vdiv = link
                .get_float(&ScpiCommand::QueryVdiv(i).to_string())
                .map_err(config_err)?;
            ch.vert_offset = link
                .get_float(&ScpiCommand::QueryOffset(i).to_string())
                .map_err(config_err)?;
        }
        for (i, ch) in analog.iter_mut().enumerate() {
            ch.coupling = link
                .get_string(&ScpiCommand::QueryCoupling(i).to_string())
                .map_err(config_err)?;
        }

        let trse = link
            .get_string(&ScpiCommand::QueryTriggerSelect.to_string())
            .map_err(config_err)?;
        let tokens: Vec<&str> = trse.split(',').map(str::trim).collect();
        if tokens.len() < 4 {
            return Err(AcquisitionError::ConfigRead(format!(
                "short trigger select reply: {trse:?}"
            )));
        }
        let source = tokens[2].to_string();
        let horiz_position = match tokens.get(4) {
            Some(tok) => parse_horizontal_position(tok).ok_or_else(|| {
                AcquisitionError::ConfigRead(format!("bad trigger position token: {tok:?}"))
            })?,
            None => 0.0,
        };

        let slope = link
            .get_string(&ScpiCommand::QueryTriggerSlope(source.clone()).to_string())
            .map_err(config_err)?;
        let level = if source.starts_with('C') {
            link.get_float(&ScpiCommand::QueryTriggerLevel(source.clone()).to_string())
                .map_err(config_err)?
        } else {
            0.0
        };

        let depth_reply = link
            .get_string(&ScpiCommand::QueryAnalogDepth.to_string())
            .map_err(config_err)?;
        let memory_depth_analog = parse_memory_depth(&depth_reply, model.family).ok_or_else(
            || AcquisitionError::ConfigRead(format!("bad memory depth reply: {depth_reply:?}")),
        )?;

        let memory_depth_digital = if la_enabled {
            let reply = link
                .get_string(&ScpiCommand::QueryDigitalDepth.to_string())
                .map_err(config_err)?;
            parse_memory_depth(&reply, model.family).ok_or_else(|| {
                AcquisitionError::ConfigRead(format!("bad digital depth reply: {reply:?}"))
            })?
        } else {
            0
        };

        let samplerate =
            memory_depth_analog as f64 / (timebase * model.horizontal_divs as f64);

        let config = DeviceConfig {
            analog,
            digital_enabled,
            la_enabled,
            timebase,
            samplerate,
            memory_depth_analog,
            memory_depth_digital,
            trigger: Trigger {
                source,
                slope,
                level,
                horiz_position,
            },
        };
        debug!(
            "config refreshed: timebase={}s/div, depth={}, samplerate={}Sa/s, trigger={}",
            config.timebase, config.memory_depth_analog, config.samplerate, config.trigger.source
        );
        Ok(config)
    }

    /// Indexes of enabled analog channels, in index order.
    pub fn enabled_analog(&self) -> impl Iterator<Item = usize> + '_ {
        self.analog
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.enabled)
            .map(|(i, _)| i)
    }

    /// Index of the first enabled logic line, if any.
    pub fn first_enabled_digital(&self) -> Option<usize> {
        self.digital_enabled.iter().position(|&on| on)
    }
}

fn config_err(e: crate::errors::TransportError) -> AcquisitionError {
    AcquisitionError::ConfigRead(e.to_string())
}

/// Decode the horizontal trigger position token of a `TRSE?` reply.
///
/// TODO: confirm the `us`/`ns` scale factors against SDS firmware; they look
/// swapped, but captures decoded with them match the instrument display.
fn parse_horizontal_position(token: &str) -> Option<f64> {
    let t = token.trim().to_ascii_lowercase();
    let (digits, divisor) = if let Some(p) = t.strip_suffix("us") {
        (p, 1e9)
    } else if let Some(p) = t.strip_suffix("ns") {
        (p, 1e6)
    } else if let Some(p) = t.strip_suffix("ms") {
        (p, 1e3)
    } else if let Some(p) = t.strip_suffix('s') {
        (p, 1.0)
    } else {
        (t.as_str(), 1.0)
    };
    digits.trim().parse::<f64>().ok().map(|v| v / divisor)
}

/// Decode a `SANU?` reply into a sample count.
///
/// SPO and non-SPO firmware answer with an `Mpts`/`Kpts` suffix; E-series
/// firmware answers with a bare float. `Kpts` scales by 1e4 to match the
/// counts the instruments actually deliver.
fn parse_memory_depth(reply: &str, family: ScopeFamily) -> Option<u64> {
    let t = reply.trim();
    if family == ScopeFamily::Eseries {
        return t.parse::<f64>().ok().map(|v| v as u64);
    }
    let lower = t.to_ascii_lowercase();
    let (digits, scale) = if let Some(p) = lower.strip_suffix("mpts") {
        (p, 1e6)
    } else if let Some(p) = lower.strip_suffix("kpts") {
        (p, 1e4)
    } else {
        (lower.as_str(), 1.0)
    };
    digits.trim().parse::<f64>().ok().map(|v| (v * scale) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horizontal_position_suffix_scales() {
        assert_eq!(parse_horizontal_position("200us"), Some(200.0 / 1e9));
        assert_eq!(parse_horizontal_position("50NS"), Some(50.0 / 1e6));
        assert_eq!(parse_horizontal_position("1.5ms"), Some(1.5e-3));
        assert_eq!(parse_horizontal_position("2s"), Some(2.0));
        assert_eq!(parse_horizontal_position("0.00"), Some(0.0));
        assert_eq!(parse_horizontal_position("quux"), None);
    }

    #[test]
    fn memory_depth_suffix_scales() {
        assert_eq!(parse_memory_depth("14Mpts", ScopeFamily::Spo), Some(14_000_000));
        assert_eq!(parse_memory_depth("7kpts", ScopeFamily::NonSpo), Some(70_000));
        assert_eq!(parse_memory_depth("1400", ScopeFamily::Spo), Some(1400));
        assert_eq!(
            parse_memory_depth("1.4E+04", ScopeFamily::Eseries),
            Some(14_000)
        );
        assert_eq!(parse_memory_depth("bogus", ScopeFamily::Spo), None);
    }
}
