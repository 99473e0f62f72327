//! Scope model descriptors.
//!
//! Siglent ships three firmware families with divergent arming and stop
//! semantics; everything the engine branches on lives in the static
//! [`Model`] table here.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Firmware family, controlling arming, stop detection and fetch syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeFamily {
    /// SDS1000CML/DL generation. Arms implicitly; waits on the trigger bit.
    NonSpo,
    /// SDS1000X / SDS2000X generation with explicit `ARM` and `FPAR?` history.
    Spo,
    /// SDS1000X-E / SDS2000X-E generation. `:TRMD SINGLE` arming, `:HSMD` history.
    Eseries,
}

/// One supported oscilloscope model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model {
    /// Model name as reported in the `*IDN?` reply.
    pub name: &'static str,
    pub family: ScopeFamily,
    /// Number of analog input channels.
    pub analog_channels: usize,
    /// Whether a logic-analyzer pod (D0..D15) is supported.
    pub has_digital: bool,
    /// Horizontal graticule divisions; sweep time is `timebase * horizontal_divs`.
    pub horizontal_divs: usize,
}

/// Number of logic channels on models with digital support.
pub const DIGITAL_CHANNELS: usize = 16;

/// All supported models.
pub static MODELS: &[Model] = &[
    Model { name: "SDS1052DL", family: ScopeFamily::NonSpo, analog_channels: 2, has_digital: false, horizontal_divs: 14 },
    Model { name: "SDS1072CML", family: ScopeFamily::NonSpo, analog_channels: 2, has_digital: false, horizontal_divs: 14 },
    Model { name: "SDS1102CML", family: ScopeFamily::NonSpo, analog_channels: 2, has_digital: false, horizontal_divs: 14 },
    Model { name: "SDS1152CML", family: ScopeFamily::NonSpo, analog_channels: 2, has_digital: false, horizontal_divs: 14 },
    Model { name: "SDS1102X", family: ScopeFamily::Spo, analog_channels: 2, has_digital: false, horizontal_divs: 14 },
    Model { name: "SDS1202X", family: ScopeFamily::Spo, analog_channels: 2, has_digital: false, horizontal_divs: 14 },
    Model { name: "SDS2102X", family: ScopeFamily::Spo, analog_channels: 2, has_digital: true, horizontal_divs: 14 },
    Model { name: "SDS2304X", family: ScopeFamily::Spo, analog_channels: 4, has_digital: true, horizontal_divs: 14 },
    Model { name: "SDS1202X-E", family: ScopeFamily::Eseries, analog_channels: 2, has_digital: false, horizontal_divs: 14 },
    Model { name: "SDS1104X-E", family: ScopeFamily::Eseries, analog_channels: 4, has_digital: true, horizontal_divs: 14 },
    Model { name: "SDS1204X-E", family: ScopeFamily::Eseries, analog_channels: 4, has_digital: true, horizontal_divs: 14 },
    Model { name: "SDS2354X-E", family: ScopeFamily::Eseries, analog_channels: 4, has_digital: true, horizontal_divs: 14 },
];

static MODELS_BY_NAME: Lazy<HashMap<String, &'static Model>> = Lazy::new(|| {
    MODELS
        .iter()
        .map(|m| (m.name.to_ascii_uppercase(), m))
        .collect()
});

/// Look up a model by name, case-insensitively.
pub fn lookup(name: &str) -> Option<&'static Model> {
    MODELS_BY_NAME.get(&name.trim().to_ascii_uppercase()).copied()
}

/// Resolve a registry entry from a `*IDN?` reply.
///
/// The reply format is `SIGLENT,<model>,<serial>,<firmware>`.
pub fn identify(idn_reply: &str) -> Option<&'static Model> {
    let mut fields = idn_reply.split(',');
    let vendor = fields.next()?.trim();
    if !vendor.eq_ignore_ascii_case("SIGLENT") {
        return None;
    }
    lookup(fields.next()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let m = lookup("sds1204x-e").expect("model known");
        assert_eq!(m.name, "SDS1204X-E");
        assert_eq!(m.family, ScopeFamily::Eseries);
        assert_eq!(m.analog_channels, 4);
        assert!(m.has_digital);
        assert!(lookup("SDS9999").is_none());
    }

    #[test]
    fn identify_parses_idn_reply() {
        let m = identify("SIGLENT,SDS1104X-E,SDSMMEBD3R1234,8.2.6.1.37R2").unwrap();
        assert_eq!(m.name, "SDS1104X-E");
        assert!(identify("KEYSIGHT,DSOX1204G,X,Y").is_none());
        assert!(identify("nonsense").is_none());
    }
}
