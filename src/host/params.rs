//! Flat parameter layout and host-side registration.
//!
//! Indices are partitioned into three contiguous ranges: the fixed control
//! parameters (index 0 is the instance's logical channel), the engine's
//! control catalogue in name order, and a bank of modulation slots taking
//! three consecutive indices each (source selector, destination selector,
//! amount).

use crate::engine::ControlCatalog;
use crate::{MAX_CHANNELS, MAX_MODULATIONS, MODULATION_RANGE, VALUES_PER_MODULATION};

/// Registered parameter names and unit strings are truncated to this length.
pub const MAX_NAME_CHARACTERS: usize = 15;

/// Index of the channel parameter.
pub const PARAM_CHANNEL: usize = 0;
/// Number of fixed control parameters ahead of the engine catalogue.
pub const FIXED_PARAMS: usize = 1;

/// Substitutions applied to control names before underscore stripping, for
/// names that would collide after truncation.
const ABBREVIATIONS: &[(&str, &str)] = &[("stutter_resample", "stutter_resamp")];

/// First flat index of the modulation range for a given catalogue size.
pub fn modulation_start(num_engine_params: usize) -> usize {
    FIXED_PARAMS + num_engine_params
}

/// Total flat parameter count for a given catalogue size.
pub fn total_params(num_engine_params: usize) -> usize {
    FIXED_PARAMS + num_engine_params + MAX_MODULATIONS * VALUES_PER_MODULATION
}

/// Display name for a registered control: abbreviation table applied,
/// underscores stripped, truncated.
pub fn registered_name(full_name: &str) -> String {
    let mut name = full_name.to_string();
    for (pattern, replacement) in ABBREVIATIONS {
        if let Some(index) = name.find(pattern) {
            name.replace_range(index..index + pattern.len(), replacement);
        }
    }
    name.retain(|c| c != '_');
    name.chars().take(MAX_NAME_CHARACTERS).collect()
}

/// One host-registered parameter definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    pub name: String,
    pub display_units: String,
    pub min: f32,
    pub max: f32,
    pub default_value: f32,
    pub display_scale: f32,
}

/// The full registration table: channel, engine catalogue, modulation bank.
pub fn parameter_definitions(catalog: &ControlCatalog) -> Vec<ParamDef> {
    let mut defs = Vec::with_capacity(total_params(catalog.len()));

    defs.push(ParamDef {
        name: "Channel".into(),
        display_units: String::new(),
        min: 0.0,
        max: MAX_CHANNELS as f32,
        default_value: 0.0,
        display_scale: 1.0,
    });

    for control in catalog.iter() {
        defs.push(ParamDef {
            name: registered_name(&control.name),
            display_units: control.display_units.chars().take(MAX_NAME_CHARACTERS).collect(),
            min: control.min,
            max: control.max,
            default_value: control.default_value,
            display_scale: 1.0,
        });
    }

    for m in 0..MAX_MODULATIONS {
        defs.push(ParamDef {
            name: format!("mod{m}source"),
            display_units: String::new(),
            min: 0.0,
            max: MODULATION_RANGE,
            default_value: 0.0,
            display_scale: 1.0,
        });
        defs.push(ParamDef {
            name: format!("mod{m}dest"),
            display_units: String::new(),
            min: 0.0,
            max: MODULATION_RANGE,
            default_value: 0.0,
            display_scale: 1.0,
        });
        defs.push(ParamDef {
            name: format!("mod{m}value"),
            display_units: String::new(),
            min: -MODULATION_RANGE,
            max: MODULATION_RANGE,
            default_value: 0.0,
            display_scale: 1.0,
        });
    }

    defs
}

/// Raw value for a normalized percent, clamped into [min, max].
pub fn value_from_percent(min: f32, max: f32, percent: f32) -> f32 {
    (max - min) * percent.clamp(0.0, 1.0) + min
}

/// Normalized percent for a raw value, clamped into [0, 1].
/// Degenerate ranges (indices with no registered span) read as 0.
pub fn percent_from_value(min: f32, max: f32, value: f32) -> f32 {
    if max <= min {
        return 0.0;
    }
    ((value - min) / (max - min)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ControlInfo;

    fn catalog() -> ControlCatalog {
        ControlCatalog::new(vec![
            ControlInfo {
                name: "stutter_resample_rate".into(),
                display_units: "Hz".into(),
                min: 0.0,
                max: 100.0,
                default_value: 1.0,
            },
            ControlInfo {
                name: "amp_attack".into(),
                display_units: "secs".into(),
                min: 0.0,
                max: 4.0,
                default_value: 0.1,
            },
        ])
    }

    #[test]
    fn test_registered_name_munging() {
        assert_eq!(registered_name("amp_attack"), "ampattack");
        // Abbreviation applied before stripping, then truncated to 15 chars.
        assert_eq!(registered_name("stutter_resample_rate"), "stutterresampra");
        assert_eq!(registered_name("short"), "short");
    }

    #[test]
    fn test_definition_layout() {
        let catalog = catalog();
        let defs = parameter_definitions(&catalog);

        assert_eq!(defs.len(), total_params(2));
        assert_eq!(defs[PARAM_CHANNEL].name, "Channel");
        // Catalogue order is name-sorted.
        assert_eq!(defs[1].name, "ampattack");
        assert_eq!(defs[2].name, "stutterresampra");

        let mod_start = modulation_start(2);
        assert_eq!(defs[mod_start].name, "mod0source");
        assert_eq!(defs[mod_start + 1].name, "mod0dest");
        assert_eq!(defs[mod_start + 2].name, "mod0value");
        assert_eq!(defs[mod_start + 2].min, -MODULATION_RANGE);
    }

    #[test]
    fn test_percent_round_trip() {
        let (min, max) = (20.0, 20000.0);
        for value in [20.0, 440.0, 12345.0, 20000.0] {
            let percent = percent_from_value(min, max, value);
            let back = value_from_percent(min, max, percent);
            assert!((back - value).abs() < 1e-1, "{value} -> {percent} -> {back}");
        }
    }

    #[test]
    fn test_percent_clamps() {
        assert_eq!(percent_from_value(0.0, 1.0, 2.0), 1.0);
        assert_eq!(percent_from_value(0.0, 1.0, -1.0), 0.0);
        assert_eq!(value_from_percent(0.0, 10.0, 1.5), 10.0);
        assert_eq!(value_from_percent(0.0, 10.0, -0.5), 0.0);
    }
}
