//! Synth definitions the mixer graph instantiates.
//!
//! Definitions are referenced by name. Those without compiled bytes are
//! loaded by the server from `<synthdef_dir>/<name>.scsyndef`.

use oscwire::SynthDescriptor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthDef {
    pub name: &'static str,
    /// Control names and defaults, in the order the server reports them.
    pub parameters: &'static [(&'static str, f32)],
    /// Compiled `SCgf` bytes, sent with `/d_recv` when present.
    pub compiled: Option<&'static [u8]>,
}

impl SynthDef {
    pub fn descriptor(&self) -> SynthDescriptor {
        SynthDescriptor {
            name: self.name.to_string(),
            parameters: self
                .parameters
                .iter()
                .map(|(name, default)| (name.to_string(), *default))
                .collect(),
        }
    }
}

pub const CHANNEL_STRIP_2: SynthDef = SynthDef {
    name: "switchboard:channel-strip:2",
    parameters: &[("active", 1.0), ("bus", 0.0), ("gain", 0.0), ("gate", 1.0)],
    compiled: None,
};

pub const METERS_2: SynthDef = SynthDef {
    name: "switchboard:meters:2",
    parameters: &[("in_", 0.0), ("out", 0.0)],
    compiled: None,
};

pub const PATCH_CABLE_2_2: SynthDef = SynthDef {
    name: "switchboard:patch-cable:2x2",
    parameters: &[
        ("active", 1.0),
        ("gain", 0.0),
        ("gate", 1.0),
        ("in_", 0.0),
        ("out", 0.0),
    ],
    compiled: None,
};

/// Reads its input with one block of delay, so it may run before the writer.
pub const FB_PATCH_CABLE_2_2: SynthDef = SynthDef {
    name: "switchboard:fb-patch-cable:2x2",
    parameters: PATCH_CABLE_2_2.parameters,
    compiled: None,
};

pub const DEVICE_DC_TESTER_2: SynthDef = SynthDef {
    name: "switchboard:device-dc-tester:2",
    parameters: &[("dc", 1.0), ("out", 0.0)],
    compiled: None,
};

pub const BUILTINS: &[SynthDef] = &[
    CHANNEL_STRIP_2,
    DEVICE_DC_TESTER_2,
    FB_PATCH_CABLE_2_2,
    METERS_2,
    PATCH_CABLE_2_2,
];

/// Parameter layouts for a loopback engine.
pub fn descriptors() -> Vec<SynthDescriptor> {
    BUILTINS.iter().map(SynthDef::descriptor).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_are_unique() {
        let mut names: Vec<&str> = BUILTINS.iter().map(|def| def.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), BUILTINS.len());
    }

    #[test]
    fn feedback_cable_shares_the_patch_cable_controls() {
        assert_eq!(
            FB_PATCH_CABLE_2_2.descriptor().parameters,
            PATCH_CABLE_2_2.descriptor().parameters
        );
    }
}
