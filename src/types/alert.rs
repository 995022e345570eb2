//! Alert and effect modes.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Flashing behaviour of a light or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Alert {
    /// Stop flashing
    None,
    /// Flash once
    Select,
    /// Flash repeatedly for a while
    #[serde(rename = "lselect")]
    #[strum(serialize = "lselect")]
    LSelect,
}

/// Dynamic effect of a light or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Effect {
    None,
    /// Cycle through all hues
    Colorloop,
}

impl Effect {
    /// Parse an effect name; anything other than `colorloop` means no effect.
    pub fn from_name(name: &str) -> Self {
        if name == "colorloop" {
            Effect::Colorloop
        } else {
            Effect::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_wire_names() {
        assert_eq!(Alert::LSelect.to_string(), "lselect");
        assert_eq!(Alert::from_str("select").ok(), Some(Alert::Select));
        assert_eq!(serde_json::to_string(&Alert::LSelect).unwrap(), r#""lselect""#);
        assert_eq!(Effect::Colorloop.to_string(), "colorloop");
    }

    #[test]
    fn test_unknown_effect_is_none() {
        assert_eq!(Effect::from_name("sparkle"), Effect::None);
        assert_eq!(Effect::from_name("colorloop"), Effect::Colorloop);
    }
}
