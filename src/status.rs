//! Light and group state snapshots.

use serde::{Deserialize, Serialize};

use crate::types::{Alert, Brightness, ColorMode, Effect, Mireds, Saturation, Xy};

/// A point-in-time copy of a light's or group's state, including changes
/// not yet sent to the bridge.
///
/// Hue is given in degrees rather than the bridge's `0..=65535` range.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightState {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub on: bool,
    pub bri: Option<Brightness>,
    pub ct: Option<Mireds>,
    pub xy: Xy,
    pub hue: Option<f64>,
    pub sat: Option<Saturation>,
    pub colormode: Option<ColorMode>,
    pub alert: Option<Alert>,
    pub effect: Option<Effect>,
    pub reachable: Option<bool>,
}

impl LightState {
    /// True unless the bridge reported the light as unreachable.
    pub fn is_reachable(&self) -> bool {
        self.reachable.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialize_skips_unknown_values() {
        let state = LightState {
            id: 2,
            name: "Hue Lamp 2".into(),
            kind: Some("Extended color light".into()),
            on: true,
            bri: Some(Brightness::clamped(220)),
            ct: None,
            xy: Xy::clamped(0.5, 0.5),
            hue: Some(193.5),
            sat: Some(Saturation::clamped(255)),
            colormode: Some(ColorMode::Hs),
            alert: None,
            effect: Some(Effect::None),
            reachable: None,
        };

        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({
                "id": 2, "name": "Hue Lamp 2", "type": "Extended color light", "on": true,
                "bri": 220, "xy": [0.5, 0.5], "hue": 193.5, "sat": 255,
                "colormode": "hs", "effect": "none"
            })
        );
        assert!(state.is_reachable());
    }
}
