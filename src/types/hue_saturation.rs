//! Hue and saturation values.

use serde::{Deserialize, Serialize};

/// Hue as the bridge stores it: the color wheel mapped onto `0..=65535`.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hue {
    pub(crate) raw: u16,
}

impl Hue {
    /// Convert an angle in degrees, wrapping around the color wheel.
    ///
    /// # Examples
    ///
    /// ```
    /// use hue_bridge_rs::Hue;
    ///
    /// assert_eq!(Hue::from_degrees(0.0).raw(), 0);
    /// assert_eq!(Hue::from_degrees(180.0).raw(), 32768);
    /// assert_eq!(Hue::from_degrees(360.0).raw(), 0);
    /// assert_eq!(Hue::from_degrees(-90.0).raw(), 49152);
    /// ```
    pub fn from_degrees(degrees: f64) -> Self {
        let scaled = (degrees * 65536.0 / 360.0) as i64;
        Hue {
            raw: (scaled & 0xffff) as u16,
        }
    }

    pub fn from_raw(raw: u16) -> Self {
        Hue { raw }
    }

    pub fn raw(&self) -> u16 {
        self.raw
    }

    /// The hue as an angle in `0.0..360.0`.
    pub fn degrees(&self) -> f64 {
        f64::from(self.raw) * 360.0 / 65536.0
    }
}

/// Color saturation, 0 (white) to 255 (fully saturated).
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Saturation {
    pub(crate) value: u8,
}

impl Saturation {
    /// Clamp `value` into `0..=255`.
    pub fn clamped(value: i64) -> Self {
        Saturation {
            value: value.clamp(0, 255) as u8,
        }
    }

    pub fn value(&self) -> u8 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrees_round_trip_is_close() {
        let hue = Hue::from_degrees(193.5);
        assert!((hue.degrees() - 193.5).abs() < 0.01);
    }

    #[test]
    fn test_saturation_clamps() {
        assert_eq!(Saturation::clamped(-1).value(), 0);
        assert_eq!(Saturation::clamped(1000).value(), 255);
    }
}
