//! Color temperature control.

use serde::{Deserialize, Serialize};

/// Color temperature in mireds, with valid values from 154 to 500.
///
/// Lower values produce cooler (bluer) light, higher values warmer
/// (yellower) light. 154 mireds is about 6500K, 500 mireds 2000K.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mireds {
    pub(crate) value: u16,
}

impl Default for Mireds {
    fn default() -> Self {
        Mireds { value: Self::MIN as u16 }
    }
}

impl Mireds {
    const MIN: i64 = 154;
    const MAX: i64 = 500;

    pub fn value(&self) -> u16 {
        self.value
    }

    /// Clamp `value` into the valid range.
    ///
    /// # Examples
    ///
    /// ```
    /// use hue_bridge_rs::Mireds;
    ///
    /// assert_eq!(Mireds::clamped(100).value(), 154);
    /// assert_eq!(Mireds::clamped(366).value(), 366);
    /// assert_eq!(Mireds::clamped(9000).value(), 500);
    /// ```
    pub fn clamped(value: i64) -> Self {
        Mireds {
            value: value.clamp(Self::MIN, Self::MAX) as u16,
        }
    }

    /// Convert a Kelvin temperature, clamping to what bulbs support.
    pub fn from_kelvin(kelvin: u32) -> Self {
        Self::clamped(1_000_000 / i64::from(kelvin.max(1)))
    }

    /// Approximate temperature in Kelvin.
    pub fn kelvin(&self) -> u32 {
        1_000_000 / u32::from(self.value.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kelvin_conversion() {
        assert_eq!(Mireds::from_kelvin(2700).value(), 370);
        assert_eq!(Mireds::from_kelvin(10_000).value(), 154);
        assert_eq!(Mireds::from_kelvin(0).value(), 500);
        assert_eq!(Mireds::clamped(250).kelvin(), 4000);
    }
}
