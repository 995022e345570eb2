//! Brightness control for Hue lights.

use serde::{Deserialize, Serialize};

/// Brightness level as the bridge understands it, 0 to 255.
///
/// A brightness of 0 is the dimmest setting, not off.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Brightness {
    pub(crate) value: u8,
}

impl Brightness {
    const MIN: i64 = 0;
    const MAX: i64 = 255;

    pub fn new() -> Self {
        Brightness { value: Self::MAX as u8 }
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    /// Clamp `value` into the valid range.
    ///
    /// # Examples
    ///
    /// ```
    /// use hue_bridge_rs::Brightness;
    ///
    /// assert_eq!(Brightness::clamped(300).value(), 255);
    /// assert_eq!(Brightness::clamped(-4).value(), 0);
    /// assert_eq!(Brightness::clamped(128).value(), 128);
    /// ```
    pub fn clamped(value: i64) -> Self {
        Brightness {
            value: value.clamp(Self::MIN, Self::MAX) as u8,
        }
    }
}
