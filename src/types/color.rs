//! CIE xy color coordinates.

use serde::{Deserialize, Serialize};

/// A point in the CIE 1931 color space, both coordinates in `0.0..=1.0`.
///
/// Serializes as the two-element array the bridge uses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Xy {
    x: f64,
    y: f64,
}

impl Default for Xy {
    /// Roughly white; used for lights that report no color at all.
    fn default() -> Self {
        Xy {
            x: 0.33333,
            y: 0.33333,
        }
    }
}

impl Xy {
    /// Create a point, clamping each coordinate into `0.0..=1.0`.
    ///
    /// NaN coordinates become 0.
    ///
    /// # Examples
    ///
    /// ```
    /// use hue_bridge_rs::Xy;
    ///
    /// let xy = Xy::clamped(1.5, -0.2);
    /// assert_eq!((xy.x(), xy.y()), (1.0, 0.0));
    /// ```
    pub fn clamped(x: f64, y: f64) -> Self {
        Xy {
            x: clamp_unit(x),
            y: clamp_unit(y),
        }
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

impl From<[f64; 2]> for Xy {
    fn from([x, y]: [f64; 2]) -> Self {
        Xy::clamped(x, y)
    }
}

impl From<Xy> for [f64; 2] {
    fn from(xy: Xy) -> Self {
        [xy.x, xy.y]
    }
}
