//! Active color mode of a light.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Which color parameters a light is currently following.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ColorMode {
    /// Hue and saturation
    Hs,
    /// CIE xy coordinates
    Xy,
    /// Color temperature in mireds
    Ct,
}
