//! Value types for light and group state parameters.

mod alert;
mod brightness;
mod color;
mod color_mode;
mod hue_saturation;
mod mireds;

pub use alert::{Alert, Effect};
pub use brightness::Brightness;
pub use color::Xy;
pub use color_mode::ColorMode;
pub use hue_saturation::{Hue, Saturation};
pub use mireds::Mireds;
