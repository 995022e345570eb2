//! # hue_bridge_rs
//!
//! An async Rust library for finding Philips Hue bridges on the local network
//! and driving the lights, groups and scenes behind them.
//!
//! This crate provides a **runtime-agnostic** async API. Bridges are found with
//! SSDP, verified against their `description.xml`, and then kept up to date by
//! a [`Registry`]. Every [`Bridge`] serializes its HTTP requests per category
//! and batches state changes so that a burst of setter calls becomes a single
//! request per light.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use hue_bridge_rs::{Credentials, DiscoEvent, Lightset, Registry, RegistryConfig};
//!
//! async fn dim_everything() -> Result<(), hue_bridge_rs::Error> {
//!     let registry = Registry::with_config(RegistryConfig::default())?;
//!     registry.add_disco_callback(|event| {
//!         if let DiscoEvent::Add(bridge) = event {
//!             for light in bridge.lights().values() {
//!                 light.turn_on();
//!                 light.set_bri(40);
//!             }
//!         }
//!     });
//!     let credentials = Credentials::Shared("my-username".into());
//!     registry.start_discovery(credentials, Duration::from_secs(30))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Discovery**: Periodic SSDP searches with [`Registry`], or one-off with [`ssdp::discover`]
//! - **Bridge lifecycle**: Verification, registration and refresh through [`Bridge`]
//! - **Lights and groups**: Stateful handles implementing [`Lightset`]
//! - **Scenes**: Recall stored scenes with [`Scene::recall`]
//! - **Rate limiting**: Writes are coalesced by the bridge's [`Coalescer`]
//! - **Request history**: Per-bridge log of recent requests via [`RequestHistory`]
//!
//! ## Runtime Selection
//!
//! This library is runtime-agnostic. Select your preferred runtime using feature flags:
//!
//! ### Using tokio (default)
//!
//! ```toml
//! [dependencies]
//! hue-bridge-rs = "0.1"
//! tokio = { version = "1", features = ["rt-multi-thread", "macros"] }
//! ```
//!
//! ### Using async-std
//!
//! ```toml
//! [dependencies]
//! hue-bridge-rs = { version = "0.1", default-features = false, features = ["runtime-async-std"] }
//! async-std = { version = "1.12", features = ["attributes"] }
//! ```
//!
//! Without `reqwest-transport`, supply your own [`Transport`] to [`Registry::new`].
//!
//! ## Feature Flags
//!
//! - `runtime-tokio` (default): Use the tokio async runtime
//! - `runtime-async-std`: Use the async-std runtime
//! - `runtime-smol`: Use the smol runtime
//! - `reqwest-transport` (default): HTTP through `reqwest`; requires tokio

mod bridge;
mod callbacks;
mod coalescer;
mod config;
mod description;
mod errors;
mod group;
mod history;
mod light;
mod registry;
mod request_queue;
mod response;
pub mod runtime;
mod scene;
pub mod ssdp;
mod status;
mod target;
mod transport;
mod types;

// Re-export public API
pub use bridge::Bridge;
pub use callbacks::CallbackId;
pub use coalescer::{Coalescer, Completion, WriteSink};
pub use config::{BridgeConfig, RegistryConfig};
pub use description::BridgeDescription;
pub use errors::Error;
pub use group::Group;
pub use history::{HistoryEntry, HistorySummary, RequestHistory, RequestOutcome};
pub use light::Light;
pub use registry::{Credentials, DiscoEvent, Registry};
pub use request_queue::{PendingResponse, RequestQueue};
pub use scene::Scene;
pub use ssdp::{Discoverer, SsdpDiscoverer, SsdpResponse};
pub use status::LightState;
pub use target::{Flushable, Lightset, TargetCore, TargetKey, TargetWrite};
#[cfg(feature = "reqwest-transport")]
pub use transport::ReqwestTransport;
pub use transport::{HttpRequest, HttpResponse, Method, Transport};
pub use types::{Alert, Brightness, ColorMode, Effect, Hue, Mireds, Saturation, Xy};
