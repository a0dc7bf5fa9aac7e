//! Host-side protocol core for wearable tags.
//!
//! Everything is built on a small push-based stream primitive
//! ([`signal::Signal`]); hardware callbacks enter through the
//! [`peripheral::BleAdapter`] seam, get serialized by a
//! [`queue::CommandQueue`], and flow out to applications as connection
//! events, responses, and notifications.
//!
//! The usual path: [`manager::TagManager::start_scan`] to find a tag,
//! [`manager::TagManager::connect`] to bond and negotiate, then talk to the
//! [`tag::ConnectedTag`] delivered on the connection event stream.

pub mod cache;
pub mod config;
pub mod error;
pub mod fragment;
pub mod handshake;
pub mod logging;
pub mod manager;
pub mod peripheral;
pub mod protocol;
pub mod queue;
pub mod signal;
pub mod tag;
pub mod testkit;
pub mod transport;

pub use cache::{DeviceInfoCache, MemoryDeviceInfoCache};
pub use config::SdkConfig;
pub use error::{Error, Result};
pub use manager::{TagConnectionEvent, TagManager};
pub use peripheral::{BleAdapter, ConnectionState, PairingDelegate, ScannedTag, SilentPairing};
pub use protocol::{BatteryStatus, ChargingState, DeviceIdentity, Notification};
pub use signal::{Signal, Subscription, SubscriptionBag};
pub use tag::ConnectedTag;
