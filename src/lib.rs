//! Enphase Envoy monitoring: polls the gateway, derives power and energy
//! metrics per stream and keeps their running maxima across restarts.

#[macro_use]
extern crate log;

pub mod config;
pub mod device;
pub mod envoy;
pub mod error;
pub mod inventory;
pub mod metrics;
pub mod reducer;
pub mod scheduler;
pub mod watermark;
