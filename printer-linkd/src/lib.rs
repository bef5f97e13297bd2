//! Local-network plumbing for talking to 3D printer controllers: a tiered
//! hostname resolver with a persistent cache, SSDP and DNS-SD discovery, a
//! shared controller connection and an MJPEG webcam stream reader.

pub mod api;
pub mod cache;
pub mod cache_manager;
pub mod config;
pub mod discovery;
pub mod error;
pub mod provider;
pub mod resolver;
pub mod stream;

pub use error::{LinkError, Result};
