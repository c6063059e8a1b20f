//! Core domain + application logic for the WhatsApp batch relay.
//!
//! This crate is intentionally transport-agnostic. The WhatsApp session and
//! the credential directory live behind ports (traits); the bridge adapter
//! crate implements the session side.

pub mod batch;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod messaging;
pub mod session;

pub use errors::{Error, Result};
