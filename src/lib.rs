#![cfg_attr(docsrs, feature(doc_cfg))]
//! # evcharger_lib
//!
//! This crate provides a library for controlling and monitoring EV chargers that speak the
//! hex encoded UDP protocol of the charger's mobile app.
//!
//! The protocol layer (frame codec and payload decoders) has no I/O and is always
//! available. The asynchronous client sits behind a feature.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `evcharger` command-line tool.
//!
//! ### Client Features
//! - `tokio-udp-async`: Enables the **asynchronous** client using `tokio` UDP sockets.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing data structures.
//! - `bin-dependencies`: Enables all features required by the `evcharger` binary executable (currently `tokio-udp-async` and `serde`).

/// Contains error types for the library.
mod error;
/// Signals published while talking to a charger.
pub mod event;
/// Frame codec, field helpers and request payloads.
pub mod protocol;
/// Decoded charger state.
pub mod state;

pub use error::Error;

/// Asynchronous high-level client.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-udp-async")))]
#[cfg(feature = "tokio-udp-async")]
pub mod charger;

/// Request/response correlation over one socket.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-udp-async")))]
#[cfg(feature = "tokio-udp-async")]
pub mod session;

/// Datagram transport abstraction and its UDP implementation.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-udp-async")))]
#[cfg(feature = "tokio-udp-async")]
pub mod transport;
