//! Fuzzing harnesses for the Lauberhorn exchange.
//!
//! The handshake and codec models run against the real types in isolation;
//! the exchange model drives the full engine against the software FPGA
//! model from `lauberhorn-testkit`, so no device mapping is needed.

pub mod codec_model;
pub mod exchange_model;
pub mod handshake_model;
