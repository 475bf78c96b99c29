//! A minimal reference connector: echoes queries back at the platform.
//!
//! Useful for checking platform wiring end to end (handshake, configuration,
//! query round-trips) without any real device behind the source.

pub mod echo;

pub use echo::EchoHandler;
