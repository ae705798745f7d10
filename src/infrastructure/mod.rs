//! Ambient infrastructure shared by the shim

pub mod logging;

pub use logging::*;
