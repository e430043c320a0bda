//! HTTP handlers, grouped by surface.

pub mod bootstrap;
pub mod devices;
pub mod pairing;
pub mod session;
pub mod sync;
