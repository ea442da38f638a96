//! Auxiliary helpers shared by the client backends.

pub mod dxgi;
