//! DXGI-level helpers: adapter resolution, format translation and HRESULT
//! mapping.

pub mod conv;
pub mod factory;
pub(crate) mod result;
