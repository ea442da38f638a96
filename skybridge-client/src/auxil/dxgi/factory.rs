//! Adapter resolution by index and by LUID.
//!
//! The compositor and the application must land on the same physical GPU for
//! shared-handle import to succeed; LUID-based resolution is what guarantees
//! that across process and API boundaries.

use windows::{core::Interface, Win32::Foundation, Win32::Graphics::Dxgi};

use crate::common::{d3d_info, d3d_warn};

fn try_create_factory<T: Interface>() -> Option<T> {
    match unsafe { Dxgi::CreateDXGIFactory1::<T>() } {
        Ok(factory) => Some(factory),
        Err(err) => {
            log::debug!("CreateDXGIFactory1: {err}");
            None
        }
    }
}

/// Returns the `index`th adapter, ranked by GPU preference where the platform
/// supports preference-based enumeration (high-performance adapters first),
/// by plain ordinal order otherwise.
///
/// Returns `None` when `index` is out of range.
pub fn get_adapter_by_index(index: u32, log_level: log::LevelFilter) -> Option<Dxgi::IDXGIAdapter> {
    if let Some(factory6) = try_create_factory::<Dxgi::IDXGIFactory6>() {
        d3d_info!(
            log_level,
            "Using IDXGIFactory6::EnumAdapterByGpuPreference to select adapter {index}"
        );
        match unsafe {
            factory6.EnumAdapterByGpuPreference::<Dxgi::IDXGIAdapter>(
                index,
                Dxgi::DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE,
            )
        } {
            Ok(adapter) => return Some(adapter),
            Err(err) if err.code() == Dxgi::DXGI_ERROR_NOT_FOUND => return None,
            Err(err) => log::error!("EnumAdapterByGpuPreference: {err}"),
        }
        // Otherwise fall through to the other factory.
    }

    let factory = try_create_factory::<Dxgi::IDXGIFactory1>()?;
    d3d_info!(
        log_level,
        "IDXGIFactory6 unavailable, using IDXGIFactory1::EnumAdapters1 to select adapter {index}"
    );
    match unsafe { factory.EnumAdapters1(index) } {
        Ok(adapter) => Some(adapter.into()),
        Err(_) => None,
    }
}

/// Returns the adapter whose LUID matches, or `None` when no adapter does.
///
/// Uses the direct by-LUID lookup where available and otherwise scans all
/// adapters comparing both LUID halves.
pub fn get_adapter_by_luid(luid: xrt::Luid, log_level: log::LevelFilter) -> Option<Dxgi::IDXGIAdapter> {
    let raw = Foundation::LUID {
        LowPart: luid.low_part(),
        HighPart: luid.high_part(),
    };

    if let Some(factory4) = try_create_factory::<Dxgi::IDXGIFactory4>() {
        d3d_info!(
            log_level,
            "Using IDXGIFactory4::EnumAdapterByLuid to select adapter"
        );
        match unsafe { factory4.EnumAdapterByLuid::<Dxgi::IDXGIAdapter>(raw) } {
            Ok(adapter) => return Some(adapter),
            Err(err) => log::debug!("EnumAdapterByLuid: {err}"),
        }
        // Otherwise fall through to the manual scan.
    }

    // Manual rendition of EnumAdapterByLuid for older factories.
    let factory = try_create_factory::<Dxgi::IDXGIFactory1>()?;
    d3d_info!(
        log_level,
        "IDXGIFactory4 unavailable, using IDXGIFactory1::EnumAdapters1 to scan for a matching LUID"
    );
    for i in 0.. {
        let adapter = match unsafe { factory.EnumAdapters1(i) } {
            Ok(adapter) => adapter,
            Err(_) => {
                d3d_warn!(
                    log_level,
                    "Ran out of adapters using IDXGIFactory1::EnumAdapters1 before finding a matching LUID"
                );
                break;
            }
        };
        let desc = match unsafe { adapter.GetDesc1() } {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        if desc.AdapterLuid.LowPart == raw.LowPart && desc.AdapterLuid.HighPart == raw.HighPart {
            return Some(adapter.into());
        }
    }
    None
}
