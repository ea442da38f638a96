//! D3D11 device creation on a chosen adapter.

use windows::{
    core::Interface,
    Win32::Foundation,
    Win32::Graphics::{Direct3D, Direct3D11, Dxgi},
};

use crate::auxil::dxgi::result::HResult as _;
use crate::common::d3d_debug;

fn try_create_device(
    adapter: Option<&Dxgi::IDXGIAdapter>,
    driver_type: Direct3D::D3D_DRIVER_TYPE,
    flags: Direct3D11::D3D11_CREATE_DEVICE_FLAG,
    feature_levels: &[Direct3D::D3D_FEATURE_LEVEL],
) -> windows::core::Result<(Direct3D11::ID3D11Device, Direct3D11::ID3D11DeviceContext)> {
    let mut device = None;
    let mut context = None;
    unsafe {
        Direct3D11::D3D11CreateDevice(
            adapter,
            driver_type,
            None,
            flags,
            Some(feature_levels),
            Direct3D11::D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
    }?;
    let device = device.ok_or_else(|| windows::core::Error::from_hresult(Foundation::E_POINTER))?;
    let context = context.ok_or_else(|| windows::core::Error::from_hresult(Foundation::E_POINTER))?;
    Ok((device, context))
}

/// Creates a logical device and immediate context on `adapter`, or on the
/// default hardware adapter when none is given.
///
/// Requests feature levels 11.1 then 11.0 in descending order. Debug builds
/// ask for the validation layer and retry once without it when the SDK layers
/// are not installed; release builds never request it. Failure after the
/// retry is fatal to the caller.
pub fn create_device(
    adapter: Option<&Dxgi::IDXGIAdapter>,
    log_level: log::LevelFilter,
) -> Result<(Direct3D11::ID3D11Device5, Direct3D11::ID3D11DeviceContext4), xrt::Error> {
    profiling::scope!("D3D11CreateDevice");

    let driver_type = if adapter.is_some() {
        // Required when an explicit adapter is passed.
        d3d_debug!(log_level, "Adapter provided");
        Direct3D::D3D_DRIVER_TYPE_UNKNOWN
    } else {
        Direct3D::D3D_DRIVER_TYPE_HARDWARE
    };

    let base_flags = Direct3D11::D3D11_CREATE_DEVICE_BGRA_SUPPORT;
    let mut flags = base_flags;
    if cfg!(debug_assertions) {
        d3d_debug!(log_level, "Will attempt to create the device with the debug layer");
        flags |= Direct3D11::D3D11_CREATE_DEVICE_DEBUG;
    }

    let feature_levels = [
        Direct3D::D3D_FEATURE_LEVEL_11_1,
        Direct3D::D3D_FEATURE_LEVEL_11_0,
    ];

    let mut result = try_create_device(adapter, driver_type, flags, &feature_levels);
    if cfg!(debug_assertions) {
        if let Err(err) = &result {
            if err.code() == Dxgi::DXGI_ERROR_SDK_COMPONENT_MISSING {
                d3d_debug!(log_level, "Removing the debug layer flag: not successful");
                result = try_create_device(adapter, driver_type, base_flags, &feature_levels);
            }
        }
    }

    let (device, context) = result
        .into_device_result("D3D11CreateDevice")
        .map_err(|_| xrt::Error::Allocation)?;

    let device = device
        .cast::<Direct3D11::ID3D11Device5>()
        .into_device_result("ID3D11Device5")
        .map_err(|_| xrt::Error::Allocation)?;
    let context = context
        .cast::<Direct3D11::ID3D11DeviceContext4>()
        .into_device_result("ID3D11DeviceContext4")
        .map_err(|_| xrt::Error::Allocation)?;
    Ok((device, context))
}
