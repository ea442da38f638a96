//! Shared-image allocation on a D3D11 device.

use std::os::windows::io::OwnedHandle;

use windows::{
    core::{Interface, PCWSTR},
    Win32::Graphics::{Direct3D11, Dxgi},
};

use crate::auxil::dxgi::{conv, result::HResult as _};
use crate::common::wrap_handle;

/// Exports an NT handle other devices and processes can import.
fn export_shared_handle(image: &Direct3D11::ID3D11Texture2D1) -> Result<OwnedHandle, xrt::Error> {
    let resource = image
        .cast::<Dxgi::IDXGIResource1>()
        .into_device_result("IDXGIResource1")?;
    let handle = unsafe {
        resource.CreateSharedHandle(
            None,
            Dxgi::DXGI_SHARED_RESOURCE_READ | Dxgi::DXGI_SHARED_RESOURCE_WRITE,
            PCWSTR::null(),
        )
    }
    .into_device_result("IDXGIResource1::CreateSharedHandle")?;
    Ok(wrap_handle(handle))
}

/// Allocates `image_count` shareable textures described by `info` and exports
/// one NT handle per texture.
///
/// `info.format` is a DXGI format code; the textures themselves are created
/// with its typeless variant so that other APIs can create their own views.
/// With `keyed_mutex` the textures carry a keyed mutex for cross-device
/// ownership handoff, otherwise they are plain shared resources.
///
/// On success both returned vectors are exactly `image_count` long and
/// index-aligned: handle `i` refers to image `i`. On failure nothing escapes;
/// partially created textures and handles are released on the way out.
pub fn allocate_shared_images(
    device: &Direct3D11::ID3D11Device5,
    info: &xrt::SwapchainCreateInfo,
    image_count: usize,
    keyed_mutex: bool,
) -> Result<(Vec<Direct3D11::ID3D11Texture2D1>, Vec<OwnedHandle>), xrt::Error> {
    profiling::scope!("allocate_shared_images");

    if info.create.contains(xrt::SwapchainCreateFlags::PROTECTED_CONTENT) {
        return Err(xrt::Error::SwapchainFlagValidButUnsupported);
    }
    if info.create.contains(xrt::SwapchainCreateFlags::STATIC_IMAGE) && image_count > 1 {
        log::error!("Got a static image swapchain with an image count greater than 1");
        return Err(xrt::Error::Allocation);
    }
    if info.array_size == 0 {
        log::error!("Array size must not be 0");
        return Err(xrt::Error::Allocation);
    }
    if info.face_count == 6 {
        log::error!("Cube swapchains are not implemented for D3D11 shared allocation");
        return Err(xrt::Error::Allocation);
    }

    let format = Dxgi::Common::DXGI_FORMAT(info.format as u32);
    let Some(typeless) = conv::to_typeless(format) else {
        log::error!("Invalid format {:#06x}", info.format);
        return Err(xrt::Error::SwapchainFormatUnsupported);
    };

    // NT-handle sharing is what makes the handles duplicatable across the
    // process boundary; the keyed mutex is added when the caller needs the
    // cross-device ownership handoff.
    let misc_flags = Direct3D11::D3D11_RESOURCE_MISC_SHARED_NTHANDLE
        | if keyed_mutex {
            Direct3D11::D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX
        } else {
            Direct3D11::D3D11_RESOURCE_MISC_SHARED
        };

    let desc = Direct3D11::D3D11_TEXTURE2D_DESC1 {
        Width: info.width,
        Height: info.height,
        MipLevels: info.mip_count,
        ArraySize: info.array_size,
        Format: typeless,
        SampleDesc: Dxgi::Common::DXGI_SAMPLE_DESC {
            Count: info.sample_count,
            Quality: 0,
        },
        Usage: Direct3D11::D3D11_USAGE_DEFAULT,
        BindFlags: conv::usage_to_bind_flags(info.bits).0 as u32,
        CPUAccessFlags: 0,
        MiscFlags: misc_flags.0 as u32,
        TextureLayout: Direct3D11::D3D11_TEXTURE_LAYOUT_UNDEFINED,
    };

    let mut images = Vec::with_capacity(image_count);
    for _ in 0..image_count {
        let mut texture = None;
        unsafe { device.CreateTexture2D1(&desc, None, Some(&mut texture)) }
            .into_device_result("ID3D11Device3::CreateTexture2D1")
            .map_err(|_| xrt::Error::Allocation)?;
        images.push(texture.ok_or(xrt::Error::Allocation)?);
    }

    let mut handles = Vec::with_capacity(image_count);
    for image in &images {
        handles.push(export_shared_handle(image).map_err(|_| xrt::Error::Allocation)?);
    }

    Ok((images, handles))
}
