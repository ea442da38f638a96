//! D3D12 shared-image import and resource-state barrier helpers.

use std::{mem, os::windows::io::OwnedHandle};

use windows::Win32::Graphics::Direct3D12;

use crate::auxil::dxgi::result::HResult as _;
use crate::common::raw_handle;

/// Opens an image allocated by the D3D11 allocator as a D3D12 resource.
pub fn import_image(
    device: &Direct3D12::ID3D12Device,
    handle: &OwnedHandle,
) -> Result<Direct3D12::ID3D12Resource, xrt::Error> {
    let resource: Direct3D12::ID3D12Resource =
        unsafe { device.OpenSharedHandle(raw_handle(handle)) }
            .into_device_result("ID3D12Device::OpenSharedHandle")?;
    Ok(resource)
}

/// The resource state the application hands images over in, and expects them
/// back in, derived from the swapchain usage bits.
pub fn usage_to_app_resource_state(bits: xrt::SwapchainUsage) -> Direct3D12::D3D12_RESOURCE_STATES {
    if bits.contains(xrt::SwapchainUsage::UNORDERED_ACCESS) {
        return Direct3D12::D3D12_RESOURCE_STATE_UNORDERED_ACCESS;
    }
    if bits.contains(xrt::SwapchainUsage::COLOR) {
        return Direct3D12::D3D12_RESOURCE_STATE_RENDER_TARGET;
    }
    if bits.contains(xrt::SwapchainUsage::DEPTH_STENCIL) {
        return Direct3D12::D3D12_RESOURCE_STATE_DEPTH_WRITE;
    }
    Direct3D12::D3D12_RESOURCE_STATE_COMMON
}

/// Builds a whole-resource transition barrier.
///
/// The embedded resource pointer is a borrowed copy wrapped in
/// `ManuallyDrop`; the barrier must not outlive `resource` and dropping it
/// releases nothing.
pub(crate) fn transition_barrier(
    resource: &Direct3D12::ID3D12Resource,
    state_before: Direct3D12::D3D12_RESOURCE_STATES,
    state_after: Direct3D12::D3D12_RESOURCE_STATES,
) -> Direct3D12::D3D12_RESOURCE_BARRIER {
    Direct3D12::D3D12_RESOURCE_BARRIER {
        Type: Direct3D12::D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: Direct3D12::D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: Direct3D12::D3D12_RESOURCE_BARRIER_0 {
            Transition: mem::ManuallyDrop::new(Direct3D12::D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: unsafe { mem::transmute_copy(resource) },
                Subresource: Direct3D12::D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: state_before,
                StateAfter: state_after,
            }),
        },
    }
}

/// Pre-builds the two per-image barrier command lists: one transitioning the
/// image from the compositor state into the application state for acquire,
/// one transitioning it back for release.
pub fn create_barrier_command_lists(
    device: &Direct3D12::ID3D12Device,
    command_allocator: &Direct3D12::ID3D12CommandAllocator,
    image: &Direct3D12::ID3D12Resource,
    bits: xrt::SwapchainUsage,
) -> Result<(Direct3D12::ID3D12CommandList, Direct3D12::ID3D12CommandList), xrt::Error> {
    let app_state = usage_to_app_resource_state(bits);
    let compositor_state = Direct3D12::D3D12_RESOURCE_STATE_COMMON;

    let record = |state_before, state_after| -> Result<Direct3D12::ID3D12CommandList, xrt::Error> {
        let list: Direct3D12::ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(
                0,
                Direct3D12::D3D12_COMMAND_LIST_TYPE_DIRECT,
                command_allocator,
                None,
            )
        }
        .into_device_result("ID3D12Device::CreateCommandList")
        .map_err(|_| xrt::Error::D3d12)?;
        unsafe {
            list.ResourceBarrier(&[transition_barrier(image, state_before, state_after)]);
            list.Close()
        }
        .into_device_result("ID3D12GraphicsCommandList::Close")
        .map_err(|_| xrt::Error::D3d12)?;
        Ok(list.into())
    };

    let to_app = record(compositor_state, app_state)?;
    let to_compositor = record(app_state, compositor_state)?;
    Ok((to_app, to_compositor))
}
