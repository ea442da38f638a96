//! D3D12 fence (timeline semaphore) creation, import and CPU-side waiting.

use std::{
    os::windows::io::OwnedHandle,
    time::{Duration, Instant},
};

use windows::{
    core::PCWSTR,
    Win32::{Foundation, Graphics::Direct3D12, Graphics::Dxgi, System::Threading},
};

use crate::auxil::dxgi::result::HResult as _;
use crate::common::{raw_handle, timeout_to_ms, wrap_handle, Event};

/// Creates a fence with initial value 0 and exports a shareable handle for
/// it, usable as a cross-process or cross-adapter timeline semaphore.
pub fn create_shared_fence(
    device: &Direct3D12::ID3D12Device,
    share_cross_adapter: bool,
) -> Result<(OwnedHandle, Direct3D12::ID3D12Fence), xrt::Error> {
    let flags = if share_cross_adapter {
        Direct3D12::D3D12_FENCE_FLAG_SHARED_CROSS_ADAPTER
    } else {
        Direct3D12::D3D12_FENCE_FLAG_SHARED
    };

    let fence: Direct3D12::ID3D12Fence = unsafe { device.CreateFence(0, flags) }
        .into_device_result("ID3D12Device::CreateFence")
        .map_err(|_| xrt::Error::Allocation)?;

    let handle = unsafe {
        device.CreateSharedHandle(
            &fence,
            None,
            Dxgi::DXGI_SHARED_RESOURCE_READ | Dxgi::DXGI_SHARED_RESOURCE_WRITE,
            PCWSTR::null(),
        )
    }
    .into_device_result("ID3D12Device::CreateSharedHandle")
    .map_err(|_| xrt::Error::Allocation)?;

    Ok((wrap_handle(handle), fence))
}

/// Opens a fence shared by another device or process.
///
/// Returns the `ID3D12Fence1` interface so callers can inspect the creation
/// flags; imported fences created non-monitored are unusable for waiting.
pub fn import_fence(
    device: &Direct3D12::ID3D12Device,
    handle: &OwnedHandle,
) -> Result<Direct3D12::ID3D12Fence1, xrt::Error> {
    let fence: Direct3D12::ID3D12Fence1 = unsafe { device.OpenSharedHandle(raw_handle(handle)) }
        .into_device_result("ID3D12Device::OpenSharedHandle")?;
    Ok(fence)
}

/// Blocks the calling thread until `fence` reaches `value`, bounded by
/// `timeout`.
///
/// Returns `Ok(true)` when the value was reached and `Ok(false)` on timeout.
/// The event must be dedicated to the calling thread. The completion
/// callback is registered before the completed value is checked; a value
/// that lands in between still fires the event, so no wakeup is lost. The
/// event may also carry a stale signal from an earlier registration, so a
/// wakeup only counts once the completed value actually reached the target.
pub fn wait_on_fence_with_timeout(
    fence: &Direct3D12::ID3D12Fence,
    event: &Event,
    value: u64,
    timeout: Duration,
) -> Result<bool, xrt::Error> {
    unsafe { fence.SetEventOnCompletion(value, event.0) }
        .into_device_result("ID3D12Fence::SetEventOnCompletion")
        .map_err(|_| xrt::Error::D3d12)?;

    if value <= unsafe { fence.GetCompletedValue() } {
        // Already reached, no need to block at all.
        return Ok(true);
    }

    let start = Instant::now();
    loop {
        let Some(remaining) = timeout.checked_sub(start.elapsed()) else {
            return Ok(false);
        };
        match unsafe { Threading::WaitForSingleObject(event.0, timeout_to_ms(Some(remaining))) } {
            Foundation::WAIT_OBJECT_0 => {}
            Foundation::WAIT_TIMEOUT => return Ok(false),
            other => {
                log::error!("Unexpected fence wait status: {other:?}");
                return Err(xrt::Error::D3d12);
            }
        }
        if value <= unsafe { fence.GetCompletedValue() } {
            return Ok(true);
        }
    }
}
