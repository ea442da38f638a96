//! Device-backed tests for the adapter, allocator and fence helpers.
//!
//! Everything here talks to a real Direct3D device and is ignored by
//! default; run with `cargo test -- --ignored` on a machine with a GPU.

#![cfg(windows)]

use std::time::Duration;

use skybridge_client::auxil::dxgi::factory;
use skybridge_client::{d3d11, d3d12};
use windows::{
    core::Interface,
    Win32::Graphics::{Direct3D, Direct3D11, Direct3D12, Dxgi},
};

const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Trace;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn create_d3d12_device(adapter: &Dxgi::IDXGIAdapter) -> Direct3D12::ID3D12Device {
    let mut device = None::<Direct3D12::ID3D12Device>;
    unsafe {
        Direct3D12::D3D12CreateDevice(adapter, Direct3D::D3D_FEATURE_LEVEL_11_0, &mut device)
    }
    .expect("D3D12CreateDevice");
    device.expect("D3D12CreateDevice returned no device")
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn dxgi_adapter_by_index_and_luid() {
    init_logging();

    let adapter = factory::get_adapter_by_index(0, LOG_LEVEL).expect("adapter 0");
    let adapter1 = adapter.cast::<Dxgi::IDXGIAdapter1>().unwrap();
    let desc = unsafe { adapter1.GetDesc1() }.unwrap();

    let luid = xrt::Luid::from_parts(desc.AdapterLuid.LowPart, desc.AdapterLuid.HighPart);
    let from_luid = factory::get_adapter_by_luid(luid, LOG_LEVEL).expect("adapter by LUID");
    let from_luid_desc = unsafe { from_luid.cast::<Dxgi::IDXGIAdapter1>().unwrap().GetDesc1() }.unwrap();
    assert_eq!(from_luid_desc.AdapterLuid.LowPart, desc.AdapterLuid.LowPart);
    assert_eq!(from_luid_desc.AdapterLuid.HighPart, desc.AdapterLuid.HighPart);

    // Nonexistent LUID finds nothing.
    assert!(factory::get_adapter_by_luid(xrt::Luid(u64::MAX ^ 1), LOG_LEVEL).is_none());
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn d3d11_device_creation() {
    init_logging();

    let adapter = factory::get_adapter_by_index(0, LOG_LEVEL).expect("adapter 0");
    let (device, context) = d3d11::create_device(Some(&adapter), LOG_LEVEL).expect("device");
    drop(context);
    drop(device);

    // Also works without an explicit adapter.
    let _ = d3d11::create_device(None, LOG_LEVEL).expect("default device");
}

fn test_create_info(format: Dxgi::Common::DXGI_FORMAT) -> xrt::SwapchainCreateInfo {
    xrt::SwapchainCreateInfo {
        bits: if skybridge_client::auxil::dxgi::conv::is_depth_stencil_format(format) {
            xrt::SwapchainUsage::DEPTH_STENCIL | xrt::SwapchainUsage::SAMPLED
        } else {
            xrt::SwapchainUsage::COLOR | xrt::SwapchainUsage::SAMPLED
        },
        format: format.0 as i64,
        width: 800,
        height: 600,
        ..Default::default()
    }
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn d3d11_allocate_aligned_and_importable() {
    init_logging();

    let adapter = factory::get_adapter_by_index(0, LOG_LEVEL).expect("adapter 0");
    let (device, _context) = d3d11::create_device(Some(&adapter), LOG_LEVEL).expect("device");
    let (second_device, _second_context) =
        d3d11::create_device(Some(&adapter), LOG_LEVEL).expect("second device");

    let color_formats = [
        Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
        Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM,
        Dxgi::Common::DXGI_FORMAT_R16G16B16A16_FLOAT,
        Dxgi::Common::DXGI_FORMAT_R16G16B16A16_UNORM,
        Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM,
    ];

    for format in color_formats {
        let info = test_create_info(format);
        let (images, handles) =
            d3d11::allocate_shared_images(&device, &info, 3, true).expect("allocation");

        // Outputs are index-aligned and exactly as long as requested.
        assert_eq!(images.len(), 3);
        assert_eq!(handles.len(), 3);

        // Every handle opens on a second device as a texture with identical
        // shape.
        for (image, handle) in images.iter().zip(&handles) {
            use std::os::windows::io::AsRawHandle;
            let imported: Direct3D11::ID3D11Texture2D1 = unsafe {
                second_device
                    .OpenSharedResource1(windows::Win32::Foundation::HANDLE(handle.as_raw_handle()))
            }
            .expect("import into second device");

            let mut expected = Default::default();
            let mut actual = Default::default();
            unsafe {
                image.GetDesc1(&mut expected);
                imported.GetDesc1(&mut actual);
            }
            assert_eq!(expected.Width, actual.Width);
            assert_eq!(expected.Height, actual.Height);
            assert_eq!(expected.Format, actual.Format);
            assert_eq!(expected.ArraySize, actual.ArraySize);
        }
    }
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn d3d11_allocate_precondition_failures() {
    init_logging();

    let adapter = factory::get_adapter_by_index(0, LOG_LEVEL).expect("adapter 0");
    let (device, _context) = d3d11::create_device(Some(&adapter), LOG_LEVEL).expect("device");

    let info = test_create_info(Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM);

    // Static image with more than one image.
    let mut static_info = info;
    static_info.create = xrt::SwapchainCreateFlags::STATIC_IMAGE;
    assert_eq!(
        d3d11::allocate_shared_images(&device, &static_info, 2, true).unwrap_err(),
        xrt::Error::Allocation
    );
    // A single static image is fine.
    assert!(d3d11::allocate_shared_images(&device, &static_info, 1, true).is_ok());

    // Protected content is recognized but unsupported.
    let mut protected_info = info;
    protected_info.create = xrt::SwapchainCreateFlags::PROTECTED_CONTENT;
    assert_eq!(
        d3d11::allocate_shared_images(&device, &protected_info, 3, true).unwrap_err(),
        xrt::Error::SwapchainFlagValidButUnsupported
    );

    // Cube maps are not implemented.
    let mut cube_info = info;
    cube_info.face_count = 6;
    assert_eq!(
        d3d11::allocate_shared_images(&device, &cube_info, 3, true).unwrap_err(),
        xrt::Error::Allocation
    );

    // Array size 0 is invalid.
    let mut zero_array_info = info;
    zero_array_info.array_size = 0;
    assert_eq!(
        d3d11::allocate_shared_images(&device, &zero_array_info, 3, true).unwrap_err(),
        xrt::Error::Allocation
    );

    // A format with no typeless variant cannot be shared.
    let mut bad_format_info = info;
    bad_format_info.format = Dxgi::Common::DXGI_FORMAT_UNKNOWN.0 as i64;
    assert_eq!(
        d3d11::allocate_shared_images(&device, &bad_format_info, 3, true).unwrap_err(),
        xrt::Error::SwapchainFormatUnsupported
    );
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn d3d12_fence_wait_short_circuits() {
    init_logging();

    let adapter = factory::get_adapter_by_index(0, LOG_LEVEL).expect("adapter 0");
    let device = create_d3d12_device(&adapter);

    let (handle, fence) = d3d12::create_shared_fence(&device, false).expect("fence");

    // Fences can be signaled CPU-side in D3D12, which makes the
    // short-circuit observable without any GPU work.
    unsafe { fence.Signal(5) }.unwrap();

    let event = skybridge_client::Event::create(false, false).expect("event");
    // Target below the completed value returns immediately, even with a zero
    // timeout.
    assert!(d3d12::wait_on_fence_with_timeout(&fence, &event, 5, Duration::ZERO).unwrap());
    assert!(d3d12::wait_on_fence_with_timeout(&fence, &event, 1, Duration::ZERO).unwrap());
    // A value that was never signaled times out.
    assert!(!d3d12::wait_on_fence_with_timeout(&fence, &event, 6, Duration::from_millis(50)).unwrap());

    // The exported handle imports as the same timeline.
    let imported = d3d12::import_fence(&device, &handle).expect("fence import");
    assert_eq!(unsafe { imported.GetCompletedValue() }, 5);
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn d3d11_fence_shared_handle_round_trip() {
    init_logging();

    let adapter = factory::get_adapter_by_index(0, LOG_LEVEL).expect("adapter 0");
    let (device, context) = d3d11::create_device(Some(&adapter), LOG_LEVEL).expect("device");

    let (handle, fence) = d3d11::create_shared_fence(&device, false).expect("fence");
    let imported = d3d11::import_fence(&device, &handle).expect("fence import");

    unsafe { context.Signal(&fence, 3) }.unwrap();

    let event = skybridge_client::Event::create(false, false).expect("event");
    assert!(
        d3d11::wait_on_fence_with_timeout(&imported, &event, 3, Duration::from_secs(1)).unwrap()
    );
    assert_eq!(unsafe { imported.GetCompletedValue() }, 3);
}
