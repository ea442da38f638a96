//! Bridge-level tests driving the D3D11 client compositor against a mock
//! native compositor.
//!
//! The mock stands in for the service side of the IPC boundary: it accepts
//! imported swapchains, optionally hands out timeline-semaphore handles and
//! records every commit. Everything here needs a real Direct3D device and is
//! ignored by default; run with `cargo test -- --ignored` on a machine with
//! a GPU.

#![cfg(windows)]

use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use skybridge_client::{d3d11, d3d12, SyncMode};
use windows::{
    core::Interface,
    Win32::{
        Foundation,
        Graphics::{Direct3D, Direct3D11, Direct3D12, Dxgi},
        System::Threading,
    },
};

const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Trace;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct MockSwapchain {
    image_count: u32,
    next: AtomicU32,
}

impl xrt::Swapchain for MockSwapchain {
    fn image_count(&self) -> u32 {
        self.image_count
    }

    fn acquire_image(&self) -> Result<u32, xrt::Error> {
        Ok(self.next.fetch_add(1, Ordering::Relaxed) % self.image_count)
    }

    fn wait_image(&self, _timeout: Option<Duration>, _index: u32) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn release_image(&self, _index: u32) -> Result<(), xrt::Error> {
        Ok(())
    }
}

struct MockSemaphore;
impl xrt::CompositorSemaphore for MockSemaphore {}

enum SemaphoreMode {
    /// The native compositor has no semaphore entry points at all.
    Unsupported,
    /// Semaphore creation succeeds but the handle is not a fence, so the
    /// client-side import fails.
    BrokenHandle,
    /// Semaphore creation hands out a real shared fence created on this
    /// device.
    Real(Direct3D11::ID3D11Device5),
}

struct MockNative {
    info: xrt::CompositorInfo,
    semaphore_mode: SemaphoreMode,
    /// Fences backing handed-out semaphores, kept alive for the test.
    fences: Mutex<Vec<Direct3D11::ID3D11Fence>>,
    /// Handles of every imported swapchain image, index-aligned.
    imported: Mutex<Vec<OwnedHandle>>,
    /// One record per commit: frame id and the semaphore value, when the
    /// semaphore entry point was used.
    commits: Mutex<Vec<(i64, Option<u64>)>>,
}

unsafe impl Send for MockNative {}
unsafe impl Sync for MockNative {}

impl MockNative {
    fn new(semaphore_mode: SemaphoreMode) -> Arc<Self> {
        let mut info = xrt::CompositorInfo::default();
        // sRGB and linear color pairs plus one depth format, as wire codes.
        for wire in [43, 37, 50, 44, 97, 126] {
            info.formats.push(wire);
        }
        Arc::new(Self {
            info,
            semaphore_mode,
            fences: Mutex::new(Vec::new()),
            imported: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
        })
    }

    fn commits(&self) -> Vec<(i64, Option<u64>)> {
        self.commits.lock().unwrap().clone()
    }

    fn imported_handle(&self, index: usize) -> OwnedHandle {
        self.imported.lock().unwrap()[index]
            .try_clone()
            .expect("duplicate imported handle")
    }
}

impl xrt::NativeCompositor for MockNative {
    fn info(&self) -> &xrt::CompositorInfo {
        &self.info
    }

    fn get_swapchain_create_properties(
        &self,
        _info: &xrt::SwapchainCreateInfo,
    ) -> Result<xrt::SwapchainCreateProperties, xrt::Error> {
        Ok(xrt::SwapchainCreateProperties {
            image_count: 3,
            extra_usage: xrt::SwapchainUsage::empty(),
        })
    }

    fn import_swapchain(
        &self,
        _info: &xrt::SwapchainCreateInfo,
        images: Vec<xrt::NativeImage>,
    ) -> Result<Arc<dyn xrt::Swapchain>, xrt::Error> {
        let image_count = images.len() as u32;
        let mut imported = self.imported.lock().unwrap();
        imported.clear();
        imported.extend(images.into_iter().map(|image| image.buffer));
        Ok(Arc::new(MockSwapchain {
            image_count,
            next: AtomicU32::new(0),
        }))
    }

    fn supports_timeline_semaphores(&self) -> bool {
        !matches!(self.semaphore_mode, SemaphoreMode::Unsupported)
    }

    fn create_semaphore(
        &self,
    ) -> Result<(xrt::GraphicsSyncHandle, Arc<dyn xrt::CompositorSemaphore>), xrt::Error> {
        match &self.semaphore_mode {
            SemaphoreMode::Unsupported => Err(xrt::Error::Unsupported),
            SemaphoreMode::BrokenHandle => {
                // An event handle is a perfectly valid NT handle that is not
                // a fence; OpenSharedFence rejects it.
                let raw = unsafe { Threading::CreateEventA(None, false, false, None) }
                    .map_err(|_| xrt::Error::Allocation)?;
                let handle = unsafe { OwnedHandle::from_raw_handle(raw.0) };
                Ok((handle, Arc::new(MockSemaphore)))
            }
            SemaphoreMode::Real(device) => {
                let (handle, fence) = d3d11::create_shared_fence(device, false)?;
                self.fences.lock().unwrap().push(fence);
                Ok((handle, Arc::new(MockSemaphore)))
            }
        }
    }

    fn begin_session(&self, _view_type: xrt::ViewType) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn end_session(&self) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn wait_frame(&self) -> Result<xrt::FrameTiming, xrt::Error> {
        Ok(xrt::FrameTiming {
            frame_id: 1,
            predicted_display_time_ns: 0,
            predicted_display_period_ns: 11_111_111,
        })
    }

    fn begin_frame(&self, _frame_id: i64) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn discard_frame(&self, _frame_id: i64) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn layer_begin(
        &self,
        _frame_id: i64,
        _display_time_ns: u64,
        _env_blend_mode: xrt::BlendMode,
    ) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn layer_projection(
        &self,
        _left: &Arc<dyn xrt::Swapchain>,
        _right: &Arc<dyn xrt::Swapchain>,
        _data: &xrt::ProjectionLayer,
    ) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn layer_projection_depth(
        &self,
        _left: &Arc<dyn xrt::Swapchain>,
        _right: &Arc<dyn xrt::Swapchain>,
        _left_depth: &Arc<dyn xrt::Swapchain>,
        _right_depth: &Arc<dyn xrt::Swapchain>,
        _data: &xrt::ProjectionDepthLayer,
    ) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn layer_quad(
        &self,
        _sc: &Arc<dyn xrt::Swapchain>,
        _data: &xrt::QuadLayer,
    ) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn layer_cube(
        &self,
        _sc: &Arc<dyn xrt::Swapchain>,
        _data: &xrt::CubeLayer,
    ) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn layer_cylinder(
        &self,
        _sc: &Arc<dyn xrt::Swapchain>,
        _data: &xrt::CylinderLayer,
    ) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn layer_equirect1(
        &self,
        _sc: &Arc<dyn xrt::Swapchain>,
        _data: &xrt::Equirect1Layer,
    ) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn layer_equirect2(
        &self,
        _sc: &Arc<dyn xrt::Swapchain>,
        _data: &xrt::Equirect2Layer,
    ) -> Result<(), xrt::Error> {
        Ok(())
    }

    fn layer_commit(
        &self,
        frame_id: i64,
        _sync_handle: Option<xrt::GraphicsSyncHandle>,
    ) -> Result<(), xrt::Error> {
        self.commits.lock().unwrap().push((frame_id, None));
        Ok(())
    }

    fn layer_commit_with_semaphore(
        &self,
        frame_id: i64,
        _semaphore: &Arc<dyn xrt::CompositorSemaphore>,
        value: u64,
    ) -> Result<(), xrt::Error> {
        self.commits.lock().unwrap().push((frame_id, Some(value)));
        Ok(())
    }

    fn poll_events(&self) -> Result<xrt::CompositorEvent, xrt::Error> {
        Ok(xrt::CompositorEvent::None)
    }
}

fn app_device() -> Direct3D11::ID3D11Device {
    let (device, _context) = d3d11::create_device(None, LOG_LEVEL).expect("app device");
    device.cast::<Direct3D11::ID3D11Device>().unwrap()
}

fn color_create_info() -> xrt::SwapchainCreateInfo {
    xrt::SwapchainCreateInfo {
        bits: xrt::SwapchainUsage::COLOR | xrt::SwapchainUsage::SAMPLED,
        format: Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM.0 as i64,
        width: 256,
        height: 256,
        ..Default::default()
    }
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn semaphore_import_failure_falls_back_to_local_fence() {
    init_logging();

    // The native compositor offers a semaphore but its handle cannot be
    // imported as a fence; the bridge must abandon the whole path and land
    // on local blocking.
    let native = MockNative::new(SemaphoreMode::BrokenHandle);
    let compositor =
        d3d11::Compositor::new(native, &app_device(), d3d11::CompositorDescriptor::default())
            .expect("compositor");

    assert_eq!(compositor.sync_mode(), SyncMode::LocalFence);
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn imported_semaphore_commit_values_increase_by_one() {
    init_logging();

    let (device, _context) = d3d11::create_device(None, LOG_LEVEL).expect("mock device");
    let native = MockNative::new(SemaphoreMode::Real(device));
    let compositor = d3d11::Compositor::new(
        native.clone(),
        &app_device(),
        d3d11::CompositorDescriptor::default(),
    )
    .expect("compositor");

    assert_eq!(compositor.sync_mode(), SyncMode::ImportedSemaphore);

    use xrt::Compositor as _;
    for frame_id in 10..13 {
        compositor.layer_commit(frame_id, None).expect("commit");
    }

    // The negotiation probe signaled 1; commits continue 2, 3, 4 through the
    // semaphore entry point.
    let commits = native.commits();
    assert_eq!(
        commits,
        vec![(10, Some(2)), (11, Some(3)), (12, Some(4))]
    );
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn local_fence_commit_values_start_at_one() {
    init_logging();

    let native = MockNative::new(SemaphoreMode::Unsupported);
    let compositor = d3d11::Compositor::new(
        native.clone(),
        &app_device(),
        d3d11::CompositorDescriptor::default(),
    )
    .expect("compositor");

    assert_eq!(compositor.sync_mode(), SyncMode::LocalFence);
    assert_eq!(compositor.signaled_value(), 0);

    use xrt::Compositor as _;
    let mut previous = 0;
    for frame_id in 0..3 {
        compositor.layer_commit(frame_id, None).expect("commit");
        let value = compositor.signaled_value();
        assert_eq!(value, previous + 1);
        previous = value;
    }

    // No commit used the semaphore entry point.
    assert!(native.commits().iter().all(|(_, value)| value.is_none()));
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn keyed_mutex_rejects_double_acquire_and_double_release() {
    init_logging();

    let native = MockNative::new(SemaphoreMode::Unsupported);
    let compositor = d3d11::Compositor::new(
        native,
        &app_device(),
        d3d11::CompositorDescriptor::default(),
    )
    .expect("compositor");

    use xrt::{Compositor as _, Swapchain as _};
    let swapchain = compositor.create_swapchain(&color_create_info()).expect("swapchain");
    assert_eq!(swapchain.image_count(), 3);
    assert_eq!(swapchain.images().len(), 3);

    let index = swapchain.acquire_image().expect("acquire");
    swapchain
        .wait_image(Some(Duration::from_secs(1)), index)
        .expect("wait");

    // Waiting again without a release is a contract violation, and the
    // tracked state is untouched by the failure.
    assert_eq!(
        swapchain.wait_image(Some(Duration::from_secs(1)), index).unwrap_err(),
        xrt::Error::NoImageAvailable
    );

    swapchain.release_image(index).expect("release");

    // Releasing again without a wait fails as well.
    assert_eq!(
        swapchain.release_image(index).unwrap_err(),
        xrt::Error::D3d
    );

    // The cycle works again after the failed calls.
    swapchain
        .wait_image(Some(Duration::from_secs(1)), index)
        .expect("wait after release");
    swapchain.release_image(index).expect("release after wait");
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn wait_image_reports_timeout_while_held_by_another_device() {
    init_logging();

    let native = MockNative::new(SemaphoreMode::Unsupported);
    let compositor = d3d11::Compositor::new(
        native.clone(),
        &app_device(),
        d3d11::CompositorDescriptor::default(),
    )
    .expect("compositor");

    use xrt::{Compositor as _, Swapchain as _};
    let swapchain = compositor.create_swapchain(&color_create_info()).expect("swapchain");

    // Open image 0 on an unrelated device, as the service compositor would,
    // and take the keyed mutex from there.
    let (other_device, _other_context) =
        d3d11::create_device(None, LOG_LEVEL).expect("other device");
    let handle = native.imported_handle(0);
    let other_view: Direct3D11::ID3D11Texture2D1 = unsafe {
        other_device.OpenSharedResource1(Foundation::HANDLE(handle.as_raw_handle()))
    }
    .expect("open on other device");
    let other_mutex = other_view.cast::<Dxgi::IDXGIKeyedMutex>().unwrap();
    unsafe { other_mutex.AcquireSync(0, 0) }.expect("other device acquires first");

    // The mutex is held elsewhere: a zero timeout expires without error and
    // without touching the tracked state.
    assert_eq!(
        swapchain.wait_image(Some(Duration::ZERO), 0).unwrap_err(),
        xrt::Error::Timeout
    );

    unsafe { other_mutex.ReleaseSync(0) }.expect("other device releases");

    // Now the acquire goes through.
    swapchain
        .wait_image(Some(Duration::from_secs(1)), 0)
        .expect("wait after contention");
    swapchain.release_image(0).expect("release");
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn create_swapchain_rejects_protected_content_and_bad_formats() {
    init_logging();

    let native = MockNative::new(SemaphoreMode::Unsupported);
    let compositor = d3d11::Compositor::new(
        native,
        &app_device(),
        d3d11::CompositorDescriptor::default(),
    )
    .expect("compositor");

    use xrt::Compositor as _;

    let mut protected = color_create_info();
    protected.create = xrt::SwapchainCreateFlags::PROTECTED_CONTENT;
    assert_eq!(
        compositor.create_swapchain(&protected).unwrap_err(),
        xrt::Error::SwapchainFlagValidButUnsupported
    );

    let mut unknown = color_create_info();
    unknown.format = Dxgi::Common::DXGI_FORMAT_UNKNOWN.0 as i64;
    assert_eq!(
        compositor.create_swapchain(&unknown).unwrap_err(),
        xrt::Error::SwapchainFormatUnsupported
    );
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn d3d12_bridge_swapchain_cycle_with_runtime_barriers() {
    init_logging();

    let mut device = None::<Direct3D12::ID3D12Device>;
    unsafe {
        Direct3D12::D3D12CreateDevice(
            None::<&Dxgi::IDXGIAdapter>,
            Direct3D::D3D_FEATURE_LEVEL_11_0,
            &mut device,
        )
    }
    .expect("D3D12CreateDevice");
    let device = device.unwrap();
    let queue: Direct3D12::ID3D12CommandQueue = unsafe {
        device.CreateCommandQueue(&Direct3D12::D3D12_COMMAND_QUEUE_DESC {
            Type: Direct3D12::D3D12_COMMAND_LIST_TYPE_DIRECT,
            ..Default::default()
        })
    }
    .expect("command queue");

    let native = MockNative::new(SemaphoreMode::Unsupported);
    let compositor = d3d12::Compositor::new(
        native,
        &device,
        &queue,
        d3d12::CompositorDescriptor {
            use_runtime_barriers: true,
            ..Default::default()
        },
    )
    .expect("compositor");

    assert_eq!(compositor.sync_mode(), SyncMode::LocalFence);

    use xrt::{Compositor as _, Swapchain as _};
    let swapchain = compositor.create_swapchain(&color_create_info()).expect("swapchain");
    assert_eq!(swapchain.images().len(), 3);

    // Two full cycles exercise both barrier directions and the state
    // tracker.
    for _ in 0..2 {
        let index = swapchain.acquire_image().expect("acquire");
        swapchain
            .wait_image(Some(Duration::from_secs(1)), index)
            .expect("wait");
        swapchain.release_image(index).expect("release");
    }

    compositor.layer_commit(1, None).expect("commit");
    assert_eq!(compositor.signaled_value(), 1);
}

#[test]
#[ignore = "requires a Direct3D capable GPU"]
fn advertised_formats_exclude_depth_unless_allowed() {
    init_logging();

    let depth_format = Dxgi::Common::DXGI_FORMAT_D32_FLOAT.0 as i64;

    let native = MockNative::new(SemaphoreMode::Unsupported);
    let compositor = d3d11::Compositor::new(
        native.clone(),
        &app_device(),
        d3d11::CompositorDescriptor::default(),
    )
    .expect("compositor");
    use xrt::Compositor as _;
    assert!(!compositor.info().formats.is_empty());
    assert!(!compositor.info().formats.contains(&depth_format));

    let permissive = d3d11::Compositor::new(
        native,
        &app_device(),
        d3d11::CompositorDescriptor {
            allow_depth_formats: true,
            ..Default::default()
        },
    )
    .expect("compositor");
    assert!(permissive.info().formats.contains(&depth_format));
}
