/*! D3D12 client compositor.
 *
 * Wraps the native compositor behind a D3D12 interface. Images are allocated
 * through the D3D11 allocator, because the shared-resource creation path
 * used here requires it, and imported into D3D12 from the same handles. The
 * keyed mutex still lives on the D3D11 side; D3D12 additionally tracks the
 * per-image resource state and can pre-build barrier command lists that move
 * images between the application state and the compositor state on acquire
 * and release.
 */

mod fence;
mod resource;

pub use fence::{create_shared_fence, import_fence, wait_on_fence_with_timeout};
pub use resource::{create_barrier_command_lists, import_image, usage_to_app_resource_state};

use std::{
    os::windows::io::OwnedHandle,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use windows::Win32::Graphics::{Direct3D11, Direct3D12, Dxgi};

use crate::auxil::dxgi::{conv, factory, result::HResult as _};
use crate::common::{
    d3d_error, d3d_info, d3d_warn, duplicate_handle, import_from_handle_duplicates,
    Event, KeyedMutexCollection, FENCE_TIMEOUT,
};
use crate::{d3d11, SyncMode};

/// Construction-time configuration for [`Compositor`].
#[derive(Clone, Copy, Debug)]
pub struct CompositorDescriptor {
    /// Per-instance log verbosity.
    pub log_level: log::LevelFilter,
    /// Advertise depth/stencil formats to the application. Off by default;
    /// depth formats regularly fail cross-API validation on import.
    pub allow_depth_formats: bool,
    /// Execute the pre-built barrier command lists on every acquire and
    /// release. Off by default; the keyed mutex alone orders cross-device
    /// access for the common usage states.
    pub use_runtime_barriers: bool,
    /// Transition freshly imported images from their D3D11 creation state
    /// into the application's expected usage state once at swapchain
    /// creation. On by default.
    pub apply_initial_resource_transition: bool,
}

impl Default for CompositorDescriptor {
    fn default() -> Self {
        Self {
            log_level: log::LevelFilter::Info,
            allow_depth_formats: false,
            use_runtime_barriers: false,
            apply_initial_resource_transition: true,
        }
    }
}

/// The synchronization primitive negotiated at construction. Exactly one
/// variant is active for the lifetime of the compositor.
enum SyncPath {
    /// A timeline semaphore created by the native compositor, imported here
    /// as a fence. The service waits GPU-side; we only signal.
    ImportedSemaphore {
        fence: Direct3D12::ID3D12Fence,
        semaphore: Arc<dyn xrt::CompositorSemaphore>,
    },
    /// A process-local fence. We block on it ourselves before committing.
    LocalFence {
        fence: Direct3D12::ID3D12Fence,
        event: Event,
    },
    /// Nothing worked; ordering relies on the native compositor alone.
    Unsynchronized,
}

/// Wraps the native compositor providing a D3D12 based interface.
pub struct Compositor {
    native: Arc<dyn xrt::NativeCompositor>,
    desc: CompositorDescriptor,
    /// Device we got from the app.
    device: Direct3D12::ID3D12Device,
    /// The application's command queue; barriers execute on it.
    app_queue: Direct3D12::ID3D12CommandQueue,
    /// Allocator backing the barrier command lists.
    command_allocator: Direct3D12::ID3D12CommandAllocator,
    /// D3D11 device on the same adapter, used for allocating images.
    d3d11_device: Direct3D11::ID3D11Device5,
    /// Immediate context of `d3d11_device`, kept alive with it.
    #[allow(unused)]
    d3d11_context: Direct3D11::ID3D11DeviceContext4,
    sync: SyncPath,
    /// The value most recently signaled on the fence.
    fence_value: AtomicU64,
    info: xrt::CompositorInfo,
}

unsafe impl Send for Compositor {}
unsafe impl Sync for Compositor {}

fn init_try_timeline_semaphore(
    native: &dyn xrt::NativeCompositor,
    device: &Direct3D12::ID3D12Device,
    log_level: log::LevelFilter,
) -> Option<(Direct3D12::ID3D12Fence, Arc<dyn xrt::CompositorSemaphore>)> {
    if !native.supports_timeline_semaphores() {
        return None;
    }
    let (handle, semaphore) = match native.create_semaphore() {
        Ok(pair) => pair,
        Err(err) => {
            d3d_warn!(
                log_level,
                "Native compositor tried but failed to create a timeline semaphore for us: {err}"
            );
            return None;
        }
    };
    d3d_info!(log_level, "Native compositor created a timeline semaphore for us");

    let fence1 = match fence::import_fence(device, &handle) {
        Ok(fence) => fence,
        Err(_) => {
            d3d_warn!(
                log_level,
                "The graphics driver does not support importing the native compositor's \
                 semaphores into D3D12, falling back to local blocking"
            );
            return None;
        }
    };
    let flags = unsafe { fence1.GetCreationFlags() };
    if flags.contains(Direct3D12::D3D12_FENCE_FLAG_NON_MONITORED) {
        d3d_warn!(
            log_level,
            "The graphics driver creates the native compositor's semaphores as non-monitored, \
             making them unusable in D3D12, falling back to local blocking"
        );
        return None;
    }

    let fence: Direct3D12::ID3D12Fence = fence1.into();
    // The probe signal consumes counter value 1; commits continue from 2.
    if let Err(err) = unsafe { fence.Signal(1) } {
        d3d_warn!(
            log_level,
            "The graphics driver cannot signal the native compositor's semaphore from D3D12, \
             falling back to local blocking: {err}"
        );
        return None;
    }

    d3d_info!(log_level, "Imported a timeline semaphore and can signal it");
    Some((fence, semaphore))
}

fn init_try_internal_blocking(
    device: &Direct3D12::ID3D12Device,
    log_level: log::LevelFilter,
) -> Option<(Direct3D12::ID3D12Fence, Event)> {
    let fence: Direct3D12::ID3D12Fence =
        match unsafe { device.CreateFence(0, Direct3D12::D3D12_FENCE_FLAG_NONE) } {
            Ok(fence) => fence,
            Err(err) => {
                d3d_warn!(
                    log_level,
                    "Cannot even create an ID3D12Fence for internal use: {err}"
                );
                return None;
            }
        };

    let event = match Event::create(false, false) {
        Ok(event) => event,
        Err(err) => {
            d3d_error!(
                log_level,
                "Error creating event for synchronization usage: {err}"
            );
            return None;
        }
    };

    d3d_info!(log_level, "Created our own ID3D12Fence and will wait on it ourselves");
    Some((fence, event))
}

impl Compositor {
    /// Builds a D3D12 client compositor over `native` for an application
    /// rendering with `device` and submitting on `queue`.
    ///
    /// Resolves a D3D11 device on the same adapter through the device LUID,
    /// runs the one-time synchronization negotiation and filters the
    /// advertised format list.
    pub fn new(
        native: Arc<dyn xrt::NativeCompositor>,
        device: &Direct3D12::ID3D12Device,
        queue: &Direct3D12::ID3D12CommandQueue,
        desc: CompositorDescriptor,
    ) -> Result<Self, xrt::Error> {
        profiling::scope!("d3d12::Compositor::new");

        let command_allocator: Direct3D12::ID3D12CommandAllocator = unsafe {
            device.CreateCommandAllocator(Direct3D12::D3D12_COMMAND_LIST_TYPE_DIRECT)
        }
        .into_device_result("ID3D12Device::CreateCommandAllocator")
        .map_err(|_| xrt::Error::D3d12)?;

        // Get a D3D11 device and context for the same underlying adapter.
        let luid = unsafe { device.GetAdapterLuid() };
        let adapter = factory::get_adapter_by_luid(
            xrt::Luid::from_parts(luid.LowPart, luid.HighPart),
            desc.log_level,
        )
        .ok_or_else(|| {
            d3d_error!(desc.log_level, "Error getting DXGI adapter");
            xrt::Error::D3d12
        })?;
        let (d3d11_device, d3d11_context) =
            d3d11::create_device(Some(&adapter), desc.log_level)?;

        let fence_value = AtomicU64::new(0);
        let sync = match init_try_timeline_semaphore(native.as_ref(), device, desc.log_level) {
            Some((fence, semaphore)) => {
                fence_value.store(1, Ordering::Release);
                SyncPath::ImportedSemaphore { fence, semaphore }
            }
            // The native compositor doesn't know about timeline semaphores,
            // or we can't import them; they are still usable entirely
            // internally.
            None => match init_try_internal_blocking(device, desc.log_level) {
                Some((fence, event)) => SyncPath::LocalFence { fence, event },
                None => {
                    d3d_warn!(desc.log_level, "No sync mechanism for D3D12 was successful");
                    SyncPath::Unsynchronized
                }
            },
        };

        // Passthrough of the native compositor's formats to the client.
        let mut info = xrt::CompositorInfo::default();
        for format in conv::filter_formats(&native.info().formats, desc.allow_depth_formats)
            .into_iter()
            .take(xrt::MAX_SWAPCHAIN_FORMATS)
        {
            info.formats.push(format.0 as i64);
        }

        Ok(Self {
            native,
            desc,
            device: device.clone(),
            app_queue: queue.clone(),
            command_allocator,
            d3d11_device,
            d3d11_context,
            sync,
            fence_value,
            info,
        })
    }

    /// Which synchronization strategy the construction-time negotiation
    /// settled on.
    pub fn sync_mode(&self) -> SyncMode {
        match self.sync {
            SyncPath::ImportedSemaphore { .. } => SyncMode::ImportedSemaphore,
            SyncPath::LocalFence { .. } => SyncMode::LocalFence,
            SyncPath::Unsynchronized => SyncMode::Unsynchronized,
        }
    }

    /// The counter value most recently signaled on the negotiated fence.
    /// Strictly increases by one per commit.
    pub fn signaled_value(&self) -> u64 {
        self.fence_value.load(Ordering::Acquire)
    }
}

struct BarrierLists {
    /// Per image, transitions compositor state to application state.
    to_app: Vec<Direct3D12::ID3D12CommandList>,
    /// Per image, transitions application state to compositor state.
    to_compositor: Vec<Direct3D12::ID3D12CommandList>,
}

/// Wraps the native compositor swapchain providing D3D12 images.
pub struct Swapchain {
    /// Owning reference to the imported native swapchain.
    native: Arc<dyn xrt::Swapchain>,
    /// D3D12 images imported from the shared handles, index-aligned with the
    /// native swapchain.
    images: Vec<Direct3D12::ID3D12Resource>,
    keyed_mutexes: KeyedMutexCollection,
    /// Queue the barrier command lists execute on.
    queue: Direct3D12::ID3D12CommandQueue,
    log_level: log::LevelFilter,
    /// State we hand the image over to the application in, and expect it
    /// back in.
    app_state: Direct3D12::D3D12_RESOURCE_STATES,
    /// State the compositor wants the image in before use.
    compositor_state: Direct3D12::D3D12_RESOURCE_STATES,
    /// Pre-built barrier command lists, present when runtime barriers are
    /// enabled.
    barriers: Option<BarrierLists>,
    /// Tracked state per image index.
    state: Mutex<Vec<Direct3D12::D3D12_RESOURCE_STATES>>,
    /// The D3D11 images backing the shared memory; the keyed mutexes live on
    /// these.
    #[allow(unused)]
    d3d11_images: Vec<Direct3D11::ID3D11Texture2D1>,
    /// The original shared handles, kept so late duplications stay possible.
    #[allow(unused)]
    handles: Vec<OwnedHandle>,
}

unsafe impl Send for Swapchain {}
unsafe impl Sync for Swapchain {}

impl Swapchain {
    /// The application-facing resource array, index-aligned with acquire
    /// indices. This is what the OpenXR state tracker hands to the
    /// application.
    pub fn images(&self) -> &[Direct3D12::ID3D12Resource] {
        &self.images
    }

    fn barrier_to_app(&self, index: usize) -> Result<(), xrt::Error> {
        let Some(barriers) = &self.barriers else {
            // We have decided not to use barriers here.
            return Ok(());
        };
        let mut state = self.state.lock();
        if state[index] == self.app_state {
            d3d_info!(self.log_level, "Image {index} is already in the right state");
            return Ok(());
        }
        if state[index] == self.compositor_state {
            d3d_info!(self.log_level, "Acquiring image {index}");
            unsafe {
                self.queue
                    .ExecuteCommandLists(&[Some(barriers.to_app[index].clone())]);
            }
            state[index] = self.app_state;
            return Ok(());
        }
        d3d_warn!(self.log_level, "Image {index} is in an unknown state");
        Err(xrt::Error::D3d12)
    }

    fn barrier_to_compositor(&self, index: usize) -> Result<(), xrt::Error> {
        let Some(barriers) = &self.barriers else {
            return Ok(());
        };
        let mut state = self.state.lock();
        unsafe {
            self.queue
                .ExecuteCommandLists(&[Some(barriers.to_compositor[index].clone())]);
        }
        state[index] = self.compositor_state;
        Ok(())
    }
}

impl xrt::Swapchain for Swapchain {
    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn acquire_image(&self) -> Result<u32, xrt::Error> {
        // Pipe down into the imported swapchain in the native compositor.
        self.native.acquire_image()
    }

    fn wait_image(&self, timeout: Option<Duration>, index: u32) -> Result<(), xrt::Error> {
        // Native hand-over first, then the keyed mutex moves GPU-side
        // ownership, then the resource transitions into the app state. The
        // first failure short-circuits; later stages are skipped.
        self.native.wait_image(timeout, index)?;
        self.keyed_mutexes.wait_keyed_mutex(index, timeout)?;
        self.barrier_to_app(index as usize)
    }

    fn release_image(&self, index: u32) -> Result<(), xrt::Error> {
        self.native.release_image(index)?;
        self.keyed_mutexes.release_keyed_mutex(index)?;
        self.barrier_to_compositor(index as usize)
    }
}

impl xrt::Compositor for Compositor {
    type Swapchain = Swapchain;

    fn info(&self) -> &xrt::CompositorInfo {
        &self.info
    }

    fn get_swapchain_create_properties(
        &self,
        info: &xrt::SwapchainCreateInfo,
    ) -> Result<xrt::SwapchainCreateProperties, xrt::Error> {
        self.native.get_swapchain_create_properties(info)
    }

    fn create_swapchain(
        &self,
        info: &xrt::SwapchainCreateInfo,
    ) -> Result<Arc<Swapchain>, xrt::Error> {
        profiling::scope!("d3d12::Compositor::create_swapchain");

        let props = self.native.get_swapchain_create_properties(info).map_err(|err| {
            d3d_error!(self.desc.log_level, "Could not get properties for creating swapchain");
            err
        })?;
        let image_count = props.image_count as usize;

        if info.create.contains(xrt::SwapchainCreateFlags::PROTECTED_CONTENT) {
            d3d_warn!(
                self.desc.log_level,
                "Swapchain info is valid but this compositor doesn't support creating protected \
                 content swapchains"
            );
            return Err(xrt::Error::SwapchainFlagValidButUnsupported);
        }

        let format = Dxgi::Common::DXGI_FORMAT(info.format as u32);
        let Some(wire_format) = conv::dxgi_to_wire(format) else {
            d3d_error!(self.desc.log_level, "Invalid format {:?}", format);
            return Err(xrt::Error::SwapchainFormatUnsupported);
        };
        let mut wire_info = *info;
        wire_info.format = wire_format;

        // Make the images with D3D11; the shared-resource path used here
        // requires allocation to happen there.
        let (d3d11_images, handles) =
            d3d11::allocate_shared_images(&self.d3d11_device, info, image_count, true)?;

        // Import into D3D12 from duplicated handles, closed again in this
        // same scope.
        let mut images = Vec::with_capacity(image_count);
        for handle in &handles {
            let duped = duplicate_handle(handle)?;
            images.push(resource::import_image(&self.device, &duped)?);
        }

        let app_state = resource::usage_to_app_resource_state(info.bits);
        let compositor_state = Direct3D12::D3D12_RESOURCE_STATE_COMMON;

        // Transition everything from the D3D11 creation state to the state
        // the application expects to receive images in.
        if self.desc.apply_initial_resource_transition {
            d3d_info!(self.desc.log_level, "Executing initial barriers");
            let barriers: Vec<Direct3D12::D3D12_RESOURCE_BARRIER> = images
                .iter()
                .map(|image| {
                    resource::transition_barrier(
                        image,
                        Direct3D12::D3D12_RESOURCE_STATE_COMMON,
                        app_state,
                    )
                })
                .collect();
            let list: Direct3D12::ID3D12GraphicsCommandList = unsafe {
                self.device.CreateCommandList(
                    0,
                    Direct3D12::D3D12_COMMAND_LIST_TYPE_DIRECT,
                    &self.command_allocator,
                    None,
                )
            }
            .into_device_result("ID3D12Device::CreateCommandList")
            .map_err(|_| xrt::Error::D3d12)?;
            unsafe {
                list.ResourceBarrier(&barriers);
                list.Close()
            }
            .into_device_result("ID3D12GraphicsCommandList::Close")
            .map_err(|_| xrt::Error::D3d12)?;
            unsafe {
                self.app_queue.ExecuteCommandLists(&[Some(list.into())]);
            }
        }

        let barriers = if self.desc.use_runtime_barriers {
            d3d_info!(self.desc.log_level, "Will use barriers at runtime");
            let mut to_app = Vec::with_capacity(image_count);
            let mut to_compositor = Vec::with_capacity(image_count);
            for (i, image) in images.iter().enumerate() {
                d3d_info!(self.desc.log_level, "Creating command lists for image {i}");
                let (a, c) = resource::create_barrier_command_lists(
                    &self.device,
                    &self.command_allocator,
                    image,
                    info.bits,
                )
                .map_err(|err| {
                    d3d_error!(self.desc.log_level, "Error creating command lists for image {i}");
                    err
                })?;
                to_app.push(a);
                to_compositor.push(c);
            }
            Some(BarrierLists { to_app, to_compositor })
        } else {
            None
        };

        let mut keyed_mutexes = KeyedMutexCollection::new(self.desc.log_level);
        keyed_mutexes.init(&d3d11_images).map_err(|err| {
            d3d_error!(self.desc.log_level, "Error retrieving keyed mutex interfaces");
            err
        })?;

        // Import into the native compositor, creating the swapchain we wrap.
        let native = import_from_handle_duplicates(
            self.native.as_ref(),
            &handles,
            &wire_info,
            false,
        )
        .map_err(|err| {
            d3d_error!(
                self.desc.log_level,
                "Error importing D3D12 swapchain into native compositor"
            );
            err
        })?;

        Ok(Arc::new(Swapchain {
            native,
            images,
            keyed_mutexes,
            queue: self.app_queue.clone(),
            log_level: self.desc.log_level,
            app_state,
            compositor_state,
            barriers,
            state: Mutex::new(vec![app_state; image_count]),
            d3d11_images,
            handles,
        }))
    }

    fn begin_session(&self, view_type: xrt::ViewType) -> Result<(), xrt::Error> {
        self.native.begin_session(view_type)
    }

    fn end_session(&self) -> Result<(), xrt::Error> {
        self.native.end_session()
    }

    fn wait_frame(&self) -> Result<xrt::FrameTiming, xrt::Error> {
        self.native.wait_frame()
    }

    fn begin_frame(&self, frame_id: i64) -> Result<(), xrt::Error> {
        self.native.begin_frame(frame_id)
    }

    fn discard_frame(&self, frame_id: i64) -> Result<(), xrt::Error> {
        self.native.discard_frame(frame_id)
    }

    fn layer_begin(
        &self,
        frame_id: i64,
        display_time_ns: u64,
        env_blend_mode: xrt::BlendMode,
    ) -> Result<(), xrt::Error> {
        self.native.layer_begin(frame_id, display_time_ns, env_blend_mode)
    }

    fn layer_projection(
        &self,
        left: &Swapchain,
        right: &Swapchain,
        data: &xrt::ProjectionLayer,
    ) -> Result<(), xrt::Error> {
        // No flip required: the D3D12 image convention matches the wire one.
        self.native.layer_projection(&left.native, &right.native, data)
    }

    fn layer_projection_depth(
        &self,
        left: &Swapchain,
        right: &Swapchain,
        left_depth: &Swapchain,
        right_depth: &Swapchain,
        data: &xrt::ProjectionDepthLayer,
    ) -> Result<(), xrt::Error> {
        self.native.layer_projection_depth(
            &left.native,
            &right.native,
            &left_depth.native,
            &right_depth.native,
            data,
        )
    }

    fn layer_quad(&self, sc: &Swapchain, data: &xrt::QuadLayer) -> Result<(), xrt::Error> {
        self.native.layer_quad(&sc.native, data)
    }

    fn layer_cube(&self, sc: &Swapchain, data: &xrt::CubeLayer) -> Result<(), xrt::Error> {
        self.native.layer_cube(&sc.native, data)
    }

    fn layer_cylinder(&self, sc: &Swapchain, data: &xrt::CylinderLayer) -> Result<(), xrt::Error> {
        self.native.layer_cylinder(&sc.native, data)
    }

    fn layer_equirect1(&self, sc: &Swapchain, data: &xrt::Equirect1Layer) -> Result<(), xrt::Error> {
        self.native.layer_equirect1(&sc.native, data)
    }

    fn layer_equirect2(&self, sc: &Swapchain, data: &xrt::Equirect2Layer) -> Result<(), xrt::Error> {
        self.native.layer_equirect2(&sc.native, data)
    }

    fn layer_commit(
        &self,
        frame_id: i64,
        sync_handle: Option<xrt::GraphicsSyncHandle>,
    ) -> Result<(), xrt::Error> {
        // We make the sync primitive, not the state tracker above us.
        assert!(
            sync_handle.is_none(),
            "the client compositor manufactures sync handles; callers must pass None"
        );

        match &self.sync {
            SyncPath::ImportedSemaphore { fence, semaphore } => {
                let value = self.fence_value.fetch_add(1, Ordering::AcqRel) + 1;
                if let Err(err) = unsafe { fence.Signal(value) } {
                    d3d_error!(self.desc.log_level, "Error signaling fence: {err}");
                    // Lossy but non-fatal; the frame proceeds unsynchronized.
                    return self.native.layer_commit(frame_id, None);
                }
                // The native compositor waits on the semaphore GPU-side
                // before consuming the images.
                self.native.layer_commit_with_semaphore(frame_id, semaphore, value)
            }
            SyncPath::LocalFence { fence, event } => {
                let value = self.fence_value.fetch_add(1, Ordering::AcqRel) + 1;
                if let Err(err) = unsafe { fence.Signal(value) } {
                    d3d_error!(self.desc.log_level, "Error signaling fence: {err}");
                    return self.native.layer_commit(frame_id, None);
                }
                // No cross-process GPU wait exists on this path; block here
                // so the application's GPU writes are complete before the
                // compositor reads the images.
                if !fence::wait_on_fence_with_timeout(fence, event, value, FENCE_TIMEOUT)? {
                    d3d_error!(
                        self.desc.log_level,
                        "Problem waiting on fence: timed out after {FENCE_TIMEOUT:?}"
                    );
                    return Err(xrt::Error::Timeout);
                }
                self.native.layer_commit(frame_id, None)
            }
            SyncPath::Unsynchronized => self.native.layer_commit(frame_id, None),
        }
    }

    fn poll_events(&self) -> Result<xrt::CompositorEvent, xrt::Error> {
        self.native.poll_events()
    }
}
