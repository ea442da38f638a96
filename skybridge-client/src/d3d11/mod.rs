/*! D3D11 client compositor.
 *
 * Wraps the native compositor behind a D3D11 interface. Swapchain images are
 * allocated with a keyed mutex on a device owned by the bridge, re-opened on
 * the application's device from duplicated NT handles, and imported into the
 * native compositor from a third set of duplicates so all three owners hold
 * independent references.
 */

mod allocator;
mod device;
mod fence;

pub use allocator::allocate_shared_images;
pub use device::create_device;
pub use fence::{create_shared_fence, import_fence, wait_on_fence_with_timeout};

use std::{
    os::windows::io::OwnedHandle,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use windows::{core::Interface, Win32::Graphics::Direct3D11, Win32::Graphics::Dxgi};

use crate::auxil::dxgi::{conv, result::HResult as _};
use crate::common::{
    d3d_error, d3d_info, d3d_warn, duplicate_handle, import_from_handle_duplicates, raw_handle,
    Event, KeyedMutexCollection, FENCE_TIMEOUT,
};
use crate::SyncMode;

/// Construction-time configuration for [`Compositor`].
#[derive(Clone, Copy, Debug)]
pub struct CompositorDescriptor {
    /// Per-instance log verbosity.
    pub log_level: log::LevelFilter,
    /// Advertise depth/stencil formats to the application. Off by default;
    /// depth formats regularly fail cross-API validation on import.
    pub allow_depth_formats: bool,
}

impl Default for CompositorDescriptor {
    fn default() -> Self {
        Self {
            log_level: log::LevelFilter::Info,
            allow_depth_formats: false,
        }
    }
}

/// The synchronization primitive negotiated at construction. Exactly one
/// variant is active for the lifetime of the compositor.
enum SyncPath {
    /// A timeline semaphore created by the native compositor, imported here
    /// as a fence. The service waits GPU-side; we only signal.
    ImportedSemaphore {
        fence: Direct3D11::ID3D11Fence,
        semaphore: Arc<dyn xrt::CompositorSemaphore>,
    },
    /// A process-local fence. We block on it ourselves before committing.
    LocalFence {
        fence: Direct3D11::ID3D11Fence,
        event: Event,
    },
    /// Nothing worked; ordering relies on the native compositor alone.
    Unsynchronized,
}

/// Wraps the native compositor providing a D3D11 based interface.
pub struct Compositor {
    native: Arc<dyn xrt::NativeCompositor>,
    desc: CompositorDescriptor,
    /// Device we got from the app.
    app_device: Direct3D11::ID3D11Device5,
    /// Immediate context of `app_device`, also used to signal the fence.
    app_context: Direct3D11::ID3D11DeviceContext4,
    /// A similar device we created on the same adapter.
    comp_device: Direct3D11::ID3D11Device5,
    /// Immediate context of `comp_device`, kept alive with it.
    #[allow(unused)]
    comp_context: Direct3D11::ID3D11DeviceContext4,
    sync: SyncPath,
    /// The value most recently signaled on the fence.
    fence_value: AtomicU64,
    info: xrt::CompositorInfo,
}

unsafe impl Send for Compositor {}
unsafe impl Sync for Compositor {}

fn init_try_timeline_semaphore(
    native: &dyn xrt::NativeCompositor,
    app_device: &Direct3D11::ID3D11Device5,
    app_context: &Direct3D11::ID3D11DeviceContext4,
    log_level: log::LevelFilter,
) -> Option<(Direct3D11::ID3D11Fence, Arc<dyn xrt::CompositorSemaphore>)> {
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

    let fence = match fence::import_fence(app_device, &handle) {
        Ok(fence) => fence,
        Err(_) => {
            d3d_warn!(
                log_level,
                "The graphics driver does not support importing the native compositor's \
                 semaphores into D3D11, falling back to local blocking"
            );
            return None;
        }
    };
    // The probe signal consumes counter value 1; commits continue from 2.
    if let Err(err) = unsafe { app_context.Signal(&fence, 1) } {
        d3d_warn!(
            log_level,
            "The graphics driver cannot signal the native compositor's semaphore from D3D11, \
             falling back to local blocking: {err}"
        );
        return None;
    }

    d3d_info!(log_level, "Imported a timeline semaphore and can signal it");
    Some((fence, semaphore))
}

fn init_try_internal_blocking(
    app_device: &Direct3D11::ID3D11Device5,
    log_level: log::LevelFilter,
) -> Option<(Direct3D11::ID3D11Fence, Event)> {
    let fence: Direct3D11::ID3D11Fence =
        match unsafe { app_device.CreateFence(0, Direct3D11::D3D11_FENCE_FLAG_NONE) } {
            Ok(fence) => fence,
            Err(err) => {
                d3d_warn!(
                    log_level,
                    "Cannot even create an ID3D11Fence for internal use: {err}"
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

    d3d_info!(log_level, "Created our own ID3D11Fence and will wait on it ourselves");
    Some((fence, event))
}

impl Compositor {
    /// Builds a D3D11 client compositor over `native` for an application
    /// rendering with `device`.
    ///
    /// Resolves the device's adapter, creates the bridge's own device on the
    /// same adapter, runs the one-time synchronization negotiation and
    /// filters the advertised format list.
    pub fn new(
        native: Arc<dyn xrt::NativeCompositor>,
        device: &Direct3D11::ID3D11Device,
        desc: CompositorDescriptor,
    ) -> Result<Self, xrt::Error> {
        profiling::scope!("d3d11::Compositor::new");

        let app_device = device.cast::<Direct3D11::ID3D11Device5>().map_err(|err| {
            log::error!("Could not get a D3D11.4 device from the application device: {err}");
            xrt::Error::D3d11
        })?;
        let mut context = None;
        unsafe { app_device.GetImmediateContext(&mut context) };
        let app_context = context
            .ok_or(xrt::Error::D3d11)?
            .cast::<Direct3D11::ID3D11DeviceContext4>()
            .into_device_result("ID3D11DeviceContext4")
            .map_err(|_| xrt::Error::D3d11)?;

        // Now, get an equivalent device of our own on the same adapter.
        let dxgi_device = app_device
            .cast::<Dxgi::IDXGIDevice>()
            .into_device_result("IDXGIDevice")
            .map_err(|_| xrt::Error::D3d11)?;
        let adapter = unsafe { dxgi_device.GetAdapter() }
            .into_device_result("IDXGIDevice::GetAdapter")
            .map_err(|_| xrt::Error::D3d11)?;
        let (comp_device, comp_context) = device::create_device(Some(&adapter), desc.log_level)?;

        let fence_value = AtomicU64::new(0);
        let sync = match init_try_timeline_semaphore(
            native.as_ref(),
            &app_device,
            &app_context,
            desc.log_level,
        ) {
            Some((fence, semaphore)) => {
                fence_value.store(1, Ordering::Release);
                SyncPath::ImportedSemaphore { fence, semaphore }
            }
            // The native compositor doesn't know about timeline semaphores,
            // or we can't import them; they are still usable entirely
            // internally.
            None => match init_try_internal_blocking(&app_device, desc.log_level) {
                Some((fence, event)) => SyncPath::LocalFence { fence, event },
                None => {
                    d3d_warn!(desc.log_level, "No sync mechanism for D3D11 was successful");
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
            app_device,
            app_context,
            comp_device,
            comp_context,
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

fn import_image(
    device: &Direct3D11::ID3D11Device5,
    handle: &OwnedHandle,
) -> Result<Direct3D11::ID3D11Texture2D1, xrt::Error> {
    unsafe { device.OpenSharedResource1(raw_handle(handle)) }
        .into_device_result("ID3D11Device1::OpenSharedResource1")
}

/// Wraps the native compositor swapchain providing D3D11 images.
pub struct Swapchain {
    /// Owning reference to the imported native swapchain.
    native: Arc<dyn xrt::Swapchain>,
    /// Images opened on the application's device, index-aligned with the
    /// native swapchain.
    images: Vec<Direct3D11::ID3D11Texture2D1>,
    keyed_mutexes: KeyedMutexCollection,
    /// Images on the bridge's device backing the shared memory; kept alive
    /// for the lifetime of the swapchain.
    #[allow(unused)]
    comp_images: Vec<Direct3D11::ID3D11Texture2D1>,
    /// The original shared handles, kept so late duplications stay possible.
    #[allow(unused)]
    handles: Vec<OwnedHandle>,
}

unsafe impl Send for Swapchain {}
unsafe impl Sync for Swapchain {}

impl Swapchain {
    /// The application-facing texture array, index-aligned with acquire
    /// indices. This is what the OpenXR state tracker hands to the
    /// application.
    pub fn images(&self) -> &[Direct3D11::ID3D11Texture2D1] {
        &self.images
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
        // The native compositor hands the image over first, then the keyed
        // mutex moves GPU-side ownership to the application's device.
        self.native.wait_image(timeout, index)?;
        self.keyed_mutexes.wait_keyed_mutex(index, timeout)
    }

    fn release_image(&self, index: u32) -> Result<(), xrt::Error> {
        self.native.release_image(index)?;
        self.keyed_mutexes.release_keyed_mutex(index)
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
        profiling::scope!("d3d11::Compositor::create_swapchain");

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

        // Allocate on our own device; the keyed mutex is what hands GPU-side
        // ownership back and forth afterwards.
        let (comp_images, handles) =
            allocator::allocate_shared_images(&self.comp_device, info, image_count, true)?;

        // Re-open every image on the app device from a duplicated handle, so
        // the app-side lifetime is independent of ours. The duplicate is
        // closed again in this same scope; the open call adds its own
        // reference to the underlying memory.
        let mut images = Vec::with_capacity(image_count);
        for handle in &handles {
            let duped = duplicate_handle(handle)?;
            images.push(import_image(&self.app_device, &duped)?);
        }

        let mut keyed_mutexes = KeyedMutexCollection::new(self.desc.log_level);
        keyed_mutexes.init(&images).map_err(|err| {
            d3d_error!(self.desc.log_level, "Error retrieving keyed mutex interfaces");
            err
        })?;

        // Import into the native compositor, creating the swapchain we wrap.
        // The native compositor gets duplicates as well and owns them from
        // there on.
        let native = import_from_handle_duplicates(
            self.native.as_ref(),
            &handles,
            &wire_info,
            false,
        )
        .map_err(|err| {
            d3d_error!(
                self.desc.log_level,
                "Error importing D3D11 swapchain into native compositor"
            );
            err
        })?;

        Ok(Arc::new(Swapchain {
            native,
            images,
            keyed_mutexes,
            comp_images,
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
        // No flip required: the D3D11 image convention matches the wire one.
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
                if let Err(err) = unsafe { self.app_context.Signal(fence, value) } {
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
                if let Err(err) = unsafe { self.app_context.Signal(fence, value) } {
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
