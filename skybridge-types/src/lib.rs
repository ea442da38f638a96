/*! Backend-agnostic types and interface contracts shared between the client
 *  compositor bridges and the native (service-side) compositor they wrap.
 *
 *  Nothing in this crate touches a graphics API. The client backends live in
 *  `skybridge-client`; the service side of [`NativeCompositor`] lives across
 *  an IPC boundary and is out of scope for this repository.
 */

#![warn(missing_docs, unsafe_op_in_unsafe_fn)]

use std::{sync::Arc, time::Duration};

use arrayvec::ArrayVec;
use bitflags::bitflags;
use thiserror::Error;

/// Upper bound on the number of formats a compositor advertises.
pub const MAX_SWAPCHAIN_FORMATS: usize = 8;

/// An API-neutral numeric pixel format code, as used on the wire between a
/// client compositor and the native compositor.
///
/// The values are the Vulkan `VkFormat` codes, which is what the native
/// compositor allocates and composites with. Client backends translate these
/// to and from their own API's formats and must reject any code that does not
/// round-trip losslessly.
pub type WireFormat = i64;

/// A locally-unique identifier for a physical GPU adapter.
///
/// Stable across API and process boundaries within one machine session; this
/// is what guarantees an application device and a compositor device land on
/// the same physical GPU so shared-handle import can succeed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Luid(pub u64);

impl Luid {
    /// Builds a LUID from the platform's low and high parts.
    pub fn from_parts(low_part: u32, high_part: i32) -> Self {
        Self(((high_part as u32 as u64) << 32) | low_part as u64)
    }

    /// The platform's low part.
    pub fn low_part(self) -> u32 {
        self.0 as u32
    }

    /// The platform's high part.
    pub fn high_part(self) -> i32 {
        (self.0 >> 32) as i32
    }
}

/// An OS-native shareable handle backing a GPU memory object.
///
/// Ownership is explicit: the creator owns the handle until it is duplicated
/// (`try_clone`) for a transfer, and every duplicate is closed when dropped.
/// Duplication and release are always paired across a handoff boundary.
#[cfg(windows)]
pub type GraphicsBufferHandle = std::os::windows::io::OwnedHandle;

/// An OS-native shareable handle backing a GPU memory object.
#[cfg(unix)]
pub type GraphicsBufferHandle = std::os::fd::OwnedFd;

/// An OS-native handle to a GPU synchronization primitive.
///
/// Passed across the compositor boundary as `Option`; `None` stands for the
/// platform's invalid sentinel and means "no synchronization requested".
pub type GraphicsSyncHandle = GraphicsBufferHandle;

bitflags! {
    /// How the application intends to use swapchain images.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SwapchainUsage: u32 {
        /// Render target with a color format.
        const COLOR = 1 << 0;
        /// Render target with a depth/stencil format.
        const DEPTH_STENCIL = 1 << 1;
        /// Unordered (storage) access.
        const UNORDERED_ACCESS = 1 << 2;
        /// Source of transfer operations.
        const TRANSFER_SRC = 1 << 3;
        /// Destination of transfer operations.
        const TRANSFER_DST = 1 << 4;
        /// Sampled in shaders.
        const SAMPLED = 1 << 5;
        /// Views of other formats may be created.
        const MUTABLE_FORMAT = 1 << 6;
        /// Input attachment usage.
        const INPUT_ATTACHMENT = 1 << 7;
    }
}

bitflags! {
    /// Creation-time swapchain flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SwapchainCreateFlags: u32 {
        /// The application will only ever submit the first acquired image.
        const STATIC_IMAGE = 1 << 0;
        /// Content must be protected from CPU readback.
        const PROTECTED_CONTENT = 1 << 1;
    }
}

/// Immutable description of a requested swapchain image set.
///
/// Produced once by the application layer and never mutated; consumed by both
/// the image allocator and the native compositor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    /// Creation flags.
    pub create: SwapchainCreateFlags,
    /// Usage bits.
    pub bits: SwapchainUsage,
    /// Pixel format code. API-specific on the client side, [`WireFormat`]
    /// when sent to the native compositor.
    pub format: i64,
    /// MSAA sample count.
    pub sample_count: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Number of faces, 6 for cube maps.
    pub face_count: u32,
    /// Array layer count.
    pub array_size: u32,
    /// Mip level count.
    pub mip_count: u32,
}

impl Default for SwapchainCreateInfo {
    fn default() -> Self {
        Self {
            create: SwapchainCreateFlags::empty(),
            bits: SwapchainUsage::COLOR,
            format: 0,
            sample_count: 1,
            width: 1,
            height: 1,
            face_count: 1,
            array_size: 1,
            mip_count: 1,
        }
    }
}

/// What the native compositor wants a swapchain created with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwapchainCreateProperties {
    /// Number of images to allocate.
    pub image_count: u32,
    /// Extra usage bits the native compositor needs OR'd in.
    pub extra_usage: SwapchainUsage,
}

/// One allocated swapchain image, ready for import into another device or
/// process.
///
/// Owns its handle; importing transfers that ownership to the receiver.
#[derive(Debug)]
pub struct NativeImage {
    /// The shareable handle backing the image memory.
    pub buffer: GraphicsBufferHandle,
    /// Size hint in bytes, 0 when unknown.
    pub size: u64,
    /// Whether the importer must use a dedicated allocation.
    pub use_dedicated_allocation: bool,
}

/// Timing information for one frame, predicted by the native compositor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameTiming {
    /// Identifier threaded through begin/discard/commit for this frame.
    pub frame_id: i64,
    /// Predicted display time in nanoseconds.
    pub predicted_display_time_ns: u64,
    /// Predicted display period in nanoseconds.
    pub predicted_display_period_ns: u64,
}

/// View configuration of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewType {
    /// Single view.
    Mono,
    /// Two views, left and right.
    Stereo,
}

/// How layers are blended with the environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    /// Fully opaque display.
    Opaque,
    /// Layer colors are added to the passthrough image.
    Additive,
    /// Alpha-blended with the passthrough image.
    AlphaBlend,
}

/// A rigid transform: orientation plus position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    /// Rotation.
    pub orientation: glam::Quat,
    /// Translation.
    pub position: glam::Vec3,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            orientation: glam::Quat::IDENTITY,
            position: glam::Vec3::ZERO,
        }
    }
}

/// A field of view as four half-angles in radians.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Fov {
    /// Angle towards the left.
    pub angle_left: f32,
    /// Angle towards the right.
    pub angle_right: f32,
    /// Angle upwards.
    pub angle_up: f32,
    /// Angle downwards.
    pub angle_down: f32,
}

/// An integer rectangle in image space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RectI {
    /// Top-left corner.
    pub offset: glam::IVec2,
    /// Width and height.
    pub extent: glam::UVec2,
}

/// The portion of a swapchain image a layer samples from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubImage {
    /// Rectangle within the image.
    pub rect: RectI,
    /// Array layer to sample.
    pub array_index: u32,
}

bitflags! {
    /// Per-layer composition flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct LayerFlags: u32 {
        /// Apply chromatic aberration correction.
        const CORRECT_CHROMATIC_ABERRATION = 1 << 0;
        /// Blend using the texture's alpha channel.
        const BLEND_TEXTURE_SOURCE_ALPHA = 1 << 1;
        /// Alpha is not premultiplied.
        const UNPREMULTIPLIED_ALPHA = 1 << 2;
    }
}

/// One eye's view of a projection layer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProjectionLayerView {
    /// Image region.
    pub sub: SubImage,
    /// View pose.
    pub pose: Pose,
    /// View field of view.
    pub fov: Fov,
}

/// A stereo projection layer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProjectionLayer {
    /// Composition flags.
    pub flags: LayerFlags,
    /// Left and right views.
    pub views: [ProjectionLayerView; 2],
}

/// Depth information attached to one eye of a projection layer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DepthLayerView {
    /// Image region of the depth swapchain.
    pub sub: SubImage,
    /// Minimum depth value in the swapchain.
    pub min_depth: f32,
    /// Maximum depth value in the swapchain.
    pub max_depth: f32,
    /// Near plane distance in meters.
    pub near_z: f32,
    /// Far plane distance in meters.
    pub far_z: f32,
}

/// A stereo projection layer with depth swapchains.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProjectionDepthLayer {
    /// The color projection data.
    pub proj: ProjectionLayer,
    /// Left and right depth views.
    pub depth: [DepthLayerView; 2],
}

/// A world-locked textured quad.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QuadLayer {
    /// Composition flags.
    pub flags: LayerFlags,
    /// Quad pose.
    pub pose: Pose,
    /// Image region.
    pub sub: SubImage,
    /// Quad size in meters.
    pub size: glam::Vec2,
}

/// A cube map layer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CubeLayer {
    /// Composition flags.
    pub flags: LayerFlags,
    /// Cube orientation.
    pub pose: Pose,
    /// Image region.
    pub sub: SubImage,
}

/// A cylinder section layer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CylinderLayer {
    /// Composition flags.
    pub flags: LayerFlags,
    /// Cylinder pose.
    pub pose: Pose,
    /// Image region.
    pub sub: SubImage,
    /// Cylinder radius in meters.
    pub radius: f32,
    /// Central angle of the visible section in radians.
    pub central_angle: f32,
    /// Width divided by height of the visible section.
    pub aspect_ratio: f32,
}

/// An equirectangular layer, first revision.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Equirect1Layer {
    /// Composition flags.
    pub flags: LayerFlags,
    /// Sphere pose.
    pub pose: Pose,
    /// Image region.
    pub sub: SubImage,
    /// Sphere radius in meters.
    pub radius: f32,
    /// UV scale.
    pub scale: glam::Vec2,
    /// UV bias.
    pub bias: glam::Vec2,
}

/// An equirectangular layer, second revision.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Equirect2Layer {
    /// Composition flags.
    pub flags: LayerFlags,
    /// Sphere pose.
    pub pose: Pose,
    /// Image region.
    pub sub: SubImage,
    /// Sphere radius in meters.
    pub radius: f32,
    /// Central horizontal angle in radians.
    pub central_horizontal_angle: f32,
    /// Upper vertical angle in radians.
    pub upper_vertical_angle: f32,
    /// Lower vertical angle in radians.
    pub lower_vertical_angle: f32,
}

/// Static properties a compositor advertises to its consumer.
#[derive(Clone, Debug, Default)]
pub struct CompositorInfo {
    /// Supported pixel formats, most preferred first. Client compositors
    /// advertise their own API's codes, the native compositor advertises
    /// [`WireFormat`] codes.
    pub formats: ArrayVec<i64, MAX_SWAPCHAIN_FORMATS>,
}

/// An event delivered through [`NativeCompositor::poll_events`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositorEvent {
    /// Nothing pending.
    None,
    /// Session visibility or focus changed.
    SessionStateChange {
        /// The session's layers are being shown.
        visible: bool,
        /// The session receives input.
        focused: bool,
    },
    /// Overlay interaction state changed.
    OverlayChange {
        /// The primary application is focused.
        primary_focused: bool,
    },
}

/// The typed error surface of the compositor interfaces.
///
/// No platform error ever crosses these interfaces raw; every native failure
/// is translated into one of these kinds at the public entry point where it
/// occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// Resource, image or fence creation failed.
    #[error("allocation failed")]
    Allocation,
    /// The requested pixel format has no valid mapping.
    #[error("swapchain format is not supported")]
    SwapchainFormatUnsupported,
    /// A recognized create flag is not supported by this backend.
    #[error("swapchain flag is valid but unsupported by this compositor")]
    SwapchainFlagValidButUnsupported,
    /// A bounded wait did not complete in time.
    ///
    /// This is a distinct non-fatal outcome, not a failure: no state has been
    /// torn down and the caller decides whether to retry or abandon.
    #[error("bounded wait timed out")]
    Timeout,
    /// The image at this index is already acquired.
    #[error("no image available")]
    NoImageAvailable,
    /// The native compositor does not implement the requested operation.
    #[error("operation not supported by the native compositor")]
    Unsupported,
    /// An otherwise-unclassified Direct3D failure.
    #[error("Direct3D error")]
    D3d,
    /// An otherwise-unclassified Direct3D 11 failure.
    #[error("Direct3D 11 error")]
    D3d11,
    /// An otherwise-unclassified Direct3D 12 failure.
    #[error("Direct3D 12 error")]
    D3d12,
}

/// Convenience result alias over [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A sequence of GPU images cycled by acquire/wait/release.
///
/// Per image index the legal call sequence from a single logical owner is
/// acquire, wait, use, release, strictly in that order. Implementations
/// detect double-acquire and double-release but do not provide cross-thread
/// mutual exclusion; callers serialize calls per swapchain themselves.
pub trait Swapchain: Send + Sync {
    /// Number of images in the swapchain.
    fn image_count(&self) -> u32;

    /// Acquires the next image index for rendering.
    fn acquire_image(&self) -> Result<u32>;

    /// Waits until the acquired image at `index` is ready for use.
    ///
    /// Blocks up to `timeout`, where `None` means indefinitely. Expiry
    /// reports [`Error::Timeout`] and leaves all state unchanged.
    fn wait_image(&self, timeout: Option<Duration>, index: u32) -> Result<()>;

    /// Releases the image at `index` back to the compositor.
    fn release_image(&self, index: u32) -> Result<()>;
}

/// A timeline semaphore owned by the native compositor.
///
/// Opaque to clients; a reference is held while imported copies of the
/// underlying primitive exist and passed back on commit.
pub trait CompositorSemaphore: Send + Sync {}

/// The native (service-side) compositor contract this crate's clients wrap.
///
/// Everything here executes synchronously on the calling thread; an
/// implementation typically marshals each call across an IPC boundary.
pub trait NativeCompositor: Send + Sync {
    /// Static properties, including the advertised [`WireFormat`] list.
    fn info(&self) -> &CompositorInfo;

    /// Asks how a swapchain for `info` should be created.
    fn get_swapchain_create_properties(
        &self,
        info: &SwapchainCreateInfo,
    ) -> Result<SwapchainCreateProperties>;

    /// Imports externally-allocated images as a swapchain.
    ///
    /// Takes ownership of every handle in `images`, also on failure.
    fn import_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        images: Vec<NativeImage>,
    ) -> Result<Arc<dyn Swapchain>>;

    /// Whether [`create_semaphore`](Self::create_semaphore) and
    /// [`layer_commit_with_semaphore`](Self::layer_commit_with_semaphore)
    /// are implemented.
    fn supports_timeline_semaphores(&self) -> bool {
        false
    }

    /// Creates a timeline semaphore and a shareable handle to it.
    fn create_semaphore(&self) -> Result<(GraphicsSyncHandle, Arc<dyn CompositorSemaphore>)> {
        Err(Error::Unsupported)
    }

    /// Starts a session.
    fn begin_session(&self, view_type: ViewType) -> Result<()>;

    /// Ends the current session.
    fn end_session(&self) -> Result<()>;

    /// Blocks until the next frame should be started and predicts its timing.
    fn wait_frame(&self) -> Result<FrameTiming>;

    /// Marks the beginning of GPU work for a frame.
    fn begin_frame(&self, frame_id: i64) -> Result<()>;

    /// Abandons a frame without submitting layers.
    fn discard_frame(&self, frame_id: i64) -> Result<()>;

    /// Starts layer submission for a frame.
    fn layer_begin(&self, frame_id: i64, display_time_ns: u64, env_blend_mode: BlendMode)
        -> Result<()>;

    /// Submits a stereo projection layer.
    fn layer_projection(
        &self,
        left: &Arc<dyn Swapchain>,
        right: &Arc<dyn Swapchain>,
        data: &ProjectionLayer,
    ) -> Result<()>;

    /// Submits a stereo projection layer with depth.
    fn layer_projection_depth(
        &self,
        left: &Arc<dyn Swapchain>,
        right: &Arc<dyn Swapchain>,
        left_depth: &Arc<dyn Swapchain>,
        right_depth: &Arc<dyn Swapchain>,
        data: &ProjectionDepthLayer,
    ) -> Result<()>;

    /// Submits a quad layer.
    fn layer_quad(&self, sc: &Arc<dyn Swapchain>, data: &QuadLayer) -> Result<()>;

    /// Submits a cube layer.
    fn layer_cube(&self, sc: &Arc<dyn Swapchain>, data: &CubeLayer) -> Result<()>;

    /// Submits a cylinder layer.
    fn layer_cylinder(&self, sc: &Arc<dyn Swapchain>, data: &CylinderLayer) -> Result<()>;

    /// Submits an equirect layer, first revision.
    fn layer_equirect1(&self, sc: &Arc<dyn Swapchain>, data: &Equirect1Layer) -> Result<()>;

    /// Submits an equirect layer, second revision.
    fn layer_equirect2(&self, sc: &Arc<dyn Swapchain>, data: &Equirect2Layer) -> Result<()>;

    /// Commits the layers submitted for `frame_id`.
    ///
    /// `sync_handle` carries a GPU synchronization primitive the compositor
    /// must wait on before consuming the images, or `None` when the images
    /// are already safe to read.
    fn layer_commit(&self, frame_id: i64, sync_handle: Option<GraphicsSyncHandle>) -> Result<()>;

    /// Commits the layers for `frame_id`, ordering against `value` on a
    /// semaphore previously created by
    /// [`create_semaphore`](Self::create_semaphore).
    fn layer_commit_with_semaphore(
        &self,
        frame_id: i64,
        semaphore: &Arc<dyn CompositorSemaphore>,
        value: u64,
    ) -> Result<()> {
        let _ = (frame_id, semaphore, value);
        Err(Error::Unsupported)
    }

    /// Polls for a pending event.
    fn poll_events(&self) -> Result<CompositorEvent>;
}

/// The client-facing compositor contract implemented by the bridges in
/// `skybridge-client` and consumed by the OpenXR state tracker.
///
/// Mirrors [`NativeCompositor`] with the swapchain type made concrete, since
/// the state tracker needs the backend's typed image arrays.
pub trait Compositor {
    /// The backend's swapchain type.
    type Swapchain: Swapchain;

    /// Static properties, including the advertised client-API format list.
    fn info(&self) -> &CompositorInfo;

    /// Asks how a swapchain for `info` should be created.
    fn get_swapchain_create_properties(
        &self,
        info: &SwapchainCreateInfo,
    ) -> Result<SwapchainCreateProperties>;

    /// Creates a swapchain usable from the application's graphics device.
    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> Result<Arc<Self::Swapchain>>;

    /// Starts a session.
    fn begin_session(&self, view_type: ViewType) -> Result<()>;

    /// Ends the current session.
    fn end_session(&self) -> Result<()>;

    /// Blocks until the next frame should be started and predicts its timing.
    fn wait_frame(&self) -> Result<FrameTiming>;

    /// Marks the beginning of GPU work for a frame.
    fn begin_frame(&self, frame_id: i64) -> Result<()>;

    /// Abandons a frame without submitting layers.
    fn discard_frame(&self, frame_id: i64) -> Result<()>;

    /// Starts layer submission for a frame.
    fn layer_begin(&self, frame_id: i64, display_time_ns: u64, env_blend_mode: BlendMode)
        -> Result<()>;

    /// Submits a stereo projection layer.
    fn layer_projection(
        &self,
        left: &Self::Swapchain,
        right: &Self::Swapchain,
        data: &ProjectionLayer,
    ) -> Result<()>;

    /// Submits a stereo projection layer with depth.
    fn layer_projection_depth(
        &self,
        left: &Self::Swapchain,
        right: &Self::Swapchain,
        left_depth: &Self::Swapchain,
        right_depth: &Self::Swapchain,
        data: &ProjectionDepthLayer,
    ) -> Result<()>;

    /// Submits a quad layer.
    fn layer_quad(&self, sc: &Self::Swapchain, data: &QuadLayer) -> Result<()>;

    /// Submits a cube layer.
    fn layer_cube(&self, sc: &Self::Swapchain, data: &CubeLayer) -> Result<()>;

    /// Submits a cylinder layer.
    fn layer_cylinder(&self, sc: &Self::Swapchain, data: &CylinderLayer) -> Result<()>;

    /// Submits an equirect layer, first revision.
    fn layer_equirect1(&self, sc: &Self::Swapchain, data: &Equirect1Layer) -> Result<()>;

    /// Submits an equirect layer, second revision.
    fn layer_equirect2(&self, sc: &Self::Swapchain, data: &Equirect2Layer) -> Result<()>;

    /// Commits the layers submitted for `frame_id`.
    ///
    /// The bridge manufactures its own synchronization; callers must pass
    /// `None` for `sync_handle`.
    fn layer_commit(&self, frame_id: i64, sync_handle: Option<GraphicsSyncHandle>) -> Result<()>;

    /// Polls for a pending event.
    fn poll_events(&self) -> Result<CompositorEvent>;
}
