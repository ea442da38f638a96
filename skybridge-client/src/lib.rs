/*! Client compositor bridges.
 *
 * A client compositor adapts an application's graphics device to the native
 * (service-side) compositor behind [`xrt::NativeCompositor`]. The bridge owns
 * the application-side device, creates a matching device of its own on the
 * same physical adapter, and implements every compositor entry point as a
 * thin forwarding shim that inserts the three things the native compositor
 * cannot know about: pixel-format translation, shared-image import and
 * ownership handoff, and GPU/CPU synchronization across the process boundary.
 *
 * ## Backends
 *
 * - [`d3d11`]: images are allocated on the bridge's own device with a keyed
 *   mutex and re-opened on the application's device from duplicated NT
 *   handles.
 * - [`d3d12`]: images are allocated through the D3D11 allocator (the shared
 *   resource path used here requires it) and imported into D3D12, with
 *   optional pre-built resource-state barrier command lists per image.
 *
 * ## Synchronization
 *
 * At construction each bridge negotiates exactly one synchronization
 * strategy, reported by [`SyncMode`] and never changed afterwards: a timeline
 * semaphore created by the native compositor and imported as a local fence,
 * else a process-local fence the bridge blocks on itself before committing,
 * else nothing at all (a degraded mode that relies on the native
 * compositor's own serialization, logged as a warning).
 */

#![warn(unsafe_op_in_unsafe_fn)]

#[cfg(windows)]
pub mod auxil;
#[cfg(windows)]
mod common;
#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod d3d12;

#[cfg(windows)]
pub use common::Event;

/// Which synchronization strategy a client compositor negotiated at
/// construction time.
///
/// Decided once, before the first frame; the choice never changes for the
/// lifetime of the compositor instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// A timeline semaphore created by the native compositor was imported
    /// into the client API; the service waits on it GPU-side.
    ImportedSemaphore,
    /// A process-local fence; the client blocks on the CPU before every
    /// commit, bounded by a fixed 500 ms timeout.
    LocalFence,
    /// No synchronization primitive could be created. GPU work ordering
    /// relies solely on the native compositor's internal serialization.
    Unsynchronized,
}
