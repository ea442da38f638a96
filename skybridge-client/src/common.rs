//! Machinery shared by the client backends: per-instance log gating, RAII
//! wrappers for Win32 events and shared handles, the keyed-mutex ownership
//! collection, and native-compositor import helpers.

use std::{
    os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use windows::{
    core::{Free, Interface},
    Win32::{Foundation, Graphics::Direct3D11, Graphics::Dxgi, System::Threading},
};

use crate::auxil::dxgi::result::HResult as _;

/// Emits through the `log` facade when `level` clears the instance's
/// configured verbosity. The per-instance filter replaces the process-wide
/// environment toggles the log sink would otherwise be configured with.
macro_rules! d3d_log {
    ($filter:expr, $level:expr, $($arg:tt)+) => {
        if $level <= $filter {
            log::log!($level, $($arg)+);
        }
    };
}

macro_rules! d3d_trace {
    ($filter:expr, $($arg:tt)+) => { crate::common::d3d_log!($filter, log::Level::Trace, $($arg)+) };
}
macro_rules! d3d_debug {
    ($filter:expr, $($arg:tt)+) => { crate::common::d3d_log!($filter, log::Level::Debug, $($arg)+) };
}
macro_rules! d3d_info {
    ($filter:expr, $($arg:tt)+) => { crate::common::d3d_log!($filter, log::Level::Info, $($arg)+) };
}
macro_rules! d3d_warn {
    ($filter:expr, $($arg:tt)+) => { crate::common::d3d_log!($filter, log::Level::Warn, $($arg)+) };
}
macro_rules! d3d_error {
    ($filter:expr, $($arg:tt)+) => { crate::common::d3d_log!($filter, log::Level::Error, $($arg)+) };
}

pub(crate) use {d3d_debug, d3d_error, d3d_info, d3d_log, d3d_warn};

/// Bound on the local CPU fence wait before a commit proceeds unsynchronized.
pub(crate) const FENCE_TIMEOUT: Duration = Duration::from_millis(500);

/// Key used for every keyed-mutex handoff. 0 is special: it matches the
/// key the allocating device released with.
pub(crate) const KEYED_MUTEX_KEY: u64 = 0;

/// A dedicated Win32 event for CPU-side fence waits.
///
/// Each waiting thread needs its own; sharing one event across concurrent
/// waiters loses wakeups.
pub struct Event(pub Foundation::HANDLE);

impl Event {
    pub fn create(manual_reset: bool, initial_state: bool) -> Result<Self, xrt::Error> {
        Ok(Self(
            unsafe { Threading::CreateEventA(None, manual_reset, initial_state, None) }
                .into_device_result("CreateEventA")?,
        ))
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe { Foundation::HANDLE::free(&mut self.0) }
    }
}

unsafe impl Send for Event {}
unsafe impl Sync for Event {}

/// Converts a nanosecond-precision timeout to the millisecond granularity of
/// the platform wait primitives. `None` means block indefinitely.
pub(crate) fn timeout_to_ms(timeout: Option<Duration>) -> u32 {
    match timeout {
        None => Threading::INFINITE,
        Some(duration) => duration
            .as_millis()
            .min(u128::from(Threading::INFINITE - 1)) as u32,
    }
}

/// Takes ownership of a raw handle returned by a `CreateSharedHandle` call.
pub(crate) fn wrap_handle(handle: Foundation::HANDLE) -> OwnedHandle {
    unsafe { OwnedHandle::from_raw_handle(handle.0) }
}

/// Borrows an owned handle for a native call without giving up ownership.
pub(crate) fn raw_handle(handle: &OwnedHandle) -> Foundation::HANDLE {
    Foundation::HANDLE(handle.as_raw_handle())
}

/// Duplicates a shareable handle for a transfer. The duplicate must be
/// closed (dropped) by whoever ends up holding it.
pub(crate) fn duplicate_handle(handle: &OwnedHandle) -> Result<OwnedHandle, xrt::Error> {
    handle.try_clone().map_err(|err| {
        log::error!("Failed to duplicate shared handle: {err}");
        xrt::Error::Allocation
    })
}

/// Duplicates every image handle and imports the set into the native
/// compositor as a swapchain.
///
/// The duplicates are owned by the `NativeImage`s from the moment they are
/// created, so every failure path closes them in this same scope; the
/// originals in `handles` stay untouched with the caller.
pub(crate) fn import_from_handle_duplicates(
    native: &dyn xrt::NativeCompositor,
    handles: &[OwnedHandle],
    wire_info: &xrt::SwapchainCreateInfo,
    use_dedicated_allocation: bool,
) -> Result<Arc<dyn xrt::Swapchain>, xrt::Error> {
    let mut images = Vec::with_capacity(handles.len());
    for handle in handles {
        images.push(xrt::NativeImage {
            buffer: duplicate_handle(handle)?,
            size: 0,
            use_dedicated_allocation,
        });
    }
    native.import_swapchain(wire_info, images)
}

/// Per-swapchain-image keyed-mutex ownership tracking.
///
/// Keyed mutexes provide the GPU-level mutual exclusion needed when two
/// independent devices hold views of the same memory; this wrapper's job is
/// purely to stop the client from making double-acquire or double-release
/// mistakes that would corrupt the mutex's internal key counter. It does not
/// serialize concurrent callers; one session drives one swapchain
/// sequentially.
///
/// Per image index the state machine is
/// `Released -> (wait) -> Acquired -> (release) -> Released`.
pub(crate) struct KeyedMutexCollection {
    keyed_mutexes: Vec<Dxgi::IDXGIKeyedMutex>,
    acquired: Mutex<Vec<bool>>,
    log_level: log::LevelFilter,
}

unsafe impl Send for KeyedMutexCollection {}
unsafe impl Sync for KeyedMutexCollection {}

impl KeyedMutexCollection {
    pub fn new(log_level: log::LevelFilter) -> Self {
        Self {
            keyed_mutexes: Vec::new(),
            acquired: Mutex::new(Vec::new()),
            log_level,
        }
    }

    /// Caches one keyed-mutex interface per image, index-aligned with
    /// `images`.
    pub fn init(&mut self, images: &[Direct3D11::ID3D11Texture2D1]) -> Result<(), xrt::Error> {
        self.keyed_mutexes.clear();
        self.keyed_mutexes.reserve(images.len());
        for image in images {
            let mutex = image.cast::<Dxgi::IDXGIKeyedMutex>().map_err(|err| {
                log::error!("Error getting keyed mutex collection for swapchain: {err}");
                xrt::Error::D3d
            })?;
            self.keyed_mutexes.push(mutex);
        }
        *self.acquired.lock() = vec![false; images.len()];
        Ok(())
    }

    /// Acquires the keyed mutex for `index`, blocking up to `timeout`.
    ///
    /// Acquiring an index that is already acquired is a caller-contract
    /// violation and fails with [`xrt::Error::NoImageAvailable`] without
    /// touching the mutex.
    pub fn wait_keyed_mutex(
        &self,
        index: u32,
        timeout: Option<Duration>,
    ) -> Result<(), xrt::Error> {
        let mut acquired = self.acquired.lock();
        let slot = acquired.get_mut(index as usize).ok_or(xrt::Error::D3d)?;
        if *slot {
            d3d_warn!(
                self.log_level,
                "Will not acquire the keyed mutex for image {index}: it was already acquired"
            );
            return Err(xrt::Error::NoImageAvailable);
        }

        // AcquireSync reports timeout and abandonment through success-severity
        // HRESULTs, so the call goes through the vtable to keep the raw code.
        let mutex = &self.keyed_mutexes[index as usize];
        let hr = unsafe {
            (Interface::vtable(mutex).AcquireSync)(
                Interface::as_raw(mutex),
                KEYED_MUTEX_KEY,
                timeout_to_ms(timeout),
            )
        };
        if hr.0 as u32 == Foundation::WAIT_ABANDONED.0 {
            d3d_error!(
                self.log_level,
                "Could not acquire the keyed mutex for image {index} due to it being in an inconsistent state"
            );
            return Err(xrt::Error::D3d);
        }
        if hr.0 as u32 == Foundation::WAIT_TIMEOUT.0 {
            return Err(xrt::Error::Timeout);
        }
        if hr.is_err() {
            d3d_error!(
                self.log_level,
                "Could not acquire the keyed mutex for image {index}: {hr:?}"
            );
            return Err(xrt::Error::D3d);
        }
        *slot = true;
        d3d_trace!(self.log_level, "Acquired keyed mutex for image {index}");
        Ok(())
    }

    /// Releases the keyed mutex for `index`.
    ///
    /// Releasing an index that is not acquired fails without touching the
    /// mutex.
    pub fn release_keyed_mutex(&self, index: u32) -> Result<(), xrt::Error> {
        let mut acquired = self.acquired.lock();
        let slot = acquired.get_mut(index as usize).ok_or(xrt::Error::D3d)?;
        if !*slot {
            d3d_warn!(
                self.log_level,
                "Will not release the keyed mutex for image {index}: it was not acquired"
            );
            return Err(xrt::Error::D3d);
        }
        if let Err(err) = unsafe { self.keyed_mutexes[index as usize].ReleaseSync(KEYED_MUTEX_KEY) }
        {
            d3d_error!(
                self.log_level,
                "Could not release the keyed mutex for image {index}: {err}"
            );
            return Err(xrt::Error::D3d);
        }
        *slot = false;
        Ok(())
    }
}
