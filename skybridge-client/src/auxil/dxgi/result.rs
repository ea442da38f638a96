use windows::Win32::Foundation;

pub(crate) trait HResult<O> {
    /// Translates into the typed error surface without logging.
    fn into_result(self) -> Result<O, xrt::Error>;

    /// Translates into the typed error surface, logging `desc` on failure.
    fn into_device_result(self, desc: &str) -> Result<O, xrt::Error>;
}

impl<T> HResult<T> for windows::core::Result<T> {
    fn into_result(self) -> Result<T, xrt::Error> {
        self.map_err(map_error)
    }

    fn into_device_result(self, desc: &str) -> Result<T, xrt::Error> {
        self.map_err(|err| {
            log::error!("{desc} failed: {err}");
            map_error(err)
        })
    }
}

fn map_error(err: windows::core::Error) -> xrt::Error {
    match err.code() {
        Foundation::E_OUTOFMEMORY => xrt::Error::Allocation,
        _ => xrt::Error::D3d,
    }
}
