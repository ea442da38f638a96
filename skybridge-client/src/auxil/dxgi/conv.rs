//! Pixel format translation between the API-neutral wire codes used by the
//! native compositor and DXGI formats, plus the usage-bit conversions the
//! allocator needs.

use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT;
use windows::Win32::Graphics::{Direct3D11, Dxgi};

/// Maps a wire format code to the DXGI format the client renders with.
///
/// Returns `None` for codes with no lossless DXGI equivalent.
pub fn wire_to_dxgi(format: xrt::WireFormat) -> Option<DXGI_FORMAT> {
    // The wire codes are VkFormat values, which is what the native
    // compositor allocates with.
    Some(match format {
        37 => Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM,
        43 => Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        44 => Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM,
        50 => Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
        64 => Dxgi::Common::DXGI_FORMAT_R10G10B10A2_UNORM,
        91 => Dxgi::Common::DXGI_FORMAT_R16G16B16A16_UNORM,
        97 => Dxgi::Common::DXGI_FORMAT_R16G16B16A16_FLOAT,
        109 => Dxgi::Common::DXGI_FORMAT_R32G32B32A32_FLOAT,
        124 => Dxgi::Common::DXGI_FORMAT_D16_UNORM,
        126 => Dxgi::Common::DXGI_FORMAT_D32_FLOAT,
        129 => Dxgi::Common::DXGI_FORMAT_D24_UNORM_S8_UINT,
        130 => Dxgi::Common::DXGI_FORMAT_D32_FLOAT_S8X24_UINT,
        _ => return None,
    })
}

/// Maps a DXGI format back to its wire code.
///
/// Inverse of [`wire_to_dxgi`]; a format is only usable for a swapchain when
/// it survives the round trip in both directions.
pub fn dxgi_to_wire(format: DXGI_FORMAT) -> Option<xrt::WireFormat> {
    Some(match format {
        Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM => 37,
        Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM_SRGB => 43,
        Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM => 44,
        Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM_SRGB => 50,
        Dxgi::Common::DXGI_FORMAT_R10G10B10A2_UNORM => 64,
        Dxgi::Common::DXGI_FORMAT_R16G16B16A16_UNORM => 91,
        Dxgi::Common::DXGI_FORMAT_R16G16B16A16_FLOAT => 97,
        Dxgi::Common::DXGI_FORMAT_R32G32B32A32_FLOAT => 109,
        Dxgi::Common::DXGI_FORMAT_D16_UNORM => 124,
        Dxgi::Common::DXGI_FORMAT_D32_FLOAT => 126,
        Dxgi::Common::DXGI_FORMAT_D24_UNORM_S8_UINT => 129,
        Dxgi::Common::DXGI_FORMAT_D32_FLOAT_S8X24_UINT => 130,
        _ => return None,
    })
}

/// Returns the distinct typeless variant of `format`.
///
/// Shared resources must be created typeless so both sides can view them;
/// `None` means the format has no typeless variant and cannot back a shared
/// swapchain image.
pub fn to_typeless(format: DXGI_FORMAT) -> Option<DXGI_FORMAT> {
    Some(match format {
        Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM
        | Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM_SRGB => {
            Dxgi::Common::DXGI_FORMAT_R8G8B8A8_TYPELESS
        }
        Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM
        | Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM_SRGB => {
            Dxgi::Common::DXGI_FORMAT_B8G8R8A8_TYPELESS
        }
        Dxgi::Common::DXGI_FORMAT_R10G10B10A2_UNORM => {
            Dxgi::Common::DXGI_FORMAT_R10G10B10A2_TYPELESS
        }
        Dxgi::Common::DXGI_FORMAT_R16G16B16A16_UNORM
        | Dxgi::Common::DXGI_FORMAT_R16G16B16A16_FLOAT => {
            Dxgi::Common::DXGI_FORMAT_R16G16B16A16_TYPELESS
        }
        Dxgi::Common::DXGI_FORMAT_R32G32B32A32_FLOAT => {
            Dxgi::Common::DXGI_FORMAT_R32G32B32A32_TYPELESS
        }
        Dxgi::Common::DXGI_FORMAT_D16_UNORM => Dxgi::Common::DXGI_FORMAT_R16_TYPELESS,
        Dxgi::Common::DXGI_FORMAT_D32_FLOAT => Dxgi::Common::DXGI_FORMAT_R32_TYPELESS,
        Dxgi::Common::DXGI_FORMAT_D24_UNORM_S8_UINT => Dxgi::Common::DXGI_FORMAT_R24G8_TYPELESS,
        Dxgi::Common::DXGI_FORMAT_D32_FLOAT_S8X24_UINT => {
            Dxgi::Common::DXGI_FORMAT_R32G8X24_TYPELESS
        }
        _ => return None,
    })
}

/// Whether `format` is a depth or depth/stencil format.
pub fn is_depth_stencil_format(format: DXGI_FORMAT) -> bool {
    matches!(
        format,
        Dxgi::Common::DXGI_FORMAT_D16_UNORM
            | Dxgi::Common::DXGI_FORMAT_D24_UNORM_S8_UINT
            | Dxgi::Common::DXGI_FORMAT_D32_FLOAT
            | Dxgi::Common::DXGI_FORMAT_D32_FLOAT_S8X24_UINT
    )
}

/// Translates swapchain usage bits into D3D11 bind flags.
pub fn usage_to_bind_flags(bits: xrt::SwapchainUsage) -> Direct3D11::D3D11_BIND_FLAG {
    let mut flags = Direct3D11::D3D11_BIND_FLAG(0);
    if bits.contains(xrt::SwapchainUsage::COLOR) {
        flags |= Direct3D11::D3D11_BIND_RENDER_TARGET;
    }
    if bits.contains(xrt::SwapchainUsage::DEPTH_STENCIL) {
        flags |= Direct3D11::D3D11_BIND_DEPTH_STENCIL;
    }
    if bits.contains(xrt::SwapchainUsage::UNORDERED_ACCESS) {
        flags |= Direct3D11::D3D11_BIND_UNORDERED_ACCESS;
    }
    if bits.contains(xrt::SwapchainUsage::SAMPLED) {
        flags |= Direct3D11::D3D11_BIND_SHADER_RESOURCE;
    }
    flags
}

/// Filters the native compositor's advertised wire formats down to the DXGI
/// formats a client compositor can actually share.
///
/// A format survives when it maps to DXGI, round-trips back to the same wire
/// code, has a distinct typeless variant, and is not a depth/stencil format
/// unless `allow_depth` is set. Depth formats are excluded by default to
/// avoid cross-API validation errors on import.
pub fn filter_formats(wire_formats: &[i64], allow_depth: bool) -> Vec<DXGI_FORMAT> {
    let mut formats = Vec::with_capacity(wire_formats.len());
    for &wire in wire_formats {
        let Some(format) = wire_to_dxgi(wire) else {
            continue;
        };
        if dxgi_to_wire(format).is_none() {
            continue;
        }
        if to_typeless(format).is_none() {
            continue;
        }
        if !allow_depth && is_depth_stencil_format(format) {
            continue;
        }
        formats.push(format);
    }
    formats
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_WIRE_FORMATS: [i64; 12] = [37, 43, 44, 50, 64, 91, 97, 109, 124, 126, 129, 130];

    #[test]
    fn wire_round_trip_is_lossless() {
        for wire in ALL_WIRE_FORMATS {
            let dxgi = wire_to_dxgi(wire).unwrap();
            assert_eq!(dxgi_to_wire(dxgi), Some(wire));
        }
        assert_eq!(wire_to_dxgi(0), None);
        assert_eq!(wire_to_dxgi(-1), None);
        assert_eq!(dxgi_to_wire(Dxgi::Common::DXGI_FORMAT_UNKNOWN), None);
    }

    #[test]
    fn typeless_variants_are_distinct() {
        for wire in ALL_WIRE_FORMATS {
            let dxgi = wire_to_dxgi(wire).unwrap();
            let typeless = to_typeless(dxgi).unwrap();
            assert_ne!(typeless, dxgi);
        }
        assert_eq!(to_typeless(Dxgi::Common::DXGI_FORMAT_R8G8B8A8_TYPELESS), None);
    }

    #[test]
    fn filter_excludes_depth_by_default() {
        let filtered = filter_formats(&ALL_WIRE_FORMATS, false);
        assert!(!filtered.is_empty());
        assert!(!filtered.iter().any(|&f| is_depth_stencil_format(f)));

        let with_depth = filter_formats(&ALL_WIRE_FORMATS, true);
        assert!(with_depth.iter().any(|&f| is_depth_stencil_format(f)));
        assert_eq!(with_depth.len(), ALL_WIRE_FORMATS.len());
    }

    #[test]
    fn filter_is_idempotent() {
        // Feeding the filter output back through the mappings reproduces it.
        for allow_depth in [false, true] {
            let once = filter_formats(&ALL_WIRE_FORMATS, allow_depth);
            let wire_again: Vec<i64> = once.iter().map(|&f| dxgi_to_wire(f).unwrap()).collect();
            let twice = filter_formats(&wire_again, allow_depth);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn filter_drops_unknown_codes() {
        assert!(filter_formats(&[0, 1, 2, i64::MAX], true).is_empty());
    }

    #[test]
    fn bind_flags_cover_requested_usage() {
        let flags = usage_to_bind_flags(xrt::SwapchainUsage::COLOR | xrt::SwapchainUsage::SAMPLED);
        assert_eq!(
            flags,
            Direct3D11::D3D11_BIND_RENDER_TARGET | Direct3D11::D3D11_BIND_SHADER_RESOURCE
        );
        let depth = usage_to_bind_flags(xrt::SwapchainUsage::DEPTH_STENCIL);
        assert_eq!(depth, Direct3D11::D3D11_BIND_DEPTH_STENCIL);
    }
}
