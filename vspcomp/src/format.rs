//! Pixel formats understood by the input and write-back ports.
//!
//! Only the mapping needed to program the pipeline lives here (V4L2 fourcc,
//! media-bus code, plane geometry). Colour conversion is done by the hardware.

/// `MEDIA_BUS_FMT_ARGB8888_1X32`
pub const MBUS_ARGB8888_1X32: u32 = 0x100d;
/// `MEDIA_BUS_FMT_AYUV8_1X32`
pub const MBUS_AYUV8_1X32: u32 = 0x2017;

/// The internal bus format of every unit downstream of the input ports.
pub const PIPELINE_MBUS_CODE: u32 = MBUS_ARGB8888_1X32;

pub const MAX_PLANES: usize = 2;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 32-bit ARGB, `B, G, R, A` in memory.
    Argb8888,
    /// 32-bit RGB with an unused alpha byte.
    Rgb32,
    /// 24-bit RGB, `B, G, R` in memory.
    Rgb24,
    /// 16-bit RGB 5:6:5.
    Rgb16,
    /// 16-bit ARGB 1:5:5:5.
    Argb1555,
    /// 16-bit RGB 5:5:5 with an unused bit.
    Rgb555,
    /// Packed 4:2:2, `Y0, U, Y1, V`.
    Yuy2,
    /// Packed 4:2:2, `U, Y0, V, Y1`.
    Uyvy,
    /// Two-plane 4:2:0 (`Y` + interleaved `UV`).
    Nv12,
    /// Two-plane 4:2:2 (`Y` + interleaved `UV`).
    Nv16,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 10] = [
        PixelFormat::Argb8888,
        PixelFormat::Rgb32,
        PixelFormat::Rgb24,
        PixelFormat::Rgb16,
        PixelFormat::Argb1555,
        PixelFormat::Rgb555,
        PixelFormat::Yuy2,
        PixelFormat::Uyvy,
        PixelFormat::Nv12,
        PixelFormat::Nv16,
    ];

    /// The multi-planar V4L2 fourcc.
    pub fn fourcc(self) -> u32 {
        match self {
            PixelFormat::Argb8888 => fourcc(b"AR24"),
            PixelFormat::Rgb32 => fourcc(b"XR24"),
            PixelFormat::Rgb24 => fourcc(b"BGR3"),
            PixelFormat::Rgb16 => fourcc(b"RGBP"),
            PixelFormat::Argb1555 => fourcc(b"AR15"),
            PixelFormat::Rgb555 => fourcc(b"XR15"),
            PixelFormat::Yuy2 => fourcc(b"YUYV"),
            PixelFormat::Uyvy => fourcc(b"UYVY"),
            PixelFormat::Nv12 => fourcc(b"NM12"),
            PixelFormat::Nv16 => fourcc(b"NM16"),
        }
    }

    /// The media-bus code an input port's sink pad must be set to.
    pub fn mbus_code(self) -> u32 {
        if self.is_yuv() {
            MBUS_AYUV8_1X32
        } else {
            MBUS_ARGB8888_1X32
        }
    }

    pub fn is_yuv(self) -> bool {
        match self {
            PixelFormat::Yuy2 | PixelFormat::Uyvy | PixelFormat::Nv12 | PixelFormat::Nv16 => true,
            _ => false,
        }
    }

    pub fn has_alpha(self) -> bool {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Argb1555 => true,
            _ => false,
        }
    }

    /// The format to read a surface as when its alpha channel must be
    /// ignored. The input port then substitutes the alpha control value.
    pub fn opaque_variant(self) -> Self {
        match self {
            PixelFormat::Argb8888 => PixelFormat::Rgb32,
            PixelFormat::Argb1555 => PixelFormat::Rgb555,
            x => x,
        }
    }

    pub fn num_planes(self) -> usize {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv16 => 2,
            _ => 1,
        }
    }

    /// Bytes per pixel of the first plane.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Rgb32 => 4,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgb16
            | PixelFormat::Argb1555
            | PixelFormat::Rgb555
            | PixelFormat::Yuy2
            | PixelFormat::Uyvy => 2,
            PixelFormat::Nv12 | PixelFormat::Nv16 => 1,
        }
    }

    /// The number of rows of plane `plane` for an image of height `height`.
    pub fn plane_rows(self, plane: usize, height: u32) -> u32 {
        match (self, plane) {
            (PixelFormat::Nv12, 1) => (height + 1) / 2,
            _ => height,
        }
    }

    /// The minimum pitch of plane `plane` for an image of width `width`.
    /// Both chroma planes used here interleave `U` and `V`, so their pitch
    /// equals the luma pitch.
    pub fn min_pitch(self, _plane: usize, width: u32) -> u32 {
        width * self.bytes_per_pixel()
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.iter().cloned().find(|f| f.fourcc() == code)
    }
}

/// Format a fourcc for log messages.
pub fn fourcc_str(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_roundtrip() {
        for &fmt in PixelFormat::ALL.iter() {
            assert_eq!(PixelFormat::from_fourcc(fmt.fourcc()), Some(fmt));
        }
        assert_eq!(fourcc_str(PixelFormat::Argb8888.fourcc()), "AR24");
        assert_eq!(fourcc_str(PixelFormat::Nv12.fourcc()), "NM12");
    }

    #[test]
    fn opaque_variants_drop_alpha() {
        for &fmt in PixelFormat::ALL.iter() {
            let opaque = fmt.opaque_variant();
            assert!(!opaque.has_alpha());
            assert_eq!(opaque.bytes_per_pixel(), fmt.bytes_per_pixel());
            assert_eq!(opaque.mbus_code(), fmt.mbus_code());
        }
    }

    #[test]
    fn nv12_chroma_rows() {
        assert_eq!(PixelFormat::Nv12.plane_rows(1, 33), 17);
        assert_eq!(PixelFormat::Nv16.plane_rows(1, 33), 33);
        assert_eq!(PixelFormat::Nv12.min_pitch(1, 64), 64);
    }
}
