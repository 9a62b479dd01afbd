//! Kernel ABI definitions (media controller, V4L2, DMA heaps).
//!
//! The layouts match the LP64 kernel headers.
#![allow(non_camel_case_types)]
use std::{io, mem::size_of, os::unix::io::RawFd};

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

const fn iowr<T>(ty: u8, nr: u8) -> u32 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size_of::<T>())
}

const fn iow<T>(ty: u8, nr: u8) -> u32 {
    ioc(IOC_WRITE, ty, nr, size_of::<T>())
}

const fn ior<T>(ty: u8, nr: u8) -> u32 {
    ioc(IOC_READ, ty, nr, size_of::<T>())
}

/// Call `ioctl(2)`, retrying on `EINTR`.
///
/// # Safety
///
/// `arg` must be the argument type `request` expects.
pub unsafe fn ioctl<T>(fd: RawFd, request: u32, arg: &mut T) -> io::Result<()> {
    loop {
        if libc::ioctl(fd, request as _, arg as *mut T) >= 0 {
            return Ok(());
        }
        let e = io::Error::last_os_error();
        if e.kind() != io::ErrorKind::Interrupted {
            return Err(e);
        }
    }
}

/// Extract a NUL-terminated string from a fixed-size field.
pub fn c_str(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

// ---------------------------------------------------------------------------
// Media controller

#[repr(C)]
#[derive(Clone, Copy)]
pub struct media_device_info {
    pub driver: [u8; 16],
    pub model: [u8; 32],
    pub serial: [u8; 40],
    pub bus_info: [u8; 32],
    pub media_version: u32,
    pub hw_revision: u32,
    pub driver_version: u32,
    pub reserved: [u32; 31],
}

pub const MEDIA_ENT_ID_FLAG_NEXT: u32 = 1 << 31;

pub const MEDIA_ENT_T_DEVNODE: u32 = 1 << 16;
pub const MEDIA_ENT_T_V4L2_SUBDEV: u32 = 2 << 16;
const MEDIA_ENT_TYPE_MASK: u32 = 0xffff_0000;

pub fn entity_type(ty: u32) -> u32 {
    ty & MEDIA_ENT_TYPE_MASK
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct media_entity_desc {
    pub id: u32,
    pub name: [u8; 32],
    pub type_: u32,
    pub revision: u32,
    pub flags: u32,
    pub group_id: u32,
    pub pads: u16,
    pub links: u16,
    pub reserved: [u32; 4],
    pub dev_major: u32,
    pub dev_minor: u32,
    pub raw: [u8; 176],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct media_pad_desc {
    pub entity: u32,
    pub index: u16,
    pub flags: u32,
    pub reserved: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct media_link_desc {
    pub source: media_pad_desc,
    pub sink: media_pad_desc,
    pub flags: u32,
    pub reserved: [u32; 2],
}

#[repr(C)]
pub struct media_links_enum {
    pub entity: u32,
    pub pads: *mut media_pad_desc,
    pub links: *mut media_link_desc,
    pub reserved: [u32; 4],
}

pub const MEDIA_IOC_DEVICE_INFO: u32 = iowr::<media_device_info>(b'|', 0x00);
pub const MEDIA_IOC_ENUM_ENTITIES: u32 = iowr::<media_entity_desc>(b'|', 0x01);
pub const MEDIA_IOC_ENUM_LINKS: u32 = iowr::<media_links_enum>(b'|', 0x02);
pub const MEDIA_IOC_SETUP_LINK: u32 = iowr::<media_link_desc>(b'|', 0x03);

// ---------------------------------------------------------------------------
// V4L2 subdevices

pub const V4L2_SUBDEV_FORMAT_ACTIVE: u32 = 1;
pub const V4L2_SEL_TGT_CROP: u32 = 0x0000;
pub const V4L2_SEL_TGT_COMPOSE: u32 = 0x0100;
pub const V4L2_FIELD_NONE: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_mbus_framefmt {
    pub width: u32,
    pub height: u32,
    pub code: u32,
    pub field: u32,
    pub colorspace: u32,
    pub ycbcr_enc: u16,
    pub quantization: u16,
    pub xfer_func: u16,
    pub flags: u16,
    pub reserved: [u16; 10],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_subdev_format {
    pub which: u32,
    pub pad: u32,
    pub format: v4l2_mbus_framefmt,
    pub stream: u32,
    pub reserved: [u32; 7],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_subdev_selection {
    pub which: u32,
    pub pad: u32,
    pub target: u32,
    pub flags: u32,
    pub r: v4l2_rect,
    pub stream: u32,
    pub reserved: [u32; 7],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_control {
    pub id: u32,
    pub value: i32,
}

pub const VIDIOC_SUBDEV_S_FMT: u32 = iowr::<v4l2_subdev_format>(b'V', 5);
pub const VIDIOC_SUBDEV_S_SELECTION: u32 = iowr::<v4l2_subdev_selection>(b'V', 62);
pub const VIDIOC_S_CTRL: u32 = iowr::<v4l2_control>(b'V', 28);

// ---------------------------------------------------------------------------
// V4L2 video nodes

pub const V4L2_CAP_VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;
pub const V4L2_CAP_VIDEO_OUTPUT_MPLANE: u32 = 0x0000_2000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 = 10;
pub const V4L2_MEMORY_DMABUF: u32 = 4;
pub const VIDEO_MAX_PLANES: usize = 8;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_plane_pix_format {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_pix_format_mplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [v4l2_plane_pix_format; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

/// `struct v4l2_format` with the `fmt` union narrowed to `pix_mp`. The
/// union is 8-byte aligned on LP64, hence `_pad`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_format {
    pub type_: u32,
    pub _pad: u32,
    pub pix_mp: v4l2_pix_format_mplane,
    pub _raw: [u8; 8],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_plane_m {
    pub mem_offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: v4l2_plane_m,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

impl Default for v4l2_plane {
    fn default() -> Self {
        Self {
            bytesused: 0,
            length: 0,
            m: v4l2_plane_m { userptr: 0 },
            data_offset: 0,
            reserved: [0; 11],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub planes: *mut v4l2_plane,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl v4l2_buffer {
    pub fn new(type_: u32, planes: &mut [v4l2_plane]) -> Self {
        Self {
            index: 0,
            type_,
            bytesused: 0,
            flags: 0,
            field: V4L2_FIELD_NONE,
            timestamp: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            timecode: v4l2_timecode {
                type_: 0,
                flags: 0,
                frames: 0,
                seconds: 0,
                minutes: 0,
                hours: 0,
                userbits: [0; 4],
            },
            sequence: 0,
            memory: V4L2_MEMORY_DMABUF,
            m: v4l2_buffer_m {
                planes: planes.as_mut_ptr(),
            },
            length: planes.len() as u32,
            reserved2: 0,
            request_fd: 0,
        }
    }
}

pub const VIDIOC_QUERYCAP: u32 = ior::<v4l2_capability>(b'V', 0);
pub const VIDIOC_S_FMT: u32 = iowr::<v4l2_format>(b'V', 5);
pub const VIDIOC_REQBUFS: u32 = iowr::<v4l2_requestbuffers>(b'V', 8);
pub const VIDIOC_QBUF: u32 = iowr::<v4l2_buffer>(b'V', 15);
pub const VIDIOC_DQBUF: u32 = iowr::<v4l2_buffer>(b'V', 17);
pub const VIDIOC_STREAMON: u32 = iow::<libc::c_int>(b'V', 18);
pub const VIDIOC_STREAMOFF: u32 = iow::<libc::c_int>(b'V', 19);

// ---------------------------------------------------------------------------
// DMA heaps and DMA-buf

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct dma_heap_allocation_data {
    pub len: u64,
    pub fd: u32,
    pub fd_flags: u32,
    pub heap_flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct dma_buf_sync {
    pub flags: u64,
}

pub const DMA_BUF_SYNC_READ: u64 = 1;
pub const DMA_BUF_SYNC_WRITE: u64 = 2;
pub const DMA_BUF_SYNC_RW: u64 = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
pub const DMA_BUF_SYNC_START: u64 = 0;
pub const DMA_BUF_SYNC_END: u64 = 4;

pub const DMA_HEAP_IOCTL_ALLOC: u32 = iowr::<dma_heap_allocation_data>(b'H', 0);
pub const DMA_BUF_IOCTL_SYNC: u32 = iow::<dma_buf_sync>(b'b', 0);

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<media_device_info>(), 256);
        assert_eq!(size_of::<media_entity_desc>(), 256);
        assert_eq!(size_of::<media_link_desc>(), 52);
        assert_eq!(size_of::<media_links_enum>(), 40);
        assert_eq!(size_of::<v4l2_subdev_format>(), 88);
        assert_eq!(size_of::<v4l2_subdev_selection>(), 64);
        assert_eq!(size_of::<v4l2_capability>(), 104);
        assert_eq!(size_of::<v4l2_format>(), 208);
        assert_eq!(size_of::<v4l2_requestbuffers>(), 20);
        assert_eq!(size_of::<v4l2_buffer>(), 88);
        assert_eq!(size_of::<v4l2_plane>(), 64);
        assert_eq!(size_of::<dma_heap_allocation_data>(), 24);
    }

    #[test]
    fn request_codes() {
        assert_eq!(MEDIA_IOC_DEVICE_INFO, 0xc100_7c00);
        assert_eq!(MEDIA_IOC_SETUP_LINK, 0xc034_7c03);
        assert_eq!(VIDIOC_S_FMT, 0xc0d0_5605);
        assert_eq!(VIDIOC_QBUF, 0xc058_560f);
        assert_eq!(VIDIOC_STREAMON, 0x4004_5612);
        assert_eq!(DMA_HEAP_IOCTL_ALLOC, 0xc018_4800);
    }
}
