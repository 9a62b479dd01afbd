//! The Linux backend, talking to the media controller API and V4L2.
use log::{debug, trace};
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io,
    mem::zeroed,
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use super::{
    sys, DeviceInfo, EntityDesc, EntityId, EntityKind, LinkDesc, LinkFlags, MbusFormat,
    MediaDevice, PadRef, SelectionTarget, VideoFormat,
};
use crate::{geom::Rect, surface::PlaneDesc};

/// A media controller device node and the subdevice/video nodes of its
/// entities, opened on first use.
#[derive(Debug)]
pub struct LinuxMedia {
    path: PathBuf,
    media: File,
    nodes: Mutex<HashMap<EntityId, Arc<Node>>>,
}

#[derive(Debug)]
struct Node {
    file: File,
    /// The V4L2 buffer type of a video node. `None` for subdevices.
    buf_type: Option<u32>,
}

fn open_rw(path: &Path, nonblock: bool) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(if nonblock { libc::O_NONBLOCK } else { 0 })
        .open(path)
}

/// Find the device node of a character device through sysfs.
fn devnode_path(major: u32, minor: u32) -> io::Result<PathBuf> {
    let uevent = fs::read_to_string(format!("/sys/dev/char/{}:{}/uevent", major, minor))?;
    uevent
        .lines()
        .find_map(|line| line.strip_prefix("DEVNAME="))
        .map(|name| Path::new("/dev").join(name))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no device node for {}:{}", major, minor),
            )
        })
}

impl Node {
    fn open(entity: &EntityDesc) -> io::Result<Self> {
        let (major, minor) = entity.dev.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("entity {:?} has no device node", entity.name),
            )
        })?;
        let path = devnode_path(major, minor)?;

        if entity.kind != EntityKind::VideoNode {
            debug!("Opened {:?} for {:?}", path, entity.name);
            return Ok(Self {
                file: open_rw(&path, false)?,
                buf_type: None,
            });
        }

        // `DQBUF` must not block; completion is waited for by `poll`
        let file = open_rw(&path, true)?;
        let mut cap = sys::v4l2_capability::default();
        unsafe { sys::ioctl(file.as_raw_fd(), sys::VIDIOC_QUERYCAP, &mut cap) }?;
        let caps = if cap.capabilities & sys::V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        let buf_type = if caps & sys::V4L2_CAP_VIDEO_OUTPUT_MPLANE != 0 {
            sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE
        } else if caps & sys::V4L2_CAP_VIDEO_CAPTURE_MPLANE != 0 {
            sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} is not a multi-planar video node", path),
            ));
        };

        debug!("Opened {:?} for {:?} (type {})", path, entity.name, buf_type);
        Ok(Self {
            file,
            buf_type: Some(buf_type),
        })
    }

    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    fn buf_type(&self) -> io::Result<u32> {
        self.buf_type
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a video node"))
    }
}

fn entity_from_sys(desc: &sys::media_entity_desc) -> EntityDesc {
    let kind = match sys::entity_type(desc.type_) {
        sys::MEDIA_ENT_T_DEVNODE => EntityKind::VideoNode,
        sys::MEDIA_ENT_T_V4L2_SUBDEV => EntityKind::Subdev,
        _ => EntityKind::Other,
    };
    EntityDesc {
        id: EntityId(desc.id),
        name: sys::c_str(&desc.name),
        kind,
        num_pads: desc.pads,
        num_links: desc.links,
        dev: if desc.dev_major != 0 || desc.dev_minor != 0 {
            Some((desc.dev_major, desc.dev_minor))
        } else {
            None
        },
    }
}

fn pad_to_sys(pad: PadRef) -> sys::media_pad_desc {
    sys::media_pad_desc {
        entity: pad.entity.0,
        index: pad.index,
        ..Default::default()
    }
}

fn pad_from_sys(pad: &sys::media_pad_desc) -> PadRef {
    PadRef::new(EntityId(pad.entity), pad.index)
}

impl LinuxMedia {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let media = open_rw(path, false)?;
        Ok(Self {
            path: path.to_owned(),
            media,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entity(&self, id: EntityId) -> io::Result<EntityDesc> {
        let mut desc: sys::media_entity_desc = unsafe { zeroed() };
        desc.id = id.0;
        unsafe { sys::ioctl(self.media.as_raw_fd(), sys::MEDIA_IOC_ENUM_ENTITIES, &mut desc) }?;
        Ok(entity_from_sys(&desc))
    }

    fn node(&self, entity: EntityId) -> io::Result<Arc<Node>> {
        if let Some(node) = self.nodes.lock().unwrap().get(&entity) {
            return Ok(Arc::clone(node));
        }

        // Opening a node can take a while, so don't hold the lock
        let node = Arc::new(Node::open(&self.entity(entity)?)?);

        let mut nodes = self.nodes.lock().unwrap();
        Ok(Arc::clone(nodes.entry(entity).or_insert(node)))
    }
}

impl MediaDevice for LinuxMedia {
    fn device_info(&self) -> io::Result<DeviceInfo> {
        let mut info: sys::media_device_info = unsafe { zeroed() };
        unsafe { sys::ioctl(self.media.as_raw_fd(), sys::MEDIA_IOC_DEVICE_INFO, &mut info) }?;
        Ok(DeviceInfo {
            driver: sys::c_str(&info.driver),
            model: sys::c_str(&info.model),
            bus_info: sys::c_str(&info.bus_info),
        })
    }

    fn entities(&self) -> io::Result<Vec<EntityDesc>> {
        let mut entities = Vec::new();
        let mut id = 0;
        loop {
            let mut desc: sys::media_entity_desc = unsafe { zeroed() };
            desc.id = id | sys::MEDIA_ENT_ID_FLAG_NEXT;
            match unsafe {
                sys::ioctl(self.media.as_raw_fd(), sys::MEDIA_IOC_ENUM_ENTITIES, &mut desc)
            } {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => break,
                Err(e) => return Err(e),
            }
            id = desc.id;
            entities.push(entity_from_sys(&desc));
        }
        Ok(entities)
    }

    fn links(&self, entity: EntityId) -> io::Result<Vec<LinkDesc>> {
        let desc = self.entity(entity)?;
        let mut pads = vec![sys::media_pad_desc::default(); desc.num_pads as usize];
        let mut links = vec![sys::media_link_desc::default(); desc.num_links as usize];
        let mut req = sys::media_links_enum {
            entity: entity.0,
            pads: pads.as_mut_ptr(),
            links: links.as_mut_ptr(),
            reserved: [0; 4],
        };
        unsafe { sys::ioctl(self.media.as_raw_fd(), sys::MEDIA_IOC_ENUM_LINKS, &mut req) }?;

        Ok(links
            .iter()
            .filter(|l| l.source.entity == entity.0)
            .map(|l| LinkDesc {
                source: pad_from_sys(&l.source),
                sink: pad_from_sys(&l.sink),
                flags: LinkFlags::from_bits_truncate(l.flags),
            })
            .collect())
    }

    fn setup_link(&self, link: &LinkDesc, enable: bool) -> io::Result<()> {
        trace!("setup_link({:?} -> {:?}, {})", link.source, link.sink, enable);
        let mut desc = sys::media_link_desc {
            source: pad_to_sys(link.source),
            sink: pad_to_sys(link.sink),
            flags: if enable { LinkFlags::ENABLED.bits() } else { 0 },
            reserved: [0; 2],
        };
        unsafe { sys::ioctl(self.media.as_raw_fd(), sys::MEDIA_IOC_SETUP_LINK, &mut desc) }
    }

    fn set_pad_format(&self, pad: PadRef, format: &MbusFormat) -> io::Result<()> {
        trace!("set_pad_format({:?}, {:?})", pad, format);
        let node = self.node(pad.entity)?;
        let mut req = sys::v4l2_subdev_format {
            which: sys::V4L2_SUBDEV_FORMAT_ACTIVE,
            pad: pad.index as u32,
            format: sys::v4l2_mbus_framefmt {
                width: format.size[0],
                height: format.size[1],
                code: format.code,
                field: sys::V4L2_FIELD_NONE,
                ..Default::default()
            },
            ..Default::default()
        };
        unsafe { sys::ioctl(node.fd(), sys::VIDIOC_SUBDEV_S_FMT, &mut req) }
    }

    fn set_selection(&self, pad: PadRef, target: SelectionTarget, rect: Rect) -> io::Result<()> {
        trace!("set_selection({:?}, {:?}, {:?})", pad, target, rect);
        let node = self.node(pad.entity)?;
        let mut req = sys::v4l2_subdev_selection {
            which: sys::V4L2_SUBDEV_FORMAT_ACTIVE,
            pad: pad.index as u32,
            target: match target {
                SelectionTarget::Crop => sys::V4L2_SEL_TGT_CROP,
                SelectionTarget::Compose => sys::V4L2_SEL_TGT_COMPOSE,
            },
            r: sys::v4l2_rect {
                left: rect.x,
                top: rect.y,
                width: rect.w,
                height: rect.h,
            },
            ..Default::default()
        };
        unsafe { sys::ioctl(node.fd(), sys::VIDIOC_SUBDEV_S_SELECTION, &mut req) }
    }

    fn set_control(&self, entity: EntityId, id: u32, value: i32) -> io::Result<()> {
        trace!("set_control({}, {:#x}, {})", entity, id, value);
        let node = self.node(entity)?;
        let mut req = sys::v4l2_control { id, value };
        unsafe { sys::ioctl(node.fd(), sys::VIDIOC_S_CTRL, &mut req) }
    }

    fn set_video_format(&self, node: EntityId, format: &VideoFormat) -> io::Result<()> {
        trace!("set_video_format({}, {:?})", node, format);
        let node = self.node(node)?;

        let mut plane_fmt = [sys::v4l2_plane_pix_format::default(); sys::VIDEO_MAX_PLANES];
        for (out, plane) in plane_fmt.iter_mut().zip(format.planes.iter()) {
            out.sizeimage = plane.len;
            out.bytesperline = plane.pitch;
        }

        let mut req = sys::v4l2_format {
            type_: node.buf_type()?,
            pix_mp: sys::v4l2_pix_format_mplane {
                width: format.size[0],
                height: format.size[1],
                pixelformat: format.format.fourcc(),
                field: sys::V4L2_FIELD_NONE,
                plane_fmt,
                num_planes: format.planes.len() as u8,
                ..Default::default()
            },
            ..Default::default()
        };
        unsafe { sys::ioctl(node.fd(), sys::VIDIOC_S_FMT, &mut req) }
    }

    fn request_buffers(&self, node: EntityId, count: u32) -> io::Result<u32> {
        trace!("request_buffers({}, {})", node, count);
        let node = self.node(node)?;
        let mut req = sys::v4l2_requestbuffers {
            count,
            type_: node.buf_type()?,
            memory: sys::V4L2_MEMORY_DMABUF,
            ..Default::default()
        };
        unsafe { sys::ioctl(node.fd(), sys::VIDIOC_REQBUFS, &mut req) }?;
        Ok(req.count)
    }

    fn queue_buffer(&self, node: EntityId, planes: &[PlaneDesc]) -> io::Result<()> {
        trace!("queue_buffer({}, {:?})", node, planes);
        let node = self.node(node)?;

        let mut sys_planes = [sys::v4l2_plane::default(); crate::format::MAX_PLANES];
        let sys_planes = &mut sys_planes[..planes.len()];
        for (out, plane) in sys_planes.iter_mut().zip(planes.iter()) {
            out.m.fd = plane.buf.as_raw();
            out.length = plane.offset + plane.len;
            out.bytesused = plane.offset + plane.len;
            out.data_offset = plane.offset;
        }

        let mut buf = sys::v4l2_buffer::new(node.buf_type()?, sys_planes);
        unsafe { sys::ioctl(node.fd(), sys::VIDIOC_QBUF, &mut buf) }
    }

    fn dequeue_buffer(&self, node: EntityId) -> io::Result<()> {
        trace!("dequeue_buffer({})", node);
        let node = self.node(node)?;
        let mut sys_planes = [sys::v4l2_plane::default(); crate::format::MAX_PLANES];
        let mut buf = sys::v4l2_buffer::new(node.buf_type()?, &mut sys_planes);
        unsafe { sys::ioctl(node.fd(), sys::VIDIOC_DQBUF, &mut buf) }
    }

    fn stream_on(&self, node: EntityId) -> io::Result<()> {
        trace!("stream_on({})", node);
        let node = self.node(node)?;
        let mut ty = node.buf_type()? as libc::c_int;
        unsafe { sys::ioctl(node.fd(), sys::VIDIOC_STREAMON, &mut ty) }
    }

    fn stream_off(&self, node: EntityId) -> io::Result<()> {
        trace!("stream_off({})", node);
        let node = self.node(node)?;
        let mut ty = node.buf_type()? as libc::c_int;
        unsafe { sys::ioctl(node.fd(), sys::VIDIOC_STREAMOFF, &mut ty) }
    }

    fn wait_done(&self, node: EntityId, timeout: Duration) -> io::Result<bool> {
        let node = self.node(node)?;
        let events = if node.buf_type()? == sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE {
            libc::POLLIN
        } else {
            libc::POLLOUT
        };
        let mut fds = libc::pollfd {
            fd: node.fd(),
            events,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::max_value() as u128) as libc::c_int;

        loop {
            let n = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
            if n >= 0 {
                break;
            }
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e);
            }
        }

        if fds.revents & libc::POLLERR != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "the video node reported an error",
            ));
        }
        Ok(fds.revents & events != 0)
    }
}
