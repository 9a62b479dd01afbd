//! An in-process media device for testing.
//!
//! [`MockMedia`] presents the media graph of a VSP-like device, records every
//! configuration call, validates the call order the way the kernel does (e.g.
//! a pad can't be the endpoint of two enabled links, buffers can't be queued
//! before a format is set), and executes a submission in software when the
//! output node starts streaming. Tests inspect the call log and the pixels of
//! the surfaces they allocated through it.
//!
//! Submissions complete immediately by default. With
//! [`MockMedia::set_auto_complete`]`(false)`, they stay in flight until
//! [`MockMedia::complete`] is called.
use log::{trace, warn};
use rgb::RGBA8;
use std::{
    collections::HashMap,
    fmt, io,
    os::unix::io::RawFd,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use super::{
    topology::{PAD_SINK, PAD_SOURCE},
    DeviceInfo, DmaAllocator, DmaBuffer, EntityDesc, EntityId, EntityKind, LinkDesc, LinkFlags,
    MbusFormat, MediaDevice, PadRef, SelectionTarget, VideoFormat,
};
use crate::{
    format::PixelFormat,
    geom::Rect,
    surface::{DmaBufRef, PlaneDesc, SurfaceDesc},
};

mod engine;
pub use self::engine::{scale_bilinear, Image, RGBAF32};

/// The upper bound of iterations of a polling loop waiting for another thread
/// to acknowledge a state change.
pub const LOCK_POLL_ITERATIONS: u32 = 10_000;

/// A recorded configuration call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetupLink {
        source: PadRef,
        sink: PadRef,
        enable: bool,
    },
    SetPadFormat {
        pad: PadRef,
        format: MbusFormat,
    },
    SetSelection {
        pad: PadRef,
        target: SelectionTarget,
        rect: Rect,
    },
    SetControl {
        entity: EntityId,
        id: u32,
        value: i32,
    },
    SetVideoFormat {
        node: EntityId,
        format: VideoFormat,
    },
    RequestBuffers {
        node: EntityId,
        count: u32,
    },
    QueueBuffer {
        node: EntityId,
        planes: Vec<PlaneDesc>,
    },
    DequeueBuffer {
        node: EntityId,
    },
    StreamOn {
        node: EntityId,
    },
    StreamOff {
        node: EntityId,
    },
}

impl Call {
    /// The entity the call is directed to.
    pub fn entity(&self) -> EntityId {
        match self {
            Call::SetupLink { sink, .. } => sink.entity,
            Call::SetPadFormat { pad, .. } | Call::SetSelection { pad, .. } => pad.entity,
            Call::SetControl { entity, .. } => *entity,
            Call::SetVideoFormat { node, .. }
            | Call::RequestBuffers { node, .. }
            | Call::QueueBuffer { node, .. }
            | Call::DequeueBuffer { node }
            | Call::StreamOn { node }
            | Call::StreamOff { node } => *node,
        }
    }
}

/// What an entity of the mock graph is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Role {
    Input(u8),
    InputNode(u8),
    Scaler(u8),
    Compose,
    Output,
    OutputNode,
}

#[derive(Debug, Default)]
struct NodeState {
    format: Option<VideoFormat>,
    num_buffers: u32,
    queued: Vec<Vec<PlaneDesc>>,
    done: Vec<Vec<PlaneDesc>>,
    streaming: bool,
}

type FailureFn = Box<dyn FnMut(&Call) -> bool + Send>;

struct MockState {
    info: DeviceInfo,
    entities: Vec<EntityDesc>,
    roles: HashMap<EntityId, Role>,
    links: Vec<LinkDesc>,
    pad_formats: HashMap<PadRef, MbusFormat>,
    selections: HashMap<(PadRef, SelectionTarget), Rect>,
    controls: HashMap<(EntityId, u32), i32>,
    nodes: HashMap<EntityId, NodeState>,
    calls: Vec<Call>,
    failure: Option<FailureFn>,
    auto_complete: bool,
    /// A submission is waiting for `complete`.
    pending: bool,
    runs: usize,
    buffers: HashMap<RawFd, Vec<u8>>,
    next_fd: RawFd,
}

impl fmt::Debug for MockState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MockState")
            .field("info", &self.info)
            .field("calls", &self.calls.len())
            .field("runs", &self.runs)
            .field("pending", &self.pending)
            .finish()
    }
}

fn ebusy() -> io::Error {
    io::Error::from_raw_os_error(libc::EBUSY)
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

impl MockState {
    fn entity(&self, id: EntityId) -> &EntityDesc {
        &self.entities[id.0 as usize - 1]
    }

    fn role_entity(&self, role: Role) -> EntityId {
        self.roles
            .iter()
            .find(|entry| *entry.1 == role)
            .map(|(&id, _)| id)
            .expect("no entity has the role")
    }

    fn output_node(&self) -> EntityId {
        self.role_entity(Role::OutputNode)
    }

    fn node_mut(&mut self, node: EntityId) -> io::Result<&mut NodeState> {
        self.nodes.get_mut(&node).ok_or_else(einval)
    }

    /// Execute the configured pipeline and make every queued buffer
    /// dequeueable.
    fn run(&mut self) {
        if let Err(e) = self.execute() {
            warn!("The mock engine could not execute the submission: {}", e);
        }
        self.runs += 1;
        for node in self.nodes.values_mut() {
            if node.streaming {
                let queued = std::mem::replace(&mut node.queued, Vec::new());
                node.done.extend(queued);
            }
        }
    }
}

/// A mock media device. Cloning it yields another handle to the same device.
#[derive(Debug, Clone)]
pub struct MockMedia {
    shared: Arc<(Mutex<MockState>, Condvar)>,
}

impl MockMedia {
    /// Construct a device with `num_inputs` input ports, `num_scalers`
    /// scalers and a compose unit with `compose_inputs` sink pads, whose
    /// entity names start with `prefix` (e.g. `fe928000.vsp`).
    pub fn vsp(prefix: &str, num_inputs: u8, num_scalers: u8, compose_inputs: u16) -> Self {
        let mut entities = Vec::new();
        let mut roles = HashMap::new();
        let mut nodes = HashMap::new();

        let mut add = |name: String, kind: EntityKind, num_pads: u16, role: Role| {
            let id = EntityId(entities.len() as u32 + 1);
            entities.push(EntityDesc {
                id,
                name,
                kind,
                num_pads,
                num_links: 0,
                dev: Some((81, id.0)),
            });
            roles.insert(id, role);
            if kind == EntityKind::VideoNode {
                nodes.insert(id, NodeState::default());
            }
            id
        };

        let inputs: Vec<_> = (0..num_inputs)
            .map(|i| {
                (
                    add(
                        format!("{} rpf.{}", prefix, i),
                        EntityKind::Subdev,
                        2,
                        Role::Input(i),
                    ),
                    add(
                        format!("{} rpf.{} input", prefix, i),
                        EntityKind::VideoNode,
                        1,
                        Role::InputNode(i),
                    ),
                )
            })
            .collect();
        let scalers: Vec<_> = (0..num_scalers)
            .map(|s| {
                add(
                    format!("{} uds.{}", prefix, s),
                    EntityKind::Subdev,
                    2,
                    Role::Scaler(s),
                )
            })
            .collect();
        let bru = add(
            format!("{} bru", prefix),
            EntityKind::Subdev,
            compose_inputs + 1,
            Role::Compose,
        );
        let wpf = add(
            format!("{} wpf.0", prefix),
            EntityKind::Subdev,
            2,
            Role::Output,
        );
        let wpf_node = add(
            format!("{} wpf.0 output", prefix),
            EntityKind::VideoNode,
            1,
            Role::OutputNode,
        );

        let fixed = LinkFlags::ENABLED | LinkFlags::IMMUTABLE;
        let link = |source: EntityId, source_pad: u16, sink: EntityId, sink_pad: u16, flags: LinkFlags| LinkDesc {
            source: PadRef::new(source, source_pad),
            sink: PadRef::new(sink, sink_pad),
            flags,
        };
        let mut links = Vec::new();
        for &(rpf, node) in inputs.iter() {
            links.push(link(node, 0, rpf, PAD_SINK, fixed));
            for &uds in scalers.iter() {
                links.push(link(rpf, PAD_SOURCE, uds, PAD_SINK, LinkFlags::empty()));
            }
            for pad in 0..compose_inputs {
                links.push(link(rpf, PAD_SOURCE, bru, pad, LinkFlags::empty()));
            }
        }
        for &uds in scalers.iter() {
            for pad in 0..compose_inputs {
                links.push(link(uds, PAD_SOURCE, bru, pad, LinkFlags::empty()));
            }
        }
        links.push(link(bru, compose_inputs, wpf, PAD_SINK, LinkFlags::empty()));
        links.push(link(wpf, PAD_SOURCE, wpf_node, 0, fixed));

        for entity in entities.iter_mut() {
            entity.num_links = links
                .iter()
                .filter(|l| l.source.entity == entity.id)
                .count() as u16;
        }

        let state = MockState {
            info: DeviceInfo {
                driver: "vsp1".to_owned(),
                model: "VSP2-BD".to_owned(),
                bus_info: format!("platform:{}", prefix),
            },
            entities,
            roles,
            links,
            pad_formats: HashMap::new(),
            selections: HashMap::new(),
            controls: HashMap::new(),
            nodes,
            calls: Vec::new(),
            failure: None,
            auto_complete: true,
            pending: false,
            runs: 0,
            buffers: HashMap::new(),
            next_fd: 1000,
        };

        Self {
            shared: Arc::new((Mutex::new(state), Condvar::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.shared.0.lock().unwrap()
    }

    /// Log `call` and apply the failure injector.
    fn record(&self, call: Call) -> io::Result<MutexGuard<'_, MockState>> {
        trace!("{:?}", call);
        let mut state = self.state();
        let fail = match &mut state.failure {
            Some(f) => f(&call),
            None => false,
        };
        state.calls.push(call);
        if fail {
            Err(io::Error::from_raw_os_error(libc::EIO))
        } else {
            Ok(state)
        }
    }

    pub fn set_bus_info(&self, bus_info: &str) {
        self.state().info.bus_info = bus_info.to_owned();
    }

    /// Make every call for which `f` returns `true` fail with `EIO`.
    pub fn set_failure(&self, f: impl FnMut(&Call) -> bool + Send + 'static) {
        self.state().failure = Some(Box::new(f));
    }

    pub fn clear_failure(&self) {
        self.state().failure = None;
    }

    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state().auto_complete = auto_complete;
    }

    /// Complete the submission in flight. Waits a bounded number of
    /// iterations for one to appear; returns `false` if none did.
    pub fn complete(&self) -> bool {
        for _ in 0..LOCK_POLL_ITERATIONS {
            {
                let mut state = self.state();
                if state.pending {
                    state.pending = false;
                    state.run();
                    self.shared.1.notify_all();
                    return true;
                }
            }
            thread::yield_now();
        }
        false
    }

    /// Get a copy of the call log.
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Get and clear the call log.
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::replace(&mut self.state().calls, Vec::new())
    }

    /// The number of submissions executed so far.
    pub fn runs(&self) -> usize {
        self.state().runs
    }

    /// Find an entity by the part of its name following the prefix, e.g.
    /// `rpf.0`.
    pub fn entity_id(&self, suffix: &str) -> Option<EntityId> {
        let state = self.state();
        let suffix = format!(" {}", suffix);
        state
            .entities
            .iter()
            .find(|e| e.name.ends_with(&suffix))
            .map(|e| e.id)
    }

    pub fn is_link_enabled(&self, source: PadRef, sink: PadRef) -> bool {
        self.state()
            .links
            .iter()
            .any(|l| l.source == source && l.sink == sink && l.flags.contains(LinkFlags::ENABLED))
    }

    /// Enable a link behind the compositor's back, e.g. to model state left
    /// over by another process.
    pub fn force_link(&self, source: PadRef, sink: PadRef) {
        let mut state = self.state();
        if let Some(link) = state
            .links
            .iter_mut()
            .find(|l| l.source == source && l.sink == sink)
        {
            link.flags |= LinkFlags::ENABLED;
        }
    }

    /// The number of DMA-bufs currently registered.
    pub fn num_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    fn register_buffer(&self, len: usize) -> RawFd {
        let mut state = self.state();
        let fd = state.next_fd;
        state.next_fd += 1;
        state.buffers.insert(fd, vec![0; len]);
        fd
    }

    /// Allocate a zero-filled surface with a tightly packed pitch.
    pub fn alloc_surface(&self, format: PixelFormat, size: [u32; 2]) -> SurfaceDesc {
        let pitch = format.min_pitch(0, size[0]);
        let mut desc = SurfaceDesc::new(DmaBufRef::borrow_raw(-1), format, size, pitch);
        let fd = self.register_buffer(desc.byte_len());
        for plane in desc.planes.iter_mut() {
            plane.buf = DmaBufRef::borrow_raw(fd);
        }
        desc
    }

    /// Read the pixels of a 32-bit surface.
    pub fn read_pixels(&self, desc: &SurfaceDesc) -> Vec<RGBA8> {
        assert_eq!(desc.format.bytes_per_pixel(), 4);
        let state = self.state();
        let data = &state.buffers[&desc.planes[0].buf.as_raw()];
        let plane = &desc.planes[0];
        let mut out = Vec::with_capacity((desc.size[0] * desc.size[1]) as usize);
        for y in 0..desc.size[1] as usize {
            let row = plane.offset as usize + y * plane.pitch as usize;
            for px in data[row..row + desc.size[0] as usize * 4].chunks_exact(4) {
                out.push(RGBA8::new(px[2], px[1], px[0], px[3]));
            }
        }
        out
    }

    /// Overwrite the pixels of a 32-bit surface.
    pub fn write_pixels(&self, desc: &SurfaceDesc, pixels: &[RGBA8]) {
        assert_eq!(desc.format.bytes_per_pixel(), 4);
        assert_eq!(pixels.len(), (desc.size[0] * desc.size[1]) as usize);
        let mut state = self.state();
        let data = state
            .buffers
            .get_mut(&desc.planes[0].buf.as_raw())
            .expect("unknown buffer");
        let plane = &desc.planes[0];
        for (y, src_row) in pixels.chunks_exact(desc.size[0] as usize).enumerate() {
            let row = plane.offset as usize + y * plane.pitch as usize;
            for (px, p) in data[row..row + src_row.len() * 4]
                .chunks_exact_mut(4)
                .zip(src_row.iter())
            {
                px.copy_from_slice(&[p.b, p.g, p.r, p.a]);
            }
        }
    }

    pub fn fill_pixels(&self, desc: &SurfaceDesc, color: RGBA8) {
        let n = (desc.size[0] * desc.size[1]) as usize;
        self.write_pixels(desc, &vec![color; n]);
    }
}

impl MediaDevice for MockMedia {
    fn device_info(&self) -> io::Result<DeviceInfo> {
        Ok(self.state().info.clone())
    }

    fn entities(&self) -> io::Result<Vec<EntityDesc>> {
        Ok(self.state().entities.clone())
    }

    fn links(&self, entity: EntityId) -> io::Result<Vec<LinkDesc>> {
        Ok(self
            .state()
            .links
            .iter()
            .filter(|l| l.source.entity == entity)
            .cloned()
            .collect())
    }

    fn setup_link(&self, link: &LinkDesc, enable: bool) -> io::Result<()> {
        let mut state = self.record(Call::SetupLink {
            source: link.source,
            sink: link.sink,
            enable,
        })?;

        let i = state
            .links
            .iter()
            .position(|l| l.source == link.source && l.sink == link.sink)
            .ok_or_else(einval)?;
        if state.links[i].flags.contains(LinkFlags::IMMUTABLE) {
            return Err(einval());
        }
        if enable {
            let busy = state.links.iter().enumerate().any(|(k, l)| {
                k != i
                    && l.flags.contains(LinkFlags::ENABLED)
                    && (l.sink == link.sink || l.source == link.source)
            });
            if busy {
                return Err(ebusy());
            }
            state.links[i].flags |= LinkFlags::ENABLED;
        } else {
            state.links[i].flags -= LinkFlags::ENABLED;
        }
        Ok(())
    }

    fn set_pad_format(&self, pad: PadRef, format: &MbusFormat) -> io::Result<()> {
        let mut state = self.record(Call::SetPadFormat {
            pad,
            format: *format,
        })?;
        state.pad_formats.insert(pad, *format);
        Ok(())
    }

    fn set_selection(&self, pad: PadRef, target: SelectionTarget, rect: Rect) -> io::Result<()> {
        let mut state = self.record(Call::SetSelection { pad, target, rect })?;
        state.selections.insert((pad, target), rect);
        Ok(())
    }

    fn set_control(&self, entity: EntityId, id: u32, value: i32) -> io::Result<()> {
        let mut state = self.record(Call::SetControl { entity, id, value })?;
        state.controls.insert((entity, id), value);
        Ok(())
    }

    fn set_video_format(&self, node: EntityId, format: &VideoFormat) -> io::Result<()> {
        let mut state = self.record(Call::SetVideoFormat {
            node,
            format: format.clone(),
        })?;
        let node = state.node_mut(node)?;
        if node.num_buffers > 0 {
            return Err(ebusy());
        }
        node.format = Some(format.clone());
        Ok(())
    }

    fn request_buffers(&self, node: EntityId, count: u32) -> io::Result<u32> {
        let mut state = self.record(Call::RequestBuffers { node, count })?;
        let node = state.node_mut(node)?;
        if node.streaming {
            return Err(ebusy());
        }
        if count > 0 && node.format.is_none() {
            return Err(einval());
        }
        node.num_buffers = count;
        node.queued.clear();
        node.done.clear();
        Ok(count)
    }

    fn queue_buffer(&self, node: EntityId, planes: &[PlaneDesc]) -> io::Result<()> {
        let mut state = self.record(Call::QueueBuffer {
            node,
            planes: planes.to_vec(),
        })?;
        let node = state.node_mut(node)?;
        let num_planes = node.format.as_ref().map(|f| f.planes.len());
        if node.num_buffers == 0 || num_planes != Some(planes.len()) {
            return Err(einval());
        }
        node.queued.push(planes.to_vec());
        Ok(())
    }

    fn dequeue_buffer(&self, node: EntityId) -> io::Result<()> {
        let mut state = self.record(Call::DequeueBuffer { node })?;
        let node = state.node_mut(node)?;
        if node.done.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        node.done.remove(0);
        Ok(())
    }

    fn stream_on(&self, node: EntityId) -> io::Result<()> {
        let mut state = self.record(Call::StreamOn { node })?;
        let is_output = node == state.output_node();
        {
            let node = state.node_mut(node)?;
            if node.num_buffers == 0 {
                return Err(einval());
            }
            node.streaming = true;
        }
        if is_output {
            if state.auto_complete {
                state.run();
                self.shared.1.notify_all();
            } else {
                state.pending = true;
            }
        }
        Ok(())
    }

    fn stream_off(&self, node: EntityId) -> io::Result<()> {
        let mut state = self.record(Call::StreamOff { node })?;
        if node == state.output_node() {
            state.pending = false;
        }
        let node = state.node_mut(node)?;
        node.streaming = false;
        node.queued.clear();
        node.done.clear();
        Ok(())
    }

    fn wait_done(&self, node: EntityId, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if !state.node_mut(node)?.done.is_empty() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self.shared.1.wait_timeout(state, deadline - now).unwrap().0;
        }
    }
}

/// Allocates scratch buffers registered with a `MockMedia`.
#[derive(Debug, Clone)]
pub struct MockAllocator {
    media: MockMedia,
}

impl MockAllocator {
    pub fn new(media: &MockMedia) -> Self {
        Self {
            media: media.clone(),
        }
    }
}

#[derive(Debug)]
pub struct MockBuffer {
    media: MockMedia,
    fd: RawFd,
    len: usize,
}

impl DmaAllocator for MockAllocator {
    type Buffer = MockBuffer;

    fn allocate(&self, len: usize) -> io::Result<MockBuffer> {
        Ok(MockBuffer {
            media: self.media.clone(),
            fd: self.media.register_buffer(len),
            len,
        })
    }
}

impl DmaBuffer for MockBuffer {
    fn fd(&self) -> DmaBufRef {
        DmaBufRef::borrow_raw(self.fd)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn write_with(&mut self, f: &mut dyn FnMut(&mut [u8])) -> io::Result<()> {
        let mut state = self.media.state();
        let data = state.buffers.get_mut(&self.fd).ok_or_else(einval)?;
        f(data);
        Ok(())
    }
}

impl Drop for MockBuffer {
    fn drop(&mut self) {
        self.media.state().buffers.remove(&self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PIPELINE_MBUS_CODE;

    #[test]
    fn rejects_conflicting_links() {
        let media = MockMedia::vsp("fe928000.vsp", 2, 1, 2);
        let rpf0 = media.entity_id("rpf.0").unwrap();
        let rpf1 = media.entity_id("rpf.1").unwrap();
        let bru = media.entity_id("bru").unwrap();
        let link = |source, sink| LinkDesc {
            source: PadRef::new(source, PAD_SOURCE),
            sink: PadRef::new(bru, sink),
            flags: LinkFlags::empty(),
        };

        media.setup_link(&link(rpf0, 0), true).unwrap();
        assert_eq!(
            media.setup_link(&link(rpf1, 0), true).unwrap_err().raw_os_error(),
            Some(libc::EBUSY)
        );
        media.setup_link(&link(rpf0, 0), false).unwrap();
        media.setup_link(&link(rpf1, 0), true).unwrap();
        assert!(media.is_link_enabled(PadRef::new(rpf1, PAD_SOURCE), PadRef::new(bru, 0)));
    }

    #[test]
    fn queue_requires_format() {
        let media = MockMedia::vsp("fe928000.vsp", 1, 0, 1);
        let node = media.entity_id("rpf.0 input").unwrap();
        let surface = media.alloc_surface(PixelFormat::Argb8888, [4, 4]);
        assert!(media.request_buffers(node, 1).is_err());
        assert!(media.queue_buffer(node, &surface.planes).is_err());

        let format = VideoFormat::for_surface(&surface, surface.format);
        media.set_video_format(node, &format).unwrap();
        media.request_buffers(node, 1).unwrap();
        media.queue_buffer(node, &surface.planes).unwrap();
    }

    #[test]
    fn failure_injection_is_logged() {
        let media = MockMedia::vsp("fe928000.vsp", 1, 0, 1);
        let rpf0 = media.entity_id("rpf.0").unwrap();
        media.set_failure(|call| match call {
            Call::SetPadFormat { .. } => true,
            _ => false,
        });
        let pad = PadRef::new(rpf0, PAD_SINK);
        let format = MbusFormat::new(PIPELINE_MBUS_CODE, [4, 4]);
        assert!(media.set_pad_format(pad, &format).is_err());
        assert_eq!(media.take_calls(), vec![Call::SetPadFormat { pad, format }]);
        media.clear_failure();
        assert!(media.set_pad_format(pad, &format).is_ok());
    }

    #[test]
    fn scratch_buffers_are_released() {
        let media = MockMedia::vsp("fe928000.vsp", 1, 0, 1);
        let alloc = MockAllocator::new(&media);
        let mut buffer = alloc.allocate(16).unwrap();
        assert_eq!(media.num_buffers(), 1);
        buffer.write_with(&mut |bytes: &mut [u8]| bytes[0] = 42).unwrap();
        drop(buffer);
        assert_eq!(media.num_buffers(), 0);
    }

    #[test]
    fn complete_without_submission() {
        let media = MockMedia::vsp("fe928000.vsp", 1, 0, 1);
        media.set_auto_complete(false);
        assert!(!media.complete());
    }
}
