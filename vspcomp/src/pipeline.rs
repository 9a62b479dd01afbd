//! Programs the media graph for a composition.
//!
//! Configuration is deferred until a composition is flushed. The order of the
//! steps matters: a pad may be the endpoint of only one enabled link, so
//! conflicting links are disabled before a path is enabled, and a video node
//! can't change its format while it has buffers, so buffers are released
//! before `S_FMT`.
use arrayvec::ArrayVec;
use log::{debug, trace, warn};
use std::{collections::HashSet, io};

use crate::{
    alloc::InputSlot,
    config::MAX_INPUTS,
    error::{PipelineError, Step},
    format::PIPELINE_MBUS_CODE,
    geom::Rect,
    media::{
        topology::{LinkId, Topology, Unit, PAD_SINK, PAD_SOURCE},
        EntityId, LinkFlags, MbusFormat, MediaDevice, PadRef, SelectionTarget, VideoFormat,
        CID_ALPHA_COMPONENT,
    },
    surface::SurfaceDesc,
};

fn check<T>(step: Step, unit: Unit, result: io::Result<T>) -> Result<T, PipelineError> {
    result.map_err(|source| PipelineError { step, unit, source })
}

/// The template links known to be enabled.
#[derive(Debug, Default)]
pub struct LinkState {
    enabled: HashSet<LinkId>,
}

impl LinkState {
    pub fn is_enabled(&self, id: LinkId) -> bool {
        self.enabled.contains(&id)
    }

    fn set(
        &mut self,
        media: &dyn MediaDevice,
        topo: &Topology,
        id: LinkId,
        enable: bool,
    ) -> Result<(), PipelineError> {
        if self.is_enabled(id) == enable {
            return Ok(());
        }
        trace!("{} {:?}", if enable { "Enabling" } else { "Disabling" }, id);
        check(
            Step::SetupLink,
            id.unit(),
            media.setup_link(topo.links().get(id), enable),
        )?;
        if enable {
            self.enabled.insert(id);
        } else {
            self.enabled.remove(&id);
        }
        Ok(())
    }
}

/// The video nodes started by a submission.
#[derive(Debug, Clone)]
pub struct ActiveStreams {
    /// Input slot indices and their video nodes.
    inputs: ArrayVec<[(u8, EntityId); MAX_INPUTS]>,
    output: EntityId,
    output_started: bool,
}

impl ActiveStreams {
    fn new(topo: &Topology) -> Self {
        Self {
            inputs: ArrayVec::new(),
            output: topo.output().node,
            output_started: false,
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }
}

/// The path of input slot `slot` through the graph.
fn path(slot: &InputSlot) -> ArrayVec<[LinkId; 2]> {
    let mut links = ArrayVec::new();
    match slot.scaler {
        Some(s) => {
            links.push(LinkId::InputToScaler(slot.index, s));
            links.push(LinkId::ScalerToCompose(s, slot.index));
        }
        None => links.push(LinkId::InputToCompose(slot.index)),
    }
    links
}

/// Program the pipeline to compose `slots` into the `damage` area of
/// `target`, and start it.
///
/// On failure, the video nodes already started are stopped again.
pub fn configure(
    media: &dyn MediaDevice,
    topo: &Topology,
    links: &mut LinkState,
    slots: &[InputSlot],
    target: &SurfaceDesc,
    damage: Rect,
) -> Result<ActiveStreams, PipelineError> {
    let mut active = ActiveStreams::new(topo);
    match configure_inner(media, topo, links, slots, target, damage, &mut active) {
        Ok(()) => Ok(active),
        Err(e) => {
            abort(media, &active);
            Err(e)
        }
    }
}

fn configure_inner(
    media: &dyn MediaDevice,
    topo: &Topology,
    links: &mut LinkState,
    slots: &[InputSlot],
    target: &SurfaceDesc,
    damage: Rect,
    active: &mut ActiveStreams,
) -> Result<(), PipelineError> {
    debug!(
        "Configuring {} input(s) into {:?} of {:?}",
        slots.len(),
        damage,
        target.size
    );

    // Disconnect the units this composition doesn't use
    for i in 0..topo.num_inputs() as u8 {
        if slots.iter().any(|slot| slot.index == i) {
            continue;
        }
        let stale = links.enabled.iter().cloned().filter(|&id| match id {
            LinkId::InputToCompose(k) | LinkId::InputToScaler(k, _) => k == i,
            LinkId::ScalerToCompose(_, k) => k == i,
            LinkId::ComposeToOutput => false,
        });
        for id in stale.collect::<Vec<_>>() {
            links.set(media, topo, id, false)?;
        }
    }
    for s in 0..topo.num_scalers() as u8 {
        if slots.iter().any(|slot| slot.scaler == Some(s)) {
            continue;
        }
        let stale = links.enabled.iter().cloned().filter(|&id| match id {
            LinkId::InputToScaler(_, k) | LinkId::ScalerToCompose(k, _) => k == s,
            _ => false,
        });
        for id in stale.collect::<Vec<_>>() {
            links.set(media, topo, id, false)?;
        }
    }

    for slot in slots.iter() {
        configure_input(media, topo, links, slot)?;
    }

    // Compose and write-back
    let code = PIPELINE_MBUS_CODE;
    for id in topo.links().conflicts(LinkId::ComposeToOutput) {
        links.set(media, topo, id, false)?;
    }
    links.set(media, topo, LinkId::ComposeToOutput, true)?;

    check(
        Step::PadFormat,
        Unit::Compose,
        media.set_pad_format(topo.compose_source(), &MbusFormat::new(code, target.size)),
    )?;

    let wpf = topo.output().subdev;
    let wpf_sink = PadRef::new(wpf, PAD_SINK);
    let wpf_source = PadRef::new(wpf, PAD_SOURCE);
    check(
        Step::PadFormat,
        Unit::Output,
        media.set_pad_format(wpf_sink, &MbusFormat::new(code, target.size)),
    )?;
    check(
        Step::Crop,
        Unit::Output,
        media.set_selection(wpf_sink, SelectionTarget::Crop, damage),
    )?;
    check(
        Step::PadFormat,
        Unit::Output,
        media.set_pad_format(
            wpf_source,
            &MbusFormat::new(target.format.mbus_code(), damage.size()),
        ),
    )?;
    check(
        Step::Compose,
        Unit::Output,
        media.set_selection(wpf_source, SelectionTarget::Compose, damage),
    )?;

    let node = topo.output().node;
    prepare_node(
        media,
        node,
        Unit::Output,
        &VideoFormat::for_surface(target, target.format),
        target,
    )?;

    // Go
    for slot in slots.iter() {
        let node = topo.input(slot.index).node;
        check(
            Step::StreamOn,
            Unit::Input(slot.index),
            media.stream_on(node),
        )?;
        active.inputs.push((slot.index, node));
    }
    check(Step::StreamOn, Unit::Output, media.stream_on(node))?;
    active.output_started = true;

    Ok(())
}

fn configure_input(
    media: &dyn MediaDevice,
    topo: &Topology,
    links: &mut LinkState,
    slot: &InputSlot,
) -> Result<(), PipelineError> {
    let i = slot.index;
    let req = &slot.request;
    let unit = Unit::Input(i);
    let port = topo.input(i);
    let rpf_sink = PadRef::new(port.subdev, PAD_SINK);
    let rpf_source = PadRef::new(port.subdev, PAD_SOURCE);
    trace!("Slot {}: {:?}", i, slot);

    for id in path(slot) {
        for other in topo.links().conflicts(id) {
            links.set(media, topo, other, false)?;
        }
        links.set(media, topo, id, true)?;
    }

    check(
        Step::PadFormat,
        unit,
        media.set_pad_format(
            rpf_sink,
            &MbusFormat::new(req.read_format.mbus_code(), req.source.size),
        ),
    )?;
    check(
        Step::Control,
        unit,
        media.set_control(port.subdev, CID_ALPHA_COMPONENT, req.alpha as i32),
    )?;

    let src = req.src_rect;
    let dst = req.dst_rect;
    let (crop, compose) = if req.deinterlace {
        // The compose extent on this path has its width and height swapped.
        // Existing users depend on it.
        (
            Rect::new(src.x, src.y / 2, src.w, src.h / 2),
            Rect::new(dst.x, dst.y, dst.h, dst.w),
        )
    } else {
        (src, dst)
    };

    check(
        Step::Crop,
        unit,
        media.set_selection(rpf_sink, SelectionTarget::Crop, crop),
    )?;
    check(
        Step::PadFormat,
        unit,
        media.set_pad_format(rpf_source, &MbusFormat::new(PIPELINE_MBUS_CODE, crop.size())),
    )?;

    if let Some(s) = slot.scaler {
        let uds = topo.scaler(s);
        check(
            Step::PadFormat,
            Unit::Scaler(s),
            media.set_pad_format(
                PadRef::new(uds, PAD_SINK),
                &MbusFormat::new(PIPELINE_MBUS_CODE, crop.size()),
            ),
        )?;
        check(
            Step::PadFormat,
            Unit::Scaler(s),
            media.set_pad_format(
                PadRef::new(uds, PAD_SOURCE),
                &MbusFormat::new(PIPELINE_MBUS_CODE, dst.size()),
            ),
        )?;
    }

    let bru_sink = topo.compose_sink(i);
    check(
        Step::PadFormat,
        Unit::Compose,
        media.set_pad_format(bru_sink, &MbusFormat::new(PIPELINE_MBUS_CODE, dst.size())),
    )?;
    check(
        Step::Compose,
        Unit::Compose,
        media.set_selection(bru_sink, SelectionTarget::Compose, compose),
    )?;

    prepare_node(
        media,
        port.node,
        unit,
        &VideoFormat::for_surface(&req.source, req.read_format),
        &req.source,
    )
}

/// Set the format of `node` and queue `surface` on it.
fn prepare_node(
    media: &dyn MediaDevice,
    node: EntityId,
    unit: Unit,
    format: &VideoFormat,
    surface: &SurfaceDesc,
) -> Result<(), PipelineError> {
    check(Step::RequestBuffers, unit, media.request_buffers(node, 0))?;
    check(Step::VideoFormat, unit, media.set_video_format(node, format))?;
    let count = check(Step::RequestBuffers, unit, media.request_buffers(node, 1))?;
    if count == 0 {
        return Err(PipelineError {
            step: Step::RequestBuffers,
            unit,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        });
    }
    check(
        Step::QueueBuffer,
        unit,
        media.queue_buffer(node, &surface.planes),
    )
}

/// Dequeue the buffers of a completed submission and stop its video nodes.
///
/// Every step is attempted even if an earlier one fails. Returns the first
/// error.
pub fn retire(media: &dyn MediaDevice, active: &ActiveStreams) -> Result<(), PipelineError> {
    let mut first_error = None;
    let mut note = |result: Result<(), PipelineError>| {
        if let Err(e) = result {
            warn!("Retiring the submission: {}", e);
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    };

    note(check(
        Step::DequeueBuffer,
        Unit::Output,
        media.dequeue_buffer(active.output),
    ));
    for &(i, node) in active.inputs.iter() {
        note(check(
            Step::DequeueBuffer,
            Unit::Input(i),
            media.dequeue_buffer(node),
        ));
    }
    for &(i, node) in active.inputs.iter() {
        note(check(
            Step::StreamOff,
            Unit::Input(i),
            media.stream_off(node),
        ));
    }
    note(check(
        Step::StreamOff,
        Unit::Output,
        media.stream_off(active.output),
    ));

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Stop the video nodes started so far, without dequeueing anything.
pub fn abort(media: &dyn MediaDevice, active: &ActiveStreams) {
    for &(_, node) in active.inputs.iter() {
        if let Err(e) = media.stream_off(node) {
            warn!("Stopping {} failed: {}", node, e);
        }
    }
    if active.output_started {
        if let Err(e) = media.stream_off(active.output) {
            warn!("Stopping {} failed: {}", active.output, e);
        }
    }
}

/// Disable every enabled link between the device's units, including ones
/// left behind by another process.
pub fn reset_links(
    media: &dyn MediaDevice,
    topo: &Topology,
    links: &mut LinkState,
) -> io::Result<()> {
    for entity in topo.entities() {
        for link in media.links(entity.id)? {
            if link.flags.contains(LinkFlags::ENABLED)
                && !link.flags.contains(LinkFlags::IMMUTABLE)
            {
                trace!("Disabling {:?} -> {:?}", link.source, link.sink);
                media.setup_link(&link, false)?;
            }
        }
    }
    links.enabled.clear();
    Ok(())
}
