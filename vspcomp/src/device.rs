//! The compositor device: batches draws into compositions and drives their
//! lifecycle.
//!
//! Draws into the same target are accumulated into one *composition* as long
//! as they fit into the pipeline (one input port per source, one scaler per
//! scaled source). A composition is programmed into the hardware only when it
//! is flushed, which happens when
//!
//!  - the caller asks for it (`flush`, `sync`),
//!  - a draw targets a different surface,
//!  - or a draw doesn't fit, in which case the draw is retried once in a
//!    fresh composition.
//!
//! At most one composition is open and at most one is in flight at a time.
//! Completion is detected by a notifier thread, which retires the submission
//! and wakes up whoever is waiting for the device to become idle.
//!
//! Unless the first draw of a composition covers the whole target opaquely,
//! the target itself is read back as the bottom layer (the *seed*) so that
//! pixels not touched by the draws are preserved.
use log::{debug, error, info, trace, warn};
use rgb::RGBA8;
use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    alloc::{Allocator, Phase, SlotRequest},
    config::{entity_prefix, Config, MIN_SCALE_RATIO},
    error::{DrawError, PipelineError, ProbeError, Step},
    format::PixelFormat,
    geom::{Damage, Rect},
    media::{
        topology::{Topology, Unit},
        DmaAllocator, MediaDevice,
    },
    pipeline::{self, ActiveStreams, LinkState},
    scale::{self, ScratchPool},
    surface::SurfaceDesc,
};

/// The number of times a draw is tried, flushing the open composition in
/// between.
const MAX_ATTEMPTS: usize = 2;

/// How long the notifier thread blocks in one `wait_done` call.
const NOTIFIER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How the alpha channel of a blit source is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaMode {
    /// The source is opaque. Its alpha channel, if any, is ignored.
    Opaque,
    /// Blend using the source's alpha channel.
    Channel,
    /// Ignore the source's alpha channel and blend with a constant alpha.
    Constant(u8),
}

impl AlphaMode {
    /// The format an input port should read a surface of `format` as, and the
    /// value of its alpha control.
    fn read_as(self, format: PixelFormat) -> (PixelFormat, u8) {
        match self {
            AlphaMode::Opaque => (format.opaque_variant(), 255),
            AlphaMode::Channel => (format, 255),
            AlphaMode::Constant(alpha) => (format.opaque_variant(), alpha),
        }
    }

    fn is_opaque(self, format: PixelFormat) -> bool {
        match self {
            AlphaMode::Opaque => true,
            AlphaMode::Channel => !format.has_alpha(),
            AlphaMode::Constant(alpha) => alpha == 255,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitParams {
    pub alpha: AlphaMode,
    /// Read only the top field of the source rectangle.
    pub deinterlace: bool,
}

impl Default for BlitParams {
    fn default() -> Self {
        Self {
            alpha: AlphaMode::Opaque,
            deinterlace: false,
        }
    }
}

/// Counters for diagnostics and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    /// Compositions flushed, including discarded and failed ones.
    pub flushes: u64,
    /// Compositions handed to the hardware.
    pub submissions: u64,
    /// Draws that didn't fit and caused a flush.
    pub retries: u64,
    /// Intermediate scaling passes.
    pub passes: u64,
    /// Compositions discarded because they had no sources.
    pub discarded: u64,
    /// Compositions the hardware refused to be configured for.
    pub failures: u64,
}

/// The externally observable state of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub phase: Phase,
    /// The number of input ports in use, including the seed.
    pub used_inputs: usize,
    pub used_scalers: usize,
    /// The target of the open composition.
    pub target: Option<SurfaceDesc>,
    pub outstanding: bool,
}

#[derive(Debug)]
struct CompositionBuffer {
    target: SurfaceDesc,
    damage: Damage,
    generation: u64,
}

impl CompositionBuffer {
    fn submit(self, damage: Rect, streams: ActiveStreams) -> Submission {
        Submission {
            target: self.target,
            damage,
            generation: self.generation,
            streams,
        }
    }
}

/// A composition in flight.
#[derive(Debug)]
struct Submission {
    target: SurfaceDesc,
    damage: Rect,
    generation: u64,
    streams: ActiveStreams,
}

impl Submission {
    /// Dequeue the buffers and stop the video nodes.
    fn retire(self, media: &dyn MediaDevice) -> Result<u64, PipelineError> {
        trace!(
            "Retiring composition {} ({:?} of {:?})",
            self.generation,
            self.damage,
            self.target.size
        );
        pipeline::retire(media, &self.streams).map(|()| self.generation)
    }

    /// Stop the video nodes without waiting for completion.
    fn cancel(self, media: &dyn MediaDevice) -> u64 {
        warn!("Cancelling composition {}", self.generation);
        pipeline::abort(media, &self.streams);
        self.generation
    }
}

struct DeviceState<B> {
    alloc: Allocator,
    composition: Option<CompositionBuffer>,
    submission: Option<Submission>,
    links: LinkState,
    scratch: ScratchPool<B>,
    next_generation: u64,
    /// Every composition up to this one has retired or was discarded.
    retired_generation: u64,
    stats: DeviceStats,
    running: bool,
}

type StateGuard<'a, B> = MutexGuard<'a, DeviceState<B>>;

struct Shared<M, A: DmaAllocator> {
    media: M,
    alloc: A,
    topo: Topology,
    config: Config,
    state: Mutex<DeviceState<A::Buffer>>,
    /// Signalled when a submission is made or the device is detached.
    submitted: Condvar,
    /// Signalled when a submission retires.
    idle: Condvar,
}

/// A compositor attached to a media device.
pub struct Device<M: MediaDevice, A: DmaAllocator> {
    shared: Arc<Shared<M, A>>,
    notifier: Option<JoinHandle<()>>,
}

impl<M: MediaDevice, A: DmaAllocator> fmt::Debug for Device<M, A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("prefix", &self.shared.topo.prefix())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl<M: MediaDevice, A: DmaAllocator> Device<M, A> {
    /// Attach to `media` if it's a supported device.
    ///
    /// Every link between the device's units is disabled, and a notifier
    /// thread is started.
    pub fn attach(media: M, alloc: A, config: Config) -> Result<Self, ProbeError> {
        if config.max_scale_ratio < MIN_SCALE_RATIO {
            return Err(ProbeError::InvalidConfig(
                "the per-pass scale limit must be at least 2",
            ));
        }

        let info = media.device_info().map_err(ProbeError::DeviceAbsent)?;
        let prefix = match entity_prefix(&info.bus_info) {
            Some(prefix) => prefix.to_owned(),
            None => {
                debug!("Ignoring {:?} ({:?})", info.bus_info, info.model);
                return Err(ProbeError::UnsupportedFamily {
                    bus_info: info.bus_info.clone(),
                });
            }
        };

        let topo = Topology::discover(&media, &prefix, &config)?;
        let mut links = LinkState::default();
        pipeline::reset_links(&media, &topo, &mut links)?;

        let state = DeviceState {
            alloc: Allocator::new(topo.num_inputs(), topo.num_scalers()),
            composition: None,
            submission: None,
            links,
            scratch: ScratchPool::new(config.scratch_buffers),
            next_generation: 1,
            retired_generation: 0,
            stats: DeviceStats::default(),
            running: true,
        };

        info!(
            "Attached to {:?} ({} {}): {} inputs, {} scalers",
            prefix,
            info.driver,
            info.model,
            topo.num_inputs(),
            topo.num_scalers()
        );

        let shared = Arc::new(Shared {
            media,
            alloc,
            topo,
            config,
            state: Mutex::new(state),
            submitted: Condvar::new(),
            idle: Condvar::new(),
        });

        let notifier = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("vspcomp notifier".to_owned())
                .spawn(move || shared.notifier_main())?
        };

        Ok(Self {
            shared,
            notifier: Some(notifier),
        })
    }

    /// Flush and drain the device, disable its links and stop the notifier
    /// thread. Does nothing if already detached.
    pub fn detach(&mut self) {
        let notifier = match self.notifier.take() {
            Some(notifier) => notifier,
            None => return,
        };
        let shared = &*self.shared;

        {
            let state = shared.lock();
            let state = shared.flush_locked(state).unwrap_or_else(|e| {
                warn!("Flushing on detach failed: {}", e);
                shared.lock()
            });
            let mut state = shared.wait_idle_locked(state).unwrap_or_else(|e| {
                warn!("Draining on detach failed: {}", e);
                shared.lock()
            });

            if let Some(submission) = state.submission.take() {
                let generation = submission.cancel(&shared.media);
                shared.retired(&mut state, generation);
            }

            let st = &mut *state;
            if let Err(e) = pipeline::reset_links(&shared.media, &shared.topo, &mut st.links) {
                warn!("Disabling the links on detach failed: {}", e);
            }
            st.scratch.clear();
            st.running = false;
            shared.submitted.notify_all();
        }

        if notifier.join().is_err() {
            warn!("The notifier thread panicked");
        }
        info!("Detached from {:?}", shared.topo.prefix());
    }

    pub fn is_attached(&self) -> bool {
        self.notifier.is_some()
    }

    pub fn media(&self) -> &M {
        &self.shared.media
    }

    pub fn topology(&self) -> &Topology {
        &self.shared.topo
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Make sure a composition targeting `target` is open.
    ///
    /// A composition open for another target is flushed first. A new
    /// composition is seeded with `target` unless `coverage` (the rectangle
    /// the first draw writes) covers all of it and `opaque` is set.
    pub fn open(&self, target: &SurfaceDesc, coverage: Rect, opaque: bool) -> Result<(), DrawError> {
        let state = self.shared.lock();
        self.shared.open_locked(state, target, coverage, opaque)?;
        Ok(())
    }

    /// Fill `rect` of `target` with `color`, blending it if `blend` is set.
    pub fn fill(
        &self,
        target: &SurfaceDesc,
        rect: Rect,
        color: RGBA8,
        blend: bool,
    ) -> Result<(), DrawError> {
        self.shared.fill(target, rect, color, blend)
    }

    /// Copy `src_rect` of `source` to `(dx, dy)` of `target`.
    pub fn blit(
        &self,
        target: &SurfaceDesc,
        source: &SurfaceDesc,
        src_rect: Rect,
        dx: i32,
        dy: i32,
        params: BlitParams,
    ) -> Result<(), DrawError> {
        let dst_rect = Rect::new(dx, dy, src_rect.w, src_rect.h);
        self.shared
            .stretch_blit(target, source, src_rect, dst_rect, params)
    }

    /// Copy `src_rect` of `source` to `dst_rect` of `target`, resizing it.
    pub fn stretch_blit(
        &self,
        target: &SurfaceDesc,
        source: &SurfaceDesc,
        src_rect: Rect,
        dst_rect: Rect,
        params: BlitParams,
    ) -> Result<(), DrawError> {
        self.shared
            .stretch_blit(target, source, src_rect, dst_rect, params)
    }

    /// Hand the open composition to the hardware. Doesn't wait for it to
    /// complete.
    pub fn flush(&self) -> Result<(), DrawError> {
        let state = self.shared.lock();
        self.shared.flush_locked(state)?;
        Ok(())
    }

    /// Wait until no submission is in flight.
    pub fn wait_idle(&self) -> Result<(), DrawError> {
        let state = self.shared.lock();
        self.shared.wait_idle_locked(state)?;
        Ok(())
    }

    /// Retire the submission in flight, waiting for it to complete. Does
    /// nothing if there is none.
    pub fn finish(&self) -> Result<(), DrawError> {
        self.shared.finish()
    }

    /// Flush the open composition and wait until it retires.
    pub fn sync(&self) -> Result<(), DrawError> {
        self.shared.sync()
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.shared.lock();
        Snapshot {
            phase: state.alloc.phase(),
            used_inputs: state.alloc.num_used(),
            used_scalers: (0..state.alloc.num_scalers() as u8)
                .filter(|&s| state.alloc.scaler_owner(s).is_some())
                .count(),
            target: state.composition.as_ref().map(|c| c.target.clone()),
            outstanding: state.submission.is_some(),
        }
    }

    pub fn stats(&self) -> DeviceStats {
        self.shared.lock().stats
    }
}

impl<M: MediaDevice, A: DmaAllocator> Drop for Device<M, A> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<M: MediaDevice, A: DmaAllocator> Shared<M, A> {
    fn lock(&self) -> StateGuard<'_, A::Buffer> {
        self.state.lock().unwrap()
    }

    fn notifier_main(&self) {
        let node = self.topo.output().node;
        let mut state = self.lock();
        while state.running {
            let generation = match &state.submission {
                Some(submission) => submission.generation,
                None => {
                    state = self.submitted.wait(state).unwrap();
                    continue;
                }
            };
            drop(state);

            let result = self.media.wait_done(node, NOTIFIER_POLL_INTERVAL);

            state = self.lock();
            match result {
                Ok(true) => {
                    self.retire_locked(&mut state, generation);
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Waiting for composition {} failed: {}", generation, e);
                    self.cancel_locked(&mut state, generation);
                }
            }
        }
        trace!("The notifier thread is exiting");
    }

    /// Record that `generation` is no longer in flight.
    fn retired(&self, state: &mut DeviceState<A::Buffer>, generation: u64) {
        state.alloc.reset();
        state.retired_generation = state.retired_generation.max(generation);
        self.idle.notify_all();
    }

    /// Retire the submission in flight if it's `generation`.
    fn retire_locked(&self, state: &mut DeviceState<A::Buffer>, generation: u64) -> bool {
        let submission = match state.submission.take() {
            Some(s) if s.generation == generation => s,
            other => {
                state.submission = other;
                return false;
            }
        };
        if let Err(e) = submission.retire(&self.media) {
            warn!("Composition {} did not retire cleanly: {}", generation, e);
        }
        self.retired(state, generation);
        true
    }

    fn cancel_locked(&self, state: &mut DeviceState<A::Buffer>, generation: u64) {
        let submission = match state.submission.take() {
            Some(s) if s.generation == generation => s,
            other => {
                state.submission = other;
                return;
            }
        };
        submission.cancel(&self.media);
        state.stats.failures += 1;
        self.retired(state, generation);
    }

    fn open_locked<'a>(
        &'a self,
        mut state: StateGuard<'a, A::Buffer>,
        target: &SurfaceDesc,
        coverage: Rect,
        opaque: bool,
    ) -> Result<StateGuard<'a, A::Buffer>, DrawError> {
        if !state.running {
            return Err(DrawError::Detached);
        }
        if !target.is_well_formed() {
            return Err(DrawError::Unsupported("malformed destination"));
        }

        if let Some(composition) = &state.composition {
            if composition.target.same_target(target) {
                return Ok(state);
            }
            debug!(
                "Switching the target from {:?} to {:?}",
                composition.target.planes[0].buf, target.planes[0].buf
            );
            state = self.flush_locked(state)?;
        }

        let mut state = self.wait_idle_locked(state)?;

        let generation = state.next_generation;
        state.next_generation += 1;
        state.alloc.open();
        state.composition = Some(CompositionBuffer {
            target: target.clone(),
            damage: Damage::new(),
            generation,
        });

        let bounds = target.bounds();
        let seeded = !(opaque && coverage.contains_rect(&bounds));
        if seeded {
            let seed = SlotRequest {
                source: target.clone(),
                read_format: target.format,
                src_rect: bounds,
                dst_rect: bounds,
                alpha: 255,
                deinterlace: false,
                seed: true,
            };
            if let Err(reason) = state.alloc.reserve(seed) {
                // Only possible with no input ports at all
                warn!("Could not seed composition {}: {}", generation, reason);
                state.composition = None;
                self.retired(&mut state, generation);
                return Err(DrawError::Exhausted);
            }
        }

        trace!(
            "Opened composition {} for {:?} (seeded: {})",
            generation,
            target.size,
            seeded
        );
        Ok(state)
    }

    fn flush_locked<'a>(
        &'a self,
        mut state: StateGuard<'a, A::Buffer>,
    ) -> Result<StateGuard<'a, A::Buffer>, DrawError> {
        let composition = match state.composition.take() {
            Some(composition) => composition,
            None => return Ok(state),
        };
        let generation = composition.generation;
        state.stats.flushes += 1;

        let damage = match composition.damage.bounds() {
            Some(damage) if state.alloc.num_sources() > 0 => damage,
            _ => {
                trace!("Discarding empty composition {}", generation);
                state.stats.discarded += 1;
                self.retired(&mut state, generation);
                return Ok(state);
            }
        };

        // The seed only has to provide the area being written back
        for slot in state.alloc.slots_mut() {
            if slot.request.seed {
                slot.request.src_rect = damage;
                slot.request.dst_rect = damage;
            }
        }

        let st = &mut *state;
        let result = pipeline::configure(
            &self.media,
            &self.topo,
            &mut st.links,
            st.alloc.slots(),
            &composition.target,
            damage,
        );

        match result {
            Ok(streams) => {
                debug!(
                    "Submitted composition {} with {} input(s)",
                    generation,
                    streams.num_inputs()
                );
                st.alloc.submit();
                st.submission = Some(composition.submit(damage, streams));
                st.stats.submissions += 1;
                self.submitted.notify_all();
                Ok(state)
            }
            Err(e) => {
                error!("Could not configure composition {}: {}", generation, e);
                self.topo.dump(&self.media);
                st.stats.failures += 1;
                self.retired(st, generation);
                Err(e.into())
            }
        }
    }

    fn wait_idle_locked<'a>(
        &'a self,
        mut state: StateGuard<'a, A::Buffer>,
    ) -> Result<StateGuard<'a, A::Buffer>, DrawError> {
        let deadline = Instant::now() + self.config.completion_timeout;
        while let Some(submission) = &state.submission {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Composition {} did not complete within {:?}",
                    submission.generation, self.config.completion_timeout
                );
                return Err(DrawError::Timeout);
            }
            state = self.idle.wait_timeout(state, deadline - now).unwrap().0;
        }
        Ok(state)
    }

    fn finish(&self) -> Result<(), DrawError> {
        let generation = match &self.lock().submission {
            Some(submission) => submission.generation,
            None => return Ok(()),
        };

        let result = self
            .media
            .wait_done(self.topo.output().node, self.config.completion_timeout);

        let mut state = self.lock();
        match result {
            Ok(true) => {
                self.retire_locked(&mut state, generation);
                Ok(())
            }
            Ok(false) => {
                let outstanding = match &state.submission {
                    Some(submission) => submission.generation == generation,
                    None => false,
                };
                if outstanding {
                    Err(DrawError::Timeout)
                } else {
                    Ok(())
                }
            }
            Err(source) => {
                self.cancel_locked(&mut state, generation);
                Err(DrawError::Pipeline(PipelineError {
                    step: Step::DequeueBuffer,
                    unit: Unit::Output,
                    source,
                }))
            }
        }
    }

    fn sync(&self) -> Result<(), DrawError> {
        let state = self.lock();
        let state = self.flush_locked(state)?;
        self.wait_idle_locked(state)?;
        Ok(())
    }

    /// Add `request` to the composition for `target`, flushing and retrying
    /// once if it doesn't fit.
    fn compose(
        &self,
        target: &SurfaceDesc,
        request: SlotRequest,
        opaque: bool,
    ) -> Result<(), DrawError> {
        let dst_rect = request.dst_rect;
        let mut state = self.lock();

        for attempt in 1..=MAX_ATTEMPTS {
            state = self.open_locked(state, target, dst_rect, opaque)?;

            match state.alloc.reserve(request.clone()) {
                Ok(slot) => {
                    let st = &mut *state;
                    if let Some(composition) = &mut st.composition {
                        composition.damage.add(dst_rect);
                        for plane in request.source.planes.iter().chain(target.planes.iter()) {
                            st.scratch.touch(plane.buf, composition.generation);
                        }
                    }
                    trace!(
                        "Slot {}: {:?} {:?} -> {:?}",
                        slot,
                        request.source.planes[0].buf,
                        request.src_rect,
                        dst_rect
                    );
                    return Ok(());
                }
                Err(reason) if attempt < MAX_ATTEMPTS => {
                    debug!("{}; flushing and retrying", reason);
                    state.stats.retries += 1;
                    state = self.flush_locked(state)?;
                }
                Err(reason) => {
                    debug!("{} even in a fresh composition", reason);
                }
            }
        }

        Err(DrawError::Exhausted)
    }

    /// Get a scratch surface, optionally filled with `color` (opaque).
    fn scratch(
        &self,
        format: PixelFormat,
        size: [u32; 2],
        color: Option<RGBA8>,
    ) -> Result<SurfaceDesc, DrawError> {
        let mut state = self.lock();
        if !state.running {
            return Err(DrawError::Detached);
        }

        let index = state.scratch.peek();
        if state.scratch.is_busy(index, state.retired_generation) {
            debug!("Scratch buffer {} is still in use; synchronizing", index);
            state = self.flush_locked(state)?;
            state = self.wait_idle_locked(state)?;
        }

        let st = &mut *state;
        let (index, desc) = st
            .scratch
            .take(&self.alloc, format, size)
            .map_err(DrawError::Alloc)?;

        if let Some(color) = color {
            let pitch = desc.pitch() as usize;
            let row_len = size[0] as usize * 4;
            let pixel = [color.b, color.g, color.r, 255];
            st.scratch
                .write(index, &mut |bytes: &mut [u8]| {
                    for y in 0..size[1] as usize {
                        let row = &mut bytes[y * pitch..y * pitch + row_len];
                        for px in row.chunks_exact_mut(4) {
                            px.copy_from_slice(&pixel);
                        }
                    }
                })
                .map_err(DrawError::Alloc)?;
        }

        Ok(desc)
    }

    fn fill(
        &self,
        target: &SurfaceDesc,
        rect: Rect,
        color: RGBA8,
        blend: bool,
    ) -> Result<(), DrawError> {
        if !target.is_well_formed() {
            return Err(DrawError::Unsupported("malformed destination"));
        }
        if rect.is_empty() {
            return Ok(());
        }
        if !target.bounds().contains_rect(&rect) {
            return Err(DrawError::Unsupported("rectangle is out of bounds"));
        }

        let alpha = if blend { color.a } else { 255 };
        let tile_size = scale::fill_tile_size(
            rect.size(),
            self.config.fill_tile_size,
            self.config.max_scale_ratio,
        );
        let tile = self.scratch(PixelFormat::Rgb32, tile_size, Some(color))?;

        let request = SlotRequest {
            src_rect: tile.bounds(),
            source: tile,
            read_format: PixelFormat::Rgb32,
            dst_rect: rect,
            alpha,
            deinterlace: false,
            seed: false,
        };
        self.compose(target, request, alpha == 255)
    }

    fn stretch_blit(
        &self,
        target: &SurfaceDesc,
        source: &SurfaceDesc,
        src_rect: Rect,
        dst_rect: Rect,
        params: BlitParams,
    ) -> Result<(), DrawError> {
        if !target.is_well_formed() {
            return Err(DrawError::Unsupported("malformed destination"));
        }
        if !source.is_well_formed() {
            return Err(DrawError::Unsupported("malformed source"));
        }
        if src_rect.is_empty() || dst_rect.is_empty() {
            return Ok(());
        }
        if !source.bounds().contains_rect(&src_rect) {
            return Err(DrawError::Unsupported("source rectangle is out of bounds"));
        }
        if !target.bounds().contains_rect(&dst_rect) {
            return Err(DrawError::Unsupported("rectangle is out of bounds"));
        }

        let mut cropped = src_rect.size();
        if params.deinterlace {
            cropped[1] /= 2;
            if cropped[1] == 0 {
                return Err(DrawError::Unsupported("the field is empty"));
            }
        }

        let opaque = params.alpha.is_opaque(source.format);
        let passes = scale::plan_passes(cropped, dst_rect.size(), self.config.max_scale_ratio);

        let mut current = source.clone();
        let mut current_rect = src_rect;
        let mut deinterlace = params.deinterlace;

        if !passes.is_empty() {
            debug!(
                "Scaling {:?} to {:?} through {:?}",
                cropped,
                dst_rect.size(),
                passes
            );
        }

        // Each intermediate pass is a composition of its own, keeping the
        // alpha channel of the source as is
        for size in passes {
            let scratch = self.scratch(PixelFormat::Argb8888, size, None)?;
            let request = SlotRequest {
                read_format: current.format,
                source: current,
                src_rect: current_rect,
                dst_rect: scratch.bounds(),
                alpha: 255,
                deinterlace,
                seed: false,
            };
            self.compose(&scratch, request, true)?;
            self.sync()?;
            self.lock().stats.passes += 1;

            current_rect = scratch.bounds();
            current = scratch;
            deinterlace = false;
        }

        let (read_format, alpha) = params.alpha.read_as(current.format);
        let request = SlotRequest {
            source: current,
            read_format,
            src_rect: current_rect,
            dst_rect,
            alpha,
            deinterlace,
            seed: false,
        };
        self.compose(target, request, opaque)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::{Call, MockAllocator, MockMedia};

    fn attach(media: &MockMedia) -> Device<MockMedia, MockAllocator> {
        let _ = env_logger::builder().is_test(true).try_init();
        Device::attach(media.clone(), MockAllocator::new(media), Config::default()).unwrap()
    }

    #[test]
    fn rejects_other_families() {
        let media = MockMedia::vsp("fe928000.vsp", 4, 1, 4);
        media.set_bus_info("platform:fe9a0000.fdp1");
        match Device::attach(media.clone(), MockAllocator::new(&media), Config::default()) {
            Err(ProbeError::UnsupportedFamily { bus_info }) => {
                assert_eq!(bus_info, "platform:fe9a0000.fdp1")
            }
            other => panic!("{:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn open_reuses_composition_for_same_target() {
        let media = MockMedia::vsp("fe928000.vsp", 4, 1, 4);
        let device = attach(&media);
        let target = media.alloc_surface(PixelFormat::Argb8888, [32, 32]);

        device.open(&target, Rect::new(0, 0, 4, 4), true).unwrap();
        device.open(&target, Rect::new(0, 0, 4, 4), true).unwrap();
        let snapshot = device.snapshot();
        assert_eq!(snapshot.phase, Phase::Open);
        // Just the seed
        assert_eq!(snapshot.used_inputs, 1);
        assert_eq!(snapshot.target.as_ref(), Some(&target));
    }

    #[test]
    fn opaque_cover_is_not_seeded() {
        let media = MockMedia::vsp("fe928000.vsp", 4, 1, 4);
        let device = attach(&media);
        let target = media.alloc_surface(PixelFormat::Argb8888, [32, 32]);

        device.open(&target, target.bounds(), true).unwrap();
        assert_eq!(device.snapshot().used_inputs, 0);
    }

    #[test]
    fn empty_composition_is_discarded() {
        let media = MockMedia::vsp("fe928000.vsp", 4, 1, 4);
        let device = attach(&media);
        let target = media.alloc_surface(PixelFormat::Argb8888, [32, 32]);
        media.take_calls();

        device.open(&target, Rect::new(0, 0, 4, 4), false).unwrap();
        device.flush().unwrap();

        assert_eq!(media.calls(), vec![]);
        assert_eq!(device.stats().discarded, 1);
        assert_eq!(device.snapshot().phase, Phase::Idle);
    }

    #[test]
    fn detach_is_idempotent() {
        let media = MockMedia::vsp("fe928000.vsp", 4, 1, 4);
        let mut device = attach(&media);
        let target = media.alloc_surface(PixelFormat::Argb8888, [32, 32]);
        device
            .fill(&target, Rect::new(0, 0, 8, 8), RGBA8::new(1, 2, 3, 255), false)
            .unwrap();

        device.detach();
        assert!(!device.is_attached());
        assert_eq!(media.runs(), 1);
        media.take_calls();

        device.detach();
        assert_eq!(media.calls(), vec![]);
        match device.fill(&target, Rect::new(0, 0, 8, 8), RGBA8::new(0, 0, 0, 255), false) {
            Err(DrawError::Detached) => {}
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn detach_disables_links() {
        let media = MockMedia::vsp("fe928000.vsp", 4, 1, 4);
        let mut device = attach(&media);
        let target = media.alloc_surface(PixelFormat::Argb8888, [32, 32]);
        device
            .fill(&target, Rect::new(0, 0, 8, 8), RGBA8::new(1, 2, 3, 255), false)
            .unwrap();
        device.sync().unwrap();

        let topo = device.topology().clone();
        device.detach();
        for id in topo.links().ids() {
            let link = topo.links().get(id);
            assert!(!media.is_link_enabled(link.source, link.sink), "{:?}", id);
        }
        assert!(media
            .calls()
            .iter()
            .any(|c| matches!(c, Call::SetupLink { enable: false, .. })));
    }

    #[test]
    fn detach_cancels_submission_in_flight() {
        let _ = env_logger::builder().is_test(true).try_init();
        let media = MockMedia::vsp("fe928000.vsp", 4, 1, 4);
        let config = Config::default().with_completion_timeout(Duration::from_millis(100));
        let mut device =
            Device::attach(media.clone(), MockAllocator::new(&media), config).unwrap();
        let target = media.alloc_surface(PixelFormat::Argb8888, [32, 32]);

        media.set_auto_complete(false);
        device
            .fill(&target, Rect::new(0, 0, 8, 8), RGBA8::new(1, 2, 3, 255), false)
            .unwrap();
        device.flush().unwrap();
        assert!(device.snapshot().outstanding);

        let topo = device.topology().clone();
        let output = topo.output().node;
        let start = Instant::now();
        // Returns only after the notifier thread has been joined
        device.detach();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!device.is_attached());

        // Stopped, never executed
        assert_eq!(media.runs(), 0);
        assert!(media.calls().contains(&Call::StreamOff { node: output }));
        assert!(!media.complete());

        for id in topo.links().ids() {
            let link = topo.links().get(id);
            assert!(!media.is_link_enabled(link.source, link.sink), "{:?}", id);
        }

        let snapshot = device.snapshot();
        assert!(!snapshot.outstanding);
        assert_eq!(snapshot.phase, Phase::Idle);
        assert_eq!(snapshot.used_inputs, 0);
    }

    #[test]
    fn rejects_scale_limit_below_two() {
        let media = MockMedia::vsp("fe928000.vsp", 4, 1, 4);
        for &ratio in &[0, 1] {
            let config = Config {
                max_scale_ratio: ratio,
                ..Config::default()
            };
            match Device::attach(media.clone(), MockAllocator::new(&media), config) {
                Err(ProbeError::InvalidConfig(_)) => {}
                other => panic!("{:?}", other.map(|_| ())),
            }
        }
    }

    #[test]
    fn clamped_scale_limit_still_draws() {
        let _ = env_logger::builder().is_test(true).try_init();
        let media = MockMedia::vsp("fe928000.vsp", 4, 1, 4);
        let config = Config::default().with_max_scale_ratio(0);
        let device = Device::attach(media.clone(), MockAllocator::new(&media), config).unwrap();
        assert_eq!(device.config().max_scale_ratio, 2);

        let target = media.alloc_surface(PixelFormat::Argb8888, [16, 16]);
        let source = media.alloc_surface(PixelFormat::Rgb32, [32, 32]);
        device
            .stretch_blit(
                &target,
                &source,
                Rect::new(0, 0, 32, 32),
                Rect::new(0, 0, 16, 16),
                BlitParams::default(),
            )
            .unwrap();
        device
            .fill(&target, Rect::new(0, 0, 16, 16), RGBA8::new(1, 2, 3, 255), false)
            .unwrap();
        device.sync().unwrap();
        assert_eq!(device.stats().submissions, 2);
    }

    #[test]
    fn malformed_surfaces_are_declined() {
        let media = MockMedia::vsp("fe928000.vsp", 4, 1, 4);
        let device = attach(&media);
        let good = media.alloc_surface(PixelFormat::Argb8888, [16, 16]);
        let mut bad = good.clone();
        bad.planes.clear();

        let color = RGBA8::new(1, 2, 3, 255);
        match device.fill(&bad, Rect::new(0, 0, 4, 4), color, false) {
            Err(DrawError::Unsupported(_)) => {}
            other => panic!("{:?}", other),
        }
        match device.blit(&good, &bad, Rect::new(0, 0, 4, 4), 0, 0, BlitParams::default()) {
            Err(DrawError::Unsupported(_)) => {}
            other => panic!("{:?}", other),
        }
        match device.blit(&bad, &good, Rect::new(0, 0, 4, 4), 0, 0, BlitParams::default()) {
            Err(DrawError::Unsupported(_)) => {}
            other => panic!("{:?}", other),
        }
        match device.open(&bad, bad.bounds(), true) {
            Err(DrawError::Unsupported(_)) => {}
            other => panic!("{:?}", other),
        }

        assert_eq!(device.snapshot().phase, Phase::Idle);
        assert_eq!(media.runs(), 0);
    }
}
