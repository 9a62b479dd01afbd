//! Typed handles to the processing units of the pipeline.
//!
//! The media graph is looked up by entity names once, at attach time. After
//! that, everything refers to units by index and to links by [`LinkId`].
//!
//! ```text
//!  rpf.0 input ─▶ rpf.0 ─┬──────────────▶ bru:0 ┐
//!                        └─▶ uds.0 ─┬───▶ bru:1 │
//!  rpf.1 input ─▶ rpf.1 ─┬──────────┘     ...   ├─ bru:N ─▶ wpf.0 ─▶ wpf.0 output
//!                        └──────────────▶ bru:1 ┘
//! ```
use arrayvec::ArrayVec;
use itertools::iproduct;
use log::{debug, error};
use std::{collections::HashMap, fmt, iter::once};

use super::{EntityDesc, EntityId, LinkDesc, MediaDevice, PadRef};
use crate::{
    config::{Config, MAX_INPUTS, MAX_SCALERS},
    error::ProbeError,
};

/// Subdevice pad indices shared by the input, scaler and output units.
pub const PAD_SINK: u16 = 0;
pub const PAD_SOURCE: u16 = 1;

/// A processing unit, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Input(u8),
    Scaler(u8),
    Compose,
    Output,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Unit::Input(i) => write!(f, "rpf.{}", i),
            Unit::Scaler(i) => write!(f, "uds.{}", i),
            Unit::Compose => write!(f, "bru"),
            Unit::Output => write!(f, "wpf.0"),
        }
    }
}

/// A subdevice and the video node buffers for it are queued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    pub subdev: EntityId,
    pub node: EntityId,
}

/// Identifies one of the configurable links of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkId {
    /// `rpf.i` → `bru:i`
    InputToCompose(u8),
    /// `rpf.i` → `uds.s`
    InputToScaler(u8, u8),
    /// `uds.s` → `bru:i`
    ScalerToCompose(u8, u8),
    /// `bru` → `wpf.0`
    ComposeToOutput,
}

impl LinkId {
    /// The unit on the source side of the link.
    pub fn unit(self) -> Unit {
        match self {
            LinkId::InputToCompose(i) | LinkId::InputToScaler(i, _) => Unit::Input(i),
            LinkId::ScalerToCompose(s, _) => Unit::Scaler(s),
            LinkId::ComposeToOutput => Unit::Compose,
        }
    }

    /// Enumerate every link of a pipeline with the given numbers of units, in
    /// the order of `LinkTable`'s storage.
    fn all(num_inputs: u8, num_scalers: u8) -> impl Iterator<Item = LinkId> {
        (0..num_inputs)
            .map(LinkId::InputToCompose)
            .chain(
                iproduct!(0..num_inputs, 0..num_scalers).map(|(i, s)| LinkId::InputToScaler(i, s)),
            )
            .chain(
                iproduct!(0..num_scalers, 0..num_inputs)
                    .map(|(s, i)| LinkId::ScalerToCompose(s, i)),
            )
            .chain(once(LinkId::ComposeToOutput))
    }
}

/// The link templates, indexed by `LinkId`.
#[derive(Debug, Clone)]
pub struct LinkTable {
    num_inputs: u8,
    num_scalers: u8,
    links: Vec<LinkDesc>,
}

impl LinkTable {
    fn index(&self, id: LinkId) -> usize {
        let (n, ns) = (self.num_inputs as usize, self.num_scalers as usize);
        match id {
            LinkId::InputToCompose(i) => i as usize,
            LinkId::InputToScaler(i, s) => n + i as usize * ns + s as usize,
            LinkId::ScalerToCompose(s, i) => n + n * ns + s as usize * n + i as usize,
            LinkId::ComposeToOutput => n + 2 * n * ns,
        }
    }

    pub fn get(&self, id: LinkId) -> &LinkDesc {
        &self.links[self.index(id)]
    }

    pub fn ids(&self) -> impl Iterator<Item = LinkId> {
        LinkId::all(self.num_inputs, self.num_scalers)
    }

    /// Enumerate the links that share a pad with `id`. A pad can be an
    /// endpoint of at most one enabled link, so they must be disabled before
    /// `id` is enabled.
    pub fn conflicts(&self, id: LinkId) -> impl Iterator<Item = LinkId> + '_ {
        let target = *self.get(id);
        self.ids().filter(move |&other| {
            let link = self.get(other);
            other != id && (link.source == target.source || link.sink == target.sink)
        })
    }
}

/// The pipeline, resolved from the media graph.
#[derive(Debug, Clone)]
pub struct Topology {
    prefix: String,
    inputs: ArrayVec<[Port; MAX_INPUTS]>,
    scalers: ArrayVec<[EntityId; MAX_SCALERS]>,
    compose: EntityId,
    compose_source_pad: u16,
    output: Port,
    links: LinkTable,
    /// Every entity belonging to the device, for `dump`.
    entities: Vec<EntityDesc>,
}

fn find_entity<'a>(entities: &'a [EntityDesc], name: String) -> Result<&'a EntityDesc, ProbeError> {
    entities
        .iter()
        .find(|e| e.name == name)
        .ok_or(ProbeError::MissingEntity(name))
}

impl Topology {
    /// Look up the units named `"<prefix> rpf.0"` etc. in `media`.
    pub fn discover(
        media: &dyn MediaDevice,
        prefix: &str,
        config: &Config,
    ) -> Result<Self, ProbeError> {
        let name_prefix = format!("{} ", prefix);
        let entities: Vec<EntityDesc> = media
            .entities()?
            .into_iter()
            .filter(|e| e.name.starts_with(&name_prefix))
            .collect();

        let compose = find_entity(&entities, format!("{}bru", name_prefix))?;
        let compose_source_pad = compose.num_pads.saturating_sub(1);
        let num_inputs = config
            .max_inputs
            .min(MAX_INPUTS)
            .min(compose_source_pad as usize)
            .max(1);
        let num_scalers = config.max_scalers.min(MAX_SCALERS);

        let mut inputs = ArrayVec::new();
        for i in 0..num_inputs {
            let subdev = find_entity(&entities, format!("{}rpf.{}", name_prefix, i))?;
            let node = find_entity(&entities, format!("{}rpf.{} input", name_prefix, i))?;
            inputs.push(Port {
                subdev: subdev.id,
                node: node.id,
            });
        }

        let mut scalers = ArrayVec::new();
        for s in 0..num_scalers {
            scalers.push(find_entity(&entities, format!("{}uds.{}", name_prefix, s))?.id);
        }

        let output = Port {
            subdev: find_entity(&entities, format!("{}wpf.0", name_prefix))?.id,
            node: find_entity(&entities, format!("{}wpf.0 output", name_prefix))?.id,
        };

        let mut this = Self {
            prefix: prefix.to_owned(),
            inputs,
            scalers,
            compose: compose.id,
            compose_source_pad,
            output,
            links: LinkTable {
                num_inputs: num_inputs as u8,
                num_scalers: num_scalers as u8,
                links: Vec::new(),
            },
            entities: Vec::new(),
        };

        // Resolve the link templates
        let mut links_by_source: HashMap<EntityId, Vec<LinkDesc>> = HashMap::new();
        let mut templates = Vec::new();
        for id in this.links.ids() {
            let (source, sink) = this.endpoints(id);
            if !links_by_source.contains_key(&source.entity) {
                links_by_source.insert(source.entity, media.links(source.entity)?);
            }
            let link = links_by_source[&source.entity]
                .iter()
                .find(|l| l.source == source && l.sink == sink)
                .ok_or_else(|| ProbeError::MissingLink {
                    source: this.pad_name(&entities, source),
                    sink: this.pad_name(&entities, sink),
                })?;
            templates.push(*link);
        }
        this.links.links = templates;
        this.entities = entities;

        debug!(
            "Discovered {:?}: {} inputs, {} scalers",
            prefix, num_inputs, num_scalers
        );

        Ok(this)
    }

    /// The pads connected by `id`.
    fn endpoints(&self, id: LinkId) -> (PadRef, PadRef) {
        match id {
            LinkId::InputToCompose(i) => (
                PadRef::new(self.inputs[i as usize].subdev, PAD_SOURCE),
                self.compose_sink(i),
            ),
            LinkId::InputToScaler(i, s) => (
                PadRef::new(self.inputs[i as usize].subdev, PAD_SOURCE),
                PadRef::new(self.scalers[s as usize], PAD_SINK),
            ),
            LinkId::ScalerToCompose(s, i) => (
                PadRef::new(self.scalers[s as usize], PAD_SOURCE),
                self.compose_sink(i),
            ),
            LinkId::ComposeToOutput => (
                self.compose_source(),
                PadRef::new(self.output.subdev, PAD_SINK),
            ),
        }
    }

    fn pad_name(&self, entities: &[EntityDesc], pad: PadRef) -> String {
        let name = entities
            .iter()
            .find(|e| e.id == pad.entity)
            .map(|e| e.name.as_str())
            .unwrap_or("?");
        format!("{}:{}", name, pad.index)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_scalers(&self) -> usize {
        self.scalers.len()
    }

    pub fn input(&self, i: u8) -> &Port {
        &self.inputs[i as usize]
    }

    pub fn scaler(&self, s: u8) -> EntityId {
        self.scalers[s as usize]
    }

    pub fn compose(&self) -> EntityId {
        self.compose
    }

    /// The sink pad of the compose unit fed by input slot `i`.
    pub fn compose_sink(&self, i: u8) -> PadRef {
        PadRef::new(self.compose, i as u16)
    }

    pub fn compose_source(&self) -> PadRef {
        PadRef::new(self.compose, self.compose_source_pad)
    }

    pub fn output(&self) -> &Port {
        &self.output
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    /// Every entity whose name starts with the prefix.
    pub fn entities(&self) -> &[EntityDesc] {
        &self.entities
    }

    /// Log the device's entities and links with their current state.
    pub fn dump(&self, media: &dyn MediaDevice) {
        error!("Media graph of {:?}:", self.prefix);
        for entity in self.entities.iter() {
            error!(
                "  {} {:?} ({:?}, {} pads)",
                entity.id, entity.name, entity.kind, entity.num_pads
            );
            match media.links(entity.id) {
                Ok(links) => {
                    for link in links {
                        error!(
                            "    {} -> {} [{:?}]",
                            self.pad_name(&self.entities, link.source),
                            self.pad_name(&self.entities, link.sink),
                            link.flags
                        );
                    }
                }
                Err(e) => error!("    (links are unavailable: {})", e),
            }
        }
    }
}
