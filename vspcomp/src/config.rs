//! Runtime configuration.
use log::warn;
use std::{env::var_os, path::PathBuf, time::Duration};

/// The media controller node used when nothing else is specified.
pub const DEFAULT_MEDIA_DEVICE: &str = "/dev/media0";

/// The DMA heap scratch buffers are allocated from.
pub const DEFAULT_DMA_HEAP: &str = "/dev/dma_heap/linux,cma";

/// The largest scale factor the scaler handles in one pass (in either
/// direction).
pub const DEFAULT_MAX_SCALE_RATIO: u32 = 11;

/// The lower bound of `Config::max_scale_ratio`.
pub const MIN_SCALE_RATIO: u32 = 2;

/// The upper bound of `Config::max_inputs`.
pub const MAX_INPUTS: usize = 5;

/// The upper bound of `Config::max_scalers`.
pub const MAX_SCALERS: usize = 3;

#[derive(Debug, Clone)]
pub struct Config {
    /// The media controller device node.
    pub device_path: PathBuf,
    /// The DMA heap used for scratch buffers.
    pub dma_heap_path: PathBuf,
    /// The number of input ports used per composition. Clamped to the number
    /// of sink pads of the compose unit and to `MAX_INPUTS`.
    pub max_inputs: usize,
    /// The number of scalers used. Clamped to `MAX_SCALERS`.
    pub max_scalers: usize,
    /// The largest per-pass scale factor. Must be at least
    /// `MIN_SCALE_RATIO`; `Device::attach` refuses anything smaller.
    pub max_scale_ratio: u32,
    /// The number of buffers in the scratch pool.
    pub scratch_buffers: usize,
    /// The minimum edge length of a solid fill tile.
    pub fill_tile_size: u32,
    /// How long to wait for a submission to complete before giving up.
    pub completion_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_path: DEFAULT_MEDIA_DEVICE.into(),
            dma_heap_path: DEFAULT_DMA_HEAP.into(),
            max_inputs: 4,
            max_scalers: 1,
            max_scale_ratio: DEFAULT_MAX_SCALE_RATIO,
            scratch_buffers: 4,
            fill_tile_size: 8,
            completion_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// The default configuration with overrides from the environment:
    ///
    ///  - `VSPCOMP_MEDIA_DEVICE`: the media controller node
    ///  - `VSPCOMP_DMA_HEAP`: the DMA heap node
    ///  - `VSPCOMP_MAX_RATIO`: the per-pass scale limit
    ///
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = var_os("VSPCOMP_MEDIA_DEVICE").filter(|v| !v.is_empty()) {
            config.device_path = value.into();
        }
        if let Some(value) = var_os("VSPCOMP_DMA_HEAP").filter(|v| !v.is_empty()) {
            config.dma_heap_path = value.into();
        }
        if let Some(value) = var_os("VSPCOMP_MAX_RATIO") {
            match value.to_str().and_then(|s| s.parse().ok()) {
                Some(ratio) if ratio >= MIN_SCALE_RATIO => config.max_scale_ratio = ratio,
                _ => warn!("Ignoring invalid VSPCOMP_MAX_RATIO = {:?}", value),
            }
        }

        config
    }

    pub fn with_device_path(self, device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            ..self
        }
    }

    pub fn with_max_inputs(self, max_inputs: usize) -> Self {
        Self { max_inputs, ..self }
    }

    pub fn with_max_scalers(self, max_scalers: usize) -> Self {
        Self {
            max_scalers,
            ..self
        }
    }

    /// Set the per-pass scale limit, clamped to `MIN_SCALE_RATIO`.
    pub fn with_max_scale_ratio(self, max_scale_ratio: u32) -> Self {
        Self {
            max_scale_ratio: max_scale_ratio.max(MIN_SCALE_RATIO),
            ..self
        }
    }

    pub fn with_completion_timeout(self, completion_timeout: Duration) -> Self {
        Self {
            completion_timeout,
            ..self
        }
    }
}

/// Recognize the supported hardware family from a media device's bus info
/// and return the prefix of its entity names.
///
/// The supported devices report `platform:<base address>.vsp`, e.g.
/// `platform:fe928000.vsp`, and name their entities `fe928000.vsp rpf.0` etc.
pub fn entity_prefix(bus_info: &str) -> Option<&str> {
    let name = bus_info.strip_prefix("platform:")?;
    let addr = name.strip_suffix(".vsp")?;
    if !addr.is_empty() && addr.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(name)
    } else {
        None
    }
}
