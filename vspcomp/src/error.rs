//! Error types.
//!
//! Capability declines and resource contention are not errors; they are
//! handled before anything here is constructed. What remains is either fatal
//! at attach time (`ProbeError`) or scoped to the draw that triggered it
//! (`DrawError`).
use std::{error::Error, fmt, io};

use crate::media::topology::Unit;

/// Returned by `Device::attach` when the driver should not participate.
#[derive(Debug)]
pub enum ProbeError {
    /// The media device node could not be opened.
    DeviceAbsent(io::Error),
    /// The device belongs to a different hardware family.
    UnsupportedFamily { bus_info: String },
    /// An expected processing unit was not found by name.
    MissingEntity(String),
    /// An expected link between two units was not found.
    MissingLink { source: String, sink: String },
    Io(io::Error),
    /// The configuration can't be used with any device.
    InvalidConfig(&'static str),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProbeError::DeviceAbsent(e) => write!(f, "media device is not available: {}", e),
            ProbeError::UnsupportedFamily { bus_info } => {
                write!(f, "unsupported hardware (bus info {:?})", bus_info)
            }
            ProbeError::MissingEntity(name) => write!(f, "entity {:?} was not found", name),
            ProbeError::MissingLink { source, sink } => {
                write!(f, "link {:?} -> {:?} was not found", source, sink)
            }
            ProbeError::Io(e) => write!(f, "topology discovery failed: {}", e),
            ProbeError::InvalidConfig(why) => write!(f, "invalid configuration: {}", why),
        }
    }
}

impl Error for ProbeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProbeError::DeviceAbsent(e) | ProbeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProbeError {
    fn from(e: io::Error) -> Self {
        ProbeError::Io(e)
    }
}

/// A pipeline configuration step, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SetupLink,
    PadFormat,
    Crop,
    Compose,
    Control,
    VideoFormat,
    RequestBuffers,
    QueueBuffer,
    DequeueBuffer,
    StreamOn,
    StreamOff,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Step::SetupLink => "setup link",
            Step::PadFormat => "set pad format",
            Step::Crop => "set crop rectangle",
            Step::Compose => "set compose rectangle",
            Step::Control => "set control",
            Step::VideoFormat => "set video format",
            Step::RequestBuffers => "request buffers",
            Step::QueueBuffer => "queue buffer",
            Step::DequeueBuffer => "dequeue buffer",
            Step::StreamOn => "stream on",
            Step::StreamOff => "stream off",
        };
        f.write_str(s)
    }
}

/// A configuration ioctl failed.
#[derive(Debug)]
pub struct PipelineError {
    pub step: Step,
    pub unit: Unit,
    pub source: io::Error,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} on {} failed: {}", self.step, self.unit, self.source)
    }
}

impl Error for PipelineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Why a draw was not realized in hardware. The caller is expected to fall
/// back to a software path; none of these are fatal.
#[derive(Debug)]
pub enum DrawError {
    /// The request cannot be expressed with this pipeline.
    Unsupported(&'static str),
    /// The request does not fit even into a fresh composition.
    Exhausted,
    /// The hardware rejected the configuration of the composition this draw
    /// belonged to.
    Pipeline(PipelineError),
    /// A scratch buffer could not be allocated or written.
    Alloc(io::Error),
    /// The outstanding submission did not complete in time.
    Timeout,
    /// The device has been detached.
    Detached,
}

impl fmt::Display for DrawError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DrawError::Unsupported(why) => write!(f, "not accelerated: {}", why),
            DrawError::Exhausted => write!(f, "the request does not fit into a composition"),
            DrawError::Pipeline(e) => write!(f, "pipeline configuration failed: {}", e),
            DrawError::Alloc(e) => write!(f, "scratch buffer allocation failed: {}", e),
            DrawError::Timeout => write!(f, "timed out waiting for the hardware"),
            DrawError::Detached => write!(f, "the device has been detached"),
        }
    }
}

impl Error for DrawError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DrawError::Pipeline(e) => Some(e),
            DrawError::Alloc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PipelineError> for DrawError {
    fn from(e: PipelineError) -> Self {
        DrawError::Pipeline(e)
    }
}
