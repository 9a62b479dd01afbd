#![allow(dead_code)]
use rgb::RGBA8;
use vspcomp::{
    media::mock::{MockAllocator, MockMedia},
    Config, Device, VspAccel,
};

pub const PREFIX: &str = "fe928000.vsp";

pub type MockDevice = Device<MockMedia, MockAllocator>;

pub fn try_init_logger_for_default_harness() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A device shaped like a VSP2-BD: five input ports, one scaler and a
/// compose unit with five sink pads. The default configuration uses four
/// of the input ports.
pub fn mock_media() -> MockMedia {
    MockMedia::vsp(PREFIX, 5, 1, 5)
}

pub fn attach(media: &MockMedia) -> MockDevice {
    attach_with(media, Config::default())
}

pub fn attach_with(media: &MockMedia, config: Config) -> MockDevice {
    try_init_logger_for_default_harness();
    Device::attach(media.clone(), MockAllocator::new(media), config).unwrap()
}

pub fn accel(media: &MockMedia) -> VspAccel<MockMedia, MockAllocator> {
    VspAccel::new(attach(media))
}

/// An opaque gradient whose red and green channels increase by `step` per
/// pixel along the X and Y axes.
pub fn gradient(size: [u32; 2], step: u32) -> Vec<RGBA8> {
    let mut pixels = Vec::with_capacity((size[0] * size[1]) as usize);
    for y in 0..size[1] {
        for x in 0..size[0] {
            pixels.push(RGBA8::new((x * step) as u8, (y * step) as u8, 0, 255));
        }
    }
    pixels
}

pub fn same_rgb(a: RGBA8, b: RGBA8) -> bool {
    (a.r, a.g, a.b) == (b.r, b.g, b.b)
}

/// The largest per-channel difference, alpha included.
pub fn max_difference(a: RGBA8, b: RGBA8) -> u8 {
    let d = |x: u8, y: u8| (x as i16 - y as i16).abs() as u8;
    d(a.r, b.r).max(d(a.g, b.g)).max(d(a.b, b.b)).max(d(a.a, b.a))
}
