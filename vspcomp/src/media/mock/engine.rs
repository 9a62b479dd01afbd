//! Software execution of a configured pipeline.
//!
//! Only the behaviour the compositor relies on is modelled: cropping at the
//! input ports, bilinear scaling, source-over blending in sink pad order, and
//! the crop/compose rectangles of the write-back port. Only 32-bit RGB formats
//! are executed.
use rgb::{RGBA, RGBA8};

use super::{MockState, Role};
use crate::{
    format::PixelFormat,
    geom::Rect,
    media::{
        topology::{PAD_SINK, PAD_SOURCE},
        LinkFlags, PadRef, SelectionTarget, CID_ALPHA_COMPONENT,
    },
};

pub type RGBAF32 = RGBA<f32>;

/// An image with straight (non-premultiplied) alpha, in `0.0..=255.0`.
#[derive(Debug, Clone)]
pub struct Image {
    pub size: [u32; 2],
    pub pixels: Vec<RGBAF32>,
}

impl Image {
    pub fn new(size: [u32; 2]) -> Self {
        Self {
            size,
            pixels: vec![RGBA::new(0.0, 0.0, 0.0, 0.0); (size[0] * size[1]) as usize],
        }
    }

    pub fn from_rgba8(size: [u32; 2], pixels: &[RGBA8]) -> Self {
        assert_eq!(pixels.len(), (size[0] * size[1]) as usize);
        Self {
            size,
            pixels: pixels
                .iter()
                .map(|p| RGBA::new(p.r as f32, p.g as f32, p.b as f32, p.a as f32))
                .collect(),
        }
    }

    pub fn to_rgba8(&self) -> Vec<RGBA8> {
        self.pixels.iter().map(|&p| quantize(p)).collect()
    }

    fn get(&self, x: u32, y: u32) -> RGBAF32 {
        self.pixels[(x + y * self.size[0]) as usize]
    }
}

fn quantize(p: RGBAF32) -> RGBA8 {
    let q = |x: f32| x.round().max(0.0).min(255.0) as u8;
    RGBA8::new(q(p.r), q(p.g), q(p.b), q(p.a))
}

fn lerp(a: RGBAF32, b: RGBAF32, f: f32) -> RGBAF32 {
    RGBA::new(
        a.r + (b.r - a.r) * f,
        a.g + (b.g - a.g) * f,
        a.b + (b.b - a.b) * f,
        a.a + (b.a - a.a) * f,
    )
}

/// Map a destination pixel center to a source coordinate, clamped to the
/// source edges. Returns the two sample indices and the weight of the second.
fn sample_pos(dst: u32, src_len: u32, dst_len: u32) -> (u32, u32, f32) {
    let ratio = src_len as f64 / dst_len as f64;
    let s = ((dst as f64 + 0.5) * ratio - 0.5).max(0.0).min((src_len - 1) as f64);
    let i0 = s.floor() as u32;
    let i1 = (i0 + 1).min(src_len - 1);
    (i0, i1, (s - i0 as f64) as f32)
}

/// Resize `src` to `size` by bilinear interpolation with pixel centers
/// aligned. This is the reference the scaler is modelled after.
pub fn scale_bilinear(src: &Image, size: [u32; 2]) -> Image {
    if src.size == size {
        return src.clone();
    }
    let mut out = Image::new(size);
    if src.size[0] == 0 || src.size[1] == 0 {
        return out;
    }

    let xs: Vec<_> = (0..size[0])
        .map(|x| sample_pos(x, src.size[0], size[0]))
        .collect();
    for y in 0..size[1] {
        let (y0, y1, fy) = sample_pos(y, src.size[1], size[1]);
        for (x, &(x0, x1, fx)) in xs.iter().enumerate() {
            let top = lerp(src.get(x0, y0), src.get(x1, y0), fx);
            let bottom = lerp(src.get(x0, y1), src.get(x1, y1), fx);
            out.pixels[x + (y * size[0]) as usize] = lerp(top, bottom, fy);
        }
    }
    out
}

/// Blend `src` over `dst` at `(x, y)`, clipped to `dst`.
fn blend_over(dst: &mut Image, src: &Image, x: i32, y: i32) {
    let bounds = Rect::from_size(dst.size);
    let placed = Rect::new(x, y, src.size[0], src.size[1]);
    let area = match bounds.intersection(&placed) {
        Some(area) => area,
        None => return,
    };

    for dy in area.y..area.bottom() as i32 {
        for dx in area.x..area.right() as i32 {
            let s = src.get((dx - x) as u32, (dy - y) as u32);
            let d = &mut dst.pixels[(dx + dy * dst.size[0] as i32) as usize];
            let sa = s.a / 255.0;
            let da = d.a / 255.0 * (1.0 - sa);
            let oa = sa + da;
            if oa <= 0.0 {
                *d = RGBA::new(0.0, 0.0, 0.0, 0.0);
                continue;
            }
            *d = RGBA::new(
                (s.r * sa + d.r * da) / oa,
                (s.g * sa + d.g * da) / oa,
                (s.b * sa + d.b * da) / oa,
                oa * 255.0,
            );
        }
    }
}

fn is_executable(format: PixelFormat) -> bool {
    match format {
        PixelFormat::Argb8888 | PixelFormat::Rgb32 => true,
        _ => false,
    }
}

impl MockState {
    fn enabled_source(&self, sink: PadRef) -> Option<PadRef> {
        self.links
            .iter()
            .find(|l| l.sink == sink && l.flags.contains(LinkFlags::ENABLED))
            .map(|l| l.source)
    }

    /// Read the crop rectangle of input port `i` as seen by its source pad.
    fn read_input(&self, i: u8) -> Result<Image, String> {
        let subdev = self.role_entity(Role::Input(i));
        let node = self.role_entity(Role::InputNode(i));
        let sink = PadRef::new(subdev, PAD_SINK);

        let node_state = &self.nodes[&node];
        let format = node_state
            .format
            .as_ref()
            .ok_or_else(|| format!("rpf.{}: no video format", i))?;
        if !is_executable(format.format) {
            return Err(format!("rpf.{}: cannot execute {:?}", i, format.format));
        }
        let planes = node_state
            .queued
            .first()
            .ok_or_else(|| format!("rpf.{}: no buffer queued", i))?;
        let data = self
            .buffers
            .get(&planes[0].buf.as_raw())
            .ok_or_else(|| format!("rpf.{}: unknown {}", i, planes[0].buf))?;

        let crop = self
            .selections
            .get(&(sink, SelectionTarget::Crop))
            .cloned()
            .unwrap_or_else(|| Rect::from_size(format.size));
        let alpha = self
            .controls
            .get(&(subdev, CID_ALPHA_COMPONENT))
            .cloned()
            .unwrap_or(255) as f32;
        let pitch = format.planes[0].pitch as usize;
        let offset = planes[0].offset as usize;

        let mut image = Image::new(crop.size());
        for y in 0..crop.h {
            for x in 0..crop.w {
                let (sx, sy) = (crop.x as usize + x as usize, crop.y as usize + y as usize);
                let at = offset + sy * pitch + sx * 4;
                let px = data
                    .get(at..at + 4)
                    .ok_or_else(|| format!("rpf: read past the buffer at {:?}", (sx, sy)))?;
                image.pixels[(x + y * crop.w) as usize] = RGBA::new(
                    px[2] as f32,
                    px[1] as f32,
                    px[0] as f32,
                    if format.format.has_alpha() {
                        px[3] as f32
                    } else {
                        alpha
                    },
                );
            }
        }
        Ok(image)
    }

    /// Execute the configured pipeline, writing into the buffer queued on the
    /// output node.
    pub(super) fn execute(&mut self) -> Result<(), String> {
        let bru = self.role_entity(Role::Compose);
        let num_sinks = self.entity(bru).num_pads - 1;
        let canvas_size = self
            .pad_formats
            .get(&PadRef::new(bru, num_sinks))
            .ok_or("bru: no source format")?
            .size;
        let mut canvas = Image::new(canvas_size);

        for pad in 0..num_sinks {
            let sink = PadRef::new(bru, pad);
            let source = match self.enabled_source(sink) {
                Some(source) => source,
                None => continue,
            };
            let layer = match self.roles.get(&source.entity) {
                Some(&Role::Input(i)) => self.read_input(i)?,
                Some(&Role::Scaler(s)) => {
                    let uds_sink = PadRef::new(source.entity, PAD_SINK);
                    let input = match self.enabled_source(uds_sink).map(|p| self.roles[&p.entity]) {
                        Some(Role::Input(i)) => i,
                        _ => return Err(format!("uds.{}: not fed by an input", s)),
                    };
                    let size = self
                        .pad_formats
                        .get(&PadRef::new(source.entity, PAD_SOURCE))
                        .ok_or_else(|| format!("uds.{}: no source format", s))?
                        .size;
                    scale_bilinear(&self.read_input(input)?, size)
                }
                _ => return Err(format!("bru:{}: unexpected source {:?}", pad, source)),
            };

            let place = self
                .selections
                .get(&(sink, SelectionTarget::Compose))
                .cloned()
                .unwrap_or_default();
            blend_over(&mut canvas, &layer, place.x, place.y);
        }

        // Write-back
        let wpf = self.role_entity(Role::Output);
        let node = self.role_entity(Role::OutputNode);
        let crop = self
            .selections
            .get(&(PadRef::new(wpf, PAD_SINK), SelectionTarget::Crop))
            .cloned()
            .unwrap_or_else(|| Rect::from_size(canvas_size));
        let compose = self
            .selections
            .get(&(PadRef::new(wpf, PAD_SOURCE), SelectionTarget::Compose))
            .cloned()
            .unwrap_or_else(|| Rect::from_size(crop.size()));

        let node_state = &self.nodes[&node];
        let format = node_state.format.clone().ok_or("wpf.0: no video format")?;
        if !is_executable(format.format) {
            return Err(format!("wpf.0: cannot execute {:?}", format.format));
        }
        let planes = node_state
            .queued
            .first()
            .cloned()
            .ok_or("wpf.0: no buffer queued")?;
        let pitch = format.planes[0].pitch as usize;
        let offset = planes[0].offset as usize;
        let data = self
            .buffers
            .get_mut(&planes[0].buf.as_raw())
            .ok_or_else(|| format!("wpf.0: unknown {}", planes[0].buf))?;

        let bounds = Rect::from_size(format.size);
        for y in 0..crop.h {
            for x in 0..crop.w {
                let (cx, cy) = (crop.x + x as i32, crop.y + y as i32);
                let (ox, oy) = (compose.x + x as i32, compose.y + y as i32);
                if !Rect::from_size(canvas_size).contains_rect(&Rect::new(cx, cy, 1, 1))
                    || !bounds.contains_rect(&Rect::new(ox, oy, 1, 1))
                {
                    continue;
                }
                let px = quantize(canvas.get(cx as u32, cy as u32));
                let i = offset + oy as usize * pitch + ox as usize * 4;
                if let Some(out) = data.get_mut(i..i + 4) {
                    out.copy_from_slice(&[px.b, px.g, px.r, px.a]);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(size: [u32; 2]) -> Image {
        let mut image = Image::new(size);
        for y in 0..size[1] {
            for x in 0..size[0] {
                image.pixels[(x + y * size[0]) as usize] =
                    RGBA::new(x as f32 * 10.0, y as f32 * 10.0, 0.0, 255.0);
            }
        }
        image
    }

    #[test]
    fn identity_scale() {
        let image = gradient([8, 4]);
        assert_eq!(scale_bilinear(&image, [8, 4]).pixels, image.pixels);
    }

    #[test]
    fn downscale_by_two_averages_pairs() {
        let out = scale_bilinear(&gradient([8, 2]), [4, 1]);
        let reds: Vec<f32> = out.pixels.iter().map(|p| p.r).collect();
        assert_eq!(reds, vec![5.0, 25.0, 45.0, 65.0]);
        assert!(out.pixels.iter().all(|p| p.g == 5.0));
    }

    #[test]
    fn blend_clips_to_canvas() {
        let mut canvas = Image::new([4, 4]);
        let layer = Image::from_rgba8([2, 2], &[RGBA8::new(255, 0, 0, 255); 4]);
        blend_over(&mut canvas, &layer, 3, -1);
        let out = canvas.to_rgba8();
        assert_eq!(out[3], RGBA8::new(255, 0, 0, 255));
        assert_eq!(out[2], RGBA8::new(0, 0, 0, 0));
        assert_eq!(out[7], RGBA8::new(0, 0, 0, 0));
    }

    #[test]
    fn half_alpha_over_opaque() {
        let mut canvas = Image::from_rgba8([1, 1], &[RGBA8::new(0, 0, 200, 255)]);
        let layer = Image::from_rgba8([1, 1], &[RGBA8::new(200, 0, 0, 128)]);
        blend_over(&mut canvas, &layer, 0, 0);
        let out = canvas.to_rgba8()[0];
        assert_eq!(out.a, 255);
        assert!((out.r as i32 - 100).abs() <= 1);
        assert!((out.b as i32 - 100).abs() <= 1);
    }
}
