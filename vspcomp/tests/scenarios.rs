use quickcheck_macros::quickcheck;
use rgb::RGBA8;
use std::{thread, time::Duration};
use vspcomp::{
    alloc::Phase,
    media::{
        mock::{scale_bilinear, Call, Image, MockMedia},
        topology::{PAD_SINK, PAD_SOURCE},
        PadRef, SelectionTarget,
    },
    prelude::*,
    AccelFlags, AlphaMode, BlitParams, CardState, Config, CoreFormat, CoreSurface, DrawError,
    DrawingFlags, PixelFormat, Rect, SurfaceDesc,
};

mod common;
use self::common::{attach, attach_with, max_difference, mock_media, same_rgb, MockDevice};

const RED: RGBA8 = RGBA8 {
    r: 255,
    g: 0,
    b: 0,
    a: 255,
};
const BLUE: RGBA8 = RGBA8 {
    r: 0,
    g: 0,
    b: 255,
    a: 255,
};

fn pixel(media: &MockMedia, surface: &SurfaceDesc, x: u32, y: u32) -> RGBA8 {
    media.read_pixels(surface)[(x + y * surface.size[0]) as usize]
}

fn solid(media: &MockMedia, format: PixelFormat, size: [u32; 2], color: RGBA8) -> SurfaceDesc {
    let surface = media.alloc_surface(format, size);
    media.fill_pixels(&surface, color);
    surface
}

fn output_node(device: &MockDevice) -> vspcomp::media::EntityId {
    device.topology().output().node
}

#[test]
fn two_blits_share_one_submission() {
    let media = mock_media();
    let device = attach(&media);
    let target = solid(&media, PixelFormat::Rgb32, [200, 200], BLUE);
    let source = solid(&media, PixelFormat::Rgb32, [50, 50], RED);
    let src_rect = source.bounds();

    device
        .blit(&target, &source, src_rect, 0, 0, BlitParams::default())
        .unwrap();
    device
        .blit(&target, &source, src_rect, 100, 100, BlitParams::default())
        .unwrap();
    assert_eq!(media.runs(), 0);
    device.sync().unwrap();

    let stats = device.stats();
    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.submissions, 1);
    assert_eq!(media.runs(), 1);

    assert!(same_rgb(pixel(&media, &target, 10, 10), RED));
    assert!(same_rgb(pixel(&media, &target, 149, 149), RED));
    // Between the two, inside the damaged area; provided by the seed
    assert!(same_rgb(pixel(&media, &target, 75, 75), BLUE));
    // Outside the damaged area
    assert!(same_rgb(pixel(&media, &target, 199, 199), BLUE));
}

#[test]
fn write_back_is_programmed_once_per_flush() {
    let media = mock_media();
    let device = attach(&media);
    let target = solid(&media, PixelFormat::Rgb32, [200, 200], BLUE);
    let source = solid(&media, PixelFormat::Rgb32, [50, 50], RED);
    let wpf = media.entity_id("wpf.0").unwrap();
    media.take_calls();

    for &(x, y) in &[(0, 0), (100, 100), (20, 120)] {
        device
            .blit(&target, &source, source.bounds(), x, y, BlitParams::default())
            .unwrap();
    }
    device.sync().unwrap();

    let calls = media.take_calls();
    let wpf_selections: Vec<_> = calls
        .iter()
        .filter_map(|call| match call {
            Call::SetSelection { pad, target, rect } if pad.entity == wpf => {
                Some((pad.index, *target, *rect))
            }
            _ => None,
        })
        .collect();
    let damage = Rect::new(0, 0, 150, 170);
    assert_eq!(
        wpf_selections,
        vec![
            (PAD_SINK, SelectionTarget::Crop, damage),
            (PAD_SOURCE, SelectionTarget::Compose, damage),
        ]
    );

    // The output node is started last
    let last_stream_on = calls
        .iter()
        .rev()
        .find_map(|call| match call {
            Call::StreamOn { node } => Some(*node),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_stream_on, output_node(&device));
}

#[test]
fn exhausted_inputs_force_one_flush() {
    let media = mock_media();
    let device = attach(&media);
    let target = solid(&media, PixelFormat::Rgb32, [64, 64], BLUE);
    let source = solid(&media, PixelFormat::Rgb32, [32, 32], RED);

    // Covers the whole target, so the composition isn't seeded. Takes the
    // scaler and the first input port.
    device
        .stretch_blit(
            &target,
            &source,
            source.bounds(),
            target.bounds(),
            BlitParams::default(),
        )
        .unwrap();
    assert_eq!(device.snapshot().used_scalers, 1);

    for i in 0..4 {
        device
            .blit(
                &target,
                &source,
                Rect::new(0, 0, 8, 8),
                i * 8,
                0,
                BlitParams::default(),
            )
            .unwrap();
    }
    device.sync().unwrap();

    let stats = device.stats();
    assert_eq!(stats.flushes, 2);
    assert_eq!(stats.retries, 1);
    assert_eq!(media.runs(), 2);
    assert!(same_rgb(pixel(&media, &target, 40, 40), RED));
}

#[test]
fn second_scaled_blit_forces_flush() {
    let media = mock_media();
    let device = attach(&media);
    let target = solid(&media, PixelFormat::Rgb32, [64, 64], BLUE);
    let source = solid(&media, PixelFormat::Rgb32, [16, 16], RED);

    for &x in &[0, 32] {
        device
            .stretch_blit(
                &target,
                &source,
                source.bounds(),
                Rect::new(x, 0, 32, 32),
                BlitParams::default(),
            )
            .unwrap();
    }
    let snapshot = device.snapshot();
    // The seed and the second blit
    assert_eq!(snapshot.used_inputs, 2);
    assert_eq!(snapshot.used_scalers, 1);
    assert_eq!(device.stats().retries, 1);

    device.sync().unwrap();
    assert_eq!(device.stats().flushes, 2);
    assert!(same_rgb(pixel(&media, &target, 48, 16), RED));
    assert!(same_rgb(pixel(&media, &target, 48, 48), BLUE));
}

#[test]
fn unsupported_fill_makes_no_calls() {
    let media = mock_media();
    let mut accel = common::accel(&media);
    let target = media.alloc_surface(PixelFormat::Argb8888, [64, 64]);
    media.take_calls();

    let mut state = CardState::new(target);
    state.set_drawing_flags(DrawingFlags::XOR);
    assert!(!accel.check_state(&mut state, AccelFlags::FILL_RECTANGLE));
    assert_eq!(state.accel, AccelFlags::empty());

    match accel.fill_rectangle(Rect::new(0, 0, 8, 8)) {
        Err(DrawError::Unsupported(_)) => {}
        other => panic!("{:?}", other),
    }
    accel.emit_commands();
    accel.engine_sync().unwrap();

    assert_eq!(media.calls(), vec![]);
    assert_eq!(media.runs(), 0);
}

#[test]
fn unsupported_formats_make_no_calls() {
    let media = mock_media();
    let mut accel = common::accel(&media);
    let target = media.alloc_surface(PixelFormat::Argb8888, [64, 64]);
    let nv12 = media.alloc_surface(PixelFormat::Nv12, [64, 64]);
    media.take_calls();

    // An alpha-only destination
    let mut alpha_only = CoreSurface::from(target.clone());
    alpha_only.format = CoreFormat::A8;
    let mut state = CardState::new(alpha_only);
    assert!(!accel.check_state(&mut state, AccelFlags::FILL_RECTANGLE));
    assert!(accel
        .set_state(&mut state, AccelFlags::FILL_RECTANGLE)
        .is_err());
    match accel.fill_rectangle(Rect::new(0, 0, 8, 8)) {
        Err(DrawError::Unsupported(_)) => {}
        other => panic!("{:?}", other),
    }

    // A three-plane source
    let mut planar = CoreSurface::from(nv12);
    planar.format = CoreFormat::I420;
    let chroma = planar.planes[1];
    planar.planes.push(chroma);
    let mut state = CardState::new(target);
    state.set_blitting_flags(vspcomp::BlittingFlags::BLEND_ALPHACHANNEL);
    state.set_blend(
        vspcomp::BlendFunction::SrcAlpha,
        vspcomp::BlendFunction::InvSrcAlpha,
    );
    state.set_source(Some(planar));
    assert!(!accel.check_state(&mut state, AccelFlags::BLIT));
    assert!(!accel.check_state(&mut state, AccelFlags::STRETCH_BLIT));
    assert_eq!(state.accel, AccelFlags::empty());
    assert!(accel.set_state(&mut state, AccelFlags::BLIT).is_err());

    accel.emit_commands();
    accel.engine_sync().unwrap();
    assert_eq!(media.calls(), vec![]);
    assert_eq!(media.runs(), 0);
}

#[test]
fn large_downscale_takes_two_passes() {
    let media = mock_media();
    let device = attach(&media);
    let target = solid(&media, PixelFormat::Rgb32, [100, 100], BLUE);
    let source = solid(&media, PixelFormat::Argb8888, [2000, 2000], RED);

    device
        .stretch_blit(
            &target,
            &source,
            source.bounds(),
            target.bounds(),
            BlitParams::default(),
        )
        .unwrap();
    device.sync().unwrap();

    let stats = device.stats();
    assert_eq!(stats.passes, 2);
    // One submission per pass, plus the final one
    assert_eq!(stats.submissions, 3);
    assert!(same_rgb(pixel(&media, &target, 50, 50), RED));
    assert!(same_rgb(pixel(&media, &target, 0, 99), RED));
}

#[test]
fn deinterlace_compose_extent_is_swapped() {
    let media = mock_media();
    let device = attach(&media);
    let target = solid(&media, PixelFormat::Rgb32, [32, 32], BLUE);
    let source = solid(&media, PixelFormat::Rgb32, [16, 16], RED);
    let params = BlitParams {
        alpha: AlphaMode::Opaque,
        deinterlace: true,
    };

    device
        .blit(&target, &source, Rect::new(0, 4, 16, 8), 2, 3, params)
        .unwrap();
    media.take_calls();
    device.flush().unwrap();
    let calls = media.take_calls();

    // Slot 0 is the seed
    let topo = device.topology();
    let rpf_sink = PadRef::new(topo.input(1).subdev, PAD_SINK);
    assert!(calls.contains(&Call::SetSelection {
        pad: rpf_sink,
        target: SelectionTarget::Crop,
        rect: Rect::new(0, 2, 16, 4),
    }));
    // The field is scaled back to 16x8, but the compose rectangle reports
    // the extent as 8x16
    assert!(calls.contains(&Call::SetSelection {
        pad: topo.compose_sink(1),
        target: SelectionTarget::Compose,
        rect: Rect::new(2, 3, 8, 16),
    }));

    device.wait_idle().unwrap();
}

#[test]
fn configuration_failure_aborts_one_flush() {
    let media = mock_media();
    let device = attach(&media);
    let target = solid(&media, PixelFormat::Rgb32, [32, 32], BLUE);

    let mut armed = true;
    media.set_failure(move |call| match call {
        Call::SetSelection {
            target: SelectionTarget::Compose,
            ..
        } if armed => {
            armed = false;
            true
        }
        _ => false,
    });

    device
        .fill(&target, Rect::new(0, 0, 8, 8), RED, false)
        .unwrap();
    match device.sync() {
        Err(DrawError::Pipeline(_)) => {}
        other => panic!("{:?}", other),
    }
    assert_eq!(device.stats().failures, 1);
    assert_eq!(device.snapshot().phase, Phase::Idle);
    assert_eq!(media.runs(), 0);

    device
        .fill(&target, Rect::new(8, 8, 8, 8), RED, false)
        .unwrap();
    device.sync().unwrap();
    assert_eq!(media.runs(), 1);
    assert!(same_rgb(pixel(&media, &target, 12, 12), RED));
    assert!(same_rgb(pixel(&media, &target, 4, 4), BLUE));
}

#[test]
fn round_trip() {
    let media = mock_media();
    let device = attach(&media);
    let target = solid(&media, PixelFormat::Rgb32, [32, 32], BLUE);
    media.set_auto_complete(false);

    device.open(&target, Rect::new(0, 0, 8, 8), true).unwrap();
    device
        .fill(&target, Rect::new(0, 0, 8, 8), RED, false)
        .unwrap();
    assert_eq!(device.snapshot().phase, Phase::Accumulating);

    device.flush().unwrap();
    let snapshot = device.snapshot();
    assert_eq!(snapshot.phase, Phase::Submitted);
    assert!(snapshot.outstanding);
    assert_eq!(snapshot.target, None);

    let completer = {
        let media = media.clone();
        thread::spawn(move || media.complete())
    };
    device.wait_idle().unwrap();
    assert!(completer.join().unwrap());

    let snapshot = device.snapshot();
    assert_eq!(snapshot.phase, Phase::Idle);
    assert!(!snapshot.outstanding);
    assert_eq!((snapshot.used_inputs, snapshot.used_scalers), (0, 0));
    assert!(same_rgb(pixel(&media, &target, 0, 0), RED));

    let stats = device.stats();
    device.finish().unwrap();
    device.finish().unwrap();
    assert_eq!(device.snapshot(), snapshot);
    assert_eq!(device.stats(), stats);
    assert_eq!(stats.submissions, 1);
}

#[test]
fn finish_retires_submission() {
    let media = mock_media();
    let device = attach(&media);
    let target = solid(&media, PixelFormat::Rgb32, [32, 32], BLUE);
    media.set_auto_complete(false);

    device
        .fill(&target, Rect::new(0, 0, 8, 8), RED, false)
        .unwrap();
    device.flush().unwrap();

    let completer = {
        let media = media.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            media.complete()
        })
    };
    device.finish().unwrap();
    assert!(completer.join().unwrap());
    assert!(!device.snapshot().outstanding);

    // Nothing left to retire
    media.take_calls();
    device.finish().unwrap();
    assert_eq!(media.calls(), vec![]);
}

#[test]
fn completion_timeout() {
    let media = mock_media();
    let device = attach_with(
        &media,
        Config::default().with_completion_timeout(Duration::from_millis(50)),
    );
    let target = solid(&media, PixelFormat::Rgb32, [32, 32], BLUE);
    media.set_auto_complete(false);

    device
        .fill(&target, Rect::new(0, 0, 8, 8), RED, false)
        .unwrap();
    match device.sync() {
        Err(DrawError::Timeout) => {}
        other => panic!("{:?}", other),
    }
    assert!(device.snapshot().outstanding);

    assert!(media.complete());
    device.wait_idle().unwrap();
    assert!(same_rgb(pixel(&media, &target, 0, 0), RED));
}

#[test]
fn blended_fill_through_accel() {
    let media = mock_media();
    let mut accel = common::accel(&media);
    let target = solid(&media, PixelFormat::Argb8888, [16, 16], BLUE);

    let mut state = CardState::new(target.clone());
    state.set_color(RGBA8::new(255, 0, 0, 128));
    state.set_drawing_flags(DrawingFlags::BLEND);
    state.set_blend(
        vspcomp::BlendFunction::SrcAlpha,
        vspcomp::BlendFunction::InvSrcAlpha,
    );
    assert!(accel.check_state(&mut state, AccelFlags::FILL_RECTANGLE));
    accel
        .set_state(&mut state, AccelFlags::FILL_RECTANGLE)
        .unwrap();
    accel.fill_rectangle(Rect::new(0, 0, 8, 8)).unwrap();
    accel.engine_sync().unwrap();

    let blended = pixel(&media, &target, 4, 4);
    assert_eq!(blended.a, 255);
    assert!((blended.r as i32 - 128).abs() <= 1, "{:?}", blended);
    assert!((blended.b as i32 - 127).abs() <= 1, "{:?}", blended);
    assert_eq!(pixel(&media, &target, 12, 12), BLUE);
}

/// Draws into several targets in any order always leave at most one
/// composition open, for the target drawn into last, and produce the same
/// pixels as drawing in software.
#[quickcheck]
fn one_open_composition(ops: Vec<(u8, u8, u8, u8, u8)>) -> bool {
    const SIZE: u32 = 16;
    let media = mock_media();
    let device = attach(&media);
    let targets: Vec<_> = (0..3)
        .map(|_| solid(&media, PixelFormat::Rgb32, [SIZE, SIZE], BLUE))
        .collect();
    let mut model: Vec<_> = targets
        .iter()
        .map(|_| vec![BLUE; (SIZE * SIZE) as usize])
        .collect();

    for &(op, a, b, c, d) in ops.iter().take(12) {
        match op % 5 {
            t @ 0..=2 => {
                let t = t as usize;
                let (x, y) = (a as u32 % SIZE, b as u32 % SIZE);
                let w = c as u32 % (SIZE - x) + 1;
                let h = d as u32 % (SIZE - y) + 1;
                let color = RGBA8::new(a.wrapping_mul(7), b.wrapping_mul(13), c ^ d, 255);
                device
                    .fill(&targets[t], Rect::new(x as i32, y as i32, w, h), color, false)
                    .unwrap();

                for py in y..y + h {
                    for px in x..x + w {
                        model[t][(px + py * SIZE) as usize] = color;
                    }
                }

                let snapshot = device.snapshot();
                if snapshot.target.as_ref() != Some(&targets[t])
                    || snapshot.phase != Phase::Accumulating
                {
                    return false;
                }
            }
            3 => {
                device.flush().unwrap();
                let snapshot = device.snapshot();
                if snapshot.target.is_some() || snapshot.phase == Phase::Accumulating {
                    return false;
                }
            }
            _ => {
                device.sync().unwrap();
                let snapshot = device.snapshot();
                if snapshot.target.is_some() || snapshot.outstanding {
                    return false;
                }
            }
        }
    }

    device.sync().unwrap();
    targets.iter().zip(model.iter()).all(|(target, expected)| {
        media
            .read_pixels(target)
            .iter()
            .zip(expected.iter())
            .all(|(&a, &b)| same_rgb(a, b))
    })
}

/// Each time the input ports run out, exactly one extra flush happens, and
/// every requested source is read exactly once, in order.
#[quickcheck]
fn exhaustion_preserves_sources(count: u8) -> bool {
    let count = count as usize % 12 + 1;
    let media = mock_media();
    let device = attach(&media);
    let target = solid(&media, PixelFormat::Rgb32, [64, 64], BLUE);
    let sources: Vec<_> = (0..count)
        .map(|i| {
            solid(
                &media,
                PixelFormat::Rgb32,
                [4, 4],
                RGBA8::new(i as u8 * 20, 0, 0, 255),
            )
        })
        .collect();
    media.take_calls();

    for (i, source) in sources.iter().enumerate() {
        let (x, y) = ((i % 16) as i32 * 4, (i / 16) as i32 * 4);
        device
            .blit(&target, source, source.bounds(), x, y, BlitParams::default())
            .unwrap();
    }
    device.sync().unwrap();

    // Every composition is seeded, leaving three ports for sources
    let compositions = (count + 2) / 3;
    let stats = device.stats();
    if stats.flushes != compositions as u64
        || stats.retries != compositions as u64 - 1
        || media.runs() != compositions
    {
        return false;
    }

    let output = output_node(&device);
    let target_buf = target.planes[0].buf;
    let read: Vec<_> = media
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::QueueBuffer { node, planes } if node != output => Some(planes[0].buf),
            _ => None,
        })
        .filter(|&buf| buf != target_buf)
        .collect();
    let requested: Vec<_> = sources.iter().map(|s| s.planes[0].buf).collect();
    read == requested
}

/// Multi-pass downscaling of a linear gradient matches single-pass bilinear
/// scaling.
#[quickcheck]
fn multi_pass_downscale_matches_reference(src: (u8, u8), dst: (u8, u8)) -> bool {
    let src_size = [src.0 as u32 % 121 + 8, src.1 as u32 % 121 + 8];
    // At most 15:1, so that each axis takes at most one intermediate pass
    let dst_axis = |src: u32, x: u8| {
        let min = (src + 14) / 15;
        min + x as u32 % (src - min + 1)
    };
    let dst_size = [dst_axis(src_size[0], dst.0), dst_axis(src_size[1], dst.1)];

    let media = mock_media();
    let device = attach_with(&media, Config::default().with_max_scale_ratio(4));
    let pixels = common::gradient(src_size, 2);
    let source = media.alloc_surface(PixelFormat::Argb8888, src_size);
    media.write_pixels(&source, &pixels);
    let target = media.alloc_surface(PixelFormat::Argb8888, dst_size);

    device
        .stretch_blit(
            &target,
            &source,
            source.bounds(),
            target.bounds(),
            BlitParams::default(),
        )
        .unwrap();
    device.sync().unwrap();

    let expected = scale_bilinear(&Image::from_rgba8(src_size, &pixels), dst_size).to_rgba8();
    media
        .read_pixels(&target)
        .iter()
        .zip(expected.iter())
        .all(|(&a, &b)| max_difference(a, b) <= 2)
}

#[test]
fn multi_pass_upscale_matches_reference() {
    let src_size = [4, 4];
    let dst_size = [100, 60];
    let media = mock_media();
    let device = attach_with(&media, Config::default().with_max_scale_ratio(8));
    let pixels = common::gradient(src_size, 60);
    let source = media.alloc_surface(PixelFormat::Argb8888, src_size);
    media.write_pixels(&source, &pixels);
    let target = media.alloc_surface(PixelFormat::Argb8888, dst_size);

    device
        .stretch_blit(
            &target,
            &source,
            source.bounds(),
            target.bounds(),
            BlitParams::default(),
        )
        .unwrap();
    device.sync().unwrap();
    assert_eq!(device.stats().passes, 2);

    let expected = scale_bilinear(&Image::from_rgba8(src_size, &pixels), dst_size).to_rgba8();
    let actual = media.read_pixels(&target);

    // Edge pixels are clamped differently by each pass. Skip one source
    // pixel's worth of them.
    let margin = [dst_size[0] / src_size[0], dst_size[1] / src_size[1]];
    for y in margin[1]..dst_size[1] - margin[1] {
        for x in margin[0]..dst_size[0] - margin[0] {
            let i = (x + y * dst_size[0]) as usize;
            assert!(
                max_difference(actual[i], expected[i]) <= 2,
                "({}, {}): {:?} vs {:?}",
                x,
                y,
                actual[i],
                expected[i]
            );
        }
    }
}
