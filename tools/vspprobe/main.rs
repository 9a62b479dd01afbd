use log::info;
use std::{
    path::{Path, PathBuf},
    process::exit,
};
use structopt::StructOpt;
use vspcomp::{
    media::{dmaheap::DmaHeap, DmaAllocator, DmaBuffer},
    prelude::*,
    AccelFlags, CardState, Config, PixelFormat, Rect, SurfaceDesc,
};

/// Probes a VSP media device and optionally runs a self-test fill on it.
#[derive(Debug, StructOpt)]
struct Opt {
    /// The media controller device node. Defaults to `$VSPCOMP_MEDIA_DEVICE`
    /// or `/dev/media0`.
    #[structopt(short = "d", long = "device")]
    device: Option<PathBuf>,

    /// The DMA heap to allocate buffers from. Defaults to
    /// `$VSPCOMP_DMA_HEAP` or `/dev/dma_heap/linux,cma`.
    #[structopt(long = "heap")]
    heap: Option<PathBuf>,

    /// The largest per-pass scale factor.
    #[structopt(long = "max-ratio")]
    max_ratio: Option<u32>,

    /// Log the discovered media graph.
    #[structopt(long = "dump")]
    dump: bool,

    /// Fill a surface in hardware and check the result.
    #[structopt(long = "self-test")]
    self_test: bool,
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    let mut config = Config::from_env();
    if let Some(device) = opt.device {
        config = config.with_device_path(device);
    }
    if let Some(heap) = opt.heap {
        config.dma_heap_path = heap;
    }
    if let Some(ratio) = opt.max_ratio {
        config = config.with_max_scale_ratio(ratio);
    }
    let heap_path = config.dma_heap_path.clone();

    let device = match vspcomp::open(config) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };

    let topo = device.topology();
    println!(
        "{}: {} inputs, {} scalers",
        topo.prefix(),
        topo.num_inputs(),
        topo.num_scalers()
    );

    if opt.dump {
        // `dump` logs at the error level so that it shows up by default
        topo.dump(device.media());
    }

    if opt.self_test {
        if let Err(e) = self_test(device, &heap_path) {
            eprintln!("self test failed: {}", e);
            exit(1);
        }
        println!("self test passed");
    }
}

fn self_test(device: vspcomp::LinuxDevice, heap_path: &Path) -> Result<(), String> {
    const SIZE: [u32; 2] = [256, 128];
    let heap = DmaHeap::open(heap_path).map_err(|e| format!("{}: {}", heap_path.display(), e))?;

    let pitch = PixelFormat::Argb8888.min_pitch(0, SIZE[0]);
    let mut buffer = heap
        .allocate((pitch * SIZE[1]) as usize)
        .map_err(|e| e.to_string())?;
    buffer
        .write_with(&mut |bytes: &mut [u8]| {
            for b in bytes.iter_mut() {
                *b = 0;
            }
        })
        .map_err(|e| e.to_string())?;
    let target = SurfaceDesc::new(buffer.fd(), PixelFormat::Argb8888, SIZE, pitch);

    let mut accel = vspcomp::VspAccel::new(device);
    let mut state = CardState::new(target);
    state.set_color(rgb::RGBA8::new(0x12, 0x34, 0x56, 0xff));
    if !accel.check_state(&mut state, AccelFlags::FILL_RECTANGLE) {
        return Err("a solid fill is not accelerated".to_owned());
    }
    accel
        .set_state(&mut state, AccelFlags::FILL_RECTANGLE)
        .map_err(|e| e.to_string())?;
    accel
        .fill_rectangle(Rect::new(16, 16, 200, 80))
        .map_err(|e| e.to_string())?;
    accel.engine_sync().map_err(|e| e.to_string())?;
    info!("{:?}", accel.device().stats());

    let mut probe = [0u8; 8];
    buffer
        .write_with(&mut |bytes: &mut [u8]| {
            let inside = (16 * pitch + 16 * 4) as usize;
            probe[..4].copy_from_slice(&bytes[inside..inside + 4]);
            probe[4..].copy_from_slice(&bytes[..4]);
        })
        .map_err(|e| e.to_string())?;

    if probe != [0x56, 0x34, 0x12, 0xff, 0, 0, 0, 0] {
        return Err(format!("unexpected pixels {:02x?}", probe));
    }
    Ok(())
}
