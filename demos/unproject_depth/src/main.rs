use argh::FromArgs;
use std::{path::PathBuf, time::Instant};

use depthcloud::k3d::{
    camera::RigidPose,
    parallel::ExecutionStrategy,
    pointcloud::PointCloud,
    unproject::{unproject_depth, PointOrder, UnprojectConfig},
};
use depthcloud::tensor::{CpuAllocator, Tensor2, Tensor3};

#[derive(FromArgs)]
/// Unproject a synthetic RGB-D frame into a point cloud
struct Args {
    /// path to a JSON unproject config
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// image width in pixels
    #[argh(option, default = "640")]
    width: usize,

    /// image height in pixels
    #[argh(option, default = "480")]
    height: usize,

    /// subsampling step, overrides the config
    #[argh(option, short = 's')]
    stride: Option<usize>,

    /// maximum depth in meters, overrides the config
    #[argh(option)]
    depth_max: Option<f32>,

    /// run on a dedicated pool with this many threads
    #[argh(option, short = 'j')]
    num_threads: Option<usize>,

    /// sort the output points by source pixel
    #[argh(switch)]
    ordered: bool,

    /// skip the color image
    #[argh(switch)]
    no_colors: bool,

    /// run on the gpu backend
    #[argh(switch)]
    gpu: bool,
}

/// A 1.5m wide sphere in front of a wall at 2.5m, with a band of missing
/// samples and a far region past the default depth range.
fn synthetic_frame(
    width: usize,
    height: usize,
    k: &[[f64; 3]; 3],
) -> Result<(Tensor2<u16>, Tensor3<f32>), Box<dyn std::error::Error>> {
    let (fx, fy, cx, cy) = (k[0][0], k[1][1], k[0][2], k[1][2]);
    let (sphere_z, radius) = (1.8, 0.75);

    let depth = Tensor2::from_shape_fn([height, width], CpuAllocator, |[r, c]| {
        if r % 37 == 0 {
            return 0;
        }
        if c > width * 7 / 8 {
            return 4500;
        }
        // ray through the pixel, z = 1
        let (dx, dy) = ((c as f64 - cx) / fx, (r as f64 - cy) / fy);
        let a = dx * dx + dy * dy + 1.0;
        let b = -2.0 * sphere_z;
        let disc = b * b - 4.0 * a * (sphere_z * sphere_z - radius * radius);
        let z = if disc >= 0.0 {
            (-b - disc.sqrt()) / (2.0 * a)
        } else {
            2.5
        };
        (z * 1000.0).round() as u16
    })?;

    let colors = Tensor3::from_shape_fn([height, width, 3], CpuAllocator, |[r, c, ch]| {
        match ch {
            0 => r as f32 / height as f32,
            1 => c as f32 / width as f32,
            _ => 0.5,
        }
    })?;

    Ok((depth, colors))
}

fn load_config(args: &Args) -> Result<UnprojectConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => UnprojectConfig::default(),
    };
    if let Some(stride) = args.stride {
        config = config.with_stride(stride);
    }
    if let Some(depth_max) = args.depth_max {
        config = config.with_depth_max(depth_max);
    }
    if let Some(n) = args.num_threads {
        config = config.with_strategy(ExecutionStrategy::Fixed(n));
    }
    if args.ordered {
        config = config.with_order(PointOrder::PixelIndex);
    }
    config.validate()?;
    Ok(config)
}

fn report(cloud: &PointCloud) {
    println!("Points: #{}", cloud.len());
    println!("Colors: {}", cloud.has_colors());
    if !cloud.is_empty() {
        println!("Min bound: {:?}", cloud.get_min_bound());
        println!("Max bound: {:?}", cloud.get_max_bound());
    }
    for i in 0..cloud.len().min(3) {
        if let Some(p) = cloud.point(i) {
            println!("  point[{i}] = {p:?}");
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let config = load_config(&args)?;
    log::info!("config: {}", serde_json::to_string(&config)?);

    let k = [
        [525.0, 0.0, args.width as f64 / 2.0 - 0.5],
        [0.0, 525.0, args.height as f64 / 2.0 - 0.5],
        [0.0, 0.0, 1.0],
    ];
    // camera one meter behind the world origin
    let extrinsics = RigidPose::from_rotation_translation(
        &[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        &[0.0, 0.0, 1.0],
    )
    .to_matrix();

    let (depth, colors) = synthetic_frame(args.width, args.height, &k)?;
    let colors = (!args.no_colors).then_some(&colors);
    println!("Depth image: {}x{}", args.width, args.height);

    let start = Instant::now();
    let cloud = if args.gpu {
        run_gpu(&depth, colors, &k, &extrinsics, &config)?
    } else {
        unproject_depth(&depth, colors, &k, &extrinsics, &config)?
    };
    println!("Unprojected in {:?}", start.elapsed());

    report(&cloud);

    Ok(())
}

#[cfg(feature = "gpu")]
fn run_gpu(
    depth: &Tensor2<u16>,
    colors: Option<&Tensor3<f32>>,
    k: &[[f64; 3]; 3],
    extrinsics: &[[f64; 4]; 4],
    config: &UnprojectConfig,
) -> Result<PointCloud, Box<dyn std::error::Error>> {
    use depthcloud::k3d::gpu::{unproject_depth_gpu, GpuContext};

    let ctx = pollster::block_on(GpuContext::new())?;
    Ok(pollster::block_on(unproject_depth_gpu(
        &ctx, depth, colors, k, extrinsics, config,
    ))?)
}

#[cfg(not(feature = "gpu"))]
fn run_gpu(
    _depth: &Tensor2<u16>,
    _colors: Option<&Tensor3<f32>>,
    _k: &[[f64; 3]; 3],
    _extrinsics: &[[f64; 4]; 4],
    _config: &UnprojectConfig,
) -> Result<PointCloud, Box<dyn std::error::Error>> {
    Err("built without the `gpu` feature".into())
}
