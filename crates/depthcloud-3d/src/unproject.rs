use std::sync::atomic::{AtomicUsize, Ordering};

use depthcloud_tensor::{
    Device, StridedView, StridedViewMut, Tensor, Tensor1, Tensor2, Tensor3, TensorAllocator,
    TensorError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    camera::{CameraError, CameraTransform, PinholeIntrinsics, RigidPose},
    parallel::{launch_general_kernel, ExecutionStrategy, ParallelError},
    pointcloud::PointCloud,
};

/// Errors raised by the depth unprojection kernels.
#[derive(Debug, Error, PartialEq)]
pub enum UnprojectError {
    /// The configuration has an out-of-range parameter.
    #[error("invalid unproject config: {0}")]
    InvalidConfig(String),

    /// The depth tensor is neither `(H, W)` nor `(H, W, 1)`.
    #[error("depth image must have shape (H, W) or (H, W, 1), got {0:?}")]
    InvalidDepthShape(Vec<usize>),

    /// The color tensor does not match the depth image.
    #[error("color image must have shape {expected:?}, got {actual:?}")]
    ColorShapeMismatch {
        /// The `(H, W, 3)` shape implied by the depth image
        expected: [usize; 3],
        /// The shape of the color tensor
        actual: [usize; 3],
    },

    /// A tensor lives on a device the kernel cannot read.
    #[error("tensor placed on {actual}, expected {expected}")]
    DevicePlacement {
        /// The device the kernel runs against
        expected: Device,
        /// The device of the offending tensor
        actual: Device,
    },

    /// The camera parameters are degenerate.
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// An output tensor could not be built.
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// The kernel launch failed.
    #[error(transparent)]
    Parallel(#[from] ParallelError),

    /// The accelerator backend failed.
    #[cfg(feature = "gpu")]
    #[error("gpu backend error: {0}")]
    Gpu(String),
}

/// Order of the points in the output cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointOrder {
    /// Whatever order the workers claimed their slots in.
    #[default]
    Unordered,
    /// Row-major order of the source pixels, as a serial scan would produce.
    PixelIndex,
}

/// Parameters of a depth unprojection.
///
/// # Example
///
/// ```
/// use depthcloud_3d::unproject::{PointOrder, UnprojectConfig};
///
/// let config = UnprojectConfig::default()
///     .with_depth_scale(5000.0)
///     .with_stride(2)
///     .with_order(PointOrder::PixelIndex);
/// assert!(config.validate().is_ok());
///
/// let config: UnprojectConfig = serde_json::from_str(r#"{"depth_max": 8.0}"#).unwrap();
/// assert_eq!(config.depth_max, 8.0);
/// assert_eq!(config.depth_scale, 1000.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnprojectConfig {
    /// Raw depth units per meter.
    pub depth_scale: f32,
    /// Exclusive upper bound on metric depth.
    pub depth_max: f32,
    /// Subsampling step on rows and columns.
    pub stride: usize,
    /// How the CPU kernel is scheduled.
    pub strategy: ExecutionStrategy,
    /// Order of the output points.
    pub order: PointOrder,
}

impl Default for UnprojectConfig {
    fn default() -> Self {
        Self {
            depth_scale: 1000.0,
            depth_max: 3.0,
            stride: 1,
            strategy: ExecutionStrategy::default(),
            order: PointOrder::default(),
        }
    }
}

impl UnprojectConfig {
    /// Sets the raw depth units per meter.
    pub fn with_depth_scale(mut self, depth_scale: f32) -> Self {
        self.depth_scale = depth_scale;
        self
    }

    /// Sets the exclusive upper bound on metric depth.
    pub fn with_depth_max(mut self, depth_max: f32) -> Self {
        self.depth_max = depth_max;
        self
    }

    /// Sets the subsampling step.
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Sets the CPU execution strategy.
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the output order.
    pub fn with_order(mut self, order: PointOrder) -> Self {
        self.order = order;
        self
    }

    /// Checks every parameter.
    ///
    /// # Errors
    ///
    /// [`UnprojectError::InvalidConfig`] for a zero stride, a non-positive or
    /// non-finite depth scale or a non-positive/NaN depth max;
    /// [`UnprojectError::Parallel`] for a strategy that cannot be launched.
    pub fn validate(&self) -> Result<(), UnprojectError> {
        if self.stride == 0 {
            return Err(UnprojectError::InvalidConfig(
                "stride must be > 0".to_string(),
            ));
        }
        if !self.depth_scale.is_finite() || self.depth_scale <= 0.0 {
            return Err(UnprojectError::InvalidConfig(format!(
                "depth_scale must be finite and > 0, got {}",
                self.depth_scale
            )));
        }
        // +inf means no upper bound
        if self.depth_max.is_nan() || self.depth_max <= 0.0 {
            return Err(UnprojectError::InvalidConfig(format!(
                "depth_max must be > 0, got {}",
                self.depth_max
            )));
        }
        match self.strategy {
            ExecutionStrategy::Fixed(0) => Err(ParallelError::InvalidThreadCount(0).into()),
            ExecutionStrategy::Chunks(0) => Err(ParallelError::InvalidChunkLen(0).into()),
            _ => Ok(()),
        }
    }
}

/// Validated inputs and candidate grid of one unprojection.
///
/// Shared by the CPU and accelerator backends so both reject the same inputs
/// before allocating anything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnprojectPlan {
    height: usize,
    width: usize,
    rows: usize,
    cols: usize,
    stride: usize,
    depth_scale: f32,
    depth_max: f32,
    have_colors: bool,
    transform: CameraTransform,
}

impl UnprojectPlan {
    /// Validates the inputs and computes the candidate grid.
    ///
    /// A color tensor with no elements counts as absent.
    pub fn new<const N: usize, A: TensorAllocator>(
        depth: &Tensor<u16, N, A>,
        colors: Option<&Tensor3<f32, A>>,
        intrinsics: &[[f64; 3]; 3],
        extrinsics: &[[f64; 4]; 4],
        config: &UnprojectConfig,
    ) -> Result<Self, UnprojectError> {
        config.validate()?;
        depth.check_layout()?;

        let (height, width) = match depth.shape.as_slice() {
            [h, w] | [h, w, 1] => (*h, *w),
            other => return Err(UnprojectError::InvalidDepthShape(other.to_vec())),
        };

        let colors = colors.filter(|c| c.numel() > 0);
        if let Some(colors) = colors {
            let expected = [height, width, 3];
            if colors.shape != expected {
                return Err(UnprojectError::ColorShapeMismatch {
                    expected,
                    actual: colors.shape,
                });
            }
            colors.check_layout()?;
        }

        // the kernels read both images through host pointers
        for device in std::iter::once(depth.device()).chain(colors.map(|c| c.device())) {
            if !device.is_host_accessible() {
                return Err(UnprojectError::DevicePlacement {
                    expected: Device::Cpu,
                    actual: device,
                });
            }
        }

        let intrinsics = PinholeIntrinsics::from_matrix(intrinsics)?;
        let cam_to_world = RigidPose::from_matrix(extrinsics).inverse()?;

        Ok(Self {
            height,
            width,
            rows: height / config.stride,
            cols: width / config.stride,
            stride: config.stride,
            depth_scale: config.depth_scale,
            depth_max: config.depth_max,
            have_colors: colors.is_some(),
            transform: CameraTransform::new(&intrinsics, &cam_to_world),
        })
    }

    /// Image size as `(height, width)`.
    pub fn image_size(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Candidate grid as `(rows, cols)`.
    pub fn grid(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of candidate pixels, the upper bound on the output size.
    pub fn num_candidates(&self) -> usize {
        self.rows * self.cols
    }

    /// Subsampling step.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Raw depth units per meter.
    pub fn depth_scale(&self) -> f32 {
        self.depth_scale
    }

    /// Exclusive upper bound on metric depth.
    pub fn depth_max(&self) -> f32 {
        self.depth_max
    }

    /// Whether colors are produced.
    pub fn have_colors(&self) -> bool {
        self.have_colors
    }

    /// The camera->world transform applied to every point.
    pub fn transform(&self) -> &CameraTransform {
        &self.transform
    }

    /// Maps work item `i` to its source pixel `(x, y)`.
    #[inline(always)]
    pub fn pixel(&self, i: usize) -> (usize, usize) {
        ((i % self.cols) * self.stride, (i / self.cols) * self.stride)
    }
}

/// Per-item body of the CPU kernel.
///
/// Built only by [`unproject_depth`], whose plan guarantees every pixel
/// coordinate is inside the depth and color views and every claimed slot is
/// below the output length.
struct UnprojectKernel<'a> {
    plan: &'a UnprojectPlan,
    depth: StridedView<'a, u16>,
    colors: StridedView<'a, f32>,
    points_out: StridedViewMut<'a, f32>,
    colors_out: StridedViewMut<'a, f32>,
    indices_out: StridedViewMut<'a, usize>,
    count: AtomicUsize,
}

impl UnprojectKernel<'_> {
    #[inline(always)]
    fn process(&self, i: usize) {
        let (x, y) = self.plan.pixel(i);

        // SAFETY: the candidate grid lies inside the (H, W) image
        let raw = unsafe { self.depth.get_unchecked(&[y, x]) }[0];
        let d = raw as f32 / self.plan.depth_scale;
        if d <= 0.0 || d >= self.plan.depth_max {
            return;
        }

        let slot = self.count.fetch_add(1, Ordering::Relaxed);
        let transform = &self.plan.transform;
        let point = transform.rigid_transform(transform.unproject(x as f32, y as f32, d));

        // SAFETY: every slot is handed out once and is below the number of
        // candidates the outputs were allocated with
        unsafe {
            self.points_out.write_unchecked(&[slot], &point);
            if self.plan.have_colors {
                let color = self.colors.get_unchecked(&[y, x]);
                self.colors_out.write_unchecked(&[slot], color);
            }
            if self.indices_out.exists() {
                self.indices_out.write_unchecked(&[slot], &[i]);
            }
        }
    }

    fn into_count(self) -> usize {
        self.count.into_inner()
    }
}

/// Shrinks the upper-bound outputs to `count` points and applies `order`.
///
/// `indices` holds the source work item of every slot when ordering by pixel.
pub(crate) fn compact<A: TensorAllocator>(
    points: Tensor2<f32, A>,
    colors: Option<Tensor2<f32, A>>,
    indices: Option<Tensor1<usize, A>>,
    count: usize,
) -> Result<PointCloud<A>, UnprojectError> {
    let points = points.truncate(count)?;
    let colors = colors.map(|c| c.truncate(count)).transpose()?;

    let Some(indices) = indices else {
        return Ok(PointCloud::new(points, colors)?);
    };

    let indices = indices.truncate(count)?;
    let keys = indices.as_slice();
    let mut order = (0..count).collect::<Vec<_>>();
    order.sort_unstable_by_key(|&slot| keys[slot]);

    let gather = |src: &Tensor2<f32, A>| {
        let data = src.as_slice();
        Tensor2::from_shape_fn([count, 3], src.storage.alloc().clone(), |[r, c]| {
            data[order[r] * 3 + c]
        })
    };
    let sorted_points = gather(&points)?;
    let sorted_colors = colors.as_ref().map(gather).transpose()?;
    Ok(PointCloud::new(sorted_points, sorted_colors)?)
}

/// Unprojects a depth image into a world-space point cloud.
///
/// Every candidate pixel `(x, y) = (c * stride, r * stride)` whose metric depth
/// `d = raw / depth_scale` satisfies `0 < d < depth_max` becomes one point
/// `T_cw * [(x - cx) d / fx, (y - cy) d / fy, d]`, where `T_cw` is the inverse of
/// `extrinsics`. Candidates are processed concurrently and pack their results
/// densely through a shared counter.
///
/// # Arguments
///
/// * `depth` - Raw depth of shape `(H, W)` or `(H, W, 1)`; 0 means no measurement.
/// * `colors` - Optional `(H, W, 3)` color image; empty or `None` disables colors.
/// * `intrinsics` - Row-major 3x3 camera matrix.
/// * `extrinsics` - Row-major 4x4 world->camera pose.
/// * `config` - Depth scale, depth range, stride, scheduling and output order.
///
/// # Errors
///
/// Every input error is reported before outputs are allocated or work is launched.
///
/// # Example
///
/// ```
/// use depthcloud_3d::unproject::{unproject_depth, UnprojectConfig};
/// use depthcloud_tensor::{CpuAllocator, Tensor2};
///
/// let depth = Tensor2::from_shape_vec([2, 2], vec![0u16, 500, 1000, 20000], CpuAllocator)?;
/// let k = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
/// let identity = [
///     [1.0, 0.0, 0.0, 0.0],
///     [0.0, 1.0, 0.0, 0.0],
///     [0.0, 0.0, 1.0, 0.0],
///     [0.0, 0.0, 0.0, 1.0],
/// ];
/// let config = UnprojectConfig::default().with_depth_max(5.0);
///
/// let cloud = unproject_depth(&depth, None, &k, &identity, &config)?;
/// assert_eq!(cloud.len(), 2);
/// assert!(!cloud.has_colors());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn unproject_depth<const N: usize, A: TensorAllocator>(
    depth: &Tensor<u16, N, A>,
    colors: Option<&Tensor3<f32, A>>,
    intrinsics: &[[f64; 3]; 3],
    extrinsics: &[[f64; 4]; 4],
    config: &UnprojectConfig,
) -> Result<PointCloud<A>, UnprojectError> {
    let plan = UnprojectPlan::new(depth, colors, intrinsics, extrinsics, config)?;
    let n = plan.num_candidates();
    let (rows, cols) = plan.grid();
    if n == 0 {
        log::warn!(
            "stride {} leaves no candidate pixel in a {:?} depth image",
            plan.stride,
            plan.image_size()
        );
    }
    log::debug!(
        "unprojecting {rows}x{cols} candidates (stride {}, colors: {})",
        plan.stride,
        plan.have_colors
    );

    let alloc = depth.storage.alloc().clone();
    let mut points = Tensor2::<f32, A>::zeros([n, 3], alloc.clone())?;
    let mut out_colors = plan
        .have_colors
        .then(|| Tensor2::<f32, A>::zeros([n, 3], alloc.clone()))
        .transpose()?;
    let mut indices = (config.order == PointOrder::PixelIndex)
        .then(|| Tensor1::<usize, A>::zeros([n], alloc.clone()))
        .transpose()?;

    let kernel = UnprojectKernel {
        plan: &plan,
        depth: StridedView::new(depth, 2)?,
        colors: match colors.filter(|_| plan.have_colors) {
            Some(c) => StridedView::new(c, 2)?,
            None => StridedView::empty(),
        },
        points_out: StridedViewMut::new(&mut points, 1)?,
        colors_out: match out_colors.as_mut() {
            Some(c) => StridedViewMut::new(c, 1)?,
            None => StridedViewMut::empty(),
        },
        indices_out: match indices.as_mut() {
            Some(t) => StridedViewMut::new(t, 1)?,
            None => StridedViewMut::empty(),
        },
        count: AtomicUsize::new(0),
    };

    launch_general_kernel(n, config.strategy, |i| kernel.process(i))?;
    let count = kernel.into_count();
    log::debug!("kept {count} of {n} candidates");

    compact(points, out_colors, indices, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthcloud_tensor::CpuAllocator;

    const K: [[f64; 3]; 3] = [[2.0, 0.0, 1.0], [0.0, 2.0, 1.0], [0.0, 0.0, 1.0]];
    const IDENTITY: [[f64; 4]; 4] = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ];

    #[test]
    fn test_config_validate() {
        assert!(UnprojectConfig::default().validate().is_ok());
        assert!(UnprojectConfig::default()
            .with_depth_max(f32::INFINITY)
            .validate()
            .is_ok());

        for bad in [
            UnprojectConfig::default().with_stride(0),
            UnprojectConfig::default().with_depth_scale(0.0),
            UnprojectConfig::default().with_depth_scale(f32::NAN),
            UnprojectConfig::default().with_depth_max(-1.0),
            UnprojectConfig::default().with_depth_max(f32::NAN),
        ] {
            assert!(matches!(bad.validate(), Err(UnprojectError::InvalidConfig(_))));
        }

        assert_eq!(
            UnprojectConfig::default()
                .with_strategy(ExecutionStrategy::Fixed(0))
                .validate(),
            Err(UnprojectError::Parallel(ParallelError::InvalidThreadCount(0)))
        );
    }

    #[test]
    fn test_plan_grid_and_pixels() -> Result<(), UnprojectError> {
        let depth = Tensor2::<u16, _>::zeros([5, 7], CpuAllocator)?;
        let config = UnprojectConfig::default().with_stride(2);
        let plan = UnprojectPlan::new(&depth, None, &K, &IDENTITY, &config)?;
        assert_eq!(plan.image_size(), (5, 7));
        assert_eq!(plan.grid(), (2, 3));
        assert_eq!(plan.num_candidates(), 6);
        assert_eq!(plan.pixel(0), (0, 0));
        assert_eq!(plan.pixel(2), (4, 0));
        assert_eq!(plan.pixel(4), (2, 2));
        assert!(!plan.have_colors());
        Ok(())
    }

    #[test]
    fn test_plan_rejects_bad_shapes() -> Result<(), UnprojectError> {
        let config = UnprojectConfig::default();
        let depth = Tensor3::<u16, _>::zeros([2, 2, 2], CpuAllocator)?;
        assert_eq!(
            UnprojectPlan::new(&depth, None, &K, &IDENTITY, &config),
            Err(UnprojectError::InvalidDepthShape(vec![2, 2, 2]))
        );

        let depth = Tensor2::<u16, _>::zeros([2, 2], CpuAllocator)?;
        let colors = Tensor3::<f32, _>::zeros([2, 3, 3], CpuAllocator)?;
        assert_eq!(
            UnprojectPlan::new(&depth, Some(&colors), &K, &IDENTITY, &config),
            Err(UnprojectError::ColorShapeMismatch {
                expected: [2, 2, 3],
                actual: [2, 3, 3],
            })
        );

        let empty = Tensor3::<f32, _>::zeros([0, 0, 3], CpuAllocator)?;
        let plan = UnprojectPlan::new(&depth, Some(&empty), &K, &IDENTITY, &config)?;
        assert!(!plan.have_colors());
        Ok(())
    }

    #[test]
    fn test_unproject_known_values() -> Result<(), UnprojectError> {
        let depth = Tensor2::from_shape_vec([2, 2], vec![0u16, 500, 1000, 20000], CpuAllocator)?;
        let colors = Tensor3::from_shape_fn([2, 2, 3], CpuAllocator, |[r, c, ch]| {
            (r * 100 + c * 10 + ch) as f32
        })?;
        let config = UnprojectConfig::default()
            .with_depth_max(5.0)
            .with_order(PointOrder::PixelIndex);

        let cloud = unproject_depth(&depth, Some(&colors), &K, &IDENTITY, &config)?;
        assert_eq!(cloud.len(), 2);
        // raw 500 at (x=1, y=0), raw 1000 at (x=0, y=1)
        assert_eq!(cloud.point(0), Some([0.0, -0.25, 0.5]));
        assert_eq!(cloud.point(1), Some([-0.5, 0.0, 1.0]));
        assert_eq!(cloud.color(0), Some([10.0, 11.0, 12.0]));
        assert_eq!(cloud.color(1), Some([100.0, 101.0, 102.0]));
        Ok(())
    }

    #[test]
    fn test_compact_orders_by_index() -> Result<(), UnprojectError> {
        let points = Tensor2::from_shape_vec(
            [3, 3],
            vec![2.0, 2.0, 2.0, 0.0, 0.0, 0.0, 9.0, 9.0, 9.0],
            CpuAllocator,
        )?;
        let indices = Tensor1::from_shape_vec([3], vec![7, 3, 0], CpuAllocator)?;
        let cloud = compact(points, None, Some(indices), 2)?;
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.point(0), Some([0.0, 0.0, 0.0]));
        assert_eq!(cloud.point(1), Some([2.0, 2.0, 2.0]));
        Ok(())
    }
}
