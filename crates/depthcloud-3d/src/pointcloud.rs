use depthcloud_tensor::{CpuAllocator, Tensor2, TensorAllocator, TensorError};
use glam::Vec3;

/// A point cloud with points and optional per-point colors.
///
/// Both tensors have shape `(len, 3)`.
#[derive(Debug, Clone)]
pub struct PointCloud<A: TensorAllocator = CpuAllocator> {
    // The points in world coordinates.
    points: Tensor2<f32, A>,
    // The colors of the points.
    colors: Option<Tensor2<f32, A>>,
}

impl<A: TensorAllocator> PointCloud<A> {
    /// Create a new point cloud from points and colors (optional).
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::DimensionMismatch`] if the points are not `(n, 3)`
    /// or the colors don't have the same shape.
    pub fn new(points: Tensor2<f32, A>, colors: Option<Tensor2<f32, A>>) -> Result<Self, TensorError> {
        if points.shape[1] != 3 {
            return Err(TensorError::dimension_mismatch(
                "points must have 3 columns",
                &[points.shape[0], 3],
                &points.shape,
            ));
        }
        if let Some(colors) = &colors {
            if colors.shape != points.shape {
                return Err(TensorError::dimension_mismatch(
                    "colors must match the points shape",
                    &points.shape,
                    &colors.shape,
                ));
            }
        }
        Ok(Self { points, colors })
    }

    /// Get the number of points in the point cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.shape[0]
    }

    /// Check if the point cloud is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the point cloud carries colors.
    #[inline]
    pub fn has_colors(&self) -> bool {
        self.colors.is_some()
    }

    /// Get as reference the points in the point cloud.
    pub fn points(&self) -> &Tensor2<f32, A> {
        &self.points
    }

    /// Get as reference the colors of the points in the point cloud.
    pub fn colors(&self) -> Option<&Tensor2<f32, A>> {
        self.colors.as_ref()
    }

    /// Consumes the point cloud and returns the points and colors tensors.
    pub fn into_parts(self) -> (Tensor2<f32, A>, Option<Tensor2<f32, A>>) {
        (self.points, self.colors)
    }

    /// Returns the point at `index`, or `None` if out of bounds.
    pub fn point(&self, index: usize) -> Option<[f32; 3]> {
        let p = self.points.as_slice().get(index * 3..index * 3 + 3)?;
        Some([p[0], p[1], p[2]])
    }

    /// Returns the color at `index`, or `None` if out of bounds or uncolored.
    pub fn color(&self, index: usize) -> Option<[f32; 3]> {
        let c = self.colors.as_ref()?.as_slice().get(index * 3..index * 3 + 3)?;
        Some([c[0], c[1], c[2]])
    }

    /// Iterates over the points.
    pub fn iter_points(&self) -> impl Iterator<Item = [f32; 3]> + '_ {
        self.points
            .as_slice()
            .chunks_exact(3)
            .map(|p| [p[0], p[1], p[2]])
    }

    /// Get the minimum bound of the point cloud.
    pub fn get_min_bound(&self) -> Vec3 {
        self.iter_points()
            .map(Vec3::from_array)
            .reduce(Vec3::min)
            .unwrap_or(Vec3::ZERO)
    }

    /// Get the maximum bound of the point cloud.
    pub fn get_max_bound(&self) -> Vec3 {
        self.iter_points()
            .map(Vec3::from_array)
            .reduce(Vec3::max)
            .unwrap_or(Vec3::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointcloud() -> Result<(), TensorError> {
        let points = Tensor2::from_shape_vec(
            [2, 3],
            vec![0.0, 0.0, 0.0, 1.0, -2.0, 0.5],
            CpuAllocator,
        )?;
        let colors = Tensor2::from_shape_vec(
            [2, 3],
            vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            CpuAllocator,
        )?;
        let pointcloud = PointCloud::new(points, Some(colors))?;

        assert_eq!(pointcloud.len(), 2);
        assert!(!pointcloud.is_empty());
        assert!(pointcloud.has_colors());
        assert_eq!(pointcloud.point(1), Some([1.0, -2.0, 0.5]));
        assert_eq!(pointcloud.point(2), None);
        assert_eq!(pointcloud.color(1), Some([0.0, 1.0, 0.0]));
        assert_eq!(pointcloud.iter_points().count(), 2);

        assert_eq!(pointcloud.get_min_bound(), Vec3::new(0.0, -2.0, 0.0));
        assert_eq!(pointcloud.get_max_bound(), Vec3::new(1.0, 0.0, 0.5));

        let (points, colors) = pointcloud.into_parts();
        assert_eq!(points.shape, [2, 3]);
        assert!(colors.is_some());
        Ok(())
    }

    #[test]
    fn test_pointcloud_empty() -> Result<(), TensorError> {
        let pointcloud = PointCloud::new(Tensor2::zeros([0, 3], CpuAllocator)?, None)?;
        assert!(pointcloud.is_empty());
        assert!(!pointcloud.has_colors());
        assert_eq!(pointcloud.get_min_bound(), Vec3::ZERO);
        assert_eq!(pointcloud.color(0), None);
        Ok(())
    }

    #[test]
    fn test_pointcloud_shape_errors() -> Result<(), TensorError> {
        let res = PointCloud::new(Tensor2::<f32, _>::zeros([2, 2], CpuAllocator)?, None);
        assert!(matches!(res, Err(TensorError::DimensionMismatch { .. })));

        let res = PointCloud::new(
            Tensor2::zeros([2, 3], CpuAllocator)?,
            Some(Tensor2::zeros([1, 3], CpuAllocator)?),
        );
        assert!(matches!(res, Err(TensorError::DimensionMismatch { .. })));
        Ok(())
    }
}
