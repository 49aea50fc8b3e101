//! Volumetric image container with physical grid metadata.
//!
//! A [`Volume`] couples an `ndarray` sample array with a [`VolumeGeometry`]
//! describing the grid it lives on. The priors never own the estimate they
//! are evaluated on; they read caller-supplied volumes and write into
//! caller-supplied output volumes, so geometry agreement between those
//! volumes is checked here and reported with a human-readable explanation.
//!
//! Axis order is `(z, y, x)` throughout, matching `ndarray`'s row-major
//! layout; the index range of axis `a` is `0..shape[a]`.

use ndarray::{Array3, ArrayView3, ArrayViewMut3};

use crate::error::{PriorError, Result};
use crate::float_trait::PriorFloat;

/// Physical grid description of a volume.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGeometry {
    /// Number of voxels per axis, `(z, y, x)`.
    shape: [usize; 3],
    /// Physical distance between voxel centres per axis, `(z, y, x)`.
    spacing: [f64; 3],
    /// Physical coordinate of voxel `(0, 0, 0)`.
    origin: [f64; 3],
}

impl VolumeGeometry {
    /// Create a geometry with the given shape and voxel spacing, origin at zero.
    pub fn new(shape: [usize; 3], spacing: [f64; 3]) -> Result<Self> {
        Self::with_origin(shape, spacing, [0.0; 3])
    }

    /// Create a geometry with an explicit origin.
    pub fn with_origin(shape: [usize; 3], spacing: [f64; 3], origin: [f64; 3]) -> Result<Self> {
        if spacing.iter().any(|&s| !(s > 0.0)) {
            return Err(PriorError::invalid_configuration(format!(
                "voxel spacing must be positive on every axis, got {:?}",
                spacing
            )));
        }
        Ok(Self {
            shape,
            spacing,
            origin,
        })
    }

    /// Number of voxels per axis, `(z, y, x)`.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Voxel spacing per axis, `(z, y, x)`.
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    /// Physical coordinate of voxel `(0, 0, 0)`.
    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    /// Total number of voxels.
    pub fn num_voxels(&self) -> usize {
        self.shape.iter().product()
    }

    /// Explain how `other` differs from `self`, or `None` when identical.
    ///
    /// The explanation names the first differing property and both values,
    /// suitable for embedding in a configuration error.
    pub fn describe_mismatch(&self, other: &Self) -> Option<String> {
        if self.shape != other.shape {
            return Some(format!(
                "index ranges differ: shape {:?} vs {:?}",
                self.shape, other.shape
            ));
        }
        if self.spacing != other.spacing {
            return Some(format!(
                "voxel spacing differs: {:?} vs {:?}",
                self.spacing, other.spacing
            ));
        }
        if self.origin != other.origin {
            return Some(format!(
                "origin differs: {:?} vs {:?}",
                self.origin, other.origin
            ));
        }
        None
    }

    /// Whether `other` describes the same grid.
    pub fn matches(&self, other: &Self) -> bool {
        self.describe_mismatch(other).is_none()
    }
}

/// A 3D image: scalar samples on a regular grid.
#[derive(Debug, Clone)]
pub struct Volume<F: PriorFloat> {
    data: Array3<F>,
    geometry: VolumeGeometry,
}

impl<F: PriorFloat> Volume<F> {
    /// Wrap an existing sample array. The array shape must agree with the
    /// geometry.
    pub fn new(data: Array3<F>, geometry: VolumeGeometry) -> Result<Self> {
        let dim = data.dim();
        let actual = [dim.0, dim.1, dim.2];
        if actual != geometry.shape() {
            return Err(PriorError::geometry(format!(
                "sample array shape {:?} disagrees with geometry shape {:?}",
                actual,
                geometry.shape()
            )));
        }
        Ok(Self { data, geometry })
    }

    /// An all-zero volume on the given grid.
    pub fn zeros(geometry: VolumeGeometry) -> Self {
        let shape = geometry.shape();
        Self {
            data: Array3::zeros((shape[0], shape[1], shape[2])),
            geometry,
        }
    }

    /// An all-zero volume on the same grid as `other`.
    pub fn zeros_like(other: &Self) -> Self {
        Self::zeros(other.geometry.clone())
    }

    /// Build a volume by evaluating `f` at every `(z, y, x)` index.
    pub fn from_fn(
        geometry: VolumeGeometry,
        f: impl FnMut((usize, usize, usize)) -> F,
    ) -> Self {
        let shape = geometry.shape();
        Self {
            data: Array3::from_shape_fn((shape[0], shape[1], shape[2]), f),
            geometry,
        }
    }

    /// Grid description.
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Number of voxels per axis, `(z, y, x)`.
    pub fn shape(&self) -> [usize; 3] {
        self.geometry.shape()
    }

    /// Voxel spacing per axis, `(z, y, x)`.
    pub fn spacing(&self) -> [f64; 3] {
        self.geometry.spacing()
    }

    /// Read-only view of the samples.
    pub fn data(&self) -> ArrayView3<'_, F> {
        self.data.view()
    }

    /// Mutable view of the samples.
    pub fn data_mut(&mut self) -> ArrayViewMut3<'_, F> {
        self.data.view_mut()
    }

    /// Sample at `(z, y, x)`.
    pub fn get(&self, index: [usize; 3]) -> F {
        self.data[index]
    }

    /// Overwrite the sample at `(z, y, x)`.
    pub fn set(&mut self, index: [usize; 3], value: F) {
        self.data[index] = value;
    }

    /// Set every sample to `value`.
    pub fn fill(&mut self, value: F) {
        self.data.fill(value);
    }

    /// Minimum and maximum sample, or `None` for an empty volume.
    pub fn min_max(&self) -> Option<(F, F)> {
        let mut iter = self.data.iter();
        let first = *iter.next()?;
        let mut min = first;
        let mut max = first;
        for &v in iter {
            if v < min {
                min = v;
            }
            if v > max {
                max = v;
            }
        }
        Some((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn geometry(shape: [usize; 3]) -> VolumeGeometry {
        VolumeGeometry::new(shape, [1.0, 1.0, 1.0]).unwrap()
    }

    #[test]
    fn test_geometry_rejects_nonpositive_spacing() {
        assert!(VolumeGeometry::new([2, 2, 2], [1.0, 0.0, 1.0]).is_err());
        assert!(VolumeGeometry::new([2, 2, 2], [1.0, -2.0, 1.0]).is_err());
        assert!(VolumeGeometry::new([2, 2, 2], [1.0, f64::NAN, 1.0]).is_err());
    }

    #[test]
    fn test_geometry_mismatch_explanations() {
        let a = geometry([3, 4, 5]);
        let b = geometry([3, 4, 6]);
        let explanation = a.describe_mismatch(&b).expect("shapes differ");
        assert!(explanation.contains("index ranges"), "{}", explanation);

        let c = VolumeGeometry::new([3, 4, 5], [2.0, 1.0, 1.0]).unwrap();
        let explanation = a.describe_mismatch(&c).expect("spacing differs");
        assert!(explanation.contains("spacing"), "{}", explanation);

        let d = VolumeGeometry::with_origin([3, 4, 5], [1.0, 1.0, 1.0], [0.0, 0.0, 1.0]).unwrap();
        let explanation = a.describe_mismatch(&d).expect("origin differs");
        assert!(explanation.contains("origin"), "{}", explanation);

        assert!(a.matches(&a.clone()));
        assert_eq!(a.describe_mismatch(&a.clone()), None);
    }

    #[test]
    fn test_volume_shape_must_agree_with_geometry() {
        let data = Array3::<f32>::zeros((2, 3, 4));
        assert!(Volume::new(data.clone(), geometry([2, 3, 4])).is_ok());
        assert!(Volume::new(data, geometry([2, 4, 3])).is_err());
    }

    #[test]
    fn test_from_fn_and_access() {
        let v = Volume::<f64>::from_fn(geometry([2, 2, 2]), |(z, y, x)| {
            (z * 4 + y * 2 + x) as f64
        });
        assert_eq!(v.get([0, 0, 0]), 0.0);
        assert_eq!(v.get([1, 1, 1]), 7.0);
        assert_eq!(v.min_max(), Some((0.0, 7.0)));
    }

    #[test]
    fn test_zeros_like_and_fill() {
        let a = Volume::<f32>::from_fn(geometry([2, 2, 2]), |_| 3.0);
        let mut b = Volume::zeros_like(&a);
        assert!(b.geometry().matches(a.geometry()));
        assert_eq!(b.min_max(), Some((0.0, 0.0)));
        b.fill(-1.5);
        assert_eq!(b.min_max(), Some((-1.5, -1.5)));
    }
}
