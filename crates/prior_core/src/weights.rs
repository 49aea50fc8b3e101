//! Neighbourhood weight kernel construction.
//!
//! The kernel is a small 3D array of coupling weights around an origin
//! offset `(0, 0, 0)`. It is either derived from the image's voxel spacing
//! (nearest x-neighbour normalised to 1, remaining neighbours falling off
//! with inverse physical distance) or supplied through configuration as a
//! literal nested array, which is validated and re-centred here.

use log::warn;
use ndarray::Array3;

use crate::error::{PriorError, Result};
use crate::float_trait::PriorFloat;

/// Coupling weights for the offsets around a voxel.
///
/// Logical offsets on axis `a` run over `-(center[a]) ..= len[a]-1-center[a]`;
/// for odd axis lengths that range is symmetric. Even axis lengths keep one
/// more offset on the negative side, as if a trailing zero weight had been
/// appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighbourhoodWeights<F: PriorFloat> {
    weights: Array3<F>,
    center: [usize; 3],
}

impl<F: PriorFloat> NeighbourhoodWeights<F> {
    /// Derive the default kernel from voxel spacing `(z, y, x)`.
    ///
    /// Offsets run over `{-1, 0, 1}` per axis (`{0}` on z in 2D-only mode).
    /// The origin gets weight 0 (no self-coupling); every other offset gets
    /// `spacing_x / |offset|` in physical units, so the nearest neighbour
    /// along x has weight 1. Depends on the spacing alone.
    pub fn from_spacing(spacing: [f64; 3], only_2d: bool) -> Self {
        let z_len = if only_2d { 1 } else { 3 };
        let center = [z_len / 2, 1, 1];
        let (sz, sy, sx) = (spacing[0], spacing[1], spacing[2]);

        let weights = Array3::from_shape_fn((z_len, 3, 3), |(iz, iy, ix)| {
            let dz = iz as isize - center[0] as isize;
            let dy = iy as isize - 1;
            let dx = ix as isize - 1;
            if dz == 0 && dy == 0 && dx == 0 {
                F::zero()
            } else {
                let dist = ((dx as f64 * sx).powi(2)
                    + (dy as f64 * sy).powi(2)
                    + (dz as f64 * sz).powi(2))
                .sqrt();
                F::from_f64_c(sx / dist)
            }
        });

        Self { weights, center }
    }

    /// Build a kernel from a configuration literal.
    ///
    /// The nested array must be rectangular; each axis is re-centred so
    /// index 0 is the middle. Even-length axes are accepted with a warning
    /// and keep the extra offset on the negative side.
    pub fn from_nested(nested: &[Vec<Vec<f64>>]) -> Result<Self> {
        let z_len = nested.len();
        if z_len == 0 {
            return Err(PriorError::invalid_configuration(
                "weights array is empty",
            ));
        }
        let y_len = nested[0].len();
        let x_len = nested[0].first().map_or(0, Vec::len);
        if y_len == 0 || x_len == 0 {
            return Err(PriorError::invalid_configuration(
                "weights array has an empty axis",
            ));
        }
        let regular = nested
            .iter()
            .all(|plane| plane.len() == y_len && plane.iter().all(|row| row.len() == x_len));
        if !regular {
            return Err(PriorError::invalid_configuration(
                "weights array is irregular; only rectangular arrays are supported",
            ));
        }

        if z_len % 2 == 0 || y_len % 2 == 0 || x_len % 2 == 0 {
            warn!(
                "even number of weights in the z, y or x dimension; \
                 treating the axis as if a trailing zero weight were appended"
            );
        }

        let weights = Array3::from_shape_fn((z_len, y_len, x_len), |(iz, iy, ix)| {
            F::from_f64_c(nested[iz][iy][ix])
        });

        Ok(Self {
            weights,
            center: [z_len / 2, y_len / 2, x_len / 2],
        })
    }

    /// Kernel extent per axis, `(z, y, x)`.
    pub fn shape(&self) -> [usize; 3] {
        let dim = self.weights.dim();
        [dim.0, dim.1, dim.2]
    }

    /// Smallest and largest logical offset on `axis`.
    pub fn offset_range(&self, axis: usize) -> (isize, isize) {
        let len = self.shape()[axis] as isize;
        let center = self.center[axis] as isize;
        (-center, len - 1 - center)
    }

    /// Offset range on `axis` clipped for the voxel at `idx` on an image
    /// axis of length `len`, so that `idx + offset` stays in `0..len`.
    pub fn clipped_range(&self, axis: usize, len: usize, idx: usize) -> (isize, isize) {
        debug_assert!(idx < len);
        let (lo, hi) = self.offset_range(axis);
        (lo.max(-(idx as isize)), hi.min(len as isize - 1 - idx as isize))
    }

    /// Weight at logical offset `(dz, dy, dx)`.
    ///
    /// The offset must lie inside [`Self::offset_range`] on every axis.
    #[inline]
    pub fn weight(&self, dz: isize, dy: isize, dx: isize) -> F {
        let iz = (self.center[0] as isize + dz) as usize;
        let iy = (self.center[1] as isize + dy) as usize;
        let ix = (self.center[2] as isize + dx) as usize;
        self.weights[[iz, iy, ix]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_auto_kernel_unit_spacing() {
        let w = NeighbourhoodWeights::<f64>::from_spacing([1.0, 1.0, 1.0], false);
        assert_eq!(w.shape(), [3, 3, 3]);
        assert_eq!(w.offset_range(0), (-1, 1));

        // No self-coupling at the origin
        assert_eq!(w.weight(0, 0, 0), 0.0);
        // Face neighbours at unit distance
        assert_eq!(w.weight(0, 0, 1), 1.0);
        assert_eq!(w.weight(0, 1, 0), 1.0);
        assert_eq!(w.weight(1, 0, 0), 1.0);
        // Edge and corner neighbours fall off with inverse distance
        assert!(approx_eq(w.weight(0, 1, 1), 1.0 / 2.0f64.sqrt(), 1e-12));
        assert!(approx_eq(w.weight(1, 1, 1), 1.0 / 3.0f64.sqrt(), 1e-12));
        // Symmetric
        assert_eq!(w.weight(0, 0, -1), w.weight(0, 0, 1));
        assert_eq!(w.weight(-1, -1, -1), w.weight(1, 1, 1));
    }

    #[test]
    fn test_auto_kernel_anisotropic_spacing() {
        // x spacing 2, z spacing 4: x face neighbour still normalises to 1
        let w = NeighbourhoodWeights::<f64>::from_spacing([4.0, 1.0, 2.0], false);
        assert_eq!(w.weight(0, 0, 1), 1.0);
        assert_eq!(w.weight(0, 1, 0), 2.0);
        assert_eq!(w.weight(1, 0, 0), 0.5);
        assert!(approx_eq(w.weight(0, 1, 1), 2.0 / 5.0f64.sqrt(), 1e-12));
    }

    #[test]
    fn test_auto_kernel_only_2d() {
        let w = NeighbourhoodWeights::<f32>::from_spacing([3.0, 1.0, 1.0], true);
        assert_eq!(w.shape(), [1, 3, 3]);
        assert_eq!(w.offset_range(0), (0, 0));
        assert_eq!(w.weight(0, 0, 1), 1.0);
    }

    #[test]
    fn test_auto_kernel_deterministic() {
        let a = NeighbourhoodWeights::<f64>::from_spacing([2.0, 1.5, 1.0], false);
        let b = NeighbourhoodWeights::<f64>::from_spacing([2.0, 1.5, 1.0], false);
        assert_eq!(a, b);
    }

    #[test]
    fn test_explicit_kernel_recentring() {
        let nested = vec![vec![
            vec![0.0, 1.0, 0.0],
            vec![1.0, 0.0, 1.0],
            vec![0.0, 1.0, 0.0],
        ]];
        let w = NeighbourhoodWeights::<f64>::from_nested(&nested).unwrap();
        assert_eq!(w.shape(), [1, 3, 3]);
        assert_eq!(w.offset_range(0), (0, 0));
        assert_eq!(w.offset_range(1), (-1, 1));
        assert_eq!(w.weight(0, -1, 0), 1.0);
        assert_eq!(w.weight(0, 0, 0), 0.0);
    }

    #[test]
    fn test_explicit_kernel_even_axis() {
        // 4 entries along x: offsets -2..=1, middle lands on index 2
        let nested = vec![vec![vec![0.1, 0.2, 0.0, 0.4]]];
        let w = NeighbourhoodWeights::<f64>::from_nested(&nested).unwrap();
        assert_eq!(w.offset_range(2), (-2, 1));
        assert_eq!(w.weight(0, 0, -2), 0.1);
        assert_eq!(w.weight(0, 0, 0), 0.0);
        assert_eq!(w.weight(0, 0, 1), 0.4);
    }

    #[test]
    fn test_explicit_kernel_irregular_rejected() {
        let ragged_row = vec![vec![vec![1.0, 2.0], vec![1.0]]];
        assert!(NeighbourhoodWeights::<f64>::from_nested(&ragged_row).is_err());

        let ragged_plane = vec![
            vec![vec![1.0], vec![2.0]],
            vec![vec![3.0]],
        ];
        assert!(NeighbourhoodWeights::<f64>::from_nested(&ragged_plane).is_err());

        assert!(NeighbourhoodWeights::<f64>::from_nested(&[]).is_err());
        assert!(NeighbourhoodWeights::<f64>::from_nested(&[vec![]]).is_err());
    }

    #[test]
    fn test_clipped_range() {
        let w = NeighbourhoodWeights::<f64>::from_spacing([1.0, 1.0, 1.0], false);
        // Interior voxel keeps the full range
        assert_eq!(w.clipped_range(0, 5, 2), (-1, 1));
        // Boundary voxels lose the out-of-range side
        assert_eq!(w.clipped_range(0, 5, 0), (0, 1));
        assert_eq!(w.clipped_range(0, 5, 4), (-1, 0));
        // Axis of length 1 collapses to the origin offset
        assert_eq!(w.clipped_range(0, 1, 0), (0, 0));
    }
}
