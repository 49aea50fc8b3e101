//! Second-order neighbourhood sweeps shared by separable pairwise priors.
//!
//! Every function here walks the clipped neighbourhood of each voxel and
//! combines the kernel weight, the optional kappa product and the injected
//! [`PairwisePotential`] derivatives. The quadratic prior instantiates them
//! with constant derivatives; any other separable pairwise prior can reuse
//! the same sweeps with value-dependent ones.
//!
//! The per-slab functions each write (or accumulate into) a single z-slab of
//! the output and read everything else, so the caller may fan slabs out
//! across threads freely.

use ndarray::{ArrayView3, ArrayViewMut2, ArrayViewMut3};

use crate::float_trait::PriorFloat;
use crate::prior::PairwisePotential;
use crate::weights::NeighbourhoodWeights;

/// Kappa product `kappa_j * kappa_{j+o}`, or 1 when no kappa map is present.
#[inline]
pub(crate) fn kappa_product<F: PriorFloat>(
    kappa: Option<&ArrayView3<'_, F>>,
    j: [usize; 3],
    k: [usize; 3],
) -> F {
    match kappa {
        Some(map) => map[j] * map[k],
        None => F::one(),
    }
}

/// One row of the Hessian: couplings of the voxel at `coords` with itself
/// and its in-range neighbours. `row` must be pre-zeroed by the caller.
pub fn hessian_row<F: PriorFloat>(
    row: &mut ArrayViewMut3<'_, F>,
    coords: [usize; 3],
    estimate: &ArrayView3<'_, F>,
    kappa: Option<&ArrayView3<'_, F>>,
    weights: &NeighbourhoodWeights<F>,
    potential: &dyn PairwisePotential<F>,
    factor: F,
) {
    let (nz, ny, nx) = estimate.dim();
    let [z, y, x] = coords;
    let (min_dz, max_dz) = weights.clipped_range(0, nz, z);
    let (min_dy, max_dy) = weights.clipped_range(1, ny, y);
    let (min_dx, max_dx) = weights.clipped_range(2, nx, x);

    let center = estimate[coords];
    for dz in min_dz..=max_dz {
        for dy in min_dy..=max_dy {
            for dx in min_dx..=max_dx {
                let neighbour = [
                    (z as isize + dz) as usize,
                    (y as isize + dy) as usize,
                    (x as isize + dx) as usize,
                ];
                let entry = if dz == 0 && dy == 0 && dx == 0 {
                    // Diagonal element: sum over the whole neighbourhood
                    let mut sum = F::zero();
                    for ddz in min_dz..=max_dz {
                        for ddy in min_dy..=max_dy {
                            for ddx in min_dx..=max_dx {
                                let other = [
                                    (z as isize + ddz) as usize,
                                    (y as isize + ddy) as usize,
                                    (x as isize + ddx) as usize,
                                ];
                                sum += weights.weight(ddz, ddy, ddx)
                                    * potential.derivative_20(center, estimate[other])
                                    * kappa_product(kappa, coords, other);
                            }
                        }
                    }
                    sum
                } else {
                    weights.weight(dz, dy, dx)
                        * potential.derivative_11(center, estimate[neighbour])
                        * kappa_product(kappa, coords, neighbour)
                };
                row[neighbour] = entry * factor;
            }
        }
    }
}

/// Accumulate one z-slab of the exact Hessian-vector product into `out`.
///
/// Per voxel j:
/// `sum_o w(o) * kk * (d20 * input_j              if o = 0;
///                     d20 * input_j + d11 * input_{j+o}  otherwise)`.
/// Zero-weight offsets contribute exactly zero and are skipped.
pub fn hessian_times_input_slab<F: PriorFloat>(
    z: usize,
    out: &mut ArrayViewMut2<'_, F>,
    estimate: &ArrayView3<'_, F>,
    input: &ArrayView3<'_, F>,
    kappa: Option<&ArrayView3<'_, F>>,
    weights: &NeighbourhoodWeights<F>,
    potential: &dyn PairwisePotential<F>,
    factor: F,
) {
    let (nz, ny, nx) = estimate.dim();
    let (min_dz, max_dz) = weights.clipped_range(0, nz, z);
    for y in 0..ny {
        let (min_dy, max_dy) = weights.clipped_range(1, ny, y);
        for x in 0..nx {
            let (min_dx, max_dx) = weights.clipped_range(2, nx, x);
            let j = [z, y, x];
            let center = estimate[j];
            let input_center = input[j];

            let mut result = F::zero();
            for dz in min_dz..=max_dz {
                for dy in min_dy..=max_dy {
                    for dx in min_dx..=max_dx {
                        let w = weights.weight(dz, dy, dx);
                        if w == F::zero() {
                            continue;
                        }
                        let k = [
                            (z as isize + dz) as usize,
                            (y as isize + dy) as usize,
                            (x as isize + dx) as usize,
                        ];
                        let mut current = if dz == 0 && dy == 0 && dx == 0 {
                            w * potential.derivative_20(center, estimate[k]) * input_center
                        } else {
                            w * (potential.derivative_20(center, estimate[k]) * input_center
                                + potential.derivative_11(center, estimate[k]) * input[k])
                        };
                        current *= kappa_product(kappa, j, k);
                        result += current;
                    }
                }
            }
            out[[y, x]] += result * factor;
        }
    }
}

/// Accumulate one z-slab of the unit-coupling Hessian approximation into
/// `out`: per voxel, `sum_o w(o) * input_{j+o} * kk`.
pub fn approximate_hessian_slab<F: PriorFloat>(
    z: usize,
    out: &mut ArrayViewMut2<'_, F>,
    input: &ArrayView3<'_, F>,
    kappa: Option<&ArrayView3<'_, F>>,
    weights: &NeighbourhoodWeights<F>,
    factor: F,
) {
    let (nz, ny, nx) = input.dim();
    let (min_dz, max_dz) = weights.clipped_range(0, nz, z);
    for y in 0..ny {
        let (min_dy, max_dy) = weights.clipped_range(1, ny, y);
        for x in 0..nx {
            let (min_dx, max_dx) = weights.clipped_range(2, nx, x);
            let j = [z, y, x];

            let mut result = F::zero();
            for dz in min_dz..=max_dz {
                for dy in min_dy..=max_dy {
                    for dx in min_dx..=max_dx {
                        let k = [
                            (z as isize + dz) as usize,
                            (y as isize + dy) as usize,
                            (x as isize + dx) as usize,
                        ];
                        result += weights.weight(dz, dy, dx)
                            * input[k]
                            * kappa_product(kappa, j, k);
                    }
                }
            }
            out[[y, x]] += result * factor;
        }
    }
}

/// Overwrite one z-slab of the parabolic surrogate curvature: the
/// unit-coupling sweep with an implicit all-ones input,
/// `sum_o w(o) * kk` per voxel.
pub fn surrogate_curvature_slab<F: PriorFloat>(
    z: usize,
    out: &mut ArrayViewMut2<'_, F>,
    dim: (usize, usize, usize),
    kappa: Option<&ArrayView3<'_, F>>,
    weights: &NeighbourhoodWeights<F>,
    factor: F,
) {
    let (nz, ny, nx) = dim;
    let (min_dz, max_dz) = weights.clipped_range(0, nz, z);
    for y in 0..ny {
        let (min_dy, max_dy) = weights.clipped_range(1, ny, y);
        for x in 0..nx {
            let (min_dx, max_dx) = weights.clipped_range(2, nx, x);
            let j = [z, y, x];

            let mut curvature = F::zero();
            for dz in min_dz..=max_dz {
                for dy in min_dy..=max_dy {
                    for dx in min_dx..=max_dx {
                        let k = [
                            (z as isize + dz) as usize,
                            (y as isize + dy) as usize,
                            (x as isize + dx) as usize,
                        ];
                        curvature += weights.weight(dz, dy, dx) * kappa_product(kappa, j, k);
                    }
                }
            }
            out[[y, x]] = curvature * factor;
        }
    }
}

/// Overwrite one z-slab of the Hessian diagonal:
/// `sum_o w(o) * d20(x_j, x_{j+o}) * kk` per voxel.
pub fn hessian_diagonal_slab<F: PriorFloat>(
    z: usize,
    out: &mut ArrayViewMut2<'_, F>,
    estimate: &ArrayView3<'_, F>,
    kappa: Option<&ArrayView3<'_, F>>,
    weights: &NeighbourhoodWeights<F>,
    potential: &dyn PairwisePotential<F>,
    factor: F,
) {
    let (nz, ny, nx) = estimate.dim();
    let (min_dz, max_dz) = weights.clipped_range(0, nz, z);
    for y in 0..ny {
        let (min_dy, max_dy) = weights.clipped_range(1, ny, y);
        for x in 0..nx {
            let (min_dx, max_dx) = weights.clipped_range(2, nx, x);
            let j = [z, y, x];
            let center = estimate[j];

            let mut diagonal = F::zero();
            for dz in min_dz..=max_dz {
                for dy in min_dy..=max_dy {
                    for dx in min_dx..=max_dx {
                        let k = [
                            (z as isize + dz) as usize,
                            (y as isize + dy) as usize,
                            (x as isize + dx) as usize,
                        ];
                        diagonal += weights.weight(dz, dy, dx)
                            * potential.derivative_20(center, estimate[k])
                            * kappa_product(kappa, j, k);
                    }
                }
            }
            out[[y, x]] = diagonal * factor;
        }
    }
}
