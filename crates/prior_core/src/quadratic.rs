//! Weighted quadratic smoothing prior.
//!
//! The prior value is the kappa-modulated, weighted sum of squared
//! differences between each voxel and its in-range neighbours:
//!
//! ```text
//! value = factor * sum_j sum_o  w(o) / 4 * (x_j - x_{j+o})^2 * kappa_j * kappa_{j+o}
//! ```
//!
//! The 1/4 compensates for each undirected neighbour pair being visited
//! twice, once from each endpoint. Offsets whose target falls outside the
//! image are skipped entirely, so the effective neighbourhood shrinks near
//! boundaries. The weight kernel is either supplied through configuration or
//! derived from the voxel spacing during `set_up`.

use std::fs::File;
use std::io::{self, BufWriter, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use ndarray::{ArrayView3, ArrayViewMut2, ArrayViewMut3, Axis};
use rayon::prelude::*;
use serde::Deserialize;

use crate::error::{PriorError, Result};
use crate::float_trait::PriorFloat;
use crate::hessian::{
    approximate_hessian_slab, hessian_diagonal_slab, hessian_row, hessian_times_input_slab,
    kappa_product, surrogate_curvature_slab,
};
use crate::image::{Volume, VolumeGeometry};
use crate::prior::{GeneralisedPrior, QuadraticPotential};
use crate::weights::NeighbourhoodWeights;

/// Minimum voxel count before the per-voxel outer loops fan out over rayon.
/// Set high enough that small test volumes stay on one thread.
const PARALLEL_VOXEL_THRESHOLD: usize = 32 * 32 * 32;

/// Recognized configuration options for the quadratic prior.
///
/// Field renames match the textual option names the surrounding parsing
/// mechanism uses, so a deserializer can populate this struct directly.
/// Kappa loading itself is the caller's concern: when `kappa filename` is
/// set, the loaded volume must be handed over via
/// [`QuadraticPrior::set_kappa`] before `set_up`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuadraticPriorConfig {
    /// Restrict the neighbourhood to the voxel's own slice.
    #[serde(rename = "only 2D")]
    pub only_2d: bool,
    /// Path of the per-voxel confidence image.
    #[serde(rename = "kappa filename")]
    pub kappa_filename: Option<PathBuf>,
    /// Literal neighbourhood weight array, `weights[dz][dy][dx]`.
    #[serde(rename = "weights")]
    pub weights: Option<Vec<Vec<Vec<f64>>>>,
    /// When set, every computed gradient is persisted to
    /// `{prefix}{count}.raw`.
    #[serde(rename = "gradient filename prefix")]
    pub gradient_filename_prefix: Option<PathBuf>,
    /// Global scalar controlling the prior's influence.
    #[serde(rename = "penalisation factor")]
    pub penalisation_factor: f64,
}

/// State resolved by `set_up` and read-only afterwards.
#[derive(Debug, Clone)]
struct ResolvedSetup<F: PriorFloat> {
    weights: NeighbourhoodWeights<F>,
    geometry: VolumeGeometry,
}

/// The weighted quadratic smoothing prior.
///
/// Smooth and convex; value, gradient and all second-order operations are
/// implemented. The penalisation factor must be non-negative; a factor of 0
/// makes every operation a short-circuit that touches neither the weight
/// kernel nor the kappa map.
#[derive(Debug)]
pub struct QuadraticPrior<F: PriorFloat> {
    penalisation_factor: F,
    only_2d: bool,
    explicit_weights: Option<NeighbourhoodWeights<F>>,
    resolved: Option<ResolvedSetup<F>>,
    kappa: Option<Arc<Volume<F>>>,
    kappa_filename: Option<PathBuf>,
    gradient_filename_prefix: Option<PathBuf>,
    gradient_dump_count: AtomicU64,
    potential: QuadraticPotential,
}

impl<F: PriorFloat> QuadraticPrior<F> {
    /// Stable type name used for name-based instantiation.
    pub const NAME: &'static str = "Quadratic";

    /// A prior with default settings: factor 0, full 3D neighbourhood,
    /// spacing-derived weights, no kappa.
    pub fn new() -> Self {
        Self {
            penalisation_factor: F::zero(),
            only_2d: false,
            explicit_weights: None,
            resolved: None,
            kappa: None,
            kappa_filename: None,
            gradient_filename_prefix: None,
            gradient_dump_count: AtomicU64::new(0),
            potential: QuadraticPotential,
        }
    }

    /// Build a prior from parsed configuration. An irregular weights literal
    /// or a negative penalisation factor fails here, before any object
    /// exists to misuse.
    pub fn from_config(config: QuadraticPriorConfig) -> Result<Self> {
        if config.penalisation_factor < 0.0 {
            return Err(PriorError::invalid_configuration(format!(
                "penalisation factor must be non-negative, got {}",
                config.penalisation_factor
            )));
        }
        let explicit_weights = config
            .weights
            .as_deref()
            .map(NeighbourhoodWeights::from_nested)
            .transpose()?;
        Ok(Self {
            penalisation_factor: F::from_f64_c(config.penalisation_factor),
            only_2d: config.only_2d,
            explicit_weights,
            resolved: None,
            kappa: None,
            kappa_filename: config.kappa_filename,
            gradient_filename_prefix: config.gradient_filename_prefix,
            gradient_dump_count: AtomicU64::new(0),
            potential: QuadraticPotential,
        })
    }

    /// Whether the neighbourhood is restricted to the voxel's own slice.
    pub fn only_2d(&self) -> bool {
        self.only_2d
    }

    /// Restrict (or widen) the neighbourhood; takes effect at the next
    /// `set_up` when the kernel is spacing-derived.
    pub fn set_only_2d(&mut self, only_2d: bool) {
        self.only_2d = only_2d;
        self.resolved = None;
    }

    /// The weight kernel currently in force: the resolved kernel after
    /// `set_up`, otherwise the explicitly configured one, if any.
    pub fn weights(&self) -> Option<&NeighbourhoodWeights<F>> {
        self.resolved
            .as_ref()
            .map(|setup| &setup.weights)
            .or(self.explicit_weights.as_ref())
    }

    /// Supply an explicit weight kernel; `set_up` must run again before the
    /// next computation.
    pub fn set_weights(&mut self, weights: NeighbourhoodWeights<F>) {
        self.explicit_weights = Some(weights);
        self.resolved = None;
    }

    /// Drop any explicit or resolved kernel, so the next `set_up` derives a
    /// fresh one from the target's voxel spacing.
    pub fn clear_weights(&mut self) {
        self.explicit_weights = None;
        self.resolved = None;
    }

    /// The kappa confidence image, if one is set.
    pub fn kappa(&self) -> Option<&Arc<Volume<F>>> {
        self.kappa.as_ref()
    }

    /// Supply the per-voxel confidence image. Its geometry is validated
    /// against the target during `set_up` and re-checked on every call.
    pub fn set_kappa(&mut self, kappa: Option<Arc<Volume<F>>>) {
        self.kappa = kappa;
    }

    /// When set, every computed gradient is persisted to
    /// `{prefix}{count}.raw` with a monotonically increasing counter.
    pub fn set_gradient_filename_prefix(&mut self, prefix: Option<PathBuf>) {
        self.gradient_filename_prefix = prefix;
    }

    /// Overwrite `curvature` with the parabolic surrogate curvature at
    /// `estimate`: per voxel, the kappa-modulated sum of neighbourhood
    /// weights times the penalisation factor. Equals the unit-coupling
    /// Hessian approximation applied to an all-ones field.
    pub fn parabolic_surrogate_curvature(
        &self,
        curvature: &mut Volume<F>,
        estimate: &Volume<F>,
    ) -> Result<()> {
        ensure_same_geometry("surrogate curvature output", curvature, "estimate", estimate)?;
        if self.penalisation_factor == F::zero() {
            curvature.fill(F::zero());
            return Ok(());
        }
        let setup = self.checked_setup(estimate)?;

        let dim = estimate.data().dim();
        let kappa_view = self.kappa.as_ref().map(|kappa| kappa.data());
        let kappa = kappa_view.as_ref();
        let factor = self.penalisation_factor;
        let parallel = estimate.geometry().num_voxels() >= PARALLEL_VOXEL_THRESHOLD;

        let mut out = curvature.data_mut();
        for_each_slab(&mut out, parallel, |z, slab: &mut ArrayViewMut2<'_, F>| {
            surrogate_curvature_slab(z, slab, dim, kappa, &setup.weights, factor);
        });
        drop(out);

        if let Some((min, max)) = curvature.min_max() {
            info!("parabolic surrogate curvature max {:?}, min {:?}", max, min);
        }
        Ok(())
    }

    /// Ready-check shared by every computation: set up, same grid as the
    /// set-up target, kappa (if present) on the same grid as the estimate.
    fn checked_setup(&self, estimate: &Volume<F>) -> Result<&ResolvedSetup<F>> {
        let setup = self
            .resolved
            .as_ref()
            .ok_or_else(|| PriorError::not_set_up(Self::NAME))?;
        if let Some(explanation) = setup.geometry.describe_mismatch(estimate.geometry()) {
            return Err(PriorError::geometry(format!(
                "image does not match the geometry this prior was set up with: {}",
                explanation
            )));
        }
        if let Some(kappa) = &self.kappa {
            if let Some(explanation) = kappa.geometry().describe_mismatch(estimate.geometry()) {
                return Err(PriorError::geometry(format!(
                    "kappa image does not have the same index range as the reconstructed image: {}",
                    explanation
                )));
            }
        }
        Ok(setup)
    }

    fn dump_gradient_if_configured(&self, gradient: &Volume<F>) {
        let Some(prefix) = &self.gradient_filename_prefix else {
            return;
        };
        let count = self.gradient_dump_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut name = prefix.as_os_str().to_os_string();
        name.push(format!("{}.raw", count));
        let path = PathBuf::from(name);
        if let Err(err) = write_raw_f64(&path, gradient) {
            warn!(
                "could not persist prior gradient to {}: {}",
                path.display(),
                err
            );
        }
    }
}

impl<F: PriorFloat> Default for QuadraticPrior<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: PriorFloat> GeneralisedPrior<F> for QuadraticPrior<F> {
    fn compute_value(&self, estimate: &Volume<F>) -> Result<f64> {
        if self.penalisation_factor == F::zero() {
            return Ok(0.0);
        }
        let setup = self.checked_setup(estimate)?;

        let est = estimate.data();
        let kappa_view = self.kappa.as_ref().map(|kappa| kappa.data());
        let kappa = kappa_view.as_ref();
        let nz = estimate.shape()[0];
        let parallel = estimate.geometry().num_voxels() >= PARALLEL_VOXEL_THRESHOLD;

        let total: f64 = if parallel {
            (0..nz)
                .into_par_iter()
                .map(|z| value_slab(z, &est, kappa, &setup.weights))
                .sum()
        } else {
            (0..nz)
                .map(|z| value_slab(z, &est, kappa, &setup.weights))
                .sum()
        };
        Ok(total * self.penalisation_factor.as_f64())
    }

    fn compute_gradient(&self, gradient: &mut Volume<F>, estimate: &Volume<F>) -> Result<()> {
        ensure_same_geometry("gradient output", gradient, "estimate", estimate)?;
        if self.penalisation_factor == F::zero() {
            gradient.fill(F::zero());
            return Ok(());
        }
        let setup = self.checked_setup(estimate)?;

        let est = estimate.data();
        let kappa_view = self.kappa.as_ref().map(|kappa| kappa.data());
        let kappa = kappa_view.as_ref();
        let factor = self.penalisation_factor;
        let parallel = estimate.geometry().num_voxels() >= PARALLEL_VOXEL_THRESHOLD;

        let mut out = gradient.data_mut();
        for_each_slab(&mut out, parallel, |z, slab: &mut ArrayViewMut2<'_, F>| {
            gradient_slab(z, slab, &est, kappa, &setup.weights, factor);
        });
        drop(out);

        if let Some((min, max)) = gradient.min_max() {
            info!("prior gradient max {:?}, min {:?}", max, min);
        }
        self.dump_gradient_if_configured(gradient);
        Ok(())
    }

    fn compute_hessian(
        &self,
        row: &mut Volume<F>,
        coords: [usize; 3],
        estimate: &Volume<F>,
    ) -> Result<()> {
        ensure_same_geometry("Hessian row output", row, "estimate", estimate)?;
        row.fill(F::zero());
        if self.penalisation_factor == F::zero() {
            return Ok(());
        }
        let setup = self.checked_setup(estimate)?;

        let shape = estimate.shape();
        if coords[0] >= shape[0] || coords[1] >= shape[1] || coords[2] >= shape[2] {
            return Err(PriorError::geometry(format!(
                "voxel coordinates {:?} lie outside the image index range {:?}",
                coords, shape
            )));
        }

        let kappa_view = self.kappa.as_ref().map(|kappa| kappa.data());
        hessian_row(
            &mut row.data_mut(),
            coords,
            &estimate.data(),
            kappa_view.as_ref(),
            &setup.weights,
            &self.potential,
            self.penalisation_factor,
        );
        Ok(())
    }

    fn compute_hessian_diagonal(
        &self,
        diagonal: &mut Volume<F>,
        estimate: &Volume<F>,
    ) -> Result<()> {
        ensure_same_geometry("Hessian diagonal output", diagonal, "estimate", estimate)?;
        if self.penalisation_factor == F::zero() {
            diagonal.fill(F::zero());
            return Ok(());
        }
        let setup = self.checked_setup(estimate)?;

        let est = estimate.data();
        let kappa_view = self.kappa.as_ref().map(|kappa| kappa.data());
        let kappa = kappa_view.as_ref();
        let factor = self.penalisation_factor;
        let parallel = estimate.geometry().num_voxels() >= PARALLEL_VOXEL_THRESHOLD;

        let mut out = diagonal.data_mut();
        for_each_slab(&mut out, parallel, |z, slab: &mut ArrayViewMut2<'_, F>| {
            hessian_diagonal_slab(z, slab, &est, kappa, &setup.weights, &self.potential, factor);
        });
        Ok(())
    }

    fn add_multiplication_with_approximate_hessian(
        &self,
        output: &mut Volume<F>,
        input: &Volume<F>,
    ) -> Result<()> {
        ensure_same_geometry("approximate-Hessian output", output, "input", input)?;
        if self.penalisation_factor == F::zero() {
            return Ok(());
        }
        let setup = self.checked_setup(input)?;

        let input_view = input.data();
        let kappa_view = self.kappa.as_ref().map(|kappa| kappa.data());
        let kappa = kappa_view.as_ref();
        let factor = self.penalisation_factor;
        let parallel = input.geometry().num_voxels() >= PARALLEL_VOXEL_THRESHOLD;

        let mut out = output.data_mut();
        for_each_slab(&mut out, parallel, |z, slab: &mut ArrayViewMut2<'_, F>| {
            approximate_hessian_slab(z, slab, &input_view, kappa, &setup.weights, factor);
        });
        Ok(())
    }

    fn accumulate_hessian_times_input(
        &self,
        output: &mut Volume<F>,
        estimate: &Volume<F>,
        input: &Volume<F>,
    ) -> Result<()> {
        ensure_same_geometry("Hessian-vector output", output, "estimate", estimate)?;
        ensure_same_geometry("Hessian-vector input", input, "estimate", estimate)?;
        if self.penalisation_factor == F::zero() {
            return Ok(());
        }
        let setup = self.checked_setup(estimate)?;

        let est = estimate.data();
        let input_view = input.data();
        let kappa_view = self.kappa.as_ref().map(|kappa| kappa.data());
        let kappa = kappa_view.as_ref();
        let factor = self.penalisation_factor;
        let parallel = estimate.geometry().num_voxels() >= PARALLEL_VOXEL_THRESHOLD;

        let mut out = output.data_mut();
        for_each_slab(&mut out, parallel, |z, slab: &mut ArrayViewMut2<'_, F>| {
            hessian_times_input_slab(
                z,
                slab,
                &est,
                &input_view,
                kappa,
                &setup.weights,
                &self.potential,
                factor,
            );
        });
        Ok(())
    }

    fn set_up(&mut self, target: &Volume<F>) -> Result<()> {
        if self.penalisation_factor < F::zero() {
            return Err(PriorError::invalid_configuration(format!(
                "penalisation factor must be non-negative, got {:?}",
                self.penalisation_factor
            )));
        }
        if self.kappa_filename.is_some() && self.kappa.is_none() {
            return Err(PriorError::invalid_configuration(
                "a kappa filename is configured but no kappa volume was supplied; \
                 load the file and call set_kappa before set_up",
            ));
        }
        if let Some(kappa) = &self.kappa {
            if let Some(explanation) = target.geometry().describe_mismatch(kappa.geometry()) {
                return Err(PriorError::geometry(format!(
                    "kappa image does not have the same index range as the reconstructed image: {}",
                    explanation
                )));
            }
        }

        let weights = match &self.explicit_weights {
            Some(weights) => weights.clone(),
            None => {
                NeighbourhoodWeights::from_spacing(target.geometry().spacing(), self.only_2d)
            }
        };
        self.resolved = Some(ResolvedSetup {
            weights,
            geometry: target.geometry().clone(),
        });
        Ok(())
    }

    fn check(&self, estimate: &Volume<F>) -> Result<()> {
        self.checked_setup(estimate).map(|_| ())
    }

    fn is_convex(&self) -> bool {
        true
    }

    fn penalisation_factor(&self) -> F {
        self.penalisation_factor
    }

    fn set_penalisation_factor(&mut self, factor: F) {
        self.penalisation_factor = factor;
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

/// Fail with a geometry error when `buffer` is not on `reference`'s grid.
fn ensure_same_geometry<F: PriorFloat>(
    buffer_name: &str,
    buffer: &Volume<F>,
    reference_name: &str,
    reference: &Volume<F>,
) -> Result<()> {
    match reference.geometry().describe_mismatch(buffer.geometry()) {
        Some(explanation) => Err(PriorError::geometry(format!(
            "{} does not share the {}'s grid: {}",
            buffer_name, reference_name, explanation
        ))),
        None => Ok(()),
    }
}

/// Run `slab_fn` over every z-slab of `out`, fanning out over rayon when the
/// volume is large enough to amortize the overhead.
fn for_each_slab<F: PriorFloat>(
    out: &mut ArrayViewMut3<'_, F>,
    parallel: bool,
    slab_fn: impl Fn(usize, &mut ArrayViewMut2<'_, F>) + Send + Sync,
) {
    if parallel {
        let slabs: Vec<_> = out.axis_iter_mut(Axis(0)).collect();
        slabs
            .into_par_iter()
            .enumerate()
            .for_each(|(z, mut slab)| slab_fn(z, &mut slab));
    } else {
        for (z, mut slab) in out.axis_iter_mut(Axis(0)).enumerate() {
            slab_fn(z, &mut slab);
        }
    }
}

/// Sum the quadratic pairwise terms over one z-slab, in f64.
fn value_slab<F: PriorFloat>(
    z: usize,
    estimate: &ArrayView3<'_, F>,
    kappa: Option<&ArrayView3<'_, F>>,
    weights: &NeighbourhoodWeights<F>,
) -> f64 {
    let (nz, ny, nx) = estimate.dim();
    let (min_dz, max_dz) = weights.clipped_range(0, nz, z);
    let mut sum = 0.0;
    for y in 0..ny {
        let (min_dy, max_dy) = weights.clipped_range(1, ny, y);
        for x in 0..nx {
            let (min_dx, max_dx) = weights.clipped_range(2, nx, x);
            let j = [z, y, x];
            let center = estimate[j].as_f64();
            for dz in min_dz..=max_dz {
                for dy in min_dy..=max_dy {
                    for dx in min_dx..=max_dx {
                        let k = [
                            (z as isize + dz) as usize,
                            (y as isize + dy) as usize,
                            (x as isize + dx) as usize,
                        ];
                        let diff = center - estimate[k].as_f64();
                        sum += weights.weight(dz, dy, dx).as_f64() * diff * diff / 4.0
                            * kappa_product(kappa, j, k).as_f64();
                    }
                }
            }
        }
    }
    sum
}

/// Overwrite one z-slab of the gradient: per voxel,
/// `factor * sum_o w(o) * (x_j - x_{j+o}) * kk`.
fn gradient_slab<F: PriorFloat>(
    z: usize,
    out: &mut ArrayViewMut2<'_, F>,
    estimate: &ArrayView3<'_, F>,
    kappa: Option<&ArrayView3<'_, F>>,
    weights: &NeighbourhoodWeights<F>,
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

            let mut gradient = F::zero();
            for dz in min_dz..=max_dz {
                for dy in min_dy..=max_dy {
                    for dx in min_dx..=max_dx {
                        let k = [
                            (z as isize + dz) as usize,
                            (y as isize + dy) as usize,
                            (x as isize + dx) as usize,
                        ];
                        gradient += weights.weight(dz, dy, dx)
                            * (center - estimate[k])
                            * kappa_product(kappa, j, k);
                    }
                }
            }
            out[[y, x]] = gradient * factor;
        }
    }
}

/// Dump a volume as little-endian f64 samples in z-major order.
fn write_raw_f64<F: PriorFloat>(path: &Path, volume: &Volume<F>) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for &sample in volume.data().iter() {
        writer.write_all(&sample.as_f64().to_le_bytes())?;
    }
    writer.flush()
}
