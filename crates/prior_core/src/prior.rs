//! The generalised prior contract.
//!
//! A "generalised" prior is one for which at least a gradient is defined.
//! Reconstruction algorithms hold a prior through this trait, call
//! [`GeneralisedPrior::compute_gradient`] every iteration to bias the
//! update, and use the second-order operations for curvature-based step
//! control when the prior supports them. Second-order operations default to
//! an explicit [`PriorError::Unimplemented`] so an unsupported call fails
//! loudly instead of producing a silently wrong number.

use crate::error::{PriorError, Result};
use crate::float_trait::PriorFloat;
use crate::image::Volume;

/// Contract shared by every prior variant.
///
/// All computations take `&self`: configuration (weight kernel, kappa,
/// penalisation factor) is resolved during [`GeneralisedPrior::set_up`] and
/// read-only afterwards, so the per-voxel loops can run in parallel without
/// synchronisation.
pub trait GeneralisedPrior<F: PriorFloat> {
    /// Total prior value at `estimate`, already scaled by the penalisation
    /// factor. Returns 0 immediately when the factor is 0.
    fn compute_value(&self, estimate: &Volume<F>) -> Result<f64>;

    /// Gradient of the prior at `estimate`, scaled by the penalisation
    /// factor. Fully overwrites `gradient`; fills it with 0 when the factor
    /// is 0.
    fn compute_gradient(&self, gradient: &mut Volume<F>, estimate: &Volume<F>) -> Result<()>;

    /// Directional derivative `gradient(estimate) . input`.
    fn compute_gradient_times_input(
        &self,
        _input: &Volume<F>,
        _estimate: &Volume<F>,
    ) -> Result<f64> {
        Err(PriorError::unimplemented(
            "compute_gradient_times_input",
            self.name(),
        ))
    }

    /// One row of the Hessian at `estimate`: the coupling coefficients of
    /// the voxel at `coords` with itself and with every in-range neighbour,
    /// stored into `row` (zero everywhere else).
    fn compute_hessian(
        &self,
        _row: &mut Volume<F>,
        _coords: [usize; 3],
        _estimate: &Volume<F>,
    ) -> Result<()> {
        Err(PriorError::unimplemented("compute_hessian", self.name()))
    }

    /// The diagonal of the Hessian at `estimate`, overwritten into
    /// `diagonal`.
    fn compute_hessian_diagonal(
        &self,
        _diagonal: &mut Volume<F>,
        _estimate: &Volume<F>,
    ) -> Result<()> {
        Err(PriorError::unimplemented(
            "compute_hessian_diagonal",
            self.name(),
        ))
    }

    /// Add a cheap unit-coupling approximation of `Hessian . input` into
    /// `output` (accumulates, never overwrites). Legacy curvature-surrogate
    /// path for optimizers that need a bound rather than the exact Hessian
    /// action.
    fn add_multiplication_with_approximate_hessian(
        &self,
        _output: &mut Volume<F>,
        _input: &Volume<F>,
    ) -> Result<()> {
        Err(PriorError::unimplemented(
            "add_multiplication_with_approximate_hessian",
            self.name(),
        ))
    }

    /// Add the exact `Hessian . input` at `estimate` into `output`
    /// (accumulates, never overwrites).
    fn accumulate_hessian_times_input(
        &self,
        _output: &mut Volume<F>,
        _estimate: &Volume<F>,
        _input: &Volume<F>,
    ) -> Result<()> {
        Err(PriorError::unimplemented(
            "accumulate_hessian_times_input",
            self.name(),
        ))
    }

    /// Validate the configuration against a representative image and resolve
    /// any lazily derived state (weight kernel, kappa geometry). Must be
    /// called before any computation.
    fn set_up(&mut self, target: &Volume<F>) -> Result<()>;

    /// Verify the prior is ready for `estimate`: set up, and kappa (if
    /// present) on the same grid. Called at the start of every computation.
    fn check(&self, estimate: &Volume<F>) -> Result<()>;

    /// Whether the prior is a smooth convex function. If `true`, 0th, 1st
    /// and 2nd order behaviour is implemented and well-behaved.
    fn is_convex(&self) -> bool;

    /// Global scalar controlling the prior's relative influence.
    fn penalisation_factor(&self) -> F;

    /// Replace the penalisation factor.
    fn set_penalisation_factor(&mut self, factor: F);

    /// Stable type name used for name-based instantiation.
    fn name(&self) -> &'static str;
}

/// The pairwise second-derivative pair parameterising the shared
/// neighbourhood sweeps.
///
/// A separable pairwise prior is a sum of terms `f(x_j, x_k)` over coupled
/// voxel pairs. Its Hessian decomposes into the diagonal second derivative
/// `d²f/dx_j²` and the off-diagonal coupling `d²f/dx_j dx_k`; those two
/// scalar functions are all the second-order machinery needs, so they are
/// injected rather than baked into the iteration logic.
pub trait PairwisePotential<F: PriorFloat>: Send + Sync {
    /// `d²f/dx_j²` evaluated at `(x_j, x_k)`.
    fn derivative_20(&self, x_j: F, x_k: F) -> F;

    /// `d²f/dx_j dx_k` evaluated at `(x_j, x_k)`.
    fn derivative_11(&self, x_j: F, x_k: F) -> F;
}

/// Pairwise squared difference: `f(x_j, x_k) = (x_j - x_k)² / 4`, summed
/// from both endpoints. Constant second derivatives.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticPotential;

impl<F: PriorFloat> PairwisePotential<F> for QuadraticPotential {
    #[inline]
    fn derivative_20(&self, _x_j: F, _x_k: F) -> F {
        F::one()
    }

    #[inline]
    fn derivative_11(&self, _x_j: F, _x_k: F) -> F {
        -F::one()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadratic_potential_is_constant() {
        let p = QuadraticPotential;
        for (a, b) in [(0.0f64, 0.0), (1.0, -3.5), (1e6, 2e-7)] {
            assert_eq!(p.derivative_20(a, b), 1.0);
            assert_eq!(p.derivative_11(a, b), -1.0);
        }
    }

    #[test]
    fn test_quadratic_potential_row_sums_to_zero() {
        // d20 + d11 = 0 makes constant images fixed points of the Hessian
        let p = QuadraticPotential;
        assert_eq!(
            p.derivative_20(2.0f32, 5.0) + p.derivative_11(2.0f32, 5.0),
            0.0
        );
    }
}
