//! Generalised Smoothing Priors for Penalised-Likelihood Reconstruction
//!
//! Pure Rust implementation of the regularisation priors used by iterative
//! penalised-likelihood reconstruction of volumetric (e.g. tomographic)
//! images. A prior supplies the value, gradient and curvature (Hessian) of a
//! roughness penalty evaluated on the current image estimate, so that the
//! surrounding reconstruction algorithm can bias its updates toward smooth,
//! noise-suppressed solutions.
//!
//! This crate contains the shared prior contract and the weighted quadratic
//! smoothing prior, without any of the surrounding reconstruction machinery.

pub mod error;
pub mod float_trait;
pub mod hessian;
pub mod image;
pub mod prior;
pub mod quadratic;
pub mod weights;

// Re-export commonly used types at the crate root
pub use error::{PriorError, Result};
pub use float_trait::PriorFloat;
pub use image::{Volume, VolumeGeometry};
pub use prior::{GeneralisedPrior, PairwisePotential, QuadraticPotential};
pub use quadratic::{QuadraticPrior, QuadraticPriorConfig};
pub use weights::NeighbourhoodWeights;
