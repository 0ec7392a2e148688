//! Holonomic constraints: Rigid distances between pairs of atoms, e.g. bonds to hydrogen. After the
//! integrator moves atoms from `x` to `xp` without regard to constraints, a solver corrects `xp`
//! (and optionally the velocities) so every constrained pair is at its target length again.
//!
//! Two solvers are available:
//!
//! - LINCS: Non-iterative. Solves the coupled constraint equations with a truncated series
//!   expansion of the coupling-matrix inverse, then corrects for bond rotation. A fixed amount of
//!   work per step, and suitable for parallel use. Not suitable for angle constraints, or other
//!   highly-coupled topologies.
//! - SHAKE: Iterates over constraints one at a time until all are within tolerance. Optionally uses
//!   successive over-relaxation (SOR).
//!
//! Both produce a *scaled* virial, `Σ len · λ · n ⊗ n`; see
//! `Tensor3::constraint_virial_from_scaled`.

mod coupling;
mod lincs;
mod shake;
mod topology;

use std::fmt::{self, Display};

#[cfg(feature = "encode")]
use bincode::{Decode, Encode};
use lin_alg::f64::Vec3;

pub use self::{
    coupling::{CoupledConstraintGraph, TaskBlock},
    lincs::Lincs,
    shake::Shake,
    topology::{Constraint, ConstraintTopology},
};
use crate::{
    StepWorkload,
    error::{ConstraintError, ConstraintResult},
    pbc::PbcBox,
    tensor::Tensor3,
};

#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConstraintAlgorithm {
    #[default]
    Lincs,
    Shake,
}

impl Display for ConstraintAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = match self {
            Self::Lincs => "LINCS",
            Self::Shake => "SHAKE",
        };
        write!(f, "{v}")
    }
}

#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Debug, PartialEq)]
pub struct ConstraintConfig {
    pub algorithm: ConstraintAlgorithm,
    /// LINCS: Number of rotation-correction iterations after the first correction.
    pub num_iterations: usize,
    /// LINCS: Number of terms in the matrix expansion. 4 is enough for most bond constraints;
    /// use 8 or more for coupled chains, or with large time steps.
    pub expansion_order: usize,
    /// LINCS: Degrees. We warn when a constraint rotates more than this in one step.
    pub warn_angle: f64,
    /// SHAKE: Relative tolerance on the squared length.
    pub shake_tolerance: f64,
    /// SHAKE: Use successive over-relaxation.
    pub use_sor: bool,
    pub shake_max_iterations: usize,
    /// Slots per task block. Components are never split across blocks.
    pub constraints_per_task: usize,
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            algorithm: Default::default(),
            num_iterations: 1,
            expansion_order: 4,
            warn_angle: 30.,
            shake_tolerance: 1.0e-4,
            use_sor: false,
            shake_max_iterations: 1_000,
            constraints_per_task: 256,
        }
    }
}

impl ConstraintConfig {
    pub fn validate(&self) -> ConstraintResult<()> {
        if self.constraints_per_task == 0 {
            return Err(ConstraintError::InvalidConfig(
                "constraints_per_task must be at least 1".to_owned(),
            ));
        }
        if !(self.warn_angle > 0. && self.warn_angle <= 180.) {
            return Err(ConstraintError::InvalidConfig(format!(
                "warn_angle must be in (0, 180] degrees; got {}",
                self.warn_angle
            )));
        }
        if !(self.shake_tolerance > 0.) {
            return Err(ConstraintError::InvalidConfig(format!(
                "shake_tolerance must be positive; got {}",
                self.shake_tolerance
            )));
        }
        if self.shake_max_iterations == 0 {
            return Err(ConstraintError::InvalidConfig(
                "shake_max_iterations must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// What a solver operates on. `xp` and `v` are updated in place.
pub struct ConstraintInput<'a> {
    /// Positions at the start of the step. Reference directions come from these.
    pub x: &'a [Vec3],
    /// Positions after the unconstrained update.
    pub xp: &'a mut [Vec3],
    /// Velocities, corrected if supplied and `StepWorkload::update_velocities` is set.
    pub v: Option<&'a mut [Vec3]>,
    pub pbc: &'a PbcBox,
    pub dt: f64,
}

impl ConstraintInput<'_> {
    fn check_sizes(&self, num_atoms: usize) -> ConstraintResult<()> {
        let mut sizes = vec![("x", self.x.len()), ("xp", self.xp.len())];
        if let Some(v) = &self.v {
            sizes.push(("v", v.len()));
        }

        for (what, actual) in sizes {
            if actual < num_atoms {
                return Err(ConstraintError::SizeMismatch {
                    what,
                    expected: num_atoms,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// A constraint that rotated more than the warning angle in one step. The result is still applied;
/// this usually means the time step is too large, or the system is blowing up.
#[derive(Clone, Debug, PartialEq)]
pub struct LincsWarning {
    pub constraint: usize,
    pub atom_i: usize,
    pub atom_j: usize,
    /// Degrees.
    pub angle: f64,
    pub len_before: f64,
    pub len_after: f64,
    pub len_target: f64,
}

/// Length deviations after solving, relative to the target lengths.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstraintStats {
    pub num_constraints: usize,
    pub rms_deviation: f64,
    pub max_deviation: f64,
    pub max_deviation_constraint: Option<usize>,
}

impl ConstraintStats {
    pub fn compute(topology: &ConstraintTopology, xp: &[Vec3], pbc: &PbcBox) -> Self {
        let mut sum_sq = 0.;
        let mut max_deviation = 0.;
        let mut max_deviation_constraint = None;

        for (c, con) in topology.constraints().iter().enumerate() {
            let len = topology.length(c);
            let dev = ((pbc.dx(xp[con.atom_i], xp[con.atom_j]).magnitude() - len) / len).abs();

            sum_sq += dev * dev;
            if max_deviation_constraint.is_none() || dev > max_deviation {
                max_deviation = dev;
                max_deviation_constraint = Some(c);
            }
        }

        let num_constraints = topology.len();
        let rms_deviation = if num_constraints > 0 {
            (sum_sq / num_constraints as f64).sqrt()
        } else {
            0.
        };

        Self {
            num_constraints,
            rms_deviation,
            max_deviation,
            max_deviation_constraint,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConstrainOutput {
    /// `Σ len · λ · n ⊗ n`. Zero unless `compute_virial` was requested.
    pub virial_scaled: Tensor3,
    /// LINCS only.
    pub warnings: Vec<LincsWarning>,
    pub stats: ConstraintStats,
    /// SHAKE sweeps over the constraints, or LINCS passes (1 + rotation iterations).
    pub iterations: usize,
}

/// A constraint algorithm, set up for one topology and set of masses.
pub trait ConstraintSolver: Send {
    fn algorithm(&self) -> ConstraintAlgorithm;

    fn topology(&self) -> &ConstraintTopology;

    /// Correct `input.xp` (and velocities, if requested) so all constraints are satisfied.
    fn apply(
        &mut self,
        input: ConstraintInput<'_>,
        step_work: &StepWorkload,
    ) -> ConstraintResult<ConstrainOutput>;
}

/// Builds the solver selected by `config.algorithm`.
pub fn make_constraint_solver(
    topology: ConstraintTopology,
    inv_masses: &[f64],
    config: &ConstraintConfig,
) -> ConstraintResult<Box<dyn ConstraintSolver>> {
    Ok(match config.algorithm {
        ConstraintAlgorithm::Lincs => Box::new(Lincs::new(topology, inv_masses, config)?),
        ConstraintAlgorithm::Shake => Box::new(Shake::new(topology, inv_masses, config)?),
    })
}

/// Copies of the atom data a task block needs, indexed by block-local atom.
struct BlockAtoms {
    x: Vec<Vec3>,
    xp: Vec<Vec3>,
    v: Option<Vec<Vec3>>,
    inv_mass: Vec<f64>,
}

impl BlockAtoms {
    fn gather(
        block: &TaskBlock,
        x: &[Vec3],
        xp: &[Vec3],
        v: Option<&[Vec3]>,
        inv_masses: &[f64],
    ) -> Self {
        Self {
            x: block.atoms.iter().map(|&a| x[a]).collect(),
            xp: block.atoms.iter().map(|&a| xp[a]).collect(),
            v: v.map(|v| block.atoms.iter().map(|&a| v[a]).collect()),
            inv_mass: block.atoms.iter().map(|&a| inv_masses[a]).collect(),
        }
    }

    fn scatter(&self, block: &TaskBlock, xp: &mut [Vec3], v: Option<&mut [Vec3]>) {
        for (local, &a) in block.atoms.iter().enumerate() {
            xp[a] = self.xp[local];
        }
        if let (Some(v), Some(v_local)) = (v, &self.v) {
            for (local, &a) in block.atoms.iter().enumerate() {
                v[a] = v_local[local];
            }
        }
    }
}
