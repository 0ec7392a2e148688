#![allow(non_snake_case)]
#![allow(confusable_idents)]

//! The per-step core of a molecular dynamics engine: Thread-parallel force accumulation and
//! reduction, and holonomic constraints (LINCS and SHAKE). The textual information here is
//! informal, and aimed at code maintenance as much as library use.
//!
//! Each time step runs: forces -> reduce -> update -> constrain -> virial.
//!
//! - Forces: Each worker thread computes its share of interactions into its own
//!   `ThreadForceBuffer`. No locks or atomics; buffers are private during this phase.
//! - Reduce: `ThreadedForceBuffer::reduce` sums the thread buffers into one force array, one block
//!   of 32 atoms at a time, visiting only the threads that wrote to each block. Summation order
//!   is fixed (ascending thread index), so results are reproducible for a given thread count.
//! - Update: Leapfrog. v(t + dt/2) = v(t - dt/2) + a(t) dt; x(t + dt) = x(t) + v(t + dt/2) dt.
//! - Constrain: The solver moves the updated positions so constrained pairs are at their
//!   target lengths, and corrects velocities to match.
//! - Virial: From forces (with shift forces, for periodic systems), plus the constraint virial.
//!
//! [LINCS paper](https://doi.org/10.1002/(SICI)1096-987X(199709)18:12<1463::AID-JCC4>3.0.CO;2-H)
//! [P-LINCS paper](https://doi.org/10.1021/ct700200b)
//!
//! Base units: Å, ps (10^-12), Dalton (AMU), kcal/mol for energy. Forces are in kcal/mol/Å; we
//! convert to Å/ps² when dividing by mass.
//!
//! The constraint solvers themselves are unit-agnostic: they only see positions, inverse masses and
//! the time step.
//!
//! On f32 vs f64: We use f64 throughout. Constraint corrections are small differences between
//! nearly-equal lengths, and the reduction-determinism guarantees are easier to reason about with a
//! single precision.

mod bitmask;
pub mod bonded;
pub mod constraints;
pub mod energy;
pub mod error;
pub mod force_buffer;
pub mod integrate;
pub mod pbc;
pub mod tensor;


#[cfg(feature = "encode")]
use bincode::{Decode, Encode};
use lin_alg::f64::Vec3;
use log::debug;

pub use crate::{
    bitmask::{MAX_THREADS, ThreadMask},
    bonded::{BondedInteractions, BondedThreading, HarmonicAngle, HarmonicBond},
    constraints::{
        ConstrainOutput, ConstraintAlgorithm, ConstraintConfig, ConstraintInput, ConstraintSolver,
        ConstraintStats, ConstraintTopology, Lincs, LincsWarning, Shake, make_constraint_solver,
    },
    energy::{EnergyTerm, FepComponent, GroupPairEnergies, GroupPairTerm},
    error::{ConstraintError, ForceBufferError, MdError},
    force_buffer::{ForceWithShiftForces, ThreadForceBuffer, ThreadedForceBuffer},
    pbc::PbcBox,
    tensor::Tensor3,
};

// Multiply by this to convert from kcal/mol/Å per amu to Å/ps². Converts *into* our internal units.
pub const ACCEL_CONVERSION: f64 = 418.4;

// Multiply by this to convert from amu • (Å/ps)² to kcal/mol. We use this when accumulating kinetic
// energy.
pub const ACCEL_CONVERSION_INV: f64 = 1. / ACCEL_CONVERSION;

/// What a step (or a part of one) should compute, beyond the minimum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepWorkload {
    pub compute_forces: bool,
    pub compute_virial: bool,
    pub compute_energy: bool,
    /// dV/dλ, for free-energy calculations.
    pub compute_dhdl: bool,
    /// Let the constraint solver correct velocities.
    pub update_velocities: bool,
}

impl StepWorkload {
    /// Forces, virial and energies, with velocity correction.
    pub fn full() -> Self {
        Self {
            compute_forces: true,
            compute_virial: true,
            compute_energy: true,
            compute_dhdl: false,
            update_velocities: true,
        }
    }
}

/// Per-atom state, as flat arrays. Masses are stored as inverses; 0 means the atom doesn't move.
#[derive(Clone, Debug, Default)]
pub struct AtomState {
    pub inv_mass: Vec<f64>,
    /// Positions at the start of the step.
    pub x: Vec<Vec3>,
    /// Positions after the update. Scratch between steps.
    pub xp: Vec<Vec3>,
    /// Velocities, at the half step in leapfrog.
    pub v: Vec<Vec3>,
    /// Total force on each atom, from the most recent reduction.
    pub f: Vec<Vec3>,
}

impl AtomState {
    /// Masses in Daltons. A mass of 0 is treated as infinite (a fixed atom).
    pub fn new(masses: &[f64], x: Vec<Vec3>, v: Vec<Vec3>) -> Result<Self, MdError> {
        if x.len() != masses.len() || v.len() != masses.len() {
            return Err(MdError::Setup(format!(
                "Atom array length mismatch: {} masses, {} positions, {} velocities",
                masses.len(),
                x.len(),
                v.len()
            )));
        }

        let inv_mass = masses
            .iter()
            .map(|&m| if m > 0. { 1. / m } else { 0. })
            .collect();

        Ok(Self {
            inv_mass,
            xp: x.clone(),
            f: vec![Vec3::new_zero(); x.len()],
            x,
            v,
        })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Mass-weighted center of the positions at the start of the step.
    pub fn center_of_mass(&self) -> Vec3 {
        weighted_mean(&self.x, &self.inv_mass)
    }

    /// Total linear momentum, amu Å/ps. Fixed atoms don't contribute.
    pub fn momentum(&self) -> Vec3 {
        let mut result = Vec3::new_zero();
        for (v, &im) in self.v.iter().zip(&self.inv_mass) {
            if im > 0. {
                result += *v / im;
            }
        }
        result
    }

    /// Kinetic energy, in kcal/mol.
    pub fn kinetic_energy(&self) -> f64 {
        let mut result = 0.;
        for (v, &im) in self.v.iter().zip(&self.inv_mass) {
            if im > 0. {
                result += 0.5 * v.magnitude_squared() / im;
            }
        }
        result * ACCEL_CONVERSION_INV
    }
}

fn weighted_mean(vals: &[Vec3], inv_mass: &[f64]) -> Vec3 {
    let mut sum = Vec3::new_zero();
    let mut mass_sum = 0.;

    for (val, &im) in vals.iter().zip(inv_mass) {
        if im > 0. {
            sum += *val / im;
            mass_sum += 1. / im;
        }
    }

    if mass_sum > 0. {
        sum / mass_sum
    } else {
        Vec3::new_zero()
    }
}

#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Debug, Clone, PartialEq)]
pub struct MdConfig {
    /// Picoseconds. 0.001 or 0.002 (1 or 2 fs) are typical; constraining bonds to hydrogen allows
    /// the larger value.
    pub dt: f64,
    /// Worker threads for force computation and reduction. 0 uses rayon's pool size.
    pub num_threads: usize,
    pub constraints: ConstraintConfig,
    /// Accumulate per-interaction energy terms in each thread buffer.
    pub use_energy_terms: bool,
    /// Non-bonded energy groups, for group-pair energies. 0 disables them.
    pub num_energy_groups: usize,
}

impl Default for MdConfig {
    fn default() -> Self {
        Self {
            dt: 0.002,
            num_threads: 0,
            constraints: Default::default(),
            use_energy_terms: true,
            num_energy_groups: 0,
        }
    }
}

impl MdConfig {
    /// The thread count to use, after resolving 0 to the pool size. Capped at the mask width.
    pub fn resolved_num_threads(&self) -> usize {
        let n = if self.num_threads == 0 {
            rayon::current_num_threads()
        } else {
            self.num_threads
        };
        n.clamp(1, MAX_THREADS)
    }
}

/// Owns the atom state, and everything needed to advance it one step at a time.
pub struct MdState {
    pub cfg: MdConfig,
    pub atoms: AtomState,
    pub pbc: PbcBox,
    bonded: BondedThreading,
    force_buffers: ThreadedForceBuffer,
    constraint_solver: Option<Box<dyn ConstraintSolver>>,
    /// Current simulation time, in picoseconds.
    pub time: f64,
    pub step_count: usize, // increments.
    /// From the most recent step that computed them. Indexed by `EnergyTerm`.
    pub energy_terms: Vec<f64>,
    pub group_pair_energies: GroupPairEnergies,
    pub dvdl: Vec<f64>,
    pub shift_forces: Vec<Vec3>,
    /// Total virial from the most recent step with `compute_virial`: forces plus constraints.
    pub virial: Tensor3,
    pub constraint_virial: Tensor3,
    /// From the most recent constraint call.
    pub constraint_stats: Option<ConstraintStats>,
}

impl MdState {
    pub fn new(
        cfg: MdConfig,
        atoms: AtomState,
        pbc: PbcBox,
        bonded: BondedInteractions,
        constraints: ConstraintTopology,
    ) -> Result<Self, MdError> {
        let num_atoms = atoms.len();

        if atoms.inv_mass.len() != num_atoms
            || atoms.xp.len() != num_atoms
            || atoms.v.len() != num_atoms
            || atoms.f.len() != num_atoms
        {
            return Err(MdError::Setup(
                "Atom state arrays must all have the same length".to_owned(),
            ));
        }
        if !(cfg.dt > 0.) {
            return Err(MdError::Setup(format!("dt must be positive; got {}", cfg.dt)));
        }
        if !constraints.is_empty() && constraints.num_atoms() != num_atoms {
            return Err(MdError::Setup(format!(
                "Constraint topology is for {} atoms; the system has {num_atoms}",
                constraints.num_atoms()
            )));
        }
        for b in &bonded.bonds {
            if b.atoms.0 >= num_atoms || b.atoms.1 >= num_atoms {
                return Err(MdError::Setup(format!("Bond {:?} out of range", b.atoms)));
            }
        }
        for a in &bonded.angles {
            if a.atoms.0 >= num_atoms || a.atoms.1 >= num_atoms || a.atoms.2 >= num_atoms {
                return Err(MdError::Setup(format!("Angle {:?} out of range", a.atoms)));
            }
        }

        let num_threads = cfg.resolved_num_threads();

        let mut force_buffers =
            ThreadedForceBuffer::new(num_threads, cfg.use_energy_terms, cfg.num_energy_groups)?;

        let bonded = BondedThreading::new(bonded);
        bonded.setup_masks(num_atoms, &mut force_buffers)?;

        let constraint_solver = if constraints.is_empty() {
            None
        } else {
            Some(make_constraint_solver(
                constraints,
                &atoms.inv_mass,
                &cfg.constraints,
            )?)
        };

        debug!(
            "MD state: {num_atoms} atoms, {} threads, constraints: {}",
            num_threads,
            match &constraint_solver {
                Some(s) => format!("{} ({})", s.topology().len(), s.algorithm()),
                None => "none".to_owned(),
            }
        );

        Ok(Self {
            group_pair_energies: GroupPairEnergies::new(cfg.num_energy_groups),
            cfg,
            atoms,
            pbc,
            bonded,
            force_buffers,
            constraint_solver,
            time: 0.,
            step_count: 0,
            energy_terms: vec![0.; EnergyTerm::COUNT],
            dvdl: vec![0.; FepComponent::COUNT],
            shift_forces: vec![Vec3::new_zero(); pbc::NUM_SHIFT_VECTORS],
            virial: Tensor3::zero(),
            constraint_virial: Tensor3::zero(),
            constraint_stats: None,
        })
    }

    pub fn force_buffers(&self) -> &ThreadedForceBuffer {
        &self.force_buffers
    }

    pub fn constraint_solver(&self) -> Option<&dyn ConstraintSolver> {
        self.constraint_solver.as_deref()
    }
}
