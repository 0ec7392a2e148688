//! Bonded forces: Harmonic bond stretching and valence-angle bending. These are spring-like
//! terms that hold covalent geometry; bonds we treat as rigid go in the constraint topology
//! instead.
//!
//! Interactions are split into contiguous, equal-count ranges per thread. Each thread writes only
//! to its own `ThreadForceBuffer`, and marks the atoms it writes in that buffer's reduction mask.
//! If the interaction lists are ordered along the molecule, each thread touches a compact set of
//! atoms, and most reduction blocks have a single contributor.
//!
//! Units: Å, kcal/mol, radians.

use std::ops::Range;

use lin_alg::f64::Vec3;
use rayon::prelude::*;

use crate::{
    StepWorkload,
    energy::EnergyTerm,
    error::ForceBufferError,
    force_buffer::{ThreadForceBuffer, ThreadedForceBuffer},
    pbc::{CENTRAL_SHIFT_INDEX, PbcBox},
};

const EPS: f64 = 1e-12;

/// U = k (r - r_0)²
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HarmonicBond {
    pub atoms: (usize, usize),
    /// Å
    pub r_0: f64,
    /// kcal/mol/Å²
    pub k: f64,
}

/// U = k (θ - θ_0)², with atom 1 at the vertex.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HarmonicAngle {
    pub atoms: (usize, usize, usize),
    /// Radians
    pub theta_0: f64,
    /// kcal/mol/rad²
    pub k: f64,
}

#[derive(Clone, Debug, Default)]
pub struct BondedInteractions {
    pub bonds: Vec<HarmonicBond>,
    pub angles: Vec<HarmonicAngle>,
}

impl BondedInteractions {
    pub fn is_empty(&self) -> bool {
        self.bonds.is_empty() && self.angles.is_empty()
    }
}

/// Returns the force on the atom at position 0; negate it for atom 1. `diff` is
/// `posit_0 - posit_1`. Also returns potential energy.
pub fn f_bond_stretching(diff: Vec3, bond: &HarmonicBond) -> (Vec3, f64) {
    let r_meas = diff.magnitude();
    let r_delta = r_meas - bond.r_0;

    // Shared between force and energy.
    let term_1 = bond.k * r_delta;

    let f_mag = -2. * term_1 / r_meas.max(EPS);
    let energy = term_1 * r_delta;

    (diff * f_mag, energy)
}

/// Valence angle; angle between 3 atoms. `bond_vec_01` is `posit_0 - posit_1`, and `bond_vec_21`
/// is `posit_2 - posit_1`. Returns the force on each atom, and potential energy.
pub fn f_angle_bending(
    bond_vec_01: Vec3,
    bond_vec_21: Vec3,
    angle: &HarmonicAngle,
) -> ((Vec3, Vec3, Vec3), f64) {
    let b_vec_01_sq = bond_vec_01.magnitude_squared();
    let b_vec_21_sq = bond_vec_21.magnitude_squared();

    // Quit early if atoms are on top of each other
    if b_vec_01_sq < EPS || b_vec_21_sq < EPS {
        return ((Vec3::new_zero(), Vec3::new_zero(), Vec3::new_zero()), 0.);
    }

    let b_vec_01_len = b_vec_01_sq.sqrt();
    let b_vec_21_len = b_vec_21_sq.sqrt();

    let cos_θ = (bond_vec_01.dot(bond_vec_21) / (b_vec_01_len * b_vec_21_len)).clamp(-1., 1.);
    let θ = cos_θ.acos();

    let Δθ = θ - angle.theta_0;
    let dV_dθ = 2. * angle.k * Δθ;

    let c = bond_vec_01.cross(bond_vec_21);
    let c_len = c.magnitude();
    // Collinear; the bending direction is undefined.
    if c_len < EPS {
        return ((Vec3::new_zero(), Vec3::new_zero(), Vec3::new_zero()), angle.k * Δθ * Δθ);
    }

    // ∂θ/∂r for the outer atoms. Each has magnitude 1/|bond|, in the plane of the angle, and
    // points away from the other bond.
    let dθ_dr0 = bond_vec_01.cross(c) / (b_vec_01_sq * c_len);
    let dθ_dr2 = c.cross(bond_vec_21) / (b_vec_21_sq * c_len);

    let f_0 = dθ_dr0 * -dV_dθ;
    let f_2 = dθ_dr2 * -dV_dθ;
    let f_1 = -(f_0 + f_2);

    ((f_0, f_1, f_2), angle.k * Δθ * Δθ)
}

/// The contiguous share of `num_items` for thread `t`.
fn thread_range(num_items: usize, num_threads: usize, t: usize) -> Range<usize> {
    num_items * t / num_threads..num_items * (t + 1) / num_threads
}

/// Computes bonded interactions into per-thread force buffers.
#[derive(Clone, Debug, Default)]
pub struct BondedThreading {
    interactions: BondedInteractions,
}

impl BondedThreading {
    pub fn new(interactions: BondedInteractions) -> Self {
        Self { interactions }
    }

    pub fn interactions(&self) -> &BondedInteractions {
        &self.interactions
    }

    /// Rebuild each thread's reduction mask from the atoms its interactions touch, then merge them.
    /// Run once per decomposition, before `calc_forces`.
    pub fn setup_masks(
        &self,
        num_atoms: usize,
        buffers: &mut ThreadedForceBuffer,
    ) -> Result<(), ForceBufferError> {
        let num_threads = buffers.num_thread_buffers();
        let inter = &self.interactions;

        buffers.par_thread_force_buffers_mut().for_each(|buf| {
            let t = buf.thread_index();
            buf.resize_buffer_and_clear_mask(num_atoms);

            for bond in &inter.bonds[thread_range(inter.bonds.len(), num_threads, t)] {
                buf.add_atom_to_mask(bond.atoms.0);
                buf.add_atom_to_mask(bond.atoms.1);
            }
            for angle in &inter.angles[thread_range(inter.angles.len(), num_threads, t)] {
                buf.add_atom_to_mask(angle.atoms.0);
                buf.add_atom_to_mask(angle.atoms.1);
                buf.add_atom_to_mask(angle.atoms.2);
            }

            buf.process_mask();
        });

        buffers.setup_reduction()
    }

    /// Clears each thread's buffers, then accumulates that thread's share of the interactions.
    /// Shift forces are accumulated if `step_work.compute_virial`; energies if `compute_energy`.
    pub fn calc_forces(
        &self,
        posits: &[Vec3],
        pbc: &PbcBox,
        buffers: &mut ThreadedForceBuffer,
        step_work: &StepWorkload,
    ) {
        let num_threads = buffers.num_thread_buffers();

        buffers.par_thread_force_buffers_mut().for_each(|buf| {
            buf.clear_forces_and_energies();
            let t = buf.thread_index();

            let bonds = thread_range(self.interactions.bonds.len(), num_threads, t);
            for bond in &self.interactions.bonds[bonds] {
                apply_bond(buf, bond, posits, pbc, step_work);
            }

            let angles = thread_range(self.interactions.angles.len(), num_threads, t);
            for angle in &self.interactions.angles[angles] {
                apply_angle(buf, angle, posits, pbc, step_work);
            }
        });
    }
}

fn apply_bond(
    buf: &mut ThreadForceBuffer,
    bond: &HarmonicBond,
    posits: &[Vec3],
    pbc: &PbcBox,
    step_work: &StepWorkload,
) {
    let (i, j) = bond.atoms;
    let (diff, shift) = pbc.dx_with_shift(posits[i], posits[j]);

    let (f, energy) = f_bond_stretching(diff, bond);

    let forces = buf.force_buffer_mut();
    forces[i] += f;
    forces[j] -= f;

    if step_work.compute_virial {
        let f_shift = buf.shift_forces_mut();
        f_shift[shift] += f;
        f_shift[CENTRAL_SHIFT_INDEX] -= f;
    }

    if step_work.compute_energy {
        buf.add_energy(EnergyTerm::BondStretching, energy);
    }
}

fn apply_angle(
    buf: &mut ThreadForceBuffer,
    angle: &HarmonicAngle,
    posits: &[Vec3],
    pbc: &PbcBox,
    step_work: &StepWorkload,
) {
    let (i, j, k) = angle.atoms;
    let (bond_vec_01, shift_0) = pbc.dx_with_shift(posits[i], posits[j]);
    let (bond_vec_21, shift_2) = pbc.dx_with_shift(posits[k], posits[j]);

    let ((f_0, f_1, f_2), energy) = f_angle_bending(bond_vec_01, bond_vec_21, angle);

    let forces = buf.force_buffer_mut();
    forces[i] += f_0;
    forces[j] += f_1;
    forces[k] += f_2;

    if step_work.compute_virial {
        let f_shift = buf.shift_forces_mut();
        f_shift[shift_0] += f_0;
        f_shift[CENTRAL_SHIFT_INDEX] += f_1;
        f_shift[shift_2] += f_2;
    }

    if step_work.compute_energy {
        buf.add_energy(EnergyTerm::AngleBending, energy);
    }
}
