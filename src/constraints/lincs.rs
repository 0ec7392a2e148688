//! LINCS: The LINear Constraint Solver. [Hess et al., 1997](https://doi.org/10.1002/(SICI)1096-987X(199709)18:12<1463::AID-JCC4>3.0.CO;2-H)
//!
//! For each constraint c between atoms i and j, with unit direction n_c from the positions at the
//! start of the step, we solve for the multipliers λ that bring the projection of the new bond
//! vector onto n_c back to the target length:
//!
//! (I - A) S⁻¹ λ = S (n · Δxp - len)
//!
//! `(I - A)⁻¹` is approximated by `I + A + A² + ...`, `expansion_order` terms. This converges if
//! the eigenvalues of A are below 1 in magnitude; fine for bond constraints, but not for angle
//! constraints or rings with low masses.
//!
//! Projecting onto the old direction misses the lengthening from bond rotation, so we follow with
//! `num_iterations` centripetal corrections, each targeting `p = sqrt(2 len² - |Δxp|²)`.
//!
//! Every phase reads all positions it needs before writing any (Jacobi ordering), so the result
//! doesn't depend on constraint order within a block.

use lin_alg::f64::Vec3;
use log::warn;
use rayon::prelude::*;

use super::{
    BlockAtoms, ConstrainOutput, ConstraintAlgorithm, ConstraintConfig, ConstraintInput,
    ConstraintSolver, ConstraintStats, LincsWarning, coupling::CoupledConstraintGraph,
    coupling::TaskBlock, topology::ConstraintTopology,
};
use crate::{StepWorkload, error::ConstraintResult, pbc::PbcBox, tensor::Tensor3};

/// Which optional parts of the solve run this call.
#[derive(Clone, Copy, Debug)]
struct LincsFlags {
    update_velocities: bool,
    compute_virial: bool,
    have_coupled: bool,
}

pub struct Lincs {
    topology: ConstraintTopology,
    graph: CoupledConstraintGraph,
    inv_masses: Vec<f64>,
    num_iterations: usize,
    expansion_order: usize,
    /// cos(warn_angle)
    warn_cos: f64,
}

impl Lincs {
    pub fn new(
        topology: ConstraintTopology,
        inv_masses: &[f64],
        config: &ConstraintConfig,
    ) -> ConstraintResult<Self> {
        config.validate()?;
        let graph =
            CoupledConstraintGraph::new(&topology, inv_masses, config.constraints_per_task)?;

        Ok(Self {
            topology,
            graph,
            inv_masses: inv_masses.to_vec(),
            num_iterations: config.num_iterations,
            expansion_order: config.expansion_order,
            warn_cos: config.warn_angle.to_radians().cos(),
        })
    }

    pub fn graph(&self) -> &CoupledConstraintGraph {
        &self.graph
    }

    fn solve_block(
        &self,
        block: &TaskBlock,
        atoms: &mut BlockAtoms,
        pbc: &PbcBox,
        dt: f64,
        flags: LincsFlags,
    ) -> (Tensor3, Vec<LincsWarning>) {
        let n = block.num_slots();
        let s = &block.inv_sqrt_mass;
        let len = &block.lengths;
        let expand = flags.have_coupled && block.has_coupled();

        // Directions, from the reference positions. Padding slots get a zero direction.
        let dir: Vec<Vec3> = block
            .slots
            .iter()
            .zip(&block.pairs)
            .map(|(slot, &(i, j))| match slot {
                Some(_) => pbc.dx(atoms.x[i], atoms.x[j]).to_normalized(),
                None => Vec3::new_zero(),
            })
            .collect();

        // Coupling matrix, in the same CSR layout as the mass factors.
        let mut a = vec![0.; block.coupled_slots.len()];
        if expand {
            for k in 0..n {
                for e in block.coupling_offsets[k]..block.coupling_offsets[k + 1] {
                    a[e] = block.mass_factors[e] * dir[k].dot(dir[block.coupled_slots[e]]);
                }
            }
        }

        let mut rhs: Vec<f64> = (0..n)
            .map(|k| {
                let (i, j) = block.pairs[k];
                s[k] * (dir[k].dot(pbc.dx(atoms.xp[i], atoms.xp[j])) - len[k])
            })
            .collect();
        let mut sol = rhs.clone();
        let mut mvb = vec![0.; n];

        if expand {
            self.expand(block, &a, &mut rhs, &mut sol, &mut mvb);
        }

        let mut lambda: Vec<f64> = (0..n).map(|k| s[k] * sol[k]).collect();
        update_positions(block, &dir, &atoms.inv_mass, &lambda, &mut atoms.xp);

        // Correct for rotational lengthening.
        for _ in 0..self.num_iterations {
            for k in 0..n {
                let (i, j) = block.pairs[k];
                let dx = pbc.dx(atoms.xp[i], atoms.xp[j]);
                let dlen2 = 2. * len[k] * len[k] - dx.magnitude_squared();

                rhs[k] = if dlen2 > 0. {
                    s[k] * (len[k] - dlen2.sqrt())
                } else {
                    s[k] * len[k]
                };
            }
            sol.copy_from_slice(&rhs);

            if expand {
                self.expand(block, &a, &mut rhs, &mut sol, &mut mvb);
            }

            for k in 0..n {
                mvb[k] = s[k] * sol[k];
                lambda[k] += mvb[k];
            }
            update_positions(block, &dir, &atoms.inv_mass, &mvb, &mut atoms.xp);
        }

        if flags.update_velocities {
            if let Some(v) = &mut atoms.v {
                let inv_dt = 1. / dt;
                for (k, &(i, j)) in block.pairs.iter().enumerate() {
                    let tmp = dir[k] * (lambda[k] * inv_dt);
                    v[i] -= tmp * atoms.inv_mass[i];
                    v[j] += tmp * atoms.inv_mass[j];
                }
            }
        }

        let mut virial = Tensor3::zero();
        if flags.compute_virial {
            for k in 0..n {
                if block.slots[k].is_some() {
                    virial += Tensor3::outer(dir[k], dir[k]).scaled(len[k] * lambda[k]);
                }
            }
        }

        let mut warnings = Vec::new();
        for (k, slot) in block.slots.iter().enumerate() {
            let Some(c) = *slot else { continue };
            let (i, j) = block.pairs[k];

            let r_0 = pbc.dx(atoms.x[i], atoms.x[j]);
            let r_1 = pbc.dx(atoms.xp[i], atoms.xp[j]);
            let len_0 = r_0.magnitude();
            let len_1 = r_1.magnitude();
            let cos = r_0.dot(r_1) / (len_0 * len_1);

            if cos < self.warn_cos {
                warnings.push(LincsWarning {
                    constraint: c,
                    atom_i: block.atoms[i],
                    atom_j: block.atoms[j],
                    angle: cos.clamp(-1., 1.).acos().to_degrees(),
                    len_before: len_0,
                    len_after: len_1,
                    len_target: len[k],
                });
            }
        }

        (virial, warnings)
    }

    /// sol += A·rhs + A²·rhs + ..., in place. `rhs` and `scratch` are clobbered.
    fn expand(
        &self,
        block: &TaskBlock,
        a: &[f64],
        rhs: &mut Vec<f64>,
        sol: &mut [f64],
        scratch: &mut Vec<f64>,
    ) {
        for _ in 0..self.expansion_order {
            for k in 0..block.num_slots() {
                let mut mv = 0.;
                for e in block.coupling_offsets[k]..block.coupling_offsets[k + 1] {
                    mv += a[e] * rhs[block.coupled_slots[e]];
                }
                scratch[k] = mv;
                sol[k] += mv;
            }
            std::mem::swap(rhs, scratch);
        }
    }
}

/// xp_i -= invm_i · mvb · n, xp_j += invm_j · mvb · n
fn update_positions(
    block: &TaskBlock,
    dir: &[Vec3],
    inv_mass: &[f64],
    mvb: &[f64],
    xp: &mut [Vec3],
) {
    for (k, &(i, j)) in block.pairs.iter().enumerate() {
        let tmp = dir[k] * mvb[k];
        xp[i] -= tmp * inv_mass[i];
        xp[j] += tmp * inv_mass[j];
    }
}

impl ConstraintSolver for Lincs {
    fn algorithm(&self) -> ConstraintAlgorithm {
        ConstraintAlgorithm::Lincs
    }

    fn topology(&self) -> &ConstraintTopology {
        &self.topology
    }

    fn apply(
        &mut self,
        input: ConstraintInput<'_>,
        step_work: &StepWorkload,
    ) -> ConstraintResult<ConstrainOutput> {
        input.check_sizes(self.topology.num_atoms())?;

        let ConstraintInput {
            x,
            xp,
            mut v,
            pbc,
            dt,
        } = input;

        let flags = LincsFlags {
            update_velocities: step_work.update_velocities && v.is_some(),
            compute_virial: step_work.compute_virial,
            have_coupled: self.graph.has_coupled(),
        };

        let results: Vec<_> = {
            let xp_read: &[Vec3] = xp;
            let v_read = if flags.update_velocities {
                v.as_deref()
            } else {
                None
            };

            self.graph
                .blocks()
                .par_iter()
                .map(|block| {
                    let mut atoms =
                        BlockAtoms::gather(block, x, xp_read, v_read, &self.inv_masses);
                    let (virial, warnings) = self.solve_block(block, &mut atoms, pbc, dt, flags);
                    (atoms, virial, warnings)
                })
                .collect()
        };

        let mut output = ConstrainOutput::default();

        // Block order, so the virial sum is reproducible.
        for (block, (atoms, virial, warnings)) in self.graph.blocks().iter().zip(results) {
            atoms.scatter(block, xp, v.as_deref_mut());
            output.virial_scaled += virial;
            output.warnings.extend(warnings);
        }

        output.warnings.sort_by_key(|w| w.constraint);
        for w in &output.warnings {
            warn!(
                "LINCS: constraint {} (atoms {}-{}) rotated {:.1}° in one step; length {:.5} -> {:.5}, target {:.5}",
                w.constraint, w.atom_i, w.atom_j, w.angle, w.len_before, w.len_after, w.len_target
            );
        }

        output.stats = ConstraintStats::compute(&self.topology, xp, pbc);
        output.iterations = 1 + self.num_iterations;

        Ok(output)
    }
}
