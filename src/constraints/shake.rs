//! SHAKE: Iteratively moves each constrained pair along its reference bond vector until its squared
//! length is within tolerance of the target. [Ryckaert et al., 1977](https://doi.org/10.1016/0021-9991(77)90098-5)
//!
//! Within a task block we sweep the constraints in order, each correction using the positions left
//! by the previous one (Gauss-Seidel). Blocks share no atoms, so they run in parallel.
//!
//! Optionally uses successive over-relaxation: Each correction is scaled by ω. ω is tuned across
//! calls: we keep stepping it by δ while the iteration count drops, and reverse and halve δ when it
//! rises.

use lin_alg::f64::Vec3;
use log::{debug, warn};
use rayon::prelude::*;

use super::{
    BlockAtoms, ConstrainOutput, ConstraintAlgorithm, ConstraintConfig, ConstraintInput,
    ConstraintSolver, ConstraintStats, coupling::CoupledConstraintGraph, coupling::TaskBlock,
    topology::ConstraintTopology,
};
use crate::{
    StepWorkload,
    error::{ConstraintError, ConstraintResult},
    pbc::PbcBox,
    tensor::Tensor3,
};

/// If the old and new bond vectors are this close to perpendicular (relative to len²), the
/// correction is ill-defined.
const ROTATION_TOL: f64 = 1.0e-10;

#[derive(Clone, Copy, Debug, PartialEq)]
struct SorState {
    omega: f64,
    delta: f64,
    /// Iteration count from the previous call.
    gamma: f64,
}

impl Default for SorState {
    fn default() -> Self {
        Self {
            omega: 1.,
            delta: 0.1,
            gamma: 1.0e6,
        }
    }
}

struct BlockSolution {
    atoms: BlockAtoms,
    sweeps: usize,
    virial: Tensor3,
}

pub struct Shake {
    topology: ConstraintTopology,
    graph: CoupledConstraintGraph,
    inv_masses: Vec<f64>,
    tolerance: f64,
    max_iterations: usize,
    use_sor: bool,
    sor: SorState,
}

impl Shake {
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
            tolerance: config.shake_tolerance,
            max_iterations: config.shake_max_iterations,
            use_sor: config.use_sor,
            sor: Default::default(),
        })
    }

    /// The current over-relaxation factor. Always 1 without SOR.
    pub fn omega(&self) -> f64 {
        if self.use_sor { self.sor.omega } else { 1. }
    }

    fn solve_block(
        &self,
        block: &TaskBlock,
        mut atoms: BlockAtoms,
        pbc: &PbcBox,
        dt: f64,
        omega: f64,
        step_work: &StepWorkload,
    ) -> ConstraintResult<BlockSolution> {
        let n = block.num_slots();

        // Reference bond vectors.
        let r: Vec<Vec3> = block
            .slots
            .iter()
            .zip(&block.pairs)
            .map(|(slot, &(i, j))| match slot {
                Some(_) => pbc.dx(atoms.x[i], atoms.x[j]),
                None => Vec3::new_zero(),
            })
            .collect();

        let half_reduced_mass: Vec<f64> = block
            .pairs
            .iter()
            .map(|&(i, j)| 0.5 / (atoms.inv_mass[i] + atoms.inv_mass[j]))
            .collect();

        let mut lagrange = vec![0.; n];
        let mut sweeps = 0;
        let mut converged = false;

        while sweeps < self.max_iterations && !converged {
            let mut num_corrected = 0;

            for k in 0..n {
                let Some(c) = block.slots[k] else { continue };
                let (i, j) = block.pairs[k];

                let len_sq = block.lengths[k] * block.lengths[k];
                let rp = pbc.dx(atoms.xp[i], atoms.xp[j]);
                let diff = len_sq - rp.magnitude_squared();

                if diff.abs() / (2. * len_sq * self.tolerance) <= 1. {
                    continue;
                }

                let rrpr = r[k].dot(rp);
                if rrpr < len_sq * ROTATION_TOL {
                    return Err(ConstraintError::ShakeRotationTooLarge {
                        constraint: c,
                        atom_i: block.atoms[i],
                        atom_j: block.atoms[j],
                    });
                }

                let acor = omega * diff * half_reduced_mass[k] / rrpr;
                lagrange[k] += acor;

                atoms.xp[i] += r[k] * (acor * atoms.inv_mass[i]);
                atoms.xp[j] -= r[k] * (acor * atoms.inv_mass[j]);

                num_corrected += 1;
            }

            sweeps += 1;
            converged = num_corrected == 0;
        }

        if !converged {
            return Err(ConstraintError::ShakeNotConverged {
                iterations: self.max_iterations,
            });
        }

        if step_work.update_velocities {
            if let Some(v) = &mut atoms.v {
                let inv_dt = 1. / dt;
                for (k, &(i, j)) in block.pairs.iter().enumerate() {
                    let tmp = r[k] * (lagrange[k] * inv_dt);
                    v[i] += tmp * atoms.inv_mass[i];
                    v[j] -= tmp * atoms.inv_mass[j];
                }
            }
        }

        let mut virial = Tensor3::zero();
        if step_work.compute_virial {
            for k in 0..n {
                if block.slots[k].is_some() {
                    virial += Tensor3::outer(r[k], r[k]).scaled(-lagrange[k]);
                }
            }
        }

        Ok(BlockSolution {
            atoms,
            sweeps,
            virial,
        })
    }

    fn update_sor(&mut self, constraint_iterations: usize) {
        let it = constraint_iterations as f64;
        let sor = &mut self.sor;

        if it > sor.gamma {
            sor.delta *= -0.5;
        }
        sor.omega += sor.delta;
        sor.gamma = it;

        debug!("SHAKE SOR: ω = {:.4}, δ = {:.4}", sor.omega, sor.delta);

        if sor.omega <= 0. || sor.omega >= 2. {
            warn!(
                "SHAKE SOR: ω = {:.3} is outside (0, 2); SHAKE will likely fail to converge",
                sor.omega
            );
        }
    }
}

impl ConstraintSolver for Shake {
    fn algorithm(&self) -> ConstraintAlgorithm {
        ConstraintAlgorithm::Shake
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

        let omega = self.omega();

        let solutions: Vec<BlockSolution> = {
            let xp_read: &[Vec3] = xp;
            let v_read = if step_work.update_velocities {
                v.as_deref()
            } else {
                None
            };

            let results: Vec<_> = self
                .graph
                .blocks()
                .par_iter()
                .map(|block| {
                    let atoms = BlockAtoms::gather(block, x, xp_read, v_read, &self.inv_masses);
                    self.solve_block(block, atoms, pbc, dt, omega, step_work)
                })
                .collect();

            // Nothing is written back if any block failed.
            results.into_iter().collect::<ConstraintResult<_>>()?
        };

        let mut output = ConstrainOutput::default();
        let mut constraint_iterations = 0;

        for (block, sol) in self.graph.blocks().iter().zip(solutions) {
            sol.atoms.scatter(block, xp, v.as_deref_mut());
            output.virial_scaled += sol.virial;
            output.iterations = output.iterations.max(sol.sweeps);
            constraint_iterations += sol.sweeps * block.num_constraints();
        }

        if self.use_sor {
            self.update_sor(constraint_iterations);
        }

        output.stats = ConstraintStats::compute(&self.topology, xp, pbc);

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sor_steps_and_reverses() {
        let top = ConstraintTopology::from_triples(&[0, 0, 1], vec![0.1], 2).unwrap();
        let config = ConstraintConfig {
            use_sor: true,
            ..Default::default()
        };
        let mut shake = Shake::new(top, &[1., 1.], &config).unwrap();
        assert_eq!(shake.omega(), 1.);

        shake.update_sor(10);
        assert!((shake.omega() - 1.1).abs() < 1e-12);

        shake.update_sor(8);
        assert!((shake.omega() - 1.2).abs() < 1e-12);

        // More iterations than last time: reverse, at half the step.
        shake.update_sor(9);
        assert!((shake.omega() - 1.15).abs() < 1e-12);
        assert_eq!(shake.sor.delta, -0.05);
    }

    #[test]
    fn no_sor_keeps_omega_at_one() {
        let top = ConstraintTopology::from_triples(&[0, 0, 1], vec![0.1], 2).unwrap();
        let shake = Shake::new(top, &[1., 1.], &ConstraintConfig::default()).unwrap();
        assert_eq!(shake.omega(), 1.);
    }
}
