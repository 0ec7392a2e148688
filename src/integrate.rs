//! Contains integration code, including the primary time step.

use lin_alg::f64::Vec3;
use log::trace;

use crate::{
    ACCEL_CONVERSION, ACCEL_CONVERSION_INV, ConstraintInput, EnergyTerm, ForceWithShiftForces,
    MdError, MdState, StepWorkload, error::ConstraintError, error::ForceBufferError,
    tensor::Tensor3,
};

impl MdState {
    /// One leapfrog step of length `cfg.dt`, in picoseconds. This method orchestrates the dynamics
    /// at each time step. Forces are always computed, and constraints always correct velocities;
    /// `step_work` selects whether we also compute the virial, energies and dV/dλ.
    pub fn step(&mut self, step_work: &StepWorkload) -> Result<(), MdError> {
        let step_work = StepWorkload {
            compute_forces: true,
            update_velocities: true,
            ..*step_work
        };
        let dt = self.cfg.dt;

        self.compute_forces(&step_work)?;

        self.update_leapfrog(dt);

        let virial_scaled = self.constrain(&step_work)?;

        if step_work.compute_virial {
            self.constraint_virial = virial_scaled
                .constraint_virial_from_scaled(dt)
                .scaled(ACCEL_CONVERSION_INV);
            self.virial = self.force_virial() + self.constraint_virial;
        }

        if step_work.compute_energy {
            self.accumulate_energies();
        }

        // The constrained positions become the start of the next step.
        std::mem::swap(&mut self.atoms.x, &mut self.atoms.xp);

        self.time += dt;
        self.step_count += 1;

        trace!("Step {} complete. t = {:.4} ps", self.step_count, self.time);

        Ok(())
    }

    /// Compute forces into the thread buffers, then reduce them into `atoms.f`, along with shift
    /// forces and energies as requested. Each output is zeroed only if this step computes it; the
    /// others keep their values from the last step that did.
    pub fn compute_forces(&mut self, step_work: &StepWorkload) -> Result<(), ForceBufferError> {
        self.bonded.calc_forces(
            &self.atoms.x,
            &self.pbc,
            &mut self.force_buffers,
            step_work,
        );

        if step_work.compute_forces {
            self.atoms.f.fill(Vec3::new_zero());
        }
        if step_work.compute_virial {
            self.shift_forces.fill(Vec3::new_zero());
        }
        if step_work.compute_energy {
            self.energy_terms.fill(0.);
            self.group_pair_energies.clear();
        }
        if step_work.compute_dhdl {
            self.dvdl.fill(0.);
        }

        let mut fws = ForceWithShiftForces {
            force: &mut self.atoms.f,
            shift_forces: &mut self.shift_forces,
        };

        self.force_buffers.reduce(
            Some(&mut fws),
            &mut self.energy_terms,
            Some(&mut self.group_pair_energies),
            &mut self.dvdl,
            step_work,
            0,
        )
    }

    /// v(t + dt/2) = v(t - dt/2) + a(t) dt; xp = x + v(t + dt/2) dt. Atoms with inverse mass 0
    /// don't move.
    fn update_leapfrog(&mut self, dt: f64) {
        let atoms = &mut self.atoms;

        for (((xp, x), v), (f, &im)) in atoms
            .xp
            .iter_mut()
            .zip(&atoms.x)
            .zip(&mut atoms.v)
            .zip(atoms.f.iter().zip(&atoms.inv_mass))
        {
            if im == 0. {
                *xp = *x;
                continue;
            }

            *v += *f * (im * ACCEL_CONVERSION * dt);
            *xp = *x + *v * dt;
        }
    }

    /// Apply the constraint solver to the updated positions. Returns the scaled constraint virial.
    fn constrain(&mut self, step_work: &StepWorkload) -> Result<Tensor3, ConstraintError> {
        let Some(solver) = &mut self.constraint_solver else {
            return Ok(Tensor3::zero());
        };

        let output = solver.apply(
            ConstraintInput {
                x: &self.atoms.x,
                xp: &mut self.atoms.xp,
                v: Some(&mut self.atoms.v),
                pbc: &self.pbc,
                dt: self.cfg.dt,
            },
            step_work,
        )?;

        self.constraint_stats = Some(output.stats);

        Ok(output.virial_scaled)
    }

    /// Ξ = -½ Σ x_i ⊗ F_i, plus the shift-force term for periodic images. Uses the forces and
    /// shift forces from the most recent reduction, and the positions they were computed at.
    pub fn force_virial(&self) -> Tensor3 {
        let mut result = Tensor3::zero();

        for (x, f) in self.atoms.x.iter().zip(&self.atoms.f) {
            result += Tensor3::outer(*x, *f);
        }
        for (i, f_shift) in self.shift_forces.iter().enumerate() {
            result += Tensor3::outer(self.pbc.shift_vector(i), *f_shift);
        }

        result.scaled(-0.5)
    }

    /// Kinetic energy uses the half-step velocities. Only meaningful if energy terms are tracked.
    fn accumulate_energies(&mut self) {
        let potential: f64 = EnergyTerm::ALL
            .iter()
            .filter(|t| {
                !matches!(
                    t,
                    EnergyTerm::DvdlConstraint | EnergyTerm::Potential | EnergyTerm::Kinetic
                )
            })
            .map(|t| self.energy_terms[t.index()])
            .sum();

        self.energy_terms[EnergyTerm::Potential.index()] = potential;
        self.energy_terms[EnergyTerm::Kinetic.index()] = self.atoms.kinetic_energy();
    }
}
