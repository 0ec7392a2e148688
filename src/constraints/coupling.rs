//! Which constraints are coupled (share an atom), and how we split them into independent blocks
//! of work.
//!
//! Coupled constraints can't be solved independently: Moving the shared atom to satisfy one
//! changes the length of the other. LINCS handles this with a truncated expansion of the coupling
//! matrix `(I - A)⁻¹`, with `A[c, c'] = mass_factor[c, c'] · (n_c · n_c')`. The mass factors only
//! depend on masses and topology, so we compute them once here; the direction dot products are
//! recomputed each step.
//!
//! Constraints connected through shared atoms form a component. We pack whole components into
//! task blocks of `constraints_per_task` slots, padding the remainder with inert dummy
//! constraints. Blocks never share an atom, so they can be solved in parallel without
//! synchronization.

use std::collections::HashMap;

use log::debug;

use super::topology::ConstraintTopology;
use crate::error::{ConstraintError, ConstraintResult};

/// A set of whole coupling components, with everything a solver needs to work on it in
/// isolation. Atom indices here are block-local; `atoms` maps them back to the system.
#[derive(Clone, Debug)]
pub struct TaskBlock {
    /// System constraint index for each slot. `None` for padding.
    pub slots: Vec<Option<usize>>,
    /// System atom index of each block-local atom, ascending.
    pub atoms: Vec<usize>,
    /// Block-local atoms per slot. Padding slots point both ends at local atom 0.
    pub pairs: Vec<(usize, usize)>,
    /// Target length per slot; 0 for padding.
    pub lengths: Vec<f64>,
    /// `1/sqrt(invm_i + invm_j)` per slot; 0 for padding.
    pub inv_sqrt_mass: Vec<f64>,
    /// CSR over slots: the coupled slots of slot `k` are at
    /// `coupling_offsets[k]..coupling_offsets[k + 1]`.
    pub coupling_offsets: Vec<usize>,
    pub coupled_slots: Vec<usize>,
    pub mass_factors: Vec<f64>,
}

impl TaskBlock {
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn has_coupled(&self) -> bool {
        !self.coupled_slots.is_empty()
    }

    pub fn num_constraints(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[derive(Clone, Debug)]
pub struct CoupledConstraintGraph {
    inv_sqrt_mass: Vec<f64>,
    /// CSR over constraints.
    offsets: Vec<usize>,
    coupled: Vec<usize>,
    mass_factors: Vec<f64>,
    blocks: Vec<TaskBlock>,
}

impl CoupledConstraintGraph {
    pub fn new(
        topology: &ConstraintTopology,
        inv_masses: &[f64],
        constraints_per_task: usize,
    ) -> ConstraintResult<Self> {
        if inv_masses.len() != topology.num_atoms() {
            return Err(ConstraintError::SizeMismatch {
                what: "inverse masses",
                expected: topology.num_atoms(),
                actual: inv_masses.len(),
            });
        }
        if constraints_per_task == 0 {
            return Err(ConstraintError::InvalidConfig(
                "constraints_per_task must be at least 1".to_owned(),
            ));
        }

        let cons = topology.constraints();

        let inv_sqrt_mass: Vec<f64> = cons
            .iter()
            .map(|c| 1. / (inv_masses[c.atom_i] + inv_masses[c.atom_j]).sqrt())
            .collect();

        let (atom_offsets, atom_cons) = topology.atom_constraints();

        let mut offsets = Vec::with_capacity(cons.len() + 1);
        let mut coupled = Vec::new();
        let mut mass_factors = Vec::new();
        offsets.push(0);

        for (c, con) in cons.iter().enumerate() {
            for (atom, first) in [(con.atom_i, true), (con.atom_j, false)] {
                for &c_other in &atom_cons[atom_offsets[atom]..atom_offsets[atom + 1]] {
                    if c_other == c {
                        continue;
                    }
                    let other_first = cons[c_other].atom_i == atom;

                    // +1 if the shared atom has the same role in both constraints.
                    let sign = if first == other_first { 1. } else { -1. };

                    coupled.push(c_other);
                    mass_factors
                        .push(-sign * inv_masses[atom] * inv_sqrt_mass[c] * inv_sqrt_mass[c_other]);
                }
            }
            offsets.push(coupled.len());
        }

        let mut result = Self {
            inv_sqrt_mass,
            offsets,
            coupled,
            mass_factors,
            blocks: Vec::new(),
        };

        let components = result.components();
        result.blocks = result.pack_blocks(topology, &components, constraints_per_task);

        debug!(
            "Constraint coupling: {} constraints, {} coupled pairs, {} components in {} task blocks",
            cons.len(),
            result.coupled.len() / 2,
            components.len(),
            result.blocks.len()
        );

        Ok(result)
    }

    pub fn num_constraints(&self) -> usize {
        self.inv_sqrt_mass.len()
    }

    /// True if any two constraints share an atom.
    pub fn has_coupled(&self) -> bool {
        !self.coupled.is_empty()
    }

    /// Constraints coupled to `c`, with their mass factors.
    pub fn coupled(&self, c: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.offsets[c]..self.offsets[c + 1];
        self.coupled[range.clone()]
            .iter()
            .copied()
            .zip(self.mass_factors[range].iter().copied())
    }

    pub fn num_coupled(&self, c: usize) -> usize {
        self.offsets[c + 1] - self.offsets[c]
    }

    /// `1/sqrt(invm_i + invm_j)` for constraint `c`.
    pub fn inv_sqrt_mass(&self, c: usize) -> f64 {
        self.inv_sqrt_mass[c]
    }

    pub fn blocks(&self) -> &[TaskBlock] {
        &self.blocks
    }

    /// Connected components, each sorted ascending, ordered by their lowest constraint.
    fn components(&self) -> Vec<Vec<usize>> {
        let n = self.num_constraints();
        let mut visited = vec![false; n];
        let mut result = Vec::new();
        let mut stack = Vec::new();

        for start in 0..n {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            stack.push(start);

            let mut comp = Vec::new();
            while let Some(c) = stack.pop() {
                comp.push(c);
                for (c_other, _) in self.coupled(c) {
                    if !visited[c_other] {
                        visited[c_other] = true;
                        stack.push(c_other);
                    }
                }
            }
            comp.sort_unstable();
            result.push(comp);
        }

        result
    }

    /// Fill blocks with whole components, in order. A component that doesn't fit in the space
    /// left starts a new block; one larger than a block gets a block to itself.
    fn pack_blocks(
        &self,
        topology: &ConstraintTopology,
        components: &[Vec<usize>],
        constraints_per_task: usize,
    ) -> Vec<TaskBlock> {
        let mut blocks = Vec::new();
        let mut current: Vec<usize> = Vec::new();

        for comp in components {
            if !current.is_empty() && current.len() + comp.len() > constraints_per_task {
                blocks.push(self.make_block(topology, &current, constraints_per_task));
                current.clear();
            }
            current.extend_from_slice(comp);
        }
        if !current.is_empty() {
            blocks.push(self.make_block(topology, &current, constraints_per_task));
        }

        blocks
    }

    fn make_block(
        &self,
        topology: &ConstraintTopology,
        constraints: &[usize],
        constraints_per_task: usize,
    ) -> TaskBlock {
        let cons = topology.constraints();

        let mut atoms: Vec<usize> = constraints
            .iter()
            .flat_map(|&c| [cons[c].atom_i, cons[c].atom_j])
            .collect();
        atoms.sort_unstable();
        atoms.dedup();

        let local = |a: usize| atoms.partition_point(|&b| b < a);

        let slot_of: HashMap<usize, usize> =
            constraints.iter().enumerate().map(|(k, &c)| (c, k)).collect();

        let num_slots = constraints.len().div_ceil(constraints_per_task) * constraints_per_task;

        let mut slots = Vec::with_capacity(num_slots);
        let mut pairs = Vec::with_capacity(num_slots);
        let mut lengths = Vec::with_capacity(num_slots);
        let mut inv_sqrt_mass = Vec::with_capacity(num_slots);
        let mut coupling_offsets = Vec::with_capacity(num_slots + 1);
        let mut coupled_slots = Vec::new();
        let mut mass_factors = Vec::new();
        coupling_offsets.push(0);

        for &c in constraints {
            slots.push(Some(c));
            pairs.push((local(cons[c].atom_i), local(cons[c].atom_j)));
            lengths.push(topology.length(c));
            inv_sqrt_mass.push(self.inv_sqrt_mass[c]);

            for (c_other, mf) in self.coupled(c) {
                // Coupled constraints are in the same component, so always in this block.
                if let Some(&k) = slot_of.get(&c_other) {
                    coupled_slots.push(k);
                    mass_factors.push(mf);
                }
            }
            coupling_offsets.push(coupled_slots.len());
        }

        // Padding.
        for _ in constraints.len()..num_slots {
            slots.push(None);
            pairs.push((0, 0));
            lengths.push(0.);
            inv_sqrt_mass.push(0.);
            coupling_offsets.push(coupled_slots.len());
        }

        TaskBlock {
            slots,
            atoms,
            pairs,
            lengths,
            inv_sqrt_mass,
            coupling_offsets,
            coupled_slots,
            mass_factors,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn mass_factor_signs() {
        // Chain 0-1-2: atom 1 is the second atom of constraint 0 and the first of constraint 1.
        let top = ConstraintTopology::from_triples(&[0, 0, 1, 0, 1, 2], vec![1.], 3).unwrap();
        let inv_m = [1., 0.5, 0.25];
        let g = CoupledConstraintGraph::new(&top, &inv_m, 256).unwrap();

        let s_0 = 1. / (1.5_f64).sqrt();
        let s_1 = 1. / (0.75_f64).sqrt();

        let c: Vec<_> = g.coupled(0).collect();
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].0, 1);
        assert_relative_eq!(c[0].1, 0.5 * s_0 * s_1);

        // Same role (both first atoms): negative.
        let top = ConstraintTopology::from_triples(&[0, 1, 0, 0, 1, 2], vec![1.], 3).unwrap();
        let g = CoupledConstraintGraph::new(&top, &inv_m, 256).unwrap();
        let (_, mf) = g.coupled(0).next().unwrap();
        assert!(mf < 0.);
    }

    #[test]
    fn blocks_are_padded_and_disjoint() {
        // Three separate pairs and one triangle.
        let triples = [0, 0, 1, 0, 2, 3, 0, 4, 5, 0, 6, 7, 0, 7, 8, 0, 8, 6];
        let top = ConstraintTopology::from_triples(&triples, vec![0.1], 9).unwrap();
        let g = CoupledConstraintGraph::new(&top, &[1.; 9], 4).unwrap();

        let blocks = g.blocks();
        assert_eq!(blocks.len(), 2);

        for block in blocks {
            assert_eq!(block.num_slots(), 4);
        }
        assert_eq!(blocks[0].num_constraints(), 3);
        assert!(!blocks[0].has_coupled());
        assert_eq!(blocks[1].num_constraints(), 3);
        assert!(blocks[1].has_coupled());
        assert_eq!(blocks[1].slots[3], None);
        assert_eq!(blocks[1].lengths[3], 0.);

        let mut seen = vec![false; 9];
        for block in blocks {
            for &a in &block.atoms {
                assert!(!seen[a], "Atom {a} appears in two blocks");
                seen[a] = true;
            }
        }
    }

    #[test]
    fn oversized_component_gets_its_own_block() {
        // A chain of 5 constraints, then a single pair.
        let triples = [0, 0, 1, 0, 1, 2, 0, 2, 3, 0, 3, 4, 0, 4, 5, 0, 6, 7];
        let top = ConstraintTopology::from_triples(&triples, vec![0.1], 8).unwrap();
        let g = CoupledConstraintGraph::new(&top, &[1.; 8], 2).unwrap();

        let blocks = g.blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].num_constraints(), 5);
        assert_eq!(blocks[0].num_slots(), 6);
        assert_eq!(blocks[1].slots, vec![Some(5), None]);
    }

    #[test]
    fn rejects_wrong_mass_count() {
        let top = ConstraintTopology::from_triples(&[0, 0, 1], vec![0.1], 2).unwrap();
        assert!(matches!(
            CoupledConstraintGraph::new(&top, &[1.], 8),
            Err(ConstraintError::SizeMismatch { .. })
        ));
    }
}
