//! The list of constrained atom pairs, and their target lengths.

use crate::error::{ConstraintError, ConstraintResult};

/// Lengths within this relative tolerance share a type when deduplicating.
const LEN_DEDUP_REL_TOL: f64 = 1.0e-12;

/// A rigid distance between two atoms. The length is looked up by `type_index` in the
/// topology's length table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Constraint {
    pub type_index: usize,
    pub atom_i: usize,
    pub atom_j: usize,
}

/// Constraints, and the shared table of their target lengths.
#[derive(Clone, Debug, Default)]
pub struct ConstraintTopology {
    num_atoms: usize,
    constraints: Vec<Constraint>,
    lengths: Vec<f64>,
}

impl ConstraintTopology {
    /// From the flattened `(type, i, j)` form, e.g. `[0, 0, 1,  1, 1, 2]`: Two constraints, the
    /// first between atoms 0 and 1 with length `lengths[0]`.
    pub fn from_triples(
        triples: &[usize],
        lengths: Vec<f64>,
        num_atoms: usize,
    ) -> ConstraintResult<Self> {
        if triples.len() % 3 != 0 {
            return Err(ConstraintError::MalformedTriples(triples.len()));
        }

        let constraints = triples
            .chunks_exact(3)
            .map(|t| Constraint {
                type_index: t[0],
                atom_i: t[1],
                atom_j: t[2],
            })
            .collect();

        let result = Self {
            num_atoms,
            constraints,
            lengths,
        };
        result.validate()?;

        Ok(result)
    }

    /// From `(i, j, length)` pairs. Builds the length table, with one entry per distinct length.
    pub fn from_pairs(pairs: &[(usize, usize, f64)], num_atoms: usize) -> ConstraintResult<Self> {
        let mut lengths: Vec<f64> = Vec::new();
        let mut constraints = Vec::with_capacity(pairs.len());

        for &(atom_i, atom_j, len) in pairs {
            let existing = lengths
                .iter()
                .position(|&l| (l - len).abs() <= LEN_DEDUP_REL_TOL * l.abs().max(len.abs()));

            let type_index = match existing {
                Some(t) => t,
                None => {
                    lengths.push(len);
                    lengths.len() - 1
                }
            };

            constraints.push(Constraint {
                type_index,
                atom_i,
                atom_j,
            });
        }

        let result = Self {
            num_atoms,
            constraints,
            lengths,
        };
        result.validate()?;

        Ok(result)
    }

    fn validate(&self) -> ConstraintResult<()> {
        for (c, con) in self.constraints.iter().enumerate() {
            for atom in [con.atom_i, con.atom_j] {
                if atom >= self.num_atoms {
                    return Err(ConstraintError::AtomOutOfRange {
                        constraint: c,
                        atom,
                        num_atoms: self.num_atoms,
                    });
                }
            }

            if con.atom_i == con.atom_j {
                return Err(ConstraintError::SelfConstraint {
                    constraint: c,
                    atom: con.atom_i,
                });
            }

            if con.type_index >= self.lengths.len() {
                return Err(ConstraintError::UnknownType {
                    constraint: c,
                    type_index: con.type_index,
                    table_len: self.lengths.len(),
                });
            }
        }

        Ok(())
    }

    pub fn num_atoms(&self) -> usize {
        self.num_atoms
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// The deduplicated length table.
    pub fn lengths(&self) -> &[f64] {
        &self.lengths
    }

    /// Target length of constraint `c`.
    pub fn length(&self, c: usize) -> f64 {
        self.lengths[self.constraints[c].type_index]
    }

    /// For each atom, the constraints it takes part in, ascending. CSR layout: the constraints of
    /// atom `a` are `indices[offsets[a]..offsets[a + 1]]`.
    pub fn atom_constraints(&self) -> (Vec<usize>, Vec<usize>) {
        let mut counts = vec![0; self.num_atoms + 1];
        for con in &self.constraints {
            counts[con.atom_i + 1] += 1;
            counts[con.atom_j + 1] += 1;
        }
        for a in 0..self.num_atoms {
            counts[a + 1] += counts[a];
        }
        let offsets = counts;

        let mut fill = offsets.clone();
        let mut indices = vec![0; offsets[self.num_atoms]];
        for (c, con) in self.constraints.iter().enumerate() {
            for atom in [con.atom_i, con.atom_j] {
                indices[fill[atom]] = c;
                fill[atom] += 1;
            }
        }

        (offsets, indices)
    }
}
