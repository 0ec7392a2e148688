//! Energy bookkeeping: per-interaction-type energy terms, energies between pairs of
//! non-bonded energy groups, and free-energy derivatives (dV/dλ).
//!
//! Units: kcal/mol.

/// Interaction types we accumulate energy for. Used to index energy-term arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum EnergyTerm {
    BondStretching,
    AngleBending,
    ProperDihedral,
    ImproperDihedral,
    Lj14,
    Coulomb14,
    LjShortRange,
    CoulombShortRange,
    CoulombRecip,
    /// Energy from position restraints.
    PositionRestraint,
    /// dV/dλ contributions from constraints. (Constraint lengths that depend on λ)
    DvdlConstraint,
    Potential,
    Kinetic,
}

impl EnergyTerm {
    pub const COUNT: usize = 13;

    pub const ALL: [Self; Self::COUNT] = [
        Self::BondStretching,
        Self::AngleBending,
        Self::ProperDihedral,
        Self::ImproperDihedral,
        Self::Lj14,
        Self::Coulomb14,
        Self::LjShortRange,
        Self::CoulombShortRange,
        Self::CoulombRecip,
        Self::PositionRestraint,
        Self::DvdlConstraint,
        Self::Potential,
        Self::Kinetic,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// The non-bonded terms we split per energy-group pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum GroupPairTerm {
    CoulombShortRange,
    LjShortRange,
    Coulomb14,
    Lj14,
}

impl GroupPairTerm {
    pub const COUNT: usize = 4;
}

/// Energies between every pair of energy groups, for each `GroupPairTerm`. Flattened;
/// index with `pair_index`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupPairEnergies {
    pub num_groups: usize,
    pub terms: [Vec<f64>; GroupPairTerm::COUNT],
}

impl GroupPairEnergies {
    pub fn new(num_groups: usize) -> Self {
        let n = num_groups * num_groups;
        Self {
            num_groups,
            terms: std::array::from_fn(|_| vec![0.; n]),
        }
    }

    /// The number of group pairs stored per term.
    pub fn num_pairs(&self) -> usize {
        self.num_groups * self.num_groups
    }

    pub fn pair_index(&self, group_0: usize, group_1: usize) -> usize {
        group_0 * self.num_groups + group_1
    }

    pub fn add(&mut self, term: GroupPairTerm, group_0: usize, group_1: usize, energy: f64) {
        let i = self.pair_index(group_0, group_1);
        self.terms[term as usize][i] += energy;
    }

    pub fn get(&self, term: GroupPairTerm, group_0: usize, group_1: usize) -> f64 {
        self.terms[term as usize][self.pair_index(group_0, group_1)]
    }

    pub fn clear(&mut self) {
        for t in &mut self.terms {
            t.fill(0.);
        }
    }
}

/// Components of the free-energy coupling parameter λ that dV/dλ is tracked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum FepComponent {
    Fep,
    Mass,
    Coulomb,
    Vdw,
    Bonded,
    Restraint,
    Temperature,
}

impl FepComponent {
    pub const COUNT: usize = 7;
}

pub type DvdlTerms = [f64; FepComponent::COUNT];
