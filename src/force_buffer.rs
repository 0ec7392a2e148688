//! Thread-local force, shift-force and energy buffers, and their thread-parallel reduction.
//!
//! Force kernels (e.g. bonded forces) run fully independently on each thread, each writing into
//! its own `ThreadForceBuffer`; no locking is needed while forces are computed. Afterwards,
//! `ThreadedForceBuffer::reduce` sums the per-thread buffers into the output arrays.
//!
//! We reduce the force array in blocks of 32 atoms. For each block we keep a mask of the threads
//! that wrote to it, so the reduction only visits (block, thread) combinations that can hold
//! non-zero data. In spatially-decomposed systems, most blocks are touched by 1 or 2 threads.
//!
//! Usage:
//!
//! At decomposition time (i.e. when the set of atoms each thread touches changes):
//! - Each thread calls `resize_buffer_and_clear_mask`, then `add_atom_to_mask` for all atoms
//!   it will write to, then `process_mask`.
//! - Then `ThreadedForceBuffer::setup_reduction` is called once.
//!
//! At each force computation:
//! - Each thread calls `clear_forces_and_energies`, then accumulates into its buffers.
//! - Then `ThreadedForceBuffer::reduce` is called.
//!
//! Each resize starts a new mask epoch. `reduce` refuses to run on masks from a previous epoch.
//!
//! The reduction order is fixed: within each output entry, contributions are summed in ascending
//! thread index. Results are bitwise reproducible for a given thread count and decomposition, but
//! not across thread counts.

use lin_alg::f64::Vec3;
use log::debug;
use rayon::prelude::*;

use crate::{
    StepWorkload,
    bitmask::{MAX_THREADS, ThreadMask},
    energy::{DvdlTerms, EnergyTerm, FepComponent, GroupPairEnergies, GroupPairTerm},
    error::ForceBufferError,
    pbc::NUM_SHIFT_VECTORS,
};

/// Log2 of the reduction block size.
pub const NUM_REDUCTION_BLOCK_BITS: usize = 5;
/// Atoms per reduction block. 32 atoms of 3 f64s is a whole number of cache lines.
pub const REDUCTION_BLOCK_SIZE: usize = 1 << NUM_REDUCTION_BLOCK_BITS;

/// The number of reduction blocks needed to cover `num_atoms`.
pub fn num_reduction_blocks(num_atoms: usize) -> usize {
    (num_atoms + REDUCTION_BLOCK_SIZE - 1) >> NUM_REDUCTION_BLOCK_BITS
}

/// Force and energy buffers, plus a reduction mask, for one thread.
#[derive(Debug)]
pub struct ThreadForceBuffer {
    thread_index: usize,
    num_atoms: usize,
    /// Padded to a whole number of reduction blocks.
    force_buffer: Vec<Vec3>,
    /// One entry per reduction block. Only our own bit is ever set.
    reduction_mask: Vec<ThreadMask>,
    /// Blocks we marked, ascending. Built by `process_mask`.
    used_block_indices: Vec<usize>,
    shift_forces: Vec<Vec3>,
    /// Empty if energy terms aren't tracked.
    energy_terms: Vec<f64>,
    group_pair_energies: GroupPairEnergies,
    dvdl: DvdlTerms,
    /// Incremented each time the mask is reset.
    epoch: u64,
    mask_processed: bool,
}

impl ThreadForceBuffer {
    pub fn new(thread_index: usize, use_energy_terms: bool, num_energy_groups: usize) -> Self {
        assert!(
            thread_index < MAX_THREADS,
            "Thread index {thread_index} exceeds the mask width of {MAX_THREADS}"
        );

        let energy_terms = if use_energy_terms {
            vec![0.; EnergyTerm::COUNT]
        } else {
            Vec::new()
        };

        Self {
            thread_index,
            num_atoms: 0,
            force_buffer: Vec::new(),
            reduction_mask: Vec::new(),
            used_block_indices: Vec::new(),
            shift_forces: vec![Vec3::new_zero(); NUM_SHIFT_VECTORS],
            energy_terms,
            group_pair_energies: GroupPairEnergies::new(num_energy_groups),
            dvdl: [0.; FepComponent::COUNT],
            epoch: 0,
            mask_processed: false,
        }
    }

    /// Resizes the force buffer to cover `num_atoms`, and clears the mask. Capacity only grows.
    pub fn resize_buffer_and_clear_mask(&mut self, num_atoms: usize) {
        let num_blocks = num_reduction_blocks(num_atoms);

        self.num_atoms = num_atoms;
        self.force_buffer
            .resize(num_blocks * REDUCTION_BLOCK_SIZE, Vec3::new_zero());

        self.reduction_mask.clear();
        self.reduction_mask.resize(num_blocks, ThreadMask::empty());
        self.used_block_indices.clear();

        self.epoch += 1;
        self.mask_processed = false;
    }

    /// Marks the block containing `atom_index` as written to by this thread.
    pub fn add_atom_to_mask(&mut self, atom_index: usize) {
        debug_assert!(
            atom_index < self.num_atoms,
            "Atom {atom_index} is outside the buffer of {} atoms; resize first",
            self.num_atoms
        );
        self.reduction_mask[atom_index >> NUM_REDUCTION_BLOCK_BITS].set(self.thread_index);
    }

    /// Compacts the marked blocks into a dense, ascending list. Call after all `add_atom_to_mask`
    /// calls for this decomposition. Calling it again without changes gives the same list.
    pub fn process_mask(&mut self) {
        self.used_block_indices.clear();
        for (b, mask) in self.reduction_mask.iter().enumerate() {
            if mask.is_set(self.thread_index) {
                self.used_block_indices.push(b);
            }
        }
        self.mask_processed = true;
    }

    /// Zero forces, shift forces, energy terms, group-pair energies, and dV/dλ. The mask is
    /// left as-is. Run at the start of each force evaluation.
    pub fn clear_forces_and_energies(&mut self) {
        self.force_buffer.fill(Vec3::new_zero());
        self.shift_forces.fill(Vec3::new_zero());
        self.energy_terms.fill(0.);
        self.group_pair_energies.clear();
        self.dvdl = [0.; FepComponent::COUNT];
    }

    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    /// The number of atoms the force buffer covers.
    pub fn size(&self) -> usize {
        self.num_atoms
    }

    pub fn force_buffer(&self) -> &[Vec3] {
        &self.force_buffer[..self.num_atoms]
    }

    pub fn force_buffer_mut(&mut self) -> &mut [Vec3] {
        &mut self.force_buffer[..self.num_atoms]
    }

    pub fn shift_forces(&self) -> &[Vec3] {
        &self.shift_forces
    }

    pub fn shift_forces_mut(&mut self) -> &mut [Vec3] {
        &mut self.shift_forces
    }

    /// Size `EnergyTerm::COUNT`, or empty if energy terms aren't tracked.
    pub fn energy_terms(&self) -> &[f64] {
        &self.energy_terms
    }

    pub fn energy_terms_mut(&mut self) -> &mut [f64] {
        &mut self.energy_terms
    }

    /// Adds to an energy term; a no-op if energy terms aren't tracked.
    pub fn add_energy(&mut self, term: EnergyTerm, energy: f64) {
        if let Some(e) = self.energy_terms.get_mut(term.index()) {
            *e += energy;
        }
    }

    pub fn group_pair_energies(&self) -> &GroupPairEnergies {
        &self.group_pair_energies
    }

    pub fn group_pair_energies_mut(&mut self) -> &mut GroupPairEnergies {
        &mut self.group_pair_energies
    }

    pub fn dvdl(&self) -> &DvdlTerms {
        &self.dvdl
    }

    pub fn dvdl_mut(&mut self) -> &mut DvdlTerms {
        &mut self.dvdl
    }

    pub fn reduction_mask(&self) -> &[ThreadMask] {
        &self.reduction_mask
    }

    pub fn used_block_indices(&self) -> &[usize] {
        &self.used_block_indices
    }
}

/// Output force and shift-force arrays for a reduction.
pub struct ForceWithShiftForces<'a> {
    pub force: &'a mut [Vec3],
    pub shift_forces: &'a mut [Vec3],
}

/// Owns one `ThreadForceBuffer` per worker thread, and reduces them.
#[derive(Debug)]
pub struct ThreadedForceBuffer {
    use_energy_terms: bool,
    thread_force_buffers: Vec<ThreadForceBuffer>,
    /// Blocks with contributions from at least one thread, ascending.
    used_block_indices: Vec<usize>,
    /// Union of the per-thread masks, per block.
    reduction_mask: Vec<ThreadMask>,
    num_atoms_force: usize,
    /// The mask epoch of each thread buffer when `setup_reduction` last ran.
    setup_epochs: Option<Vec<u64>>,
}

impl ThreadedForceBuffer {
    pub fn new(
        num_threads: usize,
        use_energy_terms: bool,
        num_energy_groups: usize,
    ) -> Result<Self, ForceBufferError> {
        if num_threads == 0 || num_threads > MAX_THREADS {
            return Err(ForceBufferError::InvalidThreadCount {
                requested: num_threads,
                max: MAX_THREADS,
            });
        }

        let thread_force_buffers = (0..num_threads)
            .map(|t| ThreadForceBuffer::new(t, use_energy_terms, num_energy_groups))
            .collect();

        Ok(Self {
            use_energy_terms,
            thread_force_buffers,
            used_block_indices: Vec::new(),
            reduction_mask: Vec::new(),
            num_atoms_force: 0,
            setup_epochs: None,
        })
    }

    pub fn num_thread_buffers(&self) -> usize {
        self.thread_force_buffers.len()
    }

    pub fn thread_force_buffer(&self, i: usize) -> &ThreadForceBuffer {
        &self.thread_force_buffers[i]
    }

    pub fn thread_force_buffer_mut(&mut self, i: usize) -> &mut ThreadForceBuffer {
        &mut self.thread_force_buffers[i]
    }

    /// Hands each worker exclusive access to its own buffer. Index with `thread_index()`.
    pub fn par_thread_force_buffers_mut(&mut self) -> rayon::slice::IterMut<'_, ThreadForceBuffer> {
        self.thread_force_buffers.par_iter_mut()
    }

    pub fn used_block_indices(&self) -> &[usize] {
        &self.used_block_indices
    }

    pub fn reduction_mask(&self) -> &[ThreadMask] {
        &self.reduction_mask
    }

    /// Merges the per-thread masks. Run after every thread has called `process_mask` for the
    /// current decomposition, and before `reduce`.
    pub fn setup_reduction(&mut self) -> Result<(), ForceBufferError> {
        let num_atoms = self.thread_force_buffers[0].size();

        for (t, buf) in self.thread_force_buffers.iter().enumerate() {
            if !buf.mask_processed {
                return Err(ForceBufferError::MaskNotProcessed { thread: t });
            }
            if buf.size() != num_atoms {
                return Err(ForceBufferError::AtomCountMismatch {
                    thread: t,
                    expected: num_atoms,
                    actual: buf.size(),
                });
            }
        }

        let num_blocks = num_reduction_blocks(num_atoms);
        self.reduction_mask.clear();
        self.reduction_mask.resize(num_blocks, ThreadMask::empty());

        // Generate the union over the threads of the used blocks.
        for buf in &self.thread_force_buffers {
            for &b in &buf.used_block_indices {
                self.reduction_mask[b].set(buf.thread_index);
            }
        }

        self.used_block_indices.clear();
        for (b, mask) in self.reduction_mask.iter().enumerate() {
            if !mask.is_empty() {
                self.used_block_indices.push(b);
            }
        }

        self.num_atoms_force = num_atoms;
        self.setup_epochs = Some(self.thread_force_buffers.iter().map(|b| b.epoch).collect());

        debug!(
            "Force reduction set up: {} atoms, {} of {num_blocks} blocks used, {} thread buffers",
            num_atoms,
            self.used_block_indices.len(),
            self.thread_force_buffers.len()
        );

        Ok(())
    }

    /// Reduces forces and energies, as requested by `step_work`. Results are added to the outputs.
    ///
    /// Forces are reduced over all threads that marked each block, starting at thread 0. Shift
    /// forces, energy terms, group-pair energies and dV/dλ are reduced over threads starting at
    /// `reduction_begin_index`; earlier threads are assumed to have written to the outputs
    /// directly.
    ///
    /// Outputs for categories `step_work` doesn't request may be `None` or empty.
    pub fn reduce(
        &self,
        mut force_with_shift_forces: Option<&mut ForceWithShiftForces<'_>>,
        energy_terms: &mut [f64],
        group_pair_energies: Option<&mut GroupPairEnergies>,
        dvdl: &mut [f64],
        step_work: &StepWorkload,
        reduction_begin_index: usize,
    ) -> Result<(), ForceBufferError> {
        let Some(epochs) = &self.setup_epochs else {
            return Err(ForceBufferError::ReductionNotSetUp);
        };

        for (t, buf) in self.thread_force_buffers.iter().enumerate() {
            if buf.epoch != epochs[t] {
                return Err(ForceBufferError::StaleReduction { thread: t });
            }
        }

        if step_work.compute_forces && !self.used_block_indices.is_empty() {
            let Some(fws) = force_with_shift_forces.as_mut() else {
                return Err(ForceBufferError::MissingOutput("force"));
            };

            if fws.force.len() < self.num_atoms_force {
                return Err(ForceBufferError::OutputTooSmall {
                    what: "force",
                    expected: self.num_atoms_force,
                    actual: fws.force.len(),
                });
            }

            reduce_thread_force_buffers(
                &mut fws.force[..self.num_atoms_force],
                &self.thread_force_buffers,
                &self.reduction_mask,
                &self.used_block_indices,
            );
        }

        let num_buffers = self.thread_force_buffers.len();

        // Energies and shift forces are small; reduce them on this thread only.
        if !(step_work.compute_energy || step_work.compute_virial || step_work.compute_dhdl)
            || num_buffers <= reduction_begin_index
        {
            return Ok(());
        }

        let bufs = &self.thread_force_buffers[reduction_begin_index..];

        if step_work.compute_virial {
            let Some(fws) = force_with_shift_forces.as_mut() else {
                return Err(ForceBufferError::MissingOutput("shift force"));
            };
            check_len("shift force", fws.shift_forces.len(), NUM_SHIFT_VECTORS)?;

            for (i, f_shift) in fws.shift_forces[..NUM_SHIFT_VECTORS].iter_mut().enumerate() {
                for buf in bufs {
                    *f_shift += buf.shift_forces[i];
                }
            }
        }

        if step_work.compute_energy && self.use_energy_terms {
            check_len("energy term", energy_terms.len(), EnergyTerm::COUNT)?;

            for (i, e) in energy_terms[..EnergyTerm::COUNT].iter_mut().enumerate() {
                for buf in bufs {
                    *e += buf.energy_terms[i];
                }
            }
        }

        if step_work.compute_energy {
            let num_pairs = bufs[0].group_pair_energies.num_pairs();

            if num_pairs > 0 {
                let Some(grpp) = group_pair_energies else {
                    return Err(ForceBufferError::MissingOutput("group pair energy"));
                };

                for term in 0..GroupPairTerm::COUNT {
                    check_len("group pair energy", grpp.terms[term].len(), num_pairs)?;

                    for (j, e) in grpp.terms[term][..num_pairs].iter_mut().enumerate() {
                        for buf in bufs {
                            *e += buf.group_pair_energies.terms[term][j];
                        }
                    }
                }
            }
        }

        if step_work.compute_dhdl {
            check_len("dV/dλ", dvdl.len(), FepComponent::COUNT)?;

            for (i, d) in dvdl[..FepComponent::COUNT].iter_mut().enumerate() {
                for buf in bufs {
                    *d += buf.dvdl[i];
                }
            }
        }

        Ok(())
    }
}

fn check_len(what: &'static str, actual: usize, expected: usize) -> Result<(), ForceBufferError> {
    if actual < expected {
        return Err(ForceBufferError::OutputTooSmall {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Sums thread buffers into `force`, block by block, in parallel. Each used block is a disjoint
/// slice of the output, so no two workers write the same entry.
fn reduce_thread_force_buffers(
    force: &mut [Vec3],
    buffers: &[ThreadForceBuffer],
    masks: &[ThreadMask],
    used_block_indices: &[usize],
) {
    let num_atoms = force.len();

    // Carve the output into one slice per used block. `used_block_indices` is ascending.
    let mut blocks = Vec::with_capacity(used_block_indices.len());
    let mut rest: &mut [Vec3] = force;
    let mut offset = 0;

    for &b in used_block_indices {
        let a0 = b * REDUCTION_BLOCK_SIZE;
        let a1 = (a0 + REDUCTION_BLOCK_SIZE).min(num_atoms);

        let (_, tail) = std::mem::take(&mut rest).split_at_mut(a0 - offset);
        let (block, tail) = tail.split_at_mut(a1 - a0);

        blocks.push((b, a0, block));
        rest = tail;
        offset = a1;
    }

    blocks.into_par_iter().for_each(|(b, a0, block)| {
        for t in masks[b].iter() {
            let src = &buffers[t].force_buffer[a0..a0 + block.len()];
            for (f, f_thread) in block.iter_mut().zip(src) {
                *f += *f_thread;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_work() -> StepWorkload {
        StepWorkload {
            compute_forces: true,
            compute_virial: true,
            compute_energy: true,
            compute_dhdl: true,
            update_velocities: false,
        }
    }

    /// Thread `t` writes to atoms `ranges[t]`, with a value depending on the thread and atom.
    fn setup(num_atoms: usize, ranges: &[std::ops::Range<usize>]) -> ThreadedForceBuffer {
        let mut tfb = ThreadedForceBuffer::new(ranges.len(), true, 2).unwrap();

        for (t, range) in ranges.iter().enumerate() {
            let buf = tfb.thread_force_buffer_mut(t);
            buf.resize_buffer_and_clear_mask(num_atoms);
            for a in range.clone() {
                buf.add_atom_to_mask(a);
            }
            buf.process_mask();
        }
        tfb.setup_reduction().unwrap();

        tfb.par_thread_force_buffers_mut().for_each(|buf| {
            buf.clear_forces_and_energies();
            let t = buf.thread_index();
            for a in ranges[t].clone() {
                buf.force_buffer_mut()[a] = Vec3::new(
                    0.1 * (t + 1) as f64 + a as f64 * 1.0e-3,
                    -(a as f64) / 7.,
                    1. / (1 + a + t) as f64,
                );
            }
            buf.shift_forces_mut()[3] = Vec3::new(t as f64, 1., 0.);
            buf.add_energy(EnergyTerm::BondStretching, 1.5 * (t + 1) as f64);
            buf.group_pair_energies_mut()
                .add(GroupPairTerm::LjShortRange, 0, 1, 0.25);
            buf.dvdl_mut()[FepComponent::Bonded as usize] = t as f64;
        });

        tfb
    }

    fn reduce_forces(tfb: &ThreadedForceBuffer, num_atoms: usize) -> Vec<Vec3> {
        let mut force = vec![Vec3::new_zero(); num_atoms];
        let mut shift = vec![Vec3::new_zero(); NUM_SHIFT_VECTORS];
        let mut fws = ForceWithShiftForces {
            force: &mut force,
            shift_forces: &mut shift,
        };
        let mut energy = vec![0.; EnergyTerm::COUNT];
        let mut grpp = GroupPairEnergies::new(2);
        let mut dvdl = vec![0.; FepComponent::COUNT];

        tfb.reduce(
            Some(&mut fws),
            &mut energy,
            Some(&mut grpp),
            &mut dvdl,
            &all_work(),
            0,
        )
        .unwrap();

        force
    }

    #[test]
    fn reduced_forces_are_ascending_thread_sums() {
        let n = 150;
        let ranges = [0..40, 30..100, 95..150, 10..12];
        let tfb = setup(n, &ranges);
        let force = reduce_forces(&tfb, n);

        for a in 0..n {
            let block = a >> NUM_REDUCTION_BLOCK_BITS;
            let mut expected = Vec3::new_zero();
            for t in 0..ranges.len() {
                if tfb.reduction_mask()[block].is_set(t) {
                    expected += tfb.thread_force_buffer(t).force_buffer()[a];
                }
            }
            assert_eq!(force[a], expected, "Atom {a}");
        }

        // An atom written by threads 0, 1 and 3.
        let f_0 = tfb.thread_force_buffer(0).force_buffer()[11];
        let f_1 = tfb.thread_force_buffer(1).force_buffer()[11];
        let f_3 = tfb.thread_force_buffer(3).force_buffer()[11];
        assert_eq!(f_1, Vec3::new_zero());
        assert_eq!(force[11], f_0 + f_1 + f_3);
    }

    #[test]
    fn reduction_is_bitwise_reproducible() {
        let n = 200;
        let ranges = [0..120, 60..200, 0..200];
        let tfb = setup(n, &ranges);

        let a = reduce_forces(&tfb, n);
        let b = reduce_forces(&tfb, n);

        for (fa, fb) in a.iter().zip(&b) {
            assert_eq!(fa.x.to_bits(), fb.x.to_bits());
            assert_eq!(fa.y.to_bits(), fb.y.to_bits());
            assert_eq!(fa.z.to_bits(), fb.z.to_bits());
        }
    }

    #[test]
    fn untouched_blocks_are_skipped() {
        let n = 128;
        // Block 2 (atoms 64..96) is written by nobody.
        let tfb = setup(n, &[0..64, 100..128]);
        assert_eq!(tfb.used_block_indices(), &[0, 1, 3]);

        let marker = Vec3::new(7., 7., 7.);
        let mut force = vec![marker; n];
        let mut shift = vec![Vec3::new_zero(); NUM_SHIFT_VECTORS];
        let mut fws = ForceWithShiftForces {
            force: &mut force,
            shift_forces: &mut shift,
        };
        let work = StepWorkload {
            compute_forces: true,
            ..Default::default()
        };
        tfb.reduce(Some(&mut fws), &mut [], None, &mut [], &work, 0)
            .unwrap();

        for a in 64..96 {
            assert_eq!(force[a], marker);
        }
        // Accumulated onto the existing values, not overwritten.
        let expected = marker + tfb.thread_force_buffer(0).force_buffer()[5];
        assert_eq!(force[5], expected);
    }

    #[test]
    fn energies_start_at_reduction_begin_index() {
        let n = 40;
        let tfb = setup(n, &[0..10, 10..20, 20..40]);

        let mut force = vec![Vec3::new_zero(); n];
        let mut shift = vec![Vec3::new_zero(); NUM_SHIFT_VECTORS];
        let mut fws = ForceWithShiftForces {
            force: &mut force,
            shift_forces: &mut shift,
        };
        let mut energy = vec![0.; EnergyTerm::COUNT];
        let mut grpp = GroupPairEnergies::new(2);
        let mut dvdl = vec![0.; FepComponent::COUNT];

        tfb.reduce(
            Some(&mut fws),
            &mut energy,
            Some(&mut grpp),
            &mut dvdl,
            &all_work(),
            1,
        )
        .unwrap();

        // Threads 1 and 2 only.
        assert_eq!(energy[EnergyTerm::BondStretching.index()], 3.0 + 4.5);
        assert_eq!(grpp.get(GroupPairTerm::LjShortRange, 0, 1), 0.5);
        assert_eq!(dvdl[FepComponent::Bonded as usize], 1. + 2.);
        assert_eq!(shift[3], Vec3::new(3., 2., 0.));

        // Forces always include thread 0.
        assert_eq!(force[0], tfb.thread_force_buffer(0).force_buffer()[0]);
    }

    #[test]
    fn disabled_outputs_may_be_absent() {
        let n = 40;
        let tfb = setup(n, &[0..40, 0..40]);
        let work = StepWorkload::default();

        tfb.reduce(None, &mut [], None, &mut [], &work, 0).unwrap();

        let work = StepWorkload {
            compute_forces: true,
            ..Default::default()
        };
        let result = tfb.reduce(None, &mut [], None, &mut [], &work, 0);
        assert!(matches!(result, Err(ForceBufferError::MissingOutput(_))));
    }

    #[test]
    fn sequencing_errors() {
        let n = 64;
        let mut tfb = ThreadedForceBuffer::new(2, false, 0).unwrap();
        let work = StepWorkload::default();

        let result = tfb.reduce(None, &mut [], None, &mut [], &work, 0);
        assert!(matches!(result, Err(ForceBufferError::ReductionNotSetUp)));

        for t in 0..2 {
            tfb.thread_force_buffer_mut(t).resize_buffer_and_clear_mask(n);
        }
        tfb.thread_force_buffer_mut(0).process_mask();
        assert!(matches!(
            tfb.setup_reduction(),
            Err(ForceBufferError::MaskNotProcessed { thread: 1 })
        ));

        tfb.thread_force_buffer_mut(1).process_mask();
        tfb.setup_reduction().unwrap();
        tfb.reduce(None, &mut [], None, &mut [], &work, 0).unwrap();

        // A new decomposition on one thread invalidates the merged mask.
        tfb.thread_force_buffer_mut(1).resize_buffer_and_clear_mask(n);
        let result = tfb.reduce(None, &mut [], None, &mut [], &work, 0);
        assert!(matches!(
            result,
            Err(ForceBufferError::StaleReduction { thread: 1 })
        ));

        tfb.thread_force_buffer_mut(1).resize_buffer_and_clear_mask(n + 1);
        tfb.thread_force_buffer_mut(1).process_mask();
        assert!(matches!(
            tfb.setup_reduction(),
            Err(ForceBufferError::AtomCountMismatch { thread: 1, .. })
        ));
    }

    #[test]
    fn process_mask_is_idempotent() {
        let mut buf = ThreadForceBuffer::new(3, false, 0);
        buf.resize_buffer_and_clear_mask(100);
        for a in [0, 5, 40, 99] {
            buf.add_atom_to_mask(a);
        }
        buf.process_mask();
        let first = buf.used_block_indices().to_vec();
        buf.process_mask();

        assert_eq!(first, vec![0, 1, 3]);
        assert_eq!(buf.used_block_indices(), first.as_slice());
        assert!(buf.reduction_mask()[1].is_set(3));
    }

    #[test]
    fn clearing_keeps_the_mask() {
        let mut buf = ThreadForceBuffer::new(0, true, 1);
        buf.resize_buffer_and_clear_mask(10);
        buf.add_atom_to_mask(3);
        buf.process_mask();

        buf.force_buffer_mut()[3] = Vec3::new(1., 2., 3.);
        buf.add_energy(EnergyTerm::AngleBending, 2.);
        buf.clear_forces_and_energies();

        assert_eq!(buf.force_buffer()[3], Vec3::new_zero());
        assert_eq!(buf.energy_terms()[EnergyTerm::AngleBending.index()], 0.);
        assert_eq!(buf.used_block_indices(), &[0]);
        assert!(buf.reduction_mask()[0].is_set(0));
    }

    #[test]
    fn thread_count_limits() {
        assert!(ThreadedForceBuffer::new(0, false, 0).is_err());
        assert!(ThreadedForceBuffer::new(MAX_THREADS + 1, false, 0).is_err());
        assert!(ThreadedForceBuffer::new(MAX_THREADS, false, 0).is_ok());
    }
}
