//! Runs a hydrocarbon-like chain with rigid C-H bonds, and logs energies and constraint accuracy.
//!
//! `RUST_LOG=info cargo run --example constrained_chain -- [lincs|shake] [num_threads]`

use std::{env, time::Instant};

use lin_alg::f64::Vec3;
use lincs_dynamics::{
    AtomState, BondedInteractions, ConstraintAlgorithm, ConstraintConfig, ConstraintTopology,
    EnergyTerm, HarmonicAngle, HarmonicBond, MdConfig, MdError, MdState, PbcBox, StepWorkload,
};
use log::info;

const NUM_CARBONS: usize = 200;
const NUM_STEPS: usize = 2_000;
const LOG_RATIO: usize = 200;

const R_CC: f64 = 1.53;
const R_CH: f64 = 1.09;

fn build_chain() -> Result<(AtomState, BondedInteractions, ConstraintTopology), MdError> {
    let mut masses = Vec::new();
    let mut posits = Vec::new();
    let mut pairs = Vec::new();
    let mut bonded = BondedInteractions::default();

    for k in 0..NUM_CARBONS {
        let sign = if k % 2 == 0 { 1. } else { -1. };
        let c = Vec3::new(1.25 * k as f64, 0.45 * sign, 0.);
        let i_c = posits.len();

        masses.extend([12.011, 1.008, 1.008]);
        posits.push(c);
        posits.push(c + Vec3::new(0., 0., R_CH));
        posits.push(c + Vec3::new(0., 0.5 * sign, -(0.75_f64.sqrt())) * R_CH);

        pairs.push((i_c, i_c + 1, R_CH));
        pairs.push((i_c, i_c + 2, R_CH));

        if k > 0 {
            bonded.bonds.push(HarmonicBond {
                atoms: (i_c - 3, i_c),
                r_0: R_CC,
                k: 310.,
            });
        }
        if k > 1 {
            bonded.angles.push(HarmonicAngle {
                atoms: (i_c - 6, i_c - 3, i_c),
                theta_0: 1.911,
                k: 63.,
            });
        }
    }

    // A gentle twist along the chain, with no net momentum.
    let n = posits.len();
    let vels: Vec<Vec3> = (0..n)
        .map(|i| {
            let phase = i as f64 * 0.37;
            Vec3::new(0., phase.sin(), phase.cos()) * 0.5
        })
        .collect();
    let total_mass: f64 = masses.iter().sum();
    let mut p = Vec3::new_zero();
    for (v, m) in vels.iter().zip(&masses) {
        p += *v * *m;
    }
    let v_com = p / total_mass;
    let vels = vels.into_iter().map(|v| v - v_com).collect();

    let atoms = AtomState::new(&masses, posits, vels)?;
    let top = ConstraintTopology::from_pairs(&pairs, n)?;

    Ok((atoms, bonded, top))
}

fn main() -> Result<(), MdError> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let algorithm = match args.next().as_deref() {
        Some("shake") => ConstraintAlgorithm::Shake,
        _ => ConstraintAlgorithm::Lincs,
    };
    let num_threads = args.next().and_then(|a| a.parse().ok()).unwrap_or(0);

    let cfg = MdConfig {
        dt: 0.002,
        num_threads,
        constraints: ConstraintConfig {
            algorithm,
            ..Default::default()
        },
        ..Default::default()
    };

    let (atoms, bonded, top) = build_chain()?;
    let mut md = MdState::new(cfg, atoms, PbcBox::None, bonded, top)?;

    info!(
        "Running {NUM_STEPS} steps of {} atoms with {algorithm}, {} thread buffers",
        md.atoms.len(),
        md.force_buffers().num_thread_buffers()
    );

    let start = Instant::now();

    for i in 0..NUM_STEPS {
        let step_work = if i % LOG_RATIO == 0 {
            StepWorkload::full()
        } else {
            StepWorkload::default()
        };

        md.step(&step_work)?;

        if i % LOG_RATIO == 0 {
            let stats = md.constraint_stats.clone().unwrap_or_default();
            info!(
                "Step {:>5}  t = {:.3} ps  KE = {:.3}  PE = {:.3} kcal/mol  \
                 constraint dev rms {:.2e} max {:.2e}  virial trace {:.3}",
                md.step_count,
                md.time,
                md.energy_terms[EnergyTerm::Kinetic.index()],
                md.energy_terms[EnergyTerm::Potential.index()],
                stats.rms_deviation,
                stats.max_deviation,
                md.virial.trace(),
            );
        }
    }

    info!(
        "Done in {} ms. Net momentum: {:?}",
        start.elapsed().as_millis(),
        md.atoms.momentum()
    );

    Ok(())
}
