//! Periodic boundary conditions. Molecular systems wrap around a box at each face, indefinitely;
//! every displacement between two atoms must use the closest periodic image ("minimum image").
//!
//! We support rectangular (orthorhombic) boxes, and the non-periodic case. The non-periodic case
//! is what small test systems, and molecules in vacuum, use.
//!
//! Shift vectors: Each minimum-image displacement corresponds to a lattice translation of the box.
//! Forces acting across the box boundary are accumulated per translation ("shift forces"),
//! which is what lets us compute the virial with periodic boundaries.

use lin_alg::f64::Vec3;

/// Lattice translations we track, in box units, per dimension. X has a wider range, as triclinic
/// boxes can shift an image by up to 2 box lengths in that dimension.
pub const SHIFT_RANGE_X: i32 = 2;
pub const SHIFT_RANGE_Y: i32 = 1;
pub const SHIFT_RANGE_Z: i32 = 1;

pub const NUM_SHIFT_VECTORS: usize = ((2 * SHIFT_RANGE_X + 1)
    * (2 * SHIFT_RANGE_Y + 1)
    * (2 * SHIFT_RANGE_Z + 1)) as usize;

/// The index of the zero translation.
pub const CENTRAL_SHIFT_INDEX: usize = NUM_SHIFT_VECTORS / 2;

/// Maps a lattice translation, in box units, to its shift-vector index. Components outside
/// the tracked range are clamped.
pub fn shift_index(ix: i32, iy: i32, iz: i32) -> usize {
    let ix = ix.clamp(-SHIFT_RANGE_X, SHIFT_RANGE_X);
    let iy = iy.clamp(-SHIFT_RANGE_Y, SHIFT_RANGE_Y);
    let iz = iz.clamp(-SHIFT_RANGE_Z, SHIFT_RANGE_Z);

    (((SHIFT_RANGE_Z + iz) * (2 * SHIFT_RANGE_Y + 1) + SHIFT_RANGE_Y + iy)
        * (2 * SHIFT_RANGE_X + 1)
        + SHIFT_RANGE_X
        + ix) as usize
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum PbcBox {
    /// No periodicity; displacements are plain differences.
    #[default]
    None,
    /// Edge lengths of a rectangular box with one corner at the origin.
    Rectangular { extent: Vec3 },
}

impl PbcBox {
    pub fn rectangular(x: f64, y: f64, z: f64) -> Self {
        assert!(
            x > 0. && y > 0. && z > 0.,
            "Box edges must be > 0: ({x}, {y}, {z})"
        );

        Self::Rectangular {
            extent: Vec3::new(x, y, z),
        }
    }

    /// Minimum-image displacement from `x_j` to `x_i`, i.e. `x_i - x_j` mapped onto the closest
    /// periodic image.
    pub fn dx(&self, x_i: Vec3, x_j: Vec3) -> Vec3 {
        self.dx_with_shift(x_i, x_j).0
    }

    /// As `dx`, but also returns the index of the shift vector that maps `x_j`'s image
    /// onto the one closest to `x_i`.
    pub fn dx_with_shift(&self, x_i: Vec3, x_j: Vec3) -> (Vec3, usize) {
        let dv = x_i - x_j;

        match self {
            Self::None => (dv, CENTRAL_SHIFT_INDEX),
            Self::Rectangular { extent } => {
                let n_x = (dv.x / extent.x).round();
                let n_y = (dv.y / extent.y).round();
                let n_z = (dv.z / extent.z).round();

                let dx = Vec3::new(
                    dv.x - n_x * extent.x,
                    dv.y - n_y * extent.y,
                    dv.z - n_z * extent.z,
                );

                // We subtracted n box lengths; the shift applied is -n.
                let shift = shift_index(-n_x as i32, -n_y as i32, -n_z as i32);

                (dx, shift)
            }
        }
    }

    /// Wrap an absolute coordinate back into the unit cell, in [0, L) for each dimension.
    pub fn wrap(&self, p: Vec3) -> Vec3 {
        match self {
            Self::None => p,
            Self::Rectangular { extent } => Vec3::new(
                p.x.rem_euclid(extent.x),
                p.y.rem_euclid(extent.y),
                p.z.rem_euclid(extent.z),
            ),
        }
    }

    /// The lattice translation for shift index `i`. Zero for all indices without periodicity.
    pub fn shift_vector(&self, i: usize) -> Vec3 {
        match self {
            Self::None => Vec3::new_zero(),
            Self::Rectangular { extent } => {
                let n_x = (2 * SHIFT_RANGE_X + 1) as usize;
                let n_y = (2 * SHIFT_RANGE_Y + 1) as usize;

                let ix = (i % n_x) as i32 - SHIFT_RANGE_X;
                let iy = ((i / n_x) % n_y) as i32 - SHIFT_RANGE_Y;
                let iz = (i / (n_x * n_y)) as i32 - SHIFT_RANGE_Z;

                Vec3::new(
                    ix as f64 * extent.x,
                    iy as f64 * extent.y,
                    iz as f64 * extent.z,
                )
            }
        }
    }

    pub fn volume(&self) -> Option<f64> {
        match self {
            Self::None => None,
            Self::Rectangular { extent } => Some(extent.x * extent.y * extent.z),
        }
    }
}
