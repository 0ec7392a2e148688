//! A 3×3 tensor, used for the virial.

use std::ops::{Add, AddAssign, Index, IndexMut};

use lin_alg::f64::Vec3;

/// Row-major 3×3 tensor. Virial tensors are symmetric, but we store all 9 components so they
/// can be compared and printed like any other tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Tensor3(pub [[f64; 3]; 3]);

impl Tensor3 {
    pub const fn zero() -> Self {
        Self([[0.; 3]; 3])
    }

    /// a ⊗ b
    pub fn outer(a: Vec3, b: Vec3) -> Self {
        let a = [a.x, a.y, a.z];
        let b = [b.x, b.y, b.z];
        Self(std::array::from_fn(|i| std::array::from_fn(|j| a[i] * b[j])))
    }

    /// Build a symmetric tensor from its 6 unique components: `[XX, XY, XZ, YY, YZ, ZZ]`.
    pub fn from_symmetric(c: [f64; 6]) -> Self {
        Self([[c[0], c[1], c[2]], [c[1], c[3], c[4]], [c[2], c[4], c[5]]])
    }

    /// The 6 unique components of the upper triangle: `[XX, XY, XZ, YY, YZ, ZZ]`.
    pub fn to_symmetric(&self) -> [f64; 6] {
        let m = &self.0;
        [m[0][0], m[0][1], m[0][2], m[1][1], m[1][2], m[2][2]]
    }

    pub fn scaled(&self, s: f64) -> Self {
        Self(self.0.map(|row| row.map(|v| v * s)))
    }

    pub fn trace(&self) -> f64 {
        self.0[0][0] + self.0[1][1] + self.0[2][2]
    }

    /// Constraint solvers accumulate `Σ d · λ · n ⊗ n`, with λ a position-correction multiplier,
    /// in mass × length. The constraint force on atom i is `-λ n / dt²`, so its contribution to
    /// the virial, Ξ = -½ Σ r ⊗ F, is that sum times ½ / dt². The result is in mass × velocity²;
    /// scale by `ACCEL_CONVERSION_INV` for kcal/mol.
    pub fn constraint_virial_from_scaled(&self, dt: f64) -> Self {
        self.scaled(0.5 / (dt * dt))
    }

    /// Largest absolute component-wise difference.
    pub fn max_abs_diff(&self, other: &Self) -> f64 {
        let mut result: f64 = 0.;
        for i in 0..3 {
            for j in 0..3 {
                result = result.max((self.0[i][j] - other.0[i][j]).abs());
            }
        }
        result
    }
}

impl Index<(usize, usize)> for Tensor3 {
    type Output = f64;

    fn index(&self, (i, j): (usize, usize)) -> &f64 {
        &self.0[i][j]
    }
}

impl IndexMut<(usize, usize)> for Tensor3 {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f64 {
        &mut self.0[i][j]
    }
}

impl Add for Tensor3 {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl AddAssign for Tensor3 {
    fn add_assign(&mut self, rhs: Self) {
        for i in 0..3 {
            for j in 0..3 {
                self.0[i][j] += rhs.0[i][j];
            }
        }
    }
}
