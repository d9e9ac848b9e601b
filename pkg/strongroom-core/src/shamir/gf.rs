/*
 * strongroom: sealed key management for an encrypted secrets barrier
 * Copyright (C) 2018-2022 Aleksa Sarai <cyphar@cyphar.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use rand::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("[critical security issue] all points must have an invertible (non-zero) x value")]
    NonInvertiblePoint,
}

/// Primitive uint type for GfElems.
pub type GfElemPrimitive = u8;

/// A field element of `GF(2^8)`, with characteristic polynomial
/// `x^8 + x^4 + x^3 + x + 1` (the AES field).
///
/// Each byte of a shared secret is treated as an independent element, which
/// is what makes the share length equal to the secret length (plus one byte
/// for the x value).
// NOTE: PartialEq is not timing-safe.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GfElem(GfElemPrimitive);

/// (x, y) in GF.
pub type GfPoint = (GfElem, GfElem);

impl GfElem {
    // x^8 + x^4 + x^3 + x^1 + 1
    const POLYNOMIAL: u16 = 0b1_0001_1011;

    /// Additive identity.
    pub const ZERO: GfElem = GfElem(0);

    /// Multiplicative identity.
    pub const ONE: GfElem = GfElem(1);

    pub fn new_rand<R: CryptoRng + RngCore + ?Sized>(r: &mut R) -> Self {
        let mut byte = [0u8; 1];
        r.fill_bytes(&mut byte);
        Self(byte[0])
    }

    pub fn from_byte(v: GfElemPrimitive) -> Self {
        Self(v)
    }

    pub fn to_byte(self) -> GfElemPrimitive {
        self.0
    }

    // NOTE: Not constant-time in n, but n is never secret.
    pub fn pow(self, mut n: usize) -> Self {
        let mut mult = self;
        let mut result = Self::ONE;
        while n != 0 {
            if n & 1 == 1 {
                result *= mult;
            }
            mult *= mult;
            n >>= 1;
        }
        result
    }

    pub fn inverse(self) -> Option<Self> {
        match self {
            Self::ZERO => None,
            // The multiplicative group has order 2^8-1, so a^(2^8-2) is the
            // inverse. The exponent is fixed, so the sequence of operations
            // does not depend on the value being inverted.
            _ => Some(self.pow(254)),
        }
    }
}

impl Zeroize for GfElem {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for GfElem {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        Self(GfElemPrimitive::arbitrary(g))
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        Box::new(self.0.shrink().map(Self))
    }
}

impl Add for GfElem {
    type Output = Self;
    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl AddAssign for GfElem {
    fn add_assign(&mut self, rhs: Self) {
        // Addition in GF(2^n) is actually XOR.
        #![allow(clippy::suspicious_op_assign_impl)]
        self.0 ^= rhs.0
    }
}

impl Sub for GfElem {
    type Output = Self;
    fn sub(mut self, rhs: Self) -> Self::Output {
        self -= rhs;
        self
    }
}

impl SubAssign for GfElem {
    fn sub_assign(&mut self, rhs: Self) {
        // Subtraction in GF(2^n) is identical to addition.
        #![allow(clippy::suspicious_op_assign_impl)]
        *self += rhs
    }
}

impl Neg for GfElem {
    type Output = Self;
    fn neg(self) -> Self::Output {
        self
    }
}

impl Mul for GfElem {
    type Output = Self;
    fn mul(mut self, rhs: Self) -> Self::Output {
        self *= rhs;
        self
    }
}

impl MulAssign for GfElem {
    fn mul_assign(&mut self, rhs: Self) {
        // Russian Peasant Multiplication using masks rather than branches.
        //   <https://en.wikipedia.org/wiki/Finite_field_arithmetic#D_programming_example>
        let mut a = self.0 as u16;
        let mut b = rhs.0 as u16;
        let mut p: u16 = 0;
        for _ in 0..8 {
            p ^= a & (b & 1).wrapping_neg();
            let mask = ((a >> 7) & 1).wrapping_neg();
            a = (a << 1) ^ (Self::POLYNOMIAL & mask);
            b >>= 1;
        }

        // Save the product.
        self.0 = p as GfElemPrimitive;
    }
}

impl Div for GfElem {
    type Output = Self;
    fn div(mut self, rhs: Self) -> Self::Output {
        self /= rhs;
        self
    }
}

impl DivAssign for GfElem {
    fn div_assign(&mut self, rhs: Self) {
        #![allow(clippy::suspicious_op_assign_impl)]
        *self *= rhs.inverse().expect("rhs cannot be inverted")
    }
}

/// A polynomial in `GF(2^8)`.
// The coefficients are in *increasing* degree.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct GfPolynomial(Vec<GfElem>);

impl GfPolynomial {
    /// Generate a uniformly random polynomial of degree `n`.
    pub fn new_rand<R: CryptoRng + RngCore + ?Sized>(n: usize, r: &mut R) -> Self {
        Self((0..=n).map(|_| GfElem::new_rand(r)).collect::<Vec<_>>())
    }

    #[cfg(test)]
    pub fn degree(&self) -> usize {
        match self.0.len() {
            0 => panic!("GfPolynomial must have at least one element"),
            n => n - 1,
        }
    }

    /// Retreive the constant term of the polynomial.
    #[cfg(test)]
    pub fn constant(&self) -> GfElem {
        *self
            .0
            .first()
            .expect("GfPolynomial must have at least one element")
    }

    /// Yield a mutable reference to the constant term of the polynomial.
    ///
    /// This is how the secret byte is embedded into a freshly generated
    /// random polynomial.
    pub fn constant_mut(&mut self) -> &mut GfElem {
        self.0
            .first_mut()
            .expect("GfPolynomial must have at least one element")
    }

    /// Evaluate the polynomial at a given `x` value.
    pub fn evaluate(&self, x: GfElem) -> GfElem {
        // Horner's method, done in reverse because the coefficients are
        // stored in increasing order of degree.
        self.0
            .iter()
            .rev()
            .fold(GfElem::ZERO, |acc, coeff| *coeff + x * acc)
    }

    /// Interpolate the constant term of the polynomial passing through
    /// `points`, using [Lagrange interpolation][lagrange] evaluated at
    /// `x == 0`.
    ///
    /// The caller is responsible for supplying distinct x values. With fewer
    /// points than the degree of the original polynomial plus one the result
    /// is garbage rather than an error (there is no way to tell).
    ///
    /// [lagrange]: https://en.wikipedia.org/wiki/Lagrange_polynomial
    pub fn lagrange_constant<P: AsRef<[GfPoint]>>(points: P) -> Result<GfElem, Error> {
        let points = points.as_ref();
        let k = points.len();

        let (xs, ys): (Vec<_>, Vec<_>) = points.iter().copied().unzip();

        // Pre-invert all x values to avoid recalculating it k times.
        let xs_inv = xs
            .iter()
            .map(|x| x.inverse().ok_or(Error::NonInvertiblePoint))
            .collect::<Result<Vec<_>, _>>()?;

        // Substituting x=0 into the Lagrange basis polynomials and moving
        // everything into a single division per term gives
        //
        //   L(0) = \sum_{j=0}^{k} \frac{y_j}
        //                              {\prod_{m=0,m!=j}^{k}
        //                                    (1-\frac{x_j}{x_m})}
        //
        // Each denominator is non-zero as long as the x values are distinct.
        Ok((0..k).fold(GfElem::ZERO, |acc, j| {
            acc + ys[j]
                / (0..k)
                    .filter(|m| *m != j)
                    .fold(GfElem::ONE, |acc, m| {
                        acc * (GfElem::ONE - xs[j] * xs_inv[m])
                    })
        }))
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for GfPolynomial {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        // Keep the degree below the 255 distinct non-zero x values we have.
        let len = 1 + usize::arbitrary(g) % 64;
        GfPolynomial((0..len).map(|_| GfElem::arbitrary(g)).collect::<Vec<_>>())
    }
}
