// SPDX-License-Identifier: AGPL-3.0-only

//! Interval arithmetic for conservative trajectory bounds.
//!
//! A closed real interval `[lower, upper]` with elementary add/multiply, and
//! Horner evaluation of a Taylor polynomial over an interval argument. The
//! result of [`horner_eval`] bounds the polynomial value for every real
//! argument inside the input interval; callers widen the final bounds by one
//! ULP in each direction when narrowing to f32 (see the AABB kernel).
//!
//! NaN inputs are outside the contract of these helpers and are excluded
//! upstream by finiteness checks on substep times and state.

/// A closed interval of doubles with `lower <= upper`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ival {
    /// Lower endpoint.
    pub lower: f64,
    /// Upper endpoint.
    pub upper: f64,
}

impl Ival {
    /// Interval from explicit endpoints.
    #[must_use]
    pub const fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// Degenerate interval holding a single value.
    #[must_use]
    pub const fn point(value: f64) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }
}

impl std::ops::Add for Ival {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            lower: self.lower + rhs.lower,
            upper: self.upper + rhs.upper,
        }
    }
}

impl std::ops::Mul for Ival {
    type Output = Self;

    // All four endpoint products; min/max is fine since NaN is excluded.
    fn mul(self, rhs: Self) -> Self {
        let ll = self.lower * rhs.lower;
        let lu = self.lower * rhs.upper;
        let ul = self.upper * rhs.lower;
        let uu = self.upper * rhs.upper;

        Self {
            lower: ll.min(lu).min(ul.min(uu)),
            upper: ll.max(lu).max(ul.max(uu)),
        }
    }
}

/// Evaluate a Taylor polynomial over an interval argument.
///
/// `coeffs[o]` is the coefficient of power `o` (the propagator's layout:
/// `coeffs[0]` is the state value at the substep start). Horner recurrence:
/// `acc = c[O]; acc = c[o] + acc * h` for `o = O-1 .. 0`.
///
/// `coeffs` must be non-empty.
#[must_use]
pub fn horner_eval(coeffs: &[f64], h: Ival) -> Ival {
    debug_assert!(!coeffs.is_empty());

    let order = coeffs.len() - 1;
    let mut acc = Ival::point(coeffs[order]);
    for o in (0..order).rev() {
        acc = Ival::point(coeffs[o]) + acc * h;
    }
    acc
}
