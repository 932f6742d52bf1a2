//! Integer interval domain
//!
//! An `IntBound` is a closed interval `[lower, upper]` whose ends may be
//! open (unbounded). Transfer functions never wrap: when a bound would
//! overflow the signed 64-bit range that side becomes unbounded instead.

use crate::error::{OptError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer interval with optional ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntBound {
    pub lower: i64,
    pub upper: i64,
    pub has_lower: bool,
    pub has_upper: bool,
}

/// Smallest `2^k - 1` that is `>= n` (for `n >= 0`)
pub fn next_pow2_m1(mut n: i64) -> i64 {
    if n < 0 {
        return -1;
    }
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    n |= n >> 32;
    n
}

impl IntBound {
    /// Bounded on both sides
    pub fn new(lower: i64, upper: i64) -> Self {
        Self {
            lower,
            upper,
            has_lower: true,
            has_upper: true,
        }
    }

    /// Every integer
    pub fn unbounded() -> Self {
        Self {
            lower: i64::MIN,
            upper: i64::MAX,
            has_lower: false,
            has_upper: false,
        }
    }

    pub fn from_constant(value: i64) -> Self {
        Self::new(value, value)
    }

    pub fn lower_bounded(lower: i64) -> Self {
        Self {
            lower,
            upper: i64::MAX,
            has_lower: true,
            has_upper: false,
        }
    }

    pub fn upper_bounded(upper: i64) -> Self {
        Self {
            lower: i64::MIN,
            upper,
            has_lower: false,
            has_upper: true,
        }
    }

    pub fn nonnegative() -> Self {
        Self::lower_bounded(0)
    }

    /// Both ends known
    pub fn bounded(&self) -> bool {
        self.has_lower && self.has_upper
    }

    pub fn is_constant(&self) -> bool {
        self.bounded() && self.lower == self.upper
    }

    pub fn get_constant(&self) -> Option<i64> {
        if self.is_constant() {
            Some(self.lower)
        } else {
            None
        }
    }

    /// Effective upper end (`i64::MAX` when open)
    fn hi(&self) -> i64 {
        if self.has_upper {
            self.upper
        } else {
            i64::MAX
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        (!self.has_lower || value >= self.lower) && (!self.has_upper || value <= self.upper)
    }

    /// Every value of `other` is a value of `self`
    pub fn contains_bound(&self, other: &IntBound) -> bool {
        if other.has_lower {
            if !self.contains(other.lower) {
                return false;
            }
        } else if self.has_lower {
            return false;
        }
        if other.has_upper {
            if !self.contains(other.upper) {
                return false;
            }
        } else if self.has_upper {
            return false;
        }
        true
    }

    // ==================== Tightening ====================

    /// Intersect in place; an empty result means the trace cannot run
    pub fn intersect(&mut self, other: &IntBound) -> Result<bool> {
        let mut changed = false;
        if other.has_lower && (!self.has_lower || other.lower > self.lower) {
            self.lower = other.lower;
            self.has_lower = true;
            changed = true;
        }
        if other.has_upper && (!self.has_upper || other.upper < self.upper) {
            self.upper = other.upper;
            self.has_upper = true;
            changed = true;
        }
        if self.bounded() && self.lower > self.upper {
            return Err(OptError::invalid_loop(format!(
                "empty integer interval [{}, {}]",
                self.lower, self.upper
            )));
        }
        Ok(changed)
    }

    pub fn make_le_const(&mut self, value: i64) -> Result<bool> {
        self.intersect(&IntBound::upper_bounded(value))
    }

    pub fn make_lt_const(&mut self, value: i64) -> Result<bool> {
        match value.checked_sub(1) {
            Some(v) => self.make_le_const(v),
            None => Err(OptError::invalid_loop("value below i64::MIN")),
        }
    }

    pub fn make_ge_const(&mut self, value: i64) -> Result<bool> {
        self.intersect(&IntBound::lower_bounded(value))
    }

    pub fn make_gt_const(&mut self, value: i64) -> Result<bool> {
        match value.checked_add(1) {
            Some(v) => self.make_ge_const(v),
            None => Err(OptError::invalid_loop("value above i64::MAX")),
        }
    }

    /// `self <= other` is now known
    pub fn make_le(&mut self, other: &IntBound) -> Result<bool> {
        if other.has_upper {
            self.make_le_const(other.upper)
        } else {
            Ok(false)
        }
    }

    /// `self < other` is now known
    pub fn make_lt(&mut self, other: &IntBound) -> Result<bool> {
        if other.has_upper {
            self.make_lt_const(other.upper)
        } else {
            Ok(false)
        }
    }

    /// `self >= other` is now known
    pub fn make_ge(&mut self, other: &IntBound) -> Result<bool> {
        if other.has_lower {
            self.make_ge_const(other.lower)
        } else {
            Ok(false)
        }
    }

    /// `self > other` is now known
    pub fn make_gt(&mut self, other: &IntBound) -> Result<bool> {
        if other.has_lower {
            self.make_gt_const(other.lower)
        } else {
            Ok(false)
        }
    }

    /// `self != value` is now known; only shrinks when `value` is an end
    pub fn make_ne_const(&mut self, value: i64) -> Result<bool> {
        if self.has_lower && self.lower == value {
            return self.make_gt_const(value);
        }
        if self.has_upper && self.upper == value {
            return self.make_lt_const(value);
        }
        Ok(false)
    }

    // ==================== Comparisons ====================

    pub fn known_lt(&self, other: &IntBound) -> bool {
        self.has_upper && other.has_lower && self.upper < other.lower
    }

    pub fn known_le(&self, other: &IntBound) -> bool {
        self.has_upper && other.has_lower && self.upper <= other.lower
    }

    pub fn known_gt(&self, other: &IntBound) -> bool {
        other.known_lt(self)
    }

    pub fn known_ge(&self, other: &IntBound) -> bool {
        other.known_le(self)
    }

    /// The intervals do not overlap
    pub fn known_ne(&self, other: &IntBound) -> bool {
        self.known_lt(other) || self.known_gt(other)
    }

    pub fn known_nonnegative(&self) -> bool {
        self.has_lower && self.lower >= 0
    }

    // ==================== Transfer Functions ====================

    pub fn add(&self, value: i64) -> IntBound {
        self.add_bound(&IntBound::from_constant(value))
    }

    pub fn add_bound(&self, other: &IntBound) -> IntBound {
        let mut res = IntBound::unbounded();
        if self.has_lower && other.has_lower {
            if let Some(v) = self.lower.checked_add(other.lower) {
                res.lower = v;
                res.has_lower = true;
            }
        }
        if self.has_upper && other.has_upper {
            if let Some(v) = self.upper.checked_add(other.upper) {
                res.upper = v;
                res.has_upper = true;
            }
        }
        res
    }

    /// `self + other` provably stays in range
    pub fn add_bound_cannot_overflow(&self, other: &IntBound) -> bool {
        self.bounded()
            && other.bounded()
            && self.lower.checked_add(other.lower).is_some()
            && self.upper.checked_add(other.upper).is_some()
    }

    pub fn sub_bound(&self, other: &IntBound) -> IntBound {
        let mut res = IntBound::unbounded();
        if self.has_lower && other.has_upper {
            if let Some(v) = self.lower.checked_sub(other.upper) {
                res.lower = v;
                res.has_lower = true;
            }
        }
        if self.has_upper && other.has_lower {
            if let Some(v) = self.upper.checked_sub(other.lower) {
                res.upper = v;
                res.has_upper = true;
            }
        }
        res
    }

    pub fn sub_bound_cannot_overflow(&self, other: &IntBound) -> bool {
        self.bounded()
            && other.bounded()
            && self.lower.checked_sub(other.upper).is_some()
            && self.upper.checked_sub(other.lower).is_some()
    }

    fn corners(&self, other: &IntBound, f: impl Fn(i64, i64) -> Option<i64>) -> Option<IntBound> {
        if !self.bounded() || !other.bounded() {
            return None;
        }
        let vals = [
            f(self.lower, other.lower)?,
            f(self.lower, other.upper)?,
            f(self.upper, other.lower)?,
            f(self.upper, other.upper)?,
        ];
        let lo = vals.iter().copied().min()?;
        let hi = vals.iter().copied().max()?;
        Some(IntBound::new(lo, hi))
    }

    pub fn mul_bound(&self, other: &IntBound) -> IntBound {
        self.corners(other, |a, b| a.checked_mul(b))
            .unwrap_or_else(IntBound::unbounded)
    }

    pub fn mul_bound_cannot_overflow(&self, other: &IntBound) -> bool {
        self.corners(other, |a, b| a.checked_mul(b)).is_some()
    }

    /// Truncating division
    pub fn div_bound(&self, other: &IntBound) -> IntBound {
        if other.contains(0) {
            return IntBound::unbounded();
        }
        self.corners(other, |a, b| a.checked_div(b))
            .unwrap_or_else(IntBound::unbounded)
    }

    /// Remainder with the sign of the dividend
    pub fn mod_bound(&self, other: &IntBound) -> IntBound {
        if !other.bounded() || other.contains(0) {
            let mut r = IntBound::unbounded();
            if self.known_nonnegative() {
                r = IntBound::lower_bounded(0);
                if self.has_upper {
                    r.upper = self.upper;
                    r.has_upper = true;
                }
            }
            return r;
        }
        // |x % y| < |y|
        let max_abs = other.lower.unsigned_abs().max(other.upper.unsigned_abs()) - 1;
        let m = i64::try_from(max_abs).unwrap_or(i64::MAX);
        if self.known_nonnegative() {
            let upper = if self.has_upper { m.min(self.upper) } else { m };
            IntBound::new(0, upper)
        } else if self.has_upper && self.upper <= 0 {
            let lower = if self.has_lower { (-m).max(self.lower) } else { -m };
            IntBound::new(lower, 0)
        } else {
            IntBound::new(-m, m)
        }
    }

    pub fn lshift_bound(&self, other: &IntBound) -> IntBound {
        if !(other.bounded() && other.lower >= 0 && other.upper < 64) {
            return IntBound::unbounded();
        }
        let shl = |a: i64, b: i64| {
            let r = a.checked_shl(b as u32)?;
            if (r >> b) == a {
                Some(r)
            } else {
                None
            }
        };
        self.corners(other, shl).unwrap_or_else(IntBound::unbounded)
    }

    pub fn lshift_bound_cannot_overflow(&self, other: &IntBound) -> bool {
        let b = self.lshift_bound(other);
        b.bounded()
    }

    /// Arithmetic right shift
    pub fn rshift_bound(&self, other: &IntBound) -> IntBound {
        if !(other.bounded() && other.lower >= 0 && other.upper < 64) {
            return IntBound::unbounded();
        }
        let mut res = IntBound::unbounded();
        if self.has_lower {
            res.lower = (self.lower >> other.lower).min(self.lower >> other.upper);
            res.has_lower = true;
        }
        if self.has_upper {
            res.upper = (self.upper >> other.lower).max(self.upper >> other.upper);
            res.has_upper = true;
        }
        res
    }

    /// Unsigned right shift
    pub fn urshift_bound(&self, other: &IntBound) -> IntBound {
        if other.bounded() && other.lower > 0 && other.upper < 64 {
            return IntBound::new(0, (u64::MAX >> other.lower) as i64);
        }
        if other.is_constant() && other.lower == 0 {
            return *self;
        }
        if self.known_nonnegative() && other.known_nonnegative() {
            return IntBound::new(0, self.hi());
        }
        IntBound::unbounded()
    }

    pub fn and_bound(&self, other: &IntBound) -> IntBound {
        let mut res = IntBound::unbounded();
        if let Some(val) = other.get_constant() {
            if val >= 0 {
                res = IntBound::new(0, val);
            }
        } else if let Some(val) = self.get_constant() {
            if val >= 0 {
                res = IntBound::new(0, val);
            }
        } else if self.known_nonnegative() && other.known_nonnegative() {
            let lesser = self.hi().min(other.hi());
            res = IntBound::new(0, next_pow2_m1(lesser));
        }
        res
    }

    /// Bound for both `int_or` and `int_xor`
    pub fn or_bound(&self, other: &IntBound) -> IntBound {
        if self.known_nonnegative() && other.known_nonnegative() && self.has_upper && other.has_upper
        {
            let most_significant = self.upper | other.upper;
            return IntBound::new(0, next_pow2_m1(most_significant));
        }
        IntBound::unbounded()
    }

    pub fn neg_bound(&self) -> IntBound {
        let mut res = IntBound::unbounded();
        if self.has_upper {
            if let Some(v) = self.upper.checked_neg() {
                res.lower = v;
                res.has_lower = true;
            }
        }
        if self.has_lower {
            if let Some(v) = self.lower.checked_neg() {
                res.upper = v;
                res.has_upper = true;
            }
        }
        res
    }

    pub fn invert_bound(&self) -> IntBound {
        let mut res = IntBound::unbounded();
        if self.has_upper {
            res.lower = !self.upper;
            res.has_lower = true;
        }
        if self.has_lower {
            res.upper = !self.lower;
            res.has_upper = true;
        }
        res
    }

    /// Drop ends beyond `limit` in magnitude
    pub fn kill_huge(&mut self, limit: i64) {
        if self.has_lower && self.lower < -limit {
            self.has_lower = false;
            self.lower = i64::MIN;
        }
        if self.has_upper && self.upper > limit {
            self.has_upper = false;
            self.upper = i64::MAX;
        }
    }
}

impl Default for IntBound {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl fmt::Display for IntBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lo = if self.has_lower {
            self.lower.to_string()
        } else {
            "-Inf".to_string()
        };
        let hi = if self.has_upper {
            self.upper.to_string()
        } else {
            "Inf".to_string()
        };
        write!(f, "[{}, {}]", lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(lo: Option<i64>, hi: Option<i64>) -> IntBound {
        let mut b = IntBound::unbounded();
        if let Some(l) = lo {
            b.lower = l;
            b.has_lower = true;
        }
        if let Some(h) = hi {
            b.upper = h;
            b.has_upper = true;
        }
        b
    }

    #[test]
    fn test_contains() {
        let b = IntBound::new(0, 10);
        assert!(b.contains(0));
        assert!(b.contains(10));
        assert!(!b.contains(11));
        assert!(IntBound::unbounded().contains(i64::MIN));
        assert!(IntBound::unbounded().contains_bound(&b));
        assert!(!b.contains_bound(&IntBound::unbounded()));
        assert!(b.contains_bound(&IntBound::new(3, 4)));
    }

    #[test]
    fn test_known_comparisons() {
        let a = IntBound::new(0, 5);
        let b = IntBound::new(6, 10);
        assert!(a.known_lt(&b));
        assert!(b.known_gt(&a));
        assert!(!a.known_ge(&b));
        assert!(a.known_le(&IntBound::new(5, 7)));
        assert!(!a.known_lt(&IntBound::new(5, 7)));
        assert!(!IntBound::unbounded().known_lt(&b));
    }

    #[test]
    fn test_intersect_reports_change_and_emptiness() {
        let mut a = IntBound::unbounded();
        assert!(a.intersect(&IntBound::new(0, 10)).unwrap());
        assert!(!a.intersect(&IntBound::new(-5, 20)).unwrap());
        assert_eq!(a, IntBound::new(0, 10));
        assert!(a.intersect(&IntBound::new(11, 12)).is_err());
    }

    #[test]
    fn test_add_overflow_degrades_to_unbounded() {
        let a = IntBound::new(0, i64::MAX);
        let r = a.add(1);
        assert!(r.has_lower);
        assert_eq!(r.lower, 1);
        assert!(!r.has_upper);
        assert!(!a.add_bound_cannot_overflow(&IntBound::from_constant(1)));
        assert!(IntBound::new(0, 10).add_bound_cannot_overflow(&IntBound::new(-3, 3)));
    }

    #[test]
    fn test_sub_and_mul() {
        let a = IntBound::new(0, 10);
        let b = IntBound::new(2, 3);
        assert_eq!(a.sub_bound(&b), IntBound::new(-3, 8));
        assert_eq!(a.mul_bound(&b), IntBound::new(0, 30));
        assert_eq!(bound(Some(-2), Some(3)).mul_bound(&IntBound::new(-4, 5)), IntBound::new(-12, 15));
        assert_eq!(IntBound::new(i64::MAX / 2, i64::MAX).mul_bound(&b), IntBound::unbounded());
    }

    #[test]
    fn test_div_truncates() {
        let a = IntBound::new(-7, 7);
        assert_eq!(a.div_bound(&IntBound::from_constant(2)), IntBound::new(-3, 3));
        assert_eq!(a.div_bound(&IntBound::new(-1, 1)), IntBound::unbounded());
    }

    #[test]
    fn test_mod_bound() {
        let a = IntBound::new(0, 100);
        assert_eq!(a.mod_bound(&IntBound::from_constant(8)), IntBound::new(0, 7));
        let b = IntBound::unbounded();
        assert_eq!(b.mod_bound(&IntBound::from_constant(8)), IntBound::new(-7, 7));
        assert_eq!(IntBound::new(0, 3).mod_bound(&IntBound::from_constant(8)), IntBound::new(0, 3));
    }

    #[test]
    fn test_shifts() {
        let a = IntBound::new(1, 4);
        assert_eq!(a.lshift_bound(&IntBound::from_constant(2)), IntBound::new(4, 16));
        assert_eq!(a.rshift_bound(&IntBound::from_constant(1)), IntBound::new(0, 2));
        let big = IntBound::new(0, i64::MAX);
        assert_eq!(big.lshift_bound(&IntBound::from_constant(1)), IntBound::unbounded());
        assert!(IntBound::unbounded().urshift_bound(&IntBound::from_constant(1)).known_nonnegative());
    }

    #[test]
    fn test_bitwise() {
        assert_eq!(next_pow2_m1(5), 7);
        assert_eq!(next_pow2_m1(8), 15);
        assert_eq!(next_pow2_m1(0), 0);
        let a = IntBound::new(0, 100);
        assert_eq!(a.and_bound(&IntBound::from_constant(15)), IntBound::new(0, 15));
        assert_eq!(a.or_bound(&IntBound::new(0, 3)), IntBound::new(0, 127));
        assert_eq!(IntBound::unbounded().or_bound(&a), IntBound::unbounded());
    }

    #[test]
    fn test_neg_invert() {
        assert_eq!(IntBound::new(-3, 5).neg_bound(), IntBound::new(-5, 3));
        let r = IntBound::new(i64::MIN, 0).neg_bound();
        assert!(!r.has_upper);
        assert_eq!(IntBound::new(0, 5).invert_bound(), IntBound::new(-6, -1));
    }

    #[test]
    fn test_make_lt_gt() {
        let mut a = IntBound::unbounded();
        a.make_lt(&IntBound::from_constant(10)).unwrap();
        assert_eq!(a, IntBound::upper_bounded(9));
        a.make_ge_const(3).unwrap();
        assert_eq!(a, IntBound::new(3, 9));
        a.make_ne_const(3).unwrap();
        assert_eq!(a, IntBound::new(4, 9));
        assert!(a.make_gt_const(9).is_err());
    }

    #[test]
    fn test_kill_huge() {
        let mut a = IntBound::new(-5, i64::MAX - 3);
        a.kill_huge(i64::MAX / 2);
        assert!(a.has_lower);
        assert!(!a.has_upper);
    }

    #[test]
    fn test_display() {
        assert_eq!(IntBound::new(0, 3).to_string(), "[0, 3]");
        assert_eq!(IntBound::lower_bounded(1).to_string(), "[1, Inf]");
    }
}
