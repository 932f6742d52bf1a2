//! Abstract values tracked per box

use super::intutils::IntBound;
use super::virtuals::VirtualId;
use crate::error::{OptError, Result};
use crate::ir::{BoxKind, Const, Descr, Operand};
use serde::{Deserialize, Serialize};

/// Index of a value in the optimizer's value arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How much is known about a value, ordered by information content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    Unknown,
    NonNull,
    KnownClass,
    Constant,
}

/// Whether a length bound talks about an array or a string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LenMode {
    Array,
    Str,
}

/// Known bounds on the length of an array or string value
#[derive(Debug, Clone, PartialEq)]
pub struct LenBound {
    pub mode: LenMode,
    pub descr: Option<Descr>,
    pub bound: IntBound,
}

/// The lattice entry for one value
#[derive(Debug, Clone)]
pub struct OptValue {
    /// Current representative: a constant iff `level == Constant`
    pub operand: Operand,
    pub level: Level,
    pub known_class: Option<i64>,
    pub intbound: IntBound,
    pub lenbound: Option<LenBound>,
    /// Set while (or after) this value stands for an unmaterialized allocation
    pub virt: Option<VirtualId>,
    /// Output index of the last guard_nonnull/guard_class on this value
    pub last_guard: Option<usize>,
}

impl OptValue {
    pub fn new(operand: Operand) -> Self {
        let mut value = Self {
            operand,
            level: Level::Unknown,
            known_class: None,
            intbound: IntBound::unbounded(),
            lenbound: None,
            virt: None,
            last_guard: None,
        };
        if let Operand::Const(c) = operand {
            value.level = Level::Constant;
            if let Const::Int(v) = c {
                value.intbound = IntBound::from_constant(v);
            }
        }
        value
    }

    pub fn kind(&self) -> BoxKind {
        self.operand.kind()
    }

    pub fn is_constant(&self) -> bool {
        self.level == Level::Constant
    }

    pub fn get_constant(&self) -> Option<Const> {
        if self.is_constant() {
            self.operand.as_const()
        } else {
            None
        }
    }

    pub fn get_constant_int(&self) -> Option<i64> {
        self.get_constant().and_then(|c| c.as_int())
    }

    /// Known to be the null pointer / the integer zero
    pub fn is_null(&self) -> bool {
        match self.get_constant() {
            Some(c) => !c.nonnull(),
            None => false,
        }
    }

    /// Known to be non-null / nonzero
    pub fn is_nonnull(&self) -> bool {
        match self.level {
            Level::Constant => self.get_constant().map(|c| c.nonnull()).unwrap_or(false),
            Level::NonNull | Level::KnownClass => true,
            Level::Unknown => self.kind() == BoxKind::Int && !self.intbound.contains(0),
        }
    }

    pub fn make_nonnull(&mut self) {
        if self.level < Level::NonNull {
            self.level = Level::NonNull;
        }
    }

    pub fn get_constant_class(&self) -> Option<i64> {
        if self.level >= Level::KnownClass {
            self.known_class
        } else {
            None
        }
    }

    pub fn make_constant_class(&mut self, class: i64) {
        if self.level < Level::KnownClass {
            self.level = Level::KnownClass;
        }
        self.known_class = Some(class);
    }

    /// Collapse to a constant; fails when the bounds already exclude it
    pub fn make_constant(&mut self, c: Const) -> Result<()> {
        if let Some(old) = self.get_constant() {
            if !old.same_constant(&c) {
                return Err(OptError::invalid_loop(format!(
                    "value {} cannot also be {}",
                    old, c
                )));
            }
            return Ok(());
        }
        if let Const::Int(v) = c {
            if !self.intbound.contains(v) {
                return Err(OptError::invalid_loop(format!(
                    "constant {} outside bound {}",
                    v, self.intbound
                )));
            }
            self.intbound = IntBound::from_constant(v);
        }
        if c.kind() == BoxKind::Ptr && !c.nonnull() && self.level >= Level::NonNull {
            return Err(OptError::invalid_loop("non-null value cannot be NULL"));
        }
        self.operand = Operand::Const(c);
        self.level = Level::Constant;
        Ok(())
    }

    /// Raise the length bound to `> value`
    pub fn make_len_gt(&mut self, mode: LenMode, descr: Option<Descr>, value: i64) -> Result<()> {
        match &mut self.lenbound {
            Some(lb) => {
                lb.bound.make_gt_const(value)?;
            }
            None => {
                let mut bound = IntBound::nonnegative();
                bound.make_gt_const(value)?;
                self.lenbound = Some(LenBound { mode, descr, bound });
            }
        }
        Ok(())
    }

    /// Merge facts known about the same runtime value from another run
    pub fn import_facts(&mut self, other: &OptValue) -> Result<()> {
        if let Some(c) = other.get_constant() {
            return self.make_constant(c);
        }
        if other.level >= Level::NonNull {
            self.make_nonnull();
        }
        if let Some(class) = other.get_constant_class() {
            self.make_constant_class(class);
        }
        if self.kind() == BoxKind::Int {
            self.intbound.intersect(&other.intbound)?;
        }
        if self.lenbound.is_none() {
            self.lenbound = other.lenbound.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BoxRef;

    #[test]
    fn test_constant_invariant() {
        let v = OptValue::new(Operand::int(3));
        assert!(v.is_constant());
        assert_eq!(v.intbound, IntBound::from_constant(3));
        let mut b = OptValue::new(Operand::Box(BoxRef::int(1)));
        assert_eq!(b.level, Level::Unknown);
        b.make_constant(Const::Int(5)).unwrap();
        assert_eq!(b.operand, Operand::int(5));
        assert!(b.make_constant(Const::Int(6)).is_err());
    }

    #[test]
    fn test_nonnull_from_bounds() {
        let mut v = OptValue::new(Operand::Box(BoxRef::int(1)));
        assert!(!v.is_nonnull());
        v.intbound = IntBound::new(1, 10);
        assert!(v.is_nonnull());
        assert!(v.make_constant(Const::Int(0)).is_err());
    }

    #[test]
    fn test_class_levels() {
        let mut v = OptValue::new(Operand::Box(BoxRef::ptr(1)));
        v.make_nonnull();
        assert_eq!(v.get_constant_class(), None);
        v.make_constant_class(0x40);
        assert_eq!(v.level, Level::KnownClass);
        assert_eq!(v.get_constant_class(), Some(0x40));
        assert!(v.make_constant(Const::NULL).is_err());
    }

    #[test]
    fn test_lenbound() {
        let mut v = OptValue::new(Operand::Box(BoxRef::ptr(1)));
        v.make_len_gt(LenMode::Array, None, 3).unwrap();
        let lb = v.lenbound.clone().unwrap();
        assert_eq!(lb.bound, IntBound::lower_bounded(4));
        v.make_len_gt(LenMode::Array, None, 1).unwrap();
        assert_eq!(v.lenbound.unwrap().bound, IntBound::lower_bounded(4));
    }

    #[test]
    fn test_import_facts() {
        let mut src = OptValue::new(Operand::Box(BoxRef::int(1)));
        src.intbound = IntBound::new(0, 9);
        let mut dst = OptValue::new(Operand::Box(BoxRef::int(7)));
        dst.import_facts(&src).unwrap();
        assert_eq!(dst.intbound, IntBound::new(0, 9));
    }
}
