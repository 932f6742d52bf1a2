//! Boxes, constants and operations
//!
//! A box is an SSA value identity: defined once by the operation naming it as
//! result, referenced any number of times afterwards, never reassigned.
//! Constants are immediates that can stand wherever a box can.

use super::descr::Descr;
use super::opcode::Opcode;
use crate::opt::resume::ResumeData;
use serde::{Deserialize, Serialize};

/// Machine-level kind of a box or constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BoxKind {
    Int,
    Ptr,
    Float,
}

impl BoxKind {
    /// Name prefix used by the trace format
    pub fn prefix(&self) -> char {
        match self {
            BoxKind::Int => 'i',
            BoxKind::Ptr => 'p',
            BoxKind::Float => 'f',
        }
    }

    /// Kind for a box name prefix
    pub fn from_prefix(c: char) -> Option<BoxKind> {
        match c {
            'i' => Some(BoxKind::Int),
            'p' => Some(BoxKind::Ptr),
            'f' => Some(BoxKind::Float),
            _ => None,
        }
    }

    /// The zero value of this kind (what fresh allocations contain)
    pub fn default_const(&self) -> Const {
        match self {
            BoxKind::Int => Const::Int(0),
            BoxKind::Ptr => Const::NULL,
            BoxKind::Float => Const::float(0.0),
        }
    }
}

/// An SSA value identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoxRef {
    pub id: u32,
    pub kind: BoxKind,
}

impl BoxRef {
    pub fn new(id: u32, kind: BoxKind) -> Self {
        Self { id, kind }
    }

    pub fn int(id: u32) -> Self {
        Self::new(id, BoxKind::Int)
    }

    pub fn ptr(id: u32) -> Self {
        Self::new(id, BoxKind::Ptr)
    }
}

impl std::fmt::Display for BoxRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.id)
    }
}

/// An immediate value
///
/// Floats are stored as their bit pattern so constants can be hashed and
/// compared exactly, which the pure-operation memo relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Const {
    Int(i64),
    Ptr(u64),
    Float(u64),
}

/// Integer zero
pub const CONST_0: Const = Const::Int(0);
/// Integer one
pub const CONST_1: Const = Const::Int(1);

impl Const {
    /// The null pointer
    pub const NULL: Const = Const::Ptr(0);

    pub fn float(value: f64) -> Self {
        Const::Float(value.to_bits())
    }

    pub fn kind(&self) -> BoxKind {
        match self {
            Const::Int(_) => BoxKind::Int,
            Const::Ptr(_) => BoxKind::Ptr,
            Const::Float(_) => BoxKind::Float,
        }
    }

    /// Integer payload
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Const::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float payload
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Const::Float(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    /// Address payload
    pub fn as_ptr(&self) -> Option<u64> {
        match self {
            Const::Ptr(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Nonzero / non-null test
    pub fn nonnull(&self) -> bool {
        match self {
            Const::Int(v) => *v != 0,
            Const::Ptr(addr) => *addr != 0,
            Const::Float(bits) => f64::from_bits(*bits) != 0.0,
        }
    }

    /// Same constant, comparing value rather than representation for floats
    pub fn same_constant(&self, other: &Const) -> bool {
        match (self, other) {
            (Const::Float(a), Const::Float(b)) => f64::from_bits(*a) == f64::from_bits(*b) || a == b,
            _ => self == other,
        }
    }
}

impl std::fmt::Display for Const {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Const::Int(v) => write!(f, "{}", v),
            Const::Ptr(0) => write!(f, "NULL"),
            Const::Ptr(addr) => write!(f, "ConstPtr({})", addr),
            Const::Float(bits) => {
                let v = f64::from_bits(*bits);
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
        }
    }
}

/// An operation argument: either a box or a constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operand {
    Box(BoxRef),
    Const(Const),
}

impl Operand {
    pub fn int(value: i64) -> Self {
        Operand::Const(Const::Int(value))
    }

    pub fn as_box(&self) -> Option<BoxRef> {
        match self {
            Operand::Box(b) => Some(*b),
            Operand::Const(_) => None,
        }
    }

    pub fn as_const(&self) -> Option<Const> {
        match self {
            Operand::Const(c) => Some(*c),
            Operand::Box(_) => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Operand::Const(_))
    }

    /// Integer payload of a constant operand
    pub fn const_int(&self) -> Option<i64> {
        self.as_const().and_then(|c| c.as_int())
    }

    pub fn kind(&self) -> BoxKind {
        match self {
            Operand::Box(b) => b.kind,
            Operand::Const(c) => c.kind(),
        }
    }
}

impl From<BoxRef> for Operand {
    fn from(b: BoxRef) -> Self {
        Operand::Box(b)
    }
}

impl From<Const> for Operand {
    fn from(c: Const) -> Self {
        Operand::Const(c)
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Box(b) => write!(f, "{}", b),
            Operand::Const(c) => write!(f, "{}", c),
        }
    }
}

/// One trace operation
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub opcode: Opcode,
    pub args: Vec<Operand>,
    pub result: Option<BoxRef>,
    /// Identity-compared field/array/call/target token
    pub descr: Option<Descr>,
    /// Live boxes for a guard bailout (guards only)
    pub fail_args: Option<Vec<Operand>>,
    /// Frozen resume description, filled in when a guard is emitted
    pub resume: Option<Box<ResumeData>>,
}

impl Op {
    /// Create an operation without descr
    pub fn new(opcode: Opcode, args: Vec<Operand>, result: Option<BoxRef>) -> Self {
        Self {
            opcode,
            args,
            result,
            descr: None,
            fail_args: if opcode.is_guard() { Some(Vec::new()) } else { None },
            resume: None,
        }
    }

    /// Set the descr
    pub fn with_descr(mut self, descr: Descr) -> Self {
        self.descr = Some(descr);
        self
    }

    /// Set the fail-argument list
    pub fn with_fail_args(mut self, fail_args: Vec<Operand>) -> Self {
        self.fail_args = Some(fail_args);
        self
    }

    pub fn arg(&self, index: usize) -> Operand {
        self.args[index]
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn is_guard(&self) -> bool {
        self.opcode.is_guard()
    }

    /// Copy with a different opcode and argument list, keeping result and descr
    pub fn copy_and_change(&self, opcode: Opcode, args: Vec<Operand>) -> Op {
        let mut op = self.clone();
        op.opcode = opcode;
        op.args = args;
        if !opcode.is_guard() {
            op.fail_args = None;
            op.resume = None;
        } else if op.fail_args.is_none() {
            op.fail_args = Some(Vec::new());
        }
        op
    }

    /// Every box this operation reads (arguments and fail-arguments)
    pub fn used_boxes(&self) -> impl Iterator<Item = BoxRef> + '_ {
        self.args
            .iter()
            .chain(self.fail_args.iter().flatten())
            .filter_map(|a| a.as_box())
    }
}

/// Hands out fresh box identities for one compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoxAllocator {
    next: u32,
}

impl BoxAllocator {
    /// Start allocating after `max_used`
    pub fn after(max_used: u32) -> Self {
        Self { next: max_used + 1 }
    }

    /// Allocate a fresh box of the given kind
    pub fn fresh(&mut self, kind: BoxKind) -> BoxRef {
        let id = self.next;
        self.next += 1;
        BoxRef::new(id, kind)
    }

    /// Make sure future boxes do not collide with `id`
    pub fn reserve(&mut self, id: u32) {
        if id >= self.next {
            self.next = id + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_display() {
        assert_eq!(Const::Int(-3).to_string(), "-3");
        assert_eq!(Const::NULL.to_string(), "NULL");
        assert_eq!(Const::Ptr(16).to_string(), "ConstPtr(16)");
        assert_eq!(Const::float(1.5).to_string(), "1.5");
        assert_eq!(Const::float(2.0).to_string(), "2.0");
    }

    #[test]
    fn test_const_nonnull() {
        assert!(!Const::NULL.nonnull());
        assert!(Const::Ptr(8).nonnull());
        assert!(!CONST_0.nonnull());
        assert!(CONST_1.nonnull());
    }

    #[test]
    fn test_box_allocator() {
        let mut alloc = BoxAllocator::after(10);
        assert_eq!(alloc.fresh(BoxKind::Int), BoxRef::int(11));
        alloc.reserve(40);
        assert_eq!(alloc.fresh(BoxKind::Ptr), BoxRef::ptr(41));
    }

    #[test]
    fn test_guard_gets_fail_args() {
        let op = Op::new(Opcode::GuardTrue, vec![Operand::Box(BoxRef::int(1))], None);
        assert_eq!(op.fail_args, Some(vec![]));
        let op = op.copy_and_change(Opcode::IntIsTrue, vec![Operand::int(1)]);
        assert_eq!(op.fail_args, None);
    }
}
