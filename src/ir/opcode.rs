//! Trace operation opcodes
//!
//! The instruction set recorded by the tracer. Opcodes are grouped by the
//! properties the optimizer cares about: guards, always-pure arithmetic,
//! side-effect-free heap reads, allocations, heap writes and calls.

use super::operation::BoxKind;
use serde::{Deserialize, Serialize};

/// How many arguments an opcode accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == *k,
            Arity::AtLeast(k) => n >= *k,
        }
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Exact(1) => write!(f, "1 argument"),
            Arity::Exact(k) => write!(f, "{} arguments", k),
            Arity::AtLeast(k) => write!(f, "at least {} arguments", k),
        }
    }
}

/// Trace opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    // ========== Control ==========
    /// Back-edge to a loop header (or into another loop)
    Jump,
    /// Loop header; its descr is the jump target
    Label,
    /// Leave compiled code
    Finish,

    // ========== Foldable Guards ==========
    GuardTrue,
    GuardFalse,
    GuardValue,
    GuardClass,
    GuardNonnull,
    GuardIsnull,
    GuardNonnullClass,

    // ========== Other Guards ==========
    GuardNoException,
    GuardException,
    GuardNoOverflow,
    GuardOverflow,
    GuardNotForced,
    GuardNotInvalidated,

    // ========== Integer Arithmetic ==========
    IntAdd,
    IntSub,
    IntMul,
    IntFloordiv,
    IntMod,
    IntAnd,
    IntOr,
    IntXor,
    IntRshift,
    IntLshift,
    UintRshift,
    UintFloordiv,
    IntNeg,
    IntInvert,
    IntForceGeZero,
    /// Sign-extend the low `arg1` bytes of `arg0`
    IntSignext,

    // ========== Integer Comparisons ==========
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    UintLt,
    UintLe,
    UintGt,
    UintGe,
    IntIsZero,
    IntIsTrue,

    // ========== Floats ==========
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatTruediv,
    FloatNeg,
    FloatAbs,
    FloatLt,
    FloatLe,
    FloatEq,
    FloatNe,
    FloatGt,
    FloatGe,
    CastFloatToInt,
    CastIntToFloat,

    // ========== Pointers ==========
    PtrEq,
    PtrNe,
    InstancePtrEq,
    InstancePtrNe,
    SameAs,

    // ========== Overflow-checked Arithmetic ==========
    IntAddOvf,
    IntSubOvf,
    IntMulOvf,

    // ========== Heap Reads ==========
    GetfieldGc,
    GetfieldGcPure,
    GetfieldRaw,
    GetarrayitemGc,
    GetarrayitemGcPure,
    GetinteriorfieldGc,
    ArraylenGc,
    Strlen,
    Strgetitem,

    // ========== Allocation ==========
    New,
    NewWithVtable,
    NewArray,
    Newstr,

    // ========== Heap Writes ==========
    SetfieldGc,
    SetfieldRaw,
    SetarrayitemGc,
    SetinteriorfieldGc,
    Strsetitem,
    /// copystrcontent(src, dst, srcstart, dststart, length)
    Copystrcontent,

    // ========== Calls ==========
    Call,
    CallPure,
    CallMayForce,
    CallLoopinvariant,
    /// cond_call(cond, func, args...): call only when cond is true
    CondCall,

    // ========== Hints & Bookkeeping ==========
    QuasiimmutField,
    RecordKnownClass,
    VirtualRef,
    VirtualRefFinish,
    DebugMergePoint,
    ForceToken,
    /// Makes its arguments escape; behaves like an opaque call
    Escape,
}

impl Opcode {
    /// Every opcode, in declaration order
    pub const ALL: &'static [Opcode] = &[
        Opcode::Jump,
        Opcode::Label,
        Opcode::Finish,
        Opcode::GuardTrue,
        Opcode::GuardFalse,
        Opcode::GuardValue,
        Opcode::GuardClass,
        Opcode::GuardNonnull,
        Opcode::GuardIsnull,
        Opcode::GuardNonnullClass,
        Opcode::GuardNoException,
        Opcode::GuardException,
        Opcode::GuardNoOverflow,
        Opcode::GuardOverflow,
        Opcode::GuardNotForced,
        Opcode::GuardNotInvalidated,
        Opcode::IntAdd,
        Opcode::IntSub,
        Opcode::IntMul,
        Opcode::IntFloordiv,
        Opcode::IntMod,
        Opcode::IntAnd,
        Opcode::IntOr,
        Opcode::IntXor,
        Opcode::IntRshift,
        Opcode::IntLshift,
        Opcode::UintRshift,
        Opcode::UintFloordiv,
        Opcode::IntNeg,
        Opcode::IntInvert,
        Opcode::IntForceGeZero,
        Opcode::IntSignext,
        Opcode::IntLt,
        Opcode::IntLe,
        Opcode::IntEq,
        Opcode::IntNe,
        Opcode::IntGt,
        Opcode::IntGe,
        Opcode::UintLt,
        Opcode::UintLe,
        Opcode::UintGt,
        Opcode::UintGe,
        Opcode::IntIsZero,
        Opcode::IntIsTrue,
        Opcode::FloatAdd,
        Opcode::FloatSub,
        Opcode::FloatMul,
        Opcode::FloatTruediv,
        Opcode::FloatNeg,
        Opcode::FloatAbs,
        Opcode::FloatLt,
        Opcode::FloatLe,
        Opcode::FloatEq,
        Opcode::FloatNe,
        Opcode::FloatGt,
        Opcode::FloatGe,
        Opcode::CastFloatToInt,
        Opcode::CastIntToFloat,
        Opcode::PtrEq,
        Opcode::PtrNe,
        Opcode::InstancePtrEq,
        Opcode::InstancePtrNe,
        Opcode::SameAs,
        Opcode::IntAddOvf,
        Opcode::IntSubOvf,
        Opcode::IntMulOvf,
        Opcode::GetfieldGc,
        Opcode::GetfieldGcPure,
        Opcode::GetfieldRaw,
        Opcode::GetarrayitemGc,
        Opcode::GetarrayitemGcPure,
        Opcode::GetinteriorfieldGc,
        Opcode::ArraylenGc,
        Opcode::Strlen,
        Opcode::Strgetitem,
        Opcode::New,
        Opcode::NewWithVtable,
        Opcode::NewArray,
        Opcode::Newstr,
        Opcode::SetfieldGc,
        Opcode::SetfieldRaw,
        Opcode::SetarrayitemGc,
        Opcode::SetinteriorfieldGc,
        Opcode::Strsetitem,
        Opcode::Copystrcontent,
        Opcode::Call,
        Opcode::CallPure,
        Opcode::CallMayForce,
        Opcode::CallLoopinvariant,
        Opcode::CondCall,
        Opcode::QuasiimmutField,
        Opcode::RecordKnownClass,
        Opcode::VirtualRef,
        Opcode::VirtualRefFinish,
        Opcode::DebugMergePoint,
        Opcode::ForceToken,
        Opcode::Escape,
    ];

    /// Textual name used by the trace format
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Jump => "jump",
            Opcode::Label => "label",
            Opcode::Finish => "finish",
            Opcode::GuardTrue => "guard_true",
            Opcode::GuardFalse => "guard_false",
            Opcode::GuardValue => "guard_value",
            Opcode::GuardClass => "guard_class",
            Opcode::GuardNonnull => "guard_nonnull",
            Opcode::GuardIsnull => "guard_isnull",
            Opcode::GuardNonnullClass => "guard_nonnull_class",
            Opcode::GuardNoException => "guard_no_exception",
            Opcode::GuardException => "guard_exception",
            Opcode::GuardNoOverflow => "guard_no_overflow",
            Opcode::GuardOverflow => "guard_overflow",
            Opcode::GuardNotForced => "guard_not_forced",
            Opcode::GuardNotInvalidated => "guard_not_invalidated",
            Opcode::IntAdd => "int_add",
            Opcode::IntSub => "int_sub",
            Opcode::IntMul => "int_mul",
            Opcode::IntFloordiv => "int_floordiv",
            Opcode::IntMod => "int_mod",
            Opcode::IntAnd => "int_and",
            Opcode::IntOr => "int_or",
            Opcode::IntXor => "int_xor",
            Opcode::IntRshift => "int_rshift",
            Opcode::IntLshift => "int_lshift",
            Opcode::UintRshift => "uint_rshift",
            Opcode::UintFloordiv => "uint_floordiv",
            Opcode::IntNeg => "int_neg",
            Opcode::IntInvert => "int_invert",
            Opcode::IntForceGeZero => "int_force_ge_zero",
            Opcode::IntSignext => "int_signext",
            Opcode::IntLt => "int_lt",
            Opcode::IntLe => "int_le",
            Opcode::IntEq => "int_eq",
            Opcode::IntNe => "int_ne",
            Opcode::IntGt => "int_gt",
            Opcode::IntGe => "int_ge",
            Opcode::UintLt => "uint_lt",
            Opcode::UintLe => "uint_le",
            Opcode::UintGt => "uint_gt",
            Opcode::UintGe => "uint_ge",
            Opcode::IntIsZero => "int_is_zero",
            Opcode::IntIsTrue => "int_is_true",
            Opcode::FloatAdd => "float_add",
            Opcode::FloatSub => "float_sub",
            Opcode::FloatMul => "float_mul",
            Opcode::FloatTruediv => "float_truediv",
            Opcode::FloatNeg => "float_neg",
            Opcode::FloatAbs => "float_abs",
            Opcode::FloatLt => "float_lt",
            Opcode::FloatLe => "float_le",
            Opcode::FloatEq => "float_eq",
            Opcode::FloatNe => "float_ne",
            Opcode::FloatGt => "float_gt",
            Opcode::FloatGe => "float_ge",
            Opcode::CastFloatToInt => "cast_float_to_int",
            Opcode::CastIntToFloat => "cast_int_to_float",
            Opcode::PtrEq => "ptr_eq",
            Opcode::PtrNe => "ptr_ne",
            Opcode::InstancePtrEq => "instance_ptr_eq",
            Opcode::InstancePtrNe => "instance_ptr_ne",
            Opcode::SameAs => "same_as",
            Opcode::IntAddOvf => "int_add_ovf",
            Opcode::IntSubOvf => "int_sub_ovf",
            Opcode::IntMulOvf => "int_mul_ovf",
            Opcode::GetfieldGc => "getfield_gc",
            Opcode::GetfieldGcPure => "getfield_gc_pure",
            Opcode::GetfieldRaw => "getfield_raw",
            Opcode::GetarrayitemGc => "getarrayitem_gc",
            Opcode::GetarrayitemGcPure => "getarrayitem_gc_pure",
            Opcode::GetinteriorfieldGc => "getinteriorfield_gc",
            Opcode::ArraylenGc => "arraylen_gc",
            Opcode::Strlen => "strlen",
            Opcode::Strgetitem => "strgetitem",
            Opcode::New => "new",
            Opcode::NewWithVtable => "new_with_vtable",
            Opcode::NewArray => "new_array",
            Opcode::Newstr => "newstr",
            Opcode::SetfieldGc => "setfield_gc",
            Opcode::SetfieldRaw => "setfield_raw",
            Opcode::SetarrayitemGc => "setarrayitem_gc",
            Opcode::SetinteriorfieldGc => "setinteriorfield_gc",
            Opcode::Strsetitem => "strsetitem",
            Opcode::Copystrcontent => "copystrcontent",
            Opcode::Call => "call",
            Opcode::CallPure => "call_pure",
            Opcode::CallMayForce => "call_may_force",
            Opcode::CallLoopinvariant => "call_loopinvariant",
            Opcode::CondCall => "cond_call",
            Opcode::QuasiimmutField => "quasiimmut_field",
            Opcode::RecordKnownClass => "record_known_class",
            Opcode::VirtualRef => "virtual_ref",
            Opcode::VirtualRefFinish => "virtual_ref_finish",
            Opcode::DebugMergePoint => "debug_merge_point",
            Opcode::ForceToken => "force_token",
            Opcode::Escape => "escape",
        }
    }

    /// Look an opcode up by its textual name
    pub fn from_name(name: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// Check if this is a guard
    pub fn is_guard(&self) -> bool {
        matches!(
            self,
            Opcode::GuardTrue
                | Opcode::GuardFalse
                | Opcode::GuardValue
                | Opcode::GuardClass
                | Opcode::GuardNonnull
                | Opcode::GuardIsnull
                | Opcode::GuardNonnullClass
                | Opcode::GuardNoException
                | Opcode::GuardException
                | Opcode::GuardNoOverflow
                | Opcode::GuardOverflow
                | Opcode::GuardNotForced
                | Opcode::GuardNotInvalidated
        )
    }

    /// Guards whose outcome depends only on their arguments
    pub fn is_foldable_guard(&self) -> bool {
        matches!(
            self,
            Opcode::GuardTrue
                | Opcode::GuardFalse
                | Opcode::GuardValue
                | Opcode::GuardClass
                | Opcode::GuardNonnull
                | Opcode::GuardIsnull
                | Opcode::GuardNonnullClass
        )
    }

    /// Result determined solely by the arguments and the descr
    pub fn is_always_pure(&self) -> bool {
        matches!(
            self,
            Opcode::IntAdd
                | Opcode::IntSub
                | Opcode::IntMul
                | Opcode::IntFloordiv
                | Opcode::IntMod
                | Opcode::IntAnd
                | Opcode::IntOr
                | Opcode::IntXor
                | Opcode::IntRshift
                | Opcode::IntLshift
                | Opcode::UintRshift
                | Opcode::UintFloordiv
                | Opcode::IntNeg
                | Opcode::IntInvert
                | Opcode::IntForceGeZero
                | Opcode::IntSignext
                | Opcode::IntLt
                | Opcode::IntLe
                | Opcode::IntEq
                | Opcode::IntNe
                | Opcode::IntGt
                | Opcode::IntGe
                | Opcode::UintLt
                | Opcode::UintLe
                | Opcode::UintGt
                | Opcode::UintGe
                | Opcode::IntIsZero
                | Opcode::IntIsTrue
                | Opcode::FloatAdd
                | Opcode::FloatSub
                | Opcode::FloatMul
                | Opcode::FloatTruediv
                | Opcode::FloatNeg
                | Opcode::FloatAbs
                | Opcode::FloatLt
                | Opcode::FloatLe
                | Opcode::FloatEq
                | Opcode::FloatNe
                | Opcode::FloatGt
                | Opcode::FloatGe
                | Opcode::CastFloatToInt
                | Opcode::CastIntToFloat
                | Opcode::PtrEq
                | Opcode::PtrNe
                | Opcode::InstancePtrEq
                | Opcode::InstancePtrNe
                | Opcode::SameAs
                | Opcode::GetfieldGcPure
                | Opcode::GetarrayitemGcPure
                | Opcode::ArraylenGc
                | Opcode::Strlen
                | Opcode::Strgetitem
        )
    }

    /// No visible effect on the heap or on control flow
    pub fn has_no_side_effect(&self) -> bool {
        self.is_always_pure()
            || matches!(
                self,
                Opcode::GetfieldGc
                    | Opcode::GetfieldRaw
                    | Opcode::GetarrayitemGc
                    | Opcode::GetinteriorfieldGc
                    | Opcode::New
                    | Opcode::NewWithVtable
                    | Opcode::NewArray
                    | Opcode::Newstr
                    | Opcode::ForceToken
                    | Opcode::VirtualRef
            )
    }

    /// Overflow-checked arithmetic, always followed by an overflow guard
    pub fn is_ovf(&self) -> bool {
        matches!(self, Opcode::IntAddOvf | Opcode::IntSubOvf | Opcode::IntMulOvf)
    }

    /// The non-checked version of an overflow-checked opcode
    pub fn without_ovf(&self) -> Opcode {
        match self {
            Opcode::IntAddOvf => Opcode::IntAdd,
            Opcode::IntSubOvf => Opcode::IntSub,
            Opcode::IntMulOvf => Opcode::IntMul,
            other => *other,
        }
    }

    /// Check if this is any kind of call
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Opcode::Call
                | Opcode::CallPure
                | Opcode::CallMayForce
                | Opcode::CallLoopinvariant
                | Opcode::CondCall
        )
    }

    /// Allocation opcodes
    pub fn is_malloc(&self) -> bool {
        matches!(
            self,
            Opcode::New | Opcode::NewWithVtable | Opcode::NewArray | Opcode::Newstr
        )
    }

    /// Ends a trace
    pub fn is_final(&self) -> bool {
        matches!(self, Opcode::Jump | Opcode::Finish)
    }

    /// Produces a 0/1 integer
    pub fn returns_bool_result(&self) -> bool {
        matches!(
            self,
            Opcode::IntLt
                | Opcode::IntLe
                | Opcode::IntEq
                | Opcode::IntNe
                | Opcode::IntGt
                | Opcode::IntGe
                | Opcode::UintLt
                | Opcode::UintLe
                | Opcode::UintGt
                | Opcode::UintGe
                | Opcode::IntIsZero
                | Opcode::IntIsTrue
                | Opcode::FloatLt
                | Opcode::FloatLe
                | Opcode::FloatEq
                | Opcode::FloatNe
                | Opcode::FloatGt
                | Opcode::FloatGe
                | Opcode::PtrEq
                | Opcode::PtrNe
                | Opcode::InstancePtrEq
                | Opcode::InstancePtrNe
        )
    }

    /// `op(a, b) == !inverse(a, b)`
    pub fn bool_inverse(&self) -> Option<Opcode> {
        let inv = match self {
            Opcode::IntLt => Opcode::IntGe,
            Opcode::IntGe => Opcode::IntLt,
            Opcode::IntLe => Opcode::IntGt,
            Opcode::IntGt => Opcode::IntLe,
            Opcode::IntEq => Opcode::IntNe,
            Opcode::IntNe => Opcode::IntEq,
            Opcode::UintLt => Opcode::UintGe,
            Opcode::UintGe => Opcode::UintLt,
            Opcode::UintLe => Opcode::UintGt,
            Opcode::UintGt => Opcode::UintLe,
            Opcode::FloatEq => Opcode::FloatNe,
            Opcode::FloatNe => Opcode::FloatEq,
            Opcode::PtrEq => Opcode::PtrNe,
            Opcode::PtrNe => Opcode::PtrEq,
            _ => return None,
        };
        Some(inv)
    }

    /// `op(a, b) == reflex(b, a)`
    pub fn bool_reflex(&self) -> Option<Opcode> {
        let refl = match self {
            Opcode::IntLt => Opcode::IntGt,
            Opcode::IntGt => Opcode::IntLt,
            Opcode::IntLe => Opcode::IntGe,
            Opcode::IntGe => Opcode::IntLe,
            Opcode::IntEq => Opcode::IntEq,
            Opcode::IntNe => Opcode::IntNe,
            Opcode::UintLt => Opcode::UintGt,
            Opcode::UintGt => Opcode::UintLt,
            Opcode::UintLe => Opcode::UintGe,
            Opcode::UintGe => Opcode::UintLe,
            Opcode::FloatLt => Opcode::FloatGt,
            Opcode::FloatGt => Opcode::FloatLt,
            Opcode::FloatLe => Opcode::FloatGe,
            Opcode::FloatGe => Opcode::FloatLe,
            Opcode::FloatEq => Opcode::FloatEq,
            Opcode::FloatNe => Opcode::FloatNe,
            Opcode::PtrEq => Opcode::PtrEq,
            Opcode::PtrNe => Opcode::PtrNe,
            _ => return None,
        };
        Some(refl)
    }

    /// Number of arguments the operation takes
    pub fn arity(&self) -> Arity {
        match self {
            Opcode::Jump
            | Opcode::Label
            | Opcode::Finish
            | Opcode::DebugMergePoint
            | Opcode::Escape => Arity::AtLeast(0),
            Opcode::Call | Opcode::CallPure | Opcode::CallMayForce | Opcode::CallLoopinvariant => {
                Arity::AtLeast(1)
            }
            Opcode::CondCall => Arity::AtLeast(2),
            Opcode::GuardNoException
            | Opcode::GuardNoOverflow
            | Opcode::GuardOverflow
            | Opcode::GuardNotForced
            | Opcode::GuardNotInvalidated
            | Opcode::New
            | Opcode::ForceToken => Arity::Exact(0),
            Opcode::GuardTrue
            | Opcode::GuardFalse
            | Opcode::GuardNonnull
            | Opcode::GuardIsnull
            | Opcode::GuardException
            | Opcode::IntNeg
            | Opcode::IntInvert
            | Opcode::IntForceGeZero
            | Opcode::IntIsZero
            | Opcode::IntIsTrue
            | Opcode::FloatNeg
            | Opcode::FloatAbs
            | Opcode::CastFloatToInt
            | Opcode::CastIntToFloat
            | Opcode::SameAs
            | Opcode::GetfieldGc
            | Opcode::GetfieldGcPure
            | Opcode::GetfieldRaw
            | Opcode::ArraylenGc
            | Opcode::Strlen
            | Opcode::NewWithVtable
            | Opcode::NewArray
            | Opcode::Newstr
            | Opcode::QuasiimmutField => Arity::Exact(1),
            Opcode::SetarrayitemGc | Opcode::SetinteriorfieldGc | Opcode::Strsetitem => Arity::Exact(3),
            Opcode::Copystrcontent => Arity::Exact(5),
            _ => Arity::Exact(2),
        }
    }

    /// Result kind for opcodes whose result type does not depend on a descr
    pub fn fixed_result_kind(&self) -> Option<BoxKind> {
        if self.returns_bool_result() {
            return Some(BoxKind::Int);
        }
        match self {
            Opcode::IntAdd
            | Opcode::IntSub
            | Opcode::IntMul
            | Opcode::IntFloordiv
            | Opcode::IntMod
            | Opcode::IntAnd
            | Opcode::IntOr
            | Opcode::IntXor
            | Opcode::IntRshift
            | Opcode::IntLshift
            | Opcode::UintRshift
            | Opcode::UintFloordiv
            | Opcode::IntNeg
            | Opcode::IntInvert
            | Opcode::IntForceGeZero
            | Opcode::IntSignext
            | Opcode::IntAddOvf
            | Opcode::IntSubOvf
            | Opcode::IntMulOvf
            | Opcode::CastFloatToInt
            | Opcode::ArraylenGc
            | Opcode::Strlen
            | Opcode::Strgetitem => Some(BoxKind::Int),
            Opcode::FloatAdd
            | Opcode::FloatSub
            | Opcode::FloatMul
            | Opcode::FloatTruediv
            | Opcode::FloatNeg
            | Opcode::FloatAbs
            | Opcode::CastIntToFloat => Some(BoxKind::Float),
            Opcode::New
            | Opcode::NewWithVtable
            | Opcode::NewArray
            | Opcode::Newstr
            | Opcode::ForceToken
            | Opcode::VirtualRef => Some(BoxKind::Ptr),
            _ => None,
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_name(op.name()), Some(*op), "{}", op.name());
        }
        assert_eq!(Opcode::from_name("int_frobnicate"), None);
    }

    #[test]
    fn test_guard_classes() {
        assert!(Opcode::GuardTrue.is_foldable_guard());
        assert!(Opcode::GuardNoOverflow.is_guard());
        assert!(!Opcode::GuardNoOverflow.is_foldable_guard());
        assert!(!Opcode::IntAdd.is_guard());
    }

    #[test]
    fn test_purity() {
        assert!(Opcode::IntAdd.is_always_pure());
        assert!(!Opcode::IntAddOvf.is_always_pure());
        assert!(Opcode::GetfieldGc.has_no_side_effect());
        assert!(!Opcode::GetfieldGc.is_always_pure());
        assert!(!Opcode::SetfieldGc.has_no_side_effect());
        assert!(!Opcode::Call.has_no_side_effect());
    }

    #[test]
    fn test_arity() {
        assert!(Opcode::IntAdd.arity().accepts(2));
        assert!(!Opcode::IntAdd.arity().accepts(1));
        assert!(!Opcode::GetfieldGc.arity().accepts(0));
        assert!(Opcode::Call.arity().accepts(3));
        assert!(!Opcode::Call.arity().accepts(0));
        assert!(Opcode::Jump.arity().accepts(0));
        assert_eq!(Opcode::Copystrcontent.arity(), Arity::Exact(5));
        assert_eq!(Opcode::SetfieldGc.arity().to_string(), "2 arguments");
    }

    #[test]
    fn test_bool_inverse_and_reflex() {
        assert_eq!(Opcode::IntLt.bool_inverse(), Some(Opcode::IntGe));
        assert_eq!(Opcode::IntLt.bool_reflex(), Some(Opcode::IntGt));
        assert_eq!(Opcode::IntAdd.bool_inverse(), None);
        for op in Opcode::ALL {
            if let Some(inv) = op.bool_inverse() {
                assert_eq!(inv.bool_inverse(), Some(*op));
            }
        }
    }
}
