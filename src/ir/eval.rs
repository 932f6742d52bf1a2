//! Concrete evaluation of pure operations
//!
//! Shared by constant folding and the reference interpreter so both agree on
//! what an operation computes. Only operations that need no heap are covered;
//! anything else (or a division by zero) yields `None`.

use super::opcode::Opcode;
use super::operation::Const;

fn shift_count(b: i64) -> Option<u32> {
    if (0..64).contains(&b) {
        Some(b as u32)
    } else {
        None
    }
}

/// Evaluate an overflow-checked operation, `None` on overflow
pub fn eval_ovf(opcode: Opcode, a: i64, b: i64) -> Option<i64> {
    match opcode {
        Opcode::IntAddOvf => a.checked_add(b),
        Opcode::IntSubOvf => a.checked_sub(b),
        Opcode::IntMulOvf => a.checked_mul(b),
        _ => None,
    }
}

fn eval_int2(opcode: Opcode, a: i64, b: i64) -> Option<i64> {
    let v = match opcode {
        Opcode::IntAdd => a.wrapping_add(b),
        Opcode::IntSub => a.wrapping_sub(b),
        Opcode::IntMul => a.wrapping_mul(b),
        Opcode::IntFloordiv => {
            if b == 0 {
                return None;
            }
            a.wrapping_div(b)
        }
        Opcode::IntMod => {
            if b == 0 {
                return None;
            }
            a.wrapping_rem(b)
        }
        Opcode::UintFloordiv => {
            if b == 0 {
                return None;
            }
            ((a as u64) / (b as u64)) as i64
        }
        Opcode::IntAnd => a & b,
        Opcode::IntOr => a | b,
        Opcode::IntXor => a ^ b,
        Opcode::IntLshift => a.wrapping_shl(shift_count(b)?),
        Opcode::IntRshift => a >> shift_count(b)?,
        Opcode::UintRshift => ((a as u64) >> shift_count(b)?) as i64,
        Opcode::IntSignext => {
            let bits = match b {
                1 | 2 | 4 => b * 8,
                8 => return Some(a),
                _ => return None,
            } as u32;
            let shift = 64 - bits;
            (a << shift) >> shift
        }
        Opcode::IntLt => (a < b) as i64,
        Opcode::IntLe => (a <= b) as i64,
        Opcode::IntEq => (a == b) as i64,
        Opcode::IntNe => (a != b) as i64,
        Opcode::IntGt => (a > b) as i64,
        Opcode::IntGe => (a >= b) as i64,
        Opcode::UintLt => ((a as u64) < (b as u64)) as i64,
        Opcode::UintLe => ((a as u64) <= (b as u64)) as i64,
        Opcode::UintGt => ((a as u64) > (b as u64)) as i64,
        Opcode::UintGe => ((a as u64) >= (b as u64)) as i64,
        _ => return None,
    };
    Some(v)
}

fn eval_float2(opcode: Opcode, a: f64, b: f64) -> Option<Const> {
    let c = match opcode {
        Opcode::FloatAdd => Const::float(a + b),
        Opcode::FloatSub => Const::float(a - b),
        Opcode::FloatMul => Const::float(a * b),
        Opcode::FloatTruediv => Const::float(a / b),
        Opcode::FloatLt => Const::Int((a < b) as i64),
        Opcode::FloatLe => Const::Int((a <= b) as i64),
        Opcode::FloatEq => Const::Int((a == b) as i64),
        Opcode::FloatNe => Const::Int((a != b) as i64),
        Opcode::FloatGt => Const::Int((a > b) as i64),
        Opcode::FloatGe => Const::Int((a >= b) as i64),
        _ => return None,
    };
    Some(c)
}

/// Evaluate a heap-free pure operation on constant arguments
pub fn eval_pure(opcode: Opcode, args: &[Const]) -> Option<Const> {
    match args {
        [a] => match (opcode, a) {
            (Opcode::SameAs, c) => Some(*c),
            (Opcode::IntNeg, Const::Int(v)) => Some(Const::Int(v.wrapping_neg())),
            (Opcode::IntInvert, Const::Int(v)) => Some(Const::Int(!v)),
            (Opcode::IntIsTrue, Const::Int(v)) => Some(Const::Int((*v != 0) as i64)),
            (Opcode::IntIsZero, Const::Int(v)) => Some(Const::Int((*v == 0) as i64)),
            (Opcode::IntForceGeZero, Const::Int(v)) => Some(Const::Int((*v).max(0))),
            (Opcode::FloatNeg, Const::Float(_)) => a.as_float().map(|f| Const::float(-f)),
            (Opcode::FloatAbs, Const::Float(_)) => a.as_float().map(|f| Const::float(f.abs())),
            (Opcode::CastFloatToInt, Const::Float(_)) => a.as_float().map(|f| Const::Int(f as i64)),
            (Opcode::CastIntToFloat, Const::Int(v)) => Some(Const::float(*v as f64)),
            _ => None,
        },
        [a, b] => match (a, b) {
            (Const::Int(x), Const::Int(y)) => eval_int2(opcode, *x, *y).map(Const::Int),
            (Const::Float(_), Const::Float(_)) => eval_float2(opcode, a.as_float()?, b.as_float()?),
            _ => match opcode {
                Opcode::PtrEq | Opcode::InstancePtrEq => Some(Const::Int((a == b) as i64)),
                Opcode::PtrNe | Opcode::InstancePtrNe => Some(Const::Int((a != b) as i64)),
                _ => None,
            },
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arith() {
        assert_eq!(eval_pure(Opcode::IntAdd, &[Const::Int(2), Const::Int(3)]), Some(Const::Int(5)));
        assert_eq!(eval_pure(Opcode::IntFloordiv, &[Const::Int(-7), Const::Int(2)]), Some(Const::Int(-3)));
        assert_eq!(eval_pure(Opcode::IntMod, &[Const::Int(-7), Const::Int(2)]), Some(Const::Int(-1)));
        assert_eq!(eval_pure(Opcode::IntFloordiv, &[Const::Int(1), Const::Int(0)]), None);
        assert_eq!(eval_pure(Opcode::IntLshift, &[Const::Int(1), Const::Int(64)]), None);
        assert_eq!(eval_pure(Opcode::IntSignext, &[Const::Int(0xff), Const::Int(1)]), Some(Const::Int(-1)));
        assert_eq!(
            eval_pure(Opcode::UintRshift, &[Const::Int(-1), Const::Int(60)]),
            Some(Const::Int(15))
        );
    }

    #[test]
    fn test_ovf() {
        assert_eq!(eval_ovf(Opcode::IntAddOvf, i64::MAX, 1), None);
        assert_eq!(eval_ovf(Opcode::IntMulOvf, 3, 4), Some(12));
    }

    #[test]
    fn test_float_and_ptr() {
        assert_eq!(
            eval_pure(Opcode::FloatMul, &[Const::float(1.5), Const::float(2.0)]),
            Some(Const::float(3.0))
        );
        assert_eq!(eval_pure(Opcode::PtrEq, &[Const::NULL, Const::Ptr(8)]), Some(Const::Int(0)));
        assert_eq!(eval_pure(Opcode::GetfieldGcPure, &[Const::Ptr(8)]), None);
    }
}
