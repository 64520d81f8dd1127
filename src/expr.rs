// expr.rs -- Typed, immutable expression trees for stage definitions.
//
// A stage is a pure function of its coordinates. Its body is an `Expr`:
// constants, the stage's own dimension variables, calls into other stages
// or input buffers, casts, arithmetic and clamps.
//
// SCALAR SEMANTICS:
//   Every value is carried as f64 at runtime, but each node has a static
//   `ScalarType` and results are folded back into that type after every
//   operation:
//     - integer ops wrap to the type's width (u8 255 + 1 == 0)
//     - integer division floors, and x / 0 == 0
//     - float ops run in f32, so results match f32 arithmetic bit for bit
//     - float -> int casts round to nearest and saturate
//     - int -> int casts wrap
//
// TYPE PROMOTION:
//   A literal (`2`, `255.0`) adopts the type of the other operand, except
//   that a float literal next to an integer operand promotes to F32.
//   Otherwise floats win, then the wider integer type.
//
// NEW RUST CONCEPTS:
// - Blanket operator impls (`impl<R: Into<Expr>> Add<R> for Expr`) so
//   `x + 1`, `x + y` and `x + 0.5` all work with one impl per operator.
// - `Box<Expr>` for recursive enums: the compiler needs a known size.

use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

// ---------------------------------------------------------------------------
// Scalar types
// ---------------------------------------------------------------------------

/// Static element type of an expression or buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    U8,
    U16,
    I32,
    F32,
}

impl ScalarType {
    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::F32)
    }

    /// Width in bits.
    pub fn bits(self) -> u32 {
        match self {
            ScalarType::U8 => 8,
            ScalarType::U16 => 16,
            ScalarType::I32 | ScalarType::F32 => 32,
        }
    }

    /// Size of one element in bytes.
    pub fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Smallest representable value (`-inf` for floats).
    pub fn min_value(self) -> f64 {
        match self {
            ScalarType::U8 | ScalarType::U16 => 0.0,
            ScalarType::I32 => i32::MIN as f64,
            ScalarType::F32 => f64::NEG_INFINITY,
        }
    }

    /// Largest representable value (`+inf` for floats).
    pub fn max_value(self) -> f64 {
        match self {
            ScalarType::U8 => u8::MAX as f64,
            ScalarType::U16 => u16::MAX as f64,
            ScalarType::I32 => i32::MAX as f64,
            ScalarType::F32 => f64::INFINITY,
        }
    }

    /// Fold an integer result back into this type (two's-complement wrap).
    #[inline]
    pub fn wrap(self, v: i64) -> f64 {
        match self {
            ScalarType::U8 => (v as u8) as f64,
            ScalarType::U16 => (v as u16) as f64,
            ScalarType::I32 => (v as i32) as f64,
            ScalarType::F32 => (v as f32) as f64,
        }
    }

    /// Convert a value of type `from` into this type.
    #[inline]
    pub fn cast_from(self, from: ScalarType, v: f64) -> f64 {
        if self.is_float() {
            return (v as f32) as f64;
        }
        if from.is_float() {
            // `as` saturates and maps NaN to 0.
            let r = v.round();
            return match self {
                ScalarType::U8 => (r as u8) as f64,
                ScalarType::U16 => (r as u16) as f64,
                _ => (r as i32) as f64,
            };
        }
        self.wrap(v as i64)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::U8 => "u8",
            ScalarType::U16 => "u16",
            ScalarType::I32 => "i32",
            ScalarType::F32 => "f32",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Expression tree
// ---------------------------------------------------------------------------

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Pow,
}

impl BinOp {
    /// Apply the operator in type `ty`.
    #[inline]
    pub fn apply(self, ty: ScalarType, a: f64, b: f64) -> f64 {
        if ty.is_float() {
            let (a, b) = (a as f32, b as f32);
            let r = match self {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Min => a.min(b),
                BinOp::Max => a.max(b),
                BinOp::Pow => a.powf(b),
            };
            return r as f64;
        }
        let (a, b) = (a as i64, b as i64);
        let r = match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => floor_div(a, b),
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
            BinOp::Pow => (a as f64).powf(b as f64) as i64,
        };
        ty.wrap(r)
    }
}

/// Integer division rounding toward negative infinity; division by zero is 0.
#[inline]
pub fn floor_div(a: i64, b: i64) -> i64 {
    if b == 0 {
        return 0;
    }
    let q = a.wrapping_div(b);
    if a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// An expression node.
///
/// `Var` nodes name a dimension of the stage being defined; the graph
/// builder resolves them to positional `Dim` nodes when the definition is
/// attached.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const {
        value: f64,
        ty: ScalarType,
        /// Literals adopt the type of the operand they are combined with.
        literal: bool,
    },
    Var(String),
    Dim(usize),
    Call {
        func: usize,
        ty: ScalarType,
        args: Vec<Expr>,
    },
    Input {
        input: usize,
        ty: ScalarType,
        args: Vec<Expr>,
    },
    Cast {
        ty: ScalarType,
        value: Box<Expr>,
    },
    Binary {
        op: BinOp,
        ty: ScalarType,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Clamp {
        ty: ScalarType,
        value: Box<Expr>,
        lo: Box<Expr>,
        hi: Box<Expr>,
    },
}

impl Expr {
    /// A typed (non-literal) constant.
    pub fn constant(value: f64, ty: ScalarType) -> Expr {
        Expr::Const {
            value: ty.cast_from(ScalarType::F32, value),
            ty,
            literal: false,
        }
    }

    /// Static type of this node.
    pub fn ty(&self) -> ScalarType {
        match self {
            Expr::Const { ty, .. }
            | Expr::Call { ty, .. }
            | Expr::Input { ty, .. }
            | Expr::Cast { ty, .. }
            | Expr::Binary { ty, .. }
            | Expr::Clamp { ty, .. } => *ty,
            Expr::Var(_) | Expr::Dim(_) => ScalarType::I32,
        }
    }

    fn is_literal(&self) -> bool {
        matches!(self, Expr::Const { literal: true, .. })
    }

    /// Convert to `ty`, retyping literals in place and wrapping anything
    /// else in a `Cast`.
    fn coerce(self, ty: ScalarType) -> Expr {
        if self.ty() == ty {
            return self;
        }
        match self {
            Expr::Const { value, ty: from, .. } => Expr::Const {
                value: ty.cast_from(from, value),
                ty,
                literal: false,
            },
            other => Expr::Cast {
                ty,
                value: Box::new(other),
            },
        }
    }

    /// Visit this node and every descendant, parents first.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Call { args, .. } | Expr::Input { args, .. } => {
                for a in args {
                    a.walk(f);
                }
            }
            Expr::Cast { value, .. } => value.walk(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            Expr::Clamp { value, lo, hi, .. } => {
                value.walk(f);
                lo.walk(f);
                hi.walk(f);
            }
            Expr::Const { .. } | Expr::Var(_) | Expr::Dim(_) => {}
        }
    }

    /// Rebuild the tree bottom-up, letting `f` replace any node.
    /// `f` returns `None` to keep the (already rebuilt) node.
    pub fn rewrite(&self, f: &mut impl FnMut(&Expr) -> Option<Expr>) -> Expr {
        let rebuilt = match self {
            Expr::Call { func, ty, args } => Expr::Call {
                func: *func,
                ty: *ty,
                args: args.iter().map(|a| a.rewrite(f)).collect(),
            },
            Expr::Input { input, ty, args } => Expr::Input {
                input: *input,
                ty: *ty,
                args: args.iter().map(|a| a.rewrite(f)).collect(),
            },
            Expr::Cast { ty, value } => Expr::Cast {
                ty: *ty,
                value: Box::new(value.rewrite(f)),
            },
            Expr::Binary { op, ty, lhs, rhs } => Expr::Binary {
                op: *op,
                ty: *ty,
                lhs: Box::new(lhs.rewrite(f)),
                rhs: Box::new(rhs.rewrite(f)),
            },
            Expr::Clamp { ty, value, lo, hi } => Expr::Clamp {
                ty: *ty,
                value: Box::new(value.rewrite(f)),
                lo: Box::new(lo.rewrite(f)),
                hi: Box::new(hi.rewrite(f)),
            },
            leaf => leaf.clone(),
        };
        f(&rebuilt).unwrap_or(rebuilt)
    }

    /// Indices of every stage this expression calls.
    pub fn callees(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Call { func, .. } = e {
                if !out.contains(func) {
                    out.push(*func);
                }
            }
        });
        out
    }
}

/// Result type of combining `a` and `b`.
fn unify(a: &Expr, b: &Expr) -> ScalarType {
    let (ta, tb) = (a.ty(), b.ty());
    match (a.is_literal(), b.is_literal()) {
        (true, false) => literal_against(ta, tb),
        (false, true) => literal_against(tb, ta),
        _ => wider(ta, tb),
    }
}

fn literal_against(literal: ScalarType, other: ScalarType) -> ScalarType {
    if literal.is_float() && !other.is_float() {
        ScalarType::F32
    } else {
        other
    }
}

fn wider(a: ScalarType, b: ScalarType) -> ScalarType {
    if a.is_float() || b.is_float() {
        ScalarType::F32
    } else if a.bits() >= b.bits() {
        a
    } else {
        b
    }
}

fn binary(op: BinOp, a: Expr, b: Expr) -> Expr {
    let ty = if op == BinOp::Pow {
        ScalarType::F32
    } else {
        unify(&a, &b)
    };
    Expr::Binary {
        op,
        ty,
        lhs: Box::new(a.coerce(ty)),
        rhs: Box::new(b.coerce(ty)),
    }
}

// ---------------------------------------------------------------------------
// Builder helpers
// ---------------------------------------------------------------------------

/// A named dimension variable (`x`, `y`, `c`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Var(String);

impl Var {
    pub fn new(name: impl Into<String>) -> Self {
        Var(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// This variable as an expression.
    pub fn expr(&self) -> Expr {
        Expr::Var(self.0.clone())
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Var> for Expr {
    fn from(v: Var) -> Expr {
        Expr::Var(v.0)
    }
}

impl From<&Var> for Expr {
    fn from(v: &Var) -> Expr {
        v.expr()
    }
}

impl From<&Expr> for Expr {
    fn from(e: &Expr) -> Expr {
        e.clone()
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Expr {
        Expr::Const {
            value: v as f64,
            ty: ScalarType::I32,
            literal: true,
        }
    }
}

impl From<f32> for Expr {
    fn from(v: f32) -> Expr {
        Expr::Const {
            value: v as f64,
            ty: ScalarType::F32,
            literal: true,
        }
    }
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<Expr>> $trait<R> for Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                binary($op, self, rhs.into())
            }
        }

        impl<R: Into<Expr>> $trait<R> for &Var {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                binary($op, self.expr(), rhs.into())
            }
        }
    };
}

impl_binop!(Add, add, BinOp::Add);
impl_binop!(Sub, sub, BinOp::Sub);
impl_binop!(Mul, mul, BinOp::Mul);
impl_binop!(Div, div, BinOp::Div);

/// Convert `value` to `ty`.
pub fn cast(ty: ScalarType, value: impl Into<Expr>) -> Expr {
    let value = value.into();
    if value.ty() == ty && !value.is_literal() {
        return value;
    }
    Expr::Cast {
        ty,
        value: Box::new(value),
    }
}

/// `min(max(value, lo), hi)` in the type of `value`.
///
/// This is the explicit boundary condition for reads near an edge:
/// `clamp(x, 0, width - 1)` keeps a coordinate inside `[0, width)`.
pub fn clamp(value: impl Into<Expr>, lo: impl Into<Expr>, hi: impl Into<Expr>) -> Expr {
    let (value, lo, hi) = (value.into(), lo.into(), hi.into());
    let ty = if value.is_literal() {
        wider(wider(value.ty(), lo.ty()), hi.ty())
    } else {
        value.ty()
    };
    Expr::Clamp {
        ty,
        value: Box::new(value.coerce(ty)),
        lo: Box::new(lo.coerce(ty)),
        hi: Box::new(hi.coerce(ty)),
    }
}

/// `base ^ exponent`, evaluated in f32.
pub fn pow(base: impl Into<Expr>, exponent: impl Into<Expr>) -> Expr {
    binary(BinOp::Pow, base.into(), exponent.into())
}

pub fn min(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    binary(BinOp::Min, a.into(), b.into())
}

pub fn max(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    binary(BinOp::Max, a.into(), b.into())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_adopts_other_operand_type() {
        let p = Expr::Call {
            func: 0,
            ty: ScalarType::U16,
            args: vec![],
        };
        let e = p * 2;
        assert_eq!(e.ty(), ScalarType::U16);
    }

    #[test]
    fn float_literal_promotes_integer_operand() {
        let i = Var::new("i");
        let e = &i / 255.0f32;
        assert_eq!(e.ty(), ScalarType::F32);
        match e {
            Expr::Binary { lhs, .. } => assert!(matches!(*lhs, Expr::Cast { .. })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn integer_ops_wrap() {
        assert_eq!(BinOp::Add.apply(ScalarType::U8, 255.0, 1.0), 0.0);
        assert_eq!(BinOp::Sub.apply(ScalarType::U16, 0.0, 1.0), 65535.0);
        assert_eq!(BinOp::Mul.apply(ScalarType::U16, 40000.0, 2.0), 14464.0);
    }

    #[test]
    fn integer_division_floors_and_zero_divisor_is_zero() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(5, 0), 0);
        assert_eq!(BinOp::Div.apply(ScalarType::I32, -1.0, 4.0), -1.0);
    }

    #[test]
    fn float_to_int_cast_rounds_and_saturates() {
        assert_eq!(ScalarType::U8.cast_from(ScalarType::F32, 111.6), 112.0);
        assert_eq!(ScalarType::U8.cast_from(ScalarType::F32, 300.0), 255.0);
        assert_eq!(ScalarType::U8.cast_from(ScalarType::F32, -4.0), 0.0);
        assert_eq!(ScalarType::U8.cast_from(ScalarType::I32, 257.0), 1.0);
    }

    #[test]
    fn clamp_coerces_bounds_to_value_type() {
        let e = clamp(cast(ScalarType::F32, Var::new("x")), 0, 255);
        match e {
            Expr::Clamp { ty, lo, hi, .. } => {
                assert_eq!(ty, ScalarType::F32);
                assert_eq!(lo.ty(), ScalarType::F32);
                assert_eq!(hi.ty(), ScalarType::F32);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn callees_are_deduplicated() {
        let call = |f| Expr::Call {
            func: f,
            ty: ScalarType::U8,
            args: vec![],
        };
        let e = call(1) + call(2) + call(1);
        assert_eq!(e.callees(), vec![1, 2]);
    }
}
