// interval.rs -- Interval arithmetic over expressions.
//
// Bounds inference asks one question: "if the stage's coordinates range
// over this box, which coordinates of each producer can the body touch?"
// We answer it by evaluating the body over closed intervals instead of
// points. Results are conservative: the true footprint is always inside.
//
// Unbounded ends are represented with f64 infinities, which keeps the
// arithmetic uniform (`-inf + 3 == -inf`). Finite integer results that
// could overflow their type fall back to the type's full range, since
// wrapping makes anything reachable. Infinite ends stay infinite: they
// mean "not known at compile time", which the static input check relies on.

use crate::expr::{BinOp, Expr, ScalarType};

/// A closed interval `[lo, hi]`. Either end may be infinite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub lo: f64,
    pub hi: f64,
}

impl Interval {
    pub const EVERYTHING: Interval = Interval {
        lo: f64::NEG_INFINITY,
        hi: f64::INFINITY,
    };

    pub fn new(lo: f64, hi: f64) -> Self {
        Interval { lo, hi }
    }

    pub fn point(v: f64) -> Self {
        Interval { lo: v, hi: v }
    }

    /// The full value range of `ty`.
    pub fn of_type(ty: ScalarType) -> Self {
        Interval::new(ty.min_value(), ty.max_value())
    }

    pub fn is_bounded(&self) -> bool {
        self.lo.is_finite() && self.hi.is_finite()
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    /// Smallest interval covering both.
    pub fn hull(&self, other: &Interval) -> Interval {
        Interval::new(self.lo.min(other.lo), self.hi.max(other.hi))
    }

    fn add(self, o: Interval) -> Interval {
        Interval::new(self.lo + o.lo, self.hi + o.hi)
    }

    fn sub(self, o: Interval) -> Interval {
        Interval::new(self.lo - o.hi, self.hi - o.lo)
    }

    fn mul(self, o: Interval) -> Interval {
        let p = [
            mul_ext(self.lo, o.lo),
            mul_ext(self.lo, o.hi),
            mul_ext(self.hi, o.lo),
            mul_ext(self.hi, o.hi),
        ];
        span(&p)
    }

    fn div(self, o: Interval, floor: bool) -> Interval {
        if o.lo <= 0.0 && o.hi >= 0.0 {
            if !floor {
                return Interval::EVERYTHING;
            }
            // x / 0 == 0, and any other integer divisor shrinks |x|.
            let m = self.lo.abs().max(self.hi.abs());
            return Interval::new(-m, m);
        }
        let q = |a: f64, b: f64| {
            let r = a / b;
            if floor && r.is_finite() {
                r.floor()
            } else {
                r
            }
        };
        let p = [q(self.lo, o.lo), q(self.lo, o.hi), q(self.hi, o.lo), q(self.hi, o.hi)];
        if p.iter().any(|v| v.is_nan()) {
            return Interval::EVERYTHING;
        }
        span(&p)
    }

    fn min(self, o: Interval) -> Interval {
        Interval::new(self.lo.min(o.lo), self.hi.min(o.hi))
    }

    fn max(self, o: Interval) -> Interval {
        Interval::new(self.lo.max(o.lo), self.hi.max(o.hi))
    }

    /// Fold into `ty`: finite integer intervals that escape the type's
    /// range become the whole range. Unbounded intervals are kept.
    fn fit(self, ty: ScalarType) -> Interval {
        let full = Interval::of_type(ty);
        if ty.is_float() || !self.is_bounded() || full.contains(&self) {
            self
        } else {
            full
        }
    }
}

/// `0 * inf` is 0 for bounds purposes.
fn mul_ext(a: f64, b: f64) -> f64 {
    if a == 0.0 || b == 0.0 {
        0.0
    } else {
        a * b
    }
}

fn span(values: &[f64]) -> Interval {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Interval::new(lo, hi)
}

/// Interval of `expr` when dimension `i` ranges over `dims[i]`.
///
/// Calls into stages and reads from inputs return the full range of their
/// type; their values are not known at compile time.
pub fn bounds_of(expr: &Expr, dims: &[Interval]) -> Interval {
    match expr {
        Expr::Const { value, .. } => Interval::point(*value),
        Expr::Dim(i) => dims.get(*i).copied().unwrap_or(Interval::EVERYTHING),
        Expr::Var(_) => Interval::EVERYTHING,
        Expr::Call { ty, .. } | Expr::Input { ty, .. } => Interval::of_type(*ty),
        Expr::Cast { ty, value } => {
            let inner = bounds_of(value, dims);
            if ty.is_float() {
                inner
            } else if value.ty().is_float() {
                // Rounding then saturating is monotone.
                Interval::new(
                    ty.cast_from(ScalarType::F32, inner.lo.max(ty.min_value())),
                    ty.cast_from(ScalarType::F32, inner.hi.min(ty.max_value())),
                )
            } else {
                inner.fit(*ty)
            }
        }
        Expr::Binary { op, ty, lhs, rhs } => {
            let a = bounds_of(lhs, dims);
            let b = bounds_of(rhs, dims);
            let r = match op {
                BinOp::Add => a.add(b),
                BinOp::Sub => a.sub(b),
                BinOp::Mul => a.mul(b),
                BinOp::Div => a.div(b, !ty.is_float()),
                BinOp::Min => a.min(b),
                BinOp::Max => a.max(b),
                BinOp::Pow => {
                    if a.lo == a.hi && b.lo == b.hi {
                        Interval::point(op.apply(*ty, a.lo, b.lo))
                    } else if ty.is_float() || !a.is_bounded() || !b.is_bounded() {
                        Interval::EVERYTHING
                    } else {
                        Interval::of_type(*ty)
                    }
                }
            };
            r.fit(*ty)
        }
        Expr::Clamp { ty, value, lo, hi } => {
            let v = bounds_of(value, dims);
            let l = bounds_of(lo, dims);
            let h = bounds_of(hi, dims);
            v.max(l).min(h).fit(*ty)
        }
    }
}

/// Per-stage footprints collected during bounds inference.
///
/// Entry `i` is the box of stage `i` that must be available, or `None` if
/// nothing has asked for stage `i` yet.
#[derive(Debug, Clone, Default)]
pub struct Footprints {
    boxes: Vec<Option<Vec<Interval>>>,
}

impl Footprints {
    pub fn new(stages: usize) -> Self {
        Footprints {
            boxes: vec![None; stages],
        }
    }

    pub fn get(&self, stage: usize) -> Option<&[Interval]> {
        self.boxes.get(stage).and_then(|b| b.as_deref())
    }

    /// Grow stage `stage`'s footprint to cover `bx`.
    pub fn include(&mut self, stage: usize, bx: &[Interval]) {
        if stage >= self.boxes.len() {
            self.boxes.resize(stage + 1, None);
        }
        let slot = &mut self.boxes[stage];
        match *slot {
            Some(ref mut existing) => {
                for (e, b) in existing.iter_mut().zip(bx) {
                    *e = e.hull(b);
                }
            }
            None => *slot = Some(bx.to_vec()),
        }
    }

    pub fn merge(&mut self, other: &Footprints) {
        for (i, b) in other.boxes.iter().enumerate() {
            if let Some(b) = b {
                self.include(i, b);
            }
        }
    }

    /// Record every stage call in `expr` evaluated over `dims`.
    pub fn collect_calls(&mut self, expr: &Expr, dims: &[Interval]) {
        expr.walk(&mut |e| {
            if let Expr::Call { func, args, .. } = e {
                let bx: Vec<Interval> = args.iter().map(|a| bounds_of(a, dims)).collect();
                self.include(*func, &bx);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{clamp, Var};

    fn resolve(e: Expr) -> Expr {
        e.rewrite(&mut |n| match n {
            Expr::Var(name) if name == "x" => Some(Expr::Dim(0)),
            Expr::Var(name) if name == "y" => Some(Expr::Dim(1)),
            _ => None,
        })
    }

    #[test]
    fn offsets_shift_the_interval() {
        let x = Var::new("x");
        let e = resolve(&x - 1);
        let iv = bounds_of(&e, &[Interval::new(0.0, 7.0)]);
        assert_eq!(iv, Interval::new(-1.0, 6.0));
    }

    #[test]
    fn clamp_bounds_an_unbounded_coordinate() {
        let x = Var::new("x");
        let e = resolve(clamp(&x, 0, 9));
        let iv = bounds_of(&e, &[Interval::EVERYTHING]);
        assert_eq!(iv, Interval::new(0.0, 9.0));
        assert!(iv.is_bounded());
    }

    #[test]
    fn unsigned_overflow_widens_to_type_range() {
        let p = Expr::Call {
            func: 0,
            ty: ScalarType::U16,
            args: vec![],
        };
        let iv = bounds_of(&(p * 2), &[]);
        assert_eq!(iv, Interval::of_type(ScalarType::U16));
    }

    #[test]
    fn unbounded_offset_stays_unbounded() {
        let x = Var::new("x");
        let iv = bounds_of(&resolve(&x + 1), &[Interval::EVERYTHING]);
        assert_eq!(iv, Interval::EVERYTHING);
        assert!(!iv.is_bounded());
    }

    #[test]
    fn integer_division_by_a_range_with_zero_stays_finite() {
        let x = Var::new("x");
        let y = Var::new("y");
        let e = resolve(&x / y.expr());
        let iv = bounds_of(&e, &[Interval::new(-3.0, 7.0), Interval::new(-1.0, 2.0)]);
        assert_eq!(iv, Interval::new(-7.0, 7.0));
    }

    #[test]
    fn footprints_take_the_hull() {
        let mut fp = Footprints::new(2);
        fp.include(1, &[Interval::new(0.0, 3.0)]);
        fp.include(1, &[Interval::new(-2.0, 1.0)]);
        assert_eq!(fp.get(1), Some(&[Interval::new(-2.0, 3.0)][..]));
        assert_eq!(fp.get(0), None);
    }

    #[test]
    fn collect_calls_sees_nested_calls() {
        let inner = Expr::Call {
            func: 1,
            ty: ScalarType::U16,
            args: vec![Expr::Dim(0) + 1],
        };
        let outer = Expr::Call {
            func: 0,
            ty: ScalarType::U8,
            args: vec![inner],
        };
        let mut fp = Footprints::new(2);
        fp.collect_calls(&outer, &[Interval::new(0.0, 4.0)]);
        assert_eq!(fp.get(1), Some(&[Interval::new(1.0, 5.0)][..]));
        assert_eq!(fp.get(0), Some(&[Interval::of_type(ScalarType::U16)][..]));
    }
}
