use rustc_hash::FxHashMap;
use std::fmt;
use std::ops::{Add, Mul};

/// A symbolic dimension expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Const(i64),
    Var(String),
    Add(Box<Self>, Box<Self>),
    Mul(Box<Self>, Box<Self>),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(0))
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Expr::Const(1))
    }

    /// Returns the constant value if the expression is fully constant.
    pub fn as_const(&self) -> Option<i64> {
        match self {
            Expr::Const(c) => Some(*c),
            _ => None,
        }
    }

    /// Evaluates the expression under concrete variable bindings.
    ///
    /// Returns `None` if a variable has no binding.
    pub fn eval(&self, bindings: &FxHashMap<String, i64>) -> Option<i64> {
        match self {
            Expr::Const(c) => Some(*c),
            Expr::Var(v) => bindings.get(v).copied(),
            Expr::Add(l, r) => Some(l.eval(bindings)? + r.eval(bindings)?),
            Expr::Mul(l, r) => Some(l.eval(bindings)? * r.eval(bindings)?),
        }
    }

    /// Collects the variable names referenced by the expression.
    pub fn collect_vars(&self, out: &mut Vec<String>) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(v) => {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
            Expr::Add(l, r) | Expr::Mul(l, r) => {
                l.collect_vars(out);
                r.collect_vars(out);
            }
        }
    }

    /// Constant-folds and drops additive/multiplicative identities.
    pub fn simplify(self) -> Self {
        match self {
            Expr::Add(lhs, rhs) => {
                let lhs = lhs.simplify();
                let rhs = rhs.simplify();
                match (&lhs, &rhs) {
                    (Expr::Const(a), Expr::Const(b)) => Expr::Const(a + b),
                    _ if lhs.is_zero() => rhs,
                    _ if rhs.is_zero() => lhs,
                    _ => Expr::Add(Box::new(lhs), Box::new(rhs)),
                }
            }
            Expr::Mul(lhs, rhs) => {
                let lhs = lhs.simplify();
                let rhs = rhs.simplify();
                match (&lhs, &rhs) {
                    (Expr::Const(a), Expr::Const(b)) => Expr::Const(a * b),
                    _ if lhs.is_zero() || rhs.is_zero() => Expr::Const(0),
                    _ if lhs.is_one() => rhs,
                    _ if rhs.is_one() => lhs,
                    _ => Expr::Mul(Box::new(lhs), Box::new(rhs)),
                }
            }
            other => other,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(c) => write!(f, "{c}"),
            Expr::Var(v) => write!(f, "{v}"),
            Expr::Add(l, r) => write!(f, "({l} + {r})"),
            Expr::Mul(l, r) => write!(f, "({l} * {r})"),
        }
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::Const(value)
    }
}

impl<T: Into<Expr>> Add<T> for Expr {
    type Output = Expr;
    fn add(self, rhs: T) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> Mul<T> for Expr {
    type Output = Expr;
    fn mul(self, rhs: T) -> Expr {
        Expr::Mul(Box::new(self), Box::new(rhs.into()))
    }
}
