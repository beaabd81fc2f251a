use super::{Dimension, Function};
use indexmap::{IndexMap, IndexSet};
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

/// A scalar symbol: spacings, thickness tokens, temporaries, bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Symbol(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn expr(&self) -> Expr {
        Expr::Sym(self.clone())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        }
    }
}

/// An array access `f[i0, i1, ...]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Indexed {
    pub function: Function,
    pub indices: Vec<Expr>,
}

impl Indexed {
    /// Index expression used for dimension `d` of the accessed function.
    pub fn index_of(&self, d: &Dimension) -> Option<&Expr> {
        self.function
            .dimensions()
            .iter()
            .position(|fd| fd == d)
            .and_then(|pos| self.indices.get(pos))
    }
}

/// Symbolic expression tree.
///
/// Build compound nodes through [`Expr::add`], [`Expr::mul`] and [`Expr::pow`]
/// (or the arithmetic operators): they flatten nested sums/products and fold
/// integer constants, so structurally equal inputs yield equal trees.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Int(i64),
    Sym(Symbol),
    Dim(Dimension),
    Indexed(Indexed),
    /// Bare function application `f(x - h_x, y)`, not yet indexified.
    Func(Function, Vec<Expr>),
    Add(Vec<Expr>),
    Mul(Vec<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Deriv(Box<Expr>, Dimension, u32),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
}

impl Expr {
    pub fn add(terms: impl IntoIterator<Item = Expr>) -> Expr {
        let mut constant = 0i64;
        // Constants that would overflow the folded sum stay as terms
        let mut unfolded = Vec::new();
        let mut out = Vec::new();
        let mut fold = |v: i64| match constant.checked_add(v) {
            Some(sum) => constant = sum,
            None => unfolded.push(Expr::Int(v)),
        };
        for term in terms {
            match term {
                Expr::Int(v) => fold(v),
                Expr::Add(inner) => {
                    for t in inner {
                        match t {
                            Expr::Int(v) => fold(v),
                            t => out.push(t),
                        }
                    }
                }
                t => out.push(t),
            }
        }
        if constant != 0 {
            out.push(Expr::Int(constant));
        }
        out.append(&mut unfolded);
        match out.len() {
            0 => Expr::Int(0),
            1 => out.swap_remove(0),
            _ => Expr::Add(out),
        }
    }

    pub fn mul(factors: impl IntoIterator<Item = Expr>) -> Expr {
        let mut coeff = 1i64;
        let mut unfolded = Vec::new();
        let mut out = Vec::new();
        let mut fold = |v: i64| match coeff.checked_mul(v) {
            Some(product) => coeff = product,
            None => unfolded.push(Expr::Int(v)),
        };
        for factor in factors {
            match factor {
                Expr::Int(v) => fold(v),
                Expr::Mul(inner) => {
                    for f in inner {
                        match f {
                            Expr::Int(v) => fold(v),
                            f => out.push(f),
                        }
                    }
                }
                f => out.push(f),
            }
        }
        if coeff == 0 {
            return Expr::Int(0);
        }
        if out.is_empty() && unfolded.is_empty() {
            return Expr::Int(coeff);
        }
        let mut leading = Vec::with_capacity(unfolded.len() + 1);
        if coeff != 1 {
            leading.push(Expr::Int(coeff));
        }
        leading.append(&mut unfolded);
        out.splice(0..0, leading);
        if out.len() == 1 {
            out.swap_remove(0)
        } else {
            Expr::Mul(out)
        }
    }

    pub fn pow(base: Expr, exp: Expr) -> Expr {
        if let Expr::Int(0) = exp {
            return Expr::Int(1);
        }
        if let Expr::Int(1) = exp {
            return base;
        }
        if let (Expr::Int(b), Expr::Int(e)) = (&base, &exp) {
            if let Some(v) = u32::try_from(*e).ok().and_then(|e| b.checked_pow(e)) {
                return Expr::Int(v);
            }
        }
        Expr::Pow(Box::new(base), Box::new(exp))
    }

    pub fn deriv(expr: Expr, dim: Dimension, order: u32) -> Expr {
        Expr::Deriv(Box::new(expr), dim, order)
    }

    pub fn cmp(op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Cmp(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn and(terms: impl IntoIterator<Item = Expr>) -> Expr {
        let mut out: Vec<Expr> = Vec::new();
        for term in terms {
            match term {
                Expr::And(inner) => out.extend(inner),
                t => out.push(t),
            }
        }
        if out.len() == 1 { out.swap_remove(0) } else { Expr::And(out) }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// A compile-time integer constant.
    pub fn is_integer(&self) -> bool {
        matches!(self, Expr::Int(_))
    }

    pub fn is_atomic(&self) -> bool {
        matches!(
            self,
            Expr::Int(_) | Expr::Sym(_) | Expr::Dim(_) | Expr::Indexed(_) | Expr::Func(..)
        )
    }

    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Int(_) | Expr::Sym(_) | Expr::Dim(_) => vec![],
            Expr::Indexed(i) => i.indices.iter().collect(),
            Expr::Func(_, args) => args.iter().collect(),
            Expr::Add(v) | Expr::Mul(v) | Expr::And(v) => v.iter().collect(),
            Expr::Pow(b, e) => vec![&**b, &**e],
            Expr::Deriv(e, _, _) => vec![&**e],
            Expr::Cmp(_, a, b) => vec![&**a, &**b],
        }
    }

    /// Pre-order traversal; returning `false` skips the children of a node.
    pub fn visit(&self, visit: &mut impl FnMut(&Expr) -> bool) {
        if visit(self) {
            for child in self.children() {
                child.visit(visit);
            }
        }
    }

    /// Rebuilds this node with every child replaced by `f(child)`.
    pub fn map_children(&self, mut f: impl FnMut(&Expr) -> Expr) -> Expr {
        match self {
            Expr::Int(_) | Expr::Sym(_) | Expr::Dim(_) => self.clone(),
            Expr::Indexed(i) => Expr::Indexed(Indexed {
                function: i.function.clone(),
                indices: i.indices.iter().map(&mut f).collect(),
            }),
            Expr::Func(func, args) => Expr::Func(func.clone(), args.iter().map(&mut f).collect()),
            Expr::Add(v) => Expr::add(v.iter().map(&mut f)),
            Expr::Mul(v) => Expr::mul(v.iter().map(&mut f)),
            Expr::And(v) => Expr::and(v.iter().map(&mut f)),
            Expr::Pow(b, e) => Expr::pow(f(&**b), f(&**e)),
            Expr::Deriv(e, d, n) => Expr::deriv(f(&**e), d.clone(), *n),
            Expr::Cmp(op, a, b) => Expr::cmp(*op, f(&**a), f(&**b)),
        }
    }

    /// Indexed accesses in traversal order, without duplicates. Unless `deep`,
    /// the indices of an access are not searched.
    pub fn indexeds(&self, deep: bool) -> Vec<Indexed> {
        let mut found = IndexSet::new();
        self.visit(&mut |e| match e {
            Expr::Indexed(i) => {
                found.insert(i.clone());
                deep
            }
            _ => true,
        });
        found.into_iter().collect()
    }

    /// Bare function applications at any depth.
    pub fn applications(&self) -> Vec<Expr> {
        let mut found = IndexSet::new();
        self.visit(&mut |e| {
            if let Expr::Func(..) = e {
                found.insert(e.clone());
            }
            true
        });
        found.into_iter().collect()
    }

    /// Functions referenced at any depth, either indexed or applied.
    pub fn functions(&self) -> Vec<Function> {
        let mut found = IndexSet::new();
        self.visit(&mut |e| {
            match e {
                Expr::Indexed(i) => {
                    found.insert(i.function.clone());
                }
                Expr::Func(f, _) => {
                    found.insert(f.clone());
                }
                _ => {}
            }
            true
        });
        found.into_iter().collect()
    }

    /// Dimension atoms at any depth, including derivative dimensions.
    pub fn dimensions(&self) -> Vec<Dimension> {
        let mut found = IndexSet::new();
        self.visit(&mut |e| {
            match e {
                Expr::Dim(d) => {
                    found.insert(d.clone());
                }
                Expr::Deriv(_, d, _) => {
                    found.insert(d.clone());
                }
                _ => {}
            }
            true
        });
        found.into_iter().collect()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        let mut found = IndexSet::new();
        self.visit(&mut |e| {
            if let Expr::Sym(s) = e {
                found.insert(s.clone());
            }
            true
        });
        found.into_iter().collect()
    }

    /// Number of arithmetic operations, used as a cost model.
    pub fn op_count(&self) -> usize {
        let own = match self {
            Expr::Add(v) | Expr::Mul(v) => v.len().saturating_sub(1),
            Expr::Pow(..) => 1,
            _ => 0,
        };
        let nested: usize = match self {
            // index arithmetic is not counted
            Expr::Indexed(_) => 0,
            _ => self.children().iter().map(|c| c.op_count()).sum(),
        };
        own + nested
    }

    fn split_sign(&self) -> (bool, Expr) {
        match self {
            Expr::Int(v) if *v < 0 => (true, Expr::Int(-v)),
            Expr::Mul(v) => match v.first() {
                Some(Expr::Int(c)) if *c < 0 => {
                    let rest = v[1..].iter().cloned();
                    (true, Expr::mul(std::iter::once(Expr::Int(-c)).chain(rest)))
                }
                _ => (false, self.clone()),
            },
            _ => (false, self.clone()),
        }
    }
}

/// A simultaneous substitution: every match is replaced against the original
/// tree, so no replacement can see the result of another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Substitution {
    exprs: IndexMap<Expr, Expr>,
    functions: IndexMap<Function, Function>,
}

impl Substitution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: Expr, to: Expr) {
        self.exprs.insert(from, to);
    }

    pub fn insert_dimension(&mut self, from: &Dimension, to: &Dimension) {
        self.exprs.insert(from.expr(), to.expr());
    }

    /// Redirects every access to `from` onto `to`.
    pub fn insert_function(&mut self, from: Function, to: Function) {
        self.functions.insert(from, to);
    }

    /// Merges `other` in; entries of `other` win.
    pub fn extend(&mut self, other: &Substitution) {
        for (k, v) in &other.exprs {
            self.exprs.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.functions {
            self.functions.insert(k.clone(), v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty() && self.functions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exprs.len() + self.functions.len()
    }

    pub fn get(&self, from: &Expr) -> Option<&Expr> {
        self.exprs.get(from)
    }

    pub fn apply(&self, expr: &Expr) -> Expr {
        if let Some(to) = self.exprs.get(expr) {
            return to.clone();
        }
        match expr {
            Expr::Indexed(i) => Expr::Indexed(Indexed {
                function: self.apply_function(&i.function),
                indices: i.indices.iter().map(|e| self.apply(e)).collect(),
            }),
            Expr::Func(f, args) => {
                Expr::Func(self.apply_function(f), args.iter().map(|e| self.apply(e)).collect())
            }
            Expr::Deriv(e, d, n) => Expr::deriv(self.apply(e), self.apply_dimension(d), *n),
            _ => expr.map_children(|c| self.apply(c)),
        }
    }

    pub fn apply_dimension(&self, d: &Dimension) -> Dimension {
        match self.exprs.get(&d.expr()) {
            Some(Expr::Dim(to)) => to.clone(),
            _ => d.clone(),
        }
    }

    pub fn apply_function(&self, f: &Function) -> Function {
        self.functions.get(f).cloned().unwrap_or_else(|| f.clone())
    }
}

impl FromIterator<(Expr, Expr)> for Substitution {
    fn from_iter<I: IntoIterator<Item = (Expr, Expr)>>(iter: I) -> Self {
        Substitution {
            exprs: iter.into_iter().collect(),
            functions: IndexMap::new(),
        }
    }
}

struct Factor<'a>(&'a Expr);

impl fmt::Display for Factor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Expr::Add(_) | Expr::Cmp(..) | Expr::And(_) => write!(f, "({})", self.0),
            _ => write!(f, "{}", self.0),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{v}"),
            Expr::Sym(s) => write!(f, "{s}"),
            Expr::Dim(d) => write!(f, "{d}"),
            Expr::Indexed(i) => {
                write!(f, "{}[", i.function)?;
                write_list(f, &i.indices)?;
                write!(f, "]")
            }
            Expr::Func(func, args) => {
                write!(f, "{func}(")?;
                write_list(f, args)?;
                write!(f, ")")
            }
            Expr::Add(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    let (negative, magnitude) = term.split_sign();
                    match (i, negative) {
                        (0, false) => write!(f, "{magnitude}")?,
                        (0, true) => write!(f, "-{magnitude}")?,
                        (_, false) => write!(f, " + {magnitude}")?,
                        (_, true) => write!(f, " - {magnitude}")?,
                    }
                }
                Ok(())
            }
            Expr::Mul(factors) => {
                let mut rest = &factors[..];
                if let Some(Expr::Int(-1)) = factors.first() {
                    write!(f, "-")?;
                    rest = &factors[1..];
                }
                for (i, factor) in rest.iter().enumerate() {
                    if i > 0 {
                        write!(f, "*")?;
                    }
                    write!(f, "{}", Factor(factor))?;
                }
                Ok(())
            }
            Expr::Pow(base, exp) => {
                if base.is_atomic() && base.as_int().is_none_or(|v| v >= 0) {
                    write!(f, "{base}")?;
                } else {
                    write!(f, "({base})")?;
                }
                if exp.is_atomic() && exp.as_int().is_none_or(|v| v >= 0) {
                    write!(f, "**{exp}")
                } else {
                    write!(f, "**({exp})")
                }
            }
            Expr::Deriv(e, d, n) => write!(f, "Derivative({e}, {d}, {n})"),
            Expr::Cmp(op, a, b) => write!(f, "{a} {} {b}", op.symbol()),
            Expr::And(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " && ")?;
                    }
                    write!(f, "{}", Factor(term))?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Int(v)
    }
}

impl From<Symbol> for Expr {
    fn from(s: Symbol) -> Self {
        Expr::Sym(s)
    }
}

impl From<&Symbol> for Expr {
    fn from(s: &Symbol) -> Self {
        Expr::Sym(s.clone())
    }
}

impl From<&Dimension> for Expr {
    fn from(d: &Dimension) -> Self {
        d.expr()
    }
}

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::add([self, rhs])
    }
}

impl Add<i64> for Expr {
    type Output = Expr;
    fn add(self, rhs: i64) -> Expr {
        Expr::add([self, Expr::Int(rhs)])
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::add([self, -rhs])
    }
}

impl Sub<i64> for Expr {
    type Output = Expr;
    fn sub(self, rhs: i64) -> Expr {
        Expr::add([self, Expr::Int(-rhs)])
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::mul([self, rhs])
    }
}

impl Mul<i64> for Expr {
    type Output = Expr;
    fn mul(self, rhs: i64) -> Expr {
        Expr::mul([Expr::Int(rhs), self])
    }
}

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::mul([Expr::Int(-1), self])
    }
}
