use crate::symbolics::{Dimension, Equation, Expr, Substitution};
use indexmap::IndexMap;

/// Merges derivatives sharing dimension and order within each sum, so that
/// `D(u, x) + D(v, x)` becomes `D(u + v, x)` and is expanded only once.
pub fn collect_derivatives(exprs: &[Equation]) -> Vec<Equation> {
    exprs.iter().map(|eq| eq.map(collect)).collect()
}

fn collect(expr: &Expr) -> Expr {
    let expr = expr.map_children(collect);
    let Expr::Add(terms) = &expr else {
        return expr;
    };

    let mut groups: IndexMap<(Dimension, u32), Vec<Expr>> = IndexMap::new();
    let mut others = Vec::new();
    for term in terms {
        match term {
            Expr::Deriv(inner, d, n) => {
                groups.entry((d.clone(), *n)).or_default().push((**inner).clone())
            }
            _ => others.push(term.clone()),
        }
    }
    if groups.values().all(|g| g.len() < 2) {
        return expr;
    }

    let merged = groups.into_iter().map(|((d, n), inner)| Expr::deriv(Expr::add(inner), d, n));
    Expr::add(merged.chain(others))
}

/// Expands every derivative into a centered finite-difference stencil.
pub fn evaluate_derivatives(exprs: &[Equation]) -> Vec<Equation> {
    exprs.iter().map(|eq| eq.map(evaluate)).collect()
}

fn evaluate(expr: &Expr) -> Expr {
    match expr {
        Expr::Deriv(inner, d, order) => expand(&evaluate(inner), d, *order),
        _ => expr.map_children(evaluate),
    }
}

fn expand(expr: &Expr, d: &Dimension, order: u32) -> Expr {
    let Some(h) = d.spacing().map(|s| s.expr()) else {
        // no spacing, nothing to discretize against
        return expr.clone();
    };
    match order {
        0 => expr.clone(),
        1 => {
            let diff = shift(expr, d, &h, 1) - shift(expr, d, &h, -1);
            Expr::mul([diff, Expr::pow(h * 2, Expr::Int(-1))])
        }
        2 => {
            let diff =
                Expr::add([shift(expr, d, &h, 1), expr.clone() * -2, shift(expr, d, &h, -1)]);
            Expr::mul([diff, Expr::pow(h, Expr::Int(-2))])
        }
        n => expand(&expand(expr, d, 2), d, n - 2),
    }
}

/// `expr` evaluated at `d + k*h`.
fn shift(expr: &Expr, d: &Dimension, h: &Expr, k: i64) -> Expr {
    let mut subs = Substitution::new();
    subs.insert(d.expr(), d.expr() + h.clone() * k);
    subs.apply(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolics::Function;

    #[test]
    fn first_derivative_is_centered() {
        let x = Dimension::space("x");
        let u = Function::dense("u", vec![x.clone()], 1);
        let v = Function::dense("v", vec![x.clone()], 1);
        let eq = Equation::new(v.call(), Expr::deriv(u.call(), x.clone(), 1));
        let out = evaluate_derivatives(&[eq]);
        assert_eq!(out[0].rhs.to_string(), "(u(x + h_x) - u(x - h_x))*(2*h_x)**(-1)");
    }

    #[test]
    fn second_derivative_uses_three_points() {
        let x = Dimension::space("x");
        let u = Function::dense("u", vec![x.clone()], 1);
        let eq = Equation::new(u.call(), Expr::deriv(u.call(), x.clone(), 2));
        let out = evaluate_derivatives(&[eq]);
        assert_eq!(out[0].rhs.functions(), vec![u.clone()]);
        assert_eq!(out[0].rhs.to_string(), "(u(x + h_x) - 2*u(x) + u(x - h_x))*h_x**(-2)");
    }

    #[test]
    fn derivatives_along_the_same_axis_are_collected() {
        let x = Dimension::space("x");
        let u = Function::dense("u", vec![x.clone()], 1);
        let v = Function::dense("v", vec![x.clone()], 1);
        let rhs = Expr::deriv(u.call(), x.clone(), 1) + Expr::deriv(v.call(), x.clone(), 1);
        let out = collect_derivatives(&[Equation::new(u.call(), rhs)]);
        assert_eq!(out[0].rhs, Expr::deriv(u.call() + v.call(), x.clone(), 1));
    }

    #[test]
    fn expressions_without_derivatives_are_untouched() {
        let x = Dimension::space("x");
        let u = Function::dense("u", vec![x.clone()], 1);
        let eq = Equation::new(u.call(), u.call() + 1);
        assert_eq!(collect_derivatives(&[eq.clone()]), vec![eq.clone()]);
        assert_eq!(evaluate_derivatives(&[eq.clone()]), vec![eq]);
    }
}
