use crate::symbolics::{Equation, Expr, Function, FunctionKind, Substitution};

/// Lowers a sequence of equations, see [`lower_expr`].
pub fn lower_exprs(exprs: &[Equation], subs: &Substitution) -> Vec<Equation> {
    exprs.iter().map(|eq| lower_expr(eq, subs)).collect()
}

/// Rewrites `eq` into domain-aligned indexed form.
///
/// Bare applications become indexed accesses, every index is shifted by the
/// left halo+padding of its dimension, spacing symbols collapse to unit
/// steps and the subdomain remap, if any, is applied. `subs` is merged in
/// last and wins over any derived replacement.
pub fn lower_expr(eq: &Equation, subs: &Substitution) -> Equation {
    let dimension_map = eq.subdomain.as_ref().map(|s| s.substitution()).unwrap_or_default();

    let mut mapper = Substitution::new();
    for side in eq.sides() {
        collect_accesses(side, &dimension_map, subs, &mut mapper);
    }
    mapper.extend(&dimension_map);
    mapper.extend(subs);

    eq.apply(&mapper)
}

/// Index expressions are lowered on their own, without a subdomain remap.
fn lower_index(expr: &Expr, subs: &Substitution) -> Expr {
    let mut mapper = Substitution::new();
    collect_accesses(expr, &Substitution::new(), subs, &mut mapper);
    mapper.extend(subs);
    mapper.apply(expr)
}

fn collect_accesses(
    expr: &Expr,
    dimension_map: &Substitution,
    subs: &Substitution,
    mapper: &mut Substitution,
) {
    // 1. Bare applications, indexified over their (remapped) arguments
    for app in expr.applications() {
        if let Expr::Func(f, args) = &app {
            let indexified = f.at(args.iter().map(|a| dimension_map.apply(a)));
            let lowered = lower_index(&indexified, subs);
            mapper.insert(app.clone(), lowered);
        }
    }

    // 2. Indexed accesses; their indices are handled recursively
    for indexed in expr.indexeds(false) {
        let f = &indexed.function;
        let indices: Vec<Expr> = indexed
            .indices
            .iter()
            .enumerate()
            .map(|(pos, index)| {
                let shifted = lower_index(index, subs) + f.left_nodomain(pos) as i64;
                let shifted = match f.dimensions().get(pos).and_then(|d| d.spacing()) {
                    Some(h) => {
                        let mut unit = Substitution::new();
                        unit.insert(h.expr(), Expr::Int(1));
                        unit.insert(-h.expr(), Expr::Int(-1));
                        unit.apply(&shifted)
                    }
                    None => shifted,
                };
                dimension_map.apply(&shifted)
            })
            .collect();

        let function = match f.initvalue() {
            Some(init) => with_lowered_initvalue(f, init, subs),
            None => f.clone(),
        };
        mapper.insert(Expr::Indexed(indexed.clone()), function.at(indices));
    }
}

fn with_lowered_initvalue(f: &Function, init: &[Expr], subs: &Substitution) -> Function {
    let mut data = f.data().clone();
    data.name = format!("{}i", f.name());
    if let FunctionKind::Array { initvalue, .. } = &mut data.kind {
        *initvalue = Some(init.iter().map(|e| lower_index(e, subs)).collect());
    }
    Function::from_data(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolics::{Dimension, SubDomain, Symbol};

    fn heat() -> (Dimension, Dimension, Dimension, Function) {
        let t = Dimension::time("t");
        let x = Dimension::space("x");
        let y = Dimension::space("y");
        let u = Function::time_dense("u", vec![t.clone(), x.clone(), y.clone()], 2)
            .with_halo(vec![(0, 0), (2, 2), (0, 0)]);
        (t, x, y, u)
    }

    #[test]
    fn accesses_shift_by_left_halo() {
        let (t, x, y, u) = heat();
        let eq = Equation::new(
            u.at([t.expr() + 1, x.expr(), y.expr()]),
            u.at([t.expr(), x.expr() - 1, y.expr()]) + u.at([t.expr(), x.expr() + 1, y.expr()]),
        );
        let lowered = lower_expr(&eq, &Substitution::new());
        assert_eq!(lowered.lhs, u.at([t.expr() + 1, x.expr() + 2, y.expr()]));
        assert_eq!(
            lowered.rhs,
            u.at([t.expr(), x.expr() + 1, y.expr()]) + u.at([t.expr(), x.expr() + 3, y.expr()])
        );
    }

    #[test]
    fn padding_adds_to_the_shift() {
        let x = Dimension::space("x");
        let f = Function::dense("f", vec![x.clone()], 1).with_padding(vec![(3, 0)]);
        let eq = Equation::new(f.at([x.expr()]), Expr::Int(0));
        let lowered = lower_expr(&eq, &Substitution::new());
        assert_eq!(lowered.lhs, f.at([x.expr() + 4]));
    }

    #[test]
    fn spacing_collapses_to_unit_steps() {
        let x = Dimension::space("x");
        let h = x.spacing().cloned().unwrap();
        let f = Function::dense("f", vec![x.clone()], 0);
        let g = Function::dense("g", vec![x.clone()], 0);
        let eq = Equation::new(
            f.apply([x.expr()]),
            g.apply([x.expr() + h.expr()]) + g.apply([x.expr() - h.expr()]),
        );
        let lowered = lower_expr(&eq, &Substitution::new());
        assert_eq!(lowered.lhs, f.at([x.expr()]));
        assert_eq!(lowered.rhs, g.at([x.expr() + 1]) + g.at([x.expr() - 1]));
    }

    #[test]
    fn subdomain_remap_applies_everywhere() {
        let x = Dimension::space("x");
        let xi = Dimension::sub_middle("xi", &x, 1, 1);
        let f = Function::dense("f", vec![x.clone()], 1);
        let eq = Equation::new(f.apply([x.expr()]), f.apply([x.expr()]) * 2 + x.expr())
            .with_subdomain(SubDomain::new("interior", vec![(x.clone(), xi.clone())]));
        let lowered = lower_expr(&eq, &Substitution::new());
        assert_eq!(lowered.lhs, f.at([xi.expr() + 1]));
        assert_eq!(lowered.rhs, f.at([xi.expr() + 1]) * 2 + xi.expr());
    }

    #[test]
    fn caller_substitutions_win() {
        let x = Dimension::space("x");
        let f = Function::dense("f", vec![x.clone()], 0);
        let c = Symbol::new("c");
        let mut subs = Substitution::new();
        subs.insert(c.expr(), Expr::Int(7));
        let eq = Equation::new(f.at([x.expr()]), c.expr());
        let lowered = lower_exprs(&[eq], &subs);
        assert_eq!(lowered[0].rhs, Expr::Int(7));
    }

    #[test]
    fn initialized_arrays_are_renamed() {
        let x = Dimension::space("x");
        let c = Symbol::new("c");
        let a = Function::array("a", vec![x.clone()]).with_initvalue(vec![c.expr()]);
        let mut subs = Substitution::new();
        subs.insert(c.expr(), Expr::Int(2));
        let lowered = lower_expr(&Equation::new(a.at([x.expr()]), Expr::Int(0)), &subs);
        match &lowered.lhs {
            Expr::Indexed(i) => {
                assert_eq!(i.function.name(), "ai");
                assert_eq!(i.function.initvalue(), Some(&[Expr::Int(2)][..]));
            }
            other => panic!("expected an access, got {other}"),
        }
    }

    #[test]
    fn nested_indices_are_lowered_too() {
        let x = Dimension::space("x");
        let p = Dimension::space("p");
        let map = Function::dense("map", vec![p.clone()], 1);
        let f = Function::dense("f", vec![x.clone()], 2);
        let eq = Equation::new(f.at([map.at([p.expr()])]), Expr::Int(0));
        let lowered = lower_expr(&eq, &Substitution::new());
        assert_eq!(lowered.lhs, f.at([map.at([p.expr() + 1]) + 2]));
    }
}
