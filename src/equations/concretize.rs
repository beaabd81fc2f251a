use crate::registry::SymbolRegistry;
use crate::symbolics::{
    DimKind, Dimension, Equation, Function, FunctionKind, Substitution, Symbol, Thickness,
};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use tracing::debug;

/// Gives every derived dimension used by `exprs` its own bound symbols.
///
/// Sub-dimensions shared by several operators would otherwise share their
/// thickness tokens. The operation is a fixed point: dimensions that were
/// already concretized are left alone.
pub fn concretize_subdims(exprs: &[Equation], sregistry: &mut SymbolRegistry) -> Vec<Equation> {
    let mut concretizer = Concretizer::new(sregistry);
    for eq in exprs {
        concretizer.visit_equation(eq);
    }
    if concretizer.mapper.is_empty() {
        return exprs.to_vec();
    }

    let mut subs = Substitution::new();
    for (from, to) in &concretizer.mapper {
        subs.insert_dimension(from, to);
    }

    // Temporaries declared over a remapped dimension need rebuilding too
    let arrays: IndexSet<Function> = exprs
        .iter()
        .flat_map(|eq| eq.functions())
        .filter(Function::is_array)
        .collect();
    for f in arrays {
        let dims: Vec<Dimension> = f
            .dimensions()
            .iter()
            .map(|d| concretizer.mapper.get(d).cloned().unwrap_or_else(|| d.clone()))
            .collect();
        if dims.as_slice() != f.dimensions() {
            let mut data = f.data().clone();
            data.dimensions = dims;
            if let FunctionKind::Array { origin, .. } = &mut data.kind {
                *origin = None;
            }
            subs.insert_function(f.clone(), Function::from_data(data));
        }
    }

    exprs.iter().map(|eq| eq.apply(&subs)).collect()
}

struct Concretizer<'a> {
    sregistry: &'a mut SymbolRegistry,
    mapper: IndexMap<Dimension, Dimension>,
    /// (helper dimension, bounds array) pairs already rebuilt for multi
    /// sub-dimensions.
    rebuilt: HashMap<(Dimension, Function), (Dimension, Function)>,
}

impl<'a> Concretizer<'a> {
    fn new(sregistry: &'a mut SymbolRegistry) -> Self {
        Self { sregistry, mapper: IndexMap::new(), rebuilt: HashMap::new() }
    }

    fn visit_equation(&mut self, eq: &Equation) {
        for d in eq.dimensions() {
            self.visit(&d);
        }
        for d in &eq.implicit_dims {
            self.visit(d);
        }
    }

    fn visit(&mut self, d: &Dimension) {
        match d.kind() {
            DimKind::Sub { .. } => self.visit_subdimension(d),
            DimKind::Conditional { .. } => self.visit_conditional(d),
            DimKind::MultiSub { .. } => self.visit_multi_subdimension(d),
            DimKind::Space { .. }
            | DimKind::Time { .. }
            | DimKind::Stepping { .. }
            | DimKind::Block { .. }
            | DimKind::Stencil { .. } => {}
        }
    }

    fn fresh(&mut self, prefix: &str) -> Symbol {
        Symbol::new(self.sregistry.make_name(prefix))
    }

    fn record(&mut self, from: &Dimension, to: Dimension) {
        debug!(dim = %from, "concretized");
        self.mapper.insert(from.clone(), to);
    }

    fn visit_subdimension(&mut self, d: &Dimension) {
        if self.mapper.contains_key(d) || d.is_concrete() {
            return;
        }
        let DimKind::Sub { parent, region, thickness, symbolic_min, symbolic_max, .. } = d.kind()
        else {
            return;
        };

        let mut tokens = Substitution::new();
        let thickness = thickness.clone().map(|t| {
            let token = self.fresh(t.token.name());
            tokens.insert(t.token.expr(), token.expr());
            Thickness { token, ..t }
        });
        let kind = DimKind::Sub {
            parent: parent.clone(),
            region: *region,
            thickness,
            symbolic_min: tokens.apply(symbolic_min),
            symbolic_max: tokens.apply(symbolic_max),
            concrete: true,
        };
        self.record(d, d.rebuild(kind));
    }

    fn visit_conditional(&mut self, d: &Dimension) {
        if self.mapper.contains_key(d) {
            return;
        }
        let DimKind::Conditional { parent, condition, factor, indirect } = d.kind() else {
            return;
        };

        self.visit(parent);
        let new_parent = self.mapper.get(parent).cloned();

        let mut new_condition = None;
        if let Some(cond) = condition {
            let dims = cond.dimensions();
            for v in &dims {
                self.visit(v);
            }
            if dims.iter().any(|v| self.mapper.contains_key(v)) {
                let mut subs = Substitution::new();
                for (from, to) in &self.mapper {
                    subs.insert_dimension(from, to);
                }
                new_condition = Some(subs.apply(cond));
            }
        }

        if new_parent.is_none() && new_condition.is_none() {
            return;
        }
        let kind = DimKind::Conditional {
            parent: new_parent.unwrap_or_else(|| parent.clone()),
            condition: new_condition.or_else(|| condition.clone()),
            factor: *factor,
            indirect: *indirect,
        };
        self.record(d, d.rebuild(kind));
    }

    fn visit_multi_subdimension(&mut self, d: &Dimension) {
        if self.mapper.contains_key(d) || d.is_concrete() {
            return;
        }
        let DimKind::MultiSub { parent, thickness, implicit_dimension, functions, .. } = d.kind()
        else {
            return;
        };

        let thickness = [self.fresh(thickness[0].name()), self.fresh(thickness[1].name())];

        let (implicit_dimension, functions) = match implicit_dimension {
            Some(idim) => {
                let (idim, functions) = self.rebuild_helper(idim, functions);
                (Some(idim), functions)
            }
            None => (None, functions.clone()),
        };

        let kind = DimKind::MultiSub {
            parent: parent.clone(),
            thickness,
            implicit_dimension,
            functions,
            concrete: true,
        };
        self.record(d, d.rebuild(kind));
    }

    /// The helper dimension gets a fresh name and the bounds array is
    /// redeclared over it, keeping its data. Done once per pair.
    fn rebuild_helper(&mut self, idim: &Dimension, functions: &Function) -> (Dimension, Function) {
        let key = (idim.clone(), functions.clone());
        if let Some(hit) = self.rebuilt.get(&key) {
            return hit.clone();
        }

        let new_idim = idim.renamed(self.sregistry.make_name(idim.name()));
        let mut data = functions.data().clone();
        data.dimensions = std::iter::once(new_idim.clone())
            .chain(functions.dimensions().iter().skip(1).cloned())
            .collect();
        data.halo = vec![(0, 0); data.dimensions.len()];
        data.padding = vec![(0, 0); data.dimensions.len()];
        if let FunctionKind::Array { origin, .. } = &mut data.kind {
            *origin = None;
        }
        let rebuilt = (new_idim, Function::from_data(data));

        self.rebuilt.insert(key, rebuilt.clone());
        rebuilt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolics::{CmpOp, Expr};

    fn interior() -> (Dimension, Dimension, Function) {
        let x = Dimension::space("x");
        let xi = Dimension::sub_middle("xi", &x, 2, 2);
        let f = Function::dense("f", vec![x.clone()], 2);
        (x, xi, f)
    }

    fn dims_of(eqs: &[Equation]) -> Vec<Dimension> {
        let mut all: IndexSet<Dimension> = IndexSet::new();
        for eq in eqs {
            all.extend(eq.dimensions());
            all.extend(eq.implicit_dims.iter().cloned());
        }
        all.into_iter().collect()
    }

    #[test]
    fn shared_subdimension_is_mapped_once() {
        let (_, xi, f) = interior();
        let eqs = vec![
            Equation::new(f.at([xi.expr()]), Expr::Int(1)),
            Equation::new(f.at([xi.expr() + 1]), Expr::Int(2)),
        ];
        let mut sregistry = SymbolRegistry::new();
        let out = concretize_subdims(&eqs, &mut sregistry);

        let dims = dims_of(&out);
        assert_eq!(dims.len(), 1);
        let new = &dims[0];
        assert_ne!(new, &xi);
        assert!(new.is_concrete());
        assert_eq!(new.name(), "xi");
        assert_eq!(new.symbolic_min().to_string(), "x_m + xi_ltkn0");
        assert_eq!(new.symbolic_max().to_string(), "x_M - xi_rtkn0");
    }

    #[test]
    fn nothing_to_concretize_returns_input() {
        let x = Dimension::space("x");
        let f = Function::dense("f", vec![x.clone()], 1);
        let eqs = vec![Equation::new(f.at([x.expr()]), Expr::Int(0))];
        let mut sregistry = SymbolRegistry::new();
        assert_eq!(concretize_subdims(&eqs, &mut sregistry), eqs);
    }

    #[test]
    fn concretization_is_a_fixed_point() {
        let (x, xi, f) = interior();
        let time = Dimension::time("time");
        let above = Expr::cmp(CmpOp::Gt, xi.expr(), x.symbolic_min());
        let cond = Dimension::conditional("xc", &xi, None, Some(above), false);
        let eqs = vec![
            Equation::new(f.at([xi.expr()]), Expr::Int(1)).with_implicit_dims(vec![cond]),
            Equation::new(f.at([x.expr()]), time.expr()),
        ];
        let mut sregistry = SymbolRegistry::new();
        let once = concretize_subdims(&eqs, &mut sregistry);
        let twice = concretize_subdims(&once, &mut sregistry);
        assert_ne!(once, eqs);
        assert_eq!(twice, once);
    }

    #[test]
    fn conditional_follows_its_remapped_parent() {
        let (x, xi, f) = interior();
        let positive = Expr::cmp(CmpOp::Gt, xi.expr(), Expr::Int(0));
        let cond = Dimension::conditional("xc", &xi, Some(2), Some(positive), false);
        let eqs = vec![
            Equation::new(f.at([x.expr()]), Expr::Int(0)).with_implicit_dims(vec![cond.clone()]),
        ];
        let mut sregistry = SymbolRegistry::new();
        let out = concretize_subdims(&eqs, &mut sregistry);

        let rebuilt = &out[0].implicit_dims[0];
        assert_eq!(rebuilt.name(), "xc");
        let parent = rebuilt.parent().unwrap();
        assert!(parent.is_concrete());
        assert_eq!(rebuilt.condition(), Some(&Expr::cmp(CmpOp::Gt, parent.expr(), Expr::Int(0))));
    }

    #[test]
    fn conditional_over_a_root_is_untouched() {
        let time = Dimension::time("time");
        let x = Dimension::space("x");
        let f = Function::dense("f", vec![x.clone()], 1);
        let cond = Dimension::conditional("t_sub", &time, Some(4), None, false);
        let eqs =
            vec![Equation::new(f.at([x.expr()]), Expr::Int(0)).with_implicit_dims(vec![cond])];
        let mut sregistry = SymbolRegistry::new();
        assert_eq!(concretize_subdims(&eqs, &mut sregistry), eqs);
    }

    #[test]
    fn multi_subdimensions_share_the_rebuilt_helper() {
        let x = Dimension::space("x");
        let n = Dimension::space("n");
        let bounds = Function::array("bounds", vec![n.clone(), Dimension::space("side")])
            .with_values(vec![1, 2, 3, 4]);
        let xa = Dimension::multi_sub("xa", &x, Some(n.clone()), bounds.clone());
        let xb = Dimension::multi_sub("xb", &x, Some(n.clone()), bounds.clone());
        let f = Function::dense("f", vec![x.clone()], 1);
        let eqs = vec![
            Equation::new(f.at([xa.expr()]), Expr::Int(0)),
            Equation::new(f.at([xb.expr()]), Expr::Int(1)),
        ];
        let mut sregistry = SymbolRegistry::new();
        let out = concretize_subdims(&eqs, &mut sregistry);

        let a = &out[0].dimensions()[0];
        let b = &out[1].dimensions()[0];
        assert_eq!(a.thickness_tokens()[0].name(), "xa_ltkn0");
        assert_eq!(b.thickness_tokens()[1].name(), "xb_rtkn0");
        assert_eq!(a.implicit_dimension(), b.implicit_dimension());
        assert_eq!(a.implicit_dimension().map(Dimension::name), Some("n0"));

        let rebuilt = a.functions().unwrap();
        assert_eq!(rebuilt.values(), bounds.values());
        assert_eq!(rebuilt.dimensions()[0].name(), "n0");
        assert!(rebuilt.halo().iter().all(|h| *h == (0, 0)));
    }

    #[test]
    fn arrays_over_remapped_dimensions_are_redeclared() {
        let (x, xi, f) = interior();
        let base = Function::dense("g", vec![x.clone()], 0);
        let mut data = Function::array("r", vec![xi.clone()]).data().clone();
        data.kind = FunctionKind::Array { initvalue: None, origin: Some(base) };
        let r = Function::from_data(data);
        let eqs = vec![Equation::new(r.at([xi.expr()]), f.at([xi.expr()]))];
        let mut sregistry = SymbolRegistry::new();
        let out = concretize_subdims(&eqs, &mut sregistry);

        let write = out[0].write().unwrap();
        assert_eq!(write.name(), "r");
        assert!(write.dimensions()[0].is_concrete());
        assert!(write.origin().is_none());
    }
}
