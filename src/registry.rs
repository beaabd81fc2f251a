use crate::symbolics::{Dimension, Equation, Function};
use std::collections::{HashMap, HashSet};

/// Fresh-name minting for one compilation.
///
/// Names handed out are unique among themselves and against every name
/// reserved up front. A registry must never outlive, or be shared between,
/// compilations.
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    taken: HashSet<String>,
    counters: HashMap<String, usize>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, name: &str) {
        self.taken.insert(name.to_string());
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.taken.contains(name)
    }

    /// Reserves every name already used by `exprs`.
    pub fn reserve_equations(&mut self, exprs: &[Equation]) {
        for eq in exprs {
            let mut dims: Vec<Dimension> = eq.dimensions();
            dims.extend(eq.implicit_dims.iter().cloned());
            for f in eq.functions() {
                self.reserve_function(&f);
            }
            for d in &dims {
                self.reserve_dimension(d);
            }
            for side in eq.sides() {
                for s in side.symbols() {
                    self.reserve(s.name());
                }
            }
        }
    }

    fn reserve_function(&mut self, f: &Function) {
        self.reserve(f.name());
        for d in f.dimensions() {
            self.reserve_dimension(d);
        }
    }

    fn reserve_dimension(&mut self, d: &Dimension) {
        for d in d.defines() {
            self.reserve(d.name());
            for token in d.thickness_tokens() {
                self.reserve(token.name());
            }
            if let Some(idim) = d.implicit_dimension() {
                self.reserve(idim.name());
            }
            if let Some(f) = d.functions() {
                self.reserve(f.name());
            }
        }
    }

    /// A name starting with `prefix` never handed out or reserved before.
    pub fn make_name(&mut self, prefix: &str) -> String {
        let counter = self.counters.entry(prefix.to_string()).or_insert(0);
        loop {
            let candidate = format!("{prefix}{counter}");
            *counter += 1;
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_sequential_per_prefix() {
        let mut sregistry = SymbolRegistry::new();
        assert_eq!(sregistry.make_name("r"), "r0");
        assert_eq!(sregistry.make_name("r"), "r1");
        assert_eq!(sregistry.make_name("x_blk"), "x_blk0");
    }

    #[test]
    fn overlapping_prefixes_never_collide() {
        let mut sregistry = SymbolRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..12 {
            assert!(seen.insert(sregistry.make_name("a")));
        }
        // "a1" + "0" would clash with the tenth name minted for "a"
        assert!(seen.insert(sregistry.make_name("a1")));
        assert_eq!(seen.len(), 13);
    }

    #[test]
    fn reserved_names_are_skipped() {
        let mut sregistry = SymbolRegistry::new();
        sregistry.reserve("r0");
        assert_eq!(sregistry.make_name("r"), "r1");
        assert!(sregistry.is_taken("r1"));
    }

    #[test]
    fn registries_are_independent() {
        let mut a = SymbolRegistry::new();
        let mut b = SymbolRegistry::new();
        assert_eq!(a.make_name("t"), b.make_name("t"));
    }
}
