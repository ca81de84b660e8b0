//! The per-record variable-scope forest.
//!
//! Scope 0 is the global scope and by construction contains exactly one
//! address range covering everything. Scope `i > 0` holds the disjoint
//! code ranges over which its variables are live. Local lookup walks
//! scopes from the innermost outwards and stops before scope 0; if it
//! descended to the global scope it would always "succeed" uselessly,
//! so globals have their own dedicated path.

use crate::cfi::ExprRef;
use crate::interner::StrRef;

/// A reference into a record's admin table of type entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeRef(u32);

pub(crate) struct TypeEnt {
    pub name: Option<StrRef>,
    pub size: u64,
}

/// Admin table of the type entries referenced by variables. Exists so
/// that sizes (and names, for descriptions) can be resolved without any
/// DIE machinery in the query path.
#[derive(Default)]
pub(crate) struct TypeTable {
    ents: Vec<TypeEnt>,
}

impl TypeTable {
    /// Register a type. Zero-sized types are refused: a variable of such
    /// a type could never contain a data address.
    pub fn add(&mut self, name: Option<StrRef>, size: u64) -> Option<TypeRef> {
        if size == 0 {
            return None;
        }
        let r = TypeRef(self.ents.len() as u32);
        self.ents.push(TypeEnt { name, size });
        Some(r)
    }

    pub fn size_of(&self, r: TypeRef) -> u64 {
        self.ents[r.0 as usize].size
    }

    pub fn name_of(&self, r: TypeRef) -> Option<StrRef> {
        self.ents[r.0 as usize].name
    }
}

/// A variable, its type, and where it lives.
#[derive(Clone, Debug)]
pub struct Variable {
    pub name: StrRef,
    pub ty: TypeRef,
    /// Location expression; may reference `FrameBase`.
    pub location: ExprRef,
    /// Expression yielding the frame base, when the location needs one.
    pub frame_base: Option<ExprRef>,
    pub file: Option<StrRef>,
    pub line: Option<u32>,
}

/// A closed interval `[min, max]` of code addresses and the variables in
/// scope throughout it.
pub struct AddrRange {
    pub min: u64,
    pub max: u64,
    vars: Vec<Variable>,
}

impl AddrRange {
    pub fn vars(&self) -> &[Variable] {
        &self.vars
    }
}

/// One nesting level: an ordered set of disjoint ranges.
#[derive(Default)]
pub(crate) struct Scope {
    ranges: Vec<AddrRange>,
}

impl Scope {
    #[cfg(test)]
    pub fn ranges(&self) -> &[AddrRange] {
        &self.ranges
    }

    pub fn range_containing(&self, avma: u64) -> Option<&AddrRange> {
        let i = self.ranges.partition_point(|r| r.min <= avma).checked_sub(1)?;
        let r = &self.ranges[i];
        (avma <= r.max).then_some(r)
    }

    /// Split the range containing `addr` (if any) so that `addr` starts
    /// a range of its own. Both halves keep the variable list.
    fn split_at(&mut self, addr: u64) {
        let Some(i) = self.ranges.partition_point(|r| r.min < addr).checked_sub(1) else {
            return;
        };
        let r = &mut self.ranges[i];
        if r.min < addr && addr <= r.max {
            let hi = AddrRange {
                min: addr,
                max: r.max,
                vars: r.vars.clone(),
            };
            r.max = addr - 1;
            self.ranges.insert(i + 1, hi);
        }
    }

    /// Add `var` as live over `[min, max]`, splitting existing ranges at
    /// the interval's edges so the set stays disjoint. Parts of the
    /// interval not covered by any range become new ranges.
    fn add_var(&mut self, min: u64, max: u64, var: &Variable) {
        debug_assert!(min <= max);
        self.split_at(min);
        if let Some(above) = max.checked_add(1) {
            self.split_at(above);
        }
        let mut cursor = min;
        let mut i = self.ranges.partition_point(|r| r.max < min);
        loop {
            if i < self.ranges.len() && self.ranges[i].min <= cursor {
                let r = &mut self.ranges[i];
                r.vars.push(var.clone());
                match r.max.checked_add(1) {
                    Some(next) if next <= max => cursor = next,
                    _ => return,
                }
            } else {
                let gap_end = if i < self.ranges.len() {
                    max.min(self.ranges[i].min - 1)
                } else {
                    max
                };
                self.ranges.insert(
                    i,
                    AddrRange {
                        min: cursor,
                        max: gap_end,
                        vars: vec![var.clone()],
                    },
                );
                match gap_end.checked_add(1) {
                    Some(next) if next <= max => cursor = next,
                    _ => return,
                }
            }
            i += 1;
        }
    }
}

/// All variable info for one record: an array of scopes, index 0 global.
#[derive(Default)]
pub(crate) struct VarInfo {
    scopes: Vec<Scope>,
}

impl VarInfo {
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    fn ensure_scope(&mut self, level: usize) {
        while self.scopes.len() <= level {
            let mut scope = Scope::default();
            if self.scopes.is_empty() {
                scope.ranges.push(AddrRange {
                    min: 0,
                    max: u64::MAX,
                    vars: Vec::new(),
                });
            }
            self.scopes.push(scope);
        }
    }

    pub fn add_global(&mut self, var: Variable) {
        self.ensure_scope(0);
        self.scopes[0].ranges[0].vars.push(var);
    }

    /// Add a local variable at nesting `level >= 1`, live over each of
    /// the given closed intervals.
    pub fn add_local(&mut self, level: usize, ranges: &[(u64, u64)], var: &Variable) {
        debug_assert!(level >= 1);
        self.ensure_scope(level);
        for &(min, max) in ranges {
            if min <= max {
                self.scopes[level].add_var(min, max, var);
            }
        }
    }

    pub fn global_vars(&self) -> &[Variable] {
        match self.scopes.first() {
            Some(s) => s.ranges[0].vars(),
            None => &[],
        }
    }

    /// The ranges bracketing `ip`, innermost scope first, never
    /// descending to the global scope.
    pub fn local_ranges_containing(&self, ip: u64) -> impl Iterator<Item = &AddrRange> {
        self.scopes
            .iter()
            .skip(1)
            .rev()
            .filter_map(move |scope| scope.range_containing(ip))
    }

    #[cfg(test)]
    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfi::ExprArena;
    use crate::interner::StringTable;

    fn var(name: StrRef, ty: TypeRef, loc: ExprRef) -> Variable {
        Variable {
            name,
            ty,
            location: loc,
            frame_base: None,
            file: None,
            line: None,
        }
    }

    #[test]
    fn split_insert_keeps_ranges_disjoint() {
        let mut strings = StringTable::new();
        let mut types = TypeTable::default();
        let mut arena = ExprArena::new();
        let ty = types.add(None, 4).unwrap();
        let loc = arena.constant(0);
        let a = var(strings.intern("a"), ty, loc);
        let b = var(strings.intern("b"), ty, loc);

        let mut vi = VarInfo::default();
        vi.add_local(1, &[(0x100, 0x1ff)], &a);
        vi.add_local(1, &[(0x180, 0x27f)], &b);

        let scope = &vi.scopes()[1];
        let spans: Vec<_> = scope
            .ranges()
            .iter()
            .map(|r| (r.min, r.max, r.vars().len()))
            .collect();
        assert_eq!(
            spans,
            vec![(0x100, 0x17f, 1), (0x180, 0x1ff, 2), (0x200, 0x27f, 1)]
        );
        for w in scope.ranges().windows(2) {
            assert!(w[0].max < w[1].min);
        }
        assert_eq!(scope.range_containing(0x190).unwrap().vars().len(), 2);
        assert!(scope.range_containing(0x280).is_none());
    }

    #[test]
    fn local_lookup_skips_global_scope() {
        let mut strings = StringTable::new();
        let mut types = TypeTable::default();
        let mut arena = ExprArena::new();
        let ty = types.add(None, 8).unwrap();
        let loc = arena.constant(0);
        let g = var(strings.intern("g"), ty, loc);
        let l = var(strings.intern("l"), ty, loc);

        let mut vi = VarInfo::default();
        vi.add_global(g);
        vi.add_local(2, &[(0x400, 0x4ff)], &l);

        // Global scope never shows up in the local walk, even though its
        // range covers every address.
        assert_eq!(vi.local_ranges_containing(0x7000_0000).count(), 0);
        let hits: Vec<_> = vi.local_ranges_containing(0x450).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].vars().len(), 1);
        assert_eq!(vi.global_vars().len(), 1);
    }

    #[test]
    fn innermost_scope_comes_first() {
        let mut strings = StringTable::new();
        let mut types = TypeTable::default();
        let mut arena = ExprArena::new();
        let ty = types.add(None, 4).unwrap();
        let loc = arena.constant(0);
        let outer_name = strings.intern("outer");
        let inner_name = strings.intern("inner");
        let outer = var(outer_name, ty, loc);
        let inner = var(inner_name, ty, loc);

        let mut vi = VarInfo::default();
        vi.add_local(1, &[(0x100, 0x2ff)], &outer);
        vi.add_local(2, &[(0x180, 0x1ff)], &inner);

        let names: Vec<_> = vi
            .local_ranges_containing(0x190)
            .map(|r| r.vars()[0].name)
            .collect();
        assert_eq!(names, vec![inner_name, outer_name]);
    }
}
