#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;

thread_local! {
    static NEXT_UID: Cell<u64> = const { Cell::new(1) };
}

fn next_uid() -> u64 {
    NEXT_UID.with(|cell| {
        let uid = cell.get();
        cell.set(uid + 1);
        uid
    })
}

/// A shape variable.
///
/// `uid == 0` marks a variable exactly as written in a shape spec. Variables
/// handed out by a [`RenameContext`] carry a non-zero `uid`, so two specs that
/// both say `n` can be kept apart when they come from unrelated calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimVar {
    name: String,
    uid: u64,
}

impl DimVar {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn uid(&self) -> u64 {
        self.uid
    }

    #[must_use]
    pub fn is_renamed(&self) -> bool {
        self.uid != 0
    }
}

impl std::fmt::Display for DimVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Scope that maps surface variable names to fresh, globally distinct
/// variables. The same name always maps to the same variable within one
/// context.
#[derive(Debug, Clone, Default)]
pub struct RenameContext {
    ids: BTreeMap<String, DimVar>,
}

impl RenameContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unique(&mut self, name: &str) -> DimVar {
        self.ids
            .entry(name.to_owned())
            .or_insert_with(|| DimVar {
                name: name.to_owned(),
                uid: next_uid(),
            })
            .clone()
    }

    /// A variable distinct from every other, not recorded in the scope.
    #[must_use]
    pub fn fresh(name: &str) -> DimVar {
        DimVar {
            name: name.to_owned(),
            uid: next_uid(),
        }
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&DimVar> {
        self.ids.get(name)
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&str, &DimVar)> {
        self.ids.iter().map(|(name, var)| (name.as_str(), var))
    }
}

#[cfg(test)]
mod tests {
    use super::{DimVar, RenameContext};

    #[test]
    fn same_name_in_one_context_is_one_variable() {
        let mut ctx = RenameContext::new();
        let a = ctx.unique("n");
        let b = ctx.unique("n");
        assert_eq!(a, b);
        assert!(a.is_renamed());
        assert_eq!(ctx.lookup("n"), Some(&a));
    }

    #[test]
    fn separate_contexts_do_not_collide() {
        let mut first = RenameContext::new();
        let mut second = RenameContext::new();
        let a = first.unique("n");
        let b = second.unique("n");
        assert_ne!(a, b);
        assert_eq!(a.name(), b.name());
        assert_ne!(a, DimVar::named("n"));
    }

    #[test]
    fn fresh_is_never_reused() {
        let a = RenameContext::fresh("_");
        let b = RenameContext::fresh("_");
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "_");
    }
}
