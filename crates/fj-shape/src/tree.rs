#![forbid(unsafe_code)]

use crate::error::ShapeError;
use crate::spec::ShapeSpec;
use serde::{Deserialize, Serialize};

/// Nested tuple/list structure of leaves, used for output declarations and
/// results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeTree<T> {
    Leaf(T),
    Tuple(Vec<ShapeTree<T>>),
    List(Vec<ShapeTree<T>>),
}

/// The structure of a tree with its leaves erased.
pub type TreeDef = ShapeTree<()>;

impl<T> ShapeTree<T> {
    #[must_use]
    pub fn num_leaves(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Tuple(items) | Self::List(items) => items.iter().map(Self::num_leaves).sum(),
        }
    }

    #[must_use]
    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::with_capacity(self.num_leaves());
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Self::Leaf(leaf) => out.push(leaf),
            Self::Tuple(items) | Self::List(items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
        }
    }

    #[must_use]
    pub fn structure(&self) -> TreeDef {
        match self {
            Self::Leaf(_) => ShapeTree::Leaf(()),
            Self::Tuple(items) => ShapeTree::Tuple(items.iter().map(Self::structure).collect()),
            Self::List(items) => ShapeTree::List(items.iter().map(Self::structure).collect()),
        }
    }

    /// Leaves in depth-first order plus the structure that holds them.
    #[must_use]
    pub fn flatten(self) -> (Vec<T>, TreeDef) {
        let def = self.structure();
        let mut leaves = Vec::with_capacity(def.num_leaves());
        self.collect_owned(&mut leaves);
        (leaves, def)
    }

    fn collect_owned(self, out: &mut Vec<T>) {
        match self {
            Self::Leaf(leaf) => out.push(leaf),
            Self::Tuple(items) | Self::List(items) => {
                for item in items {
                    item.collect_owned(out);
                }
            }
        }
    }

    pub fn map<U>(self, f: &mut impl FnMut(T) -> U) -> ShapeTree<U> {
        match self {
            Self::Leaf(leaf) => ShapeTree::Leaf(f(leaf)),
            Self::Tuple(items) => ShapeTree::Tuple(items.into_iter().map(|t| t.map(f)).collect()),
            Self::List(items) => ShapeTree::List(items.into_iter().map(|t| t.map(f)).collect()),
        }
    }

    pub fn try_map<U, E>(self, f: &mut impl FnMut(T) -> Result<U, E>) -> Result<ShapeTree<U>, E> {
        Ok(match self {
            Self::Leaf(leaf) => ShapeTree::Leaf(f(leaf)?),
            Self::Tuple(items) => ShapeTree::Tuple(
                items
                    .into_iter()
                    .map(|t| t.try_map(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::List(items) => ShapeTree::List(
                items
                    .into_iter()
                    .map(|t| t.try_map(f))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    #[must_use]
    pub fn into_leaf(self) -> Option<T> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Tuple(_) | Self::List(_) => None,
        }
    }
}

impl TreeDef {
    /// Rebuilds a tree of this structure. `None` when the leaf count differs.
    #[must_use]
    pub fn unflatten<T>(&self, leaves: Vec<T>) -> Option<ShapeTree<T>> {
        if leaves.len() != self.num_leaves() {
            return None;
        }
        let mut iter = leaves.into_iter();
        self.fill(&mut iter)
    }

    fn fill<T>(&self, iter: &mut impl Iterator<Item = T>) -> Option<ShapeTree<T>> {
        Some(match self {
            Self::Leaf(()) => ShapeTree::Leaf(iter.next()?),
            Self::Tuple(items) => {
                ShapeTree::Tuple(items.iter().map(|t| t.fill(iter)).collect::<Option<_>>()?)
            }
            Self::List(items) => {
                ShapeTree::List(items.iter().map(|t| t.fill(iter)).collect::<Option<_>>()?)
            }
        })
    }

    /// Structure with `*` for every leaf.
    #[must_use]
    pub fn describe(&self) -> String {
        self.clone().map(&mut |()| "*").to_string()
    }
}

fn write_items<T: std::fmt::Display>(
    f: &mut std::fmt::Formatter<'_>,
    items: &[ShapeTree<T>],
) -> std::fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl<T: std::fmt::Display> std::fmt::Display for ShapeTree<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leaf(leaf) => write!(f, "{leaf}"),
            Self::Tuple(items) => {
                write!(f, "(")?;
                write_items(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Self::List(items) => {
                write!(f, "[")?;
                write_items(f, items)?;
                write!(f, "]")
            }
        }
    }
}

/// Compares produced shapes against declared ones, structure included.
///
/// Declared wildcards match any size. On mismatch the error renders both
/// whole trees, e.g. `Output shapes should be [(7 n,), (n,)] but are ((n,), (n,)).`
pub fn check_shapes(
    prefix: &str,
    expected: &ShapeTree<ShapeSpec>,
    actual: &ShapeTree<ShapeSpec>,
) -> Result<(), ShapeError> {
    let consistent = expected.structure() == actual.structure()
        && expected
            .leaves()
            .into_iter()
            .zip(actual.leaves())
            .all(|(declared, produced)| declared.matches(produced));
    if consistent {
        Ok(())
    } else {
        Err(ShapeError::OutputMismatch {
            prefix: prefix.to_owned(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ShapeTree, check_shapes};
    use crate::parser::parse_spec;
    use crate::spec::ShapeSpec;

    fn leaf(text: &str) -> ShapeTree<ShapeSpec> {
        ShapeTree::Leaf(parse_spec(text).expect("valid spec"))
    }

    #[test]
    fn flatten_and_unflatten_preserve_structure() {
        let tree = ShapeTree::Tuple(vec![
            ShapeTree::Leaf(1),
            ShapeTree::List(vec![ShapeTree::Leaf(2), ShapeTree::Leaf(3)]),
        ]);
        let (leaves, def) = tree.clone().flatten();
        assert_eq!(leaves, vec![1, 2, 3]);
        assert_eq!(def.describe(), "(*, [*, *])");
        assert_eq!(def.unflatten(leaves), Some(tree));
        assert_eq!(def.unflatten(vec![1]), None);
    }

    #[test]
    fn mismatch_message_renders_both_trees() {
        let expected = ShapeTree::List(vec![leaf("7*n"), leaf("n")]);
        let actual = ShapeTree::Tuple(vec![leaf("n"), leaf("n")]);
        let err = check_shapes("Output", &expected, &actual).expect_err("mismatch");
        assert_eq!(
            err.to_string(),
            "Output shapes should be [(7 n,), (n,)] but are ((n,), (n,))."
        );
    }

    #[test]
    fn single_leaf_mismatch() {
        let err = check_shapes("Output", &leaf("n + -1"), &leaf("n")).expect_err("mismatch");
        assert_eq!(
            err.to_string(),
            "Output shapes should be (n + -1,) but are (n,)."
        );
        assert!(check_shapes("Output", &leaf("(_, n)"), &leaf("(3, n)")).is_ok());
    }

    #[test]
    fn try_map_short_circuits() {
        let tree = ShapeTree::List(vec![ShapeTree::Leaf(1), ShapeTree::Leaf(-1)]);
        let out: Result<ShapeTree<u32>, String> =
            tree.try_map(&mut |x: i32| u32::try_from(x).map_err(|_| format!("neg {x}")));
        assert_eq!(out, Err("neg -1".to_owned()));
    }
}
