#![forbid(unsafe_code)]

use crate::error::PolyError;
use crate::polynomial::Polynomial;
use crate::var::DimVar;
use serde::{Deserialize, Serialize};

/// One axis of a [`ShapeSpec`].
///
/// Constant polynomials are always stored as `Const`, so equality on
/// `DimExpr` is equality of the expressions they denote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimExpr {
    Const(i64),
    /// `_`: matches any concrete size.
    Wildcard,
    Poly(Polynomial),
}

impl DimExpr {
    #[must_use]
    pub fn from_poly(poly: Polynomial) -> Self {
        match poly.as_constant() {
            Some(value) => Self::Const(value),
            None => Self::Poly(poly),
        }
    }

    #[must_use]
    pub fn var(name: &str) -> Self {
        Self::Poly(Polynomial::named(name))
    }

    #[must_use]
    pub fn as_poly(&self) -> Option<Polynomial> {
        match self {
            Self::Const(value) => Some(Polynomial::constant(*value)),
            Self::Wildcard => None,
            Self::Poly(poly) => Some(poly.clone()),
        }
    }

    #[must_use]
    pub fn as_const(&self) -> Option<i64> {
        match self {
            Self::Const(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard)
    }

    #[must_use]
    pub fn is_polymorphic(&self) -> bool {
        matches!(self, Self::Poly(_))
    }

    pub fn rename(&self, f: &mut impl FnMut(&DimVar) -> DimVar) -> Result<Self, PolyError> {
        Ok(match self {
            Self::Poly(poly) => Self::from_poly(poly.rename(f)?),
            other => other.clone(),
        })
    }
}

impl From<i64> for DimExpr {
    fn from(value: i64) -> Self {
        Self::Const(value)
    }
}

impl From<Polynomial> for DimExpr {
    fn from(value: Polynomial) -> Self {
        Self::from_poly(value)
    }
}

impl std::fmt::Display for DimExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Const(value) => write!(f, "{value}"),
            Self::Wildcard => write!(f, "_"),
            Self::Poly(poly) => write!(f, "{poly}"),
        }
    }
}

/// Ordered per-axis dimension expressions of one array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeSpec {
    pub dims: Vec<DimExpr>,
}

impl ShapeSpec {
    #[must_use]
    pub fn new(dims: Vec<DimExpr>) -> Self {
        Self { dims }
    }

    #[must_use]
    pub fn scalar() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_consts(dims: &[u32]) -> Self {
        Self::new(
            dims.iter()
                .map(|dim| DimExpr::Const(i64::from(*dim)))
                .collect(),
        )
    }

    #[must_use]
    pub fn from_polys(dims: impl IntoIterator<Item = Polynomial>) -> Self {
        Self::new(dims.into_iter().map(DimExpr::from_poly).collect())
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DimExpr> {
        self.dims.iter()
    }

    #[must_use]
    pub fn has_wildcards(&self) -> bool {
        self.dims.iter().any(DimExpr::is_wildcard)
    }

    #[must_use]
    pub fn is_polymorphic(&self) -> bool {
        self.dims.iter().any(DimExpr::is_polymorphic)
    }

    /// Every axis as a polynomial, or `None` if any axis is a wildcard.
    #[must_use]
    pub fn to_polys(&self) -> Option<Vec<Polynomial>> {
        self.dims.iter().map(DimExpr::as_poly).collect()
    }

    /// Every axis as an integer, or `None` if any axis is symbolic.
    #[must_use]
    pub fn to_consts(&self) -> Option<Vec<i64>> {
        self.dims.iter().map(DimExpr::as_const).collect()
    }

    pub fn rename(&self, f: &mut impl FnMut(&DimVar) -> DimVar) -> Result<Self, PolyError> {
        let dims = self
            .dims
            .iter()
            .map(|dim| dim.rename(f))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(dims))
    }

    /// Same rank and every axis equal, wildcards on either side matching
    /// anything.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.rank() == other.rank()
            && self
                .dims
                .iter()
                .zip(&other.dims)
                .all(|(a, b)| a.is_wildcard() || b.is_wildcard() || a == b)
    }
}

impl FromIterator<DimExpr> for ShapeSpec {
    fn from_iter<I: IntoIterator<Item = DimExpr>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl std::fmt::Display for ShapeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        if self.dims.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::{DimExpr, ShapeSpec};
    use crate::polynomial::Polynomial;

    #[test]
    fn tuple_style_display() {
        assert_eq!(ShapeSpec::scalar().to_string(), "()");
        assert_eq!(ShapeSpec::new(vec![DimExpr::var("n")]).to_string(), "(n,)");
        let spec = ShapeSpec::new(vec![
            DimExpr::var("m"),
            DimExpr::from_poly(Polynomial::named("n") * 3 + 1),
            DimExpr::Wildcard,
        ]);
        assert_eq!(spec.to_string(), "(m, 3 n + 1, _)");
    }

    #[test]
    fn constant_polynomials_normalize() {
        let dim = DimExpr::from_poly(Polynomial::named("n") - Polynomial::named("n") + 4);
        assert_eq!(dim, DimExpr::Const(4));
        assert!(!dim.is_polymorphic());
    }

    #[test]
    fn wildcards_match_anything() {
        let pattern = ShapeSpec::new(vec![DimExpr::Wildcard, DimExpr::var("n")]);
        let actual = ShapeSpec::new(vec![DimExpr::Const(7), DimExpr::var("n")]);
        assert!(pattern.matches(&actual));
        assert!(!pattern.matches(&ShapeSpec::from_consts(&[7, 3])));
        assert!(!pattern.matches(&ShapeSpec::from_consts(&[7])));
        assert!(pattern.has_wildcards());
        assert!(pattern.to_polys().is_none());
    }
}
