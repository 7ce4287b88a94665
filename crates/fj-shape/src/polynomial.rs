#![forbid(unsafe_code)]

use crate::error::PolyError;
use crate::monomial::Monomial;
use crate::var::DimVar;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::ops::{Add, Mul, Neg, Sub};

/// Upper bound on the term pairs one polynomial product may multiply out.
pub const MAX_TERMS: usize = 1 << 16;

/// Values a polynomial can be evaluated into.
///
/// Implemented for `i64` (concrete sizes) and for [`Polynomial`] itself, so a
/// shape expression can be rewritten in terms of other shape expressions.
/// Every operation reports overflow instead of wrapping.
pub trait DimRing: Clone + std::fmt::Debug + std::fmt::Display {
    fn from_i64(value: i64) -> Self;
    fn ring_add(&self, other: &Self) -> Result<Self, PolyError>;
    fn ring_mul(&self, other: &Self) -> Result<Self, PolyError>;

    /// Square-and-multiply, so large exponents cost `O(log exp)` products.
    fn ring_pow(&self, exp: u32) -> Result<Self, PolyError> {
        let mut acc = Self::from_i64(1);
        let mut base = self.clone();
        let mut exp = exp;
        while exp > 0 {
            if exp & 1 == 1 {
                acc = acc.ring_mul(&base)?;
            }
            exp >>= 1;
            if exp > 0 {
                base = base.ring_mul(&base)?;
            }
        }
        Ok(acc)
    }
}

fn overflow(lhs: &impl std::fmt::Display, op: &'static str, rhs: &impl std::fmt::Display) -> PolyError {
    PolyError::Overflow {
        lhs: lhs.to_string(),
        op,
        rhs: rhs.to_string(),
    }
}

impl DimRing for i64 {
    fn from_i64(value: i64) -> Self {
        value
    }

    fn ring_add(&self, other: &Self) -> Result<Self, PolyError> {
        self.checked_add(*other).ok_or_else(|| overflow(self, "+", other))
    }

    fn ring_mul(&self, other: &Self) -> Result<Self, PolyError> {
        self.checked_mul(*other).ok_or_else(|| overflow(self, "*", other))
    }

    fn ring_pow(&self, exp: u32) -> Result<Self, PolyError> {
        self.checked_pow(exp).ok_or_else(|| overflow(self, "**", &exp))
    }
}

impl DimRing for Polynomial {
    fn from_i64(value: i64) -> Self {
        Polynomial::constant(value)
    }

    fn ring_add(&self, other: &Self) -> Result<Self, PolyError> {
        self.checked_add(other)
    }

    fn ring_mul(&self, other: &Self) -> Result<Self, PolyError> {
        self.checked_mul(other)
    }
}

/// Integer polynomial over shape variables, kept in canonical form: no zero
/// coefficients, one entry per distinct monomial.
///
/// The `checked_*` methods report coefficient or exponent overflow as
/// [`PolyError::Overflow`]. The `+`, `-` and `*` operators panic on overflow,
/// as the primitive integer operators do in debug builds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(Monomial, i64)>", into = "Vec<(Monomial, i64)>")]
pub struct Polynomial {
    terms: BTreeMap<Monomial, i64>,
}

impl TryFrom<Vec<(Monomial, i64)>> for Polynomial {
    type Error = PolyError;

    fn try_from(value: Vec<(Monomial, i64)>) -> Result<Self, PolyError> {
        Self::from_terms(value)
    }
}

impl From<Polynomial> for Vec<(Monomial, i64)> {
    fn from(value: Polynomial) -> Self {
        value.terms.into_iter().collect()
    }
}

impl From<i64> for Polynomial {
    fn from(value: i64) -> Self {
        Self::constant(value)
    }
}

impl From<DimVar> for Polynomial {
    fn from(value: DimVar) -> Self {
        Self::var(value)
    }
}

impl Polynomial {
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn constant(value: i64) -> Self {
        Self::single(Monomial::one(), value)
    }

    #[must_use]
    pub fn var(var: DimVar) -> Self {
        Self::single(Monomial::var(var), 1)
    }

    #[must_use]
    pub fn named(name: &str) -> Self {
        Self::var(DimVar::named(name))
    }

    fn single(mon: Monomial, coeff: i64) -> Self {
        let mut terms = BTreeMap::new();
        if coeff != 0 {
            terms.insert(mon, coeff);
        }
        Self { terms }
    }

    /// Like monomials are summed and zero coefficients dropped.
    pub fn from_terms(terms: impl IntoIterator<Item = (Monomial, i64)>) -> Result<Self, PolyError> {
        let mut out: BTreeMap<Monomial, i64> = BTreeMap::new();
        for (mon, coeff) in terms {
            let slot = out.entry(mon).or_insert(0);
            *slot = slot.ring_add(&coeff)?;
        }
        out.retain(|_, coeff| *coeff != 0);
        Ok(Self { terms: out })
    }

    /// Terms in display order: descending degree, constant last.
    pub fn terms(&self) -> impl Iterator<Item = (&Monomial, i64)> {
        self.terms.iter().map(|(mon, coeff)| (mon, *coeff))
    }

    #[must_use]
    pub fn constant_term(&self) -> i64 {
        self.terms.get(&Monomial::one()).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.terms.keys().all(Monomial::is_constant)
    }

    #[must_use]
    pub fn as_constant(&self) -> Option<i64> {
        self.is_constant().then(|| self.constant_term())
    }

    pub fn to_constant(&self) -> Result<i64, PolyError> {
        self.as_constant().ok_or_else(|| PolyError::NotConstant {
            poly: self.to_string(),
        })
    }

    #[must_use]
    pub fn degree(&self) -> u64 {
        self.terms.keys().map(Monomial::degree).max().unwrap_or(0)
    }

    #[must_use]
    pub fn variables(&self) -> BTreeSet<DimVar> {
        self.terms
            .keys()
            .flat_map(Monomial::variables)
            .cloned()
            .collect()
    }

    /// Decomposes `coeff * v + offset` when exactly one variable appears,
    /// linearly.
    #[must_use]
    pub fn as_linear(&self) -> Option<(DimVar, i64, i64)> {
        let mut linear = None;
        for (mon, coeff) in &self.terms {
            if mon.is_constant() {
                continue;
            }
            let var = mon.as_linear_var()?;
            if linear.is_some() {
                return None;
            }
            linear = Some((var.clone(), *coeff));
        }
        linear.map(|(var, coeff)| (var, coeff, self.constant_term()))
    }

    pub fn checked_add(&self, other: &Self) -> Result<Self, PolyError> {
        let mut terms = self.terms.clone();
        for (mon, coeff) in &other.terms {
            let slot = terms.entry(mon.clone()).or_insert(0);
            *slot = slot
                .checked_add(*coeff)
                .ok_or_else(|| overflow(self, "+", other))?;
        }
        terms.retain(|_, coeff| *coeff != 0);
        Ok(Self { terms })
    }

    pub fn checked_neg(&self) -> Result<Self, PolyError> {
        let terms = self
            .terms
            .iter()
            .map(|(mon, coeff)| {
                coeff
                    .checked_neg()
                    .map(|neg| (mon.clone(), neg))
                    .ok_or_else(|| overflow(&0, "-", self))
            })
            .collect::<Result<BTreeMap<_, _>, PolyError>>()?;
        Ok(Self { terms })
    }

    pub fn checked_sub(&self, other: &Self) -> Result<Self, PolyError> {
        self.checked_add(&other.checked_neg()?)
            .map_err(|_| overflow(self, "-", other))
    }

    /// Fails with [`PolyError::TooManyTerms`] before multiplying out more
    /// than [`MAX_TERMS`] term pairs.
    pub fn checked_mul(&self, other: &Self) -> Result<Self, PolyError> {
        let pairs = self.terms.len().saturating_mul(other.terms.len());
        if pairs > MAX_TERMS {
            return Err(PolyError::TooManyTerms {
                terms: pairs,
                limit: MAX_TERMS,
            });
        }
        let mut terms: BTreeMap<Monomial, i64> = BTreeMap::new();
        for (lm, lc) in &self.terms {
            for (rm, rc) in &other.terms {
                let mon = lm.checked_mul(rm)?;
                let coeff = lc
                    .checked_mul(*rc)
                    .ok_or_else(|| overflow(self, "*", other))?;
                let slot = terms.entry(mon).or_insert(0);
                *slot = slot
                    .checked_add(coeff)
                    .ok_or_else(|| overflow(self, "*", other))?;
            }
        }
        terms.retain(|_, coeff| *coeff != 0);
        Ok(Self { terms })
    }

    pub fn checked_pow(&self, exp: u32) -> Result<Self, PolyError> {
        self.ring_pow(exp)
    }

    /// Quotient and remainder by a positive integer.
    ///
    /// Every non-constant coefficient has to be a multiple of `divisor`; the
    /// constant term is split with floor semantics so the remainder lands in
    /// `0..divisor`.
    pub fn divmod(&self, divisor: i64) -> Result<(Self, i64), PolyError> {
        if divisor <= 0 {
            return Err(PolyError::NonPositiveDivisor { divisor });
        }
        let mut quotient = Vec::with_capacity(self.terms.len() + 1);
        for (mon, coeff) in &self.terms {
            if mon.is_constant() {
                continue;
            }
            if coeff % divisor != 0 {
                return Err(PolyError::InexactDivision {
                    poly: self.to_string(),
                    divisor,
                });
            }
            quotient.push((mon.clone(), coeff / divisor));
        }
        let constant = self.constant_term();
        quotient.push((Monomial::one(), constant.div_euclid(divisor)));
        Ok((Self::from_terms(quotient)?, constant.rem_euclid(divisor)))
    }

    pub fn floor_div(&self, divisor: i64) -> Result<Self, PolyError> {
        self.divmod(divisor).map(|(quotient, _)| quotient)
    }

    pub fn modulo(&self, divisor: i64) -> Result<i64, PolyError> {
        self.divmod(divisor).map(|(_, rem)| rem)
    }

    /// `self >= other` using only the fact that every shape variable is a
    /// positive integer.
    pub fn ge(&self, other: &Self) -> Result<bool, PolyError> {
        match (self.as_constant(), other.as_constant()) {
            (Some(lhs), Some(rhs)) => Ok(lhs >= rhs),
            (_, Some(rhs)) if rhs <= 1 => Ok(true),
            (Some(lhs), _) if lhs <= 0 => Ok(false),
            _ if self == other => Ok(true),
            _ => Err(PolyError::ComparisonInconclusive {
                lhs: self.to_string(),
                op: ">=",
                rhs: other.to_string(),
            }),
        }
    }

    pub fn le(&self, other: &Self) -> Result<bool, PolyError> {
        other.ge(self).map_err(|err| relabel(err, self, "<=", other))
    }

    pub fn gt(&self, other: &Self) -> Result<bool, PolyError> {
        other
            .ge(self)
            .map(|ge| !ge)
            .map_err(|err| relabel(err, self, ">", other))
    }

    pub fn lt(&self, other: &Self) -> Result<bool, PolyError> {
        self.ge(other)
            .map(|ge| !ge)
            .map_err(|err| relabel(err, self, "<", other))
    }

    /// Evaluates under `env`. Every variable must be bound.
    pub fn evaluate<T: DimRing>(&self, env: &BTreeMap<DimVar, T>) -> Result<T, PolyError> {
        let mut acc = T::from_i64(0);
        for (mon, coeff) in &self.terms {
            let mut term = T::from_i64(*coeff);
            for (var, exp) in mon.powers() {
                let value = env.get(var).ok_or_else(|| PolyError::UnboundVariable {
                    name: var.name().to_owned(),
                })?;
                term = term.ring_mul(&value.ring_pow(exp)?)?;
            }
            acc = acc.ring_add(&term)?;
        }
        Ok(acc)
    }

    /// Substitutes bound variables, leaving unbound ones in place.
    pub fn substitute(&self, env: &BTreeMap<DimVar, Polynomial>) -> Result<Self, PolyError> {
        let mut acc = Self::zero();
        for (mon, coeff) in &self.terms {
            let mut term = Self::constant(*coeff);
            for (var, exp) in mon.powers() {
                let base = env
                    .get(var)
                    .cloned()
                    .unwrap_or_else(|| Self::var(var.clone()));
                term = term.checked_mul(&base.checked_pow(exp)?)?;
            }
            acc = acc.checked_add(&term)?;
        }
        Ok(acc)
    }

    /// Fails only if `f` merges terms whose coefficients or exponents then
    /// overflow.
    pub fn rename(&self, f: &mut impl FnMut(&DimVar) -> DimVar) -> Result<Self, PolyError> {
        let terms = self
            .terms
            .iter()
            .map(|(mon, coeff)| Ok((mon.rename(f)?, *coeff)))
            .collect::<Result<Vec<_>, PolyError>>()?;
        Self::from_terms(terms)
    }
}

fn unwrap_arith(result: Result<Polynomial, PolyError>) -> Polynomial {
    match result {
        Ok(poly) => poly,
        Err(err) => panic!("{err}"),
    }
}

fn relabel(err: PolyError, lhs: &Polynomial, op: &'static str, rhs: &Polynomial) -> PolyError {
    match err {
        PolyError::ComparisonInconclusive { .. } => PolyError::ComparisonInconclusive {
            lhs: lhs.to_string(),
            op,
            rhs: rhs.to_string(),
        },
        other => other,
    }
}

impl Hash for Polynomial {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Constants hash as plain integers.
        if let Some(value) = self.as_constant() {
            value.hash(state);
        } else {
            self.terms.hash(state);
        }
    }
}

impl PartialEq<i64> for Polynomial {
    fn eq(&self, other: &i64) -> bool {
        self.as_constant() == Some(*other)
    }
}

impl PartialEq<Polynomial> for i64 {
    fn eq(&self, other: &Polynomial) -> bool {
        other == self
    }
}

impl std::fmt::Display for Polynomial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "0");
        }
        let mut first = true;
        for (mon, coeff) in &self.terms {
            if !first {
                write!(f, " + ")?;
            }
            first = false;
            if mon.is_constant() {
                write!(f, "{coeff}")?;
            } else if *coeff == 1 {
                write!(f, "{mon}")?;
            } else {
                write!(f, "{coeff} {mon}")?;
            }
        }
        Ok(())
    }
}

macro_rules! impl_poly_binop {
    ($trait:ident, $method:ident, $body:expr) => {
        impl $trait<&Polynomial> for &Polynomial {
            type Output = Polynomial;
            fn $method(self, rhs: &Polynomial) -> Polynomial {
                let f: fn(&Polynomial, &Polynomial) -> Polynomial = $body;
                f(self, rhs)
            }
        }

        impl $trait<Polynomial> for Polynomial {
            type Output = Polynomial;
            fn $method(self, rhs: Polynomial) -> Polynomial {
                (&self).$method(&rhs)
            }
        }

        impl $trait<&Polynomial> for Polynomial {
            type Output = Polynomial;
            fn $method(self, rhs: &Polynomial) -> Polynomial {
                (&self).$method(rhs)
            }
        }

        impl $trait<i64> for Polynomial {
            type Output = Polynomial;
            fn $method(self, rhs: i64) -> Polynomial {
                (&self).$method(&Polynomial::constant(rhs))
            }
        }

        impl $trait<i64> for &Polynomial {
            type Output = Polynomial;
            fn $method(self, rhs: i64) -> Polynomial {
                self.$method(&Polynomial::constant(rhs))
            }
        }

        impl $trait<Polynomial> for i64 {
            type Output = Polynomial;
            fn $method(self, rhs: Polynomial) -> Polynomial {
                (&Polynomial::constant(self)).$method(&rhs)
            }
        }
    };
}

impl_poly_binop!(Add, add, |lhs, rhs| unwrap_arith(lhs.checked_add(rhs)));
impl_poly_binop!(Sub, sub, |lhs, rhs| unwrap_arith(lhs.checked_sub(rhs)));
impl_poly_binop!(Mul, mul, |lhs, rhs| unwrap_arith(lhs.checked_mul(rhs)));

impl Neg for Polynomial {
    type Output = Polynomial;
    fn neg(self) -> Polynomial {
        unwrap_arith(self.checked_neg())
    }
}

impl Neg for &Polynomial {
    type Output = Polynomial;
    fn neg(self) -> Polynomial {
        unwrap_arith(self.checked_neg())
    }
}

#[cfg(test)]
mod tests {
    use super::{DimRing, MAX_TERMS, Polynomial};
    use crate::error::PolyError;
    use crate::var::DimVar;
    use std::collections::BTreeMap;

    fn n() -> Polynomial {
        Polynomial::named("n")
    }

    #[test]
    fn display_is_canonical() {
        let k = Polynomial::named("k");
        let m = Polynomial::named("m");
        assert_eq!((&m + &(&n() * &k)).to_string(), "k n + m");
        assert_eq!((m.clone() + k.clone() * 3).to_string(), "3 k + m");
        assert_eq!((k.clone() * k.clone() + k.clone() - 3).to_string(), "k**2 + k + -3");
        assert_eq!((n() - n()).to_string(), "0");
        assert_eq!((-n()).to_string(), "-1 n");
    }

    #[test]
    fn constants_compare_with_integers() {
        assert_eq!(Polynomial::constant(4), 4);
        assert_eq!(3, Polynomial::constant(3));
        assert_ne!(n(), 1);
        assert_eq!(Polynomial::zero(), 0);
    }

    #[test]
    fn reverse_subtraction() {
        assert_eq!(-1 - n(), -n() - 1);
        assert_eq!(2 * n(), n() + n());
    }

    #[test]
    fn divmod_splits_constant_with_floor_semantics() {
        let (q, r) = (n() * 2 + 1).divmod(2).expect("divmod");
        assert_eq!((q, r), (n(), 1));
        let (q, r) = (n() * 10).divmod(5).expect("divmod");
        assert_eq!((q, r), (n() * 2, 0));
        let (q, r) = (n() * 10 + 23).divmod(5).expect("divmod");
        assert_eq!((q, r), (n() * 2 + 4, 3));
        let (q, r) = (n() * 4 - 1).divmod(4).expect("divmod");
        assert_eq!((q, r), (n() - 1, 3));
    }

    #[test]
    fn divmod_rejects_inexact_variable_terms() {
        let err = (n() * 3).divmod(2).expect_err("3n is not divisible by 2");
        assert!(matches!(err, PolyError::InexactDivision { divisor: 2, .. }));
        let err = n().divmod(0).expect_err("zero divisor");
        assert_eq!(err, PolyError::NonPositiveDivisor { divisor: 0 });
    }

    #[test]
    fn comparisons_follow_positivity() {
        let poly = n() * 2 + 3;
        let zero = Polynomial::zero();
        let one = Polynomial::constant(1);
        assert_eq!(poly.ge(&zero), Ok(true));
        assert_eq!(poly.ge(&one), Ok(true));
        assert_eq!(poly.gt(&zero), Ok(true));
        assert_eq!(zero.lt(&poly), Ok(true));
        assert_eq!(poly.ge(&poly), Ok(true));
        assert!(poly.ge(&Polynomial::constant(2)).is_err());
        let err = poly.gt(&one).expect_err("inconclusive");
        assert_eq!(
            err.to_string(),
            "Polynomials comparison \"2 n + 3 > 1\" is inconclusive."
        );
    }

    #[test]
    fn evaluate_into_integers_and_polynomials() {
        let poly = n() * n() + n() * 3 - 1;
        let mut env = BTreeMap::new();
        env.insert(DimVar::named("n"), 4_i64);
        assert_eq!(poly.evaluate(&env), Ok(27));

        let mut sym = BTreeMap::new();
        sym.insert(DimVar::named("n"), Polynomial::named("m") + 1);
        let rewritten = poly.evaluate(&sym).expect("all variables bound");
        assert_eq!(rewritten.to_string(), "m**2 + 5 m + 3");

        let err = Polynomial::named("q").evaluate(&env).expect_err("unbound");
        assert_eq!(err, PolyError::UnboundVariable { name: "q".into() });
    }

    #[test]
    fn substitute_keeps_unbound_variables() {
        let poly = Polynomial::named("m") + n();
        let mut env = BTreeMap::new();
        env.insert(DimVar::named("n"), Polynomial::constant(2));
        assert_eq!(
            poly.substitute(&env).expect("substitute").to_string(),
            "m + 2"
        );
    }

    #[test]
    fn coefficient_overflow_is_an_error() {
        let max = Polynomial::constant(i64::MAX);
        let err = max.checked_add(&Polynomial::constant(1)).expect_err("i64::MAX + 1");
        assert!(matches!(err, PolyError::Overflow { op: "+", .. }));
        let big = n() * i64::MAX;
        assert!(big.checked_add(&n()).is_err());
        assert!(big.checked_mul(&Polynomial::constant(2)).is_err());
        assert!(Polynomial::constant(i64::MIN).checked_neg().is_err());
        assert!(Polynomial::constant(i64::MIN).checked_sub(&Polynomial::constant(1)).is_err());
        assert_eq!(
            big.checked_sub(&n()).expect("no overflow"),
            n() * (i64::MAX - 1)
        );
    }

    #[test]
    fn huge_exponents_finish_or_fail_quickly() {
        let high = n().checked_pow(u32::MAX).expect("single monomial");
        assert_eq!(high.degree(), u64::from(u32::MAX));
        assert!(high.checked_mul(&n()).is_err());

        let err = (n() + 1).checked_pow(u32::MAX).expect_err("binomial coefficients overflow");
        assert!(matches!(err, PolyError::Overflow { .. }));

        let wide = ["a", "b", "c", "d", "e", "f"]
            .into_iter()
            .fold(Polynomial::zero(), |acc, name| acc + Polynomial::named(name));
        let err = wide.checked_pow(64).expect_err("too many terms");
        assert!(matches!(err, PolyError::TooManyTerms { limit: MAX_TERMS, .. }));
    }

    #[test]
    fn concrete_evaluation_reports_overflow() {
        let mut env = BTreeMap::new();
        env.insert(DimVar::named("n"), i64::MAX / 2 + 1);
        assert!(matches!(
            (n() * 2).evaluate(&env),
            Err(PolyError::Overflow { op: "*", .. })
        ));
        assert!((n() + n() + 0).evaluate(&env).is_err());
        assert!((n() * n()).evaluate(&env).is_err());
        assert_eq!(3_i64.ring_pow(40), Err(PolyError::Overflow {
            lhs: "3".into(),
            op: "**",
            rhs: "40".into(),
        }));
        assert_eq!(3_i64.ring_pow(4), Ok(81));
    }

    #[test]
    fn deserializing_overflowing_terms_fails() {
        let json = r#"[[[], 9223372036854775807], [[], 1]]"#;
        assert!(serde_json::from_str::<Polynomial>(json).is_err());
    }

    #[test]
    fn linear_decomposition() {
        let (var, coeff, offset) = (n() * 2 + 1).as_linear().expect("linear");
        assert_eq!((var.name(), coeff, offset), ("n", 2, 1));
        assert!((n() * n()).as_linear().is_none());
        assert!((n() + Polynomial::named("m")).as_linear().is_none());
        assert!(Polynomial::constant(3).as_linear().is_none());
    }

    #[test]
    fn serde_round_trip_through_json() {
        let poly = n() * Polynomial::named("m") * 2 - 7;
        let json = serde_json::to_string(&poly).expect("serialize");
        let back: Polynomial = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, poly);
    }

    #[test]
    fn constant_hash_matches_integer_hash() {
        use rustc_hash::FxHasher;
        use std::hash::{Hash, Hasher};
        let mut a = FxHasher::default();
        Polynomial::constant(5).hash(&mut a);
        let mut b = FxHasher::default();
        5_i64.hash(&mut b);
        assert_eq!(a.finish(), b.finish());
    }
}
