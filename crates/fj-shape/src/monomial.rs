#![forbid(unsafe_code)]

use crate::error::PolyError;
use crate::var::DimVar;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Product of shape variables raised to positive powers. The empty product
/// is the constant monomial `1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<(DimVar, u32)>", into = "Vec<(DimVar, u32)>")]
pub struct Monomial {
    powers: BTreeMap<DimVar, u32>,
}

impl TryFrom<Vec<(DimVar, u32)>> for Monomial {
    type Error = PolyError;

    fn try_from(value: Vec<(DimVar, u32)>) -> Result<Self, PolyError> {
        Self::new(value)
    }
}

impl From<Monomial> for Vec<(DimVar, u32)> {
    fn from(value: Monomial) -> Self {
        value.powers.into_iter().collect()
    }
}

impl Monomial {
    #[must_use]
    pub fn one() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn var(var: DimVar) -> Self {
        Self {
            powers: BTreeMap::from([(var, 1)]),
        }
    }

    /// Repeated variables have their exponents summed; zero exponents vanish.
    pub fn new(powers: impl IntoIterator<Item = (DimVar, u32)>) -> Result<Self, PolyError> {
        let mut out = BTreeMap::new();
        for (var, exp) in powers {
            if exp == 0 {
                continue;
            }
            add_power(&mut out, var, exp)?;
        }
        Ok(Self { powers: out })
    }

    /// Total degree. Summed as `u64` so no set of `u32` exponents overflows it.
    #[must_use]
    pub fn degree(&self) -> u64 {
        self.powers.values().map(|exp| u64::from(*exp)).sum()
    }

    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.powers.is_empty()
    }

    pub fn powers(&self) -> impl Iterator<Item = (&DimVar, u32)> {
        self.powers.iter().map(|(var, exp)| (var, *exp))
    }

    pub fn variables(&self) -> impl Iterator<Item = &DimVar> {
        self.powers.keys()
    }

    /// The sole variable when this monomial is exactly `v**1`.
    #[must_use]
    pub fn as_linear_var(&self) -> Option<&DimVar> {
        match self.powers.iter().next() {
            Some((var, 1)) if self.powers.len() == 1 => Some(var),
            _ => None,
        }
    }

    pub fn checked_mul(&self, other: &Self) -> Result<Self, PolyError> {
        let mut powers = self.powers.clone();
        for (var, exp) in &other.powers {
            add_power(&mut powers, var.clone(), *exp)?;
        }
        Ok(Self { powers })
    }

    /// Fails only if `f` maps two variables to one and their exponents
    /// overflow when merged.
    pub fn rename(&self, f: &mut impl FnMut(&DimVar) -> DimVar) -> Result<Self, PolyError> {
        Self::new(self.powers.iter().map(|(var, exp)| (f(var), *exp)))
    }
}

fn add_power(powers: &mut BTreeMap<DimVar, u32>, var: DimVar, exp: u32) -> Result<(), PolyError> {
    let slot = powers.entry(var).or_insert(0);
    *slot = slot.checked_add(exp).ok_or_else(|| PolyError::Overflow {
        lhs: slot.to_string(),
        op: "+",
        rhs: exp.to_string(),
    })?;
    Ok(())
}

impl Ord for Monomial {
    /// Higher degree first, then lexicographic by variable, then by exponent.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .degree()
            .cmp(&self.degree())
            .then_with(|| self.powers.keys().cmp(other.powers.keys()))
            .then_with(|| self.powers.values().cmp(other.powers.values()))
    }
}

impl PartialOrd for Monomial {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Monomial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (var, exp) in &self.powers {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            if *exp == 1 {
                write!(f, "{var}")?;
            } else {
                write!(f, "{var}**{exp}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Monomial;
    use crate::error::PolyError;
    use crate::var::DimVar;

    fn v(name: &str) -> DimVar {
        DimVar::named(name)
    }

    #[test]
    fn display_orders_variables_and_shows_powers() {
        let mon = Monomial::new([(v("n"), 1), (v("k"), 2)]).expect("monomial");
        assert_eq!(mon.to_string(), "k**2 n");
        assert_eq!(mon.degree(), 3);
    }

    #[test]
    fn repeated_variables_merge() {
        let mon = Monomial::new([(v("k"), 1), (v("k"), 1), (v("m"), 0)]).expect("monomial");
        assert_eq!(mon, Monomial::new([(v("k"), 2)]).expect("monomial"));
        assert!(mon.as_linear_var().is_none());
    }

    #[test]
    fn higher_degree_sorts_first() {
        let quad = Monomial::new([(v("k"), 2)]).expect("monomial");
        let lin = Monomial::var(v("a"));
        assert!(quad < lin);
        assert!(lin < Monomial::one());
        assert!(Monomial::var(v("k")) < Monomial::var(v("n")));
    }

    #[test]
    fn multiplication_adds_exponents() {
        let a = Monomial::var(v("n"));
        let b = Monomial::new([(v("n"), 1), (v("m"), 1)]).expect("monomial");
        assert_eq!(a.checked_mul(&b).expect("product").to_string(), "m n**2");
        assert_eq!(a.as_linear_var(), Some(&v("n")));
    }

    #[test]
    fn exponent_overflow_is_an_error() {
        let big = Monomial::new([(v("n"), u32::MAX)]).expect("monomial");
        let err = big.checked_mul(&Monomial::var(v("n"))).expect_err("u32 exponent overflow");
        assert!(matches!(err, PolyError::Overflow { op: "+", .. }));
        assert!(Monomial::new([(v("n"), u32::MAX), (v("n"), 1)]).is_err());

        let wide = Monomial::new([(v("m"), u32::MAX), (v("n"), u32::MAX)]).expect("monomial");
        assert_eq!(wide.degree(), 2 * u64::from(u32::MAX));
    }

    #[test]
    fn renaming_two_variables_onto_one_merges_exponents() {
        let mon = Monomial::new([(v("m"), 2), (v("n"), 3)]).expect("monomial");
        let merged = mon.rename(&mut |_| v("k")).expect("no overflow");
        assert_eq!(merged.to_string(), "k**5");
        let huge = Monomial::new([(v("m"), u32::MAX), (v("n"), 1)]).expect("monomial");
        assert!(huge.rename(&mut |_| v("k")).is_err());
    }
}
