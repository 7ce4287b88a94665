use crate::monomial::Monomial;
use crate::polynomial::Polynomial;
use crate::var::DimVar;
use proptest::prelude::*;
use std::collections::BTreeMap;

pub const VAR_NAMES: [&str; 3] = ["k", "m", "n"];

pub fn arb_monomial() -> impl Strategy<Value = Monomial> {
    prop::collection::vec((0..VAR_NAMES.len(), 0_u32..3), 0..3).prop_map(|powers| {
        Monomial::new(
            powers
                .into_iter()
                .map(|(idx, exp)| (DimVar::named(VAR_NAMES[idx]), exp)),
        )
        .expect("small exponents")
    })
}

pub fn arb_polynomial() -> impl Strategy<Value = Polynomial> {
    prop::collection::vec((arb_monomial(), -20_i64..20), 0..5)
        .prop_map(|terms| Polynomial::from_terms(terms).expect("small coefficients"))
}

/// Coefficients anywhere in `i64`, mostly near the ends of the range.
pub fn arb_extreme_coefficient() -> impl Strategy<Value = i64> {
    prop_oneof![
        (i64::MAX - 64)..=i64::MAX,
        i64::MIN..=(i64::MIN + 64),
        (i64::MAX / 2 - 64)..=(i64::MAX / 2 + 64),
        any::<i64>(),
        -20_i64..20,
    ]
}

/// Like [`arb_polynomial`] but with [`arb_extreme_coefficient`]s. Terms
/// that overflow when merged are dropped.
pub fn arb_extreme_polynomial() -> impl Strategy<Value = Polynomial> {
    prop::collection::vec((arb_monomial(), arb_extreme_coefficient()), 0..4).prop_map(|terms| {
        terms
            .into_iter()
            .filter_map(|(mon, coeff)| Polynomial::from_terms([(mon, coeff)]).ok())
            .fold(Polynomial::zero(), |acc, term| {
                acc.checked_add(&term).unwrap_or(acc)
            })
    })
}

/// Positive values for every name in [`VAR_NAMES`].
pub fn arb_env() -> impl Strategy<Value = BTreeMap<DimVar, i64>> {
    prop::array::uniform3(1_i64..12).prop_map(|values| {
        VAR_NAMES
            .iter()
            .zip(values)
            .map(|(name, value)| (DimVar::named(*name), value))
            .collect()
    })
}
