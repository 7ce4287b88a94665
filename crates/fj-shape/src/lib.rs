#![forbid(unsafe_code)]

//! Symbolic array dimensions.
//!
//! A dimension is an integer polynomial over named shape variables
//! ([`Polynomial`]). Shape specs such as `"(m, 3*n + 1)"` parse into
//! [`ShapeSpec`]s; [`bind_shapes`] recovers variable values from concrete
//! shapes and [`eval_shape`] goes the other way.

pub mod error;
pub mod eval;
pub mod monomial;
pub mod parser;
pub mod polynomial;
pub mod spec;
pub mod tree;
pub mod var;

#[cfg(test)]
pub mod proptest_strategies;

pub use error::{PolyError, ShapeError, ShapeSyntaxError};
pub use eval::{ShapeEnv, bind_shapes, env_from_names, eval_dim, eval_shape, eval_spec, finalize_spec};
pub use monomial::Monomial;
pub use parser::{parse_spec, parse_spec_in, remap_ids, resolve_ids};
pub use polynomial::{DimRing, Polynomial};
pub use spec::{DimExpr, ShapeSpec};
pub use tree::{ShapeTree, TreeDef, check_shapes};
pub use var::{DimVar, RenameContext};

#[cfg(test)]
mod tests {
    use super::proptest_strategies::{
        arb_env, arb_extreme_coefficient, arb_extreme_polynomial, arb_polynomial,
    };
    use super::{DimExpr, PolyError, Polynomial, parse_spec};
    use proptest::prelude::*;
    use proptest::test_runner::{Config as ProptestConfig, TestRunner};

    fn runner() -> TestRunner {
        TestRunner::new(ProptestConfig::with_cases(
            fj_test_utils::property_test_case_count(),
        ))
    }

    #[test]
    fn prop_evaluation_is_a_ring_homomorphism() {
        runner()
            .run(
                &(arb_polynomial(), arb_polynomial(), arb_env()),
                |(p, q, env)| {
                    let ep = p.evaluate(&env).expect("bound");
                    let eq = q.evaluate(&env).expect("bound");
                    prop_assert_eq!((&p + &q).evaluate(&env), Ok(ep + eq));
                    prop_assert_eq!((&p - &q).evaluate(&env), Ok(ep - eq));
                    prop_assert_eq!((&p * &q).evaluate(&env), Ok(ep * eq));
                    prop_assert_eq!((-&p).evaluate(&env), Ok(-ep));
                    Ok(())
                },
            )
            .expect("evaluation commutes with arithmetic");
    }

    #[test]
    fn prop_ring_laws_hold_symbolically() {
        runner()
            .run(
                &(arb_polynomial(), arb_polynomial(), arb_polynomial()),
                |(a, b, c)| {
                    prop_assert_eq!(&a + &b, &b + &a);
                    prop_assert_eq!(&a * &b, &b * &a);
                    prop_assert_eq!(&(&a * &b) * &c, &a * &(&b * &c));
                    prop_assert_eq!(&a * &(&b + &c), &(&a * &b) + &(&a * &c));
                    prop_assert_eq!(&a - &a, Polynomial::zero());
                    prop_assert_eq!(&a * 1, a.clone());
                    Ok(())
                },
            )
            .expect("polynomials form a commutative ring");
    }

    #[test]
    fn prop_rendering_reparses_to_the_same_polynomial() {
        runner()
            .run(&arb_polynomial(), |p| {
                let spec = parse_spec(&p.to_string()).expect("rendered polynomial parses");
                prop_assert_eq!(spec.dims.len(), 1);
                prop_assert_eq!(&spec.dims[0], &DimExpr::from_poly(p.clone()));
                Ok(())
            })
            .expect("render/parse fixed point");
    }

    #[test]
    fn prop_divmod_reconstructs_the_dividend() {
        runner()
            .run(&(arb_polynomial(), 1_i64..7), |(p, d)| {
                let scaled = &p * d + 5;
                let (quotient, rem) = scaled.divmod(d).expect("scaled terms divide");
                prop_assert!((0..d).contains(&rem));
                prop_assert_eq!(&quotient * d + rem, scaled);
                Ok(())
            })
            .expect("divmod inverse");
    }

    #[test]
    fn prop_constant_arithmetic_fails_exactly_when_i64_does() {
        runner()
            .run(
                &(arb_extreme_coefficient(), arb_extreme_coefficient()),
                |(a, b)| {
                    let (pa, pb) = (Polynomial::constant(a), Polynomial::constant(b));
                    prop_assert_eq!(
                        pa.checked_add(&pb).ok(),
                        a.checked_add(b).map(Polynomial::constant)
                    );
                    prop_assert_eq!(
                        pa.checked_sub(&pb).ok(),
                        a.checked_sub(b).map(Polynomial::constant)
                    );
                    prop_assert_eq!(
                        pa.checked_mul(&pb).ok(),
                        a.checked_mul(b).map(Polynomial::constant)
                    );
                    Ok(())
                },
            )
            .expect("checked arithmetic mirrors i64");
    }

    #[test]
    fn prop_parsed_sums_and_products_never_panic() {
        let coeff = (i64::MIN + 1)..=i64::MAX;
        runner()
            .run(&(coeff.clone(), coeff), |(a, b)| {
                let sum = parse_spec(&format!("{a} + {b}"));
                match a.checked_add(b) {
                    Some(expected) => {
                        prop_assert_eq!(sum.expect("fits").dims, vec![DimExpr::Const(expected)]);
                    }
                    None => prop_assert!(sum.expect_err("overflows").arithmetic.is_some()),
                }
                let product = parse_spec(&format!("{a} * n * {b}"));
                prop_assert_eq!(product.is_ok(), a.checked_mul(b).is_some());
                Ok(())
            })
            .expect("parser reports overflow as an error");
    }

    #[test]
    fn prop_extreme_polynomials_overflow_into_errors() {
        runner()
            .run(
                &(arb_extreme_polynomial(), arb_extreme_polynomial(), arb_env()),
                |(p, q, env)| {
                    for result in [p.checked_add(&q), p.checked_sub(&q), p.checked_mul(&q)] {
                        match result {
                            Ok(poly) => {
                                let _ = poly.evaluate(&env);
                            }
                            Err(err) => {
                                let expected_error = matches!(
                                    err,
                                    PolyError::Overflow { .. } | PolyError::TooManyTerms { .. }
                                );
                                prop_assert!(expected_error);
                            }
                        }
                    }
                    if let (Ok(ep), Ok(eq), Ok(sum)) =
                        (p.evaluate(&env), q.evaluate(&env), p.checked_add(&q))
                        && let Ok(value) = sum.evaluate(&env)
                    {
                        prop_assert_eq!(Some(value), ep.checked_add(eq));
                    }
                    Ok(())
                },
            )
            .expect("no panics on extreme coefficients");
    }
}
