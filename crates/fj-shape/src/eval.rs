#![forbid(unsafe_code)]

use crate::error::{PolyError, ShapeError};
use crate::polynomial::DimRing;
use crate::spec::{DimExpr, ShapeSpec};
use crate::var::DimVar;
use fj_core::Shape;
use std::collections::BTreeMap;

/// Assignment of values to shape variables.
pub type ShapeEnv<T = i64> = BTreeMap<DimVar, T>;

/// Builds an environment keyed by surface names.
#[must_use]
pub fn env_from_names<T: Clone>(pairs: &[(&str, T)]) -> ShapeEnv<T> {
    pairs
        .iter()
        .map(|(name, value)| (DimVar::named(*name), value.clone()))
        .collect()
}

/// `None` for a wildcard axis.
pub fn eval_dim<T: DimRing>(dim: &DimExpr, env: &ShapeEnv<T>) -> Result<Option<T>, PolyError> {
    match dim {
        DimExpr::Const(value) => Ok(Some(T::from_i64(*value))),
        DimExpr::Wildcard => Ok(None),
        DimExpr::Poly(poly) => poly.evaluate(env).map(Some),
    }
}

fn render_sizes<T: std::fmt::Display>(sizes: &[T]) -> String {
    let parts: Vec<String> = sizes.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

/// Evaluates every axis. Wildcards take the matching entry of `actual`.
pub fn eval_spec<T: DimRing>(
    spec: &ShapeSpec,
    env: &ShapeEnv<T>,
    actual: Option<&[T]>,
) -> Result<Vec<T>, ShapeError> {
    if let Some(actual) = actual
        && actual.len() != spec.rank()
    {
        return Err(ShapeError::RankMismatch {
            spec: spec.to_string(),
            actual: render_sizes(actual),
        });
    }
    spec.iter()
        .enumerate()
        .map(|(axis, dim)| match eval_dim(dim, env)? {
            Some(value) => Ok(value),
            None => actual
                .map(|actual| actual[axis].clone())
                .ok_or_else(|| ShapeError::UnresolvedWildcard {
                    spec: spec.to_string(),
                }),
        })
        .collect()
}

/// Concrete array shape of `spec` under `env`.
pub fn eval_shape(spec: &ShapeSpec, env: &ShapeEnv) -> Result<Shape, ShapeError> {
    let dims = eval_spec(spec, env, None)?;
    spec.iter()
        .zip(dims)
        .map(|(dim, value)| {
            u32::try_from(value).map_err(|_| ShapeError::NegativeDimension {
                dim: dim.to_string(),
                value,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|dims| Shape { dims })
}

/// Replaces wildcard axes with the sizes of `shape`.
pub fn finalize_spec(spec: &ShapeSpec, shape: &Shape) -> Result<ShapeSpec, ShapeError> {
    if spec.rank() != shape.rank() {
        return Err(ShapeError::RankMismatch {
            spec: spec.to_string(),
            actual: render_sizes(&shape.dims),
        });
    }
    Ok(spec
        .iter()
        .zip(&shape.dims)
        .map(|(dim, actual)| match dim {
            DimExpr::Wildcard => DimExpr::Const(i64::from(*actual)),
            other => other.clone(),
        })
        .collect())
}

/// Infers shape-variable values from concrete shapes.
///
/// Every polymorphic axis must be linear in a single variable
/// (`a * v + b` with `a > 0`); the variable's value is recovered exactly or
/// the call fails. A variable bound twice must get the same value both
/// times.
pub fn bind_shapes(specs: &[ShapeSpec], shapes: &[Shape]) -> Result<ShapeEnv, ShapeError> {
    let mut env = ShapeEnv::new();
    for (spec, shape) in specs.iter().zip(shapes) {
        if spec.rank() != shape.rank() {
            return Err(ShapeError::RankMismatch {
                spec: spec.to_string(),
                actual: render_sizes(&shape.dims),
            });
        }
        for (dim, actual) in spec.iter().zip(&shape.dims) {
            let actual = i64::from(*actual);
            match dim {
                DimExpr::Wildcard => {}
                DimExpr::Const(value) => {
                    if *value != actual {
                        return Err(ShapeError::DimMismatch {
                            dim: dim.to_string(),
                            actual,
                        });
                    }
                }
                DimExpr::Poly(poly) => {
                    let Some((var, coeff, offset)) = poly.as_linear() else {
                        return Err(ShapeError::NonLinearDim {
                            dim: dim.to_string(),
                        });
                    };
                    // A smaller logical value would need a larger array.
                    if coeff < 0 {
                        return Err(ShapeError::DecreasingDim {
                            dim: dim.to_string(),
                        });
                    }
                    let shifted = actual.checked_sub(offset).ok_or_else(|| PolyError::Overflow {
                        lhs: actual.to_string(),
                        op: "-",
                        rhs: offset.to_string(),
                    })?;
                    if shifted % coeff != 0 {
                        return Err(ShapeError::IndivisibleDim {
                            dim: dim.to_string(),
                            actual,
                        });
                    }
                    let value = shifted / coeff;
                    match env.get(&var) {
                        Some(first) if *first != value => {
                            return Err(ShapeError::InconsistentBinding {
                                var: var.to_string(),
                                first: *first,
                                second: value,
                            });
                        }
                        Some(_) => {}
                        None => {
                            env.insert(var, value);
                        }
                    }
                }
            }
        }
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::{bind_shapes, env_from_names, eval_shape, eval_spec, finalize_spec};
    use crate::error::{PolyError, ShapeError};
    use crate::parser::parse_spec;
    use crate::polynomial::Polynomial;
    use crate::spec::DimExpr;
    use fj_core::Shape;

    fn spec(text: &str) -> crate::spec::ShapeSpec {
        parse_spec(text).expect("valid spec")
    }

    #[test]
    fn evaluates_polynomial_axes() {
        let env = env_from_names(&[("m", 2_i64), ("n", 5)]);
        let shape = eval_shape(&spec("(m, 3*n + 1, 4)"), &env).expect("evaluates");
        assert_eq!(shape, Shape::from_dims(&[2, 16, 4]));
    }

    #[test]
    fn negative_sizes_are_rejected() {
        let env = env_from_names(&[("n", 1_i64)]);
        let err = eval_shape(&spec("n - 3"), &env).expect_err("negative");
        assert_eq!(
            err,
            ShapeError::NegativeDimension {
                dim: "n + -3".into(),
                value: -2
            }
        );
    }

    #[test]
    fn wildcards_take_actual_sizes() {
        let env = env_from_names(&[("n", 3_i64)]);
        let dims = eval_spec(&spec("(_, n)"), &env, Some(&[9, 0])).expect("evaluates");
        assert_eq!(dims, vec![9, 3]);
        let err = eval_spec(&spec("(_, n)"), &env, None).expect_err("no actual");
        assert!(matches!(err, ShapeError::UnresolvedWildcard { .. }));
        let err = eval_spec(&spec("(_, n)"), &env, Some(&[9, 0, 4])).expect_err("rank 3");
        assert_eq!(
            err,
            ShapeError::RankMismatch {
                spec: "(_, n)".into(),
                actual: "[9, 0, 4]".into(),
            }
        );
        assert_eq!(
            err.to_string(),
            "shape spec (_, n) does not have the rank of array shape [9, 0, 4]"
        );
    }

    #[test]
    fn evaluation_overflow_is_an_error() {
        let env = env_from_names(&[("n", i64::MAX / 2 + 1)]);
        let err = eval_shape(&spec("2*n"), &env).expect_err("overflow");
        assert!(matches!(err, ShapeError::Poly(PolyError::Overflow { .. })));
        let err = eval_spec(&spec("(n**3, 1)"), &env, None).expect_err("overflow");
        assert!(matches!(err, ShapeError::Poly(PolyError::Overflow { .. })));
        let env = env_from_names(&[("n", i64::MAX)]);
        assert!(eval_spec(&spec("n + 1"), &env, None).is_err());
    }

    #[test]
    fn symbolic_evaluation_rewrites_variables() {
        let env = env_from_names(&[("n", Polynomial::named("k") * 2)]);
        let dims = eval_spec(&spec("(n + 1, 7)"), &env, None).expect("evaluates");
        assert_eq!(dims[0].to_string(), "2 k + 1");
        assert_eq!(dims[1], 7);
    }

    #[test]
    fn finalize_fills_wildcards() {
        let finalized = finalize_spec(&spec("(_, n)"), &Shape::from_dims(&[4, 2])).expect("ok");
        assert_eq!(finalized.dims[0], DimExpr::Const(4));
        assert_eq!(finalized.to_string(), "(4, n)");
        assert!(finalize_spec(&spec("n"), &Shape::from_dims(&[1, 2])).is_err());
    }

    #[test]
    fn binds_linear_dims() {
        let env = bind_shapes(
            &[spec("(n, 2*m + 1)"), spec("(_, 3)")],
            &[Shape::from_dims(&[5, 9]), Shape::from_dims(&[10, 3])],
        )
        .expect("binds");
        assert_eq!(env, env_from_names(&[("m", 4_i64), ("n", 5)]));
    }

    #[test]
    fn conflicting_bindings_fail() {
        let err = bind_shapes(
            &[spec("n"), spec("n")],
            &[Shape::vector(5), Shape::vector(6)],
        )
        .expect_err("5 vs 6");
        assert_eq!(
            err,
            ShapeError::InconsistentBinding {
                var: "n".into(),
                first: 5,
                second: 6
            }
        );
    }

    #[test]
    fn binding_rejects_unsupported_dims() {
        let err = bind_shapes(&[spec("n*m")], &[Shape::vector(6)]).expect_err("nonlinear");
        assert!(matches!(err, ShapeError::NonLinearDim { .. }));
        let err = bind_shapes(&[spec("2*n")], &[Shape::vector(7)]).expect_err("odd");
        assert!(matches!(err, ShapeError::IndivisibleDim { actual: 7, .. }));
        let err = bind_shapes(&[spec("3")], &[Shape::vector(4)]).expect_err("const");
        assert!(matches!(err, ShapeError::DimMismatch { actual: 4, .. }));
    }

    #[test]
    fn binding_rejects_decreasing_dims() {
        let err = bind_shapes(&[spec("10 - n")], &[Shape::vector(7)]).expect_err("decreasing");
        assert_eq!(
            err,
            ShapeError::DecreasingDim {
                dim: "-1 n + 10".into()
            }
        );
        let err = bind_shapes(&[spec("(m, -2*m + 20)")], &[Shape::from_dims(&[3, 14])])
            .expect_err("second axis decreases");
        assert!(matches!(err, ShapeError::DecreasingDim { .. }));
        let env = bind_shapes(&[spec("n - 3")], &[Shape::vector(7)]).expect("offset only");
        assert_eq!(env, env_from_names(&[("n", 10_i64)]));
    }

    #[test]
    fn binding_offsets_that_overflow_fail() {
        let err = bind_shapes(&[spec("n + -9223372036854775807 - 1")], &[Shape::vector(7)])
            .expect_err("7 - i64::MIN overflows");
        assert!(matches!(err, ShapeError::Poly(PolyError::Overflow { op: "-", .. })));
    }
}
