#![forbid(unsafe_code)]

use fj_core::{DType, Literal, Primitive};

use crate::EvalError;

/// Result dtype of freshly computed elements.
///
/// All-int stays I64 and all-bool stays Bool; any mix promotes to F64. An
/// empty buffer keeps `fallback`, which is the dtype of the operand it was
/// computed from.
#[inline]
pub(crate) fn infer_dtype(elements: &[Literal], fallback: DType) -> DType {
    let Some(first) = elements.first() else {
        return fallback;
    };
    let dtype = first.dtype();
    if elements.iter().all(|literal| literal.dtype() == dtype) {
        dtype
    } else {
        DType::F64
    }
}

#[inline]
pub(crate) fn binary_literal_op(
    lhs: Literal,
    rhs: Literal,
    primitive: Primitive,
    int_op: &impl Fn(i64, i64) -> i64,
    float_op: &impl Fn(f64, f64) -> f64,
) -> Result<Literal, EvalError> {
    if let (Literal::I64(left), Literal::I64(right)) = (lhs, rhs) {
        return Ok(Literal::I64(int_op(left, right)));
    }
    let left = lhs.as_f64().ok_or(EvalError::TypeMismatch {
        primitive,
        detail: "expected numeric lhs",
    })?;
    let right = rhs.as_f64().ok_or(EvalError::TypeMismatch {
        primitive,
        detail: "expected numeric rhs",
    })?;
    Ok(Literal::from_f64(float_op(left, right)))
}

/// Bools compare as 0/1 through the integer path.
#[inline]
pub(crate) fn compare_literals(
    lhs: Literal,
    rhs: Literal,
    primitive: Primitive,
    int_cmp: &impl Fn(i64, i64) -> bool,
    float_cmp: &impl Fn(f64, f64) -> bool,
) -> Result<bool, EvalError> {
    match (lhs, rhs) {
        (Literal::I64(a), Literal::I64(b)) => Ok(int_cmp(a, b)),
        (Literal::Bool(a), Literal::Bool(b)) => Ok(int_cmp(i64::from(a), i64::from(b))),
        (left, right) => {
            let lhs_f = left.as_f64().ok_or(EvalError::TypeMismatch {
                primitive,
                detail: "expected numeric lhs for comparison",
            })?;
            let rhs_f = right.as_f64().ok_or(EvalError::TypeMismatch {
                primitive,
                detail: "expected numeric rhs for comparison",
            })?;
            Ok(float_cmp(lhs_f, rhs_f))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{binary_literal_op, compare_literals, infer_dtype};
    use fj_core::{DType, Literal, Primitive};

    #[test]
    fn mixed_elements_promote_to_float() {
        assert_eq!(infer_dtype(&[Literal::I64(1), Literal::I64(2)], DType::F64), DType::I64);
        assert_eq!(
            infer_dtype(&[Literal::I64(1), Literal::from_f64(2.0)], DType::I64),
            DType::F64
        );
        assert_eq!(infer_dtype(&[], DType::Bool), DType::Bool);
    }

    #[test]
    fn int_and_float_paths() {
        let add = |a: i64, b: i64| a + b;
        let addf = |a: f64, b: f64| a + b;
        assert_eq!(
            binary_literal_op(Literal::I64(2), Literal::I64(3), Primitive::Add, &add, &addf),
            Ok(Literal::I64(5))
        );
        assert_eq!(
            binary_literal_op(Literal::I64(2), Literal::from_f64(0.5), Primitive::Add, &add, &addf),
            Ok(Literal::from_f64(2.5))
        );
        assert!(
            binary_literal_op(Literal::Bool(true), Literal::I64(1), Primitive::Add, &add, &addf)
                .is_err()
        );
        assert_eq!(
            compare_literals(
                Literal::Bool(false),
                Literal::Bool(true),
                Primitive::Lt,
                &|a, b| a < b,
                &|a, b| a < b
            ),
            Ok(true)
        );
    }
}
