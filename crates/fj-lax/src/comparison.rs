#![forbid(unsafe_code)]

use fj_core::{DType, Literal, Primitive, TensorValue, Value};

use crate::EvalError;
use crate::arithmetic::zip_elements;
use crate::type_promotion::compare_literals;

/// Comparison operators: return Bool scalars/tensors.
#[inline]
pub(crate) fn eval_comparison(
    primitive: Primitive,
    inputs: &[Value],
    int_cmp: impl Fn(i64, i64) -> bool,
    float_cmp: impl Fn(f64, f64) -> bool,
) -> Result<Value, EvalError> {
    if inputs.len() != 2 {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 2,
            actual: inputs.len(),
        });
    }
    let (shape, elements) = zip_elements(primitive, &inputs[0], &inputs[1], |l, r| {
        compare_literals(l, r, primitive, &int_cmp, &float_cmp).map(Literal::Bool)
    })?;
    Ok(Value::from_tensor(TensorValue::new(
        DType::Bool,
        shape,
        elements,
    )?))
}
