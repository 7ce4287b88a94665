#![forbid(unsafe_code)]

use fj_core::{DType, Literal, Primitive, Shape, TensorValue, Value};

use crate::EvalError;
use crate::type_promotion::{binary_literal_op, infer_dtype};

fn check_arity(primitive: Primitive, inputs: &[Value], expected: usize) -> Result<(), EvalError> {
    if inputs.len() != expected {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected,
            actual: inputs.len(),
        });
    }
    Ok(())
}

/// Pairs up elements of two operands, broadcasting a scalar against a
/// tensor. Tensor operands must have identical shapes.
pub(crate) fn zip_elements<R>(
    primitive: Primitive,
    lhs: &Value,
    rhs: &Value,
    mut f: impl FnMut(Literal, Literal) -> Result<R, EvalError>,
) -> Result<(Shape, Vec<R>), EvalError> {
    match (lhs, rhs) {
        (Value::Scalar(l), Value::Scalar(r)) => Ok((Shape::scalar(), vec![f(*l, *r)?])),
        (Value::Tensor(l), Value::Tensor(r)) => {
            if l.shape != r.shape {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: l.shape.clone(),
                    right: r.shape.clone(),
                });
            }
            let out = l
                .elements
                .iter()
                .zip(&r.elements)
                .map(|(a, b)| f(*a, *b))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((l.shape.clone(), out))
        }
        (Value::Scalar(l), Value::Tensor(r)) => {
            let out = r
                .elements
                .iter()
                .map(|b| f(*l, *b))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((r.shape.clone(), out))
        }
        (Value::Tensor(l), Value::Scalar(r)) => {
            let out = l
                .elements
                .iter()
                .map(|a| f(*a, *r))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((l.shape.clone(), out))
        }
    }
}

pub(crate) fn assemble(
    shape: Shape,
    elements: Vec<Literal>,
    fallback: DType,
) -> Result<Value, EvalError> {
    let dtype = infer_dtype(&elements, fallback);
    Ok(Value::from_tensor(TensorValue::new(dtype, shape, elements)?))
}

/// Binary elementwise operation dispatching on int/float paths.
#[inline]
pub(crate) fn eval_binary_elementwise(
    primitive: Primitive,
    inputs: &[Value],
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    check_arity(primitive, inputs, 2)?;
    let (shape, elements) = zip_elements(primitive, &inputs[0], &inputs[1], |a, b| {
        binary_literal_op(a, b, primitive, &int_op, &float_op)
    })?;
    assemble(shape, elements, inputs[0].dtype())
}

/// Unary elementwise operation that converts to f64 first (exp, log, sqrt, etc.).
#[inline]
pub(crate) fn eval_unary_elementwise(
    primitive: Primitive,
    inputs: &[Value],
    op: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    check_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let elements = tensor
        .elements
        .iter()
        .map(|literal| {
            literal
                .as_f64()
                .map(|x| Literal::from_f64(op(x)))
                .ok_or(EvalError::TypeMismatch {
                    primitive,
                    detail: "expected numeric elements",
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::from_tensor(TensorValue::new(
        DType::F64,
        tensor.shape,
        elements,
    )?))
}

/// Unary elementwise that keeps integers integral (neg, abs, sign).
#[inline]
pub(crate) fn eval_unary_int_or_float(
    primitive: Primitive,
    inputs: &[Value],
    int_op: impl Fn(i64) -> i64,
    float_op: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    check_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let elements = tensor
        .elements
        .iter()
        .map(|literal| match *literal {
            Literal::I64(v) => Ok(Literal::I64(int_op(v))),
            Literal::F64Bits(bits) => Ok(Literal::from_f64(float_op(f64::from_bits(bits)))),
            Literal::Bool(_) => Err(EvalError::TypeMismatch {
                primitive,
                detail: "expected numeric elements, got bool",
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::from_tensor(TensorValue::new(
        tensor.dtype,
        tensor.shape,
        elements,
    )?))
}

/// `select(pred, on_true, on_false)`. A scalar predicate picks a whole
/// operand; a tensor predicate picks per element.
pub(crate) fn eval_select(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Select;
    check_arity(primitive, inputs, 3)?;
    let (pred, on_true, on_false) = (&inputs[0], &inputs[1], &inputs[2]);
    if let Some(flag) = pred.as_bool_scalar() {
        return Ok(if flag { on_true } else { on_false }.clone());
    }
    let Value::Tensor(mask) = pred else {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "predicate must be boolean",
        });
    };
    let (shape, branches) = zip_elements(primitive, on_true, on_false, |a, b| Ok((a, b)))?;
    if shape != mask.shape && shape.rank() != 0 {
        return Err(EvalError::ShapeMismatch {
            primitive,
            left: mask.shape.clone(),
            right: shape,
        });
    }
    let elements = mask
        .elements
        .iter()
        .enumerate()
        .map(|(idx, flag)| {
            let flag = flag.as_bool().ok_or(EvalError::TypeMismatch {
                primitive,
                detail: "predicate must be boolean",
            })?;
            let (a, b) = branches[if branches.len() == 1 { 0 } else { idx }];
            Ok(if flag { a } else { b })
        })
        .collect::<Result<Vec<_>, EvalError>>()?;
    assemble(mask.shape.clone(), elements, on_true.dtype())
}

/// Contracts the last axis of `lhs` with the first axis of `rhs`.
///
/// Operands are scalars, vectors or matrices; a scalar operand scales the
/// other one.
pub(crate) fn eval_dot(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Dot;
    check_arity(primitive, inputs, 2)?;
    let mul = |a: Literal, b: Literal| binary_literal_op(a, b, primitive, &|x, y| x * y, &|x, y| x * y);
    let add = |a: Literal, b: Literal| binary_literal_op(a, b, primitive, &|x, y| x + y, &|x, y| x + y);

    let (lhs, rhs) = (inputs[0].to_tensor(), inputs[1].to_tensor());
    if lhs.rank() == 0 || rhs.rank() == 0 {
        let (shape, elements) = zip_elements(primitive, &inputs[0], &inputs[1], mul)?;
        return assemble(shape, elements, inputs[0].dtype());
    }
    if lhs.rank() > 2 || rhs.rank() > 2 {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("dot supports rank 1 and 2 operands, got {} and {}", lhs.rank(), rhs.rank()),
        });
    }

    let lhs_dims = &lhs.shape.dims;
    let rhs_dims = &rhs.shape.dims;
    let contract = lhs_dims[lhs_dims.len() - 1];
    if contract != rhs_dims[0] {
        return Err(EvalError::ShapeMismatch {
            primitive,
            left: lhs.shape.clone(),
            right: rhs.shape.clone(),
        });
    }
    let rows = if lhs.rank() == 2 { lhs_dims[0] } else { 1 };
    let cols = if rhs.rank() == 2 { rhs_dims[1] } else { 1 };
    let (contract, rows, cols) = (contract as usize, rows as usize, cols as usize);

    let zero = match (lhs.dtype, rhs.dtype) {
        (DType::I64, DType::I64) => Literal::I64(0),
        _ => Literal::from_f64(0.0),
    };
    let mut elements = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        for col in 0..cols {
            let mut acc = zero;
            for k in 0..contract {
                let product = mul(lhs.elements[row * contract + k], rhs.elements[k * cols + col])?;
                acc = add(acc, product)?;
            }
            elements.push(acc);
        }
    }

    let mut dims = Vec::with_capacity(2);
    if lhs.rank() == 2 {
        dims.push(lhs_dims[0]);
    }
    if rhs.rank() == 2 {
        dims.push(rhs_dims[1]);
    }
    assemble(Shape { dims }, elements, zero.dtype())
}
