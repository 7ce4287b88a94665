#![forbid(unsafe_code)]

use fj_core::{DType, Literal, Primitive, Shape, TensorValue, Value};
use std::collections::BTreeMap;

use crate::EvalError;
use crate::tensor_ops::{parse_usize_param, row_major_strides, usize_param_or};
use crate::type_promotion::binary_literal_op;

/// Neutral element of a reduction, used to fill padding before reducing.
#[must_use]
pub fn reduction_identity(primitive: Primitive, dtype: DType) -> Option<Literal> {
    let float = dtype != DType::I64;
    Some(match primitive {
        Primitive::ReduceSum | Primitive::Cumsum => Literal::zero(dtype),
        Primitive::ReduceProd => Literal::one(dtype),
        Primitive::ReduceMax if float => Literal::from_f64(f64::NEG_INFINITY),
        Primitive::ReduceMax => Literal::I64(i64::MIN),
        Primitive::ReduceMin if float => Literal::from_f64(f64::INFINITY),
        Primitive::ReduceMin => Literal::I64(i64::MAX),
        _ => return None,
    })
}

/// Reduces along the axes listed in `axes`, or along every axis when the
/// param is absent or empty.
pub(crate) fn eval_reduce_axes(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
    int_init: i64,
    float_init: f64,
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    if inputs.len() != 1 {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 1,
            actual: inputs.len(),
        });
    }
    let tensor = inputs[0].to_tensor();
    let rank = tensor.rank();

    // An absent `axes` reduces everything; an empty list reduces nothing.
    let mut axes = match params.get("axes") {
        Some(_) => parse_usize_param(primitive, "axes", params)?,
        None => (0..rank).collect(),
    };
    axes.sort_unstable();
    axes.dedup();
    if let Some(&axis) = axes.iter().find(|&&axis| axis >= rank) {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("axis {axis} out of bounds for rank {rank}"),
        });
    }

    let kept_axes: Vec<usize> = (0..rank).filter(|axis| !axes.contains(axis)).collect();
    let out_dims: Vec<u32> = kept_axes.iter().map(|&axis| tensor.shape.dims[axis]).collect();
    let out_count: usize = out_dims.iter().map(|d| *d as usize).product();
    let strides = row_major_strides(&tensor.shape.dims);
    let out_strides = row_major_strides(&out_dims);

    let out_index = |flat: usize| -> usize {
        kept_axes
            .iter()
            .zip(&out_strides)
            .map(|(&axis, out_stride)| {
                (flat / strides[axis]) % tensor.shape.dims[axis] as usize * out_stride
            })
            .sum()
    };

    let elements = if tensor.dtype == DType::I64 {
        let mut acc = vec![int_init; out_count];
        for (flat, literal) in tensor.elements.iter().enumerate() {
            let value = literal.as_i64().ok_or(EvalError::TypeMismatch {
                primitive,
                detail: "expected i64 tensor",
            })?;
            let slot = out_index(flat);
            acc[slot] = int_op(acc[slot], value);
        }
        acc.into_iter().map(Literal::I64).collect()
    } else {
        let mut acc = vec![float_init; out_count];
        for (flat, literal) in tensor.elements.iter().enumerate() {
            let value = literal.as_f64().ok_or(EvalError::TypeMismatch {
                primitive,
                detail: "expected numeric tensor",
            })?;
            let slot = out_index(flat);
            acc[slot] = float_op(acc[slot], value);
        }
        acc.into_iter().map(Literal::from_f64).collect()
    };
    let dtype = if tensor.dtype == DType::I64 {
        DType::I64
    } else {
        DType::F64
    };
    Ok(Value::from_tensor(TensorValue::new(
        dtype,
        Shape { dims: out_dims },
        elements,
    )?))
}

/// Running accumulation along `axis` (default 0). `reverse=true`
/// accumulates from the end of the axis.
pub(crate) fn eval_cumulative(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    if inputs.len() != 1 {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 1,
            actual: inputs.len(),
        });
    }
    let Value::Tensor(tensor) = &inputs[0] else {
        return Ok(inputs[0].clone());
    };
    let rank = tensor.rank();
    let axis = usize_param_or(primitive, "axis", params, 0)?;
    if axis >= rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("axis {axis} out of bounds for rank {rank}"),
        });
    }
    let reverse = params.get("reverse").is_some_and(|raw| raw.trim() == "true");

    let axis_len = tensor.shape.dims[axis] as usize;
    let stride = row_major_strides(&tensor.shape.dims)[axis];
    let mut elements = tensor.elements.clone();
    let order: Box<dyn Iterator<Item = usize>> = if reverse {
        Box::new((0..elements.len()).rev())
    } else {
        Box::new(0..elements.len())
    };
    for flat in order {
        let pos = (flat / stride) % axis_len;
        let prev = match (reverse, pos) {
            (false, 0) => continue,
            (false, _) => flat - stride,
            (true, _) if pos + 1 == axis_len => continue,
            (true, _) => flat + stride,
        };
        elements[flat] =
            binary_literal_op(elements[prev], elements[flat], primitive, &int_op, &float_op)?;
    }
    Ok(Value::Tensor(TensorValue::new(
        tensor.dtype,
        tensor.shape.clone(),
        elements,
    )?))
}
