#![forbid(unsafe_code)]

use fj_core::{DType, Literal, Primitive, Shape, TensorValue, Value};
use std::collections::BTreeMap;

use crate::EvalError;

fn parse_list<T: std::str::FromStr>(
    primitive: Primitive,
    key: &str,
    raw: &str,
) -> Result<Vec<T>, EvalError> {
    let raw = raw.trim().trim_start_matches('(').trim_end_matches(')');
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>().map_err(|_| EvalError::Unsupported {
                primitive,
                detail: format!("invalid integer in param '{key}': '{s}'"),
            })
        })
        .collect()
}

fn required<'a>(
    primitive: Primitive,
    key: &str,
    params: &'a BTreeMap<String, String>,
) -> Result<&'a str, EvalError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| EvalError::Unsupported {
            primitive,
            detail: format!("missing required param '{key}'"),
        })
}

/// Parse a comma-separated list of i64 values from a param string.
///
/// An empty string is an empty list and surrounding parentheses are
/// ignored, so `"(2, 3)"` and `"2,3"` read the same.
pub fn parse_i64_param(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<i64>, EvalError> {
    parse_list(primitive, key, required(primitive, key, params)?)
}

/// Parse a comma-separated list of usize values from a param string.
pub fn parse_usize_param(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<usize>, EvalError> {
    parse_list(primitive, key, required(primitive, key, params)?)
}

/// Exactly one usize value under `key`.
pub(crate) fn single_usize_param(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<usize, EvalError> {
    match parse_usize_param(primitive, key, params)?.as_slice() {
        [value] => Ok(*value),
        other => Err(EvalError::Unsupported {
            primitive,
            detail: format!("param '{key}' expects one value, got {}", other.len()),
        }),
    }
}

/// Single usize param, `default` when absent.
pub(crate) fn usize_param_or(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
    default: usize,
) -> Result<usize, EvalError> {
    if params.contains_key(key) {
        single_usize_param(primitive, key, params)
    } else {
        Ok(default)
    }
}

fn bool_param(params: &BTreeMap<String, String>, key: &str) -> bool {
    params.get(key).is_some_and(|raw| raw.trim() == "true")
}

#[must_use]
pub fn row_major_strides(dims: &[u32]) -> Vec<usize> {
    let mut strides = vec![1_usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1] as usize;
    }
    strides
}

/// Advances a row-major coordinate. Returns false after the last one.
fn next_index(index: &mut [usize], dims: &[u32]) -> bool {
    for axis in (0..index.len()).rev() {
        index[axis] += 1;
        if index[axis] < dims[axis] as usize {
            return true;
        }
        index[axis] = 0;
    }
    false
}

/// Builds a tensor of `out_dims` by pulling each element from `source`
/// through `locate`, which maps an output coordinate to a source flat
/// index. Coordinates that map to nothing take `fill`.
fn gather(
    source: &TensorValue,
    out_dims: Vec<u32>,
    fill: Literal,
    mut locate: impl FnMut(&[usize]) -> Option<usize>,
) -> Result<Value, EvalError> {
    let shape = Shape { dims: out_dims };
    let count = shape
        .element_count()
        .ok_or(fj_core::ValueError::ShapeOverflow {
            shape: shape.clone(),
        })? as usize;
    let mut elements = Vec::with_capacity(count);
    if count > 0 {
        let mut index = vec![0_usize; shape.rank()];
        loop {
            elements.push(locate(&index).map_or(fill, |flat| source.elements[flat]));
            if !next_index(&mut index, &shape.dims) {
                break;
            }
        }
    }
    Ok(Value::from_tensor(TensorValue::new(
        source.dtype,
        shape,
        elements,
    )?))
}

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

fn rank_mismatch(primitive: Primitive, key: &str, got: usize, rank: usize) -> EvalError {
    EvalError::Unsupported {
        primitive,
        detail: format!("param '{key}' has {got} entries for rank {rank}"),
    }
}

/// Reshape to `new_shape`; one entry may be `-1` and is inferred.
pub(crate) fn eval_reshape(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Reshape;
    check_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let requested = parse_i64_param(primitive, "new_shape", params)?;

    let known: i64 = requested.iter().filter(|&&d| d >= 0).product();
    let inferred = requested.iter().filter(|&&d| d == -1).count();
    let total = tensor.len() as i64;
    let dims = requested
        .iter()
        .map(|&d| match d {
            -1 if inferred == 1 && known > 0 && total % known == 0 => Ok((total / known) as u32),
            d if d >= 0 => Ok(d as u32),
            _ => Err(EvalError::Unsupported {
                primitive,
                detail: format!("cannot infer dimension in new_shape {requested:?}"),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let shape = Shape { dims };
    if shape.element_count() != Some(tensor.len() as u64) {
        return Err(EvalError::ShapeMismatch {
            primitive,
            left: tensor.shape,
            right: shape,
        });
    }
    Ok(Value::from_tensor(TensorValue::new(
        tensor.dtype,
        shape,
        tensor.elements,
    )?))
}

/// Transpose: permute the axes of a tensor.
/// Params: `permutation` (comma-separated axis indices). If absent, reverses axes.
pub(crate) fn eval_transpose(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Transpose;
    check_arity(primitive, inputs, 1)?;
    let Value::Tensor(tensor) = &inputs[0] else {
        return Ok(inputs[0].clone());
    };
    let rank = tensor.rank();
    let permutation = if params.contains_key("permutation") {
        parse_usize_param(primitive, "permutation", params)?
    } else {
        (0..rank).rev().collect()
    };
    let mut seen = vec![false; rank];
    let valid = permutation.len() == rank
        && permutation
            .iter()
            .all(|&p| p < rank && !std::mem::replace(&mut seen[p], true));
    if !valid {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("invalid permutation: {permutation:?} for rank {rank}"),
        });
    }

    let strides = row_major_strides(&tensor.shape.dims);
    let out_dims = permutation.iter().map(|&p| tensor.shape.dims[p]).collect();
    gather(tensor, out_dims, Literal::zero(tensor.dtype), |index| {
        Some(
            permutation
                .iter()
                .zip(index)
                .map(|(&axis, &coord)| coord * strides[axis])
                .sum(),
        )
    })
}

/// BroadcastInDim: broadcast a tensor to a larger shape.
/// Params: `shape` (target dims), `broadcast_dimensions` (output axis of
/// each operand axis; defaults to the trailing axes).
pub(crate) fn eval_broadcast_in_dim(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::BroadcastInDim;
    check_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let target = parse_usize_param(primitive, "shape", params)?
        .into_iter()
        .map(|d| d as u32)
        .collect::<Vec<_>>();
    let mapping = if params.contains_key("broadcast_dimensions") {
        parse_usize_param(primitive, "broadcast_dimensions", params)?
    } else {
        (target.len().saturating_sub(tensor.rank())..target.len()).collect()
    };
    if mapping.len() != tensor.rank() {
        return Err(rank_mismatch(
            primitive,
            "broadcast_dimensions",
            mapping.len(),
            tensor.rank(),
        ));
    }
    for (axis, &out_axis) in mapping.iter().enumerate() {
        let dim = tensor.shape.dims[axis];
        if out_axis >= target.len() || (dim != 1 && dim != target[out_axis]) {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: tensor.shape.clone(),
                right: Shape {
                    dims: target.clone(),
                },
            });
        }
    }

    let strides = row_major_strides(&tensor.shape.dims);
    gather(&tensor, target, Literal::zero(tensor.dtype), |index| {
        Some(
            mapping
                .iter()
                .enumerate()
                .filter(|(axis, _)| tensor.shape.dims[*axis] != 1)
                .map(|(axis, &out_axis)| index[out_axis] * strides[axis])
                .sum(),
        )
    })
}

/// Concatenate operands along `dimension`; other axes must agree.
pub(crate) fn eval_concatenate(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Concatenate;
    let Some(first) = inputs.first() else {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 1,
            actual: 0,
        });
    };
    let first = first.to_tensor();
    let rank = first.rank();
    let axis = usize_param_or(primitive, "dimension", params, 0)?;
    if axis >= rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("dimension {axis} out of bounds for rank {rank}"),
        });
    }

    let tensors: Vec<TensorValue> = inputs.iter().map(Value::to_tensor).collect();
    let mut out_dims = first.shape.dims.clone();
    out_dims[axis] = 0;
    for tensor in &tensors {
        let compatible = tensor.rank() == rank
            && (0..rank).all(|a| a == axis || tensor.shape.dims[a] == first.shape.dims[a]);
        if !compatible {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: first.shape.clone(),
                right: tensor.shape.clone(),
            });
        }
        out_dims[axis] += tensor.shape.dims[axis];
    }

    // Outer rows are the axes before `axis`; each contributes one
    // contiguous chunk per operand.
    let outer: usize = first.shape.dims[..axis].iter().map(|d| *d as usize).product();
    let mut elements = Vec::with_capacity(tensors.iter().map(TensorValue::len).sum());
    for row in 0..outer {
        for tensor in &tensors {
            let chunk: usize = tensor.shape.dims[axis..].iter().map(|d| *d as usize).product();
            elements.extend_from_slice(&tensor.elements[row * chunk..(row + 1) * chunk]);
        }
    }
    Ok(Value::Tensor(TensorValue::new(
        first.dtype,
        Shape { dims: out_dims },
        elements,
    )?))
}

/// Pad: inputs `[operand, pad_value]`, params `padding_low`,
/// `padding_high` and `padding_interior`. Negative edge padding crops.
pub(crate) fn eval_pad(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Pad;
    check_arity(primitive, inputs, 2)?;
    let tensor = inputs[0].to_tensor();
    let Some(pad_value) = inputs[1].as_scalar_literal() else {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "padding value must be a scalar",
        });
    };
    let rank = tensor.rank();
    let low = parse_i64_param(primitive, "padding_low", params)?;
    let high = parse_i64_param(primitive, "padding_high", params)?;
    let interior = if params.contains_key("padding_interior") {
        parse_i64_param(primitive, "padding_interior", params)?
    } else {
        vec![0; rank]
    };
    for (key, list) in [("padding_low", &low), ("padding_high", &high), ("padding_interior", &interior)] {
        if list.len() != rank {
            return Err(rank_mismatch(primitive, key, list.len(), rank));
        }
    }
    if interior.iter().any(|&i| i < 0) {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("negative interior padding {interior:?}"),
        });
    }

    let mut out_dims = Vec::with_capacity(rank);
    for axis in 0..rank {
        let n = i64::from(tensor.shape.dims[axis]);
        let size = low[axis] + high[axis] + n + (n - 1).max(0) * interior[axis];
        let size = u32::try_from(size).map_err(|_| EvalError::Unsupported {
            primitive,
            detail: format!("padding produces negative size {size} on axis {axis}"),
        })?;
        out_dims.push(size);
    }

    let strides = row_major_strides(&tensor.shape.dims);
    gather(&tensor, out_dims, pad_value, |index| {
        let mut flat = 0;
        for axis in 0..rank {
            let shifted = index[axis] as i64 - low[axis];
            let step = interior[axis] + 1;
            if shifted < 0 || shifted % step != 0 {
                return None;
            }
            let source = shifted / step;
            if source >= i64::from(tensor.shape.dims[axis]) {
                return None;
            }
            flat += source as usize * strides[axis];
        }
        Some(flat)
    })
}

/// Slice: params `start_indices`, `limit_indices`, optional `strides`.
pub(crate) fn eval_slice(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Slice;
    check_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let rank = tensor.rank();
    let starts = parse_usize_param(primitive, "start_indices", params)?;
    let limits = parse_usize_param(primitive, "limit_indices", params)?;
    let steps = if params.contains_key("strides") {
        parse_usize_param(primitive, "strides", params)?
    } else {
        vec![1; rank]
    };
    for (key, list) in [("start_indices", &starts), ("limit_indices", &limits), ("strides", &steps)] {
        if list.len() != rank {
            return Err(rank_mismatch(primitive, key, list.len(), rank));
        }
    }
    let mut out_dims = Vec::with_capacity(rank);
    for axis in 0..rank {
        let (start, limit, step) = (starts[axis], limits[axis], steps[axis]);
        if start > limit || limit > tensor.shape.dims[axis] as usize || step == 0 {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!(
                    "slice [{start}:{limit}:{step}] out of bounds for axis {axis} of size {}",
                    tensor.shape.dims[axis]
                ),
            });
        }
        out_dims.push((limit - start).div_ceil(step) as u32);
    }
    let starts: Vec<i64> = starts.iter().map(|&s| s as i64).collect();
    read_window(&Value::Tensor(tensor), &starts, &steps, out_dims, Literal::I64(0))
}

/// Reads a strided window of `dims` starting at `starts`.
///
/// Positions that fall outside the operand read as `fill`, so the window
/// may extend past either edge.
pub fn read_window(
    value: &Value,
    starts: &[i64],
    steps: &[usize],
    dims: Vec<u32>,
    fill: Literal,
) -> Result<Value, EvalError> {
    let tensor = value.to_tensor();
    let strides = row_major_strides(&tensor.shape.dims);
    gather(&tensor, dims, fill, |index| {
        let mut flat = 0;
        for (axis, &coord) in index.iter().enumerate() {
            let source = starts[axis] + (coord * steps[axis]) as i64;
            if source < 0 || source >= i64::from(tensor.shape.dims[axis]) {
                return None;
            }
            flat += source as usize * strides[axis];
        }
        Some(flat)
    })
}

/// Replaces every element at or beyond `logical[axis]` on any axis with
/// `fill`.
pub fn fill_outside(value: &Value, logical: &[u32], fill: Literal) -> Result<Value, EvalError> {
    let tensor = value.to_tensor();
    let strides = row_major_strides(&tensor.shape.dims);
    gather(&tensor, tensor.shape.dims.clone(), fill, |index| {
        index
            .iter()
            .zip(logical)
            .all(|(&coord, &limit)| coord < limit as usize)
            .then(|| index.iter().zip(&strides).map(|(c, s)| c * s).sum())
    })
}

/// Iota: `[0, 1, ..., length - 1]` with dtype `dtype` (default I64).
pub(crate) fn eval_iota(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Iota;
    check_arity(primitive, inputs, 0)?;
    let length = single_usize_param(primitive, "length", params)?;
    let dtype_str = params.get("dtype").map_or("i64", String::as_str);
    let (dtype, elements): (DType, Vec<Literal>) = match dtype_str {
        "I64" | "i64" => (DType::I64, (0..length as i64).map(Literal::I64).collect()),
        "F64" | "f64" => (
            DType::F64,
            (0..length).map(|i| Literal::from_f64(i as f64)).collect(),
        ),
        _ => {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!("unsupported dtype for iota: '{dtype_str}'"),
            });
        }
    };
    Ok(Value::Tensor(TensorValue::new(
        dtype,
        Shape::vector(length as u32),
        elements,
    )?))
}

/// Sort along `dimension` (default: last axis), ascending unless
/// `descending=true`.
pub(crate) fn eval_sort(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Sort;
    check_arity(primitive, inputs, 1)?;
    let Value::Tensor(tensor) = &inputs[0] else {
        return Ok(inputs[0].clone());
    };
    let rank = tensor.rank();
    if rank == 0 {
        return Ok(inputs[0].clone());
    }
    let axis = usize_param_or(primitive, "dimension", params, rank - 1)?;
    if axis >= rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("dimension {axis} out of bounds for rank {rank}"),
        });
    }
    let descending = bool_param(params, "descending");
    let axis_len = tensor.shape.dims[axis] as usize;
    let stride = row_major_strides(&tensor.shape.dims)[axis];
    let mut elements = tensor.elements.clone();

    for base in 0..elements.len() {
        if (base / stride) % axis_len.max(1) != 0 {
            continue;
        }
        let mut lane: Vec<Literal> = (0..axis_len)
            .map(|i| tensor.elements[base + i * stride])
            .collect();
        lane.sort_by(|a, b| {
            let ord = match (a, b) {
                (Literal::I64(x), Literal::I64(y)) => x.cmp(y),
                (Literal::Bool(x), Literal::Bool(y)) => x.cmp(y),
                _ => a
                    .as_f64()
                    .partial_cmp(&b.as_f64())
                    .unwrap_or(std::cmp::Ordering::Equal),
            };
            if descending { ord.reverse() } else { ord }
        });
        for (i, literal) in lane.into_iter().enumerate() {
            elements[base + i * stride] = literal;
        }
    }
    Ok(Value::Tensor(TensorValue::new(
        tensor.dtype,
        tensor.shape.clone(),
        elements,
    )?))
}

/// Size of axis `dim` as an i64 scalar.
pub(crate) fn eval_dim_size(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::DimSize;
    check_arity(primitive, inputs, 1)?;
    let shape = inputs[0].shape();
    let dim = usize_param_or(primitive, "dim", params, 0)?;
    let size = shape.dims.get(dim).ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: format!("dim {dim} out of bounds for rank {}", shape.rank()),
    })?;
    Ok(Value::scalar_i64(i64::from(*size)))
}

#[cfg(test)]
mod tests {
    use super::{fill_outside, read_window, row_major_strides};
    use fj_core::{Literal, Value};

    fn ints(value: &Value) -> Vec<i64> {
        value
            .as_tensor()
            .and_then(|t| t.to_i64_vec())
            .expect("int tensor")
    }

    #[test]
    fn strides_are_row_major() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(row_major_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn fill_outside_keeps_logical_prefix() {
        let x = Value::tensor_i64(&[2, 3], &[1, 2, 3, 4, 5, 6]).expect("tensor");
        let out = fill_outside(&x, &[2, 2], Literal::I64(0)).expect("fill");
        assert_eq!(ints(&out), vec![1, 2, 0, 4, 5, 0]);
        let out = fill_outside(&x, &[1, 3], Literal::I64(-1)).expect("fill");
        assert_eq!(ints(&out), vec![1, 2, 3, -1, -1, -1]);
    }

    #[test]
    fn read_window_fills_past_both_edges() {
        let x = Value::vector_i64(&[10, 11, 12, 13]).expect("vector");
        let out = read_window(&x, &[-1], &[1], vec![6], Literal::I64(0)).expect("window");
        assert_eq!(ints(&out), vec![0, 10, 11, 12, 13, 0]);
        let out = read_window(&x, &[1], &[2], vec![3], Literal::I64(7)).expect("window");
        assert_eq!(ints(&out), vec![11, 13, 7]);
    }
}
