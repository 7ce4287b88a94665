#![forbid(unsafe_code)]

//! Built-in masking rules.
//!
//! A rule sees padded inputs and returns padded outputs whose logical
//! region is exact. What lies outside the logical region is unspecified
//! unless a rule says otherwise.

use crate::MaskingError;
use crate::rules::{MaskingContext, RuleRegistry};
use fj_core::{Literal, Primitive, Value};
use fj_lax::{fill_outside, read_window, reduction_identity};
use std::collections::BTreeMap;

pub(crate) fn register(registry: &mut RuleRegistry) {
    const RAW: [Primitive; 24] = [
        Primitive::Neg,
        Primitive::Abs,
        Primitive::Exp,
        Primitive::Log,
        Primitive::Sin,
        Primitive::Cos,
        Primitive::Tanh,
        Primitive::Sqrt,
        Primitive::Sign,
        Primitive::Add,
        Primitive::Sub,
        Primitive::Mul,
        Primitive::Div,
        Primitive::Max,
        Primitive::Min,
        Primitive::Pow,
        Primitive::Eq,
        Primitive::Ne,
        Primitive::Lt,
        Primitive::Le,
        Primitive::Gt,
        Primitive::Ge,
        Primitive::Select,
        Primitive::Transpose,
    ];
    for primitive in RAW {
        registry.register_masking_rule(primitive, raw);
    }
    for primitive in [
        Primitive::ReduceSum,
        Primitive::ReduceMax,
        Primitive::ReduceMin,
        Primitive::ReduceProd,
    ] {
        registry.register_masking_rule(primitive, reduce);
    }
    registry.register_masking_rule(Primitive::Cumsum, cumsum);
    registry.register_masking_rule(Primitive::Dot, dot);
    registry.register_masking_rule(Primitive::Concatenate, concatenate);
    registry.register_masking_rule(Primitive::Pad, pad);
    registry.register_masking_rule(Primitive::Slice, slice);
    registry.register_masking_rule(Primitive::Iota, iota);
    registry.register_masking_rule(Primitive::BroadcastInDim, broadcast_in_dim);
    registry.register_masking_rule(Primitive::DimSize, dim_size);
}

fn join<T: ToString>(values: impl IntoIterator<Item = T>) -> String {
    values
        .into_iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn with_params(
    ctx: &MaskingContext<'_>,
    overrides: impl IntoIterator<Item = (&'static str, String)>,
) -> BTreeMap<String, String> {
    let mut params = ctx.params().clone();
    for (key, value) in overrides {
        params.insert(key.to_owned(), value);
    }
    params
}

/// Padding cannot reach the logical region, so the primitive runs as is.
fn raw(ctx: &MaskingContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, MaskingError> {
    Ok(vec![ctx.raw(inputs, ctx.params())?])
}

/// Padding is overwritten with the reduction's identity first.
fn reduce(ctx: &MaskingContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, MaskingError> {
    let operand = inputs.first().ok_or(MaskingError::InputArity {
        expected: 1,
        actual: 0,
    })?;
    let identity = reduction_identity(ctx.primitive(), operand.dtype()).ok_or_else(|| {
        MaskingError::NotImplemented {
            primitive: ctx.primitive().as_str().to_owned(),
        }
    })?;
    let masked = fill_outside(operand, &ctx.logical_dims(0)?, identity)?;
    Ok(vec![ctx.raw(&[masked], ctx.params())?])
}

/// Zeroed padding keeps a reversed accumulation exact too.
fn cumsum(ctx: &MaskingContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, MaskingError> {
    let operand = inputs.first().ok_or(MaskingError::InputArity {
        expected: 1,
        actual: 0,
    })?;
    let masked = fill_outside(
        operand,
        &ctx.logical_dims(0)?,
        Literal::zero(operand.dtype()),
    )?;
    Ok(vec![ctx.raw(&[masked], ctx.params())?])
}

/// Both operands get zero padding so contracted padding adds nothing.
fn dot(ctx: &MaskingContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, MaskingError> {
    let masked = inputs
        .iter()
        .enumerate()
        .map(|(idx, operand)| {
            Ok(fill_outside(
                operand,
                &ctx.logical_dims(idx)?,
                Literal::zero(operand.dtype()),
            )?)
        })
        .collect::<Result<Vec<_>, MaskingError>>()?;
    Ok(vec![ctx.raw(&masked, ctx.params())?])
}

/// Logical slabs are packed back to back, then the result is padded out to
/// the padded extent of the output.
fn concatenate(ctx: &MaskingContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, MaskingError> {
    let axis = ctx.rule.usize_or("dimension", 0)?;
    let mut slabs = Vec::with_capacity(inputs.len());
    for (idx, operand) in inputs.iter().enumerate() {
        let mut dims = operand.shape().dims;
        let logical = ctx.logical_dims(idx)?;
        let rank = dims.len();
        if let (Some(dim), Some(&size)) = (dims.get_mut(axis), logical.get(axis)) {
            *dim = size;
        }
        slabs.push(read_window(
            operand,
            &vec![0; rank],
            &vec![1; rank],
            dims,
            Literal::zero(operand.dtype()),
        )?);
    }
    let packed = ctx.raw(&slabs, ctx.params())?;
    let out_dims = ctx.padded_out_dims(0)?;
    let rank = out_dims.len();
    let fill = Literal::zero(packed.dtype());
    Ok(vec![read_window(
        &packed,
        &vec![0; rank],
        &vec![1; rank],
        out_dims,
        fill,
    )?])
}

/// Places the logical low edge exactly, then overwrites everything from the
/// first padded operand element onward with the padding value.
fn pad(ctx: &MaskingContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, MaskingError> {
    let [operand, pad_value] = inputs else {
        return Err(MaskingError::InputArity {
            expected: 2,
            actual: inputs.len(),
        });
    };
    let fill = pad_value.as_scalar_literal().ok_or_else(|| {
        ctx.rule
            .invalid("padding value must be a scalar")
    })?;
    let low = ctx.logical_param("padding_low")?;
    let logical = ctx.logical_dims(0)?;
    let padded = operand.shape().dims;
    let out_dims = ctx.padded_out_dims(0)?;
    let rank = padded.len();
    let interior: Vec<i64> = match ctx.rule.usize_list("padding_interior")? {
        Some(interior) => interior
            .into_iter()
            .map(|i| {
                i64::try_from(i).map_err(|_| ctx.rule.invalid(format!("interior padding {i}")))
            })
            .collect::<Result<_, _>>()?,
        None => vec![0; rank],
    };
    if low.len() != rank || interior.len() != rank || out_dims.len() != rank {
        return Err(ctx.rule.invalid(format!("padding config does not have rank {rank}")).into());
    }

    // Edge arithmetic runs in i128: every operand is an i64 or u32.
    let mut high = Vec::with_capacity(rank);
    let mut limits = Vec::with_capacity(rank);
    for axis in 0..rank {
        let p = i128::from(padded[axis]);
        let n = i128::from(logical[axis]);
        let lo = i128::from(low[axis]);
        let gap = i128::from(interior[axis]);
        let out = i128::from(out_dims[axis]);
        let hi = out - lo - p - (p - 1).max(0) * gap;
        high.push(i64::try_from(hi).map_err(|_| {
            ctx.rule
                .invalid(format!("high padding {hi} on axis {axis} does not fit in i64"))
        })?);
        let limit = (lo + n * (gap + 1)).clamp(0, out);
        limits.push(limit as u32);
    }
    let params = with_params(
        ctx,
        [
            ("padding_low", join(&low)),
            ("padding_high", join(&high)),
            ("padding_interior", join(&interior)),
        ],
    );
    let placed = ctx.raw(&[operand.clone(), pad_value.clone()], &params)?;
    Ok(vec![fill_outside(&placed, &limits, fill)?])
}

/// Starts are logical positions; the window spans the padded output and
/// reads past the operand as zero.
fn slice(ctx: &MaskingContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, MaskingError> {
    let operand = inputs.first().ok_or(MaskingError::InputArity {
        expected: 1,
        actual: 0,
    })?;
    let starts = ctx.logical_param("start_indices")?;
    let rank = starts.len();
    let steps = ctx.rule.usize_list("strides")?.unwrap_or_else(|| vec![1; rank]);
    let out_dims = ctx.padded_out_dims(0)?;
    Ok(vec![read_window(
        operand,
        &starts,
        &steps,
        out_dims,
        Literal::zero(operand.dtype()),
    )?])
}

fn iota(ctx: &MaskingContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, MaskingError> {
    let params = with_params(ctx, [("length", join(ctx.padded_out_dims(0)?))]);
    Ok(vec![ctx.raw(inputs, &params)?])
}

fn broadcast_in_dim(
    ctx: &MaskingContext<'_>,
    inputs: &[Value],
) -> Result<Vec<Value>, MaskingError> {
    let params = with_params(ctx, [("shape", join(ctx.padded_out_dims(0)?))]);
    Ok(vec![ctx.raw(inputs, &params)?])
}

/// The logical size, not the padded one.
fn dim_size(ctx: &MaskingContext<'_>, _inputs: &[Value]) -> Result<Vec<Value>, MaskingError> {
    let dim = ctx.rule.usize_or("dim", 0)?;
    let size = ctx
        .logical
        .first()
        .and_then(|dims| dims.get(dim))
        .ok_or_else(|| ctx.rule.invalid(format!("dim {dim} out of bounds")))?;
    Ok(vec![Value::scalar_i64(*size)])
}
