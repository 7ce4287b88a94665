#![forbid(unsafe_code)]

mod arithmetic;
mod comparison;
mod reduction;
mod tensor_ops;
mod type_promotion;

use fj_core::{Primitive, Shape, Value, ValueError};
use std::collections::BTreeMap;

use arithmetic::{eval_binary_elementwise, eval_dot, eval_select, eval_unary_elementwise, eval_unary_int_or_float};
use comparison::eval_comparison;
use reduction::{eval_cumulative, eval_reduce_axes};
use tensor_ops::{
    eval_broadcast_in_dim, eval_concatenate, eval_dim_size, eval_iota, eval_pad, eval_reshape,
    eval_slice, eval_sort, eval_transpose,
};

pub use reduction::reduction_identity;
pub use tensor_ops::{
    fill_outside, parse_i64_param, parse_usize_param, read_window, row_major_strides,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    ArityMismatch {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    TypeMismatch {
        primitive: Primitive,
        detail: &'static str,
    },
    ShapeMismatch {
        primitive: Primitive,
        left: Shape,
        right: Shape,
    },
    Unsupported {
        primitive: Primitive,
        detail: String,
    },
    InvalidTensor(ValueError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch {
                primitive,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "arity mismatch for {}: expected {}, got {}",
                    primitive.as_str(),
                    expected,
                    actual
                )
            }
            Self::TypeMismatch { primitive, detail } => {
                write!(f, "type mismatch for {}: {}", primitive.as_str(), detail)
            }
            Self::ShapeMismatch {
                primitive,
                left,
                right,
            } => {
                write!(
                    f,
                    "shape mismatch for {}: left={:?} right={:?}",
                    primitive.as_str(),
                    left.dims,
                    right.dims
                )
            }
            Self::Unsupported { primitive, detail } => {
                write!(f, "unsupported {} behavior: {}", primitive.as_str(), detail)
            }
            Self::InvalidTensor(err) => write!(f, "invalid tensor: {err}"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<ValueError> for EvalError {
    fn from(value: ValueError) -> Self {
        Self::InvalidTensor(value)
    }
}

/// Evaluates one first-order primitive on concrete values.
///
/// Shape-valued params must already be plain integers here. `scan` and
/// `pjit` carry bodies and are evaluated by the interpreter, not this
/// function.
#[inline]
pub fn eval_primitive(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    match primitive {
        // Unary
        Primitive::Neg => eval_unary_int_or_float(primitive, inputs, |x| -x, |x| -x),
        Primitive::Abs => eval_unary_int_or_float(primitive, inputs, i64::abs, f64::abs),
        Primitive::Sign => eval_unary_int_or_float(
            primitive,
            inputs,
            i64::signum,
            |x| {
                if x.is_nan() || x == 0.0 { x } else { x.signum() }
            },
        ),
        Primitive::Exp => eval_unary_elementwise(primitive, inputs, f64::exp),
        Primitive::Log => eval_unary_elementwise(primitive, inputs, f64::ln),
        Primitive::Sin => eval_unary_elementwise(primitive, inputs, f64::sin),
        Primitive::Cos => eval_unary_elementwise(primitive, inputs, f64::cos),
        Primitive::Tanh => eval_unary_elementwise(primitive, inputs, f64::tanh),
        Primitive::Sqrt => eval_unary_elementwise(primitive, inputs, f64::sqrt),
        // Binary
        Primitive::Add => eval_binary_elementwise(primitive, inputs, |a, b| a + b, |a, b| a + b),
        Primitive::Sub => eval_binary_elementwise(primitive, inputs, |a, b| a - b, |a, b| a - b),
        Primitive::Mul => eval_binary_elementwise(primitive, inputs, |a, b| a * b, |a, b| a * b),
        Primitive::Div => eval_binary_elementwise(
            primitive,
            inputs,
            |a, b| if b != 0 { a / b } else { 0 },
            |a, b| a / b,
        ),
        Primitive::Max => eval_binary_elementwise(primitive, inputs, i64::max, f64::max),
        Primitive::Min => eval_binary_elementwise(primitive, inputs, i64::min, f64::min),
        Primitive::Pow => eval_binary_elementwise(
            primitive,
            inputs,
            |a, b| u32::try_from(b).map_or(0, |exp| a.pow(exp)),
            f64::powf,
        ),
        // Comparison
        Primitive::Eq => eval_comparison(primitive, inputs, |a, b| a == b, |a, b| a == b),
        Primitive::Ne => eval_comparison(primitive, inputs, |a, b| a != b, |a, b| a != b),
        Primitive::Lt => eval_comparison(primitive, inputs, |a, b| a < b, |a, b| a < b),
        Primitive::Le => eval_comparison(primitive, inputs, |a, b| a <= b, |a, b| a <= b),
        Primitive::Gt => eval_comparison(primitive, inputs, |a, b| a > b, |a, b| a > b),
        Primitive::Ge => eval_comparison(primitive, inputs, |a, b| a >= b, |a, b| a >= b),
        Primitive::Select => eval_select(inputs),
        // Reductions (axis-aware)
        Primitive::ReduceSum => eval_reduce_axes(
            primitive,
            inputs,
            params,
            0_i64,
            0.0,
            |a, b| a + b,
            |a, b| a + b,
        ),
        Primitive::ReduceMax => eval_reduce_axes(
            primitive,
            inputs,
            params,
            i64::MIN,
            f64::NEG_INFINITY,
            i64::max,
            f64::max,
        ),
        Primitive::ReduceMin => eval_reduce_axes(
            primitive,
            inputs,
            params,
            i64::MAX,
            f64::INFINITY,
            i64::min,
            f64::min,
        ),
        Primitive::ReduceProd => eval_reduce_axes(
            primitive,
            inputs,
            params,
            1_i64,
            1.0,
            |a, b| a * b,
            |a, b| a * b,
        ),
        Primitive::Dot => eval_dot(inputs),
        // Shape manipulation
        Primitive::Concatenate => eval_concatenate(inputs, params),
        Primitive::Pad => eval_pad(inputs, params),
        Primitive::Slice => eval_slice(inputs, params),
        Primitive::Transpose => eval_transpose(inputs, params),
        Primitive::BroadcastInDim => eval_broadcast_in_dim(inputs, params),
        Primitive::Reshape => eval_reshape(inputs, params),
        Primitive::Cumsum => eval_cumulative(
            primitive,
            inputs,
            params,
            |a, b| a + b,
            |a, b| a + b,
        ),
        Primitive::Iota => eval_iota(inputs, params),
        Primitive::Sort => eval_sort(inputs, params),
        Primitive::DimSize => eval_dim_size(inputs, params),
        Primitive::Scan | Primitive::Pjit => Err(EvalError::Unsupported {
            primitive,
            detail: "higher-order primitive must be evaluated with its body".to_owned(),
        }),
    }
}
