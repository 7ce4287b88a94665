#![forbid(unsafe_code)]

use fj_core::{JaxprValidationError, ValueError};
use fj_interpreters::MaskingError;
use fj_shape::{ShapeError, ShapeSyntaxError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// A shape spec string failed to parse.
    Syntax(ShapeSyntaxError),
    Shape(ShapeError),
    Masking(MaskingError),
    Value(ValueError),
    MalformedProgram(JaxprValidationError),
    InputArity {
        expected: usize,
        actual: usize,
    },
    /// The program's outputs do not fit the requested output structure.
    TreeMismatch {
        structure: String,
        leaves: usize,
    },
    /// A logical size was given for a name no input shape mentions.
    UnknownVariable {
        name: String,
    },
    BatchMismatch {
        detail: String,
    },
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax(err) => write!(f, "{err}"),
            Self::Shape(err) => write!(f, "{err}"),
            Self::Masking(err) => write!(f, "{err}"),
            Self::Value(err) => write!(f, "value error: {err}"),
            Self::MalformedProgram(err) => write!(f, "malformed program: {err}"),
            Self::InputArity { expected, actual } => {
                write!(f, "masked function takes {expected} inputs, got {actual}")
            }
            Self::TreeMismatch { structure, leaves } => write!(
                f,
                "output structure {structure} does not hold {leaves} outputs"
            ),
            Self::UnknownVariable { name } => {
                write!(f, "no input shape mentions the variable {name}")
            }
            Self::BatchMismatch { detail } => write!(f, "batched call: {detail}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ShapeSyntaxError> for ApiError {
    fn from(value: ShapeSyntaxError) -> Self {
        Self::Syntax(value)
    }
}

impl From<ShapeError> for ApiError {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<MaskingError> for ApiError {
    fn from(value: MaskingError) -> Self {
        Self::Masking(value)
    }
}

impl From<ValueError> for ApiError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}

impl From<JaxprValidationError> for ApiError {
    fn from(value: JaxprValidationError) -> Self {
        Self::MalformedProgram(value)
    }
}
