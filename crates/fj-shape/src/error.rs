#![forbid(unsafe_code)]

/// Misuse of the dimension algebra.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolyError {
    /// Positivity of the variables is not enough to decide the comparison.
    ComparisonInconclusive {
        lhs: String,
        op: &'static str,
        rhs: String,
    },
    /// A non-constant coefficient is not a multiple of the divisor.
    InexactDivision { poly: String, divisor: i64 },
    NonPositiveDivisor { divisor: i64 },
    NotConstant { poly: String },
    UnboundVariable { name: String },
    /// A coefficient, exponent or evaluated size left the `i64`/`u32` range.
    Overflow {
        lhs: String,
        op: &'static str,
        rhs: String,
    },
    /// A product would have more terms than [`crate::polynomial::MAX_TERMS`].
    TooManyTerms { terms: usize, limit: usize },
}

impl std::fmt::Display for PolyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ComparisonInconclusive { lhs, op, rhs } => {
                write!(f, "Polynomials comparison \"{lhs} {op} {rhs}\" is inconclusive.")
            }
            Self::InexactDivision { poly, divisor } => write!(
                f,
                "shapecheck currently only supports strides that exactly divide the strided axis length: {poly} by {divisor}"
            ),
            Self::NonPositiveDivisor { divisor } => {
                write!(f, "polynomial divisor must be positive, got {divisor}")
            }
            Self::NotConstant { poly } => write!(f, "polynomial {poly} is not a constant"),
            Self::UnboundVariable { name } => {
                write!(f, "shape variable {name} has no value in the environment")
            }
            Self::Overflow { lhs, op, rhs } => {
                write!(f, "integer overflow in shape arithmetic: {lhs} {op} {rhs}")
            }
            Self::TooManyTerms { terms, limit } => write!(
                f,
                "polynomial product would have {terms} terms, more than the limit of {limit}"
            ),
        }
    }
}

impl std::error::Error for PolyError {}

/// Malformed shape-spec string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeSyntaxError {
    pub spec: String,
    pub token: String,
    pub offset: usize,
    /// Set when the text is well formed but its arithmetic is not
    /// representable.
    pub arithmetic: Option<PolyError>,
}

impl std::fmt::Display for ShapeSyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.arithmetic {
            Some(err) => write!(
                f,
                "invalid shape spec '{}': {err} at {} (offset {})",
                self.spec, self.token, self.offset
            ),
            None => write!(
                f,
                "invalid shape spec '{}': unexpected {} at offset {}",
                self.spec, self.token, self.offset
            ),
        }
    }
}

impl std::error::Error for ShapeSyntaxError {}

/// Disagreement between declared and actual shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// Declared vs. produced shape trees. `prefix` is `Output` or `Padded output`.
    OutputMismatch {
        prefix: String,
        expected: String,
        actual: String,
    },
    InconsistentBinding {
        var: String,
        first: i64,
        second: i64,
    },
    RankMismatch {
        spec: String,
        /// Rendered sizes, e.g. `[2, 3]`.
        actual: String,
    },
    DimMismatch {
        dim: String,
        actual: i64,
    },
    NonLinearDim {
        dim: String,
    },
    /// `a * v + b` with `a < 0`: the dimension shrinks as `v` grows.
    DecreasingDim {
        dim: String,
    },
    IndivisibleDim {
        dim: String,
        actual: i64,
    },
    NegativeDimension {
        dim: String,
        value: i64,
    },
    IncompatibleShapes {
        primitive: String,
        shapes: Vec<String>,
    },
    UnpaddedVariable {
        var: String,
        logical: i64,
        padded: i64,
    },
    LogicalExceedsPadded {
        var: String,
        logical: i64,
        padded: i64,
    },
    InvalidParams {
        primitive: String,
        detail: String,
    },
    UnresolvedWildcard {
        spec: String,
    },
    Poly(PolyError),
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutputMismatch {
                prefix,
                expected,
                actual,
            } => write!(f, "{prefix} shapes should be {expected} but are {actual}."),
            Self::InconsistentBinding { var, first, second } => write!(
                f,
                "shape variable {var} is bound to both {first} and {second}"
            ),
            Self::RankMismatch { spec, actual } => write!(
                f,
                "shape spec {spec} does not have the rank of array shape {actual}"
            ),
            Self::DimMismatch { dim, actual } => {
                write!(f, "dimension {dim} does not match actual size {actual}")
            }
            Self::NonLinearDim { dim } => write!(
                f,
                "cannot bind a shape variable from non-linear dimension {dim}"
            ),
            Self::DecreasingDim { dim } => write!(
                f,
                "cannot bind a shape variable from dimension {dim}, which decreases as the variable grows"
            ),
            Self::IndivisibleDim { dim, actual } => {
                write!(f, "dimension {dim} cannot take the size {actual}")
            }
            Self::NegativeDimension { dim, value } => {
                write!(f, "dimension {dim} evaluated to negative size {value}")
            }
            Self::IncompatibleShapes { primitive, shapes } => write!(
                f,
                "{primitive} got incompatible shapes: {}",
                shapes.join(", ")
            ),
            Self::UnpaddedVariable {
                var,
                logical,
                padded,
            } => write!(
                f,
                "shape variable {var} is declared unpadded but its logical size {logical} differs from its padded size {padded}"
            ),
            Self::LogicalExceedsPadded {
                var,
                logical,
                padded,
            } => write!(
                f,
                "shape variable {var} has logical size {logical} outside the padded size {padded}"
            ),
            Self::InvalidParams { primitive, detail } => {
                write!(f, "invalid params for {primitive}: {detail}")
            }
            Self::UnresolvedWildcard { spec } => {
                write!(f, "shape spec {spec} has a wildcard with no concrete size to fill it")
            }
            Self::Poly(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ShapeError {}

impl From<PolyError> for ShapeError {
    fn from(value: PolyError) -> Self {
        Self::Poly(value)
    }
}
