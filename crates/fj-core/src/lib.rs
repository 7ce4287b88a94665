#![forbid(unsafe_code)]

#[cfg(test)]
pub mod proptest_strategies;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F64,
    I64,
    Bool,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn from_dims(dims: &[u32]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        if self.dims.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Primitive {
    // Elementwise unary
    Neg,
    Abs,
    Exp,
    Log,
    Sin,
    Cos,
    Tanh,
    Sqrt,
    Sign,
    // Elementwise binary
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Pow,
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Selection
    Select,
    // Reduction
    ReduceSum,
    ReduceMax,
    ReduceMin,
    ReduceProd,
    // Contraction
    Dot,
    // Shape manipulation
    Concatenate,
    Pad,
    Slice,
    Transpose,
    BroadcastInDim,
    Reshape,
    // Cumulative
    Cumsum,
    // Index generation
    Iota,
    // Sorting
    Sort,
    // Runtime size of a polymorphic axis
    DimSize,
    // Control flow
    Scan,
    Pjit,
}

impl Primitive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tanh => "tanh",
            Self::Sqrt => "sqrt",
            Self::Sign => "sign",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Max => "max",
            Self::Min => "min",
            Self::Pow => "pow",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Select => "select",
            Self::ReduceSum => "reduce_sum",
            Self::ReduceMax => "reduce_max",
            Self::ReduceMin => "reduce_min",
            Self::ReduceProd => "reduce_prod",
            Self::Dot => "dot",
            Self::Concatenate => "concatenate",
            Self::Pad => "pad",
            Self::Slice => "slice",
            Self::Transpose => "transpose",
            Self::BroadcastInDim => "broadcast_in_dim",
            Self::Reshape => "reshape",
            Self::Cumsum => "cumsum",
            Self::Iota => "iota",
            Self::Sort => "sort",
            Self::DimSize => "dim_size",
            Self::Scan => "scan",
            Self::Pjit => "pjit",
        }
    }

    #[must_use]
    pub fn is_elementwise_unary(self) -> bool {
        matches!(
            self,
            Self::Neg
                | Self::Abs
                | Self::Exp
                | Self::Log
                | Self::Sin
                | Self::Cos
                | Self::Tanh
                | Self::Sqrt
                | Self::Sign
        )
    }

    #[must_use]
    pub fn is_elementwise_binary(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Sub
                | Self::Mul
                | Self::Div
                | Self::Max
                | Self::Min
                | Self::Pow
                | Self::Eq
                | Self::Ne
                | Self::Lt
                | Self::Le
                | Self::Gt
                | Self::Ge
        )
    }

    #[must_use]
    pub fn is_reduction(self) -> bool {
        matches!(
            self,
            Self::ReduceSum | Self::ReduceMax | Self::ReduceMin | Self::ReduceProd
        )
    }
}

impl std::fmt::Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    /// Additive identity of `dtype`.
    #[must_use]
    pub fn zero(dtype: DType) -> Self {
        match dtype {
            DType::F64 => Self::from_f64(0.0),
            DType::I64 => Self::I64(0),
            DType::Bool => Self::Bool(false),
        }
    }

    #[must_use]
    pub fn one(dtype: DType) -> Self {
        match dtype {
            DType::F64 => Self::from_f64(1.0),
            DType::I64 => Self::I64(1),
            DType::Bool => Self::Bool(true),
        }
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
        }
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I64(value) => Some(value as f64),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(_) | Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            Self::I64(_) | Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(self, Self::I64(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Literal),
    Tensor(TensorValue),
}

impl Value {
    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::Scalar(Literal::Bool(value))
    }

    pub fn vector_i64(values: &[i64]) -> Result<Self, ValueError> {
        Self::tensor_i64(&[values.len() as u32], values)
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        Self::tensor_f64(&[values.len() as u32], values)
    }

    pub fn tensor_i64(dims: &[u32], values: &[i64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::I64).collect();
        TensorValue::new(DType::I64, Shape::from_dims(dims), elements).map(Self::from_tensor)
    }

    pub fn tensor_f64(dims: &[u32], values: &[f64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::from_f64).collect();
        TensorValue::new(DType::F64, Shape::from_dims(dims), elements).map(Self::from_tensor)
    }

    /// Rank-0 tensors collapse to scalars.
    #[must_use]
    pub fn from_tensor(tensor: TensorValue) -> Self {
        if tensor.rank() == 0
            && let Some(lit) = tensor.elements.first()
        {
            return Self::Scalar(*lit);
        }
        Self::Tensor(tensor)
    }

    /// Scalars become rank-0 tensors.
    #[must_use]
    pub fn to_tensor(&self) -> TensorValue {
        match self {
            Self::Scalar(lit) => TensorValue {
                dtype: lit.dtype(),
                shape: Shape::scalar(),
                elements: vec![*lit],
            },
            Self::Tensor(tensor) => tensor.clone(),
        }
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        match self {
            Self::Scalar(_) => Shape::scalar(),
            Self::Tensor(tensor) => tensor.shape.clone(),
        }
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        match self {
            Self::Scalar(lit) => Some(*lit),
            Self::Tensor(_) => None,
        }
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        self.as_scalar_literal().and_then(Literal::as_f64)
    }

    #[must_use]
    pub fn as_i64_scalar(&self) -> Option<i64> {
        self.as_scalar_literal().and_then(Literal::as_i64)
    }

    #[must_use]
    pub fn as_bool_scalar(&self) -> Option<bool> {
        self.as_scalar_literal().and_then(Literal::as_bool)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Scalar(lit) => lit.dtype(),
            Self::Tensor(t) => t.dtype,
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Scalar(_) => None,
            Self::Tensor(tensor) => Some(tensor),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count != elements.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    pub fn filled(dtype: DType, shape: Shape, fill: Literal) -> Result<Self, ValueError> {
        let count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;
        let count = usize::try_from(count).map_err(|_| ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;
        Self::new(dtype, shape, vec![fill; count])
    }

    pub fn zeros(dtype: DType, shape: Shape) -> Result<Self, ValueError> {
        Self::filled(dtype, shape, Literal::zero(dtype))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[must_use]
    pub fn leading_dim(&self) -> Option<u32> {
        self.shape.dims.first().copied()
    }

    pub fn slice_axis0(&self, index: usize) -> Result<Value, ValueError> {
        let axis_size = self
            .leading_dim()
            .ok_or(ValueError::RankZeroAxisSliceUnsupported)?;
        if index >= axis_size as usize {
            return Err(ValueError::SliceIndexOutOfBounds {
                index,
                axis_size: axis_size as usize,
            });
        }

        if self.rank() == 1 {
            return Ok(Value::Scalar(self.elements[index]));
        }

        let slice_len = self
            .shape
            .dims
            .iter()
            .skip(1)
            .try_fold(1_usize, |acc, dim| acc.checked_mul(*dim as usize))
            .ok_or(ValueError::ShapeOverflow {
                shape: self.shape.clone(),
            })?;

        let start = index * slice_len;
        let elements = self.elements[start..start + slice_len].to_vec();
        let subshape = Shape {
            dims: self.shape.dims[1..].to_vec(),
        };
        Ok(Value::Tensor(TensorValue::new(
            self.dtype, subshape, elements,
        )?))
    }

    /// Stacks equally shaped slices along a new leading axis.
    pub fn stack_axis0(slices: &[Value]) -> Result<Self, ValueError> {
        let Some(first) = slices.first() else {
            return Err(ValueError::EmptyAxisStack);
        };
        let first = first.to_tensor();
        let mut elements = Vec::with_capacity(first.elements.len() * slices.len());
        for value in slices {
            if matches!(value, Value::Scalar(_)) != (first.rank() == 0) {
                return Err(ValueError::MixedAxisStackKinds);
            }
            let tensor = value.to_tensor();
            if tensor.dtype != first.dtype {
                return Err(ValueError::AxisStackDTypeMismatch {
                    expected: first.dtype,
                    actual: tensor.dtype,
                });
            }
            if tensor.shape != first.shape {
                return Err(ValueError::AxisStackShapeMismatch {
                    expected: first.shape.clone(),
                    actual: tensor.shape,
                });
            }
            elements.extend(tensor.elements);
        }

        let mut dims = Vec::with_capacity(first.rank() + 1);
        dims.push(slices.len() as u32);
        dims.extend_from_slice(&first.shape.dims);
        TensorValue::new(first.dtype, Shape { dims }, elements)
    }

    #[must_use]
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements.iter().copied().map(Literal::as_f64).collect()
    }

    #[must_use]
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        self.elements.iter().copied().map(Literal::as_i64).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    RankZeroAxisSliceUnsupported,
    SliceIndexOutOfBounds {
        index: usize,
        axis_size: usize,
    },
    EmptyAxisStack,
    MixedAxisStackKinds,
    AxisStackShapeMismatch {
        expected: Shape,
        actual: Shape,
    },
    AxisStackDTypeMismatch {
        expected: DType,
        actual: DType,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {:?}", shape.dims)
            }
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => {
                write!(
                    f,
                    "tensor element count mismatch for shape {:?}: expected {}, got {}",
                    shape.dims, expected_count, actual_count
                )
            }
            Self::RankZeroAxisSliceUnsupported => {
                write!(f, "cannot axis-slice rank-0 scalar tensor")
            }
            Self::SliceIndexOutOfBounds { index, axis_size } => {
                write!(
                    f,
                    "axis-slice index {} out of bounds for axis size {}",
                    index, axis_size
                )
            }
            Self::EmptyAxisStack => {
                write!(f, "cannot stack empty slice list")
            }
            Self::MixedAxisStackKinds => {
                write!(f, "cannot stack mixed scalar/tensor slice kinds")
            }
            Self::AxisStackShapeMismatch { expected, actual } => {
                write!(
                    f,
                    "stack shape mismatch: expected {:?}, got {:?}",
                    expected.dims, actual.dims
                )
            }
            Self::AxisStackDTypeMismatch { expected, actual } => {
                write!(
                    f,
                    "stack dtype mismatch: expected {:?}, got {:?}",
                    expected, actual
                )
            }
        }
    }
}

impl std::error::Error for ValueError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atom {
    Var(VarId),
    Lit(Literal),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equation {
    pub primitive: Primitive,
    pub inputs: SmallVec<[Atom; 4]>,
    pub outputs: SmallVec<[VarId; 2]>,
    /// Shape-valued params (slice bounds, iota sizes, broadcast shapes) are
    /// shape-spec strings and may mention shape variables.
    pub params: BTreeMap<String, String>,
    /// Bodies of `scan` and `pjit`; both carry exactly one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_jaxprs: Vec<Jaxpr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jaxpr {
    pub invars: Vec<VarId>,
    pub constvars: Vec<VarId>,
    pub outvars: Vec<VarId>,
    pub equations: Vec<Equation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JaxprValidationError {
    DuplicateBinding { section: &'static str, var: VarId },
    UnboundInputVar { equation_index: usize, var: VarId },
    OutputShadowsBinding { equation_index: usize, var: VarId },
    UnknownOutvar { var: VarId },
    MissingSubJaxpr { equation_index: usize, primitive: Primitive },
}

impl std::fmt::Display for JaxprValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateBinding { section, var } => {
                write!(f, "duplicate binding in {} for var v{}", section, var.0)
            }
            Self::UnboundInputVar {
                equation_index,
                var,
            } => {
                write!(
                    f,
                    "equation {} references unbound input var v{}",
                    equation_index, var.0
                )
            }
            Self::OutputShadowsBinding {
                equation_index,
                var,
            } => {
                write!(
                    f,
                    "equation {} output var v{} shadows an existing binding",
                    equation_index, var.0
                )
            }
            Self::UnknownOutvar { var } => {
                write!(f, "outvar v{} does not have a defining binding", var.0)
            }
            Self::MissingSubJaxpr {
                equation_index,
                primitive,
            } => {
                write!(
                    f,
                    "equation {} ({}) has no body jaxpr",
                    equation_index,
                    primitive.as_str()
                )
            }
        }
    }
}

impl std::error::Error for JaxprValidationError {}

impl Jaxpr {
    #[must_use]
    pub fn new(
        invars: Vec<VarId>,
        constvars: Vec<VarId>,
        outvars: Vec<VarId>,
        equations: Vec<Equation>,
    ) -> Self {
        Self {
            invars,
            constvars,
            outvars,
            equations,
        }
    }

    pub fn validate_well_formed(&self) -> Result<(), JaxprValidationError> {
        let mut bindings = BTreeSet::new();

        for var in &self.invars {
            if !bindings.insert(*var) {
                return Err(JaxprValidationError::DuplicateBinding {
                    section: "invars",
                    var: *var,
                });
            }
        }
        for var in &self.constvars {
            if !bindings.insert(*var) {
                return Err(JaxprValidationError::DuplicateBinding {
                    section: "constvars",
                    var: *var,
                });
            }
        }

        for (equation_index, eqn) in self.equations.iter().enumerate() {
            for atom in &eqn.inputs {
                if let Atom::Var(var) = atom
                    && !bindings.contains(var)
                {
                    return Err(JaxprValidationError::UnboundInputVar {
                        equation_index,
                        var: *var,
                    });
                }
            }
            for out_var in &eqn.outputs {
                if !bindings.insert(*out_var) {
                    return Err(JaxprValidationError::OutputShadowsBinding {
                        equation_index,
                        var: *out_var,
                    });
                }
            }
            if matches!(eqn.primitive, Primitive::Scan | Primitive::Pjit) {
                let Some(body) = eqn.sub_jaxprs.first() else {
                    return Err(JaxprValidationError::MissingSubJaxpr {
                        equation_index,
                        primitive: eqn.primitive,
                    });
                };
                body.validate_well_formed()?;
            }
        }

        // Outvars may repeat: a program can return one value twice.
        for outvar in &self.outvars {
            if !bindings.contains(outvar) {
                return Err(JaxprValidationError::UnknownOutvar { var: *outvar });
            }
        }

        Ok(())
    }
}

/// Incremental construction of a [`Jaxpr`] with fresh variable ids.
///
/// ```
/// use fj_core::{Atom, JaxprBuilder, Primitive};
///
/// let mut b = JaxprBuilder::new();
/// let x = b.invar();
/// let y = b.eqn(Primitive::Mul, vec![Atom::Var(x), Atom::Var(x)], &[]);
/// let jaxpr = b.build(vec![y]);
/// assert!(jaxpr.validate_well_formed().is_ok());
/// ```
#[derive(Debug, Default)]
pub struct JaxprBuilder {
    next: u32,
    invars: Vec<VarId>,
    constvars: Vec<VarId>,
    equations: Vec<Equation>,
}

impl JaxprBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> VarId {
        self.next += 1;
        VarId(self.next)
    }

    pub fn invar(&mut self) -> VarId {
        let var = self.fresh();
        self.invars.push(var);
        var
    }

    pub fn constvar(&mut self) -> VarId {
        let var = self.fresh();
        self.constvars.push(var);
        var
    }

    /// Single-output equation without a body.
    pub fn eqn(
        &mut self,
        primitive: Primitive,
        inputs: Vec<Atom>,
        params: &[(&str, &str)],
    ) -> VarId {
        let out = self.fresh();
        self.push(primitive, inputs, vec![out], params, Vec::new());
        out
    }

    /// Equation with `num_outputs` results and optional body jaxprs.
    pub fn eqn_multi(
        &mut self,
        primitive: Primitive,
        inputs: Vec<Atom>,
        num_outputs: usize,
        params: &[(&str, &str)],
        sub_jaxprs: Vec<Jaxpr>,
    ) -> Vec<VarId> {
        let outputs: Vec<VarId> = (0..num_outputs).map(|_| self.fresh()).collect();
        self.push(primitive, inputs, outputs.clone(), params, sub_jaxprs);
        outputs
    }

    fn push(
        &mut self,
        primitive: Primitive,
        inputs: Vec<Atom>,
        outputs: Vec<VarId>,
        params: &[(&str, &str)],
        sub_jaxprs: Vec<Jaxpr>,
    ) {
        self.equations.push(Equation {
            primitive,
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            params: params
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            sub_jaxprs,
        });
    }

    #[must_use]
    pub fn build(self, outvars: Vec<VarId>) -> Jaxpr {
        Jaxpr::new(self.invars, self.constvars, outvars, self.equations)
    }
}
