#![forbid(unsafe_code)]

//! Reference and masked evaluation of [`Jaxpr`] programs.
//!
//! [`eval_jaxpr`] runs a program on concrete arrays. [`shapecheck_jaxpr`]
//! propagates symbolic shapes through it, and [`eval_masked_jaxpr`] runs it
//! on padded arrays while tracking each value's logical shape.

pub mod masking;
mod masking_rules;
pub mod rules;
mod shape_rules;
pub mod shapecheck;

use fj_core::{Atom, Jaxpr, Primitive, TensorValue, Value, ValueError, VarId};
use fj_lax::{EvalError, eval_primitive, parse_usize_param};
use fj_shape::{PolyError, ShapeError};
use std::collections::BTreeMap;

pub use masking::{MaskEnv, MaskedValue, eval_masked_jaxpr, specialize_params};
pub use rules::{
    MaskingContext, MaskingRule, PrimitiveRules, RuleContext, RuleRegistry, ShapeRule,
    default_registry,
};
pub use shapecheck::shapecheck_jaxpr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterError {
    InputArity {
        expected: usize,
        actual: usize,
    },
    MissingVariable(VarId),
    MissingBody {
        primitive: Primitive,
    },
    OutputArity {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    ScanLayout {
        detail: String,
    },
    Value(ValueError),
    Primitive(EvalError),
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputArity { expected, actual } => {
                write!(
                    f,
                    "input arity mismatch: expected {}, got {}",
                    expected, actual
                )
            }
            Self::MissingVariable(var) => write!(f, "missing variable v{}", var.0),
            Self::MissingBody { primitive } => {
                write!(f, "{} equation has no body jaxpr", primitive.as_str())
            }
            Self::OutputArity {
                primitive,
                expected,
                actual,
            } => write!(
                f,
                "{} produced {} outputs, equation binds {}",
                primitive.as_str(),
                actual,
                expected
            ),
            Self::ScanLayout { detail } => write!(f, "malformed scan: {detail}"),
            Self::Value(err) => write!(f, "value error: {err}"),
            Self::Primitive(err) => write!(f, "primitive eval failed: {err}"),
        }
    }
}

impl std::error::Error for InterpreterError {}

impl From<EvalError> for InterpreterError {
    fn from(value: EvalError) -> Self {
        Self::Primitive(value)
    }
}

impl From<ValueError> for InterpreterError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}

/// Failures of shape checking and masked evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskingError {
    /// The primitive has no masking rule.
    NotImplemented {
        primitive: String,
    },
    MissingShapeRule {
        primitive: String,
    },
    /// A shape-parameterized primitive inside a `pjit` body depends on
    /// shape variables of the enclosing masked function.
    NestedTransform {
        primitive: String,
    },
    InputArity {
        expected: usize,
        actual: usize,
    },
    OutputArity {
        primitive: String,
        expected: usize,
        actual: usize,
    },
    MissingVariable(VarId),
    Shape(ShapeError),
    Eval(EvalError),
    Interpreter(InterpreterError),
}

impl std::fmt::Display for MaskingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotImplemented { primitive } => {
                write!(f, "Masking rule for {primitive} not implemented yet.")
            }
            Self::MissingShapeRule { primitive } => {
                write!(f, "Shape rule for {primitive} not implemented yet.")
            }
            Self::NestedTransform { primitive } => write!(
                f,
                "mask(jit({primitive})) is not supported yet. \
                 Consider using jit(mask({primitive})) instead."
            ),
            Self::InputArity { expected, actual } => {
                write!(f, "expected {expected} masked inputs, got {actual}")
            }
            Self::OutputArity {
                primitive,
                expected,
                actual,
            } => write!(
                f,
                "{primitive} produced {actual} outputs, equation binds {expected}"
            ),
            Self::MissingVariable(var) => write!(f, "missing variable v{}", var.0),
            Self::Shape(err) => write!(f, "{err}"),
            Self::Eval(err) => write!(f, "primitive eval failed: {err}"),
            Self::Interpreter(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MaskingError {}

impl From<ShapeError> for MaskingError {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<PolyError> for MaskingError {
    fn from(value: PolyError) -> Self {
        Self::Shape(ShapeError::Poly(value))
    }
}

impl From<EvalError> for MaskingError {
    fn from(value: EvalError) -> Self {
        Self::Eval(value)
    }
}

impl From<ValueError> for MaskingError {
    fn from(value: ValueError) -> Self {
        Self::Eval(EvalError::InvalidTensor(value))
    }
}

impl From<InterpreterError> for MaskingError {
    fn from(value: InterpreterError) -> Self {
        Self::Interpreter(value)
    }
}

/// How the inputs of a `scan` equation split into consts, carry and
/// scanned-over arrays (everything after the carry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanLayout {
    pub num_consts: usize,
    pub num_carry: usize,
}

impl ScanLayout {
    pub(crate) fn from_params(
        params: &BTreeMap<String, String>,
        num_inputs: usize,
    ) -> Result<Self, InterpreterError> {
        let count = |key: &str| -> Result<usize, InterpreterError> {
            if !params.contains_key(key) {
                return Ok(0);
            }
            match parse_usize_param(Primitive::Scan, key, params)?.as_slice() {
                [value] => Ok(*value),
                other => Err(InterpreterError::ScanLayout {
                    detail: format!("param '{key}' expects one value, got {}", other.len()),
                }),
            }
        };
        let num_consts = count("num_consts")?;
        let num_carry = count("num_carry")?;
        if num_consts + num_carry > num_inputs {
            return Err(InterpreterError::ScanLayout {
                detail: format!(
                    "{num_inputs} inputs cannot hold {num_consts} consts and {num_carry} carries"
                ),
            });
        }
        Ok(Self {
            num_consts,
            num_carry,
        })
    }

    pub(crate) fn xs_start(&self) -> usize {
        self.num_consts + self.num_carry
    }

    /// Explicit `length` param, if present.
    pub(crate) fn length_param(
        params: &BTreeMap<String, String>,
    ) -> Result<Option<usize>, InterpreterError> {
        if !params.contains_key("length") {
            return Ok(None);
        }
        match parse_usize_param(Primitive::Scan, "length", params)?.as_slice() {
            [value] => Ok(Some(*value)),
            _ => Err(InterpreterError::ScanLayout {
                detail: "param 'length' expects one value".to_owned(),
            }),
        }
    }
}

pub(crate) fn body_of(eqn: &fj_core::Equation) -> Result<&Jaxpr, InterpreterError> {
    eqn.sub_jaxprs.first().ok_or(InterpreterError::MissingBody {
        primitive: eqn.primitive,
    })
}

/// Evaluates a program without constants.
pub fn eval_jaxpr(jaxpr: &Jaxpr, args: &[Value]) -> Result<Vec<Value>, InterpreterError> {
    eval_jaxpr_with_consts(jaxpr, &[], args)
}

/// Evaluates a program. `consts` bind `constvars`, `args` bind `invars`.
pub fn eval_jaxpr_with_consts(
    jaxpr: &Jaxpr,
    consts: &[Value],
    args: &[Value],
) -> Result<Vec<Value>, InterpreterError> {
    if consts.len() != jaxpr.constvars.len() {
        return Err(InterpreterError::InputArity {
            expected: jaxpr.constvars.len(),
            actual: consts.len(),
        });
    }
    if args.len() != jaxpr.invars.len() {
        return Err(InterpreterError::InputArity {
            expected: jaxpr.invars.len(),
            actual: args.len(),
        });
    }

    let mut env: BTreeMap<VarId, Value> = BTreeMap::new();
    for (var, value) in jaxpr.constvars.iter().zip(consts) {
        env.insert(*var, value.clone());
    }
    for (var, value) in jaxpr.invars.iter().zip(args) {
        env.insert(*var, value.clone());
    }

    for eqn in &jaxpr.equations {
        let mut resolved = Vec::with_capacity(eqn.inputs.len());
        for atom in &eqn.inputs {
            match atom {
                Atom::Var(var) => {
                    let value = env
                        .get(var)
                        .cloned()
                        .ok_or(InterpreterError::MissingVariable(*var))?;
                    resolved.push(value);
                }
                Atom::Lit(lit) => resolved.push(Value::Scalar(*lit)),
            }
        }

        let outputs = match eqn.primitive {
            Primitive::Scan => eval_scan(eqn, &resolved)?,
            Primitive::Pjit => eval_jaxpr(body_of(eqn)?, &resolved)?,
            primitive => vec![eval_primitive(primitive, &resolved, &eqn.params)?],
        };
        if outputs.len() != eqn.outputs.len() {
            return Err(InterpreterError::OutputArity {
                primitive: eqn.primitive,
                expected: eqn.outputs.len(),
                actual: outputs.len(),
            });
        }
        for (var, value) in eqn.outputs.iter().zip(outputs) {
            env.insert(*var, value);
        }
    }

    jaxpr
        .outvars
        .iter()
        .map(|var| {
            env.get(var)
                .cloned()
                .ok_or(InterpreterError::MissingVariable(*var))
        })
        .collect()
}

/// Loops the body over the leading axis of the scanned inputs, threading
/// the carry and stacking the per-iteration outputs.
fn eval_scan(eqn: &fj_core::Equation, inputs: &[Value]) -> Result<Vec<Value>, InterpreterError> {
    let body = body_of(eqn)?;
    let layout = ScanLayout::from_params(&eqn.params, inputs.len())?;
    let consts = &inputs[..layout.num_consts];
    let xs: Vec<TensorValue> = inputs[layout.xs_start()..]
        .iter()
        .map(Value::to_tensor)
        .collect();

    let length = match (xs.first(), ScanLayout::length_param(&eqn.params)?) {
        (Some(first), _) => first.leading_dim().ok_or(ValueError::RankZeroAxisSliceUnsupported)?
            as usize,
        (None, Some(length)) => length,
        (None, None) => {
            return Err(InterpreterError::ScanLayout {
                detail: "no scanned inputs and no 'length' param".to_owned(),
            });
        }
    };

    let mut carry = inputs[layout.num_consts..layout.xs_start()].to_vec();
    let mut ys: Vec<Vec<Value>> = Vec::new();
    for step in 0..length {
        let mut body_args = Vec::with_capacity(inputs.len());
        body_args.extend_from_slice(consts);
        body_args.extend(carry.iter().cloned());
        for x in &xs {
            body_args.push(x.slice_axis0(step)?);
        }
        let mut outs = eval_jaxpr(body, &body_args)?;
        if outs.len() < layout.num_carry {
            return Err(InterpreterError::OutputArity {
                primitive: Primitive::Scan,
                expected: layout.num_carry,
                actual: outs.len(),
            });
        }
        let step_ys = outs.split_off(layout.num_carry);
        carry = outs;
        if ys.is_empty() {
            ys = vec![Vec::with_capacity(length); step_ys.len()];
        }
        for (column, y) in ys.iter_mut().zip(step_ys) {
            column.push(y);
        }
    }

    let num_ys = body.outvars.len().saturating_sub(layout.num_carry);
    if length == 0 && num_ys > 0 {
        return Err(InterpreterError::ScanLayout {
            detail: "cannot stack outputs of a zero-length scan".to_owned(),
        });
    }
    let mut outputs = carry;
    for column in ys {
        outputs.push(Value::Tensor(TensorValue::stack_axis0(&column)?));
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::{InterpreterError, eval_jaxpr, eval_jaxpr_with_consts};
    use fj_core::{Atom, JaxprBuilder, Literal, Primitive, Value};

    fn cumsum_scan() -> fj_core::Jaxpr {
        let mut body = JaxprBuilder::new();
        let carry = body.invar();
        let x = body.invar();
        let next = body.eqn(Primitive::Add, vec![Atom::Var(carry), Atom::Var(x)], &[]);
        let body = body.build(vec![next, next]);

        let mut b = JaxprBuilder::new();
        let xs = b.invar();
        let outs = b.eqn_multi(
            Primitive::Scan,
            vec![Atom::Lit(Literal::I64(0)), Atom::Var(xs)],
            2,
            &[("num_carry", "1")],
            vec![body],
        );
        b.build(outs)
    }

    #[test]
    fn eval_simple_add_jaxpr() {
        let mut b = JaxprBuilder::new();
        let x = b.invar();
        let y = b.invar();
        let out = b.eqn(Primitive::Add, vec![Atom::Var(x), Atom::Var(y)], &[]);
        let jaxpr = b.build(vec![out]);
        let outputs = eval_jaxpr(&jaxpr, &[Value::scalar_i64(4), Value::scalar_i64(5)]);
        assert_eq!(outputs, Ok(vec![Value::scalar_i64(9)]));
    }

    #[test]
    fn constvars_bind_before_the_body_runs() {
        let mut b = JaxprBuilder::new();
        let c = b.constvar();
        let x = b.invar();
        let out = b.eqn(Primitive::Mul, vec![Atom::Var(c), Atom::Var(x)], &[]);
        let jaxpr = b.build(vec![out]);
        let output = eval_jaxpr_with_consts(
            &jaxpr,
            &[Value::scalar_i64(3)],
            &[Value::vector_i64(&[1, 2, 3]).expect("vector value should build")],
        )
        .expect("scaled");
        assert_eq!(
            output,
            vec![Value::vector_i64(&[3, 6, 9]).expect("vector value should build")]
        );
    }

    #[test]
    fn scan_threads_carry_and_stacks_outputs() {
        let xs = Value::vector_i64(&[5, 2, 9, 1, 4]).expect("vector value should build");
        let outputs = eval_jaxpr(&cumsum_scan(), &[xs]).expect("scan should run");
        assert_eq!(outputs[0], Value::scalar_i64(21));
        assert_eq!(
            outputs[1],
            Value::vector_i64(&[5, 7, 16, 17, 21]).expect("vector value should build")
        );
    }

    #[test]
    fn pjit_evaluates_its_body() {
        let mut inner = JaxprBuilder::new();
        let a = inner.invar();
        let doubled = inner.eqn(Primitive::Add, vec![Atom::Var(a), Atom::Var(a)], &[]);
        let inner = inner.build(vec![doubled]);

        let mut b = JaxprBuilder::new();
        let x = b.invar();
        let outs = b.eqn_multi(Primitive::Pjit, vec![Atom::Var(x)], 1, &[], vec![inner]);
        let jaxpr = b.build(outs);
        let output = eval_jaxpr(&jaxpr, &[Value::scalar_i64(21)]).expect("pjit should run");
        assert_eq!(output, vec![Value::scalar_i64(42)]);
    }

    #[test]
    fn input_arity_mismatch_is_reported() {
        let jaxpr = cumsum_scan();
        let err = eval_jaxpr(&jaxpr, &[]).expect_err("should fail");
        assert_eq!(
            err,
            InterpreterError::InputArity {
                expected: 1,
                actual: 0,
            }
        );
    }

    #[test]
    fn missing_body_is_reported() {
        let mut b = JaxprBuilder::new();
        let x = b.invar();
        let outs = b.eqn_multi(Primitive::Pjit, vec![Atom::Var(x)], 1, &[], vec![]);
        let jaxpr = b.build(outs);
        let err = eval_jaxpr(&jaxpr, &[Value::scalar_i64(1)]).expect_err("should fail");
        assert_eq!(
            err,
            InterpreterError::MissingBody {
                primitive: Primitive::Pjit
            }
        );
    }
}
