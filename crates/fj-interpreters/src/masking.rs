#![forbid(unsafe_code)]

//! Evaluation on padded arrays.
//!
//! Every intermediate is a [`MaskedValue`]: a padded buffer paired with the
//! polymorphic shape of its logical region. Each primitive goes through its
//! shape rule and then its masking rule; a primitive without a masking rule
//! is an error, never a raw run on padded data.

use crate::rules::{MaskingContext, RuleContext, RuleRegistry, shape_param_keys};
use crate::shapecheck::{bind_inputs, read_outputs, scan_shapes};
use crate::{InterpreterError, MaskingError, ScanLayout, body_of};
use fj_core::{Atom, Equation, Jaxpr, Literal, Primitive, Shape, TensorValue, Value};
use fj_lax::read_window;
use fj_shape::{DimVar, RenameContext, ShapeEnv, ShapeError, ShapeSpec, eval_shape, eval_spec};
use std::collections::BTreeSet;
use tracing::{debug_span, trace};

/// Logical and padded sizes of every shape variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskEnv {
    pub logical: ShapeEnv,
    pub padded: ShapeEnv,
    /// Variables whose logical size is asserted to equal the padded size.
    pub unpadded: BTreeSet<DimVar>,
}

impl MaskEnv {
    #[must_use]
    pub fn new(logical: ShapeEnv, padded: ShapeEnv) -> Self {
        Self {
            logical,
            padded,
            unpadded: BTreeSet::new(),
        }
    }

    /// Marks `vars` as unpadded. Their logical size defaults to the padded
    /// size when the caller did not supply one.
    #[must_use]
    pub fn with_unpadded(mut self, vars: impl IntoIterator<Item = DimVar>) -> Self {
        for var in vars {
            if !self.logical.contains_key(&var)
                && let Some(size) = self.padded.get(&var)
            {
                self.logical.insert(var.clone(), *size);
            }
            self.unpadded.insert(var);
        }
        self
    }

    /// Checks the unpadded hints and that no logical size exceeds its
    /// padded size.
    pub fn validate(&self) -> Result<(), ShapeError> {
        for (var, padded) in &self.padded {
            let Some(logical) = self.logical.get(var) else {
                continue;
            };
            if *logical > *padded || *logical < 0 {
                return Err(ShapeError::LogicalExceedsPadded {
                    var: var.to_string(),
                    logical: *logical,
                    padded: *padded,
                });
            }
            if self.unpadded.contains(var) && logical != padded {
                return Err(ShapeError::UnpaddedVariable {
                    var: var.to_string(),
                    logical: *logical,
                    padded: *padded,
                });
            }
        }
        Ok(())
    }

    pub fn logical_dims(&self, spec: &ShapeSpec) -> Result<Vec<i64>, ShapeError> {
        eval_spec(spec, &self.logical, None)
    }

    pub fn padded_dims(&self, spec: &ShapeSpec) -> Result<Vec<i64>, ShapeError> {
        eval_spec(spec, &self.padded, None)
    }

    pub fn logical_shape(&self, spec: &ShapeSpec) -> Result<Shape, ShapeError> {
        eval_shape(spec, &self.logical)
    }

    pub fn padded_shape(&self, spec: &ShapeSpec) -> Result<Shape, ShapeError> {
        eval_shape(spec, &self.padded)
    }
}

/// A padded buffer and the polymorphic shape of its logical region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedValue {
    pub value: Value,
    pub shape: ShapeSpec,
}

impl MaskedValue {
    #[must_use]
    pub fn new(value: Value, shape: ShapeSpec) -> Self {
        Self { value, shape }
    }

    /// A value whose logical region is the whole array.
    #[must_use]
    pub fn unmasked(value: Value) -> Self {
        let shape = ShapeSpec::from_consts(&value.shape().dims);
        Self { value, shape }
    }

    /// The logical region under `env`, copied out of the padded buffer.
    pub fn logical_value(&self, env: &MaskEnv) -> Result<Value, MaskingError> {
        let shape = env.logical_shape(&self.shape)?;
        if shape == self.value.shape() {
            return Ok(self.value.clone());
        }
        let rank = shape.rank();
        Ok(read_window(
            &self.value,
            &vec![0; rank],
            &vec![1; rank],
            shape.dims,
            Literal::zero(self.value.dtype()),
        )?)
    }
}

/// Rewrites every shape-valued param to concrete sizes under `sizes`,
/// bodies included.
pub fn specialize_params(
    jaxpr: &Jaxpr,
    scope: &RenameContext,
    sizes: &ShapeEnv,
) -> Result<Jaxpr, MaskingError> {
    let mut out = jaxpr.clone();
    for eqn in &mut out.equations {
        for key in shape_param_keys(eqn.primitive) {
            if !eqn.params.contains_key(*key) {
                continue;
            }
            let ctx = RuleContext {
                primitive: eqn.primitive,
                params: &eqn.params,
                scope,
            };
            let dims = eval_spec(&ctx.spec_param(key)?, sizes, None)?;
            let rendered = dims
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            eqn.params.insert((*key).to_owned(), rendered);
        }
        for body in &mut eqn.sub_jaxprs {
            *body = specialize_params(body, scope, sizes)?;
        }
    }
    Ok(out)
}

/// Evaluates `jaxpr` on padded `args` (constants first, then inputs).
///
/// `scope` is the variable scope the argument shapes were parsed in, used to
/// read shape-valued params.
pub fn eval_masked_jaxpr(
    jaxpr: &Jaxpr,
    registry: &RuleRegistry,
    scope: &RenameContext,
    env: &MaskEnv,
    args: &[MaskedValue],
) -> Result<Vec<MaskedValue>, MaskingError> {
    let _span = debug_span!(
        "masked_eval",
        equations = jaxpr.equations.len(),
        inputs = args.len()
    )
    .entered();
    MaskingInterpreter {
        registry,
        scope,
        env,
        nested: false,
    }
    .run(jaxpr, args)
}

#[derive(Debug, Clone, Copy)]
struct MaskingInterpreter<'a> {
    registry: &'a RuleRegistry,
    scope: &'a RenameContext,
    env: &'a MaskEnv,
    /// Inside a `pjit` body.
    nested: bool,
}

impl MaskingInterpreter<'_> {
    fn run(&self, jaxpr: &Jaxpr, args: &[MaskedValue]) -> Result<Vec<MaskedValue>, MaskingError> {
        let mut values = bind_inputs(jaxpr, args)?;
        for eqn in &jaxpr.equations {
            let mut inputs = Vec::with_capacity(eqn.inputs.len());
            for atom in &eqn.inputs {
                match atom {
                    Atom::Var(var) => inputs.push(
                        values
                            .get(var)
                            .cloned()
                            .ok_or(MaskingError::MissingVariable(*var))?,
                    ),
                    Atom::Lit(lit) => {
                        inputs.push(MaskedValue::new(Value::Scalar(*lit), ShapeSpec::scalar()));
                    }
                }
            }

            let outputs = match eqn.primitive {
                Primitive::Scan => self.scan(eqn, &inputs)?,
                Primitive::Pjit => Self {
                    nested: true,
                    ..*self
                }
                .run(body_of(eqn)?, &inputs)?,
                _ => self.primitive(eqn, &inputs)?,
            };
            if outputs.len() != eqn.outputs.len() {
                return Err(MaskingError::OutputArity {
                    primitive: eqn.primitive.as_str().to_owned(),
                    expected: eqn.outputs.len(),
                    actual: outputs.len(),
                });
            }
            values.extend(eqn.outputs.iter().copied().zip(outputs));
        }
        read_outputs(jaxpr, &values)
    }

    fn primitive(
        &self,
        eqn: &Equation,
        inputs: &[MaskedValue],
    ) -> Result<Vec<MaskedValue>, MaskingError> {
        let primitive = eqn.primitive;
        let rules = self.registry.lookup(primitive);
        // Masking rule first: a primitive with neither rule reports the
        // missing masking rule.
        let masking_rule = rules
            .masking_rule
            .ok_or_else(|| MaskingError::NotImplemented {
                primitive: primitive.as_str().to_owned(),
            })?;
        let shape_rule = rules
            .shape_rule
            .ok_or_else(|| MaskingError::MissingShapeRule {
                primitive: primitive.as_str().to_owned(),
            })?;
        let ctx = RuleContext {
            primitive,
            params: &eqn.params,
            scope: self.scope,
        };
        let in_shapes: Vec<ShapeSpec> = inputs.iter().map(|input| input.shape.clone()).collect();
        let out_shapes = shape_rule(&ctx, &in_shapes)?;

        if self.nested && ctx.has_polymorphic_params()? {
            return Err(MaskingError::NestedTransform {
                primitive: primitive.as_str().to_owned(),
            });
        }

        let logical = in_shapes
            .iter()
            .map(|spec| self.env.logical_dims(spec))
            .collect::<Result<Vec<_>, _>>()?;
        let masking_ctx = MaskingContext {
            rule: ctx,
            in_shapes: &in_shapes,
            logical: &logical,
            out_shapes: &out_shapes,
            env: self.env,
        };
        let values: Vec<Value> = inputs.iter().map(|input| input.value.clone()).collect();
        let outputs = masking_rule(&masking_ctx, &values)?;
        trace!(
            primitive = primitive.as_str(),
            out_shapes = ?out_shapes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            logical = ?logical,
            "masked equation"
        );

        if outputs.len() != out_shapes.len() {
            return Err(MaskingError::OutputArity {
                primitive: primitive.as_str().to_owned(),
                expected: out_shapes.len(),
                actual: outputs.len(),
            });
        }
        Ok(outputs
            .into_iter()
            .zip(out_shapes)
            .map(|(value, shape)| MaskedValue::new(value, shape))
            .collect())
    }

    /// Re-enters the interpreter once per logical step, then pads the
    /// stacked outputs out to the padded scan length with zeros. With no
    /// logical steps the body still runs once, unrecorded, so the zero `ys`
    /// keep the body's dtypes.
    fn scan(
        &self,
        eqn: &Equation,
        inputs: &[MaskedValue],
    ) -> Result<Vec<MaskedValue>, MaskingError> {
        let body = body_of(eqn)?;
        let layout = ScanLayout::from_params(&eqn.params, inputs.len())?;
        let in_shapes: Vec<ShapeSpec> = inputs.iter().map(|input| input.shape.clone()).collect();
        let out_shapes = scan_shapes(eqn, self.registry, self.scope, &in_shapes)?;

        let xs = &inputs[layout.xs_start()..];
        let steps = match xs.first() {
            Some(first) => self.env.logical_dims(&first.shape)?[0],
            None => {
                let length = ScanLayout::length_param(&eqn.params)?.ok_or_else(|| {
                    InterpreterError::ScanLayout {
                        detail: "no scanned inputs and no 'length' param".to_owned(),
                    }
                })?;
                i64::try_from(length).map_err(|_| InterpreterError::ScanLayout {
                    detail: format!("scan length {length} does not fit in i64"),
                })?
            }
        };
        let xs_tensors: Vec<TensorValue> = xs.iter().map(|x| x.value.to_tensor()).collect();
        let x_shapes: Vec<ShapeSpec> = xs
            .iter()
            .map(|x| ShapeSpec::new(x.shape.dims[1..].to_vec()))
            .collect();

        let mut carry: Vec<MaskedValue> = inputs[layout.num_consts..layout.xs_start()].to_vec();
        let num_ys = out_shapes.len() - layout.num_carry;
        let mut ys: Vec<Vec<Value>> = vec![Vec::new(); num_ys];
        for step in 0..usize::try_from(steps).unwrap_or(0) {
            let mut body_args = inputs[..layout.num_consts].to_vec();
            body_args.append(&mut carry);
            for (x, shape) in xs_tensors.iter().zip(&x_shapes) {
                body_args.push(MaskedValue::new(x.slice_axis0(step)?, shape.clone()));
            }
            let mut outs = self.run(body, &body_args)?;
            let step_ys = outs.split_off(layout.num_carry);
            carry = outs;
            for (column, y) in ys.iter_mut().zip(step_ys) {
                column.push(y.value);
            }
            trace!(step, "masked scan step");
        }

        let empty_dtypes = if steps > 0 {
            Vec::new()
        } else {
            let mut body_args = inputs[..layout.xs_start()].to_vec();
            for (x, shape) in xs_tensors.iter().zip(&x_shapes) {
                body_args.push(MaskedValue::new(first_row(x)?, shape.clone()));
            }
            let outs = self.run(body, &body_args)?;
            outs[layout.num_carry..]
                .iter()
                .map(|y| y.value.dtype())
                .collect()
        };

        let mut outputs = carry;
        for (idx, (column, shape)) in ys
            .into_iter()
            .zip(&out_shapes[layout.num_carry..])
            .enumerate()
        {
            let padded = self.env.padded_shape(shape)?;
            let value = match column.first() {
                Some(first) => {
                    let stacked = Value::Tensor(TensorValue::stack_axis0(&column)?);
                    let rank = padded.rank();
                    read_window(
                        &stacked,
                        &vec![0; rank],
                        &vec![1; rank],
                        padded.dims,
                        Literal::zero(first.dtype()),
                    )?
                }
                None => {
                    let dtype = empty_dtypes.get(idx).copied().ok_or_else(|| {
                        MaskingError::OutputArity {
                            primitive: Primitive::Scan.as_str().to_owned(),
                            expected: num_ys,
                            actual: empty_dtypes.len(),
                        }
                    })?;
                    Value::Tensor(TensorValue::zeros(dtype, padded)?)
                }
            };
            outputs.push(MaskedValue::new(value, shape.clone()));
        }
        Ok(outputs)
    }
}

/// Row 0 of a scanned input, or a zero row when the padded length is 0.
/// Only its dtype and shape matter.
fn first_row(x: &TensorValue) -> Result<Value, MaskingError> {
    if x.leading_dim().is_some_and(|len| len > 0) {
        return Ok(x.slice_axis0(0)?);
    }
    let row = Shape {
        dims: x.shape.dims.get(1..).unwrap_or_default().to_vec(),
    };
    if row.rank() == 0 {
        Ok(Value::Scalar(Literal::zero(x.dtype)))
    } else {
        Ok(Value::Tensor(TensorValue::zeros(x.dtype, row)?))
    }
}
