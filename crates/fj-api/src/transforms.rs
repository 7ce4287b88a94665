#![forbid(unsafe_code)]

use fj_core::{Jaxpr, Shape, TensorValue, Value};
use fj_interpreters::{
    MaskEnv, MaskedValue, RuleRegistry, default_registry, eval_masked_jaxpr, shapecheck_jaxpr,
};
use fj_shape::{
    DimExpr, DimVar, RenameContext, ShapeEnv, ShapeError, ShapeSpec, ShapeTree, TreeDef,
    bind_shapes, check_shapes, eval_dim, finalize_spec, parse_spec_in,
};
use tracing::debug;

use crate::errors::ApiError;

/// A program evaluated on padded arrays.
///
/// Each input is an array padded past its logical size along its
/// polymorphic axes. A call takes the padded arrays plus the logical value
/// of every shape variable and returns padded outputs whose logical regions
/// match what the program computes on the unpadded arrays.
#[derive(Debug, Clone)]
pub struct MaskedFn {
    jaxpr: Jaxpr,
    scope: RenameContext,
    in_specs: Vec<ShapeSpec>,
    out_specs: Option<ShapeTree<ShapeSpec>>,
    out_tree: Option<TreeDef>,
    unpadded: Vec<String>,
    registry: Option<RuleRegistry>,
    check_padded_outputs: bool,
}

/// Padded outputs together with their polymorphic logical shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedOutputs {
    pub values: ShapeTree<Value>,
    pub shapes: ShapeTree<ShapeSpec>,
}

/// Logical size of one shape variable in a batched call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalSize {
    /// Same size for every batch element.
    Shared(i64),
    PerBatch(Vec<i64>),
}

/// Masks `jaxpr`. `in_shapes` covers the constvars first, then the invars.
/// The program is validated up front.
///
/// All shape strings are parsed in one scope, so `n` in two input shapes
/// (or in the output shape) is the same variable.
pub fn mask(
    jaxpr: Jaxpr,
    in_shapes: &[&str],
    out_shape: Option<ShapeTree<&str>>,
) -> Result<MaskedFn, ApiError> {
    jaxpr.validate_well_formed()?;
    let expected = jaxpr.constvars.len() + jaxpr.invars.len();
    if in_shapes.len() != expected {
        return Err(ApiError::InputArity {
            expected,
            actual: in_shapes.len(),
        });
    }
    let mut scope = RenameContext::new();
    let in_specs = in_shapes
        .iter()
        .map(|spec| parse_spec_in(&mut scope, spec))
        .collect::<Result<Vec<_>, _>>()?;
    let out_specs = match out_shape {
        Some(tree) => Some(tree.try_map(&mut |spec| parse_spec_in(&mut scope, spec))?),
        None => None,
    };
    Ok(MaskedFn {
        jaxpr,
        scope,
        in_specs,
        out_specs,
        out_tree: None,
        unpadded: Vec::new(),
        registry: None,
        check_padded_outputs: true,
    })
}

/// Checks symbolically that `jaxpr` maps `in_shapes` to `out_shape`
/// without running it.
pub fn shapecheck(
    jaxpr: Jaxpr,
    in_shapes: &[&str],
    out_shape: ShapeTree<&str>,
) -> Result<(), ApiError> {
    mask(jaxpr, in_shapes, Some(out_shape))?
        .shapecheck()
        .map(|_| ())
}

impl MaskedFn {
    /// Asserts that the named variables are never padded. Their logical
    /// size may then be left out of the call environment.
    #[must_use]
    pub fn with_unpadded_vars(mut self, names: &[&str]) -> Self {
        self.unpadded = names.iter().map(|name| (*name).to_owned()).collect();
        self
    }

    /// Structure the program's flat outputs are returned in. Defaults to a
    /// bare leaf for one output and a tuple otherwise.
    #[must_use]
    pub fn with_out_tree(mut self, tree: TreeDef) -> Self {
        self.out_tree = Some(tree);
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: RuleRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Also compare concrete padded output shapes against the declared
    /// output shapes evaluated at the padded sizes. On by default.
    #[must_use]
    pub fn with_padded_output_check(mut self, enabled: bool) -> Self {
        self.check_padded_outputs = enabled;
        self
    }

    #[must_use]
    pub fn in_specs(&self) -> &[ShapeSpec] {
        &self.in_specs
    }

    #[must_use]
    pub fn out_specs(&self) -> Option<&ShapeTree<ShapeSpec>> {
        self.out_specs.as_ref()
    }

    fn registry(&self) -> &RuleRegistry {
        self.registry.as_ref().unwrap_or_else(|| default_registry())
    }

    fn output_structure(&self, count: usize) -> TreeDef {
        self.out_tree.clone().unwrap_or_else(|| {
            if count == 1 {
                ShapeTree::Leaf(())
            } else {
                ShapeTree::Tuple(vec![ShapeTree::Leaf(()); count])
            }
        })
    }

    fn lookup(&self, name: &str) -> Result<DimVar, ApiError> {
        self.scope
            .lookup(name)
            .cloned()
            .ok_or_else(|| ApiError::UnknownVariable {
                name: name.to_owned(),
            })
    }

    fn mask_env(&self, logical: &[(&str, i64)], padded: ShapeEnv) -> Result<MaskEnv, ApiError> {
        let mut sizes = ShapeEnv::new();
        for (name, size) in logical {
            sizes.insert(self.lookup(name)?, *size);
        }
        let unpadded = self
            .unpadded
            .iter()
            .map(|name| self.lookup(name))
            .collect::<Result<Vec<_>, _>>()?;
        let env = MaskEnv::new(sizes, padded).with_unpadded(unpadded);
        env.validate()?;
        Ok(env)
    }

    /// Propagates the input shapes through the program and checks the
    /// result against the declared output shapes, if any.
    pub fn shapecheck(&self) -> Result<ShapeTree<ShapeSpec>, ApiError> {
        let produced = shapecheck_jaxpr(&self.jaxpr, self.registry(), &self.scope, &self.in_specs)?;
        let produced = unflatten(&self.output_structure(produced.len()), produced)?;
        if let Some(declared) = &self.out_specs
            && let Err(err) = check_shapes("Output", declared, &produced)
        {
            debug!(error = %err, "shapecheck rejected program");
            return Err(err.into());
        }
        debug!(outputs = %produced, "shapecheck passed");
        Ok(produced)
    }

    /// Runs the program on padded `args` with the logical sizes in
    /// `logical` (keyed by variable name).
    pub fn call(
        &self,
        args: Vec<Value>,
        logical: &[(&str, i64)],
    ) -> Result<ShapeTree<Value>, ApiError> {
        Ok(self.call_with_shapes(args, logical)?.values)
    }

    /// Like [`MaskedFn::call`], also returning each output's polymorphic
    /// logical shape.
    pub fn call_with_shapes(
        &self,
        args: Vec<Value>,
        logical: &[(&str, i64)],
    ) -> Result<MaskedOutputs, ApiError> {
        if args.len() != self.in_specs.len() {
            return Err(ApiError::InputArity {
                expected: self.in_specs.len(),
                actual: args.len(),
            });
        }
        let shapes: Vec<Shape> = args.iter().map(Value::shape).collect();
        let specs = self
            .in_specs
            .iter()
            .zip(&shapes)
            .map(|(spec, shape)| finalize_spec(spec, shape))
            .collect::<Result<Vec<_>, _>>()?;
        let env = self.mask_env(logical, bind_shapes(&specs, &shapes)?)?;
        debug!(inputs = args.len(), logical = ?env.logical, "masked call");

        let inputs: Vec<MaskedValue> = args
            .into_iter()
            .zip(specs)
            .map(|(value, spec)| MaskedValue::new(value, spec))
            .collect();
        let outputs = eval_masked_jaxpr(&self.jaxpr, self.registry(), &self.scope, &env, &inputs)?;

        let def = self.output_structure(outputs.len());
        let (values, shapes): (Vec<_>, Vec<_>) = outputs
            .into_iter()
            .map(|out| (out.value, out.shape))
            .unzip();
        let values = unflatten(&def, values)?;
        let shapes = unflatten(&def, shapes)?;

        if let Some(declared) = &self.out_specs {
            check_shapes("Output", declared, &shapes)?;
            if self.check_padded_outputs {
                let expected = declared
                    .clone()
                    .try_map(&mut |spec| padded_spec(&spec, &env.padded))?;
                let actual = values
                    .clone()
                    .map(&mut |value| ShapeSpec::from_consts(&value.shape().dims));
                check_shapes("Padded output", &expected, &actual)?;
            }
        }
        Ok(MaskedOutputs { values, shapes })
    }

    /// Calls the masked program once per batch element and stacks the
    /// outputs along a new leading axis.
    ///
    /// `batched[i]` says whether `args[i]` carries a leading batch axis;
    /// unbatched inputs are shared by every element. All batch sources
    /// (batched inputs and per-batch sizes) must agree on the batch size.
    pub fn call_batched(
        &self,
        args: Vec<Value>,
        batched: &[bool],
        logical: &[(&str, LogicalSize)],
    ) -> Result<ShapeTree<Value>, ApiError> {
        if batched.len() != args.len() {
            return Err(ApiError::BatchMismatch {
                detail: format!("{} batch flags for {} inputs", batched.len(), args.len()),
            });
        }
        let mut sizes = Vec::new();
        let mut rows_of: Vec<Option<TensorValue>> = Vec::with_capacity(args.len());
        for (idx, (arg, is_batched)) in args.iter().zip(batched).enumerate() {
            if !is_batched {
                rows_of.push(None);
                continue;
            }
            let tensor = arg.to_tensor();
            let Some(lead) = tensor.leading_dim() else {
                return Err(ApiError::BatchMismatch {
                    detail: format!("input {idx} is batched but has rank 0"),
                });
            };
            sizes.push(lead as usize);
            rows_of.push(Some(tensor));
        }
        sizes.extend(logical.iter().filter_map(|(_, size)| match size {
            LogicalSize::PerBatch(values) => Some(values.len()),
            LogicalSize::Shared(_) => None,
        }));
        let Some(&batch) = sizes.first() else {
            return Err(ApiError::BatchMismatch {
                detail: "nothing is batched".to_owned(),
            });
        };
        if sizes.iter().any(|size| *size != batch) {
            return Err(ApiError::BatchMismatch {
                detail: format!("batch sizes disagree: {sizes:?}"),
            });
        }

        let mut rows = Vec::with_capacity(batch);
        for row in 0..batch {
            let row_args = args
                .iter()
                .zip(&rows_of)
                .map(|(arg, tensor)| match tensor {
                    Some(tensor) => tensor.slice_axis0(row),
                    None => Ok(arg.clone()),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let row_sizes: Vec<(&str, i64)> = logical
                .iter()
                .map(|(name, size)| {
                    let size = match size {
                        LogicalSize::Shared(value) => *value,
                        LogicalSize::PerBatch(values) => values[row],
                    };
                    (*name, size)
                })
                .collect();
            rows.push(self.call(row_args, &row_sizes)?);
        }
        stack_rows(rows)
    }
}

/// `spec` at the padded sizes. Wildcards stay wildcards.
fn padded_spec(spec: &ShapeSpec, padded: &ShapeEnv) -> Result<ShapeSpec, ShapeError> {
    spec.iter()
        .map(|dim| {
            Ok(match eval_dim(dim, padded)? {
                Some(size) => DimExpr::Const(size),
                None => DimExpr::Wildcard,
            })
        })
        .collect()
}

fn unflatten<T>(def: &TreeDef, leaves: Vec<T>) -> Result<ShapeTree<T>, ApiError> {
    let count = leaves.len();
    def.unflatten(leaves).ok_or_else(|| ApiError::TreeMismatch {
        structure: def.describe(),
        leaves: count,
    })
}

fn stack_rows(rows: Vec<ShapeTree<Value>>) -> Result<ShapeTree<Value>, ApiError> {
    let mut rows = rows.into_iter().map(ShapeTree::flatten);
    let Some((first, def)) = rows.next() else {
        return Err(ApiError::BatchMismatch {
            detail: "empty batch".to_owned(),
        });
    };
    let mut columns: Vec<Vec<Value>> = first.into_iter().map(|leaf| vec![leaf]).collect();
    for (leaves, _) in rows {
        for (column, leaf) in columns.iter_mut().zip(leaves) {
            column.push(leaf);
        }
    }
    let stacked = columns
        .iter()
        .map(|column| TensorValue::stack_axis0(column).map(Value::Tensor))
        .collect::<Result<Vec<_>, _>>()?;
    unflatten(&def, stacked)
}
