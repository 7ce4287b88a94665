#![forbid(unsafe_code)]

//! Symbolic shape propagation through a program.

use crate::rules::{RuleContext, RuleRegistry};
use crate::{InterpreterError, MaskingError, ScanLayout, body_of};
use fj_core::{Atom, Equation, Jaxpr, Primitive, VarId};
use fj_shape::{DimExpr, Polynomial, RenameContext, ShapeError, ShapeSpec};
use std::collections::BTreeMap;
use tracing::debug;

/// Binds `constvars` then `invars` of `jaxpr` to `values`, in that order.
pub(crate) fn bind_inputs<T: Clone>(
    jaxpr: &Jaxpr,
    values: &[T],
) -> Result<BTreeMap<VarId, T>, MaskingError> {
    let expected = jaxpr.constvars.len() + jaxpr.invars.len();
    if values.len() != expected {
        return Err(MaskingError::InputArity {
            expected,
            actual: values.len(),
        });
    }
    Ok(jaxpr
        .constvars
        .iter()
        .chain(&jaxpr.invars)
        .copied()
        .zip(values.iter().cloned())
        .collect())
}

pub(crate) fn read_outputs<T: Clone>(
    jaxpr: &Jaxpr,
    env: &BTreeMap<VarId, T>,
) -> Result<Vec<T>, MaskingError> {
    jaxpr
        .outvars
        .iter()
        .map(|var| {
            env.get(var)
                .cloned()
                .ok_or(MaskingError::MissingVariable(*var))
        })
        .collect()
}

/// Wildcard axes become fresh variables that equal nothing but themselves.
fn placeholder(spec: &ShapeSpec) -> ShapeSpec {
    spec.iter()
        .map(|dim| match dim {
            DimExpr::Wildcard => DimExpr::Poly(Polynomial::var(RenameContext::fresh("_"))),
            other => other.clone(),
        })
        .collect()
}

/// Output shapes of `jaxpr` given the shapes of its constants followed by
/// its inputs.
///
/// Shape-valued params are read in `scope`, the variable scope the input
/// specs were parsed in.
pub fn shapecheck_jaxpr(
    jaxpr: &Jaxpr,
    registry: &RuleRegistry,
    scope: &RenameContext,
    in_shapes: &[ShapeSpec],
) -> Result<Vec<ShapeSpec>, MaskingError> {
    let placeholders: Vec<ShapeSpec> = in_shapes.iter().map(placeholder).collect();
    let mut env = bind_inputs(jaxpr, &placeholders)?;

    for eqn in &jaxpr.equations {
        let mut shapes = Vec::with_capacity(eqn.inputs.len());
        for atom in &eqn.inputs {
            match atom {
                Atom::Var(var) => shapes.push(
                    env.get(var)
                        .cloned()
                        .ok_or(MaskingError::MissingVariable(*var))?,
                ),
                Atom::Lit(_) => shapes.push(ShapeSpec::scalar()),
            }
        }

        let outputs = equation_shapes(eqn, registry, scope, &shapes).inspect_err(|err| {
            debug!(primitive = eqn.primitive.as_str(), error = %err, "shape rule rejected inputs");
        })?;
        if outputs.len() != eqn.outputs.len() {
            return Err(MaskingError::OutputArity {
                primitive: eqn.primitive.as_str().to_owned(),
                expected: eqn.outputs.len(),
                actual: outputs.len(),
            });
        }
        env.extend(eqn.outputs.iter().copied().zip(outputs));
    }

    let outputs = read_outputs(jaxpr, &env)?;
    debug!(
        equations = jaxpr.equations.len(),
        outputs = outputs.len(),
        "shapecheck traced program"
    );
    Ok(outputs)
}

fn equation_shapes(
    eqn: &Equation,
    registry: &RuleRegistry,
    scope: &RenameContext,
    shapes: &[ShapeSpec],
) -> Result<Vec<ShapeSpec>, MaskingError> {
    match eqn.primitive {
        Primitive::Scan => scan_shapes(eqn, registry, scope, shapes),
        Primitive::Pjit => shapecheck_jaxpr(body_of(eqn)?, registry, scope, shapes),
        primitive => {
            let rule =
                registry
                    .lookup(primitive)
                    .shape_rule
                    .ok_or_else(|| MaskingError::MissingShapeRule {
                        primitive: primitive.as_str().to_owned(),
                    })?;
            let ctx = RuleContext {
                primitive,
                params: &eqn.params,
                scope,
            };
            Ok(rule(&ctx, shapes)?)
        }
    }
}

/// Scan output shapes: the carry must come back with the shape it went in
/// with, and every per-step output gains a leading axis of the scan length.
pub(crate) fn scan_shapes(
    eqn: &Equation,
    registry: &RuleRegistry,
    scope: &RenameContext,
    shapes: &[ShapeSpec],
) -> Result<Vec<ShapeSpec>, MaskingError> {
    let layout = ScanLayout::from_params(&eqn.params, shapes.len())?;
    let xs = &shapes[layout.xs_start()..];
    let incompatible = || ShapeError::IncompatibleShapes {
        primitive: Primitive::Scan.as_str().to_owned(),
        shapes: shapes.iter().map(ToString::to_string).collect(),
    };

    let length = match (xs.first(), ScanLayout::length_param(&eqn.params)?) {
        (Some(first), _) => first.dims.first().cloned().ok_or_else(incompatible)?,
        (None, Some(length)) => DimExpr::Const(length as i64),
        (None, None) => {
            return Err(InterpreterError::ScanLayout {
                detail: "no scanned inputs and no 'length' param".to_owned(),
            }
            .into());
        }
    };
    if xs.iter().any(|x| x.dims.first() != Some(&length)) {
        return Err(incompatible().into());
    }

    let carry_in = &shapes[layout.num_consts..layout.xs_start()];
    let mut body_in = shapes[..layout.xs_start()].to_vec();
    body_in.extend(xs.iter().map(|x| ShapeSpec::new(x.dims[1..].to_vec())));
    let mut body_out = shapecheck_jaxpr(body_of(eqn)?, registry, scope, &body_in)?;
    if body_out.len() < layout.num_carry {
        return Err(MaskingError::OutputArity {
            primitive: Primitive::Scan.as_str().to_owned(),
            expected: layout.num_carry,
            actual: body_out.len(),
        });
    }
    let ys = body_out.split_off(layout.num_carry);
    if body_out != carry_in {
        let mut shapes: Vec<String> = carry_in.iter().map(ToString::to_string).collect();
        shapes.extend(body_out.iter().map(ToString::to_string));
        return Err(ShapeError::IncompatibleShapes {
            primitive: Primitive::Scan.as_str().to_owned(),
            shapes,
        }
        .into());
    }

    let mut outputs = body_out;
    outputs.extend(ys.into_iter().map(|y| {
        let mut dims = Vec::with_capacity(y.rank() + 1);
        dims.push(length.clone());
        dims.extend(y.dims);
        ShapeSpec::new(dims)
    }));
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::shapecheck_jaxpr;
    use crate::MaskingError;
    use crate::rules::default_registry;
    use fj_core::{Atom, JaxprBuilder, Literal, Primitive};
    use fj_shape::{RenameContext, ShapeError, ShapeSpec, parse_spec_in};

    fn specs(scope: &mut RenameContext, specs: &[&str]) -> Vec<ShapeSpec> {
        specs
            .iter()
            .map(|spec| parse_spec_in(scope, spec).expect("valid spec"))
            .collect()
    }

    fn render(shapes: &[ShapeSpec]) -> Vec<String> {
        shapes.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn slice_then_concatenate_stays_symbolic() {
        let mut b = JaxprBuilder::new();
        let x = b.invar();
        let y = b.invar();
        let tail = b.eqn(
            Primitive::Slice,
            vec![Atom::Var(x)],
            &[("start_indices", "1"), ("limit_indices", "n")],
        );
        let joined = b.eqn(
            Primitive::Concatenate,
            vec![Atom::Var(tail), Atom::Var(y), Atom::Var(x)],
            &[("dimension", "0")],
        );
        let jaxpr = b.build(vec![tail, joined]);

        let mut scope = RenameContext::new();
        let inputs = specs(&mut scope, &["n", "m"]);
        let outputs =
            shapecheck_jaxpr(&jaxpr, default_registry(), &scope, &inputs).expect("checks");
        assert_eq!(render(&outputs), ["(n + -1,)", "(m + 2 n + -1,)"]);
    }

    #[test]
    fn mismatched_operands_are_shape_errors() {
        let mut b = JaxprBuilder::new();
        let x = b.invar();
        let y = b.invar();
        let out = b.eqn(Primitive::Add, vec![Atom::Var(x), Atom::Var(y)], &[]);
        let jaxpr = b.build(vec![out]);

        let mut scope = RenameContext::new();
        let inputs = specs(&mut scope, &["n", "m"]);
        let err = shapecheck_jaxpr(&jaxpr, default_registry(), &scope, &inputs)
            .expect_err("n and m differ");
        assert!(matches!(
            err,
            MaskingError::Shape(ShapeError::IncompatibleShapes { .. })
        ));
    }

    #[test]
    fn wildcards_only_match_themselves() {
        let squared = |same: bool| {
            let mut b = JaxprBuilder::new();
            let x = b.invar();
            let y = b.invar();
            let rhs = if same { x } else { y };
            let out = b.eqn(Primitive::Mul, vec![Atom::Var(x), Atom::Var(rhs)], &[]);
            b.build(vec![out])
        };
        let mut scope = RenameContext::new();
        let inputs = specs(&mut scope, &["_", "_"]);
        assert!(shapecheck_jaxpr(&squared(true), default_registry(), &scope, &inputs).is_ok());
        assert!(shapecheck_jaxpr(&squared(false), default_registry(), &scope, &inputs).is_err());
    }

    #[test]
    fn scan_outputs_gain_the_length_axis() {
        let mut body = JaxprBuilder::new();
        let carry = body.invar();
        let x = body.invar();
        let next = body.eqn(Primitive::Add, vec![Atom::Var(carry), Atom::Var(x)], &[]);
        let doubled = body.eqn(Primitive::Mul, vec![Atom::Var(x), Atom::Lit(Literal::I64(2))], &[]);
        let body = body.build(vec![next, doubled]);

        let mut b = JaxprBuilder::new();
        let init = b.invar();
        let xs = b.invar();
        let outs = b.eqn_multi(
            Primitive::Scan,
            vec![Atom::Var(init), Atom::Var(xs)],
            2,
            &[("num_carry", "1")],
            vec![body],
        );
        let jaxpr = b.build(outs);

        let mut scope = RenameContext::new();
        let inputs = specs(&mut scope, &["k", "(n, k)"]);
        let outputs =
            shapecheck_jaxpr(&jaxpr, default_registry(), &scope, &inputs).expect("checks");
        assert_eq!(render(&outputs), ["(k,)", "(n, k)"]);
    }

    #[test]
    fn scan_carry_must_keep_its_shape() {
        let mut body = JaxprBuilder::new();
        let carry = body.invar();
        let x = body.invar();
        let grown = body.eqn(
            Primitive::Concatenate,
            vec![Atom::Var(carry), Atom::Var(x)],
            &[("dimension", "0")],
        );
        let body = body.build(vec![grown]);

        let mut b = JaxprBuilder::new();
        let init = b.invar();
        let xs = b.invar();
        let outs = b.eqn_multi(
            Primitive::Scan,
            vec![Atom::Var(init), Atom::Var(xs)],
            1,
            &[("num_carry", "1")],
            vec![body],
        );
        let jaxpr = b.build(outs);

        let mut scope = RenameContext::new();
        let inputs = specs(&mut scope, &["k", "(n, k)"]);
        let err = shapecheck_jaxpr(&jaxpr, default_registry(), &scope, &inputs)
            .expect_err("carry grows");
        assert_eq!(
            err.to_string(),
            "scan got incompatible shapes: (k,), (2 k,)"
        );
    }

    #[test]
    fn primitives_without_shape_rules_fail() {
        let mut registry = crate::RuleRegistry::empty();
        registry.register_shape_rule(Primitive::Neg, |_, shapes| Ok(shapes.to_vec()));
        let mut b = JaxprBuilder::new();
        let x = b.invar();
        let y = b.eqn(Primitive::Neg, vec![Atom::Var(x)], &[]);
        let z = b.eqn(Primitive::Exp, vec![Atom::Var(y)], &[]);
        let jaxpr = b.build(vec![z]);
        let mut scope = RenameContext::new();
        let inputs = specs(&mut scope, &["n"]);
        let err = shapecheck_jaxpr(&jaxpr, &registry, &scope, &inputs).expect_err("no rule");
        assert_eq!(err.to_string(), "Shape rule for exp not implemented yet.");
    }
}
