#![forbid(unsafe_code)]

use crate::rules::{RuleContext, RuleRegistry};
use fj_core::Primitive;
use fj_shape::{DimExpr, Polynomial, ShapeError, ShapeSpec};

pub(crate) fn register(registry: &mut RuleRegistry) {
    const UNARY: [Primitive; 9] = [
        Primitive::Neg,
        Primitive::Abs,
        Primitive::Exp,
        Primitive::Log,
        Primitive::Sin,
        Primitive::Cos,
        Primitive::Tanh,
        Primitive::Sqrt,
        Primitive::Sign,
    ];
    const NARY: [Primitive; 14] = [
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
    ];
    for primitive in UNARY {
        registry.register_shape_rule(primitive, same_shape);
    }
    for primitive in NARY {
        registry.register_shape_rule(primitive, broadcasting_nary);
    }
    for primitive in [
        Primitive::ReduceSum,
        Primitive::ReduceMax,
        Primitive::ReduceMin,
        Primitive::ReduceProd,
    ] {
        registry.register_shape_rule(primitive, reduce);
    }
    registry.register_shape_rule(Primitive::Dot, dot);
    registry.register_shape_rule(Primitive::Concatenate, concatenate);
    registry.register_shape_rule(Primitive::Pad, pad);
    registry.register_shape_rule(Primitive::Slice, slice);
    registry.register_shape_rule(Primitive::Transpose, transpose);
    registry.register_shape_rule(Primitive::BroadcastInDim, broadcast_in_dim);
    registry.register_shape_rule(Primitive::Reshape, reshape);
    registry.register_shape_rule(Primitive::Cumsum, along_axis);
    registry.register_shape_rule(Primitive::Sort, along_axis);
    registry.register_shape_rule(Primitive::Iota, iota);
    registry.register_shape_rule(Primitive::DimSize, dim_size);
}

fn arity(ctx: &RuleContext<'_>, shapes: &[ShapeSpec], expected: usize) -> Result<(), ShapeError> {
    if shapes.len() == expected {
        Ok(())
    } else {
        Err(ctx.invalid(format!("expected {expected} operands, got {}", shapes.len())))
    }
}

fn polys(spec: &ShapeSpec) -> Result<Vec<Polynomial>, ShapeError> {
    spec.to_polys().ok_or_else(|| ShapeError::UnresolvedWildcard {
        spec: spec.to_string(),
    })
}

fn check_axis(ctx: &RuleContext<'_>, axis: usize, rank: usize) -> Result<(), ShapeError> {
    if axis < rank {
        Ok(())
    } else {
        Err(ctx.invalid(format!("axis {axis} out of bounds for rank {rank}")))
    }
}

fn same_shape(ctx: &RuleContext<'_>, shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>, ShapeError> {
    arity(ctx, shapes, 1)?;
    Ok(vec![shapes[0].clone()])
}

/// Operands agree exactly, except that scalars broadcast.
fn broadcasting_nary(
    ctx: &RuleContext<'_>,
    shapes: &[ShapeSpec],
) -> Result<Vec<ShapeSpec>, ShapeError> {
    let expected = if ctx.primitive == Primitive::Select { 3 } else { 2 };
    arity(ctx, shapes, expected)?;
    let mut arrays = shapes.iter().filter(|shape| shape.rank() > 0);
    let Some(first) = arrays.next() else {
        return Ok(vec![ShapeSpec::scalar()]);
    };
    if arrays.any(|other| other != first) {
        return Err(ctx.incompatible(shapes));
    }
    Ok(vec![first.clone()])
}

fn reduce(ctx: &RuleContext<'_>, shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>, ShapeError> {
    arity(ctx, shapes, 1)?;
    let operand = &shapes[0];
    let axes = ctx
        .usize_list("axes")?
        .unwrap_or_else(|| (0..operand.rank()).collect());
    for &axis in &axes {
        check_axis(ctx, axis, operand.rank())?;
    }
    Ok(vec![
        operand
            .iter()
            .enumerate()
            .filter(|(axis, _)| !axes.contains(axis))
            .map(|(_, dim)| dim.clone())
            .collect(),
    ])
}

fn dot(ctx: &RuleContext<'_>, shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>, ShapeError> {
    arity(ctx, shapes, 2)?;
    let (lhs, rhs) = (&shapes[0], &shapes[1]);
    if lhs.rank() == 0 || rhs.rank() == 0 {
        return broadcasting_nary(ctx, shapes);
    }
    if lhs.rank() > 2 || rhs.rank() > 2 || lhs.dims[lhs.rank() - 1] != rhs.dims[0] {
        return Err(ctx.incompatible(shapes));
    }
    let mut dims = lhs.dims[..lhs.rank() - 1].to_vec();
    dims.extend_from_slice(&rhs.dims[1..]);
    Ok(vec![ShapeSpec::new(dims)])
}

fn concatenate(
    ctx: &RuleContext<'_>,
    shapes: &[ShapeSpec],
) -> Result<Vec<ShapeSpec>, ShapeError> {
    let Some(first) = shapes.first() else {
        return Err(ctx.invalid("expected at least one operand"));
    };
    let axis = ctx.usize_or("dimension", 0)?;
    check_axis(ctx, axis, first.rank())?;
    let mut total = Polynomial::zero();
    for shape in shapes {
        let same_elsewhere = shape.rank() == first.rank()
            && (0..first.rank()).all(|a| a == axis || shape.dims[a] == first.dims[a]);
        if !same_elsewhere {
            return Err(ctx.incompatible(shapes));
        }
        total = total.checked_add(&polys(shape)?.swap_remove(axis))?;
    }
    let mut dims = first.dims.clone();
    dims[axis] = DimExpr::from_poly(total);
    Ok(vec![ShapeSpec::new(dims)])
}

/// `low + high + d + (d - 1) * interior` per axis.
fn pad(ctx: &RuleContext<'_>, shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>, ShapeError> {
    arity(ctx, shapes, 2)?;
    if shapes[1].rank() != 0 {
        return Err(ctx.invalid("padding value must be a scalar"));
    }
    let operand = polys(&shapes[0])?;
    let low = polys(&ctx.spec_param("padding_low")?)?;
    let high = polys(&ctx.spec_param("padding_high")?)?;
    let interior = ctx
        .usize_list("padding_interior")?
        .unwrap_or_else(|| vec![0; operand.len()]);
    if low.len() != operand.len() || high.len() != operand.len() || interior.len() != operand.len()
    {
        return Err(ctx.invalid(format!(
            "padding config does not have rank {}",
            operand.len()
        )));
    }
    let dims = operand
        .iter()
        .enumerate()
        .map(|(axis, dim)| {
            let base = low[axis].checked_add(&high[axis])?;
            if dim.as_constant() == Some(0) {
                return Ok(base);
            }
            let interior = i64::try_from(interior[axis])
                .map_err(|_| ctx.invalid(format!("interior padding {}", interior[axis])))?;
            let gaps = dim
                .checked_sub(&Polynomial::constant(1))?
                .checked_mul(&Polynomial::constant(interior))?;
            Ok(base.checked_add(dim)?.checked_add(&gaps)?)
        })
        .collect::<Result<Vec<_>, ShapeError>>()?;
    Ok(vec![ShapeSpec::from_polys(dims)])
}

/// `ceil((limit - start) / stride)` per axis. Symbolic extents must divide
/// the stride exactly.
fn slice(ctx: &RuleContext<'_>, shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>, ShapeError> {
    arity(ctx, shapes, 1)?;
    let rank = shapes[0].rank();
    let starts = polys(&ctx.spec_param("start_indices")?)?;
    let limits = polys(&ctx.spec_param("limit_indices")?)?;
    let strides = ctx.usize_list("strides")?.unwrap_or_else(|| vec![1; rank]);
    if starts.len() != rank || limits.len() != rank || strides.len() != rank {
        return Err(ctx.invalid(format!("slice bounds do not have rank {rank}")));
    }
    let mut dims = Vec::with_capacity(rank);
    for axis in 0..rank {
        let stride = strides[axis] as i64;
        if stride <= 0 {
            return Err(ctx.invalid(format!("stride {stride} on axis {axis}")));
        }
        let extent = limits[axis].checked_sub(&starts[axis])?;
        if extent.lt(&Polynomial::zero())? {
            return Err(ctx.invalid(format!(
                "limit {} precedes start {} on axis {axis}",
                limits[axis], starts[axis]
            )));
        }
        dims.push(if stride == 1 {
            extent
        } else {
            extent
                .checked_add(&Polynomial::constant(stride - 1))?
                .floor_div(stride)?
        });
    }
    Ok(vec![ShapeSpec::from_polys(dims)])
}

fn transpose(ctx: &RuleContext<'_>, shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>, ShapeError> {
    arity(ctx, shapes, 1)?;
    let operand = &shapes[0];
    let rank = operand.rank();
    let permutation = ctx
        .usize_list("permutation")?
        .unwrap_or_else(|| (0..rank).rev().collect());
    let mut sorted = permutation.clone();
    sorted.sort_unstable();
    if sorted != (0..rank).collect::<Vec<_>>() {
        return Err(ctx.invalid(format!("invalid permutation {permutation:?} for rank {rank}")));
    }
    Ok(vec![
        permutation
            .iter()
            .map(|&axis| operand.dims[axis].clone())
            .collect(),
    ])
}

fn broadcast_in_dim(
    ctx: &RuleContext<'_>,
    shapes: &[ShapeSpec],
) -> Result<Vec<ShapeSpec>, ShapeError> {
    arity(ctx, shapes, 1)?;
    let operand = &shapes[0];
    let target = ctx.spec_param("shape")?;
    let mapping = ctx.usize_list("broadcast_dimensions")?.unwrap_or_else(|| {
        (target.rank().saturating_sub(operand.rank())..target.rank()).collect()
    });
    if mapping.len() != operand.rank() {
        return Err(ctx.incompatible(&[operand.clone(), target]));
    }
    for (axis, &out_axis) in mapping.iter().enumerate() {
        let dim = &operand.dims[axis];
        let fits = target
            .dims
            .get(out_axis)
            .is_some_and(|out| *dim == DimExpr::Const(1) || dim == out);
        if !fits {
            return Err(ctx.incompatible(&[operand.clone(), target]));
        }
    }
    Ok(vec![target])
}

fn product(dims: &[Polynomial]) -> Result<Polynomial, ShapeError> {
    dims.iter()
        .try_fold(Polynomial::constant(1), |acc, dim| Ok(acc.checked_mul(dim)?))
}

/// Element counts must agree symbolically. One `-1` entry is inferred when
/// the remaining entries multiply to a constant.
fn reshape(ctx: &RuleContext<'_>, shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>, ShapeError> {
    arity(ctx, shapes, 1)?;
    let total = product(&polys(&shapes[0])?)?;
    let requested = polys(&ctx.spec_param("new_shape")?)?;
    let inferred: Vec<usize> = requested
        .iter()
        .enumerate()
        .filter(|(_, dim)| **dim == -1)
        .map(|(axis, _)| axis)
        .collect();
    let known = product(
        &requested
            .iter()
            .filter(|dim| **dim != -1)
            .cloned()
            .collect::<Vec<_>>(),
    )?;

    let dims = match inferred.as_slice() {
        [] => requested,
        [axis] => {
            let Some(divisor) = known.as_constant().filter(|d| *d > 0) else {
                return Err(ctx.invalid(format!("cannot infer -1 next to {known}")));
            };
            let (quotient, rem) = total.divmod(divisor)?;
            if rem != 0 {
                return Err(ctx.incompatible(&[shapes[0].clone(), ctx.spec_param("new_shape")?]));
            }
            let mut dims = requested;
            dims[*axis] = quotient;
            dims
        }
        _ => return Err(ctx.invalid("at most one -1 entry in new_shape")),
    };
    if product(&dims)? != total {
        return Err(ctx.incompatible(&[shapes[0].clone(), ShapeSpec::from_polys(dims)]));
    }
    Ok(vec![ShapeSpec::from_polys(dims)])
}

/// Shape-preserving op along one axis (`cumsum` uses `axis`, `sort` uses
/// `dimension`).
fn along_axis(ctx: &RuleContext<'_>, shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>, ShapeError> {
    arity(ctx, shapes, 1)?;
    let rank = shapes[0].rank();
    if rank > 0 {
        let axis = match ctx.primitive {
            Primitive::Sort => ctx.usize_or("dimension", rank - 1)?,
            _ => ctx.usize_or("axis", 0)?,
        };
        check_axis(ctx, axis, rank)?;
    }
    Ok(vec![shapes[0].clone()])
}

fn iota(ctx: &RuleContext<'_>, shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>, ShapeError> {
    arity(ctx, shapes, 0)?;
    let length = ctx.spec_param("length")?;
    if length.rank() != 1 {
        return Err(ctx.invalid(format!("length {length} must be a single dimension")));
    }
    Ok(vec![length])
}

fn dim_size(ctx: &RuleContext<'_>, shapes: &[ShapeSpec]) -> Result<Vec<ShapeSpec>, ShapeError> {
    arity(ctx, shapes, 1)?;
    check_axis(ctx, ctx.usize_or("dim", 0)?, shapes[0].rank())?;
    Ok(vec![ShapeSpec::scalar()])
}

#[cfg(test)]
mod tests {
    use crate::rules::{RuleContext, default_registry};
    use fj_core::Primitive;
    use fj_shape::{RenameContext, ShapeError, ShapeSpec, parse_spec_in};
    use std::collections::BTreeMap;

    struct Case {
        scope: RenameContext,
        inputs: Vec<ShapeSpec>,
    }

    impl Case {
        fn new(specs: &[&str]) -> Self {
            let mut scope = RenameContext::new();
            let inputs = specs
                .iter()
                .map(|spec| parse_spec_in(&mut scope, spec).expect("valid spec"))
                .collect();
            Self { scope, inputs }
        }

        fn apply(
            &self,
            primitive: Primitive,
            params: &[(&str, &str)],
        ) -> Result<String, ShapeError> {
            let params: BTreeMap<String, String> = params
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect();
            let ctx = RuleContext {
                primitive,
                params: &params,
                scope: &self.scope,
            };
            let rule = default_registry()
                .lookup(primitive)
                .shape_rule
                .expect("shape rule registered");
            let out = rule(&ctx, &self.inputs)?;
            Ok(out
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" "))
        }
    }

    #[test]
    fn elementwise_rules_broadcast_scalars_only() {
        let case = Case::new(&["n", ""]);
        assert_eq!(case.apply(Primitive::Add, &[]).expect("ok"), "(n,)");
        let case = Case::new(&["n", "m"]);
        let err = case.apply(Primitive::Mul, &[]).expect_err("mismatch");
        assert_eq!(err.to_string(), "mul got incompatible shapes: (n,), (m,)");
        let case = Case::new(&["n", "n", "n"]);
        assert_eq!(case.apply(Primitive::Select, &[]).expect("ok"), "(n,)");
    }

    #[test]
    fn concatenate_adds_symbolically() {
        let case = Case::new(&["n", "m", "n"]);
        assert_eq!(
            case.apply(Primitive::Concatenate, &[("dimension", "0")])
                .expect("ok"),
            "(m + 2 n,)"
        );
    }

    #[test]
    fn dot_and_reductions() {
        let case = Case::new(&["(m, k)", "(k, n)"]);
        assert_eq!(case.apply(Primitive::Dot, &[]).expect("ok"), "(m, n)");
        let case = Case::new(&["(m, n)", "m"]);
        assert!(case.apply(Primitive::Dot, &[]).is_err());
        let case = Case::new(&["(m, n)"]);
        assert_eq!(case.apply(Primitive::ReduceSum, &[]).expect("ok"), "()");
        assert_eq!(
            case.apply(Primitive::ReduceMax, &[("axes", "1")]).expect("ok"),
            "(m,)"
        );
        assert_eq!(
            case.apply(Primitive::ReduceSum, &[("axes", "")]).expect("ok"),
            "(m, n)"
        );
    }

    #[test]
    fn pad_and_slice_extents() {
        let case = Case::new(&["n", ""]);
        let padded = case
            .apply(
                Primitive::Pad,
                &[
                    ("padding_low", "1"),
                    ("padding_high", "1"),
                    ("padding_interior", "1"),
                ],
            )
            .expect("ok");
        assert_eq!(padded, "(2 n + 1,)");

        let case = Case::new(&["n"]);
        let sliced = case
            .apply(
                Primitive::Slice,
                &[("start_indices", "1"), ("limit_indices", "n")],
            )
            .expect("ok");
        assert_eq!(sliced, "(n + -1,)");

        let case = Case::new(&["2*n"]);
        let strided = case
            .apply(
                Primitive::Slice,
                &[
                    ("start_indices", "0"),
                    ("limit_indices", "2*n"),
                    ("strides", "2"),
                ],
            )
            .expect("ok");
        assert_eq!(strided, "(n,)");
    }

    #[test]
    fn strided_slice_must_divide_symbolic_extent() {
        let case = Case::new(&["n"]);
        let err = case
            .apply(
                Primitive::Slice,
                &[
                    ("start_indices", "0"),
                    ("limit_indices", "n"),
                    ("strides", "2"),
                ],
            )
            .expect_err("n is not a multiple of 2");
        assert!(matches!(err, ShapeError::Poly(_)));
    }

    #[test]
    fn transpose_reshape_and_broadcast() {
        let case = Case::new(&["(a, b, c)"]);
        assert_eq!(
            case.apply(Primitive::Transpose, &[("permutation", "1,0,2")])
                .expect("ok"),
            "(b, a, c)"
        );
        assert_eq!(
            case.apply(Primitive::Reshape, &[("new_shape", "(a, b c)")])
                .expect("ok"),
            "(a, b c)"
        );
        let case = Case::new(&["(n, 6)"]);
        assert_eq!(
            case.apply(Primitive::Reshape, &[("new_shape", "(n, 2, -1)")])
                .expect("ok"),
            "(n, 2, 3)"
        );
        let case = Case::new(&["(n, 1)"]);
        assert_eq!(
            case.apply(
                Primitive::BroadcastInDim,
                &[("shape", "(3, n, 4)"), ("broadcast_dimensions", "1,2")],
            )
            .expect("ok"),
            "(3, n, 4)"
        );
    }

    #[test]
    fn shape_valued_params_use_function_variables() {
        let case = Case::new(&["n"]);
        assert_eq!(
            case.apply(Primitive::Iota, &[("length", "2*n")])
                .map_err(|e| e.to_string()),
            Err("invalid params for iota: expected 0 operands, got 1".to_owned())
        );
        let empty = Case {
            scope: case.scope.clone(),
            inputs: Vec::new(),
        };
        assert_eq!(
            empty.apply(Primitive::Iota, &[("length", "2*n")]).expect("ok"),
            "(2 n,)"
        );
        assert_eq!(case.apply(Primitive::DimSize, &[("dim", "0")]).expect("ok"), "()");
    }
}
