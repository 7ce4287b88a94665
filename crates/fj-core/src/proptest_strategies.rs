use super::{Atom, Jaxpr, JaxprBuilder, Literal, Primitive, Value};
use proptest::prelude::*;

pub fn arb_primitive() -> impl Strategy<Value = Primitive> {
    prop_oneof![
        Just(Primitive::Neg),
        Just(Primitive::Exp),
        Just(Primitive::Add),
        Just(Primitive::Mul),
        Just(Primitive::Max),
        Just(Primitive::Lt),
        Just(Primitive::Select),
        Just(Primitive::ReduceSum),
        Just(Primitive::ReduceMax),
        Just(Primitive::Dot),
        Just(Primitive::Concatenate),
        Just(Primitive::Pad),
        Just(Primitive::Slice),
        Just(Primitive::Transpose),
        Just(Primitive::BroadcastInDim),
        Just(Primitive::Reshape),
        Just(Primitive::Cumsum),
        Just(Primitive::Iota),
        Just(Primitive::Sort),
        Just(Primitive::DimSize),
        Just(Primitive::Scan),
        Just(Primitive::Pjit),
    ]
}

pub fn arb_literal() -> impl Strategy<Value = Literal> {
    prop_oneof![
        (-1_000_i64..1_000).prop_map(Literal::I64),
        any::<bool>().prop_map(Literal::Bool),
        (-1.0e3_f64..1.0e3).prop_map(Literal::from_f64),
    ]
}

/// Small row-major i64 matrices with at least one row.
pub fn arb_i64_matrix() -> impl Strategy<Value = Value> {
    (1_u32..5, 1_u32..5).prop_flat_map(|(rows, cols)| {
        prop::collection::vec(-100_i64..100, (rows * cols) as usize).prop_map(move |data| {
            Value::tensor_i64(&[rows, cols], &data).unwrap_or(Value::scalar_i64(0))
        })
    })
}

/// Chains of elementwise binary equations over two inputs.
pub fn arb_binary_jaxpr() -> impl Strategy<Value = Jaxpr> {
    let binary = prop_oneof![
        Just(Primitive::Add),
        Just(Primitive::Sub),
        Just(Primitive::Mul),
        Just(Primitive::Max),
        Just(Primitive::Min),
    ];
    prop::collection::vec((binary, any::<bool>(), arb_literal()), 1..8).prop_map(|steps| {
        let mut b = JaxprBuilder::new();
        let x = b.invar();
        let y = b.invar();
        let mut acc = x;
        for (primitive, use_literal, lit) in steps {
            let rhs = if use_literal {
                Atom::Lit(lit)
            } else {
                Atom::Var(y)
            };
            acc = b.eqn(primitive, vec![Atom::Var(acc), rhs], &[]);
        }
        b.build(vec![acc])
    })
}
