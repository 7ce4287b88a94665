#![forbid(unsafe_code)]

//! Per-primitive shape and masking rules.

use crate::MaskingError;
use crate::masking::MaskEnv;
use fj_core::{Primitive, Value};
use fj_lax::{EvalError, eval_primitive, parse_usize_param};
use fj_shape::{RenameContext, ShapeError, ShapeSpec, parse_spec, resolve_ids};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Propagates symbolic input shapes to symbolic output shapes.
pub type ShapeRule = fn(&RuleContext<'_>, &[ShapeSpec]) -> Result<Vec<ShapeSpec>, ShapeError>;

/// Produces padded outputs that are correct inside their logical region.
pub type MaskingRule = fn(&MaskingContext<'_>, &[Value]) -> Result<Vec<Value>, MaskingError>;

#[derive(Clone, Copy, Default)]
pub struct PrimitiveRules {
    pub shape_rule: Option<ShapeRule>,
    pub masking_rule: Option<MaskingRule>,
}

/// Rule table keyed by primitive. A missing entry, or an entry without a
/// masking rule, makes masked evaluation of that primitive fail closed.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    rules: BTreeMap<Primitive, PrimitiveRules>,
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.rules.iter().map(|(primitive, rules)| {
                (
                    primitive.as_str(),
                    (rules.shape_rule.is_some(), rules.masking_rule.is_some()),
                )
            }))
            .finish()
    }
}

impl RuleRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in rule.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        crate::shape_rules::register(&mut registry);
        crate::masking_rules::register(&mut registry);
        registry
    }

    pub fn register_shape_rule(&mut self, primitive: Primitive, rule: ShapeRule) {
        self.rules.entry(primitive).or_default().shape_rule = Some(rule);
    }

    pub fn register_masking_rule(&mut self, primitive: Primitive, rule: MaskingRule) {
        self.rules.entry(primitive).or_default().masking_rule = Some(rule);
    }

    pub fn remove_masking_rule(&mut self, primitive: Primitive) -> Option<MaskingRule> {
        self.rules
            .get_mut(&primitive)
            .and_then(|rules| rules.masking_rule.take())
    }

    #[must_use]
    pub fn lookup(&self, primitive: Primitive) -> PrimitiveRules {
        self.rules.get(&primitive).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn has_masking_rule(&self, primitive: Primitive) -> bool {
        self.lookup(primitive).masking_rule.is_some()
    }
}

/// Shared registry holding the built-in rules.
#[must_use]
pub fn default_registry() -> &'static RuleRegistry {
    static REGISTRY: OnceLock<RuleRegistry> = OnceLock::new();
    REGISTRY.get_or_init(RuleRegistry::with_defaults)
}

/// Params of `primitive` that hold shape expressions.
#[must_use]
pub fn shape_param_keys(primitive: Primitive) -> &'static [&'static str] {
    match primitive {
        Primitive::Iota => &["length"],
        Primitive::BroadcastInDim => &["shape"],
        Primitive::Reshape => &["new_shape"],
        Primitive::Slice => &["start_indices", "limit_indices"],
        Primitive::Pad => &["padding_low", "padding_high"],
        _ => &[],
    }
}

/// What a shape rule sees besides the input shapes.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub primitive: Primitive,
    pub params: &'a BTreeMap<String, String>,
    /// Names the shape variables of the enclosing masked function.
    pub scope: &'a RenameContext,
}

impl<'a> RuleContext<'a> {
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&'a str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn invalid(&self, detail: impl Into<String>) -> ShapeError {
        ShapeError::InvalidParams {
            primitive: self.primitive.as_str().to_owned(),
            detail: detail.into(),
        }
    }

    pub fn incompatible(&self, shapes: &[ShapeSpec]) -> ShapeError {
        ShapeError::IncompatibleShapes {
            primitive: self.primitive.as_str().to_owned(),
            shapes: shapes.iter().map(ToString::to_string).collect(),
        }
    }

    /// Shape-valued param parsed in the variable scope of the function.
    pub fn spec_param(&self, key: &str) -> Result<ShapeSpec, ShapeError> {
        let raw = self
            .param(key)
            .ok_or_else(|| self.invalid(format!("missing required param '{key}'")))?;
        let parsed = parse_spec(raw).map_err(|err| self.invalid(err.to_string()))?;
        Ok(resolve_ids(self.scope, &parsed)?)
    }

    pub fn usize_list(&self, key: &str) -> Result<Option<Vec<usize>>, ShapeError> {
        if !self.params.contains_key(key) {
            return Ok(None);
        }
        parse_usize_param(self.primitive, key, self.params)
            .map(Some)
            .map_err(|err| self.invalid(err.to_string()))
    }

    pub fn usize_or(&self, key: &str, default: usize) -> Result<usize, ShapeError> {
        match self.usize_list(key)?.as_deref() {
            None => Ok(default),
            Some([value]) => Ok(*value),
            Some(other) => Err(self.invalid(format!(
                "param '{key}' expects one value, got {}",
                other.len()
            ))),
        }
    }

    /// Whether any shape-valued param mentions a shape variable.
    pub fn has_polymorphic_params(&self) -> Result<bool, ShapeError> {
        for key in shape_param_keys(self.primitive) {
            if self.params.contains_key(*key) && self.spec_param(key)?.is_polymorphic() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// What a masking rule sees besides the padded input values.
#[derive(Debug, Clone, Copy)]
pub struct MaskingContext<'a> {
    pub rule: RuleContext<'a>,
    /// Polymorphic input shapes.
    pub in_shapes: &'a [ShapeSpec],
    /// Input shapes evaluated under the logical environment.
    pub logical: &'a [Vec<i64>],
    /// Polymorphic output shapes from the shape rule.
    pub out_shapes: &'a [ShapeSpec],
    pub env: &'a MaskEnv,
}

impl MaskingContext<'_> {
    #[must_use]
    pub fn primitive(&self) -> Primitive {
        self.rule.primitive
    }

    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, String> {
        self.rule.params
    }

    pub fn logical_param(&self, key: &str) -> Result<Vec<i64>, MaskingError> {
        let spec = self.rule.spec_param(key)?;
        Ok(self.env.logical_dims(&spec)?)
    }

    pub fn padded_param(&self, key: &str) -> Result<Vec<i64>, MaskingError> {
        let spec = self.rule.spec_param(key)?;
        Ok(self.env.padded_dims(&spec)?)
    }

    /// Padded extent of output `idx`.
    pub fn padded_out_dims(&self, idx: usize) -> Result<Vec<u32>, MaskingError> {
        let spec = self.out_shapes.get(idx).ok_or(MaskingError::OutputArity {
            primitive: self.primitive().as_str().to_owned(),
            expected: idx + 1,
            actual: self.out_shapes.len(),
        })?;
        Ok(self.env.padded_shape(spec)?.dims)
    }

    /// Logical extent of input `idx` as array dims.
    pub fn logical_dims(&self, idx: usize) -> Result<Vec<u32>, MaskingError> {
        self.logical
            .get(idx)
            .ok_or(MaskingError::InputArity {
                expected: idx + 1,
                actual: self.logical.len(),
            })?
            .iter()
            .map(|&dim| {
                u32::try_from(dim).map_err(|_| {
                    MaskingError::Shape(ShapeError::NegativeDimension {
                        dim: dim.to_string(),
                        value: dim,
                    })
                })
            })
            .collect()
    }

    /// Runs the primitive itself on padded values.
    pub fn raw(
        &self,
        inputs: &[Value],
        params: &BTreeMap<String, String>,
    ) -> Result<Value, EvalError> {
        eval_primitive(self.primitive(), inputs, params)
    }
}

#[cfg(test)]
mod tests {
    use super::{RuleContext, RuleRegistry, default_registry, shape_param_keys};
    use fj_core::Primitive;
    use fj_shape::{RenameContext, parse_spec_in};
    use std::collections::BTreeMap;

    #[test]
    fn defaults_cover_first_order_primitives() {
        let registry = default_registry();
        assert!(registry.has_masking_rule(Primitive::ReduceSum));
        assert!(registry.lookup(Primitive::Reshape).shape_rule.is_some());
        assert!(!registry.has_masking_rule(Primitive::Reshape));
        assert!(!registry.has_masking_rule(Primitive::Sort));
        assert!(registry.lookup(Primitive::Scan).shape_rule.is_none());
    }

    #[test]
    fn removing_a_masking_rule_keeps_the_shape_rule() {
        let mut registry = RuleRegistry::with_defaults();
        assert!(registry.remove_masking_rule(Primitive::Neg).is_some());
        assert!(!registry.has_masking_rule(Primitive::Neg));
        assert!(registry.lookup(Primitive::Neg).shape_rule.is_some());
        assert!(registry.remove_masking_rule(Primitive::Neg).is_none());
    }

    #[test]
    fn spec_params_resolve_in_function_scope() {
        let mut scope = RenameContext::new();
        let input = parse_spec_in(&mut scope, "n").expect("valid spec");
        let params: BTreeMap<String, String> =
            [("limit_indices".to_owned(), "n".to_owned())].into_iter().collect();
        let ctx = RuleContext {
            primitive: Primitive::Slice,
            params: &params,
            scope: &scope,
        };
        assert_eq!(ctx.spec_param("limit_indices").expect("parses"), input);
        assert!(ctx.has_polymorphic_params().expect("parses"));
        assert!(ctx.spec_param("start_indices").is_err());
        assert_eq!(shape_param_keys(Primitive::Add), &[] as &[&str]);
    }
}
