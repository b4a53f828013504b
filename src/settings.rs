//! Numeric page settings that may be expressions over model variables.

use crate::{
    builder::build_function,
    errors::SpecError,
    expr::Expr,
    rates::{lower, parse_indexed},
    spec::Setting,
    symbols::SlotMap,
    types::JITFunction,
};

/// A setting ready for evaluation against a scratch buffer.
#[derive(Clone)]
pub enum CompiledSetting {
    Value(f64),
    Expression(JITFunction),
}

impl std::fmt::Debug for CompiledSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompiledSetting::Value(value) => write!(f, "{value}"),
            CompiledSetting::Expression(_) => f.write_str("<expression>"),
        }
    }
}

impl CompiledSetting {
    /// Compiles `setting`; expressions are scalar and see every model variable.
    pub fn compile(
        page: &str,
        element: &str,
        setting: &Setting,
        slots: &SlotMap,
    ) -> Result<Self, SpecError> {
        match setting {
            Setting::Value(value) => Ok(CompiledSetting::Value(*value)),
            Setting::Expression(text) => {
                let node = parse_indexed(page, element, text, None)?;
                let expr = lower(page, element, &node, slots, None)?;
                match expr {
                    Expr::Const(value) => Ok(CompiledSetting::Value(value)),
                    expr => build_function(expr, slots.len())
                        .map(CompiledSetting::Expression)
                        .map_err(|err| SpecError::expression(page, element, err)),
                }
            }
        }
    }

    /// Compiles an optional setting.
    pub fn compile_optional(
        page: &str,
        element: &str,
        setting: Option<&Setting>,
        slots: &SlotMap,
    ) -> Result<Option<Self>, SpecError> {
        setting
            .map(|setting| Self::compile(page, element, setting, slots))
            .transpose()
    }

    pub fn evaluate(&self, scratch: &[f64]) -> f64 {
        match self {
            CompiledSetting::Value(value) => *value,
            CompiledSetting::Expression(function) => function(scratch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::Bindings;

    #[test]
    fn test_value_and_expression_settings() {
        let mut b = Bindings::new();
        b.declare_scalar("dt", 0.05);
        let slots = SlotMap::new(&b);
        let mut scratch = vec![0.0; slots.len()];
        slots.fill(&b, &mut scratch);

        let fixed = CompiledSetting::compile("p", "stepSize", &Setting::from(0.1), &slots).unwrap();
        assert_eq!(fixed.evaluate(&scratch), 0.1);

        let folded = CompiledSetting::compile("p", "stepSize", &Setting::from("1/4"), &slots).unwrap();
        assert!(matches!(folded, CompiledSetting::Value(v) if v == 0.25));

        let dynamic = CompiledSetting::compile("p", "stepSize", &Setting::from("2*dt"), &slots).unwrap();
        assert_eq!(dynamic.evaluate(&scratch), 0.1);

        assert!(CompiledSetting::compile("p", "stepSize", &Setting::from("2*q"), &slots).is_err());
    }
}
