//! Host math functions callable from JIT-compiled code.
//!
//! Cranelift has native instructions for `sqrt`, `fabs`, `fmin` and `fmax` but not for
//! transcendental functions. Those are provided as `extern "C"` shims that are registered
//! as symbols on the `JITBuilder` and imported into each module on first use.

use cranelift::prelude::*;
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;

extern "C" fn odepage_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn odepage_ln(x: f64) -> f64 {
    x.ln()
}

extern "C" fn odepage_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn odepage_cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn odepage_tan(x: f64) -> f64 {
    x.tan()
}

extern "C" fn odepage_powf(base: f64, exp: f64) -> f64 {
    base.powf(exp)
}

/// A host function the code generator can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MathFunction {
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Pow,
}

impl MathFunction {
    const ALL: [MathFunction; 6] = [
        MathFunction::Exp,
        MathFunction::Ln,
        MathFunction::Sin,
        MathFunction::Cos,
        MathFunction::Tan,
        MathFunction::Pow,
    ];

    fn symbol(self) -> &'static str {
        match self {
            MathFunction::Exp => "odepage_exp",
            MathFunction::Ln => "odepage_ln",
            MathFunction::Sin => "odepage_sin",
            MathFunction::Cos => "odepage_cos",
            MathFunction::Tan => "odepage_tan",
            MathFunction::Pow => "odepage_powf",
        }
    }

    fn arity(self) -> usize {
        match self {
            MathFunction::Pow => 2,
            _ => 1,
        }
    }

    fn address(self) -> *const u8 {
        match self {
            MathFunction::Exp => odepage_exp as *const u8,
            MathFunction::Ln => odepage_ln as *const u8,
            MathFunction::Sin => odepage_sin as *const u8,
            MathFunction::Cos => odepage_cos as *const u8,
            MathFunction::Tan => odepage_tan as *const u8,
            MathFunction::Pow => odepage_powf as *const u8,
        }
    }
}

/// Makes every host function resolvable by the JIT linker.
pub(crate) fn register_symbols(builder: &mut JITBuilder) {
    for function in MathFunction::ALL {
        builder.symbol(function.symbol(), function.address());
    }
}

/// Declares `function` as an import of `module`.
///
/// Declaring the same import twice yields the same `FuncId`, so callers do not need
/// to cache the result.
pub(crate) fn link(
    module: &mut dyn Module,
    function: MathFunction,
) -> Result<FuncId, BuilderError> {
    let mut sig = module.make_signature();
    for _ in 0..function.arity() {
        sig.params.push(AbiParam::new(types::F64));
    }
    sig.returns.push(AbiParam::new(types::F64));

    module
        .declare_function(function.symbol(), Linkage::Import, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))
}

/// Emits a call to `function` and returns its result.
pub(crate) fn call(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    function: MathFunction,
    args: &[Value],
) -> Result<Value, BuilderError> {
    let func_id = link(module, function)?;
    let func_ref = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func_ref, args);
    Ok(builder.inst_results(call)[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shims_match_std() {
        assert_eq!(odepage_exp(1.0), 1f64.exp());
        assert_eq!(odepage_ln(2.0), 2f64.ln());
        assert_eq!(odepage_tan(0.3), 0.3f64.tan());
        assert_eq!(odepage_powf(2.0, 0.5), 2f64.sqrt());
    }

    #[test]
    fn test_symbols_are_unique() {
        let mut names: Vec<_> = MathFunction::ALL.iter().map(|f| f.symbol()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), MathFunction::ALL.len());
    }
}
