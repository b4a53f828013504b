//! This module provides functionality for JIT compilation of expression trees.
//! It uses Cranelift as the backend compiler to generate native machine code.
//!
//! The main entry points are:
//! - `build_function()` - Compiles a single expression into a JIT function
//! - `build_combined_function()` - Compiles an ordered list of expressions into one JIT
//!   function that writes every result into an output buffer
//!
//! Both read their inputs from a flat `&[f64]` buffer. The wrappers check the buffer
//! lengths before calling into native code, so a compiled function can never read or write
//! out of bounds.

use std::sync::Arc;

use crate::{
    errors::{BuilderError, EquationError},
    expr::Expr,
    operators,
    types::{CombinedJITFunction, JITFunction},
};
use cranelift::prelude::*;
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use isa::TargetIsa;
use log::trace;

struct ThreadSafeFunction(*const u8);
unsafe impl Send for ThreadSafeFunction {}
unsafe impl Sync for ThreadSafeFunction {}

/// Builds a JIT-compiled function from an expression tree.
///
/// # Arguments
/// * `expr` - The expression AST to compile
/// * `input_len` - Length of the input buffer the function will be called with
///
/// # Returns
/// A thread-safe function that takes a slice of f64 values and returns an f64 result.
///
/// # Errors
/// Returns an EquationError if the expression reads beyond `input_len` or compilation fails.
///
/// # Panics
/// The returned function panics if called with fewer than `input_len` values.
pub fn build_function(expr: Expr, input_len: usize) -> Result<JITFunction, EquationError> {
    check_input_len(std::slice::from_ref(&expr), input_len)?;

    let (mut module, mut ctx) = create_module_and_context()?;
    let ptr_type = module.target_config().pointer_type();
    ctx.func.signature.params.push(AbiParam::new(ptr_type));
    ctx.func.signature.returns.push(AbiParam::new(types::F64));

    {
        let mut builder_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);

        let input_ptr = builder.block_params(entry_block)[0];
        let result = expr.codegen(&mut builder, &mut module, input_ptr)?;
        builder.ins().return_(&[result]);
        builder.finalize();
    }

    let code = Arc::new(compile_and_finalize(&mut module, &mut ctx, "odepage_expr")?);
    Ok(Arc::new(move |input: &[f64]| {
        assert!(
            input.len() >= input_len,
            "input buffer has {} slots, expected {}",
            input.len(),
            input_len
        );
        // SAFETY: compiled with signature extern "C" fn(*const f64) -> f64 and every
        // load is below input_len, checked above.
        unsafe {
            let f: extern "C" fn(*const f64) -> f64 = std::mem::transmute(code.0);
            f(input.as_ptr())
        }
    }))
}

/// Builds a JIT-compiled function that evaluates multiple expressions together.
///
/// The i-th expression is stored at `results[i]`. Expressions are evaluated in order
/// but all read the same input buffer, so no result is visible to a later expression.
///
/// # Arguments
/// * `exprs` - Expression ASTs to compile, in output order
/// * `input_len` - Length of the input buffer the function will be called with
///
/// # Errors
/// Returns an EquationError if an expression reads beyond `input_len` or compilation fails.
///
/// # Panics
/// The returned function panics if the input is shorter than `input_len` or the results
/// slice is not exactly `exprs.len()` long.
pub fn build_combined_function(
    exprs: Vec<Expr>,
    input_len: usize,
) -> Result<CombinedJITFunction, EquationError> {
    check_input_len(&exprs, input_len)?;
    let results_len = exprs.len();

    let (mut module, mut ctx) = create_module_and_context()?;
    let ptr_type = module.target_config().pointer_type();
    ctx.func.signature.params.push(AbiParam::new(ptr_type)); // input_ptr
    ctx.func.signature.params.push(AbiParam::new(ptr_type)); // output_ptr

    {
        let mut builder_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);

        let input_ptr = builder.block_params(entry_block)[0];
        let output_ptr = builder.block_params(entry_block)[1];

        for (i, expr) in exprs.iter().enumerate() {
            let value = expr.codegen(&mut builder, &mut module, input_ptr)?;
            builder
                .ins()
                .store(MemFlags::trusted(), value, output_ptr, (i * 8) as i32);
        }

        builder.ins().return_(&[]);
        builder.finalize();
    }

    let code = Arc::new(compile_and_finalize(&mut module, &mut ctx, "odepage_combined")?);
    Ok(Arc::new(move |inputs: &[f64], results: &mut [f64]| {
        assert!(
            inputs.len() >= input_len,
            "input buffer has {} slots, expected {}",
            inputs.len(),
            input_len
        );
        assert_eq!(
            results.len(),
            results_len,
            "Results buffer has incorrect length"
        );
        // SAFETY: compiled with signature extern "C" fn(*const f64, *mut f64), loads stay
        // below input_len and stores below results_len, both checked above.
        unsafe {
            let f: extern "C" fn(*const f64, *mut f64) = std::mem::transmute(code.0);
            f(inputs.as_ptr(), results.as_mut_ptr());
        }
    }))
}

fn check_input_len(exprs: &[Expr], input_len: usize) -> Result<(), EquationError> {
    let required = exprs.iter().map(Expr::required_len).max().unwrap_or(0);
    if required > input_len {
        return Err(EquationError::InvalidInputLength {
            expected: input_len,
            got: required,
        });
    }
    Ok(())
}

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// # Errors
/// Returns a BuilderError if the host machine architecture is not supported or a
/// compiler flag is rejected.
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();
    let set = |builder: &mut settings::Builder, name: &str, value: &str| {
        builder
            .set(name, value)
            .map_err(|e| BuilderError::Settings(format!("{name}={value}: {e}")))
    };

    trace!("creating JIT target for {}", target_lexicon::Triple::host());
    // cranelift-jit rejects position independent code on every host
    set(&mut flag_builder, "use_colocated_libcalls", "false")?;
    set(&mut flag_builder, "is_pic", "false")?;
    set(&mut flag_builder, "opt_level", "speed")?;
    #[cfg(debug_assertions)]
    set(&mut flag_builder, "enable_verifier", "true")?;
    #[cfg(not(debug_assertions))]
    set(&mut flag_builder, "enable_verifier", "false")?;

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

/// Creates a new JIT module with the host math functions linked in, plus an empty
/// function context whose signature the caller fills in.
pub(crate) fn create_module_and_context() -> Result<(JITModule, Context), BuilderError> {
    let isa = create_isa()?;
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    operators::register_symbols(&mut builder);

    let module = JITModule::new(builder);
    let ctx = module.make_context();
    Ok((module, ctx))
}

/// Compiles and finalizes the function held in `ctx`, returning its code pointer.
///
/// The module is not freed, so the returned pointer stays valid for the life of the process.
// TODO: keep the JITModule next to the closure and call `free_memory` when a page
// instance is rebuilt for new array lengths.
fn compile_and_finalize(
    module: &mut JITModule,
    ctx: &mut Context,
    name: &str,
) -> Result<ThreadSafeFunction, BuilderError> {
    let func_id: FuncId = module
        .declare_function(name, Linkage::Export, &ctx.func.signature)
        .map_err(|msg| BuilderError::DeclarationError(msg.to_string()))?;

    module
        .define_function(func_id, ctx)
        .map_err(|msg| BuilderError::FunctionError(msg.to_string()))?;

    module.clear_context(ctx);
    module
        .finalize_definitions()
        .map_err(BuilderError::ModuleError)?;

    Ok(ThreadSafeFunction(module.get_finalized_function(func_id)))
}
