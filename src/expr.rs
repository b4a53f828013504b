//! Expression module for representing mathematical expressions.
//!
//! This module defines the expression tree that rate expressions, zero conditions,
//! delays and assignment right-hand sides are lowered to before JIT compilation:
//!
//! - `Expr`: An enum representing different kinds of mathematical expressions
//! - `VarRef`: A reference to one slot of a page's input buffer
//!
//! Variables never carry names of the authoring document at codegen time. By the time an
//! `Expr` exists, every identifier has been resolved to a slot index of the flat buffer the
//! compiled function reads from (see [`crate::symbols`]).
//!
//! # Expression Simplification
//! The simplify method performs algebraic simplifications including:
//! - Constant folding (e.g. 2 + 3 → 5)
//! - Identity rules (e.g. x + 0 → x, x * 1 → x)
//! - Exponent rules (e.g. x^0 → 1, x^1 → x)

use cranelift::prelude::*;
use cranelift_codegen::ir::Value;
use cranelift_module::Module;

use crate::{
    errors::EquationError,
    operators::{self, MathFunction},
};

/// Represents a reference to a slot of the input buffer.
///
/// The name is kept for display and diagnostics only.
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub index: u32,
}

/// An expression tree node representing mathematical operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A reference to an input slot
    Var(VarRef),
    /// Addition of two expressions
    Add(Box<Expr>, Box<Expr>),
    /// Multiplication of two expressions
    Mul(Box<Expr>, Box<Expr>),
    /// Subtraction of two expressions
    Sub(Box<Expr>, Box<Expr>),
    /// Division of two expressions
    Div(Box<Expr>, Box<Expr>),
    /// Absolute value of an expression
    Abs(Box<Expr>),
    /// Exponentiation of an expression by an integer constant
    Pow(Box<Expr>, i64),
    /// Exponentiation of an expression by a floating point constant
    PowFloat(Box<Expr>, f64),
    /// Exponentiation of an expression by another expression
    PowExpr(Box<Expr>, Box<Expr>),
    /// Exponential function of an expression
    Exp(Box<Expr>),
    /// Natural logarithm of an expression
    Ln(Box<Expr>),
    /// Square root of an expression
    Sqrt(Box<Expr>),
    /// Sine of an expression (argument in radians)
    Sin(Box<Expr>),
    /// Cosine of an expression (argument in radians)
    Cos(Box<Expr>),
    /// Tangent of an expression (argument in radians)
    Tan(Box<Expr>),
    /// Smaller of two expressions
    Min(Box<Expr>, Box<Expr>),
    /// Larger of two expressions
    Max(Box<Expr>, Box<Expr>),
    /// Negation of an expression
    Neg(Box<Expr>),
}

impl Expr {
    /// Number of input slots the expression needs, i.e. the highest slot index plus one.
    pub fn required_len(&self) -> usize {
        match self {
            Expr::Const(_) => 0,
            Expr::Var(var) => var.index as usize + 1,
            Expr::Add(l, r)
            | Expr::Mul(l, r)
            | Expr::Sub(l, r)
            | Expr::Div(l, r)
            | Expr::PowExpr(l, r)
            | Expr::Min(l, r)
            | Expr::Max(l, r) => l.required_len().max(r.required_len()),
            Expr::Abs(e)
            | Expr::Pow(e, _)
            | Expr::PowFloat(e, _)
            | Expr::Exp(e)
            | Expr::Ln(e)
            | Expr::Sqrt(e)
            | Expr::Sin(e)
            | Expr::Cos(e)
            | Expr::Tan(e)
            | Expr::Neg(e) => e.required_len(),
        }
    }

    /// Evaluates the expression against `input` without compiling it.
    ///
    /// Used for constant folding and as a reference in tests; pages always evaluate
    /// through the compiled function.
    pub fn evaluate(&self, input: &[f64]) -> f64 {
        match self {
            Expr::Const(c) => *c,
            Expr::Var(var) => input[var.index as usize],
            Expr::Add(l, r) => l.evaluate(input) + r.evaluate(input),
            Expr::Mul(l, r) => l.evaluate(input) * r.evaluate(input),
            Expr::Sub(l, r) => l.evaluate(input) - r.evaluate(input),
            Expr::Div(l, r) => l.evaluate(input) / r.evaluate(input),
            Expr::Abs(e) => e.evaluate(input).abs(),
            Expr::Pow(e, n) => e.evaluate(input).powi(*n as i32),
            Expr::PowFloat(e, p) => e.evaluate(input).powf(*p),
            Expr::PowExpr(b, p) => b.evaluate(input).powf(p.evaluate(input)),
            Expr::Exp(e) => e.evaluate(input).exp(),
            Expr::Ln(e) => e.evaluate(input).ln(),
            Expr::Sqrt(e) => e.evaluate(input).sqrt(),
            Expr::Sin(e) => e.evaluate(input).sin(),
            Expr::Cos(e) => e.evaluate(input).cos(),
            Expr::Tan(e) => e.evaluate(input).tan(),
            Expr::Min(l, r) => l.evaluate(input).min(r.evaluate(input)),
            Expr::Max(l, r) => l.evaluate(input).max(r.evaluate(input)),
            Expr::Neg(e) => -e.evaluate(input),
        }
    }

    /// Simplifies the expression by folding constants and applying basic algebraic rules.
    ///
    /// Any subtree without variables is folded to a single constant. Beyond that only
    /// identities that hold for every finite input are applied, so the compiled function
    /// returns what the author wrote.
    pub fn simplify(&self) -> Box<Expr> {
        if self.required_len() == 0 {
            if let Expr::Const(_) = self {
                return Box::new(self.clone());
            }
            return Box::new(Expr::Const(self.evaluate(&[])));
        }

        match self {
            Expr::Add(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    // Identity: x + 0 -> x
                    (Expr::Const(c), _) if *c == 0.0 => r,
                    (_, Expr::Const(c)) if *c == 0.0 => l,
                    // x + (-y) -> x - y
                    (_, Expr::Neg(inner)) => Box::new(Expr::Sub(l, inner.clone())),
                    _ => Box::new(Expr::Add(l, r)),
                }
            }
            Expr::Sub(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    // Identity: x - 0 -> x
                    (_, Expr::Const(c)) if *c == 0.0 => l,
                    // 0 - x -> -x
                    (Expr::Const(c), _) if *c == 0.0 => Box::new(Expr::Neg(r)),
                    _ => Box::new(Expr::Sub(l, r)),
                }
            }
            Expr::Mul(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    // Identity: x * 1 -> x
                    (Expr::Const(c), _) if *c == 1.0 => r,
                    (_, Expr::Const(c)) if *c == 1.0 => l,
                    // x * -1 -> -x
                    (Expr::Const(c), _) if *c == -1.0 => Box::new(Expr::Neg(r)),
                    (_, Expr::Const(c)) if *c == -1.0 => Box::new(Expr::Neg(l)),
                    _ => Box::new(Expr::Mul(l, r)),
                }
            }
            Expr::Div(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match &*r {
                    // Identity: x / 1 -> x
                    Expr::Const(c) if *c == 1.0 => l,
                    // Division by a constant becomes a multiplication
                    Expr::Const(c) if *c != 0.0 && c.is_finite() => {
                        Box::new(Expr::Mul(l, Box::new(Expr::Const(1.0 / c))))
                    }
                    _ => Box::new(Expr::Div(l, r)),
                }
            }
            Expr::Pow(base, exp) => {
                let b = base.simplify();
                match exp {
                    0 => Box::new(Expr::Const(1.0)),
                    1 => b,
                    _ => Box::new(Expr::Pow(b, *exp)),
                }
            }
            Expr::PowFloat(base, exp) => {
                let b = base.simplify();
                if exp.fract() == 0.0 && exp.abs() <= i32::MAX as f64 {
                    Expr::Pow(b, *exp as i64).simplify()
                } else if *exp == 0.5 {
                    Box::new(Expr::Sqrt(b))
                } else {
                    Box::new(Expr::PowFloat(b, *exp))
                }
            }
            Expr::PowExpr(base, exponent) => {
                let b = base.simplify();
                let e = exponent.simplify();
                match &*e {
                    Expr::Const(c) => Expr::PowFloat(b, *c).simplify(),
                    _ => Box::new(Expr::PowExpr(b, e)),
                }
            }
            Expr::Neg(expr) => {
                let e = expr.simplify();
                match *e {
                    // Double negation: -(-x) -> x
                    Expr::Neg(inner) => inner,
                    other => Box::new(Expr::Neg(Box::new(other))),
                }
            }
            Expr::Abs(e) => Box::new(Expr::Abs(e.simplify())),
            Expr::Exp(e) => Box::new(Expr::Exp(e.simplify())),
            Expr::Ln(e) => Box::new(Expr::Ln(e.simplify())),
            Expr::Sqrt(e) => Box::new(Expr::Sqrt(e.simplify())),
            Expr::Sin(e) => Box::new(Expr::Sin(e.simplify())),
            Expr::Cos(e) => Box::new(Expr::Cos(e.simplify())),
            Expr::Tan(e) => Box::new(Expr::Tan(e.simplify())),
            Expr::Min(l, r) => Box::new(Expr::Min(l.simplify(), r.simplify())),
            Expr::Max(l, r) => Box::new(Expr::Max(l.simplify(), r.simplify())),
            Expr::Const(_) | Expr::Var(_) => Box::new(self.clone()),
        }
    }

    /// Generates Cranelift IR for the expression.
    ///
    /// Variables are loaded from `input_ptr` at `index * 8`. Transcendental functions are
    /// lowered to calls into the host shims of the `operators` module.
    ///
    /// # Arguments
    /// * `builder` - The function builder positioned in the block to emit into
    /// * `module` - The module the function belongs to, used to import host functions
    /// * `input_ptr` - The pointer to the input buffer
    ///
    /// # Errors
    /// Returns an EquationError if a host function cannot be linked.
    pub fn codegen(
        &self,
        builder: &mut FunctionBuilder,
        module: &mut dyn Module,
        input_ptr: Value,
    ) -> Result<Value, EquationError> {
        let value = match self {
            Expr::Const(c) => builder.ins().f64const(*c),
            Expr::Var(VarRef { index, .. }) => {
                let offset = (*index as i32) * 8;
                builder
                    .ins()
                    .load(types::F64, MemFlags::trusted(), input_ptr, offset)
            }
            Expr::Add(l, r) => {
                let (l, r) = codegen_pair(l, r, builder, module, input_ptr)?;
                builder.ins().fadd(l, r)
            }
            Expr::Sub(l, r) => {
                let (l, r) = codegen_pair(l, r, builder, module, input_ptr)?;
                builder.ins().fsub(l, r)
            }
            Expr::Mul(l, r) => {
                let (l, r) = codegen_pair(l, r, builder, module, input_ptr)?;
                builder.ins().fmul(l, r)
            }
            Expr::Div(l, r) => {
                let (l, r) = codegen_pair(l, r, builder, module, input_ptr)?;
                builder.ins().fdiv(l, r)
            }
            Expr::Min(l, r) => {
                let (l, r) = codegen_pair(l, r, builder, module, input_ptr)?;
                builder.ins().fmin(l, r)
            }
            Expr::Max(l, r) => {
                let (l, r) = codegen_pair(l, r, builder, module, input_ptr)?;
                builder.ins().fmax(l, r)
            }
            Expr::Abs(e) => {
                let v = e.codegen(builder, module, input_ptr)?;
                builder.ins().fabs(v)
            }
            Expr::Neg(e) => {
                let v = e.codegen(builder, module, input_ptr)?;
                builder.ins().fneg(v)
            }
            Expr::Sqrt(e) => {
                let v = e.codegen(builder, module, input_ptr)?;
                builder.ins().sqrt(v)
            }
            Expr::Pow(base, exp) => {
                let v = base.codegen(builder, module, input_ptr)?;
                generate_integer_power(builder, v, *exp)
            }
            Expr::PowFloat(base, exp) => {
                let v = base.codegen(builder, module, input_ptr)?;
                let e = builder.ins().f64const(*exp);
                operators::call(builder, module, MathFunction::Pow, &[v, e])?
            }
            Expr::PowExpr(base, exp) => {
                let (b, e) = codegen_pair(base, exp, builder, module, input_ptr)?;
                operators::call(builder, module, MathFunction::Pow, &[b, e])?
            }
            Expr::Exp(e) => unary_call(e, MathFunction::Exp, builder, module, input_ptr)?,
            Expr::Ln(e) => unary_call(e, MathFunction::Ln, builder, module, input_ptr)?,
            Expr::Sin(e) => unary_call(e, MathFunction::Sin, builder, module, input_ptr)?,
            Expr::Cos(e) => unary_call(e, MathFunction::Cos, builder, module, input_ptr)?,
            Expr::Tan(e) => unary_call(e, MathFunction::Tan, builder, module, input_ptr)?,
        };
        Ok(value)
    }
}

fn codegen_pair(
    left: &Expr,
    right: &Expr,
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    input_ptr: Value,
) -> Result<(Value, Value), EquationError> {
    let l = left.codegen(builder, module, input_ptr)?;
    let r = right.codegen(builder, module, input_ptr)?;
    Ok((l, r))
}

fn unary_call(
    arg: &Expr,
    function: MathFunction,
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    input_ptr: Value,
) -> Result<Value, EquationError> {
    let v = arg.codegen(builder, module, input_ptr)?;
    Ok(operators::call(builder, module, function, &[v])?)
}

/// Binary exponentiation for integer exponents; negative exponents take the reciprocal.
fn generate_integer_power(builder: &mut FunctionBuilder, base: Value, exp: i64) -> Value {
    if exp == 0 {
        return builder.ins().f64const(1.0);
    }

    let mut result: Option<Value> = None;
    let mut current = base;
    let mut remaining = exp.unsigned_abs();
    while remaining > 0 {
        if remaining & 1 == 1 {
            result = Some(match result {
                Some(acc) => builder.ins().fmul(acc, current),
                None => current,
            });
        }
        remaining >>= 1;
        if remaining > 0 {
            current = builder.ins().fmul(current, current);
        }
    }

    // remaining started non-zero, so at least one bit was set
    let result = result.unwrap_or(base);
    if exp < 0 {
        let one = builder.ins().f64const(1.0);
        builder.ins().fdiv(one, result)
    } else {
        result
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(val) => write!(f, "{val}"),
            Expr::Var(var_ref) => write!(f, "{}", var_ref.name),
            Expr::Add(left, right) => write!(f, "({left} + {right})"),
            Expr::Mul(left, right) => write!(f, "({left} * {right})"),
            Expr::Sub(left, right) => write!(f, "({left} - {right})"),
            Expr::Div(left, right) => write!(f, "({left} / {right})"),
            Expr::Abs(expr) => write!(f, "|{expr}|"),
            Expr::Pow(base, exp) => write!(f, "({base}^{exp})"),
            Expr::PowFloat(base, exp) => write!(f, "({base}^{exp})"),
            Expr::PowExpr(base, exponent) => write!(f, "({base}^{exponent})"),
            Expr::Exp(expr) => write!(f, "exp({expr})"),
            Expr::Ln(expr) => write!(f, "ln({expr})"),
            Expr::Sqrt(expr) => write!(f, "sqrt({expr})"),
            Expr::Sin(expr) => write!(f, "sin({expr})"),
            Expr::Cos(expr) => write!(f, "cos({expr})"),
            Expr::Tan(expr) => write!(f, "tan({expr})"),
            Expr::Min(left, right) => write!(f, "min({left}, {right})"),
            Expr::Max(left, right) => write!(f, "max({left}, {right})"),
            Expr::Neg(expr) => write!(f, "-({expr})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, index: u32) -> Box<Expr> {
        Box::new(Expr::Var(VarRef {
            name: name.to_string(),
            index,
        }))
    }

    fn c(value: f64) -> Box<Expr> {
        Box::new(Expr::Const(value))
    }

    #[test]
    fn test_simplify() {
        // 2 + 3 → 5
        assert_eq!(*Expr::Add(c(2.0), c(3.0)).simplify(), Expr::Const(5.0));

        // x + 0 → x
        assert_eq!(*Expr::Add(var("x", 0), c(0.0)).simplify(), *var("x", 0));

        // x * 1 → x
        assert_eq!(*Expr::Mul(c(1.0), var("x", 0)).simplify(), *var("x", 0));

        // -(-x) → x
        assert_eq!(
            *Expr::Neg(Box::new(Expr::Neg(var("x", 0)))).simplify(),
            *var("x", 0)
        );

        // x^1 → x, x^0 → 1
        assert_eq!(*Expr::Pow(var("x", 0), 1).simplify(), *var("x", 0));
        assert_eq!(*Expr::Pow(var("x", 0), 0).simplify(), Expr::Const(1.0));

        // x^2.0 → x^2
        assert_eq!(
            *Expr::PowFloat(var("x", 0), 2.0).simplify(),
            Expr::Pow(var("x", 0), 2)
        );

        // sin(0) folds
        assert_eq!(*Expr::Sin(c(0.0)).simplify(), Expr::Const(0.0));
    }

    #[test]
    fn test_evaluate() {
        // -x + y^2 at (x=1, y=3)
        let expr = Expr::Add(
            Box::new(Expr::Neg(var("x", 0))),
            Box::new(Expr::Pow(var("y", 1), 2)),
        );
        assert_eq!(expr.evaluate(&[1.0, 3.0]), 8.0);
        assert_eq!(expr.required_len(), 2);
    }

    #[test]
    fn test_simplify_preserves_value() {
        let expr = Expr::Div(
            Box::new(Expr::Sub(var("x", 0), c(0.0))),
            Box::new(Expr::Add(c(2.0), c(2.0))),
        );
        let simplified = expr.simplify();
        assert_eq!(simplified.evaluate(&[6.0]), expr.evaluate(&[6.0]));
    }

    #[test]
    fn test_display() {
        let expr = Expr::Min(var("x", 0), Box::new(Expr::Sqrt(var("y", 1))));
        assert_eq!(expr.to_string(), "min(x, sqrt(y))");
    }
}
