//! Conversion module for transforming evalexpr AST nodes into our internal expression representation.
//!
//! Identifiers are resolved through a [`SymbolResolver`], which maps every name to a slot
//! of the input buffer the compiled function reads. The page compiler supplies a resolver
//! that knows the current array element when an equation is expanded element-wise.
//!
//! The main entry point is the `build_ast` function which recursively traverses the
//! evalexpr AST and builds up our expression tree.

use std::collections::HashMap;

use crate::{
    errors::{ConvertError, EquationError},
    expr::{Expr, VarRef},
};
use evalexpr::{build_operator_tree, Node, Operator};

/// Maps identifiers to slots of the input buffer.
pub trait SymbolResolver {
    /// Slot holding the current value of `name`.
    fn slot(&self, name: &str) -> Result<u32, ConvertError>;

    /// Slot holding the value of state `name` delayed by the `delay`-th delay.
    fn delayed_slot(&self, name: &str, delay: usize) -> Result<u32, ConvertError> {
        Err(ConvertError::InvalidDelay(format!("delayed({name}, {delay})")))
    }
}

impl SymbolResolver for HashMap<String, u32> {
    fn slot(&self, name: &str) -> Result<u32, ConvertError> {
        self.get(name)
            .copied()
            .ok_or_else(|| ConvertError::VariableNotFound(name.to_string()))
    }
}

/// Named constants available when no variable of the same name exists.
fn named_constant(name: &str) -> Option<f64> {
    match name {
        "pi" | "PI" => Some(std::f64::consts::PI),
        "e" | "E" => Some(std::f64::consts::E),
        _ => None,
    }
}

/// Parses `text` with evalexpr.
pub fn parse_expression(text: &str) -> Result<Node, EquationError> {
    let node: Node = build_operator_tree(text)?;
    Ok(node)
}

/// Parses `text`, resolves its identifiers and returns the simplified expression tree.
pub fn build_expr(text: &str, resolver: &dyn SymbolResolver) -> Result<Expr, EquationError> {
    let node = parse_expression(text)?;
    Ok(*build_ast(&node, resolver)?.simplify())
}

/// Converts an evalexpr AST node into our internal expression representation.
///
/// # Arguments
/// * `node` - The evalexpr AST node to convert
/// * `resolver` - Maps variable names to their slots in the input buffer
///
/// # Returns
/// * `Result<Expr, ConvertError>` - The converted expression or an error if conversion fails
///
/// # Supported operations
/// * Arithmetic: +, -, *, /, ^ and unary minus
/// * Functions: abs, sqrt, exp, ln/log, sin, cos, tan, min, max, pow
/// * `delayed(x, k)`: state `x` delayed by the k-th delay of the page
/// * Constants: numeric literals, `pi` and `e`
pub fn build_ast(node: &Node, resolver: &dyn SymbolResolver) -> Result<Expr, ConvertError> {
    match node.operator() {
        Operator::Add => fold_children(node, resolver, |l, r| Expr::Add(l, r)),
        Operator::Mul => fold_children(node, resolver, |l, r| Expr::Mul(l, r)),
        Operator::Sub => {
            let (l, r) = binary(node, resolver)?;
            Ok(Expr::Sub(l, r))
        }
        Operator::Div => {
            let (l, r) = binary(node, resolver)?;
            Ok(Expr::Div(l, r))
        }
        Operator::Neg => {
            let children = node.children();
            let child = children
                .first()
                .ok_or_else(|| ConvertError::UnsupportedOperator("empty negation".to_string()))?;
            Ok(Expr::Neg(Box::new(build_ast(child, resolver)?)))
        }
        Operator::Const { value } => numeric_constant(value).map(Expr::Const),
        Operator::VariableIdentifierRead { identifier } => match resolver.slot(identifier) {
            Ok(index) => Ok(Expr::Var(VarRef {
                name: identifier.to_string(),
                index,
            })),
            Err(ConvertError::VariableNotFound(name)) => named_constant(identifier)
                .map(Expr::Const)
                .ok_or(ConvertError::VariableNotFound(name)),
            Err(err) => Err(err),
        },
        Operator::FunctionIdentifier { identifier } => {
            let args = function_args(node);
            build_function_call(identifier, &args, resolver)
        }
        Operator::RootNode => {
            let children = node.children();
            if children.len() == 1 {
                build_ast(&children[0], resolver)
            } else {
                Err(ConvertError::RootNode(format!(
                    "{} children in root node",
                    children.len()
                )))
            }
        }
        // Exponentiation - integer constants get an inlined power, others call powf
        Operator::Exp => {
            let children = node.children();
            if children.len() != 2 {
                return Err(ConvertError::ExpOperator(format!(
                    "expected 2 operands, got {}",
                    children.len()
                )));
            }
            let base = Box::new(build_ast(&children[0], resolver)?);
            match children[1].operator() {
                Operator::Const {
                    value: evalexpr::Value::Int(exp),
                } => Ok(Expr::Pow(base, *exp)),
                Operator::Const { value } => Ok(Expr::PowFloat(base, numeric_constant(value)?)),
                _ => Ok(Expr::PowExpr(
                    base,
                    Box::new(build_ast(&children[1], resolver)?),
                )),
            }
        }
        _ => Err(ConvertError::UnsupportedOperator(format!(
            "{:?}",
            node.operator()
        ))),
    }
}

fn numeric_constant(value: &evalexpr::Value) -> Result<f64, ConvertError> {
    match value {
        evalexpr::Value::Float(f) => Ok(*f),
        evalexpr::Value::Int(i) => Ok(*i as f64),
        evalexpr::Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
    }
}

fn fold_children(
    node: &Node,
    resolver: &dyn SymbolResolver,
    combine: impl Fn(Box<Expr>, Box<Expr>) -> Expr,
) -> Result<Expr, ConvertError> {
    let children = node.children();
    let first = children.first().ok_or_else(|| {
        ConvertError::UnsupportedOperator(format!("{:?} without operands", node.operator()))
    })?;
    children
        .iter()
        .skip(1)
        .try_fold(build_ast(first, resolver)?, |acc, child| {
            Ok(combine(Box::new(acc), Box::new(build_ast(child, resolver)?)))
        })
}

fn binary(
    node: &Node,
    resolver: &dyn SymbolResolver,
) -> Result<(Box<Expr>, Box<Expr>), ConvertError> {
    let children = node.children();
    if children.len() != 2 {
        return Err(ConvertError::UnsupportedOperator(format!(
            "{:?} with {} operands",
            node.operator(),
            children.len()
        )));
    }
    Ok((
        Box::new(build_ast(&children[0], resolver)?),
        Box::new(build_ast(&children[1], resolver)?),
    ))
}

/// Flattens the argument list of a function call.
///
/// evalexpr wraps the parenthesised arguments in root nodes and collects several
/// arguments in a tuple.
fn function_args(node: &Node) -> Vec<&Node> {
    let mut current = match node.children().first() {
        Some(child) => child,
        None => return Vec::new(),
    };
    loop {
        match current.operator() {
            Operator::RootNode if current.children().len() == 1 => {
                current = &current.children()[0];
            }
            Operator::RootNode if current.children().is_empty() => return Vec::new(),
            Operator::Tuple => return current.children().iter().collect(),
            _ => return vec![current],
        }
    }
}

fn build_function_call(
    identifier: &str,
    args: &[&Node],
    resolver: &dyn SymbolResolver,
) -> Result<Expr, ConvertError> {
    let arity = |expected: usize| {
        if args.len() == expected {
            Ok(())
        } else {
            Err(ConvertError::WrongArity {
                name: identifier.to_string(),
                expected,
                got: args.len(),
            })
        }
    };
    let unary = |wrap: fn(Box<Expr>) -> Expr| -> Result<Expr, ConvertError> {
        arity(1)?;
        Ok(wrap(Box::new(build_ast(args[0], resolver)?)))
    };
    let binary = |wrap: fn(Box<Expr>, Box<Expr>) -> Expr| -> Result<Expr, ConvertError> {
        arity(2)?;
        Ok(wrap(
            Box::new(build_ast(args[0], resolver)?),
            Box::new(build_ast(args[1], resolver)?),
        ))
    };

    match identifier {
        "abs" => unary(Expr::Abs),
        "ln" | "log" => unary(Expr::Ln),
        "sqrt" => unary(Expr::Sqrt),
        "exp" => unary(Expr::Exp),
        "sin" => unary(Expr::Sin),
        "cos" => unary(Expr::Cos),
        "tan" => unary(Expr::Tan),
        "min" => binary(Expr::Min),
        "max" => binary(Expr::Max),
        "pow" => binary(Expr::PowExpr),
        "delayed" => {
            arity(2)?;
            let name = match unwrap_root(&args[0]).operator() {
                Operator::VariableIdentifierRead { identifier } => identifier.to_string(),
                other => {
                    return Err(ConvertError::InvalidDelay(format!(
                        "first argument must be a state, got {other:?}"
                    )))
                }
            };
            let delay = match unwrap_root(&args[1]).operator() {
                Operator::Const {
                    value: evalexpr::Value::Int(k),
                } if *k >= 0 => *k as usize,
                other => {
                    return Err(ConvertError::InvalidDelay(format!(
                        "second argument must be a delay index, got {other:?}"
                    )))
                }
            };
            let index = resolver.delayed_slot(&name, delay)?;
            Ok(Expr::Var(VarRef {
                name: format!("delayed({name}, {delay})"),
                index,
            }))
        }
        _ => Err(ConvertError::UnsupportedFunction(identifier.to_string())),
    }
}

/// Strips the single-child root nodes evalexpr wraps around function arguments.
fn unwrap_root(mut node: &Node) -> &Node {
    while matches!(node.operator(), Operator::RootNode) && node.children().len() == 1 {
        node = &node.children()[0];
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(names: &[&str]) -> HashMap<String, u32> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i as u32))
            .collect()
    }

    fn eval(text: &str, names: &[&str], input: &[f64]) -> f64 {
        build_expr(text, &resolver(names)).unwrap().evaluate(input)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("-x + 2*y", &["x", "y"], &[1.0, 3.0]), 5.0);
        assert_eq!(eval("x^2 - y/4", &["x", "y"], &[3.0, 2.0]), 8.5);
        assert_eq!(eval("x^0.5", &["x"], &[16.0]), 4.0);
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("abs(x - 1)", &["x"], &[-2.0]), 3.0);
        assert_eq!(eval("max(x, y)", &["x", "y"], &[1.0, 2.0]), 2.0);
        assert_eq!(eval("min(x, y)", &["x", "y"], &[1.0, 2.0]), 1.0);
        assert_eq!(eval("pow(x, y)", &["x", "y"], &[2.0, 3.0]), 8.0);
        assert!((eval("sin(pi/2)", &[], &[]) - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_unknown_variable() {
        let err = build_expr("x + q", &resolver(&["x"])).unwrap_err();
        assert!(matches!(
            err,
            EquationError::BuildJITError(ConvertError::VariableNotFound(ref name)) if name == "q"
        ));
    }

    #[test]
    fn test_unsupported_function() {
        let err = build_expr("floor(x)", &resolver(&["x"])).unwrap_err();
        assert!(matches!(
            err,
            EquationError::BuildJITError(ConvertError::UnsupportedFunction(_))
        ));
    }

    #[test]
    fn test_wrong_arity() {
        let err = build_expr("max(x)", &resolver(&["x"])).unwrap_err();
        assert!(matches!(
            err,
            EquationError::BuildJITError(ConvertError::WrongArity { expected: 2, .. })
        ));
    }

    struct DelayedResolver;

    impl SymbolResolver for DelayedResolver {
        fn slot(&self, name: &str) -> Result<u32, ConvertError> {
            match name {
                "x" => Ok(0),
                "y" => Ok(1),
                _ => Err(ConvertError::VariableNotFound(name.to_string())),
            }
        }

        fn delayed_slot(&self, name: &str, delay: usize) -> Result<u32, ConvertError> {
            match name {
                "x" => Ok(2 + delay as u32),
                _ => Err(ConvertError::InvalidDelay(name.to_string())),
            }
        }
    }

    #[test]
    fn test_delayed_reads_delay_slot() {
        let expr = build_expr("y - delayed(x, 1)", &DelayedResolver).unwrap();
        assert_eq!(expr.evaluate(&[0.0, 5.0, 7.0, 3.0]), 2.0);

        let expr = build_expr("2 * delayed((x), 0)", &DelayedResolver).unwrap();
        assert_eq!(expr.evaluate(&[0.0, 0.0, 4.0, 9.0]), 8.0);
    }

    #[test]
    fn test_delayed_rejects_bad_arguments() {
        for text in ["delayed(x + 1, 0)", "delayed(x, -1)", "delayed(x, 0.5)", "delayed(y, 0)"] {
            let err = build_expr(text, &DelayedResolver).unwrap_err();
            assert!(
                matches!(err, EquationError::BuildJITError(ConvertError::InvalidDelay(_))),
                "{text}: {err:?}"
            );
        }
        let err = build_expr("delayed(x, 0)", &resolver(&["x"])).unwrap_err();
        assert!(matches!(
            err,
            EquationError::BuildJITError(ConvertError::InvalidDelay(_))
        ));
    }
}
