//! Post-fetch value transforms in reverse Polish notation.
//!
//! An [`Expression`] is compiled once from text and then evaluated against
//! every fetched value. Tokens are separated by commas or whitespace; the
//! token `value` pushes the value being transformed.
//!
//! ```rust
//! use rrdb::rpn::Expression;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // bytes/s to bits/s
//! let bits = Expression::compile("value,8,*")?;
//! assert_eq!(bits.eval(100.0), 800.0);
//!
//! // clamp negative values to zero
//! let clamp = Expression::compile("value 0 LT 0 value IF")?;
//! assert_eq!(clamp.eval(-3.0), 0.0);
//! assert_eq!(clamp.eval(3.0), 3.0);
//! # Ok(())
//! # }
//! ```
//!
//! Comparisons involving an unknown operand yield unknown, and `IF` treats
//! unknown as false.

use std::fmt;
use std::str::FromStr;

use crate::error::ExpressionError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Unary {
    Abs,
    Sqrt,
    Log,
    Exp,
    Floor,
    Ceil,
    Round,
    Sin,
    Cos,
    Un,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Binary {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Min,
    Max,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Value,
    Const(f64),
    Unary(Unary),
    Binary(Binary),
    Limit,
    If,
    Dup,
    Exc,
    Pop,
}

impl Op {
    fn parse(token: &str) -> Result<Self, ExpressionError> {
        let op = match token.to_ascii_uppercase().as_str() {
            "VALUE" => Self::Value,
            "PI" => Self::Const(std::f64::consts::PI),
            "E" => Self::Const(std::f64::consts::E),
            "UNKN" => Self::Const(f64::NAN),
            "INF" => Self::Const(f64::INFINITY),
            "NEGINF" => Self::Const(f64::NEG_INFINITY),
            "+" => Self::Binary(Binary::Add),
            "-" => Self::Binary(Binary::Sub),
            "*" => Self::Binary(Binary::Mul),
            "/" => Self::Binary(Binary::Div),
            "%" => Self::Binary(Binary::Rem),
            "POW" => Self::Binary(Binary::Pow),
            "MIN" => Self::Binary(Binary::Min),
            "MAX" => Self::Binary(Binary::Max),
            "LT" => Self::Binary(Binary::Lt),
            "LE" => Self::Binary(Binary::Le),
            "GT" => Self::Binary(Binary::Gt),
            "GE" => Self::Binary(Binary::Ge),
            "EQ" => Self::Binary(Binary::Eq),
            "NE" => Self::Binary(Binary::Ne),
            "ABS" => Self::Unary(Unary::Abs),
            "SQRT" => Self::Unary(Unary::Sqrt),
            "LOG" => Self::Unary(Unary::Log),
            "EXP" => Self::Unary(Unary::Exp),
            "FLOOR" => Self::Unary(Unary::Floor),
            "CEIL" => Self::Unary(Unary::Ceil),
            "ROUND" => Self::Unary(Unary::Round),
            "SIN" => Self::Unary(Unary::Sin),
            "COS" => Self::Unary(Unary::Cos),
            "UN" => Self::Unary(Unary::Un),
            "LIMIT" => Self::Limit,
            "IF" => Self::If,
            "DUP" => Self::Dup,
            "EXC" => Self::Exc,
            "POP" => Self::Pop,
            _ => match token.parse::<f64>() {
                Ok(n) if n.is_finite() => Self::Const(n),
                _ => {
                    return Err(ExpressionError::UnknownToken {
                        token: token.to_string(),
                    });
                }
            },
        };
        Ok(op)
    }

    /// Operands consumed and values produced.
    fn arity(self) -> (usize, usize) {
        match self {
            Self::Value | Self::Const(_) => (0, 1),
            Self::Unary(_) => (1, 1),
            Self::Binary(_) => (2, 1),
            Self::Limit | Self::If => (3, 1),
            Self::Dup => (1, 2),
            Self::Exc => (2, 2),
            Self::Pop => (1, 0),
        }
    }
}

// Depth is verified by `compile`, so pops never come up empty.
fn pop(stack: &mut Vec<f64>) -> f64 {
    stack.pop().unwrap_or(f64::NAN)
}

fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn compare(a: f64, b: f64, f: impl Fn(f64, f64) -> bool) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        truth(f(a, b))
    }
}

impl Unary {
    fn apply(self, x: f64) -> f64 {
        match self {
            Self::Abs => x.abs(),
            Self::Sqrt => x.sqrt(),
            Self::Log => x.ln(),
            Self::Exp => x.exp(),
            Self::Floor => x.floor(),
            Self::Ceil => x.ceil(),
            Self::Round => x.round(),
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Un => truth(x.is_nan()),
        }
    }
}

impl Binary {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Rem => a % b,
            Self::Pow => a.powf(b),
            Self::Min if a.is_nan() || b.is_nan() => f64::NAN,
            Self::Min => a.min(b),
            Self::Max if a.is_nan() || b.is_nan() => f64::NAN,
            Self::Max => a.max(b),
            Self::Lt => compare(a, b, |a, b| a < b),
            Self::Le => compare(a, b, |a, b| a <= b),
            Self::Gt => compare(a, b, |a, b| a > b),
            Self::Ge => compare(a, b, |a, b| a >= b),
            #[allow(clippy::float_cmp)]
            Self::Eq => compare(a, b, |a, b| a == b),
            #[allow(clippy::float_cmp)]
            Self::Ne => compare(a, b, |a, b| a != b),
        }
    }
}

/// A compiled RPN expression over a single value.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ops: Vec<Op>,
    max_depth: usize,
}

impl Expression {
    /// Compiles `source`, verifying that every operator has enough operands
    /// and that exactly one value remains.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError`] for empty input, unknown tokens, stack
    /// underflow, or a final stack depth other than one.
    pub fn compile(source: &str) -> Result<Self, ExpressionError> {
        let mut ops = Vec::new();
        let mut depth = 0usize;
        let mut max_depth = 0usize;

        for token in source
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            let op = Op::parse(token)?;
            let (pops, pushes) = op.arity();
            if depth < pops {
                return Err(ExpressionError::StackUnderflow {
                    token: token.to_string(),
                });
            }
            depth = depth - pops + pushes;
            max_depth = max_depth.max(depth);
            ops.push(op);
        }

        if ops.is_empty() {
            return Err(ExpressionError::Empty);
        }
        if depth != 1 {
            return Err(ExpressionError::UnbalancedStack { depth });
        }

        Ok(Self {
            source: source.trim().to_string(),
            ops,
            max_depth,
        })
    }

    /// The source text this expression was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression with `value` bound to the `value` token.
    pub fn eval(&self, value: f64) -> f64 {
        let mut stack: Vec<f64> = Vec::with_capacity(self.max_depth);

        for op in &self.ops {
            match *op {
                Op::Value => stack.push(value),
                Op::Const(c) => stack.push(c),
                Op::Unary(u) => {
                    let x = pop(&mut stack);
                    stack.push(u.apply(x));
                }
                Op::Binary(b) => {
                    let rhs = pop(&mut stack);
                    let lhs = pop(&mut stack);
                    stack.push(b.apply(lhs, rhs));
                }
                Op::Limit => {
                    let upper = pop(&mut stack);
                    let lower = pop(&mut stack);
                    let x = pop(&mut stack);
                    let out = x.is_nan() || lower.is_nan() || upper.is_nan() || x < lower || x > upper;
                    stack.push(if out { f64::NAN } else { x });
                }
                Op::If => {
                    let otherwise = pop(&mut stack);
                    let then = pop(&mut stack);
                    let cond = pop(&mut stack);
                    stack.push(if !cond.is_nan() && cond != 0.0 { then } else { otherwise });
                }
                Op::Dup => {
                    let x = pop(&mut stack);
                    stack.push(x);
                    stack.push(x);
                }
                Op::Exc => {
                    let b = pop(&mut stack);
                    let a = pop(&mut stack);
                    stack.push(b);
                    stack.push(a);
                }
                Op::Pop => {
                    pop(&mut stack);
                }
            }
        }

        pop(&mut stack)
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
