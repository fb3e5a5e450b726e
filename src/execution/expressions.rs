// Expression evaluation.
//
// Evaluates parser expressions against a row context. Comparisons coerce
// across the numeric widths; any comparison against NULL yields NULL,
// which filters treat as false.

use crate::error::{DbError, Result};
use crate::parser::ast::{BinaryOp, Expr, UnaryOp};
use crate::types::value::Value;
use std::cmp::Ordering;

/// Column layout of the rows an expression is evaluated against: one
/// (qualifier, name) per value. Joins concatenate two of these.
#[derive(Debug, Clone, Default)]
pub struct RowSchema {
    pub columns: Vec<(Option<String>, String)>,
}

impl RowSchema {
    pub fn from_names<'a>(
        qualifier: Option<&str>,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            columns: names
                .into_iter()
                .map(|n| (qualifier.map(|q| q.to_string()), n.to_string()))
                .collect(),
        }
    }

    pub fn concat(&self, other: &RowSchema) -> RowSchema {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());
        RowSchema { columns }
    }

    /// Resolves a possibly-qualified column reference to its index.
    pub fn resolve(&self, qualifier: Option<&str>, name: &str) -> Result<usize> {
        let matches: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, (q, n))| {
                n.eq_ignore_ascii_case(name)
                    && match (qualifier, q) {
                        (Some(want), Some(have)) => have.eq_ignore_ascii_case(want),
                        (Some(_), None) => false,
                        (None, _) => true,
                    }
            })
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [i] => Ok(*i),
            [] => Err(DbError::NotFound(format!(
                "column {}{}",
                qualifier.map(|q| format!("{}.", q)).unwrap_or_default(),
                name
            ))),
            _ => Err(DbError::Semantic(format!("ambiguous column {}", name))),
        }
    }
}

/// Evaluates an expression against one row.
pub fn eval(expr: &Expr, row: &[Value], schema: &RowSchema) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column(qualifier, name) => {
            let idx = schema.resolve(qualifier.as_deref(), name)?;
            Ok(row[idx].clone())
        }
        Expr::Unary { op, expr } => {
            let v = eval(expr, row, schema)?;
            match op {
                UnaryOp::Neg => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Double(d) => Ok(Value::Double(-d)),
                    other => other
                        .as_i64()
                        .map(|i| Value::BigInt(-i))
                        .ok_or_else(|| {
                            DbError::DataType(format!("cannot negate {}", other.type_name()))
                        }),
                },
                UnaryOp::Not => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Boolean(b) => Ok(Value::Boolean(!b)),
                    other => Err(DbError::DataType(format!(
                        "NOT requires a boolean, got {}",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::Binary { left, op, right } => {
            let l = eval(left, row, schema)?;
            match op {
                BinaryOp::And | BinaryOp::Or => {
                    let r = eval(right, row, schema)?;
                    eval_logical(*op, &l, &r)
                }
                BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq => {
                    let r = eval(right, row, schema)?;
                    eval_comparison(*op, &l, &r)
                }
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                    let r = eval(right, row, schema)?;
                    eval_arithmetic(*op, &l, &r)
                }
            }
        }
        Expr::Function { name, args, star } => {
            let lower = name.to_ascii_lowercase();
            if *star || is_aggregate(&lower) {
                return Err(DbError::Semantic(format!(
                    "aggregate {} is not valid here",
                    name
                )));
            }
            match lower.as_str() {
                "distance" => {
                    if args.len() != 2 {
                        return Err(DbError::Semantic(
                            "DISTANCE takes exactly two arguments".to_string(),
                        ));
                    }
                    let a = eval(&args[0], row, schema)?;
                    let b = eval(&args[1], row, schema)?;
                    distance(&a, &b)
                }
                "abs" => {
                    if args.len() != 1 {
                        return Err(DbError::Semantic("ABS takes one argument".to_string()));
                    }
                    match eval(&args[0], row, schema)? {
                        Value::Null => Ok(Value::Null),
                        Value::Double(d) => Ok(Value::Double(d.abs())),
                        other => other.as_i64().map(|i| Value::BigInt(i.abs())).ok_or_else(
                            || DbError::DataType("ABS requires a numeric argument".to_string()),
                        ),
                    }
                }
                "lower" | "upper" => {
                    if args.len() != 1 {
                        return Err(DbError::Semantic(format!("{} takes one argument", name)));
                    }
                    match eval(&args[0], row, schema)? {
                        Value::Null => Ok(Value::Null),
                        v => {
                            let s = v.as_str().ok_or_else(|| {
                                DbError::DataType(format!("{} requires a string", name))
                            })?;
                            Ok(Value::Text(if lower == "lower" {
                                s.to_lowercase()
                            } else {
                                s.to_uppercase()
                            }))
                        }
                    }
                }
                other => Err(DbError::Semantic(format!("unknown function {}", other))),
            }
        }
        Expr::IsNull { expr, negated } => {
            let v = eval(expr, row, schema)?;
            Ok(Value::Boolean(v.is_null() != *negated))
        }
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, row, schema)?);
            }
            Ok(Value::Array(out))
        }
        Expr::SetLiteral(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, row, schema)?);
            }
            Ok(Value::canonical_set(out))
        }
    }
}

pub fn is_aggregate(lower_name: &str) -> bool {
    matches!(lower_name, "count" | "sum" | "min" | "max" | "avg")
}

/// Filter semantics: NULL and non-boolean are not a match.
pub fn is_true(value: &Value) -> bool {
    matches!(value, Value::Boolean(true))
}

fn eval_logical(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    let as_bool = |v: &Value| -> Result<Option<bool>> {
        match v {
            Value::Null => Ok(None),
            Value::Boolean(b) => Ok(Some(*b)),
            other => Err(DbError::DataType(format!(
                "logical operator requires booleans, got {}",
                other.type_name()
            ))),
        }
    };
    let (l, r) = (as_bool(l)?, as_bool(r)?);
    let out = match op {
        BinaryOp::And => match (l, r) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        BinaryOp::Or => match (l, r) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        _ => unreachable!(),
    };
    Ok(out.map(Value::Boolean).unwrap_or(Value::Null))
}

/// Ordering across comparable values, widening numerics.
pub fn compare_values(l: &Value, r: &Value) -> Result<Ordering> {
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        return Ok(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return Ok(a.total_cmp(&b));
    }
    match (l, r) {
        (Value::Boolean(a), Value::Boolean(b)) => Ok(a.cmp(b)),
        (a, b) if a.as_str().is_some() && b.as_str().is_some() => {
            Ok(a.as_str().unwrap().cmp(b.as_str().unwrap()))
        }
        (Value::Blob(a), Value::Blob(b)) => Ok(a.cmp(b)),
        (Value::Vector(_), Value::Vector(_)) | (Value::Array(_), Value::Array(_)) => Ok(l.cmp(r)),
        _ => Err(DbError::DataType(format!(
            "cannot compare {} with {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn eval_comparison(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    let ord = compare_values(l, r)?;
    let out = match op {
        BinaryOp::Eq => ord == Ordering::Equal,
        BinaryOp::NotEq => ord != Ordering::Equal,
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::LtEq => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        BinaryOp::GtEq => ord != Ordering::Less,
        _ => unreachable!(),
    };
    Ok(Value::Boolean(out))
}

fn eval_arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    let uses_double = matches!(l, Value::Double(_)) || matches!(r, Value::Double(_));
    if uses_double {
        let (a, b) = (
            l.as_f64()
                .ok_or_else(|| non_numeric_operand(l))?,
            r.as_f64()
                .ok_or_else(|| non_numeric_operand(r))?,
        );
        let out = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => {
                if b == 0.0 {
                    return Err(DbError::Execution("division by zero".to_string()));
                }
                a / b
            }
            _ => unreachable!(),
        };
        return Ok(Value::Double(out));
    }
    let (a, b) = (
        l.as_i64().ok_or_else(|| non_numeric_operand(l))?,
        r.as_i64().ok_or_else(|| non_numeric_operand(r))?,
    );
    let out = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div => {
            if b == 0 {
                return Err(DbError::Execution("division by zero".to_string()));
            }
            a.checked_div(b)
        }
        _ => unreachable!(),
    };
    out.map(Value::BigInt)
        .ok_or_else(|| DbError::DataType("integer overflow".to_string()))
}

fn non_numeric_operand(v: &Value) -> DbError {
    DbError::DataType(format!(
        "arithmetic requires numeric operands, got {}",
        v.type_name()
    ))
}

/// Euclidean distance between two equal-dimension vectors.
fn distance(a: &Value, b: &Value) -> Result<Value> {
    let to_vec = |v: &Value| -> Result<Vec<f64>> {
        match v {
            Value::Vector(x) => Ok(x.clone()),
            Value::Array(items) => items
                .iter()
                .map(|i| {
                    i.as_f64().ok_or_else(|| {
                        DbError::DataType("DISTANCE requires numeric vectors".to_string())
                    })
                })
                .collect(),
            Value::Null => Err(DbError::DataType(
                "DISTANCE is not defined for NULL".to_string(),
            )),
            other => Err(DbError::DataType(format!(
                "DISTANCE requires vectors, got {}",
                other.type_name()
            ))),
        }
    };
    let (a, b) = (to_vec(a)?, to_vec(b)?);
    if a.len() != b.len() {
        return Err(DbError::DataType(format!(
            "DISTANCE dimensions differ: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let sum: f64 = a.iter().zip(&b).map(|(x, y)| (x - y) * (x - y)).sum();
    Ok(Value::Double(sum.sqrt()))
}
