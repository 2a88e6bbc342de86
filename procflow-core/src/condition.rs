//! Boolean condition expressions over a flat variable map.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! or      := and ("||" and)*
//! and     := cmp ("&&" cmp)*
//! cmp     := sum (("==" | "!=" | "<=" | ">=" | "<" | ">") sum)?
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/") unary)*
//! unary   := "!" unary | "-" unary | primary
//! primary := number | 'string' | "string" | true | false | null | ident | "(" or ")"
//! ```
//!
//! Identifiers may carry a leading `#`. Expressions may be wrapped in `${...}`
//! and may use the textual operators `eq ne lt le gt ge and or`.

use crate::types::Variables;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, one_of},
    combinator::{all_consuming, map, opt, recognize, value},
    multi::many0_count,
    sequence::{delimited, pair, preceded},
    IResult,
};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("malformed expression '{expression}'")]
    Parse { expression: String },
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("expression did not produce a boolean (got {0})")]
    NonBoolean(Value),
}

// ─── AST ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

// ─── Normalization ────────────────────────────────────────────

/// Strip a `${...}` wrapper and rewrite textual operators to symbols.
/// Quoted string literals are left untouched.
pub fn normalize(expression: &str) -> String {
    let trimmed = expression.trim();
    let inner = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(trimmed)
        .trim();
    rewrite_textual_operators(inner)
}

fn textual_operator(word: &str) -> Option<&'static str> {
    Some(match word {
        "eq" => "==",
        "ne" => "!=",
        "lt" => "<",
        "le" => "<=",
        "gt" => ">",
        "ge" => ">=",
        "and" => "&&",
        "or" => "||",
        _ => return None,
    })
}

fn rewrite_textual_operators(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut word = String::new();
    let mut quote: Option<char> = None;

    let flush = |word: &mut String, out: &mut String| {
        if !word.is_empty() {
            let replaced = textual_operator(word.as_str()).unwrap_or(word.as_str());
            out.push_str(replaced);
            word.clear();
        }
    };

    for c in input.chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_alphanumeric() || c == '_' || c == '#' || c == '.' => word.push(c),
            None => {
                flush(&mut word, &mut out);
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    flush(&mut word, &mut out);
    out
}

// ─── Parser ───────────────────────────────────────────────────

type PResult<'a, T> = IResult<&'a str, T>;

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> PResult<'a, O>,
) -> impl FnMut(&'a str) -> PResult<'a, O> {
    delimited(multispace0, inner, multispace0)
}

fn left_assoc<'a>(
    input: &'a str,
    operand: fn(&str) -> PResult<'_, Expr>,
    operator: fn(&str) -> PResult<'_, BinOp>,
) -> PResult<'a, Expr> {
    let (mut input, mut lhs) = operand(input)?;
    loop {
        match pair(operator, operand)(input) {
            Ok((rest, (op, rhs))) => {
                lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
                input = rest;
            }
            Err(nom::Err::Error(_)) => return Ok((input, lhs)),
            Err(e) => return Err(e),
        }
    }
}

fn or_expr(input: &str) -> PResult<'_, Expr> {
    left_assoc(input, and_expr, |i| value(BinOp::Or, ws(tag("||")))(i))
}

fn and_expr(input: &str) -> PResult<'_, Expr> {
    left_assoc(input, cmp_expr, |i| value(BinOp::And, ws(tag("&&")))(i))
}

fn cmp_op(input: &str) -> PResult<'_, BinOp> {
    ws(alt((
        value(BinOp::Eq, tag("==")),
        value(BinOp::Ne, tag("!=")),
        value(BinOp::Le, tag("<=")),
        value(BinOp::Ge, tag(">=")),
        value(BinOp::Lt, tag("<")),
        value(BinOp::Gt, tag(">")),
    )))(input)
}

fn cmp_expr(input: &str) -> PResult<'_, Expr> {
    let (input, lhs) = sum_expr(input)?;
    let (input, rhs) = opt(pair(cmp_op, sum_expr))(input)?;
    Ok(match rhs {
        Some((op, rhs)) => (input, Expr::Binary(op, Box::new(lhs), Box::new(rhs))),
        None => (input, lhs),
    })
}

fn sum_expr(input: &str) -> PResult<'_, Expr> {
    left_assoc(input, product_expr, |i| {
        map(ws(one_of("+-")), |c: char| if c == '+' { BinOp::Add } else { BinOp::Sub })(i)
    })
}

fn product_expr(input: &str) -> PResult<'_, Expr> {
    left_assoc(input, unary_expr, |i| {
        map(ws(one_of("*/")), |c: char| if c == '*' { BinOp::Mul } else { BinOp::Div })(i)
    })
}

fn unary_expr(input: &str) -> PResult<'_, Expr> {
    alt((
        map(preceded(ws(char('!')), unary_expr), |e: Expr| Expr::Not(Box::new(e))),
        map(preceded(ws(char('-')), unary_expr), |e: Expr| Expr::Neg(Box::new(e))),
        primary,
    ))(input)
}

fn number_text(input: &str) -> PResult<'_, &str> {
    recognize(pair(digit1, opt(pair(char('.'), digit1))))(input)
}

fn number(input: &str) -> PResult<'_, Expr> {
    let (rest, text) = number_text(input)?;
    let value = match text.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| {
                nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Float))
            })?,
    };
    Ok((rest, Expr::Literal(value)))
}

fn string_literal(input: &str) -> PResult<'_, Expr> {
    map(
        alt((
            delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
            delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        )),
        |s: &str| Expr::Literal(Value::String(s.to_string())),
    )(input)
}

fn identifier_text(input: &str) -> PResult<'_, &str> {
    preceded(
        opt(char('#')),
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0_count(alt((alphanumeric1, tag("_"), tag(".")))),
        )),
    )(input)
}

fn identifier(input: &str) -> PResult<'_, Expr> {
    let (rest, name) = identifier_text(input)?;
    let expr = match name {
        "true" => Expr::Literal(Value::Bool(true)),
        "false" => Expr::Literal(Value::Bool(false)),
        "null" => Expr::Literal(Value::Null),
        _ => Expr::Var(name.to_string()),
    };
    Ok((rest, expr))
}

fn primary(input: &str) -> PResult<'_, Expr> {
    ws(alt((
        delimited(char('('), or_expr, char(')')),
        number,
        string_literal,
        identifier,
    )))(input)
}

fn parse(expression: &str) -> Result<Expr, ConditionError> {
    all_consuming(or_expr)(expression)
        .map(|(_, expr)| expr)
        .map_err(|_| ConditionError::Parse {
            expression: expression.to_string(),
        })
}

// ─── Evaluation ───────────────────────────────────────────────

fn as_bool(v: Value, context: &str) -> Result<bool, ConditionError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(ConditionError::TypeMismatch(format!(
            "{context} expects booleans, got {other}"
        ))),
    }
}

fn as_f64(v: &Value, context: &str) -> Result<f64, ConditionError> {
    v.as_f64().ok_or_else(|| {
        ConditionError::TypeMismatch(format!("{context} expects numbers, got {v}"))
    })
}

fn number_value(n: f64) -> Result<Value, ConditionError> {
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| ConditionError::TypeMismatch(format!("non-finite result {n}")))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering, ConditionError> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => as_f64(a, "comparison")?
            .partial_cmp(&as_f64(b, "comparison")?)
            .ok_or_else(|| ConditionError::TypeMismatch("unordered numbers".into())),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(ConditionError::TypeMismatch(format!(
            "cannot order {a} and {b}"
        ))),
    }
}

fn arithmetic(op: BinOp, a: Value, b: Value) -> Result<Value, ConditionError> {
    if let (BinOp::Add, Value::String(x), Value::String(y)) = (op, &a, &b) {
        return Ok(Value::String(format!("{x}{y}")));
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinOp::Add => x.checked_add(y),
            BinOp::Sub => x.checked_sub(y),
            BinOp::Mul => x.checked_mul(y),
            _ => None,
        };
        if let Some(n) = exact {
            return Ok(Value::from(n));
        }
    }
    let x = as_f64(&a, "arithmetic")?;
    let y = as_f64(&b, "arithmetic")?;
    match op {
        BinOp::Add => number_value(x + y),
        BinOp::Sub => number_value(x - y),
        BinOp::Mul => number_value(x * y),
        BinOp::Div if y == 0.0 => Err(ConditionError::TypeMismatch("division by zero".into())),
        BinOp::Div => number_value(x / y),
        _ => Err(ConditionError::TypeMismatch(format!("{op:?} is not arithmetic"))),
    }
}

fn eval(expr: &Expr, vars: &Variables) -> Result<Value, ConditionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => vars
            .get(name)
            .cloned()
            .ok_or_else(|| ConditionError::UnknownVariable(name.clone())),
        Expr::Not(inner) => Ok(Value::Bool(!as_bool(eval(inner, vars)?, "'!'")?)),
        Expr::Neg(inner) => {
            let v = eval(inner, vars)?;
            match v.as_i64().and_then(i64::checked_neg) {
                Some(n) => Ok(Value::from(n)),
                None => number_value(-as_f64(&v, "negation")?),
            }
        }
        Expr::Binary(BinOp::And, lhs, rhs) => {
            if !as_bool(eval(lhs, vars)?, "'&&'")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(eval(rhs, vars)?, "'&&'")?))
        }
        Expr::Binary(BinOp::Or, lhs, rhs) => {
            if as_bool(eval(lhs, vars)?, "'||'")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(eval(rhs, vars)?, "'||'")?))
        }
        Expr::Binary(op, lhs, rhs) => {
            let a = eval(lhs, vars)?;
            let b = eval(rhs, vars)?;
            let result = match op {
                BinOp::Eq => values_equal(&a, &b),
                BinOp::Ne => !values_equal(&a, &b),
                BinOp::Lt => compare(&a, &b)? == Ordering::Less,
                BinOp::Le => compare(&a, &b)? != Ordering::Greater,
                BinOp::Gt => compare(&a, &b)? == Ordering::Greater,
                BinOp::Ge => compare(&a, &b)? != Ordering::Less,
                _ => return arithmetic(*op, a, b),
            };
            Ok(Value::Bool(result))
        }
    }
}

// ─── Evaluator ────────────────────────────────────────────────

/// Evaluates edge and event conditions. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `expression`. Absent or blank expressions are true.
    pub fn try_evaluate(
        &self,
        expression: Option<&str>,
        variables: &Variables,
    ) -> Result<bool, ConditionError> {
        let Some(raw) = expression.filter(|e| !e.trim().is_empty()) else {
            return Ok(true);
        };
        let normalized = normalize(raw);
        if normalized.trim().is_empty() {
            return Ok(true);
        }
        match eval(&parse(&normalized)?, variables)? {
            Value::Bool(b) => Ok(b),
            other => Err(ConditionError::NonBoolean(other)),
        }
    }

    /// Fail-closed evaluation: any error is logged and counts as false.
    pub fn evaluate(&self, expression: Option<&str>, variables: &Variables) -> bool {
        self.try_evaluate(expression, variables).unwrap_or_else(|e| {
            tracing::warn!(
                expression = expression.unwrap_or_default(),
                error = %e,
                "condition evaluation failed"
            );
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(v: Value) -> Variables {
        serde_json::from_value(v).unwrap()
    }

    fn check(expr: &str, v: &Variables) -> Result<bool, ConditionError> {
        ConditionEvaluator::new().try_evaluate(Some(expr), v)
    }

    #[test]
    fn test_absent_or_blank_is_true() {
        let e = ConditionEvaluator::new();
        assert!(e.evaluate(None, &Variables::new()));
        assert!(e.evaluate(Some(""), &Variables::new()));
        assert!(e.evaluate(Some("${}"), &Variables::new()));
    }

    #[test]
    fn test_comparisons() {
        let v = vars(json!({"amount": 200, "rate": 0.5, "name": "acme", "vip": true}));
        assert!(check("amount > 100", &v).unwrap());
        assert!(!check("amount < 100", &v).unwrap());
        assert!(check("amount >= 200 && rate <= 0.5", &v).unwrap());
        assert!(check("name == 'acme'", &v).unwrap());
        assert!(check("name != \"other\"", &v).unwrap());
        assert!(check("vip", &v).unwrap());
        assert!(check("!(amount == 1) || false", &v).unwrap());
        assert!(check("amount == 200.0", &v).unwrap());
        assert!(check("amount * rate == 100", &v).unwrap());
        assert!(check("-amount < 0", &v).unwrap());
    }

    #[test]
    fn test_legacy_wrapper_and_textual_operators() {
        let v = vars(json!({"amount": 150, "region": "eu"}));
        assert!(check("${amount gt 100}", &v).unwrap());
        assert!(check("${amount gt 100 and region eq 'eu'}", &v).unwrap());
        assert!(check("amount le 100 or region ne 'us'", &v).unwrap());
        assert!(check("#amount ge 150", &v).unwrap());
    }

    #[test]
    fn test_rewrite_leaves_string_literals_alone() {
        assert_eq!(normalize("label == 'a and b'"), "label == 'a and b'");
        assert_eq!(normalize("x eq 1 and y lt 2"), "x == 1 && y < 2");
        assert_eq!(normalize("${ score ge 3 }"), "score >= 3");
    }

    #[test]
    fn test_errors_are_typed() {
        let v = vars(json!({"amount": 5, "name": "x"}));
        assert!(matches!(
            check("missing > 1", &v),
            Err(ConditionError::UnknownVariable(_))
        ));
        assert!(matches!(check("amount >", &v), Err(ConditionError::Parse { .. })));
        assert!(matches!(check("amount + 1", &v), Err(ConditionError::NonBoolean(_))));
        assert!(matches!(
            check("name > 1", &v),
            Err(ConditionError::TypeMismatch(_))
        ));
        assert!(matches!(
            check("amount && true", &v),
            Err(ConditionError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_fail_closed() {
        let e = ConditionEvaluator::new();
        assert!(!e.evaluate(Some("unknown == 1"), &Variables::new()));
        assert!(!e.evaluate(Some("((("), &Variables::new()));
    }

    #[test]
    fn test_short_circuit_skips_unknown_rhs() {
        let v = vars(json!({"a": false}));
        assert!(!check("a && missing", &v).unwrap());
        assert!(check("!a || missing", &v).unwrap());
    }
}
