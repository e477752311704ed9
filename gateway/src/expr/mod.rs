//! A small, sandboxed expression language for claim policies.
//!
//! The language is a subset of CEL: literals, the usual operators, member access,
//! indexing, a handful of pure functions and the `map`/`filter`/`exists`/`all`
//! macros. Expressions have no access to I/O, cannot loop unboundedly and are
//! compiled once at startup so configuration errors surface before serving.
//!
//! ```text
//! 'admin' in claims.groups && claims.email.endsWith('@example.com')
//! claims.groups.filter(g, g.startsWith('team-')).map(g, 'oidc:' + g)
//! ```

mod eval;
mod lexer;
mod parser;
mod value;

use alloc::collections::{BTreeMap, BTreeSet};
use core::fmt;

pub use value::Value;

/// Longest accepted expression source, in bytes.
pub const MAX_SOURCE_LEN: usize = 4096;

/// Evaluation steps (nodes visited plus comprehension iterations) allowed per
/// evaluation.
pub const STEP_BUDGET: u64 = 10_000;

/// An expression that failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (at offset {position})")]
pub struct CompileError {
    /// Byte offset into the source.
    pub position: usize,
    pub message: String,
}

impl CompileError {
    pub(crate) fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("no such key '{0}'")]
    NoSuchKey(String),
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("{context} expects {expected}, found {found}")]
    UnexpectedType {
        context: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("no such overload: {lhs} {op} {rhs}")]
    InvalidOperands {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("{0}")]
    InvalidConversion(String),
    #[error("integer overflow")]
    Overflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("evaluation exceeded its step budget")]
    BudgetExceeded,
}

/// Variables visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Context {
    vars: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

/// A compiled expression.
#[derive(Clone)]
pub struct Expression {
    source: String,
    ast: parser::Expr,
    identifiers: BTreeSet<String>,
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expression").field(&self.source).finish()
    }
}

impl Expression {
    /// Parses and checks `source`.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] for syntax errors, unknown functions or methods,
    /// wrong arities, invalid `matches()` patterns, nesting deeper than 64 levels
    /// and sources longer than [`MAX_SOURCE_LEN`].
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(CompileError::new(
                MAX_SOURCE_LEN,
                format!("expression longer than {MAX_SOURCE_LEN} bytes"),
            ));
        }
        if source.trim().is_empty() {
            return Err(CompileError::new(0, "empty expression"));
        }
        let ast = parser::parse(lexer::tokenize(source)?)?;
        let mut identifiers = BTreeSet::new();
        ast.free_identifiers(&mut Vec::new(), &mut identifiers);
        Ok(Self {
            source: source.to_owned(),
            ast,
            identifiers,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Top-level identifiers the expression reads from its [`Context`].
    pub const fn identifiers(&self) -> &BTreeSet<String> {
        &self.identifiers
    }

    /// # Errors
    ///
    /// Fails when the expression does not type-check against the values in `ctx`,
    /// references a missing key or identifier, or runs out of budget.
    pub fn evaluate(&self, ctx: &Context) -> Result<Value, EvalError> {
        eval::evaluate(&self.ast, ctx, STEP_BUDGET)
    }

    /// # Errors
    ///
    /// As [`Expression::evaluate`], and when the result is not a bool.
    pub fn evaluate_bool(&self, ctx: &Context) -> Result<bool, EvalError> {
        match self.evaluate(ctx)? {
            Value::Bool(b) => Ok(b),
            other => Err(result_type("bool", &other)),
        }
    }

    /// # Errors
    ///
    /// As [`Expression::evaluate`], and when the result is not a string.
    pub fn evaluate_string(&self, ctx: &Context) -> Result<String, EvalError> {
        match self.evaluate(ctx)? {
            Value::String(s) => Ok(s),
            other => Err(result_type("string", &other)),
        }
    }

    /// # Errors
    ///
    /// As [`Expression::evaluate`], and when the result is not a list of strings.
    pub fn evaluate_string_list(&self, ctx: &Context) -> Result<Vec<String>, EvalError> {
        let items = match self.evaluate(ctx)? {
            Value::List(items) => items,
            other => return Err(result_type("list of strings", &other)),
        };
        items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(result_type("list of strings", &other)),
            })
            .collect()
    }
}

fn result_type(expected: &'static str, found: &Value) -> EvalError {
    EvalError::UnexpectedType {
        context: "expression result",
        expected,
        found: found.type_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> Value {
        Value::from(serde_json::json!({
            "sub": "1234",
            "email": "Jane@Example.com",
            "email_verified": true,
            "groups": ["admins", "team-a", "team-b"],
            "exp": 1_700_000_000_i64,
        }))
    }

    fn ctx() -> Context {
        Context::new().with("claims", claims())
    }

    fn eval(src: &str) -> Result<Value, EvalError> {
        Expression::compile(src).unwrap().evaluate(&ctx())
    }

    #[test]
    fn membership_in_claim_list() {
        let expr = Expression::compile("'admins' in claims.groups").unwrap();
        assert!(expr.evaluate_bool(&ctx()).unwrap());
        let expr = Expression::compile("'root' in claims.groups").unwrap();
        assert!(!expr.evaluate_bool(&ctx()).unwrap());
    }

    #[test]
    fn string_functions() {
        assert_eq!(
            eval("lower(claims.email)").unwrap(),
            Value::from("jane@example.com")
        );
        assert_eq!(
            eval("claims.email.lowerAscii().endsWith('@example.com')").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval("'a,b,,c'.split(',')").unwrap(),
            Value::from(vec!["a", "b", "", "c"])
        );
        assert_eq!(
            eval("claims.groups.join('|')").unwrap(),
            Value::from("admins|team-a|team-b")
        );
        assert_eq!(eval("'  x '.trim()").unwrap(), Value::from("x"));
        assert_eq!(eval("string(42) + '!'").unwrap(), Value::from("42!"));
        assert_eq!(eval("int('17') * 2").unwrap(), Value::Int(34));
    }

    #[test]
    fn comprehensions() {
        let expr = Expression::compile(
            "claims.groups.filter(g, g.startsWith('team-')).map(g, 'oidc:' + g)",
        )
        .unwrap();
        assert_eq!(
            expr.evaluate_string_list(&ctx()).unwrap(),
            vec!["oidc:team-a".to_owned(), "oidc:team-b".to_owned()]
        );
        assert_eq!(
            eval("claims.groups.exists(g, g == 'team-b')").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval("claims.groups.all(g, size(g) > 5)").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(eval("[].all(g, false)").unwrap(), Value::Bool(true));
    }

    #[test]
    fn has_and_ternary_handle_optional_claims() {
        let expr = Expression::compile(
            "has(claims.preferred_username) ? claims.preferred_username : claims.email",
        )
        .unwrap();
        assert_eq!(expr.evaluate_string(&ctx()).unwrap(), "Jane@Example.com");
    }

    #[test]
    fn missing_keys_are_errors() {
        assert_eq!(
            eval("claims.nickname == 'x'").unwrap_err(),
            EvalError::NoSuchKey("nickname".into())
        );
    }

    #[test]
    fn logical_operators_short_circuit() {
        assert_eq!(
            eval("false && claims.nickname == 'x'").unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            eval("true || claims.nickname == 'x'").unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn type_errors_are_reported() {
        assert!(matches!(
            eval("claims.email + 1").unwrap_err(),
            EvalError::InvalidOperands { .. }
        ));
        assert!(matches!(
            eval("claims.sub && true").unwrap_err(),
            EvalError::UnexpectedType { .. }
        ));
        let not_bool = Expression::compile("claims.sub").unwrap();
        assert!(not_bool.evaluate_bool(&ctx()).is_err());
    }

    #[test]
    fn arithmetic_is_checked() {
        assert_eq!(eval("7 / 2").unwrap(), Value::Int(3));
        assert_eq!(eval("7 % 2").unwrap(), Value::Int(1));
        assert_eq!(eval("1 / 0").unwrap_err(), EvalError::DivisionByZero);
        assert_eq!(
            eval("9223372036854775807 + 1").unwrap_err(),
            EvalError::Overflow
        );
        assert_eq!(eval("1 + 0.5").unwrap(), Value::Double(1.5));
    }

    #[test]
    fn regex_matches() {
        assert_eq!(
            eval("claims.sub.matches('^[0-9]+$')").unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn runaway_evaluation_hits_budget() {
        let src = "[1,2,3,4,5,6,7,8,9,10].map(a, [1,2,3,4,5,6,7,8,9,10].map(b, \
                   [1,2,3,4,5,6,7,8,9,10].map(c, [1,2,3,4,5,6,7,8,9,10].map(d, a + b + c + d))))";
        assert_eq!(eval(src).unwrap_err(), EvalError::BudgetExceeded);
    }

    #[test]
    fn rejects_oversized_and_empty_sources() {
        let long = format!("'{}'", "a".repeat(MAX_SOURCE_LEN));
        assert!(Expression::compile(&long).is_err());
        assert!(Expression::compile("   ").is_err());
    }

    #[test]
    fn long_operator_chain_fails_to_compile() {
        let err = Expression::compile(&format!("1{}", "+1".repeat(2000))).unwrap_err();
        assert!(err.to_string().contains("nested deeper than"), "{err}");
    }

    #[test]
    fn reports_free_identifiers() {
        let expr = Expression::compile("claims.groups.map(g, g + suffix)").unwrap();
        assert_eq!(
            expr.identifiers().iter().cloned().collect::<Vec<_>>(),
            vec!["claims".to_owned(), "suffix".to_owned()]
        );
    }

    #[test]
    fn unknown_identifier_at_runtime() {
        assert_eq!(
            eval("nope").unwrap_err(),
            EvalError::UnknownIdentifier("nope".into())
        );
    }
}
