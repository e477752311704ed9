//! Tree-walking evaluator with a step budget.

use alloc::collections::BTreeMap;

use super::{
    Context, EvalError,
    parser::{BinaryOp, Comprehension, Expr, Function, Method, UnaryOp},
    value::{Value, int_to_double},
};

pub(super) fn evaluate(expr: &Expr, ctx: &Context, budget: u64) -> Result<Value, EvalError> {
    Evaluator {
        ctx,
        locals: Vec::new(),
        remaining: budget,
    }
    .eval(expr)
}

struct Evaluator<'ctx> {
    ctx: &'ctx Context,
    /// Comprehension variables, innermost last.
    locals: Vec<(String, Value)>,
    remaining: u64,
}

impl Evaluator<'_> {
    fn charge(&mut self) -> Result<(), EvalError> {
        self.remaining = self
            .remaining
            .checked_sub(1)
            .ok_or(EvalError::BudgetExceeded)?;
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        self.locals
            .iter()
            .rev()
            .find(|&&(ref local, _)| local == name)
            .map(|&(_, ref value)| value)
            .or_else(|| self.ctx.get(name))
            .cloned()
            .ok_or_else(|| EvalError::UnknownIdentifier(name.to_owned()))
    }

    fn eval_bool(&mut self, expr: &Expr, context: &'static str) -> Result<bool, EvalError> {
        match self.eval(expr)? {
            Value::Bool(b) => Ok(b),
            other => Err(unexpected(context, "bool", &other)),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        self.charge()?;
        match *expr {
            Expr::Literal(ref value) => Ok(value.clone()),
            Expr::Ident(ref name) => self.lookup(name),
            Expr::List(ref items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Map(ref entries) => {
                let mut map = BTreeMap::new();
                for &(ref key, ref value) in entries {
                    let key = match self.eval(key)? {
                        Value::String(s) => s,
                        other => return Err(unexpected("map key", "string", &other)),
                    };
                    let value = self.eval(value)?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            Expr::Member {
                ref target,
                ref field,
            } => match self.eval(target)? {
                Value::Map(mut map) => map
                    .remove(field)
                    .ok_or_else(|| EvalError::NoSuchKey(field.clone())),
                other => Err(unexpected("field selection", "map", &other)),
            },
            Expr::Index {
                ref target,
                ref index,
            } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_into(target, index)
            }
            Expr::Has {
                ref target,
                ref field,
            } => match self.eval(target)? {
                Value::Map(map) => Ok(Value::Bool(map.contains_key(field))),
                other => Err(unexpected("has()", "map", &other)),
            },
            Expr::Unary { op, ref operand } => {
                let operand = self.eval(operand)?;
                match (op, operand) {
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnaryOp::Neg, Value::Int(i)) => {
                        i.checked_neg().map(Value::Int).ok_or(EvalError::Overflow)
                    }
                    (UnaryOp::Neg, Value::Double(d)) => Ok(Value::Double(-d)),
                    (UnaryOp::Not, other) => Err(unexpected("'!'", "bool", &other)),
                    (UnaryOp::Neg, other) => Err(unexpected("unary '-'", "int or double", &other)),
                }
            }
            Expr::Binary {
                op,
                ref lhs,
                ref rhs,
            } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(op, lhs, rhs)
            }
            Expr::And(ref lhs, ref rhs) => {
                if !self.eval_bool(lhs, "'&&'")? {
                    return Ok(Value::Bool(false));
                }
                self.eval_bool(rhs, "'&&'").map(Value::Bool)
            }
            Expr::Or(ref lhs, ref rhs) => {
                if self.eval_bool(lhs, "'||'")? {
                    return Ok(Value::Bool(true));
                }
                self.eval_bool(rhs, "'||'").map(Value::Bool)
            }
            Expr::Ternary {
                ref cond,
                ref then,
                ref otherwise,
            } => {
                if self.eval_bool(cond, "conditional")? {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Call { function, ref arg } => {
                let arg = self.eval(arg)?;
                call(function, arg)
            }
            Expr::Method {
                ref target,
                method,
                ref args,
            } => {
                let target = self.eval(target)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                call_method(method, target, &args)
            }
            Expr::Matches {
                ref target,
                ref regex,
            } => match self.eval(target)? {
                Value::String(s) => Ok(Value::Bool(regex.is_match(&s))),
                other => Err(unexpected("matches()", "string", &other)),
            },
            Expr::Comprehension {
                kind,
                ref range,
                ref var,
                ref body,
            } => {
                let items = match self.eval(range)? {
                    Value::List(items) => items,
                    Value::Map(map) => map.into_keys().map(Value::String).collect(),
                    other => return Err(unexpected("comprehension", "list or map", &other)),
                };
                self.comprehension(kind, items, var, body)
            }
        }
    }

    fn comprehension(
        &mut self,
        kind: Comprehension,
        items: Vec<Value>,
        var: &str,
        body: &Expr,
    ) -> Result<Value, EvalError> {
        let mut mapped = Vec::new();
        for item in items {
            self.charge()?;
            self.locals.push((var.to_owned(), item));
            let result = match kind {
                Comprehension::Map => self.eval(body),
                Comprehension::Filter | Comprehension::Exists | Comprehension::All => self
                    .eval_bool(body, "comprehension predicate")
                    .map(Value::Bool),
            };
            let item = self.locals.pop().map_or(Value::Null, |(_, item)| item);
            match (kind, result?) {
                (Comprehension::Map, value) => mapped.push(value),
                (Comprehension::Filter, Value::Bool(true)) => mapped.push(item),
                (Comprehension::Exists, Value::Bool(true)) => return Ok(Value::Bool(true)),
                (Comprehension::All, Value::Bool(false)) => return Ok(Value::Bool(false)),
                _ => {}
            }
        }
        Ok(match kind {
            Comprehension::Map | Comprehension::Filter => Value::List(mapped),
            Comprehension::Exists => Value::Bool(false),
            Comprehension::All => Value::Bool(true),
        })
    }
}

fn unexpected(context: &'static str, expected: &'static str, found: &Value) -> EvalError {
    EvalError::UnexpectedType {
        context,
        expected,
        found: found.type_name(),
    }
}

fn invalid_operands(op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalError {
    EvalError::InvalidOperands {
        op: op.symbol(),
        lhs: lhs.type_name(),
        rhs: rhs.type_name(),
    }
}

const fn as_double(value: &Value) -> Option<f64> {
    match *value {
        Value::Int(i) => Some(int_to_double(i)),
        Value::Double(d) => Some(d),
        _ => None,
    }
}

fn length(value: &Value, context: &'static str) -> Result<Value, EvalError> {
    let len = match *value {
        Value::String(ref s) => s.chars().count(),
        Value::List(ref items) => items.len(),
        Value::Map(ref map) => map.len(),
        ref other => return Err(unexpected(context, "string, list or map", other)),
    };
    Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
}

fn index_into(target: Value, index: Value) -> Result<Value, EvalError> {
    match (target, index) {
        (Value::List(mut items), Value::Int(i)) => {
            let len = items.len();
            usize::try_from(i)
                .ok()
                .filter(|&idx| idx < len)
                .map(|idx| items.swap_remove(idx))
                .ok_or(EvalError::IndexOutOfBounds { index: i, len })
        }
        (Value::Map(mut map), Value::String(key)) => {
            map.remove(&key).ok_or(EvalError::NoSuchKey(key))
        }
        (target @ (Value::List(_) | Value::Map(_)), index) => Err(EvalError::InvalidOperands {
            op: "[]",
            lhs: target.type_name(),
            rhs: index.type_name(),
        }),
        (other, _) => Err(unexpected("indexing", "list or map", &other)),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    use BinaryOp as B;
    match op {
        B::Eq => Ok(Value::Bool(lhs.loose_eq(&rhs))),
        B::Ne => Ok(Value::Bool(!lhs.loose_eq(&rhs))),
        B::In => match rhs {
            Value::List(ref items) => Ok(Value::Bool(items.iter().any(|item| item.loose_eq(&lhs)))),
            Value::Map(ref map) => match lhs {
                Value::String(ref key) => Ok(Value::Bool(map.contains_key(key))),
                _ => Err(invalid_operands(op, &lhs, &rhs)),
            },
            _ => Err(invalid_operands(op, &lhs, &rhs)),
        },
        B::Lt | B::Le | B::Gt | B::Ge => compare(op, &lhs, &rhs),
        B::Add | B::Sub | B::Mul | B::Div | B::Rem => arithmetic(op, lhs, rhs),
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let ordering = match (lhs, rhs) {
        (&Value::Int(a), &Value::Int(b)) => a.cmp(&b),
        (&Value::String(ref a), &Value::String(ref b)) => a.cmp(b),
        (&Value::Bool(a), &Value::Bool(b)) => a.cmp(&b),
        _ => as_double(lhs)
            .zip(as_double(rhs))
            .and_then(|(a, b)| a.partial_cmp(&b))
            .ok_or_else(|| invalid_operands(op, lhs, rhs))?,
    };
    Ok(Value::Bool(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    }))
}

fn arithmetic(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    use BinaryOp as B;
    match (op, lhs, rhs) {
        (B::Add, Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
        (B::Add, Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (B::Div | B::Rem, Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
        (_, Value::Int(a), Value::Int(b)) => {
            let result = match op {
                B::Add => a.checked_add(b),
                B::Sub => a.checked_sub(b),
                B::Mul => a.checked_mul(b),
                B::Div => a.checked_div(b),
                _ => a.checked_rem(b),
            };
            result.map(Value::Int).ok_or(EvalError::Overflow)
        }
        (_, lhs, rhs) => {
            let (Some(a), Some(b)) = (as_double(&lhs), as_double(&rhs)) else {
                return Err(invalid_operands(op, &lhs, &rhs));
            };
            Ok(Value::Double(match op {
                B::Add => a + b,
                B::Sub => a - b,
                B::Mul => a * b,
                B::Div => a / b,
                _ => a % b,
            }))
        }
    }
}

fn call(function: Function, arg: Value) -> Result<Value, EvalError> {
    match function {
        Function::Size => length(&arg, "size()"),
        Function::String => match arg {
            Value::String(_) => Ok(arg),
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Double(_) => {
                Ok(Value::String(arg.to_string()))
            }
            other => Err(unexpected("string()", "scalar", &other)),
        },
        Function::Int => match arg {
            Value::Int(_) => Ok(arg),
            Value::Double(d) => double_to_int(d),
            Value::String(ref s) => s
                .trim()
                .parse()
                .map(Value::Int)
                .map_err(|_| EvalError::InvalidConversion(format!("cannot convert '{s}' to int"))),
            other => Err(unexpected("int()", "int, double or string", &other)),
        },
        Function::Lower => match arg {
            Value::String(s) => Ok(Value::String(s.to_lowercase())),
            other => Err(unexpected("lower()", "string", &other)),
        },
    }
}

fn double_to_int(d: f64) -> Result<Value, EvalError> {
    let truncated = d.trunc();
    if !truncated.is_finite() || truncated < int_to_double(i64::MIN) || truncated >= int_to_double(i64::MAX) {
        return Err(EvalError::InvalidConversion(format!("{d} is out of int range")));
    }
    #[expect(clippy::cast_possible_truncation, reason = "range checked above")]
    let i = truncated as i64;
    Ok(Value::Int(i))
}

fn call_method(method: Method, target: Value, args: &[Value]) -> Result<Value, EvalError> {
    match method {
        Method::Size => length(&target, "size()"),
        Method::Join => {
            let Value::List(items) = target else {
                return Err(unexpected("join()", "list", &target));
            };
            let separator = match args.first() {
                None => "",
                Some(&Value::String(ref sep)) => sep.as_str(),
                Some(other) => return Err(unexpected("join() separator", "string", other)),
            };
            let parts = items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(unexpected("join() element", "string", &other)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::String(parts.join(separator)))
        }
        Method::StartsWith
        | Method::EndsWith
        | Method::Contains
        | Method::LowerAscii
        | Method::UpperAscii
        | Method::Trim
        | Method::Split => {
            let Value::String(s) = target else {
                return Err(unexpected("string method", "string", &target));
            };
            string_method(method, &s, args)
        }
    }
}

fn string_method(method: Method, s: &str, args: &[Value]) -> Result<Value, EvalError> {
    let string_arg = || match args.first() {
        Some(&Value::String(ref a)) => Ok(a.as_str()),
        Some(other) => Err(unexpected("string method argument", "string", other)),
        None => Err(EvalError::InvalidConversion("missing argument".to_owned())),
    };
    Ok(match method {
        Method::StartsWith => Value::Bool(s.starts_with(string_arg()?)),
        Method::EndsWith => Value::Bool(s.ends_with(string_arg()?)),
        Method::Contains => Value::Bool(s.contains(string_arg()?)),
        Method::LowerAscii => Value::String(s.to_ascii_lowercase()),
        Method::UpperAscii => Value::String(s.to_ascii_uppercase()),
        Method::Trim => Value::String(s.trim().to_owned()),
        Method::Split => Value::List(
            s.split(string_arg()?)
                .map(|part| Value::String(part.to_owned()))
                .collect(),
        ),
        Method::Join | Method::Size => unreachable!("dispatched by call_method"),
    })
}
