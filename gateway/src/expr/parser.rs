//! Recursive-descent parser producing the checked AST.
//!
//! Function and method names are resolved and arity-checked here, so a compiled
//! expression can only fail at evaluation time because of the data it sees.

use alloc::collections::BTreeSet;

use regex::{Regex, RegexBuilder};

use super::{
    CompileError,
    lexer::{Spanned, Token},
    value::Value,
};

/// Maximum nesting depth of sub-expressions.
pub(super) const MAX_DEPTH: usize = 64;

/// Upper bound for the compiled size of a `matches()` pattern.
const REGEX_SIZE_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

impl BinaryOp {
    pub(super) const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
        }
    }
}

/// Global functions, called as `f(x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Function {
    Size,
    String,
    Int,
    Lower,
}

/// Receiver-style functions, called as `x.f(...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Method {
    StartsWith,
    EndsWith,
    Contains,
    LowerAscii,
    UpperAscii,
    Trim,
    Split,
    Join,
    Size,
}

/// List comprehension macros, called as `list.m(var, body)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Comprehension {
    Map,
    Filter,
    Exists,
    All,
}

#[derive(Debug, Clone)]
pub(super) enum Expr {
    Literal(Value),
    Ident(String),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Member {
        target: Box<Expr>,
        field: String,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Has {
        target: Box<Expr>,
        field: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        function: Function,
        arg: Box<Expr>,
    },
    Method {
        target: Box<Expr>,
        method: Method,
        args: Vec<Expr>,
    },
    Matches {
        target: Box<Expr>,
        regex: Regex,
    },
    Comprehension {
        kind: Comprehension,
        range: Box<Expr>,
        var: String,
        body: Box<Expr>,
    },
}

impl Expr {
    /// Collects identifiers that are not bound by an enclosing comprehension.
    pub(super) fn free_identifiers(&self, bound: &mut Vec<String>, out: &mut BTreeSet<String>) {
        match *self {
            Self::Literal(_) => {}
            Self::Ident(ref name) => {
                if !bound.iter().any(|b| b == name) {
                    out.insert(name.clone());
                }
            }
            Self::List(ref items) => {
                for item in items {
                    item.free_identifiers(bound, out);
                }
            }
            Self::Map(ref entries) => {
                for &(ref k, ref v) in entries {
                    k.free_identifiers(bound, out);
                    v.free_identifiers(bound, out);
                }
            }
            Self::Member { ref target, .. }
            | Self::Has { ref target, .. }
            | Self::Matches { ref target, .. }
            | Self::Call { arg: ref target, .. }
            | Self::Unary {
                operand: ref target,
                ..
            } => target.free_identifiers(bound, out),
            Self::Index {
                ref target,
                ref index,
            } => {
                target.free_identifiers(bound, out);
                index.free_identifiers(bound, out);
            }
            Self::Binary {
                ref lhs, ref rhs, ..
            } => {
                lhs.free_identifiers(bound, out);
                rhs.free_identifiers(bound, out);
            }
            Self::And(ref lhs, ref rhs) | Self::Or(ref lhs, ref rhs) => {
                lhs.free_identifiers(bound, out);
                rhs.free_identifiers(bound, out);
            }
            Self::Ternary {
                ref cond,
                ref then,
                ref otherwise,
            } => {
                cond.free_identifiers(bound, out);
                then.free_identifiers(bound, out);
                otherwise.free_identifiers(bound, out);
            }
            Self::Method {
                ref target,
                ref args,
                ..
            } => {
                target.free_identifiers(bound, out);
                for arg in args {
                    arg.free_identifiers(bound, out);
                }
            }
            Self::Comprehension {
                ref range,
                ref var,
                ref body,
                ..
            } => {
                range.free_identifiers(bound, out);
                bound.push(var.clone());
                body.free_identifiers(bound, out);
                bound.pop();
            }
        }
    }
}

pub(super) fn parse(tokens: Vec<Spanned>) -> Result<Expr, CompileError> {
    let mut parser = Parser {
        tokens,
        cursor: 0,
        depth: 0,
    };
    let expr = parser.expression()?;
    let trailing = parser.peek();
    if trailing.token != Token::Eof {
        return Err(CompileError::new(
            trailing.pos,
            format!("unexpected trailing token {:?}", trailing.token),
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    depth: usize,
}

static EOF: Spanned = Spanned {
    token: Token::Eof,
    pos: 0,
};

impl Parser {
    fn peek(&self) -> &Spanned {
        self.tokens.get(self.cursor).unwrap_or(&EOF)
    }

    fn advance(&mut self) -> Spanned {
        let spanned = self.peek().clone();
        if spanned.token != Token::Eof {
            self.cursor += 1;
        }
        spanned
    }

    fn eat(&mut self, token: &Token) -> bool {
        if &self.peek().token == token {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), CompileError> {
        if self.eat(token) {
            Ok(())
        } else {
            let found = self.peek();
            Err(CompileError::new(
                found.pos,
                format!("expected {what}, found {:?}", found.token),
            ))
        }
    }

    fn enter(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CompileError::new(
                self.peek().pos,
                format!("expression nested deeper than {MAX_DEPTH} levels"),
            ));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr, CompileError> {
        self.enter()?;
        let result = self.ternary();
        self.depth -= 1;
        result
    }

    fn ternary(&mut self) -> Result<Expr, CompileError> {
        let cond = self.or()?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then = self.expression()?;
        self.expect(&Token::Colon, "':' in conditional")?;
        let otherwise = self.expression()?;
        Ok(Expr::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn or(&mut self) -> Result<Expr, CompileError> {
        let mark = self.depth;
        let mut lhs = self.and()?;
        while self.eat(&Token::OrOr) {
            self.enter()?;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, CompileError> {
        let mark = self.depth;
        let mut lhs = self.relation()?;
        while self.eat(&Token::AndAnd) {
            self.enter()?;
            let rhs = self.relation()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn relation(&mut self) -> Result<Expr, CompileError> {
        let mark = self.depth;
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek().token {
                Token::EqEq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::Ne,
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                Token::In => BinaryOp::In,
                _ => break,
            };
            self.advance();
            self.enter()?;
            let rhs = self.additive()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, CompileError> {
        let mark = self.depth;
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek().token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            self.enter()?;
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mark = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            self.enter()?;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        let op = match self.peek().token {
            Token::Bang => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary();
        self.depth -= 1;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn postfix(&mut self) -> Result<Expr, CompileError> {
        let mark = self.depth;
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                self.enter()?;
                let Spanned { token, pos } = self.advance();
                let Token::Ident(name) = token else {
                    return Err(CompileError::new(pos, "expected field or method name after '.'"));
                };
                expr = if self.eat(&Token::LParen) {
                    self.method_call(expr, &name, pos)?
                } else {
                    Expr::Member {
                        target: Box::new(expr),
                        field: name,
                    }
                };
            } else if self.eat(&Token::LBracket) {
                self.enter()?;
                let index = self.expression()?;
                self.expect(&Token::RBracket, "']'")?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                self.depth = mark;
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        let Spanned { token, pos } = self.advance();
        Ok(match token {
            Token::Int(i) => Expr::Literal(Value::Int(i)),
            Token::Double(d) => Expr::Literal(Value::Double(d)),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::True => Expr::Literal(Value::Bool(true)),
            Token::False => Expr::Literal(Value::Bool(false)),
            Token::Null => Expr::Literal(Value::Null),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    self.function_call(&name, pos)?
                } else {
                    Expr::Ident(name)
                }
            }
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(&Token::RParen, "')'")?;
                inner
            }
            Token::LBracket => Expr::List(self.sequence(&Token::RBracket)?),
            Token::LBrace => self.map_literal()?,
            other => {
                return Err(CompileError::new(pos, format!("unexpected token {other:?}")));
            }
        })
    }

    /// Parses comma separated expressions up to and including `close`.
    fn sequence(&mut self, close: &Token) -> Result<Vec<Expr>, CompileError> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expression()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(&Token::Comma, "',' or closing bracket")?;
        }
    }

    fn map_literal(&mut self) -> Result<Expr, CompileError> {
        let mut entries = Vec::new();
        if self.eat(&Token::RBrace) {
            return Ok(Expr::Map(entries));
        }
        loop {
            let key = self.expression()?;
            self.expect(&Token::Colon, "':' after map key")?;
            let value = self.expression()?;
            entries.push((key, value));
            if self.eat(&Token::RBrace) {
                return Ok(Expr::Map(entries));
            }
            self.expect(&Token::Comma, "',' or '}'")?;
        }
    }

    fn function_call(&mut self, name: &str, pos: usize) -> Result<Expr, CompileError> {
        if name == "has" {
            let arg = self.expression()?;
            self.expect(&Token::RParen, "')'")?;
            let Expr::Member { target, field } = arg else {
                return Err(CompileError::new(pos, "has() expects a field selection like has(a.b)"));
            };
            return Ok(Expr::Has { target, field });
        }
        let function = match name {
            "size" => Function::Size,
            "string" => Function::String,
            "int" => Function::Int,
            "lower" => Function::Lower,
            other => return Err(CompileError::new(pos, format!("unknown function '{other}'"))),
        };
        let mut args = self.sequence(&Token::RParen)?;
        if args.len() != 1 {
            return Err(CompileError::new(
                pos,
                format!("{name}() takes 1 argument, got {}", args.len()),
            ));
        }
        let arg = args.remove(0);
        Ok(Expr::Call {
            function,
            arg: Box::new(arg),
        })
    }

    fn method_call(&mut self, target: Expr, name: &str, pos: usize) -> Result<Expr, CompileError> {
        let comprehension = match name {
            "map" => Some(Comprehension::Map),
            "filter" => Some(Comprehension::Filter),
            "exists" => Some(Comprehension::Exists),
            "all" => Some(Comprehension::All),
            _ => None,
        };
        if let Some(kind) = comprehension {
            let Spanned { token, pos: var_pos } = self.advance();
            let Token::Ident(var) = token else {
                return Err(CompileError::new(
                    var_pos,
                    format!("{name}() expects a variable name as first argument"),
                ));
            };
            self.expect(&Token::Comma, "',' after comprehension variable")?;
            let body = self.expression()?;
            self.expect(&Token::RParen, "')'")?;
            return Ok(Expr::Comprehension {
                kind,
                range: Box::new(target),
                var,
                body: Box::new(body),
            });
        }

        let args = self.sequence(&Token::RParen)?;
        if name == "matches" {
            return match args.as_slice() {
                [Expr::Literal(Value::String(pattern))] => {
                    let regex = RegexBuilder::new(pattern)
                        .size_limit(REGEX_SIZE_LIMIT)
                        .build()
                        .map_err(|e| CompileError::new(pos, format!("invalid regex: {e}")))?;
                    Ok(Expr::Matches {
                        target: Box::new(target),
                        regex,
                    })
                }
                _ => Err(CompileError::new(
                    pos,
                    "matches() expects a single string literal pattern",
                )),
            };
        }

        let (method, min_args, max_args) = match name {
            "startsWith" => (Method::StartsWith, 1, 1),
            "endsWith" => (Method::EndsWith, 1, 1),
            "contains" => (Method::Contains, 1, 1),
            "lowerAscii" => (Method::LowerAscii, 0, 0),
            "upperAscii" => (Method::UpperAscii, 0, 0),
            "trim" => (Method::Trim, 0, 0),
            "split" => (Method::Split, 1, 1),
            "join" => (Method::Join, 0, 1),
            "size" => (Method::Size, 0, 0),
            other => return Err(CompileError::new(pos, format!("unknown method '{other}'"))),
        };
        if !(min_args..=max_args).contains(&args.len()) {
            return Err(CompileError::new(
                pos,
                format!("{name}() does not take {} argument(s)", args.len()),
            ));
        }
        Ok(Expr::Method {
            target: Box::new(target),
            method,
            args,
        })
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}
