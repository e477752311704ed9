//! Tokenizer for the expression language.

use core::{iter::Peekable, str::CharIndices};

use super::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Token {
    Int(i64),
    Double(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Dot,
    Comma,
    Colon,
    Question,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Eof,
}

/// A token together with the byte offset it starts at.
#[derive(Debug, Clone)]
pub(super) struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub(super) fn tokenize(src: &str) -> Result<Vec<Spanned>, CompileError> {
    let mut lexer = Lexer {
        src,
        chars: src.char_indices().peekable(),
    };
    let mut out = Vec::new();
    loop {
        let spanned = lexer.next_token()?;
        let done = spanned.token == Token::Eof;
        out.push(spanned);
        if done {
            return Ok(out);
        }
    }
}

struct Lexer<'src> {
    src: &'src str,
    chars: Peekable<CharIndices<'src>>,
}

impl Lexer<'_> {
    fn next_token(&mut self) -> Result<Spanned, CompileError> {
        while self.chars.next_if(|&(_, c)| c.is_whitespace()).is_some() {}

        let Some((pos, c)) = self.chars.next() else {
            return Ok(Spanned {
                token: Token::Eof,
                pos: self.src.len(),
            });
        };

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '.' => Token::Dot,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '?' => Token::Question,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '!' => self.with_eq(Token::NotEq, Token::Bang),
            '<' => self.with_eq(Token::Le, Token::Lt),
            '>' => self.with_eq(Token::Ge, Token::Gt),
            '=' => {
                if self.chars.next_if(|&(_, n)| n == '=').is_none() {
                    return Err(CompileError::new(pos, "expected '==', found '='"));
                }
                Token::EqEq
            }
            '&' => {
                if self.chars.next_if(|&(_, n)| n == '&').is_none() {
                    return Err(CompileError::new(pos, "expected '&&'"));
                }
                Token::AndAnd
            }
            '|' => {
                if self.chars.next_if(|&(_, n)| n == '|').is_none() {
                    return Err(CompileError::new(pos, "expected '||'"));
                }
                Token::OrOr
            }
            '\'' | '"' => self.string(pos, c)?,
            '0'..='9' => self.number(pos)?,
            c if c == '_' || c.is_ascii_alphabetic() => self.ident(pos),
            other => {
                return Err(CompileError::new(
                    pos,
                    format!("unexpected character '{other}'"),
                ));
            }
        };
        Ok(Spanned { token, pos })
    }

    fn with_eq(&mut self, with: Token, without: Token) -> Token {
        if self.chars.next_if(|&(_, n)| n == '=').is_some() {
            with
        } else {
            without
        }
    }

    fn string(&mut self, start: usize, quote: char) -> Result<Token, CompileError> {
        let mut out = String::new();
        loop {
            let Some((pos, c)) = self.chars.next() else {
                return Err(CompileError::new(start, "unterminated string literal"));
            };
            match c {
                c if c == quote => return Ok(Token::Str(out)),
                '\\' => {
                    let escaped = match self.chars.next() {
                        Some((_, 'n')) => '\n',
                        Some((_, 't')) => '\t',
                        Some((_, 'r')) => '\r',
                        Some((_, '\\')) => '\\',
                        Some((_, '\'')) => '\'',
                        Some((_, '"')) => '"',
                        _ => return Err(CompileError::new(pos, "invalid escape sequence")),
                    };
                    out.push(escaped);
                }
                c => out.push(c),
            }
        }
    }

    fn number(&mut self, start: usize) -> Result<Token, CompileError> {
        let mut end = start + 1;
        let mut is_double = false;
        while let Some(&(pos, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                end = pos + 1;
                self.chars.next();
            } else if c == '.' && !is_double && self.digit_follows(pos) {
                is_double = true;
                end = pos + 1;
                self.chars.next();
            } else {
                break;
            }
        }
        let text = self.src.get(start..end).unwrap_or_default();
        if is_double {
            text.parse()
                .map(Token::Double)
                .map_err(|_| CompileError::new(start, format!("invalid number '{text}'")))
        } else {
            text.parse()
                .map(Token::Int)
                .map_err(|_| CompileError::new(start, format!("integer literal '{text}' out of range")))
        }
    }

    /// Whether the character after the `.` at `dot` is a digit, so `1.5` lexes
    /// as a double while `x.size()` style member access is left alone.
    fn digit_follows(&self, dot: usize) -> bool {
        self.src
            .get(dot + 1..)
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_ascii_digit())
    }

    fn ident(&mut self, start: usize) -> Token {
        let mut end = start + 1;
        while let Some((pos, _)) = self
            .chars
            .next_if(|&(_, c)| c == '_' || c.is_ascii_alphanumeric())
        {
            end = pos + 1;
        }
        match self.src.get(start..end).unwrap_or_default() {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "in" => Token::In,
            word => Token::Ident(word.to_owned()),
        }
    }
}
