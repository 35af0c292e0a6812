//! Tokenizer for the selector dialect.

use crate::error::{SelectorError, SelectorResult};

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    True,
    False,
    Null,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Or,
    And,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Minus,
}

/// Tokenize a selector source string.
///
/// `i` always sits on a char boundary; string literals may carry
/// arbitrary (multi-byte) UTF-8.
pub fn tokenize(input: &str) -> SelectorResult<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(c) = input[i..].chars().next() {
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(lex_err(i, "expected '||'"));
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(lex_err(i, "expected '&&'"));
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(lex_err(i, "expected '=='"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let (s, next) = lex_string(input, i, c)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            c if c.is_ascii_digit() => {
                let (tok, next) = lex_number(input, i)?;
                tokens.push(tok);
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = &input[start..i];
                tokens.push(match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "in" => Token::In,
                    _ => Token::Ident(word.to_string()),
                });
            }
            other => return Err(lex_err(i, &format!("unexpected character {other:?}"))),
        }
    }

    Ok(tokens)
}

fn lex_err(offset: usize, message: &str) -> SelectorError {
    SelectorError::Lex {
        offset,
        message: message.to_string(),
    }
}

fn lex_string(input: &str, start: usize, quote: char) -> SelectorResult<(String, usize)> {
    let mut out = String::new();
    let mut i = start + 1;
    while let Some(c) = input[i..].chars().next() {
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            let next = input[i + 1..]
                .chars()
                .next()
                .ok_or_else(|| lex_err(i, "dangling escape"))?;
            out.push(match next {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '\\' => '\\',
                '"' => '"',
                '\'' => '\'',
                other => return Err(lex_err(i, &format!("unknown escape \\{other}"))),
            });
            i += 1 + next.len_utf8();
        } else {
            out.push(c);
            i += c.len_utf8();
        }
    }
    Err(lex_err(start, "unterminated string"))
}

fn lex_number(input: &str, start: usize) -> SelectorResult<(Token, usize)> {
    let bytes = input.as_bytes();
    let mut i = start;
    let mut is_float = false;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            i += 1;
        } else if bytes[i] == b'.'
            && !is_float
            && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit())
        {
            is_float = true;
            i += 1;
        } else {
            break;
        }
    }
    let text = &input[start..i];
    let token = if is_float {
        Token::Float(
            text.parse()
                .map_err(|_| lex_err(start, "invalid float literal"))?,
        )
    } else {
        Token::Int(
            text.parse()
                .map_err(|_| lex_err(start, "invalid int literal"))?,
        )
    };
    Ok((token, i))
}
