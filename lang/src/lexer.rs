//! Tokenizer for snippet source, built on `logos`.

use std::fmt;

use logos::Logos;

use crate::diagnostic::{Diagnostic, SourceMap, Span};

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
pub enum Token {
    #[token("let")]
    Let,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("return")]
    Return,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| unescape(lex.slice()))]
    Str(String),
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    LtEq,
    #[token(">")]
    Gt,
    #[token(">=")]
    GtEq,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
    #[token("=")]
    Assign,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(".")]
    Dot,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::Float(v) => return write!(f, "number `{v}`"),
            Token::Int(v) => return write!(f, "number `{v}`"),
            Token::Str(s) => return write!(f, "string {s:?}"),
            Token::Ident(name) => return write!(f, "identifier `{name}`"),
            Token::Let => "let",
            Token::If => "if",
            Token::Else => "else",
            Token::While => "while",
            Token::For => "for",
            Token::In => "in",
            Token::Return => "return",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::True => "true",
            Token::False => "false",
            Token::Null => "null",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Lt => "<",
            Token::LtEq => "<=",
            Token::Gt => ">",
            Token::GtEq => ">=",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Bang => "!",
            Token::Assign => "=",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Semi => ";",
            Token::Dot => ".",
        };
        write!(f, "`{text}`")
    }
}

/// A token with its start position.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

/// Tokenize `source`, stopping at the first invalid character sequence.
///
/// Returns the tokens plus the position just past the input, used by the
/// parser to report unexpected end of input.
pub fn tokenize(source: &str) -> Result<(Vec<Spanned>, Span), Diagnostic> {
    let map = SourceMap::new(source);
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);
    while let Some(result) = lexer.next() {
        let span = map.span(lexer.span().start);
        match result {
            Ok(token) => tokens.push(Spanned { token, span }),
            Err(()) => {
                return Err(Diagnostic::error(
                    Some(span),
                    format!("invalid token `{}`", lexer.slice()),
                ));
            }
        }
    }
    Ok((tokens, map.span(source.len())))
}

fn unescape(raw: &str) -> Option<String> {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .expect("tokenize")
            .0
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn keywords_win_over_identifiers() {
        assert_eq!(
            kinds("let letter = in;"),
            vec![
                Token::Let,
                Token::Ident("letter".to_string()),
                Token::Assign,
                Token::In,
                Token::Semi,
            ]
        );
    }

    #[test]
    fn numbers_and_strings() {
        assert_eq!(
            kinds(r#"12 3.5 "a\"b\n""#),
            vec![
                Token::Int(12),
                Token::Float(3.5),
                Token::Str("a\"b\n".to_string()),
            ]
        );
    }

    #[test]
    fn comments_are_skipped_and_positions_tracked() {
        let (tokens, end) = tokenize("// header\n  row.foo").expect("tokenize");
        assert_eq!(tokens[0].span, Span { line: 2, column: 3 });
        assert_eq!(tokens[1].token, Token::Dot);
        assert_eq!(end, Span { line: 2, column: 10 });
    }

    #[test]
    fn invalid_character_is_an_error() {
        let err = tokenize("let x = 1 # 2;").unwrap_err();
        assert!(err.is_error());
        assert_eq!(err.span, Some(Span { line: 1, column: 11 }));
        assert!(err.message.contains('#'));
    }

    #[test]
    fn bad_escape_is_an_error() {
        assert!(tokenize(r#""\q""#).is_err());
    }
}
