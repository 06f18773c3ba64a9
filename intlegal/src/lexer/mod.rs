//! Lexer implementation using logos

mod token;

pub use token::Token;

use crate::error::{CompileError, Result};
use crate::span::Span;
use logos::Logos;

/// Tokenize IR text
pub fn tokenize(source: &str) -> Result<Vec<(Token, Span)>> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);

    while let Some(result) = lexer.next() {
        let span = Span::from(lexer.span());
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(_) => {
                return Err(CompileError::lexer(
                    format!("unexpected character: {:?}", lexer.slice()),
                    span,
                ));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_tokenize_empty() {
        assert!(tokenize("").unwrap().is_empty());
        assert!(tokenize("; only a comment\n").unwrap().is_empty());
    }

    #[test]
    fn test_tokenize_header() {
        assert_eq!(
            kinds("fn @f(i8 %a) -> i8 {"),
            vec![
                Token::Fn,
                Token::Global("f".into()),
                Token::LParen,
                Token::Ident("i8".into()),
                Token::Local("a".into()),
                Token::RParen,
                Token::Arrow,
                Token::Ident("i8".into()),
                Token::LBrace,
            ]
        );
    }

    #[test]
    fn test_tokenize_negative_integer_and_vector_type() {
        assert_eq!(
            kinds("<4 x i8> -128"),
            vec![
                Token::Lt,
                Token::Int(4),
                Token::Ident("x".into()),
                Token::Ident("i8".into()),
                Token::Gt,
                Token::Int(-128),
            ]
        );
    }

    #[test]
    fn test_tokenize_dotted_local() {
        assert_eq!(kinds("%s.1"), vec![Token::Local("s.1".into())]);
    }

    #[test]
    fn test_tokenize_error_span() {
        let err = tokenize("add $").unwrap_err();
        assert_eq!(err.span(), Some(Span::new(4, 5)));
    }
}
