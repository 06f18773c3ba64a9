//! Token definitions

use logos::Logos;

/// Token of the textual IR
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
#[logos(skip r";[^\n]*")]
pub enum Token {
    #[token("fn")]
    Fn,

    // Symbols
    #[token("->")]
    Arrow,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Eq,

    // Literals
    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i128>().ok(), priority = 3)]
    Int(i128),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        Some(s[1..s.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\"))
    })]
    Str(String),

    /// `%name`: value or block reference
    #[regex(r"%[A-Za-z0-9_.]+", |lex| lex.slice()[1..].to_string())]
    Local(String),

    /// `@name`: function reference
    #[regex(r"@[A-Za-z0-9_.]+", |lex| lex.slice()[1..].to_string())]
    Global(String),

    /// Mnemonics, type names, keywords and block labels
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_.]*", |lex| lex.slice().to_string(), priority = 1)]
    Ident(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Fn => write!(f, "fn"),
            Token::Arrow => write!(f, "->"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Eq => write!(f, "="),
            Token::Int(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::Local(s) => write!(f, "%{s}"),
            Token::Global(s) => write!(f, "@{s}"),
            Token::Ident(s) => write!(f, "{s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_round_trips_symbols() {
        for src in ["->", "{", "}", "(", ")", "[", "]", "<", ">", ",", ":", "="] {
            let mut lex = Token::lexer(src);
            let tok = lex.next().unwrap().unwrap();
            assert_eq!(tok.to_string(), src);
        }
    }

    #[test]
    fn test_lex_string_escape() {
        let mut lex = Token::lexer(r#""a\"b""#);
        assert_eq!(lex.next(), Some(Ok(Token::Str("a\"b".to_string()))));
    }

    #[test]
    fn test_ident_with_dots() {
        let mut lex = Token::lexer("subgroup.scan.exclusive.imax");
        assert_eq!(
            lex.next(),
            Some(Ok(Token::Ident("subgroup.scan.exclusive.imax".to_string())))
        );
    }
}
