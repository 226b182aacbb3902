//! Scanner for Tern source code.
//!
//! Produces tokens lazily: each `next_token` call consumes just enough input
//! for one token. Problems become `TokenKind::Error` tokens rather than
//! failures, leaving diagnostics to the compiler.

use crate::lexer::token::{Token, TokenKind};
use crate::span::Span;

/// The scanner transforms source code into a stream of tokens.
pub struct Scanner<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_pos: usize,
    line: usize,
    column: usize,
    start_pos: usize,
    start_line: usize,
    start_column: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_pos: 0,
            line: 1,
            column: 1,
            start_pos: 0,
            start_line: 1,
            start_column: 1,
        }
    }

    /// Scan the next token. Returns an `Eof` token forever once the source
    /// is exhausted.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();
        self.mark_start();

        let Some((_, c)) = self.advance() else {
            return Token::eof(self.current_pos, self.line, self.column);
        };

        match c {
            '(' => self.make_token(TokenKind::LeftParen),
            ')' => self.make_token(TokenKind::RightParen),
            '{' => self.make_token(TokenKind::LeftBrace),
            '}' => self.make_token(TokenKind::RightBrace),
            '[' => self.make_token(TokenKind::LeftBracket),
            ']' => self.make_token(TokenKind::RightBracket),
            ',' => self.make_token(TokenKind::Comma),
            ':' => self.make_token(TokenKind::Colon),
            '+' => self.make_token(TokenKind::Plus),
            '-' => self.make_token(TokenKind::Minus),
            '*' => self.make_token(TokenKind::Star),
            '/' => self.make_token(TokenKind::Slash),
            '%' => self.make_token(TokenKind::Percent),
            '.' => {
                if self.match_char('.') {
                    if self.match_char('.') {
                        self.make_token(TokenKind::DotDotDot)
                    } else {
                        self.make_token(TokenKind::DotDot)
                    }
                } else {
                    self.make_token(TokenKind::Dot)
                }
            }
            '=' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::EqualEqual)
                } else {
                    self.make_token(TokenKind::Equal)
                }
            }
            '!' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::BangEqual)
                } else {
                    self.make_token(TokenKind::Bang)
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::LessEqual)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::GreaterEqual)
                } else {
                    self.make_token(TokenKind::Greater)
                }
            }
            '&' => {
                if self.match_char('&') {
                    self.make_token(TokenKind::AmpAmp)
                } else {
                    self.make_token(TokenKind::Amp)
                }
            }
            '|' => {
                if self.match_char('|') {
                    self.make_token(TokenKind::PipePipe)
                } else {
                    self.make_token(TokenKind::Pipe)
                }
            }
            '"' => self.scan_string(),
            c if c.is_ascii_digit() => self.scan_number(c),
            c if c.is_alphabetic() || c == '_' => self.scan_identifier(c),
            _ => self.error_token(format!("Unexpected character '{}'", c)),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r') => {
                    self.advance();
                }
                Some('\n') => {
                    self.advance();
                    self.line += 1;
                    self.column = 1;
                }
                Some('/') => {
                    if self.peek_next() == Some('/') {
                        while self.peek().is_some() && self.peek() != Some('\n') {
                            self.advance();
                        }
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    fn scan_string(&mut self) -> Token {
        let mut value = String::new();

        loop {
            match self.peek() {
                None | Some('\n') => {
                    return self.error_token("Unterminated string".to_string());
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.peek() {
                        Some('n') => {
                            self.advance();
                            value.push('\n');
                        }
                        Some('t') => {
                            self.advance();
                            value.push('\t');
                        }
                        Some('r') => {
                            self.advance();
                            value.push('\r');
                        }
                        Some('\\') => {
                            self.advance();
                            value.push('\\');
                        }
                        Some('"') => {
                            self.advance();
                            value.push('"');
                        }
                        Some('0') => {
                            self.advance();
                            value.push('\0');
                        }
                        Some('a') => {
                            self.advance();
                            value.push('\x07');
                        }
                        Some('b') => {
                            self.advance();
                            value.push('\x08');
                        }
                        Some('f') => {
                            self.advance();
                            value.push('\x0c');
                        }
                        Some('v') => {
                            self.advance();
                            value.push('\x0b');
                        }
                        Some(c) => {
                            return self.error_token(format!("Invalid escape sequence '\\{}'", c));
                        }
                        None => {
                            return self.error_token("Unterminated string".to_string());
                        }
                    }
                }
                Some(c) => {
                    self.advance();
                    value.push(c);
                }
            }
        }

        self.make_token(TokenKind::StringLiteral(value))
    }

    fn scan_number(&mut self, first: char) -> Token {
        let mut value = String::from(first);
        let mut is_decimal = false;

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                value.push(c);
                self.advance();
            } else if c == '.' && !is_decimal {
                // Only a digit after the dot makes this a decimal point;
                // otherwise it is a method call or range operator.
                match self.peek_next() {
                    Some(next) if next.is_ascii_digit() => {
                        is_decimal = true;
                        value.push(c);
                        self.advance();
                    }
                    _ => break,
                }
            } else {
                break;
            }
        }

        match value.parse::<f64>() {
            Ok(n) => self.make_token(TokenKind::NumLiteral(n)),
            Err(_) => self.error_token(format!("Invalid number '{}'", value)),
        }
    }

    fn scan_identifier(&mut self, first: char) -> Token {
        let mut value = String::from(first);

        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                value.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let kind = if value.starts_with("__") {
            TokenKind::StaticField(value)
        } else if value.starts_with('_') {
            TokenKind::Field(value)
        } else {
            TokenKind::keyword(&value).unwrap_or(TokenKind::Identifier(value))
        };
        self.make_token(kind)
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        if let Some((pos, c)) = self.chars.next() {
            self.current_pos = pos + c.len_utf8();
            self.column += 1;
            Some((pos, c))
        } else {
            None
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_next(&self) -> Option<char> {
        let mut iter = self.source[self.current_pos..].chars();
        iter.next();
        iter.next()
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn mark_start(&mut self) {
        self.start_pos = self.current_pos;
        self.start_line = self.line;
        self.start_column = self.column;
    }

    fn current_span(&self) -> Span {
        Span::new(
            self.start_pos,
            self.current_pos,
            self.start_line,
            self.start_column,
        )
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.current_span())
    }

    fn error_token(&self, message: String) -> Token {
        Token::new(TokenKind::Error(message), self.current_span())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = scanner.next_token();
            let is_eof = token.kind == TokenKind::Eof;
            kinds.push(token.kind);
            if is_eof {
                break;
            }
        }
        kinds
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            scan("(){}"),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            scan("42 3.14"),
            vec![
                TokenKind::NumLiteral(42.0),
                TokenKind::NumLiteral(3.14),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_number_dot_method() {
        // 1.abs is a method call on 1, not the decimal 1.<abs>
        assert_eq!(
            scan("1.abs"),
            vec![
                TokenKind::NumLiteral(1.0),
                TokenKind::Dot,
                TokenKind::Identifier("abs".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string() {
        assert_eq!(
            scan(r#""hello""#),
            vec![
                TokenKind::StringLiteral("hello".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            scan(r#""a\n\t\0\a\b\f\v\"\\""#),
            vec![
                TokenKind::StringLiteral("a\n\t\0\x07\x08\x0c\x0b\"\\".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string_is_error_token() {
        let kinds = scan("\"oops");
        assert!(matches!(&kinds[0], TokenKind::Error(msg) if msg.contains("Unterminated")));
        assert_eq!(kinds[1], TokenKind::Eof);
    }

    #[test]
    fn test_unknown_character_is_error_token() {
        let kinds = scan("@ 1");
        assert!(matches!(&kinds[0], TokenKind::Error(_)));
        // The scanner keeps going after an error token.
        assert_eq!(kinds[1], TokenKind::NumLiteral(1.0));
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            scan("class var fn fun if else is nil while"),
            vec![
                TokenKind::Class,
                TokenKind::Var,
                TokenKind::Fn,
                TokenKind::Fun,
                TokenKind::If,
                TokenKind::Else,
                TokenKind::Is,
                TokenKind::Nil,
                TokenKind::While,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_fields() {
        assert_eq!(
            scan("_n __count plain"),
            vec![
                TokenKind::Field("_n".to_string()),
                TokenKind::StaticField("__count".to_string()),
                TokenKind::Identifier("plain".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            scan("+ - * / % == != <= >= && || .. ..."),
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::DotDot,
                TokenKind::DotDotDot,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            scan("1 // comment\n2"),
            vec![
                TokenKind::NumLiteral(1.0),
                TokenKind::NumLiteral(2.0),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_line_numbers() {
        let mut scanner = Scanner::new("1\n2\n\n3");
        assert_eq!(scanner.next_token().line(), 1);
        assert_eq!(scanner.next_token().line(), 2);
        assert_eq!(scanner.next_token().line(), 4);
    }

    #[test]
    fn test_eof_is_sticky() {
        let mut scanner = Scanner::new("");
        assert_eq!(scanner.next_token().kind, TokenKind::Eof);
        assert_eq!(scanner.next_token().kind, TokenKind::Eof);
    }
}
