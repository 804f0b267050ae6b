use strum_macros::{Display, EnumString};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Colon,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    Newline,

    // One or two character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Literals.
    Identifier,
    String,
    Number,

    // Keywords.
    And,
    Await,
    Break,
    Class,
    Continue,
    Coroutine,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Return,
    True,
    Var,
    While,
    Yield,

    Error,
    Eof,
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf::phf_map! {
    "and" => TokenType::And,
    "await" => TokenType::Await,
    "break" => TokenType::Break,
    "class" => TokenType::Class,
    "continue" => TokenType::Continue,
    "coroutine" => TokenType::Coroutine,
    "else" => TokenType::Else,
    "false" => TokenType::False,
    "for" => TokenType::For,
    "fun" => TokenType::Fun,
    "if" => TokenType::If,
    "nil" => TokenType::Nil,
    "or" => TokenType::Or,
    "return" => TokenType::Return,
    "true" => TokenType::True,
    "var" => TokenType::Var,
    "while" => TokenType::While,
    "yield" => TokenType::Yield,
};

#[derive(Debug, Clone, Copy)]
pub struct Token<'a> {
    pub token_type: TokenType,
    pub value: &'a str,
    pub line: usize,
}

impl<'a> Token<'a> {
    pub fn synthetic(token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            value: "",
            line: 0,
        }
    }
}

pub struct Scanner<'a> {
    source: &'a str,
    start: usize,
    current: usize,
    line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.token(TokenType::Eof);
        }

        let c = self.advance();
        match c {
            b'(' => self.token(TokenType::LeftParen),
            b')' => self.token(TokenType::RightParen),
            b'{' => self.token(TokenType::LeftBrace),
            b'}' => self.token(TokenType::RightBrace),
            b'[' => self.token(TokenType::LeftBracket),
            b']' => self.token(TokenType::RightBracket),
            b',' => self.token(TokenType::Comma),
            b'.' => self.token(TokenType::Dot),
            b':' => self.token(TokenType::Colon),
            b';' => self.token(TokenType::Semicolon),
            b'-' => self.token(TokenType::Minus),
            b'+' => self.token(TokenType::Plus),
            b'/' => self.token(TokenType::Slash),
            b'*' => self.token(TokenType::Star),
            b'\n' => {
                let token = self.token(TokenType::Newline);
                self.line += 1;
                token
            }
            b'!' => {
                let token_type = if self.match_byte(b'=') {
                    TokenType::BangEqual
                } else {
                    TokenType::Bang
                };
                self.token(token_type)
            }
            b'=' => {
                let token_type = if self.match_byte(b'=') {
                    TokenType::EqualEqual
                } else {
                    TokenType::Equal
                };
                self.token(token_type)
            }
            b'<' => {
                let token_type = if self.match_byte(b'=') {
                    TokenType::LessEqual
                } else {
                    TokenType::Less
                };
                self.token(token_type)
            }
            b'>' => {
                let token_type = if self.match_byte(b'=') {
                    TokenType::GreaterEqual
                } else {
                    TokenType::Greater
                };
                self.token(token_type)
            }
            b'"' => self.string(),
            c if is_digit(c) => self.number(),
            c if is_alpha(c) => self.identifier(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let byte = self.source.as_bytes()[self.current];
        self.current += 1;
        byte
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            b'\0'
        } else {
            self.source.as_bytes()[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            b'\0'
        } else {
            self.source.as_bytes()[self.current + 1]
        }
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'/' if self.peek_next() == b'/' => {
                    while self.peek() != b'\n' && !self.is_at_end() {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token<'a> {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        self.advance();
        self.token(TokenType::String)
    }

    fn number(&mut self) -> Token<'a> {
        while is_digit(self.peek()) {
            self.advance();
        }

        if self.peek() == b'.' && is_digit(self.peek_next()) {
            self.advance();
            while is_digit(self.peek()) {
                self.advance();
            }
        }

        self.token(TokenType::Number)
    }

    fn identifier(&mut self) -> Token<'a> {
        while is_alpha(self.peek()) || is_digit(self.peek()) {
            self.advance();
        }

        let text = &self.source[self.start..self.current];
        let token_type = KEYWORDS
            .get(text)
            .copied()
            .unwrap_or(TokenType::Identifier);
        self.token(token_type)
    }

    fn token(&self, token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            value: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'a> {
        Token {
            token_type: TokenType::Error,
            value: message,
            line: self.line,
        }
    }
}

fn is_digit(byte: u8) -> bool {
    byte.is_ascii_digit()
}

fn is_alpha(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_types(source: &str) -> Vec<TokenType> {
        let mut scanner = Scanner::new(source);
        let mut types = Vec::new();
        loop {
            let token = scanner.scan_token();
            let done = token.token_type == TokenType::Eof;
            types.push(token.token_type);
            if done {
                break;
            }
        }
        types
    }

    #[test]
    fn scans_a_declaration() {
        assert_eq!(
            token_types("var answer = 42;"),
            vec![
                TokenType::Var,
                TokenType::Identifier,
                TokenType::Equal,
                TokenType::Number,
                TokenType::Semicolon,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn newlines_are_tokens() {
        assert_eq!(
            token_types("1\n2"),
            vec![
                TokenType::Number,
                TokenType::Newline,
                TokenType::Number,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn scans_coroutine_keywords() {
        assert_eq!(
            token_types("coroutine yield await break continue"),
            vec![
                TokenType::Coroutine,
                TokenType::Yield,
                TokenType::Await,
                TokenType::Break,
                TokenType::Continue,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn scans_aggregates_and_access() {
        assert_eq!(
            token_types("[1, 2][0].name"),
            vec![
                TokenType::LeftBracket,
                TokenType::Number,
                TokenType::Comma,
                TokenType::Number,
                TokenType::RightBracket,
                TokenType::LeftBracket,
                TokenType::Number,
                TokenType::RightBracket,
                TokenType::Dot,
                TokenType::Identifier,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn tracks_lines_through_strings() {
        let mut scanner = Scanner::new("\"a\nb\"\nnil");
        let string = scanner.scan_token();
        assert_eq!(string.token_type, TokenType::String);
        // The scanner reports the line the literal ends on.
        assert_eq!(string.line, 2);
        let newline = scanner.scan_token();
        assert_eq!(newline.token_type, TokenType::Newline);
        let nil = scanner.scan_token();
        assert_eq!(nil.token_type, TokenType::Nil);
        assert_eq!(nil.line, 3);
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(
            token_types("1 // ignored\n2"),
            vec![
                TokenType::Number,
                TokenType::Newline,
                TokenType::Number,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut scanner = Scanner::new("\"open");
        let token = scanner.scan_token();
        assert_eq!(token.token_type, TokenType::Error);
        assert_eq!(token.value, "Unterminated string.");
    }
}
