//! Expression language lexer.
//!
//! Produces typed tokens with 1-based character positions for error
//! reporting. Longest-match alternatives are tried in a fixed priority
//! order: text, timestamp, UUID, real, integer, operator, name. This order
//! matters: a timestamp literal must win over integer subtraction, and a
//! real literal over its integer prefix.

use crate::error::{Error, Result};
use crate::value::parse_timestamp;
use time::PrimitiveDateTime;
use uuid::Uuid;

/// A single lexed token.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Text(String),
    Timestamp(PrimitiveDateTime),
    Uuid(Uuid),
    Real(f64),
    Integer(i64),
    Boolean(bool),
    Name(String),
    Operator(String),
    End,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Text(_) => "text literal".to_string(),
            Token::Timestamp(_) => "timestamp literal".to_string(),
            Token::Uuid(_) => "uuid literal".to_string(),
            Token::Real(_) => "real literal".to_string(),
            Token::Integer(_) => "integer literal".to_string(),
            Token::Boolean(_) => "boolean literal".to_string(),
            Token::Name(name) => format!("\"{name}\""),
            Token::Operator(op) => format!("\"{op}\""),
            Token::End => "end of input".to_string(),
        }
    }
}

/// Lexer with one-token lookahead.
pub struct TokenStream {
    chars: Vec<char>,
    /// Start of the current token, 0-based.
    pub token_start: usize,
    end: usize,
    token: Token,
}

const MULTI_CHAR_OPERATORS: &[&str] = &["<=", ">=", "==", "!=", "~=", "not in"];
const SINGLE_CHAR_OPERATORS: &[char] = &[
    '*', '<', '>', '@', '(', ')', '[', ']', ',', '.', '+', '-', '/',
];

impl TokenStream {
    pub fn new(text: &str) -> Result<Self> {
        let mut stream = Self {
            chars: text.chars().collect(),
            token_start: 0,
            end: 0,
            token: Token::End,
        };
        stream.advance()?;
        Ok(stream)
    }

    /// The current token.
    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn at_end(&self) -> bool {
        self.token == Token::End
    }

    /// 1-based character position of the current token, for error messages.
    pub fn position(&self) -> usize {
        self.token_start + 1
    }

    pub fn error(&self, message: impl Into<String>) -> Error {
        Error::Expression(format!("char {}: {}", self.position(), message.into()))
    }

    /// Consume the current token and lex the next one.
    pub fn advance(&mut self) -> Result<Token> {
        let previous = std::mem::replace(&mut self.token, Token::End);
        self.token = self.next_token()?;
        Ok(previous)
    }

    /// Whether the current token is the given operator.
    pub fn is_operator(&self, operator: &str) -> bool {
        matches!(&self.token, Token::Operator(op) if op == operator)
    }

    /// Whether the current token is the given name.
    pub fn is_name(&self, name: &str) -> bool {
        matches!(&self.token, Token::Name(n) if n == name)
    }

    /// Consume the current token if it is the given operator.
    pub fn accept_operator(&mut self, operator: &str) -> Result<bool> {
        if self.is_operator(operator) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Consume the current token if it is the given name.
    pub fn accept_name(&mut self, name: &str) -> Result<bool> {
        if self.is_name(name) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Require the given operator.
    pub fn expect_operator(&mut self, operator: &str) -> Result<()> {
        if !self.accept_operator(operator)? {
            return Err(self.error(format!(
                "expected \"{operator}\", got {}",
                self.token.describe()
            )));
        }
        Ok(())
    }

    /// Require a name token and return it.
    pub fn expect_name(&mut self) -> Result<String> {
        match self.advance()? {
            Token::Name(name) => Ok(name),
            other => Err(self.error(format!("expected name, got {}", other.describe()))),
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        let mut pos = self.end;
        while pos < self.chars.len() && self.chars[pos].is_whitespace() {
            pos += 1;
        }
        self.token_start = pos;

        if pos == self.chars.len() {
            self.end = pos;
            return Ok(Token::End);
        }

        if let Some((token, end)) = self.lex_text(pos)? {
            self.end = end;
            return Ok(token);
        }
        if let Some((token, end)) = self.lex_timestamp(pos)? {
            self.end = end;
            return Ok(token);
        }
        if let Some((token, end)) = self.lex_uuid(pos) {
            self.end = end;
            return Ok(token);
        }
        if let Some((token, end)) = self.lex_number(pos)? {
            self.end = end;
            return Ok(token);
        }
        if let Some((token, end)) = self.lex_operator(pos) {
            self.end = end;
            return Ok(token);
        }
        if let Some((token, end)) = self.lex_name(pos) {
            self.end = end;
            return Ok(token);
        }

        let rest: String = self.chars[pos..].iter().collect();
        Err(self.error(format!("syntax error: \"{rest}\"")))
    }

    fn lex_text(&self, start: usize) -> Result<Option<(Token, usize)>> {
        if self.chars.get(start) != Some(&'"') {
            return Ok(None);
        }
        let mut text = String::new();
        let mut pos = start + 1;
        loop {
            match self.chars.get(pos) {
                None => {
                    return Err(Error::Expression(format!(
                        "char {}: unterminated text literal",
                        start + 1
                    )));
                }
                Some('"') => return Ok(Some((Token::Text(text), pos + 1))),
                Some('\\') => {
                    pos += 1;
                    let escaped = self.chars.get(pos).ok_or_else(|| {
                        Error::Expression(format!(
                            "char {}: unterminated text literal",
                            start + 1
                        ))
                    })?;
                    match escaped {
                        '"' => text.push('"'),
                        '\\' => text.push('\\'),
                        'n' => text.push('\n'),
                        'r' => text.push('\r'),
                        't' => text.push('\t'),
                        other => {
                            return Err(Error::Expression(format!(
                                "char {}: invalid escape sequence \"\\{other}\"",
                                pos + 1
                            )));
                        }
                    }
                    pos += 1;
                }
                Some(c) => {
                    text.push(*c);
                    pos += 1;
                }
            }
        }
    }

    fn digit_run(&self, start: usize, count: usize) -> bool {
        (0..count).all(|i| {
            self.chars
                .get(start + i)
                .is_some_and(|c| c.is_ascii_digit())
        })
    }

    fn lex_timestamp(&self, start: usize) -> Result<Option<(Token, usize)>> {
        // YYYY-MM-DD
        if !(self.digit_run(start, 4)
            && self.chars.get(start + 4) == Some(&'-')
            && self.digit_run(start + 5, 2)
            && self.chars.get(start + 7) == Some(&'-')
            && self.digit_run(start + 8, 2))
        {
            return Ok(None);
        }
        let mut end = start + 10;

        // optional THH:MM:SS
        if self.chars.get(end) == Some(&'T')
            && self.digit_run(end + 1, 2)
            && self.chars.get(end + 3) == Some(&':')
            && self.digit_run(end + 4, 2)
            && self.chars.get(end + 6) == Some(&':')
            && self.digit_run(end + 7, 2)
        {
            end += 9;
            // optional fraction of up to six digits
            if self.chars.get(end) == Some(&'.') {
                end += 1;
                let mut digits = 0;
                while digits < 6
                    && self
                        .chars
                        .get(end)
                        .is_some_and(|c| c.is_ascii_digit())
                {
                    end += 1;
                    digits += 1;
                }
            }
        }

        let literal: String = self.chars[start..end].iter().collect();
        let timestamp = parse_timestamp(&literal)
            .map_err(|_| {
                Error::Expression(format!(
                    "char {}: invalid timestamp: \"{literal}\"",
                    start + 1
                ))
            })?;
        Ok(Some((Token::Timestamp(timestamp), end)))
    }

    fn hex_run(&self, start: usize, count: usize) -> bool {
        (0..count).all(|i| {
            self.chars
                .get(start + i)
                .is_some_and(|c| c.is_ascii_hexdigit())
        })
    }

    fn lex_uuid(&self, start: usize) -> Option<(Token, usize)> {
        let groups = [8usize, 4, 4, 4, 12];
        let mut pos = start;
        for (index, len) in groups.iter().enumerate() {
            if !self.hex_run(pos, *len) {
                return None;
            }
            pos += len;
            if index < groups.len() - 1 {
                if self.chars.get(pos) != Some(&'-') {
                    return None;
                }
                pos += 1;
            }
        }
        let literal: String = self.chars[start..pos].iter().collect();
        let uuid = Uuid::parse_str(&literal).ok()?;
        Some((Token::Uuid(uuid), pos))
    }

    fn lex_number(&self, start: usize) -> Result<Option<(Token, usize)>> {
        if !self.chars[start].is_ascii_digit() {
            return Ok(None);
        }

        // radix-prefixed integers
        if self.chars[start] == '0' {
            if let Some(prefix) = self.chars.get(start + 1) {
                let radix = match prefix {
                    'x' => Some(16),
                    'o' => Some(8),
                    'b' => Some(2),
                    _ => None,
                };
                if let Some(radix) = radix {
                    let mut end = start + 2;
                    while self
                        .chars
                        .get(end)
                        .is_some_and(|c| c.is_digit(radix))
                    {
                        end += 1;
                    }
                    if end == start + 2 {
                        return Err(Error::Expression(format!(
                            "char {}: invalid integer literal",
                            start + 1
                        )));
                    }
                    let digits: String = self.chars[start + 2..end].iter().collect();
                    let value = i64::from_str_radix(&digits, radix).map_err(|_| {
                        Error::Expression(format!(
                            "char {}: integer literal out of range",
                            start + 1
                        ))
                    })?;
                    return Ok(Some((Token::Integer(value), end)));
                }
            }
        }

        let mut end = start;
        while self.chars.get(end).is_some_and(|c| c.is_ascii_digit()) {
            end += 1;
        }

        // fraction and/or exponent make it a real literal
        let mut is_real = false;
        if self.chars.get(end) == Some(&'.') {
            is_real = true;
            end += 1;
            while self.chars.get(end).is_some_and(|c| c.is_ascii_digit()) {
                end += 1;
            }
        }
        if matches!(self.chars.get(end), Some('e') | Some('E')) {
            let mut exp_end = end + 1;
            if matches!(self.chars.get(exp_end), Some('+') | Some('-')) {
                exp_end += 1;
            }
            if self
                .chars
                .get(exp_end)
                .is_some_and(|c| c.is_ascii_digit())
            {
                is_real = true;
                end = exp_end;
                while self.chars.get(end).is_some_and(|c| c.is_ascii_digit()) {
                    end += 1;
                }
            }
        }

        let literal: String = self.chars[start..end].iter().collect();
        if is_real {
            let value = literal.parse::<f64>().map_err(|_| {
                Error::Expression(format!("char {}: invalid real literal", start + 1))
            })?;
            Ok(Some((Token::Real(value), end)))
        } else {
            let value = literal.parse::<i64>().map_err(|_| {
                Error::Expression(format!(
                    "char {}: integer literal out of range",
                    start + 1
                ))
            })?;
            Ok(Some((Token::Integer(value), end)))
        }
    }

    fn lex_operator(&self, start: usize) -> Option<(Token, usize)> {
        for operator in MULTI_CHAR_OPERATORS {
            let candidate: Vec<char> = operator.chars().collect();
            if self.chars[start..]
                .iter()
                .take(candidate.len())
                .eq(candidate.iter())
                && self.chars[start..].len() >= candidate.len()
            {
                // "not in" must not swallow the name prefix of e.g. "not inner"
                if *operator == "not in"
                    && self
                        .chars
                        .get(start + candidate.len())
                        .is_some_and(|c| c.is_alphanumeric() || *c == '_')
                {
                    continue;
                }
                return Some((
                    Token::Operator(operator.to_string()),
                    start + candidate.len(),
                ));
            }
        }
        let c = self.chars[start];
        if SINGLE_CHAR_OPERATORS.contains(&c) {
            return Some((Token::Operator(c.to_string()), start + 1));
        }
        None
    }

    fn lex_name(&self, start: usize) -> Option<(Token, usize)> {
        if !self.chars[start].is_ascii_alphabetic() {
            return None;
        }
        let mut end = start + 1;
        while self
            .chars
            .get(end)
            .is_some_and(|c| c.is_alphanumeric() || *c == '_')
        {
            end += 1;
        }
        let name: String = self.chars[start..end].iter().collect();
        let token = match name.as_str() {
            "true" => Token::Boolean(true),
            "false" => Token::Boolean(false),
            "in" => Token::Operator("in".to_string()),
            _ => Token::Name(name),
        };
        Some((token, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(text: &str) -> Vec<Token> {
        let mut stream = TokenStream::new(text).unwrap();
        let mut result = Vec::new();
        loop {
            let token = stream.advance().unwrap();
            if token == Token::End {
                return result;
            }
            result.push(token);
        }
    }

    #[test]
    fn basic_tokens() {
        assert_eq!(
            tokens("size >= 42 and product_name ~= \"S1%\""),
            vec![
                Token::Name("size".into()),
                Token::Operator(">=".into()),
                Token::Integer(42),
                Token::Name("and".into()),
                Token::Name("product_name".into()),
                Token::Operator("~=".into()),
                Token::Text("S1%".into()),
            ]
        );
    }

    #[test]
    fn timestamp_beats_integer_arithmetic() {
        let result = tokens("2024-01-15");
        assert_eq!(result.len(), 1);
        assert!(matches!(result[0], Token::Timestamp(_)));
    }

    #[test]
    fn uuid_literal() {
        let result = tokens("8a2bff9c-4f5b-4a9b-91b7-1cfd87e90c10");
        assert_eq!(result.len(), 1);
        assert!(matches!(result[0], Token::Uuid(_)));
    }

    #[test]
    fn radix_integers() {
        assert_eq!(tokens("0x1f"), vec![Token::Integer(31)]);
        assert_eq!(tokens("0o17"), vec![Token::Integer(15)]);
        assert_eq!(tokens("0b101"), vec![Token::Integer(5)]);
    }

    #[test]
    fn real_literals() {
        assert_eq!(tokens("1.5"), vec![Token::Real(1.5)]);
        assert_eq!(tokens("1e3"), vec![Token::Real(1000.0)]);
        assert_eq!(tokens("2.5e-1"), vec![Token::Real(0.25)]);
        // bare integer stays integral
        assert_eq!(tokens("15"), vec![Token::Integer(15)]);
    }

    #[test]
    fn text_escapes() {
        assert_eq!(
            tokens(r#""a\"b\\c\nd""#),
            vec![Token::Text("a\"b\\c\nd".into())]
        );
        assert!(TokenStream::new("\"unterminated").is_err());
    }

    #[test]
    fn not_in_is_one_operator() {
        assert_eq!(
            tokens("size not in [1, 2]"),
            vec![
                Token::Name("size".into()),
                Token::Operator("not in".into()),
                Token::Operator("[".into()),
                Token::Integer(1),
                Token::Operator(",".into()),
                Token::Integer(2),
                Token::Operator("]".into()),
            ]
        );
        // but a name that merely starts with "in" is left alone
        assert_eq!(
            tokens("not inner"),
            vec![Token::Name("not".into()), Token::Name("inner".into())]
        );
    }

    #[test]
    fn trailing_whitespace_skipped() {
        assert_eq!(tokens("true   "), vec![Token::Boolean(true)]);
        assert_eq!(tokens(""), vec![]);
    }

    #[test]
    fn error_position_is_one_based() {
        let err = TokenStream::new("size == $").and_then(|mut stream| loop {
            if stream.advance()? == Token::End {
                break Ok(());
            }
        });
        let message = err.unwrap_err().to_string();
        assert!(message.contains("char 9"), "{message}");
    }
}
