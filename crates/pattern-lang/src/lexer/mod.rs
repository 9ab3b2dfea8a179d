// Hand-written lexer for the pattern language

pub mod token;

use crate::error::{CompileError, CompileStage};
use crate::name::StringInterner;
use crate::span::{SourceId, Span};
use token::{Keyword, Token, TokenKind, PUNCTS};

/// Converts one source unit (or a fragment of it) into tokens
pub struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    /// Added to every span so fragments keep their place in the unit
    base: u32,
    source_id: SourceId,
    errors: Vec<CompileError>,
    interner: &'a mut StringInterner,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str, source_id: SourceId, interner: &'a mut StringInterner) -> Self {
        Self::fragment(src, 0, source_id, interner)
    }

    /// Lex a slice of a unit that starts at byte `base` of that unit
    pub fn fragment(
        src: &'a str,
        base: u32,
        source_id: SourceId,
        interner: &'a mut StringInterner,
    ) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            base,
            source_id,
            errors: Vec::new(),
            interner,
        }
    }

    pub fn tokenize(mut self) -> (Vec<Token>, Vec<CompileError>) {
        let mut tokens = Vec::new();
        loop {
            if let Some(doc) = self.skip_trivia() {
                tokens.push(doc);
                continue;
            }
            if self.pos >= self.bytes.len() {
                tokens.push(Token::new(TokenKind::Eof, self.span(self.pos)));
                break;
            }
            let start = self.pos;
            match self.next_token(start) {
                Some(tok) => tokens.push(tok),
                None => {
                    let ch = self.src[start..].chars().next().unwrap_or('?');
                    self.pos += ch.len_utf8();
                    self.error(format!("unexpected character '{}'", ch), start);
                }
            }
        }
        (tokens, self.errors)
    }

    fn span(&self, start: usize) -> Span {
        Span::new(
            self.base + start as u32,
            self.base + self.pos as u32,
            self.source_id,
        )
    }

    fn error(&mut self, message: impl Into<String>, start: usize) {
        let span = self.span(start);
        self.errors
            .push(CompileError::new(CompileStage::Lex, message, span));
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<u8> {
        self.bytes.get(self.pos + n).copied()
    }

    fn at_line_start(&self) -> bool {
        self.bytes[..self.pos]
            .iter()
            .rev()
            .take_while(|&&b| b != b'\n')
            .all(|b| *b == b' ' || *b == b'\t' || *b == b'\r')
    }

    /// Skip whitespace and comments. Doc comments are returned as tokens.
    fn skip_trivia(&mut self) -> Option<Token> {
        loop {
            while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
                self.pos += 1;
            }
            match (self.peek(), self.peek_at(1)) {
                (Some(b'/'), Some(b'/')) => {
                    let start = self.pos;
                    let is_doc = self.peek_at(2) == Some(b'/') && self.peek_at(3) != Some(b'/');
                    let end = memchr::memchr(b'\n', &self.bytes[self.pos..])
                        .map(|i| self.pos + i)
                        .unwrap_or(self.bytes.len());
                    self.pos = end;
                    if is_doc {
                        let text = self.src[start + 3..end].trim().to_string();
                        return Some(Token::new(
                            TokenKind::DocComment {
                                text,
                                global: false,
                            },
                            self.span(start),
                        ));
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    let start = self.pos;
                    let marker = self.peek_at(2);
                    let is_doc = (marker == Some(b'*') && self.peek_at(3) != Some(b'/'))
                        || marker == Some(b'!');
                    self.pos += 2;
                    let body_start = self.pos;
                    match memchr::memmem::find(&self.bytes[self.pos..], b"*/") {
                        Some(i) => self.pos += i + 2,
                        None => {
                            self.pos = self.bytes.len();
                            self.error("unterminated block comment", start);
                            return None;
                        }
                    }
                    if is_doc {
                        let body = &self.src[body_start + 1..self.pos - 2];
                        return Some(Token::new(
                            TokenKind::DocComment {
                                text: clean_doc(body),
                                global: marker == Some(b'!'),
                            },
                            self.span(start),
                        ));
                    }
                }
                _ => return None,
            }
        }
    }

    fn next_token(&mut self, start: usize) -> Option<Token> {
        let b = self.peek()?;
        if b == b'#' && self.at_line_start() {
            return Some(self.lex_directive(start));
        }
        if b.is_ascii_digit() {
            return Some(self.lex_number(start));
        }
        if b == b'"' {
            return Some(self.lex_string(start));
        }
        if b == b'\'' {
            return Some(self.lex_char(start));
        }
        if b.is_ascii_alphabetic() || b == b'_' {
            return Some(self.lex_word(start));
        }
        let rest = &self.src[self.pos..];
        let (text, punct) = PUNCTS.iter().find(|(s, _)| rest.starts_with(s))?;
        self.pos += text.len();
        Some(Token::new(TokenKind::Punct(*punct), self.span(start)))
    }

    fn lex_directive(&mut self, start: usize) -> Token {
        self.pos += 1;
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
        let name_start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        let name = self.src[name_start..self.pos].to_string();
        let line_end = memchr::memchr(b'\n', &self.bytes[self.pos..])
            .map(|i| self.pos + i)
            .unwrap_or(self.bytes.len());
        let raw = &self.src[self.pos..line_end];
        let lead = raw.len() - raw.trim_start().len();
        let args_offset = self.base + (self.pos + lead) as u32;
        let args = strip_line_comment(raw.trim()).to_string();
        self.pos = line_end;
        if name.is_empty() {
            self.error("expected directive name after '#'", start);
        }
        Token::new(
            TokenKind::Directive {
                name,
                args,
                args_offset,
            },
            self.span(start),
        )
    }

    fn lex_word(&mut self, start: usize) -> Token {
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        let word = &self.src[start..self.pos];
        let kind = match Keyword::lookup(word) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Ident(self.interner.intern(word)),
        };
        Token::new(kind, self.span(start))
    }

    fn lex_number(&mut self, start: usize) -> Token {
        let radix = match (self.peek(), self.peek_at(1)) {
            (Some(b'0'), Some(b'x' | b'X')) => 16,
            (Some(b'0'), Some(b'o' | b'O')) => 8,
            (Some(b'0'), Some(b'b' | b'B')) if matches!(self.peek_at(2), Some(b'0' | b'1')) => 2,
            _ => 10,
        };
        if radix != 10 {
            self.pos += 2;
        }
        let digits_start = self.pos;
        let mut is_float = false;
        loop {
            match self.peek() {
                Some(b) if (b as char).is_digit(radix) => self.pos += 1,
                Some(b'\'') if matches!(self.peek_at(1), Some(n) if (n as char).is_digit(radix)) => {
                    self.pos += 1
                }
                Some(b'.')
                    if radix == 10
                        && !is_float
                        && matches!(self.peek_at(1), Some(n) if n.is_ascii_digit()) =>
                {
                    is_float = true;
                    self.pos += 1;
                }
                Some(b'e' | b'E') if radix == 10 => {
                    let sign = matches!(self.peek_at(1), Some(b'+' | b'-')) as usize;
                    if matches!(self.peek_at(1 + sign), Some(n) if n.is_ascii_digit()) {
                        is_float = true;
                        self.pos += 1 + sign;
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
        let digits: String = self.src[digits_start..self.pos]
            .chars()
            .filter(|&c| c != '\'')
            .collect();

        let mut float_suffix = false;
        match self.peek() {
            Some(b'U' | b'u') if !is_float => self.pos += 1,
            Some(b'F' | b'f' | b'D' | b'd') if radix == 10 => {
                float_suffix = true;
                self.pos += 1;
            }
            _ => {}
        }

        if digits.is_empty() {
            self.error("expected digits after radix prefix", start);
            return Token::new(TokenKind::Int(0), self.span(start));
        }
        if is_float || float_suffix {
            return match digits.parse::<f64>() {
                Ok(v) => Token::new(TokenKind::Float(v), self.span(start)),
                Err(_) => {
                    self.error("invalid floating point literal", start);
                    Token::new(TokenKind::Float(0.0), self.span(start))
                }
            };
        }
        match u128::from_str_radix(&digits, radix) {
            Ok(v) => Token::new(TokenKind::Int(v), self.span(start)),
            Err(_) => {
                self.error("integer literal does not fit in 128 bits", start);
                Token::new(TokenKind::Int(0), self.span(start))
            }
        }
    }

    /// Decode one escape sequence; `self.pos` is just past the backslash
    fn lex_escape(&mut self, start: usize) -> char {
        let Some(b) = self.peek() else {
            self.error("unterminated escape sequence", start);
            return '\0';
        };
        self.pos += 1;
        match b {
            b'n' => '\n',
            b't' => '\t',
            b'r' => '\r',
            b'0' => '\0',
            b'a' => '\x07',
            b'b' => '\x08',
            b'f' => '\x0C',
            b'v' => '\x0B',
            b'\\' => '\\',
            b'\'' => '\'',
            b'"' => '"',
            b'x' => {
                let hex = self.src.get(self.pos..self.pos + 2).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(v) => {
                        self.pos += 2;
                        v as char
                    }
                    Err(_) => {
                        self.error("invalid \\x escape", start);
                        '\0'
                    }
                }
            }
            b'u' => {
                let hex = self.src.get(self.pos..self.pos + 4).unwrap_or("");
                match u32::from_str_radix(hex, 16).ok().and_then(char::from_u32) {
                    Some(c) => {
                        self.pos += 4;
                        c
                    }
                    None => {
                        self.error("invalid \\u escape", start);
                        '\0'
                    }
                }
            }
            other => {
                self.error(format!("unknown escape sequence '\\{}'", other as char), start);
                other as char
            }
        }
    }

    fn lex_string(&mut self, start: usize) -> Token {
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    self.error("unterminated string literal", start);
                    break;
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let c = self.lex_escape(start);
                    value.push(c);
                }
                Some(_) => {
                    let c = self.src[self.pos..].chars().next().unwrap_or('\0');
                    self.pos += c.len_utf8();
                    value.push(c);
                }
            }
        }
        Token::new(TokenKind::Str(value), self.span(start))
    }

    fn lex_char(&mut self, start: usize) -> Token {
        self.pos += 1;
        let c = match self.peek() {
            Some(b'\\') => {
                self.pos += 1;
                self.lex_escape(start)
            }
            Some(b'\'') | None => {
                self.error("empty character literal", start);
                '\0'
            }
            Some(_) => {
                let c = self.src[self.pos..].chars().next().unwrap_or('\0');
                self.pos += c.len_utf8();
                c
            }
        };
        if self.peek() == Some(b'\'') {
            self.pos += 1;
        } else {
            self.error("unterminated character literal", start);
        }
        Token::new(TokenKind::Char(c), self.span(start))
    }
}

/// Strip comment decoration (`*` gutters) from a doc comment body
fn clean_doc(body: &str) -> String {
    body.lines()
        .map(|l| l.trim().trim_start_matches('*').trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_line_comment(s: &str) -> &str {
    let mut in_str = false;
    let bytes = s.as_bytes();
    for i in 0..bytes.len() {
        match bytes[i] {
            b'"' if i == 0 || bytes[i - 1] != b'\\' => in_str = !in_str,
            b'/' if !in_str && bytes.get(i + 1) == Some(&b'/') => return s[..i].trim_end(),
            _ => {}
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::token::Punct;
    use super::*;

    fn lex(src: &str) -> Vec<TokenKind> {
        let mut interner = StringInterner::new();
        let (tokens, errors) = Lexer::new(src, SourceId(0), &mut interner).tokenize();
        assert!(errors.is_empty(), "unexpected lex errors: {:?}", errors);
        tokens.into_iter().map(|t| t.kind).collect()
    }

    fn lex_errors(src: &str) -> Vec<CompileError> {
        let mut interner = StringInterner::new();
        Lexer::new(src, SourceId(0), &mut interner).tokenize().1
    }

    #[test]
    fn test_empty_source() {
        assert_eq!(lex(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_integer_radixes() {
        assert_eq!(
            lex("42 0x2A 0o52 0b101010"),
            vec![
                TokenKind::Int(42),
                TokenKind::Int(42),
                TokenKind::Int(42),
                TokenKind::Int(42),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_digit_separator_and_suffix() {
        assert_eq!(
            lex("1'000'000 0xFFU"),
            vec![TokenKind::Int(1_000_000), TokenKind::Int(0xFF), TokenKind::Eof]
        );
    }

    #[test]
    fn test_floats() {
        assert_eq!(
            lex("1.5 2e3 3F"),
            vec![
                TokenKind::Float(1.5),
                TokenKind::Float(2000.0),
                TokenKind::Float(3.0),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_range_is_not_float() {
        assert_eq!(
            lex("1...5"),
            vec![
                TokenKind::Int(1),
                TokenKind::Punct(Punct::Ellipsis),
                TokenKind::Int(5),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            lex(r#""a\n\x41\"""#),
            vec![TokenKind::Str("a\nA\"".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_char_literals() {
        assert_eq!(
            lex(r"'a' '\0'"),
            vec![TokenKind::Char('a'), TokenKind::Char('\0'), TokenKind::Eof]
        );
    }

    #[test]
    fn test_keywords_and_idents() {
        let kinds = lex("struct Foo");
        assert_eq!(kinds[0], TokenKind::Keyword(Keyword::Struct));
        assert!(matches!(kinds[1], TokenKind::Ident(_)));
    }

    #[test]
    fn test_greedy_operators() {
        assert_eq!(
            lex("a <<= 1 :: $"),
            vec![
                lex("a")[0].clone(),
                TokenKind::Punct(Punct::ShlAssign),
                TokenKind::Int(1),
                TokenKind::Punct(Punct::ColonColon),
                TokenKind::Punct(Punct::Dollar),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            lex("1 // one\n/* two */ 2"),
            vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]
        );
    }

    #[test]
    fn test_doc_comments() {
        let kinds = lex("/** Header of the file */ /*! global doc */ /// line doc\n");
        assert_eq!(
            kinds[0],
            TokenKind::DocComment {
                text: "Header of the file".into(),
                global: false
            }
        );
        assert_eq!(
            kinds[1],
            TokenKind::DocComment {
                text: "global doc".into(),
                global: true
            }
        );
        assert_eq!(
            kinds[2],
            TokenKind::DocComment {
                text: "line doc".into(),
                global: false
            }
        );
    }

    #[test]
    fn test_directive_line() {
        let kinds = lex("#pragma endian big // trailing\nu8 x;");
        assert_eq!(
            kinds[0],
            TokenKind::Directive {
                name: "pragma".into(),
                args: "endian big".into(),
                args_offset: 8
            }
        );
        assert!(matches!(kinds[1], TokenKind::Ident(_)));
    }

    #[test]
    fn test_hash_mid_line_is_error() {
        let errors = lex_errors("u8 x; #define");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unexpected character"));
    }

    #[test]
    fn test_unterminated_string() {
        let errors = lex_errors("\"abc");
        assert!(errors[0].message.contains("unterminated string"));
    }

    #[test]
    fn test_unterminated_block_comment() {
        let errors = lex_errors("/* never closed");
        assert!(errors[0].message.contains("unterminated block comment"));
    }

    #[test]
    fn test_fragment_offsets_spans() {
        let mut interner = StringInterner::new();
        let (tokens, _) = Lexer::fragment("5", 40, SourceId(2), &mut interner).tokenize();
        assert_eq!(tokens[0].span, Span::new(40, 41, SourceId(2)));
    }

    #[test]
    fn test_spans_cover_token() {
        let mut interner = StringInterner::new();
        let (tokens, _) = Lexer::new("  abc", SourceId(0), &mut interner).tokenize();
        assert_eq!((tokens[0].span.start, tokens[0].span.end), (2, 5));
    }
}
