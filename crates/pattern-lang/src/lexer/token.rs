// Token definitions

use crate::name::Name;
use crate::span::Span;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn is(&self, punct: Punct) -> bool {
        self.kind == TokenKind::Punct(punct)
    }

    pub fn is_keyword(&self, kw: Keyword) -> bool {
        self.kind == TokenKind::Keyword(kw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Int(u128),
    Float(f64),
    Str(String),
    Char(char),
    Ident(Name),
    Keyword(Keyword),
    Punct(Punct),
    /// `/** ... */` or `///` (local) and `/*! ... */` (global)
    DocComment { text: String, global: bool },
    /// A whole `#name args` line, handed to the preprocessor untouched
    Directive { name: String, args: String, args_offset: u32 },
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Struct,
    Union,
    Enum,
    Bitfield,
    Fn,
    Namespace,
    Using,
    If,
    Else,
    Match,
    While,
    For,
    Break,
    Continue,
    Return,
    Try,
    Catch,
    In,
    Out,
    Ref,
    Const,
    Import,
    As,
    From,
    Be,
    Le,
    This,
    Parent,
    Addressof,
    Sizeof,
    Typenameof,
    True,
    False,
    Null,
}

const KEYWORDS: &[(&str, Keyword)] = &[
    ("struct", Keyword::Struct),
    ("union", Keyword::Union),
    ("enum", Keyword::Enum),
    ("bitfield", Keyword::Bitfield),
    ("fn", Keyword::Fn),
    ("namespace", Keyword::Namespace),
    ("using", Keyword::Using),
    ("if", Keyword::If),
    ("else", Keyword::Else),
    ("match", Keyword::Match),
    ("while", Keyword::While),
    ("for", Keyword::For),
    ("break", Keyword::Break),
    ("continue", Keyword::Continue),
    ("return", Keyword::Return),
    ("try", Keyword::Try),
    ("catch", Keyword::Catch),
    ("in", Keyword::In),
    ("out", Keyword::Out),
    ("ref", Keyword::Ref),
    ("const", Keyword::Const),
    ("import", Keyword::Import),
    ("as", Keyword::As),
    ("from", Keyword::From),
    ("be", Keyword::Be),
    ("le", Keyword::Le),
    ("this", Keyword::This),
    ("parent", Keyword::Parent),
    ("addressof", Keyword::Addressof),
    ("sizeof", Keyword::Sizeof),
    ("typenameof", Keyword::Typenameof),
    ("true", Keyword::True),
    ("false", Keyword::False),
    ("null", Keyword::Null),
];

impl Keyword {
    pub fn lookup(word: &str) -> Option<Keyword> {
        KEYWORDS.iter().find(|(s, _)| *s == word).map(|(_, k)| *k)
    }

    pub fn as_str(&self) -> &'static str {
        KEYWORDS
            .iter()
            .find(|(_, k)| k == self)
            .map(|(s, _)| *s)
            .unwrap_or("?")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Punct {
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    AndAnd,
    OrOr,
    XorXor,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
    Dollar,
    At,
    ColonColon,
    Ellipsis,
    Dot,
    Comma,
    Semi,
    Colon,
    Question,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
}

/// Longest symbols first so the lexer can match greedily
pub(crate) const PUNCTS: &[(&str, Punct)] = &[
    ("<<=", Punct::ShlAssign),
    (">>=", Punct::ShrAssign),
    ("...", Punct::Ellipsis),
    ("<<", Punct::Shl),
    (">>", Punct::Shr),
    ("&&", Punct::AndAnd),
    ("||", Punct::OrOr),
    ("^^", Punct::XorXor),
    ("==", Punct::EqEq),
    ("!=", Punct::NotEq),
    ("<=", Punct::LtEq),
    (">=", Punct::GtEq),
    ("+=", Punct::PlusAssign),
    ("-=", Punct::MinusAssign),
    ("*=", Punct::StarAssign),
    ("/=", Punct::SlashAssign),
    ("%=", Punct::PercentAssign),
    ("&=", Punct::AmpAssign),
    ("|=", Punct::PipeAssign),
    ("^=", Punct::CaretAssign),
    ("::", Punct::ColonColon),
    ("+", Punct::Plus),
    ("-", Punct::Minus),
    ("*", Punct::Star),
    ("/", Punct::Slash),
    ("%", Punct::Percent),
    ("&", Punct::Amp),
    ("|", Punct::Pipe),
    ("^", Punct::Caret),
    ("~", Punct::Tilde),
    ("!", Punct::Bang),
    ("<", Punct::Lt),
    (">", Punct::Gt),
    ("=", Punct::Assign),
    ("$", Punct::Dollar),
    ("@", Punct::At),
    (".", Punct::Dot),
    (",", Punct::Comma),
    (";", Punct::Semi),
    (":", Punct::Colon),
    ("?", Punct::Question),
    ("(", Punct::LParen),
    (")", Punct::RParen),
    ("[", Punct::LBracket),
    ("]", Punct::RBracket),
    ("{", Punct::LBrace),
    ("}", Punct::RBrace),
];

impl Punct {
    pub fn as_str(&self) -> &'static str {
        PUNCTS
            .iter()
            .find(|(_, p)| p == self)
            .map(|(s, _)| *s)
            .unwrap_or("?")
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Int(v) => write!(f, "integer '{}'", v),
            TokenKind::Float(v) => write!(f, "float '{}'", v),
            TokenKind::Str(s) => write!(f, "string \"{}\"", s),
            TokenKind::Char(c) => write!(f, "character '{}'", c.escape_default()),
            TokenKind::Ident(_) => f.write_str("identifier"),
            TokenKind::Keyword(k) => write!(f, "'{}'", k.as_str()),
            TokenKind::Punct(p) => write!(f, "'{}'", p.as_str()),
            TokenKind::DocComment { .. } => f.write_str("doc comment"),
            TokenKind::Directive { name, .. } => write!(f, "'#{}'", name),
            TokenKind::Eof => f.write_str("end of input"),
        }
    }
}
