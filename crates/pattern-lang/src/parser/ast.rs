// AST node definitions
//
// The tree is plain data. Name resolution results live in a side table
// indexed by `TypeRefId`, filled by `crate::resolve`.

use crate::name::Name;
use crate::span::Span;
use crate::types::{Builtin, Endian};
use smallvec::SmallVec;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Ast {
    pub stmts: Vec<Stmt>,
    /// `/*! ... */` comments, in source order
    pub global_docs: Vec<String>,
    /// Number of `TypeExpr` ids handed out by the parser
    pub type_ref_count: u32,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Var(Box<VarDecl>),
    /// Several declarators from one line, `u8 a, b;`
    Group(Vec<Stmt>),
    Type(Arc<TypeDecl>),
    Fn(Arc<FnDef>),
    Namespace { path: Vec<Name>, body: Vec<Stmt> },
    If(Box<IfStmt>),
    Match(Box<MatchStmt>),
    While { cond: Expr, body: Vec<Stmt> },
    For(Box<ForStmt>),
    Break,
    Continue,
    Return(Option<Expr>),
    TryCatch { body: Vec<Stmt>, handler: Vec<Stmt> },
    Block(Vec<Stmt>),
    BitfieldField(Box<BitfieldField>),
    Expr(Expr),
    /// Recorded after the preprocessor applied it
    Pragma { name: String, value: String },
    /// Recorded after the preprocessor spliced the imported unit in
    Import { path: Vec<Name>, alias: Option<Name> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VarModifiers {
    pub is_in: bool,
    pub is_out: bool,
    pub is_const: bool,
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    /// `None` for anonymous placements (`Header @ 0x00;`)
    pub name: Option<Name>,
    pub ty: TypeExpr,
    pub array: Option<ArraySize>,
    /// `T *name : SizeType`
    pub pointer: Option<TypeExpr>,
    pub placement: Option<Expr>,
    pub section: Option<Expr>,
    pub init: Option<Expr>,
    pub modifiers: VarModifiers,
    pub attrs: Vec<Attribute>,
    pub doc: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ArraySize {
    Count(Expr),
    /// `[while(cond)]`: keep adding elements while `cond` holds
    While(Expr),
    /// `[]`: until a zero element (strings) or end of data
    Open,
}

/// Index into the resolution side table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRefId(pub u32);

#[derive(Debug, Clone)]
pub struct TypeExpr {
    pub kind: TypeKind,
    pub endian: Option<Endian>,
    pub span: Span,
    pub id: TypeRefId,
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Builtin(Builtin),
    Named { path: Vec<Name>, args: Vec<TemplateArg> },
    /// Only valid as the target of `using X = T[n];`
    Array(Box<TypeExpr>, Box<ArraySize>),
}

#[derive(Debug, Clone)]
pub enum TemplateArg {
    Type(TypeExpr),
    Value(Expr),
}

#[derive(Debug, Clone)]
pub struct TemplateParam {
    pub name: Name,
    /// `auto N` takes a value, a plain name takes a type
    pub is_value: bool,
}

#[derive(Debug, Clone)]
pub struct TypeDecl {
    pub name: Name,
    pub template_params: Vec<TemplateParam>,
    pub kind: TypeDeclKind,
    pub attrs: Vec<Attribute>,
    pub doc: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum TypeDeclKind {
    Struct { parents: Vec<TypeExpr>, body: Vec<Stmt> },
    Union { body: Vec<Stmt> },
    Enum { underlying: TypeExpr, members: Vec<EnumMember> },
    Bitfield { body: Vec<Stmt> },
    Alias(TypeExpr),
    /// `using Name;`
    Forward,
}

#[derive(Debug, Clone)]
pub struct EnumMember {
    pub name: Name,
    pub value: Option<Expr>,
    /// `A = 1 ... 5`
    pub range_end: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct BitfieldField {
    /// `None` for `padding : n;`
    pub name: Option<Name>,
    /// Enum or bool typed fields: `Kind kind : 3;`
    pub ty: Option<TypeExpr>,
    pub bits: Expr,
    pub attrs: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Value,
    Ref,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Name,
    pub ty: TypeExpr,
    pub kind: ParamKind,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct FnDef {
    pub name: Name,
    pub params: Vec<Param>,
    /// `auto ... rest`
    pub variadic: Option<Name>,
    pub body: Vec<Stmt>,
    pub doc: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct IfStmt {
    pub cond: Expr,
    pub then_body: Vec<Stmt>,
    pub else_body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct ForStmt {
    pub init: Option<Stmt>,
    pub cond: Expr,
    pub step: Option<Stmt>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct MatchStmt {
    pub scrutinees: Vec<Expr>,
    pub arms: Vec<MatchArm>,
}

#[derive(Debug, Clone)]
pub struct MatchArm {
    /// One pattern per scrutinee
    pub patterns: Vec<MatchPattern>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum MatchPattern {
    Wildcard,
    Value(Expr),
    Range(Expr, Expr),
    Any(Vec<MatchPattern>),
}

#[derive(Debug, Clone)]
pub struct Attribute {
    /// `color`, `hex::visualize`, ...
    pub name: String,
    pub args: SmallVec<[Expr; 2]>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(u128),
    Float(f64),
    Str(String),
    Char(char),
    Bool(bool),
    Null,
    /// `name`, `ns::name`, `Enum::Member`
    Path(Vec<Name>),
    Dollar,
    This,
    Parent,
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `a = b`, or compound `a op= b`
    Assign(Option<BinOp>, Box<Expr>, Box<Expr>),
    Call(Vec<Name>, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Member(Box<Expr>, Name),
    Cast(Box<TypeExpr>, Box<Expr>),
    Sizeof(Box<TypeOrExpr>),
    Addressof(Box<Expr>),
    Typenameof(Box<TypeOrExpr>),
}

#[derive(Debug, Clone)]
pub enum TypeOrExpr {
    Type(TypeExpr),
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::Xor => "^^",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
        }
    }
}
