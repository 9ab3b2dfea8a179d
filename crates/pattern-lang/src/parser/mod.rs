// Recursive-descent parser for the pattern language
//
// Statements and types live here, expressions in `expr.rs`. On a local error
// the parser records it, skips to the next statement boundary and continues,
// so a single pass reports every independent error.

pub mod ast;
mod expr;

use crate::error::{CompileError, CompileStage};
use crate::lexer::token::{Keyword, Punct, Token, TokenKind};
use crate::name::{Name, StringInterner};
use crate::span::Span;
use crate::types::{Builtin, Endian};
use ast::*;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

type PResult<T> = Result<T, CompileError>;

/// Where a statement appears; decides which forms are legal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    Top,
    Function,
    Struct,
    Bitfield,
}

pub struct Parser<'a> {
    tokens: Vec<Token>,
    /// Doc comment immediately preceding the token at an index
    docs: FxHashMap<usize, String>,
    global_docs: Vec<String>,
    pos: usize,
    errors: Vec<CompileError>,
    interner: &'a mut StringInterner,
    next_type_ref: u32,
    /// Inside `<...>`: a bare `>` closes the list instead of comparing
    template_depth: u32,
    /// `>>` tokens split into `>` so far, with the original token
    splits: Vec<(usize, Token)>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, interner: &'a mut StringInterner) -> Self {
        let mut kept = Vec::with_capacity(tokens.len());
        let mut docs = FxHashMap::default();
        let mut global_docs = Vec::new();
        let mut pending: Option<String> = None;
        for tok in tokens {
            match tok.kind {
                TokenKind::DocComment { text, global: true } => global_docs.push(text),
                TokenKind::DocComment { text, global: false } => {
                    pending = Some(match pending.take() {
                        Some(prev) => format!("{}\n{}", prev, text),
                        None => text,
                    });
                }
                _ => {
                    if let Some(doc) = pending.take() {
                        docs.insert(kept.len(), doc);
                    }
                    kept.push(tok);
                }
            }
        }
        if !matches!(kept.last(), Some(t) if t.kind == TokenKind::Eof) {
            let span = kept.last().map(|t: &Token| t.span).unwrap_or_default();
            kept.push(Token::new(TokenKind::Eof, span));
        }
        Self {
            tokens: kept,
            docs,
            global_docs,
            pos: 0,
            errors: Vec::new(),
            interner,
            next_type_ref: 0,
            template_depth: 0,
            splits: Vec::new(),
        }
    }

    pub fn parse(mut self) -> Result<Ast, Vec<CompileError>> {
        let mut stmts = Vec::new();
        while !self.at_eof() {
            match self.parse_stmt(Ctx::Top) {
                Ok(Some(stmt)) => stmts.push(stmt),
                Ok(None) => {}
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
        }
        if self.errors.is_empty() {
            Ok(Ast {
                stmts,
                global_docs: self.global_docs,
                type_ref_count: self.next_type_ref,
            })
        } else {
            Err(self.errors)
        }
    }

    // ---- token helpers ----

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn nth(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)]
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn prev_span(&self) -> Span {
        self.tokens[self.pos.saturating_sub(1)].span
    }

    fn check(&self, p: Punct) -> bool {
        self.peek().is(p)
    }

    fn check_kw(&self, kw: Keyword) -> bool {
        self.peek().is_keyword(kw)
    }

    fn eat(&mut self, p: Punct) -> bool {
        if self.check(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: Keyword) -> bool {
        if self.check_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> CompileError {
        let tok = self.peek();
        CompileError::expected(format!("unexpected {}", tok.kind), expected, tok.span)
    }

    fn expect(&mut self, p: Punct) -> PResult<Span> {
        if self.check(p) {
            Ok(self.advance().span)
        } else {
            Err(self.unexpected(&format!("'{}'", p.as_str())))
        }
    }

    /// `>` closing a template list; splits `>>` when lists nest
    fn expect_close_angle(&mut self) -> PResult<()> {
        if self.eat(Punct::Gt) {
            return Ok(());
        }
        if self.check(Punct::Shr) {
            let original = self.peek().clone();
            let span = original.span;
            self.splits.push((self.pos, original));
            self.tokens[self.pos] = Token::new(
                TokenKind::Punct(Punct::Gt),
                Span::new(span.start + 1, span.end, span.source_id),
            );
            return Ok(());
        }
        Err(self.unexpected("'>'"))
    }

    fn expect_ident(&mut self) -> PResult<(Name, Span)> {
        match self.peek().kind {
            TokenKind::Ident(name) => {
                let span = self.advance().span;
                Ok((name, span))
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn ident_text(&self, n: usize) -> Option<&str> {
        match self.nth(n).kind {
            TokenKind::Ident(name) => Some(self.interner.resolve(name)),
            _ => None,
        }
    }

    fn builtin_at(&self, n: usize) -> Option<Builtin> {
        self.ident_text(n).and_then(Builtin::from_name)
    }

    fn doc_here(&mut self) -> Option<String> {
        self.docs.remove(&self.pos)
    }

    fn type_ref(&mut self) -> TypeRefId {
        let id = TypeRefId(self.next_type_ref);
        self.next_type_ref += 1;
        id
    }

    /// Skip to just past the next `;`, or to a `}` / declaration keyword
    fn synchronize(&mut self) {
        let start = self.pos;
        while !self.at_eof() {
            if self.eat(Punct::Semi) {
                return;
            }
            if self.check(Punct::RBrace) {
                if self.pos == start {
                    self.advance();
                }
                return;
            }
            if self.pos != start
                && matches!(
                    self.peek().kind,
                    TokenKind::Keyword(
                        Keyword::Struct
                            | Keyword::Union
                            | Keyword::Enum
                            | Keyword::Bitfield
                            | Keyword::Fn
                            | Keyword::Namespace
                            | Keyword::Using
                            | Keyword::Import
                    ) | TokenKind::Directive { .. }
                )
            {
                return;
            }
            self.advance();
        }
    }

    // ---- statements ----

    fn parse_block(&mut self, ctx: Ctx) -> PResult<Vec<Stmt>> {
        self.expect(Punct::LBrace)?;
        let mut body = Vec::new();
        while !self.check(Punct::RBrace) && !self.at_eof() {
            match self.parse_stmt(ctx) {
                Ok(Some(stmt)) => body.push(stmt),
                Ok(None) => {}
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
        }
        self.expect(Punct::RBrace)?;
        Ok(body)
    }

    /// Block in braces, or one statement
    fn parse_body(&mut self, ctx: Ctx) -> PResult<Vec<Stmt>> {
        if self.check(Punct::LBrace) {
            return self.parse_block(ctx);
        }
        Ok(self.parse_stmt(ctx)?.into_iter().collect())
    }

    fn parse_stmt(&mut self, ctx: Ctx) -> PResult<Option<Stmt>> {
        let start = self.peek().span;
        let kind = match self.peek().kind.clone() {
            TokenKind::Punct(Punct::Semi) => {
                self.advance();
                return Ok(None);
            }
            TokenKind::Directive { name, args, .. } => {
                self.advance();
                StmtKind::Pragma { name, value: args }
            }
            TokenKind::Punct(Punct::LBrace) => StmtKind::Block(self.parse_block(ctx)?),
            TokenKind::Keyword(kw) => match kw {
                Keyword::Struct | Keyword::Union | Keyword::Enum | Keyword::Bitfield => {
                    StmtKind::Type(Arc::new(self.parse_type_decl()?))
                }
                Keyword::Using => StmtKind::Type(Arc::new(self.parse_using()?)),
                Keyword::Fn => StmtKind::Fn(Arc::new(self.parse_fn()?)),
                Keyword::Namespace => self.parse_namespace()?,
                Keyword::Import => self.parse_import()?,
                Keyword::If => self.parse_if(ctx)?,
                Keyword::Match => self.parse_match(ctx)?,
                Keyword::While => {
                    self.advance();
                    self.expect(Punct::LParen)?;
                    let cond = self.parse_expr()?;
                    self.expect(Punct::RParen)?;
                    let body = self.parse_body(ctx)?;
                    StmtKind::While { cond, body }
                }
                Keyword::For => self.parse_for(ctx)?,
                Keyword::Break => {
                    self.advance();
                    self.expect(Punct::Semi)?;
                    StmtKind::Break
                }
                Keyword::Continue => {
                    self.advance();
                    self.expect(Punct::Semi)?;
                    StmtKind::Continue
                }
                Keyword::Return => {
                    self.advance();
                    let value = if self.check(Punct::Semi) {
                        None
                    } else {
                        Some(self.parse_expr()?)
                    };
                    self.expect(Punct::Semi)?;
                    StmtKind::Return(value)
                }
                Keyword::Try => {
                    self.advance();
                    let body = self.parse_block(ctx)?;
                    let handler = if self.eat_kw(Keyword::Catch) {
                        self.parse_block(ctx)?
                    } else {
                        Vec::new()
                    };
                    StmtKind::TryCatch { body, handler }
                }
                Keyword::In | Keyword::Out | Keyword::Const | Keyword::Be | Keyword::Le => {
                    self.parse_var_decl(ctx)?
                }
                _ => self.parse_expr_stmt()?,
            },
            _ => {
                if ctx == Ctx::Bitfield && self.is_bitfield_field() {
                    self.parse_bitfield_field()?
                } else if self.starts_decl() {
                    self.parse_var_decl(ctx)?
                } else {
                    self.parse_expr_stmt()?
                }
            }
        };
        Ok(Some(Stmt {
            kind,
            span: start.to(self.prev_span()),
        }))
    }

    fn parse_expr_stmt(&mut self) -> PResult<StmtKind> {
        let expr = self.parse_expr()?;
        self.expect(Punct::Semi)?;
        Ok(StmtKind::Expr(expr))
    }

    /// Speculatively parse a type and check that a declarator follows
    fn starts_decl(&mut self) -> bool {
        if !matches!(self.peek().kind, TokenKind::Ident(_)) {
            return false;
        }
        let (pos, errs, refs) = (self.pos, self.errors.len(), self.next_type_ref);
        let splits = self.splits.len();
        let ok = self.parse_type().is_ok()
            && match self.peek().kind {
                TokenKind::Ident(_) | TokenKind::Punct(Punct::At) => true,
                TokenKind::Punct(Punct::Star) => {
                    matches!(self.nth(1).kind, TokenKind::Ident(_)) && self.nth(2).is(Punct::Colon)
                }
                _ => false,
            };
        self.pos = pos;
        self.errors.truncate(errs);
        self.next_type_ref = refs;
        // undo `>>` splits made during the probe
        while self.splits.len() > splits {
            if let Some((at, tok)) = self.splits.pop() {
                self.tokens[at] = tok;
            }
        }
        ok
    }

    fn is_bitfield_field(&self) -> bool {
        match self.peek().kind {
            TokenKind::Ident(_) => {
                self.nth(1).is(Punct::Colon)
                    || (matches!(self.nth(1).kind, TokenKind::Ident(_)) && self.nth(2).is(Punct::Colon))
                    || self.nth(1).is(Punct::ColonColon)
            }
            _ => false,
        }
    }

    fn parse_bitfield_field(&mut self) -> PResult<StmtKind> {
        let ty = if self.nth(1).is(Punct::Colon) {
            None
        } else {
            Some(self.parse_type()?)
        };
        let (name, _) = self.expect_ident()?;
        self.expect(Punct::Colon)?;
        let bits = self.parse_expr()?;
        let attrs = self.parse_attributes()?;
        self.expect(Punct::Semi)?;
        let name = match self.interner.resolve(name) {
            "padding" if ty.is_none() => None,
            _ => Some(name),
        };
        Ok(StmtKind::BitfieldField(Box::new(BitfieldField {
            name,
            ty,
            bits,
            attrs,
        })))
    }

    fn parse_var_decl(&mut self, ctx: Ctx) -> PResult<StmtKind> {
        let doc = self.doc_here();
        let mut modifiers = VarModifiers::default();
        loop {
            if self.eat_kw(Keyword::In) {
                modifiers.is_in = true;
            } else if self.eat_kw(Keyword::Out) {
                modifiers.is_out = true;
            } else if self.eat_kw(Keyword::Const) {
                modifiers.is_const = true;
            } else {
                break;
            }
        }
        if (modifiers.is_in || modifiers.is_out) && ctx != Ctx::Top {
            return Err(CompileError::new(
                CompileStage::Parse,
                "'in' and 'out' variables must be declared at the top level",
                self.prev_span(),
            ));
        }
        let ty = self.parse_type()?;

        let mut decls = Vec::new();
        loop {
            let start = self.peek().span;
            let decl = self.parse_declarator(ty.clone(), modifiers, doc.clone())?;
            decls.push(Stmt {
                kind: StmtKind::Var(Box::new(decl)),
                span: start.to(self.prev_span()),
            });
            if !self.eat(Punct::Comma) {
                break;
            }
        }
        self.expect(Punct::Semi)?;
        Ok(match decls.len() {
            1 => decls.pop().map(|s| s.kind).unwrap_or(StmtKind::Group(Vec::new())),
            _ => StmtKind::Group(decls),
        })
    }

    /// One `name[...] : ptr @ addr in section = init [[attrs]]` part
    fn parse_declarator(
        &mut self,
        ty: TypeExpr,
        modifiers: VarModifiers,
        doc: Option<String>,
    ) -> PResult<VarDecl> {
        let mut decl = VarDecl {
            name: None,
            ty,
            array: None,
            pointer: None,
            placement: None,
            section: None,
            init: None,
            modifiers,
            attrs: Vec::new(),
            doc,
        };
        let is_pointer = self.eat(Punct::Star);
        if !self.check(Punct::At) || is_pointer {
            decl.name = Some(self.expect_ident()?.0);
        }
        if self.check(Punct::LBracket) && !self.nth(1).is(Punct::LBracket) {
            decl.array = Some(self.parse_array_size()?);
        }
        if is_pointer {
            self.expect(Punct::Colon)?;
            decl.pointer = Some(self.parse_type()?);
        }
        if self.eat(Punct::At) {
            decl.placement = Some(self.parse_expr()?);
            if self.eat_kw(Keyword::In) {
                decl.section = Some(self.parse_expr()?);
            }
        }
        if self.eat(Punct::Assign) {
            decl.init = Some(self.parse_expr()?);
        }
        decl.attrs = self.parse_attributes()?;
        if decl.name.is_none() && decl.placement.is_none() {
            return Err(self.unexpected("variable name"));
        }
        Ok(decl)
    }

    fn parse_array_size(&mut self) -> PResult<ArraySize> {
        self.expect(Punct::LBracket)?;
        let size = if self.check(Punct::RBracket) {
            ArraySize::Open
        } else if self.eat_kw(Keyword::While) {
            self.expect(Punct::LParen)?;
            let cond = self.parse_expr()?;
            self.expect(Punct::RParen)?;
            ArraySize::While(cond)
        } else {
            ArraySize::Count(self.parse_expr()?)
        };
        self.expect(Punct::RBracket)?;
        Ok(size)
    }

    fn parse_attributes(&mut self) -> PResult<Vec<Attribute>> {
        let mut attrs = Vec::new();
        while self.check(Punct::LBracket) && self.nth(1).is(Punct::LBracket) {
            self.advance();
            self.advance();
            loop {
                let (first, start) = self.expect_ident()?;
                let mut name = self.interner.resolve(first).to_string();
                while self.eat(Punct::ColonColon) {
                    let (part, _) = self.expect_ident()?;
                    name.push_str("::");
                    name.push_str(self.interner.resolve(part));
                }
                let mut args = SmallVec::new();
                if self.eat(Punct::LParen) {
                    while !self.check(Punct::RParen) {
                        args.push(self.parse_expr()?);
                        if !self.eat(Punct::Comma) {
                            break;
                        }
                    }
                    self.expect(Punct::RParen)?;
                }
                attrs.push(Attribute {
                    name,
                    args,
                    span: start.to(self.prev_span()),
                });
                if !self.eat(Punct::Comma) {
                    break;
                }
            }
            self.expect(Punct::RBracket)?;
            self.expect(Punct::RBracket)?;
        }
        Ok(attrs)
    }

    // ---- types ----

    pub(crate) fn parse_type(&mut self) -> PResult<TypeExpr> {
        let start = self.peek().span;
        let endian = if self.eat_kw(Keyword::Be) {
            Some(Endian::Big)
        } else if self.eat_kw(Keyword::Le) {
            Some(Endian::Little)
        } else {
            None
        };
        let kind = if let Some(builtin) = self.builtin_at(0) {
            self.advance();
            TypeKind::Builtin(builtin)
        } else {
            let path = self.parse_path()?;
            let args = if self.check(Punct::Lt) {
                self.parse_template_args()?
            } else {
                Vec::new()
            };
            TypeKind::Named { path, args }
        };
        Ok(TypeExpr {
            kind,
            endian,
            span: start.to(self.prev_span()),
            id: self.type_ref(),
        })
    }

    fn parse_path(&mut self) -> PResult<Vec<Name>> {
        let mut path = vec![self.expect_ident()?.0];
        while self.check(Punct::ColonColon) && matches!(self.nth(1).kind, TokenKind::Ident(_)) {
            self.advance();
            path.push(self.expect_ident()?.0);
        }
        Ok(path)
    }

    fn parse_template_args(&mut self) -> PResult<Vec<TemplateArg>> {
        self.expect(Punct::Lt)?;
        self.template_depth += 1;
        let result = (|| {
            let mut args = Vec::new();
            loop {
                args.push(self.parse_template_arg()?);
                if !self.eat(Punct::Comma) {
                    break;
                }
            }
            self.expect_close_angle()?;
            Ok(args)
        })();
        self.template_depth -= 1;
        result
    }

    fn parse_template_arg(&mut self) -> PResult<TemplateArg> {
        let type_like = match self.peek().kind {
            TokenKind::Keyword(Keyword::Be | Keyword::Le) => true,
            TokenKind::Ident(_) => {
                // Bare paths stay types; the resolver turns value names back
                let mut n = 1;
                while self.nth(n).is(Punct::ColonColon) {
                    n += 2;
                }
                let next = self.nth(n);
                next.is(Punct::Comma)
                    || next.is(Punct::Gt)
                    || next.is(Punct::Shr)
                    || next.is(Punct::Lt)
            }
            _ => false,
        };
        if type_like {
            Ok(TemplateArg::Type(self.parse_type()?))
        } else {
            Ok(TemplateArg::Value(self.parse_ternary()?))
        }
    }

    fn parse_template_params(&mut self) -> PResult<Vec<TemplateParam>> {
        let mut params = Vec::new();
        if !self.eat(Punct::Lt) {
            return Ok(params);
        }
        loop {
            let is_value = matches!(self.ident_text(0), Some("auto"));
            if is_value {
                self.advance();
            }
            let (name, _) = self.expect_ident()?;
            params.push(TemplateParam { name, is_value });
            if !self.eat(Punct::Comma) {
                break;
            }
        }
        self.expect_close_angle()?;
        Ok(params)
    }

    fn parse_type_decl(&mut self) -> PResult<TypeDecl> {
        let doc = self.doc_here();
        let start = self.peek().span;
        let kw = self.advance();
        let (name, _) = self.expect_ident()?;
        let template_params = self.parse_template_params()?;
        let kind = match kw.kind {
            TokenKind::Keyword(Keyword::Struct) => {
                let mut parents = Vec::new();
                if self.eat(Punct::Colon) {
                    loop {
                        parents.push(self.parse_type()?);
                        if !self.eat(Punct::Comma) {
                            break;
                        }
                    }
                }
                TypeDeclKind::Struct {
                    parents,
                    body: self.parse_block(Ctx::Struct)?,
                }
            }
            TokenKind::Keyword(Keyword::Union) => TypeDeclKind::Union {
                body: self.parse_block(Ctx::Struct)?,
            },
            TokenKind::Keyword(Keyword::Bitfield) => TypeDeclKind::Bitfield {
                body: self.parse_block(Ctx::Bitfield)?,
            },
            _ => {
                self.expect(Punct::Colon)?;
                let underlying = self.parse_type()?;
                TypeDeclKind::Enum {
                    underlying,
                    members: self.parse_enum_members()?,
                }
            }
        };
        let attrs = self.parse_attributes()?;
        self.expect(Punct::Semi)?;
        Ok(TypeDecl {
            name,
            template_params,
            kind,
            attrs,
            doc,
            span: start.to(self.prev_span()),
        })
    }

    fn parse_enum_members(&mut self) -> PResult<Vec<EnumMember>> {
        self.expect(Punct::LBrace)?;
        let mut members = Vec::new();
        while !self.check(Punct::RBrace) {
            let (name, span) = self.expect_ident()?;
            let mut member = EnumMember {
                name,
                value: None,
                range_end: None,
                span,
            };
            if self.eat(Punct::Assign) {
                member.value = Some(self.parse_ternary()?);
                if self.eat(Punct::Ellipsis) {
                    member.range_end = Some(self.parse_ternary()?);
                }
            }
            member.span = span.to(self.prev_span());
            members.push(member);
            if !self.eat(Punct::Comma) {
                break;
            }
        }
        self.expect(Punct::RBrace)?;
        Ok(members)
    }

    fn parse_using(&mut self) -> PResult<TypeDecl> {
        let doc = self.doc_here();
        let start = self.advance().span;
        let (name, _) = self.expect_ident()?;
        let template_params = self.parse_template_params()?;
        let kind = if self.eat(Punct::Assign) {
            let mut target = self.parse_type()?;
            if self.check(Punct::LBracket) && !self.nth(1).is(Punct::LBracket) {
                let size = self.parse_array_size()?;
                let span = target.span.to(self.prev_span());
                target = TypeExpr {
                    kind: TypeKind::Array(Box::new(target), Box::new(size)),
                    endian: None,
                    span,
                    id: self.type_ref(),
                };
            }
            TypeDeclKind::Alias(target)
        } else {
            TypeDeclKind::Forward
        };
        let attrs = self.parse_attributes()?;
        self.expect(Punct::Semi)?;
        Ok(TypeDecl {
            name,
            template_params,
            kind,
            attrs,
            doc,
            span: start.to(self.prev_span()),
        })
    }

    fn parse_fn(&mut self) -> PResult<FnDef> {
        let doc = self.doc_here();
        let start = self.advance().span;
        let (name, _) = self.expect_ident()?;
        self.expect(Punct::LParen)?;
        let mut params = Vec::new();
        let mut variadic = None;
        while !self.check(Punct::RParen) {
            if matches!(self.ident_text(0), Some("auto")) && self.nth(1).is(Punct::Ellipsis) {
                self.advance();
                self.advance();
                variadic = Some(self.expect_ident()?.0);
                break;
            }
            let kind = if self.eat_kw(Keyword::Ref) {
                ParamKind::Ref
            } else {
                ParamKind::Value
            };
            let ty = self.parse_type()?;
            let (pname, _) = self.expect_ident()?;
            let default = if self.eat(Punct::Assign) {
                Some(self.parse_ternary()?)
            } else {
                None
            };
            params.push(Param {
                name: pname,
                ty,
                kind,
                default,
            });
            if !self.eat(Punct::Comma) {
                break;
            }
        }
        self.expect(Punct::RParen)?;
        let body = self.parse_block(Ctx::Function)?;
        Ok(FnDef {
            name,
            params,
            variadic,
            body,
            doc,
            span: start.to(self.prev_span()),
        })
    }

    fn parse_namespace(&mut self) -> PResult<StmtKind> {
        self.advance();
        // `namespace auto x` is accepted and treated like a plain namespace
        if matches!(self.ident_text(0), Some("auto")) && matches!(self.nth(1).kind, TokenKind::Ident(_)) {
            self.advance();
        }
        let path = self.parse_path()?;
        let mut body = Vec::new();
        self.expect(Punct::LBrace)?;
        while !self.check(Punct::RBrace) && !self.at_eof() {
            match self.parse_stmt(Ctx::Top) {
                Ok(Some(stmt)) => body.push(stmt),
                Ok(None) => {}
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
        }
        self.expect(Punct::RBrace)?;
        Ok(StmtKind::Namespace { path, body })
    }

    fn parse_import(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut path = vec![self.expect_ident()?.0];
        while self.eat(Punct::Dot) {
            path.push(self.expect_ident()?.0);
        }
        let alias = if self.eat_kw(Keyword::As) {
            Some(self.expect_ident()?.0)
        } else {
            None
        };
        self.expect(Punct::Semi)?;
        Ok(StmtKind::Import { path, alias })
    }

    fn parse_if(&mut self, ctx: Ctx) -> PResult<StmtKind> {
        self.advance();
        self.expect(Punct::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(Punct::RParen)?;
        let then_body = self.parse_body(ctx)?;
        let else_body = if self.eat_kw(Keyword::Else) {
            self.parse_body(ctx)?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If(Box::new(IfStmt {
            cond,
            then_body,
            else_body,
        })))
    }

    fn parse_for(&mut self, ctx: Ctx) -> PResult<StmtKind> {
        self.advance();
        self.expect(Punct::LParen)?;
        let init = self.parse_for_clause()?;
        self.expect_for_separator()?;
        let cond = self.parse_expr()?;
        self.expect_for_separator()?;
        let step = if self.check(Punct::RParen) {
            None
        } else {
            self.parse_for_clause()?
        };
        self.expect(Punct::RParen)?;
        let body = self.parse_body(ctx)?;
        Ok(StmtKind::For(Box::new(ForStmt {
            init,
            cond,
            step,
            body,
        })))
    }

    fn expect_for_separator(&mut self) -> PResult<()> {
        if self.eat(Punct::Comma) || self.eat(Punct::Semi) {
            Ok(())
        } else {
            Err(self.unexpected("',' or ';'"))
        }
    }

    /// Declaration or expression inside `for (...)`, without terminator
    fn parse_for_clause(&mut self) -> PResult<Option<Stmt>> {
        if self.check(Punct::Comma) || self.check(Punct::Semi) {
            return Ok(None);
        }
        let start = self.peek().span;
        let kind = if self.starts_decl() {
            let ty = self.parse_type()?;
            let (name, _) = self.expect_ident()?;
            self.expect(Punct::Assign)?;
            let init = self.parse_expr()?;
            StmtKind::Var(Box::new(VarDecl {
                name: Some(name),
                ty,
                array: None,
                pointer: None,
                placement: None,
                section: None,
                init: Some(init),
                modifiers: VarModifiers::default(),
                attrs: Vec::new(),
                doc: None,
            }))
        } else {
            StmtKind::Expr(self.parse_expr()?)
        };
        Ok(Some(Stmt {
            kind,
            span: start.to(self.prev_span()),
        }))
    }

    fn parse_match(&mut self, ctx: Ctx) -> PResult<StmtKind> {
        self.advance();
        self.expect(Punct::LParen)?;
        let mut scrutinees = Vec::new();
        loop {
            scrutinees.push(self.parse_expr()?);
            if !self.eat(Punct::Comma) {
                break;
            }
        }
        self.expect(Punct::RParen)?;
        self.expect(Punct::LBrace)?;
        let mut arms = Vec::new();
        while !self.check(Punct::RBrace) && !self.at_eof() {
            let start = self.expect(Punct::LParen)?;
            let mut patterns = Vec::new();
            loop {
                patterns.push(self.parse_match_pattern()?);
                if !self.eat(Punct::Comma) {
                    break;
                }
            }
            self.expect(Punct::RParen)?;
            if patterns.len() != scrutinees.len() {
                return Err(CompileError::new(
                    CompileStage::Parse,
                    format!(
                        "match arm has {} patterns but {} values are matched",
                        patterns.len(),
                        scrutinees.len()
                    ),
                    start.to(self.prev_span()),
                ));
            }
            self.expect(Punct::Colon)?;
            let body = self.parse_body(ctx)?;
            arms.push(MatchArm {
                patterns,
                body,
                span: start.to(self.prev_span()),
            });
        }
        self.expect(Punct::RBrace)?;
        Ok(StmtKind::Match(Box::new(MatchStmt { scrutinees, arms })))
    }

    fn parse_match_pattern(&mut self) -> PResult<MatchPattern> {
        let mut alternatives = vec![self.parse_match_single()?];
        while self.eat(Punct::Pipe) {
            alternatives.push(self.parse_match_single()?);
        }
        Ok(match alternatives.len() {
            1 => alternatives.remove(0),
            _ => MatchPattern::Any(alternatives),
        })
    }

    fn parse_match_single(&mut self) -> PResult<MatchPattern> {
        if matches!(self.ident_text(0), Some("_")) {
            self.advance();
            return Ok(MatchPattern::Wildcard);
        }
        let low = self.parse_bit_xor()?;
        if self.eat(Punct::Ellipsis) {
            let high = self.parse_bit_xor()?;
            return Ok(MatchPattern::Range(low, high));
        }
        Ok(MatchPattern::Value(low))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::span::SourceId;

    pub(super) fn parse_with(src: &str) -> (Result<Ast, Vec<CompileError>>, StringInterner) {
        let mut interner = StringInterner::new();
        let (tokens, lex_errors) = Lexer::new(src, SourceId(0), &mut interner).tokenize();
        assert!(lex_errors.is_empty(), "lex errors: {:?}", lex_errors);
        let result = Parser::new(tokens, &mut interner).parse();
        (result, interner)
    }

    pub(super) fn parse(src: &str) -> Ast {
        match parse_with(src).0 {
            Ok(ast) => ast,
            Err(errors) => panic!("parse failed: {:?}", errors),
        }
    }

    fn parse_errors(src: &str) -> Vec<CompileError> {
        parse_with(src).0.expect_err("expected parse errors")
    }

    fn var(stmt: &Stmt) -> &VarDecl {
        match &stmt.kind {
            StmtKind::Var(v) => v,
            other => panic!("expected variable, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_placement() {
        let ast = parse("u32 x @ 0x10;");
        let v = var(&ast.stmts[0]);
        assert!(matches!(v.ty.kind, TypeKind::Builtin(Builtin::Unsigned(4))));
        assert!(matches!(v.placement.as_ref().unwrap().kind, ExprKind::Int(0x10)));
    }

    #[test]
    fn test_struct_with_endian_members() {
        let ast = parse("struct H { be u16 magic; le u32 len; };");
        let StmtKind::Type(decl) = &ast.stmts[0].kind else {
            panic!("expected type");
        };
        let TypeDeclKind::Struct { body, .. } = &decl.kind else {
            panic!("expected struct");
        };
        assert_eq!(var(&body[0]).ty.endian, Some(Endian::Big));
        assert_eq!(var(&body[1]).ty.endian, Some(Endian::Little));
    }

    #[test]
    fn test_while_array() {
        let ast = parse("char s[while(std::mem::read_unsigned($, 1) != 0)] @ 0;");
        assert!(matches!(var(&ast.stmts[0]).array, Some(ArraySize::While(_))));
    }

    #[test]
    fn test_open_array_and_section() {
        let ast = parse("char name[] @ 0x20 in sec;");
        let v = var(&ast.stmts[0]);
        assert!(matches!(v.array, Some(ArraySize::Open)));
        assert!(v.section.is_some());
    }

    #[test]
    fn test_in_out_modifiers() {
        let ast = parse("in u32 threshold; out u32 count;");
        assert!(var(&ast.stmts[0]).modifiers.is_in);
        assert!(var(&ast.stmts[1]).modifiers.is_out);
    }

    #[test]
    fn test_in_inside_struct_rejected() {
        let errors = parse_errors("struct S { in u8 x; };");
        assert!(errors[0].message.contains("top level"));
    }

    #[test]
    fn test_multiple_declarators() {
        let ast = parse("u8 a, b, c;");
        let StmtKind::Group(items) = &ast.stmts[0].kind else {
            panic!("expected group");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_pointer_declaration() {
        let ast = parse("u32 *ptr : u16 @ 0;");
        let v = var(&ast.stmts[0]);
        assert!(matches!(
            v.pointer.as_ref().unwrap().kind,
            TypeKind::Builtin(Builtin::Unsigned(2))
        ));
    }

    #[test]
    fn test_anonymous_placement() {
        let ast = parse("struct A { u8 x; }; A @ 0x00;");
        assert!(var(&ast.stmts[1]).name.is_none());
    }

    #[test]
    fn test_template_struct_and_use() {
        let ast = parse("struct Pair<T, auto N> { T items[N]; }; Pair<u16, 4> p @ 0;");
        let StmtKind::Type(decl) = &ast.stmts[0].kind else {
            panic!("expected type");
        };
        assert_eq!(decl.template_params.len(), 2);
        assert!(decl.template_params[1].is_value);
        let TypeKind::Named { args, .. } = &var(&ast.stmts[1]).ty.kind else {
            panic!("expected named type");
        };
        assert!(matches!(args[0], TemplateArg::Type(_)));
        assert!(matches!(args[1], TemplateArg::Value(_)));
    }

    #[test]
    fn test_nested_template_shr_split() {
        let ast = parse("struct B<T> { T v; }; struct A<T> { T v; }; A<B<u8>> x @ 0;");
        let TypeKind::Named { args, .. } = &var(&ast.stmts[2]).ty.kind else {
            panic!("expected named type");
        };
        assert!(matches!(args[0], TemplateArg::Type(_)));
    }

    #[test]
    fn test_enum_with_range() {
        let ast = parse("enum E : u8 { A, B = 5, C = 10 ... 20, };");
        let StmtKind::Type(decl) = &ast.stmts[0].kind else {
            panic!("expected type");
        };
        let TypeDeclKind::Enum { members, .. } = &decl.kind else {
            panic!("expected enum");
        };
        assert_eq!(members.len(), 3);
        assert!(members[2].range_end.is_some());
    }

    #[test]
    fn test_bitfield_fields() {
        let ast = parse("bitfield F { a : 1; padding : 3; Kind k : 4; };");
        let StmtKind::Type(decl) = &ast.stmts[0].kind else {
            panic!("expected type");
        };
        let TypeDeclKind::Bitfield { body } = &decl.kind else {
            panic!("expected bitfield");
        };
        assert_eq!(body.len(), 3);
        let StmtKind::BitfieldField(pad) = &body[1].kind else {
            panic!("expected field");
        };
        assert!(pad.name.is_none());
        let StmtKind::BitfieldField(typed) = &body[2].kind else {
            panic!("expected field");
        };
        assert!(typed.ty.is_some());
    }

    #[test]
    fn test_function_with_ref_default_and_pack() {
        let ast = parse("fn f(ref u8 a, u32 b = 4, auto ... rest) { return b; };");
        let StmtKind::Fn(def) = &ast.stmts[0].kind else {
            panic!("expected fn");
        };
        assert_eq!(def.params[0].kind, ParamKind::Ref);
        assert!(def.params[1].default.is_some());
        assert!(def.variadic.is_some());
    }

    #[test]
    fn test_match_arms() {
        let ast = parse("fn f(u8 x) { match (x, 1) { (0 | 1, _): return 1; (2 ... 5, 1): { return 2; } (_, _): return 3; } };");
        let StmtKind::Fn(def) = &ast.stmts[0].kind else {
            panic!("expected fn");
        };
        let StmtKind::Match(m) = &def.body[0].kind else {
            panic!("expected match");
        };
        assert_eq!(m.arms.len(), 3);
        assert!(matches!(m.arms[0].patterns[0], MatchPattern::Any(_)));
        assert!(matches!(m.arms[1].patterns[0], MatchPattern::Range(..)));
    }

    #[test]
    fn test_match_arity_mismatch() {
        let errors = parse_errors("fn f() { match (1, 2) { (1): return; } };");
        assert!(errors[0].message.contains("2 values"));
    }

    #[test]
    fn test_for_with_commas() {
        let ast = parse("fn f() { for (u8 i = 0, i < 4, i = i + 1) { } };");
        let StmtKind::Fn(def) = &ast.stmts[0].kind else {
            panic!("expected fn");
        };
        assert!(matches!(def.body[0].kind, StmtKind::For(_)));
    }

    #[test]
    fn test_attributes() {
        let ast = parse(r#"u8 x @ 0 [[color("FF0000"), hex::visualize("hex", x)]];"#);
        let v = var(&ast.stmts[0]);
        assert_eq!(v.attrs.len(), 2);
        assert_eq!(v.attrs[1].name, "hex::visualize");
        assert_eq!(v.attrs[1].args.len(), 2);
    }

    #[test]
    fn test_doc_comment_attached() {
        let ast = parse("/*! file doc */\n/** the header */\nstruct H { u8 a; };");
        assert_eq!(ast.global_docs, vec!["file doc".to_string()]);
        let StmtKind::Type(decl) = &ast.stmts[0].kind else {
            panic!("expected type");
        };
        assert_eq!(decl.doc.as_deref(), Some("the header"));
    }

    #[test]
    fn test_using_alias_and_forward() {
        let ast = parse("using Word = be u16; using Later; using Buf = u8[16];");
        assert_eq!(ast.stmts.len(), 3);
        let StmtKind::Type(decl) = &ast.stmts[2].kind else {
            panic!("expected type");
        };
        assert!(matches!(decl.kind, TypeDeclKind::Alias(TypeExpr { kind: TypeKind::Array(..), .. })));
    }

    #[test]
    fn test_namespace_and_import() {
        let ast = parse("import std.mem; namespace a::b { struct S { u8 x; }; }");
        assert!(matches!(ast.stmts[0].kind, StmtKind::Import { .. }));
        let StmtKind::Namespace { path, body } = &ast.stmts[1].kind else {
            panic!("expected namespace");
        };
        assert_eq!(path.len(), 2);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn test_errors_are_accumulated() {
        let errors = parse_errors("u8 x @ ;\nu16 y @ 0;\nu32 @@ z;\n");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let src = "struct S { u8 a; if (a > 1) u16 b; }; S s @ 0;";
        assert_eq!(format!("{:?}", parse(src)), format!("{:?}", parse(src)));
    }

    #[test]
    fn test_try_catch() {
        let ast = parse("try { u8 x @ 0; } catch { u8 y @ 1; }");
        assert!(matches!(ast.stmts[0].kind, StmtKind::TryCatch { .. }));
    }

    #[test]
    fn test_pragma_recorded() {
        let ast = parse("#pragma endian big\nu8 x @ 0;");
        assert!(matches!(&ast.stmts[0].kind, StmtKind::Pragma { name, .. } if name == "pragma"));
    }
}
