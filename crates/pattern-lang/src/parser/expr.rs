// Expression parsing by precedence climbing

use super::{PResult, Parser};
use crate::error::{CompileError, CompileStage};
use crate::lexer::token::{Keyword, Punct, TokenKind};
use crate::parser::ast::*;

/// Binary operator levels, loosest first
const LEVELS: &[&[(Punct, BinOp)]] = &[
    &[(Punct::OrOr, BinOp::Or)],
    &[(Punct::XorXor, BinOp::Xor)],
    &[(Punct::AndAnd, BinOp::And)],
    &[(Punct::Pipe, BinOp::BitOr)],
    &[(Punct::Caret, BinOp::BitXor)],
    &[(Punct::Amp, BinOp::BitAnd)],
    &[(Punct::EqEq, BinOp::Eq), (Punct::NotEq, BinOp::Ne)],
    &[
        (Punct::Lt, BinOp::Lt),
        (Punct::Gt, BinOp::Gt),
        (Punct::LtEq, BinOp::Le),
        (Punct::GtEq, BinOp::Ge),
    ],
    &[(Punct::Shl, BinOp::Shl), (Punct::Shr, BinOp::Shr)],
    &[(Punct::Plus, BinOp::Add), (Punct::Minus, BinOp::Sub)],
    &[
        (Punct::Star, BinOp::Mul),
        (Punct::Slash, BinOp::Div),
        (Punct::Percent, BinOp::Rem),
    ],
];

/// Index of the `^` level in `LEVELS`
const BIT_XOR_LEVEL: usize = 4;

const ASSIGN_OPS: &[(Punct, Option<BinOp>)] = &[
    (Punct::Assign, None),
    (Punct::PlusAssign, Some(BinOp::Add)),
    (Punct::MinusAssign, Some(BinOp::Sub)),
    (Punct::StarAssign, Some(BinOp::Mul)),
    (Punct::SlashAssign, Some(BinOp::Div)),
    (Punct::PercentAssign, Some(BinOp::Rem)),
    (Punct::AmpAssign, Some(BinOp::BitAnd)),
    (Punct::PipeAssign, Some(BinOp::BitOr)),
    (Punct::CaretAssign, Some(BinOp::BitXor)),
    (Punct::ShlAssign, Some(BinOp::Shl)),
    (Punct::ShrAssign, Some(BinOp::Shr)),
];

impl<'a> Parser<'a> {
    pub(crate) fn parse_expr(&mut self) -> PResult<Expr> {
        let lhs = self.parse_ternary()?;
        let op = ASSIGN_OPS.iter().find(|(p, _)| self.check(*p)).map(|(_, op)| *op);
        let Some(op) = op else {
            return Ok(lhs);
        };
        if !is_place(&lhs) {
            return Err(CompileError::new(
                CompileStage::Parse,
                "left side of assignment is not assignable",
                lhs.span,
            ));
        }
        self.advance();
        let rhs = self.parse_expr()?;
        let span = lhs.span.to(rhs.span);
        Ok(Expr::new(ExprKind::Assign(op, Box::new(lhs), Box::new(rhs)), span))
    }

    pub(crate) fn parse_ternary(&mut self) -> PResult<Expr> {
        let cond = self.parse_level(0)?;
        if !self.eat(Punct::Question) {
            return Ok(cond);
        }
        let then = self.parse_ternary()?;
        self.expect(Punct::Colon)?;
        let otherwise = self.parse_ternary()?;
        let span = cond.span.to(otherwise.span);
        Ok(Expr::new(
            ExprKind::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)),
            span,
        ))
    }

    /// Everything binding at least as tight as `^`; match patterns use
    /// this so that `|` separates alternatives
    pub(crate) fn parse_bit_xor(&mut self) -> PResult<Expr> {
        self.parse_level(BIT_XOR_LEVEL)
    }

    fn parse_level(&mut self, level: usize) -> PResult<Expr> {
        if level >= LEVELS.len() {
            return self.parse_unary();
        }
        let mut lhs = self.parse_level(level + 1)?;
        loop {
            let Some(op) = self.binary_op(level) else {
                break;
            };
            self.advance();
            let rhs = self.parse_level(level + 1)?;
            let span = lhs.span.to(rhs.span);
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), span);
        }
        Ok(lhs)
    }

    fn binary_op(&self, level: usize) -> Option<BinOp> {
        let tok = self.peek();
        let in_template = self.template_depth > 0;
        LEVELS[level]
            .iter()
            .find(|(p, _)| tok.is(*p))
            .filter(|(p, _)| !(in_template && matches!(p, Punct::Gt | Punct::Shr | Punct::GtEq)))
            .map(|(_, op)| *op)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Punct(Punct::Minus) => Some(UnaryOp::Neg),
            TokenKind::Punct(Punct::Plus) => Some(UnaryOp::Plus),
            TokenKind::Punct(Punct::Bang) => Some(UnaryOp::Not),
            TokenKind::Punct(Punct::Tilde) => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            let start = self.advance().span;
            let operand = self.parse_unary()?;
            let span = start.to(operand.span);
            return Ok(Expr::new(ExprKind::Unary(op, Box::new(operand)), span));
        }
        let primary = self.parse_primary()?;
        self.parse_postfix(primary)
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> PResult<Expr> {
        loop {
            if self.check(Punct::LBracket) && !self.nth(1).is(Punct::LBracket) {
                self.advance();
                let index = self.parse_expr_in_parens_context()?;
                self.expect(Punct::RBracket)?;
                let span = expr.span.to(self.prev_span());
                expr = Expr::new(ExprKind::Index(Box::new(expr), Box::new(index)), span);
            } else if self.eat(Punct::Dot) {
                let (member, _) = match self.peek().kind {
                    // `parent.parent.x`
                    TokenKind::Keyword(Keyword::Parent) => {
                        let span = self.advance().span;
                        (self.interner.intern("parent"), span)
                    }
                    _ => self.expect_ident()?,
                };
                let span = expr.span.to(self.prev_span());
                expr = Expr::new(ExprKind::Member(Box::new(expr), member), span);
            } else {
                return Ok(expr);
            }
        }
    }

    /// Parse an expression where `>` compares again, as inside `(...)`
    fn parse_expr_in_parens_context(&mut self) -> PResult<Expr> {
        let depth = std::mem::replace(&mut self.template_depth, 0);
        let result = self.parse_expr();
        self.template_depth = depth;
        result
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let tok = self.peek().clone();
        let simple = match &tok.kind {
            TokenKind::Int(v) => Some(ExprKind::Int(*v)),
            TokenKind::Float(v) => Some(ExprKind::Float(*v)),
            TokenKind::Str(s) => Some(ExprKind::Str(s.clone())),
            TokenKind::Char(c) => Some(ExprKind::Char(*c)),
            TokenKind::Keyword(Keyword::True) => Some(ExprKind::Bool(true)),
            TokenKind::Keyword(Keyword::False) => Some(ExprKind::Bool(false)),
            TokenKind::Keyword(Keyword::Null) => Some(ExprKind::Null),
            TokenKind::Keyword(Keyword::This) => Some(ExprKind::This),
            TokenKind::Keyword(Keyword::Parent) => Some(ExprKind::Parent),
            TokenKind::Punct(Punct::Dollar) => Some(ExprKind::Dollar),
            _ => None,
        };
        if let Some(kind) = simple {
            self.advance();
            return Ok(Expr::new(kind, tok.span));
        }

        match tok.kind {
            TokenKind::Punct(Punct::LParen) => {
                self.advance();
                let inner = self.parse_expr_in_parens_context()?;
                self.expect(Punct::RParen)?;
                Ok(inner)
            }
            TokenKind::Keyword(Keyword::Sizeof) | TokenKind::Keyword(Keyword::Typenameof) => {
                self.advance();
                self.expect(Punct::LParen)?;
                let operand = self.parse_type_or_expr()?;
                self.expect(Punct::RParen)?;
                let span = tok.span.to(self.prev_span());
                let kind = if tok.is_keyword(Keyword::Sizeof) {
                    ExprKind::Sizeof(Box::new(operand))
                } else {
                    ExprKind::Typenameof(Box::new(operand))
                };
                Ok(Expr::new(kind, span))
            }
            TokenKind::Keyword(Keyword::Addressof) => {
                self.advance();
                self.expect(Punct::LParen)?;
                let operand = self.parse_expr_in_parens_context()?;
                self.expect(Punct::RParen)?;
                let span = tok.span.to(self.prev_span());
                Ok(Expr::new(ExprKind::Addressof(Box::new(operand)), span))
            }
            TokenKind::Keyword(Keyword::Be) | TokenKind::Keyword(Keyword::Le) => self.parse_cast(),
            TokenKind::Ident(_) if self.builtin_at(0).is_some() && self.nth(1).is(Punct::LParen) => {
                self.parse_cast()
            }
            TokenKind::Ident(_) => {
                let path = self.parse_path()?;
                if self.check(Punct::LParen) {
                    let args = self.parse_call_args()?;
                    let span = tok.span.to(self.prev_span());
                    return Ok(Expr::new(ExprKind::Call(path, args), span));
                }
                let span = tok.span.to(self.prev_span());
                Ok(Expr::new(ExprKind::Path(path), span))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    /// `u32(x)`, `be u16(x)`
    fn parse_cast(&mut self) -> PResult<Expr> {
        let start = self.peek().span;
        let ty = self.parse_type()?;
        if !matches!(ty.kind, TypeKind::Builtin(_)) {
            return Err(CompileError::expected("invalid cast", "built-in type", ty.span));
        }
        self.expect(Punct::LParen)?;
        let value = self.parse_expr_in_parens_context()?;
        self.expect(Punct::RParen)?;
        let span = start.to(self.prev_span());
        Ok(Expr::new(ExprKind::Cast(Box::new(ty), Box::new(value)), span))
    }

    fn parse_call_args(&mut self) -> PResult<Vec<Expr>> {
        self.expect(Punct::LParen)?;
        let depth = std::mem::replace(&mut self.template_depth, 0);
        let result = (|| {
            let mut args = Vec::new();
            while !self.check(Punct::RParen) {
                args.push(self.parse_expr()?);
                if !self.eat(Punct::Comma) {
                    break;
                }
            }
            self.expect(Punct::RParen)?;
            Ok(args)
        })();
        self.template_depth = depth;
        result
    }

    /// Operand of `sizeof`/`typenameof`: a clear type syntax parses as a
    /// type, anything else as an expression (which may still name a type)
    fn parse_type_or_expr(&mut self) -> PResult<TypeOrExpr> {
        let is_type = match self.peek().kind {
            TokenKind::Keyword(Keyword::Be | Keyword::Le) => true,
            TokenKind::Ident(_) => {
                (self.builtin_at(0).is_some() && self.nth(1).is(Punct::RParen)) || {
                    let mut n = 1;
                    while self.nth(n).is(Punct::ColonColon) {
                        n += 2;
                    }
                    self.nth(n).is(Punct::Lt)
                }
            }
            _ => false,
        };
        if is_type {
            Ok(TypeOrExpr::Type(self.parse_type()?))
        } else {
            Ok(TypeOrExpr::Expr(self.parse_expr_in_parens_context()?))
        }
    }
}

fn is_place(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Path(_) | ExprKind::Index(..) | ExprKind::Member(..) | ExprKind::Dollar
    )
}

#[cfg(test)]
mod tests {
    use super::super::tests::parse;
    use crate::parser::ast::*;

    fn expr_of(src: &str) -> Expr {
        let ast = parse(&format!("fn f() {{ {}; }};", src));
        let StmtKind::Fn(def) = &ast.stmts[0].kind else {
            panic!("expected fn");
        };
        match &def.body[0].kind {
            StmtKind::Expr(e) => e.clone(),
            other => panic!("expected expression, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        let e = expr_of("1 + 2 * 3");
        let ExprKind::Binary(BinOp::Add, _, rhs) = e.kind else {
            panic!("expected add");
        };
        assert!(matches!(rhs.kind, ExprKind::Binary(BinOp::Mul, ..)));
    }

    #[test]
    fn test_logical_xor_level() {
        let e = expr_of("a && b ^^ c");
        assert!(matches!(e.kind, ExprKind::Binary(BinOp::Xor, ..)));
    }

    #[test]
    fn test_ternary_and_assignment() {
        let e = expr_of("x = a > 1 ? 2 : 3");
        let ExprKind::Assign(None, _, rhs) = e.kind else {
            panic!("expected assignment");
        };
        assert!(matches!(rhs.kind, ExprKind::Ternary(..)));
    }

    #[test]
    fn test_compound_assignment() {
        let e = expr_of("$ += 4");
        assert!(matches!(e.kind, ExprKind::Assign(Some(BinOp::Add), ..)));
    }

    #[test]
    fn test_call_member_index() {
        let e = expr_of("std::mem::read_unsigned(hdr.offsets[2], 4)");
        let ExprKind::Call(path, args) = e.kind else {
            panic!("expected call");
        };
        assert_eq!(path.len(), 3);
        assert!(matches!(args[0].kind, ExprKind::Index(..)));
    }

    #[test]
    fn test_cast_with_endian() {
        let e = expr_of("y = be u16(x)");
        let ExprKind::Assign(None, _, rhs) = e.kind else {
            panic!("expected assignment");
        };
        let ExprKind::Cast(ty, _) = rhs.kind else {
            panic!("expected cast");
        };
        assert_eq!(ty.endian, Some(crate::types::Endian::Big));
    }

    #[test]
    fn test_sizeof_type_and_expr() {
        let e = expr_of("sizeof(u32) + sizeof(hdr)");
        let ExprKind::Binary(_, lhs, rhs) = e.kind else {
            panic!("expected binary");
        };
        assert!(matches!(&lhs.kind, ExprKind::Sizeof(op) if matches!(**op, TypeOrExpr::Type(_))));
        assert!(matches!(&rhs.kind, ExprKind::Sizeof(op) if matches!(**op, TypeOrExpr::Expr(_))));
    }

    #[test]
    fn test_parent_chain() {
        let e = expr_of("parent.parent.count");
        let ExprKind::Member(inner, _) = e.kind else {
            panic!("expected member");
        };
        assert!(matches!(inner.kind, ExprKind::Member(..)));
    }

    #[test]
    fn test_template_value_arg_in_parens_compares() {
        let ast = parse("struct A<auto N> { u8 x[N]; }; A<(3 > 2)> a @ 0;");
        assert_eq!(ast.stmts.len(), 2);
    }

    #[test]
    fn test_assign_to_literal_rejected() {
        let (result, _) = super::super::tests::parse_with("fn f() { 1 = 2; };");
        assert!(result.is_err());
    }
}
