// Token-level preprocessor: #include, import, #define, #ifdef and #pragma
//
// Every included or imported file becomes its own `SourceUnit`, so spans of
// spliced tokens still point at the file they came from.

use crate::error::{CompileError, CompileStage};
use crate::lexer::token::{Keyword, Punct, Token, TokenKind};
use crate::lexer::Lexer;
use crate::name::{Name, StringInterner};
use crate::span::{SourceId, SourceMap, SourceUnit, Span};
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::PathBuf;

const MAX_INCLUDE_DEPTH: usize = 64;
const MAX_EXPANSION_DEPTH: usize = 32;

/// Trait for resolving #include paths
pub trait IncludeResolver {
    fn resolve(&self, path: &str, is_system: bool) -> Option<String>;

    /// `import a.b.c;` looks for `a/b/c.hexpat`, then `a/b/c.pat`.
    /// Returns the file name used and its contents.
    fn resolve_import(&self, segments: &[&str]) -> Option<(String, String)> {
        let stem = segments.join("/");
        ["hexpat", "pat"].iter().find_map(|ext| {
            let path = format!("{}.{}", stem, ext);
            self.resolve(&path, true).map(|text| (path, text))
        })
    }
}

/// Default resolver that always fails (no includes available)
pub struct NoopResolver;

impl IncludeResolver for NoopResolver {
    fn resolve(&self, _path: &str, _is_system: bool) -> Option<String> {
        None
    }
}

/// Map-based resolver, used by tests and by hosts that keep sources in memory
#[derive(Default)]
pub struct MapResolver {
    files: FxHashMap<String, String>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }
}

impl IncludeResolver for MapResolver {
    fn resolve(&self, path: &str, _is_system: bool) -> Option<String> {
        self.files.get(path).cloned()
    }
}

/// Searches a list of directories, first match wins
#[derive(Debug, Clone, Default)]
pub struct FsResolver {
    paths: Vec<PathBuf>,
}

impl FsResolver {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl IncludeResolver for FsResolver {
    fn resolve(&self, path: &str, _is_system: bool) -> Option<String> {
        self.paths.iter().find_map(|dir| {
            let candidate = dir.join(path);
            match std::fs::read_to_string(&candidate) {
                Ok(text) => {
                    tracing::debug!(path = %candidate.display(), "resolved include");
                    Some(text)
                }
                Err(_) => None,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PragmaOutcome {
    Accepted,
    /// Known pragma, malformed value
    Rejected,
    Unknown,
}

/// Receives every `#pragma name value` in active code, in source order
pub trait PragmaSink {
    fn pragma(&mut self, name: &str, value: &str) -> PragmaOutcome;
}

impl<F: FnMut(&str, &str) -> PragmaOutcome> PragmaSink for F {
    fn pragma(&mut self, name: &str, value: &str) -> PragmaOutcome {
        self(name, value)
    }
}

#[derive(Debug, Clone, Copy)]
struct IfState {
    active: bool,
    seen_true: bool,
    else_seen: bool,
}

/// Preprocessor that runs between lexing and parsing
pub struct Preprocessor<'a> {
    resolver: &'a dyn IncludeResolver,
    pragmas: &'a mut dyn PragmaSink,
    interner: &'a mut StringInterner,
    sources: &'a mut SourceMap,
    defines: FxHashMap<Name, Vec<Token>>,
    /// Files that declared `#pragma once`
    once: FxHashSet<String>,
    imported: FxHashSet<String>,
    errors: Vec<CompileError>,
}

impl<'a> Preprocessor<'a> {
    pub fn new(
        resolver: &'a dyn IncludeResolver,
        pragmas: &'a mut dyn PragmaSink,
        interner: &'a mut StringInterner,
        sources: &'a mut SourceMap,
    ) -> Self {
        let mut pp = Self {
            resolver,
            pragmas,
            interner,
            sources,
            defines: FxHashMap::default(),
            once: FxHashSet::default(),
            imported: FxHashSet::default(),
            errors: Vec::new(),
        };
        pp.define("__IMHEX__", "1");
        pp.define(
            "__HEXPAT_VERSION__",
            &format!("\"{}\"", env!("CARGO_PKG_VERSION")),
        );
        pp
    }

    /// Add a predefined macro
    pub fn define(&mut self, name: &str, value: &str) {
        let key = self.interner.intern(name);
        let (mut tokens, _) = Lexer::new(value, SourceId(u32::MAX), self.interner).tokenize();
        tokens.retain(|t| t.kind != TokenKind::Eof);
        self.defines.insert(key, tokens);
    }

    /// Process the main unit, returning the expanded token stream
    pub fn process(mut self, source: &str, name: &str) -> Result<Vec<Token>, Vec<CompileError>> {
        let mut out = Vec::new();
        self.process_unit(source, name, true, 0, &mut out);
        let end = out.last().map(|t| t.span).unwrap_or_default();
        out.push(Token::new(TokenKind::Eof, Span::new(end.end, end.end, end.source_id)));
        if self.errors.is_empty() {
            Ok(out)
        } else {
            Err(self.errors)
        }
    }

    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.errors
            .push(CompileError::new(CompileStage::Preprocess, message, span));
    }

    fn process_unit(&mut self, text: &str, name: &str, is_main: bool, depth: usize, out: &mut Vec<Token>) {
        let id = self.sources.add(SourceUnit::new(name, text, is_main));
        let (tokens, lex_errors) = Lexer::new(text, id, self.interner).tokenize();
        self.errors.extend(lex_errors);

        let mut if_stack: Vec<IfState> = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let tok = &tokens[i];
            i += 1;
            let active = if_stack.iter().all(|s| s.active);
            match &tok.kind {
                TokenKind::Eof => break,
                TokenKind::Directive {
                    name: directive,
                    args,
                    args_offset,
                } => {
                    if self.conditional(directive, args, tok.span, &mut if_stack) || !active {
                        continue;
                    }
                    match directive.as_str() {
                        "define" => self.directive_define(args, *args_offset, id, tok.span),
                        "undef" => {
                            if args.is_empty() {
                                self.error("#undef requires a name", tok.span);
                            } else {
                                let key = self.interner.intern(args);
                                self.defines.remove(&key);
                            }
                        }
                        "error" => self.error(format!("#error: {}", args), tok.span),
                        "include" => self.directive_include(args, tok.span, depth, out),
                        "pragma" => {
                            if self.directive_pragma(args, name, tok.span) {
                                out.push(tok.clone());
                            }
                        }
                        other => self.error(format!("unknown directive '#{}'", other), tok.span),
                    }
                }
                _ if !active => {}
                TokenKind::Keyword(Keyword::Import) => {
                    let end = tokens[i..]
                        .iter()
                        .position(|t| t.is(Punct::Semi) || t.kind == TokenKind::Eof)
                        .map(|p| i + p)
                        .unwrap_or(tokens.len() - 1);
                    self.import(&tokens[i..end], tok.span, depth, out);
                    // keep the statement itself for the parser
                    if tokens[end].kind == TokenKind::Eof {
                        out.extend_from_slice(&tokens[i - 1..end]);
                        i = end;
                    } else {
                        out.extend_from_slice(&tokens[i - 1..=end]);
                        i = end + 1;
                    }
                }
                TokenKind::Ident(ident) if self.defines.contains_key(ident) => {
                    let mut expanding = Vec::new();
                    self.expand(*ident, tok.span, &mut expanding, out);
                }
                _ => out.push(tok.clone()),
            }
        }
        if !if_stack.is_empty() {
            let span = tokens.last().map(|t| t.span).unwrap_or_default();
            self.error("unterminated #ifdef/#ifndef", span);
        }
    }

    /// Handles #ifdef/#ifndef/#else/#endif; returns false for other directives
    fn conditional(&mut self, directive: &str, args: &str, span: Span, if_stack: &mut Vec<IfState>) -> bool {
        let active = if_stack.iter().all(|s| s.active);
        match directive {
            "ifdef" | "ifndef" => {
                let defined = self
                    .interner
                    .get(args)
                    .map(|n| self.defines.contains_key(&n))
                    .unwrap_or(false);
                let taken = active && (defined == (directive == "ifdef"));
                if_stack.push(IfState {
                    active: taken,
                    // a nested conditional in an inactive block never activates
                    seen_true: taken || !active,
                    else_seen: false,
                });
            }
            "else" => match if_stack.len().checked_sub(1) {
                Some(last) => {
                    if if_stack[last].else_seen {
                        self.error("duplicate #else", span);
                    }
                    let parent_active = if_stack[..last].iter().all(|s| s.active);
                    let state = &mut if_stack[last];
                    state.else_seen = true;
                    state.active = parent_active && !state.seen_true;
                }
                None => self.error("#else without matching #ifdef/#ifndef", span),
            },
            "endif" => {
                if if_stack.pop().is_none() {
                    self.error("#endif without matching #ifdef/#ifndef", span);
                }
            }
            _ => return false,
        }
        true
    }

    fn directive_define(&mut self, args: &str, args_offset: u32, id: SourceId, span: Span) {
        let name_len = args
            .find(|c: char| c.is_whitespace())
            .unwrap_or(args.len());
        if name_len == 0 {
            self.error("#define requires a name", span);
            return;
        }
        let key = self.interner.intern(&args[..name_len]);
        let rest = &args[name_len..];
        let value = rest.trim_start();
        let value_offset = args_offset + (name_len + rest.len() - value.len()) as u32;
        let (mut tokens, errors) = Lexer::fragment(value, value_offset, id, self.interner).tokenize();
        self.errors.extend(errors);
        tokens.retain(|t| t.kind != TokenKind::Eof);
        self.defines.insert(key, tokens);
    }

    fn directive_include(&mut self, args: &str, span: Span, depth: usize, out: &mut Vec<Token>) {
        let (path, is_system) = if args.len() >= 2 && args.starts_with('"') && args.ends_with('"') {
            (&args[1..args.len() - 1], false)
        } else if args.len() >= 2 && args.starts_with('<') && args.ends_with('>') {
            (&args[1..args.len() - 1], true)
        } else {
            self.error(format!("invalid #include syntax: {}", args), span);
            return;
        };
        if self.once.contains(path) {
            return;
        }
        if depth >= MAX_INCLUDE_DEPTH {
            self.error(
                format!("include depth exceeded (max {})", MAX_INCLUDE_DEPTH),
                span,
            );
            return;
        }
        match self.resolver.resolve(path, is_system) {
            Some(text) => {
                let path = path.to_string();
                self.process_unit(&text, &path, false, depth + 1, out);
            }
            None => self.error(format!("cannot find include file '{}'", path), span),
        }
    }

    /// Returns whether the directive should be kept for the parser
    fn directive_pragma(&mut self, args: &str, unit: &str, span: Span) -> bool {
        let (name, value) = match args.split_once(char::is_whitespace) {
            Some((name, value)) => (name, value.trim()),
            None => (args, ""),
        };
        if name.is_empty() {
            self.error("#pragma requires a name", span);
            return false;
        }
        if name == "once" {
            self.once.insert(unit.to_string());
            return true;
        }
        match self.pragmas.pragma(name, value) {
            PragmaOutcome::Accepted => true,
            PragmaOutcome::Rejected => {
                self.error(
                    format!("invalid value for pragma '{}': '{}'", name, value),
                    span,
                );
                false
            }
            PragmaOutcome::Unknown => {
                self.error(format!("unknown pragma '{}'", name), span);
                false
            }
        }
    }

    /// `import a.b.c [as x];`: splice the file in front of the statement
    fn import(&mut self, body: &[Token], span: Span, depth: usize, out: &mut Vec<Token>) {
        let mut segments = Vec::new();
        for (n, tok) in body.iter().enumerate() {
            match (&tok.kind, n % 2) {
                (TokenKind::Ident(name), 0) => segments.push(self.interner.resolve(*name).to_string()),
                (TokenKind::Punct(Punct::Dot), 1) => {}
                (TokenKind::Keyword(Keyword::As), 1) => break,
                _ => {
                    self.error("malformed import statement", tok.span);
                    return;
                }
            }
        }
        if segments.is_empty() {
            self.error("import requires a path", span);
            return;
        }
        let parts: Vec<&str> = segments.iter().map(String::as_str).collect();
        let Some((file, text)) = self.resolver.resolve_import(&parts) else {
            self.error(format!("cannot find import '{}'", parts.join(".")), span);
            return;
        };
        if !self.imported.insert(file.clone()) || self.once.contains(&file) {
            return;
        }
        if depth >= MAX_INCLUDE_DEPTH {
            self.error(
                format!("include depth exceeded (max {})", MAX_INCLUDE_DEPTH),
                span,
            );
            return;
        }
        self.process_unit(&text, &file, false, depth + 1, out);
    }

    /// Replace a macro use by its tokens, spanned at the use site
    fn expand(&mut self, name: Name, span: Span, expanding: &mut Vec<Name>, out: &mut Vec<Token>) {
        if expanding.contains(&name) || expanding.len() >= MAX_EXPANSION_DEPTH {
            out.push(Token::new(TokenKind::Ident(name), span));
            return;
        }
        let Some(body) = self.defines.get(&name).cloned() else {
            out.push(Token::new(TokenKind::Ident(name), span));
            return;
        };
        expanding.push(name);
        for tok in body {
            match tok.kind {
                TokenKind::Ident(inner) if self.defines.contains_key(&inner) => {
                    self.expand(inner, span, expanding, out)
                }
                kind => out.push(Token::new(kind, span)),
            }
        }
        expanding.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_all(_: &str, _: &str) -> PragmaOutcome {
        PragmaOutcome::Accepted
    }

    fn run(source: &str, resolver: &dyn IncludeResolver) -> (Result<Vec<Token>, Vec<CompileError>>, StringInterner, SourceMap) {
        let mut interner = StringInterner::new();
        let mut sources = SourceMap::new();
        let mut sink = accept_all;
        let result = Preprocessor::new(resolver, &mut sink, &mut interner, &mut sources).process(source, "<main>");
        (result, interner, sources)
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (result, _, _) = run(source, &NoopResolver);
        result.expect("preprocess failed").into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_define_replaces_whole_tokens() {
        let kinds = kinds("#define SIZE 0x10\nu8 data[SIZE]; u8 SIZED;");
        assert!(kinds.contains(&TokenKind::Int(0x10)));
        assert_eq!(kinds.iter().filter(|k| matches!(k, TokenKind::Int(_))).count(), 1);
    }

    #[test]
    fn test_ifdef_else() {
        let with = kinds("#define A\n#ifdef A\n1;\n#else\n2;\n#endif");
        assert!(with.contains(&TokenKind::Int(1)));
        assert!(!with.contains(&TokenKind::Int(2)));
        let without = kinds("#ifndef A\n1;\n#else\n2;\n#endif");
        assert!(without.contains(&TokenKind::Int(1)));
    }

    #[test]
    fn test_nested_inactive_else_stays_inactive() {
        let k = kinds("#ifdef NOPE\n#ifdef ALSO\n1;\n#else\n2;\n#endif\n#endif\n3;");
        assert!(!k.contains(&TokenKind::Int(1)));
        assert!(!k.contains(&TokenKind::Int(2)));
        assert!(k.contains(&TokenKind::Int(3)));
    }

    #[test]
    fn test_predefined_imhex() {
        let k = kinds("#ifdef __IMHEX__\n7;\n#endif");
        assert!(k.contains(&TokenKind::Int(7)));
    }

    #[test]
    fn test_error_directive() {
        let (result, _, _) = run("#error nope", &NoopResolver);
        let errors = result.unwrap_err();
        assert!(errors[0].message.contains("nope"));
    }

    #[test]
    fn test_unterminated_conditional() {
        let (result, _, _) = run("#ifdef X\n", &NoopResolver);
        assert!(result.is_err());
    }

    #[test]
    fn test_include_spliced_as_own_unit() {
        let mut resolver = MapResolver::new();
        resolver.add("a.hexpat", "u8 from_a;");
        let (result, _, sources) = run("#include \"a.hexpat\"\nu8 main_var;", &resolver);
        let tokens = result.unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(tokens[0].span.source_id, SourceId(1));
        assert_eq!(tokens[3].span.source_id, SourceId(0));
    }

    #[test]
    fn test_pragma_once() {
        let mut resolver = MapResolver::new();
        resolver.add("a.hexpat", "#pragma once\nu8 x;");
        let (result, _, _) = run("#include \"a.hexpat\"\n#include \"a.hexpat\"", &resolver);
        let idents = result
            .unwrap()
            .iter()
            .filter(|t| matches!(t.kind, TokenKind::Ident(_)))
            .count();
        assert_eq!(idents, 2);
    }

    #[test]
    fn test_import_once_and_kept() {
        let mut resolver = MapResolver::new();
        resolver.add("std/mem.pat", "u8 m;");
        let (result, _, _) = run("import std.mem;\nimport std.mem;", &resolver);
        let tokens = result.unwrap();
        let imports = tokens.iter().filter(|t| t.is_keyword(Keyword::Import)).count();
        assert_eq!(imports, 2);
        let semis = tokens.iter().filter(|t| t.is(Punct::Semi)).count();
        assert_eq!(semis, 3);
    }

    #[test]
    fn test_missing_import() {
        let (result, _, _) = run("import nothing.here;", &NoopResolver);
        assert!(result.unwrap_err()[0].message.contains("nothing.here"));
    }

    #[test]
    fn test_pragma_dispatch() {
        let mut interner = StringInterner::new();
        let mut sources = SourceMap::new();
        let mut seen = Vec::new();
        let mut sink = |name: &str, value: &str| {
            seen.push(format!("{}={}", name, value));
            match name {
                "endian" if value == "big" => PragmaOutcome::Accepted,
                "endian" => PragmaOutcome::Rejected,
                _ => PragmaOutcome::Unknown,
            }
        };
        let result = Preprocessor::new(&NoopResolver, &mut sink, &mut interner, &mut sources)
            .process("#pragma endian big\n#pragma endian sideways\n#pragma bogus 1\n", "<main>");
        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("invalid value"));
        assert!(errors[1].message.contains("unknown pragma"));
        assert_eq!(seen, vec!["endian=big", "endian=sideways", "bogus=1"]);
    }

    #[test]
    fn test_recursive_define_terminates() {
        let k = kinds("#define A B\n#define B A\nA;");
        assert_eq!(k.len(), 3);
    }
}
