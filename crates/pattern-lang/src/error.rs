// Diagnostics: compile errors, evaluation errors and the crate-level error type

use crate::project::ProjectError;
use crate::provider::{ProviderError, ProviderId};
use crate::registry::RegistryError;
use crate::span::{Location, SourceMap, Span};
use std::fmt;

/// Front-end phase that produced a compile error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStage {
    Preprocess,
    Lex,
    Parse,
    Resolve,
}

impl fmt::Display for CompileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompileStage::Preprocess => "preprocessor",
            CompileStage::Lex => "lexer",
            CompileStage::Parse => "parser",
            CompileStage::Resolve => "resolver",
        })
    }
}

/// One error from preprocessing, lexing, parsing or name resolution
#[derive(Debug, Clone)]
pub struct CompileError {
    pub stage: CompileStage,
    pub message: String,
    pub span: Span,
    pub location: Location,
    /// What the parser wanted instead, when known
    pub expected: Option<String>,
}

impl CompileError {
    pub fn new(stage: CompileStage, message: impl Into<String>, span: Span) -> Self {
        Self {
            stage,
            message: message.into(),
            span,
            location: Location::unknown(),
            expected: None,
        }
    }

    pub fn expected(message: impl Into<String>, expected: impl Into<String>, span: Span) -> Self {
        Self {
            expected: Some(expected.into()),
            ..Self::new(CompileStage::Parse, message, span)
        }
    }

    pub fn located(mut self, sources: &SourceMap) -> Self {
        self.location = sources.locate(self.span);
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} error: {}", self.location, self.stage, self.message)?;
        if let Some(expected) = &self.expected {
            write!(f, " (expected {})", expected)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Stable classification of evaluation failures, so hosts can react to
/// specific kinds (for example raise the pattern ceiling on `RunawayGuard`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    OutOfBounds,
    RunawayGuard,
    PermissionDenied,
    UnknownExtension,
    TypeMismatch,
    UndefinedName,
    DivisionByZero,
    RecursionLimit,
    ArrayLimit,
    LoopLimit,
    ArityMismatch,
    InvalidPlacement,
    Assertion,
    NativeFailure,
    /// Cancellation travelling up the stack; never reported as an error
    Aborted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::OutOfBounds => "OutOfBounds",
            ErrorCode::RunawayGuard => "RunawayGuard",
            ErrorCode::PermissionDenied => "PermissionDenied",
            ErrorCode::UnknownExtension => "UnknownExtension",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::UndefinedName => "UndefinedName",
            ErrorCode::DivisionByZero => "DivisionByZero",
            ErrorCode::RecursionLimit => "RecursionLimit",
            ErrorCode::ArrayLimit => "ArrayLimit",
            ErrorCode::LoopLimit => "LoopLimit",
            ErrorCode::ArityMismatch => "ArityMismatch",
            ErrorCode::InvalidPlacement => "InvalidPlacement",
            ErrorCode::Assertion => "Assertion",
            ErrorCode::NativeFailure => "NativeFailure",
            ErrorCode::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call-stack entry of an evaluation error
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub function: String,
    pub location: Location,
}

/// Terminal evaluation failure
#[derive(Debug, Clone)]
pub struct EvalError {
    pub code: ErrorCode,
    pub message: String,
    pub span: Option<Span>,
    pub location: Option<Location>,
    /// Innermost first
    pub call_stack: Vec<Frame>,
}

impl EvalError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            span: None,
            location: None,
            call_stack: Vec::new(),
        }
    }

    pub fn at(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        Self {
            span: Some(span),
            ..Self::new(code, message)
        }
    }

    pub fn aborted() -> Self {
        Self::new(ErrorCode::Aborted, "evaluation aborted")
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TypeMismatch, message)
    }

    pub fn is_aborted(&self) -> bool {
        self.code == ErrorCode::Aborted
    }

    /// Attach a span only if the error does not carry one yet
    pub fn or_span(mut self, span: Span) -> Self {
        if self.span.is_none() {
            self.span = Some(span);
        }
        self
    }

    pub fn push_frame(&mut self, function: impl Into<String>, location: Location) {
        self.call_stack.push(Frame {
            function: function.into(),
            location,
        });
    }

    pub fn located(mut self, sources: &SourceMap) -> Self {
        if self.location.is_none() {
            self.location = self.span.map(|s| sources.locate(s));
        }
        self
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = &self.location {
            write!(f, "{}: ", loc)?;
        }
        write!(f, "evaluation error [{}]: {}", self.code, self.message)?;
        for frame in &self.call_stack {
            write!(f, "\n  in {} at {}", frame.function, frame.location)?;
        }
        Ok(())
    }
}

impl std::error::Error for EvalError {}

impl From<ProviderError> for EvalError {
    fn from(e: ProviderError) -> Self {
        EvalError::new(ErrorCode::OutOfBounds, e.to_string())
    }
}

/// Top-level error type for the crate
#[derive(Debug)]
pub enum Error {
    Compile(Vec<CompileError>),
    Eval(EvalError),
    Provider(ProviderError),
    Registry(RegistryError),
    Project(ProjectError),
    UnknownProvider(ProviderId),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Compile(errs) => {
                for (i, e) in errs.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
            Error::Eval(e) => write!(f, "{}", e),
            Error::Provider(e) => write!(f, "{}", e),
            Error::Registry(e) => write!(f, "{}", e),
            Error::Project(e) => write!(f, "{}", e),
            Error::UnknownProvider(id) => write!(f, "no runtime is attached to {}", id),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Json(e) => write!(f, "manifest error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Eval(e) => Some(e),
            Error::Provider(e) => Some(e),
            Error::Registry(e) => Some(e),
            Error::Project(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Compile(_) | Error::UnknownProvider(_) => None,
        }
    }
}

impl From<Vec<CompileError>> for Error {
    fn from(e: Vec<CompileError>) -> Self {
        Error::Compile(e)
    }
}

impl From<EvalError> for Error {
    fn from(e: EvalError) -> Self {
        Error::Eval(e)
    }
}

impl From<ProviderError> for Error {
    fn from(e: ProviderError) -> Self {
        Error::Provider(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

impl From<ProjectError> for Error {
    fn from(e: ProjectError) -> Self {
        Error::Project(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{SourceId, SourceUnit};

    #[test]
    fn test_compile_error_display_has_location() {
        let mut sources = SourceMap::new();
        sources.add(SourceUnit::new("<main>", "u8 x @ ;\n", true));
        let err = CompileError::expected("unexpected ';'", "expression", Span::new(7, 8, SourceId(0)))
            .located(&sources);
        assert_eq!(
            err.to_string(),
            "<main>:1:8: parser error: unexpected ';' (expected expression)"
        );
    }

    #[test]
    fn test_eval_error_call_stack_display() {
        let mut err = EvalError::new(ErrorCode::DivisionByZero, "division by zero");
        err.push_frame("helper", Location {
            source: "<main>".into(),
            line: 4,
            column: 5,
            length: 1,
        });
        let text = err.to_string();
        assert!(text.contains("[DivisionByZero]"));
        assert!(text.contains("in helper at <main>:4:5"));
    }

    #[test]
    fn test_or_span_keeps_first() {
        let first = Span::new(1, 2, SourceId(0));
        let err = EvalError::at(ErrorCode::TypeMismatch, "x", first).or_span(Span::new(5, 6, SourceId(0)));
        assert_eq!(err.span, Some(first));
    }

    #[test]
    fn test_provider_error_maps_to_out_of_bounds() {
        let err: EvalError = ProviderError::OutOfBounds {
            offset: 0x100,
            len: 4,
            end: 0x100,
        }
        .into();
        assert_eq!(err.code, ErrorCode::OutOfBounds);
    }
}
