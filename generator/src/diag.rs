// diag.rs — Unified diagnostics model
//
// Shared diagnostic types used by every generation pass. A diagnostic names
// the quantity it is about (array, constraint, flag) instead of a source
// location: the input is a structured problem description, not text.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0001`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered diagnostic codes.
pub mod codes {
    use super::DiagCode;

    /// Dimension out of range.
    pub const E0001: DiagCode = DiagCode("E0001");
    /// Module or external function name is not a valid C identifier.
    pub const E0002: DiagCode = DiagCode("E0002");
    /// Inconsistent flag combination.
    pub const E0003: DiagCode = DiagCode("E0003");
    /// Levenberg-Marquardt factor negative or not finite.
    pub const E0004: DiagCode = DiagCode("E0004");
    /// Given matrix or vector has the wrong shape.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// Bound vector length does not match the bounded quantity.
    pub const E0101: DiagCode = DiagCode("E0101");
    /// Weighting given although variable weighting was requested.
    pub const E0102: DiagCode = DiagCode("E0102");
    /// Point constraint attached to a node outside the horizon.
    pub const E0200: DiagCode = DiagCode("E0200");
    /// Point-constraint output width does not divide evenly.
    pub const E0201: DiagCode = DiagCode("E0201");
    /// Path-constraint shape mismatch.
    pub const E0202: DiagCode = DiagCode("E0202");
    /// Storage shape mismatch or duplicate declaration.
    pub const E0300: DiagCode = DiagCode("E0300");
    /// Window reaches outside its array.
    pub const E0301: DiagCode = DiagCode("E0301");
    /// Program verification failed.
    pub const E0600: DiagCode = DiagCode("E0600");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A generator diagnostic emitted by any pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    /// The quantity that failed validation (`"qpLb"`, `"pointConstraints[2]"`).
    pub subject: Option<String>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, subject, or hint.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            subject: None,
            message: message.into(),
            hint: None,
        }
    }

    /// Shorthand for an error-level diagnostic with a code.
    pub fn error(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Name the quantity the diagnostic is about.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: ", level, code)?;
        } else {
            write!(f, "{}: ", level)?;
        }
        if let Some(subject) = &self.subject {
            write!(f, "{}: ", subject)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// True if any diagnostic in the slice is an error.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(Diagnostic::is_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code_and_subject() {
        let d = Diagnostic::error(codes::E0201, "width 7 is not a multiple of 4")
            .with_subject("pointConstraints[1]");
        assert_eq!(
            format!("{d}"),
            "error[E0201]: pointConstraints[1]: width 7 is not a multiple of 4"
        );
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::new(DiagLevel::Warning, "unused bound")
            .with_code(codes::E0101)
            .with_subject("bounds.x[0]")
            .with_hint("state bounds on node 0 are ignored");

        assert_eq!(d.code, Some(codes::E0101));
        assert_eq!(d.subject.as_deref(), Some("bounds.x[0]"));
        assert_eq!(d.hint.as_deref(), Some("state bounds on node 0 are ignored"));
        assert!(!d.is_error());
        assert!(!has_errors(&[d]));
    }
}
