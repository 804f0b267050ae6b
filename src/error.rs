use std::fmt;

#[derive(Debug, Clone)]
pub enum ErrorKind {
    // Operand of the wrong variant, e.g. 1 + "a".
    TypeMismatch(String),
    // Access to a global name the VM never defined.
    UndefinedGlobal(String),
    // Call target is not a closure, native, or coroutine.
    BadCallTarget(String),
    // Wrong number of arguments for a closure or coroutine.
    ArityMismatch { expected: usize, got: usize },
    // List index outside [0, len).
    IndexOutOfRange(String),
    // More than FRAMES_MAX nested calls.
    StackOverflow,
    // Awaiting a coroutine that already ran to completion (or errored).
    CoroutineCompleted,
    // Awaiting a coroutine that is on the current resume chain.
    CoroutineRunning,
    // `yield` reached outside any coroutine.
    YieldOutsideCoroutine,
    // A native function reported failure.
    NativeError(String),
    // Corrupt bytecode or a broken VM invariant.
    Internal(String),
}

impl ErrorKind {
    pub fn message(&self) -> String {
        match self {
            ErrorKind::TypeMismatch(message) => message.clone(),
            ErrorKind::UndefinedGlobal(name) => format!("Undefined variable '{}'.", name),
            ErrorKind::BadCallTarget(message) => message.clone(),
            ErrorKind::ArityMismatch { expected, got } => {
                format!("Expected {} arguments but got {}.", expected, got)
            }
            ErrorKind::IndexOutOfRange(message) => message.clone(),
            ErrorKind::StackOverflow => "Stack overflow.".to_string(),
            ErrorKind::CoroutineCompleted => "Coroutine has already completed.".to_string(),
            ErrorKind::CoroutineRunning => "Coroutine is already running.".to_string(),
            ErrorKind::YieldOutsideCoroutine => {
                "Can only yield inside a coroutine.".to_string()
            }
            ErrorKind::NativeError(message) => message.clone(),
            ErrorKind::Internal(message) => format!("Internal error: {}", message),
        }
    }
}

/// One entry of the unwound call chain, innermost first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: usize,
    pub function: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind) -> Self {
        RuntimeError {
            kind,
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind.message())?;
        for frame in &self.trace {
            match &frame.function {
                Some(name) if !name.is_empty() => {
                    writeln!(f, "[line {}] in {}()", frame.line, name)?;
                }
                Some(_) => writeln!(f, "[line {}] in ()", frame.line)?,
                None => writeln!(f, "[line {}] in script", frame.line)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_message_and_trace() {
        let mut error = RuntimeError::new(ErrorKind::UndefinedGlobal("missing".to_string()));
        error.trace.push(TraceFrame {
            line: 3,
            function: Some("inner".to_string()),
        });
        error.trace.push(TraceFrame {
            line: 7,
            function: None,
        });
        let rendered = error.to_string();
        assert!(rendered.contains("Undefined variable 'missing'."));
        assert!(rendered.contains("[line 3] in inner()"));
        assert!(rendered.contains("[line 7] in script"));
    }

    #[test]
    fn arity_mismatch_names_both_counts() {
        let error = RuntimeError::new(ErrorKind::ArityMismatch {
            expected: 2,
            got: 3,
        });
        assert_eq!(error.kind.message(), "Expected 2 arguments but got 3.");
    }
}
