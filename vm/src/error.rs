/// Status code reported for every rejected image.
pub const FORMAT_INVALID: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("invalid image at byte {offset}: {reason}")]
    FormatInvalid { offset: usize, reason: String },
}

impl LoadError {
    pub(crate) fn at(offset: usize, reason: impl Into<String>) -> Self {
        LoadError::FormatInvalid {
            offset,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            LoadError::FormatInvalid { .. } => FORMAT_INVALID,
        }
    }
}

/// Failures a host sees from [`Vm::run`](crate::Vm::run).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("no program has been begun on this VM")]
    NotBegun,
    #[error("uncaught {class}: {message}")]
    UncaughtException { class: String, message: String },
    #[error("undecodable instruction at {pc}")]
    InvalidInstruction { pc: usize },
    #[error("program needs {needed} registers, the VM has {capacity}")]
    RegisterOverflow { needed: usize, capacity: usize },
}
