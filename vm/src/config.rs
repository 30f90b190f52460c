/// Register-file capacity of a VM.
pub const MAX_REGS_SIZE: usize = 110;
/// Deepest call-info chain before `SystemStackError`.
pub const MAX_CALLINFO_DEPTH: usize = 64;
/// Nested host re-entries (natives yielding to blocks) a VM accepts.
pub const CATCH_STACK_SIZE: usize = 5;

/// Runtime limits and switches of one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub max_regs: usize,
    pub max_callinfo_depth: usize,
    pub catch_stack_size: usize,
    /// Trace every retired instruction at `log::Level::Trace`.
    pub debug: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_regs: MAX_REGS_SIZE,
            max_callinfo_depth: MAX_CALLINFO_DEPTH,
            catch_stack_size: CATCH_STACK_SIZE,
            debug: false,
        }
    }
}

impl VmConfig {
    pub fn with_max_regs(mut self, max_regs: usize) -> Self {
        self.max_regs = max_regs;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_callinfo_depth = depth;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_compile_time_limits() {
        let config = VmConfig::default();
        assert_eq!(config.max_regs, 110);
        assert_eq!(config.max_callinfo_depth, 64);
        assert_eq!(config.catch_stack_size, 5);
        assert!(!config.debug);

        let tuned = config.with_max_regs(32).with_max_depth(4).with_debug(true);
        assert_eq!((tuned.max_regs, tuned.max_callinfo_depth, tuned.debug), (32, 4, true));
    }
}
