//! Host-tunable knobs that the distilled opcode spec leaves implicit.

/// Configuration a host supplies when constructing a [`crate::Vm`].
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum number of undo snapshots retained; oldest is dropped on
    /// overflow. Default 8, per the resource-bound section of the spec.
    pub undo_depth: usize,

    /// Fixed seed for the xoshiro128** random source. `None` means seed
    /// from host entropy the first time `setrandom(0)` or an uninitialised
    /// `random` opcode is executed.
    pub random_seed: Option<[u32; 4]>,

    /// If set, `run()` stops at an instruction boundary once this many
    /// instructions have been executed, returning `StepOutcome::StepLimitReached`.
    pub max_steps: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            undo_depth: 8,
            random_seed: None,
            max_steps: None,
        }
    }
}
