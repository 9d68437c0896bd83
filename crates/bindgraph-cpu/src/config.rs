// Runtime configuration

/// Configuration for [`crate::CpuRuntime`].
#[derive(Debug, Clone)]
pub struct CpuRuntimeConfig {
    /// Seed for stochastic operators (dropout masks). Every plan starts its
    /// generator from this seed.
    pub seed: u64,
    /// Element count at or above which element-wise kernels run on the rayon
    /// thread pool (default: 32768).
    pub parallel_threshold: usize,
}

impl Default for CpuRuntimeConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            parallel_threshold: 1 << 15,
        }
    }
}

impl CpuRuntimeConfig {
    /// Set the dropout seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the parallel threshold. `usize::MAX` keeps every kernel serial.
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }
}
