/// Configuration for the STM coordinator.
#[derive(Debug, Clone)]
pub struct StmConfig {
    /// When false, redirection is identity and start/commit are no-ops; the
    /// calling runtime need not branch on this.
    pub enabled: bool,
    /// Number of worker threads the runtime drives. Must be at least 1.
    pub thread_count: usize,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thread_count: 4,
        }
    }
}
