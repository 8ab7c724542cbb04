#[cfg(any(use_cpu, test))]
pub mod common_cpu;
