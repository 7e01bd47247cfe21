pub mod cli;
#[cfg(test)]
pub mod memory;
pub mod ssh;
pub mod templates;
