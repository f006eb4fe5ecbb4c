pub mod cli;

pub use cli::{DiffStats, GitCli, GitCliError, WorktreeInfo};
