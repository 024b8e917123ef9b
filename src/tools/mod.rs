pub mod command;
pub mod line_buffer;
pub mod runner;

pub use command::{build_command, ValidatedCommand};
pub use runner::{ToolRunHandle, ToolRunner};
