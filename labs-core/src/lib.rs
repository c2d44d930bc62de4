//! Shared building blocks for the workshop lab orchestrator: the common error
//! type, external command execution and infra-safe naming.

pub mod command_stream;
pub mod error;
pub mod naming;

pub use command_stream::{run_captured, CommandOutput, CommandSpec};
pub use error::{LabsError, Result};
pub use naming::{sanitize_identifier, validate_identifier};
