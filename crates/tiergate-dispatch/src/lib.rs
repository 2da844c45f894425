//! tiergate-dispatch — the command surface behind each SSH exec request.
//!
//! ```text
//! public key ──► identity::resolve_principal ──► Principal
//!
//! exec line ──► parser::split_command_line ──► Dispatcher::run
//!                                                ├── parser::parse
//!                                                ├── authorize::authorize
//!                                                └── execute
//!                                                     ├── render   (ps, pstree, info, batch)
//!                                                     ├── JobControl (stop, restart, inspect)
//!                                                     ├── Bridge   (exec, attach, logs, di, ...)
//!                                                     └── raw      (nomad cli passthrough)
//! ```
//!
//! Every accepted or rejected command is logged on the [`AUDIT`] target.

pub mod authorize;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod parser;
pub mod raw;
pub mod render;

/// Tracing target for authentication and command audit events.
pub const AUDIT: &str = "tiergate::audit";

pub use authorize::{authorize, authorize_raw};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult};
pub use identity::resolve_principal;
pub use parser::{BUILTIN_COMMANDS, CommandRecord, Rejection, Target, allowed_commands, parse, split_command_line};
pub use raw::run_passthrough;
