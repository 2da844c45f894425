//! Command line → [`CommandRecord`].
//!
//! ```text
//! tokens ─► empty? ─► alias ─► arity ─► allow-list ─► tty ─► CommandRecord
//!              │         (one pass)  │        │          │
//!              └──────────── Rejection ◄──────┴──────────┘
//! ```
//!
//! Parsing looks at the configuration only. Tier and target resolution
//! against a snapshot happen afterwards, in [`crate::authorize`].

use std::fmt;

use tiergate_config::GatewayConfig;
use tiergate_state::AllocationHandle;

/// Commands understood regardless of configuration.
pub const BUILTIN_COMMANDS: &[&str] = &[
    "logs", "ps", "tail", "inspect", "exec", "attach", "stop", "restart", "pstree", "info", "raw",
    "rawl", "di", "tcpdump", "ipset", "batch",
];

/// Commands that take at least one argument.
const NEEDS_ARG: &[&str] = &[
    "logs", "tail", "inspect", "exec", "attach", "stop", "restart", "raw", "rawl", "info", "di",
    "tcpdump", "ipset",
];

/// Commands that only make sense on a pseudo-terminal.
const NEEDS_TTY: &[&str] = &["exec", "attach", "ipset", "tcpdump"];

/// Why a command line was refused before anything ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Line shown to the user.
    pub message: String,
    /// Short reason for the audit log.
    pub reason: &'static str,
}

impl Rejection {
    pub fn new(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// What an accepted command acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A job on a resolved tier, optionally narrowed to one task group.
    Job {
        tier: String,
        job: String,
        group: Option<String>,
    },
    /// One task instance, addressed by short id.
    Allocation(AllocationHandle),
    /// Arguments for the nomad CLI against a resolved tier.
    Passthrough { tier: String, args: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub name: String,
    /// Arguments after alias expansion, without the command name.
    pub args: Vec<String>,
    pub needs_tty: bool,
    /// Tier the command runs against, once resolved.
    pub tier: Option<String>,
    pub target: Option<Target>,
}

impl CommandRecord {
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Command line as typed after expansion, for logs.
    pub fn line(&self) -> String {
        std::iter::once(self.name.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Split an SSH exec request into tokens with shell quoting rules.
pub fn split_command_line(line: &str) -> Result<Vec<String>, Rejection> {
    shlex::split(line).ok_or_else(|| Rejection::new("unbalanced quotes", "Unbalanced quotes in command"))
}

/// Every command name the configuration makes available.
pub fn allowed_commands(config: &GatewayConfig) -> Vec<String> {
    BUILTIN_COMMANDS
        .iter()
        .map(|c| c.to_string())
        .chain(config.tiers.values().flat_map(|t| t.alias.iter().cloned()))
        .collect()
}

fn usage(config: &GatewayConfig) -> String {
    format!("Only [{}] commands supported", allowed_commands(config).join(" "))
}

/// Validate the shape of a command line.
pub fn parse(config: &GatewayConfig, tokens: Vec<String>, tty: bool) -> Result<CommandRecord, Rejection> {
    let mut tokens = tokens.into_iter();
    let Some(first) = tokens.next() else {
        return Err(Rejection::new("empty command", usage(config)));
    };

    let mut expanded = config.alias_tokens(&first).unwrap_or_else(|| vec![first]);
    expanded.extend(tokens);
    let mut expanded = expanded.into_iter();
    let Some(name) = expanded.next() else {
        return Err(Rejection::new("empty command", usage(config)));
    };
    let args: Vec<String> = expanded.collect();

    if NEEDS_ARG.contains(&name.as_str()) && args.is_empty() {
        return Err(Rejection::new("missing argument", format!("Extra arg needed for {name}")));
    }

    let builtin = BUILTIN_COMMANDS.contains(&name.as_str());
    if !builtin && config.tier_for_listing(&name).is_none() {
        return Err(Rejection::new("unknown command", usage(config)));
    }

    let needs_tty = NEEDS_TTY.contains(&name.as_str());
    if needs_tty && !tty {
        return Err(Rejection::new("tty required", "You need a tty, run ssh -t"));
    }

    Ok(CommandRecord {
        name,
        args,
        needs_tty,
        tier: None,
        target: None,
    })
}
