//! `tiergated check`: validate a configuration file and summarize it.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;

use tiergate_config::GatewayConfig;
use tiergate_dispatch::{BUILTIN_COMMANDS, allowed_commands};

pub fn summarize(path: &Path) -> anyhow::Result<String> {
    let config = GatewayConfig::from_file(path, BUILTIN_COMMANDS)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    Ok(render(&config))
}

fn render(config: &GatewayConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "listen   {}", config.general.bind);
    let _ = writeln!(out, "host key {}", config.general.host_key.display());
    let _ = writeln!(out, "nomad    {}", config.general.nomad_binary.display());

    let _ = writeln!(out, "\ntiers:");
    for (name, tier) in &config.tiers {
        let _ = writeln!(
            out,
            "  {name:<12} {} prefixes [{}] listings [{}]{}",
            tier.url,
            tier.prefix.join(" "),
            tier.alias.join(" "),
            if tier.token.is_some() { " (token)" } else { "" }
        );
    }

    let _ = writeln!(out, "\nusers:");
    for (id, user) in &config.users {
        let prefixes = config.expand_prefix_groups(&user.prefix);
        let grants = if prefixes.is_empty() {
            "no prefixes, every command will be refused".to_string()
        } else {
            prefixes.join(" ")
        };
        let _ = writeln!(out, "  {id:<12} {:<20} [{grants}]", user.name);
    }

    if !config.alias.is_empty() {
        let _ = writeln!(out, "\naliases:");
        for (name, line) in &config.alias {
            let _ = writeln!(out, "  {name:<12} {line}");
        }
    }

    let _ = writeln!(out, "\ncommands: {}", allowed_commands(config).join(" "));
    out
}
