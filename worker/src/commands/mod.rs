//! Operator commands run from the CLI instead of the worker

pub mod add_app;
pub mod enqueue;
pub mod fingerprint;

use std::collections::HashMap;

use anyhow::{anyhow, Context};
use colored::Colorize;

/// Print the outcome of a command and exit non-zero on failure
pub(crate) fn report(name: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        eprintln!("\n{} {} failed: {:#}", "[ERROR]".red().bold(), name, e);
        std::process::exit(1);
    }
}

pub(crate) fn required<'a>(cli_args: &'a HashMap<String, String>, key: &str) -> anyhow::Result<&'a str> {
    cli_args
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("Missing --{}=<value>", key))
}

pub(crate) fn parse_arg<T>(cli_args: &HashMap<String, String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match cli_args.get(key) {
        Some(value) => value
            .parse()
            .with_context(|| format!("Invalid value for --{}: {}", key, value)),
        None => Ok(default),
    }
}
