//! Print a host's key fingerprint so it can be pinned on a task

use std::collections::HashMap;
use std::time::Duration;

use colored::Colorize;

use crate::commands::{parse_arg, report, required};
use crate::deploy::remote::fetch_fingerprint;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Host to read the key from; the key is presented before authentication so
/// the user is only echoed back
#[derive(Debug, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    user: Option<String>,
}

impl Target {
    fn from_args(cli_args: &HashMap<String, String>) -> anyhow::Result<Self> {
        Ok(Self {
            host: required(cli_args, "host")?.to_string(),
            port: parse_arg(cli_args, "port", 22)?,
            user: cli_args.get("user").filter(|u| !u.is_empty()).cloned(),
        })
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}@{}:{}", user, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Run `--fingerprint --host=<h> [--port=22] [--user=<u>]`
pub async fn fingerprint(cli_args: &HashMap<String, String>) {
    report("Fingerprint", fingerprint_impl(cli_args).await);
}

async fn fingerprint_impl(cli_args: &HashMap<String, String>) -> anyhow::Result<()> {
    let target = Target::from_args(cli_args)?;

    println!("Connecting to {}...", target);
    let fingerprint = fetch_fingerprint(&target.host, target.port, CONNECT_TIMEOUT).await?;

    println!("{} {}", "Host key fingerprint:".green().bold(), fingerprint);
    println!("The key has not been added to the trust store; it is learned on the first deployment that pins it.");
    Ok(())
}
