//! Publish a deployment job from the command line

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context};
use colored::Colorize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::commands::{parse_arg, report, required};
use crate::models::job::DeployJob;
use crate::mqtt::client::{self, MqttConnection};
use crate::queue::{Messenger, APP_DEPLOY_QUEUE};
use crate::utils::generate_token;

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `--enqueue --id=<n> [--commit=<c>] [--release=<v>]`
pub async fn enqueue(cli_args: &HashMap<String, String>, mut options: client::Options) {
    // A distinct client id keeps the worker's session untouched
    options.broker_address.client_id = format!(
        "{}-enqueue-{}",
        options.broker_address.client_id,
        &generate_token()[..8]
    );
    report("Enqueue", enqueue_impl(cli_args, &options).await);
}

fn build_job(cli_args: &HashMap<String, String>) -> anyhow::Result<DeployJob> {
    let id: u64 = required(cli_args, "id")?
        .parse()
        .context("Invalid value for --id")?;

    let mut job = DeployJob::new(id);
    job.commit = cli_args.get("commit").cloned();
    job.version = cli_args.get("release").cloned();
    Ok(job)
}

async fn enqueue_impl(
    cli_args: &HashMap<String, String>,
    options: &client::Options,
) -> anyhow::Result<()> {
    let job = build_job(cli_args)?;
    let queue: String = parse_arg(cli_args, "queue", APP_DEPLOY_QUEUE.to_string())?;
    let payload = job.encode()?;

    let MqttConnection {
        messenger,
        confirmed,
        event_loop,
        ..
    } = client::connect(options, None, Box::pin(std::future::pending::<()>()))?;

    messenger.publish(&queue, payload).await?;
    if let Err(e) = wait_for_confirmation(confirmed, CONFIRM_TIMEOUT).await {
        event_loop.abort();
        return Err(e);
    }
    messenger.disconnect().await?;

    if tokio::time::timeout(FLUSH_TIMEOUT, event_loop).await.is_err() {
        warn!("Broker did not confirm the disconnect in time");
    }

    println!(
        "{} Enqueued deployment of application {} on {}",
        "[SUCCESS]".green().bold(),
        job.id,
        queue
    );
    Ok(())
}

/// Wait until the broker has confirmed at least one publish
async fn wait_for_confirmation(
    mut confirmed: watch::Receiver<u64>,
    timeout: Duration,
) -> anyhow::Result<()> {
    match tokio::time::timeout(timeout, confirmed.wait_for(|count| *count > 0)).await {
        Ok(Ok(_)) => {
            debug!("Broker confirmed the message");
            Ok(())
        }
        Ok(Err(_)) => Err(anyhow!("Broker connection closed before the message was confirmed")),
        Err(_) => Err(anyhow!(
            "Broker did not confirm the message within {:?}",
            timeout
        )),
    }
}
