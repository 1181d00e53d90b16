//! Register an application and its tasks

use std::collections::HashMap;

use anyhow::Context;
use colored::Colorize;

use crate::commands::{report, required};
use crate::filesys::file::File;
use crate::models::application::{Application, Task};
use crate::storage::applications::{ApplicationStore, JsonFileStore};
use crate::storage::layout::StorageLayout;

/// Run `--add-app --name=<n> --tasks=<file> [--description=<d>]`
pub async fn add_app(cli_args: &HashMap<String, String>, layout: &StorageLayout) {
    report("Adding application", add_app_impl(cli_args, layout).await);
}

async fn add_app_impl(
    cli_args: &HashMap<String, String>,
    layout: &StorageLayout,
) -> anyhow::Result<()> {
    let name = required(cli_args, "name")?;
    let tasks_path = required(cli_args, "tasks")?;

    let tasks: Vec<Task> = File::new(tasks_path)
        .read_json()
        .await
        .with_context(|| format!("Couldn't read tasks from {}", tasks_path))?;

    layout.setup().await?;
    let store = JsonFileStore::new(layout.applications_file().path());
    let (app, secret) = register(&store, name, cli_args.get("description"), tasks).await?;

    println!("{} Added application {} ({})", "[SUCCESS]".green().bold(), app.id, app.name);
    for task in app.ordered_tasks() {
        println!("  priority {:>3}  {}", task.priority, task.kind());
    }
    println!();
    println!("Deploy secret (shown once): {}", secret.yellow());
    Ok(())
}

/// Store a new application under the next free ID
async fn register(
    store: &JsonFileStore,
    name: &str,
    description: Option<&String>,
    tasks: Vec<Task>,
) -> anyhow::Result<(Application, String)> {
    let next_id = store
        .list_applications()
        .await?
        .iter()
        .map(|app| app.id)
        .max()
        .unwrap_or(0)
        + 1;

    let (mut app, secret) = Application::new(next_id, name, tasks);
    if let Some(description) = description {
        app.description = description.clone();
    }
    store.save_application(&app).await?;
    Ok((app, secret))
}
