//! Subcommand handlers.

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use trackhook_core::{TrackhookConfig, TrackingBackend};
use trackhook_ml::tracking::client_from_config;
use trackhook_ml::training::TrainingExperiment;
use trackhook_ml::{
    CheckpointHook, CheckpointManager, CheckpointPublisher, InitOptions, LastCheckpointProvider,
    TrackingClient, TrainingRunner,
};

use crate::{BackendArg, Commands, ConfigAction};

pub(crate) async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Publish {
            experiment,
            backend,
            checkpoint_dir,
            init,
            keep_open,
        } => {
            let mut config = load(workspace)?;
            if let Some(backend) = backend {
                config.tracking.backend = match backend {
                    BackendArg::Local => TrackingBackend::Local,
                    BackendArg::Http => TrackingBackend::Http,
                };
            }
            if let Some(dir) = checkpoint_dir {
                config.checkpoint.dir = dir;
            }
            if !init.is_empty() {
                let options = config.tracking.init.get_or_insert_with(InitOptions::new);
                for pair in &init {
                    let (key, value) = parse_init_pair(pair)?;
                    options.insert(key, value);
                }
            }
            handle_publish(&config, workspace, &experiment, keep_open).await
        }
        Commands::Checkpoints {
            experiment,
            best,
            compare,
        } => {
            let config = load(workspace)?;
            let manager = CheckpointManager::new(
                resolve(workspace, &config.checkpoint.dir),
                config.checkpoint.max_checkpoints,
            );
            println!("{}", describe_checkpoints(&manager, &experiment, best, compare.as_deref())?);
            Ok(())
        }
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn describe_checkpoints(
    manager: &CheckpointManager,
    experiment: &str,
    best: bool,
    compare: Option<&[String]>,
) -> anyhow::Result<String> {
    if let Some([id_a, id_b]) = compare {
        return Ok(manager.compare(experiment, id_a, id_b)?);
    }

    let checkpoints: Vec<_> = if best {
        manager.best(experiment)?.into_iter().collect()
    } else {
        manager.list(experiment)?
    };
    if checkpoints.is_empty() {
        return Ok(format!("No checkpoints recorded for experiment '{experiment}'."));
    }

    let mut out = format!("Checkpoints for {experiment} ({}):", checkpoints.len());
    for c in &checkpoints {
        out.push_str(&format!(
            "\n  {}  epoch {:>4}  loss {:.6}  {:>10} bytes  {}",
            c.id,
            c.epoch,
            c.loss,
            c.size_bytes,
            c.path.display()
        ));
    }
    Ok(out)
}

async fn handle_publish(
    config: &TrackhookConfig,
    workspace: &Path,
    experiment_id: &str,
    keep_open: bool,
) -> anyhow::Result<()> {
    let mut tracking = config.tracking.clone();
    tracking.local_dir = resolve(workspace, &tracking.local_dir);
    let client = client_from_config(&tracking)?;
    tracing::debug!(
        experiment = experiment_id,
        backend = client.backend(),
        "Publishing last checkpoint"
    );

    let mut checkpoint = config.checkpoint.clone();
    checkpoint.dir = resolve(workspace, &checkpoint.dir);
    let hook = Arc::new(CheckpointHook::from_config(&checkpoint).resume(experiment_id)?);

    // The epochs ran elsewhere; completing the run fires the publisher exactly as
    // it would at the end of training.
    let experiment = TrainingExperiment::new(experiment_id, "external", 0).with_id(experiment_id);
    let mut runner = TrainingRunner::new(experiment)
        .with_hook(hook.clone())
        .with_hook(Arc::new(CheckpointPublisher::new(
            tracking.init.clone(),
            client.clone(),
        )));
    runner
        .complete()
        .await
        .with_context(|| format!("publishing experiment '{experiment_id}'"))?;

    match (hook.last_checkpoint(), client.session()) {
        (Some(path), Some(session)) => println!(
            "Uploaded {} to {} run {} {}",
            path.display(),
            session.backend,
            session.run_id,
            session.location.unwrap_or_default()
        ),
        _ => println!("No checkpoints recorded for experiment '{experiment_id}'; nothing uploaded."),
    }

    if !keep_open {
        client.finish().await?;
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            match trackhook_core::init_workspace_config(workspace)? {
                Some(path) => println!("Created default configuration at: {}", path.display()),
                None => println!(
                    "Configuration file already exists at: {}",
                    trackhook_core::config::workspace_config_path(workspace).display()
                ),
            }
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{toml_str}");
            Ok(())
        }
    }
}

fn load(workspace: &Path) -> anyhow::Result<TrackhookConfig> {
    trackhook_core::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))
}

fn resolve(workspace: &Path, path: &Path) -> std::path::PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// Split `key=value`, reading the value as JSON and falling back to a plain string.
fn parse_init_pair(pair: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, raw) = pair
        .split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got '{pair}'"))?;
    let key = key.trim();
    anyhow::ensure!(!key.is_empty(), "empty key in '{pair}'");
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
