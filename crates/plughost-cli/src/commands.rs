//! Subcommand handlers.
//!
//! Each handler is a thin call into one component plus formatting.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use plughost_executor::{ExecutionContext, ExecutionResult, Executor};
use plughost_loader::Loader;
use plughost_registry::{PluginEntry, Registry};
use plughost_sandbox::Sandbox;
use tracing::{info, warn};

use crate::cli::Commands;
use crate::config::HostConfig;

/// The four components wired together.
pub struct Host {
    pub registry: Registry,
    pub loader: Loader,
    pub executor: Executor,
}

impl Host {
    pub fn open(config: &HostConfig) -> Result<Self> {
        let registry_file = config.paths.registry_file();
        let registry = Registry::open(&registry_file).with_context(|| {
            format!(
                "failed to open plugin registry at {}",
                registry_file.display()
            )
        })?;
        let loader = Loader::new(registry.clone(), config.loader_config());
        let sandbox = Arc::new(Sandbox::new(config.sandbox_config()));
        let executor = Executor::new(registry.clone(), sandbox, config.executor_config());

        info!(
            registry = %registry_file.display(),
            plugins = registry.len(),
            "host ready"
        );
        Ok(Self {
            registry,
            loader,
            executor,
        })
    }

    /// Stop every plugin process and release sandbox sessions.
    pub async fn shutdown(&self) {
        let unloaded = self.executor.cleanup_all().await;
        let sessions = self.executor.sandbox().cleanup_all().await;
        if unloaded > 0 || sessions > 0 {
            info!(unloaded, sessions, "host shut down");
        }
    }
}

pub async fn run(host: &Host, command: Commands) -> Result<()> {
    match command {
        Commands::Install {
            source,
            version,
            force,
            local,
        } => cmd_install(host, &source, version.as_deref(), force, local).await,
        Commands::Update { id } => cmd_update(host, &id).await,
        Commands::List => {
            cmd_list(&host.registry);
            Ok(())
        }
        Commands::Info { id } => cmd_info(&host.registry, &id),
        Commands::Remove { id, keep_files } => cmd_remove(&host.loader, &id, keep_files).await,
        Commands::Test { id } => cmd_test(&host.executor, &id).await,
        Commands::Execute {
            id,
            procedure,
            input_json,
        } => cmd_execute(&host.executor, &id, &procedure, &input_json).await,
        Commands::Search { query } => {
            cmd_search(&host.registry, &query);
            Ok(())
        }
        Commands::Trending { limit } => {
            cmd_trending(&host.registry, limit);
            Ok(())
        }
        Commands::Stats => cmd_stats(&host.registry),
    }
}

// ---------------------------------------------------------------------------
// Catalog management
// ---------------------------------------------------------------------------

async fn cmd_install(
    host: &Host,
    source: &str,
    version: Option<&str>,
    force: bool,
    local: bool,
) -> Result<()> {
    let path = Path::new(source);
    let entry = if local || path.is_dir() {
        if version.is_some() {
            warn!("--version is ignored for local installs");
        }
        host.loader
            .install_from_local(path, force)
            .await
            .with_context(|| format!("failed to install plugin from {source}"))?
    } else {
        host.loader
            .install_from_git(source, version, force)
            .await
            .with_context(|| format!("failed to install plugin from {source}"))?
    };

    println!();
    println!(
        "  Installed {} v{} ({})",
        entry.manifest.id, entry.manifest.version, entry.manifest.name
    );
    println!("  Path:       {}", entry.local_path.display());
    println!("  Procedures: {}", procedure_list(&entry));
    println!();
    println!("  Try it with `plughost test {}`.", entry.manifest.id);
    println!();
    Ok(())
}

async fn cmd_update(host: &Host, id: &str) -> Result<()> {
    let entry = host
        .loader
        .update(id)
        .await
        .with_context(|| format!("failed to update plugin {id}"))?;
    println!(
        "  Updated {} to v{}",
        entry.manifest.id, entry.manifest.version
    );
    Ok(())
}

async fn cmd_remove(loader: &Loader, id: &str, keep_files: bool) -> Result<()> {
    let removed = loader
        .uninstall(id, !keep_files)
        .await
        .with_context(|| format!("failed to remove plugin {id}"))?;
    if !removed {
        bail!("plugin `{id}` is not installed");
    }
    println!("  Removed {id}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

fn cmd_list(registry: &Registry) {
    let entries = registry.list();
    if entries.is_empty() {
        println!("  No plugins installed.");
        return;
    }

    println!();
    println!("  Installed plugins ({}):", entries.len());
    println!();
    for entry in &entries {
        println!("  {}", summary_line(entry));
    }
    println!();
}

fn cmd_info(registry: &Registry, id: &str) -> Result<()> {
    let Some(entry) = registry.get(id) else {
        bail!("plugin `{id}` is not installed");
    };
    let manifest = &entry.manifest;
    let metrics = &entry.performance_metrics;

    println!();
    println!("  {} v{}", manifest.name, manifest.version);
    println!("  {}", "=".repeat(manifest.name.len() + manifest.version.len() + 2));
    println!();
    println!("  Id:           {}", manifest.id);
    println!("  Author:       {}", manifest.author);
    println!("  Description:  {}", manifest.description);
    println!("  Category:     {}", manifest.category);
    println!("  Capabilities: {}", join_or_dash(manifest.capabilities.iter()));
    println!("  Procedures:   {}", procedure_list(&entry));
    println!("  Permissions:  {}", join_or_dash(manifest.permissions.iter()));
    println!();
    println!("  Source:       {}", entry.source);
    println!("  Path:         {}", entry.local_path.display());
    println!("  Installed:    {}", entry.installed_at.to_rfc3339());
    println!("  Updated:      {}", entry.last_updated.to_rfc3339());
    println!(
        "  Status:       {}",
        if entry.is_active { "active" } else { "inactive" }
    );
    println!();
    println!("  Usage:        {}", entry.usage_count);
    println!("  Success rate: {:.0}%", metrics.success_rate * 100.0);
    println!("  Avg duration: {:.1} ms", metrics.avg_duration_ms);
    if let Some(last_used) = metrics.last_used {
        println!("  Last used:    {}", last_used.to_rfc3339());
    }
    println!("  Rarity:       {}", entry.rarity());
    println!("  Score:        {:.1}", entry.overall_score());
    println!();
    Ok(())
}

fn cmd_search(registry: &Registry, query: &str) {
    let results = registry.search(query);
    if results.is_empty() {
        println!("  No plugins match `{query}`.");
        return;
    }
    println!();
    for entry in &results {
        println!("  {:>6.1}  {}", entry.overall_score(), summary_line(entry));
    }
    println!();
}

fn cmd_trending(registry: &Registry, limit: usize) {
    let entries = registry.trending(limit);
    if entries.is_empty() {
        println!("  Nothing has been used yet.");
        return;
    }
    println!();
    for (rank, entry) in entries.iter().enumerate() {
        println!(
            "  {:>2}. {:<24} {:>6} uses  {}",
            rank + 1,
            entry.manifest.id,
            entry.usage_count,
            entry.rarity()
        );
    }
    println!();
}

fn cmd_stats(registry: &Registry) -> Result<()> {
    let stats = registry.collection_stats();
    let rendered =
        serde_json::to_string_pretty(&stats).context("failed to render collection stats")?;
    println!("{rendered}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

async fn cmd_test(executor: &Executor, id: &str) -> Result<()> {
    let result = executor.test(id).await;
    report(&result)?;
    if !result.success {
        bail!(
            "self-test of `{id}` failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!(
        "  Self-test of {id} passed in {} ms.",
        result.performance_metrics.duration_ms
    );
    Ok(())
}

async fn cmd_execute(executor: &Executor, id: &str, procedure: &str, input_json: &str) -> Result<()> {
    let input = parse_input(input_json)?;
    let result = executor
        .execute(id, procedure, input, &ExecutionContext::new("cli", "cli"))
        .await;
    report(&result)?;
    if !result.success {
        bail!(
            "{id}/{procedure} failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn parse_input(input_json: &str) -> Result<serde_json::Value> {
    serde_json::from_str(input_json).context("input is not valid JSON")
}

fn report(result: &ExecutionResult) -> Result<()> {
    let rendered = serde_json::to_string_pretty(result).context("failed to render result")?;
    println!("{rendered}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn summary_line(entry: &PluginEntry) -> String {
    let status = if entry.is_active { "" } else { "  [inactive]" };
    format!(
        "{:<24} v{:<10} {:<12} {:>6} uses{}",
        entry.manifest.id, entry.manifest.version, entry.manifest.category, entry.usage_count, status
    )
}

fn procedure_list(entry: &PluginEntry) -> String {
    join_or_dash(entry.manifest.procedure_ids())
}

fn join_or_dash<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = items
        .into_iter()
        .map(|s| s.as_ref().to_owned())
        .collect::<Vec<_>>()
        .join(", ");
    if joined.is_empty() {
        "-".to_owned()
    } else {
        joined
    }
}
