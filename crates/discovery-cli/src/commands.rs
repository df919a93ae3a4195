//! Subcommand implementations. `serve` owns the long-running engine;
//! `plugins`/`cmdb` are one-shot inspection commands reusing the same
//! library types `serve` does.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use discovery_cmdb::Store;
use discovery_server::config::ServerConfig;
use discovery_server::engine::{Engine, spawn_background_tasks};
use discovery_server::plugin::{PluginLoader, PluginTable};
use discovery_server::registry::ToolRegistry;
use discovery_server::session::SessionManager;
use discovery_server::builtin;
use discovery_server::plugin;
use discovery_transport::amqp::AmqpTransport;
use discovery_transport::http::HttpTransport;
use discovery_transport::stdio::StdioTransport;

use crate::cli::{CmdbCommand, PluginsCommand};

/// Start the engine on every transport named by `TRANSPORT_MODE`
/// (`spec.md` §6), blocking until `SIGINT`/`SIGTERM`.
pub async fn serve() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    tracing::info!(?config.transport_mode, "starting discovery MCP server");

    let store = Arc::new(Store::open(&config.cmdb_path, &config.cmdb_key_file).await?);
    let registry = Arc::new(ToolRegistry::new());
    builtin::register_all(&registry, Arc::clone(&store))?;

    let plugin_loader = Arc::new(PluginLoader::new(config.strict_capabilities));
    let plugin_table = Arc::new(PluginTable::new());
    plugin::load_all(&plugin_loader, &registry, &plugin_table, &config.plugins_dir);
    plugin::spawn_hot_reload(
        Arc::clone(&plugin_loader),
        Arc::clone(&registry),
        Arc::clone(&plugin_table),
        config.plugins_dir.clone(),
    );

    let sessions = Arc::new(SessionManager::new(config.http_session_ttl));
    let engine = Engine::new(Arc::clone(&registry), Arc::clone(&sessions), &config);

    spawn_background_tasks(&sessions, Duration::from_secs(60));

    use discovery_server::config::TransportMode;
    let wants_stdio = matches!(config.transport_mode, TransportMode::Stdio | TransportMode::All);
    let wants_http = matches!(config.transport_mode, TransportMode::Http | TransportMode::All);
    let wants_amqp = matches!(config.transport_mode, TransportMode::Amqp | TransportMode::All);

    if wants_stdio {
        engine.attach_transport(Arc::new(StdioTransport::new())).await?;
    }
    if wants_http {
        let http = HttpTransport::new(
            config.http_bind_addr(),
            config.http_allowed_origins.clone(),
            Arc::clone(&registry) as Arc<dyn discovery_transport::ToolCatalog>,
        );
        engine.attach_transport(Arc::new(http)).await?;
    }
    if wants_amqp {
        let Some(amqp_url) = &config.amqp_url else {
            anyhow::bail!("TRANSPORT_MODE requests amqp but AMQP_URL is not set");
        };
        let amqp = AmqpTransport::new(amqp_url.clone());
        engine.attach_transport(Arc::new(amqp)).await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    Ok(())
}

/// `plugins list`: validate every subdirectory of the plugins root and
/// print a pass/fail summary.
pub fn plugins_list(command: PluginsCommand) -> anyhow::Result<()> {
    let PluginsCommand::List { dir } = command;
    let config = ServerConfig::from_env();
    let plugins_dir = dir.unwrap_or(config.plugins_dir);
    let loader = PluginLoader::new(config.strict_capabilities);

    let entries = match std::fs::read_dir(&plugins_dir) {
        Ok(entries) => entries,
        Err(err) => {
            println!("no plugins directory at {}: {err}", plugins_dir.display());
            return Ok(());
        }
    };

    let scratch_registry = ToolRegistry::new();
    for entry in entries {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        report_plugin(&loader, &entry.path(), &scratch_registry);
    }
    Ok(())
}

/// Runs the full load sequence (not just manifest validation) against a
/// throwaway registry so `plugins list` reports the same pass/fail a real
/// `serve()` startup would, including step 6/7.
fn report_plugin(loader: &PluginLoader, dir: &Path, registry: &ToolRegistry) {
    match loader.load(dir, registry) {
        Ok(loaded) => {
            println!(
                "{} {} — ok ({} tool(s))",
                loaded.manifest.name,
                loaded.manifest.version,
                loaded.tool_names.len()
            );
            loader.unload(&loaded.manifest.name, registry);
        }
        Err(err) => println!("{} — FAILED: {err}", dir.display()),
    }
}

/// `cmdb stats`: print row counts for every CMDB table.
pub async fn cmdb_stats(command: CmdbCommand) -> anyhow::Result<()> {
    let CmdbCommand::Stats { db, key } = command;
    let config = ServerConfig::from_env();
    let db_path: PathBuf = db.unwrap_or(config.cmdb_path);
    let key_path: PathBuf = key.unwrap_or(config.cmdb_key_file);

    let store = Store::open(&db_path, &key_path).await?;
    let stats = store.stats().await?;
    println!("configuration items: {}", stats.ci_count);
    println!("relationships:       {}", stats.relationship_count);
    println!("credentials:         {}", stats.credential_count);
    Ok(())
}
