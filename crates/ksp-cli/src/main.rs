use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ksp_core::{
    build::BuildPipeline,
    config::Config,
    events::spawn_logger,
    store::{read_installed, INSTALLED_FILE},
    PluginManager, ProcessHost, RuntimeStatus, Server,
};
use ksp_plugin_sdk::parse_manifest;
use regex::Regex;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG: &str = "ksp.toml";

#[derive(Parser, Debug)]
#[command(name = "ksp", author, version, about = "KubeStellar plugin runtime")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the plugin host with the supplied configuration file.
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Validate or print configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Check plugin manifests.
    Manifest {
        #[command(subcommand)]
        command: ManifestCommands,
    },
    /// Run the loader's static checks on a prebuilt artifact without launching it.
    Validate {
        #[arg(long, value_name = "FILE")]
        artifact: PathBuf,
        #[arg(long, value_name = "FILE")]
        manifest: PathBuf,
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Inspect or clear the build cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Inspect installed plugins.
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Dump the resolved configuration as JSON.
    Diag {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints the bundled example configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum ManifestCommands {
    /// Parses and validates a plugin.toml.
    Check {
        #[arg(value_name = "FILE")]
        manifest: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    Info {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    Clear {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// Lists plugins recorded in the installed metadata.
    List {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    match cli.command {
        Commands::Serve { config } => handle_serve(config).await,
        Commands::Config { command } => handle_config(command),
        Commands::Manifest { command } => handle_manifest(command),
        Commands::Validate {
            artifact,
            manifest,
            config,
        } => handle_validate(artifact, manifest, config).await,
        Commands::Cache { command } => handle_cache(command).await,
        Commands::Plugins { command } => handle_plugins(command),
        Commands::Diag { config } => handle_diag(config),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().ok();
    Ok(())
}

async fn handle_serve(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    config.validate()?;
    let manager = Arc::new(PluginManager::new(&config, Arc::new(ProcessHost::new()))?);
    let _logger = spawn_logger(manager.events());

    if config.plugins.restore_on_start {
        let report = manager.restore().await?;
        for (id, reason) in &report.failed {
            tracing::warn!(plugin = %id, %reason, "plugin not restored");
        }
    }
    for (source, result) in manager.autoload(&config.plugins.autoload).await {
        if let Err(err) = result {
            tracing::warn!(%source, error = %err, "autoload failed");
        }
    }

    let server = Server::new(&config, manager)?;
    server.run().await
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            println!("{}", include_str!("../../../demos/config/ksp.toml"));
        }
    }
    Ok(())
}

fn handle_manifest(command: ManifestCommands) -> Result<()> {
    match command {
        ManifestCommands::Check { manifest } => {
            let bytes = fs::read(&manifest)
                .with_context(|| format!("failed to read manifest {}", manifest.display()))?;
            let parsed = parse_manifest(&bytes)
                .with_context(|| format!("invalid manifest {}", manifest.display()))?;
            println!("manifest OK: {} v{}", parsed.id, parsed.version);
            for route in &parsed.routes {
                println!("  {} {} -> {}", route.method, route.path, route.handler);
            }
            for dependency in &parsed.dependencies {
                println!("  requires {} {}", dependency.id, dependency.version);
            }
        }
    }
    Ok(())
}

async fn handle_validate(artifact: PathBuf, manifest: PathBuf, config: PathBuf) -> Result<()> {
    let config = load_config(&config)?;
    let manager = PluginManager::new(&config, Arc::new(ProcessHost::new()))?;
    let report = manager.validate(&artifact, &manifest).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn handle_cache(command: CacheCommands) -> Result<()> {
    match command {
        CacheCommands::Info { config } => {
            let cfg = load_config(&config)?;
            let pipeline = BuildPipeline::open(cfg.build, cfg.plugins.cache_dir)?;
            println!("{}", serde_json::to_string_pretty(&pipeline.cache_info())?);
        }
        CacheCommands::Clear { config } => {
            let cfg = load_config(&config)?;
            let pipeline = BuildPipeline::open(cfg.build, cfg.plugins.cache_dir)?;
            let cleared = pipeline.clear_cache().await?;
            println!("removed {cleared} cached build(s)");
        }
    }
    Ok(())
}

fn handle_plugins(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List { config } => {
            let cfg = load_config(&config)?;
            let path = cfg.plugins.root.join(INSTALLED_FILE);
            let records = read_installed(&path)?;
            if records.is_empty() {
                println!("no plugins installed under {}", cfg.plugins.root.display());
            }
            for record in records {
                let mut flags = record.install_method.clone();
                if !record.enabled {
                    flags.push_str(", disabled");
                }
                if record.status == RuntimeStatus::Failed {
                    flags.push_str(", failed to restore");
                }
                println!("- {} v{} [{flags}] from {}", record.id, record.version, record.source);
            }
        }
    }
    Ok(())
}

fn handle_diag(path: PathBuf) -> Result<()> {
    let cfg = load_config(&path)?;
    let json = serde_json::to_string_pretty(&cfg)?;
    println!("{json}");
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    let mut cfg = toml::from_str::<Config>(&expanded)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok());
    Ok(cfg)
}

fn interpolate_env(input: &str) -> Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]+))?\}").unwrap());
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_example_config_is_valid() {
        let raw = interpolate_env(include_str!("../../../demos/config/ksp.toml")).unwrap();
        let cfg: Config = toml::from_str(&raw).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.listeners.len(), 1);
    }

    #[test]
    fn env_placeholders_fall_back_to_defaults() {
        let out = interpolate_env("root = \"${KSP_TEST_UNSET_DIR:/srv/plugins}\"").unwrap();
        assert_eq!(out, "root = \"/srv/plugins\"");
        let out = interpolate_env("x = \"${KSP_TEST_UNSET_OTHER}\"").unwrap();
        assert_eq!(out, "x = \"\"");
    }

    #[test]
    fn load_config_reads_and_validates_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ksp.toml");
        fs::write(
            &path,
            "[[listeners]]\nname = \"main\"\nbind = \"127.0.0.1:9090\"\n\n[plugins]\nroot = \"${KSP_TEST_UNSET_ROOT:/tmp/ksp-plugins}\"\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.listeners[0].bind, "127.0.0.1:9090");
    }

    #[test]
    fn cli_parses_serve_and_validate() {
        let cli = Cli::try_parse_from(["ksp", "serve", "-c", "custom.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { config } if config == Path::new("custom.toml")));

        let cli = Cli::try_parse_from([
            "ksp",
            "validate",
            "--artifact",
            "demo/demo",
            "--manifest",
            "demo/plugin.toml",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Validate { .. }));
    }
}
