use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use tracing::info;

use crate::display;
use crate::logging;

use lobster_core::config::LobsterdConfig;
use lobster_core::error::Error as LobsterError;
use lobster_core::registry::RegistryStore;
use lobster_runtime::bootstrap;
use lobster_runtime::drivers::caddy::CaddyDriver;
use lobster_runtime::drivers::vsock::VsockClient;
use lobster_runtime::drivers::ssh;
use lobster_runtime::lifecycle::{Progress, TenantOps};
use lobster_watchdog::Watchdog;

#[derive(Parser)]
#[command(
    name = "lobsterd",
    version,
    about = "Firecracker microVM tenant orchestrator"
)]
struct Cli {
    /// Emit machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify host prerequisites and set up directories, config, and proxy
    Init,
    /// Create a tenant end to end
    Spawn {
        /// Tenant name (DNS label)
        name: String,
    },
    /// Destroy a tenant and all its resources
    Evict {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
        /// Take a final ZFS snapshot before destroying the dataset
        #[arg(long)]
        snapshot: bool,
    },
    /// Reconcile live resources against the registry
    Molt {
        /// Single tenant to reconcile (default: whole fleet plus orphan sweep)
        name: Option<String>,
    },
    /// List tenants with live status probes
    List,
    /// Snapshot a tenant's dataset
    Snap {
        name: String,
        /// Prune to the configured retention afterwards
        #[arg(long)]
        prune: bool,
    },
    /// Run the watchdog loops until interrupted
    Watch {
        /// JSON logs for running under a supervisor
        #[arg(long)]
        daemon: bool,
    },
    /// One-shot fleet overview
    Tank,
    /// Fetch logs from a tenant's in-guest agent
    Logs {
        name: String,
        /// Restrict to one service
        #[arg(short = 's', long)]
        service: Option<String>,
    },
    /// Open a shell (or run a command) inside the tenant over SSH
    Exec {
        name: String,
        /// Command to run; omit for an interactive shell
        #[arg(last = true)]
        cmd: Vec<String>,
    },
}

/// CLI entrypoint: parse, dispatch, map errors to one line + exit code.
pub fn run() -> i32 {
    let cli = Cli::parse();
    let daemon = matches!(cli.command, Commands::Watch { daemon: true });
    logging::init(daemon);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {}", e);
            return 1;
        }
    };

    let json = cli.json;
    match runtime.block_on(dispatch(cli)) {
        Ok(()) => 0,
        Err(err) => fail(err, json),
    }
}

fn fail(err: anyhow::Error, json: bool) -> i32 {
    let (code, message) = match err.downcast_ref::<LobsterError>() {
        Some(e) => (e.code(), e.to_string()),
        None => ("Internal", format!("{:#}", err)),
    };
    if json {
        println!("{}", json!({"error": {"code": code, "message": message}}));
    } else {
        eprintln!("{} {}", "error:".red(), message);
    }
    1
}

/// Progress sink that narrates lifecycle steps on stdout.
struct PrintProgress;

impl Progress for PrintProgress {
    fn step(&self, op: &str, detail: &str) {
        println!("  {} {}", format!("[{}]", op).cyan(), detail);
    }
}

fn load_config() -> Result<LobsterdConfig> {
    Ok(LobsterdConfig::load(&LobsterdConfig::default_path())?)
}

fn build_ops(config: &LobsterdConfig) -> TenantOps {
    let store = RegistryStore::new(
        &LobsterdConfig::config_dir(),
        config.tenants.uid_start,
        config.tenants.gateway_port_start,
    );
    let proxy = Arc::new(CaddyDriver::new(&config.caddy));
    TenantOps::new(config.clone(), store, proxy)
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = load_config()?;
    match cli.command {
        Commands::Init => {
            let proxy = CaddyDriver::new(&config.caddy);
            let report = bootstrap::init(&LobsterdConfig::default_path(), &proxy).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                display::print_init_report(&report);
            }
        }
        Commands::Spawn { name } => {
            let ops = build_ops(&config);
            let tenant = ops.spawn(&name, &PrintProgress).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&tenant)?);
            } else {
                display::print_tenant(&tenant, &config.caddy.domain);
            }
        }
        Commands::Evict {
            name,
            yes,
            snapshot,
        } => {
            if !yes && !confirm(&format!("evict tenant {:?} and destroy its data?", name))? {
                println!("aborted");
                return Ok(());
            }
            let ops = build_ops(&config);
            ops.evict(&name, snapshot, &PrintProgress).await?;
            if cli.json {
                println!("{}", json!({"evicted": name}));
            } else {
                println!("evicted {}", name);
            }
        }
        Commands::Molt { name } => {
            let ops = build_ops(&config);
            let report = ops.molt(name.as_deref()).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                display::print_molt_report(&report);
            }
        }
        Commands::List => {
            let ops = build_ops(&config);
            let registry = ops.store().load()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&registry)?);
            } else {
                display::print_tenant_table(&registry, &config.caddy.domain);
            }
        }
        Commands::Snap { name, prune } => {
            let ops = build_ops(&config);
            let tag = ops.snap(&name, prune).await?;
            if cli.json {
                println!("{}", json!({"snapshot": tag}));
            } else {
                println!("created snapshot @{}", tag);
            }
        }
        Commands::Watch { daemon } => {
            let ops = Arc::new(build_ops(&config));
            let watchdog = Watchdog::new(ops);
            let mut events = watchdog.events().subscribe();
            watchdog.start();
            info!("watchdog running, ctrl-c to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) if daemon || cli.json => {
                            println!("{}", serde_json::to_string(&event)?);
                        }
                        Ok(event) => {
                            println!("{}", serde_json::to_string(&event)?.dimmed());
                        }
                        Err(_) => {}
                    },
                }
            }
            watchdog.stop().await;
        }
        Commands::Tank => {
            let ops = build_ops(&config);
            let registry = ops.store().load()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&registry)?);
            } else {
                display::print_tank(&registry, &config.caddy.domain);
            }
        }
        Commands::Logs { name, service } => {
            let ops = build_ops(&config);
            let registry = ops.store().load()?;
            let tenant = registry.get(&name)?.clone();
            let client = VsockClient::for_tenant(&config, &tenant);

            // Keep the tenant awake while an operator is attached; the
            // hold is optional agent capability.
            let hold_id = format!("logs-{}", std::process::id());
            let held = client.acquire_hold(&hold_id, 60_000).await.unwrap_or(false);
            let logs = client.fetch_logs(service.as_deref()).await;
            if held {
                let _ = client.release_hold(&hold_id).await;
            }
            let logs = logs?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&logs)?);
            } else {
                print!("{}", logs.logs);
            }
        }
        Commands::Exec { name, cmd } => {
            let ops = build_ops(&config);
            let registry = ops.store().load()?;
            let tenant = registry.get(&name)?.clone();
            let key = ssh::private_key_path(&name);
            let target = format!("root@{}", tenant.guest_ip());
            let mut args: Vec<String> = vec![
                "-i".to_string(),
                key.to_string_lossy().to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
                target,
            ];
            args.extend(cmd);
            replace_process("ssh", &args)?;
        }
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Replace the current process with an interactive command (SSH/TTY).
/// Unix exec(): no return on success.
fn replace_process(cmd: &str, args: &[String]) -> Result<()> {
    use std::os::unix::process::CommandExt;
    let err = std::process::Command::new(cmd).args(args).exec();
    Err(err).with_context(|| format!("failed to exec {}", cmd))
}
