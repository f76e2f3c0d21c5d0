//! TraceGuard sync operator CLI
//!
//! # Usage
//!
//! ```bash
//! # Log in and persist the session under ./.traceguard
//! traceguard-sync login --username alice
//!
//! # Follow live SBOM / provenance changes
//! traceguard-sync watch
//!
//! # Generate a compliance report for two SBOMs
//! traceguard-sync report --framework slsa --sbom a1 --sbom b2
//! ```
//!
//! Settings come from `--config` (YAML), then `TRACEGUARD_*` variables
//! (a `.env` file is honoured).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use traceguard_sync::client::ComplianceReportRequest;
use traceguard_sync::gateway::connect::ConnectTransport;
use traceguard_sync::session::FileCredentialStorage;
use traceguard_sync::sync::StoreView;
use traceguard_sync::{
    AuthError, CallGateway, Entity, LiveSyncEngine, LoginRequest, SessionManager, SessionState,
    SyncConfig, TraceGuardClient,
};

#[derive(Parser)]
#[command(name = "traceguard-sync")]
#[command(version)]
#[command(about = "Session and live-sync tooling for the TraceGuard backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML config file; environment variables override it
    #[arg(long, short, global = true, env = "TRACEGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "text", value_enum)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Exchange username/password for a session and persist it
    Login {
        #[arg(long, short, env = "TRACEGUARD_USERNAME")]
        username: String,

        #[arg(long, short, env = "TRACEGUARD_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Clear the persisted session
    Logout,

    /// Show the persisted session subject and expiry
    Whoami,

    /// Run the live-sync engine and log store changes
    Watch {
        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Generate a compliance report
    Report {
        /// Control framework, e.g. slsa or nist-800-53
        #[arg(long, short)]
        framework: String,

        /// SBOM identifiers to include (all when omitted)
        #[arg(long = "sbom")]
        sbom_ids: Vec<String>,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,traceguard_sync=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

struct Runtime {
    gateway: CallGateway,
    sessions: SessionManager,
    config: SyncConfig,
}

fn build_runtime(config_path: Option<&PathBuf>) -> Result<Runtime> {
    let mut config = match config_path {
        Some(path) => SyncConfig::load_from_file(path)?,
        None => SyncConfig::default(),
    };
    config
        .apply_env(|key| std::env::var(key).ok())
        .context("Reading TRACEGUARD_* environment")?;
    config.validate().context("Invalid configuration")?;

    let transport = ConnectTransport::new(
        config.endpoint_url()?.as_str(),
        config.gateway.request_timeout(),
    )
    .context("Building Connect transport")?;
    let storage = FileCredentialStorage::new(&config.session.storage_dir);
    let session = SessionState::new(Arc::new(storage));
    let gateway = CallGateway::new(Arc::new(transport), session)
        .with_trace_sampling(config.gateway.sample_traces);
    let sessions = SessionManager::new(gateway.clone());

    tracing::debug!(endpoint = %config.gateway.endpoint, "Runtime ready");
    Ok(Runtime {
        gateway,
        sessions,
        config,
    })
}

async fn run(cli: Cli) -> Result<()> {
    let runtime = build_runtime(cli.config.as_ref())?;
    match cli.command {
        Commands::Login { username, password } => {
            cmd_login(&runtime, username, password, cli.format).await
        }
        Commands::Logout => cmd_logout(&runtime),
        Commands::Whoami => cmd_whoami(&runtime, cli.format),
        Commands::Watch { duration_secs } => {
            cmd_watch(runtime, duration_secs.map(Duration::from_secs)).await
        }
        Commands::Report {
            framework,
            sbom_ids,
        } => cmd_report(&runtime, framework, sbom_ids, cli.format).await,
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn cmd_login(
    runtime: &Runtime,
    username: String,
    password: String,
    format: OutputFormat,
) -> Result<()> {
    let request = LoginRequest::new(username, password);
    let credential = match runtime.sessions.login(&request).await {
        Ok(credential) => credential,
        Err(AuthError::InvalidCredentials) => bail!("invalid username or password"),
        Err(e) => return Err(e).context("Login failed"),
    };
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "subject": credential.subject,
                "expiresAt": credential.expires_at,
            })
        ),
        OutputFormat::Text => println!("Logged in as {}", credential.subject),
    }
    Ok(())
}

fn cmd_logout(runtime: &Runtime) -> Result<()> {
    runtime.sessions.restore().context("Reading persisted session")?;
    runtime.sessions.logout();
    println!("Logged out");
    Ok(())
}

fn cmd_whoami(runtime: &Runtime, format: OutputFormat) -> Result<()> {
    let Some(credential) = runtime.sessions.restore().context("Reading persisted session")? else {
        bail!("not logged in");
    };
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "subject": credential.subject,
                "expiresAt": credential.expires_at,
            })
        ),
        OutputFormat::Text => match credential.expires_at {
            Some(expiry) => println!("{} (expires {})", credential.subject, expiry.to_rfc3339()),
            None => println!("{}", credential.subject),
        },
    }
    Ok(())
}

async fn cmd_watch(runtime: Runtime, duration: Option<Duration>) -> Result<()> {
    if runtime.sessions.restore()?.is_none() {
        bail!("not logged in; run `traceguard-sync login` first");
    }

    let engine =
        LiveSyncEngine::new(runtime.gateway.clone(), runtime.config.sync_options()).start();
    let mut transitions = engine.transitions();
    let mut sboms = engine.sboms().subscribe();
    let mut provenance = engine.provenance().subscribe();
    let mut session = runtime.sessions.subscribe();

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = &mut deadline => break,
            transition = transitions.recv() => {
                if let Ok(t) = transition {
                    tracing::info!(
                        generation = t.generation,
                        attempt = t.attempt,
                        state = ?t.state,
                        "Sync state"
                    );
                }
            }
            Ok(()) = sboms.changed() => log_view("sbom", &*sboms.borrow_and_update()),
            Ok(()) = provenance.changed() => {
                log_view("provenance", &*provenance.borrow_and_update())
            }
            Ok(()) = session.changed() => {
                if !session.borrow_and_update().is_authenticated() {
                    tracing::warn!("Session ended, stopping watch");
                    break;
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn log_view<E: Entity>(kind: &str, view: &StoreView<E>) {
    match &view.degraded {
        Some(reason) => tracing::warn!(
            kind,
            records = view.len(),
            revision = view.revision,
            %reason,
            "Store degraded"
        ),
        None => tracing::info!(
            kind,
            records = view.len(),
            revision = view.revision,
            "Store updated"
        ),
    }
}

async fn cmd_report(
    runtime: &Runtime,
    framework: String,
    sbom_ids: Vec<String>,
    format: OutputFormat,
) -> Result<()> {
    if runtime.sessions.restore()?.is_none() {
        bail!("not logged in; run `traceguard-sync login` first");
    }
    let client = TraceGuardClient::new(runtime.gateway.clone());
    let report = client
        .generate_compliance_report(&ComplianceReportRequest { sbom_ids, framework })
        .await
        .context("Generating compliance report")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("Report {} ({}) at {}", report.id, report.framework, report.generated_at);
            println!("{}", report.summary);
            for finding in &report.findings {
                let mark = if finding.passed { "PASS" } else { "FAIL" };
                match &finding.detail {
                    Some(detail) => println!("  [{mark}] {} - {detail}", finding.control),
                    None => println!("  [{mark}] {}", finding.control),
                }
            }
        }
    }
    Ok(())
}
