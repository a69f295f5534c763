use anyhow::{anyhow, Context, Result};
use audit_core::collab::Caller;
use audit_core::{AuditError, AugmentationMode, ScanDepth};
use audit_engine::{AuditStatusView, AuditSummary, DownloadTarget, Engine, SubmitRequest};
use audit_store::Db;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Csv }

#[derive(Debug, Parser)]
#[command(name = "auditctl", version, about = "Website security audit engine")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./auditctl.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database file; overrides `database.path`
    #[arg(long, global = true, value_name = "FILE")]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

/// Who is asking. Owners see their own audits; `--admin` sees everything.
#[derive(Debug, Args)]
struct Identity {
    #[arg(long = "as", value_name = "USER_ID", required_unless_present = "admin")]
    as_user: Option<String>,
    #[arg(long, default_value_t = false)]
    admin: bool,
}

impl Identity {
    fn caller(&self) -> Caller {
        if self.admin {
            Caller::admin()
        } else {
            Caller::user(self.as_user.as_deref().unwrap_or_default())
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Submit a target for auditing (debits one credit)
    Submit {
        /// Target URL, e.g. https://example.com
        target: String,
        #[arg(long)]
        user: String,
        /// Address for the completion/failure notification
        #[arg(long)]
        email: Option<String>,
        /// quick, standard or deep
        #[arg(long, default_value = "standard")]
        depth: ScanDepth,
        /// legacy-only, parallel-augment or orchestrated-augment
        #[arg(long, default_value = "parallel-augment")]
        mode: AugmentationMode,
        /// Free-form JSON object stored with the audit
        #[arg(long, value_name = "JSON")]
        metadata: Option<String>,
        /// Run detectors in this process until the audit is terminal
        #[arg(long, default_value_t = false)]
        wait: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Show an audit's status, progress and trail
    Status {
        audit_id: String,
        #[command(flatten)]
        who: Identity,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List a user's audits, newest first
    List {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[command(flatten)]
        who: Identity,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Cancel a running audit (no refund)
    Cancel {
        audit_id: String,
        #[command(flatten)]
        who: Identity,
    },
    /// Print a time-limited link to the PDF report
    Download {
        #[arg(long, conflicts_with = "certificate", required_unless_present = "certificate")]
        audit: Option<String>,
        #[arg(long)]
        certificate: Option<String>,
        #[command(flatten)]
        who: Identity,
    },
    /// Public certificate lookup
    Verify {
        certificate_number: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Run the detector worker pool and the sweeper until interrupted
    Worker {
        /// Worker loops; overrides `worker.workers`
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, default_value_t = 30)]
        sweep_every_secs: u64,
    },
    /// One sweep: timeouts, overdue detectors, interrupted finalizations, event purge
    Sweep,
    /// Add credits to a user's balance
    GrantCredits {
        #[arg(long)]
        user: String,
        #[arg(long)]
        amount: i64,
    },
    /// Recently poisoned detector tasks
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Commands::Version = cli.command {
        println!("auditctl {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    init_tracing();
    let mut cfg = config::load_config(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        cfg.database.path = db.to_string_lossy().into_owned();
    }
    if let Commands::Worker { workers: Some(n), .. } = &cli.command {
        cfg.worker.workers = *n;
    }
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, cfg))
}

/// Callers get the classified kind; the full error goes to the log.
fn classified(e: AuditError) -> anyhow::Error {
    tracing::debug!(error = %e, "action failed");
    let kind = e.kind();
    anyhow!("{}: {}", kind.as_str(), kind.user_message())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(command: Commands, cfg: audit_core::AuditConfig) -> Result<()> {
    let db = Db::open_or_create(&cfg.database.path).with_context(|| format!("opening {}", cfg.database.path))?;
    let db = Arc::new(db);
    let engine = Engine::builder(db.clone(), cfg).build()?;

    match command {
        Commands::Version => {}
        Commands::Submit { target, user, email, depth, mode, metadata, wait, format } => {
            let mut req = SubmitRequest::new(&target, &user);
            req.user_email = email;
            req.scan_depth = depth;
            req.augmentation_mode = mode;
            if let Some(raw) = metadata {
                req.audit_metadata = serde_json::from_str(&raw).context("--metadata must be JSON")?;
            }
            let resp = engine.submit_audit(req).await.map_err(classified)?;
            match format {
                OutputFormat::Json | OutputFormat::Csv => print_json(&resp)?,
                OutputFormat::Text => match (&resp.error_kind, &resp.error_code) {
                    (Some(kind), code) => println!(
                        "{} {} {} ({})",
                        resp.audit_id,
                        resp.status,
                        kind.as_str(),
                        code.as_deref().unwrap_or("-")
                    ),
                    (None, _) => println!("{} {} accepted {}", resp.audit_id, resp.status, resp.accepted_at),
                },
            }
            if wait && !resp.status.is_terminal() {
                let view = wait_for(&engine, &resp.audit_id, &Caller::user(&user)).await?;
                print_status(&view, format)?;
            }
        }
        Commands::Status { audit_id, who, format } => {
            let view = engine.get_audit_status(&who.caller(), &audit_id).map_err(classified)?;
            print_status(&view, format)?;
        }
        Commands::List { user, limit, offset, who, format } => {
            let audits = engine.list_user_audits(&who.caller(), &user, limit, offset).map_err(classified)?;
            print_list(&audits, format)?;
        }
        Commands::Cancel { audit_id, who } => {
            let resp = engine.cancel_audit(&who.caller(), &audit_id).map_err(classified)?;
            println!("{} {}", resp.audit_id, resp.status);
        }
        Commands::Download { audit, certificate, who } => {
            let target = match (audit, certificate) {
                (Some(id), _) => DownloadTarget::Audit(id),
                (None, Some(number)) => DownloadTarget::Certificate(number),
                (None, None) => return Err(anyhow!("provide --audit or --certificate")),
            };
            let link = engine.download_report(&who.caller(), &target).map_err(classified)?;
            println!("{}\nexpires {}", link.url, link.expires_at);
        }
        Commands::Verify { certificate_number, format } => {
            let v = engine.verify_certificate(&certificate_number).map_err(classified)?;
            match format {
                OutputFormat::Json | OutputFormat::Csv => print_json(&v)?,
                OutputFormat::Text => {
                    println!("certificate {} for {}: {}", v.certificate_number, v.domain, if v.valid { "valid" } else { "not valid" });
                    if let (Some(score), Some(grade)) = (v.score, v.grade) {
                        println!("score {score:.1} grade {grade} ssl {}", v.ssl_grade.as_deref().unwrap_or("n/a"));
                    }
                    let c = v.vulnerability_counts;
                    println!(
                        "scanned {}: {} critical, {} high, {} medium, {} low",
                        v.scan_date.as_deref().unwrap_or("-"),
                        c.critical,
                        c.high,
                        c.medium,
                        c.low
                    );
                }
            }
        }
        Commands::Worker { sweep_every_secs, .. } => {
            let (tx, rx) = watch::channel(false);
            let pool = {
                let engine = engine.clone();
                let rx = rx.clone();
                tokio::spawn(async move { engine.run_pool(rx).await })
            };
            let sweeper = {
                let engine = engine.clone();
                let every = Duration::from_secs(sweep_every_secs.max(1));
                tokio::spawn(async move { engine.run_sweeper(every, rx).await })
            };
            tracing::info!(workers = engine.config().worker.workers, "worker running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            tracing::info!("shutting down");
            let _ = tx.send(true);
            let (p, s) = tokio::join!(pool, sweeper);
            p?;
            s?;
        }
        Commands::Sweep => {
            let report = engine.sweep().await.map_err(classified)?;
            print_json(&report)?;
        }
        Commands::GrantCredits { user, amount } => {
            if amount <= 0 {
                return Err(anyhow!("--amount must be positive"));
            }
            let balance = db.grant_credits(&user, amount)?;
            println!("{user} balance {balance}");
        }
        Commands::DeadLetters { limit } => {
            for d in db.dead_letters(limit)? {
                println!("{}", serde_json::to_string(&d)?);
            }
        }
    }
    Ok(())
}

async fn wait_for(engine: &Engine, audit_id: &str, caller: &Caller) -> Result<AuditStatusView> {
    let idle = Duration::from_millis(engine.config().worker.poll_interval_ms.max(10));
    loop {
        engine.drain().await.map_err(classified)?;
        engine.sweep().await.map_err(classified)?;
        let view = engine.get_audit_status(caller, audit_id).map_err(classified)?;
        if view.status.is_terminal() {
            return Ok(view);
        }
        tokio::time::sleep(idle).await;
    }
}

fn print_status(v: &AuditStatusView, format: OutputFormat) -> Result<()> {
    if format != OutputFormat::Text {
        return print_json(v);
    }
    println!("{} {} {}", v.audit_id, v.normalized_url, v.status);
    println!("progress {:.1}% {} ({}) eta {}s", v.progress, v.current_stage, v.stage_description, v.eta_seconds);
    if let Some(item) = &v.current_item {
        println!("current {item}");
    }
    let c = v.severity_counts;
    println!(
        "findings {}: {} critical, {} high, {} medium, {} low, {} info",
        v.findings_count, c.critical, c.high, c.medium, c.low, c.info
    );
    if let (Some(score), Some(grade)) = (v.security_score, v.grade) {
        println!("score {score:.1} grade {grade}");
    }
    if let Some(cert) = &v.certificate_number {
        println!("certificate {cert}");
    }
    if let Some(kind) = v.error_kind {
        println!("error {} {}", kind.as_str(), v.error.as_deref().unwrap_or(""));
    }
    for p in &v.poisoned_detectors {
        println!("poisoned {} ({}) {}", p.detector, p.priority.as_str(), p.error);
    }
    if let Some(chains) = &v.attack_chains {
        for ch in chains {
            println!("chain {} [{}] exploitability {:.1}", ch.name, ch.severity, ch.exploitability_score);
        }
    }
    Ok(())
}

fn print_list(audits: &[AuditSummary], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(&audits)?,
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(std::io::stdout());
            wtr.write_record(["audit_id", "target_url", "status", "progress", "score", "grade", "certificate", "created_at", "completed_at"])?;
            for a in audits {
                wtr.write_record([
                    a.audit_id.clone(),
                    a.target_url.clone(),
                    a.status.to_string(),
                    format!("{:.1}", a.progress),
                    a.security_score.map(|s| format!("{s:.1}")).unwrap_or_default(),
                    a.grade.map(|g| g.to_string()).unwrap_or_default(),
                    a.certificate_number.clone().unwrap_or_default(),
                    a.created_at.clone(),
                    a.completed_at.clone().unwrap_or_default(),
                ])?;
            }
            wtr.flush()?;
        }
        OutputFormat::Text => {
            for a in audits {
                let score = a.security_score.map(|s| format!("{s:.1}")).unwrap_or_else(|| "-".into());
                let grade = a.grade.map(|g| g.to_string()).unwrap_or_else(|| "-".into());
                println!("{} {:<10} {:>5.1}% {score:>4} {grade:<2} {} {}", a.audit_id, a.status.as_str(), a.progress, a.created_at, a.target_url);
            }
        }
    }
    Ok(())
}
