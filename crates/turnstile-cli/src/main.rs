use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use turnstile_core::{Embedding, ScanEvent, ScanOutcome};

#[zbus::proxy(
    interface = "org.turnstile.Attendance1",
    default_service = "org.turnstile.Attendance1",
    default_path = "/org/turnstile/Attendance1"
)]
trait Attendance {
    async fn verify_and_log(&self, subject: &str, scan: &str) -> zbus::Result<String>;
    async fn get_statistics(&self, subject: &str, as_of: &str) -> zbus::Result<String>;
    async fn enroll(&self, subject: &str, embeddings: &str) -> zbus::Result<u32>;
    async fn list_logs(&self, subject: &str, day: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "turnstile", about = "Turnstile attendance checkpoint CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a scan (JSON file) for a subject
    Scan {
        #[arg(short, long)]
        subject: String,
        /// Scan event JSON: embedding, liveness fields, device_id, location
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Show attendance statistics
    Stats {
        /// Limit to one subject (default: every subject)
        #[arg(short, long)]
        subject: Option<String>,
        /// Reference date, YYYY-MM-DD (default: today)
        #[arg(long)]
        as_of: Option<String>,
    },
    /// Replace a subject's enrolled embeddings from a JSON array of vectors
    Enroll {
        #[arg(short, long)]
        subject: String,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// List log entries for a day
    Logs {
        #[arg(short, long)]
        subject: Option<String>,
        /// Day, YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("turnstiled is not reachable")?;

    match cli.command {
        Commands::Scan { subject, file } => {
            let raw = read_file(&file)?;
            // Validate locally so malformed files fail before reaching the daemon.
            let _: ScanEvent = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a valid scan event", file.display()))?;
            let reply = proxy.verify_and_log(&subject, &raw).await?;
            let outcome: ScanOutcome = serde_json::from_str(&reply)?;
            println!("{}", describe(&outcome));
        }
        Commands::Stats { subject, as_of } => {
            let reply = proxy
                .get_statistics(
                    subject.as_deref().unwrap_or(""),
                    as_of.as_deref().unwrap_or(""),
                )
                .await?;
            print_pretty(&reply)?;
        }
        Commands::Enroll { subject, file } => {
            let raw = read_file(&file)?;
            let _: Vec<Embedding> = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a JSON array of embeddings", file.display()))?;
            let count = proxy.enroll(&subject, &raw).await?;
            println!("Enrolled {count} embedding(s) for {subject}");
        }
        Commands::Logs { subject, date } => {
            let reply = proxy
                .list_logs(
                    subject.as_deref().unwrap_or(""),
                    date.as_deref().unwrap_or(""),
                )
                .await?;
            print_pretty(&reply)?;
        }
        Commands::Status => {
            let reply = proxy.status().await?;
            print_pretty(&reply)?;
        }
    }

    Ok(())
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn print_pretty(json: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn describe(outcome: &ScanOutcome) -> String {
    match outcome {
        ScanOutcome::Accepted { direction, entry } => {
            format!("Accepted: {direction} for {} on {}", entry.subject_id, entry.day)
        }
        ScanOutcome::Rejected { reason } => format!("Rejected: {reason}"),
    }
}
