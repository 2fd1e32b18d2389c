mod handlers;
mod license;
mod server;

#[cfg(test)]
mod license_test;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "grantline",
    about = "Grantline: license entitlement control plane",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local control plane with an HTTP API
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:3100", env = "GRANTLINE_LISTEN")]
        listen: SocketAddr,

        /// Public key accepted for token verification (repeatable)
        #[arg(long = "trust-anchor", env = "GRANTLINE_TRUST_ANCHORS", value_delimiter = ',', required = true)]
        trust_anchors: Vec<PathBuf>,

        /// Workers per controller
        #[arg(long, default_value_t = 2, env = "GRANTLINE_WORKERS")]
        workers: usize,

        /// Full resync period in milliseconds, 0 disables it
        #[arg(long, default_value_t = 30_000, env = "GRANTLINE_RESYNC_MS")]
        resync_ms: u64,
    },

    /// Manage signing keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Issue and inspect license tokens
    License {
        #[command(subcommand)]
        command: LicenseCommands,
    },

    /// Print version information
    Version,
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Generate an RSA keypair in PKCS#1 PEM form
    Generate {
        #[arg(long, default_value_t = grantline_core::keys::DEFAULT_KEY_BITS)]
        bits: usize,

        /// Base name for `<name>.key` / `<name>.pub`
        #[arg(long, default_value = "grantline")]
        name: String,

        /// Write the keypair to files instead of stdout
        #[arg(long)]
        write_files: bool,
    },
}

#[derive(Subcommand)]
pub enum LicenseCommands {
    /// Sign a new license token
    Generate {
        #[arg(long)]
        licensee: String,

        /// `<entitlement>/<unit>=<amount>`, repeatable
        #[arg(long = "grant", required = true)]
        grants: Vec<String>,

        /// `key=value`, repeatable
        #[arg(long = "metadata")]
        metadata: Vec<String>,

        /// First valid day, YYYY-MM-DD (default: today)
        #[arg(long)]
        not_before: Option<String>,

        /// First day the token is no longer valid, YYYY-MM-DD
        #[arg(long)]
        not_after: String,

        /// Private signing key (PKCS#1 PEM)
        #[arg(long, env = "GRANTLINE_SIGNING_KEY")]
        key: PathBuf,

        /// Token id (default: random UUID)
        #[arg(long)]
        id: Option<String>,

        /// Write the token here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Verify a token and print its contents
    Inspect {
        /// Public key accepted for verification (repeatable)
        #[arg(long = "trust-anchor", env = "GRANTLINE_TRUST_ANCHORS", value_delimiter = ',', required = true)]
        trust_anchors: Vec<PathBuf>,

        /// The token, or `@path` to read it from a file
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            listen,
            trust_anchors,
            workers,
            resync_ms,
        } => server::run(listen, &trust_anchors, workers, resync_ms).await?,
        Commands::Key { command } => license::run_key(command)?,
        Commands::License { command } => license::run_license(command)?,
        Commands::Version => {
            println!("grantline {}", env!("CARGO_PKG_VERSION"));
            println!("License entitlement control plane");
        }
    }
    Ok(())
}
