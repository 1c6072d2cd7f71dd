//! Vigil - OAST interaction capture service CLI

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing_subscriber::EnvFilter;

use vigil::app::App;
use vigil::config::{self, Overrides, Settings, StorageBackend};
use vigil::identity::{hash_password_with_cost, DEFAULT_HASH_COST};

/// Vigil - out-of-band interaction capture for security testing
#[derive(Parser)]
#[command(name = "vigil", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the DNS, SMTP and HTTP listeners and the management API
    Serve {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// DNS listener port
        #[arg(long, env = "LSTNER_DNS_PORT")]
        dns_port: Option<u16>,

        /// DNS listener interface address
        #[arg(long, env = "LSTNER_DNS_INTERFACE")]
        dns_interface: Option<IpAddr>,

        /// SMTP listener port
        #[arg(long, env = "LSTNER_SMTP_PORT")]
        smtp_port: Option<u16>,

        /// SMTP submission port (0 disables)
        #[arg(long, env = "LSTNER_SMTP_SUBMISSION_PORT")]
        smtp_submission_port: Option<u16>,

        /// SMTPS implicit TLS port (0 disables)
        #[arg(long, env = "LSTNER_SMTP_SSL_PORT")]
        smtp_ssl_port: Option<u16>,

        /// PEM certificate chain for SMTPS and HTTPS
        #[arg(long, env = "DSSLDRF_TLS_CRT_FILE")]
        tls_cert: Option<PathBuf>,

        /// PKCS#8 PEM private key for SMTPS and HTTPS
        #[arg(long, env = "DSSLDRF_TLS_KEY_FILE")]
        tls_key: Option<PathBuf>,

        /// Management API port
        #[arg(long)]
        api_port: Option<u16>,

        /// Public base URL of the management API
        #[arg(long)]
        api_host: Option<String>,

        /// Persist requests to this JSON-lines file
        #[arg(long)]
        storage: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Hash a password for a [[users]] config entry
    HashPassword {
        /// Password to hash
        password: String,

        /// bcrypt work factor
        #[arg(long, default_value_t = DEFAULT_HASH_COST)]
        cost: u32,
    },

    /// Print the effective configuration
    ShowConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn print_banner() {
    let banner = r#"
    ╔═══════════════════════════════════════╗
    ║  VIGIL v0.1.0                         ║
    ║  Out-of-band interaction capture      ║
    ╚═══════════════════════════════════════╝
    "#;
    println!("{}", banner.cyan());
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "vigil=debug" } else { "vigil=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();
}

fn load_settings(path: Option<&Path>) -> vigil::error::Result<Settings> {
    match path {
        Some(path) => config::load_config(path),
        None => {
            let default_path = Path::new("config/vigil.toml");
            if default_path.exists() {
                config::load_config(default_path)
            } else {
                Ok(Settings::default())
            }
        }
    }
}

fn port_cell(enabled: bool, port: Option<u16>) -> String {
    match (enabled, port) {
        (true, Some(port)) => port.to_string(),
        _ => "off".to_string(),
    }
}

fn print_settings(settings: &Settings) {
    let tls = settings.tls.cert_file.is_some();

    let mut builder = Builder::default();
    builder.push_record(["Service", "Interface", "Port"]);
    builder.push_record([
        "DNS (udp/tcp)".to_string(),
        settings.dns.interface.to_string(),
        port_cell(settings.dns.enabled, Some(settings.dns.port)),
    ]);
    builder.push_record([
        "SMTP".to_string(),
        settings.smtp.interface.to_string(),
        port_cell(settings.smtp.enabled, Some(settings.smtp.port)),
    ]);
    builder.push_record([
        "SMTP submission".to_string(),
        settings.smtp.interface.to_string(),
        port_cell(settings.smtp.enabled, settings.smtp.submission_port),
    ]);
    builder.push_record([
        "SMTPS".to_string(),
        settings.smtp.interface.to_string(),
        port_cell(settings.smtp.enabled && tls, settings.smtp.ssl_port),
    ]);
    builder.push_record([
        "HTTP".to_string(),
        settings.http.interface.to_string(),
        port_cell(settings.http.enabled, Some(settings.http.port)),
    ]);
    builder.push_record([
        "HTTPS".to_string(),
        settings.http.interface.to_string(),
        port_cell(settings.http.enabled && tls, settings.http.tls_port),
    ]);
    builder.push_record([
        "Management API".to_string(),
        settings.api.interface.to_string(),
        port_cell(settings.api.enabled, Some(settings.api.port)),
    ]);

    let mut table = builder.build();
    table.with(Style::rounded());
    println!("{table}");

    let storage = match settings.storage.backend {
        StorageBackend::Memory => "memory".to_string(),
        StorageBackend::Jsonl => settings.storage.path.display().to_string(),
    };
    println!("  {} {}", "Storage:".bold(), storage.green());
    if let Some(host) = &settings.api.api_host {
        println!("  {} {}", "API host:".bold(), host.as_str().green());
    }

    let domains: Vec<&str> = settings.domains.iter().map(|d| d.domain.as_str()).collect();
    let domains = if domains.is_empty() {
        "none".yellow().to_string()
    } else {
        domains.join(", ").cyan().to_string()
    };
    println!("  {} {}", "Domains:".bold(), domains);
    println!(
        "  {} {}\n",
        "Users:".bold(),
        settings.users.len().to_string().cyan()
    );
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config: config_path,
            dns_port,
            dns_interface,
            smtp_port,
            smtp_submission_port,
            smtp_ssl_port,
            tls_cert,
            tls_key,
            api_port,
            api_host,
            storage,
            verbose,
        } => {
            init_tracing(verbose);
            print_banner();

            let mut settings = load_settings(config_path.as_deref())?;
            config::merge_cli_args(
                &mut settings,
                Overrides {
                    dns_port,
                    dns_interface,
                    smtp_port,
                    smtp_submission_port,
                    smtp_ssl_port,
                    tls_cert_file: tls_cert,
                    tls_key_file: tls_key,
                    api_port,
                    api_host,
                    storage_path: storage,
                },
            )?;

            print_settings(&settings);
            if settings.domains.is_empty() {
                println!(
                    "  {}\n",
                    "No domains configured; every probe will be answered as unowned.".yellow()
                );
            }
            println!("  {}\n", "Press Ctrl+C to stop.".yellow());

            let app = App::build(settings).await?;
            app.run().await?;
        }

        Commands::HashPassword { password, cost } => {
            println!("{}", hash_password_with_cost(&password, cost)?);
        }

        Commands::ShowConfig {
            config: config_path,
        } => {
            print_banner();
            let settings = load_settings(config_path.as_deref())?;
            print_settings(&settings);
        }
    }

    Ok(())
}
