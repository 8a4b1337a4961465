//! Tessera CLI - Command line interface.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tessera_pki::opts::{DEFAULT_CA_DAYS, DEFAULT_CERT_DAYS, DEFAULT_CURVE, DEFAULT_RSA_BITS};
use tessera_pki::{
    CaOpts, CertKind, CertOpts, IssueCertRet, Passphrase, Pki, PkiConfig, PkiError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PASS_ENV: &str = "TESSERA_PASS";
const CA_PASS_ENV: &str = "TESSERA_CA_PASS";

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Tessera - Local certificate authority centers")]
#[command(version)]
struct Cli {
    /// Directory holding all centers
    #[arg(long, default_value = "./tessera", env = "TESSERA_BASE_PATH")]
    base_path: PathBuf,

    /// OpenSSL program to invoke
    #[arg(long, default_value = "openssl", env = "TESSERA_OPENSSL")]
    openssl: PathBuf,

    /// Upper bound for a single toolchain invocation, in seconds
    #[arg(long, default_value = "60", env = "TESSERA_TIMEOUT_SECS")]
    timeout_secs: u64,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Center management
    Center {
        #[command(subcommand)]
        command: CenterCommands,
    },
    /// Root CA of a center
    Ca {
        #[command(subcommand)]
        command: CaCommands,
    },
    /// Leaf certificates
    Cert {
        #[command(subcommand)]
        command: CertCommands,
    },
    /// Show tool and toolchain versions
    Version,
}

#[derive(Subcommand)]
enum CenterCommands {
    /// Create a new center
    Init {
        /// Center name
        name: String,
    },
    /// Create the default center
    InitDefault,
    /// List centers
    List,
    /// Show a center
    Show {
        /// Center name
        name: String,
    },
}

#[derive(Subcommand)]
enum CaCommands {
    /// Create and persist the center's root CA
    Init {
        #[command(flatten)]
        ca: CaArgs,
    },
    /// Create the root CA key, printing the certificate without persisting it
    Generate {
        #[command(flatten)]
        ca: CaArgs,
    },
    /// Persist a certificate printed by `ca generate`, completing the root CA
    SaveCert {
        /// Center name
        #[arg(long, default_value = "default")]
        center: String,
        /// PEM file holding the CA certificate
        cert: PathBuf,
    },
}

#[derive(Subcommand)]
enum CertCommands {
    /// Issue a leaf certificate from a center
    Issue {
        /// Center name
        center: String,
        /// Certificate kind (server, client)
        #[arg(long, default_value = "server")]
        kind: CertKind,
        /// Subject alternative name (DNS name or IP address), repeatable
        #[arg(long = "san")]
        alt_names: Vec<String>,
        /// Validity period in days
        #[arg(long, default_value_t = DEFAULT_CERT_DAYS, allow_negative_numbers = true)]
        days: i64,
        #[command(flatten)]
        key: KeyArgs,
        #[command(flatten)]
        subject: SubjectArgs,
        /// Also print the encrypted private key
        #[arg(long)]
        print_key: bool,
    },
}

#[derive(Args)]
struct CaArgs {
    /// Center name
    #[arg(long, default_value = "default")]
    center: String,
    /// Validity period in days
    #[arg(long, default_value_t = DEFAULT_CA_DAYS, allow_negative_numbers = true)]
    days: i64,
    #[command(flatten)]
    key: KeyArgs,
    #[command(flatten)]
    subject: SubjectArgs,
    /// Also print the encrypted private key
    #[arg(long)]
    print_key: bool,
}

#[derive(Args)]
struct KeyArgs {
    /// Key algorithm (rsa, ec)
    #[arg(long, default_value = "rsa")]
    alg: String,
    /// Signature digest (sha256, sha384, sha512)
    #[arg(long, default_value = "sha256")]
    hash: String,
    /// RSA key size in bits
    #[arg(long, default_value_t = DEFAULT_RSA_BITS)]
    bits: u32,
    /// EC curve (P-256, P-384, P-521)
    #[arg(long, default_value = DEFAULT_CURVE)]
    curve: String,
}

#[derive(Args)]
struct SubjectArgs {
    /// Common name
    #[arg(long)]
    cn: String,
    /// Two-letter country code
    #[arg(long)]
    c: String,
    /// Organization
    #[arg(long, default_value = "")]
    o: String,
    /// Organizational unit
    #[arg(long, default_value = "")]
    ou: String,
    /// State or province
    #[arg(long, default_value = "")]
    st: String,
    /// Locality
    #[arg(long, default_value = "")]
    l: String,
    /// Email address
    #[arg(long, default_value = "")]
    email: String,
}

// ============================================================================
// Output Types
// ============================================================================

#[derive(Serialize)]
struct CenterOutput {
    name: String,
    root: PathBuf,
    ca_initialized: bool,
    next_serial: String,
}

#[derive(Serialize)]
struct IssueOutput {
    center_name: String,
    private_key_file: PathBuf,
    crt_file: Option<PathBuf>,
    serial: Option<String>,
    cert: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    private_key: Option<String>,
}

impl IssueOutput {
    fn new(ret: IssueCertRet, print_key: bool) -> Self {
        Self {
            center_name: ret.center_name,
            private_key_file: ret.private_key_file,
            crt_file: ret.crt_file,
            serial: ret.serial,
            cert: ret.cert,
            private_key: print_key.then_some(ret.private_key),
        }
    }
}

#[derive(Serialize)]
struct VersionOutput {
    tessera: &'static str,
    toolchain: Option<String>,
}

// ============================================================================
// Helpers
// ============================================================================

/// Reads the passphrase for `field` from `env_var`, or prompts for it on stdin.
fn read_passphrase(field: &str, env_var: &str, prompt: &str) -> Result<Passphrase> {
    let pass = match std::env::var(env_var) {
        Ok(value) => value,
        Err(_) => {
            eprint!("{prompt}: ");
            io::stderr().flush()?;
            let stdin = io::stdin();
            let mut line = String::new();
            stdin
                .lock()
                .read_line(&mut line)
                .context("Failed to read passphrase")?;
            line.trim_end_matches(['\r', '\n']).to_string()
        },
    };

    check_passphrase(field, pass).with_context(|| {
        format!("Passphrase cannot be empty (set {env_var} or enter it when prompted)")
    })
}

fn check_passphrase(field: &str, pass: String) -> Result<Passphrase, PkiError> {
    if pass.is_empty() {
        return Err(PkiError::InvalidPassphrase(field.to_string()));
    }
    Ok(Passphrase::new(pass))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_issue(out: &IssueOutput, json: bool) -> Result<()> {
    if json {
        return print_json(out);
    }

    println!("Center:      {}", out.center_name);
    if let Some(serial) = &out.serial {
        println!("Serial:      {}", serial);
    }
    println!("Private key: {}", out.private_key_file.display());
    match &out.crt_file {
        Some(path) => println!("Certificate: {}", path.display()),
        None => println!("Certificate: (not persisted)"),
    }
    println!();
    if let Some(key) = &out.private_key {
        print!("{}", key);
    }
    print!("{}", out.cert);
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_center_init(pki: &Pki, name: Option<&str>, json: bool) -> Result<()> {
    let center = match name {
        Some(name) => pki.initialize_center(name).await,
        None => pki.init_default_center().await,
    }
    .context("Failed to initialize center")?;

    if json {
        print_json(&serde_json::json!({
            "name": center.name(),
            "root": center.root(),
        }))
    } else {
        println!("Center '{}' created at {}", center.name(), center.root().display());
        Ok(())
    }
}

async fn cmd_center_list(pki: &Pki, json: bool) -> Result<()> {
    let names = pki.list_centers().await?;

    if json {
        return print_json(&names);
    }

    if names.is_empty() {
        println!("No centers found");
    } else {
        println!("Centers:");
        for name in &names {
            println!("  {}", name);
        }
    }
    Ok(())
}

async fn cmd_center_show(pki: &Pki, name: &str, json: bool) -> Result<()> {
    let center = pki.resolve_center(name).await?;
    let out = CenterOutput {
        name: center.name().to_string(),
        root: center.root().to_path_buf(),
        ca_initialized: center.ca_initialized().await,
        next_serial: center.next_serial().await?,
    };

    if json {
        return print_json(&out);
    }

    println!("Center '{}':", out.name);
    println!("  Root:           {}", out.root.display());
    println!("  CA initialized: {}", out.ca_initialized);
    println!("  Next serial:    {}", out.next_serial);
    Ok(())
}

async fn cmd_ca(pki: &Pki, args: CaArgs, persist_cert: bool, json: bool) -> Result<()> {
    let pass = read_passphrase("pass", PASS_ENV, "Enter CA key passphrase")?;

    let opts = CaOpts {
        center_name: args.center,
        alg: args.key.alg,
        hash: args.key.hash,
        days: args.days,
        pass,
        key_bits: args.key.bits,
        curve: args.key.curve,
        cn: args.subject.cn,
        ou: args.subject.ou,
        o: args.subject.o,
        c: args.subject.c,
        st: args.subject.st,
        l: args.subject.l,
        email: args.subject.email,
    };

    let ret = if persist_cert {
        pki.init_ca_cert(&opts).await
    } else {
        pki.gen_ca_cert(&opts).await
    }
    .context("Failed to create root CA")?;

    print_issue(&IssueOutput::new(ret, args.print_key), json)
}

async fn cmd_ca_save_cert(pki: &Pki, center: &str, cert_file: &Path, json: bool) -> Result<()> {
    let cert = tokio::fs::read_to_string(cert_file)
        .await
        .with_context(|| format!("Failed to read {}", cert_file.display()))?;
    let pass = read_passphrase("pass", PASS_ENV, "Enter CA key passphrase")?;

    let path = pki
        .save_ca_cert(center, &cert, &pass)
        .await
        .context("Failed to save CA certificate")?;

    if json {
        print_json(&serde_json::json!({ "center_name": center, "crt_file": path }))
    } else {
        println!("CA certificate saved to {}", path.display());
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_cert_issue(
    pki: &Pki,
    center: &str,
    kind: CertKind,
    alt_names: Vec<String>,
    days: i64,
    key: KeyArgs,
    subject: SubjectArgs,
    print_key: bool,
    json: bool,
) -> Result<()> {
    let ca_pass = read_passphrase("ca_pass", CA_PASS_ENV, "Enter CA key passphrase")?;
    let pass = read_passphrase("pass", PASS_ENV, "Enter certificate key passphrase")?;

    let opts = CertOpts {
        alg: key.alg,
        hash: key.hash,
        days,
        pass,
        ca_pass,
        key_bits: key.bits,
        curve: key.curve,
        kind,
        alt_names,
        cn: subject.cn,
        ou: subject.ou,
        o: subject.o,
        c: subject.c,
        st: subject.st,
        l: subject.l,
        email: subject.email,
    };

    let ret = pki
        .issue_cert(&opts, center)
        .await
        .context("Failed to issue certificate")?;

    print_issue(&IssueOutput::new(ret, print_key), json)
}

fn cmd_version(pki: &Pki, json: bool) -> Result<()> {
    let out = VersionOutput {
        tessera: env!("CARGO_PKG_VERSION"),
        toolchain: pki.toolchain_version().map(|v| v.to_string()),
    };

    if json {
        return print_json(&out);
    }

    println!("tessera {}", out.tessera);
    println!(
        "toolchain {} ({})",
        out.toolchain.as_deref().unwrap_or("unknown"),
        pki.config().openssl.display()
    );
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let usage = e
                .downcast_ref::<PkiError>()
                .is_some_and(PkiError::is_usage_error);
            if usage {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = PkiConfig::new(cli.base_path)
        .with_openssl(cli.openssl)
        .with_timeout(Duration::from_secs(cli.timeout_secs));
    let pki = Pki::new(config).await;
    let json = cli.json;

    match cli.command {
        Commands::Version => cmd_version(&pki, json),
        Commands::Center { command } => match command {
            CenterCommands::Init { name } => cmd_center_init(&pki, Some(&name), json).await,
            CenterCommands::InitDefault => cmd_center_init(&pki, None, json).await,
            CenterCommands::List => cmd_center_list(&pki, json).await,
            CenterCommands::Show { name } => cmd_center_show(&pki, &name, json).await,
        },
        Commands::Ca { command } => match command {
            CaCommands::Init { ca } => cmd_ca(&pki, ca, true, json).await,
            CaCommands::Generate { ca } => cmd_ca(&pki, ca, false, json).await,
            CaCommands::SaveCert { center, cert } => {
                cmd_ca_save_cert(&pki, &center, &cert, json).await
            },
        },
        Commands::Cert { command } => match command {
            CertCommands::Issue {
                center,
                kind,
                alt_names,
                days,
                key,
                subject,
                print_key,
            } => {
                cmd_cert_issue(
                    &pki, &center, kind, alt_names, days, key, subject, print_key, json,
                )
                .await
            },
        },
    }
}
