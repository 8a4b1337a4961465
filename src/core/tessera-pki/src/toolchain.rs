//! External toolchain invocation.
//!
//! Every cryptographic operation is delegated to an `openssl` process. The
//! passphrase never appears on the command line: it is written as a single
//! line to the child's stdin (`-pass stdin` / `-passin stdin`).
//!
//! Intermediate artifacts the toolchain must read from a file (the fresh
//! encrypted key, a CSR, an extension file, a certificate to check) live in
//! scratch files inside the
//! center's `private/` directory and are removed when they go out of scope,
//! on success and failure alike.

use std::ffi::OsString;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use tessera_fs::FsError;

use crate::assemble::{
    require_marker, CERT_MARKER, CSR_MARKER, ENCRYPTED_KEY_MARKER, PUBLIC_KEY_MARKER,
};
use crate::center::{Center, CenterLayout};
use crate::config::PkiConfig;
use crate::error::{PkiError, ToolchainFailure, PRIVATE_KEY_ARTIFACT};
use crate::opts::{CaParams, CertKind, CertParams, Digest, KeyAlg, KeyParams, Passphrase, Subject};

/// Extension section name used when signing leaf certificates.
const LEAF_EXT_SECTION: &str = "leaf_ext";

/// One toolchain call.
#[derive(Debug, Clone)]
pub struct Invocation {
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    secret: Option<Passphrase>,
}

impl Invocation {
    /// Starts an invocation of `subcommand`.
    pub fn new(subcommand: &str) -> Self {
        Self {
            args: vec![OsString::from(subcommand)],
            current_dir: None,
            secret: None,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Runs the process in `dir`.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Delivers `pass` on stdin.
    pub fn secret(mut self, pass: &Passphrase) -> Self {
        self.secret = Some(pass.clone());
        self
    }

    /// Subcommand name.
    pub fn operation(&self) -> String {
        self.args
            .first()
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Full argument list, subcommand first.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Working directory, if any.
    pub fn working_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Passphrase to deliver on stdin, if any.
    pub fn stdin_secret(&self) -> Option<&Passphrase> {
        self.secret.as_ref()
    }
}

/// What a finished toolchain process produced.
#[derive(Debug, Clone, Default)]
pub struct ToolchainOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code, `None` if terminated by a signal.
    pub exit_code: Option<i32>,
}

impl ToolchainOutput {
    /// Returns true for a zero exit code.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Capability to run the external toolchain.
///
/// [`OpensslToolchain`] spawns real processes; tests substitute an in-memory
/// implementation.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Runs one invocation to completion.
    ///
    /// Returns the captured output whatever the exit code; only failures to
    /// run at all (spawn error, timeout) are errors here.
    async fn run(&self, invocation: Invocation) -> Result<ToolchainOutput, PkiError>;

    /// Returns the toolchain's version banner.
    async fn version(&self) -> Result<String, PkiError> {
        let output = run_checked(self, Invocation::new("version")).await?;
        Ok(output.stdout.trim().to_string())
    }
}

/// Runs an invocation and turns a non-zero exit into an error.
pub async fn run_checked<T: Toolchain + ?Sized>(
    toolchain: &T,
    invocation: Invocation,
) -> Result<ToolchainOutput, PkiError> {
    let operation = invocation.operation();
    let output = toolchain.run(invocation).await?;

    if output.success() {
        return Ok(output);
    }

    let failure = match output.exit_code {
        Some(code) => ToolchainFailure::ExitCode(code),
        None => ToolchainFailure::Terminated,
    };
    Err(PkiError::ToolchainExecutionFailed {
        operation,
        failure,
        stderr: output.stderr.trim().to_string(),
    })
}

/// Toolchain backed by an `openssl` executable.
#[derive(Debug, Clone)]
pub struct OpensslToolchain {
    program: PathBuf,
    timeout: Duration,
}

impl OpensslToolchain {
    /// Creates a toolchain running `program`, killing calls after `timeout`.
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Creates a toolchain from the engine configuration.
    pub fn from_config(config: &PkiConfig) -> Self {
        Self::new(config.openssl.clone(), config.timeout)
    }
}

#[async_trait]
impl Toolchain for OpensslToolchain {
    async fn run(&self, invocation: Invocation) -> Result<ToolchainOutput, PkiError> {
        let operation = invocation.operation();
        let failed = |failure: ToolchainFailure| PkiError::ToolchainExecutionFailed {
            operation: operation.clone(),
            failure,
            stderr: String::new(),
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(invocation.args())
            .stdin(if invocation.secret.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = invocation.working_dir() {
            cmd.current_dir(dir);
        }

        debug!(
            program = %self.program.display(),
            operation = %operation,
            "Running toolchain"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| failed(ToolchainFailure::Spawn(e.to_string())))?;

        if let (Some(secret), Some(mut stdin)) = (&invocation.secret, child.stdin.take()) {
            let mut line = Zeroizing::new(String::with_capacity(secret.expose().len() + 1));
            line.push_str(secret.expose());
            line.push('\n');
            // The child may exit before reading its input; its exit status tells.
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(failed(ToolchainFailure::Spawn(e.to_string())));
                }
            }
        }

        // On timeout the child is dropped, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| failed(ToolchainFailure::Spawn(e.to_string())))?,
            Err(_) => {
                warn!(operation = %operation, timeout = ?self.timeout, "Toolchain timed out");
                return Err(failed(ToolchainFailure::Timeout(self.timeout)));
            },
        };

        Ok(ToolchainOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// Toolchain release, as reported by `openssl version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ToolchainVersion {
    /// Major release.
    pub major: u32,
    /// Minor release.
    pub minor: u32,
    /// Patch release (letter suffixes ignored).
    pub patch: u32,
}

impl ToolchainVersion {
    /// First release able to generate EC keys the way this crate asks for.
    pub const EC_MINIMUM: ToolchainVersion = ToolchainVersion {
        major: 1,
        minor: 0,
        patch: 2,
    };

    /// Parses a banner such as `OpenSSL 1.0.2k  26 Jan 2017`.
    pub fn parse(banner: &str) -> Option<Self> {
        let number = banner.split_whitespace().nth(1)?;
        let mut parts = number.split('.').map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u32>().ok()
        });

        let major = parts.next()??;
        let minor = parts.next()??;
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    /// Returns true if keys of `alg` can be generated.
    pub fn supports(&self, alg: KeyAlg) -> bool {
        match alg {
            KeyAlg::Rsa => true,
            KeyAlg::Ec => *self >= Self::EC_MINIMUM,
        }
    }
}

impl fmt::Display for ToolchainVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ============================================================================
// Command builders
// ============================================================================

/// Generates an encrypted PKCS#8 key on stdout.
pub fn genpkey(key: &KeyParams, pass: &Passphrase) -> Invocation {
    let inv = Invocation::new("genpkey");
    let inv = match key {
        KeyParams::Rsa { bits } => inv
            .arg("-algorithm")
            .arg("RSA")
            .arg("-pkeyopt")
            .arg(format!("rsa_keygen_bits:{bits}")),
        KeyParams::Ec { curve } => inv
            .arg("-algorithm")
            .arg("EC")
            .arg("-pkeyopt")
            .arg(format!("ec_paramgen_curve:{}", curve.openssl_name()))
            .arg("-pkeyopt")
            .arg("ec_param_enc:named_curve"),
    };
    inv.arg("-aes256").arg("-pass").arg("stdin").secret(pass)
}

/// Self-signs a CA certificate for the key in `key_file`.
pub fn self_signed_ca(layout: &CenterLayout, key_file: &Path, params: &CaParams) -> Invocation {
    Invocation::new("req")
        .arg("-new")
        .arg("-x509")
        .arg("-config")
        .arg(&layout.config_file)
        .arg("-extensions")
        .arg("v3_ca")
        .arg("-key")
        .arg(key_file)
        .arg("-passin")
        .arg("stdin")
        .arg("-days")
        .arg(params.days.to_string())
        .arg(format!("-{}", params.digest.as_str()))
        .arg("-subj")
        .arg(params.subject.to_subj())
        .arg("-utf8")
        .current_dir(&layout.root)
        .secret(&params.pass)
}

/// Creates a signing request for the key in `key_file`.
pub fn signing_request(
    layout: &CenterLayout,
    key_file: &Path,
    digest: Digest,
    subject: &Subject,
    pass: &Passphrase,
) -> Invocation {
    Invocation::new("req")
        .arg("-new")
        .arg("-config")
        .arg(&layout.config_file)
        .arg("-key")
        .arg(key_file)
        .arg("-passin")
        .arg("stdin")
        .arg(format!("-{}", digest.as_str()))
        .arg("-subj")
        .arg(subject.to_subj())
        .arg("-utf8")
        .current_dir(&layout.root)
        .secret(pass)
}

/// Signs the request in `csr_file` with the center's CA key.
///
/// The toolchain advances the center's serial and appends to its index.
pub fn sign_leaf(
    layout: &CenterLayout,
    csr_file: &Path,
    ext_file: &Path,
    params: &CertParams,
) -> Invocation {
    Invocation::new("ca")
        .arg("-batch")
        .arg("-config")
        .arg(&layout.config_file)
        .arg("-notext")
        .arg("-in")
        .arg(csr_file)
        .arg("-days")
        .arg(params.days.to_string())
        .arg("-md")
        .arg(params.digest.as_str())
        .arg("-extfile")
        .arg(ext_file)
        .arg("-extensions")
        .arg(LEAF_EXT_SECTION)
        .arg("-passin")
        .arg("stdin")
        .current_dir(&layout.root)
        .secret(&params.ca_pass)
}

/// Extension section applied to a leaf certificate.
pub fn leaf_extensions(params: &CertParams) -> String {
    let key_usage = match params.key.alg() {
        KeyAlg::Rsa => "critical, digitalSignature, keyEncipherment",
        KeyAlg::Ec => "critical, digitalSignature",
    };
    let ext_key_usage = match params.kind {
        CertKind::Server => "serverAuth",
        CertKind::Client => "clientAuth",
    };

    let mut ext = format!(
        "[ {LEAF_EXT_SECTION} ]\n\
         basicConstraints       = critical, CA:FALSE\n\
         subjectKeyIdentifier   = hash\n\
         authorityKeyIdentifier = keyid,issuer\n\
         keyUsage               = {key_usage}\n\
         extendedKeyUsage       = {ext_key_usage}\n"
    );
    if !params.alt_names.is_empty() {
        let names: Vec<String> = params.alt_names.iter().map(ToString::to_string).collect();
        ext.push_str(&format!("subjectAltName         = {}\n", names.join(", ")));
    }
    ext
}

/// Prints the public key of the encrypted key in `key_file`.
pub fn key_public_key(layout: &CenterLayout, key_file: &Path, pass: &Passphrase) -> Invocation {
    Invocation::new("pkey")
        .arg("-in")
        .arg(key_file)
        .arg("-passin")
        .arg("stdin")
        .arg("-pubout")
        .current_dir(&layout.root)
        .secret(pass)
}

/// Prints the public key of the certificate in `cert_file`.
pub fn cert_public_key(layout: &CenterLayout, cert_file: &Path) -> Invocation {
    Invocation::new("x509")
        .arg("-in")
        .arg(cert_file)
        .arg("-noout")
        .arg("-pubkey")
        .current_dir(&layout.root)
}

// ============================================================================
// Generation pipelines
// ============================================================================

/// Key and certificate text as produced by the toolchain.
#[derive(Debug, Clone)]
pub struct RawArtifacts {
    /// Encrypted private key, PEM.
    pub private_key: String,
    /// Certificate, PEM.
    pub cert: String,
}

/// Writes `content` to a scratch file in `dir`, removed on drop.
fn scratch_file(dir: &Path, content: &str) -> Result<NamedTempFile, PkiError> {
    let mut file = tempfile::Builder::new()
        .prefix(".scratch-")
        .suffix(".pem")
        .tempfile_in(dir)
        .map_err(|e| FsError::io("create", dir, e))?;
    file.write_all(content.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|e| FsError::io("write", file.path(), e))?;
    Ok(file)
}

async fn generate_key<T: Toolchain + ?Sized>(
    toolchain: &T,
    key: &KeyParams,
    pass: &Passphrase,
) -> Result<String, PkiError> {
    let output = run_checked(toolchain, genpkey(key, pass)).await?;
    require_marker(PRIVATE_KEY_ARTIFACT, &output.stdout, ENCRYPTED_KEY_MARKER)?;
    Ok(output.stdout)
}

/// Generates a CA key and its self-signed certificate for `center`.
pub async fn generate_ca<T: Toolchain + ?Sized>(
    toolchain: &T,
    center: &Center,
    params: &CaParams,
) -> Result<RawArtifacts, PkiError> {
    let layout = center.layout();

    let private_key = generate_key(toolchain, &params.key, &params.pass).await?;
    let key_scratch = scratch_file(&layout.private_dir, &private_key)?;

    let output = run_checked(toolchain, self_signed_ca(layout, key_scratch.path(), params)).await?;
    require_marker("certificate", &output.stdout, CERT_MARKER)?;

    Ok(RawArtifacts {
        private_key,
        cert: output.stdout,
    })
}

/// Generates a leaf key and a certificate signed by `center`'s CA.
pub async fn generate_leaf<T: Toolchain + ?Sized>(
    toolchain: &T,
    center: &Center,
    params: &CertParams,
) -> Result<RawArtifacts, PkiError> {
    let layout = center.layout();

    let private_key = generate_key(toolchain, &params.key, &params.pass).await?;
    let key_scratch = scratch_file(&layout.private_dir, &private_key)?;

    let csr = run_checked(
        toolchain,
        signing_request(
            layout,
            key_scratch.path(),
            params.digest,
            &params.subject,
            &params.pass,
        ),
    )
    .await?;
    require_marker("certificate request", &csr.stdout, CSR_MARKER)?;

    let csr_scratch = scratch_file(&layout.private_dir, &csr.stdout)?;
    let ext_scratch = scratch_file(&layout.private_dir, &leaf_extensions(params))?;

    let output = run_checked(
        toolchain,
        sign_leaf(layout, csr_scratch.path(), ext_scratch.path(), params),
    )
    .await?;
    require_marker("certificate", &output.stdout, CERT_MARKER)?;

    Ok(RawArtifacts {
        private_key,
        cert: output.stdout,
    })
}

/// Checks that `cert` belongs to the CA key of `center`, unlocked with `pass`.
pub async fn check_ca_pair<T: Toolchain + ?Sized>(
    toolchain: &T,
    center: &Center,
    cert: &str,
    pass: &Passphrase,
) -> Result<(), PkiError> {
    let layout = center.layout();

    let from_key = run_checked(toolchain, key_public_key(layout, &layout.ca_key_file, pass)).await?;
    require_marker("public key", &from_key.stdout, PUBLIC_KEY_MARKER)?;

    let cert_scratch = scratch_file(&layout.private_dir, cert)?;
    let from_cert = run_checked(toolchain, cert_public_key(layout, cert_scratch.path())).await?;
    require_marker("public key", &from_cert.stdout, PUBLIC_KEY_MARKER)?;

    if from_key.stdout.trim() != from_cert.stdout.trim() {
        return Err(PkiError::CaKeyMismatch(center.name().to_string()));
    }
    Ok(())
}
