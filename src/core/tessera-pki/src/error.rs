//! PKI engine error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a toolchain invocation did not produce a usable result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolchainFailure {
    /// The process could not be started.
    Spawn(String),
    /// The process exited with a non-zero status.
    ExitCode(i32),
    /// The process was terminated without an exit status (signal).
    Terminated,
    /// The process did not finish within the configured bound and was killed.
    Timeout(Duration),
}

impl fmt::Display for ToolchainFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolchainFailure::Spawn(reason) => write!(f, "spawn failed: {reason}"),
            ToolchainFailure::ExitCode(code) => write!(f, "exit code {code}"),
            ToolchainFailure::Terminated => f.write_str("terminated by signal"),
            ToolchainFailure::Timeout(after) => write!(f, "timed out after {}s", after.as_secs()),
        }
    }
}

/// Errors that can occur in the PKI Engine.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key algorithm (or one of its parameters) is not supported.
    #[error("invalid key algorithm: {0}")]
    InvalidAlgorithm(String),

    /// Digest algorithm is not supported.
    #[error("invalid hash algorithm: {0:?}")]
    InvalidHash(String),

    /// Validity period must be a positive number of days.
    #[error("invalid validity period: {0} days")]
    InvalidValidityPeriod(i64),

    /// Passphrase is missing. Carries the option name.
    #[error("invalid passphrase: {0} cannot be empty")]
    InvalidPassphrase(String),

    /// A subject field is missing or malformed. Carries the field name.
    #[error("invalid subject field: {0}")]
    InvalidSubjectField(String),

    /// Center name is empty or contains forbidden characters.
    #[error("invalid center name: {0:?}")]
    InvalidCenterName(String),

    /// No initialized center with this name.
    #[error("center not found: {0}")]
    CenterNotFound(String),

    /// A center with this name already exists.
    #[error("center already exists: {0}")]
    CenterAlreadyExists(String),

    /// The center has no CA key and certificate yet.
    #[error("CA not initialized in center: {0}")]
    CaNotInitialized(String),

    /// The center already holds a CA key.
    #[error("CA already initialized in center: {0}")]
    CaAlreadyInitialized(String),

    /// The supplied CA certificate does not match the center's CA key.
    #[error("CA certificate does not match the CA key of center: {0}")]
    CaKeyMismatch(String),

    /// The toolchain ran but failed.
    #[error("toolchain {operation} failed ({failure}): {stderr}")]
    ToolchainExecutionFailed {
        /// Toolchain subcommand that was run.
        operation: String,
        /// Failure reason.
        failure: ToolchainFailure,
        /// Captured standard error.
        stderr: String,
    },

    /// The toolchain succeeded but its output is not what was asked for.
    #[error("malformed toolchain output for {artifact}: {fragment:?}")]
    MalformedToolchainOutput {
        /// Artifact that was expected.
        artifact: &'static str,
        /// Leading part of the offending output.
        fragment: String,
    },

    /// Filesystem error.
    #[error("filesystem error: {0}")]
    FileSystem(#[from] tessera_fs::FsError),
}

/// Artifact name used for private keys in [`PkiError::MalformedToolchainOutput`].
pub const PRIVATE_KEY_ARTIFACT: &str = "private key";

impl PkiError {
    /// Returns true for errors caused by invalid options.
    ///
    /// These are always raised before anything touches disk or spawns a process.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            PkiError::InvalidAlgorithm(_)
                | PkiError::InvalidHash(_)
                | PkiError::InvalidValidityPeriod(_)
                | PkiError::InvalidPassphrase(_)
                | PkiError::InvalidSubjectField(_)
                | PkiError::InvalidCenterName(_)
        )
    }

    /// Builds [`PkiError::MalformedToolchainOutput`] from the start of `output`.
    ///
    /// Only the first line of a private key is kept, so key material never
    /// reaches error messages or logs.
    pub(crate) fn malformed(artifact: &'static str, output: &str) -> Self {
        const MAX_FRAGMENT: usize = 120;
        let output = if artifact == PRIVATE_KEY_ARTIFACT {
            output.lines().next().unwrap_or_default()
        } else {
            output
        };
        let fragment = match output.char_indices().nth(MAX_FRAGMENT) {
            Some((idx, _)) => format!("{}...", &output[..idx]),
            None => output.to_string(),
        };
        PkiError::MalformedToolchainOutput { artifact, fragment }
    }
}
