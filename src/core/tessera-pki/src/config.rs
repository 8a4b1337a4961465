//! Process-scoped engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default toolchain program, looked up on `PATH`.
pub const DEFAULT_OPENSSL: &str = "openssl";

/// Default bound on a single toolchain invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default center name.
pub const DEFAULT_CENTER: &str = "default";

/// Engine configuration.
///
/// Built once at startup and handed to [`Pki`](crate::Pki); nothing mutates
/// it afterwards.
#[derive(Debug, Clone)]
pub struct PkiConfig {
    /// Directory under which every center lives (`{base_path}/{name}`).
    pub base_path: PathBuf,
    /// Toolchain program.
    pub openssl: PathBuf,
    /// Upper bound on a single toolchain invocation.
    pub timeout: Duration,
    /// Center used by [`Pki::init_default_center`](crate::Pki::init_default_center).
    pub default_center: String,
}

impl PkiConfig {
    /// Creates a configuration rooted at `base_path` with default settings.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            openssl: PathBuf::from(DEFAULT_OPENSSL),
            timeout: DEFAULT_TIMEOUT,
            default_center: DEFAULT_CENTER.to_string(),
        }
    }

    /// Sets the toolchain program.
    pub fn with_openssl(mut self, openssl: impl Into<PathBuf>) -> Self {
        self.openssl = openssl.into();
        self
    }

    /// Sets the invocation bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the default center name.
    pub fn with_default_center(mut self, name: impl Into<String>) -> Self {
        self.default_center = name.into();
        self
    }

    /// Root directory of all centers.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}
