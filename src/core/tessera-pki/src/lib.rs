//! # Tessera PKI Engine
//!
//! Local Certificate Authority "centers" backed by the filesystem, with all
//! key generation and signing delegated to an external `openssl` process.
//!
//! ## Features
//!
//! - Named, independently-rooted CA centers under one base path
//! - Root CA creation (RSA or EC, encrypted private key)
//! - Leaf certificate issuance (server/client, subject alternative names)
//! - Strict option validation before any disk or process work
//! - Typed errors for every failure, toolchain diagnostics included
//!
//! ## Example
//!
//! ```no_run
//! use tessera_pki::{CaOpts, Pki, PkiConfig};
//!
//! # async fn example() -> Result<(), tessera_pki::PkiError> {
//! let pki = Pki::new(PkiConfig::new("/var/lib/tessera")).await;
//! pki.init_default_center().await?;
//!
//! let ca = pki
//!     .init_ca_cert(&CaOpts {
//!         alg: "ec".into(),
//!         pass: "mycapass".into(),
//!         cn: "My Root CA".into(),
//!         c: "CN".into(),
//!         ..CaOpts::default()
//!     })
//!     .await?;
//! println!("CA key written to {}", ca.private_key_file.display());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod assemble;
pub mod center;
pub mod config;
pub mod error;
pub mod opts;
pub mod toolchain;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

pub use assemble::{IssueCaCertRet, IssueCertRet};
pub use center::{Center, CenterLayout, CenterStore};
pub use config::PkiConfig;
pub use error::{PkiError, ToolchainFailure};
pub use opts::{CaOpts, CertKind, CertOpts, KeyParams, Passphrase};
pub use toolchain::{
    Invocation, OpensslToolchain, Toolchain, ToolchainOutput, ToolchainVersion,
};

use assemble::ArtifactPaths;

/// The PKI Engine: creates centers and issues certificates from them.
pub struct Pki<T: Toolchain = OpensslToolchain> {
    config: PkiConfig,
    store: CenterStore,
    toolchain: T,
    version: Option<ToolchainVersion>,
    /// Serializes issuance per center within this process.
    center_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Pki<OpensslToolchain> {
    /// Creates an engine using the `openssl` program named in `config`.
    pub async fn new(config: PkiConfig) -> Self {
        let toolchain = OpensslToolchain::from_config(&config);
        Self::with_toolchain(config, toolchain).await
    }
}

impl<T: Toolchain> Pki<T> {
    /// Creates an engine on top of any toolchain implementation.
    ///
    /// The toolchain version is queried once. If the query fails the version
    /// stays unknown and no algorithm is gated off.
    pub async fn with_toolchain(config: PkiConfig, toolchain: T) -> Self {
        let version = match toolchain.version().await {
            Ok(banner) => {
                let version = ToolchainVersion::parse(&banner);
                if version.is_none() {
                    warn!(banner = %banner, "Unrecognized toolchain version");
                }
                version
            },
            Err(e) => {
                warn!(error = %e, "Toolchain version query failed");
                None
            },
        };

        if let Some(v) = version {
            info!(version = %v, base_path = %config.base_path.display(), "PKI engine ready");
        }

        Self {
            store: CenterStore::new(config.base_path.clone()),
            config,
            toolchain,
            version,
            center_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &PkiConfig {
        &self.config
    }

    /// Center store.
    pub fn store(&self) -> &CenterStore {
        &self.store
    }

    /// Toolchain version, if the query succeeded.
    pub fn toolchain_version(&self) -> Option<ToolchainVersion> {
        self.version
    }

    /// Creates a new, empty center.
    pub async fn initialize_center(&self, name: &str) -> Result<Center, PkiError> {
        self.store.initialize(name).await
    }

    /// Creates the configured default center.
    pub async fn init_default_center(&self) -> Result<Center, PkiError> {
        self.store.initialize(&self.config.default_center).await
    }

    /// Finds an initialized center.
    pub async fn resolve_center(&self, name: &str) -> Result<Center, PkiError> {
        self.store.resolve(name).await
    }

    /// Names of all initialized centers.
    pub async fn list_centers(&self) -> Result<Vec<String>, PkiError> {
        self.store.list().await
    }

    /// Creates the center's CA key and self-signed certificate, keeping the
    /// certificate in memory only.
    ///
    /// The key is written to `private/ca.key`; `crt_file` is `None`.
    pub async fn gen_ca_cert(&self, opts: &CaOpts) -> Result<IssueCaCertRet, PkiError> {
        self.issue_ca(opts, false).await
    }

    /// Creates the center's CA key and self-signed certificate and persists
    /// both (`private/ca.key`, `certs/ca.crt`).
    pub async fn init_ca_cert(&self, opts: &CaOpts) -> Result<IssueCaCertRet, PkiError> {
        self.issue_ca(opts, true).await
    }

    /// Persists a CA certificate produced by [`Pki::gen_ca_cert`] as
    /// `certs/ca.crt`, completing the center's CA.
    ///
    /// `pass` unlocks `private/ca.key`; the certificate must carry the
    /// public half of that key.
    pub async fn save_ca_cert(
        &self,
        center_name: &str,
        cert: &str,
        pass: &Passphrase,
    ) -> Result<PathBuf, PkiError> {
        opts::require_pass("pass", pass)?;
        assemble::require_marker("certificate", cert, assemble::CERT_MARKER)?;
        let center = self.store.resolve(center_name).await?;

        let lock = self.center_lock(center.name());
        let _guard = lock.lock().await;

        let layout = center.layout();
        if !tessera_fs::file_exists(&layout.ca_key_file).await {
            return Err(PkiError::CaNotInitialized(center.name().to_string()));
        }
        if tessera_fs::file_exists(&layout.ca_cert_file).await {
            return Err(PkiError::CaAlreadyInitialized(center.name().to_string()));
        }

        toolchain::check_ca_pair(&self.toolchain, &center, cert, pass).await?;
        tessera_fs::write_new(&layout.ca_cert_file, cert, Some(assemble::CERT_FILE_MODE)).await?;

        info!(center = %center.name(), "CA certificate saved");
        Ok(layout.ca_cert_file.clone())
    }

    /// Issues a leaf certificate signed by the CA of `center_name`.
    ///
    /// Key and certificate are written to `private/<serial>.key` and
    /// `certs/<serial>.crt`.
    pub async fn issue_cert(
        &self,
        opts: &CertOpts,
        center_name: &str,
    ) -> Result<IssueCertRet, PkiError> {
        let params = opts.validate()?;
        let center = self.store.resolve(center_name).await?;

        let lock = self.center_lock(center.name());
        let _guard = lock.lock().await;

        if !center.ca_initialized().await {
            return Err(PkiError::CaNotInitialized(center.name().to_string()));
        }
        self.check_alg(&params.key)?;

        let serial = center.next_serial().await?;
        let raw = toolchain::generate_leaf(&self.toolchain, &center, &params).await?;

        let paths = ArtifactPaths {
            key_file: center.layout().key_file(&serial),
            cert_file: center.layout().cert_file(&serial),
            serial: Some(serial),
        };
        let ret = assemble::assemble(raw, &center, paths, &params.pass, true).await?;

        info!(
            center = %center.name(),
            serial = ret.serial.as_deref().unwrap_or_default(),
            cn = %params.subject.cn,
            kind = params.kind.as_str(),
            "Certificate issued"
        );
        Ok(ret)
    }

    async fn issue_ca(&self, opts: &CaOpts, persist_cert: bool) -> Result<IssueCaCertRet, PkiError> {
        let params = opts.validate()?;
        let center = self.store.resolve(&params.center_name).await?;

        let lock = self.center_lock(center.name());
        let _guard = lock.lock().await;

        let layout = center.layout();
        if tessera_fs::file_exists(&layout.ca_key_file).await {
            return Err(PkiError::CaAlreadyInitialized(center.name().to_string()));
        }
        self.check_alg(&params.key)?;

        if tessera_fs::file_exists(&layout.ca_cert_file).await {
            warn!(center = %center.name(), "Removing CA certificate without a CA key");
            tessera_fs::remove_file_if_exists(&layout.ca_cert_file).await?;
        }

        let raw = toolchain::generate_ca(&self.toolchain, &center, &params).await?;

        let paths = ArtifactPaths {
            key_file: layout.ca_key_file.clone(),
            cert_file: layout.ca_cert_file.clone(),
            serial: None,
        };
        let ret = assemble::assemble(raw, &center, paths, &params.pass, persist_cert).await?;

        info!(
            center = %center.name(),
            alg = params.key.alg().as_str(),
            days = params.days,
            persisted = persist_cert,
            "CA certificate issued"
        );
        Ok(ret)
    }

    fn check_alg(&self, key: &KeyParams) -> Result<(), PkiError> {
        match self.version {
            Some(version) if !version.supports(key.alg()) => {
                warn!(alg = key.alg().as_str(), version = %version, "Algorithm not supported by toolchain");
                Err(PkiError::InvalidAlgorithm(format!(
                    "{} keys require toolchain >= {}, found {}",
                    key.alg().as_str(),
                    ToolchainVersion::EC_MINIMUM,
                    version
                )))
            },
            _ => Ok(()),
        }
    }

    fn center_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .center_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }
}
