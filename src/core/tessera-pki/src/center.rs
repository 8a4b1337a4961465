//! Center store: named CA directories under one base path.
//!
//! ## Layout
//!
//! ```text
//! {base}/{name}/
//!     openssl.conf          toolchain configuration (paths relative to the root)
//!     serial                next serial number, hex
//!     index                 issuance journal kept by the toolchain
//!     private/              0700
//!         ca.key            encrypted CA key
//!         <serial>.key      encrypted leaf keys
//!     certs/
//!         ca.crt            CA certificate
//!         <serial>.crt      leaf certificates
//!     newcerts/             toolchain copies of every signed certificate
//! ```
//!
//! A center is built in a hidden staging directory and moved into place with
//! a single rename. The rename is the commit point: a center either resolves
//! with its full layout or does not exist at all.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use tessera_fs::{FsError, NewFile};

use crate::error::PkiError;
use crate::opts::validate_center_name;

const CONFIG_FILE: &str = "openssl.conf";
const SERIAL_FILE: &str = "serial";
const INDEX_FILE: &str = "index";
const PRIVATE_DIR: &str = "private";
const CERTS_DIR: &str = "certs";
const NEW_CERTS_DIR: &str = "newcerts";
const CA_KEY_FILE: &str = "ca.key";
const CA_CERT_FILE: &str = "ca.crt";

const INITIAL_SERIAL: &str = "01\n";
const DATA_FILE_MODE: u32 = 0o644;

/// Toolchain configuration written into every center.
const CONFIG_TEMPLATE: &str = r#"# Center configuration. Paths are relative to the center root.

[ ca ]
default_ca = center_ca

[ center_ca ]
dir             = .
certs           = $dir/certs
new_certs_dir   = $dir/newcerts
database        = $dir/index
serial          = $dir/serial
private_key     = $dir/private/ca.key
certificate     = $dir/certs/ca.crt
default_md      = sha256
default_days    = 825
preserve        = no
policy          = policy_loose
unique_subject  = no
copy_extensions = none
email_in_dn     = no

[ policy_loose ]
countryName             = optional
stateOrProvinceName     = optional
localityName            = optional
organizationName        = optional
organizationalUnitName  = optional
commonName              = supplied
emailAddress            = optional

[ req ]
distinguished_name = req_distinguished_name
string_mask        = utf8only
default_md         = sha256

[ req_distinguished_name ]

[ v3_ca ]
subjectKeyIdentifier   = hash
authorityKeyIdentifier = keyid:always,issuer
basicConstraints       = critical, CA:true
keyUsage               = critical, digitalSignature, cRLSign, keyCertSign
"#;

/// Paths of one center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CenterLayout {
    /// Center root directory.
    pub root: PathBuf,
    /// Toolchain configuration.
    pub config_file: PathBuf,
    /// Serial counter.
    pub serial_file: PathBuf,
    /// Issuance journal.
    pub index_file: PathBuf,
    /// Private key directory.
    pub private_dir: PathBuf,
    /// Certificate directory.
    pub certs_dir: PathBuf,
    /// Toolchain copies of signed certificates.
    pub new_certs_dir: PathBuf,
    /// CA private key.
    pub ca_key_file: PathBuf,
    /// CA certificate.
    pub ca_cert_file: PathBuf,
}

impl CenterLayout {
    pub(crate) fn new(root: PathBuf) -> Self {
        let private_dir = root.join(PRIVATE_DIR);
        let certs_dir = root.join(CERTS_DIR);
        Self {
            config_file: root.join(CONFIG_FILE),
            serial_file: root.join(SERIAL_FILE),
            index_file: root.join(INDEX_FILE),
            new_certs_dir: root.join(NEW_CERTS_DIR),
            ca_key_file: private_dir.join(CA_KEY_FILE),
            ca_cert_file: certs_dir.join(CA_CERT_FILE),
            private_dir,
            certs_dir,
            root,
        }
    }

    /// Private key path for a leaf identified by `serial`.
    pub fn key_file(&self, serial: &str) -> PathBuf {
        self.private_dir.join(format!("{serial}.key"))
    }

    /// Certificate path for a leaf identified by `serial`.
    pub fn cert_file(&self, serial: &str) -> PathBuf {
        self.certs_dir.join(format!("{serial}.crt"))
    }

    async fn is_complete(&self) -> bool {
        tessera_fs::dir_exists(&self.root).await
            && tessera_fs::file_exists(&self.config_file).await
            && tessera_fs::file_exists(&self.serial_file).await
            && tessera_fs::file_exists(&self.index_file).await
            && tessera_fs::dir_exists(&self.private_dir).await
            && tessera_fs::dir_exists(&self.certs_dir).await
            && tessera_fs::dir_exists(&self.new_certs_dir).await
    }

    async fn populate(&self) -> Result<(), FsError> {
        tessera_fs::create_dir_with_mode(&self.private_dir, 0o700).await?;
        tessera_fs::create_dir_all(&self.certs_dir).await?;
        tessera_fs::create_dir_all(&self.new_certs_dir).await?;
        tessera_fs::write_new_all(vec![
            NewFile::new(&self.serial_file, INITIAL_SERIAL, Some(DATA_FILE_MODE)),
            NewFile::new(&self.index_file, "", Some(DATA_FILE_MODE)),
            NewFile::new(&self.config_file, CONFIG_TEMPLATE, Some(DATA_FILE_MODE)),
        ])
        .await
    }
}

/// An initialized center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Center {
    name: String,
    layout: CenterLayout,
}

impl Center {
    /// Center name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Center root directory.
    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    /// Center paths.
    pub fn layout(&self) -> &CenterLayout {
        &self.layout
    }

    /// Returns true once the CA key and certificate are both present.
    pub async fn ca_initialized(&self) -> bool {
        tessera_fs::file_exists(&self.layout.ca_key_file).await
            && tessera_fs::file_exists(&self.layout.ca_cert_file).await
    }

    /// Serial number the next signed certificate will get (lowercase hex).
    pub async fn next_serial(&self) -> Result<String, PkiError> {
        let raw = tessera_fs::read_text(&self.layout.serial_file).await?;
        let serial = raw.trim().to_ascii_lowercase();
        if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PkiError::malformed("serial", &raw));
        }
        Ok(serial)
    }
}

/// Creates and locates centers under a base path.
#[derive(Debug, Clone)]
pub struct CenterStore {
    base_path: PathBuf,
}

impl CenterStore {
    /// Creates a store rooted at `base_path`. Nothing is touched on disk.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn center_root(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    /// Finds an initialized center.
    pub async fn resolve(&self, name: &str) -> Result<Center, PkiError> {
        validate_center_name(name)?;

        let layout = CenterLayout::new(self.center_root(name));
        if !layout.is_complete().await {
            return Err(PkiError::CenterNotFound(name.to_string()));
        }

        Ok(Center {
            name: name.to_string(),
            layout,
        })
    }

    /// Creates a new center.
    ///
    /// Exactly one of several concurrent initializations of the same name
    /// succeeds, across processes; the others get
    /// [`PkiError::CenterAlreadyExists`].
    pub async fn initialize(&self, name: &str) -> Result<Center, PkiError> {
        validate_center_name(name)?;

        let root = self.center_root(name);
        if path_taken(&root).await {
            return Err(PkiError::CenterAlreadyExists(name.to_string()));
        }

        tessera_fs::create_dir_all(&self.base_path).await?;

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{name}.init-"))
            .tempdir_in(&self.base_path)
            .map_err(|e| FsError::io("create directory", &self.base_path, e))?;

        let staged = CenterLayout::new(staging.path().to_path_buf());
        staged.populate().await?;

        debug!(center = %name, staging = %staging.path().display(), "Center staged");

        if let Err(e) = tessera_fs::rename(staging.path(), &root).await {
            // Staging is removed when `staging` drops.
            if path_taken(&root).await {
                return Err(PkiError::CenterAlreadyExists(name.to_string()));
            }
            return Err(e.into());
        }
        // The staging path no longer exists; dropping the guard is a no-op.
        drop(staging);

        info!(center = %name, path = %root.display(), "Center initialized");

        Ok(Center {
            name: name.to_string(),
            layout: CenterLayout::new(root),
        })
    }

    /// Names of all initialized centers, sorted.
    pub async fn list(&self) -> Result<Vec<String>, PkiError> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FsError::io("list", &self.base_path, e).into()),
        };

        let mut names = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|e| FsError::io("list", &self.base_path, e))?;
            let Some(entry) = entry else { break };

            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_center_name(&name).is_err() {
                continue;
            }
            if self.resolve(&name).await.is_ok() {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }
}

async fn path_taken(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}
