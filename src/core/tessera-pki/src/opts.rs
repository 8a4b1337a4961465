//! Issuance options and their validation.
//!
//! Callers fill a loosely-typed [`CaOpts`] / [`CertOpts`] (strings, signed
//! day counts) and the engine turns it into fully-typed parameters
//! ([`CaParams`] / [`CertParams`]) before any disk or process work happens.
//! Only the center lookup is left to the store.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::Deserialize;
use zeroize::Zeroizing;

use crate::config::DEFAULT_CENTER;
use crate::error::PkiError;

/// Longest accepted center name.
pub const MAX_CENTER_NAME_LEN: usize = 64;

/// Default validity of a root CA certificate (30 years).
pub const DEFAULT_CA_DAYS: i64 = 10950;

/// Default validity of a leaf certificate.
pub const DEFAULT_CERT_DAYS: i64 = 825;

/// Default RSA modulus size.
pub const DEFAULT_RSA_BITS: u32 = 2048;

/// Default EC curve.
pub const DEFAULT_CURVE: &str = "P-256";

/// A passphrase, wiped from memory on drop.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    /// Wraps a passphrase.
    pub fn new(pass: impl Into<String>) -> Self {
        Self(Zeroizing::new(pass.into()))
    }

    /// Returns the passphrase text.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if the passphrase is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(***)")
    }
}

impl From<String> for Passphrase {
    fn from(pass: String) -> Self {
        Self::new(pass)
    }
}

impl From<&str> for Passphrase {
    fn from(pass: &str) -> Self {
        Self::new(pass)
    }
}

/// Key algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlg {
    /// RSA.
    Rsa,
    /// Elliptic curve.
    Ec,
}

impl KeyAlg {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlg::Rsa => "rsa",
            KeyAlg::Ec => "ec",
        }
    }
}

impl FromStr for KeyAlg {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(KeyAlg::Rsa),
            "ec" => Ok(KeyAlg::Ec),
            _ => Err(PkiError::InvalidAlgorithm(format!("{s:?} (expected rsa or ec)"))),
        }
    }
}

/// Digest used for signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    /// SHA-256.
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl Digest {
    /// Toolchain digest name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Digest::Sha256 => "sha256",
            Digest::Sha384 => "sha384",
            Digest::Sha512 => "sha512",
        }
    }
}

impl FromStr for Digest {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Digest::Sha256),
            "sha384" => Ok(Digest::Sha384),
            "sha512" => Ok(Digest::Sha512),
            _ => Err(PkiError::InvalidHash(s.to_string())),
        }
    }
}

/// Named elliptic curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    /// NIST P-256.
    P256,
    /// NIST P-384.
    P384,
    /// NIST P-521.
    P521,
}

impl EcCurve {
    /// Toolchain curve name.
    pub fn openssl_name(&self) -> &'static str {
        match self {
            EcCurve::P256 => "prime256v1",
            EcCurve::P384 => "secp384r1",
            EcCurve::P521 => "secp521r1",
        }
    }
}

impl FromStr for EcCurve {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p-256" | "p256" | "prime256v1" => Ok(EcCurve::P256),
            "p-384" | "p384" | "secp384r1" => Ok(EcCurve::P384),
            "p-521" | "p521" | "secp521r1" => Ok(EcCurve::P521),
            _ => Err(PkiError::InvalidAlgorithm(format!("unsupported curve {s:?}"))),
        }
    }
}

/// Validated key generation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyParams {
    /// RSA key of the given size.
    Rsa {
        /// Modulus size in bits.
        bits: u32,
    },
    /// EC key on the given curve.
    Ec {
        /// Curve.
        curve: EcCurve,
    },
}

impl KeyParams {
    /// Algorithm of these parameters.
    pub fn alg(&self) -> KeyAlg {
        match self {
            KeyParams::Rsa { .. } => KeyAlg::Rsa,
            KeyParams::Ec { .. } => KeyAlg::Ec,
        }
    }

    fn parse(alg: &str, bits: u32, curve: &str) -> Result<Self, PkiError> {
        match alg.parse::<KeyAlg>()? {
            KeyAlg::Rsa => match bits {
                2048 | 3072 | 4096 => Ok(KeyParams::Rsa { bits }),
                _ => Err(PkiError::InvalidAlgorithm(format!(
                    "unsupported RSA key size {bits} (expected 2048, 3072 or 4096)"
                ))),
            },
            KeyAlg::Ec => Ok(KeyParams::Ec {
                curve: curve.parse()?,
            }),
        }
    }
}

/// Validated distinguished name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Country (two letters).
    pub c: String,
    /// State or province.
    pub st: Option<String>,
    /// Locality.
    pub l: Option<String>,
    /// Organization.
    pub o: Option<String>,
    /// Organizational unit.
    pub ou: Option<String>,
    /// Common name.
    pub cn: String,
    /// Email address.
    pub email: Option<String>,
}

impl Subject {
    /// Renders the subject in the toolchain's `/K=V/...` form.
    pub fn to_subj(&self) -> String {
        let fields = [
            ("C", Some(self.c.as_str())),
            ("ST", self.st.as_deref()),
            ("L", self.l.as_deref()),
            ("O", self.o.as_deref()),
            ("OU", self.ou.as_deref()),
            ("CN", Some(self.cn.as_str())),
            ("emailAddress", self.email.as_deref()),
        ];

        let mut subj = String::new();
        for (key, value) in fields {
            if let Some(value) = value {
                subj.push('/');
                subj.push_str(key);
                subj.push('=');
                for ch in value.chars() {
                    if matches!(ch, '/' | '\\' | '+' | '=') {
                        subj.push('\\');
                    }
                    subj.push(ch);
                }
            }
        }
        subj
    }

    #[allow(clippy::too_many_arguments)]
    fn parse(
        c: &str,
        st: &str,
        l: &str,
        o: &str,
        ou: &str,
        cn: &str,
        email: &str,
    ) -> Result<Self, PkiError> {
        let cn = required_field("CN", cn)?;
        let c = required_field("C", c)?;
        if c.len() != 2 || !c.chars().all(|ch| ch.is_ascii_alphabetic()) {
            return Err(PkiError::InvalidSubjectField("C".into()));
        }

        Ok(Self {
            c: c.to_ascii_uppercase(),
            st: optional_field("ST", st)?,
            l: optional_field("L", l)?,
            o: optional_field("O", o)?,
            ou: optional_field("OU", ou)?,
            cn,
            email: optional_field("emailAddress", email)?,
        })
    }
}

fn required_field(name: &str, value: &str) -> Result<String, PkiError> {
    optional_field(name, value)?.ok_or_else(|| PkiError::InvalidSubjectField(name.into()))
}

fn optional_field(name: &str, value: &str) -> Result<Option<String>, PkiError> {
    let value = value.trim();
    if value.chars().any(char::is_control) {
        return Err(PkiError::InvalidSubjectField(name.into()));
    }
    Ok((!value.is_empty()).then(|| value.to_string()))
}

fn parse_days(days: i64) -> Result<u32, PkiError> {
    if days <= 0 {
        return Err(PkiError::InvalidValidityPeriod(days));
    }
    u32::try_from(days).map_err(|_| PkiError::InvalidValidityPeriod(days))
}

/// The toolchain reads the passphrase as a single line from stdin.
pub(crate) fn require_pass(name: &str, pass: &Passphrase) -> Result<(), PkiError> {
    if pass.is_empty() || pass.expose().chars().any(char::is_control) {
        return Err(PkiError::InvalidPassphrase(name.into()));
    }
    Ok(())
}

/// Checks that a center name is usable as a single directory name.
///
/// Only ASCII letters, digits, `_` and `-` are accepted.
pub fn validate_center_name(name: &str) -> Result<(), PkiError> {
    if name.is_empty() || name.len() > MAX_CENTER_NAME_LEN {
        return Err(PkiError::InvalidCenterName(name.to_string()));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(PkiError::InvalidCenterName(name.to_string()));
    }
    Ok(())
}

/// Options for creating a root CA certificate.
///
/// `Default` gives the baseline option set; override fields with struct
/// update syntax:
///
/// ```
/// use tessera_pki::CaOpts;
///
/// let opts = CaOpts {
///     alg: "ec".into(),
///     pass: "mycapass".into(),
///     cn: "My Root CA".into(),
///     c: "CN".into(),
///     ..CaOpts::default()
/// };
/// assert!(opts.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CaOpts {
    /// Target center.
    #[serde(alias = "centerName")]
    pub center_name: String,
    /// `rsa` or `ec`.
    pub alg: String,
    /// `sha256`, `sha384` or `sha512`.
    pub hash: String,
    /// Validity in days.
    pub days: i64,
    /// Passphrase protecting the CA private key.
    pub pass: Passphrase,
    /// RSA modulus size (ignored for EC).
    #[serde(alias = "bits")]
    pub key_bits: u32,
    /// EC curve (ignored for RSA).
    pub curve: String,
    /// Common name.
    #[serde(rename = "CN")]
    pub cn: String,
    /// Organizational unit.
    #[serde(rename = "OU")]
    pub ou: String,
    /// Organization.
    #[serde(rename = "O")]
    pub o: String,
    /// Country.
    #[serde(rename = "C")]
    pub c: String,
    /// State or province.
    #[serde(rename = "ST")]
    pub st: String,
    /// Locality.
    #[serde(rename = "L")]
    pub l: String,
    /// Email address.
    #[serde(rename = "emailAddress")]
    pub email: String,
}

impl Default for CaOpts {
    fn default() -> Self {
        Self {
            center_name: DEFAULT_CENTER.to_string(),
            alg: "rsa".to_string(),
            hash: "sha256".to_string(),
            days: DEFAULT_CA_DAYS,
            pass: Passphrase::default(),
            key_bits: DEFAULT_RSA_BITS,
            curve: DEFAULT_CURVE.to_string(),
            cn: String::new(),
            ou: String::new(),
            o: String::new(),
            c: String::new(),
            st: String::new(),
            l: String::new(),
            email: String::new(),
        }
    }
}

/// Validated root CA parameters.
#[derive(Debug, Clone)]
pub struct CaParams {
    /// Target center.
    pub center_name: String,
    /// Key parameters.
    pub key: KeyParams,
    /// Signing digest.
    pub digest: Digest,
    /// Validity in days.
    pub days: u32,
    /// CA key passphrase.
    pub pass: Passphrase,
    /// CA subject.
    pub subject: Subject,
}

impl CaOpts {
    /// Validates every field, without touching disk.
    ///
    /// Whether the center exists is checked by the store afterwards.
    pub fn validate(&self) -> Result<CaParams, PkiError> {
        validate_center_name(&self.center_name)?;
        let key = KeyParams::parse(&self.alg, self.key_bits, &self.curve)?;
        let digest = self.hash.parse::<Digest>()?;
        let days = parse_days(self.days)?;
        require_pass("pass", &self.pass)?;
        let subject = Subject::parse(
            &self.c, &self.st, &self.l, &self.o, &self.ou, &self.cn, &self.email,
        )?;

        Ok(CaParams {
            center_name: self.center_name.clone(),
            key,
            digest,
            days,
            pass: self.pass.clone(),
            subject,
        })
    }
}

/// Intended use of a leaf certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertKind {
    /// TLS server (`serverAuth`).
    #[default]
    Server,
    /// TLS client (`clientAuth`).
    Client,
}

impl CertKind {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CertKind::Server => "server",
            CertKind::Client => "client",
        }
    }
}

impl FromStr for CertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(CertKind::Server),
            "client" => Ok(CertKind::Client),
            _ => Err(format!("unknown certificate kind {s:?} (expected server or client)")),
        }
    }
}

/// Subject alternative name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltName {
    /// DNS name.
    Dns(String),
    /// IP address.
    Ip(IpAddr),
}

impl AltName {
    fn parse(value: &str) -> Result<Self, PkiError> {
        let value = value.trim();
        if let Ok(ip) = value.parse::<IpAddr>() {
            return Ok(AltName::Ip(ip));
        }
        if !is_dns_name(value) {
            return Err(PkiError::InvalidSubjectField(format!(
                "subjectAltName {value:?}"
            )));
        }
        Ok(AltName::Dns(value.to_ascii_lowercase()))
    }
}

impl fmt::Display for AltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AltName::Dns(name) => write!(f, "DNS:{name}"),
            AltName::Ip(ip) => write!(f, "IP:{ip}"),
        }
    }
}

fn is_dns_name(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 253
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '*' || c == '_')
        })
}

/// Options for issuing a leaf certificate from a center's CA.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CertOpts {
    /// `rsa` or `ec`.
    pub alg: String,
    /// `sha256`, `sha384` or `sha512`.
    pub hash: String,
    /// Validity in days.
    pub days: i64,
    /// Passphrase protecting the new private key.
    pub pass: Passphrase,
    /// Passphrase of the center's CA key.
    #[serde(alias = "caKeyPass")]
    pub ca_pass: Passphrase,
    /// RSA modulus size (ignored for EC).
    #[serde(alias = "bits")]
    pub key_bits: u32,
    /// EC curve (ignored for RSA).
    pub curve: String,
    /// Server or client certificate.
    pub kind: CertKind,
    /// DNS names and IP addresses.
    #[serde(alias = "ips", alias = "altNames")]
    pub alt_names: Vec<String>,
    /// Common name.
    #[serde(rename = "CN")]
    pub cn: String,
    /// Organizational unit.
    #[serde(rename = "OU")]
    pub ou: String,
    /// Organization.
    #[serde(rename = "O")]
    pub o: String,
    /// Country.
    #[serde(rename = "C")]
    pub c: String,
    /// State or province.
    #[serde(rename = "ST")]
    pub st: String,
    /// Locality.
    #[serde(rename = "L")]
    pub l: String,
    /// Email address.
    #[serde(rename = "emailAddress")]
    pub email: String,
}

impl Default for CertOpts {
    fn default() -> Self {
        Self {
            alg: "rsa".to_string(),
            hash: "sha256".to_string(),
            days: DEFAULT_CERT_DAYS,
            pass: Passphrase::default(),
            ca_pass: Passphrase::default(),
            key_bits: DEFAULT_RSA_BITS,
            curve: DEFAULT_CURVE.to_string(),
            kind: CertKind::Server,
            alt_names: Vec::new(),
            cn: String::new(),
            ou: String::new(),
            o: String::new(),
            c: String::new(),
            st: String::new(),
            l: String::new(),
            email: String::new(),
        }
    }
}

/// Validated leaf certificate parameters.
#[derive(Debug, Clone)]
pub struct CertParams {
    /// Key parameters.
    pub key: KeyParams,
    /// Signing digest.
    pub digest: Digest,
    /// Validity in days.
    pub days: u32,
    /// Leaf key passphrase.
    pub pass: Passphrase,
    /// CA key passphrase.
    pub ca_pass: Passphrase,
    /// Leaf subject.
    pub subject: Subject,
    /// Intended use.
    pub kind: CertKind,
    /// Subject alternative names.
    pub alt_names: Vec<AltName>,
}

impl CertOpts {
    /// Validates every field, without touching disk.
    pub fn validate(&self) -> Result<CertParams, PkiError> {
        let key = KeyParams::parse(&self.alg, self.key_bits, &self.curve)?;
        let digest = self.hash.parse::<Digest>()?;
        let days = parse_days(self.days)?;
        require_pass("pass", &self.pass)?;
        require_pass("ca_pass", &self.ca_pass)?;
        let subject = Subject::parse(
            &self.c, &self.st, &self.l, &self.o, &self.ou, &self.cn, &self.email,
        )?;

        let mut alt_names: Vec<AltName> = Vec::with_capacity(self.alt_names.len());
        for name in &self.alt_names {
            let name = AltName::parse(name)?;
            if !alt_names.contains(&name) {
                alt_names.push(name);
            }
        }

        if alt_names.is_empty() && self.kind == CertKind::Server {
            if let Ok(name) = AltName::parse(&subject.cn) {
                alt_names.push(name);
            }
        }

        Ok(CertParams {
            key,
            digest,
            days,
            pass: self.pass.clone(),
            ca_pass: self.ca_pass.clone(),
            subject,
            kind: self.kind,
            alt_names,
        })
    }
}
