//! Certificate authority for TLS interception
//!
//! Loads (or generates and persists) a root certificate, then mints leaf
//! certificates on demand for intercepted server names. Leaves reuse the
//! root's key pair, so a cached entry is just the assembled chain plus the
//! shared signer, packaged as a ready-to-serve `rustls::ServerConfig`.
//!
//! Cache keys are wildcard-normalized with the public suffix list so that
//! `a.example.com` and `b.example.com` share one `*.example.com` entry.

use crate::cache::{CertCache, CERT_CACHE_CAP};
use crate::config::expand_home;
use crate::error::{Error, Result};
use crate::keylog::KeyLogWriter;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType, SerialNumber,
};
use rand::Rng;
use std::io::{Cursor, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Backdate certificates to survive client clock skew.
const NOT_BEFORE_HOURS: i64 = 48;

/// Root CA paired with its leaf cache.
pub struct CertAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_key_der: PrivateKeyDer<'static>,
  cache: CertCache<Arc<ServerConfig>>,
  key_log: Option<Arc<KeyLogWriter>>,
}

impl CertAuthority {
  /// Load the CA from `path` (with `~` expansion). When the file does not
  /// exist a fresh root is generated and persisted; any other load failure
  /// is fatal.
  pub fn open(path: &str, key_log: Option<Arc<KeyLogWriter>>) -> Result<Self> {
    let full_path = expand_home(path);
    tracing::info!("loading ca certificate from {}", full_path.display());
    match std::fs::read(&full_path) {
      Ok(data) => Self::from_pem_bundle(&data, key_log),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        tracing::warn!("{e}, generating new certificate");
        let (authority, bundle) = Self::generate(key_log)?;
        save_bundle(&full_path, bundle.as_bytes())?;
        Ok(authority)
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Parse successive PEM blocks until one certificate and one private key
  /// have been captured, then verify they belong together.
  fn from_pem_bundle(data: &[u8], key_log: Option<Arc<KeyLogWriter>>) -> Result<Self> {
    let mut cursor = Cursor::new(data);
    let mut ca_cert_der: Option<CertificateDer<'static>> = None;
    let mut ca_key_der: Option<PrivateKeyDer<'static>> = None;

    for item in rustls_pemfile::read_all(&mut cursor) {
      let item = item.map_err(|_| Error::ca_material("failed to parse pem block"))?;
      match item {
        rustls_pemfile::Item::X509Certificate(cert) if ca_cert_der.is_none() => {
          ca_cert_der = Some(cert);
        }
        rustls_pemfile::Item::Pkcs8Key(key) if ca_key_der.is_none() => {
          ca_key_der = Some(key.into());
        }
        rustls_pemfile::Item::Pkcs1Key(key) if ca_key_der.is_none() => {
          ca_key_der = Some(key.into());
        }
        rustls_pemfile::Item::Sec1Key(key) if ca_key_der.is_none() => {
          ca_key_der = Some(key.into());
        }
        _ => {}
      }
    }

    let ca_cert_der =
      ca_cert_der.ok_or_else(|| Error::ca_material("missing ca certificate in pem blocks"))?;
    let ca_key_der =
      ca_key_der.ok_or_else(|| Error::ca_material("missing private key in pem blocks"))?;

    let key_pair =
      KeyPair::try_from(&ca_key_der).map_err(|e| Error::ca_material(e.to_string()))?;
    verify_key_matches_cert(&ca_cert_der, &key_pair)?;

    let issuer = Issuer::from_ca_cert_der(&ca_cert_der, key_pair)
      .map_err(|e| Error::ca_material(e.to_string()))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_key_der,
      cache: CertCache::new(CERT_CACHE_CAP),
      key_log,
    })
  }

  /// Generate a self-signed root. Returns the authority together with the
  /// PEM bundle to persist (private key block first, then certificate).
  fn generate(key_log: Option<Arc<KeyLogWriter>>) -> Result<(Self, String)> {
    let key_pair = KeyPair::generate().map_err(|e| Error::cert_gen(e.to_string()))?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "mitmproxy");
    dn.push(DnType::OrganizationName, "mitmproxy");
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(NOT_BEFORE_HOURS);
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::cert_gen(e.to_string()))?;

    let bundle = format!("{}{}", key_pair.serialize_pem(), cert.pem());
    let ca_cert_der = CertificateDer::from(cert.der().to_vec());
    let ca_key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|e| Error::cert_gen(e.to_string()))?;

    let issuer = Issuer::from_ca_cert_der(&ca_cert_der, key_pair)
      .map_err(|e| Error::cert_gen(e.to_string()))?;

    let authority = Self {
      issuer,
      ca_cert_der,
      ca_key_der,
      cache: CertCache::new(CERT_CACHE_CAP),
      key_log,
    };
    Ok((authority, bundle))
  }

  /// Look up or mint the TLS server configuration for `server_name`.
  /// Idempotent and safe under concurrency: a racing mint resolves to
  /// whichever cache insert wins.
  pub fn server_config(&self, server_name: &str) -> Result<Arc<ServerConfig>> {
    let (dns, ips, key) = leaf_names(server_name);

    if let Some(config) = self.cache.load(&key) {
      tracing::debug!(tag = "CERT", method = "LOAD", name = %key, "for {server_name}");
      return Ok(config);
    }

    let leaf = self.mint_leaf(&dns, &ips)?;
    let config = Arc::new(self.build_server_config(leaf)?);
    let (config, loaded) = self.cache.load_or_store(&key, config);
    if !loaded {
      tracing::debug!(tag = "CERT", method = "STORE", name = %key, "for {server_name}");
    }
    Ok(config)
  }

  /// Issue a leaf signed by, and reusing the key of, the root.
  pub(crate) fn mint_leaf(
    &self,
    dns: &[String],
    ips: &[IpAddr],
  ) -> Result<CertificateDer<'static>> {
    if dns.is_empty() && ips.is_empty() {
      return Err(Error::cert_gen(
        "missing subject alternate name for leaf certificate",
      ));
    }

    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, pick_common_name(dns, ips));
    dn.push(DnType::OrganizationName, "mitmproxy");
    params.distinguished_name = dn;

    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(NOT_BEFORE_HOURS);
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    for name in dns {
      let ia5 = name
        .as_str()
        .try_into()
        .map_err(|_| Error::cert_gen(format!("invalid dns name: {name}")))?;
      params.subject_alt_names.push(SanType::DnsName(ia5));
    }
    for ip in ips {
      params.subject_alt_names.push(SanType::IpAddress(*ip));
    }

    let cert = params
      .signed_by(self.issuer.key(), &self.issuer)
      .map_err(|e| Error::cert_gen(e.to_string()))?;
    Ok(CertificateDer::from(cert.der().to_vec()))
  }

  /// Chain `[leaf, ca]` served with the shared CA signer.
  fn build_server_config(&self, leaf: CertificateDer<'static>) -> Result<ServerConfig> {
    let chain = vec![leaf, self.ca_cert_der.clone()];
    let mut config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, self.ca_key_der.clone_key())?;
    // interception only speaks HTTP/1.1 inside the tunnel
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    if let Some(key_log) = &self.key_log {
      config.key_log = key_log.clone();
    }
    Ok(config)
  }

  pub fn cache_status(&self) -> (usize, usize) {
    self.cache.status()
  }

  /// DER of the root certificate, e.g. for installing into a trust store.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }
}

/// SAN set and cache key for a server name. IP literals map to an IP SAN
/// keyed by the literal; domains go through the wildcard table.
pub(crate) fn leaf_names(server_name: &str) -> (Vec<String>, Vec<IpAddr>, String) {
  if let Ok(ip) = server_name.parse::<IpAddr>() {
    return (Vec::new(), vec![ip], server_name.to_string());
  }
  let dns = wildcard_domains(server_name);
  let key = dns[0].clone();
  (dns, Vec::new(), key)
}

/// Wildcard coalescing driven by the public suffix list.
///
/// A name one label above its effective suffix is promoted to a wildcard
/// plus the bare name; deeper names collapse onto the wildcard one label
/// up. Names that *are* a suffix, and dot-less names, stay as-is. For
/// suffixes outside the ICANN section a single-label owner is promoted the
/// same way.
fn wildcard_domains(domain: &str) -> Vec<String> {
  let dot_sum = domain.bytes().filter(|b| *b == b'.').count();
  if dot_sum == 0 {
    // localhost => localhost
    return vec![domain.to_string()];
  }

  let (suffix_dots, icann) = match psl::suffix(domain.as_bytes()) {
    Some(suffix) => (
      suffix.as_bytes().iter().filter(|b| **b == b'.').count(),
      matches!(suffix.typ(), Some(psl::Type::Icann)),
    ),
    None => (0, false),
  };
  let first_dot = match domain.find('.') {
    Some(pos) => pos,
    None => return vec![domain.to_string()],
  };

  if icann {
    if dot_sum == suffix_dots {
      // aisai.aichi.jp => aisai.aichi.jp
      vec![domain.to_string()]
    } else if dot_sum - suffix_dots == 1 {
      // example.com => *.example.com + example.com
      vec![format!("*.{domain}"), domain.to_string()]
    } else if dot_sum - suffix_dots == 2 {
      // a.example.com => *.example.com + example.com
      vec![
        format!("*{}", &domain[first_dot..]),
        domain[first_dot + 1..].to_string(),
      ]
    } else {
      // b.a.example.com => *.a.example.com
      vec![format!("*{}", &domain[first_dot..])]
    }
  } else if dot_sum == 1 || dot_sum == suffix_dots {
    // appspot.com => *.appspot.com + appspot.com
    vec![format!("*.{domain}"), domain.to_string()]
  } else if dot_sum - suffix_dots == 1 {
    // a.appspot.com => *.appspot.com + appspot.com
    vec![
      format!("*{}", &domain[first_dot..]),
      domain[first_dot + 1..].to_string(),
    ]
  } else {
    // b.a.appspot.com => *.a.appspot.com
    vec![format!("*{}", &domain[first_dot..])]
  }
}

/// Subject.CommonName from the first subject alternate name. CN is capped
/// at 64 bytes, so over-long names keep their last 64 bytes cut at the
/// next label boundary.
fn pick_common_name(dns: &[String], ips: &[IpAddr]) -> String {
  if dns.is_empty() {
    return ips[0].to_string();
  }
  let name = dns[0].as_bytes();
  if name.len() <= 64 {
    return dns[0].clone();
  }
  let tail = &name[name.len() - 64..];
  let cut = tail
    .iter()
    .position(|b| *b == b'.')
    .map(|pos| pos + 1)
    .unwrap_or(0);
  String::from_utf8_lossy(&tail[cut..]).into_owned()
}

/// Serial numbers are uniformly random in [0, 2^128).
fn random_serial() -> SerialNumber {
  let bytes = rand::thread_rng().gen::<[u8; 16]>();
  SerialNumber::from(bytes.to_vec())
}

/// Public-component equality plus a NotAfter check.
fn verify_key_matches_cert(cert_der: &CertificateDer<'_>, key_pair: &KeyPair) -> Result<()> {
  let (_, cert) = x509_parser::parse_x509_certificate(cert_der.as_ref())
    .map_err(|e| Error::ca_material(format!("failed to parse certificate: {e}")))?;

  if OffsetDateTime::now_utc() > cert.validity().not_after.to_datetime() {
    return Err(Error::ca_material("certificate has expired"));
  }
  if cert.public_key().raw != key_pair.subject_public_key_info() {
    return Err(Error::ca_material("private key does not match certificate"));
  }
  Ok(())
}

/// Write the PEM bundle with owner-only permissions, creating parent
/// directories as needed.
fn save_bundle(path: &Path, data: &[u8]) -> Result<()> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  let mut options = std::fs::OpenOptions::new();
  options.write(true).create(true).truncate(true);
  #[cfg(unix)]
  {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600);
  }
  let mut file = options.open(path)?;
  file.write_all(data)?;
  Ok(())
}
