//! TLS support for implicit TLS and STARTTLS
//!
//! Certificates live in a [`CertStore`]: a map from normalised hostname to
//! certificate with a `*` default entry. The store is the rustls
//! certificate resolver, so SNI selection happens during the handshake and
//! the map can be replaced at runtime without rebuilding the acceptor.
//!
//! When TLS is needed but no certificate is configured, an in-memory
//! self-signed certificate is generated for the server name.

use crate::config::TlsSettings;
use crate::error::{PostError, Result};
use crate::smtp::session::TlsInfo;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{Certificate, PrivateKey, ServerConfig, ServerConnection};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::collections::HashMap;
use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Key of the fallback certificate
pub const DEFAULT_CERT: &str = "*";

/// User hook consulted before the map; gets the normalised server name
pub type SniCallback = Arc<dyn Fn(&str) -> Option<Arc<CertifiedKey>> + Send + Sync>;

pub struct CertStore {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    callback: Option<SniCallback>,
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .certs
            .read()
            .map(|certs| certs.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("CertStore")
            .field("names", &names)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl CertStore {
    pub fn new(default: Arc<CertifiedKey>) -> Self {
        let mut certs = HashMap::new();
        certs.insert(DEFAULT_CERT.to_string(), default);
        Self {
            certs: RwLock::new(certs),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: SniCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Add or replace the certificate for `hostname` (`*` for the default)
    pub fn insert(&self, hostname: &str, key: Arc<CertifiedKey>) {
        let name = if hostname == DEFAULT_CERT {
            DEFAULT_CERT.to_string()
        } else {
            normalize_hostname(hostname)
        };

        let mut certs = self.certs.write().unwrap_or_else(|e| e.into_inner());
        certs.insert(name, key);
    }

    /// Replace the whole map. `default` becomes the `*` entry.
    pub fn update(&self, default: Arc<CertifiedKey>, by_name: HashMap<String, Arc<CertifiedKey>>) {
        let mut next: HashMap<String, Arc<CertifiedKey>> = by_name
            .into_iter()
            .map(|(name, key)| (normalize_hostname(&name), key))
            .collect();
        next.insert(DEFAULT_CERT.to_string(), default);

        let mut certs = self.certs.write().unwrap_or_else(|e| e.into_inner());
        *certs = next;
        info!(tnx = "tls", "Certificate store updated with {} entries", certs.len());
    }

    /// Certificate for `servername`, falling back to the default entry
    pub fn lookup(&self, servername: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let name = servername.map(normalize_hostname);

        if let (Some(callback), Some(name)) = (&self.callback, name.as_deref()) {
            match callback(name) {
                Some(key) => return Some(key),
                None => debug!(tnx = "sni", servername = name, "SNI callback returned no certificate"),
            }
        }

        let certs = self.certs.read().unwrap_or_else(|e| e.into_inner());
        name.as_deref()
            .and_then(|name| certs.get(name))
            .or_else(|| certs.get(DEFAULT_CERT))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.certs.read().map(|certs| certs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let key = self.lookup(client_hello.server_name());
        if key.is_none() {
            error!(tnx = "sni", "No certificate available for {:?}", client_hello.server_name());
        }
        key
    }
}

/// TLS configuration shared by the listener and every connection
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
    store: Arc<CertStore>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig").field("store", &self.store).finish()
    }
}

impl TlsConfig {
    pub fn new(store: Arc<CertStore>) -> Self {
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(store.clone());

        Self {
            server_config: Arc::new(config),
            store,
        }
    }

    /// Build the store from `[tls]`: the default certificate comes from
    /// `cert_path`/`key_path` or is generated for `server_name`, and every
    /// `[tls.sni.<host>]` entry is loaded from disk.
    pub fn from_settings(settings: &TlsSettings, server_name: &str) -> Result<Self> {
        let default = match (&settings.cert_path, &settings.key_path) {
            (Some(cert_path), Some(key_path)) => Arc::new(load_certified_key(cert_path, key_path)?),
            _ => {
                warn!(
                    tnx = "tls",
                    "No TLS certificate configured, using an ephemeral self-signed one for {}",
                    server_name
                );
                Arc::new(ephemeral_certified_key(server_name)?)
            }
        };

        let store = CertStore::new(default);
        for (hostname, paths) in &settings.sni {
            let key = load_certified_key(&paths.cert_path, &paths.key_path)?;
            store.insert(hostname, Arc::new(key));
        }

        Ok(Self::new(Arc::new(store)))
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    pub fn store(&self) -> Arc<CertStore> {
        self.store.clone()
    }

    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

/// Lower-case Unicode form of a hostname; punycode errors keep the input
pub fn normalize_hostname(hostname: &str) -> String {
    let trimmed = hostname.trim();
    let (unicode, result) = idna::domain_to_unicode(trimmed);
    match result {
        Ok(()) => unicode.to_lowercase(),
        Err(e) => {
            error!(tnx = "punycode", "Failed to process punycode domain \"{}\": {:?}", trimmed, e);
            trimmed.to_lowercase()
        }
    }
}

/// Negotiated parameters of an established server connection
pub fn tls_info(connection: &ServerConnection) -> TlsInfo {
    TlsInfo {
        protocol: connection.protocol_version().map(|v| format!("{:?}", v)),
        cipher: connection
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite())),
        servername: connection.server_name().map(str::to_string),
    }
}

/// Load a PEM certificate chain and private key from disk
pub fn load_certified_key<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<CertifiedKey> {
    info!("Loading TLS certificate from {:?}", cert_path.as_ref());

    let cert_pem = std::fs::read(cert_path.as_ref())
        .map_err(|e| PostError::Tls(format!("Failed to open certificate file: {}", e)))?;
    let key_pem = std::fs::read(key_path.as_ref())
        .map_err(|e| PostError::Tls(format!("Failed to open key file: {}", e)))?;

    certified_key_from_pem(&cert_pem, &key_pem)
}

/// Build a [`CertifiedKey`] from PEM data (PKCS#8 or PKCS#1 key)
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey> {
    let chain = certs(&mut BufReader::new(cert_pem))
        .map_err(|e| PostError::Tls(format!("Failed to read certificates: {}", e)))?;

    if chain.is_empty() {
        return Err(PostError::Tls("No certificates found in file".to_string()));
    }
    debug!("Loaded {} certificate(s)", chain.len());

    let mut keys = pkcs8_private_keys(&mut BufReader::new(key_pem))
        .map_err(|e| PostError::Tls(format!("Failed to read private keys: {}", e)))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut BufReader::new(key_pem))
            .map_err(|e| PostError::Tls(format!("Failed to read private keys: {}", e)))?;
    }
    if keys.is_empty() {
        return Err(PostError::Tls("No private key found in file".to_string()));
    }

    let signing_key = rustls::sign::any_supported_type(&PrivateKey(keys.remove(0)))
        .map_err(|e| PostError::Tls(format!("Unsupported private key: {}", e)))?;

    Ok(CertifiedKey::new(
        chain.into_iter().map(Certificate).collect(),
        signing_key,
    ))
}

fn self_signed(domain: &str) -> Result<rcgen::Certificate> {
    use rcgen::{CertificateParams, DistinguishedName, DnType};

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, domain);
    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(domain.to_string()),
        rcgen::SanType::DnsName(format!("*.{}", domain)),
    ];

    rcgen::Certificate::from_params(params)
        .map_err(|e| PostError::Tls(format!("Failed to generate certificate: {}", e)))
}

/// In-memory self-signed certificate for `domain`
pub fn ephemeral_certified_key(domain: &str) -> Result<CertifiedKey> {
    let cert = self_signed(domain)?;
    let der = cert
        .serialize_der()
        .map_err(|e| PostError::Tls(format!("Failed to serialize certificate: {}", e)))?;
    let key = rustls::sign::any_supported_type(&PrivateKey(cert.serialize_private_key_der()))
        .map_err(|e| PostError::Tls(format!("Unsupported private key: {}", e)))?;

    Ok(CertifiedKey::new(vec![Certificate(der)], key))
}
