//! TLS client configuration.
//!
//! [`TlsOptions`] carries the TLS parameters a caller may set on the client
//! or per request. [`client_config`] turns them into a rustls
//! [`ClientConfig`](rustls::ClientConfig) using the ring provider.
//!
//! Every field is an `Option` so that merging keeps an explicit value from
//! the higher-precedence side even when it is `false` or empty.

use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};

/// Errors while building a TLS configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// PEM material could not be read.
    #[error("invalid {what}: {source}")]
    Pem {
        /// Which option was being parsed.
        what: &'static str,
        /// Underlying parse error.
        #[source]
        source: io::Error,
    },
    /// A PEM blob contained no usable item.
    #[error("no {0} found in PEM input")]
    Empty(&'static str),
    /// A CA certificate was rejected by the root store.
    #[error("invalid CA certificate: {0}")]
    Certificate(rustls::Error),
    /// Client certificate and key do not form a usable pair.
    #[error("invalid client certificate: {0}")]
    ClientAuth(rustls::Error),
    /// The requested protocol version is unknown.
    #[error("unsupported secure protocol: {0}")]
    Protocol(String),
    /// No cipher suite in the list is supported.
    #[error("no supported cipher suites in: {0}")]
    Ciphers(String),
    /// The option combination cannot be expressed with rustls.
    #[error("unsupported TLS option: {0}")]
    Unsupported(&'static str),
    /// rustls rejected the assembled configuration.
    #[error("TLS configuration rejected: {0}")]
    Config(rustls::Error),
}

/// TLS parameters passed through to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// PEM-encoded CA certificates. Replaces the bundled web PKI roots.
    #[serde(with = "pem_text")]
    pub ca: Option<Vec<u8>>,
    /// PEM-encoded client private key.
    #[serde(with = "pem_text")]
    pub client_key: Option<Vec<u8>>,
    /// PEM-encoded client certificate chain.
    #[serde(with = "pem_text")]
    pub client_cert: Option<Vec<u8>>,
    /// PKCS#12 client bundle (not supported by rustls; rejected at build).
    #[serde(skip)]
    pub client_pfx: Option<Vec<u8>>,
    /// Passphrase for an encrypted client key or bundle.
    pub client_passphrase: Option<String>,
    /// Verify the server certificate chain (default `true`).
    pub reject_unauthorized: Option<bool>,
    /// Protocol selector, e.g. `TLSv1_2_method`, `TLSv1_3_method`, `TLS_method`.
    pub secure_protocol: Option<String>,
    /// Cipher suite allow-list separated by `:` or `,` (rustls suite names).
    pub ciphers: Option<String>,
}

impl TlsOptions {
    /// Field-wise merge: values set in `overrides` win, unset ones fall back
    /// to `self`.
    #[must_use]
    pub fn merged(&self, overrides: &Self) -> Self {
        fn pick<T: Clone>(over: &Option<T>, base: &Option<T>) -> Option<T> {
            over.clone().or_else(|| base.clone())
        }
        Self {
            ca: pick(&overrides.ca, &self.ca),
            client_key: pick(&overrides.client_key, &self.client_key),
            client_cert: pick(&overrides.client_cert, &self.client_cert),
            client_pfx: pick(&overrides.client_pfx, &self.client_pfx),
            client_passphrase: pick(&overrides.client_passphrase, &self.client_passphrase),
            reject_unauthorized: pick(&overrides.reject_unauthorized, &self.reject_unauthorized),
            secure_protocol: pick(&overrides.secure_protocol, &self.secure_protocol),
            ciphers: pick(&overrides.ciphers, &self.ciphers),
        }
    }

    /// True when no option is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Effective certificate verification setting.
    #[must_use]
    pub fn verifies_peer(&self) -> bool {
        self.reject_unauthorized.unwrap_or(true)
    }
}

/// Build a rustls client configuration from `options`.
pub fn client_config(options: &TlsOptions) -> Result<rustls::ClientConfig, TlsError> {
    if options.client_pfx.is_some() {
        return Err(TlsError::Unsupported(
            "PKCS#12 client bundles; supply client_cert and client_key as PEM",
        ));
    }
    if options.client_passphrase.is_some() {
        return Err(TlsError::Unsupported("encrypted client keys"));
    }

    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(ciphers) = &options.ciphers {
        provider.cipher_suites = select_cipher_suites(&provider, ciphers)?;
    }
    let verify_algorithms = provider.signature_verification_algorithms;
    let provider = Arc::new(provider);

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(protocol_versions(options.secure_protocol.as_deref())?)
        .map_err(TlsError::Config)?;

    let builder = if options.verifies_peer() {
        builder.with_root_certificates(root_store(options.ca.as_deref())?)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                algorithms: verify_algorithms,
            }))
    };

    match (&options.client_cert, &options.client_key) {
        (Some(cert), Some(key)) => {
            let chain = read_certs(cert, "client certificate")?;
            let key = read_key(key)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(TlsError::ClientAuth)
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(TlsError::Unsupported(
            "client_cert and client_key must be set together",
        )),
    }
}

fn protocol_versions(
    selector: Option<&str>,
) -> Result<&'static [&'static SupportedProtocolVersion], TlsError> {
    static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
    static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

    match selector {
        None | Some("TLS_method" | "SSLv23_method" | "TLS_client_method") => {
            Ok(rustls::DEFAULT_VERSIONS)
        }
        Some("TLSv1_2_method" | "TLSv1_2_client_method" | "TLSv1.2") => Ok(TLS12_ONLY),
        Some("TLSv1_3_method" | "TLSv1_3_client_method" | "TLSv1.3") => Ok(TLS13_ONLY),
        Some(other) => Err(TlsError::Protocol(other.to_owned())),
    }
}

fn select_cipher_suites(
    provider: &CryptoProvider,
    list: &str,
) -> Result<Vec<rustls::SupportedCipherSuite>, TlsError> {
    let wanted: Vec<&str> = list
        .split([':', ','])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect();
    let selected: Vec<_> = provider
        .cipher_suites
        .iter()
        .copied()
        .filter(|suite| {
            let name = format!("{:?}", suite.suite());
            wanted.iter().any(|want| want.eq_ignore_ascii_case(&name))
        })
        .collect();
    if selected.is_empty() {
        return Err(TlsError::Ciphers(list.to_owned()));
    }
    Ok(selected)
}

fn root_store(ca: Option<&[u8]>) -> Result<RootCertStore, TlsError> {
    let Some(ca) = ca else {
        return Ok(RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        ));
    };
    let mut store = RootCertStore::empty();
    for cert in read_certs(ca, "CA certificate")? {
        store.add(cert).map_err(TlsError::Certificate)?;
    }
    Ok(store)
}

fn read_certs(pem: &[u8], what: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem { what, source })?;
    if certs.is_empty() {
        return Err(TlsError::Empty(what));
    }
    Ok(certs)
}

fn read_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|source| TlsError::Pem {
            what: "client key",
            source,
        })?
        .ok_or(TlsError::Empty("client key"))
}

/// Verifier used when `reject_unauthorized` is explicitly `false`.
///
/// Signatures are still checked so the handshake transcript stays bound to
/// the presented key; only chain and name validation are skipped.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Serde adapter storing PEM bytes as text.
mod pem_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&String::from_utf8_lossy(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Ok(Option::<String>::deserialize(deserializer)?.map(String::into_bytes))
    }
}
