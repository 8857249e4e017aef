use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::{Request, Response};
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::errors::{ConfigError, DialError};
use crate::resolve::{join_host_port, AddressOverride};

/// A client-side WebSocket over plain TCP or TLS.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default user agent sent on every upgrade request.
pub const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

lazy_static::lazy_static! {
    static ref HEADER_RE: Regex = Regex::new(r"^([\w-]+):\s*(.+)").expect("header regex is valid");
}

/// Configuration for building the WebSocket dialer.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub skip_tls_verify: bool,
    pub headers: HeaderMap,
    pub user_agent: Option<String>,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub address_override: Option<Arc<AddressOverride>>,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            skip_tls_verify: false,
            headers: HeaderMap::new(),
            user_agent: None,
            dial_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(5),
            address_override: None,
        }
    }
}

/// Dials the target URL. Shared by every connection worker of a run.
pub struct Dialer {
    url: String,
    address: String,
    headers: HeaderMap,
    tls: Option<Arc<ClientConfig>>,
    dial_timeout: Duration,
    handshake_timeout: Duration,
    address_override: Option<Arc<AddressOverride>>,
}

impl Dialer {
    /// Validates the target URL and prepares TLS and header state.
    pub fn new(url: &str, config: DialerConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason,
        };

        let request = url.into_client_request().map_err(|e| invalid(e.to_string()))?;
        let uri = request.uri();
        let secure = match uri.scheme_str() {
            Some("ws") => false,
            Some("wss") => true,
            other => {
                return Err(invalid(format!(
                    "unsupported scheme {:?}, expected ws or wss",
                    other.unwrap_or_default()
                )))
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| invalid("missing host".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
        let address = join_host_port(host, port);

        let mut headers = config.headers;
        if let Some(user_agent) = config.user_agent {
            let value = HeaderValue::from_str(&user_agent).map_err(|e| ConfigError::InvalidValue {
                field: "user_agent".to_string(),
                message: e.to_string(),
            })?;
            headers.insert(USER_AGENT, value);
        } else if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        }

        let tls = if secure {
            Some(build_tls_config(config.skip_tls_verify)?)
        } else {
            None
        };

        if let Some(ref ao) = config.address_override {
            debug!(
                host = %ao.host(),
                addresses = ?ao.addresses(),
                "Address override configured"
            );
        }

        Ok(Self {
            url: url.to_string(),
            address,
            headers,
            tls,
            dial_timeout: config.dial_timeout,
            handshake_timeout: config.handshake_timeout,
            address_override: config.address_override,
        })
    }

    /// `host:port` the TCP connection is made to before any override.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn address_override(&self) -> Option<&Arc<AddressOverride>> {
        self.address_override.as_ref()
    }

    fn request(&self) -> Result<Request, DialError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|_| DialError::InvalidTarget(self.url.clone()))?;
        request.headers_mut().extend(self.headers.clone());
        Ok(request)
    }

    async fn connect_tcp(&self) -> Result<TcpStream, DialError> {
        let connect = async {
            match &self.address_override {
                Some(ao) => ao.dial(&self.address).await,
                None => TcpStream::connect(&self.address).await,
            }
        };

        let stream = timeout(self.dial_timeout, connect)
            .await
            .map_err(|_| DialError::Timeout {
                timeout: self.dial_timeout,
                phase: "connect",
            })?
            .map_err(|source| DialError::Connect {
                address: self.address.clone(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(stream)
    }

    /// Opens the TCP connection (through the override when configured) and
    /// performs the TLS and WebSocket handshakes.
    pub async fn dial(&self) -> Result<(WsStream, Response), DialError> {
        let request = self.request()?;
        let stream = self.connect_tcp().await?;
        let connector = self.tls.clone().map(Connector::Rustls);

        timeout(
            self.handshake_timeout,
            client_async_tls_with_config(request, stream, None, connector),
        )
        .await
        .map_err(|_| DialError::Timeout {
            timeout: self.handshake_timeout,
            phase: "handshake",
        })?
        .map_err(DialError::from_handshake)
    }
}

/// Parses a `Name: value` header argument.
pub fn parse_header_line(line: &str) -> Result<(HeaderName, HeaderValue), ConfigError> {
    let captures = HEADER_RE
        .captures(line)
        .ok_or_else(|| ConfigError::InvalidHeader(line.to_string()))?;

    let name = HeaderName::from_str(&captures[1])
        .map_err(|_| ConfigError::InvalidHeader(line.to_string()))?;
    let value = captures[2].trim();
    if value.is_empty() {
        return Err(ConfigError::InvalidHeader(line.to_string()));
    }
    let value =
        HeaderValue::from_str(value).map_err(|_| ConfigError::InvalidHeader(line.to_string()))?;

    Ok((name, value))
}

/// Parses every `-H` argument into a header map. Later values replace earlier ones.
pub fn parse_headers<S: AsRef<str>>(lines: &[S]) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    for line in lines {
        let (name, value) = parse_header_line(line.as_ref())?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn build_tls_config(skip_tls_verify: bool) -> Result<Arc<ClientConfig>, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?;

    let config = if skip_tls_verify {
        warn!("Skipping TLS certificate verification.");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                let (added, ignored) = roots.add_parsable_certificates(certs);
                debug!(added, ignored, "Loaded native root certificates");
            }
            Err(e) => warn!(error = %e, "Failed to load native root certificates"),
        }
        if roots.is_empty() {
            return Err(ConfigError::Tls(
                "no usable root certificates found (use -k to skip verification)".to_string(),
            ));
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_with_space() {
        let (name, value) = parse_header_line("Accept: text/html").unwrap();
        assert_eq!(name, "accept");
        assert_eq!(value, "text/html");
    }

    #[test]
    fn parses_header_without_space() {
        let (name, value) = parse_header_line("X-Api-Key:abc:def").unwrap();
        assert_eq!(name, "x-api-key");
        assert_eq!(value, "abc:def");
    }

    #[test]
    fn rejects_malformed_headers() {
        for line in ["", "NoColon", ": value", "Name:", "Name:   ", "Bad Name: v"] {
            assert!(
                matches!(parse_header_line(line), Err(ConfigError::InvalidHeader(_))),
                "header {:?} should be rejected",
                line
            );
        }
    }

    #[test]
    fn later_headers_replace_earlier() {
        let headers = parse_headers(&["X-Test: one", "X-Test: two", "Origin: http://a"]).unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["x-test"], "two");
    }

    #[test]
    fn dialer_derives_default_ports() {
        let ws = Dialer::new("ws://example.com/socket", DialerConfig::default()).unwrap();
        assert_eq!(ws.address(), "example.com:80");

        let explicit = Dialer::new("ws://127.0.0.1:9001/", DialerConfig::default()).unwrap();
        assert_eq!(explicit.address(), "127.0.0.1:9001");

        let v6 = Dialer::new("ws://[::1]:9001/", DialerConfig::default()).unwrap();
        assert_eq!(v6.address(), "[::1]:9001");
    }

    #[test]
    fn dialer_rejects_non_websocket_urls() {
        for url in ["http://example.com/", "not a url", "ws:///nohost"] {
            assert!(
                matches!(
                    Dialer::new(url, DialerConfig::default()),
                    Err(ConfigError::InvalidUrl { .. })
                ),
                "url {:?} should be rejected",
                url
            );
        }
    }

    #[test]
    fn dialer_sets_user_agent() {
        let default = Dialer::new("ws://example.com/", DialerConfig::default()).unwrap();
        assert_eq!(default.headers()[USER_AGENT], DEFAULT_USER_AGENT);

        let from_header = Dialer::new(
            "ws://example.com/",
            DialerConfig {
                headers: parse_headers(&["User-Agent: custom/1"]).unwrap(),
                ..DialerConfig::default()
            },
        )
        .unwrap();
        assert_eq!(from_header.headers()[USER_AGENT], "custom/1");

        let overridden = Dialer::new(
            "ws://example.com/",
            DialerConfig {
                headers: parse_headers(&["User-Agent: custom/1"]).unwrap(),
                user_agent: Some("flag/2".to_string()),
                ..DialerConfig::default()
            },
        )
        .unwrap();
        assert_eq!(overridden.headers()[USER_AGENT], "flag/2");
    }

    #[test]
    fn insecure_tls_config_builds() {
        let dialer = Dialer::new(
            "wss://example.com/",
            DialerConfig {
                skip_tls_verify: true,
                ..DialerConfig::default()
            },
        )
        .unwrap();
        assert_eq!(dialer.address(), "example.com:443");
        assert!(dialer.tls.is_some());
    }
}
