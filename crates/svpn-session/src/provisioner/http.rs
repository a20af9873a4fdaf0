//! HTTP Issuance Client
//!
//! Talks JSON to the issuance service over hyper, with rustls for HTTPS.
//!
//! | Request | Response |
//! |---------|----------|
//! | `GET <url>` | `{"private_key": "...", "public_key": "..."}` |
//! | `POST <url>` `{"server_country", "private_key"}` | `{"config": "<profile>", "server": "..."}` |
//!
//! Errors come back as non-2xx with `{"error": "..."}`.

use super::{KeyProvisioner, ProvisioningError};
use crate::endpoint::Endpoint;
use crate::keys::KeyMaterial;
use crate::profile::TunnelProfile;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// HTTP issuance client configuration
#[derive(Debug, Clone)]
pub struct HttpProvisionerConfig {
    /// Issuance endpoint (http or https)
    pub url: String,
    /// Whole-request deadline
    pub timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Largest response body accepted
    pub max_body_size: usize,
}

impl HttpProvisionerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(15),
            user_agent: format!("svpn/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 64 * 1024,
        }
    }
}

#[derive(Serialize)]
struct ProfileRequest<'a> {
    server_country: &'a str,
    private_key: &'a str,
}

#[derive(Deserialize)]
struct ProfileResponse {
    config: String,
    #[serde(default)]
    server: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

struct Response {
    status: StatusCode,
    body: Bytes,
}

/// Issuance service client
pub struct HttpKeyProvisioner {
    config: HttpProvisionerConfig,
    uri: Uri,
    host: String,
    port: u16,
    https: bool,
    tls: Arc<ClientConfig>,
}

impl HttpKeyProvisioner {
    pub fn new(config: HttpProvisionerConfig) -> Result<Self, ProvisioningError> {
        let invalid = |msg: &str| ProvisioningError::InvalidUrl(format!("{}: {}", config.url, msg));

        let url = Url::parse(&config.url).map_err(|e| invalid(&e.to_string()))?;
        let https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(invalid(&format!("unsupported scheme {}", other))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| invalid("no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("no port"))?;
        let uri: Uri = url.as_str().parse().map_err(|e: hyper::http::uri::InvalidUri| {
            invalid(&e.to_string())
        })?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        debug!("Issuance client for {} (timeout {:?})", config.url, config.timeout);

        Ok(Self {
            config,
            uri,
            host,
            port,
            https,
            tls: Arc::new(tls),
        })
    }

    /// Send one request under the configured deadline
    async fn request(&self, method: Method, body: Option<Vec<u8>>) -> Result<Response, ProvisioningError> {
        tokio::time::timeout(self.config.timeout, self.send(method, body))
            .await
            .map_err(|_| ProvisioningError::Timeout)?
    }

    async fn send(&self, method: Method, body: Option<Vec<u8>>) -> Result<Response, ProvisioningError> {
        let host_header = self
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| self.host.clone());

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(self.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/"))
            .header(HOST, host_header)
            .header(USER_AGENT, &self.config.user_agent)
            .header(ACCEPT, "application/json");
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ProvisioningError::Connection(e.to_string()))?;

        let stream = tokio::net::TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| ProvisioningError::Connection(e.to_string()))?;

        let response_result = if self.https {
            let connector = TlsConnector::from(self.tls.clone());
            let server_name = rustls::pki_types::ServerName::try_from(self.host.clone())
                .map_err(|_| ProvisioningError::Tls("Invalid server name".to_string()))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ProvisioningError::Tls(e.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ProvisioningError::Connection(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    warn!("Issuance connection error: {}", e);
                }
            });
            sender.send_request(request).await
        } else {
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ProvisioningError::Connection(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    warn!("Issuance connection error: {}", e);
                }
            });
            sender.send_request(request).await
        };

        let response = response_result
            .map_err(|e| ProvisioningError::Connection(e.to_string()))?;

        let status = response.status();
        // Stop reading as soon as the body outgrows the limit
        let body = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    ProvisioningError::MalformedBody(format!(
                        "body exceeds {} bytes",
                        self.config.max_body_size
                    ))
                } else {
                    ProvisioningError::MalformedBody(e.to_string())
                }
            })?
            .to_bytes();

        debug!("Issuance {} {} -> {} ({} bytes)", method, self.uri, status, body.len());
        Ok(Response { status, body })
    }

    /// Decode a 2xx JSON body, or turn anything else into an error
    fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ProvisioningError> {
        if !response.status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&response.body)
                .map(|b| b.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&response.body).trim().to_string());
            return Err(ProvisioningError::Status {
                code: response.status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&response.body)
            .map_err(|e| ProvisioningError::MalformedBody(e.to_string()))
    }
}

#[async_trait]
impl KeyProvisioner for HttpKeyProvisioner {
    async fn request_keys(&self) -> Result<KeyMaterial, ProvisioningError> {
        let response = self.request(Method::GET, None).await?;
        let keys: KeyMaterial = Self::decode(response)?;

        if !keys.is_complete() {
            return Err(ProvisioningError::MalformedBody("empty key in response".into()));
        }
        Ok(keys)
    }

    async fn request_profile(
        &self,
        keys: &KeyMaterial,
        endpoint: &Endpoint,
    ) -> Result<TunnelProfile, ProvisioningError> {
        let body = serde_json::to_vec(&ProfileRequest {
            server_country: &endpoint.country_label,
            private_key: keys.private_key(),
        })
        .map_err(|e| ProvisioningError::MalformedBody(e.to_string()))?;

        let response = self.request(Method::POST, Some(body)).await?;
        let issued: ProfileResponse = Self::decode(response)?;

        let profile = TunnelProfile::parse(&endpoint.country_label, &issued.config)?;
        if !profile.endpoint().same_server(endpoint) {
            warn!(
                "Issued profile for {} points at {} instead of {}",
                issued.server.as_deref().unwrap_or(&endpoint.country_label),
                profile.endpoint().network_address,
                endpoint.network_address
            );
        }
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(HttpKeyProvisioner::new(HttpProvisionerConfig::new("https://issuance.example/vpn-config")).is_ok());
        assert!(HttpKeyProvisioner::new(HttpProvisionerConfig::new("http://127.0.0.1:8080/")).is_ok());

        for bad in ["ftp://issuance.example/", "not a url", "https://"] {
            let err = HttpKeyProvisioner::new(HttpProvisionerConfig::new(bad)).err();
            assert!(matches!(err, Some(ProvisioningError::InvalidUrl(_))), "{}", bad);
        }
    }

    #[test]
    fn test_decode_error_body() {
        let response = Response {
            status: StatusCode::BAD_REQUEST,
            body: Bytes::from_static(br#"{"error": "private_key required"}"#),
        };
        let err = HttpKeyProvisioner::decode::<KeyMaterial>(response).unwrap_err();

        assert_eq!(
            err,
            ProvisioningError::Status {
                code: 400,
                message: "private_key required".into()
            }
        );
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/vpn-config", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();

            let body = "x".repeat(4096);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });

        let mut config = HttpProvisionerConfig::new(url);
        config.max_body_size = 256;
        let err = HttpKeyProvisioner::new(config)
            .unwrap()
            .request_keys()
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ProvisioningError::MalformedBody("body exceeds 256 bytes".into())
        );
        server.await.unwrap();
    }

    #[test]
    fn test_decode_malformed() {
        let response = Response {
            status: StatusCode::OK,
            body: Bytes::from_static(b"<html>"),
        };
        let err = HttpKeyProvisioner::decode::<KeyMaterial>(response).unwrap_err();
        assert!(matches!(err, ProvisioningError::MalformedBody(_)));
    }
}
