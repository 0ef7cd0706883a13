//! Vsock transport for the AWS SDK
//!
//! An HTTP connector that reaches KMS from inside the enclave. The parent runs
//! vsock-proxy, which forwards raw bytes to the KMS endpoint; TLS is
//! terminated here, so the parent never sees request contents.
//!
//! Architecture:
//! ```text
//! ┌─────────────────┐  vsock + TLS  ┌─────────────────┐  TCP  ┌─────────────────┐
//! │  Enclave        │──────────────▶│  Parent EC2     │──────▶│  AWS KMS        │
//! │  (this code)    │               │  (vsock-proxy)  │       │  :443           │
//! └─────────────────┘               └─────────────────┘       └─────────────────┘
//! ```

use crate::error::{EnclaveError, Result};
use aws_smithy_runtime_api::client::connector_metadata::ConnectorMetadata;
use aws_smithy_runtime_api::client::http::{
    HttpClient, HttpConnector, HttpConnectorFuture, HttpConnectorSettings, SharedHttpConnector,
};
use aws_smithy_runtime_api::client::orchestrator::{HttpRequest, HttpResponse};
use aws_smithy_runtime_api::client::result::ConnectorError;
use aws_smithy_runtime_api::client::runtime_components::RuntimeComponents;
use std::sync::Arc;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

/// A vsock HTTPS connector for the AWS SDK
///
/// Every request opens a new vsock stream to `(cid, port)` and a TLS session
/// to the host named in the request URI.
#[derive(Debug, Clone)]
pub struct VsockHttpConnector {
    cid: u32,
    port: u32,
    tls: Arc<ClientConfig>,
}

impl VsockHttpConnector {
    pub fn new(cid: u32, port: u32) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| EnclaveError::Config(format!("TLS configuration: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            cid,
            port,
            tls: Arc::new(tls),
        })
    }
}

impl HttpConnector for VsockHttpConnector {
    fn call(&self, request: HttpRequest) -> HttpConnectorFuture {
        let connector = self.clone();
        HttpConnectorFuture::new(async move { vsock_send_request(request, &connector).await })
    }
}

impl HttpClient for VsockHttpConnector {
    fn http_connector(
        &self,
        _settings: &HttpConnectorSettings,
        _components: &RuntimeComponents,
    ) -> SharedHttpConnector {
        SharedHttpConnector::new(self.clone())
    }

    fn connector_metadata(&self) -> Option<ConnectorMetadata> {
        Some(ConnectorMetadata::new("vsock-tls-connector", None))
    }
}

/// Splits an absolute URI into its host and origin-form target
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn origin_form(uri: &str) -> std::result::Result<(String, String), ConnectorError> {
    let uri = uri
        .parse::<hyper::Uri>()
        .map_err(|e| ConnectorError::user(e.into()))?;
    let host = uri
        .host()
        .ok_or_else(|| ConnectorError::user(format!("request URI {} has no host", uri).into()))?
        .to_string();
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    Ok((host, target))
}

/// Sends an HTTPS request over vsock
#[cfg(target_os = "linux")]
async fn vsock_send_request(
    request: HttpRequest,
    connector: &VsockHttpConnector,
) -> std::result::Result<HttpResponse, ConnectorError> {
    use aws_smithy_runtime_api::http::StatusCode as SmithyStatusCode;
    use aws_smithy_types::body::SdkBody;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::client::conn::http1::Builder;
    use hyper_util::rt::TokioIo;
    use std::time::Instant;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::TlsConnector;
    use tokio_vsock::{VsockAddr, VsockStream};

    let start = Instant::now();
    let (host, target) = origin_form(request.uri())?;
    let method = request.method().to_string();

    tracing::debug!(
        method = %method,
        host = %host,
        vsock_cid = connector.cid,
        vsock_port = connector.port,
        "[VSOCK] Connecting to KMS relay"
    );

    let stream = VsockStream::connect(VsockAddr::new(connector.cid, connector.port))
        .await
        .map_err(|e| {
            tracing::error!(
                error = %e,
                vsock_cid = connector.cid,
                vsock_port = connector.port,
                "[VSOCK] Cannot connect to vsock. Ensure vsock-proxy is running on parent: \
                 vsock-proxy {} {} 443",
                connector.port,
                host
            );
            ConnectorError::io(e.into())
        })?;

    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| ConnectorError::user(e.into()))?;
    let tls = TlsConnector::from(connector.tls.clone())
        .connect(server_name, stream)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, host = %host, "[VSOCK] TLS handshake failed");
            ConnectorError::io(e.into())
        })?;

    let (mut sender, conn) = Builder::new()
        .handshake(TokioIo::new(tls))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, host = %host, "[VSOCK] HTTP handshake failed");
            ConnectorError::other(e.into(), None)
        })?;

    let host_for_spawn = host.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::error!(error = %e, host = %host_for_spawn, "[VSOCK] Connection handler error");
        }
    });

    let body_bytes: Vec<u8> = request.body().bytes().map(|b| b.to_vec()).unwrap_or_default();

    let mut builder = hyper::Request::builder().method(method.as_str()).uri(&target);
    let mut has_host = false;
    for (name, value) in request.headers().iter() {
        has_host |= name.eq_ignore_ascii_case("host");
        builder = builder.header(name, value);
    }
    if !has_host {
        builder = builder.header("host", host.as_str());
    }
    let hyper_request = builder
        .body(Full::new(Bytes::from(body_bytes)))
        .map_err(|e| ConnectorError::other(e.into(), None))?;

    let response = sender.send_request(hyper_request).await.map_err(|e| {
        tracing::error!(
            error = %e,
            host = %host,
            elapsed_ms = start.elapsed().as_millis(),
            "[VSOCK] HTTP request failed"
        );
        ConnectorError::other(e.into(), None)
    })?;

    let (parts, body) = response.into_parts();
    let body_bytes = body
        .collect()
        .await
        .map_err(|e| ConnectorError::io(e.into()))?
        .to_bytes();

    let status_code = SmithyStatusCode::try_from(parts.status.as_u16())
        .map_err(|e| ConnectorError::other(e.into(), None))?;

    tracing::info!(
        method = %method,
        host = %host,
        status = status_code.as_u16(),
        body_len = body_bytes.len(),
        elapsed_ms = start.elapsed().as_millis(),
        "[VSOCK] Request complete"
    );

    let mut sdk_response = HttpResponse::new(status_code, SdkBody::from(body_bytes));
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            sdk_response
                .headers_mut()
                .insert(name.as_str().to_string(), value.to_string());
        } else {
            tracing::warn!(header_name = %name, "[VSOCK] Dropping non-UTF8 response header");
        }
    }

    Ok(sdk_response)
}

/// vsock only exists on Linux
#[cfg(not(target_os = "linux"))]
async fn vsock_send_request(
    _request: HttpRequest,
    _connector: &VsockHttpConnector,
) -> std::result::Result<HttpResponse, ConnectorError> {
    Err(ConnectorError::other(
        "vsock transport is only available on Linux inside a Nitro enclave".into(),
        None,
    ))
}
