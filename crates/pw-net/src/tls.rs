//! rustls handshake for HTTPS collectors.

use pw_core::WatchError;
use pw_core::WatchResult;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;

#[cfg(feature = "tls-rustls")]
use rustls::ClientConfig;
#[cfg(feature = "tls-rustls")]
use rustls::ClientConnection;
#[cfg(feature = "tls-rustls")]
use rustls::RootCertStore;
#[cfg(feature = "tls-rustls")]
use rustls::StreamOwned;
#[cfg(feature = "tls-rustls")]
use rustls::pki_types::ServerName;
#[cfg(feature = "tls-rustls")]
use std::sync::Arc;

/// Trait-object-safe byte stream.
pub(crate) trait IoStream: Read + Write {}
impl<T> IoStream for T where T: Read + Write {}

pub(crate) type BoxedIoStream = Box<dyn IoStream + Send>;

/// Verifies against the bundled WebPKI roots plus the OS store.
#[cfg(feature = "tls-rustls")]
pub(crate) fn connect_tls(mut stream: TcpStream, server_name: &str) -> WatchResult<BoxedIoStream> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|error| {
            WatchError::new(
                "net.tls.config_versions_invalid",
                format!("failed to configure TLS protocol versions: {error}"),
            )
        })?
        .with_root_certificates(root_store()?)
        .with_no_client_auth();

    let name = ServerName::try_from(server_name.to_owned()).map_err(|error| {
        WatchError::new(
            "net.tls.server_name_invalid",
            format!("invalid TLS server name `{server_name}`: {error}"),
        )
    })?;

    let mut connection = ClientConnection::new(Arc::new(config), name).map_err(|error| {
        WatchError::new(
            "net.tls.connection_init_failed",
            format!("failed to initialize TLS connection for `{server_name}`: {error}"),
        )
    })?;

    connection.complete_io(&mut stream).map_err(|error| {
        WatchError::new(
            "net.tls.handshake_failed",
            format!("TLS handshake failed for `{server_name}`: {error}"),
        )
    })?;

    Ok(Box::new(StreamOwned::new(connection, stream)))
}

#[cfg(feature = "tls-rustls")]
fn root_store() -> WatchResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        log::debug!("skipping unreadable OS trust anchor: {error}");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    log::debug!("loaded {added} OS trust anchors, ignored {ignored}");

    if roots.is_empty() {
        return Err(WatchError::new(
            "net.tls.root_store_empty",
            "no trust anchors available for TLS verification",
        ));
    }

    Ok(roots)
}

#[cfg(not(feature = "tls-rustls"))]
pub(crate) fn connect_tls(_stream: TcpStream, _server_name: &str) -> WatchResult<BoxedIoStream> {
    Err(WatchError::new(
        "net.tls.backend_unavailable",
        "rustls backend is disabled for this build; enable `pw-net/tls-rustls`",
    ))
}
