//! Collector endpoint URLs.

use pw_core::WatchError;
use pw_core::WatchResult;
use std::net::SocketAddr;
use url::Url;

/// Parsed `http`/`https` log collector address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl(Url);

impl EndpointUrl {
    pub fn parse(input: &str) -> WatchResult<Self> {
        let mut url = Url::parse(input.trim()).map_err(|error| {
            WatchError::new(
                "net.url.invalid",
                format!("failed to parse endpoint `{input}`: {error}"),
            )
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(WatchError::new(
                "net.url.scheme_unsupported",
                format!("unsupported endpoint scheme `{}`", url.scheme()),
            ));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(WatchError::new("net.url.host_missing", "endpoint must include a host"));
        }

        url.set_fragment(None);
        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Host without IPv6 brackets, as TLS server names expect.
    pub fn host(&self) -> &str {
        self.0
            .host_str()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
            .unwrap_or_default()
    }

    pub fn is_secure(&self) -> bool {
        self.0.scheme() == "https"
    }

    /// `Host` header value; the port appears only when it is not the scheme default.
    pub fn authority(&self) -> String {
        let host = self.0.host_str().unwrap_or_default();
        match self.0.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }

    pub fn path_and_query(&self) -> String {
        match self.0.query() {
            Some(query) => format!("{}?{query}", self.0.path()),
            None => self.0.path().to_owned(),
        }
    }

    pub fn socket_addrs(&self) -> WatchResult<Vec<SocketAddr>> {
        let addresses = self.0.socket_addrs(|| None).map_err(|error| {
            WatchError::new(
                "net.dns.resolve_failed",
                format!("failed to resolve `{}`: {error}", self.authority()),
            )
        })?;

        if addresses.is_empty() {
            return Err(WatchError::new(
                "net.dns.no_results",
                format!("resolver returned no addresses for `{}`", self.authority()),
            ));
        }
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::EndpointUrl;

    #[test]
    fn parses_collector_endpoint() {
        let endpoint = EndpointUrl::parse(" https://Logs.Example/ingest?team=red#ignored ")
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(endpoint.host(), "logs.example");
        assert_eq!(endpoint.authority(), "logs.example");
        assert_eq!(endpoint.path_and_query(), "/ingest?team=red");
        assert_eq!(endpoint.as_str(), "https://logs.example/ingest?team=red");
        assert!(endpoint.is_secure());
    }

    #[test]
    fn keeps_non_default_port_in_authority() {
        let endpoint =
            EndpointUrl::parse("http://127.0.0.1:8099").unwrap_or_else(|_| unreachable!());
        assert_eq!(endpoint.authority(), "127.0.0.1:8099");
        assert_eq!(endpoint.path_and_query(), "/");
        assert!(!endpoint.is_secure());

        let addresses = endpoint.socket_addrs().unwrap_or_else(|_| unreachable!());
        assert_eq!(addresses[0].port(), 8099);
    }

    #[test]
    fn ipv6_hosts_drop_brackets_only_for_the_server_name() {
        let endpoint = EndpointUrl::parse("https://[::1]:9443/hook").unwrap_or_else(|_| unreachable!());
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.authority(), "[::1]:9443");
    }

    #[test]
    fn rejects_unsupported_endpoints() {
        assert!(EndpointUrl::parse("ftp://logs.example/").is_err());
        assert!(EndpointUrl::parse("file:///tmp/log").is_err());
        assert!(EndpointUrl::parse("not a url").is_err());
    }
}
