//! Outbound HTTP(S) used to ship discovered listeners to a collector.

mod client;
mod endpoint;
mod http;
mod shipper;
mod tls;

pub use client::DEFAULT_CONNECT_TIMEOUT;
pub use client::HttpPoster;
pub use endpoint::EndpointUrl;
pub use http::HttpStatusCode;
pub use http::JSON_CONTENT_TYPE;
pub use http::PostRequest;
pub use http::parse_status_line;
pub use shipper::DisabledLogger;
pub use shipper::ListenerLogger;
pub use shipper::LogShipper;
pub use shipper::LogShipperConfig;
