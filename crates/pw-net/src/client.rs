//! One-shot HTTP/1.1 poster over plain TCP or rustls.

use crate::http::HttpStatusCode;
use crate::http::PostRequest;
use crate::http::parse_status_line;
use crate::tls::BoxedIoStream;
use crate::tls::connect_tls;
use pw_core::WatchError;
use pw_core::WatchResult;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::time::Duration;

const MAX_STATUS_LINE_BYTES: usize = 8 * 1024;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends a request per connection and reads back only the status line.
#[derive(Debug, Clone, Copy)]
pub struct HttpPoster {
    timeout: Duration,
}

impl Default for HttpPoster {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl HttpPoster {
    /// `timeout` bounds the connect and each socket read or write.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn post(&self, request: &PostRequest) -> WatchResult<HttpStatusCode> {
        let url = &request.url;
        let socket = self.connect(&url.socket_addrs()?)?;
        let mut stream: BoxedIoStream = if url.is_secure() {
            connect_tls(socket, url.host())?
        } else {
            Box::new(socket)
        };

        stream.write_all(&request.encode()).map_err(|error| {
            WatchError::new(
                "net.http.write_failed",
                format!("failed to write HTTP request bytes: {error}"),
            )
        })?;
        stream.flush().map_err(|error| {
            WatchError::new(
                "net.http.flush_failed",
                format!("failed to flush HTTP request bytes: {error}"),
            )
        })?;

        let line = read_status_line(&mut *stream)?;
        parse_status_line(&line)
    }

    /// Tries each resolved address in order.
    fn connect(&self, addresses: &[SocketAddr]) -> WatchResult<TcpStream> {
        let mut last_error = None;
        for address in addresses {
            match self.connect_address(*address) {
                Ok(stream) => return Ok(stream),
                Err(error) => last_error = Some(error),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            WatchError::new(
                "net.transport.no_addresses",
                "no addresses available to open a connection",
            )
        }))
    }

    fn connect_address(&self, address: SocketAddr) -> WatchResult<TcpStream> {
        let stream = TcpStream::connect_timeout(&address, self.timeout).map_err(|error| {
            WatchError::new(
                "net.transport.connect_failed",
                format!("failed to connect to `{address}`: {error}"),
            )
        })?;

        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|error| {
                WatchError::new(
                    "net.transport.timeout_config_failed",
                    format!("failed to set socket timeouts for `{address}`: {error}"),
                )
            })?;

        Ok(stream)
    }
}

fn read_status_line<R: Read + ?Sized>(stream: &mut R) -> WatchResult<String> {
    let mut line = Vec::new();
    let mut byte = [0_u8; 1];

    loop {
        let read = stream.read(&mut byte).map_err(|error| {
            WatchError::new(
                "net.http.read_status_failed",
                format!("failed while reading HTTP status line: {error}"),
            )
        })?;
        if read == 0 {
            return Err(WatchError::new(
                "net.http.unexpected_eof",
                "connection closed before the status line completed",
            ));
        }

        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            break;
        }
        if line.len() > MAX_STATUS_LINE_BYTES {
            return Err(WatchError::new(
                "net.http.status_line_too_large",
                format!("status line exceeds {MAX_STATUS_LINE_BYTES} bytes"),
            ));
        }
    }

    String::from_utf8(line).map_err(|error| {
        WatchError::new(
            "net.http.status_line_invalid_utf8",
            format!("status line is not valid UTF-8: {error}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::HttpPoster;
    use super::read_status_line;
    use crate::http::PostRequest;
    use crate::endpoint::EndpointUrl;
    use std::io::Cursor;
    use std::io::Read;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn status_line_reader_stops_at_crlf() {
        let mut input = Cursor::new(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec());
        assert_eq!(read_status_line(&mut input), Ok("HTTP/1.1 200 OK".to_owned()));

        let mut truncated = Cursor::new(b"HTTP/1.1 2".to_vec());
        assert!(read_status_line(&mut truncated).is_err());
    }

    #[test]
    fn posts_body_to_plain_http_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|_| unreachable!());
        let port = listener.local_addr().unwrap_or_else(|_| unreachable!()).port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap_or_else(|_| unreachable!());
            let mut received = Vec::new();
            let mut chunk = [0_u8; 1024];
            while !received.ends_with(b"{\"ok\":true}") {
                let read = socket.read(&mut chunk).unwrap_or_else(|_| unreachable!());
                if read == 0 {
                    break;
                }
                received.extend_from_slice(&chunk[..read]);
            }
            let _ = socket.write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n\r\n");
            received
        });

        let url = EndpointUrl::parse(&format!("http://127.0.0.1:{port}/collect"))
            .unwrap_or_else(|_| unreachable!());
        let request = PostRequest::json(url, b"{\"ok\":true}".to_vec());
        let poster = HttpPoster::default();

        let status = poster.post(&request);
        assert_eq!(status.map(|code| code.as_u16()), Ok(202));

        let received = server.join().unwrap_or_else(|_| unreachable!());
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("POST /collect HTTP/1.1\r\n"));
        assert!(text.contains("Content-Type: application/json; charset=UTF-8\r\n"));
    }

    #[test]
    fn refused_connection_reports_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|_| unreachable!());
        let port = listener.local_addr().unwrap_or_else(|_| unreachable!()).port();
        drop(listener);

        let url = EndpointUrl::parse(&format!("http://127.0.0.1:{port}/collect"))
            .unwrap_or_else(|_| unreachable!());
        let request = PostRequest::json(url, b"{}".to_vec());
        let status = HttpPoster::new(Duration::from_millis(500)).post(&request);
        assert_eq!(
            status.map_err(|error| error.code),
            Err("net.transport.connect_failed")
        );
    }
}
