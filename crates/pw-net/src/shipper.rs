//! Fire-and-forget shipping of listener records to an external collector.

use crate::client::DEFAULT_CONNECT_TIMEOUT;
use crate::client::HttpPoster;
use crate::http::PostRequest;
use crate::endpoint::EndpointUrl;
use pw_core::ListenerRecord;
use pw_core::WatchError;
use pw_core::WatchResult;
use std::sync::mpsc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

const DEFAULT_QUEUE_CAPACITY: usize = 256;
const SHIPPER_THREAD_NAME: &str = "portwatch-log-shipper";

/// Receives every novel, unblocked listener record.
pub trait ListenerLogger {
    fn ship(&self, record: &ListenerRecord);
}

/// Logger used when no collector is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledLogger;

impl ListenerLogger for DisabledLogger {
    fn ship(&self, _record: &ListenerRecord) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogShipperConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for LogShipperConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl LogShipperConfig {
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> WatchResult<()> {
        if self.queue_capacity == 0 {
            return Err(WatchError::new(
                "net.shipper.queue_capacity_invalid",
                "log shipper queue capacity must be greater than zero",
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(WatchError::new(
                "net.shipper.connect_timeout_invalid",
                "log shipper connect timeout must be greater than zero",
            ));
        }

        EndpointUrl::parse(&self.endpoint).map(|_| ())
    }
}

/// Posts records from a background worker; the caller never waits on I/O.
pub struct LogShipper {
    sender: Option<mpsc::SyncSender<ListenerRecord>>,
    worker: Option<JoinHandle<()>>,
    endpoint: EndpointUrl,
}

impl LogShipper {
    pub fn spawn(config: LogShipperConfig) -> WatchResult<Self> {
        config.validate()?;
        let endpoint = EndpointUrl::parse(&config.endpoint)?;
        let poster = HttpPoster::new(config.connect_timeout);

        let (sender, receiver) = mpsc::sync_channel::<ListenerRecord>(config.queue_capacity);
        let worker_endpoint = endpoint.clone();
        let worker = thread::Builder::new()
            .name(SHIPPER_THREAD_NAME.to_owned())
            .spawn(move || {
                while let Ok(record) = receiver.recv() {
                    if let Err(error) = post_record(&poster, &worker_endpoint, &record) {
                        log::warn!(
                            "failed to ship listener record to {}: {error}",
                            worker_endpoint.as_str()
                        );
                    }
                }
            })
            .map_err(|error| {
                WatchError::new(
                    "net.shipper.spawn_failed",
                    format!("failed to spawn log shipper worker: {error}"),
                )
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &EndpointUrl {
        &self.endpoint
    }

    /// Stops accepting records and waits for queued ones to be posted.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("log shipper worker panicked");
            }
        }
    }
}

impl ListenerLogger for LogShipper {
    fn ship(&self, record: &ListenerRecord) {
        let Some(sender) = &self.sender else {
            return;
        };

        match sender.try_send(record.clone()) {
            Ok(()) => {}
            Err(mpsc::TrySendError::Full(_)) => {
                log::warn!("log shipper queue full; dropping listener record");
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {
                log::warn!("log shipper worker stopped; dropping listener record");
            }
        }
    }
}

impl Drop for LogShipper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn post_record(
    poster: &HttpPoster,
    endpoint: &EndpointUrl,
    record: &ListenerRecord,
) -> WatchResult<()> {
    let body = serde_json::to_vec(record).map_err(|error| {
        WatchError::new(
            "net.shipper.encode_failed",
            format!("failed to encode listener record: {error}"),
        )
    })?;
    let status = poster.post(&PostRequest::json(endpoint.clone(), body))?;
    if !status.is_success() {
        log::debug!(
            "collector {} answered with status {}",
            endpoint.as_str(),
            status.as_u16()
        );
    }
    Ok(())
}
