//! Bridge between the instrumented page context and the aggregation service.
//!
//! Messages are JSON documents carried in length-prefixed frames. The same
//! framing is used for page observations, tab events and observer pushes.

use pw_core::ListenerRecord;
use pw_core::TabId;
use pw_core::WatchError;
use pw_core::WatchResult;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::time::Duration;

const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
const HARD_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
const FRAME_PREFIX_BYTES: usize = 4;

/// Execution contexts that exchange bridge messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    Page,
    Aggregator,
    Observer,
}

impl ContextRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Aggregator => "aggregator",
            Self::Observer => "observer",
        }
    }

    pub fn from_role_name(value: &str) -> Option<Self> {
        match value {
            "page" => Some(Self::Page),
            "aggregator" => Some(Self::Aggregator),
            "observer" => Some(Self::Observer),
            _ => None,
        }
    }
}

/// Observation emitted by the instrumented context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fullstack: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hops: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_url: Option<String>,
    #[serde(rename = "pushState", default, skip_serializing_if = "Option::is_none")]
    pub push_state: Option<bool>,
    #[serde(rename = "changePage", default, skip_serializing_if = "Option::is_none")]
    pub change_page: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl InboundMessage {
    pub fn from_record(record: &ListenerRecord) -> Self {
        Self {
            listener: Some(record.code.clone()),
            stack: Some(record.source_stack_line.clone()),
            fullstack: Some(record.full_stack_lines.clone()),
            hops: Some(record.frame_path.clone()),
            domain: Some(record.domain.clone()),
            window: Some(record.window_label.clone()),
            parent_url: if record.parent_url.is_empty() {
                None
            } else {
                Some(record.parent_url.clone())
            },
            ..Self::default()
        }
    }

    pub fn push_state() -> Self {
        Self {
            push_state: Some(true),
            ..Self::default()
        }
    }

    pub fn change_page() -> Self {
        Self {
            change_page: Some(true),
            ..Self::default()
        }
    }

    pub fn log(line: impl Into<String>) -> Self {
        Self {
            log: Some(line.into()),
            ..Self::default()
        }
    }

    pub fn is_push_state(&self) -> bool {
        self.push_state.unwrap_or(false)
    }

    pub fn is_change_page(&self) -> bool {
        self.change_page.unwrap_or(false)
    }

    /// Builds a listener record when the message carries one.
    ///
    /// The parent URL reported by the aggregator (the tab URL) wins over
    /// whatever the page claimed.
    pub fn to_record(&self, tab_url: Option<&str>) -> Option<ListenerRecord> {
        let code = self.listener.as_ref()?;
        let parent_url = tab_url
            .map(str::to_owned)
            .or_else(|| self.parent_url.clone())
            .unwrap_or_default();

        Some(ListenerRecord {
            window_label: self.window.clone().unwrap_or_default(),
            frame_path: self.hops.clone().unwrap_or_default(),
            domain: self.domain.clone().unwrap_or_default(),
            source_stack_line: self.stack.clone().unwrap_or_default(),
            full_stack_lines: self.fullstack.clone().unwrap_or_default(),
            code: code.clone(),
            parent_url,
        })
    }
}

/// Snapshot pushed to every connected observer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverUpdate {
    pub listeners: BTreeMap<TabId, Vec<ListenerRecord>>,
    #[serde(rename = "currentUrl")]
    pub current_url: String,
    pub cached: bool,
    pub timestamp: i64,
}

/// Typed bridge envelope.
///
/// Keep externally tagged: tab-keyed maps do not decode through internal tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMessage {
    Observation {
        tab_id: TabId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_url: Option<String>,
        message: InboundMessage,
    },
    TabUpdated {
        tab_id: TabId,
        status: String,
    },
    TabActivated {
        tab_id: TabId,
    },
    TabRemoved {
        tab_id: TabId,
    },
    Update(ObserverUpdate),
    Shutdown,
}

/// Receiver of page observations on the instrumented side.
///
/// Implementations must never block and never report failures back to the
/// page.
pub trait ObservationSink {
    fn emit(&self, message: InboundMessage);
}

impl<T: ObservationSink + ?Sized> ObservationSink for &T {
    fn emit(&self, message: InboundMessage) {
        (**self).emit(message);
    }
}

/// Defines how contexts communicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub role: ContextRole,
    pub max_message_bytes: usize,
}

impl ChannelConfig {
    pub fn hardened(role: ContextRole) -> WatchResult<Self> {
        let config = Self {
            role,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WatchResult<()> {
        if self.max_message_bytes == 0 {
            return Err(WatchError::new(
                "ipc.max_message_bytes_invalid",
                "channel max_message_bytes must be greater than zero",
            ));
        }

        if self.max_message_bytes > HARD_MAX_MESSAGE_BYTES {
            return Err(WatchError::new(
                "ipc.max_message_bytes_too_large",
                "channel max_message_bytes exceeds hard limit (16 MiB)",
            ));
        }

        Ok(())
    }
}

/// In-memory endpoint that applies framing and message-size checks.
pub struct LocalIpcEndpoint {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    config: ChannelConfig,
}

impl LocalIpcEndpoint {
    pub fn role(&self) -> ContextRole {
        self.config.role
    }

    pub fn send(&self, payload: &[u8]) -> WatchResult<()> {
        let frame = encode_frame(payload, self.config.max_message_bytes)?;
        self.tx.send(frame).map_err(|error| {
            WatchError::new(
                "ipc.send_failed",
                format!(
                    "failed to send message from {} endpoint: {error}",
                    self.config.role.as_str()
                ),
            )
        })
    }

    pub fn recv_timeout(&self, timeout: Duration) -> WatchResult<Vec<u8>> {
        let frame = self.rx.recv_timeout(timeout).map_err(|error| {
            let code = match error {
                mpsc::RecvTimeoutError::Timeout => "ipc.recv_timeout",
                mpsc::RecvTimeoutError::Disconnected => "ipc.disconnected",
            };
            WatchError::new(
                code,
                format!(
                    "failed to receive message for {} endpoint: {error}",
                    self.config.role.as_str()
                ),
            )
        })?;
        decode_frame(&frame, self.config.max_message_bytes)
    }

    pub fn send_message(&self, message: &BridgeMessage) -> WatchResult<()> {
        let payload = encode_message_payload(message)?;
        self.send(&payload)
    }

    pub fn recv_message_timeout(&self, timeout: Duration) -> WatchResult<BridgeMessage> {
        let payload = self.recv_timeout(timeout)?;
        decode_message_payload(&payload)
    }

    /// Drains every message already queued without waiting.
    pub fn drain_messages(&self) -> Vec<WatchResult<BridgeMessage>> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            out.push(
                decode_frame(&frame, self.config.max_message_bytes)
                    .and_then(|payload| decode_message_payload(&payload)),
            );
        }
        out
    }
}

/// Creates paired in-memory endpoints.
pub fn local_channel_pair(
    left: ChannelConfig,
    right: ChannelConfig,
) -> WatchResult<(LocalIpcEndpoint, LocalIpcEndpoint)> {
    left.validate()?;
    right.validate()?;

    let (left_to_right_tx, left_to_right_rx) = mpsc::channel();
    let (right_to_left_tx, right_to_left_rx) = mpsc::channel();

    Ok((
        LocalIpcEndpoint {
            tx: left_to_right_tx,
            rx: right_to_left_rx,
            config: left,
        },
        LocalIpcEndpoint {
            tx: right_to_left_tx,
            rx: left_to_right_rx,
            config: right,
        },
    ))
}

/// Page-side half of the bridge, bound to one tab.
pub struct PageBridge {
    endpoint: LocalIpcEndpoint,
    tab_id: TabId,
    tab_url: Option<String>,
}

impl PageBridge {
    pub fn new(endpoint: LocalIpcEndpoint, tab_id: TabId, tab_url: Option<String>) -> Self {
        Self {
            endpoint,
            tab_id,
            tab_url,
        }
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    pub fn into_endpoint(self) -> LocalIpcEndpoint {
        self.endpoint
    }
}

impl ObservationSink for PageBridge {
    fn emit(&self, message: InboundMessage) {
        let envelope = BridgeMessage::Observation {
            tab_id: self.tab_id,
            tab_url: self.tab_url.clone(),
            message,
        };
        if let Err(error) = self.endpoint.send_message(&envelope) {
            log::debug!("dropping page observation for tab {}: {error}", self.tab_id);
        }
    }
}

/// Encodes a payload as a length-prefixed frame.
pub fn encode_frame(payload: &[u8], max_message_bytes: usize) -> WatchResult<Vec<u8>> {
    if payload.len() > max_message_bytes {
        return Err(WatchError::new(
            "ipc.message_too_large",
            format!(
                "payload exceeds max_message_bytes ({} > {})",
                payload.len(),
                max_message_bytes
            ),
        ));
    }

    let len_u32 = u32::try_from(payload.len()).map_err(|_| {
        WatchError::new(
            "ipc.message_too_large",
            "payload length does not fit in 32-bit frame prefix",
        )
    })?;

    let mut out = Vec::with_capacity(FRAME_PREFIX_BYTES + payload.len());
    out.extend_from_slice(&len_u32.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decodes a length-prefixed frame and validates payload size.
pub fn decode_frame(frame: &[u8], max_message_bytes: usize) -> WatchResult<Vec<u8>> {
    if frame.len() < FRAME_PREFIX_BYTES {
        return Err(WatchError::new(
            "ipc.frame_too_short",
            "frame is shorter than the 4-byte length prefix",
        ));
    }

    let mut len_bytes = [0_u8; FRAME_PREFIX_BYTES];
    len_bytes.copy_from_slice(&frame[..FRAME_PREFIX_BYTES]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;
    if payload_len > max_message_bytes {
        return Err(WatchError::new(
            "ipc.message_too_large",
            format!(
                "decoded payload exceeds max_message_bytes ({} > {})",
                payload_len, max_message_bytes
            ),
        ));
    }

    let expected = FRAME_PREFIX_BYTES + payload_len;
    if frame.len() != expected {
        return Err(WatchError::new(
            "ipc.frame_length_mismatch",
            format!(
                "frame length mismatch: expected {expected} bytes, got {}",
                frame.len()
            ),
        ));
    }

    Ok(frame[FRAME_PREFIX_BYTES..].to_vec())
}

/// Encodes a typed bridge message as a framed payload.
pub fn encode_message(message: &BridgeMessage, max_message_bytes: usize) -> WatchResult<Vec<u8>> {
    let payload = encode_message_payload(message)?;
    encode_frame(&payload, max_message_bytes)
}

/// Decodes a framed typed bridge message.
pub fn decode_message(frame: &[u8], max_message_bytes: usize) -> WatchResult<BridgeMessage> {
    let payload = decode_frame(frame, max_message_bytes)?;
    decode_message_payload(&payload)
}

fn encode_message_payload(message: &BridgeMessage) -> WatchResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(|error| {
        WatchError::new(
            "ipc.message_encode_failed",
            format!("failed to encode bridge message: {error}"),
        )
    })
}

fn decode_message_payload(payload: &[u8]) -> WatchResult<BridgeMessage> {
    if payload.is_empty() {
        return Err(WatchError::new(
            "ipc.message_empty",
            "bridge message payload is empty",
        ));
    }

    serde_json::from_slice(payload).map_err(|error| {
        WatchError::new(
            "ipc.message_invalid",
            format!("bridge message payload is not a valid envelope: {error}"),
        )
    })
}
