use thiserror::Error;

/// Trailing byte appended to every framed packet.
pub const DELIMITER: u8 = b'\n';

const EVENT_BIT: u8 = 0x80;
const BINARY_BIT: u8 = 0x40;
const ACTION_MASK: u8 = 0x3F;

/// Query actions. The backend answers each with a boolean status byte,
/// optionally followed by a UTF-8 payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    Ping = 0,
    ReplayBufferActive = 1,
    RecordingActive = 2,
    StreamingActive = 3,
    GetCurrentScene = 4,
    GetScenes = 5,
}

/// Fire-and-forget commands. The backend still acknowledges each with a
/// boolean status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Ping = 0,
    StartReplayBuffer = 1,
    StopReplayBuffer = 2,
    SaveReplayBuffer = 3,
    StartRecording = 4,
    StopRecording = 5,
    StartStreaming = 6,
    StopStreaming = 7,
    RecordingSplitFile = 8,
    SetScene = 9,
}

impl RequestAction {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl EventAction {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed packet: empty input")]
    MalformedPacket,
    #[error("packet payload is not valid UTF-8")]
    InvalidPayload(#[from] std::string::FromUtf8Error),
}

/// A decoded packet header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub is_event: bool,
    pub is_binary: bool,
    pub action: u8,
    pub payload: String,
}

/// Builds a raw packet: one header byte followed by the UTF-8 payload when
/// non-empty. The framing delimiter is not included here; callers that put
/// packets on the wire append it via [`framed`].
pub fn encode(is_event: bool, action: u8, payload: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + payload.len());
    let mut header = 0u8;
    if is_event {
        header |= EVENT_BIT;
    }
    header |= action & ACTION_MASK;
    packet.push(header);
    if !payload.is_empty() {
        packet.extend_from_slice(payload.as_bytes());
    }
    packet
}

/// Encodes a packet and appends the trailing delimiter byte.
pub fn framed(is_event: bool, action: u8, payload: &str) -> Vec<u8> {
    let mut packet = encode(is_event, action, payload);
    packet.push(DELIMITER);
    packet
}

pub fn request_packet(action: RequestAction) -> Vec<u8> {
    framed(false, action.code(), "")
}

pub fn event_packet(action: EventAction, payload: &str) -> Vec<u8> {
    framed(true, action.code(), payload)
}

/// Splits a raw packet back into header bits and payload. Performs no
/// trimming; trailing delimiter handling is the caller's responsibility.
pub fn decode(bytes: &[u8]) -> Result<Packet, ProtocolError> {
    let header = *bytes.first().ok_or(ProtocolError::MalformedPacket)?;
    let is_event = header & EVENT_BIT != 0;
    let is_binary = header & BINARY_BIT != 0;
    let action = header & ACTION_MASK;

    let payload = if !is_binary && bytes.len() > 1 {
        String::from_utf8(bytes[1..].to_vec())?
    } else {
        String::new()
    };

    Ok(Packet {
        is_event,
        is_binary,
        action,
        payload,
    })
}

/// Boolean result carried in bit 6 of a response's first byte. `None` when
/// the peer sent nothing back.
pub fn reply_status(bytes: &[u8]) -> Option<bool> {
    bytes.first().map(|b| b & BINARY_BIT != 0)
}

/// Response payload after the status byte, trimmed of trailing newline and
/// carriage-return bytes left over from framing.
pub fn reply_payload(bytes: &[u8]) -> String {
    if bytes.len() <= 1 {
        return String::new();
    }
    String::from_utf8_lossy(&bytes[1..])
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

/// Scene lists arrive as NUL-separated names; empty entries are dropped.
pub fn parse_scene_list(payload: &str) -> Vec<String> {
    payload
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
