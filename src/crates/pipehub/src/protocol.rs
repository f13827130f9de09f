//! Wire protocol framing and method identifiers
//!
//! A message is a byte sequence terminated by the fixed sentinel `[-_-]`.
//! Requests further split into `METHOD|-**-|BODY`. There is no length
//! prefix, so the reader accumulates arbitrary chunk sizes until it sees the
//! terminator. The sentinels are kept for wire compatibility with existing
//! workers; outgoing payloads containing either sentinel are rejected at the
//! sender instead of escaped.

use crate::error::{HubError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame terminator appended to every message.
pub const FRAME_END: &[u8] = b"[-_-]";

/// Splitter between the method name and the request body.
pub const METHOD_SPLIT: &[u8] = b"|-**-|";

/// Upper bound on a single frame; a peer that keeps streaming without ever
/// sending the terminator is cut off here.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Acknowledgement body for accepted mutations.
pub const OK_RESPONSE: &[u8] = b"ok";

/// Distinct marker returned for a method the hub does not recognize.
pub const UNKNOWN_METHOD_RESPONSE: &[u8] = b"unknown-method";

/// The fixed set of request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GetSteps,
    Done,
    Pending,
    Cancel,
    Reset,
    Error,
    UploadStep,
    UploadSteps,
    StepCount,
    ResetErrors,
    DeleteSteps,
    FetchErrors,
    FetchRows,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetSteps => "get-steps",
            Self::Done => "done",
            Self::Pending => "pending",
            Self::Cancel => "cancel",
            Self::Reset => "reset",
            Self::Error => "error",
            Self::UploadStep => "upload-step",
            Self::UploadSteps => "upload-steps",
            Self::StepCount => "step-count",
            Self::ResetErrors => "reset-errors",
            Self::DeleteSteps => "delete-steps",
            Self::FetchErrors => "fetch-errors",
            Self::FetchRows => "fetch-rows",
        }
    }

    /// Parse the literal wire string. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "get-steps" => Some(Self::GetSteps),
            "done" => Some(Self::Done),
            "pending" => Some(Self::Pending),
            "cancel" => Some(Self::Cancel),
            "reset" => Some(Self::Reset),
            "error" => Some(Self::Error),
            "upload-step" => Some(Self::UploadStep),
            "upload-steps" => Some(Self::UploadSteps),
            "step-count" => Some(Self::StepCount),
            "reset-errors" => Some(Self::ResetErrors),
            "delete-steps" => Some(Self::DeleteSteps),
            "fetch-errors" => Some(Self::FetchErrors),
            "fetch-rows" => Some(Self::FetchRows),
            _ => None,
        }
    }

    /// Mutating methods travel through the durable transaction queue and are
    /// acknowledged before application; everything else executes inline.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Done
                | Self::Pending
                | Self::Cancel
                | Self::Reset
                | Self::Error
                | Self::UploadStep
                | Self::UploadSteps
                | Self::ResetErrors
        )
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Find `needle` in `haystack` at or after `from`.
fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    let start = from.min(haystack.len());
    haystack[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + start)
}

/// True if `bytes` contains either wire sentinel.
pub fn contains_sentinel(bytes: &[u8]) -> bool {
    find(bytes, FRAME_END, 0).is_some() || find(bytes, METHOD_SPLIT, 0).is_some()
}

/// Encode one request frame. Fails if the body would collide with the
/// framing sentinels, which the wire format cannot represent.
pub fn encode_request(method: Method, body: &[u8]) -> Result<Vec<u8>> {
    if contains_sentinel(body) {
        return Err(HubError::Protocol(
            "request body contains a framing sentinel".to_string(),
        ));
    }
    let mut frame =
        Vec::with_capacity(method.as_str().len() + METHOD_SPLIT.len() + body.len() + FRAME_END.len());
    frame.extend_from_slice(method.as_str().as_bytes());
    frame.extend_from_slice(METHOD_SPLIT);
    frame.extend_from_slice(body);
    frame.extend_from_slice(FRAME_END);
    Ok(frame)
}

/// Split a received request frame (terminator already stripped) into its
/// method string and body.
pub fn split_request(frame: &[u8]) -> Result<(&str, &[u8])> {
    let pos = find(frame, METHOD_SPLIT, 0)
        .ok_or_else(|| HubError::Protocol("request frame has no method splitter".to_string()))?;
    let method = std::str::from_utf8(&frame[..pos])
        .map_err(|_| HubError::Protocol("method name is not UTF-8".to_string()))?;
    Ok((method, &frame[pos + METHOD_SPLIT.len()..]))
}

/// Read one frame, tolerating arbitrary chunk sizes and partial deliveries.
///
/// Returns `Ok(None)` on a clean EOF before any bytes arrive; an EOF in the
/// middle of a frame is a protocol error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    // Resume the sentinel scan just before the unscanned tail so a
    // terminator split across reads is still found.
    let mut scanned = 0usize;

    loop {
        if let Some(pos) = find(&buf, FRAME_END, scanned) {
            buf.truncate(pos);
            return Ok(Some(buf));
        }
        scanned = buf.len().saturating_sub(FRAME_END.len() - 1);

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(HubError::Protocol(
                "connection closed mid-frame".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_FRAME_BYTES {
            return Err(HubError::Protocol(format!(
                "frame exceeds {} bytes without a terminator",
                MAX_FRAME_BYTES
            )));
        }
    }
}

/// Write one framed message.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(payload.len() + FRAME_END.len());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(FRAME_END);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
