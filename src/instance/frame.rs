//! Wire format of messages between instances: `<event> NUL <payload>`.
//!
//! There is no length prefix. Each frame goes out in a single write no
//! larger than the pipe's atomic write size, and the reader takes one frame
//! per read.

use crate::error::{Error, Result};

/// Largest frame written in one atomic pipe write.
#[cfg(target_os = "linux")]
pub const MAX_FRAME_LEN: usize = 4096;
#[cfg(not(target_os = "linux"))]
pub const MAX_FRAME_LEN: usize = 512;

const SEPARATOR: u8 = 0;

/// A decoded frame borrowing from the received bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub event: &'a str,
    pub payload: &'a [u8],
}

/// # Errors
/// [`Error::InvalidFrame`] for an empty or non-ASCII event name, or a frame
/// longer than [`MAX_FRAME_LEN`].
pub fn encode_frame(event: &str, payload: &[u8]) -> Result<Vec<u8>> {
    validate_event(event)?;
    let len = event.len() + 1 + payload.len();
    if len > MAX_FRAME_LEN {
        return Err(Error::InvalidFrame("frame exceeds the atomic pipe write size"));
    }

    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(event.as_bytes());
    frame.push(SEPARATOR);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// # Errors
/// [`Error::InvalidFrame`] if the event terminator is missing or the event
/// name is invalid.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame<'_>> {
    let split = bytes
        .iter()
        .position(|&b| b == SEPARATOR)
        .ok_or(Error::InvalidFrame("missing event terminator"))?;
    let event = std::str::from_utf8(&bytes[..split])
        .map_err(|_| Error::InvalidFrame("event name is not ASCII"))?;
    validate_event(event)?;

    Ok(Frame {
        event,
        payload: &bytes[split + 1..],
    })
}

/// Join `args` with NUL separators.
#[must_use]
pub fn encode_args(args: &[String]) -> Vec<u8> {
    args.join("\0").into_bytes()
}

/// Inverse of [`encode_args`]. An empty payload is an empty argv.
#[must_use]
pub fn decode_args(payload: &[u8]) -> Vec<String> {
    if payload.is_empty() {
        return Vec::new();
    }
    payload
        .split(|&b| b == SEPARATOR)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

fn validate_event(event: &str) -> Result<()> {
    if event.is_empty() {
        return Err(Error::InvalidFrame("empty event name"));
    }
    if !event.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(Error::InvalidFrame("event name is not ASCII"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame("run", b"bench\0--fast").unwrap();
        assert_eq!(frame, b"run\0bench\0--fast");

        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.event, "run");
        assert_eq!(decode_args(decoded.payload), vec!["bench", "--fast"]);
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode_frame("shutdown", &[]).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.event, "shutdown");
        assert!(decoded.payload.is_empty());
        assert!(decode_args(decoded.payload).is_empty());
    }

    #[test]
    fn test_invalid_frames_rejected() {
        assert!(encode_frame("", b"x").is_err());
        assert!(encode_frame("ru n", b"x").is_err());
        assert!(encode_frame("run", &vec![b'a'; MAX_FRAME_LEN]).is_err());
        assert!(decode_frame(b"run-without-terminator").is_err());
        assert!(decode_frame(b"\0payload").is_err());
    }

    #[test]
    fn test_largest_frame_fits() {
        let payload = vec![b'a'; MAX_FRAME_LEN - "run".len() - 1];
        assert_eq!(encode_frame("run", &payload).unwrap().len(), MAX_FRAME_LEN);
    }
}
