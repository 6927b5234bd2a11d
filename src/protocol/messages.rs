/// Status line and header terminator of the fail-fast reply
pub const UNAVAILABLE_STATUS: &str = "HTTP/1.1 503 Service Unavailable\r\n\r\n";

/// Body used when no message is configured
pub const DEFAULT_UNAVAILABLE_MESSAGE: &str = "No tunnel available.";

/// Build the bytes written to a public caller when no tunnel is idle.
///
/// The reply is sent whatever protocol the caller speaks; the relay never
/// looks at inbound bytes before deciding.
pub fn unavailable_response(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(UNAVAILABLE_STATUS.len() + message.len());
    out.extend_from_slice(UNAVAILABLE_STATUS.as_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}
