//! Classification of transient I/O failures.
//!
//! Errors reach the retry machinery from three surfaces: reading the socket
//! accessor, socket sends, and the handshake. All of them are normalized to
//! a stable symbolic code here so the retry decision is a set lookup instead
//! of string matching scattered across call sites.

use std::error::Error as StdError;
use std::io;

use nix::errno::Errno;

use crate::error::ProtocolError;

/// Codes worth retrying with backoff. Everything else is surfaced to the
/// caller unchanged.
pub const TRANSIENT_CODES: &[&str] = &[
    "timeout",
    "ENOTCONN",
    "EHOSTUNREACH",
    "EHOSTDOWN",
    "ENETUNREACH",
    "ENETDOWN",
    "ENETRESET",
    "EAGAIN",
    "EINTR",
    "EALREADY",
    "EINPROGRESS",
    "EWOULDBLOCK",
    "ENOBUFS",
    "EADDRNOTAVAIL",
    "ECONNREFUSED",
    "ECONNRESET",
    "ECONNABORTED",
    "EPIPE",
    "EBADF",
    "EIO",
    "ECANCELED",
    "ETIMEDOUT",
    "EAI_AGAIN",
    "EAI_FAIL",
    "EAI_SYSTEM",
    "EAI_NONAME",
    "EAI_NODATA",
    "ENOTFOUND",
    "ERR_SOCKET_DGRAM_NOT_RUNNING",
    "ERR_SOCKET_CLOSED",
];

/// Some platforms report a dead network stack through this text instead of a
/// code, sometimes buried inside a wrapped cause.
const NETWORK_UNAVAILABLE_TEXT: &str = "network communication is unavailable";

/// Canonical form of a symbolic code: uppercase, except the well-known
/// lowercase `timeout` sentinel. Idempotent.
pub fn canonical_code(raw: &str) -> String {
    if raw == "timeout" {
        raw.to_string()
    } else {
        raw.to_ascii_uppercase()
    }
}

/// Symbolic code for an I/O error: the OS error number translated through
/// the errno table when present, an `ErrorKind` mapping for synthetic
/// errors.
pub fn code_for_io(err: &io::Error) -> String {
    if let Some(raw) = err.raw_os_error() {
        let errno = Errno::from_i32(raw);
        if errno != Errno::UnknownErrno {
            return format!("{:?}", errno);
        }
    }
    code_for_kind(err.kind()).to_string()
}

fn code_for_kind(kind: io::ErrorKind) -> &'static str {
    use io::ErrorKind::*;
    match kind {
        NotConnected => "ENOTCONN",
        ConnectionRefused => "ECONNREFUSED",
        ConnectionReset => "ECONNRESET",
        ConnectionAborted => "ECONNABORTED",
        BrokenPipe => "EPIPE",
        WouldBlock => "EWOULDBLOCK",
        TimedOut => "ETIMEDOUT",
        Interrupted => "EINTR",
        AddrNotAvailable => "EADDRNOTAVAIL",
        AddrInUse => "EADDRINUSE",
        PermissionDenied => "EACCES",
        OutOfMemory => "ENOBUFS",
        _ => "EIO",
    }
}

pub fn is_transient_code(code: &str) -> bool {
    TRANSIENT_CODES.contains(&code)
}

/// True when the error should be retried: its code is in the transient set,
/// or its message (anywhere in the source chain) reports the network stack
/// as unavailable.
pub fn is_transient(err: &ProtocolError) -> bool {
    if let Some(code) = err.code() {
        if is_transient_code(&canonical_code(code)) {
            return true;
        }
    }
    message_chain_reports_unavailable(err)
}

/// Connect-level variant: `connection-failure` also earns a retry, since a
/// failed enrichment is usually the same outage wearing a different code.
pub fn is_transient_connect(err: &ProtocolError) -> bool {
    matches!(err, ProtocolError::ConnectionFailure) || is_transient(err)
}

fn message_chain_reports_unavailable(err: &ProtocolError) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if e.to_string()
            .to_lowercase()
            .contains(NETWORK_UNAVAILABLE_TEXT)
        {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_code_uppercases() {
        assert_eq!(canonical_code("eintr"), "EINTR");
        assert_eq!(canonical_code("Econnreset"), "ECONNRESET");
    }

    #[test]
    fn test_canonical_code_keeps_timeout_lowercase() {
        assert_eq!(canonical_code("timeout"), "timeout");
    }

    #[test]
    fn test_canonical_code_idempotent() {
        for raw in ["eintr", "timeout", "ECONNRESET", "eai_again"] {
            let once = canonical_code(raw);
            assert_eq!(canonical_code(&once), once);
        }
    }

    #[test]
    fn test_lowercase_code_is_transient() {
        let err = ProtocolError::socket_code("eintr", "interrupted");
        assert_eq!(err.code(), Some("EINTR"));
        assert!(is_transient(&err));
    }

    #[test]
    fn test_nontransient_code() {
        let err = ProtocolError::socket_code("enoent", "no such file");
        assert!(!is_transient(&err));
    }

    #[test]
    fn test_timeout_is_transient() {
        assert!(is_transient(&ProtocolError::Timeout));
    }

    #[test]
    fn test_unavailable_message_in_wrapped_cause() {
        let inner = io::Error::new(
            io::ErrorKind::Other,
            "NETWORK COMMUNICATION IS UNAVAILABLE while reconnecting",
        );
        let err = ProtocolError::Socket {
            code: "OTHER".to_string(),
            message: "outer".to_string(),
            source: Some(inner),
        };
        assert!(is_transient(&err));
    }

    #[test]
    fn test_raw_os_error_translated() {
        let err = ProtocolError::socket_io(io::Error::from_raw_os_error(libc_econnreset()));
        assert_eq!(err.code(), Some("ECONNRESET"));
        assert!(is_transient(&err));
    }

    fn libc_econnreset() -> i32 {
        Errno::ECONNRESET as i32
    }

    #[test]
    fn test_connect_classifier_includes_connection_failure() {
        assert!(is_transient_connect(&ProtocolError::ConnectionFailure));
        assert!(!is_transient(&ProtocolError::ConnectionFailure));
    }
}
