//! Server configuration limits and timeouts
//!
//! Defaults are intentionally conservative: a peer that exceeds any
//! request limit gets a `400` and its connection closed, and a peer that
//! goes silent is dropped by the idle watchdog.

use std::time::Duration;

/// Limits enforced while parsing a single request.
///
/// Every field caps the accumulated size of one request component; the
/// parser rejects the request the moment a cap is crossed, before
/// buffering more input.
///
/// # Examples
///
/// ```
/// use solo_web::limits::ReqLimits;
///
/// let limits = ReqLimits {
///     body_size: 1024 * 1024, // 1 MiB uploads are plenty
///     ..ReqLimits::default()
/// };
/// assert_eq!(limits.url_size, 8192);
/// ```
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum method token length in bytes.
    pub method_size: usize,
    /// Maximum request-target length in bytes (path and query together,
    /// in encoded form).
    pub url_size: usize,
    /// Maximum `x.y` version string length in bytes.
    pub version_size: usize,
    /// Maximum header name length in bytes.
    pub header_name_size: usize,
    /// Maximum header value length in bytes.
    pub header_value_size: usize,
    /// Maximum number of header lines.
    pub header_count: usize,
    /// Maximum `Content-Length` value in bytes.
    pub body_size: usize,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            method_size: 16,
            url_size: 8192,
            version_size: 16,
            header_name_size: 256,
            header_value_size: 8192,
            header_count: 100,
            body_size: 10 * 1024 * 1024,
        }
    }
}

/// Per-connection resource limits.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Size of the per-connection read buffer.
    pub read_buffer_size: usize,
    /// How long a connection may sit without delivering a byte before it
    /// is closed. Rearmed on every read and on every keep-alive response.
    pub idle_timeout: Duration,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            read_buffer_size: 8192,
            idle_timeout: Duration::from_secs(30),
        }
    }
}
