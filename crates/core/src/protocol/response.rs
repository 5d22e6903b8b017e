use crate::error::RtspError;

/// An RTSP response (RFC 2326 §7).
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Builder style: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then [`serialize`](Self::serialize).
/// `Content-Length` is appended when a body is present. The session adds
/// `CSeq`, `Session`, `Server` and `Date` before sending.
#[must_use]
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub protocol: &'static str,
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Default `Server` header value.
pub const SERVER_AGENT: &str = concat!("rtsp-relay/", env!("CARGO_PKG_VERSION"));

/// RFC 1123 date for the `Date` header.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            protocol: "RTSP/1.0",
            status_code,
            status_text: status_text.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// Status line for an error, `403 Forbidden` when it carries none.
    pub fn from_error(err: &RtspError) -> Self {
        let (code, text) = err.status().unwrap_or((403, "Forbidden"));
        Self::new(code, text)
    }

    /// Switch the status line protocol, e.g. `HTTP/1.0` for tunnel legs.
    pub fn with_protocol(mut self, protocol: &'static str) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Plain-text body, as used for error explanations.
    pub fn with_text(self, text: &str) -> Self {
        self.add_header("Content-Type", "text/plain")
            .with_body(text.to_string())
    }

    pub fn serialize(&self) -> String {
        let mut response = format!(
            "{} {} {}\r\n",
            self.protocol, self.status_code, self.status_text
        );
        for (name, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        match &self.body {
            Some(body) if !body.is_empty() => {
                response.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
                response.push_str(body);
            }
            _ => response.push_str("\r\n"),
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_no_body() {
        let s = RtspResponse::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "OPTIONS")
            .serialize();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.contains("Public: OPTIONS\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
        assert!(!s.contains("Content-Length"));
    }

    #[test]
    fn serialize_with_body() {
        let s = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body("v=0\r\n".to_string())
            .serialize();
        assert!(s.contains("Content-Length: 5\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn error_status_line() {
        let s = RtspResponse::from_error(&RtspError::SessionNotFound).serialize();
        assert!(s.starts_with("RTSP/1.0 454 Session Not Found\r\n"));
        let s = RtspResponse::from_error(&RtspError::GetterNotFound("x".into())).serialize();
        assert!(s.starts_with("RTSP/1.0 403 Forbidden\r\n"));
    }

    #[test]
    fn http_protocol_for_tunnel() {
        let s = RtspResponse::ok().with_protocol("HTTP/1.0").serialize();
        assert!(s.starts_with("HTTP/1.0 200 OK\r\n"));
    }

    #[test]
    fn date_is_rfc1123() {
        let d = http_date();
        assert!(d.ends_with(" GMT"), "{d}");
        assert_eq!(d.split(' ').count(), 6, "{d}");
    }
}
