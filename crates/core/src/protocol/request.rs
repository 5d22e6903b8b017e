use crate::error::{ParseErrorKind, RtspError};

/// A parsed RTSP request (RFC 2326 §6).
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// The HTTP tunnel legs (`GET`/`POST` with `HTTP/1.x`) parse into the same
/// type. Header lookup is case-insensitive per RFC 2326 §4.2.
#[derive(Debug, Clone)]
pub struct RtspRequest {
    pub method: String,
    /// Request-URI as sent, query string included.
    pub uri: String,
    pub version: String,
    /// Headers as ordered (name, value) pairs, names as received.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RtspRequest {
    /// Parse a request line and header block; any text after the blank line
    /// becomes the body.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let (head, body) = match raw.find("\r\n\r\n") {
            Some(pos) => (&raw[..pos], &raw[pos + 4..]),
            None => (raw, ""),
        };
        let mut lines = head.lines();

        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or(RtspError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let version = parts[2].to_string();
        if version != "RTSP/1.0" && !version.starts_with("HTTP/") {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon_pos = line.find(':').ok_or(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            headers.push((
                line[..colon_pos].trim().to_string(),
                line[colon_pos + 1..].trim().to_string(),
            ));
        }

        Ok(RtspRequest {
            method: parts[0].to_string(),
            uri: parts[1].to_string(),
            version,
            headers,
            body: body.to_string(),
        })
    }

    /// Look up a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Header value or the empty string.
    pub fn header_or_empty(&self, name: &str) -> &str {
        self.get_header(name).unwrap_or("")
    }

    /// CSeq (RFC 2326 §12.17), echoed on every response.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// `Session` header without the `;timeout=` suffix.
    pub fn session(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or("").trim())
    }

    /// `Content-Length`, 0 when absent.
    pub fn content_length(&self) -> crate::error::Result<usize> {
        match self.get_header("Content-Length") {
            None => Ok(0),
            Some(v) => v.parse().map_err(|_| RtspError::Parse {
                kind: ParseErrorKind::InvalidContentLength,
            }),
        }
    }

    /// Request URL without the query string.
    pub fn url(&self) -> &str {
        self.uri.split('?').next().unwrap_or(&self.uri)
    }

    /// Request URL with the query string.
    pub fn full_url(&self) -> &str {
        &self.uri
    }

    /// Whether this is one leg of an HTTP tunnel rather than RTSP.
    pub fn is_http(&self) -> bool {
        self.version.starts_with("HTTP/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_request() {
        let raw = "OPTIONS rtsp://localhost:8554/live/test RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.uri, "rtsp://localhost:8554/live/test");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some("1"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn parse_setup_with_transport() {
        let raw = "SETUP rtsp://localhost:8554/live/test/trackID=0 RTSP/1.0\r\n\
                   CSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=8000-8001\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(
            req.get_header("Transport"),
            Some("RTP/AVP;unicast;client_port=8000-8001")
        );
    }

    #[test]
    fn body_and_content_length() {
        let raw = "ANNOUNCE rtsp://h/live/a RTSP/1.0\r\nCSeq: 2\r\nContent-Length: 5\r\n\r\nv=0\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.content_length().unwrap(), 5);
        assert_eq!(req.body, "v=0\r\n");
    }

    #[test]
    fn bad_content_length() {
        let raw = "ANNOUNCE rtsp://h/live/a RTSP/1.0\r\nContent-Length: x\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert!(req.content_length().is_err());
    }

    #[test]
    fn parse_empty_request() {
        assert!(RtspRequest::parse("").is_err());
        assert!(RtspRequest::parse("\r\n\r\n").is_err());
    }

    #[test]
    fn parse_invalid_request_line() {
        assert!(RtspRequest::parse("JUST_A_METHOD\r\n\r\n").is_err());
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = "OPTIONS rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.get_header("CSeq"), Some("42"));
        assert_eq!(req.get_header("CSEQ"), Some("42"));
    }

    #[test]
    fn url_drops_query_and_session_drops_timeout() {
        let raw = "PLAY rtsp://h/live/a?token=1 RTSP/1.0\r\nSession: abc;timeout=60\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.url(), "rtsp://h/live/a");
        assert_eq!(req.full_url(), "rtsp://h/live/a?token=1");
        assert_eq!(req.session(), Some("abc"));
    }

    #[test]
    fn http_tunnel_leg() {
        let raw = "GET /live/a HTTP/1.0\r\nx-sessioncookie: c00kie\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert!(req.is_http());
        assert_eq!(req.get_header("X-SessionCookie"), Some("c00kie"));
    }
}
