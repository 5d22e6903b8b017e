use std::fmt;
use std::net::IpAddr;

/// Vhost used when virtual hosting is off or the URL names no host.
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

pub const RTSP_SCHEMA: &str = "rtsp";

/// (schema, vhost, app, stream): the address of one live source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamIdentity {
    pub schema: String,
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

impl StreamIdentity {
    pub fn new(schema: &str, vhost: &str, app: &str, stream: &str) -> Self {
        Self {
            schema: schema.to_string(),
            vhost: vhost.to_string(),
            app: app.to_string(),
            stream: stream.to_string(),
        }
    }

    /// Same stream under another schema.
    pub fn with_schema(&self, schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.schema, self.vhost, self.app, self.stream)
    }
}

/// Everything a request URL says about the stream it addresses.
///
/// `rtsp://host:port/app/stream/sub?vhost=v&k=v` parses to app `app`,
/// stream `stream/sub`, params `vhost=v&k=v`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInfo {
    pub schema: String,
    pub host: String,
    pub port: Option<u16>,
    pub vhost: String,
    pub app: String,
    pub stream: String,
    /// Raw query string, without `?`.
    pub params: String,
    pub full_url: String,
}

impl MediaInfo {
    /// Parse a request URL. With `enable_vhost` off every stream lives in
    /// [`DEFAULT_VHOST`]; with it on, a `vhost=` parameter wins over the
    /// URL host, and IP-literal hosts fall back to the default.
    pub fn parse(url: &str, enable_vhost: bool) -> Self {
        let mut info = MediaInfo {
            full_url: url.to_string(),
            ..Default::default()
        };

        let (without_query, params) = match url.split_once('?') {
            Some((u, p)) => (u, p),
            None => (url, ""),
        };
        info.params = params.to_string();

        let rest = match without_query.split_once("://") {
            Some((schema, rest)) => {
                info.schema = schema.to_ascii_lowercase();
                rest
            }
            None => without_query,
        };

        let mut segments = rest.split('/');
        let authority = segments.next().unwrap_or("");
        match authority.rsplit_once(':') {
            Some((host, port)) if !port.contains(']') => {
                info.host = host.to_string();
                info.port = port.parse().ok();
            }
            _ => info.host = authority.to_string(),
        }

        let mut path = segments.filter(|s| !s.is_empty());
        info.app = path.next().unwrap_or("").to_string();
        info.stream = path.collect::<Vec<_>>().join("/");

        info.vhost = if enable_vhost {
            let from_params = params
                .split('&')
                .filter_map(|kv| kv.split_once('='))
                .find(|(k, _)| k.eq_ignore_ascii_case("vhost"))
                .map(|(_, v)| v.to_string());
            let host = from_params.unwrap_or_else(|| info.host.clone());
            let bare = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() || bare.parse::<IpAddr>().is_ok() {
                DEFAULT_VHOST.to_string()
            } else {
                host
            }
        } else {
            DEFAULT_VHOST.to_string()
        };
        info
    }

    /// At least `app/stream` must be present to address a source.
    pub fn is_addressable(&self) -> bool {
        !self.app.is_empty() && !self.stream.is_empty()
    }

    pub fn identity(&self, schema: &str) -> StreamIdentity {
        StreamIdentity::new(schema, &self.vhost, &self.app, &self.stream)
    }

    /// Drop a trailing `.sdp` that some publishers append to the stream.
    pub fn strip_sdp_suffix(&mut self) {
        if let Some(stripped) = self.stream.strip_suffix(".sdp") {
            self.stream = stripped.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_level_path() {
        let info = MediaInfo::parse("rtsp://127.0.0.1:8554/live/cam", false);
        assert_eq!(info.schema, "rtsp");
        assert_eq!(info.host, "127.0.0.1");
        assert_eq!(info.port, Some(8554));
        assert_eq!(info.vhost, DEFAULT_VHOST);
        assert_eq!(info.app, "live");
        assert_eq!(info.stream, "cam");
        assert!(info.is_addressable());
    }

    #[test]
    fn one_level_is_not_addressable() {
        assert!(!MediaInfo::parse("rtsp://h/live", false).is_addressable());
        assert!(!MediaInfo::parse("rtsp://h/", false).is_addressable());
        assert!(!MediaInfo::parse("rtsp://h", false).is_addressable());
    }

    #[test]
    fn deeper_paths_join_into_stream() {
        let info = MediaInfo::parse("rtsp://h/live/a/b?token=1", false);
        assert_eq!(info.stream, "a/b");
        assert_eq!(info.params, "token=1");
    }

    #[test]
    fn vhost_rules() {
        assert_eq!(MediaInfo::parse("rtsp://cam.example.com/live/a", true).vhost, "cam.example.com");
        assert_eq!(MediaInfo::parse("rtsp://10.0.0.1/live/a", true).vhost, DEFAULT_VHOST);
        assert_eq!(
            MediaInfo::parse("rtsp://10.0.0.1/live/a?vhost=tenant", true).vhost,
            "tenant"
        );
        assert_eq!(
            MediaInfo::parse("rtsp://cam.example.com/live/a?vhost=tenant", false).vhost,
            DEFAULT_VHOST
        );
    }

    #[test]
    fn sdp_suffix() {
        let mut info = MediaInfo::parse("rtsp://h/live/cam.sdp", false);
        info.strip_sdp_suffix();
        assert_eq!(info.identity(RTSP_SCHEMA).to_string(), "rtsp/__defaultVhost__/live/cam");
    }
}
