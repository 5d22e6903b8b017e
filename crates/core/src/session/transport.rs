use std::net::{IpAddr, Ipv4Addr};

/// How RTP flows for the whole session, fixed by the first SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpTransport {
    /// `$`-framed on the RTSP connection (RFC 2326 §10.12).
    Tcp,
    Udp,
    Multicast,
}

impl RtpTransport {
    /// `TCP` anywhere in the header selects interleaving, `multicast`
    /// selects multicast, anything else is UDP unicast.
    pub fn from_header(header: &str) -> Self {
        if header.contains("TCP") {
            Self::Tcp
        } else if header.contains("multicast") {
            Self::Multicast
        } else {
            Self::Udp
        }
    }
}

/// Client-side parameters of the RTSP `Transport` header (RFC 2326 §12.39).
///
/// ## Examples
///
/// ```
/// use relay::session::transport::{RtpTransport, TransportHeader};
///
/// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001");
/// assert_eq!(th.kind, RtpTransport::Udp);
/// assert_eq!(th.client_port, Some((8000, 8001)));
///
/// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3");
/// assert_eq!(th.kind, RtpTransport::Tcp);
/// assert_eq!(th.interleaved, Some((2, 3)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    pub kind: RtpTransport,
    pub interleaved: Option<(u8, u8)>,
    pub client_port: Option<(u16, u16)>,
}

impl TransportHeader {
    pub fn parse(header: &str) -> Self {
        let mut th = TransportHeader {
            kind: RtpTransport::from_header(header),
            interleaved: None,
            client_port: None,
        };
        for part in header.split(';') {
            let part = part.trim();
            if let Some(v) = part.strip_prefix("interleaved=") {
                th.interleaved = pair(v);
            } else if let Some(v) = part.strip_prefix("client_port=") {
                th.client_port = pair(v);
            }
        }
        th
    }
}

/// `a-b`; a lone `a` means `a-(a+1)`.
fn pair<T: TryFrom<u32>>(value: &str) -> Option<(T, T)> {
    let (a, b) = match value.split_once('-') {
        Some((a, b)) => (a.trim().parse::<u32>().ok()?, b.trim().parse::<u32>().ok()?),
        None => {
            let a = value.trim().parse::<u32>().ok()?;
            (a, a.saturating_add(1))
        }
    };
    Some((T::try_from(a).ok()?, T::try_from(b).ok()?))
}

/// SSRC as printed in `Transport` replies.
pub fn format_ssrc(ssrc: u32) -> String {
    format!("{ssrc:08X}")
}

pub fn tcp_reply(interleaved: u8, ssrc: u32) -> String {
    format!(
        "RTP/AVP/TCP;unicast;interleaved={}-{};ssrc={}",
        interleaved,
        interleaved as u16 + 1,
        format_ssrc(ssrc)
    )
}

pub fn udp_reply(client_port: (u16, u16), server_port: (u16, u16), ssrc: u32) -> String {
    format!(
        "RTP/AVP/UDP;unicast;client_port={}-{};server_port={}-{};ssrc={}",
        client_port.0,
        client_port.1,
        server_port.0,
        server_port.1,
        format_ssrc(ssrc)
    )
}

pub fn multicast_reply(
    group: Ipv4Addr,
    source: IpAddr,
    port: (u16, u16),
    ttl: u32,
    ssrc: u32,
) -> String {
    format!(
        "RTP/AVP;multicast;destination={};source={};port={}-{};ttl={};ssrc={}",
        group,
        source,
        port.0,
        port.1,
        ttl,
        format_ssrc(ssrc)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_selection() {
        assert_eq!(RtpTransport::from_header("RTP/AVP/TCP;interleaved=0-1"), RtpTransport::Tcp);
        assert_eq!(RtpTransport::from_header("RTP/AVP;multicast"), RtpTransport::Multicast);
        assert_eq!(RtpTransport::from_header("RTP/AVP;unicast;client_port=1-2"), RtpTransport::Udp);
    }

    #[test]
    fn parse_valid_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001");
        assert_eq!(th.client_port, Some((5000, 5001)));
        assert_eq!(th.interleaved, None);
    }

    #[test]
    fn parse_single_values() {
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=4");
        assert_eq!(th.interleaved, Some((4, 5)));
        assert_eq!(TransportHeader::parse("RTP/AVP;unicast").client_port, None);
        assert_eq!(TransportHeader::parse("RTP/AVP/TCP;interleaved=x-1").interleaved, None);
    }

    #[test]
    fn replies() {
        assert_eq!(
            tcp_reply(2, 0xab),
            "RTP/AVP/TCP;unicast;interleaved=2-3;ssrc=000000AB"
        );
        assert_eq!(
            udp_reply((8000, 8001), (30000, 30001), 1),
            "RTP/AVP/UDP;unicast;client_port=8000-8001;server_port=30000-30001;ssrc=00000001"
        );
        assert_eq!(
            multicast_reply(
                Ipv4Addr::new(239, 0, 0, 1),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                (30002, 30003),
                64,
                2
            ),
            "RTP/AVP;multicast;destination=239.0.0.1;source=127.0.0.1;port=30002-30003;ttl=64;ssrc=00000002"
        );
    }
}
