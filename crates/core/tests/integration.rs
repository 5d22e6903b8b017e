//! Integration tests: a publisher and players talking to a running server
//! over real TCP connections.
//!
//! Each test starts its own server on a fixed loopback port.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use relay::media::{CodecId, Frame, Track};
use relay::{Server, ServerConfig};

const SDP: &str = "v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=cam\r\n\
    t=0 0\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=fmtp:96 packetization-mode=1\r\n\
    a=control:trackID=0\r\n\
    m=audio 0 RTP/AVP 8\r\n\
    a=rtpmap:8 PCMA/8000\r\n\
    a=control:trackID=1\r\n";

fn rtsp_request(stream: &mut TcpStream, request: &str) -> std::io::Result<String> {
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    if let Some(len) = response
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
        && len > 0
    {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        response.push_str(&String::from_utf8_lossy(&body));
    }

    Ok(response)
}

/// Read one `$`-framed packet: (channel, payload).
fn read_interleaved(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix)?;
    assert_eq!(prefix[0], b'$', "expected interleaved data, got {prefix:?}");
    let len = u16::from_be_bytes([prefix[2], prefix[3]]) as usize;
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data)?;
    Ok((prefix[1], data))
}

/// Read interleaved packets until one arrives on `channel`.
fn read_channel(stream: &mut TcpStream, channel: u8) -> Vec<u8> {
    for _ in 0..8 {
        let (ch, data) = read_interleaved(stream).expect("interleaved packet");
        if ch == channel {
            return data;
        }
    }
    panic!("nothing received on channel {channel}");
}

fn connect(bind: &str) -> TcpStream {
    let addr = bind.to_socket_addrs().unwrap().next().unwrap();
    let stream =
        TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect to server");
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    stream
        .set_write_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().find_map(|line| {
        line.split_once(':')
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
    })
}

fn session_id(response: &str) -> String {
    header(response, "Session")
        .and_then(|v| v.split(';').next())
        .unwrap_or("")
        .to_string()
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}

/// DESCRIBE, SETUP every track over TCP and PLAY. Returns the SDP.
fn play_over_tcp(stream: &mut TcpStream, uri: &str, tracks: usize) -> String {
    let desc_req = format!("DESCRIBE {uri} RTSP/1.0\r\nCSeq: 1\r\nAccept: application/sdp\r\n\r\n");
    let desc_resp = rtsp_request(stream, &desc_req).expect("DESCRIBE response");
    assert!(
        desc_resp.starts_with("RTSP/1.0 200 OK"),
        "DESCRIBE: expected 200 OK, got: {}",
        status_line(&desc_resp)
    );
    assert!(
        desc_resp.contains("Content-Type: application/sdp"),
        "DESCRIBE: missing Content-Type application/sdp"
    );
    let session = session_id(&desc_resp);
    assert!(!session.is_empty(), "DESCRIBE: could not parse Session id");

    for track in 0..tracks {
        let setup_req = format!(
            "SETUP {uri}/trackID={track} RTSP/1.0\r\nCSeq: {}\r\nSession: {session}\r\nTransport: RTP/AVP/TCP;unicast\r\n\r\n",
            2 + track
        );
        let setup_resp = rtsp_request(stream, &setup_req).expect("SETUP response");
        assert!(
            setup_resp.starts_with("RTSP/1.0 200 OK"),
            "SETUP: expected 200 OK, got: {}",
            status_line(&setup_resp)
        );
        let expected = format!("interleaved={}-{}", track * 2, track * 2 + 1);
        assert!(
            header(&setup_resp, "Transport").is_some_and(|t| t.contains(&expected)),
            "SETUP: expected {expected} in {setup_resp}"
        );
    }

    let play_req = format!("PLAY {uri} RTSP/1.0\r\nCSeq: 9\r\nSession: {session}\r\n\r\n");
    let play_resp = rtsp_request(stream, &play_req).expect("PLAY response");
    assert!(
        play_resp.starts_with("RTSP/1.0 200 OK"),
        "PLAY: expected 200 OK, got: {}",
        status_line(&play_resp)
    );
    assert!(play_resp.contains("RTP-Info:"), "PLAY: missing RTP-Info header");
    desc_resp
}

#[test]
fn options_lists_methods() {
    const BIND: &str = "127.0.0.1:18554";
    let mut server = Server::new(BIND);
    server.start().expect("server start");

    let mut stream = connect(BIND);
    let resp = rtsp_request(
        &mut stream,
        "OPTIONS rtsp://127.0.0.1:18554/live/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n",
    )
    .expect("OPTIONS response");
    assert!(
        resp.starts_with("RTSP/1.0 200 OK"),
        "OPTIONS: expected 200 OK, got: {}",
        status_line(&resp)
    );
    let public = header(&resp, "Public").expect("OPTIONS: missing Public header");
    for method in ["DESCRIBE", "ANNOUNCE", "RECORD", "PLAY", "TEARDOWN"] {
        assert!(public.contains(method), "OPTIONS: {method} not in {public}");
    }
    assert_eq!(header(&resp, "CSeq"), Some("1"));

    server.stop();
}

#[test]
fn publish_and_relay_to_player() {
    const BIND: &str = "127.0.0.1:18555";
    let mut server = Server::new(BIND);
    server.start().expect("server start");
    let uri = "rtsp://127.0.0.1:18555/live/cam";

    let mut pusher = connect(BIND);
    let announce = format!(
        "ANNOUNCE {uri} RTSP/1.0\r\nCSeq: 1\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{SDP}",
        SDP.len()
    );
    let resp = rtsp_request(&mut pusher, &announce).expect("ANNOUNCE response");
    assert!(
        resp.starts_with("RTSP/1.0 200 OK"),
        "ANNOUNCE: expected 200 OK, got: {}",
        status_line(&resp)
    );
    let session = session_id(&resp);

    for track in 0..2 {
        let setup = format!(
            "SETUP {uri}/trackID={track} RTSP/1.0\r\nCSeq: {}\r\nSession: {session}\r\nTransport: RTP/AVP/TCP;unicast;interleaved={}-{}\r\n\r\n",
            2 + track,
            track * 2,
            track * 2 + 1
        );
        let resp = rtsp_request(&mut pusher, &setup).expect("SETUP response");
        assert!(resp.starts_with("RTSP/1.0 200 OK"), "SETUP: {resp}");
    }
    let record = format!("RECORD {uri} RTSP/1.0\r\nCSeq: 4\r\nSession: {session}\r\n\r\n");
    let resp = rtsp_request(&mut pusher, &record).expect("RECORD response");
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "RECORD: {resp}");
    assert!(resp.contains("RTP-Info: url="), "RECORD: missing RTP-Info");

    // a second publisher for the same stream is refused
    let mut rival = connect(BIND);
    let resp = rtsp_request(&mut rival, &announce).expect("ANNOUNCE response");
    assert!(resp.starts_with("RTSP/1.0 406"), "second ANNOUNCE: {resp}");

    let mut player = connect(BIND);
    let sdp = play_over_tcp(&mut player, uri, 2);
    assert!(sdp.contains("a=rtpmap:8 PCMA/8000"), "DESCRIBE: {sdp}");

    // one PCMA packet from the publisher on the audio channel
    let mut rtp = vec![0x80, 0x88, 0x00, 0x01, 0x00, 0x00, 0x00, 0xa0, 0x00, 0x00, 0x12, 0x34];
    rtp.extend_from_slice(&[0xd5; 160]);
    let mut framed = vec![b'$', 2];
    framed.extend_from_slice(&(rtp.len() as u16).to_be_bytes());
    framed.extend_from_slice(&rtp);
    pusher.write_all(&framed).unwrap();
    pusher.flush().unwrap();

    let relayed = read_channel(&mut player, 2);
    assert_eq!(relayed, rtp);

    server.stop();
}

#[test]
fn muxer_fed_stream_is_playable() {
    const BIND: &str = "127.0.0.1:18556";
    let mut server = Server::new(BIND);
    server.start().expect("server start");

    let muxer = server.create_muxer("live", "mic");
    assert!(muxer.add_track(Arc::new(Track::audio(CodecId::G711A, 8000, 1, 16).ready())));
    muxer.add_track_completed();

    let mut player = connect(BIND);
    let sdp = play_over_tcp(&mut player, "rtsp://127.0.0.1:18556/live/mic", 1);
    assert!(sdp.contains("m=audio 0 RTP/AVP 8"), "DESCRIBE: {sdp}");

    assert!(muxer.input_frame(&Frame::new(CodecId::G711A, 0, 0, vec![0xd5; 160])));
    let rtp = read_channel(&mut player, 0);
    assert_eq!(rtp[0] >> 6, 2, "RTP version");
    assert_eq!(rtp[1] & 0x7f, 8, "PCMA payload type");
    assert_eq!(&rtp[12..], &[0xd5; 160][..]);

    server.stop();
}

#[test]
fn describe_unknown_stream_is_not_found() {
    const BIND: &str = "127.0.0.1:18557";
    let config = ServerConfig {
        find_async_timeout_ms: 300,
        ..ServerConfig::default()
    };
    let mut server = Server::with_config(BIND, config);
    server.start().expect("server start");

    let mut stream = connect(BIND);
    let resp = rtsp_request(
        &mut stream,
        "DESCRIBE rtsp://127.0.0.1:18557/live/none RTSP/1.0\r\nCSeq: 1\r\n\r\n",
    )
    .expect("DESCRIBE response");
    assert!(
        resp.starts_with("RTSP/1.0 404"),
        "DESCRIBE: expected 404, got: {}",
        status_line(&resp)
    );
    assert_eq!(header(&resp, "Connection"), Some("Close"));

    server.stop();
}
