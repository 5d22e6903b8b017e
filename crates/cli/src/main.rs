use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use clap::Parser;
use relay::hooks::{FlowReport, Hooks};
use relay::{Server, ServerConfig};

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    about = "RTSP relay: publish with ANNOUNCE/RECORD, play with DESCRIBE/PLAY"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Seconds a publisher may stay silent before it is dropped
    #[arg(long, default_value_t = 15)]
    keep_alive: u64,

    /// Seconds a connection has to finish DESCRIBE or ANNOUNCE
    #[arg(long, default_value_t = 15)]
    handshake: u64,

    /// Challenge with Basic instead of Digest authentication
    #[arg(long)]
    auth_basic: bool,

    /// Resolve virtual hosts from the URL host or `vhost=` parameter
    #[arg(long)]
    enable_vhost: bool,

    /// First server port for RTP over UDP
    #[arg(long, default_value_t = 30000)]
    udp_port_min: u16,

    /// Last server port for RTP over UDP
    #[arg(long, default_value_t = 35000)]
    udp_port_max: u16,

    /// First multicast group address
    #[arg(long, default_value_t = Ipv4Addr::new(239, 0, 0, 0))]
    multicast_min: Ipv4Addr,

    /// Last multicast group address
    #[arg(long, default_value_t = Ipv4Addr::new(239, 255, 255, 255))]
    multicast_max: Ipv4Addr,

    #[arg(long, default_value_t = 64)]
    multicast_ttl: u32,

    /// Log sessions that moved at least this many KiB
    #[arg(long, default_value_t = 1024)]
    flow_threshold_kb: u64,

    /// Milliseconds DESCRIBE waits for a stream to be published
    #[arg(long, default_value_t = 5000)]
    find_timeout_ms: u64,

    /// Host advertised in generated SDP
    #[arg(long)]
    public_host: Option<String>,

    /// `Server` header and RTCP CNAME
    #[arg(long, default_value = "rtsp-relay")]
    server_name: String,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            keep_alive_secs: self.keep_alive,
            handshake_secs: self.handshake,
            auth_basic: self.auth_basic,
            enable_vhost: self.enable_vhost,
            udp_port_range: self.udp_port_min..=self.udp_port_max,
            multicast_addr_range: self.multicast_min..=self.multicast_max,
            multicast_ttl: self.multicast_ttl,
            flow_threshold_kb: self.flow_threshold_kb,
            find_async_timeout_ms: self.find_timeout_ms,
            public_host: self.public_host.clone(),
            server_name: self.server_name.clone(),
            ..ServerConfig::default()
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut server = Server::with_config(&args.bind, args.config());
    server.set_hooks(Hooks {
        on_flow_report: Some(Arc::new(|report: &FlowReport| {
            tracing::info!(
                stream = %report.info.identity(relay::source::identity::RTSP_SCHEMA),
                peer = %report.peer,
                bytes = report.total_bytes,
                secs = report.duration.as_secs(),
                player = report.is_player,
                "flow report"
            );
        })),
        ..Hooks::default()
    });

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return;
    }

    println!("RTSP relay on {} (press Enter to stop)", args.bind);
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "stdin closed");
    }

    server.stop();
}
