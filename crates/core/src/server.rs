use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Result, RtspError};
use crate::hooks::Hooks;
use crate::muxer::{MultiSourceMuxer, MuxerOptions, SinkFactory};
use crate::protocol::sdp::SdpOrigin;
use crate::session::TunnelTable;
use crate::source::identity::DEFAULT_VHOST;
use crate::source::{MediaRegistry, StreamIdentity};
use crate::transport::multicast::MulticastManager;
use crate::transport::tcp;
use crate::transport::udp::UdpPortAllocator;

/// How often the manager thread expires pending source lookups.
const MANAGER_INTERVAL: Duration = Duration::from_millis(200);

/// Server-level configuration shared by every session.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// A publisher idle this long is dropped; UDP players get four times it.
    pub keep_alive_secs: u64,
    /// A connection that has not completed DESCRIBE/ANNOUNCE by then is dropped.
    pub handshake_secs: u64,
    /// Challenge with Basic instead of Digest.
    pub auth_basic: bool,
    /// Derive the vhost from `vhost=` or the URL host.
    pub enable_vhost: bool,
    /// Server RTP/RTCP ports for UDP sessions and multicast groups.
    pub udp_port_range: RangeInclusive<u16>,
    pub multicast_addr_range: RangeInclusive<Ipv4Addr>,
    pub multicast_ttl: u32,
    /// Sessions moving less than this are not reported to the flow hook.
    pub flow_threshold_kb: u64,
    /// Recorder defaults when no publish hook is registered.
    pub publish_to_hls: bool,
    pub publish_to_mp4: bool,
    pub modify_stamp: bool,
    pub stream_none_reader_delay_ms: u64,
    pub max_wait_track_ready_ms: u64,
    /// How long DESCRIBE waits for a stream to be published.
    pub find_async_timeout_ms: u64,
    /// `Server` header and RTCP CNAME.
    pub server_name: String,
    /// Public host advertised in generated SDP `o=` and `c=` lines.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 15,
            handshake_secs: 15,
            auth_basic: false,
            enable_vhost: false,
            udp_port_range: 30000..=35000,
            multicast_addr_range: Ipv4Addr::new(239, 0, 0, 0)..=Ipv4Addr::new(239, 255, 255, 255),
            multicast_ttl: 64,
            flow_threshold_kb: 1024,
            publish_to_hls: false,
            publish_to_mp4: false,
            modify_stamp: false,
            stream_none_reader_delay_ms: 20_000,
            max_wait_track_ready_ms: 10_000,
            find_async_timeout_ms: 5_000,
            server_name: "rtsp-relay".to_string(),
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Streamed by rtsp-relay".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn sdp_origin(&self) -> SdpOrigin {
        SdpOrigin {
            username: self.sdp_username.clone(),
            session_id: self.sdp_session_id.clone(),
            session_version: self.sdp_session_version.clone(),
            ip: self
                .public_host
                .clone()
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            session_name: self.sdp_session_name.clone(),
        }
    }

    /// Fan-out options for a stream produced outside an RTSP session.
    pub fn muxer_options(&self) -> MuxerOptions {
        MuxerOptions {
            enable_hls: self.publish_to_hls,
            enable_mp4: self.publish_to_mp4,
            modify_stamp: self.modify_stamp,
            max_wait_track_ready: Duration::from_millis(self.max_wait_track_ready_ms),
            stream_none_reader_delay: Duration::from_millis(self.stream_none_reader_delay_ms),
            sdp_origin: self.sdp_origin(),
            ..MuxerOptions::default()
        }
    }
}

/// Services every session of one server shares.
pub struct ServerContext {
    pub config: ServerConfig,
    pub hooks: Hooks,
    pub registry: Arc<MediaRegistry>,
    pub tunnels: TunnelTable,
    pub udp: Arc<UdpPortAllocator>,
    pub multicast: Arc<MulticastManager>,
    pub sink_factory: Option<Arc<dyn SinkFactory>>,
}

impl ServerContext {
    pub fn new(
        config: ServerConfig,
        hooks: Hooks,
        registry: Arc<MediaRegistry>,
        sink_factory: Option<Arc<dyn SinkFactory>>,
    ) -> Arc<Self> {
        let udp = Arc::new(UdpPortAllocator::new(config.udp_port_range.clone()));
        let multicast = MulticastManager::new(
            config.multicast_addr_range.clone(),
            config.multicast_ttl,
            udp.clone(),
        );
        Arc::new(Self {
            config,
            hooks,
            registry,
            tunnels: TunnelTable::new(),
            udp,
            multicast,
            sink_factory,
        })
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("tunnels", &self.tunnels.len())
            .finish()
    }
}

/// RTSP relay server.
///
/// Owns the stream registry and the shared session services. Delegates
/// TCP connection handling to [`transport::tcp`](crate::transport::tcp);
/// each connection runs an [`RtspSession`](crate::session::RtspSession).
pub struct Server {
    bind_addr: String,
    config: ServerConfig,
    hooks: Hooks,
    registry: Arc<MediaRegistry>,
    sink_factory: Option<Arc<dyn SinkFactory>>,
    running: Arc<AtomicBool>,
    context: Option<Arc<ServerContext>>,
}

impl Server {
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            config,
            hooks: Hooks::default(),
            registry: MediaRegistry::new(),
            sink_factory: None,
            running: Arc::new(AtomicBool::new(false)),
            context: None,
        }
    }

    /// Hooks apply to connections accepted after the next [`start`](Self::start).
    pub fn set_hooks(&mut self, hooks: Hooks) {
        self.hooks = hooks;
    }

    /// Builder for the RTMP/TS/FMP4 outputs and HLS/MP4 recorders.
    pub fn set_sink_factory(&mut self, factory: Arc<dyn SinkFactory>) {
        self.sink_factory = Some(factory);
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;

        let context = ServerContext::new(
            self.config.clone(),
            self.hooks.clone(),
            self.registry.clone(),
            self.sink_factory.clone(),
        );
        self.context = Some(context.clone());
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(addr = %self.bind_addr, "RTSP server listening");

        let running = self.running.clone();
        thread::Builder::new()
            .name("rtsp-accept".into())
            .spawn(move || tcp::accept_loop(listener, context, running))?;

        let running = self.running.clone();
        let registry = self.registry.clone();
        thread::Builder::new()
            .name("rtsp-manager".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    registry.expire_waiters(Instant::now());
                    thread::sleep(MANAGER_INTERVAL);
                }
            })?;

        Ok(())
    }

    /// Stop accepting, end every session and force-close every source.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.registry.clear();
        self.context = None;
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<MediaRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared services of the running server.
    pub fn context(&self) -> Result<Arc<ServerContext>> {
        self.context.clone().ok_or(RtspError::NotStarted)
    }

    /// Fan-out engine for a stream fed by the caller, registered in this
    /// server's directory once its tracks are complete.
    pub fn create_muxer(&self, app: &str, stream: &str) -> Arc<MultiSourceMuxer> {
        MultiSourceMuxer::new(
            StreamIdentity::new("", DEFAULT_VHOST, app, stream),
            self.config.muxer_options(),
            &self.registry,
            self.sink_factory.clone(),
        )
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
