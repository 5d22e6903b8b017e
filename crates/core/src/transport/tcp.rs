use std::io::Read;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use crate::server::ServerContext;
use crate::session::{RtspSession, SessionEvent, SessionHandle};

const READ_BUFFER: usize = 16 * 1024;

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub fn accept_loop(listener: TcpListener, context: Arc<ServerContext>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let ctx = context.clone();
                let r = running.clone();
                thread::spawn(move || {
                    Connection::handle(stream, ctx, r);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single client connection: a reader thread feeding the session queue
/// and the session itself on the connection thread.
struct Connection;

impl Connection {
    fn handle(stream: TcpStream, context: Arc<ServerContext>, running: Arc<AtomicBool>) {
        let (peer_addr, local_addr) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(peer), Ok(local)) => (peer, local),
            _ => return,
        };
        let _ = stream.set_nodelay(true);

        tracing::info!(%peer_addr, "client connected");

        let (reader, writer) = match (stream.try_clone(), stream.try_clone()) {
            (Ok(r), Ok(w)) => (r, w),
            _ => return,
        };

        let (session, events) = RtspSession::new(context, peer_addr, local_addr, Box::new(writer));
        let handle = session.handle();
        if let Err(e) = thread::Builder::new()
            .name(format!("rtsp-read-{}", handle.id()))
            .spawn(move || read_loop(reader, handle))
        {
            tracing::warn!(%peer_addr, error = %e, "can not spawn reader thread");
            return;
        }

        session.run(events, &running);
        // unblocks the reader thread
        let _ = stream.shutdown(Shutdown::Both);
        tracing::info!(%peer_addr, "client disconnected");
    }
}

fn read_loop(mut stream: TcpStream, session: SessionHandle) {
    let mut buf = vec![0u8; READ_BUFFER];
    let reason = loop {
        match stream.read(&mut buf) {
            Ok(0) => break "connection closed by client".to_string(),
            Ok(n) => {
                if !session.post(SessionEvent::Data(Bytes::copy_from_slice(&buf[..n]))) {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => break format!("read error: {e}"),
        }
    };
    session.shutdown(reason);
}
