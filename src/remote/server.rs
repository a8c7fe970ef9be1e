//! Blocking policy server: one thread per client, one shared policy.

use std::{
    io::ErrorKind,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::error::RemoteError;
use crate::remote::codec::{recv_json, send_json};
use crate::remote::protocol::{Policy, PolicyError, Request, Response, dispatch, traceback};

const ACCEPT_POLL_MS: u64 = 10;

pub struct PolicyServer<P: Policy + 'static> {
    listener: TcpListener,
    policy: Arc<Mutex<P>>,
}

impl<P: Policy + 'static> PolicyServer<P> {
    pub fn bind<A: ToSocketAddrs>(addr: A, policy: P) -> Result<Self, RemoteError> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            policy: Arc::new(Mutex::new(policy)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RemoteError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop on a background thread.
    pub fn spawn(self) -> Result<ServerHandle, RemoteError> {
        let addr = self.local_addr()?;
        self.listener.set_nonblocking(true)?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("policy-server".into())
            .spawn(move || self.accept_loop(&flag))?;
        info!("[PolicyServer] listening on {}", addr);
        Ok(ServerHandle {
            addr,
            running,
            handle: Some(handle),
        })
    }

    fn accept_loop(self, running: &AtomicBool) {
        let mut clients: Vec<JoinHandle<()>> = Vec::new();
        while running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!("[PolicyServer] client connected: {}", peer);
                    let policy = self.policy.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("policy-client-{peer}"))
                        .spawn(move || serve_client(stream, policy));
                    match spawned {
                        Ok(h) => clients.push(h),
                        Err(e) => error!("[PolicyServer] cannot serve {}: {}", peer, e),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
                }
                Err(e) => {
                    warn!("[PolicyServer] accept failed: {}", e);
                    thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
                }
            }
            clients.retain(|h| !h.is_finished());
        }
        debug!("[PolicyServer] accept loop exiting, {} clients still open", clients.len());
    }
}

fn serve_client<P: Policy>(mut stream: TcpStream, policy: Arc<Mutex<P>>) {
    if let Err(e) = stream.set_nonblocking(false) {
        error!("[PolicyServer] cannot configure client socket: {}", e);
        return;
    }
    loop {
        let request: Request = match recv_json(&mut stream) {
            Ok(r) => r,
            Err(RemoteError::Closed) => {
                debug!("[PolicyServer] client disconnected");
                return;
            }
            Err(e) => {
                warn!("[PolicyServer] bad request: {}", e);
                let _ = send_json(&mut stream, &error_response(&e));
                return;
            }
        };

        let outcome: Result<serde_json::Value, PolicyError> = match request.command() {
            Ok(cmd) => dispatch(&mut *policy.lock(), cmd, request.obs),
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(res) => {
                if let Err(e) = send_json(&mut stream, &Response::Ok { res }) {
                    warn!("[PolicyServer] reply failed: {}", e);
                    return;
                }
            }
            Err(e) => {
                error!("[PolicyServer] '{}' failed: {}", request.cmd, e);
                let _ = send_json(&mut stream, &error_response(e.as_ref()));
                return;
            }
        }
    }
}

fn error_response(e: &(dyn std::error::Error + 'static)) -> Response {
    Response::Error {
        error: e.to_string(),
        traceback: traceback(e),
    }
}

/// Owner of a running server thread.
pub struct ServerHandle {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting; connected clients are served until they disconnect.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                error!("[PolicyServer] accept thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
