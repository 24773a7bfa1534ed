// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Server connection: a `(service, method) -> handler` registry, one
//! accept loop, and one handler thread plus one heartbeat thread per
//! accepted connection.

use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::frame::{self, HeartbeatResponse, Message, Response};
use crate::hessian::Value;
use crate::status;

/// How often a connection's heartbeat loop sends a two-way heartbeat to
/// the peer.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// A domain error a handler raises to control the response status and
/// error payload directly. Any other error a handler returns is mapped to
/// [`status::UNKNOWN_ERROR`] with the error's rendered text as the
/// payload.
#[derive(Debug, Clone)]
pub struct DubboError {
    pub status: u8,
    pub message: String,
}

impl DubboError {
    pub fn new(status: u8, message: impl Into<String>) -> Self {
        DubboError {
            status,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DubboError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dubbo error {}: {}", self.status, self.message)
    }
}

impl std::error::Error for DubboError {}

/// What a handler returns: the value a normal response carries, or a
/// boxed error. A plain `DubboError` is downcast specially so its status
/// code survives into the response; anything else becomes status 90.
pub type HandlerResult = Result<Value, Box<dyn std::error::Error + Send + Sync>>;

/// An opaque service-method implementation, invoked with the request's
/// positional arguments.
pub type Handler = Box<dyn Fn(&[Value]) -> HandlerResult + Send + Sync>;

/// `services: map serviceName -> (map methodName -> handler)`. Built once
/// via [`ServerBuilder`] and then treated as read-only for the lifetime of
/// the server.
struct Registry {
    services: HashMap<String, HashMap<String, Handler>>,
}

impl Registry {
    fn lookup(&self, service: &str, method: &str) -> Option<&Handler> {
        self.services.get(service)?.get(method)
    }
}

/// Accumulates `(service, method) -> handler` entries before `start()`.
pub struct ServerBuilder {
    services: HashMap<String, HashMap<String, Handler>>,
    heartbeat_interval: Duration,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        ServerBuilder {
            services: HashMap::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Registers a handler for `service.method`. A later call for the
    /// same pair replaces the earlier one.
    pub fn register(
        mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        handler: impl Fn(&[Value]) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.services
            .entry(service.into())
            .or_default()
            .insert(method.into(), Box::new(handler));
        self
    }

    /// Accepts connections on `listener` in a background thread, spawning
    /// one handler thread (plus one heartbeat thread) per accepted
    /// connection.
    pub fn start(self, listener: TcpListener) -> Server {
        let registry = Arc::new(Registry {
            services: self.services,
        });
        let heartbeat_interval = self.heartbeat_interval;
        let local_addr = listener.local_addr().ok();

        let accept_thread = thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let registry = Arc::clone(&registry);
                        thread::spawn(move || {
                            handle_connection(stream, registry, heartbeat_interval)
                        });
                    }
                    Err(e) => warn!("error accepting connection: {e}"),
                }
            }
        });

        Server {
            accept_thread: Some(accept_thread),
            local_addr,
        }
    }
}

/// A running server. Dropping it does not stop the accept loop (there is
/// no portable way to interrupt a blocking `accept()` without closing the
/// listener, which the caller holds the address of, not the listener
/// itself, once `start()` is called); shutdown is cooperative via process
/// exit or by closing the listening socket externally if the caller kept
/// a clone of it.
pub struct Server {
    accept_thread: Option<thread::JoinHandle<()>>,
    local_addr: Option<std::net::SocketAddr>,
}

impl Server {
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }

    /// Blocks until the accept loop exits (only happens if the listener
    /// itself errors out permanently).
    pub fn join(mut self) {
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(stream: TcpStream, registry: Arc<Registry>, heartbeat_interval: Duration) {
    let mut read_half = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to clone connection for reading: {e}");
            return;
        }
    };
    let write_half = Arc::new(Mutex::new(stream));

    {
        let write_half = Arc::clone(&write_half);
        thread::spawn(move || heartbeat_loop(write_half, heartbeat_interval));
    }

    loop {
        let message = match frame::decode_message(&mut read_half) {
            Ok(message) => message,
            Err(_) => {
                debug!("connection closed, shutting down handler loop");
                let stream = write_half.lock().unwrap();
                let _ = stream.shutdown(std::net::Shutdown::Both);
                return;
            }
        };
        trace!("got message {message:?}");

        match message {
            Message::HeartbeatRequest(hb) => {
                let reply = HeartbeatResponse {
                    id: hb.id,
                    data: None,
                };
                if let Ok(bytes) = reply.encode() {
                    if write_all(&write_half, &bytes).is_err() {
                        return;
                    }
                }
            }
            Message::HeartbeatResponse(_) => {
                debug!("skip heartbeat response message");
            }
            Message::Request(req) => {
                let handler = registry.lookup(&req.service_name, &req.method_name);
                let Some(handler) = handler else {
                    // A missing handler is logged and the message is
                    // dropped, not replied to.
                    warn!(
                        "no handler for {}.{}",
                        req.service_name, req.method_name
                    );
                    continue;
                };
                if !req.twoway {
                    let _ = handler(&req.args);
                    continue;
                }
                let response = match handler(&req.args) {
                    Ok(value) => Response {
                        id: req.id,
                        status: status::OK,
                        data: Some(value),
                        error: None,
                    },
                    Err(err) => response_for_error(req.id, err.as_ref()),
                };
                match response.encode() {
                    Ok(bytes) => {
                        if write_all(&write_half, &bytes).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("failed to encode response: {e}"),
                }
            }
            Message::TelnetLine(_) => {
                debug!("telnet command on a request/response connection, ignoring");
            }
        }
    }
}

fn response_for_error(id: u64, err: &(dyn std::error::Error + Send + Sync)) -> Response {
    if let Some(domain) = err.downcast_ref::<DubboError>() {
        Response {
            id,
            status: domain.status,
            data: None,
            error: Some(Value::String(domain.message.clone())),
        }
    } else {
        Response {
            id,
            status: status::UNKNOWN_ERROR,
            data: None,
            error: Some(Value::String(err.to_string())),
        }
    }
}

fn write_all(write_half: &Arc<Mutex<TcpStream>>, bytes: &[u8]) -> std::io::Result<()> {
    let mut stream = write_half.lock().unwrap();
    stream.write_all(bytes)
}

fn heartbeat_loop(write_half: Arc<Mutex<TcpStream>>, interval: Duration) {
    let mut next_id: u64 = 1;
    loop {
        thread::sleep(interval);
        debug!("send heartbeat msg to consumer");
        let hb = crate::frame::HeartbeatRequest {
            id: next_id,
            data: None,
            twoway: true,
        };
        next_id += 1;
        let bytes = match hb.encode() {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        if write_all(&write_half, &bytes).is_err() {
            warn!("got EOF error, stop heartbeat loop!");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConnectionBuilder;
    use std::time::Duration;

    fn domain_error(status: u8, message: &str) -> Box<dyn std::error::Error + Send + Sync> {
        Box::new(DubboError::new(status, message))
    }

    fn bad_args() -> Box<dyn std::error::Error + Send + Sync> {
        domain_error(40, "bad args")
    }

    #[test]
    fn request_response_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let _server = ServerBuilder::new()
            .with_heartbeat_interval(Duration::from_secs(3600))
            .register("calc", "exp", |args| match args.first() {
                Some(Value::Int(n)) => Ok(Value::Int(n * n)),
                _ => Err(bad_args()),
            })
            .register("calc", "divide", |args| match (args.first(), args.get(1)) {
                (Some(Value::Int(a)), Some(Value::Int(b))) if *b != 0 => {
                    Ok(Value::Double(*a as f64 / *b as f64))
                }
                (Some(Value::Int(_)), Some(Value::Int(0))) => {
                    Err(domain_error(40, "divide by zero"))
                }
                _ => Err(bad_args()),
            })
            .start(listener);

        let client = ClientConnectionBuilder::new("2.5.3")
            .with_heartbeat_interval(Duration::from_secs(3600))
            .connect(addr)
            .unwrap();

        let resp = client
            .send_request_and_await("calc", "1.0", "exp", vec![Value::Int(4)], vec![])
            .unwrap();
        assert!(resp.ok());
        assert_eq!(resp.data, Some(Value::Int(16)));

        let resp = client
            .send_request_and_await(
                "calc",
                "1.0",
                "divide",
                vec![Value::Int(3), Value::Int(0)],
                vec![],
            )
            .unwrap();
        assert!(!resp.ok());
        assert_eq!(resp.status, 40);
        assert_eq!(resp.error_message().unwrap(), "divide by zero");
    }

    #[test]
    fn missing_handler_is_dropped_not_errored() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let _server = ServerBuilder::new()
            .with_heartbeat_interval(Duration::from_secs(3600))
            .start(listener);

        let client = ClientConnectionBuilder::new("2.5.3")
            .with_heartbeat_interval(Duration::from_secs(3600))
            .with_recv_timeout(Duration::from_millis(200))
            .connect(addr)
            .unwrap();

        let result = client.send_request_and_await("nope", "1.0", "missing", vec![], vec![]);
        assert!(matches!(result, Err(crate::Error::Timeout)));
    }
}
