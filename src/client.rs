// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Client connection: a long-lived outbound TCP connection with a
//! background receive loop and heartbeat loop, a monotonic request-id
//! counter, and a delivery queue that hands `Response`s and telnet lines
//! back to whichever call is waiting for them.

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::frame::{self, HeartbeatRequest, HeartbeatResponse, Message, Request, Response};
use crate::hessian::Value;
use crate::Error;

/// `sendRequestAndAwait`'s default wait.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the heartbeat loop sends a one-way heartbeat.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

enum Delivery {
    Response(Response),
    Telnet(Vec<u8>),
}

/// A handle to the connection's serialised write half: all sends to the
/// underlying socket go through this lock. Cheap to clone and shared
/// between the caller-facing send methods, the receive loop's
/// heartbeat-reply path, and the heartbeat loop.
#[derive(Clone)]
struct WriteHandle(Arc<Mutex<TcpStream>>);

impl WriteHandle {
    fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut stream = self.0.lock().unwrap();
        stream.write_all(bytes)
    }
}

/// Builder for [`ClientConnection`]: named-parameter construction rather
/// than positional magic numbers for the two timing knobs tests need to
/// override.
pub struct ClientConnectionBuilder {
    dubbo_version: String,
    recv_timeout: Duration,
    heartbeat_interval: Duration,
}

impl ClientConnectionBuilder {
    pub fn new(dubbo_version: impl Into<String>) -> Self {
        ClientConnectionBuilder {
            dubbo_version: dubbo_version.into(),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Connects to `addr` and starts the receive loop and heartbeat loop
    /// threads as soon as the socket is up.
    pub fn connect(self, addr: impl ToSocketAddrs) -> std::io::Result<ClientConnection> {
        let stream = TcpStream::connect(addr)?;
        let read_half = stream.try_clone()?;
        let write_half = WriteHandle(Arc::new(Mutex::new(stream)));

        let (tx, rx) = mpsc::channel();

        spawn_recv_loop(read_half, tx, write_half.clone());
        spawn_heartbeat_loop(write_half.clone(), self.heartbeat_interval);

        Ok(ClientConnection {
            write_half,
            next_id: AtomicU64::new(1),
            inbox: rx,
            dubbo_version: self.dubbo_version,
            recv_timeout: self.recv_timeout,
        })
    }
}

/// Outbound TCP connection to a Dubbo provider.
pub struct ClientConnection {
    write_half: WriteHandle,
    next_id: AtomicU64,
    inbox: Receiver<Delivery>,
    dubbo_version: String,
    recv_timeout: Duration,
}

impl ClientConnection {
    /// Connects with the default timeouts; use [`ClientConnectionBuilder`]
    /// to override them.
    pub fn connect(
        addr: impl ToSocketAddrs,
        dubbo_version: impl Into<String>,
    ) -> std::io::Result<Self> {
        ClientConnectionBuilder::new(dubbo_version).connect(addr)
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn write_frame(&self, bytes: &[u8]) -> Result<(), Error> {
        self.write_half
            .send(bytes)
            .map_err(|_| Error::ConnectionClosed)
    }

    /// `sendRequestAndAwait`: encodes and writes a two-way request, then
    /// blocks up to the connection's default timeout for the matching
    /// response.
    #[allow(clippy::too_many_arguments)]
    pub fn send_request_and_await(
        &self,
        service_name: &str,
        service_version: &str,
        method_name: &str,
        args: Vec<Value>,
        attachment: Vec<(Value, Value)>,
    ) -> Result<Response, Error> {
        self.send_request_and_await_timeout(
            service_name,
            service_version,
            method_name,
            args,
            attachment,
            self.recv_timeout,
        )
    }

    /// Same as [`Self::send_request_and_await`] with an explicit timeout.
    #[allow(clippy::too_many_arguments)]
    pub fn send_request_and_await_timeout(
        &self,
        service_name: &str,
        service_version: &str,
        method_name: &str,
        args: Vec<Value>,
        attachment: Vec<(Value, Value)>,
        timeout: Duration,
    ) -> Result<Response, Error> {
        let id = self.next_request_id();
        let request = Request {
            id,
            twoway: true,
            dubbo_version: self.dubbo_version.clone(),
            service_name: service_name.to_string(),
            service_version: service_version.to_string(),
            method_name: method_name.to_string(),
            args,
            attachment,
        };
        self.write_frame(&request.encode()?)?;

        match self.inbox.recv_timeout(timeout) {
            Ok(Delivery::Response(resp)) => Ok(resp),
            Ok(Delivery::Telnet(_)) => {
                // A telnet line arriving while a call is in flight means the
                // two side channels interleaved; the queue is strictly FIFO,
                // so this is surfaced as a timeout rather than silently
                // dropped.
                Err(Error::Timeout)
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    /// `sendRequestFireAndForget`: one-way request, no wait.
    pub fn send_request_fire_and_forget(
        &self,
        service_name: &str,
        service_version: &str,
        method_name: &str,
        args: Vec<Value>,
        attachment: Vec<(Value, Value)>,
    ) -> Result<(), Error> {
        let id = self.next_request_id();
        let request = Request {
            id,
            twoway: false,
            dubbo_version: self.dubbo_version.clone(),
            service_name: service_name.to_string(),
            service_version: service_version.to_string(),
            method_name: method_name.to_string(),
            args,
            attachment,
        };
        self.write_frame(&request.encode()?)
    }

    /// `listServices`: sends the telnet `ls` command and returns the
    /// reply split into lines.
    pub fn list_services(&self) -> Result<Vec<String>, Error> {
        self.execute_telnet_command("ls\n")
    }

    /// `listMethods`: `ls <serviceName>`.
    pub fn list_methods(&self, service_name: &str) -> Result<Vec<String>, Error> {
        self.execute_telnet_command(&format!("ls {service_name}\n"))
    }

    fn execute_telnet_command(&self, command: &str) -> Result<Vec<String>, Error> {
        self.write_frame(command.as_bytes())?;
        match self.inbox.recv_timeout(self.recv_timeout) {
            Ok(Delivery::Telnet(raw)) => Ok(frame::telnet_lines(&raw)),
            Ok(Delivery::Response(_)) => Err(Error::Timeout),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    /// One-shot framing helpers, mostly useful for tests that want to
    /// drive the wire protocol directly.
    pub fn send_heartbeat_request(&self, id: u64) -> Result<(), Error> {
        let hb = HeartbeatRequest {
            id,
            data: None,
            twoway: false,
        };
        self.write_frame(&hb.encode()?)
    }

    pub fn send_heartbeat_response(&self, id: u64) -> Result<(), Error> {
        let hb = HeartbeatResponse { id, data: None };
        self.write_frame(&hb.encode()?)
    }
}

fn spawn_recv_loop(mut read_half: TcpStream, tx: Sender<Delivery>, writer: WriteHandle) {
    thread::spawn(move || loop {
        match frame::decode_message(&mut read_half) {
            Ok(Message::HeartbeatRequest(hb)) => {
                if hb.twoway {
                    debug!("reply heartbeat message");
                    let reply = HeartbeatResponse {
                        id: hb.id,
                        data: None,
                    };
                    if let Ok(bytes) = reply.encode() {
                        let _ = writer.send(&bytes);
                    }
                } else {
                    warn!("skip heartbeat request message not twoway");
                }
            }
            Ok(Message::HeartbeatResponse(_)) => {
                warn!("skip heartbeat response message");
            }
            Ok(Message::Response(resp)) => {
                if tx.send(Delivery::Response(resp)).is_err() {
                    return;
                }
            }
            Ok(Message::TelnetLine(raw)) => {
                if tx.send(Delivery::Telnet(raw)).is_err() {
                    return;
                }
            }
            Ok(Message::Request(_)) => {
                warn!("unexpected request message on client connection, dropping");
            }
            Err(_) => {
                warn!("got EOF error, stop recv loop!");
                return;
            }
        }
    });
}

fn spawn_heartbeat_loop(writer: WriteHandle, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        debug!("send heartbeat msg to provider");
        let id = HEARTBEAT_ID.fetch_add(1, Ordering::Relaxed);
        let hb = HeartbeatRequest {
            id,
            data: None,
            twoway: false,
        };
        let bytes = match hb.encode() {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        if writer.send(&bytes).is_err() {
            warn!("got EOF error, stop heartbeat loop!");
            return;
        }
    });
}

/// The heartbeat loop's own id sequence, kept separate from
/// `ClientConnection::next_id` since it runs on its own thread,
/// independent of the request-id counter used for calls.
static HEARTBEAT_ID: AtomicU64 = AtomicU64::new(1);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn connect_and_fire_and_forget_reaches_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; 16];
            stream.read_exact(&mut header).unwrap();
            let body_len = u32::from_be_bytes(header[12..16].try_into().unwrap()) as usize;
            let mut body = vec![0u8; body_len];
            stream.read_exact(&mut body).unwrap();
            header
        });

        let client = ClientConnectionBuilder::new("2.5.3")
            .with_heartbeat_interval(Duration::from_secs(3600))
            .connect(addr)
            .unwrap();
        client
            .send_request_fire_and_forget("calc", "1.0", "exp", vec![Value::Int(4)], vec![])
            .unwrap();

        let header = server.join().unwrap();
        assert_eq!(&header[0..2], &[0xda, 0xbb]);
        assert_eq!(header[2] & 0x80, 0x80); // request bit set
        assert_eq!(header[2] & 0x40, 0); // one-way
    }
}
