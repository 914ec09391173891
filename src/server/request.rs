use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::debug;

use super::codec;
use super::response::Response;

/// A parsed request.
///
/// The connection handle is shared between the handler job and the eventual
/// response send; the socket closes when the last holder drops it.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub verb: String,
    pub path: String,
    pub content_type: String,
    pub content_length: usize,
    pub body: Vec<u8>,
    /// Decoded JSON body for structured-data requests.
    pub data: Value,
    pub connection: Option<Arc<Connection>>,
}

impl Request {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// String parameter from the JSON body, trimmed. Empty when absent.
    pub fn str_param(&self, name: &str) -> String {
        self.data
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    }

    pub fn bool_param(&self, name: &str, default: bool) -> bool {
        self.data
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    pub fn u64_param(&self, name: &str, default: u64) -> u64 {
        self.data
            .get(name)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    }

    /// Write `response` to the originating connection, if any.
    pub fn respond(&self, response: &Response) -> io::Result<()> {
        match &self.connection {
            Some(connection) => connection.send(response),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "request has no connection",
            )),
        }
    }
}

/// An accepted client socket. Shut down when dropped.
#[derive(Debug)]
pub struct Connection {
    stream: Mutex<TcpStream>,
    peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Mutex::new(stream),
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&self, response: &Response) -> io::Result<()> {
        let bytes = codec::build_response(&response.body, &response.content_type, response.status);
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(&bytes)?;
        stream.flush()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let stream = self.stream.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            debug!(peer = %self.peer, error = %e, "Connection already closed");
        }
    }
}
