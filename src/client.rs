//! Client for a running automation server.
//!
//! Opens one connection per request, writes it, half-closes, and reads the
//! response until the server closes the socket.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::server::codec::{self, JSON_CONTENT_TYPE, SCRIPT_CONTENT_TYPE};
use crate::server::run_file::{RunFile, RunFileError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to automation server")]
    Connect(#[source] std::io::Error),

    #[error("communication error")]
    Io(#[source] std::io::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("malformed response")]
    Malformed,

    #[error("failed to encode or decode JSON")]
    Json(#[from] serde_json::Error),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error(transparent)]
    RunFile(#[from] RunFileError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    pub fn json(&self) -> Result<Value, ClientError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The `result` member of a successful JSON response.
    ///
    /// Non-200 responses become [`ClientError::Server`] carrying the `error`
    /// member (or the raw body when it is not JSON).
    pub fn result<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        if !self.is_success() {
            let message = self
                .json()
                .ok()
                .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&self.body).into_owned());
            return Err(ClientError::Server {
                status: self.status,
                message,
            });
        }

        let mut body = self.json()?;
        let result = body.get_mut("result").map(Value::take).unwrap_or(Value::Null);
        Ok(serde_json::from_value(result)?)
    }
}

pub struct ProbeClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl ProbeClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Connect to the loopback port recorded in a run file.
    pub fn from_run_file(path: &Path) -> Result<Self, ClientError> {
        let info = RunFile::read(path)?;
        Ok(Self::new(SocketAddr::from(([127, 0, 0, 1], info.port))))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// POST `params` as JSON to `path`.
    pub async fn call(&self, path: &str, params: &Value) -> Result<ProbeResponse, ClientError> {
        let body = serde_json::to_vec(params)?;
        self.send(path, JSON_CONTENT_TYPE, &body).await
    }

    pub async fn run_script(&self, source: &str) -> Result<ProbeResponse, ClientError> {
        self.send("/", SCRIPT_CONTENT_TYPE, source.as_bytes()).await
    }

    async fn send(&self, path: &str, content_type: &str, body: &[u8]) -> Result<ProbeResponse, ClientError> {
        let mut request = format!(
            "POST {path} HTTP/1.1\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);
        self.send_raw(&request).await
    }

    /// Send pre-framed bytes and parse whatever comes back.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<ProbeResponse, ClientError> {
        let exchange = async {
            let mut stream = TcpStream::connect(self.addr).await.map_err(ClientError::Connect)?;
            stream.write_all(bytes).await.map_err(ClientError::Io)?;
            stream.shutdown().await.map_err(ClientError::Io)?;

            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await.map_err(ClientError::Io)?;
            Ok::<_, ClientError>(raw)
        };

        let raw = timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        debug!(addr = %self.addr, bytes = raw.len(), "Response received");

        let parsed = codec::parse_response(&raw).ok_or(ClientError::Malformed)?;
        Ok(ProbeResponse {
            status: parsed.status,
            content_type: parsed.content_type,
            body: parsed.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(status: u16, body: Value) -> ProbeResponse {
        ProbeResponse {
            status,
            content_type: JSON_CONTENT_TYPE.to_string(),
            body: body.to_string().into_bytes(),
        }
    }

    #[test]
    fn result_unwraps_success() {
        let ok = response(200, json!({ "result": { "id": "ok" } }));
        let value: Value = ok.result().unwrap();
        assert_eq!(value["id"], "ok");

        let flag: bool = response(200, json!({ "result": true })).result().unwrap();
        assert!(flag);
    }

    #[test]
    fn result_surfaces_server_error() {
        let err = response(404, json!({ "error": "path not found" }))
            .result::<Value>()
            .unwrap_err();
        match err {
            ClientError::Server { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "path not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn from_run_file_reads_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uiprobe.run");
        let _run_file = RunFile::create(&path, 8123).unwrap();

        let client = ProbeClient::from_run_file(&path).unwrap();
        assert_eq!(client.addr().port(), 8123);
    }
}
