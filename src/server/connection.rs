//! Per-connection handling.
//!
//! Runs inline on the accept loop: wait for the client to become readable,
//! read until the request is complete or the client goes idle, parse, then
//! either hand the request to the worker pool or answer with an error.
//! Handlers never run here.

use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{Instrument, Span, debug, error, info_span, warn};
use uuid::Uuid;

use super::codec::{self, JSON_CONTENT_TYPE, RequestFraming, SCRIPT_CONTENT_TYPE};
use super::endpoints::EndpointRegistry;
use super::request::{Connection, Request};
use super::response::Response;
use super::worker_pool::PoolHandle;
use crate::config::ServerConfig;
use crate::script::ScriptBridge;

pub const FAILED_SYNCING: &str = "failed syncing with connection reading";
pub const EMPTY_PAYLOAD: &str = "invalid processing of empty payload";
pub const INVALID_CONTENT_LENGTH: &str = "invalid content length";
pub const UNSUPPORTED_CONTENT_TYPE: &str = "unsupported content type";
pub const FAILED_PARSING_PATH: &str = "failed parsing path";
pub const FAILED_PARSING_JSON: &str = "failed parsing json";
pub const PATH_NOT_FOUND: &str = "path not found";
pub const UNHANDLED_EXCEPTION: &str = "unhandled exception";
pub const SERVER_BUSY: &str = "server busy";

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub ready_timeout: Duration,
    pub read_timeout: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub max_request_bytes: usize,
}

impl From<&ServerConfig> for Limits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            ready_timeout: config.ready_timeout(),
            read_timeout: config.read_timeout(),
            idle_timeout: config.idle_timeout(),
            write_timeout: config.write_timeout(),
            max_request_bytes: config.max_request_bytes.max(1),
        }
    }
}

/// Everything a connection needs to dispatch, shared with the accept loop.
pub(crate) struct Dispatcher {
    pub endpoints: Arc<EndpointRegistry>,
    pub scripts: Arc<ScriptBridge>,
    pub pool: PoolHandle,
    pub limits: Limits,
}

pub(crate) async fn handle(stream: TcpStream, peer: SocketAddr, dispatcher: &Dispatcher) {
    let span = info_span!("connection", request_id = %Uuid::now_v7(), %peer);
    handle_inner(stream, peer, dispatcher).instrument(span).await
}

async fn handle_inner(mut stream: TcpStream, peer: SocketAddr, dispatcher: &Dispatcher) {
    let read = read_request(&mut stream, &dispatcher.limits).await;

    let connection = match into_connection(stream, peer, dispatcher.limits.write_timeout) {
        Ok(connection) => Arc::new(connection),
        Err(e) => {
            warn!(error = %e, "Unable to prepare connection for responses");
            return;
        }
    };

    let outcome = read
        .and_then(|bytes| parse(&bytes))
        .and_then(|mut request| {
            request.connection = Some(connection.clone());
            dispatch(request, dispatcher)
        });

    if let Err(rejection) = outcome {
        if let Err(e) = connection.send(&rejection) {
            debug!(error = %e, "Failed to send rejection");
        }
    }
}

/// Collect the raw request bytes.
async fn read_request(stream: &mut TcpStream, limits: &Limits) -> Result<Vec<u8>, Response> {
    match timeout(limits.ready_timeout, stream.readable()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(error = %e, "Connection not readable");
            return Err(Response::internal_error(FAILED_SYNCING));
        }
        Err(_) => {
            warn!(timeout_ms = limits.ready_timeout.as_millis() as u64, "Connection never became readable");
            return Err(Response::internal_error(FAILED_SYNCING));
        }
    }

    let buffer = match timeout(limits.read_timeout, read_until_idle(stream, limits)).await {
        Ok(read) => read?,
        Err(_) => {
            warn!(timeout_ms = limits.read_timeout.as_millis() as u64, "Request read deadline expired");
            return Err(Response::internal_error(FAILED_SYNCING));
        }
    };

    if buffer.is_empty() {
        warn!("Empty request");
        return Err(Response::internal_error(EMPTY_PAYLOAD));
    }
    debug!(bytes = buffer.len(), "Request read");
    Ok(buffer)
}

async fn read_until_idle(stream: &mut TcpStream, limits: &Limits) -> Result<Vec<u8>, Response> {
    let mut buffer = Vec::new();
    let mut framing = RequestFraming::default();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match timeout(limits.idle_timeout, stream.read(&mut chunk)).await {
            // Idle: the client has sent everything it is going to send.
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > limits.max_request_bytes {
                    warn!(bytes = buffer.len(), limit = limits.max_request_bytes, "Request too large");
                    return Err(Response::internal_error(INVALID_CONTENT_LENGTH));
                }
                if framing.advance(&buffer) {
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Read failed");
                break;
            }
        }
    }

    Ok(buffer)
}

fn into_connection(
    stream: TcpStream,
    peer: SocketAddr,
    write_timeout: Duration,
) -> std::io::Result<Connection> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(write_timeout))?;
    Ok(Connection::new(stream, peer))
}

fn parse(bytes: &[u8]) -> Result<Request, Response> {
    let request = codec::parse_request(bytes);
    if request.body.len() != request.content_length {
        warn!(
            declared = request.content_length,
            actual = request.body.len(),
            "Content length mismatch"
        );
        return Err(Response::internal_error(INVALID_CONTENT_LENGTH));
    }
    Ok(request)
}

fn dispatch(request: Request, dispatcher: &Dispatcher) -> Result<(), Response> {
    if request.content_type.eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
        dispatch_json(request, dispatcher)
    } else if request.content_type.eq_ignore_ascii_case(SCRIPT_CONTENT_TYPE) {
        dispatch_script(request, dispatcher)
    } else {
        warn!(content_type = %request.content_type, "Unsupported content type");
        Err(Response::internal_error(UNSUPPORTED_CONTENT_TYPE))
    }
}

fn dispatch_json(mut request: Request, dispatcher: &Dispatcher) -> Result<(), Response> {
    if request.path.is_empty() {
        warn!("Request without path");
        return Err(Response::internal_error(FAILED_PARSING_PATH));
    }

    request.data = if request.body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(&request.body).map_err(|e| {
            warn!(path = %request.path, error = %e, "Invalid JSON body");
            Response::internal_error(FAILED_PARSING_JSON)
        })?
    };

    let Some(endpoint) = dispatcher.endpoints.lookup(&request.path) else {
        debug!(path = %request.path, "No endpoint registered");
        return Err(Response::not_found(PATH_NOT_FOUND));
    };

    debug!(verb = %request.verb, path = %request.path, "Dispatching");
    let span = Span::current();
    dispatcher
        .pool
        .submit(move || {
            let _entered = span.enter();
            let response = match catch_unwind(AssertUnwindSafe(|| endpoint.handle(&request))) {
                Ok(response) => response,
                Err(panic) => {
                    error!(path = %request.path, panic = ?panic, "Endpoint panicked");
                    Response::internal_error(UNHANDLED_EXCEPTION)
                }
            };
            if let Err(e) = request.respond(&response) {
                debug!(error = %e, "Failed to send response");
            }
        })
        .map_err(|e| {
            debug!(error = %e, "Worker pool refused request");
            Response::internal_error(SERVER_BUSY)
        })
}

fn dispatch_script(request: Request, dispatcher: &Dispatcher) -> Result<(), Response> {
    debug!(bytes = request.body.len(), "Dispatching script");
    dispatcher
        .scripts
        .submit(request, dispatcher.endpoints.modules(), &dispatcher.pool)
        .map_err(|e| {
            debug!(error = %e, "Worker pool refused script");
            Response::internal_error(SERVER_BUSY)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn length_mismatch_is_rejected() {
        let raw = b"POST /x HTTP/1.1\nContent-Type: application/json\nContent-Length: 10\n\n{\"a\":1}";
        let rejection = parse(raw).unwrap_err();
        assert_eq!(rejection, Response::internal_error(INVALID_CONTENT_LENGTH));
    }

    #[test]
    fn matching_length_parses() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}";
        let request = parse(raw).unwrap();
        assert_eq!(request.path, "/x");
        assert_eq!(request.body, b"{\"a\":1}");
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn limits() -> Limits {
        Limits::from(&ServerConfig::default())
    }

    #[tokio::test]
    async fn oversized_request_is_rejected() {
        let (mut client, mut server) = socket_pair().await;
        let body = vec![b' '; 200];
        let mut raw = format!(
            "POST /x HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(&body);
        client.write_all(&raw).await.unwrap();

        let limits = Limits {
            max_request_bytes: 64,
            ..limits()
        };
        let rejection = read_request(&mut server, &limits).await.unwrap_err();
        assert_eq!(rejection, Response::internal_error(INVALID_CONTENT_LENGTH));
    }

    #[tokio::test]
    async fn trickling_client_hits_read_deadline() {
        let (mut client, mut server) = socket_pair().await;
        let drip = tokio::spawn(async move {
            for byte in b"POST /x HTTP/1.1\r\nContent-Type: application/json\r\n".iter().cycle().take(500) {
                if client.write_all(&[*byte]).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let limits = Limits {
            read_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(100),
            ..limits()
        };
        let started = Instant::now();
        let rejection = read_request(&mut server, &limits).await.unwrap_err();

        assert_eq!(rejection, Response::internal_error(FAILED_SYNCING));
        assert!(started.elapsed() < Duration::from_secs(2));
        drip.abort();
    }

    #[tokio::test]
    async fn request_split_across_writes_is_read_whole() {
        let (mut client, mut server) = socket_pair().await;
        tokio::spawn(async move {
            client.write_all(b"POST /x HTTP/1.1\r\nContent-Length: 7\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(b"\r\n{\"a\":1}").await.unwrap();
            // Keep the socket open so only framing can end the read.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let limits = Limits {
            idle_timeout: Duration::from_secs(3),
            ..limits()
        };
        let started = Instant::now();
        let bytes = read_request(&mut server, &limits).await.unwrap();
        assert!(bytes.ends_with(b"{\"a\":1}"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn limits_follow_config() {
        let config = ServerConfig {
            idle_timeout_ms: 5,
            read_timeout_ms: 750,
            max_request_bytes: 0,
            ..Default::default()
        };
        let limits = Limits::from(&config);
        assert_eq!(limits.idle_timeout, Duration::from_millis(5));
        assert_eq!(limits.read_timeout, Duration::from_millis(750));
        assert_eq!(limits.max_request_bytes, 1);
    }
}
