//! Local forwarder: replays a tunnelled request against the loopback runtime.
//!
//! A response with a `Content-Length` comes back as a single final envelope.
//! Anything else (chunked, SSE, NDJSON token streams) is relayed frame by
//! frame as it arrives. Tunnel-side failures never escape as errors: they
//! become a terminal envelope with `error` set.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body as _, Incoming};
use hyper::header::CONTENT_LENGTH;
use hyper::{HeaderMap, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::{debug, warn};

use super::protocol::{Headers, RequestEnvelope, ResponseEnvelope};

pub const DEFAULT_LOCAL_URL: &str = "http://127.0.0.1:11434";

/// Turns a request envelope into a stream of response envelopes. The last
/// item always has `is_final` set.
pub trait Forward: Send + Sync + 'static {
    fn forward(&self, request: RequestEnvelope) -> BoxStream<'static, ResponseEnvelope>;
}

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("invalid local runtime URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Headers that describe a single hop and must not be replayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn response_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

#[derive(Clone)]
pub struct LocalForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    timeout: Duration,
}

impl LocalForwarder {
    /// `base_url` is the runtime's origin, e.g. `http://127.0.0.1:11434`.
    /// `timeout` bounds the wait for the response head and every gap
    /// between body frames.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ForwarderError> {
        let trimmed = base_url.trim_end_matches('/');
        let uri = trimmed.parse::<hyper::Uri>().map_err(|e| ForwarderError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if uri.scheme_str() != Some("http") || uri.authority().is_none() {
            return Err(ForwarderError::InvalidUrl {
                url: base_url.to_string(),
                reason: "expected http://host[:port]".into(),
            });
        }
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url: trimmed.to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(&self, req: &RequestEnvelope) -> Result<Request<Full<Bytes>>, String> {
        let mut builder = Request::builder()
            .method(req.method.as_str())
            .uri(format!("{}{}", self.base_url, req.path));
        for (name, value) in &req.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        let body = Bytes::from(req.body.clone().unwrap_or_default());
        builder.body(Full::new(body)).map_err(|e| e.to_string())
    }
}

/// Where a forward is in its lifetime.
enum Phase {
    Send {
        client: Client<HttpConnector, Full<Bytes>>,
        request: Result<Request<Full<Bytes>>, String>,
    },
    Stream {
        body: Incoming,
        status: u16,
        headers: Option<Headers>,
        seq: u64,
    },
    Done,
}

struct Forwarding {
    correlation_id: String,
    timeout: Duration,
    phase: Phase,
}

impl Forwarding {
    fn finish(mut self, envelope: ResponseEnvelope) -> Option<(ResponseEnvelope, Self)> {
        self.phase = Phase::Done;
        Some((envelope, self))
    }

    fn failure(self, status: u16, message: String) -> Option<(ResponseEnvelope, Self)> {
        warn!(correlation_id = %self.correlation_id, status, error = %message, "Local forward failed");
        let envelope = ResponseEnvelope::failure(self.correlation_id.clone(), status, 0, message);
        self.finish(envelope)
    }

    async fn step(mut self) -> Option<(ResponseEnvelope, Self)> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,
                Phase::Send { client, request } => {
                    let request = match request {
                        Ok(r) => r,
                        Err(e) => return self.failure(400, format!("invalid request: {e}")),
                    };
                    let response = match tokio::time::timeout(self.timeout, client.request(request)).await {
                        Err(_) => {
                            let secs = self.timeout.as_secs_f64();
                            return self.failure(504, format!("local runtime did not respond within {secs}s"));
                        }
                        Ok(Err(e)) => return self.failure(502, format!("local runtime unreachable: {e}")),
                        Ok(Ok(r)) => r,
                    };
                    let (parts, body) = response.into_parts();
                    let status = parts.status.as_u16();
                    let headers = response_headers(&parts.headers);

                    if parts.headers.contains_key(CONTENT_LENGTH) {
                        return match tokio::time::timeout(self.timeout, body.collect()).await {
                            Ok(Ok(collected)) => {
                                let id = self.correlation_id.clone();
                                let body = collected.to_bytes().to_vec();
                                self.finish(ResponseEnvelope::complete(id, status, headers, body))
                            }
                            Ok(Err(e)) => self.failure(502, format!("reading local response failed: {e}")),
                            Err(_) => self.failure(504, "local response body timed out".into()),
                        };
                    }

                    debug!(correlation_id = %self.correlation_id, status, "Streaming local response");
                    self.phase = Phase::Stream {
                        body,
                        status,
                        headers: Some(headers),
                        seq: 0,
                    };
                }
                Phase::Stream {
                    mut body,
                    status,
                    mut headers,
                    seq,
                } => loop {
                    let (data, error) = match tokio::time::timeout(self.timeout, body.frame()).await {
                        Ok(Some(Ok(frame))) => match frame.into_data() {
                            Ok(data) if !data.is_empty() => (data, None),
                            // Empty data frames and trailers carry nothing to relay.
                            _ => continue,
                        },
                        Ok(None) => (Bytes::new(), None),
                        Ok(Some(Err(e))) => (Bytes::new(), Some(format!("local stream failed: {e}"))),
                        Err(_) => (Bytes::new(), Some("local stream stalled".to_string())),
                    };
                    let is_final = data.is_empty() || body.is_end_stream();
                    let envelope = self.chunk(status, &mut headers, seq, data.to_vec(), is_final, error);
                    if is_final {
                        return self.finish(envelope);
                    }
                    self.phase = Phase::Stream {
                        body,
                        status,
                        headers,
                        seq: seq + 1,
                    };
                    return Some((envelope, self));
                },
            }
        }
    }

    /// One streamed chunk. Headers ride on the first.
    fn chunk(
        &self,
        status: u16,
        headers: &mut Option<Headers>,
        seq: u64,
        body: Vec<u8>,
        is_final: bool,
        error: Option<String>,
    ) -> ResponseEnvelope {
        if let Some(err) = &error {
            warn!(correlation_id = %self.correlation_id, seq, error = %err, "Local stream ended early");
        }
        ResponseEnvelope {
            correlation_id: self.correlation_id.clone(),
            status,
            headers: headers.take().unwrap_or_default(),
            seq,
            body,
            is_final,
            error,
        }
    }
}

impl Forward for LocalForwarder {
    fn forward(&self, request: RequestEnvelope) -> BoxStream<'static, ResponseEnvelope> {
        let state = Forwarding {
            correlation_id: request.correlation_id.clone(),
            timeout: self.timeout,
            phase: Phase::Send {
                client: self.client.clone(),
                request: self.build_request(&request),
            },
        };
        Box::pin(stream::unfold(state, Forwarding::step))
    }
}
