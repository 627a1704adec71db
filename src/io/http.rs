use std::io::Read;
use std::sync::mpsc::Sender;
use std::time::Duration;

use log::{debug, warn};

use crate::settings::RepoConfig;
use crate::MESH_CONTENT_TYPE;

pub type HandleId = u64;

/// The three client policy lanes. Small and large differ in timeout and
/// concurrency budget, legacy exists for regions that only advertise the
/// v1 capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Small,
    Large,
    Legacy,
}

/// Status code of a finished transfer. Zero encodes a transport level
/// failure that never produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpStatus(pub u16);

impl HttpStatus {
    pub const TRANSPORT_FAILURE: HttpStatus = HttpStatus(0);

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_partial_content(&self) -> bool {
        self.0 == 206
    }

    pub fn is_not_found(&self) -> bool {
        self.0 == 404
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parses a `Content-Range: bytes <start>-<end>/<total|*>` header.
    pub fn parse(value: &str) -> Option<ContentRange> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        Some(ContentRange {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
            total: match total.trim() {
                "*" => None,
                t => Some(t.parse().ok()?),
            },
        })
    }
}

/// A byte range GET as the worker hands it to the transport.
#[derive(Debug, Clone)]
pub struct ByteRangeRequest {
    pub handle: HandleId,
    pub url: String,
    pub lane: Lane,
    pub offset: u64,
    pub len: u64,
}

/// Completion record queued back to the repo worker. Handlers run on the
/// worker thread when it flushes these, never on transport threads.
#[derive(Debug, Clone)]
pub struct HttpCompletion {
    pub handle: HandleId,
    pub status: HttpStatus,
    pub reason: String,
    /// Transport internal retries, accumulated into the retry metric.
    pub retries: u32,
    pub content_range: Option<ContentRange>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PostResponse {
    pub status: HttpStatus,
    pub reason: String,
    pub body: Vec<u8>,
}

/// Seam to the HTTP machinery. The production implementation talks to the
/// asset servers, tests substitute a scripted one.
pub trait Transport: Send + Sync {
    /// Issues a ranged GET. Must never block the caller on network
    /// progress and must eventually push exactly one completion for the
    /// request's handle into `sink`.
    fn submit_byte_range(
        &self,
        request: ByteRangeRequest,
        timeout: Duration,
        sink: Sender<HttpCompletion>,
    );

    /// Blocking POST, used by the upload path which owns its own thread.
    fn post(&self, url: &str, body: Vec<u8>, timeout: Duration) -> PostResponse;
}

/// Production transport. One agent per policy lane so timeouts and
/// connection reuse stay independent.
pub struct UreqTransport {
    small: ureq::Agent,
    large: ureq::Agent,
    legacy: ureq::Agent,
}

impl UreqTransport {
    pub fn new(config: &RepoConfig) -> Self {
        let agent = |timeout: Duration| {
            ureq::AgentBuilder::new()
                .timeout(timeout)
                .build()
        };
        Self {
            small: agent(config.small_timeout()),
            large: agent(config.large_timeout()),
            legacy: agent(config.small_timeout()),
        }
    }

    fn agent(&self, lane: Lane) -> &ureq::Agent {
        match lane {
            Lane::Small => &self.small,
            Lane::Large => &self.large,
            Lane::Legacy => &self.legacy,
        }
    }
}

impl Transport for UreqTransport {
    fn submit_byte_range(
        &self,
        request: ByteRangeRequest,
        _timeout: Duration,
        sink: Sender<HttpCompletion>,
    ) {
        let agent = self.agent(request.lane).clone();
        std::thread::spawn(move || {
            let range = format!(
                "bytes={}-{}",
                request.offset,
                request.offset + request.len - 1
            );
            let result = agent
                .get(&request.url)
                .set("Accept", MESH_CONTENT_TYPE)
                .set("Range", &range)
                .call();

            let completion = match result {
                Ok(response) => {
                    let status = HttpStatus(response.status());
                    let reason = response.status_text().to_string();
                    let content_range = response
                        .header("Content-Range")
                        .and_then(ContentRange::parse);
                    let mut body = Vec::new();
                    match response.into_reader().read_to_end(&mut body) {
                        Ok(_) => HttpCompletion {
                            handle: request.handle,
                            status,
                            reason,
                            retries: 0,
                            content_range,
                            body,
                        },
                        Err(e) => HttpCompletion {
                            handle: request.handle,
                            status: HttpStatus::TRANSPORT_FAILURE,
                            reason: format!("body read failed: {}", e),
                            retries: 0,
                            content_range: None,
                            body: Vec::new(),
                        },
                    }
                }
                Err(ureq::Error::Status(code, response)) => HttpCompletion {
                    handle: request.handle,
                    status: HttpStatus(code),
                    reason: response.status_text().to_string(),
                    retries: 0,
                    content_range: None,
                    body: Vec::new(),
                },
                Err(ureq::Error::Transport(transport)) => HttpCompletion {
                    handle: request.handle,
                    status: HttpStatus::TRANSPORT_FAILURE,
                    reason: transport.to_string(),
                    retries: 0,
                    content_range: None,
                    body: Vec::new(),
                },
            };

            if sink.send(completion).is_err() {
                debug!("Mesh fetch completion arrived after pipeline shutdown");
            }
        });
    }

    fn post(&self, url: &str, body: Vec<u8>, _timeout: Duration) -> PostResponse {
        let result = self
            .small
            .post(url)
            .set("Content-Type", "application/json")
            .send_bytes(&body);

        match result {
            Ok(response) => {
                let status = HttpStatus(response.status());
                let reason = response.status_text().to_string();
                let mut body = Vec::new();
                if let Err(e) = response.into_reader().read_to_end(&mut body) {
                    warn!("Reading upload response body failed: {}", e);
                }
                PostResponse {
                    status,
                    reason,
                    body,
                }
            }
            Err(ureq::Error::Status(code, response)) => {
                let reason = response.status_text().to_string();
                let mut body = Vec::new();
                let _ = response.into_reader().read_to_end(&mut body);
                PostResponse {
                    status: HttpStatus(code),
                    reason,
                    body,
                }
            }
            Err(ureq::Error::Transport(transport)) => PostResponse {
                status: HttpStatus::TRANSPORT_FAILURE,
                reason: transport.to_string(),
                body: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_parses_the_common_shapes() {
        let range = ContentRange::parse("bytes 0-4095/40960").expect("parses");
        assert_eq!(range.start, 0);
        assert_eq!(range.end, 4095);
        assert_eq!(range.total, Some(40960));

        let range = ContentRange::parse("bytes 128-255/*").expect("parses");
        assert_eq!(range.start, 128);
        assert_eq!(range.total, None);

        assert!(ContentRange::parse("items 0-1/2").is_none());
        assert!(ContentRange::parse("bytes nonsense").is_none());
    }

    #[test]
    fn status_classification() {
        assert!(HttpStatus(200).is_success());
        assert!(HttpStatus(206).is_success());
        assert!(HttpStatus(206).is_partial_content());
        assert!(!HttpStatus(304).is_success());
        assert!(HttpStatus(404).is_not_found());
        assert!(!HttpStatus::TRANSPORT_FAILURE.is_success());
    }
}
