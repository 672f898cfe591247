//! Best-effort JPEG relay to an HTTP endpoint (typically an ESP32 display).
//!
//! Each frame is POSTed once with `Content-Type: image/jpeg`. A failed
//! delivery is reported and dropped; the next frame is a new attempt.
//!
//! With `queue_depth > 0` the POST runs on a worker thread fed by a bounded
//! channel. A full queue drops the newest frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{encode_frame, FrameSink, ImageFormat, SinkKind, SinkOutcome};
use crate::classify::InferenceResult;
use crate::error::{DeliveryFailure, SinkError};
use crate::frame::Frame;

pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
const LOGGED_BODY_CHARS: usize = 100;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub url: String,
    pub timeout: Duration,
    pub jpeg_quality: u8,
    /// 0 posts inline on the loop thread.
    pub queue_depth: usize,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_RELAY_TIMEOUT,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            queue_depth: 0,
        }
    }
}

/// Delivery counters, shared with the worker thread.
#[derive(Debug, Default)]
pub struct RelayStats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl RelayStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// One POST of one payload. Only ever logged.
struct DeliveryAttempt<'a> {
    endpoint: &'a str,
    payload_len: usize,
    timeout: Duration,
}

#[derive(Clone)]
struct Poster {
    agent: ureq::Agent,
    url: String,
    timeout: Duration,
    stats: Arc<RelayStats>,
}

impl Poster {
    fn new(config: &RelayConfig, stats: Arc<RelayStats>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self {
            agent,
            url: config.url.clone(),
            timeout: config.timeout,
            stats,
        }
    }

    fn post(&self, jpeg: &[u8]) -> Result<(), DeliveryFailure> {
        let attempt = DeliveryAttempt {
            endpoint: &self.url,
            payload_len: jpeg.len(),
            timeout: self.timeout,
        };
        let outcome = match self
            .agent
            .post(&self.url)
            .set("Content-Type", "image/jpeg")
            .send_bytes(jpeg)
        {
            Ok(response) => {
                let status = response.status();
                let body = truncated_body(response);
                log::debug!(
                    "NetworkRelay: {} bytes to {} -> HTTP {}: {}",
                    attempt.payload_len,
                    attempt.endpoint,
                    status,
                    body
                );
                Ok(())
            }
            Err(ureq::Error::Status(status, response)) => Err(DeliveryFailure::Status {
                status,
                body: truncated_body(response),
            }),
            Err(ureq::Error::Transport(transport)) => {
                Err(DeliveryFailure::Transport(transport.to_string()))
            }
        };

        match &outcome {
            Ok(()) => self.stats.delivered.fetch_add(1, Ordering::Relaxed),
            Err(e) => {
                log::warn!(
                    "NetworkRelay: delivery of {} bytes to {} failed (timeout {:?}): {}",
                    attempt.payload_len,
                    attempt.endpoint,
                    attempt.timeout,
                    e
                );
                self.stats.failed.fetch_add(1, Ordering::Relaxed)
            }
        };
        outcome
    }
}

fn truncated_body(response: ureq::Response) -> String {
    response
        .into_string()
        .unwrap_or_default()
        .chars()
        .take(LOGGED_BODY_CHARS)
        .collect()
}

enum Delivery {
    Inline(Poster),
    Worker {
        queue: SyncSender<Vec<u8>>,
        handle: JoinHandle<()>,
    },
}

pub struct NetworkRelay {
    config: RelayConfig,
    stats: Arc<RelayStats>,
    delivery: Option<Delivery>,
}

impl NetworkRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            stats: Arc::new(RelayStats::default()),
            delivery: None,
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    fn deliver(&mut self, jpeg: Vec<u8>) -> Result<SinkOutcome, SinkError> {
        match self.delivery.as_ref() {
            Some(Delivery::Inline(poster)) => {
                poster.post(&jpeg)?;
                Ok(SinkOutcome::Delivered)
            }
            Some(Delivery::Worker { queue, .. }) => match queue.try_send(jpeg) {
                Ok(()) => Ok(SinkOutcome::Delivered),
                Err(TrySendError::Full(_)) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    Err(DeliveryFailure::QueueFull.into())
                }
                Err(TrySendError::Disconnected(_)) => Err(DeliveryFailure::WorkerGone.into()),
            },
            None => Err(DeliveryFailure::WorkerGone.into()),
        }
    }
}

impl FrameSink for NetworkRelay {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Relay
    }

    fn acquire(&mut self) -> Result<(), SinkError> {
        let poster = Poster::new(&self.config, Arc::clone(&self.stats));
        if self.config.queue_depth == 0 {
            self.delivery = Some(Delivery::Inline(poster));
        } else {
            let (queue, frames) = mpsc::sync_channel::<Vec<u8>>(self.config.queue_depth);
            let handle = thread::Builder::new()
                .name("framepipe-relay".to_string())
                .spawn(move || {
                    for jpeg in frames {
                        let _ = poster.post(&jpeg);
                    }
                })
                .map_err(|e| SinkError::Delivery(DeliveryFailure::Transport(format!(
                    "failed to start relay worker: {}",
                    e
                ))))?;
            self.delivery = Some(Delivery::Worker { queue, handle });
        }
        log::info!(
            "NetworkRelay: posting JPEG (quality {}) to {} with {:?} timeout{}",
            self.config.jpeg_quality,
            self.config.url,
            self.config.timeout,
            if self.config.queue_depth > 0 {
                format!(", worker queue {}", self.config.queue_depth)
            } else {
                String::new()
            }
        );
        Ok(())
    }

    fn consume(
        &mut self,
        frame: &Frame,
        _result: Option<&InferenceResult>,
    ) -> Result<SinkOutcome, SinkError> {
        let jpeg = encode_frame(frame, ImageFormat::Jpeg, self.config.jpeg_quality)
            .map_err(DeliveryFailure::Encode)?;
        self.deliver(jpeg)
    }

    fn release(&mut self) {
        match self.delivery.take() {
            Some(Delivery::Worker { queue, handle }) => {
                // Closing the queue ends the worker loop after the frames
                // already queued.
                drop(queue);
                if handle.join().is_err() {
                    log::error!("NetworkRelay: worker thread panicked");
                }
            }
            Some(Delivery::Inline(_)) | None => {}
        }
        log::info!(
            "NetworkRelay: {} delivered, {} failed",
            self.stats.delivered(),
            self.stats.failed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_before_acquire_is_a_delivery_failure() {
        let mut relay = NetworkRelay::new(RelayConfig::new("http://127.0.0.1:9/frame"));
        let frame = Frame::rgb(vec![0; 12], 2, 2);
        let err = relay.consume(&frame, None).unwrap_err();
        assert!(matches!(err, SinkError::Delivery(DeliveryFailure::WorkerGone)));
    }

    #[test]
    fn unreachable_endpoint_is_a_transport_failure() {
        // Bind then drop to get a port with no listener.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap();
        let mut config = RelayConfig::new(format!("http://127.0.0.1:{}/frame", port));
        config.timeout = Duration::from_millis(500);
        let mut relay = NetworkRelay::new(config);
        relay.acquire().unwrap();

        let frame = Frame::rgb(vec![0; 12], 2, 2);
        let err = relay.consume(&frame, None).unwrap_err();
        assert!(matches!(err, SinkError::Delivery(DeliveryFailure::Transport(_))));
        assert_eq!(relay.stats().failed(), 1);
        relay.release();
    }

    #[test]
    fn malformed_frame_is_an_encode_failure() {
        let mut relay = NetworkRelay::new(RelayConfig::new("http://127.0.0.1:9/frame"));
        relay.acquire().unwrap();
        let frame = Frame::rgb(vec![0; 5], 2, 2);
        let err = relay.consume(&frame, None).unwrap_err();
        assert!(matches!(err, SinkError::Delivery(DeliveryFailure::Encode(_))));
        relay.release();
    }
}
