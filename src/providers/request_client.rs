use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use reqwest::{Client, Request, Response};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::ProviderError;

const QUEUE_CAP: usize = 100;
/// Extra spread between dispatches so parallel searches and retries never
/// hit a provider in lockstep.
const DISPATCH_JITTER_MS: u64 = 150;
/// Cooldown applied after a throttling answer that carries no Retry-After.
const DEFAULT_THROTTLE_COOLDOWN: Duration = Duration::from_secs(10);
/// Upper bound on what a Retry-After header can demand from the queue.
const MAX_THROTTLE_COOLDOWN: Duration = Duration::from_secs(60);
/// Past this many queued requests the provider is clearly not keeping up
/// with the fan-out.
const DEEP_BACKLOG: usize = 32;

/// Request queued for the provider dispatcher.
struct QueuedRequest {
    req: Request,
    res: oneshot::Sender<reqwest::Result<Response>>,
}

/// Paced HTTP client for one subtitle provider.
///
/// Subtitle APIs meter clients per key (or per IP for anonymous
/// OpenSubtitles), so requests leave through a single queue with jittered
/// spacing instead of in bursts, and a 429/503 answer pauses the queue for
/// the cooldown the provider asked for. Clones share the queue; every
/// adapter talking to the same provider host must clone one instance.
#[derive(Debug, Clone)]
pub struct LimitedRequestClient {
    request_tx: mpsc::Sender<QueuedRequest>,
    queue_depth: Arc<AtomicUsize>,
}

impl LimitedRequestClient {
    /// Spreads `requests_per_period` dispatches evenly across `period`.
    /// (3, one second) paces the queue to one request every ~333ms.
    pub fn new(client: Client, requests_per_period: u32, period: Duration) -> Self {
        let spacing = period / requests_per_period.max(1);
        let (tx, mut rx) = mpsc::channel::<QueuedRequest>(QUEUE_CAP);
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let worker_depth = queue_depth.clone();
        tokio::spawn(async move {
            let mut next_dispatch = Instant::now();
            // written by response tasks when the provider throttles us
            let cooldown_until = Arc::new(Mutex::new(Instant::now()));
            while let Some(queued) = rx.recv().await {
                worker_depth.fetch_sub(1, Ordering::Relaxed);
                if queued.res.is_closed() {
                    // the caller gave up while queued, keep the slot unspent
                    continue;
                }
                let wake = (*cooldown_until.lock().unwrap()).max(next_dispatch);
                tokio::time::sleep_until(wake).await;
                let jitter =
                    Duration::from_millis(rand::rng().random_range(0..=DISPATCH_JITTER_MS));
                next_dispatch = Instant::now() + spacing + jitter;

                let client = client.clone();
                let cooldown_until = cooldown_until.clone();
                tokio::spawn(async move {
                    let QueuedRequest { req, mut res } = queued;
                    let outcome = tokio::select! {
                        outcome = client.execute(req) => outcome,
                        _ = res.closed() => {
                            tracing::trace!("Caller stopped waiting mid-request");
                            return;
                        }
                    };
                    if let Ok(response) = &outcome {
                        if let Some(cooldown) = throttle_cooldown(response) {
                            tracing::debug!(delay = ?cooldown, "Provider asked us to back off");
                            *cooldown_until.lock().unwrap() = Instant::now() + cooldown;
                        }
                    }
                    if res.send(outcome).is_err() {
                        tracing::trace!("Request abandoned: caller stopped waiting");
                    }
                });
            }
        });
        Self {
            request_tx: tx,
            queue_depth,
        }
    }

    pub async fn request<T>(&self, req: Request) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
    {
        let url = req.url().to_string();
        let response = self.request_raw(req).await?;
        match response.json().await {
            Ok(res) => Ok(res),
            Err(e) => {
                tracing::error!(url, "Failed to deserialize provider response: {e}");
                Err(ProviderError::InvalidPayload(
                    "response body is not the expected json".to_string(),
                ))
            }
        }
    }

    pub async fn request_bytes(&self, req: Request) -> Result<bytes::Bytes, ProviderError> {
        let response = self.request_raw(req).await?;
        Ok(response.bytes().await?)
    }

    pub async fn request_raw(&self, req: Request) -> Result<Response, ProviderError> {
        let url = req.url().to_string();
        let backlog = self.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        if backlog > DEEP_BACKLOG {
            tracing::warn!(url, backlog, "Provider request queue is backing up");
        }

        let (tx, rx) = oneshot::channel::<reqwest::Result<Response>>();
        tracing::trace!("Queueing provider request: {}", url);
        if self
            .request_tx
            .send(QueuedRequest { req, res: tx })
            .await
            .is_err()
        {
            self.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(ProviderError::Transport("request worker is gone".to_string()));
        }
        let response = rx
            .await
            .map_err(|_| ProviderError::Transport("request dropped by worker".to_string()))?
            .map_err(|e| {
                tracing::warn!("Request to {} failed: {}", url, e);
                ProviderError::from(e)
            })?;
        let status = response.status().as_u16();
        tracing::trace!(status, url, "Provider response");
        match ProviderError::from_status(status) {
            None => Ok(response),
            Some(err) => Err(err),
        }
    }
}

/// Cooldown a throttling response asks for. 429 means a spent quota, 503 an
/// overloaded mirror; both are common enough on free subtitle hosts that
/// pausing the whole queue beats hammering through the retry layer.
fn throttle_cooldown(response: &Response) -> Option<Duration> {
    if !matches!(response.status().as_u16(), 429 | 503) {
        return None;
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs);
    Some(
        retry_after
            .unwrap_or(DEFAULT_THROTTLE_COOLDOWN)
            .min(MAX_THROTTLE_COOLDOWN),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, retry_after: Option<&str>) -> Response {
        let mut builder = axum::http::Response::builder().status(status);
        if let Some(value) = retry_after {
            builder = builder.header("Retry-After", value);
        }
        Response::from(builder.body("throttled").unwrap())
    }

    #[test]
    fn cooldown_honors_retry_after() {
        assert_eq!(
            throttle_cooldown(&response(429, Some("3"))),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn cooldown_defaults_without_header() {
        assert_eq!(
            throttle_cooldown(&response(429, None)),
            Some(DEFAULT_THROTTLE_COOLDOWN)
        );
        assert_eq!(
            throttle_cooldown(&response(503, None)),
            Some(DEFAULT_THROTTLE_COOLDOWN)
        );
    }

    #[test]
    fn cooldown_is_capped() {
        assert_eq!(
            throttle_cooldown(&response(429, Some("86400"))),
            Some(MAX_THROTTLE_COOLDOWN)
        );
    }

    #[test]
    fn healthy_responses_need_no_cooldown() {
        assert_eq!(throttle_cooldown(&response(200, None)), None);
        assert_eq!(throttle_cooldown(&response(404, None)), None);
    }
}
