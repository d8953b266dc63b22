use std::{collections::HashMap, sync::Arc, time::Duration};

use rand::Rng;
use reqwest::{Client, StatusCode, Url};
use slog::{debug, info, warn, Logger};
use tokio::{
    sync::Mutex,
    time::{sleep, sleep_until, Instant},
};

/// Uniform random delay between two bounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayRange {
    min: Duration,
    max: Duration,
}

impl DelayRange {
    pub fn new(a: Duration, b: Duration) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let secs = rand::thread_rng().gen_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Spaces out request starts per host; parallel callers queue for slots
pub struct PolitenessGate {
    spacing: DelayRange,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl PolitenessGate {
    pub fn new(spacing: DelayRange) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub async fn wait(&self, host: &str) {
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next_slot
                .get(host)
                .copied()
                .filter(|slot| *slot > now)
                .unwrap_or(now);
            next_slot.insert(host.to_string(), slot + self.spacing.sample());
            slot
        };
        sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub max_attempts: u32,
    pub retry_delay: DelayRange,
    pub timeout: Duration,
    pub user_agent: String,
}

/// Soft result of a fetch; exhausting the attempts is not an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Body(String),
    NotAvailable,
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("Failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

pub struct ResilientFetcher {
    client: Client,
    gate: Arc<PolitenessGate>,
    settings: FetchSettings,
    logger: Logger,
}

impl ResilientFetcher {
    pub fn new(
        logger: Logger,
        settings: FetchSettings,
        gate: Arc<PolitenessGate>,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(&settings.user_agent)
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            client,
            gate,
            settings,
            logger,
        })
    }

    pub async fn fetch(&self, url: &str) -> Fetched {
        self.fetch_with(url, self.settings.max_attempts, self.settings.retry_delay)
            .await
    }

    /// Only a 200 ends the loop early. Transport errors and every other
    /// status are retried after a random sleep from `retry_delay`.
    pub async fn fetch_with(&self, url: &str, max_attempts: u32, retry_delay: DelayRange) -> Fetched {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_default();

        for attempt in 1..=max_attempts {
            self.gate.wait(&host).await;
            info!(self.logger, "requesting {} (attempt {}/{})", url, attempt, max_attempts);

            match self.client.get(url).send().await {
                Ok(response) if response.status() == StatusCode::OK => match response.text().await {
                    Ok(body) => {
                        debug!(self.logger, "received {} bytes from {}", body.len(), url);
                        return Fetched::Body(body);
                    }
                    Err(e) => warn!(self.logger, "failed reading body from {}: {}", url, e),
                },
                Ok(response) => {
                    info!(self.logger, "unsuccessful response from {}", url; "status" => response.status().as_u16());
                }
                Err(e) => warn!(self.logger, "request to {} failed: {}", url, e),
            }

            if attempt < max_attempts {
                sleep(retry_delay.sample()).await;
            }
        }

        warn!(self.logger, "giving up on {} after {} attempts", url, max_attempts);
        Fetched::NotAvailable
    }
}
