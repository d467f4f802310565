use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::Client;
use reqwest::header::{CACHE_CONTROL, PRAGMA, USER_AGENT};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, UpdateError};
use crate::manifest::NO_VERSION;
use crate::util::{cancel_requested, progress_percent};

/// Progress sink fed with `(percent, bytes_downloaded)` updates.
pub type ProgressCallback<'a, 'b> = Option<&'a mut (dyn FnMut(f32, u64) + Send + 'b)>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROGRESS_INTERVAL: f32 = 0.2;

/// Identification sent with every request so mirrors can tell client
/// generations apart.
#[derive(Debug, Clone)]
pub struct UserAgent {
    pub game_name: String,
    pub updater_version: String,
    pub game_version: String,
    pub host_version: String,
}

impl UserAgent {
    #[must_use]
    pub fn header_value(&self) -> String {
        if self.updater_version == NO_VERSION {
            format!(
                "{} Game/{} Client/{}",
                self.game_name, self.game_version, self.host_version
            )
        } else {
            format!(
                "{} Updater/{} Game/{} Client/{}",
                self.game_name, self.updater_version, self.game_version, self.host_version
            )
        }
    }
}

/// HTTP file fetcher. One download may be in flight per handle; the
/// exclusive receiver enforces that callers serialize.
pub struct Transport {
    client: Client,
}

impl Transport {
    #[must_use]
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                warn!("transport: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    /// Fetch `url` into `destination`, reporting progress and honoring the
    /// cancel flag. Cancellation tears the request down and deletes the
    /// destination file.
    pub async fn download(
        &mut self,
        url: &str,
        destination: &Path,
        user_agent: &UserAgent,
        mut progress: ProgressCallback<'_, '_>,
        cancel: &Option<Arc<AtomicBool>>,
    ) -> Result<()> {
        if cancel_requested(cancel) {
            return Err(UpdateError::Cancelled);
        }

        debug!("transport: GET {url} -> {}", destination.display());
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, user_agent.header_value())
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .await
            .map_err(|e| UpdateError::TransportFailed(format!("request to {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| UpdateError::TransportFailed(format!("{url}: {e}")))?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                UpdateError::FilesystemFailed(format!("unable to create download dir: {e}"))
            })?;
        }
        let mut file = File::create(destination).await.map_err(|e| {
            UpdateError::FilesystemFailed(format!(
                "unable to create {}: {e}",
                destination.display()
            ))
        })?;

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_tick = Instant::now();

        while let Some(chunk) = stream.next().await {
            if cancel_requested(cancel) {
                drop(file);
                let _ = tokio::fs::remove_file(destination).await;
                return Err(UpdateError::Cancelled);
            }
            let chunk = chunk.map_err(|e| {
                UpdateError::TransportFailed(format!("stream error from {url}: {e}"))
            })?;
            file.write_all(&chunk).await.map_err(|e| {
                UpdateError::FilesystemFailed(format!(
                    "write error on {}: {e}",
                    destination.display()
                ))
            })?;
            downloaded += chunk.len() as u64;

            if last_tick.elapsed().as_secs_f32() > PROGRESS_INTERVAL {
                if let Some(callback) = progress.as_deref_mut() {
                    callback(progress_percent(downloaded, total), downloaded);
                }
                last_tick = Instant::now();
            }
        }

        if let Some(callback) = progress.as_deref_mut() {
            callback(100.0, downloaded);
        }

        file.flush().await.map_err(|e| {
            UpdateError::FilesystemFailed(format!("flush error on {}: {e}", destination.display()))
        })?;
        drop(file);

        if let Some(total) = total
            && downloaded < total
        {
            let _ = tokio::fs::remove_file(destination).await;
            return Err(UpdateError::TransportFailed(format!(
                "{url}: received {downloaded} of {total} bytes"
            )));
        }

        Ok(())
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}
