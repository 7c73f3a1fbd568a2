use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use rand::Rng;
use reqwest::{Client, StatusCode};

use crate::extract::{Extractor, ParseError};
use crate::types::ExtractionResult;

#[derive(Debug, thiserror::Error)]
pub enum ScraperError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("{url} returned {status}")]
    Status { status: StatusCode, url: String },
    #[error("Giving up on {url} after {attempts} attempt(s): {source}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    /// Total attempts for transport failures, including the first one.
    pub retry_count: u32,
    /// Base delay between attempts, scaled by a random factor in `[0.5, 1.5)`.
    pub retry_delay: Duration,
    pub max_delay: Duration,
    pub user_agent: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebScraper {
    client: Client,
    options: FetchOptions,
    extractor: Extractor,
}

impl WebScraper {
    pub fn new(options: FetchOptions, extractor: Extractor) -> Result<Self, ScraperError> {
        let client = Client::builder()
            .timeout(options.timeout)
            .user_agent(options.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            options,
            extractor,
        })
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Fetches `url`, retrying transport failures with jittered delays.
    /// HTTP error statuses are returned immediately.
    pub async fn fetch(&self, url: &str) -> Result<String, ScraperError> {
        let attempts = self.options.retry_count.max(1);

        let mut attempt = 1;
        loop {
            log::info!("Fetching {} (attempt {}/{})", url, attempt, attempts);

            match self.get_html(url).await {
                Ok(html) => {
                    log::info!("Fetched {} bytes from {}", html.len(), url);
                    return Ok(html);
                }
                Err(ScraperError::RequestError(e)) if attempt < attempts => {
                    let delay = self.backoff();
                    log::warn!(
                        "Attempt {} failed: {}. Retrying in {:.2}s",
                        attempt,
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(ScraperError::RequestError(e)) => {
                    return Err(ScraperError::Exhausted {
                        url: url.to_string(),
                        attempts,
                        source: e,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_html(&self, url: &str) -> Result<String, ScraperError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .inspect_err(|e| log::debug!("Request to {} failed: {}", url, e))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            log::error!("{} returned {}", url, status);
            return Err(ScraperError::Status {
                status,
                url: url.to_string(),
            });
        }

        Ok(response.text().await?)
    }

    fn backoff(&self) -> Duration {
        let factor = rand::rng().random_range(0.5..1.5);
        self.options
            .retry_delay
            .mul_f64(factor)
            .min(self.options.max_delay)
    }

    /// Fetches and extracts in one step, returning the raw page alongside the
    /// result so callers can keep a backup.
    pub async fn scrape(&self, url: &str) -> Result<(String, ExtractionResult), ScraperError> {
        let html = self.fetch(url).await?;
        let result = self.extractor.extract(&html);
        Ok((html, result))
    }

    pub async fn scrape_on(
        &self,
        url: &str,
        run_date: NaiveDate,
    ) -> Result<(String, ExtractionResult), ScraperError> {
        let html = self.fetch(url).await?;
        let result = self.extractor.extract_on(&html, run_date);
        Ok((html, result))
    }
}

/// Writes the raw page to `dir/perm_backup_<timestamp>.html`.
pub fn save_html_backup(html: &str, dir: &Path) -> Result<PathBuf, ScraperError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "perm_backup_{}.html",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    fs::write(&path, html)?;
    log::info!("Saved HTML backup to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractorConfig;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn scraper(retry_count: u32) -> WebScraper {
        let options = FetchOptions {
            timeout: Duration::from_secs(5),
            retry_count,
            retry_delay: Duration::from_millis(10),
            ..FetchOptions::default()
        };
        let extractor = Extractor::new(ExtractorConfig::default()).unwrap();
        WebScraper::new(options, extractor).unwrap()
    }

    /// Serves `response` to every connection and counts the connections.
    async fn serve(response: impl Into<String>) -> (String, Arc<AtomicUsize>) {
        let response = response.into();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (url, hits)
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let (url, hits) = serve(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 13\r\nConnection: close\r\n\r\n<html></html>",
        )
        .await;

        let html = scraper(3).fetch(&url).await.unwrap();
        assert_eq!(html, "<html></html>");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_error_is_not_retried() {
        let (url, hits) =
            serve("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;

        let err = scraper(3).fetch(&url).await.unwrap_err();
        assert!(matches!(
            err,
            ScraperError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scrape_on_fixture_page() {
        let page = include_str!("../fixtures/perm_timeline.html");
        let (url, _) = serve(format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            page.len(),
            page
        ))
        .await;

        let run_date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        let (html, result) = scraper(1).scrape_on(&url, run_date).await.unwrap();
        assert_eq!(html, page);
        assert_eq!(result.as_of, Some(run_date));
        assert_eq!(result.summary.unwrap().total_applications, 11509);
    }

    #[tokio::test]
    async fn test_transport_failure_exhausts_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let err = scraper(2).fetch(&url).await.unwrap_err();
        assert!(matches!(err, ScraperError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_backoff_is_jittered_and_capped() {
        let mut scraper = scraper(3);
        scraper.options.retry_delay = Duration::from_secs(2);
        for _ in 0..50 {
            let delay = scraper.backoff();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_secs(3));
        }

        scraper.options.retry_delay = Duration::from_secs(100);
        assert!(scraper.backoff() <= Duration::from_secs(30));
    }

    #[test]
    fn test_save_html_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_html_backup("<html>backup</html>", &dir.path().join("backups")).unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("perm_backup_"));
        assert!(name.ends_with(".html"));
        assert_eq!(fs::read_to_string(path).unwrap(), "<html>backup</html>");
    }
}
