use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Proxy};

use crate::config::HeaderProfile;
use crate::{Error, Result, PROBE_TIMEOUT_SECS};

/// One network round-trip per roll, returning the raw page body.
///
/// Every failure at this layer is reported as [`Error::Transient`]; deciding
/// whether to try again is the retry policy's job.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, roll: &str) -> Result<String>;
}

/// Posts the result form to the exam endpoint.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    // Client uses Arc so we can clone cheaply
    client: Client,
    endpoint: String,
    exam: String,
    headers: Arc<HeaderProfile>,
}

impl HttpFetcher {
    pub fn new(
        endpoint: impl Into<String>,
        exam: impl Into<String>,
        headers: HeaderProfile,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = build_client(proxy, timeout)?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            exam: exam.into(),
            headers: Arc::new(headers),
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, roll: &str) -> Result<String> {
        let form = [
            ("rollno", roll),
            ("exam", self.exam.as_str()),
            ("yes", "YES"),
            ("button2", "Submit"),
        ];

        let res = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.base().clone())
            .header(header::USER_AGENT, self.headers.user_agent())
            .form(&form)
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(|e| transient(roll, e))?;
        let html = res.text().await.map_err(|e| transient(roll, e))?;

        // An empty body is how the server signals rate limiting.
        if html.trim().is_empty() {
            return Err(transient(roll, format!("Empty response for roll {roll}")));
        }
        Ok(html)
    }
}

/// Checks that the proxy forwards requests at all before any work starts.
/// Returns the probe body, which usually echoes the outgoing address.
pub async fn probe_proxy(proxy: &str, probe_url: &str) -> Result<String> {
    let client = build_client(Some(proxy), Duration::from_secs(PROBE_TIMEOUT_SECS))
        .map_err(|e| Error::ProxyProbe(format!("{proxy}: {e}")))?;
    let res = client
        .get(probe_url)
        .send()
        .await
        .and_then(|res| res.error_for_status())
        .map_err(|e| Error::ProxyProbe(format!("{proxy}: {e}")))?;
    res.text()
        .await
        .map_err(|e| Error::ProxyProbe(format!("{proxy}: {e}")))
}

fn build_client(proxy: Option<&str>, timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(true);
    if let Some(proxy) = proxy {
        let proxy = Proxy::all(proxy)
            .map_err(|e| Error::Config(format!("invalid proxy {proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    Ok(builder.build()?)
}

fn transient(roll: &str, reason: impl ToString) -> Error {
    Error::Transient {
        roll: roll.to_string(),
        reason: reason.to_string(),
    }
}
