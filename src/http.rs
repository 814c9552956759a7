use crate::{
    config::{AppConfig, RetryPolicy},
    error::{ModError, Result},
};
use std::{
    error::Error as StdError,
    fmt,
    io::Read,
    sync::Arc,
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use time::{format_description::well_known::Rfc2822, OffsetDateTime};
use tracing::{debug, warn};
use url::Url;

pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure below the HTTP layer: DNS, connect, TLS, a body read cut short.
#[derive(Debug)]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
    pub source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl TransportError {
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            retryable,
            source: None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

/// Anything that can perform a GET. Non-2xx statuses come back as responses,
/// not errors; classification happens in [`HttpClient`].
pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse, TransportError>;
}

pub struct UreqTransport {
    agent: ureq::Agent,
    user_agent: String,
    max_body_bytes: u64,
}

impl UreqTransport {
    pub fn new(config: &AppConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config.connect_timeout_secs))
            .timeout_read(Duration::from_secs(config.read_timeout_secs))
            .timeout_write(Duration::from_secs(config.read_timeout_secs))
            .build();
        Self {
            agent,
            user_agent: config.user_agent.clone(),
            max_body_bytes: config.max_download_bytes,
        }
    }

    fn read_response(&self, response: ureq::Response) -> Result<HttpResponse, TransportError> {
        let status = response.status();
        let headers = response
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                let value = response.header(&name)?.to_string();
                Some((name, value))
            })
            .collect();
        let mut body = Vec::new();
        response
            .into_reader()
            .take(self.max_body_bytes + 1)
            .read_to_end(&mut body)
            .map_err(|err| TransportError {
                message: format!("read response body: {err}"),
                retryable: true,
                source: Some(Box::new(err)),
            })?;
        if body.len() as u64 > self.max_body_bytes {
            return Err(TransportError::new(
                format!("response larger than {} bytes", self.max_body_bytes),
                false,
            ));
        }
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl HttpTransport for UreqTransport {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse, TransportError> {
        let mut request = self.agent.get(url).set("User-Agent", &self.user_agent);
        for (name, value) in headers {
            request = request.set(name, value);
        }
        match request.call() {
            Ok(response) | Err(ureq::Error::Status(_, response)) => self.read_response(response),
            Err(ureq::Error::Transport(transport)) => {
                let retryable = matches!(
                    transport.kind(),
                    ureq::ErrorKind::Dns
                        | ureq::ErrorKind::ConnectionFailed
                        | ureq::ErrorKind::Io
                        | ureq::ErrorKind::ProxyConnect
                );
                Err(TransportError {
                    message: transport.to_string(),
                    retryable,
                    source: Some(Box::new(transport)),
                })
            }
        }
    }
}

/// Status classification plus bounded retry for transient failures.
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(transport: Arc<dyn HttpTransport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    pub fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
        let scheme = Url::parse(url).map(|parsed| parsed.scheme().to_string());
        if !matches!(scheme.as_deref(), Ok("http" | "https")) {
            return Err(ModError::fetch_permanent(url, "only http and https URLs can be fetched"));
        }

        let mut attempt = 0;
        loop {
            debug!(url, attempt, "GET");
            let err = match self.transport.get(url, headers) {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => classify_status(url, &response),
                Err(err) => ModError::Fetch {
                    url: url.to_string(),
                    message: err.message.clone(),
                    status: None,
                    retryable: err.retryable,
                    cause: Some(Box::new(err)),
                },
            };

            let transient = matches!(err, ModError::Fetch { retryable: true, .. });
            if !transient || attempt >= self.retry.max_retries {
                return Err(err);
            }
            let delay = self.retry.backoff(attempt);
            warn!(url, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "transient fetch failure, retrying: {err}");
            thread::sleep(delay);
            attempt += 1;
        }
    }
}

fn classify_status(url: &str, response: &HttpResponse) -> ModError {
    let status = response.status;
    if status == 429 || (status == 403 && is_rate_limit_403(response)) {
        return ModError::RateLimited {
            url: url.to_string(),
            retry_after: retry_after(response),
        };
    }

    let detail = body_snippet(&response.body);
    let message = if detail.is_empty() {
        format!("server responded with HTTP {status}")
    } else {
        format!("server responded with HTTP {status}: {detail}")
    };
    ModError::Fetch {
        url: url.to_string(),
        message,
        status: Some(status),
        retryable: (500..600).contains(&status),
        cause: None,
    }
}

fn is_rate_limit_403(response: &HttpResponse) -> bool {
    if response.header("x-ratelimit-remaining") == Some("0") {
        return true;
    }
    String::from_utf8_lossy(&response.body)
        .to_ascii_lowercase()
        .contains("rate limit")
}

fn retry_after(response: &HttpResponse) -> Option<Duration> {
    if let Some(value) = response.header("retry-after") {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }
        if let Ok(date) = OffsetDateTime::parse(value, &Rfc2822) {
            let wait = date.unix_timestamp() - now_unix();
            return Some(Duration::from_secs(wait.max(0) as u64));
        }
    }
    let reset = response.header("x-ratelimit-reset")?.trim().parse::<i64>().ok()?;
    Some(Duration::from_secs((reset - now_unix()).max(0) as u64))
}

fn body_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    let mut snippet: String = text.chars().take(160).collect();
    if text.chars().count() > 160 {
        snippet.push_str("...");
    }
    snippet.replace('\n', " ")
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::{collections::HashMap, sync::Mutex};

    /// In-memory transport: responses are queued per URL and served in order;
    /// the last queued response for a URL repeats once the queue drains.
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: Mutex<HashMap<String, Vec<Result<HttpResponse, String>>>>,
        hits: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn respond(&self, url: &str, response: HttpResponse) {
            self.push(url, Ok(response));
        }

        pub fn fail(&self, url: &str, message: &str) {
            self.push(url, Err(message.to_string()));
        }

        pub fn hits(&self, url: &str) -> usize {
            self.hits.lock().unwrap().iter().filter(|hit| *hit == url).count()
        }

        fn push(&self, url: &str, outcome: Result<HttpResponse, String>) {
            self.routes
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push(outcome);
        }
    }

    impl HttpTransport for ScriptedTransport {
        fn get(&self, url: &str, _headers: &[(String, String)]) -> Result<HttpResponse, TransportError> {
            self.hits.lock().unwrap().push(url.to_string());
            let mut routes = self.routes.lock().unwrap();
            let Some(queue) = routes.get_mut(url) else {
                return Ok(HttpResponse::new(404, "not found"));
            };
            let outcome = if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone()
            };
            outcome.map_err(|message| TransportError::new(message, true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;
    use crate::error::ErrorKind;

    const URL: &str = "https://example.com/mod.zip";

    fn client(transport: Arc<ScriptedTransport>, retries: u32) -> HttpClient {
        HttpClient::new(
            transport,
            RetryPolicy {
                max_retries: retries,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
        )
    }

    #[test]
    fn retries_server_errors_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(URL, HttpResponse::new(503, "busy"));
        transport.fail(URL, "connection reset");
        transport.respond(URL, HttpResponse::new(200, "ok"));

        let response = client(transport.clone(), 3).get(URL, &[]).unwrap();
        assert_eq!(response.body, b"ok");
        assert_eq!(transport.hits(URL), 3);
    }

    #[test]
    fn client_errors_are_permanent_and_not_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(URL, HttpResponse::new(404, "missing"));

        let err = client(transport.clone(), 3).get(URL, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FetchError);
        assert!(!err.is_retryable());
        assert_eq!(transport.hits(URL), 1);
    }

    #[test]
    fn exhausted_retries_report_retryable_fetch_error() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(URL, HttpResponse::new(502, ""));

        let err = client(transport.clone(), 2).get(URL, &[]).unwrap_err();
        assert!(matches!(err, ModError::Fetch { status: Some(502), retryable: true, .. }));
        assert_eq!(transport.hits(URL), 3);
    }

    #[test]
    fn too_many_requests_is_rate_limited() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(URL, HttpResponse::new(429, "").with_header("Retry-After", "120"));

        let err = client(transport.clone(), 3).get(URL, &[]).unwrap_err();
        match err {
            ModError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(120)))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.hits(URL), 1);
    }

    #[test]
    fn github_forbidden_with_exhausted_quota_is_rate_limited() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            URL,
            HttpResponse::new(403, r#"{"message":"API rate limit exceeded"}"#)
                .with_header("X-RateLimit-Remaining", "0"),
        );

        let err = client(transport, 0).get(URL, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn non_http_schemes_are_rejected_up_front() {
        let transport = Arc::new(ScriptedTransport::default());
        let err = client(transport.clone(), 3)
            .get("ftp://example.com/mod.zip", &[])
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(transport.hits("ftp://example.com/mod.zip"), 0);
    }

    #[test]
    fn scheme_match_ignores_case() {
        let transport = Arc::new(ScriptedTransport::default());
        let url = "HTTPS://example.com/Tabs.css";
        transport.respond(url, HttpResponse::new(200, "tab {}"));
        let response = client(transport.clone(), 0).get(url, &[]).unwrap();
        assert_eq!(response.body, b"tab {}");
        assert_eq!(transport.hits(url), 1);

        let err = client(transport, 0).get("not a url", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FetchError);
    }
}
