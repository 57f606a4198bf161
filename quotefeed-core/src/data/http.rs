//! Blocking HTTP with retry, deadline, and circuit-breaker handling.
//!
//! Both providers go through [`HttpFetcher::get`]; they only differ in URL
//! construction and body parsing.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{FetchError, FetchRequest};
use super::retry::RetryPolicy;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A response the caller has to interpret: success, or a 404 whose body may
/// say "unknown symbol".
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(
        circuit_breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()?;
        Ok(Self {
            client,
            circuit_breaker,
            retry,
            request_timeout,
        })
    }

    pub fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }

    fn refused() -> FetchError {
        FetchError::Unreachable("provider blocked (circuit breaker open)".into())
    }

    fn timed_out(request: &FetchRequest, started: Instant) -> FetchError {
        FetchError::Timeout {
            symbol: request.symbol.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// GET `url`, retrying transient failures until the retry budget or the
    /// request deadline runs out.
    pub fn get(&self, url: &str, request: &FetchRequest) -> Result<HttpResponse, FetchError> {
        let started = Instant::now();
        let mut last_error = None;

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 && !self.retry.wait_before(attempt, request) {
                return Err(Self::timed_out(request, started));
            }
            if request.is_expired() {
                return Err(Self::timed_out(request, started));
            }
            if !self.circuit_breaker.is_allowed() {
                return Err(Self::refused());
            }

            let timeout = self.request_timeout.min(request.remaining());
            debug!(%url, attempt, "GET");

            let resp = match self.client.get(url).timeout(timeout).send() {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(Self::timed_out(request, started));
                    continue;
                }
                Err(e) => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(FetchError::Unreachable(e.to_string()));
                    continue;
                }
            };

            let status = resp.status();
            if status == StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(FetchError::Unreachable(format!(
                    "HTTP 403 for {}: provider is blocking requests",
                    request.symbol
                )));
            }
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                self.circuit_breaker.record_failure();
                last_error = Some(FetchError::Unreachable(format!(
                    "HTTP {status} for {}",
                    request.symbol
                )));
                continue;
            }
            if !status.is_success() && status != StatusCode::NOT_FOUND {
                return Err(FetchError::Unreachable(format!(
                    "HTTP {status} for {}",
                    request.symbol
                )));
            }

            let body = match resp.text() {
                Ok(body) => body,
                Err(e) => {
                    last_error = Some(FetchError::Unreachable(format!(
                        "reading body for {}: {e}",
                        request.symbol
                    )));
                    continue;
                }
            };
            self.circuit_breaker.record_success();
            return Ok(HttpResponse { status, body });
        }

        Err(last_error.unwrap_or_else(|| FetchError::Unreachable("max retries exceeded".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::provider::DataProvider;
    use crate::data::yahoo::YahooProvider;
    use crate::data::BreakerState;
    use chrono::NaiveDate;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Local HTTP/1.1 server answering each connection with the next canned
    /// response, then closing it.
    struct Stub {
        url: String,
        hits: Arc<AtomicUsize>,
    }

    fn read_request(stream: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    fn stub(responses: Vec<(u16, &'static str)>) -> Stub {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        std::thread::spawn(move || {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                read_request(&mut stream);
                counter.fetch_add(1, Ordering::SeqCst);
                let reply = format!(
                    "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        Stub { url, hits }
    }

    fn request(budget: Duration) -> FetchRequest {
        FetchRequest {
            symbol: "600519.SS".into(),
            since: None,
            history_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            until: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            deadline: Instant::now() + budget,
        }
    }

    fn fetcher(breaker: Arc<CircuitBreaker>, retries: u32) -> HttpFetcher {
        HttpFetcher::new(breaker, RetryPolicy::immediate(retries), Duration::from_secs(5)).unwrap()
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(Duration::from_secs(60), 5))
    }

    #[test]
    fn server_errors_are_retried_until_success() {
        let server = stub(vec![(503, ""), (429, ""), (200, "ok")]);
        let resp = fetcher(breaker(), 2)
            .get(&server.url, &request(Duration::from_secs(10)))
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, "ok");
        assert_eq!(server.hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retries_run_out_as_unreachable() {
        let server = stub(vec![(500, ""), (502, "")]);
        let err = fetcher(breaker(), 1)
            .get(&server.url, &request(Duration::from_secs(10)))
            .unwrap_err();
        assert_eq!(err.kind(), "unreachable");
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn forbidden_trips_the_breaker_for_later_requests() {
        let server = stub(vec![(403, "")]);
        let cb = breaker();
        let http = fetcher(cb.clone(), 3);

        let err = http.get(&server.url, &request(Duration::from_secs(10))).unwrap_err();
        assert!(err.to_string().contains("403"));
        assert!(matches!(cb.state(), BreakerState::Open { .. }));
        assert!(!http.is_available());

        let refused = http.get(&server.url, &request(Duration::from_secs(10))).unwrap_err();
        assert!(refused.to_string().contains("circuit breaker"));
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn silent_server_times_out_at_the_deadline() {
        // Connections queue in the backlog and never get an answer.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let started = Instant::now();
        let err = fetcher(breaker(), 2)
            .get(&url, &request(Duration::from_millis(300)))
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { ref symbol, .. } if symbol == "600519.SS"));
        assert!(err.is_unreachable());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn not_found_chart_body_is_unknown_symbol() {
        let server = stub(vec![(
            404,
            r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#,
        )]);
        let yahoo = YahooProvider::new(fetcher(breaker(), 0)).with_base_url(server.url.clone());
        let err = yahoo.fetch_daily(&request(Duration::from_secs(10))).unwrap_err();
        assert_eq!(
            err,
            FetchError::UnknownSymbol {
                symbol: "600519.SS".into()
            }
        );
    }
}
