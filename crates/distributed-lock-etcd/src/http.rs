//! etcd v2 keys API over HTTP.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use distributed_lock_core::error::{LockError, LockResult};
use reqwest::{RequestBuilder, Url};
use serde::Deserialize;
use tracing::debug;

use crate::client::{KeyWatcher, KeysApi, ttl_seconds};
use crate::error::{ErrorCode, KeysError, KeysResult};
use crate::response::Response;

/// Header carrying the cluster index of an answer.
const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

/// Default per-request timeout for everything except watches.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Error body returned by etcd.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: u32,
    #[serde(default)]
    message: String,
}

struct Inner {
    http: reqwest::Client,
    endpoints: Vec<Url>,
    /// Endpoint that answered last.
    pinned: AtomicUsize,
    request_timeout: Duration,
}

/// Client for the etcd v2 keys API.
///
/// Requests go to the endpoint that answered last and fall over to the
/// remaining endpoints when a connection cannot be made. Cloning is cheap;
/// clones share the connection pool.
#[derive(Clone)]
pub struct HttpKeysClient {
    inner: Arc<Inner>,
}

impl HttpKeysClient {
    /// Builds a client for the given endpoints.
    ///
    /// Nothing is sent to the cluster; an unreachable cluster is only noticed
    /// on the first request.
    pub fn new(endpoints: &[impl AsRef<str>], request_timeout: Duration) -> LockResult<Self> {
        if endpoints.is_empty() {
            return Err(LockError::Configuration(
                "no etcd endpoints provided".to_string(),
            ));
        }

        let endpoints = endpoints
            .iter()
            .map(|endpoint| parse_endpoint(endpoint.as_ref()))
            .collect::<LockResult<Vec<_>>>()?;

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LockError::Connectivity(Box::new(e)))?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                endpoints,
                pinned: AtomicUsize::new(0),
                request_timeout,
            }),
        })
    }

    /// Returns the configured endpoints.
    pub fn endpoints(&self) -> &[Url] {
        &self.inner.endpoints
    }

    fn key_url(&self, position: usize, key: &str) -> KeysResult<Url> {
        let endpoint = &self.inner.endpoints[position];
        let mut url = endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                KeysError::Transport(format!("endpoint {endpoint} cannot hold a key path").into())
            })?;
            segments
                .pop_if_empty()
                .push("v2")
                .push("keys")
                .extend(key.split('/').filter(|segment| !segment.is_empty()));
        }
        Ok(url)
    }

    /// Sends a request built by `build`, treating an empty answer as an error.
    async fn send<F>(&self, key: &str, build: F, timeout: Option<Duration>) -> KeysResult<Response>
    where
        F: Fn(Url) -> RequestBuilder + Sync,
    {
        self.send_raw(key, build, timeout)
            .await?
            .ok_or_else(|| KeysError::Transport("empty etcd response body".into()))
    }

    /// Sends a request built by `build`, walking the endpoint list on
    /// connection failures.
    ///
    /// Returns `None` when the service answered with an empty success body.
    async fn send_raw<F>(
        &self,
        key: &str,
        build: F,
        timeout: Option<Duration>,
    ) -> KeysResult<Option<Response>>
    where
        F: Fn(Url) -> RequestBuilder + Sync,
    {
        let count = self.inner.endpoints.len();
        let start = self.inner.pinned.load(Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..count {
            let position = (start + offset) % count;
            let mut request = build(self.key_url(position, key)?);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(response) => {
                    self.inner.pinned.store(position, Ordering::Relaxed);
                    return decode(response).await;
                }
                Err(e) => {
                    debug!(
                        endpoint = %self.inner.endpoints[position],
                        error = %e,
                        "etcd endpoint unavailable"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => KeysError::transport(e),
            None => KeysError::Transport("no etcd endpoints configured".into()),
        })
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        prev_exist: bool,
    ) -> KeysResult<Response> {
        let ttl = ttl_seconds(ttl).to_string();
        let prev_exist = if prev_exist { "true" } else { "false" };
        self.send(
            key,
            |url| {
                self.inner
                    .http
                    .put(url)
                    .query(&[("prevExist", prev_exist)])
                    .form(&[("value", value), ("ttl", ttl.as_str())])
            },
            Some(self.inner.request_timeout),
        )
        .await
    }
}

impl KeysApi for HttpKeysClient {
    type Watcher = HttpKeyWatcher;

    async fn create(&self, key: &str, value: &str, ttl: Duration) -> KeysResult<Response> {
        self.put(key, value, ttl, false).await
    }

    async fn get(&self, key: &str) -> KeysResult<Response> {
        self.send(
            key,
            |url| self.inner.http.get(url),
            Some(self.inner.request_timeout),
        )
        .await
    }

    async fn update(&self, key: &str, value: &str, ttl: Duration) -> KeysResult<Response> {
        self.put(key, value, ttl, true).await
    }

    async fn delete(&self, key: &str) -> KeysResult<Response> {
        self.send(
            key,
            |url| self.inner.http.delete(url),
            Some(self.inner.request_timeout),
        )
        .await
    }

    fn watcher(&self, key: &str, after_index: u64) -> Self::Watcher {
        HttpKeyWatcher {
            client: self.clone(),
            key: key.to_string(),
            wait_index: after_index + 1,
        }
    }
}

/// Long-polling watch on one key.
pub struct HttpKeyWatcher {
    client: HttpKeysClient,
    key: String,
    /// Index of the next event to wait for.
    wait_index: u64,
}

impl KeyWatcher for HttpKeyWatcher {
    async fn next(&mut self) -> KeysResult<Response> {
        let wait_index = self.wait_index.to_string();
        let client = &self.client;
        loop {
            // Watches block until the next event; no request timeout applies.
            let response = client
                .send_raw(
                    &self.key,
                    |url| {
                        client
                            .inner
                            .http
                            .get(url)
                            .query(&[("wait", "true"), ("waitIndex", wait_index.as_str())])
                    },
                    None,
                )
                .await?;

            // An empty answer ends the long poll without an event.
            let Some(response) = response else {
                debug!(key = %self.key, wait_index = %wait_index, "empty watch answer, polling again");
                continue;
            };
            self.wait_index = response.node.modified_index + 1;
            return Ok(response);
        }
    }
}

fn parse_endpoint(endpoint: &str) -> LockResult<Url> {
    let url = Url::parse(endpoint).map_err(|e| LockError::Connectivity(Box::new(e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(LockError::Connectivity(
            format!("unsupported etcd endpoint: {endpoint}").into(),
        ));
    }
    Ok(url)
}

async fn decode(response: reqwest::Response) -> KeysResult<Option<Response>> {
    let status = response.status();
    let index = response
        .headers()
        .get(ETCD_INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    let body = response.bytes().await.map_err(KeysError::transport)?;

    if status.is_success() {
        if body.trim_ascii().is_empty() {
            return Ok(None);
        }
        let mut decoded: Response = serde_json::from_slice(&body).map_err(KeysError::transport)?;
        decoded.index = index;
        return Ok(Some(decoded));
    }

    match serde_json::from_slice::<ErrorBody>(&body) {
        Ok(error) => Err(KeysError::from_remote(
            ErrorCode::from_code(error.error_code),
            error.message,
        )),
        Err(_) => Err(KeysError::Transport(
            format!("unexpected etcd response status {status}").into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Action;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn answer(index: u64, body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nX-Etcd-Index: {index}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Serves `answers` in order, one connection each, and returns the
    /// request lines it received.
    async fn serve(answers: Vec<String>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let mut received = Vec::new();
            for answer in answers {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    let read = stream.read(&mut buf).await.unwrap();
                    if read == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..read]);
                }
                let request = String::from_utf8_lossy(&request);
                received.push(request.lines().next().unwrap_or_default().to_string());
                stream.write_all(answer.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
            received
        });
        (endpoint, task)
    }

    #[test]
    fn test_rejects_empty_endpoint_list() {
        let endpoints: [&str; 0] = [];
        let result = HttpKeysClient::new(&endpoints, DEFAULT_REQUEST_TIMEOUT);
        assert!(matches!(result, Err(LockError::Configuration(_))));
    }

    #[test]
    fn test_rejects_unparsable_endpoint() {
        let result = HttpKeysClient::new(&["not a url"], DEFAULT_REQUEST_TIMEOUT);
        assert!(matches!(result, Err(LockError::Connectivity(_))));

        let result = HttpKeysClient::new(&["mailto:etcd@example.com"], DEFAULT_REQUEST_TIMEOUT);
        assert!(matches!(result, Err(LockError::Connectivity(_))));
    }

    #[test]
    fn test_key_url_layout() {
        let client = HttpKeysClient::new(
            &["http://127.0.0.1:2379", "http://10.0.0.2:2379/"],
            DEFAULT_REQUEST_TIMEOUT,
        )
        .unwrap();

        let url = client.key_url(0, "/locks/my lock").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:2379/v2/keys/locks/my%20lock");

        let url = client.key_url(1, "/mylock").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.2:2379/v2/keys/mylock");
    }

    #[test]
    fn test_watcher_waits_after_anchor_index() {
        let client = HttpKeysClient::new(&["http://127.0.0.1:2379"], DEFAULT_REQUEST_TIMEOUT).unwrap();
        let watcher = client.watcher("/mylock", 41);
        assert_eq!(watcher.wait_index, 42);
        assert_eq!(watcher.key, "/mylock");
    }

    #[test]
    fn test_error_body_decoding() {
        let body = r#"{"errorCode":105,"message":"Key already exists","cause":"/mylock","index":9}"#;
        let error: ErrorBody = serde_json::from_str(body).unwrap();
        let err = KeysError::from_remote(ErrorCode::from_code(error.error_code), error.message);
        assert!(err.is_node_exist());
    }

    #[tokio::test]
    async fn test_watch_polls_again_after_empty_answer() {
        let deleted = r#"{"action":"delete","node":{"key":"/k","modifiedIndex":6,"createdIndex":3},"prevNode":{"key":"/k","value":"holder","modifiedIndex":3,"createdIndex":3}}"#;
        let (endpoint, server) = serve(vec![answer(5, ""), answer(6, deleted)]).await;
        let client = HttpKeysClient::new(&[endpoint], DEFAULT_REQUEST_TIMEOUT).unwrap();

        let mut watcher = client.watcher("/k", 4);
        let event = watcher.next().await.unwrap();
        assert_eq!(event.action, Action::Delete);
        assert_eq!(event.node.modified_index, 6);
        assert_eq!(watcher.wait_index, 7);

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        for request in &requests {
            assert!(request.starts_with("GET /v2/keys/k?"), "{request}");
            assert!(request.contains("waitIndex=5"), "{request}");
        }
    }

    #[tokio::test]
    async fn test_empty_answer_to_plain_read_is_an_error() {
        let (endpoint, server) = serve(vec![answer(5, "")]).await;
        let client = HttpKeysClient::new(&[endpoint], DEFAULT_REQUEST_TIMEOUT).unwrap();

        let result = client.get("/k").await;
        assert!(matches!(result, Err(KeysError::Transport(_))));
        server.await.unwrap();
    }
}
