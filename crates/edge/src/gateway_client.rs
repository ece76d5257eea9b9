//! How the edge talks to the dispatch gateway.
//!
//! [`GatewayApi`] is implemented over HTTP by [`HttpGatewayClient`] and
//! in-process by [`DispatchGateway`], which lets the edge run embedded next
//! to a gateway.

use askq_core::{AppError, AppResult, QueryId, SessionId};
use askq_dispatch::{
    DispatchGateway, ErrorResponse, ResultEnvelope, SubmitRequest, SubmitResponse, SESSION_HEADER,
};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::time::Duration;

/// Stream of results for one session. Ends or errors when the connection drops.
pub type ResultStream = BoxStream<'static, AppResult<ResultEnvelope>>;

#[async_trait::async_trait]
pub trait GatewayApi: Send + Sync {
    /// Submit a question on behalf of `session`.
    async fn submit(&self, query: &str, session: &SessionId) -> AppResult<QueryId>;

    /// Open the result stream of `session`.
    async fn open_stream(&self, session: &SessionId) -> AppResult<ResultStream>;
}

/// HTTP client for a remote gateway.
pub struct HttpGatewayClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGatewayClient {
    pub fn new(base_url: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of the result stream of `session`, with the id percent-encoded
    /// as a single path segment.
    pub fn results_url(&self, session: &SessionId) -> AppResult<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| {
            AppError::Config(format!("Invalid gateway URL {}: {}", self.base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("Gateway URL has no path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["v1", "sessions", session.as_str(), "results"]);
        Ok(url)
    }

    async fn error_from(response: reqwest::Response) -> AppError {
        let status = response.status();
        let detail = match response.json::<ErrorResponse>().await {
            Ok(body) => body.detail,
            Err(_) => status.to_string(),
        };

        if status.is_client_error() {
            AppError::InvalidInput(detail)
        } else {
            AppError::Transport(format!("Gateway error ({}): {}", status, detail))
        }
    }
}

#[async_trait::async_trait]
impl GatewayApi for HttpGatewayClient {
    async fn submit(&self, query: &str, session: &SessionId) -> AppResult<QueryId> {
        let url = format!("{}/v1/queries", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(SESSION_HEADER, session.as_str())
            .json(&SubmitRequest {
                query: query.to_string(),
            })
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to reach gateway: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to parse gateway response: {}", e)))?;
        Ok(body.query_id)
    }

    async fn open_stream(&self, session: &SessionId) -> AppResult<ResultStream> {
        let url = self.results_url(session)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to open result stream: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        tracing::debug!("Result stream open for session {}", session);
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| AppError::Transport(format!("Stream error: {}", e))));
        Ok(ndjson_results(bytes).boxed())
    }
}

#[async_trait::async_trait]
impl GatewayApi for DispatchGateway {
    async fn submit(&self, query: &str, session: &SessionId) -> AppResult<QueryId> {
        DispatchGateway::submit(self, query, session).await
    }

    async fn open_stream(&self, session: &SessionId) -> AppResult<ResultStream> {
        Ok(self
            .stream_results(session.clone())
            .map(|result| Ok(ResultEnvelope::from(result)))
            .boxed())
    }
}

/// Split a byte stream into newline-delimited JSON results.
///
/// Blank lines are keep-alives and are skipped. A line may span several
/// chunks; a partial line left when the stream ends is discarded.
pub fn ndjson_results<S, B>(
    bytes: S,
) -> impl Stream<Item = AppResult<ResultEnvelope>> + Send + 'static
where
    S: Stream<Item = AppResult<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    futures::stream::unfold(
        (Box::pin(bytes), Vec::<u8>::new(), false),
        |(mut bytes, mut buffer, failed)| async move {
            if failed {
                return None;
            }

            loop {
                if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    let parsed = serde_json::from_str::<ResultEnvelope>(line).map_err(|e| {
                        AppError::Serialization(format!("Failed to parse result line: {}", e))
                    });
                    return Some((parsed, (bytes, buffer, false)));
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                    Some(Err(e)) => return Some((Err(e), (bytes, buffer, true))),
                    None => return None,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(
        parts: &[&'static str],
    ) -> impl Stream<Item = AppResult<&'static [u8]>> + Send + 'static {
        let owned: Vec<AppResult<&'static [u8]>> =
            parts.iter().map(|p| Ok(p.as_bytes())).collect();
        futures::stream::iter(owned)
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let id = QueryId::new_random();
        let line = format!("{{\"query_id\":\"{}\",\"result\":\"heredity\"}}\n", id);
        let (head, tail) = line.split_at(10);
        let head: &'static str = Box::leak(head.to_string().into_boxed_str());
        let tail: &'static str = Box::leak(tail.to_string().into_boxed_str());

        let results: Vec<_> = ndjson_results(chunks(&["\n", head, tail, "\n\n"]))
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        let envelope = results[0].as_ref().unwrap();
        assert_eq!(envelope.query_id, id);
        assert_eq!(envelope.result, "heredity");
    }

    #[tokio::test]
    async fn test_bad_line_is_reported_and_stream_continues() {
        let id = QueryId::new_random();
        let good: &'static str = Box::leak(
            format!("{{\"query_id\":\"{}\",\"result\":\"ok\"}}\n", id).into_boxed_str(),
        );

        let results: Vec<_> = ndjson_results(chunks(&["{oops}\n", good])).collect().await;
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(AppError::Serialization(_))));
        assert_eq!(results[1].as_ref().unwrap().result, "ok");
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let items: Vec<AppResult<&'static [u8]>> = vec![
            Err(AppError::Transport("reset".to_string())),
            Ok(&b"never read\n"[..]),
        ];
        let results: Vec<_> = ndjson_results(futures::stream::iter(items)).collect().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(AppError::Transport(_))));
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let client = HttpGatewayClient::new("http://localhost:50051/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:50051");
    }

    #[test]
    fn test_results_url_encodes_session() {
        let client = HttpGatewayClient::new("http://localhost:50051/").unwrap();
        let session = SessionId::parse("team?a #1%").unwrap();

        let url = client.results_url(&session).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:50051/v1/sessions/team%3Fa%20%231%25/results"
        );
    }

    #[test]
    fn test_results_url_keeps_base_path() {
        let client = HttpGatewayClient::new("http://gateway.local/askq").unwrap();
        let session = SessionId::parse("edge-1").unwrap();

        let url = client.results_url(&session).unwrap();
        assert_eq!(url.as_str(), "http://gateway.local/askq/v1/sessions/edge-1/results");
    }
}
