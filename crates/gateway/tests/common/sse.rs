use anyhow::Context as _;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use serde_json::Value;
use std::time::Duration;

/// Minimal session client: reads the event stream and posts inbound messages.
pub struct SseSession {
    client: reqwest::Client,
    origin: String,
    endpoint: String,
    events: BoxStream<'static, Result<sse_stream::Sse, sse_stream::Error>>,
}

impl SseSession {
    /// Open `{origin}{path}` and wait for the `endpoint` event.
    pub async fn connect(
        origin: &str,
        path: &str,
        auth_header: Option<&str>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::new();
        let mut req = client.get(format!("{origin}{path}"));
        if let Some(auth) = auth_header {
            req = req.header("authorization", auth);
        }
        let resp = req.send().await.context("GET sse")?;
        anyhow::ensure!(resp.status().is_success(), "GET sse: {}", resp.status());

        let mut events = sse_stream::SseStream::from_byte_stream(resp.bytes_stream()).boxed();
        let endpoint = loop {
            let evt = events
                .next()
                .await
                .context("stream ended before endpoint event")?
                .context("read SSE event")?;
            if evt.event.as_deref() == Some("endpoint") {
                break evt.data.context("endpoint event without data")?;
            }
        };

        Ok(Self {
            client,
            origin: origin.to_string(),
            endpoint,
            events,
        })
    }

    /// Path and query of the message endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn post(&self, message: Value) -> anyhow::Result<reqwest::StatusCode> {
        let resp = self
            .client
            .post(format!("{}{}", self.origin, self.endpoint))
            .json(&message)
            .send()
            .await
            .context("POST message")?;
        Ok(resp.status())
    }

    pub async fn delete(&self) -> anyhow::Result<reqwest::StatusCode> {
        let resp = self
            .client
            .delete(format!("{}{}", self.origin, self.endpoint))
            .send()
            .await
            .context("DELETE session")?;
        Ok(resp.status())
    }

    /// Next `message` event parsed as JSON.
    pub async fn next_message(&mut self, wait: Duration) -> anyhow::Result<Value> {
        tokio::time::timeout(wait, async {
            while let Some(evt) = self.events.next().await {
                let evt = evt.context("read SSE event")?;
                if evt.event.as_deref() != Some("message") {
                    continue;
                }
                let payload = evt.data.unwrap_or_default();
                return serde_json::from_str(&payload).context("parse SSE data as JSON");
            }
            anyhow::bail!("event-stream ended")
        })
        .await
        .context("timed out waiting for message")?
    }

    /// True if the stream ends (or nothing arrives) within `wait` without another message.
    pub async fn expect_no_message(&mut self, wait: Duration) -> anyhow::Result<()> {
        match tokio::time::timeout(wait, self.next_message(Duration::MAX)).await {
            Err(_) => Ok(()),
            Ok(Err(_ended)) => Ok(()),
            Ok(Ok(msg)) => anyhow::bail!("unexpected message: {msg}"),
        }
    }
}
