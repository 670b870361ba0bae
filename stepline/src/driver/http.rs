//! HTTP driver implementation.
//!
//! Talks to a pipeline service over its v2 REST surface. Wire formats,
//! status-code mapping, and the api-key header live here and nowhere else;
//! pipes and workers only ever see the [`Driver`] contract.

use crate::errors::{Result, SteplineError};
use crate::message::{Decoration, Message};
use crate::options::ReceiveOptions;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::Driver;

/// Service reply envelope for single-result operations.
#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    #[allow(dead_code)]
    topic: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    status: u16,
}

/// Service reply envelope for fetches.
#[derive(Debug, Deserialize)]
struct EventsReply {
    #[serde(default)]
    events: Vec<Message>,
}

/// A [`Driver`] over the pipeline service's HTTP API.
pub struct HttpDriver {
    base_url: String,
    api_key: String,
    /// Lazily constructed once and shared across concurrent calls.
    client: OnceCell<reqwest::Client>,
}

impl HttpDriver {
    /// Creates a driver for the service at `base_url` using `api_key`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .get_or_try_init(|| async {
                reqwest::Client::builder()
                    .connect_timeout(Duration::from_secs(5))
                    .timeout(Duration::from_secs(90))
                    .build()
                    .map_err(SteplineError::transport)
            })
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{path}", self.base_url)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<String> {
        let response = request
            .header("authorization", format!("api {}", self.api_key))
            .send()
            .await
            .map_err(SteplineError::transport)?;
        response.text().await.map_err(SteplineError::transport)
    }

    /// Runs a request whose reply is a single envelope, returning its text.
    async fn round_trip(&self, request: reqwest::RequestBuilder) -> Result<String> {
        let body = self.execute(request).await?;
        let reply: Reply = serde_json::from_str(&body)?;
        if reply.status == 200 {
            Ok(reply.text)
        } else {
            Err(SteplineError::Transport(reply.text))
        }
    }

    fn recv_query(options: &ReceiveOptions) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if options.auto_ack {
            query.push(("autoAck".to_string(), "yes".to_string()));
        }
        if options.block {
            query.push(("block".to_string(), "yes".to_string()));
        }
        query.push(("count".to_string(), options.count.max(1).to_string()));
        query.push((
            "timeout".to_string(),
            options.timeout.as_secs().max(1).to_string(),
        ));
        query.push((
            "redeliveryTimeout".to_string(),
            options.redelivery_timeout.as_secs().max(1).to_string(),
        ));
        if options.exclude_routing {
            query.push(("excludeRouting".to_string(), "yes".to_string()));
        }
        if options.exclude_route_log {
            query.push(("excludeRouteLog".to_string(), "yes".to_string()));
        }
        if options.exclude_decorated_payload {
            query.push(("excludeDecoratedPayload".to_string(), "yes".to_string()));
        }
        query
    }
}

#[async_trait]
impl Driver for HttpDriver {
    async fn send(&self, payload: &str, route: &[String]) -> Result<String> {
        let client = self.client().await?;
        let body = serde_json::json!({ "payload": payload, "route": route });
        self.round_trip(client.post(self.url("pipes")).json(&body))
            .await
    }

    async fn recv(&self, options: &ReceiveOptions) -> Result<Vec<Message>> {
        let client = self.client().await?;
        let body = self
            .execute(
                client
                    .get(self.url(&format!("pipe/{}", options.step)))
                    .query(&Self::recv_query(options)),
            )
            .await?;
        let reply: EventsReply = serde_json::from_str(&body)?;
        Ok(reply.events)
    }

    async fn ack(&self, id: &str, step: &str) -> Result<()> {
        let client = self.client().await?;
        self.round_trip(client.put(self.url(&format!("message/{id}/ack/{step}"))))
            .await?;
        Ok(())
    }

    async fn complete(&self, id: &str, step: &str) -> Result<()> {
        let client = self.client().await?;
        self.round_trip(client.put(self.url(&format!("message/{id}/complete/{step}"))))
            .await?;
        Ok(())
    }

    async fn append_log(&self, id: &str, step: &str, code: i32, text: &str) -> Result<()> {
        let client = self.client().await?;
        let body = serde_json::json!({ "code": code, "text": text });
        self.round_trip(
            client
                .patch(self.url(&format!("message/{id}/log/{step}")))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn add_steps_after(&self, id: &str, after: &str, steps: &[String]) -> Result<()> {
        let client = self.client().await?;
        let body = serde_json::json!({ "after": after, "newSteps": steps });
        self.round_trip(
            client
                .patch(self.url(&format!("message/{id}/route")))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn decorate(&self, id: &str, decorations: &[Decoration]) -> Vec<Result<()>> {
        let client = match self.client().await {
            Ok(client) => client,
            Err(error) => {
                let text = error.to_string();
                return decorations
                    .iter()
                    .map(|_| Err(SteplineError::Transport(text.clone())))
                    .collect();
            }
        };

        let body = serde_json::json!({ "decorations": decorations });
        let outcome = self
            .execute(
                client
                    .patch(self.url(&format!("message/{id}/decorations")))
                    .json(&body),
            )
            .await
            .and_then(|body| {
                serde_json::from_str::<Vec<Reply>>(&body).map_err(SteplineError::from)
            });

        match outcome {
            Ok(replies) => decorations
                .iter()
                .enumerate()
                .map(|(index, _)| match replies.get(index) {
                    Some(reply) if reply.status == 200 => Ok(()),
                    Some(reply) => Err(SteplineError::Transport(reply.text.clone())),
                    None => Err(SteplineError::transport("missing decoration reply")),
                })
                .collect(),
            Err(error) => {
                let text = error.to_string();
                decorations
                    .iter()
                    .map(|_| Err(SteplineError::Transport(text.clone())))
                    .collect()
            }
        }
    }

    async fn get_decorations(&self, id: &str, keys: &[String]) -> Result<Vec<Decoration>> {
        let client = self.client().await?;
        let body = self
            .execute(
                client
                    .get(self.url(&format!("message/{id}/decorations")))
                    .query(&[("keys", keys.join(","))]),
            )
            .await?;
        let decorations: Vec<Decoration> = serde_json::from_str(&body)?;
        Ok(decorations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_strips_trailing_slash() {
        let driver = HttpDriver::new("https://pipeline.example/", "key");
        assert_eq!(
            driver.url("pipes"),
            "https://pipeline.example/api/v2/pipes"
        );
    }

    #[test]
    fn test_recv_query_flags() {
        let options = ReceiveOptions::new("resize")
            .with_auto_ack(true)
            .with_block(true)
            .with_count(5);
        let query = HttpDriver::recv_query(&options);

        assert!(query.contains(&("autoAck".to_string(), "yes".to_string())));
        assert!(query.contains(&("block".to_string(), "yes".to_string())));
        assert!(query.contains(&("count".to_string(), "5".to_string())));
    }

    #[test]
    fn test_recv_query_omits_disabled_flags() {
        let options = ReceiveOptions::new("resize")
            .with_block(false)
            .with_auto_ack(false);
        let query = HttpDriver::recv_query(&options);

        assert!(!query.iter().any(|(k, _)| k == "autoAck"));
        assert!(!query.iter().any(|(k, _)| k == "block"));
    }

    #[test]
    fn test_reply_parsing() {
        let reply: Reply =
            serde_json::from_str(r#"{"topic":"send","text":"abc123","status":200}"#).unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.text, "abc123");
    }
}
