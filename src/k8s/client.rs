//! HTTP implementation of the control-plane client: one-shot list calls plus
//! an NDJSON-framed long-poll watch. Grounded on the `client` interface and
//! `kubernetesCollector`'s usage of it in `collector.go`; endpoints follow
//! the upstream Kubernetes core/v1 REST API.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use reqwest::{Certificate, Client, Identity};
use snafu::{ResultExt, Snafu};

use crate::k8s::auth::ApiConfig;
use crate::k8s::types::{Node, PodList, WatchEvent};

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("cannot build HTTP client: {source}"))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("HTTP request to {url} failed: {source}"))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("server returned unexpected status {status} for {url}"))]
    Status { url: String, status: u16 },

    #[snafu(display("cannot parse response body from {url}: {source}"))]
    Decode { url: String, source: reqwest::Error },

    #[snafu(display("cannot parse watch event from {url}: {source}"))]
    DecodeEvent {
        url: String,
        source: serde_json::Error,
    },

    #[snafu(display("watch stream from {url} ended"))]
    StreamEof { url: String },

    #[snafu(display("watch stream from {url} failed: {source}"))]
    StreamError { url: String, source: reqwest::Error },
}

#[async_trait]
pub trait KubernetesClient: Send + Sync {
    async fn get_node_by_name(&self, name: &str) -> Result<Node, ClientError>;
    async fn get_node_pods(&self, node: &str) -> Result<PodList, ClientError>;
    async fn watch_node_pods(
        &self,
        node: &str,
        resource_version: &str,
    ) -> Result<EventStream, ClientError>;
}

pub struct HttpKubernetesClient {
    http: Client,
    server: String,
    bearer_token: Option<String>,
}

impl HttpKubernetesClient {
    pub fn new(config: ApiConfig) -> Result<Self, ClientError> {
        let mut builder = Client::builder();

        if let Some(ca) = &config.tls.ca {
            let cert = Certificate::from_pem(ca).context(BuildClientSnafu)?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&config.tls.client_cert, &config.tls.client_key) {
            let mut pem = cert.clone();
            pem.extend_from_slice(key);
            let identity = Identity::from_pem(&pem).context(BuildClientSnafu)?;
            builder = builder.identity(identity);
        }

        let http = builder.build().context(BuildClientSnafu)?;
        Ok(HttpKubernetesClient {
            http,
            server: config.server,
            bearer_token: config.bearer_token,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.get(url);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        req
    }
}

#[async_trait]
impl KubernetesClient for HttpKubernetesClient {
    async fn get_node_by_name(&self, name: &str) -> Result<Node, ClientError> {
        let url = format!("{}/api/v1/nodes/{name}", self.server);
        let response = self
            .get(&url)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        let response = check_status(response, &url).await?;
        response.json().await.context(DecodeSnafu { url })
    }

    async fn get_node_pods(&self, node: &str) -> Result<PodList, ClientError> {
        let url = format!(
            "{}/api/v1/pods?fieldSelector=spec.nodeName={node}",
            self.server
        );
        let response = self
            .get(&url)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        let response = check_status(response, &url).await?;
        response.json().await.context(DecodeSnafu { url })
    }

    async fn watch_node_pods(
        &self,
        node: &str,
        resource_version: &str,
    ) -> Result<EventStream, ClientError> {
        let mut url = format!(
            "{}/api/v1/pods?watch=1&fieldSelector=spec.nodeName={node}",
            self.server
        );
        if !resource_version.is_empty() {
            url.push_str("&resourceVersion=");
            url.push_str(resource_version);
        }

        let response = self
            .get(&url)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        let response = check_status(response, &url).await?;
        Ok(EventStream::new(response, url))
    }
}

async fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response, ClientError> {
    if !response.status().is_success() {
        return StatusSnafu {
            url,
            status: response.status().as_u16(),
        }
        .fail();
    }
    Ok(response)
}

/// A long-poll watch stream, framed as newline-delimited JSON.
pub struct EventStream {
    response: Option<reqwest::Response>,
    buf: BytesMut,
    url: String,
}

impl EventStream {
    fn new(response: reqwest::Response, url: String) -> Self {
        EventStream {
            response: Some(response),
            buf: BytesMut::new(),
            url,
        }
    }

    /// Feed events to `handler` until the stream ends or `handler` returns
    /// `false`. A handler rejection is a normal exit (`Ok(())`); any stream
    /// termination, clean or truncated, is surfaced as `StreamEof` so the
    /// caller can apply its EOF-throttling policy uniformly.
    pub async fn read_events<F>(&mut self, mut handler: F) -> Result<(), ClientError>
    where
        F: FnMut(WatchEvent) -> bool,
    {
        let url = self.url.clone();
        let response = self
            .response
            .as_mut()
            .expect("read_events called after close");

        loop {
            while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos);
                self.buf.advance(1);
                if line.is_empty() {
                    continue;
                }
                let event: WatchEvent = serde_json::from_slice(&line)
                    .context(DecodeEventSnafu { url: url.clone() })?;
                if !handler(event) {
                    return Ok(());
                }
            }

            match response
                .chunk()
                .await
                .context(StreamErrorSnafu { url: url.clone() })?
            {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => return StreamEofSnafu { url }.fail(),
            }
        }
    }

    pub fn close(&mut self) {
        self.response = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_display_names_the_url() {
        let error = ClientError::StreamEof {
            url: "https://example.invalid/api/v1/pods".to_string(),
        };
        assert!(error.to_string().contains("https://example.invalid/api/v1/pods"));
    }
}
