//! Nomad HTTP API client.
//!
//! Each request opens a fresh HTTP/1.1 connection. Snapshot refreshes are
//! short bursts, so there is no connection pool to keep warm between commands.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::de::DeserializeOwned;
use tracing::debug;

use tiergate_state::{
    AllocStats, Allocation, Deployment, JobDefinition, JobStub, Node, RegisterRequest,
};

use crate::api::OrchestratorApi;
use crate::error::{OrchestratorError, OrchestratorResult};

const TOKEN_HEADER: &str = "X-Nomad-Token";

/// Bytes escaped in one path segment: the RFC 3986 path set plus `/` and `%`.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// Escape an operator supplied id for use as a single path segment.
fn segment(id: &str) -> String {
    utf8_percent_encode(id, SEGMENT).to_string()
}

/// Client for one Nomad tier.
#[derive(Debug, Clone)]
pub struct NomadClient {
    /// `host:port` to connect to.
    authority: String,
    token: Option<String>,
    timeout: Duration,
}

impl NomadClient {
    /// Create a client for an `http://host[:port]` base url.
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> OrchestratorResult<Self> {
        let invalid = |reason: &str| OrchestratorError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let uri: http::Uri = url.parse().map_err(|_| invalid("unparseable"))?;
        if uri.scheme_str() != Some("http") {
            return Err(invalid("only http:// is supported"));
        }
        let host = uri.host().ok_or_else(|| invalid("missing host"))?;
        let port = uri.port_u16().unwrap_or(80);
        Ok(Self {
            authority: format!("{host}:{port}"),
            token: token.filter(|t| !t.is_empty()),
            timeout,
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> OrchestratorResult<T> {
        let body = self.send(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> OrchestratorResult<Bytes> {
        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&self.authority)
                .await
                .map_err(|e| OrchestratorError::Connect {
                    addr: self.authority.clone(),
                    reason: e.to_string(),
                })?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| OrchestratorError::Http(e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "nomad connection closed with error");
                }
            });

            let mut builder = Request::builder()
                .method(method.clone())
                .uri(path)
                .header(HOST, &self.authority)
                .header(USER_AGENT, "tiergate/0.1");
            if let Some(token) = &self.token {
                builder = builder.header(TOKEN_HEADER, token);
            }
            if body.is_some() {
                builder = builder.header(CONTENT_TYPE, "application/json");
            }
            let request = builder
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| OrchestratorError::Http(e.to_string()))?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| OrchestratorError::Http(e.to_string()))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| OrchestratorError::Http(e.to_string()))?
                .to_bytes();

            if !status.is_success() {
                return Err(OrchestratorError::Status {
                    method: method.to_string(),
                    path: path.to_string(),
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&bytes).trim().to_string(),
                });
            }
            debug!(%method, path, status = status.as_u16(), bytes = bytes.len(), "nomad request");
            Ok(bytes)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout {
                method: method.to_string(),
                path: path.to_string(),
            }),
        }
    }
}

#[async_trait]
impl OrchestratorApi for NomadClient {
    async fn list_nodes(&self) -> OrchestratorResult<Vec<Node>> {
        self.get("/v1/nodes").await
    }

    async fn list_jobs(&self) -> OrchestratorResult<Vec<JobStub>> {
        self.get("/v1/jobs").await
    }

    async fn job(&self, id: &str) -> OrchestratorResult<JobDefinition> {
        match self.get(&format!("/v1/job/{}", segment(id))).await {
            Err(e) if e.is_not_found() => Err(OrchestratorError::JobNotFound(id.to_string())),
            other => other,
        }
    }

    async fn list_deployments(&self) -> OrchestratorResult<Vec<Deployment>> {
        self.get("/v1/deployments").await
    }

    async fn list_allocations(&self) -> OrchestratorResult<Vec<Allocation>> {
        self.get("/v1/allocations").await
    }

    async fn allocation_stats(&self, alloc_id: &str) -> OrchestratorResult<AllocStats> {
        self.get(&format!("/v1/client/allocation/{}/stats", segment(alloc_id)))
            .await
    }

    async fn register_job(&self, job: &JobDefinition) -> OrchestratorResult<()> {
        let body = serde_json::to_vec(&RegisterRequest { job: job.clone() })?;
        self.send(Method::PUT, "/v1/jobs", Some(body)).await?;
        Ok(())
    }

    async fn deregister_job(&self, id: &str) -> OrchestratorResult<()> {
        self.send(Method::DELETE, &format!("/v1/job/{}?purge=false", segment(id)), None)
            .await?;
        Ok(())
    }
}
