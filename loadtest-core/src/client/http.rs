//! A client for SQL gateways that expose sessions over HTTP.
//!
//! The gateway API consists of four calls:
//!
//! - `POST /v1/sessions` opens a session and returns `{"session_id": "..."}`,
//! - `POST /v1/sessions/{id}/statements` runs `{"statement": "...", "async": false}` and returns
//!   `{"rows": [[...], ...]}`, where `"rows": null` means the statement has no result set; with
//!   `"async": true` it returns `{"operation_id": "..."}` instead,
//! - `DELETE /v1/sessions/{id}/operations/{op}` cancels a running statement,
//! - `DELETE /v1/sessions/{id}` closes the session.

use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use super::{ClientError, ClientResult, HttpConfig, QueryClient, Rows, USER_AGENT};

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    #[serde(rename = "async")]
    is_async: bool,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    #[serde(default)]
    rows: Option<Rows>,
    #[serde(default)]
    operation_id: Option<String>,
}

#[derive(Debug)]
struct Session {
    base_url: String,
    id: String,
}

/// A [`QueryClient`] that talks to an HTTP SQL gateway.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    config: HttpConfig,
    session: Option<Session>,
    pending: Option<String>,
}

impl HttpClient {
    /// Creates a new, unconnected client.
    pub fn new(config: HttpConfig) -> ClientResult<Self> {
        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|cause| ClientError::Http {
            context: "failed to build http client".into(),
            cause,
        })?;

        Ok(Self {
            client,
            config,
            session: None,
            pending: None,
        })
    }

    fn base_url(&self, host: &str, port: u16) -> String {
        let scheme = if self.config.ssl { "https" } else { "http" };
        format!("{scheme}://{host}:{port}/v1/sessions")
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.user {
            Some(user) => builder.basic_auth(user, self.config.password.as_deref()),
            None => builder,
        }
    }

    fn session(&self) -> ClientResult<&Session> {
        self.session.as_ref().ok_or(ClientError::NotConnected)
    }

    async fn send(&self, builder: RequestBuilder, context: &str) -> ClientResult<Response> {
        let response = builder.send().await.map_err(|cause| ClientError::Http {
            context: context.to_owned(),
            cause,
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Query(format!("{context}: {status}: {body}")))
    }

    async fn statement(&self, sql: &str, is_async: bool) -> ClientResult<StatementResponse> {
        let session = self.session()?;
        let url = format!("{}/{}/statements", session.base_url, session.id);
        let builder = self.request(Method::POST, &url).json(&StatementRequest {
            statement: sql,
            is_async,
        });

        let response = self.send(builder, "statement failed").await?;
        response.json().await.map_err(|cause| ClientError::Http {
            context: "invalid statement response".into(),
            cause,
        })
    }
}

#[async_trait::async_trait]
impl QueryClient for HttpClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn connect(&mut self, host: &str, port: u16) -> ClientResult<()> {
        if self.session.is_some()
            && let Err(err) = self.disconnect().await
        {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to close previous session"
            );
        }

        let base_url = self.base_url(host, port);
        let builder = self.request(Method::POST, &base_url);
        let response = self
            .send(builder, "failed to open session")
            .await
            .map_err(|err| ClientError::Connection(err.to_string()))?;
        let SessionResponse { session_id } =
            response.json().await.map_err(|cause| ClientError::Http {
                context: "invalid session response".into(),
                cause,
            })?;

        self.session = Some(Session {
            base_url,
            id: session_id,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> ClientResult<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.pending = None;

        let url = format!("{}/{}", session.base_url, session.id);
        let builder = self.request(Method::DELETE, &url);
        self.send(builder, "failed to close session").await?;
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> ClientResult<Rows> {
        let response = self.statement(sql, false).await?;
        response.rows.ok_or(ClientError::NoResultSet)
    }

    async fn execute_async(&mut self, sql: &str) -> ClientResult<()> {
        let response = self.statement(sql, true).await?;
        let operation_id = response
            .operation_id
            .ok_or_else(|| ClientError::Query("gateway returned no operation id".into()))?;
        self.pending = Some(operation_id);
        Ok(())
    }

    async fn cancel_operation(&mut self) -> ClientResult<()> {
        let session = self.session()?;
        let operation_id = self
            .pending
            .as_deref()
            .ok_or(ClientError::NoPendingOperation)?;

        let url = format!(
            "{}/{}/operations/{operation_id}",
            session.base_url, session.id
        );
        let builder = self.request(Method::DELETE, &url);
        self.send(builder, "failed to cancel operation").await?;

        self.pending = None;
        Ok(())
    }
}
