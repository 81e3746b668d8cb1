//! A client proxy that reports every timed query to an [`EventSink`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::client::{BoxedClient, ClientError, ClientResult, Query, QueryClient, Rows};
use crate::events::EventSink;

/// Wraps a [`QueryClient`] and emits exactly one event per [`logged_query`].
///
/// Everything else is forwarded to the wrapped client without being recorded, which is what
/// setup statements such as `USE <db>` should go through.
///
/// [`logged_query`]: LoggedClient::logged_query
#[derive(Debug)]
pub struct LoggedClient {
    client: BoxedClient,
    sink: Arc<dyn EventSink>,
    host: Option<String>,
}

impl LoggedClient {
    /// Wraps the given client, reporting to `sink`.
    pub fn new(client: BoxedClient, sink: Arc<dyn EventSink>) -> Self {
        Self {
            client,
            sink,
            host: None,
        }
    }

    /// The host of the current connection.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// The first label of the connected host name, e.g. `node-1` for `node-1.example.com`.
    pub fn hostname(&self) -> &str {
        let host = self.host.as_deref().unwrap_or_default();
        host.split('.').next().unwrap_or(host)
    }

    /// Runs a query and records its outcome.
    ///
    /// See [`LoggedQuery::send`] for how outcomes are classified.
    pub fn logged_query<'a>(&'a mut self, query: &'a Query) -> LoggedQuery<'a> {
        LoggedQuery {
            client: self,
            query,
            return_response: false,
            sync_ddl: false,
        }
    }

    /// Starts a query asynchronously and cancels it after `after`.
    ///
    /// The outcome is recorded as `"<name> (cancelled)"`: a success with size `0` if both the
    /// start and the cancellation went through, otherwise a failure. Failures are returned to the
    /// caller after they have been recorded.
    pub async fn logged_cancel(&mut self, query: &Query, after: Duration) -> ClientResult<()> {
        let name = format!("{} (cancelled)", query.name());
        let start = Instant::now();

        let result = async {
            self.client.execute_async(query.sql()).await?;
            tokio::time::sleep(after).await;
            self.client.cancel_operation().await
        }
        .await;

        let elapsed = elapsed_ms(start);
        match result {
            Ok(()) => {
                tracing::debug!(name = %name, elapsed, "query cancelled");
                self.sink.success(&name, elapsed, 0);
                Ok(())
            }
            Err(err) => {
                self.report_failure(&name, elapsed, &err);
                Err(err)
            }
        }
    }

    fn report_failure(&self, name: &str, elapsed: u64, error: &ClientError) {
        tracing::debug!(name, elapsed, error = error as &dyn std::error::Error, "query failed");
        self.sink
            .failure(name, elapsed, error.to_string().len() as u64, error);
    }

    /// Runs a statement without recording it, e.g. `USE <db>` or a cache warmup.
    ///
    /// Errors the client considers benign are ignored, the rows are discarded.
    pub async fn execute_unlogged(&mut self, sql: &str) -> ClientResult<()> {
        match self.client.query(sql).await {
            Ok(_) => Ok(()),
            Err(err) if self.client.is_benign(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// A [`logged_query`](LoggedClient::logged_query) request builder.
#[derive(Debug)]
pub struct LoggedQuery<'a> {
    client: &'a mut LoggedClient,
    query: &'a Query,
    return_response: bool,
    sync_ddl: bool,
}

impl LoggedQuery<'_> {
    /// Hands the fetched rows back to the caller instead of discarding them.
    pub fn return_response(mut self, return_response: bool) -> Self {
        self.return_response = return_response;
        self
    }

    /// Enables `SYNC_DDL` for the duration of this statement.
    pub fn sync_ddl(mut self, sync_ddl: bool) -> Self {
        self.sync_ddl = sync_ddl;
        self
    }

    /// Executes the query and records exactly one event.
    ///
    /// - On success, a success event sized by the serialized result is recorded.
    /// - Errors the client considers benign count as a success with an empty result and size `0`.
    /// - Any other error is recorded as a failure and then returned unchanged.
    ///
    /// Returns the rows if [`return_response`](Self::return_response) was requested.
    pub async fn send(self) -> ClientResult<Option<Rows>> {
        let Self {
            client,
            query,
            return_response,
            sync_ddl,
        } = self;

        if sync_ddl && let Err(err) = client.execute_unlogged("SET SYNC_DDL=1").await {
            client.report_failure(query.name(), 0, &err);
            return Err(err);
        }

        let start = Instant::now();
        let result = client.client.query(query.sql()).await;
        let elapsed = elapsed_ms(start);

        if sync_ddl && let Err(err) = client.execute_unlogged("SET SYNC_DDL=0").await {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to reset SYNC_DDL"
            );
        }

        let rows = match result {
            Ok(rows) => rows,
            Err(err) if client.client.is_benign(&err) => Rows::default(),
            Err(err) => {
                client.report_failure(query.name(), elapsed, &err);
                return Err(err);
            }
        };

        let size = rows.serialized_size();
        tracing::trace!(name = query.name(), elapsed, size, "query succeeded");
        client.sink.success(query.name(), elapsed, size);

        Ok(return_response.then_some(rows))
    }
}

#[async_trait::async_trait]
impl QueryClient for LoggedClient {
    fn name(&self) -> &'static str {
        self.client.name()
    }

    async fn connect(&mut self, host: &str, port: u16) -> ClientResult<()> {
        self.client.connect(host, port).await?;
        self.host = Some(host.to_owned());
        Ok(())
    }

    async fn disconnect(&mut self) -> ClientResult<()> {
        self.client.disconnect().await
    }

    async fn query(&mut self, sql: &str) -> ClientResult<Rows> {
        self.client.query(sql).await
    }

    async fn execute_async(&mut self, sql: &str) -> ClientResult<()> {
        self.client.execute_async(sql).await
    }

    async fn cancel_operation(&mut self) -> ClientResult<()> {
        self.client.cancel_operation().await
    }

    fn is_benign(&self, error: &ClientError) -> bool {
        self.client.is_benign(error)
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
