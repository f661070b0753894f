//! PostgreSQL event log adapter.
//!
//! Uses dynamic queries (sqlx::query) instead of compile-time checked macros
//! (sqlx::query!) to allow compilation without DATABASE_URL.

use crate::append::append_event;
use crate::log::{EventLog, EventStream};
use crate::query;
use crate::types::{NewEvent, Position, Result, FIRST_POSITION};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use sqlx::PgPool;

/// Default number of rows fetched per round trip while reading.
pub const DEFAULT_PAGE_SIZE: i64 = 500;

/// PostgreSQL adapter implementing [`EventLog`].
#[derive(Debug, Clone)]
pub struct PgEventLog {
    pool: PgPool,
    page_size: i64,
}

impl PgEventLog {
    /// Create a new PostgreSQL event log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool, page_size: DEFAULT_PAGE_SIZE }
    }

    /// Override the read page size.
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, stream: &str, event: NewEvent) -> Result<Position> {
        Ok(append_event(&self.pool, stream, event).await?.position)
    }

    fn read(&self, stream: &str, from: Position) -> EventStream<'static> {
        let pool = self.pool.clone();
        let stream = stream.to_string();
        let page_size = self.page_size;

        try_stream! {
            // Bound the read to the head as of read start.
            if let Some(head) = query::stream_position(&pool, &stream).await? {
                let mut next = from.max(FIRST_POSITION);
                while next <= head {
                    let page = query::read_page(&pool, &stream, next, head, page_size).await?;
                    if page.is_empty() {
                        break;
                    }
                    for event in page {
                        next = event.position + 1;
                        yield event;
                    }
                }
            }
        }
        .boxed()
    }

    async fn stream_position(&self, stream: &str) -> Result<Option<Position>> {
        query::stream_position(&self.pool, stream).await
    }

    async fn stream_version(&self, stream: &str) -> Result<Option<i64>> {
        query::stream_version(&self.pool, stream).await
    }
}
