//! Per-connection prepared-statement cache.
//!
//! Statement ids are only valid on the connection that prepared them, so the
//! cache lives inside the connection and is keyed by SQL text. Two policies
//! are offered: [`CachePolicy::Indefinite`] never evicts, while
//! [`CachePolicy::WindowTinyLfu`] keeps a bounded number of hot statements
//! using an admission sketch.

mod indefinite;
mod tiny_lfu;

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, ServerMessage};

use indefinite::IndefiniteCache;
use tiny_lfu::TinyLfuCache;

/// Prepared-statement caching policy, selected through the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Prepare on every execution and close the handle afterwards
    Disabled,
    /// Cache every prepared statement for the connection's lifetime
    Indefinite,
    /// Bounded cache with W-TinyLFU admission and eviction
    WindowTinyLfu {
        /// Maximum number of cached statements, must be positive
        capacity: usize,
    },
}

/// Shared slot holding a statement id once its prepare exchange finished.
///
/// Concurrent executions of the same SQL collapse onto one prepare.
pub(crate) type StatementCell = Arc<OnceCell<u32>>;

/// Outcome of a cache lookup: the statement id to execute against, and
/// whether the cache retained the handle. Uncached handles must be closed
/// after use.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Prepared {
    pub id: u32,
    pub cached: bool,
}

pub(crate) enum StatementCache {
    Disabled,
    Indefinite(Mutex<IndefiniteCache>),
    TinyLfu(Mutex<TinyLfuCache>),
}

impl StatementCache {
    /// Build a cache for `policy`, failing fast on a zero LFU capacity.
    pub fn new(policy: CachePolicy) -> Result<Self> {
        match policy {
            CachePolicy::Disabled => Ok(StatementCache::Disabled),
            CachePolicy::Indefinite => {
                Ok(StatementCache::Indefinite(Mutex::new(IndefiniteCache::new())))
            }
            CachePolicy::WindowTinyLfu { capacity } => {
                if capacity == 0 {
                    return Err(Error::InvalidUsage(
                        "statement cache capacity must be positive".into(),
                    ));
                }
                Ok(StatementCache::TinyLfu(Mutex::new(TinyLfuCache::new(
                    capacity,
                ))))
            }
        }
    }

    /// Resolve `sql` to a statement id, preparing it on `client` if needed.
    pub async fn get_or_prepare(&self, client: &Client, sql: &str) -> Result<Prepared> {
        match self {
            StatementCache::Disabled => {
                let id = prepare_statement(client, sql).await?;
                Ok(Prepared { id, cached: false })
            }
            StatementCache::Indefinite(cache) => {
                let cell = lock(cache).get_or_insert(sql);
                let id = *cell
                    .get_or_try_init(|| prepare_statement(client, sql))
                    .await?;
                Ok(Prepared { id, cached: true })
            }
            StatementCache::TinyLfu(cache) => {
                let (cell, evicted) = {
                    let mut cache = lock(cache);
                    match cache.get(sql) {
                        Some(cell) => (cell, Vec::new()),
                        None => cache.insert(sql),
                    }
                };
                for victim in evicted {
                    close_evicted(client, &victim);
                }
                let id = *cell
                    .get_or_try_init(|| prepare_statement(client, sql))
                    .await?;
                // The entry may have been evicted while the prepare was in
                // flight; only a still-present entry counts as cached.
                let cached = lock(cache).contains_cell(sql, &cell);
                Ok(Prepared { id, cached })
            }
        }
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatementCache::Disabled => f.write_str("StatementCache::Disabled"),
            StatementCache::Indefinite(_) => f.write_str("StatementCache::Indefinite"),
            StatementCache::TinyLfu(_) => f.write_str("StatementCache::TinyLfu"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Close an evicted statement handle on the server.
///
/// COM_STMT_CLOSE has no response and the server ignores unknown ids, so a
/// handle that is also closed by its last user is harmless.
fn close_evicted(client: &Client, cell: &StatementCell) {
    if let Some(&id) = cell.get() {
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(error) = client
                .send_only(ClientMessage::StmtClose { statement_id: id })
                .await
            {
                tracing::debug!(statement_id = id, error = %error, "closing evicted statement failed");
            }
        });
    }
}

/// Run a prepare exchange and return the server-assigned statement id.
async fn prepare_statement(client: &Client, sql: &str) -> Result<u32> {
    let mut stream = client
        .exchange(
            ClientMessage::StmtPrepare {
                sql: sql.to_string(),
            },
            ServerMessage::is_terminal,
        )
        .await?;
    let mut statement_id = None;
    while let Some(message) = stream.next().await {
        match message? {
            ServerMessage::PrepareOk(ok) => statement_id = Some(ok.statement_id),
            ServerMessage::Err(error) => return Err(error.into()),
            // Parameter and column definitions; the placeholder count is
            // derived from the SQL text, not from here.
            _ => {}
        }
    }
    statement_id.ok_or_else(|| Error::Protocol("prepare response missing its header".into()))
}
