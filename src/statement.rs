//! Parameterized statement execution.
//!
//! A [`Statement`] collects one or more binding rows, then `execute()` drives
//! prepare (through the statement cache) and one execute exchange per row.
//! Statements are single-use: `execute()` consumes the statement.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::binding::{Binding, Bindings, ParameterValue};
use crate::cache::{Prepared, StatementCache};
use crate::client::{Client, ServerStream};
use crate::codecs::{IntoValue, MysqlType, Value, decode_row};
use crate::error::{Error, Result};
use crate::protocol::server::{ColumnDefinition, OkPacket, Row};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::query::Query;

/// A parameterized statement bound to one connection.
#[derive(Debug)]
pub struct Statement {
    client: Client,
    cache: Arc<StatementCache>,
    query: Query,
    bindings: Bindings,
}

impl Statement {
    pub(crate) fn new(client: Client, cache: Arc<StatementCache>, query: Query) -> Self {
        let param_count = query.param_count();
        Self {
            client,
            cache,
            query,
            bindings: Bindings::new(param_count),
        }
    }

    /// Bind `value` to the parameter at `index` in the current row.
    pub fn bind(&mut self, index: usize, value: impl IntoValue) -> Result<&mut Self> {
        self.bindings.current().add(index, value.into_value())?;
        Ok(self)
    }

    /// Bind `value` to every position aliased by `name` in the current row.
    pub fn bind_named(&mut self, name: &str, value: impl IntoValue) -> Result<&mut Self> {
        let value = value.into_value();
        let indexes = self.query.indexes_of(name)?.to_vec();
        let row = self.bindings.current();
        for index in indexes {
            row.add(index, value.clone())?;
        }
        Ok(self)
    }

    /// Bind SQL NULL at `index`.
    ///
    /// The type witness is accepted for API robustness only; NULL travels in
    /// the bitmap and still counts as a filled position.
    pub fn bind_null(&mut self, index: usize, _hint: MysqlType) -> Result<&mut Self> {
        self.bindings.current().add(index, ParameterValue::Null)?;
        Ok(self)
    }

    /// Bind SQL NULL at every position aliased by `name`.
    pub fn bind_null_named(&mut self, name: &str, _hint: MysqlType) -> Result<&mut Self> {
        let indexes = self.query.indexes_of(name)?.to_vec();
        let row = self.bindings.current();
        for index in indexes {
            row.add(index, ParameterValue::Null)?;
        }
        Ok(self)
    }

    /// Finalize the current binding row and start a new one.
    ///
    /// Fails with [`Error::BindingIncomplete`] naming the lowest unfilled
    /// position if the row is not complete.
    pub fn add(&mut self) -> Result<&mut Self> {
        self.bindings.validated_finish()?;
        Ok(self)
    }

    /// Execute every bound row, yielding one [`QueryResult`] per row.
    ///
    /// Fails before any wire traffic if the connection is closed, a binding
    /// row is incomplete, or no row was bound for a statement that has
    /// parameters. A statement without parameters executes exactly once.
    pub async fn execute(mut self) -> Result<ResultStream> {
        if !self.client.is_connected() {
            self.bindings.clear();
            return Err(Error::State("connection is closed".into()));
        }
        if let Err(error) = self.bindings.validated_finish() {
            self.bindings.clear();
            return Err(error);
        }
        let mut rows: VecDeque<Binding> = self.bindings.take_rows().into();
        if rows.is_empty() {
            if self.query.param_count() == 0 {
                rows.push_back(Binding::new(0));
            } else {
                return Err(Error::InvalidUsage(
                    "no binding rows were added before execute".into(),
                ));
            }
        }
        let prepared = match self.cache.get_or_prepare(&self.client, self.query.sql()).await {
            Ok(prepared) => prepared,
            Err(error) => {
                clear_rows(&mut rows);
                return Err(error);
            }
        };
        Ok(ResultStream {
            client: self.client,
            prepared,
            rows,
            finished: false,
        })
    }
}

fn clear_rows(rows: &mut VecDeque<Binding>) {
    for row in rows.iter_mut() {
        row.clear();
    }
    rows.clear();
}

/// Results of a statement execution, one per binding row, in order.
#[derive(Debug)]
pub struct ResultStream {
    client: Client,
    prepared: Prepared,
    rows: VecDeque<Binding>,
    finished: bool,
}

impl ResultStream {
    /// Execute the next binding row and collect its result.
    ///
    /// Returns `None` once every row has executed. An error clears all
    /// remaining rows' values before it is returned; the stream then ends.
    pub async fn next_result(&mut self) -> Option<Result<QueryResult>> {
        if self.finished {
            return None;
        }
        let Some(binding) = self.rows.pop_front() else {
            self.finish();
            return None;
        };
        let exchange = self
            .client
            .exchange(
                ClientMessage::StmtExecute {
                    statement_id: self.prepared.id,
                    binding,
                },
                ServerMessage::is_terminal,
            )
            .await;
        let mut stream = match exchange {
            Ok(stream) => stream,
            Err(error) => {
                self.fail();
                return Some(Err(error));
            }
        };
        match collect_result(&mut stream).await {
            Ok(result) => {
                if self.rows.is_empty() {
                    self.finish();
                }
                Some(Ok(result))
            }
            Err(error) => {
                self.fail();
                Some(Err(error))
            }
        }
    }

    /// Run all remaining rows, discarding results, surfacing the first error.
    pub async fn drain(&mut self) -> Result<()> {
        while let Some(result) = self.next_result().await {
            let _ = result?;
        }
        Ok(())
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        // Uncached handles are server resources; close once the flow ends.
        // Cached handles stay open for reuse and are closed by eviction or
        // connection teardown.
        if !self.prepared.cached {
            close_statement(&self.client, self.prepared.id);
        }
    }

    fn fail(&mut self) {
        clear_rows(&mut self.rows);
        self.finish();
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        clear_rows(&mut self.rows);
        self.finish();
    }
}

fn close_statement(client: &Client, statement_id: u32) {
    let client = client.clone();
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let _ = handle.spawn(async move {
            if let Err(error) = client
                .send_only(ClientMessage::StmtClose { statement_id })
                .await
            {
                tracing::debug!(statement_id, error = %error, "closing statement failed");
            }
        });
    }
}

/// One binding row's complete result.
#[derive(Debug, Default)]
pub struct QueryResult {
    columns: Vec<ColumnDefinition>,
    rows: Vec<Row>,
    ok: Option<OkPacket>,
}

impl QueryResult {
    /// Column definitions of the result set, empty for non-queries.
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Raw result rows.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Decode every row against the column definitions.
    pub fn decode_rows(&self) -> Result<Vec<Vec<Value>>> {
        self.rows
            .iter()
            .map(|row| decode_row(row, &self.columns))
            .collect()
    }

    /// Rows changed, for data-modifying statements.
    pub fn affected_rows(&self) -> u64 {
        self.ok.map_or(0, |ok| ok.affected_rows)
    }

    /// Last AUTO_INCREMENT value generated.
    pub fn last_insert_id(&self) -> u64 {
        self.ok.map_or(0, |ok| ok.last_insert_id)
    }
}

async fn collect_result(stream: &mut ServerStream) -> Result<QueryResult> {
    let mut result = QueryResult::default();
    while let Some(message) = stream.next().await {
        match message? {
            ServerMessage::Ok(ok) => result.ok = Some(ok),
            ServerMessage::Err(error) => return Err(error.into()),
            ServerMessage::ColumnCount(_) => {}
            ServerMessage::Column(column) => result.columns.push(column),
            ServerMessage::Row(row) => result.rows.push(row),
            ServerMessage::Eof(_) => {}
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message in execute response: {other:?}"
                )));
            }
        }
    }
    Ok(result)
}
