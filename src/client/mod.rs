//! Single-connection exchange engine.
//!
//! One connection carries at most one in-flight request/response exchange.
//! Callers submit work through [`Client::exchange`], [`Client::send_only`] or
//! [`Client::receive_only`]; a FIFO [`RequestQueue`] serializes them. A
//! dedicated reader task decodes inbound envelopes into typed
//! [`ServerMessage`]s and feeds them to whichever exchange is active.

mod request_queue;
mod stream;

pub use stream::ServerStream;

use std::sync::Arc;
use std::sync::{Mutex as StdMutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::context::{ConnectionContext, ConnectionState};
use crate::error::{Error, Result};
use crate::protocol::codec::{read_envelope, write_envelope};
use crate::protocol::server::{ConversationQueue, conversation_queue};
use crate::protocol::{ClientMessage, Decoder, ServerMessage};

use request_queue::{RequestQueue, RequestTask};

/// Messages buffered between the reader task and the active exchange.
const INBOUND_CAPACITY: usize = 256;

/// Messages buffered between an exchange and its caller.
const EXCHANGE_CAPACITY: usize = 64;

type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of the connection plus the inbound message channel.
///
/// Held behind a single async mutex: the active exchange owns both ends for
/// its whole lifetime, which is what makes request/response interleaving
/// impossible.
struct Io {
    sink: BoxedSink,
    inbound: mpsc::Receiver<Result<ServerMessage>>,
    write_buf: Vec<u8>,
}

impl Io {
    async fn send(
        &mut self,
        message: &ClientMessage,
        conversations: &ConversationQueue,
        connection_id: u32,
    ) -> Result<()> {
        tracing::debug!(connection_id, request = ?message);
        // Register the expected response shape before any bytes hit the wire,
        // so the reader can never observe a response without its conversation.
        let registered = message.conversation();
        if let Some(conversation) = registered {
            lock_conversations(conversations)?.push_back(conversation);
        }
        self.write_buf.clear();
        message.encode(&mut self.write_buf);
        let result = write_envelope(&mut self.sink, message.sequence_id(), &self.write_buf).await;
        if result.is_err() && registered.is_some() {
            let _ = lock_conversations(conversations)?.pop_back();
        }
        result
    }
}

fn lock_conversations(
    conversations: &ConversationQueue,
) -> Result<MutexGuard<'_, std::collections::VecDeque<crate::protocol::Conversation>>> {
    conversations
        .lock()
        .map_err(|_| Error::Protocol("conversation queue poisoned".into()))
}

struct ClientInner {
    context: Arc<ConnectionContext>,
    queue: RequestQueue,
    io: Mutex<Io>,
    conversations: ConversationQueue,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

/// Handle to one connection's exchange engine. Cheap to clone.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection_id", &self.inner.context.connection_id())
            .field("state", &self.inner.context.state())
            .finish()
    }
}

impl Client {
    /// Take ownership of an established stream and start the reader task.
    ///
    /// The stream is split; the reader half is consumed by a spawned task
    /// that decodes envelopes until EOF, a fatal error, or abort.
    pub fn attach<S>(stream: S, context: Arc<ConnectionContext>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let conversations = conversation_queue();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let decoder = Decoder::new(Arc::clone(&conversations));
        let reader = tokio::spawn(read_loop(read_half, decoder, tx, Arc::clone(&context)));
        Self {
            inner: Arc::new(ClientInner {
                context,
                queue: RequestQueue::new(),
                io: Mutex::new(Io {
                    sink: Box::new(write_half),
                    inbound: rx,
                    write_buf: Vec::new(),
                }),
                conversations,
                reader: StdMutex::new(Some(reader)),
            }),
        }
    }

    /// Send `request` and stream its responses until `is_complete` matches.
    ///
    /// The exchange is queued FIFO behind earlier requests. The returned
    /// stream yields every message of the response including the one that
    /// matched the predicate; a fatal failure surfaces as a single `Err`.
    ///
    /// Dropping the stream before completion is an anomaly: the engine logs
    /// it and discards the rest of the response to stay synchronized.
    pub async fn exchange(
        &self,
        mut request: ClientMessage,
        is_complete: impl Fn(&ServerMessage) -> bool + Send + 'static,
    ) -> Result<ServerStream> {
        if !self.is_connected() {
            request.dispose();
            return Err(closed_error());
        }
        let (result_tx, result_rx) = oneshot::channel();
        let slot = Arc::new(StdMutex::new(Some(request)));
        let inner = Arc::clone(&self.inner);
        let producer_slot = Arc::clone(&slot);
        self.inner.queue.submit(RequestTask::new(
            move |release| {
                let request = take_message(&producer_slot);
                tokio::spawn(async move {
                    let _release = release;
                    run_exchange(&inner, request, is_complete, result_tx).await;
                });
            },
            move || dispose_slot(&slot),
        ));
        result_rx.await.map_err(|_| closed_error())
    }

    /// Send `request` without expecting any response (COM_QUIT,
    /// COM_STMT_CLOSE).
    pub async fn send_only(&self, mut request: ClientMessage) -> Result<()> {
        if !self.is_connected() {
            request.dispose();
            return Err(closed_error());
        }
        let (result_tx, result_rx) = oneshot::channel();
        let slot = Arc::new(StdMutex::new(Some(request)));
        let inner = Arc::clone(&self.inner);
        let producer_slot = Arc::clone(&slot);
        self.inner.queue.submit(RequestTask::new(
            move |release| {
                let request = take_message(&producer_slot);
                tokio::spawn(async move {
                    let _release = release;
                    let Some(request) = request else { return };
                    let connection_id = inner.context.connection_id();
                    let mut io = inner.io.lock().await;
                    let result = io.send(&request, &inner.conversations, connection_id).await;
                    if let Err(error) = &result
                        && error.is_fatal()
                    {
                        inner.context.transition(ConnectionState::Closed);
                    }
                    let _ = result_tx.send(result);
                });
            },
            move || dispose_slot(&slot),
        ));
        result_rx.await.map_err(|_| closed_error())?
    }

    /// Receive a single message without sending anything first.
    ///
    /// Used for server-initiated messages such as the initial handshake when
    /// the reader task is already running.
    pub async fn receive_only(&self) -> Result<ServerMessage> {
        if !self.is_connected() {
            return Err(closed_error());
        }
        let (result_tx, result_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.queue.submit(RequestTask::new(
            move |release| {
                tokio::spawn(async move {
                    let _release = release;
                    let connection_id = inner.context.connection_id();
                    let mut io = inner.io.lock().await;
                    let message = match io.inbound.recv().await {
                        Some(message) => message,
                        None => Err(closed_error()),
                    };
                    if result_tx.send(message).is_err() {
                        tracing::error!(
                            connection_id,
                            "receive-only request cancelled after a message was consumed"
                        );
                    }
                });
            },
            || {},
        ));
        result_rx.await.map_err(|_| closed_error())?
    }

    /// Graceful close: queue an exit message behind in-flight requests, then
    /// tear the connection down. Idempotent; later calls return immediately.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.context.begin_closing() {
            return Ok(());
        }
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let inner = Arc::clone(&self.inner);
        self.inner.queue.submit(RequestTask::new(
            move |release| {
                tokio::spawn(async move {
                    let _release = release;
                    let connection_id = inner.context.connection_id();
                    let mut io = inner.io.lock().await;
                    if let Err(error) = io
                        .send(&ClientMessage::Exit, &inner.conversations, connection_id)
                        .await
                    {
                        tracing::error!(
                            connection_id,
                            error = %error,
                            "sending the exit message failed, terminating anyway"
                        );
                    }
                    shutdown_io(&inner, &mut io).await;
                    let _ = done_tx.send(());
                });
            },
            || {},
        ));
        // A rejected task means another path already tore the connection down.
        let _ = done_rx.await;
        self.abort_reader();
        self.inner.queue.close();
        Ok(())
    }

    /// Immediate teardown: abort the reader, reject all pending requests and
    /// shut the socket down without sending an exit message.
    pub async fn force_close(&self) -> Result<()> {
        self.inner.context.begin_closing();
        // Aborting the reader drops the inbound sender, which unblocks the
        // active exchange and lets it release the io lock.
        self.abort_reader();
        self.inner.queue.close();
        let mut io = self.inner.io.lock().await;
        shutdown_io(&self.inner, &mut io).await;
        Ok(())
    }

    /// Whether the connection still accepts new requests.
    pub fn is_connected(&self) -> bool {
        self.inner.context.state() < ConnectionState::Closing
    }

    /// Mark authentication as finished; the connection enters the command
    /// phase.
    pub fn login_success(&self) {
        self.inner.context.transition(ConnectionState::Ready);
        tracing::debug!(
            connection_id = self.inner.context.connection_id(),
            "login succeeded"
        );
    }

    /// Shared connection context.
    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.inner.context
    }

    fn abort_reader(&self) {
        let handle = match self.inner.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

fn closed_error() -> Error {
    Error::State("connection is closed".into())
}

fn take_message(slot: &Arc<StdMutex<Option<ClientMessage>>>) -> Option<ClientMessage> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn dispose_slot(slot: &Arc<StdMutex<Option<ClientMessage>>>) {
    if let Some(mut message) = take_message(slot) {
        message.dispose();
    }
}

async fn run_exchange(
    inner: &Arc<ClientInner>,
    request: Option<ClientMessage>,
    is_complete: impl Fn(&ServerMessage) -> bool + Send,
    result_tx: oneshot::Sender<ServerStream>,
) {
    let Some(request) = request else { return };
    let (tx, stream) = ServerStream::channel(EXCHANGE_CAPACITY);
    if result_tx.send(stream).is_err() {
        // Caller went away before activation; nothing was sent yet.
        let mut request = request;
        request.dispose();
        return;
    }
    let connection_id = inner.context.connection_id();
    let mut io = inner.io.lock().await;
    if let Err(error) = io.send(&request, &inner.conversations, connection_id).await {
        if error.is_fatal() {
            inner.context.transition(ConnectionState::Closed);
        }
        let _ = tx.send(Err(error)).await;
        return;
    }
    let mut cancelled = false;
    loop {
        let Some(message) = io.inbound.recv().await else {
            if !cancelled {
                let _ = tx.send(Err(closed_error())).await;
            }
            break;
        };
        match message {
            Err(error) => {
                if !cancelled {
                    let _ = tx.send(Err(error)).await;
                }
                break;
            }
            Ok(message) => {
                let done = is_complete(&message);
                if !cancelled && tx.send(Ok(message)).await.is_err() {
                    cancelled = true;
                    if !done {
                        tracing::error!(
                            connection_id,
                            "exchange cancelled before its response completed; \
                             discarding the remainder to stay synchronized"
                        );
                    }
                }
                if done {
                    break;
                }
            }
        }
    }
}

async fn shutdown_io(inner: &ClientInner, io: &mut Io) {
    if let Err(error) = io.sink.shutdown().await {
        tracing::debug!(
            connection_id = inner.context.connection_id(),
            error = %error,
            "socket shutdown failed"
        );
    }
    io.inbound.close();
    inner.context.transition(ConnectionState::Closed);
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    mut decoder: Decoder,
    tx: mpsc::Sender<Result<ServerMessage>>,
    context: Arc<ConnectionContext>,
) {
    loop {
        let envelope = match read_envelope(&mut reader).await {
            Ok(envelope) => envelope,
            Err(error) => {
                if context.state() < ConnectionState::Closing {
                    tracing::error!(
                        connection_id = context.connection_id(),
                        error = %error,
                        "inbound stream failed"
                    );
                    context.transition(ConnectionState::Closed);
                    let _ = tx.send(Err(error)).await;
                } else {
                    tracing::debug!(
                        connection_id = context.connection_id(),
                        "inbound stream ended"
                    );
                }
                break;
            }
        };
        let message = match decoder.decode(&envelope.payload) {
            Ok(message) => message,
            Err(error) => {
                tracing::error!(
                    connection_id = context.connection_id(),
                    error = %error,
                    "response decoding failed"
                );
                context.transition(ConnectionState::Closed);
                let _ = tx.send(Err(error)).await;
                break;
            }
        };
        if let Some(warnings) = message.warnings()
            && warnings > 0
        {
            tracing::info!(
                connection_id = context.connection_id(),
                warnings,
                "server reported warnings"
            );
        }
        tracing::debug!(connection_id = context.connection_id(), response = ?message);
        if tx.send(Ok(message)).await.is_err() {
            break;
        }
    }
}
