//! Connection establishment and the public connection handle.
//!
//! `Conn::new` runs the connection phase: TCP connect, handshake, optional
//! SSL upgrade, then login. After login the connection is in the command
//! phase and statements can be created from it.

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::auth;
use crate::cache::StatementCache;
use crate::client::Client;
use crate::context::{ConnectionContext, ConnectionState, SslState};
use crate::error::{Error, Result};
use crate::opts::{Opts, SslMode};
use crate::protocol::codec::read_envelope;
use crate::protocol::server::parse_handshake;
use crate::protocol::types::capability;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::query::Query;
use crate::statement::Statement;

/// An established MySQL connection.
#[derive(Debug, Clone)]
pub struct Conn {
    client: Client,
    cache: Arc<StatementCache>,
}

impl Conn {
    /// Connect using a `mysql://` URL.
    pub async fn new(url: &str) -> Result<Self> {
        let opts = Opts::try_from(url)?;
        Self::connect(&opts).await
    }

    /// Connect with explicit options.
    pub async fn connect(opts: &Opts) -> Result<Self> {
        // Cache misconfiguration fails before any wire traffic.
        let cache = Arc::new(StatementCache::new(opts.statement_cache)?);

        let mut stream = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
        stream.set_nodelay(true)?;
        let context = Arc::new(ConnectionContext::new());

        // The handshake is read before the reader task exists: an SSL
        // upgrade replaces the stream underneath everything else.
        let envelope = read_envelope(&mut stream).await?;
        let handshake = parse_handshake(&envelope.payload)?;
        context.init_handshake(
            handshake.connection_id,
            &handshake.server_version,
            handshake.capabilities,
        );
        if handshake.capabilities & capability::PROTOCOL_41 == 0 {
            return Err(Error::Unsupported(
                "server does not support the 4.1 protocol".into(),
            ));
        }

        let mut wanted = capability::PROTOCOL_41
            | capability::SECURE_CONNECTION
            | capability::TRANSACTIONS
            | capability::PLUGIN_AUTH
            | capability::PLUGIN_AUTH_LENENC_CLIENT_DATA;
        if opts.database.is_some() {
            wanted |= capability::CONNECT_WITH_DB;
        }
        let mut capabilities = wanted & handshake.capabilities;

        let server_ssl = handshake.capabilities & capability::SSL != 0;
        let use_ssl = match opts.ssl_mode {
            SslMode::Disable => false,
            SslMode::Prefer => server_ssl && cfg!(feature = "tls"),
            SslMode::Require => {
                if !server_ssl {
                    context.ssl_unsupported();
                    return Err(Error::Auth(
                        "SSL required but the server does not support it".into(),
                    ));
                }
                if !cfg!(feature = "tls") {
                    return Err(Error::Unsupported(
                        "SSL required but built without the `tls` feature".into(),
                    ));
                }
                true
            }
        };
        if use_ssl {
            capabilities |= capability::SSL;
        }

        #[cfg(feature = "tls")]
        let client = if use_ssl {
            context.transition(ConnectionState::SslUpgrade);
            let request = ClientMessage::SslRequest { capabilities };
            let mut payload = Vec::new();
            request.encode(&mut payload);
            crate::protocol::codec::write_envelope(&mut stream, request.sequence_id(), &payload)
                .await?;
            let connector =
                tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
            let stream = connector
                .connect(&opts.host, stream)
                .await
                .map_err(|error| Error::Auth(format!("TLS negotiation failed: {error}")))?;
            context.ssl_negotiated();
            Client::attach(stream, Arc::clone(&context))
        } else {
            context.ssl_negotiated();
            Client::attach(stream, Arc::clone(&context))
        };
        #[cfg(not(feature = "tls"))]
        let client = {
            context.ssl_negotiated();
            Client::attach(stream, Arc::clone(&context))
        };

        context.transition(ConnectionState::Authenticating);
        let plugin = if handshake.auth_plugin.is_empty() {
            auth::NATIVE_PASSWORD
        } else {
            handshake.auth_plugin.as_str()
        };
        let password = opts.password.as_deref().unwrap_or("");
        let login = async {
            let auth_response = auth::scramble(plugin, password, &handshake.auth_seed)?;
            context.set_capabilities(capabilities);
            let response = ClientMessage::HandshakeResponse {
                capabilities,
                user: opts.user.clone(),
                auth_response,
                database: opts.database.clone(),
                auth_plugin: plugin.to_string(),
                sequence_id: if use_ssl { 2 } else { 1 },
            };
            authenticate(&client, response).await
        };
        if let Err(error) = login.await {
            let _ = client.force_close().await;
            return Err(error);
        }
        client.login_success();
        tracing::info!(
            connection_id = context.connection_id(),
            server_version = context.server_version(),
            ssl = ?context.ssl_state(),
            "connected"
        );
        Ok(Self { client, cache })
    }

    /// Create a parameterized statement from `sql`.
    ///
    /// Placeholders are `?` or `?name`; see [`Query`](crate::query::Query).
    pub fn statement(&self, sql: &str) -> Statement {
        Statement::new(
            self.client.clone(),
            Arc::clone(&self.cache),
            Query::parse(sql),
        )
    }

    /// Check that the server still responds.
    pub async fn ping(&self) -> Result<()> {
        let mut stream = self
            .client
            .exchange(ClientMessage::Ping, ServerMessage::is_terminal)
            .await?;
        while let Some(message) = stream.next().await {
            if let ServerMessage::Err(error) = message? {
                return Err(error.into());
            }
        }
        Ok(())
    }

    /// Gracefully close the connection, letting queued requests finish.
    pub async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    /// Tear the connection down immediately, rejecting queued requests.
    pub async fn force_close(&self) -> Result<()> {
        self.client.force_close().await
    }

    /// Whether the connection still accepts requests.
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Server-assigned connection id.
    pub fn connection_id(&self) -> u32 {
        self.client.context().connection_id()
    }

    /// How SSL negotiation concluded for this connection.
    pub fn ssl_state(&self) -> SslState {
        self.client.context().ssl_state()
    }

    /// Server version string from the handshake.
    pub fn server_version(&self) -> String {
        self.client.context().server_version().to_string()
    }
}

/// Drive the login exchange to its OK or error.
async fn authenticate(client: &Client, response: ClientMessage) -> Result<()> {
    let mut stream = client
        .exchange(response, ServerMessage::is_terminal)
        .await?;
    while let Some(message) = stream.next().await {
        match message? {
            ServerMessage::Ok(_) => return Ok(()),
            ServerMessage::Err(error) => return Err(Error::Auth(error.to_string())),
            ServerMessage::AuthMoreData(data) => match data.first() {
                // Fast-path success; the OK packet follows.
                Some(&auth::FAST_AUTH_OK) => {}
                Some(&auth::FULL_AUTH_REQUIRED) => {
                    return Err(Error::Unsupported(
                        "caching_sha2_password full authentication requires a secure channel"
                            .into(),
                    ));
                }
                _ => {
                    return Err(Error::Protocol(
                        "unexpected authentication continuation".into(),
                    ));
                }
            },
            ServerMessage::AuthSwitch { plugin, .. } => {
                return Err(Error::Unsupported(format!(
                    "authentication plugin switch to {plugin:?}"
                )));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message during login: {other:?}"
                )));
            }
        }
    }
    Err(Error::State("connection closed during login".into()))
}
