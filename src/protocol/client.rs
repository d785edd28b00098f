//! Typed outbound protocol messages.

use crate::binding::Binding;

use super::codec::{write_cstring, write_lenenc_bytes, write_u32};
use super::server::Conversation;
use super::types::{capability, command};

/// Maximum packet size announced in the handshake response.
const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// Default charset: utf8mb4_general_ci.
const CHARSET_UTF8MB4: u8 = 45;

/// A typed message sent to the server.
#[derive(Debug)]
pub enum ClientMessage {
    /// SSL upgrade request, sent before the handshake response
    SslRequest {
        /// Capability flags the client will use
        capabilities: u32,
    },
    /// Handshake response (login)
    HandshakeResponse {
        /// Capability flags the client will use
        capabilities: u32,
        /// Username
        user: String,
        /// Scrambled password, plugin-specific
        auth_response: Vec<u8>,
        /// Database to select, if CONNECT_WITH_DB is negotiated
        database: Option<String>,
        /// Authentication plugin name
        auth_plugin: String,
        /// Envelope sequence id, continuing the handshake exchange
        sequence_id: u8,
    },
    /// Graceful termination (COM_QUIT); the server closes without replying
    Exit,
    /// Liveness check (COM_PING)
    Ping,
    /// Prepare a parameterized statement (COM_STMT_PREPARE)
    StmtPrepare {
        /// SQL text with `?` placeholders
        sql: String,
    },
    /// Execute a prepared statement with one binding row (COM_STMT_EXECUTE)
    StmtExecute {
        /// Server-assigned statement id
        statement_id: u32,
        /// Parameter values for this execution
        binding: Binding,
    },
    /// Close a prepared statement (COM_STMT_CLOSE); no server response
    StmtClose {
        /// Server-assigned statement id
        statement_id: u32,
    },
}

impl ClientMessage {
    /// Envelope sequence id for this message.
    ///
    /// Commands start a new exchange at 0; handshake-phase messages continue
    /// the server's sequence.
    pub fn sequence_id(&self) -> u8 {
        match self {
            ClientMessage::SslRequest { .. } => 1,
            ClientMessage::HandshakeResponse { sequence_id, .. } => *sequence_id,
            _ => 0,
        }
    }

    /// The response shape this message expects, if any.
    pub fn conversation(&self) -> Option<Conversation> {
        match self {
            ClientMessage::HandshakeResponse { .. } => Some(Conversation::Auth),
            ClientMessage::Ping => Some(Conversation::Command),
            ClientMessage::StmtPrepare { .. } => Some(Conversation::Prepare),
            ClientMessage::StmtExecute { .. } => Some(Conversation::Execute),
            ClientMessage::SslRequest { .. } | ClientMessage::Exit | ClientMessage::StmtClose { .. } => {
                None
            }
        }
    }

    /// Encode the payload (without envelope header) into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ClientMessage::SslRequest { capabilities } => {
                write_u32(buf, *capabilities | capability::SSL);
                write_u32(buf, MAX_PACKET_SIZE);
                buf.push(CHARSET_UTF8MB4);
                buf.resize(buf.len() + 23, 0);
            }
            ClientMessage::HandshakeResponse {
                capabilities,
                user,
                auth_response,
                database,
                auth_plugin,
                sequence_id: _,
            } => {
                write_u32(buf, *capabilities);
                write_u32(buf, MAX_PACKET_SIZE);
                buf.push(CHARSET_UTF8MB4);
                buf.resize(buf.len() + 23, 0);
                write_cstring(buf, user);
                if capabilities & capability::PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
                    write_lenenc_bytes(buf, auth_response);
                } else {
                    buf.push(auth_response.len() as u8);
                    buf.extend_from_slice(auth_response);
                }
                if capabilities & capability::CONNECT_WITH_DB != 0
                    && let Some(db) = database
                {
                    write_cstring(buf, db);
                }
                if capabilities & capability::PLUGIN_AUTH != 0 {
                    write_cstring(buf, auth_plugin);
                }
            }
            ClientMessage::Exit => buf.push(command::COM_QUIT),
            ClientMessage::Ping => buf.push(command::COM_PING),
            ClientMessage::StmtPrepare { sql } => {
                buf.push(command::COM_STMT_PREPARE);
                buf.extend_from_slice(sql.as_bytes());
            }
            ClientMessage::StmtExecute {
                statement_id,
                binding,
            } => {
                buf.push(command::COM_STMT_EXECUTE);
                write_u32(buf, *statement_id);
                buf.push(0x00); // CURSOR_TYPE_NO_CURSOR
                write_u32(buf, 1); // iteration count
                binding.encode_into(buf);
            }
            ClientMessage::StmtClose { statement_id } => {
                buf.push(command::COM_STMT_CLOSE);
                write_u32(buf, *statement_id);
            }
        }
    }

    /// Release resource-backed values owned by this message.
    ///
    /// Called when the message is rejected before it was ever sent.
    pub fn dispose(&mut self) {
        if let ClientMessage::StmtExecute { binding, .. } = self {
            binding.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::ParameterValue;

    #[test]
    fn quit_is_one_byte() {
        let mut buf = Vec::new();
        ClientMessage::Exit.encode(&mut buf);
        assert_eq!(buf, [command::COM_QUIT]);
    }

    #[test]
    fn execute_header_layout() {
        let mut binding = Binding::new(1);
        binding.add(0, ParameterValue::Int(42)).unwrap();
        let msg = ClientMessage::StmtExecute {
            statement_id: 5,
            binding,
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert_eq!(buf[0], command::COM_STMT_EXECUTE);
        assert_eq!(&buf[1..5], &5u32.to_le_bytes());
        assert_eq!(buf[5], 0x00);
        assert_eq!(&buf[6..10], &1u32.to_le_bytes());
    }

    #[test]
    fn dispose_releases_binding_values() {
        let mut binding = Binding::new(1);
        binding
            .add(0, ParameterValue::Text("large".repeat(100)))
            .unwrap();
        let mut msg = ClientMessage::StmtExecute {
            statement_id: 1,
            binding,
        };
        msg.dispose();
        let ClientMessage::StmtExecute { binding, .. } = &msg else {
            panic!("variant changed");
        };
        assert_eq!(binding.find_unbind(), Some(0));
    }
}
