//! Typed inbound protocol messages and the response decoder.
//!
//! The decoder is stateful: how a payload is interpreted depends on which
//! command is currently awaiting its response. The outbound path registers a
//! [`Conversation`] per request that expects a reply, and the decoder walks
//! through that conversation's phases as payloads arrive. The wire protocol
//! permits exactly one outstanding command, so conversations are consumed
//! strictly in registration order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result, ServerError};

use super::codec::{
    read_bytes, read_cstring, read_lenenc_bytes, read_lenenc_int, read_u8, read_u16, read_u32,
    decode_utf8,
};
use super::types::capability;

/// Initial handshake payload from the server.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Protocol version (10 for every supported server)
    pub protocol_version: u8,
    /// Human-readable server version
    pub server_version: String,
    /// Server-assigned connection (thread) id
    pub connection_id: u32,
    /// Capability flags advertised by the server
    pub capabilities: u32,
    /// Auth plugin seed (scramble), both halves concatenated
    pub auth_seed: Vec<u8>,
    /// Name of the default authentication plugin
    pub auth_plugin: String,
}

/// OK packet: successful completion of a command.
#[derive(Debug, Clone, Copy)]
pub struct OkPacket {
    /// Rows changed by the statement
    pub affected_rows: u64,
    /// Last AUTO_INCREMENT value
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings generated
    pub warnings: u16,
}

/// EOF packet, ending a column-definition or row phase.
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    /// Number of warnings generated
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
    /// Whether this EOF ends the whole server response
    pub ends_response: bool,
}

/// COM_STMT_PREPARE response header.
#[derive(Debug, Clone, Copy)]
pub struct PrepareOk {
    /// Server-assigned statement id, valid only on this connection
    pub statement_id: u32,
    /// Number of columns in the result set
    pub column_count: u16,
    /// Number of parameter placeholders
    pub param_count: u16,
    /// Number of warnings generated during prepare
    pub warnings: u16,
}

/// Column definition within a prepare or execute response.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    /// Schema the column belongs to
    pub schema: String,
    /// Table alias
    pub table: String,
    /// Column alias
    pub name: String,
    /// Character set number
    pub charset: u16,
    /// Maximum column length
    pub column_length: u32,
    /// Wire type byte
    pub type_byte: u8,
    /// Column flags
    pub flags: u16,
    /// Decimal digits
    pub decimals: u8,
}

/// One result row with its owned payload.
///
/// Decoding individual values is the codec registry's concern.
#[derive(Debug, Clone)]
pub struct Row {
    /// Raw payload bytes of the row packet
    pub payload: Vec<u8>,
}

/// A typed message received from the server.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Initial handshake (connection phase)
    Handshake(Handshake),
    /// Successful completion
    Ok(OkPacket),
    /// Server error
    Err(ServerError),
    /// End of a column or row phase
    Eof(EofPacket),
    /// Prepare response header
    PrepareOk(PrepareOk),
    /// Column count preceding the column definitions of a result set
    ColumnCount(u64),
    /// Column definition
    Column(ColumnDefinition),
    /// One result row
    Row(Row),
    /// Extra authentication data (e.g. caching_sha2 fast-auth status)
    AuthMoreData(Vec<u8>),
    /// Server requests switching to another auth plugin
    AuthSwitch {
        /// Requested plugin name
        plugin: String,
        /// Plugin-specific seed
        data: Vec<u8>,
    },
}

impl ServerMessage {
    /// Whether this message ends the current server response.
    ///
    /// Used as the completion predicate for most exchanges.
    pub fn is_terminal(&self) -> bool {
        match self {
            ServerMessage::Ok(_) | ServerMessage::Err(_) => true,
            ServerMessage::Eof(eof) => eof.ends_response,
            ServerMessage::PrepareOk(ok) => ok.column_count == 0 && ok.param_count == 0,
            _ => false,
        }
    }

    /// Warning count carried by this message, if any.
    pub fn warnings(&self) -> Option<u16> {
        match self {
            ServerMessage::Ok(ok) => Some(ok.warnings),
            ServerMessage::Eof(eof) => Some(eof.warnings),
            ServerMessage::PrepareOk(ok) => Some(ok.warnings),
            _ => None,
        }
    }
}

/// The response shape expected for one outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversation {
    /// Single OK/ERR (COM_PING and friends)
    Command,
    /// Authentication: OK/ERR with possible AuthMoreData/AuthSwitch between
    Auth,
    /// COM_STMT_PREPARE response: header, parameter and column definitions
    Prepare,
    /// COM_STMT_EXECUTE response: OK or a binary result set
    Execute,
}

/// FIFO of conversations registered by the outbound path and consumed by the
/// decoder. Shared between the writer and reader tasks.
pub type ConversationQueue = Arc<Mutex<VecDeque<Conversation>>>;

/// Create an empty conversation queue.
pub fn conversation_queue() -> ConversationQueue {
    Arc::new(Mutex::new(VecDeque::new()))
}

#[derive(Debug)]
enum Phase {
    Idle,
    Auth,
    PrepareHead,
    PrepareParams { remaining: u16, columns_after: u16 },
    PrepareColumns { remaining: u16 },
    ExecuteHead,
    ExecuteColumns { remaining: u64 },
    ExecuteRows,
}

/// Stateful payload decoder for one connection.
#[derive(Debug)]
pub struct Decoder {
    conversations: ConversationQueue,
    phase: Phase,
}

fn is_eof(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0xFE && payload.len() < 9
}

impl Decoder {
    /// Create a decoder consuming conversations from `conversations`.
    pub fn new(conversations: ConversationQueue) -> Self {
        Self {
            conversations,
            phase: Phase::Idle,
        }
    }

    /// Decode one envelope payload into a typed message.
    ///
    /// A payload that fits no expected shape is a fatal protocol error; the
    /// connection must be torn down by the caller.
    pub fn decode(&mut self, payload: &[u8]) -> Result<ServerMessage> {
        if matches!(self.phase, Phase::Idle) {
            let next = {
                let mut queue = self
                    .conversations
                    .lock()
                    .map_err(|_| Error::Protocol("conversation queue poisoned".into()))?;
                queue.pop_front()
            };
            self.phase = match next {
                Some(Conversation::Command) | None => return decode_command(payload),
                Some(Conversation::Auth) => Phase::Auth,
                Some(Conversation::Prepare) => Phase::PrepareHead,
                Some(Conversation::Execute) => Phase::ExecuteHead,
            };
        }
        self.step(payload)
    }

    fn step(&mut self, payload: &[u8]) -> Result<ServerMessage> {
        let first = payload.first().copied().unwrap_or(0xFF);
        match self.phase {
            Phase::Idle => decode_command(payload),
            Phase::Auth => match first {
                0x00 => {
                    self.phase = Phase::Idle;
                    Ok(ServerMessage::Ok(parse_ok(payload)?))
                }
                0xFF => {
                    self.phase = Phase::Idle;
                    Ok(ServerMessage::Err(parse_err(payload)?))
                }
                0x01 => Ok(ServerMessage::AuthMoreData(payload[1..].to_vec())),
                0xFE => {
                    let (_, rest) = read_u8(payload)?;
                    let (plugin, rest) = read_cstring(rest)?;
                    Ok(ServerMessage::AuthSwitch {
                        plugin: plugin.to_string(),
                        data: rest.to_vec(),
                    })
                }
                other => Err(Error::Protocol(format!(
                    "unexpected auth packet header: 0x{other:02X}"
                ))),
            },
            Phase::PrepareHead => match first {
                0x00 => {
                    let ok = parse_prepare_ok(payload)?;
                    self.phase = if ok.param_count > 0 {
                        Phase::PrepareParams {
                            remaining: ok.param_count,
                            columns_after: ok.column_count,
                        }
                    } else if ok.column_count > 0 {
                        Phase::PrepareColumns {
                            remaining: ok.column_count,
                        }
                    } else {
                        Phase::Idle
                    };
                    Ok(ServerMessage::PrepareOk(ok))
                }
                0xFF => {
                    self.phase = Phase::Idle;
                    Ok(ServerMessage::Err(parse_err(payload)?))
                }
                other => Err(Error::Protocol(format!(
                    "unexpected prepare response header: 0x{other:02X}"
                ))),
            },
            Phase::PrepareParams {
                remaining,
                columns_after,
            } => {
                if is_eof(payload) {
                    let ends_response = columns_after == 0;
                    self.phase = if ends_response {
                        Phase::Idle
                    } else {
                        Phase::PrepareColumns {
                            remaining: columns_after,
                        }
                    };
                    return Ok(ServerMessage::Eof(parse_eof(payload, ends_response)?));
                }
                self.phase = Phase::PrepareParams {
                    remaining: remaining.saturating_sub(1),
                    columns_after,
                };
                Ok(ServerMessage::Column(parse_column(payload)?))
            }
            Phase::PrepareColumns { remaining } => {
                if is_eof(payload) {
                    self.phase = Phase::Idle;
                    return Ok(ServerMessage::Eof(parse_eof(payload, true)?));
                }
                self.phase = Phase::PrepareColumns {
                    remaining: remaining.saturating_sub(1),
                };
                Ok(ServerMessage::Column(parse_column(payload)?))
            }
            Phase::ExecuteHead => match first {
                0x00 => {
                    self.phase = Phase::Idle;
                    Ok(ServerMessage::Ok(parse_ok(payload)?))
                }
                0xFF => {
                    self.phase = Phase::Idle;
                    Ok(ServerMessage::Err(parse_err(payload)?))
                }
                _ => {
                    let (count, rest) = read_lenenc_int(payload)?;
                    if !rest.is_empty() {
                        return Err(Error::Protocol(
                            "trailing bytes after result column count".into(),
                        ));
                    }
                    self.phase = Phase::ExecuteColumns { remaining: count };
                    Ok(ServerMessage::ColumnCount(count))
                }
            },
            Phase::ExecuteColumns { remaining } => {
                if is_eof(payload) {
                    self.phase = Phase::ExecuteRows;
                    return Ok(ServerMessage::Eof(parse_eof(payload, false)?));
                }
                self.phase = Phase::ExecuteColumns {
                    remaining: remaining.saturating_sub(1),
                };
                Ok(ServerMessage::Column(parse_column(payload)?))
            }
            Phase::ExecuteRows => {
                if is_eof(payload) {
                    self.phase = Phase::Idle;
                    return Ok(ServerMessage::Eof(parse_eof(payload, true)?));
                }
                if first == 0xFF {
                    self.phase = Phase::Idle;
                    return Ok(ServerMessage::Err(parse_err(payload)?));
                }
                Ok(ServerMessage::Row(Row {
                    payload: payload.to_vec(),
                }))
            }
        }
    }
}

fn decode_command(payload: &[u8]) -> Result<ServerMessage> {
    let first = payload.first().copied().unwrap_or(0xFF);
    match first {
        0x00 => Ok(ServerMessage::Ok(parse_ok(payload)?)),
        0xFF => Ok(ServerMessage::Err(parse_err(payload)?)),
        0xFE if payload.len() < 9 => Ok(ServerMessage::Eof(parse_eof(payload, true)?)),
        other => Err(Error::Protocol(format!(
            "unexpected packet header outside a command: 0x{other:02X}"
        ))),
    }
}

/// Parse the initial handshake (protocol version 10).
pub fn parse_handshake(payload: &[u8]) -> Result<Handshake> {
    let (protocol_version, rest) = read_u8(payload)?;
    if protocol_version != 10 {
        return Err(Error::Protocol(format!(
            "unsupported handshake protocol version: {protocol_version}"
        )));
    }
    let (server_version, rest) = read_cstring(rest)?;
    let server_version = server_version.to_string();
    let (connection_id, rest) = read_u32(rest)?;
    let (seed_part1, rest) = read_bytes(rest, 8)?;
    let mut auth_seed = seed_part1.to_vec();
    let (_filler, rest) = read_u8(rest)?;
    let (caps_lower, rest) = read_u16(rest)?;

    // Everything below is optional in ancient servers; treat absence as zero.
    let mut capabilities = u32::from(caps_lower);
    let mut auth_plugin = String::new();
    if !rest.is_empty() {
        let (_charset, rest) = read_u8(rest)?;
        let (_status, rest) = read_u16(rest)?;
        let (caps_upper, rest) = read_u16(rest)?;
        capabilities |= u32::from(caps_upper) << 16;
        let (auth_data_len, rest) = read_u8(rest)?;
        let (_reserved, rest) = read_bytes(rest, 10)?;
        let rest = if capabilities & capability::SECURE_CONNECTION != 0 {
            let part2_len = (usize::from(auth_data_len).max(8) - 8).max(13) - 1;
            let (seed_part2, rest) = read_bytes(rest, part2_len)?;
            auth_seed.extend_from_slice(seed_part2);
            // Trailing NUL after the second scramble half
            let (_, rest) = read_u8(rest)?;
            rest
        } else {
            rest
        };
        if capabilities & capability::PLUGIN_AUTH != 0 {
            let (plugin, _) = read_cstring(rest)?;
            auth_plugin = plugin.to_string();
        }
    }

    Ok(Handshake {
        protocol_version,
        server_version,
        connection_id,
        capabilities,
        auth_seed,
        auth_plugin,
    })
}

fn parse_ok(payload: &[u8]) -> Result<OkPacket> {
    let (_header, rest) = read_u8(payload)?;
    let (affected_rows, rest) = read_lenenc_int(rest)?;
    let (last_insert_id, rest) = read_lenenc_int(rest)?;
    let (status_flags, rest) = read_u16(rest)?;
    let (warnings, _rest) = read_u16(rest)?;
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
    })
}

fn parse_eof(payload: &[u8], ends_response: bool) -> Result<EofPacket> {
    let (_header, rest) = read_u8(payload)?;
    let (warnings, rest) = read_u16(rest)?;
    let (status_flags, _rest) = read_u16(rest)?;
    Ok(EofPacket {
        warnings,
        status_flags,
        ends_response,
    })
}

fn parse_err(payload: &[u8]) -> Result<ServerError> {
    let (_header, rest) = read_u8(payload)?;
    let (code, rest) = read_u16(rest)?;
    let (sql_state, rest) = if rest.first() == Some(&b'#') {
        let (marker, rest) = read_bytes(rest, 6)?;
        (Some(decode_utf8(&marker[1..])?.to_string()), rest)
    } else {
        (None, rest)
    };
    Ok(ServerError {
        code,
        sql_state,
        message: decode_utf8(rest)?.to_string(),
    })
}

fn parse_prepare_ok(payload: &[u8]) -> Result<PrepareOk> {
    let (_header, rest) = read_u8(payload)?;
    let (statement_id, rest) = read_u32(rest)?;
    let (column_count, rest) = read_u16(rest)?;
    let (param_count, rest) = read_u16(rest)?;
    let (_filler, rest) = read_u8(rest)?;
    let (warnings, _rest) = read_u16(rest)?;
    Ok(PrepareOk {
        statement_id,
        column_count,
        param_count,
        warnings,
    })
}

fn parse_column(payload: &[u8]) -> Result<ColumnDefinition> {
    let (_catalog, rest) = read_lenenc_bytes(payload)?;
    let (schema, rest) = read_lenenc_bytes(rest)?;
    let (table, rest) = read_lenenc_bytes(rest)?;
    let (_org_table, rest) = read_lenenc_bytes(rest)?;
    let (name, rest) = read_lenenc_bytes(rest)?;
    let (_org_name, rest) = read_lenenc_bytes(rest)?;
    let (_fixed_len, rest) = read_lenenc_int(rest)?;
    let (charset, rest) = read_u16(rest)?;
    let (column_length, rest) = read_u32(rest)?;
    let (type_byte, rest) = read_u8(rest)?;
    let (flags, rest) = read_u16(rest)?;
    let (decimals, _rest) = read_u8(rest)?;
    Ok(ColumnDefinition {
        schema: decode_utf8(schema)?.to_string(),
        table: decode_utf8(table)?.to_string(),
        name: decode_utf8(name)?.to_string(),
        charset,
        column_length,
        type_byte,
        flags,
        decimals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{write_lenenc_int, write_u16 as w16, write_u32 as w32};

    fn ok_payload(affected: u64, warnings: u16) -> Vec<u8> {
        let mut buf = vec![0x00];
        write_lenenc_int(&mut buf, affected);
        write_lenenc_int(&mut buf, 0);
        w16(&mut buf, 0x0002);
        w16(&mut buf, warnings);
        buf
    }

    fn err_payload(code: u16, message: &str) -> Vec<u8> {
        let mut buf = vec![0xFF];
        w16(&mut buf, code);
        buf.extend_from_slice(b"#HY000");
        buf.extend_from_slice(message.as_bytes());
        buf
    }

    #[test]
    fn command_ok_and_err() {
        let mut decoder = Decoder::new(conversation_queue());
        let msg = decoder.decode(&ok_payload(3, 1)).unwrap();
        match msg {
            ServerMessage::Ok(ok) => {
                assert_eq!(ok.affected_rows, 3);
                assert_eq!(ok.warnings, 1);
                assert!(ServerMessage::Ok(ok).is_terminal());
            }
            other => panic!("expected Ok, got {other:?}"),
        }

        let msg = decoder.decode(&err_payload(1064, "syntax error")).unwrap();
        match msg {
            ServerMessage::Err(e) => {
                assert_eq!(e.code, 1064);
                assert_eq!(e.sql_state.as_deref(), Some("HY000"));
                assert_eq!(e.message, "syntax error");
            }
            other => panic!("expected Err, got {other:?}"),
        }
    }

    #[test]
    fn unknown_header_is_protocol_error() {
        let mut decoder = Decoder::new(conversation_queue());
        assert!(decoder.decode(&[0x42, 0, 0]).is_err());
    }

    fn column_payload(name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        for field in ["def", "db", "t", "t", name, name] {
            crate::protocol::codec::write_lenenc_bytes(&mut buf, field.as_bytes());
        }
        write_lenenc_int(&mut buf, 0x0C);
        w16(&mut buf, 33);
        w32(&mut buf, 255);
        buf.push(0xFD);
        w16(&mut buf, 0);
        buf.push(0);
        w16(&mut buf, 0); // filler
        buf
    }

    #[test]
    fn prepare_conversation() {
        let queue = conversation_queue();
        queue.lock().unwrap().push_back(Conversation::Prepare);
        let mut decoder = Decoder::new(Arc::clone(&queue));

        // PREPARE_OK: 1 param, 1 column
        let mut head = vec![0x00];
        w32(&mut head, 7);
        w16(&mut head, 1); // columns
        w16(&mut head, 1); // params
        head.push(0);
        w16(&mut head, 0);

        let msg = decoder.decode(&head).unwrap();
        let ServerMessage::PrepareOk(ok) = msg else {
            panic!("expected PrepareOk");
        };
        assert_eq!(ok.statement_id, 7);
        assert!(!ServerMessage::PrepareOk(ok).is_terminal());

        assert!(matches!(
            decoder.decode(&column_payload("p0")).unwrap(),
            ServerMessage::Column(_)
        ));
        // EOF after params does not end the response
        let eof = decoder.decode(&[0xFE, 0, 0, 2, 0]).unwrap();
        assert!(!eof.is_terminal());
        assert!(matches!(
            decoder.decode(&column_payload("c0")).unwrap(),
            ServerMessage::Column(_)
        ));
        // EOF after columns ends it
        let eof = decoder.decode(&[0xFE, 0, 0, 2, 0]).unwrap();
        assert!(eof.is_terminal());
    }

    #[test]
    fn execute_conversation_with_rows() {
        let queue = conversation_queue();
        queue.lock().unwrap().push_back(Conversation::Execute);
        let mut decoder = Decoder::new(Arc::clone(&queue));

        assert!(matches!(
            decoder.decode(&[0x01]).unwrap(),
            ServerMessage::ColumnCount(1)
        ));
        assert!(matches!(
            decoder.decode(&column_payload("n")).unwrap(),
            ServerMessage::Column(_)
        ));
        assert!(!decoder.decode(&[0xFE, 0, 0, 2, 0]).unwrap().is_terminal());
        assert!(matches!(
            decoder.decode(&[0x00, 0x00, 0x05]).unwrap(),
            ServerMessage::Row(_)
        ));
        assert!(decoder.decode(&[0xFE, 0, 0, 2, 0]).unwrap().is_terminal());

        // Back to idle: next OK decodes as a plain command response
        assert!(matches!(
            decoder.decode(&ok_payload(0, 0)).unwrap(),
            ServerMessage::Ok(_)
        ));
    }

    #[test]
    fn execute_conversation_ok_only() {
        let queue = conversation_queue();
        queue.lock().unwrap().push_back(Conversation::Execute);
        let mut decoder = Decoder::new(Arc::clone(&queue));
        let msg = decoder.decode(&ok_payload(1, 0)).unwrap();
        assert!(msg.is_terminal());
    }

    #[test]
    fn handshake_v10() {
        let mut buf = vec![10u8];
        buf.extend_from_slice(b"8.0.42\0");
        w32(&mut buf, 99); // connection id
        buf.extend_from_slice(b"abcdefgh"); // seed part 1
        buf.push(0); // filler
        let caps = capability::PROTOCOL_41
            | capability::SECURE_CONNECTION
            | capability::PLUGIN_AUTH
            | capability::SSL;
        w16(&mut buf, (caps & 0xFFFF) as u16);
        buf.push(33); // charset
        w16(&mut buf, 0x0002); // status
        w16(&mut buf, (caps >> 16) as u16);
        buf.push(21); // auth data len
        buf.extend_from_slice(&[0u8; 10]); // reserved
        buf.extend_from_slice(b"ijklmnopqrst"); // seed part 2 (12 bytes)
        buf.push(0);
        buf.extend_from_slice(b"mysql_native_password\0");

        let handshake = parse_handshake(&buf).unwrap();
        assert_eq!(handshake.server_version, "8.0.42");
        assert_eq!(handshake.connection_id, 99);
        assert_eq!(handshake.auth_seed, b"abcdefghijklmnopqrst");
        assert_eq!(handshake.auth_plugin, "mysql_native_password");
        assert_ne!(handshake.capabilities & capability::SSL, 0);
    }
}
