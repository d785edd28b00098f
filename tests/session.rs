//! End-to-end tests against a scripted in-process server.
//!
//! The server speaks just enough of the wire protocol to drive the
//! connection phase and the statement flows, asserting on the commands it
//! receives.

use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};

use zero_mysql::protocol::codec::{
    read_envelope, write_cstring, write_envelope, write_lenenc_bytes, write_lenenc_int, write_u16,
    write_u32,
};
use zero_mysql::protocol::types::capability;
use zero_mysql::{CachePolicy, Conn, Error, Opts, SslState, Value};

const SERVER_CAPABILITIES: u32 = capability::PROTOCOL_41
    | capability::SECURE_CONNECTION
    | capability::TRANSACTIONS
    | capability::PLUGIN_AUTH
    | capability::PLUGIN_AUTH_LENENC_CLIENT_DATA
    | capability::CONNECT_WITH_DB;

async fn write_handshake<W: AsyncWrite + Unpin>(writer: &mut W) {
    let mut payload = Vec::new();
    payload.push(10);
    write_cstring(&mut payload, "8.0.0-scripted");
    write_u32(&mut payload, 99);
    payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    payload.push(0);
    write_u16(&mut payload, SERVER_CAPABILITIES as u16);
    payload.push(45);
    write_u16(&mut payload, 2);
    write_u16(&mut payload, (SERVER_CAPABILITIES >> 16) as u16);
    payload.push(21);
    payload.extend_from_slice(&[0; 10]);
    payload.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]);
    payload.push(0);
    write_cstring(&mut payload, "mysql_native_password");
    write_envelope(writer, 0, &payload).await.unwrap();
}

fn ok_payload(affected_rows: u64) -> Vec<u8> {
    let mut payload = vec![0x00];
    write_lenenc_int(&mut payload, affected_rows);
    write_lenenc_int(&mut payload, 0);
    write_u16(&mut payload, 2);
    write_u16(&mut payload, 0);
    payload
}

fn err_payload(code: u16, message: &str) -> Vec<u8> {
    let mut payload = vec![0xFF];
    write_u16(&mut payload, code);
    payload.extend_from_slice(b"#42000");
    payload.extend_from_slice(message.as_bytes());
    payload
}

fn eof_payload() -> Vec<u8> {
    let mut payload = vec![0xFE];
    write_u16(&mut payload, 0);
    write_u16(&mut payload, 2);
    payload
}

fn column_payload(name: &str, type_byte: u8, charset: u16, flags: u16) -> Vec<u8> {
    let mut payload = Vec::new();
    write_lenenc_bytes(&mut payload, b"def");
    write_lenenc_bytes(&mut payload, b"");
    write_lenenc_bytes(&mut payload, b"t");
    write_lenenc_bytes(&mut payload, b"t");
    write_lenenc_bytes(&mut payload, name.as_bytes());
    write_lenenc_bytes(&mut payload, name.as_bytes());
    write_lenenc_int(&mut payload, 12);
    write_u16(&mut payload, charset);
    write_u32(&mut payload, 21);
    payload.push(type_byte);
    write_u16(&mut payload, flags);
    payload.push(0);
    write_u16(&mut payload, 0);
    payload
}

/// Accept the connection and complete handshake plus login.
async fn accept_and_login(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    write_handshake(&mut stream).await;
    let response = read_envelope(&mut stream).await.unwrap();
    assert_eq!(response.sequence_id, 1);
    // Capabilities, max packet size, charset, filler, then user and the
    // scrambled password.
    assert!(response.payload.len() > 36);
    write_envelope(&mut stream, 2, &ok_payload(0)).await.unwrap();
    stream
}

/// Send a COM_STMT_PREPARE response.
async fn send_prepare_ok<W: AsyncWrite + Unpin>(
    writer: &mut W,
    statement_id: u32,
    param_count: u16,
    column_count: u16,
) {
    let mut payload = vec![0x00];
    write_u32(&mut payload, statement_id);
    write_u16(&mut payload, column_count);
    write_u16(&mut payload, param_count);
    payload.push(0);
    write_u16(&mut payload, 0);
    write_envelope(writer, 1, &payload).await.unwrap();
    let mut sequence = 2;
    for _ in 0..param_count {
        let param = column_payload("?", 0xFD, 63, 0);
        write_envelope(writer, sequence, &param).await.unwrap();
        sequence += 1;
    }
    if param_count > 0 {
        write_envelope(writer, sequence, &eof_payload())
            .await
            .unwrap();
        sequence += 1;
    }
    for _ in 0..column_count {
        let column = column_payload("value", 0x08, 63, 0);
        write_envelope(writer, sequence, &column).await.unwrap();
        sequence += 1;
    }
    if column_count > 0 {
        write_envelope(writer, sequence, &eof_payload())
            .await
            .unwrap();
    }
}

/// Send a single-column BIGINT result set with the given values.
async fn send_result_set<W: AsyncWrite + Unpin>(writer: &mut W, values: &[i64]) {
    let mut count = Vec::new();
    write_lenenc_int(&mut count, 1);
    write_envelope(writer, 1, &count).await.unwrap();
    write_envelope(writer, 2, &column_payload("value", 0x08, 63, 0))
        .await
        .unwrap();
    write_envelope(writer, 3, &eof_payload()).await.unwrap();
    let mut sequence = 4;
    for value in values {
        let mut row = vec![0x00, 0x00];
        row.extend_from_slice(&value.to_le_bytes());
        write_envelope(writer, sequence, &row).await.unwrap();
        sequence += 1;
    }
    write_envelope(writer, sequence, &eof_payload())
        .await
        .unwrap();
}

fn opts_for(listener: &TcpListener, statement_cache: CachePolicy) -> Opts {
    let addr = listener.local_addr().unwrap();
    Opts {
        host: addr.ip().to_string(),
        port: addr.port(),
        user: "app".into(),
        password: Some("secret".into()),
        database: Some("test".into()),
        statement_cache,
        ..Default::default()
    }
}

#[tokio::test]
async fn connect_ping_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let opts = opts_for(&listener, CachePolicy::Indefinite);
    let server = tokio::spawn(async move {
        let mut stream = accept_and_login(&listener).await;
        let ping = read_envelope(&mut stream).await.unwrap();
        assert_eq!(ping.payload, vec![0x0E]);
        write_envelope(&mut stream, 1, &ok_payload(0)).await.unwrap();
        let quit = read_envelope(&mut stream).await.unwrap();
        assert_eq!(quit.payload, vec![0x01]);
    });

    let conn = Conn::connect(&opts).await.unwrap();
    assert_eq!(conn.connection_id(), 99);
    assert_eq!(conn.server_version(), "8.0.0-scripted");
    assert_eq!(conn.ssl_state(), SslState::Negotiated);
    conn.ping().await.unwrap();
    conn.close().await.unwrap();
    assert!(!conn.is_connected());
    server.await.unwrap();
}

#[tokio::test]
async fn url_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!(
        "mysql://app:secret@{}:{}/test?stmt_cache=lfu:16",
        addr.ip(),
        addr.port()
    );
    let server = tokio::spawn(async move {
        let mut stream = accept_and_login(&listener).await;
        let quit = read_envelope(&mut stream).await.unwrap();
        assert_eq!(quit.payload, vec![0x01]);
    });

    let conn = Conn::new(&url).await.unwrap();
    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn execute_batch_reuses_cached_statement() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let opts = opts_for(&listener, CachePolicy::Indefinite);
    let server = tokio::spawn(async move {
        let mut stream = accept_and_login(&listener).await;
        // One prepare serves all three executions across both statements.
        let prepare = read_envelope(&mut stream).await.unwrap();
        assert_eq!(prepare.payload[0], 0x16);
        assert_eq!(&prepare.payload[1..], b"SELECT value FROM t WHERE id = ?");
        send_prepare_ok(&mut stream, 7, 1, 1).await;
        for value in [10i64, 20, 30] {
            let execute = read_envelope(&mut stream).await.unwrap();
            assert_eq!(execute.payload[0], 0x17);
            assert_eq!(&execute.payload[1..5], &7u32.to_le_bytes());
            send_result_set(&mut stream, &[value]).await;
        }
        let quit = read_envelope(&mut stream).await.unwrap();
        assert_eq!(quit.payload, vec![0x01]);
    });

    let conn = Conn::connect(&opts).await.unwrap();

    let mut statement = conn.statement("SELECT value FROM t WHERE id = ?name");
    statement.bind_named("name", 1i64).unwrap();
    statement.add().unwrap();
    statement.bind(0, 2i64).unwrap();
    let mut results = statement.execute().await.unwrap();
    let mut seen = Vec::new();
    while let Some(result) = results.next_result().await {
        let result = result.unwrap();
        assert_eq!(result.columns()[0].name, "value");
        for row in result.decode_rows().unwrap() {
            seen.push(row[0].clone());
        }
    }
    assert_eq!(seen, vec![Value::Int(10), Value::Int(20)]);

    // Same SQL on a fresh statement hits the cache, no second prepare.
    let mut statement = conn.statement("SELECT value FROM t WHERE id = ?");
    statement.bind(0, 3i64).unwrap();
    let mut results = statement.execute().await.unwrap();
    let result = results.next_result().await.unwrap().unwrap();
    assert_eq!(result.decode_rows().unwrap()[0][0], Value::Int(30));
    assert!(results.next_result().await.is_none());

    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn disabled_cache_closes_the_statement_handle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let opts = opts_for(&listener, CachePolicy::Disabled);
    let server = tokio::spawn(async move {
        let mut stream = accept_and_login(&listener).await;
        let prepare = read_envelope(&mut stream).await.unwrap();
        assert_eq!(prepare.payload[0], 0x16);
        send_prepare_ok(&mut stream, 11, 1, 0).await;
        let execute = read_envelope(&mut stream).await.unwrap();
        assert_eq!(execute.payload[0], 0x17);
        write_envelope(&mut stream, 1, &ok_payload(1)).await.unwrap();
        // COM_STMT_CLOSE has no response; then the connection closes.
        let mut commands = Vec::new();
        loop {
            let envelope = read_envelope(&mut stream).await.unwrap();
            commands.push(envelope.payload[0]);
            if envelope.payload[0] == 0x01 {
                break;
            }
        }
        commands
    });

    let conn = Conn::connect(&opts).await.unwrap();
    let mut statement = conn.statement("UPDATE t SET a = ?");
    statement.bind(0, "x").unwrap();
    let mut results = statement.execute().await.unwrap();
    let result = results.next_result().await.unwrap().unwrap();
    assert_eq!(result.affected_rows(), 1);
    assert!(results.next_result().await.is_none());
    // Let the spawned close task run before shutting down.
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
    conn.close().await.unwrap();

    let commands = server.await.unwrap();
    assert_eq!(commands, vec![0x19, 0x01]);
}

#[tokio::test]
async fn incomplete_binding_fails_before_any_wire_traffic() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let opts = opts_for(&listener, CachePolicy::Indefinite);
    let server = tokio::spawn(async move {
        let mut stream = accept_and_login(&listener).await;
        // The only command must be the quit from close().
        let quit = read_envelope(&mut stream).await.unwrap();
        assert_eq!(quit.payload, vec![0x01]);
    });

    let conn = Conn::connect(&opts).await.unwrap();
    let mut statement = conn.statement("INSERT INTO t VALUES (?, ?)");
    statement.bind(1, 5i64).unwrap();
    let error = statement.execute().await.unwrap_err();
    assert!(matches!(error, Error::BindingIncomplete { index: 0 }));

    let statement = conn.statement("INSERT INTO t VALUES (?, ?)");
    let error = statement.execute().await.unwrap_err();
    assert!(matches!(error, Error::InvalidUsage(_)));

    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn server_error_ends_the_result_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let opts = opts_for(&listener, CachePolicy::Indefinite);
    let server = tokio::spawn(async move {
        let mut stream = accept_and_login(&listener).await;
        let prepare = read_envelope(&mut stream).await.unwrap();
        assert_eq!(prepare.payload[0], 0x16);
        send_prepare_ok(&mut stream, 3, 1, 0).await;
        let execute = read_envelope(&mut stream).await.unwrap();
        assert_eq!(execute.payload[0], 0x17);
        write_envelope(&mut stream, 1, &err_payload(1062, "Duplicate entry"))
            .await
            .unwrap();
        let quit = read_envelope(&mut stream).await.unwrap();
        assert_eq!(quit.payload, vec![0x01]);
    });

    let conn = Conn::connect(&opts).await.unwrap();
    let mut statement = conn.statement("INSERT INTO t VALUES (?)");
    statement.bind(0, 1i64).unwrap();
    statement.add().unwrap();
    statement.bind(0, 2i64).unwrap();
    let mut results = statement.execute().await.unwrap();
    let error = results.next_result().await.unwrap().unwrap_err();
    assert_eq!(error.server_code(), Some(1062));
    // The error cleared the remaining rows; the stream is over.
    assert!(results.next_result().await.is_none());

    conn.close().await.unwrap();
    server.await.unwrap();
}
