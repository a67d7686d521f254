//! A single CQL connection.
//!
//! This module provides the connection type that handles:
//! - Stream establishment through a replaceable `Connector`
//! - OPTIONS/STARTUP and the SASL authentication exchange
//! - Framing requests and matching responses by stream id

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::auth::AuthProvider;
use super::error::{CqlError, CqlResult};
use super::protocol::*;
use super::result::ResultSet;

// ============================================================================
// Transport
// ============================================================================

/// A bidirectional byte stream a connection can run over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

pub type ConnectFuture = Pin<Box<dyn Future<Output = CqlResult<BoxedStream>> + Send>>;

/// Opens transport streams to `host:port` addresses.
pub trait Connector: Send + Sync + fmt::Debug {
    fn connect(&self, address: &str) -> ConnectFuture;
}

/// Plain TCP with `TCP_NODELAY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, address: &str) -> ConnectFuture {
        let address = address.to_string();
        Box::pin(async move {
            let stream = TcpStream::connect(&address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A CQL connection. Requests are issued one at a time.
pub struct Connection {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: BufWriter<WriteHalf<BoxedStream>>,
    /// Read buffer for incoming frames
    read_buffer: BytesMut,
    /// Next stream id to hand out (0..=127)
    next_stream: i8,
    /// Options announced in SUPPORTED
    supported: BTreeMap<String, Vec<String>>,
    keyspace: Option<String>,
    closed: bool,
    /// Set while a frame is being written; stays set if the write is cancelled
    write_pending: bool,
}

impl Connection {
    /// Wrap an established stream. No handshake is performed.
    pub fn new(stream: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            read_buffer: BytesMut::with_capacity(32768),
            next_stream: 0,
            supported: BTreeMap::new(),
            keyspace: None,
            closed: false,
            write_pending: false,
        }
    }

    /// Open a stream with `connector` and perform the startup handshake.
    pub async fn connect(
        connector: &dyn Connector,
        address: &str,
        cql_version: &str,
        auth: Option<&dyn AuthProvider>,
    ) -> CqlResult<Self> {
        debug!(address, "Opening connection");
        let stream = connector.connect(address).await?;
        let mut conn = Self::new(stream);
        conn.startup(cql_version, auth).await?;
        info!(address, "Connection ready");
        Ok(conn)
    }

    /// OPTIONS, then STARTUP and authentication if requested.
    pub async fn startup(
        &mut self,
        cql_version: &str,
        auth: Option<&dyn AuthProvider>,
    ) -> CqlResult<()> {
        self.options().await?;
        if let Some(versions) = self.supported.get("CQL_VERSION") {
            debug!(?versions, "Server CQL versions");
        }

        let startup = StartupMessage::new(cql_version).encode()?;
        match self.request(&startup).await? {
            Response::Ready => Ok(()),
            Response::Authenticate { class_name } => {
                let provider = auth.ok_or_else(|| {
                    CqlError::Auth(format!(
                        "Server requires authentication with {} but no credentials are configured",
                        class_name
                    ))
                })?;
                self.authenticate(provider, &class_name).await
            }
            other => Err(unexpected("STARTUP", &other)),
        }
    }

    /// Ask the server which options it supports.
    pub async fn options(&mut self) -> CqlResult<&BTreeMap<String, Vec<String>>> {
        match self.request(&OptionsMessage.encode()?).await? {
            Response::Supported { options } => {
                self.supported = options;
                Ok(&self.supported)
            }
            other => Err(unexpected("OPTIONS", &other)),
        }
    }

    async fn authenticate(&mut self, provider: &dyn AuthProvider, class_name: &str) -> CqlResult<()> {
        debug!(class_name, "Authenticating");
        let mut authenticator = provider.new_authenticator(class_name)?;
        let mut token = authenticator.initial_response()?;

        loop {
            let msg = AuthResponseMessage { token }.encode()?;
            let response = match self.request(&msg).await {
                Err(CqlError::Server { code: 0x0100, message }) => {
                    return Err(CqlError::Auth(message));
                }
                other => other?,
            };

            match response {
                Response::AuthChallenge { token: challenge } => {
                    token = authenticator.evaluate_challenge(challenge.as_deref())?;
                }
                Response::AuthSuccess { token: success } => {
                    authenticator.on_success(success.as_deref())?;
                    return Ok(());
                }
                other => return Err(unexpected("AUTH_RESPONSE", &other)),
            }
        }
    }

    /// Switch the connection's keyspace with `USE`.
    pub async fn use_keyspace(&mut self, keyspace: &str) -> CqlResult<ResultSet> {
        let msg = QueryMessage {
            query: format!("USE \"{}\"", keyspace.replace('"', "\"\"")),
            params: QueryParameters::default(),
        };
        let result = self.query(&msg.encode()?).await?;
        info!(keyspace, "Keyspace set");
        self.keyspace = Some(keyspace.to_string());
        Ok(result)
    }

    /// Send a request that answers with a RESULT.
    pub async fn query(&mut self, request: &EncodedRequest) -> CqlResult<ResultSet> {
        match self.request(request).await? {
            Response::Result(result) => Ok(result),
            other => Err(unexpected("request", &other)),
        }
    }

    /// Send a request and wait for its response. ERROR frames become
    /// `CqlError::Server`.
    pub async fn request(&mut self, request: &EncodedRequest) -> CqlResult<Response> {
        if self.is_closed() {
            return Err(CqlError::ConnectionClosed);
        }
        let stream = self.send(request).await?;
        self.receive_response(stream).await?.into_result()
    }

    /// Close the connection.
    pub async fn close(&mut self) -> CqlResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.write_pending {
            // Flushing would resume the torn frame
            return Ok(());
        }
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Whether the connection can no longer carry requests. A frame only
    /// partly written, e.g. when a timeout dropped the request, leaves the
    /// stream out of sync and counts as closed.
    pub fn is_closed(&self) -> bool {
        self.closed || self.write_pending
    }

    pub fn keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    pub fn supported(&self) -> &BTreeMap<String, Vec<String>> {
        &self.supported
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn allocate_stream(&mut self) -> i8 {
        let stream = self.next_stream;
        self.next_stream = if stream == i8::MAX { 0 } else { stream + 1 };
        stream
    }

    async fn send(&mut self, request: &EncodedRequest) -> CqlResult<i8> {
        let stream = self.allocate_stream();
        let frame = request.to_frame(stream);
        self.write_pending = true;
        if let Err(e) = self.write_frame(&frame).await {
            self.closed = true;
            return Err(e);
        }
        self.write_pending = false;
        Ok(stream)
    }

    async fn write_frame(&mut self, frame: &[u8]) -> CqlResult<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn receive_response(&mut self, stream: i8) -> CqlResult<Response> {
        loop {
            let (header, body) = self.receive_frame().await?;

            if header.opcode == Opcode::Event {
                debug!("Skipping EVENT frame");
                continue;
            }
            if header.stream != stream {
                warn!(
                    expected = stream,
                    received = header.stream,
                    "Discarding response for another stream"
                );
                continue;
            }
            return Response::decode(&header, body);
        }
    }

    /// Read one full frame.
    async fn receive_frame(&mut self) -> CqlResult<(FrameHeader, Bytes)> {
        loop {
            if self.read_buffer.len() >= HEADER_LEN {
                let header = FrameHeader::decode(&self.read_buffer[..HEADER_LEN])?;
                let total_len = HEADER_LEN + header.length as usize;

                if self.read_buffer.len() >= total_len {
                    let mut frame = self.read_buffer.split_to(total_len);
                    let body = frame.split_off(HEADER_LEN).freeze();
                    return Ok((header, body));
                }
            }

            let n = self.reader.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                self.closed = true;
                return Err(CqlError::ConnectionClosed);
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("keyspace", &self.keyspace)
            .field("closed", &self.closed)
            .finish()
    }
}

fn unexpected(request: &str, response: &Response) -> CqlError {
    CqlError::protocol(format!(
        "Unexpected response to {}: {:?}",
        request, response
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::auth::PlainTextAuthProvider;
    use crate::cql::codec::{self, Cursor};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Read one request frame on the server side.
    async fn read_request(server: &mut DuplexStream) -> (FrameHeader, Vec<u8>) {
        let mut header = [0u8; HEADER_LEN];
        server.read_exact(&mut header).await.unwrap();
        let header = FrameHeader::decode(&header).unwrap();
        let mut body = vec![0u8; header.length as usize];
        server.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    async fn write_response(server: &mut DuplexStream, stream: i8, opcode: Opcode, body: &[u8]) {
        let mut buf = BytesMut::new();
        FrameHeader {
            version: PROTOCOL_VERSION | RESPONSE_FLAG,
            flags: 0,
            stream,
            opcode,
            length: body.len() as u32,
        }
        .encode(&mut buf);
        buf.extend_from_slice(body);
        server.write_all(&buf).await.unwrap();
    }

    fn supported_body() -> Vec<u8> {
        let mut body = BytesMut::new();
        let mut options = BTreeMap::new();
        options.insert("CQL_VERSION".to_string(), vec!["3.0.0".to_string()]);
        codec::encode_string_multimap(&mut body, &options).unwrap();
        body.to_vec()
    }

    #[tokio::test]
    async fn test_startup_without_auth() {
        let (client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let (header, _) = read_request(&mut server).await;
            assert_eq!(header.opcode, Opcode::Options);
            write_response(&mut server, header.stream, Opcode::Supported, &supported_body()).await;

            let (header, body) = read_request(&mut server).await;
            assert_eq!(header.opcode, Opcode::Startup);
            let options = Cursor::new(&body).read_string_map().unwrap();
            assert_eq!(options["CQL_VERSION"], "3.0.0");
            write_response(&mut server, header.stream, Opcode::Ready, &[]).await;
        });

        let mut conn = Connection::new(Box::new(client));
        conn.startup("3.0.0", None).await.unwrap();
        assert_eq!(conn.supported()["CQL_VERSION"], vec!["3.0.0"]);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_with_plain_text_auth() {
        let (client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let (header, _) = read_request(&mut server).await;
            write_response(&mut server, header.stream, Opcode::Supported, &supported_body()).await;

            let (header, _) = read_request(&mut server).await;
            let mut body = BytesMut::new();
            codec::encode_string(&mut body, "org.apache.cassandra.auth.PasswordAuthenticator")
                .unwrap();
            write_response(&mut server, header.stream, Opcode::Authenticate, &body).await;

            let (header, body) = read_request(&mut server).await;
            assert_eq!(header.opcode, Opcode::AuthResponse);
            let token = Cursor::new(&body).read_bytes().unwrap().unwrap().to_vec();
            assert_eq!(token, b"\0user\0pass");

            let mut body = BytesMut::new();
            codec::encode_bytes(&mut body, None);
            write_response(&mut server, header.stream, Opcode::AuthSuccess, &body).await;
        });

        let provider = PlainTextAuthProvider::new("user", "pass");
        let mut conn = Connection::new(Box::new(client));
        conn.startup("3.0.0", Some(&provider)).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_required_without_credentials() {
        let (client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let (header, _) = read_request(&mut server).await;
            write_response(&mut server, header.stream, Opcode::Supported, &supported_body()).await;
            let (header, _) = read_request(&mut server).await;
            let mut body = BytesMut::new();
            codec::encode_string(&mut body, "PasswordAuthenticator").unwrap();
            write_response(&mut server, header.stream, Opcode::Authenticate, &body).await;
        });

        let mut conn = Connection::new(Box::new(client));
        let err = conn.startup("3.0.0", None).await.unwrap_err();
        assert!(matches!(err, CqlError::Auth(_)));
    }

    #[tokio::test]
    async fn test_events_and_foreign_streams_are_skipped() {
        let (client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let (header, _) = read_request(&mut server).await;
            write_response(&mut server, -1, Opcode::Event, b"ignored").await;
            write_response(&mut server, header.stream + 1, Opcode::Ready, &[]).await;
            write_response(&mut server, header.stream, Opcode::Ready, &[]).await;
        });

        let mut conn = Connection::new(Box::new(client));
        let startup = StartupMessage::new("3.0.0").encode().unwrap();
        assert!(matches!(conn.request(&startup).await.unwrap(), Response::Ready));
    }

    #[tokio::test]
    async fn test_closed_stream_reports_connection_closed() {
        let (client, server) = tokio::io::duplex(4096);
        drop(server);

        let mut conn = Connection::new(Box::new(client));
        let err = conn.options().await.unwrap_err();
        assert!(matches!(err, CqlError::ConnectionClosed | CqlError::Io(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_interrupted_write_closes_connection() {
        // The peer never reads, so a frame larger than the pipe stalls
        let (client, _server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(Box::new(client));

        let big = QueryMessage {
            query: "x".repeat(100_000),
            params: QueryParameters::default(),
        }
        .encode()
        .unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(50), conn.query(&big))
            .await
            .is_err();
        assert!(timed_out);
        assert!(conn.is_closed());

        let err = conn.options().await.unwrap_err();
        assert!(matches!(err, CqlError::ConnectionClosed));
    }

    #[test]
    fn test_stream_ids_wrap() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = Connection::new(Box::new(client));
        conn.next_stream = i8::MAX;
        assert_eq!(conn.allocate_stream(), i8::MAX);
        assert_eq!(conn.allocate_stream(), 0);
    }
}
