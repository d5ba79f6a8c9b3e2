use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::cluster::Address;
use crate::config::DatabaseConfig;
use crate::protocol::{
    compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, parse_column_count,
    AuthSwitchRequest, ColumnDefinition, Command, DecodeError, ErrPacket, HandshakeResponse,
    InitialHandshake, Packet, PacketCodec, TextRow, NATIVE_PASSWORD_PLUGIN,
};

use super::{Connection, Connector, ExecuteError, QueryResult};

/// Login used for every backend connection
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub database: Option<String>,
}

impl From<&DatabaseConfig> for Credentials {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
        }
    }
}

/// Opens MySQL connections over plain TCP
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    credentials: Credentials,
}

impl MySqlConnector {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, addr: &Address) -> Result<Box<dyn Connection>, ExecuteError> {
        match MySqlConnection::connect(addr, &self.credentials).await {
            Ok(conn) => Ok(Box::new(conn)),
            Err(e) => {
                error!(addr = %addr, error = %e, "Failed to connect to backend");
                Err(ExecuteError::connection(addr, e))
            }
        }
    }
}

/// A single authenticated backend connection
///
/// The socket is closed when the value is dropped.
pub struct MySqlConnection {
    framed: Framed<TcpStream, PacketCodec>,
    addr: Address,
    /// Negotiated capability flags
    capabilities: u32,
}

impl MySqlConnection {
    /// Connect and authenticate with mysql_native_password
    pub async fn connect(addr: &Address, credentials: &Credentials) -> Result<Self, MySqlError> {
        debug!(addr = %addr, "Connecting to backend");

        let stream = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| MySqlError::Connect(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let mut framed = Framed::new(stream, PacketCodec);

        let greeting_packet = recv(&mut framed).await?;
        if is_err_packet(&greeting_packet.payload) {
            // e.g. "Host is blocked" or "Too many connections"
            return Err(server_error(&greeting_packet, 0));
        }
        let greeting = InitialHandshake::parse(&greeting_packet.payload)
            .ok_or_else(|| MySqlError::Protocol("Invalid backend handshake".into()))?;

        debug!(
            server_version = %greeting.server_version,
            connection_id = greeting.connection_id,
            "Received backend handshake"
        );

        let login = HandshakeResponse::for_greeting(
            &greeting,
            &credentials.user,
            &credentials.password,
            credentials.database.as_deref(),
        );
        let capabilities = login.capability_flags;
        send(
            &mut framed,
            login.encode(greeting_packet.sequence_id.wrapping_add(1)),
        )
        .await?;

        let mut response = recv(&mut framed).await?;

        if response.header() == Some(0xFE) {
            let switch = AuthSwitchRequest::parse(&response.payload)
                .ok_or_else(|| MySqlError::Protocol("Malformed auth switch request".into()))?;
            if switch.plugin_name != NATIVE_PASSWORD_PLUGIN {
                return Err(MySqlError::Auth(format!(
                    "Unsupported authentication plugin: {}",
                    switch.plugin_name
                )));
            }
            debug!("Backend requested auth switch");
            let auth = compute_auth_response(&credentials.password, &switch.auth_data);
            send(
                &mut framed,
                Packet::new(response.sequence_id.wrapping_add(1), auth),
            )
            .await?;
            response = recv(&mut framed).await?;
        }

        if is_err_packet(&response.payload) {
            let err = ErrPacket::parse(&response.payload, capabilities)
                .unwrap_or_else(|| fallback_err(1045, "Access denied"));
            error!(
                error_code = err.error_code,
                error_message = %err.error_message,
                "Backend authentication failed"
            );
            return Err(MySqlError::Auth(err.error_message));
        }

        if !is_ok_packet(&response.payload) {
            return Err(MySqlError::Protocol(
                "Expected OK packet after authentication".into(),
            ));
        }

        debug!(addr = %addr, "Backend authentication successful");

        Ok(Self {
            framed,
            addr: addr.clone(),
            capabilities,
        })
    }

    /// Run a text query and read its whole result set
    pub async fn query_text(&mut self, sql: &str) -> Result<QueryResult, MySqlError> {
        send(&mut self.framed, Packet::command(Command::Query, sql.as_bytes())).await?;

        let first = recv(&mut self.framed).await?;
        if is_err_packet(&first.payload) {
            return Err(server_error(&first, self.capabilities));
        }
        if is_ok_packet(&first.payload) {
            // Statement without a result set
            return Ok(QueryResult::default());
        }

        let column_count = parse_column_count(&first.payload)?;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let packet = recv(&mut self.framed).await?;
            columns.push(ColumnDefinition::parse(&packet.payload)?);
        }

        let eof = recv(&mut self.framed).await?;
        if !is_eof_packet(&eof.payload) {
            return Err(MySqlError::Protocol(
                "Expected EOF after column definitions".into(),
            ));
        }

        let mut result = QueryResult::with_columns(&columns);
        loop {
            let packet = recv(&mut self.framed).await?;
            if is_eof_packet(&packet.payload) {
                break;
            }
            if is_err_packet(&packet.payload) {
                return Err(server_error(&packet, self.capabilities));
            }
            let row = TextRow::parse(&packet.payload, column_count)?;
            result.push_text_row(&columns, row);
        }

        debug!(addr = %self.addr, rows = result.len(), "Result set received");
        Ok(result)
    }

    /// Send COM_QUIT; the server closes its side on receipt
    pub async fn quit(mut self) {
        if let Err(e) = send(&mut self.framed, Packet::command(Command::Quit, &[])).await {
            debug!(addr = %self.addr, error = %e, "COM_QUIT not delivered");
        }
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn query(&mut self, sql: &str) -> Result<QueryResult, ExecuteError> {
        let addr = self.addr.clone();
        self.query_text(sql).await.map_err(|e| {
            if e.is_connection_failure() {
                ExecuteError::connection(&addr, e)
            } else {
                ExecuteError::query(&addr, e)
            }
        })
    }

    async fn close(self: Box<Self>) {
        (*self).quit().await;
    }
}

async fn send(framed: &mut Framed<TcpStream, PacketCodec>, packet: Packet) -> Result<(), MySqlError> {
    framed
        .send(packet)
        .await
        .map_err(|e| MySqlError::Io(e.to_string()))
}

async fn recv(framed: &mut Framed<TcpStream, PacketCodec>) -> Result<Packet, MySqlError> {
    match framed.next().await {
        Some(Ok(packet)) => Ok(packet),
        Some(Err(e)) => Err(MySqlError::Io(e.to_string())),
        None => Err(MySqlError::Disconnected),
    }
}

fn fallback_err(code: u16, message: &str) -> ErrPacket {
    ErrPacket {
        error_code: code,
        sql_state: "HY000".to_string(),
        error_message: message.to_string(),
    }
}

fn server_error(packet: &Packet, capabilities: u32) -> MySqlError {
    let err = ErrPacket::parse(&packet.payload, capabilities)
        .unwrap_or_else(|| fallback_err(2027, "Malformed packet"));
    MySqlError::Server {
        code: err.error_code,
        sql_state: err.sql_state,
        message: err.error_message,
    }
}

/// MySQL client errors
#[derive(Debug, thiserror::Error)]
pub enum MySqlError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Server error {code} ({sql_state}): {message}")]
    Server {
        code: u16,
        sql_state: String,
        message: String,
    },

    #[error("Malformed result: {0}")]
    Decode(#[from] DecodeError),

    #[error("Connection disconnected")]
    Disconnected,
}

impl MySqlError {
    /// Whether the transport itself failed, as opposed to the query or its data
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            MySqlError::Connect(_)
                | MySqlError::Io(_)
                | MySqlError::Auth(_)
                | MySqlError::Disconnected
        )
    }
}
