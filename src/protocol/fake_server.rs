//! In-process MySQL server for tests
//!
//! Speaks just enough of the server side to exercise the router's client:
//! greeting, login, one or more COM_QUERY exchanges and COM_QUIT.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use super::packet::capabilities::*;
use super::{Packet, PacketCodec};

pub const SCRAMBLE: &[u8; 20] = b"abcdefghijklmnopqrst";

pub fn greeting_payload(connection_id: u32, scramble: &[u8; 20]) -> Vec<u8> {
    let caps = DEFAULT_CAPABILITIES | CLIENT_CONNECT_WITH_DB | CLIENT_PLUGIN_AUTH;
    let mut buf = BytesMut::new();
    buf.put_u8(10);
    buf.extend_from_slice(b"8.0.36-fake\0");
    buf.put_u32_le(connection_id);
    buf.extend_from_slice(&scramble[..8]);
    buf.put_u8(0);
    buf.put_u16_le((caps & 0xFFFF) as u16);
    buf.put_u8(45);
    buf.put_u16_le(0x0002);
    buf.put_u16_le((caps >> 16) as u16);
    buf.put_u8(21);
    buf.extend_from_slice(&[0u8; 10]);
    buf.extend_from_slice(&scramble[8..]);
    buf.put_u8(0);
    buf.extend_from_slice(b"mysql_native_password\0");
    buf.to_vec()
}

fn put_lenenc_str(buf: &mut BytesMut, value: &[u8]) {
    assert!(value.len() < 251, "fake server only writes short strings");
    buf.put_u8(value.len() as u8);
    buf.extend_from_slice(value);
}

pub fn column_definition_payload(name: &str, column_type: u8) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_lenenc_str(&mut buf, b"def");
    put_lenenc_str(&mut buf, b"sakila");
    put_lenenc_str(&mut buf, b"store");
    put_lenenc_str(&mut buf, b"store");
    put_lenenc_str(&mut buf, name.as_bytes());
    put_lenenc_str(&mut buf, name.as_bytes());
    buf.put_u8(0x0c);
    buf.put_u16_le(45);
    buf.put_u32_le(255);
    buf.put_u8(column_type);
    buf.put_u16_le(0);
    buf.put_u8(0);
    buf.put_u16_le(0);
    buf.to_vec()
}

pub fn row_payload(values: &[Option<&str>]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for value in values {
        match value {
            Some(v) => put_lenenc_str(&mut buf, v.as_bytes()),
            None => buf.put_u8(0xFB),
        }
    }
    buf.to_vec()
}

pub fn ok_payload() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

pub fn eof_payload() -> Vec<u8> {
    vec![0xFE, 0x00, 0x00, 0x02, 0x00]
}

pub fn err_payload(code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(0xFF);
    buf.put_u16_le(code);
    buf.put_u8(b'#');
    buf.extend_from_slice(sql_state.as_bytes());
    buf.extend_from_slice(message.as_bytes());
    buf.to_vec()
}

/// How the fake server answers
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Answer every query with this result set
    Rows {
        columns: Vec<(&'static str, u8)>,
        rows: Vec<Vec<Option<&'static str>>>,
    },
    /// Answer every query with an ERR packet
    QueryError { code: u16, message: &'static str },
    /// Send one good row, then a row that cannot be decoded
    MalformedRow,
    /// Send the column header, then drop the connection
    DropMidResult,
    /// Reject the login
    RejectLogin,
    /// Ask the client to switch to mysql_native_password with a new scramble
    AuthSwitch,
    /// Accept the query and never answer
    Stall,
    /// Open with an ERR packet instead of a greeting, as a blocked host sees
    HostBlocked,
}

/// Observations collected by the fake server
#[derive(Debug, Default)]
pub struct Stats {
    pub connections: AtomicUsize,
    pub logins: AtomicUsize,
    pub quits: AtomicUsize,
    pub queries: Mutex<Vec<String>>,
}

impl Stats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn quits(&self) -> usize {
        self.quits.load(Ordering::SeqCst)
    }
}

pub struct FakeServer {
    pub addr: SocketAddr,
    pub stats: Arc<Stats>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());

        let task_stats = stats.clone();
        let task = tokio::spawn(async move {
            let mut next_id = 1;
            while let Ok((stream, _)) = listener.accept().await {
                task_stats.connections.fetch_add(1, Ordering::SeqCst);
                let behavior = behavior.clone();
                let stats = task_stats.clone();
                let connection_id = next_id;
                next_id += 1;
                tokio::spawn(async move {
                    let _ = serve(stream, connection_id, behavior, stats).await;
                });
            }
        });

        Self { addr, stats, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    connection_id: u32,
    behavior: Behavior,
    stats: Arc<Stats>,
) -> std::io::Result<()> {
    let mut framed = Framed::new(stream, PacketCodec);
    if let Behavior::HostBlocked = behavior {
        let mut payload = vec![0xFF];
        payload.extend_from_slice(&1129u16.to_le_bytes());
        payload.extend_from_slice(
            b"Host '127.0.0.1' is blocked because of many connection errors",
        );
        framed.send(Packet::new(0, payload)).await?;
        return Ok(());
    }
    framed
        .send(Packet::new(0, greeting_payload(connection_id, SCRAMBLE)))
        .await?;

    if framed.next().await.transpose()?.is_none() {
        return Ok(());
    }

    match behavior {
        Behavior::RejectLogin => {
            framed
                .send(Packet::new(
                    2,
                    err_payload(1045, "28000", "Access denied for user 'user0'"),
                ))
                .await?;
            return Ok(());
        }
        Behavior::AuthSwitch => {
            let mut switch = vec![0xFE];
            switch.extend_from_slice(b"mysql_native_password\0");
            switch.extend_from_slice(b"ABCDEFGHIJKLMNOPQRST\0");
            framed.send(Packet::new(2, switch)).await?;
            if framed.next().await.transpose()?.is_none() {
                return Ok(());
            }
            framed.send(Packet::new(4, ok_payload())).await?;
        }
        _ => framed.send(Packet::new(2, ok_payload())).await?,
    }
    stats.logins.fetch_add(1, Ordering::SeqCst);

    while let Some(packet) = framed.next().await.transpose()? {
        match packet.header() {
            Some(0x01) => {
                stats.quits.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            Some(0x03) => {
                let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
                stats.queries.lock().push(sql);
                if !answer_query(&mut framed, &behavior).await? {
                    return Ok(());
                }
            }
            _ => {
                framed
                    .send(Packet::new(1, err_payload(1047, "08S01", "Unknown command")))
                    .await?;
            }
        }
    }
    Ok(())
}

/// Returns false when the connection should be dropped
async fn answer_query(
    framed: &mut Framed<TcpStream, PacketCodec>,
    behavior: &Behavior,
) -> std::io::Result<bool> {
    let mut seq = 1u8;
    let mut send = |payload: Vec<u8>| {
        let packet = Packet::new(seq, payload);
        seq = seq.wrapping_add(1);
        packet
    };

    match behavior {
        Behavior::Rows { columns, rows } => {
            framed.send(send(vec![columns.len() as u8])).await?;
            for (name, ty) in columns {
                framed.send(send(column_definition_payload(name, *ty))).await?;
            }
            framed.send(send(eof_payload())).await?;
            for row in rows {
                framed.send(send(row_payload(row))).await?;
            }
            framed.send(send(eof_payload())).await?;
        }
        Behavior::QueryError { code, message } => {
            framed.send(send(err_payload(*code, "42S02", message))).await?;
        }
        Behavior::MalformedRow => {
            framed.send(send(vec![2])).await?;
            framed.send(send(column_definition_payload("store_id", 0x01))).await?;
            framed.send(send(column_definition_payload("manager", 0x01))).await?;
            framed.send(send(eof_payload())).await?;
            framed.send(send(row_payload(&[Some("1"), Some("1")]))).await?;
            framed.send(send(vec![0x0A, b'x'])).await?;
            framed.send(send(eof_payload())).await?;
        }
        Behavior::DropMidResult => {
            framed.send(send(vec![1])).await?;
            return Ok(false);
        }
        Behavior::Stall => {
            std::future::pending::<()>().await;
        }
        Behavior::RejectLogin | Behavior::AuthSwitch | Behavior::HostBlocked => {
            framed.send(send(ok_payload())).await?;
        }
    }
    Ok(true)
}
