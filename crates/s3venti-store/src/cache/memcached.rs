//! memcached shared cache
//!
//! Speaks the memcached text protocol (`get` / `set`) over a small pool of
//! lazily opened TCP connections. Each call checks a connection out for the
//! duration of one command, so a stalled reply only holds up its own
//! caller. Any I/O error, protocol error or timeout drops that connection,
//! is logged, and is reported to the caller as a miss.

use super::SharedCache;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// memcached rejects keys longer than this
const MAX_KEY_LEN: usize = 250;

/// Connect attempts give up after this long
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// One get or set round trip gives up after this long
const IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Idle connections kept for reuse
const MAX_IDLE: usize = 8;

type Connection = BufStream<TcpStream>;

/// memcached implementation of [`SharedCache`]
pub struct MemcachedCache {
    address: String,
    io_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl MemcachedCache {
    /// Create a client for `address` (`host:port`); connects on first use
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            io_timeout: IO_TIMEOUT,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Override the per-command timeout
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    async fn checkout(&self) -> io::Result<Connection> {
        let pooled = self.idle.lock().pop();
        if let Some(conn) = pooled {
            return Ok(conn);
        }
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        debug!("Connected to memcached at {}", self.address);
        Ok(BufStream::new(stream))
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(conn);
        }
    }

    async fn try_get(&self, key: &str) -> io::Result<Option<Bytes>> {
        let mut conn = self.checkout().await?;
        let value = tokio::time::timeout(self.io_timeout, get_on(&mut conn, key))
            .await
            .map_err(|_| timed_out())??;
        self.checkin(conn);
        Ok(value)
    }

    async fn try_set(&self, key: &str, data: &[u8]) -> io::Result<()> {
        let mut conn = self.checkout().await?;
        tokio::time::timeout(self.io_timeout, set_on(&mut conn, key, data))
            .await
            .map_err(|_| timed_out())??;
        self.checkin(conn);
        Ok(())
    }
}

#[async_trait]
impl SharedCache for MemcachedCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        if !valid_key(key) {
            return None;
        }
        match self.try_get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("memcached get {key} failed: {e}");
                None
            }
        }
    }

    async fn set(&self, key: &str, data: Bytes) {
        if !valid_key(key) {
            return;
        }
        if let Err(e) = self.try_set(key, &data).await {
            warn!("memcached set {key} failed: {e}");
        }
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|b| b.is_ascii_graphic())
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "memcached did not answer in time")
}

fn protocol_error(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

async fn read_line(conn: &mut Connection) -> io::Result<String> {
    let mut line = String::new();
    if conn.read_line(&mut line).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "memcached closed the connection",
        ));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn get_on(conn: &mut Connection, key: &str) -> io::Result<Option<Bytes>> {
    conn.write_all(format!("get {key}\r\n").as_bytes()).await?;
    conn.flush().await?;

    let header = read_line(conn).await?;
    if header == "END" {
        return Ok(None);
    }

    // VALUE <key> <flags> <bytes>
    let fields: Vec<&str> = header.split_ascii_whitespace().collect();
    let len = match fields.as_slice() {
        ["VALUE", k, _flags, len, ..] if *k == key => len
            .parse::<usize>()
            .map_err(|_| protocol_error(format!("bad value length in {header:?}")))?,
        _ => return Err(protocol_error(format!("unexpected reply {header:?}"))),
    };

    let mut data = vec![0u8; len + 2];
    conn.read_exact(&mut data).await?;
    if !data.ends_with(b"\r\n") {
        return Err(protocol_error("value not terminated by CRLF".into()));
    }
    data.truncate(len);

    let trailer = read_line(conn).await?;
    if trailer != "END" {
        return Err(protocol_error(format!("expected END, got {trailer:?}")));
    }
    Ok(Some(Bytes::from(data)))
}

async fn set_on(conn: &mut Connection, key: &str, data: &[u8]) -> io::Result<()> {
    conn.write_all(format!("set {key} 0 0 {}\r\n", data.len()).as_bytes())
        .await?;
    conn.write_all(data).await?;
    conn.write_all(b"\r\n").await?;
    conn.flush().await?;

    match read_line(conn).await?.as_str() {
        "STORED" => Ok(()),
        // The server kept its connection state; nothing to reset
        "NOT_STORED" => Ok(()),
        other => Err(protocol_error(format!("set rejected: {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    /// Minimal memcached speaking just enough of the text protocol
    async fn fake_memcached() -> (String, Arc<parking_lot::Mutex<HashMap<String, Vec<u8>>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store = Arc::new(parking_lot::Mutex::new(HashMap::<String, Vec<u8>>::new()));
        let server_store = Arc::clone(&store);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let store = Arc::clone(&server_store);
                tokio::spawn(async move {
                    let mut stream = BufReader::new(stream);
                    loop {
                        let mut line = String::new();
                        if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let parts: Vec<String> =
                            line.split_whitespace().map(str::to_string).collect();
                        match parts[0].as_str() {
                            "get" => {
                                let value = store.lock().get(&parts[1]).cloned();
                                let mut reply = Vec::new();
                                if let Some(v) = value {
                                    reply.extend_from_slice(
                                        format!("VALUE {} 0 {}\r\n", parts[1], v.len()).as_bytes(),
                                    );
                                    reply.extend_from_slice(&v);
                                    reply.extend_from_slice(b"\r\n");
                                }
                                reply.extend_from_slice(b"END\r\n");
                                stream.get_mut().write_all(&reply).await.unwrap();
                            }
                            "set" => {
                                let len: usize = parts[4].parse().unwrap();
                                let mut data = vec![0u8; len + 2];
                                stream.read_exact(&mut data).await.unwrap();
                                data.truncate(len);
                                store.lock().insert(parts[1].clone(), data);
                                stream.get_mut().write_all(b"STORED\r\n").await.unwrap();
                            }
                            _ => {
                                stream.get_mut().write_all(b"ERROR\r\n").await.unwrap();
                            }
                        }
                    }
                });
            }
        });

        (addr, store)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (addr, store) = fake_memcached().await;
        let cache = MemcachedCache::new(addr);

        assert!(cache.get("missing").await.is_none());

        let payload = Bytes::from_static(b"binary\r\nwith CRLF inside");
        cache.set("blk", payload.clone()).await;
        assert_eq!(cache.get("blk").await, Some(payload));

        cache.set("marker.exists", Bytes::new()).await;
        assert_eq!(cache.get("marker.exists").await, Some(Bytes::new()));
        assert_eq!(store.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_miss() {
        // Bind then drop to obtain a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let cache = MemcachedCache::new(addr);
        cache.set("k", Bytes::from_static(b"v")).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_stalled_server_does_not_block_other_callers() {
        // Accepts connections and never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let cache = Arc::new(
            MemcachedCache::new(addr).with_io_timeout(Duration::from_millis(300)),
        );
        let first = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("first").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = tokio::time::timeout(Duration::from_secs(3), cache.get("second")).await;
        assert_eq!(second.unwrap(), None);
        assert_eq!(first.await.unwrap(), None);

        // Timed-out connections are not reused
        assert!(cache.idle.lock().is_empty());
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let (addr, _store) = fake_memcached().await;
        let cache = MemcachedCache::new(addr);
        cache.set("a", Bytes::from_static(b"1")).await;
        cache.set("b", Bytes::from_static(b"2")).await;
        assert_eq!(cache.get("a").await, Some(Bytes::from_static(b"1")));
        assert_eq!(cache.idle.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_keys_are_skipped() {
        let (addr, store) = fake_memcached().await;
        let cache = MemcachedCache::new(addr);
        cache.set("has space", Bytes::from_static(b"v")).await;
        cache.set(&"k".repeat(MAX_KEY_LEN + 1), Bytes::from_static(b"v")).await;
        assert!(store.lock().is_empty());
        assert!(cache.get("has space").await.is_none());
    }
}
