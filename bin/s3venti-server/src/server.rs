//! Venti protocol server
//!
//! One task per connection reads frames; each request is dispatched to the
//! block store on its own task so slow backend calls do not hold up the
//! rest of the connection. Replies funnel through a single writer task and
//! are matched to requests by tag, so they may go out of order.

use crate::protocol::{
    Frame, MAX_DATA, Message, ProtocolError, ProtocolResult, negotiate_version, read_frame,
    write_frame,
};
use s3venti_common::Error;
use s3venti_store::BlockStore;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Replies queued per connection before request tasks wait on the writer
const REPLY_QUEUE: usize = 64;

pub struct VentiServer {
    store: Arc<BlockStore>,
}

impl VentiServer {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self { store }
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> std::io::Result<()> {
        info!("Venti server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("set_nodelay for {peer}: {e}");
                        }
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            info!("Client {peer} connected");
                            match server.handle_connection(stream).await {
                                Ok(()) => info!("Client {peer} disconnected"),
                                Err(e) => warn!("Client {peer} error: {e}"),
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept failed: {e}");
                    }
                },
                () = &mut shutdown => {
                    info!("Venti server no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }

    /// Serve one client until it says goodbye or the stream ends
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S) -> ProtocolResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let client_version = negotiate_version(&mut reader, &mut write_half).await?;
        debug!("Client version {client_version:?}");

        let (reply_tx, mut reply_rx) = mpsc::channel::<Frame>(REPLY_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(frame) = reply_rx.recv().await {
                write_frame(&mut write_half, &frame).await?;
            }
            Ok::<_, ProtocolError>(())
        });

        let mut in_flight = JoinSet::new();
        let result = loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            if frame.message == Message::Tgoodbye {
                break Ok(());
            }

            let server = Arc::clone(&self);
            let reply_tx = reply_tx.clone();
            in_flight.spawn(async move {
                let reply = server.dispatch(frame).await;
                // The writer only goes away when the connection is dead
                let _ = reply_tx.send(reply).await;
            });

            // Reap finished requests so the set does not grow unbounded
            while in_flight.try_join_next().is_some() {}
        };

        while in_flight.join_next().await.is_some() {}
        drop(reply_tx);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => error!("Reply writer failed: {e}"),
        }
        result
    }

    /// Execute one request against the store and build its reply
    async fn dispatch(&self, frame: Frame) -> Frame {
        let tag = frame.tag;
        let reply = match frame.message {
            Message::Tping => Ok(Message::Rping),
            Message::Thello { version, uid, .. } => {
                debug!("Hello from {uid:?} (version {version})");
                Ok(Message::Rhello {
                    sid: self.store.hello().to_string(),
                    rcrypto: 0,
                    rcodec: 0,
                })
            }
            Message::Tread { score, count, .. } => {
                let count = usize::from(count).min(MAX_DATA);
                self.store
                    .read(&score, count)
                    .await
                    .map(|data| Message::Rread { data })
            }
            Message::Twrite { block_type, data } => self
                .store
                .write(block_type, data)
                .await
                .map(|score| Message::Rwrite { score }),
            Message::Tsync => self.store.sync().await.map(|()| Message::Rsync),
            other => Err(Error::InvalidRequest(format!(
                "unexpected message {other:?}"
            ))),
        };

        let message = reply.unwrap_or_else(|e| {
            if e.is_not_found() {
                debug!("Request {tag}: {e}");
            } else {
                warn!("Request {tag} failed: {e}");
            }
            Message::rerror(e.to_string())
        });
        Frame::new(tag, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VERSION_LINE;
    use bytes::Bytes;
    use s3venti_common::Score;
    use s3venti_common::config::BatchConfig;
    use s3venti_store::{LocalIndex, MemoryBackend, NoopCache};
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, tag: u8, message: Message) {
            write_frame(&mut self.writer, &Frame::new(tag, message))
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Frame {
            read_frame(&mut self.reader).await.unwrap().unwrap()
        }

        async fn call(&mut self, tag: u8, message: Message) -> Message {
            self.send(tag, message).await;
            let reply = self.recv().await;
            assert_eq!(reply.tag, tag);
            reply.message
        }
    }

    async fn connect() -> (TempDir, Arc<MemoryBackend>, Client, tokio::task::JoinHandle<ProtocolResult<()>>) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let store = BlockStore::new(
            Arc::new(LocalIndex::open(dir.path().join("scores.db")).unwrap()),
            Arc::new(NoopCache),
            backend.clone(),
            &BatchConfig::default(),
        );
        let server = Arc::new(VentiServer::new(Arc::new(store)));

        let (client_side, server_side) = tokio::io::duplex(256 * 1024);
        let handle = tokio::spawn(server.handle_connection(server_side));

        let (read_half, mut writer) = tokio::io::split(client_side);
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, VERSION_LINE);
        writer.write_all(b"venti-02-test\n").await.unwrap();

        (dir, backend, Client { reader, writer }, handle)
    }

    #[tokio::test]
    async fn test_session() {
        let (_dir, backend, mut client, handle) = connect().await;

        let hello = client
            .call(
                1,
                Message::Thello {
                    version: "02".into(),
                    uid: "glenda".into(),
                    strength: 0,
                    crypto: vec![],
                    codec: vec![],
                },
            )
            .await;
        assert_eq!(
            hello,
            Message::Rhello {
                sid: "anonymous".into(),
                rcrypto: 0,
                rcodec: 0
            }
        );
        assert_eq!(client.call(2, Message::Tping).await, Message::Rping);

        let data = Bytes::from_static(b"venti block");
        let reply = client
            .call(3, Message::Twrite {
                block_type: 8,
                data: data.clone(),
            })
            .await;
        let score = Score::compute(&data);
        assert_eq!(reply, Message::Rwrite { score });
        assert_eq!(backend.puts(), 1);

        let reply = client
            .call(4, Message::Tread {
                score,
                block_type: 8,
                count: 5,
            })
            .await;
        assert_eq!(reply, Message::Rread {
            data: Bytes::from_static(b"venti")
        });

        assert_eq!(client.call(5, Message::Tsync).await, Message::Rsync);

        client.send(6, Message::Tgoodbye).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_block_is_rerror() {
        let (_dir, _backend, mut client, handle) = connect().await;

        let reply = client
            .call(7, Message::Tread {
                score: Score::compute(b"absent"),
                block_type: 0,
                count: 100,
            })
            .await;
        assert!(matches!(reply, Message::Rerror { ref error } if error.contains("not found")));

        // The connection survives a failed request
        assert_eq!(client.call(8, Message::Tping).await, Message::Rping);
        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_requests_all_answered() {
        let (_dir, _backend, mut client, handle) = connect().await;

        for tag in 0..16u8 {
            client
                .send(tag, Message::Twrite {
                    block_type: 0,
                    data: Bytes::from(vec![tag; 100]),
                })
                .await;
        }

        let mut tags = Vec::new();
        for _ in 0..16 {
            let reply = client.recv().await;
            let Message::Rwrite { score } = reply.message else {
                panic!("unexpected reply {reply:?}");
            };
            assert_eq!(score, Score::compute(&vec![reply.tag; 100]));
            tags.push(reply.tag);
        }
        tags.sort_unstable();
        assert_eq!(tags, (0..16).collect::<Vec<u8>>());

        client.send(99, Message::Tgoodbye).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_error_keeps_connection_alive() {
        let (_dir, _backend, mut client, handle) = connect().await;

        // The rejection echoes the message, which is larger than a frame
        let reply = client
            .call(1, Message::Rread {
                data: Bytes::from(vec![0u8; MAX_DATA]),
            })
            .await;
        assert!(matches!(reply, Message::Rerror { ref error } if error.len() <= MAX_DATA));

        assert_eq!(client.call(2, Message::Tping).await, Message::Rping);
        client.send(3, Message::Tgoodbye).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reply_messages_from_client_rejected() {
        let (_dir, _backend, mut client, handle) = connect().await;
        let reply = client.call(1, Message::Rping).await;
        assert!(matches!(reply, Message::Rerror { .. }));
        client.send(2, Message::Tgoodbye).await;
        handle.await.unwrap().unwrap();
    }
}
