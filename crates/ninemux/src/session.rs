//! The per-connection session multiplexer.
//!
//! A [`Session`] owns one byte-stream connection. It splits the inbound
//! stream into 9P messages, fans each request out to a concurrently
//! running [`MessageHandler`](crate::handler::MessageHandler) task, and
//! writes responses back in whatever order the handlers finish.
//! Requests are correlated by tag, never by position, so responses are
//! deliberately not serialized to request order.
//!
//! `TFlush` is the one message handled inside the receive path itself:
//! it cancels the named in-flight request (best effort) and is answered
//! immediately, before the cancelled task has unwound.

use {
    crate::{
        error::{Error, FramingError},
        handler::MessageHandler,
        utils::Result,
        wire::{self, DEFAULT_MAX_MSIZE, HEADER_SIZE, MsgType},
    },
    bytes::{Buf, BufMut, Bytes, BytesMut},
    futures::sink::SinkExt,
    log::{error, info, warn},
    std::{collections::HashMap, sync::Arc},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::Mutex,
    },
    tokio_stream::StreamExt,
    tokio_util::{
        codec::{FramedWrite, length_delimited::LengthDelimitedCodec},
        io::ReaderStream,
        sync::CancellationToken,
    },
};

type FrameSink<W> = FramedWrite<W, LengthDelimitedCodec>;

/// One outstanding request in the in-flight table.
///
/// `seq` distinguishes the table entry a completion belongs to from a
/// newer entry that took over the same tag; a completion only removes
/// and answers its own generation.
struct Inflight {
    seq: u64,
    cancel: CancellationToken,
}

/// Session multiplexer for a single 9P connection.
///
/// `W` is the write half of the connection; the read side is either
/// driven externally through [`receive`](Session::receive) or pumped
/// from an `AsyncRead` by [`run`](Session::run).
pub struct Session<H, W: AsyncWrite> {
    handler: Arc<H>,
    writer: Arc<Mutex<FrameSink<W>>>,
    recv: BytesMut,
    inflight: Arc<Mutex<HashMap<u16, Inflight>>>,
    next_seq: u64,
    max_msize: u32,
    /// Cancelled exactly once, when the session leaves the established
    /// state. Late completions check it instead of writing to a dead
    /// connection.
    shutdown: CancellationToken,
}

impl<H, W> Session<H, W>
where
    H: MessageHandler + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Create a session over the write half of a connection.
    pub fn new(handler: H, writer: W) -> Session<H, W> {
        Session::with_max_msize(handler, writer, DEFAULT_MAX_MSIZE)
    }

    /// Create a session with a non-default limit on the declared
    /// message size.
    pub fn with_max_msize(handler: H, writer: W, max_msize: u32) -> Session<H, W> {
        let framedwrite = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .max_frame_length(max_msize as usize)
            .new_write(writer);

        Session {
            handler: Arc::new(handler),
            writer: Arc::new(Mutex::new(framedwrite)),
            recv: BytesMut::with_capacity(8 * 1024),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_seq: 0,
            max_msize,
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of requests currently awaiting a handler completion.
    pub async fn pending_requests(&self) -> usize {
        self.inflight.lock().await.len()
    }

    /// Feed newly received bytes into the session.
    ///
    /// Buffers `chunk`, then extracts and dispatches every complete
    /// message at the head of the buffer, in wire order. Chunks may be
    /// split at arbitrary byte positions; a message is acted on only
    /// once its final byte has arrived.
    ///
    /// An `Err` from here is fatal: the session transitions to closed
    /// and the caller must stop feeding it.
    pub async fn receive(&mut self, chunk: &[u8]) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let res = self.ingest(chunk).await;
        if res.is_err() {
            self.shutdown.cancel();
        }
        res
    }

    async fn ingest(&mut self, chunk: &[u8]) -> Result<()> {
        self.recv.extend_from_slice(chunk);

        while let Some((header, body)) = self.next_msg()? {
            info!(
                "\t← type {} tag {} body {}B",
                header.typ,
                header.tag,
                body.len()
            );

            if header.typ == MsgType::TFlush as u8 {
                self.flush(header.tag, &body).await?;
            } else {
                self.dispatch(header.typ, header.tag, body).await;
            }
        }

        Ok(())
    }

    /// Try to take one complete message off the head of the receive
    /// buffer. `Ok(None)` means wait for more bytes.
    fn next_msg(&mut self) -> Result<Option<(wire::Header, Bytes)>> {
        if self.recv.len() < 4 {
            return Ok(None);
        }

        let size = wire::read_uint(&self.recv, 0, 4) as u32;
        if (size as usize) < HEADER_SIZE {
            return Err(FramingError::SizeTooSmall(size).into());
        }
        if size > self.max_msize {
            return Err(FramingError::SizeTooLarge(size).into());
        }
        if self.recv.len() < size as usize {
            return Ok(None);
        }

        let mut msg = self.recv.split_to(size as usize);
        let header = wire::Header::decode(&msg);
        msg.advance(HEADER_SIZE);

        Ok(Some((header, msg.freeze())))
    }

    /// Handle a `TFlush` synchronously: cancel the named request if it
    /// is still in flight, then answer the flush immediately. The
    /// cancelled request never gets a response of its own.
    ///
    /// Flushing a tag that already completed, or was already flushed,
    /// finds no table entry and is a no-op apart from the reply.
    async fn flush(&mut self, tag: u16, body: &[u8]) -> Result<()> {
        if body.len() < 2 {
            return Err(FramingError::TruncatedFlush(body.len()).into());
        }
        let oldtag = wire::read_uint(body, 0, 2) as u16;

        if let Some(entry) = self.inflight.lock().await.remove(&oldtag) {
            entry.cancel.cancel();
            info!("flushed tag {oldtag}");
        }

        let reply = response_frame(MsgType::RFlush as u8, tag, &[]);
        let mut writer = self.writer.lock().await;
        writer.send(reply).await?;
        Ok(())
    }

    /// Start one request's handler as its own task and record it in the
    /// in-flight table.
    ///
    /// A tag already present in the table is a peer protocol violation;
    /// it is tolerated with last-insert-wins so that buggy-but-common
    /// clients keep working. The superseded request still runs, but its
    /// completion fails the generation check and is dropped.
    async fn dispatch(&mut self, typ: u8, tag: u16, body: Bytes) {
        self.next_seq += 1;
        let seq = self.next_seq;
        let cancel = CancellationToken::new();

        {
            let mut inflight = self.inflight.lock().await;
            let old = inflight.insert(
                tag,
                Inflight {
                    seq,
                    cancel: cancel.clone(),
                },
            );
            if old.is_some() {
                warn!("tag {tag} reused while still in flight, superseding");
            }
        }

        let handler = self.handler.clone();
        let writer = self.writer.clone();
        let inflight = self.inflight.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = handler.process_msg(typ, body) => outcome,
            };

            complete(
                tag, seq, outcome, &handler, &writer, &inflight, &shutdown,
            )
            .await;
        });
    }

    /// Tear the session down: no further messages are accepted, and
    /// in-flight handlers are abandoned. Their eventual completions
    /// observe the shutdown and write nothing.
    pub async fn disconnect(&mut self) {
        self.shutdown.cancel();
        self.inflight.lock().await.clear();
        self.recv.clear();
    }

    /// Drive the session from the read half of the connection until
    /// EOF or a fatal error, then tear it down.
    pub async fn run<R>(mut self, reader: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let res = self.pump(reader).await;
        if let Err(ref e) = res {
            error!("session fatal: {e}");
        }
        self.disconnect().await;
        res
    }

    async fn pump<R>(&mut self, reader: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut chunks = ReaderStream::new(reader);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                // A completion task hit a write error
                _ = shutdown.cancelled() => {
                    return Err(Error::ConnectionClosed);
                }
                chunk = chunks.next() => match chunk {
                    Some(chunk) => self.receive(&chunk?).await?,
                    None => return Ok(()),
                },
            }
        }
    }
}

/// Settle one dispatched request: drop it from the in-flight table,
/// turn its outcome into a response and write it out.
///
/// Runs on the request's own task after `process_msg` resolves. If the
/// table no longer holds this request's generation, the request was
/// flushed or superseded in the window since the handler finished, and
/// no response may be written for it.
async fn complete<H, W>(
    tag: u16,
    seq: u64,
    outcome: Result<crate::handler::Response>,
    handler: &Arc<H>,
    writer: &Arc<Mutex<FrameSink<W>>>,
    inflight: &Arc<Mutex<HashMap<u16, Inflight>>>,
    shutdown: &CancellationToken,
) where
    H: MessageHandler,
    W: AsyncWrite + Send + Unpin,
{
    {
        let mut inflight = inflight.lock().await;
        match inflight.get(&tag) {
            Some(entry) if entry.seq == seq => {
                inflight.remove(&tag);
            }
            _ => {
                warn!("stale completion for tag {tag}, dropping");
                return;
            }
        }
    }

    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            error!("handler failed for tag {tag}: {e}");
            handler.on_error(&e)
        }
    };

    // The connection is gone; abandoned completions must not write.
    if shutdown.is_cancelled() {
        return;
    }

    let frame = response_frame(response.typ, tag, &response.fields);
    let mut writer = writer.lock().await;
    if let Err(e) = writer.send(frame).await {
        error!("write failed for tag {tag}: {e}");
        shutdown.cancel();
        return;
    }
    info!("\t→ type {} tag {}", response.typ, tag);
}

/// Frame body handed to the length codec: type[1] tag[2] fields, with
/// the size field prepended on the wire by the codec.
fn response_frame(typ: u8, tag: u16, fields: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(3 + fields.len());
    buf.put_u8(typ);
    buf.put_u16_le(tag);
    buf.put_slice(fields);
    buf.freeze()
}
