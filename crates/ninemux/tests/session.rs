//! Session multiplexer behavior over in-memory connections.

use {
    async_trait::async_trait,
    bytes::Bytes,
    ninemux::{
        Error, FramingError, MessageHandler, Response, Result, Session,
        wire::{HEADER_SIZE, Header, MsgType, frame},
    },
    std::{collections::HashMap, sync::Arc, time::Duration},
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
        sync::{Mutex, Notify},
        time::timeout,
    },
};

const RERROR: u8 = MsgType::RError as u8;

/// Echoes the body back with the paired R-opcode, immediately.
#[derive(Clone)]
struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn process_msg(&self, typ: u8, body: Bytes) -> Result<Response> {
        Ok(Response::new(typ + 1, body))
    }

    fn on_error(&self, err: &Error) -> Response {
        Response::new(RERROR, err.to_string().into_bytes())
    }
}

/// Echoes, but only after the gate named by the first body byte has
/// been opened. Lets tests decide completion order and hold requests
/// in flight indefinitely.
#[derive(Clone, Default)]
struct Gated {
    gates: Arc<Mutex<HashMap<u8, Arc<Notify>>>>,
}

impl Gated {
    async fn gate(&self, key: u8) -> Arc<Notify> {
        self.gates.lock().await.entry(key).or_default().clone()
    }

    async fn open(&self, key: u8) {
        self.gate(key).await.notify_one();
    }
}

#[async_trait]
impl MessageHandler for Gated {
    async fn process_msg(&self, typ: u8, body: Bytes) -> Result<Response> {
        let gate = self.gate(body[0]).await;
        gate.notified().await;
        Ok(Response::new(typ + 1, body))
    }

    fn on_error(&self, err: &Error) -> Response {
        Response::new(RERROR, err.to_string().into_bytes())
    }
}

/// Fails requests whose body starts with 0xff, echoes the rest.
#[derive(Clone)]
struct Faulty;

#[async_trait]
impl MessageHandler for Faulty {
    async fn process_msg(&self, typ: u8, body: Bytes) -> Result<Response> {
        if body.first() == Some(&0xff) {
            return Err(Error::Handler("boom".to_owned()));
        }
        Ok(Response::new(typ + 1, body))
    }

    fn on_error(&self, _err: &Error) -> Response {
        Response::new(RERROR, &b"boom"[..])
    }
}

/// A session driven by hand, with the peer's read half to observe
/// what got written.
fn session_pair<H>(handler: H) -> (Session<H, WriteHalf<DuplexStream>>, ReadHalf<DuplexStream>)
where
    H: MessageHandler + 'static,
{
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (_server_read, server_write) = tokio::io::split(server);
    let (client_read, _client_write) = tokio::io::split(client);

    (Session::new(handler, server_write), client_read)
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> (u8, u16, Vec<u8>) {
    let mut hdr = [0u8; HEADER_SIZE];
    r.read_exact(&mut hdr).await.unwrap();
    let header = Header::decode(&hdr);

    let mut body = vec![0u8; header.size as usize - HEADER_SIZE];
    r.read_exact(&mut body).await.unwrap();
    (header.typ, header.tag, body)
}

async fn expect_silence<R: AsyncRead + Unpin>(r: &mut R) {
    let mut byte = [0u8; 1];
    let res = timeout(Duration::from_millis(50), r.read_exact(&mut byte)).await;
    assert!(res.is_err(), "unexpected bytes on the wire");
}

#[tokio::test]
async fn partial_message_dispatches_only_when_complete() {
    let handler = Gated::default();
    let (mut session, mut peer) = session_pair(handler.clone());

    let msg = frame(MsgType::TWalk as u8, 1, &[7, 7]);

    // One byte at a time; nothing may happen before the last byte
    for b in &msg[..msg.len() - 1] {
        session.receive(&[*b]).await.unwrap();
        assert_eq!(session.pending_requests().await, 0);
    }

    session.receive(&msg[msg.len() - 1..]).await.unwrap();
    assert_eq!(session.pending_requests().await, 1);

    handler.open(7).await;
    let (typ, tag, body) = read_frame(&mut peer).await;
    assert_eq!(typ, MsgType::RWalk as u8);
    assert_eq!(tag, 1);
    assert_eq!(body, vec![7, 7]);
}

#[tokio::test]
async fn multiple_messages_in_one_chunk() {
    let handler = Gated::default();
    let (mut session, mut peer) = session_pair(handler.clone());

    let mut chunk = Vec::new();
    for tag in 1u16..=3 {
        chunk.extend_from_slice(&frame(MsgType::TRead as u8, tag, &[tag as u8]));
    }

    session.receive(&chunk).await.unwrap();
    assert_eq!(session.pending_requests().await, 3);

    // Release in reverse and collect all three replies
    for key in (1u8..=3).rev() {
        handler.open(key).await;
    }
    let mut tags = Vec::new();
    for _ in 0..3 {
        let (typ, tag, _) = read_frame(&mut peer).await;
        assert_eq!(typ, MsgType::RRead as u8);
        tags.push(tag);
    }
    tags.sort_unstable();
    assert_eq!(tags, vec![1, 2, 3]);
    assert_eq!(session.pending_requests().await, 0);
}

#[tokio::test]
async fn responses_follow_completion_order_not_request_order() {
    let handler = Gated::default();
    let (mut session, mut peer) = session_pair(handler.clone());

    session
        .receive(&frame(MsgType::TRead as u8, 1, &[1]))
        .await
        .unwrap();
    session
        .receive(&frame(MsgType::TRead as u8, 2, &[2]))
        .await
        .unwrap();

    // B settles first, so B's response must be written first
    handler.open(2).await;
    let (_, tag, _) = read_frame(&mut peer).await;
    assert_eq!(tag, 2);

    handler.open(1).await;
    let (_, tag, _) = read_frame(&mut peer).await;
    assert_eq!(tag, 1);
}

#[tokio::test]
async fn flush_before_completion_cancels_and_replies() {
    let handler = Gated::default();
    let (mut session, mut peer) = session_pair(handler.clone());

    // The gate for key 5 is never opened; tag 5 would hang forever
    session
        .receive(&frame(MsgType::TRead as u8, 5, &[5]))
        .await
        .unwrap();
    assert_eq!(session.pending_requests().await, 1);

    session
        .receive(&frame(MsgType::TFlush as u8, 42, &[5, 0]))
        .await
        .unwrap();

    // Flush is answered immediately, without waiting for tag 5
    let (typ, tag, body) = read_frame(&mut peer).await;
    assert_eq!(typ, MsgType::RFlush as u8);
    assert_eq!(tag, 42);
    assert!(body.is_empty());
    assert_eq!(session.pending_requests().await, 0);

    // No response for tag 5 ever appears, even if its gate opens late
    handler.open(5).await;
    expect_silence(&mut peer).await;
}

#[tokio::test]
async fn flush_after_completion_is_a_noop() {
    let handler = Gated::default();
    let (mut session, mut peer) = session_pair(handler.clone());

    session
        .receive(&frame(MsgType::TRead as u8, 7, &[7]))
        .await
        .unwrap();
    handler.open(7).await;

    let (_, tag, _) = read_frame(&mut peer).await;
    assert_eq!(tag, 7);

    session
        .receive(&frame(MsgType::TFlush as u8, 43, &[7, 0]))
        .await
        .unwrap();

    let (typ, tag, _) = read_frame(&mut peer).await;
    assert_eq!(typ, MsgType::RFlush as u8);
    assert_eq!(tag, 43);

    // No duplicate response for tag 7
    expect_silence(&mut peer).await;
}

#[tokio::test]
async fn flushing_an_unknown_tag_still_replies() {
    let (mut session, mut peer) = session_pair(Echo);

    session
        .receive(&frame(MsgType::TFlush as u8, 9, &[77, 0]))
        .await
        .unwrap();

    let (typ, tag, _) = read_frame(&mut peer).await;
    assert_eq!(typ, MsgType::RFlush as u8);
    assert_eq!(tag, 9);
}

#[tokio::test]
async fn handler_failure_becomes_error_response() {
    let (mut session, mut peer) = session_pair(Faulty);

    session
        .receive(&frame(MsgType::TRead as u8, 9, &[0xff]))
        .await
        .unwrap();

    let (typ, tag, body) = read_frame(&mut peer).await;
    assert_eq!(typ, RERROR);
    assert_eq!(tag, 9);
    assert_eq!(body, b"boom");

    // The session survives and keeps serving
    session
        .receive(&frame(MsgType::TRead as u8, 10, &[1]))
        .await
        .unwrap();
    let (typ, tag, body) = read_frame(&mut peer).await;
    assert_eq!(typ, MsgType::RRead as u8);
    assert_eq!(tag, 10);
    assert_eq!(body, vec![1]);
}

#[tokio::test]
async fn undersized_frame_is_fatal() {
    let (mut session, _peer) = session_pair(Echo);

    // size=6 can never be a legal message
    let res = session.receive(&[6, 0, 0, 0, 116, 1]).await;
    assert!(matches!(
        res,
        Err(Error::Framing(FramingError::SizeTooSmall(6)))
    ));

    // The session is closed; further bytes are refused
    let res = session.receive(&frame(MsgType::TRead as u8, 1, &[])).await;
    assert!(matches!(res, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn oversized_frame_is_fatal() {
    let (client, server) = tokio::io::duplex(4 * 1024);
    let (_, server_write) = tokio::io::split(server);
    let (_client_read, _client_write) = tokio::io::split(client);

    let mut session = Session::with_max_msize(Echo, server_write, 1024);
    let res = session.receive(&[0, 8, 0, 0]).await;
    assert!(matches!(
        res,
        Err(Error::Framing(FramingError::SizeTooLarge(2048)))
    ));
}

#[tokio::test]
async fn truncated_flush_is_fatal() {
    let (mut session, _peer) = session_pair(Echo);

    let res = session.receive(&frame(MsgType::TFlush as u8, 4, &[5])).await;
    assert!(matches!(
        res,
        Err(Error::Framing(FramingError::TruncatedFlush(1)))
    ));
}

#[tokio::test]
async fn duplicate_tag_supersedes_older_request() {
    let handler = Gated::default();
    let (mut session, mut peer) = session_pair(handler.clone());

    session
        .receive(&frame(MsgType::TRead as u8, 4, &[1]))
        .await
        .unwrap();
    session
        .receive(&frame(MsgType::TRead as u8, 4, &[2]))
        .await
        .unwrap();
    assert_eq!(session.pending_requests().await, 1);

    // The superseded request's completion must be dropped
    handler.open(1).await;
    handler.open(2).await;

    let (_, tag, body) = read_frame(&mut peer).await;
    assert_eq!(tag, 4);
    assert_eq!(body, vec![2]);
    expect_silence(&mut peer).await;
}

#[tokio::test]
async fn response_write_failure_closes_session() {
    let (client, server) = tokio::io::duplex(64);
    let (_server_read, server_write) = tokio::io::split(server);
    let mut session = Session::new(Echo, server_write);

    // The peer is gone before the response can be written
    drop(client);

    session
        .receive(&frame(MsgType::TRead as u8, 1, &[1]))
        .await
        .unwrap();

    // The completion task hits the dead connection; the session must
    // transition to closed
    let err = timeout(Duration::from_secs(5), async {
        loop {
            match session.receive(&[]).await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(e) => break e,
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(err, Error::ConnectionClosed));
}

#[tokio::test]
async fn flush_reply_write_failure_is_fatal() {
    let (client, server) = tokio::io::duplex(64);
    let (_server_read, server_write) = tokio::io::split(server);
    let mut session = Session::new(Echo, server_write);

    drop(client);

    // The flush reply is written inline, so the failure surfaces here
    let res = session
        .receive(&frame(MsgType::TFlush as u8, 1, &[9, 0]))
        .await;
    assert!(matches!(res, Err(Error::Io(_))));
    assert!(matches!(
        session.receive(&[]).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn late_completion_after_disconnect_is_a_noop() {
    let handler = Gated::default();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let (mut client_read, mut client_write) = tokio::io::split(client);

    let session = Session::new(handler.clone(), server_write);
    let task = tokio::spawn(session.run(server_read));

    // Leave a request in flight, then hang up
    client_write
        .write_all(&frame(MsgType::TRead as u8, 5, &[5]))
        .await
        .unwrap();
    client_write.shutdown().await.unwrap();
    assert!(task.await.unwrap().is_ok());

    // The abandoned handler settles after the session is gone; its
    // completion must write nothing. The read below sees EOF once the
    // completion task finishes, or a frame byte if it misbehaved.
    handler.open(5).await;
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), client_read.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn run_serves_until_eof() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let (mut client_read, mut client_write) = tokio::io::split(client);

    let session = Session::new(Echo, server_write);
    let task = tokio::spawn(session.run(server_read));

    client_write
        .write_all(&frame(MsgType::TClunk as u8, 11, &[]))
        .await
        .unwrap();
    let (typ, tag, _) = read_frame(&mut client_read).await;
    assert_eq!(typ, MsgType::RClunk as u8);
    assert_eq!(tag, 11);

    client_write.shutdown().await.unwrap();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn run_closes_connection_on_framing_error() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let (mut client_read, mut client_write) = tokio::io::split(client);

    let session = Session::new(Echo, server_write);
    let task = tokio::spawn(session.run(server_read));

    client_write.write_all(&[2, 0, 0, 0, 0, 0, 0]).await.unwrap();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::Framing(FramingError::SizeTooSmall(2))
    ));

    // The peer observes the connection closing, not a partial message
    let mut buf = [0u8; 1];
    assert_eq!(client_read.read(&mut buf).await.unwrap(), 0);
}
