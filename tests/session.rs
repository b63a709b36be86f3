//! Connection-level scenarios driven over an in-memory transport with the
//! real codec and compressors on the test side.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use spdymux::{
    client, server, setting, Control, DataFrame, Decoded, Error, Frame, FrameCodec, GoawayFrame,
    HeaderCompressor, HeaderDecompressor, Headers, HeadersFrame, Incoming, PingFrame, RstStatus,
    RstStreamFrame, Setting, SettingsFrame, StreamEvent, SynReplyFrame, SynStreamFrame, Version,
    WindowUpdateFrame,
};

const SHORT: Duration = Duration::from_millis(100);
const LONG: Duration = Duration::from_secs(2);

/// The remote end of the connection under test.
struct Peer {
    io: DuplexStream,
    codec: FrameCodec,
    comp: HeaderCompressor,
    decomp: HeaderDecompressor,
}

impl Peer {
    fn new(io: DuplexStream, version: Version) -> Self {
        Self {
            io,
            codec: FrameCodec::new(version),
            comp: HeaderCompressor::new(version).unwrap(),
            decomp: HeaderDecompressor::new(version),
        }
    }

    async fn send(&mut self, frame: Frame) {
        self.codec
            .write_frame(&mut self.io, &frame, &mut self.comp)
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Frame {
        match timeout(LONG, self.codec.read_frame(&mut self.io, &mut self.decomp))
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("unexpected eof")
        {
            Decoded::Frame(frame) => frame,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    /// Every session leads with its initial SETTINGS.
    async fn skip_settings(&mut self) {
        match self.recv().await {
            Frame::Settings(_) => {}
            other => panic!("expected initial SETTINGS, got {other:?}"),
        }
    }

    async fn expect_silence(&mut self) {
        assert!(
            timeout(SHORT, self.codec.read_frame(&mut self.io, &mut self.decomp))
                .await
                .is_err(),
            "expected no further frames"
        );
    }

    fn rst(&self, stream_id: u32, status: RstStatus) -> Frame {
        Frame::RstStream(RstStreamFrame::new(self.codec.version(), stream_id, status))
    }
}

fn request_headers() -> Headers {
    let mut headers = Headers::new();
    headers.insert(":method".into(), vec!["GET".into()]);
    headers.insert(":path".into(), vec!["/".into()]);
    headers
}

fn syn_stream(version: Version, stream_id: u32, fin: bool) -> Frame {
    Frame::SynStream(SynStreamFrame {
        version,
        stream_id,
        associated_stream_id: 0,
        priority: 0,
        slot: 0,
        headers: request_headers(),
        fin,
        unidirectional: false,
    })
}

fn start_server(version: Version) -> (Control, Incoming, JoinHandle<Result<(), Error>>, Peer) {
    let (near, far) = tokio::io::duplex(256 * 1024);
    let (control, incoming, session) = server::handshake(near, version).unwrap();
    let driver = tokio::spawn(session.run());
    (control, incoming, driver, Peer::new(far, version))
}

fn start_client(version: Version) -> (Control, Incoming, JoinHandle<Result<(), Error>>, Peer) {
    let (near, far) = tokio::io::duplex(256 * 1024);
    let (control, incoming, session) = client::handshake(near, version).unwrap();
    let driver = tokio::spawn(session.run());
    (control, incoming, driver, Peer::new(far, version))
}

async fn wait_for_stream_count(control: &Control, want: usize) {
    timeout(LONG, async {
        while control.active_streams() != want {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "stream table never reached {want} entries (now {})",
            control.active_streams()
        )
    });
}

#[tokio::test]
async fn accepts_first_client_stream() {
    let (control, mut incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    peer.send(syn_stream(Version::V3, 1, false)).await;
    let mut handle = timeout(LONG, incoming.accept()).await.unwrap().unwrap();
    assert_eq!(handle.id(), 1);
    match timeout(LONG, handle.recv()).await.unwrap().unwrap() {
        StreamEvent::Headers { headers, fin } => {
            assert_eq!(headers, request_headers());
            assert!(!fin);
        }
        other => panic!("expected headers, got {other:?}"),
    }
    assert_eq!(control.active_streams(), 1);
    // A clean accept produces no outbound frame.
    peer.expect_silence().await;
}

#[tokio::test]
async fn rejects_wrong_parity_syn_stream() {
    let (control, mut incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    // Even ids belong to the server; a client must not use them.
    peer.send(syn_stream(Version::V3, 2, false)).await;
    match peer.recv().await {
        Frame::RstStream(rst) => {
            assert_eq!(rst.stream_id, 2);
            assert_eq!(rst.status(), Some(RstStatus::ProtocolError));
        }
        other => panic!("expected RST_STREAM, got {other:?}"),
    }
    assert_eq!(control.active_streams(), 0);

    // The violation is strict but not fatal: a valid stream still opens.
    peer.send(syn_stream(Version::V3, 1, false)).await;
    let handle = timeout(LONG, incoming.accept()).await.unwrap().unwrap();
    assert_eq!(handle.id(), 1);
}

#[tokio::test]
async fn out_of_order_syn_stream_is_rejected() {
    let (_control, mut incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    peer.send(syn_stream(Version::V3, 1, false)).await;
    let _first = timeout(LONG, incoming.accept()).await.unwrap().unwrap();

    // Replaying an id is an error, not a no-op; so is skipping ahead.
    peer.send(syn_stream(Version::V3, 1, false)).await;
    match peer.recv().await {
        Frame::RstStream(rst) => {
            assert_eq!(rst.stream_id, 1);
            assert_eq!(rst.status(), Some(RstStatus::ProtocolError));
        }
        other => panic!("expected RST_STREAM, got {other:?}"),
    }
    peer.send(syn_stream(Version::V3, 7, false)).await;
    match peer.recv().await {
        Frame::RstStream(rst) => assert_eq!(rst.stream_id, 7),
        other => panic!("expected RST_STREAM, got {other:?}"),
    }
}

#[tokio::test]
async fn echoes_peer_originated_ping() {
    let (_control, _incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    // Odd ping ids are client-originated; a server echoes them unmodified.
    peer.send(Frame::Ping(PingFrame {
        version: Version::V3,
        id: 1,
    }))
    .await;
    match peer.recv().await {
        Frame::Ping(ping) => assert_eq!(ping.id, 1),
        other => panic!("expected PING echo, got {other:?}"),
    }
}

#[tokio::test]
async fn local_ping_resolves_on_reply() {
    let (control, _incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    let pong = control.ping();
    let id = match peer.recv().await {
        Frame::Ping(ping) => ping.id,
        other => panic!("expected PING, got {other:?}"),
    };
    assert_eq!(id % 2, 0, "server pings use even ids");
    peer.send(Frame::Ping(PingFrame {
        version: Version::V3,
        id,
    }))
    .await;
    assert!(timeout(LONG, pong).await.unwrap());
}

#[tokio::test]
async fn pending_ping_resolves_false_when_connection_dies() {
    let (control, _incoming, _driver, peer) = start_server(Version::V3);
    let pong = control.ping();
    drop(peer);
    assert!(!timeout(LONG, pong).await.unwrap());
}

#[tokio::test]
async fn goaway_cancels_streams_past_horizon() {
    let (control, _incoming, _driver, mut peer) = start_client(Version::V3);
    peer.skip_settings().await;

    for _ in 0..5 {
        control.open(request_headers(), false).unwrap();
    }
    for expected in [1u32, 3, 5, 7, 9] {
        match peer.recv().await {
            Frame::SynStream(syn) => assert_eq!(syn.stream_id, expected),
            other => panic!("expected SYN_STREAM, got {other:?}"),
        }
    }

    peer.send(Frame::Goaway(GoawayFrame {
        version: Version::V3,
        last_good_stream_id: 5,
        status: 0,
    }))
    .await;

    // Streams 7 and 9 emit RST CANCEL; 1, 3, and 5 keep going.
    let mut cancelled = Vec::new();
    for _ in 0..2 {
        match peer.recv().await {
            Frame::RstStream(rst) => {
                assert_eq!(rst.status(), Some(RstStatus::Cancel));
                cancelled.push(rst.stream_id);
            }
            other => panic!("expected RST_STREAM, got {other:?}"),
        }
    }
    cancelled.sort_unstable();
    assert_eq!(cancelled, [7, 9]);
    wait_for_stream_count(&control, 3).await;

    assert!(control.is_going_away());
    assert!(matches!(
        control.open(request_headers(), false),
        Err(Error::GoingAway)
    ));
}

#[tokio::test]
async fn benign_error_budget_escalates_to_protocol_error() {
    let (_control, _incoming, driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    // PING replies for ids we never registered are benign, until the
    // eleventh tips the budget.
    for id in (2..=22).step_by(2) {
        peer.send(Frame::Ping(PingFrame {
            version: Version::V3,
            id,
        }))
        .await;
    }
    match peer.recv().await {
        Frame::RstStream(rst) => {
            assert_eq!(rst.stream_id, 0);
            assert_eq!(rst.status(), Some(RstStatus::ProtocolError));
        }
        other => panic!("expected RST_STREAM, got {other:?}"),
    }
    assert!(matches!(
        timeout(LONG, driver).await.unwrap().unwrap(),
        Err(Error::Protocol(0))
    ));
}

#[tokio::test]
async fn data_and_reply_close_both_halves() {
    let (control, mut incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    peer.send(syn_stream(Version::V3, 1, false)).await;
    let mut handle = timeout(LONG, incoming.accept()).await.unwrap().unwrap();
    let _ = timeout(LONG, handle.recv()).await.unwrap().unwrap();

    peer.send(Frame::Data(DataFrame::new(
        1,
        Bytes::from_static(b"hello"),
        true,
    )))
    .await;
    match timeout(LONG, handle.recv()).await.unwrap().unwrap() {
        StreamEvent::Data { data, fin } => {
            assert_eq!(&data[..], b"hello");
            assert!(fin);
        }
        other => panic!("expected data, got {other:?}"),
    }

    let mut response = Headers::new();
    response.insert(":status".into(), vec!["200".into()]);
    handle.reply(response.clone(), true).unwrap();
    match peer.recv().await {
        Frame::SynReply(reply) => {
            assert_eq!(reply.stream_id, 1);
            assert_eq!(reply.headers, response);
            assert!(reply.fin);
        }
        other => panic!("expected SYN_REPLY, got {other:?}"),
    }

    // Both halves closed: the stream is gone and the event channel ends.
    wait_for_stream_count(&control, 0).await;
    assert!(timeout(LONG, handle.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn data_for_unknown_stream_is_invalid_stream() {
    let (_control, _incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    peer.send(Frame::Data(DataFrame::new(
        9,
        Bytes::from_static(b"stray"),
        false,
    )))
    .await;
    match peer.recv().await {
        Frame::RstStream(rst) => {
            assert_eq!(rst.stream_id, 9);
            assert_eq!(rst.status(), Some(RstStatus::InvalidStream));
        }
        other => panic!("expected RST_STREAM, got {other:?}"),
    }
}

#[tokio::test]
async fn send_window_throttles_data() {
    let (_control, mut incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    // Shrink the window the server grants to new streams, then open one.
    peer.send(Frame::Settings(SettingsFrame {
        version: Version::V3,
        clear_persisted: false,
        entries: vec![Setting {
            flags: 0,
            id: setting::INITIAL_WINDOW_SIZE,
            value: 5,
        }],
    }))
    .await;
    peer.send(syn_stream(Version::V3, 1, false)).await;
    let mut handle = timeout(LONG, incoming.accept()).await.unwrap().unwrap();
    let _ = timeout(LONG, handle.recv()).await.unwrap().unwrap();

    let writer = tokio::spawn(async move {
        handle
            .send_data(Bytes::from_static(b"0123456789"), false)
            .await
            .unwrap();
        handle
    });

    match peer.recv().await {
        Frame::Data(data) => assert_eq!(&data.data[..], b"01234"),
        other => panic!("expected DATA, got {other:?}"),
    }
    peer.expect_silence().await;

    peer.send(Frame::WindowUpdate(WindowUpdateFrame {
        version: Version::V3,
        stream_id: 1,
        delta: 5,
    }))
    .await;
    match peer.recv().await {
        Frame::Data(data) => assert_eq!(&data.data[..], b"56789"),
        other => panic!("expected DATA, got {other:?}"),
    }
    writer.await.unwrap();
}

#[tokio::test]
async fn zero_window_delta_is_fatal() {
    let (_control, mut incoming, driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    peer.send(syn_stream(Version::V3, 1, false)).await;
    let _handle = timeout(LONG, incoming.accept()).await.unwrap().unwrap();

    peer.send(Frame::WindowUpdate(WindowUpdateFrame {
        version: Version::V3,
        stream_id: 1,
        delta: 0,
    }))
    .await;
    match peer.recv().await {
        Frame::RstStream(rst) => {
            assert_eq!(rst.stream_id, 1);
            assert_eq!(rst.status(), Some(RstStatus::ProtocolError));
        }
        other => panic!("expected RST_STREAM, got {other:?}"),
    }
    assert!(matches!(
        timeout(LONG, driver).await.unwrap().unwrap(),
        Err(Error::Protocol(1))
    ));
}

#[tokio::test]
async fn max_window_delta_is_accepted() {
    let (_control, mut incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    peer.send(syn_stream(Version::V3, 1, false)).await;
    let _handle = timeout(LONG, incoming.accept()).await.unwrap().unwrap();

    peer.send(Frame::WindowUpdate(WindowUpdateFrame {
        version: Version::V3,
        stream_id: 1,
        delta: spdymux::MAX_DELTA_WINDOW_SIZE,
    }))
    .await;
    // Still alive: a ping comes back.
    peer.send(Frame::Ping(PingFrame {
        version: Version::V3,
        id: 1,
    }))
    .await;
    match peer.recv().await {
        Frame::Ping(ping) => assert_eq!(ping.id, 1),
        other => panic!("expected PING echo, got {other:?}"),
    }
}

#[tokio::test]
async fn close_sends_goaway_with_last_accepted_stream() {
    let (control, mut incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    peer.send(syn_stream(Version::V3, 1, false)).await;
    let _handle = timeout(LONG, incoming.accept()).await.unwrap().unwrap();

    control.close();
    match peer.recv().await {
        Frame::Goaway(goaway) => assert_eq!(goaway.last_good_stream_id, 1),
        other => panic!("expected GOAWAY, got {other:?}"),
    }
    assert!(matches!(
        control.push(request_headers(), 1),
        Err(Error::GoingAway)
    ));

    // New streams after our GOAWAY are dropped without a reply.
    peer.send(syn_stream(Version::V3, 3, false)).await;
    peer.expect_silence().await;
}

#[tokio::test]
async fn version_mismatch_draws_unsupported_version() {
    let (_control, _incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    // A SPDY/2 PING, byte by byte, on a version 3 connection.
    peer.io
        .write_all(&[0x80, 0x02, 0x00, 0x06, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01])
        .await
        .unwrap();
    match peer.recv().await {
        Frame::RstStream(rst) => {
            assert_eq!(rst.stream_id, 0);
            assert_eq!(rst.status(), Some(RstStatus::UnsupportedVersion));
        }
        other => panic!("expected RST_STREAM, got {other:?}"),
    }

    // The mismatch is not fatal.
    peer.send(Frame::Ping(PingFrame {
        version: Version::V3,
        id: 1,
    }))
    .await;
    match peer.recv().await {
        Frame::Ping(ping) => assert_eq!(ping.id, 1),
        other => panic!("expected PING echo, got {other:?}"),
    }
}

#[tokio::test]
async fn push_emits_unidirectional_syn_stream() {
    let (control, mut incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    peer.send(syn_stream(Version::V3, 1, false)).await;
    let _parent = timeout(LONG, incoming.accept()).await.unwrap().unwrap();

    let mut pushed = control.push(request_headers(), 1).unwrap();
    assert_eq!(pushed.id(), 2);
    match peer.recv().await {
        Frame::SynStream(syn) => {
            assert_eq!(syn.stream_id, 2);
            assert_eq!(syn.associated_stream_id, 1);
            assert!(syn.unidirectional);
        }
        other => panic!("expected SYN_STREAM, got {other:?}"),
    }
    pushed
        .send_data(Bytes::from_static(b"resource"), true)
        .await
        .unwrap();
    match peer.recv().await {
        Frame::Data(data) => {
            assert_eq!(data.stream_id, 2);
            assert!(data.fin);
        }
        other => panic!("expected DATA, got {other:?}"),
    }
}

#[tokio::test]
async fn peer_cancel_closes_stream() {
    let (control, mut incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    peer.send(syn_stream(Version::V3, 1, false)).await;
    let mut handle = timeout(LONG, incoming.accept()).await.unwrap().unwrap();
    let _ = timeout(LONG, handle.recv()).await.unwrap().unwrap();

    peer.send(peer.rst(1, RstStatus::Cancel)).await;
    assert!(timeout(LONG, handle.recv()).await.unwrap().is_none());
    wait_for_stream_count(&control, 0).await;
}

#[tokio::test]
async fn peer_protocol_error_rst_is_fatal() {
    let (_control, _incoming, driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    peer.send(peer.rst(1, RstStatus::ProtocolError)).await;
    match peer.recv().await {
        Frame::RstStream(rst) => {
            assert_eq!(rst.stream_id, 1);
            assert_eq!(rst.status(), Some(RstStatus::ProtocolError));
        }
        other => panic!("expected RST_STREAM, got {other:?}"),
    }
    assert!(matches!(
        timeout(LONG, driver).await.unwrap().unwrap(),
        Err(Error::Protocol(1))
    ));
}

#[tokio::test]
async fn syn_reply_routes_to_opened_stream() {
    let (control, _incoming, _driver, mut peer) = start_client(Version::V3);
    peer.skip_settings().await;

    let mut handle = control.open(request_headers(), false).unwrap();
    match peer.recv().await {
        Frame::SynStream(syn) => assert_eq!(syn.stream_id, 1),
        other => panic!("expected SYN_STREAM, got {other:?}"),
    }

    let mut response = Headers::new();
    response.insert(":status".into(), vec!["200".into()]);
    peer.send(Frame::SynReply(SynReplyFrame {
        version: Version::V3,
        stream_id: 1,
        headers: response.clone(),
        fin: false,
    }))
    .await;
    match timeout(LONG, handle.recv()).await.unwrap().unwrap() {
        StreamEvent::Headers { headers, fin } => {
            assert_eq!(headers, response);
            assert!(!fin);
        }
        other => panic!("expected headers, got {other:?}"),
    }

    // Trailing HEADERS reach the same stream.
    let mut trailers = Headers::new();
    trailers.insert("x-checksum".into(), vec!["abc".into()]);
    peer.send(Frame::Headers(HeadersFrame {
        version: Version::V3,
        stream_id: 1,
        headers: trailers.clone(),
        fin: false,
    }))
    .await;
    match timeout(LONG, handle.recv()).await.unwrap().unwrap() {
        StreamEvent::Headers { headers, .. } => assert_eq!(headers, trailers),
        other => panic!("expected headers, got {other:?}"),
    }
}

#[tokio::test]
async fn syn_reply_for_unknown_stream_is_invalid_stream() {
    let (_control, _incoming, _driver, mut peer) = start_client(Version::V3);
    peer.skip_settings().await;

    peer.send(Frame::SynReply(SynReplyFrame {
        version: Version::V3,
        stream_id: 3,
        headers: Headers::new(),
        fin: false,
    }))
    .await;
    match peer.recv().await {
        Frame::RstStream(rst) => {
            assert_eq!(rst.stream_id, 3);
            assert_eq!(rst.status(), Some(RstStatus::InvalidStream));
        }
        other => panic!("expected RST_STREAM, got {other:?}"),
    }
}

#[tokio::test]
async fn settings_are_recorded_last_write_wins() {
    let (control, _incoming, _driver, mut peer) = start_server(Version::V3);
    peer.skip_settings().await;

    for value in [100, 200] {
        peer.send(Frame::Settings(SettingsFrame {
            version: Version::V3,
            clear_persisted: false,
            entries: vec![Setting {
                flags: 0,
                id: setting::MAX_CONCURRENT_STREAMS,
                value,
            }],
        }))
        .await;
    }
    // Settle on the second value; SETTINGS draws no reply.
    peer.send(Frame::Ping(PingFrame {
        version: Version::V3,
        id: 1,
    }))
    .await;
    match peer.recv().await {
        Frame::Ping(_) => {}
        other => panic!("expected PING echo, got {other:?}"),
    }
    assert_eq!(
        control.received_setting(setting::MAX_CONCURRENT_STREAMS),
        Some((0, 200))
    );
}

#[tokio::test]
async fn stream_handles_observe_connection_death() {
    let (control, _incoming, driver, mut peer) = start_client(Version::V3);
    peer.skip_settings().await;

    let mut handle = control.open(request_headers(), false).unwrap();
    match peer.recv().await {
        Frame::SynStream(_) => {}
        other => panic!("expected SYN_STREAM, got {other:?}"),
    }

    drop(peer);
    assert!(matches!(timeout(LONG, driver).await.unwrap().unwrap(), Ok(())));
    // The payload channel closes without an end-of-stream marker.
    assert!(timeout(LONG, handle.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn works_on_version_2_without_flow_control() {
    let (_control, mut incoming, _driver, mut peer) = start_server(Version::V2);
    peer.skip_settings().await;

    peer.send(syn_stream(Version::V2, 1, false)).await;
    let mut handle = timeout(LONG, incoming.accept()).await.unwrap().unwrap();
    let _ = timeout(LONG, handle.recv()).await.unwrap().unwrap();

    // No WINDOW_UPDATE exists on v2; a large write flows unthrottled.
    let payload = Bytes::from(vec![0xAB; 96 * 1024]);
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        handle.send_data(payload, true).await.unwrap();
    });
    let mut received = Vec::new();
    loop {
        match peer.recv().await {
            Frame::Data(data) => {
                received.extend_from_slice(&data.data);
                if data.fin {
                    break;
                }
            }
            other => panic!("expected DATA, got {other:?}"),
        }
    }
    assert_eq!(received.len(), expected.len());
    writer.await.unwrap();
}
