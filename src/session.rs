//! SPDY session: connection-level state, the ingress loop, and the outbound
//! serializer.
//!
//! One session owns one transport. Three long-lived tasks cooperate: the
//! ingress loop (sole reader, sole owner of the header decompressor), the
//! outbound serializer (sole writer, sole owner of the compressor), and the
//! caller's task holding [`Control`]. Each active stream adds one actor task
//! fed through a bounded inbox that only the ingress loop writes.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::codec::{Decoded, FrameCodec};
use crate::compress::{HeaderCompressor, HeaderDecompressor};
use crate::frame::{
    goaway_status, setting, DataFrame, Frame, GoawayFrame, PingFrame, RstStatus, RstStreamFrame,
    Setting, SettingsFrame, SynReplyFrame, SynStreamFrame, Version, WindowUpdateFrame,
};
use crate::stream::{spawn_stream, StreamHandle, StreamMsg};
use crate::utils::maybe_timeout;
use crate::{Error, DEFAULT_INITIAL_WINDOW_SIZE, MAX_BENIGN_ERRORS, MAX_DELTA_WINDOW_SIZE, MAX_STREAM_ID};

const INCOMING_CAPACITY: usize = 16;
const PROTOCOL_ERROR_GRACE: Duration = Duration::from_millis(100);
const ADVERTISED_MAX_CONCURRENT_STREAMS: u32 = 1000;

/// Which end of the connection this session is. Determines stream- and
/// ping-identifier parity and a handful of policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// Identifier parity for locally initiated streams and pings: servers
    /// use even numbers, clients odd.
    pub(crate) fn parity(self) -> u32 {
        match self {
            Role::Server => 0,
            Role::Client => 1,
        }
    }

    pub(crate) fn remote_parity(self) -> u32 {
        1 - self.parity()
    }

    fn first_local_stream_id(self) -> u32 {
        match self {
            Role::Server => 2,
            Role::Client => 1,
        }
    }

    fn first_remote_stream_id(self) -> u32 {
        match self {
            Role::Server => 1,
            Role::Client => 2,
        }
    }

    fn first_ping_id(self) -> u32 {
        match self {
            Role::Server => 2,
            Role::Client => 1,
        }
    }
}

/// Session configuration. Zero timeouts mean no deadline.
#[derive(Debug, Clone)]
pub struct Config {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Extra SETTINGS entries appended to the initial frame.
    pub initial_settings: Vec<Setting>,
    pub max_benign_errors: u32,
    /// Peer address, for log events only.
    pub peer: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            initial_settings: Vec::new(),
            max_benign_errors: MAX_BENIGN_ERRORS,
            peer: None,
        }
    }
}

/// Builder of a session with custom configuration.
#[derive(Debug, Clone)]
pub struct Builder {
    version: Version,
    config: Config,
}

impl Builder {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            config: Config::default(),
        }
    }

    /// Deadline for reading a frame off the transport.
    pub fn read_timeout(mut self, deadline: Duration) -> Self {
        self.config.read_timeout = Some(deadline);
        self
    }

    /// Deadline for writing a frame to the transport.
    pub fn write_timeout(mut self, deadline: Duration) -> Self {
        self.config.write_timeout = Some(deadline);
        self
    }

    /// Append a SETTINGS entry to the initial frame.
    pub fn initial_setting(mut self, id: u32, value: u32) -> Self {
        self.config.initial_settings.push(Setting { flags: 0, id, value });
        self
    }

    /// Override the benign protocol-error budget.
    pub fn max_benign_errors(mut self, budget: u32) -> Self {
        self.config.max_benign_errors = budget;
        self
    }

    /// Record the peer's address for log events.
    pub fn peer(mut self, addr: SocketAddr) -> Self {
        self.config.peer = Some(addr);
        self
    }

    /// Build a client-role session over an established transport.
    pub fn client<IO>(self, io: IO) -> Result<(Control, Incoming, Session<IO>), Error>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.build(io, Role::Client)
    }

    /// Build a server-role session over an established transport.
    pub fn server<IO>(self, io: IO) -> Result<(Control, Incoming, Session<IO>), Error>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.build(io, Role::Server)
    }

    fn build<IO>(self, io: IO, role: Role) -> Result<(Control, Incoming, Session<IO>), Error>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            version: self.version,
            role,
            peer: self.config.peer,
            outbox: outbox_tx,
            streams: RwLock::new(HashMap::new()),
            pings: Mutex::new(PingRegistry {
                next_id: role.first_ping_id(),
                pending: HashMap::new(),
            }),
            ids: Mutex::new(IdCounters {
                next_local: role.first_local_stream_id(),
                last_remote: 0,
                last_good_received: 0,
            }),
            settings: Mutex::new(HashMap::new()),
            initial_window: AtomicU32::new(DEFAULT_INITIAL_WINDOW_SIZE),
            goaway_sent: AtomicBool::new(false),
            goaway_received: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: shutdown_tx,
        });
        let session = Session {
            io,
            shared: shared.clone(),
            config: self.config,
            compressor: HeaderCompressor::new(self.version)?,
            decompressor: HeaderDecompressor::new(self.version),
            outbox_rx,
            incoming_tx,
            shutdown_rx,
        };
        Ok((
            Control { shared },
            Incoming { rx: incoming_rx },
            session,
        ))
    }
}

struct StreamEntry {
    inbox: mpsc::Sender<StreamMsg>,
    local_fin: bool,
    remote_fin: bool,
}

struct PingRegistry {
    next_id: u32,
    pending: HashMap<u32, oneshot::Sender<bool>>,
}

struct IdCounters {
    next_local: u32,
    /// Highest remote stream id accepted so far; 0 before the first.
    last_remote: u32,
    /// From a received GOAWAY.
    last_good_received: u32,
}

/// Connection state shared between the ingress loop, the serializer, the
/// stream actors, and the user-facing handles.
pub(crate) struct Shared {
    version: Version,
    role: Role,
    peer: Option<SocketAddr>,
    outbox: mpsc::UnboundedSender<Frame>,
    streams: RwLock<HashMap<u32, StreamEntry>>,
    pings: Mutex<PingRegistry>,
    ids: Mutex<IdCounters>,
    settings: Mutex<HashMap<u32, (u8, u32)>>,
    /// SETTINGS_INITIAL_WINDOW_SIZE as last advertised by the peer; applied
    /// to streams opened afterwards (v3).
    initial_window: AtomicU32,
    goaway_sent: AtomicBool,
    goaway_received: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    /// Append a frame to the outbox. The serializer writes frames in exactly
    /// this order.
    pub(crate) fn enqueue(&self, frame: Frame) -> Result<(), Error> {
        self.outbox.send(frame).map_err(|_| Error::ConnectionClosed)
    }

    fn inbox(&self, stream_id: u32) -> Option<mpsc::Sender<StreamMsg>> {
        self.streams
            .read()
            .unwrap()
            .get(&stream_id)
            .map(|entry| entry.inbox.clone())
    }

    /// Inbox for payload-bearing frames: the stream must exist and must not
    /// be half-closed on the remote side.
    fn payload_inbox(&self, stream_id: u32) -> Option<mpsc::Sender<StreamMsg>> {
        self.streams
            .read()
            .unwrap()
            .get(&stream_id)
            .filter(|entry| !entry.remote_fin)
            .map(|entry| entry.inbox.clone())
    }

    pub(crate) fn insert_stream(
        &self,
        stream_id: u32,
        inbox: mpsc::Sender<StreamMsg>,
        local_fin: bool,
        remote_fin: bool,
    ) {
        self.streams.write().unwrap().insert(
            stream_id,
            StreamEntry {
                inbox,
                local_fin,
                remote_fin,
            },
        );
    }

    pub(crate) fn remove_stream(&self, stream_id: u32) {
        self.streams.write().unwrap().remove(&stream_id);
    }

    pub(crate) fn mark_local_fin(&self, stream_id: u32) {
        let mut streams = self.streams.write().unwrap();
        if let Some(entry) = streams.get_mut(&stream_id) {
            entry.local_fin = true;
            if entry.remote_fin {
                streams.remove(&stream_id);
            }
        }
    }

    fn mark_remote_fin(&self, stream_id: u32) {
        let mut streams = self.streams.write().unwrap();
        if let Some(entry) = streams.get_mut(&stream_id) {
            entry.remote_fin = true;
            if entry.local_fin {
                streams.remove(&stream_id);
            }
        }
    }

    /// Ask a stream actor to abort with RST CANCEL. The actor removes its
    /// own table entry on the way out.
    pub(crate) async fn cancel_stream(&self, stream_id: u32) {
        if let Some(inbox) = self.inbox(stream_id) {
            let _ = inbox.send(StreamMsg::Cancel).await;
        }
    }

    pub(crate) fn alloc_local_id(&self) -> Result<u32, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        if self.goaway_sent.load(Ordering::Acquire) || self.goaway_received.load(Ordering::Acquire)
        {
            return Err(Error::GoingAway);
        }
        let mut ids = self.ids.lock().unwrap();
        if ids.next_local > MAX_STREAM_ID {
            return Err(Error::StreamsExhausted);
        }
        let id = ids.next_local;
        ids.next_local += 2;
        Ok(id)
    }

    /// Send window granted to a newly opened stream.
    pub(crate) fn new_stream_window(&self) -> i64 {
        if self.version.flow_controlled() {
            i64::from(self.initial_window.load(Ordering::Acquire))
        } else {
            i64::MAX / 2
        }
    }

    fn register_ping(&self) -> (u32, oneshot::Receiver<bool>) {
        let mut pings = self.pings.lock().unwrap();
        let id = pings.next_id;
        pings.next_id = match pings.next_id.checked_add(2) {
            Some(next) if next <= MAX_STREAM_ID => next,
            _ => self.role.first_ping_id(),
        };
        let (tx, rx) = oneshot::channel();
        pings.pending.insert(id, tx);
        (id, rx)
    }

    fn complete_ping(&self, id: u32) -> bool {
        match self.pings.lock().unwrap().pending.remove(&id) {
            Some(tx) => {
                let _ = tx.send(true);
                true
            }
            None => false,
        }
    }

    fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Tear down every table so further dispatch is impossible. Stream
    /// actors observe their inbox closed and exit; pending pings resolve to
    /// false.
    fn cleanup(&self) {
        self.closed.store(true, Ordering::Release);
        self.streams.write().unwrap().clear();
        self.pings.lock().unwrap().pending.clear();
        self.begin_shutdown();
        debug!(peer = ?self.peer, "session cleaned up");
    }
}

/// Clonable user-facing handle of a session.
#[derive(Clone)]
pub struct Control {
    pub(crate) shared: Arc<Shared>,
}

impl Control {
    /// Send a PING and obtain a token resolving to `true` on the peer's
    /// reply, or `false` if the connection dies first.
    pub fn ping(&self) -> Ping {
        let (id, rx) = self.shared.register_ping();
        debug!(id, "ping sent");
        if self
            .shared
            .enqueue(Frame::Ping(PingFrame {
                version: self.shared.version,
                id,
            }))
            .is_err()
        {
            self.shared.pings.lock().unwrap().pending.remove(&id);
        }
        Ping { rx }
    }

    /// Send GOAWAY and stop initiating or accepting new streams; in-flight
    /// streams drain.
    pub fn close(&self) {
        if !self.shared.goaway_sent.swap(true, Ordering::AcqRel) {
            let last_good = self.shared.ids.lock().unwrap().last_remote;
            debug!(last_good, "going away");
            let _ = self.shared.enqueue(Frame::Goaway(GoawayFrame {
                version: self.shared.version,
                last_good_stream_id: last_good,
                status: goaway_status::OK,
            }));
        }
    }

    /// Last value the peer sent for a SETTINGS id, with its entry flags.
    pub fn received_setting(&self, id: u32) -> Option<(u8, u32)> {
        self.shared.settings.lock().unwrap().get(&id).copied()
    }

    /// Streams currently in the table.
    pub fn active_streams(&self) -> usize {
        self.shared.streams.read().unwrap().len()
    }

    pub fn is_going_away(&self) -> bool {
        self.shared.goaway_sent.load(Ordering::Acquire)
            || self.shared.goaway_received.load(Ordering::Acquire)
    }
}

/// Completion token for [`Control::ping`]. Resolves exactly once.
pub struct Ping {
    rx: oneshot::Receiver<bool>,
}

impl Future for Ping {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(false))
    }
}

/// Streams initiated by the peer: requests on a server, pushed resources on
/// a client.
pub struct Incoming {
    rx: mpsc::Receiver<StreamHandle>,
}

impl Incoming {
    /// Next peer-initiated stream, or `None` once the connection is done.
    pub async fn accept(&mut self) -> Option<StreamHandle> {
        self.rx.recv().await
    }
}

/// The connection itself. Must be driven with [`Session::run`]; everything
/// else happens through [`Control`], [`Incoming`], and the stream handles.
pub struct Session<IO> {
    io: IO,
    shared: Arc<Shared>,
    config: Config,
    compressor: HeaderCompressor,
    decompressor: HeaderDecompressor,
    outbox_rx: mpsc::UnboundedReceiver<Frame>,
    incoming_tx: mpsc::Sender<StreamHandle>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<IO> Session<IO>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Drive the connection: start the serializer, advertise initial
    /// SETTINGS, run the ingress loop, then tear everything down. Returns
    /// `Ok(())` on a clean peer close, the fatal error otherwise.
    pub async fn run(self) -> Result<(), Error> {
        let Session {
            io,
            shared,
            config,
            compressor,
            decompressor,
            outbox_rx,
            incoming_tx,
            shutdown_rx,
        } = self;
        let (reader, writer) = tokio::io::split(io);
        let serializer = tokio::spawn(serialize_outbound(
            writer,
            FrameCodec::new(shared.version),
            compressor,
            outbox_rx,
            config.write_timeout,
            shared.clone(),
            shutdown_rx.clone(),
        ));

        let mut entries = Vec::new();
        if shared.version.flow_controlled() {
            entries.push(Setting {
                flags: 0,
                id: setting::INITIAL_WINDOW_SIZE,
                value: DEFAULT_INITIAL_WINDOW_SIZE,
            });
        }
        entries.push(Setting {
            flags: 0,
            id: setting::MAX_CONCURRENT_STREAMS,
            value: ADVERTISED_MAX_CONCURRENT_STREAMS,
        });
        entries.extend(config.initial_settings.iter().copied());
        shared.enqueue(Frame::Settings(SettingsFrame {
            version: shared.version,
            clear_persisted: false,
            entries,
        }))?;

        let mut ingress = Ingress {
            reader,
            codec: FrameCodec::new(shared.version),
            decompressor,
            shared: shared.clone(),
            incoming: incoming_tx,
            shutdown: shutdown_rx,
            read_timeout: config.read_timeout,
            max_benign_errors: config.max_benign_errors,
            benign_errors: 0,
        };
        let result = ingress.run().await;
        shared.cleanup();
        let _ = serializer.await;
        result
    }
}

/// Sole consumer of the outbox and sole writer of the transport: frames hit
/// the wire in enqueue order, and concurrent producers never race on the
/// write side.
async fn serialize_outbound<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut codec: FrameCodec,
    mut compressor: HeaderCompressor,
    mut outbox: mpsc::UnboundedReceiver<Frame>,
    write_timeout: Option<Duration>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            maybe = outbox.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        if let Err(err) = maybe_timeout(
            write_timeout,
            codec.write_frame(&mut writer, &frame, &mut compressor),
        )
        .await
        {
            warn!(error = %err, "outbound write failed");
            shared.begin_shutdown();
            return;
        }
    }
    // Flush whatever was enqueued before shutdown so a final RST_STREAM or
    // GOAWAY still reaches the peer.
    while let Ok(frame) = outbox.try_recv() {
        if maybe_timeout(
            write_timeout,
            codec.write_frame(&mut writer, &frame, &mut compressor),
        )
        .await
        .is_err()
        {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// How an inbound SYN_STREAM is handled, in spec order: GOAWAY silence,
/// parity, strict sequencing, identifier ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SynDisposition {
    /// Dropped without reply (we already said GOAWAY).
    Drop,
    /// RST PROTOCOL_ERROR, stream not created, connection lives on.
    Reject,
    /// Connection-fatal.
    Fatal,
    Accept,
}

fn syn_stream_disposition(
    role: Role,
    goaway_sent: bool,
    last_remote: u32,
    stream_id: u32,
) -> SynDisposition {
    if goaway_sent {
        return SynDisposition::Drop;
    }
    if stream_id % 2 != role.remote_parity() {
        return SynDisposition::Reject;
    }
    let expected = if last_remote == 0 {
        role.first_remote_stream_id()
    } else {
        last_remote + 2
    };
    if stream_id != expected {
        return SynDisposition::Reject;
    }
    if stream_id > MAX_STREAM_ID {
        return SynDisposition::Fatal;
    }
    SynDisposition::Accept
}

/// The ingress loop: sole reader of the transport and owner of the protocol
/// state machine.
struct Ingress<R> {
    reader: R,
    codec: FrameCodec,
    decompressor: HeaderDecompressor,
    shared: Arc<Shared>,
    incoming: mpsc::Sender<StreamHandle>,
    shutdown: watch::Receiver<bool>,
    read_timeout: Option<Duration>,
    max_benign_errors: u32,
    benign_errors: u32,
}

impl<R: AsyncRead + Unpin> Ingress<R> {
    async fn run(&mut self) -> Result<(), Error> {
        loop {
            if self.benign_errors > self.max_benign_errors {
                warn!(count = self.benign_errors, "benign error budget exhausted");
                return self.fatal(Error::Protocol(0)).await;
            }
            let read_timeout = self.read_timeout;
            let Self {
                reader,
                codec,
                decompressor,
                shutdown,
                ..
            } = self;
            let decoded = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                decoded = maybe_timeout(read_timeout, codec.read_frame(reader, decompressor)) => decoded,
            };
            match decoded {
                Ok(Some(decoded)) => {
                    if let Err(err) = self.dispatch(decoded).await {
                        return self.fatal(err).await;
                    }
                }
                Ok(None) => {
                    debug!(peer = ?self.shared.peer, "transport closed cleanly");
                    return Ok(());
                }
                Err(err) => return self.fatal(err).await,
            }
        }
    }

    /// Tier-3 exit: RST PROTOCOL_ERROR at the offending stream (0 when
    /// connection-scoped), a short grace so the serializer can drain it,
    /// then hand back for cleanup.
    async fn fatal(&mut self, err: Error) -> Result<(), Error> {
        let stream_id = match err {
            Error::Protocol(stream_id) => stream_id,
            _ => 0,
        };
        warn!(error = %err, stream_id, peer = ?self.shared.peer, "connection-fatal error");
        let _ = self.shared.enqueue(Frame::RstStream(RstStreamFrame::new(
            self.shared.version,
            stream_id,
            RstStatus::ProtocolError,
        )));
        tokio::time::sleep(PROTOCOL_ERROR_GRACE).await;
        Err(err)
    }

    async fn dispatch(&mut self, decoded: Decoded) -> Result<(), Error> {
        match decoded {
            Decoded::WrongVersion {
                version,
                kind,
                stream_id,
            } => {
                warn!(version, kind, stream_id, "frame version mismatch");
                self.shared.enqueue(Frame::RstStream(RstStreamFrame::new(
                    self.shared.version,
                    stream_id,
                    RstStatus::UnsupportedVersion,
                )))?;
                Ok(())
            }
            Decoded::UnknownKind { kind } => {
                debug!(kind, "unknown control frame");
                self.benign_errors += 1;
                Ok(())
            }
            Decoded::Frame(frame) => {
                trace!(kind = frame.kind(), stream_id = frame.stream_id(), "dispatch");
                match frame {
                    Frame::SynStream(f) => self.on_syn_stream(f).await,
                    Frame::SynReply(f) => self.on_syn_reply(f).await,
                    Frame::RstStream(f) => self.on_rst_stream(f).await,
                    Frame::Settings(f) => {
                        self.on_settings(f);
                        Ok(())
                    }
                    Frame::Ping(f) => self.on_ping(f),
                    Frame::Goaway(f) => self.on_goaway(f).await,
                    Frame::Headers(f) => {
                        let (stream_id, fin) = (f.stream_id, f.fin);
                        self.route_payload(
                            stream_id,
                            StreamMsg::Headers {
                                headers: f.headers,
                                fin,
                            },
                            fin,
                        )
                        .await
                    }
                    Frame::WindowUpdate(f) => self.on_window_update(f).await,
                    Frame::Credential(f) => {
                        // Credential handling is a no-op in this core.
                        trace!(slot = f.slot, "CREDENTIAL ignored");
                        Ok(())
                    }
                    Frame::Data(f) => self.on_data(f).await,
                }
            }
        }
    }

    async fn on_syn_stream(&mut self, frame: SynStreamFrame) -> Result<(), Error> {
        let stream_id = frame.stream_id;
        let last_remote = self.shared.ids.lock().unwrap().last_remote;
        let goaway_sent = self.shared.goaway_sent.load(Ordering::Acquire);
        match syn_stream_disposition(self.shared.role, goaway_sent, last_remote, stream_id) {
            SynDisposition::Drop => {
                debug!(stream_id, "SYN_STREAM dropped after GOAWAY");
                Ok(())
            }
            SynDisposition::Reject => {
                warn!(stream_id, last_remote, "SYN_STREAM violates id sequencing");
                self.shared.enqueue(Frame::RstStream(RstStreamFrame::new(
                    self.shared.version,
                    stream_id,
                    RstStatus::ProtocolError,
                )))?;
                Ok(())
            }
            SynDisposition::Fatal => Err(Error::Protocol(stream_id)),
            SynDisposition::Accept => {
                let window = self.shared.new_stream_window();
                let (inbox, handle) = spawn_stream(stream_id, self.shared.clone(), window);
                // A unidirectional stream carries nothing from our side.
                self.shared
                    .insert_stream(stream_id, inbox.clone(), frame.unidirectional, false);
                self.shared.ids.lock().unwrap().last_remote = stream_id;
                debug!(stream_id, fin = frame.fin, "stream accepted");
                let _ = inbox
                    .send(StreamMsg::Headers {
                        headers: frame.headers,
                        fin: frame.fin,
                    })
                    .await;
                if frame.fin {
                    self.shared.mark_remote_fin(stream_id);
                }
                if self.incoming.send(handle).await.is_err() {
                    debug!(stream_id, "nobody accepting; refusing stream");
                    self.shared.remove_stream(stream_id);
                    self.shared.enqueue(Frame::RstStream(RstStreamFrame::new(
                        self.shared.version,
                        stream_id,
                        RstStatus::RefusedStream,
                    )))?;
                }
                Ok(())
            }
        }
    }

    async fn on_syn_reply(&mut self, frame: SynReplyFrame) -> Result<(), Error> {
        let stream_id = frame.stream_id;
        if stream_id % 2 != self.shared.role.parity() {
            warn!(stream_id, "SYN_REPLY with remote-parity stream id");
            self.benign_errors += 1;
            self.shared.enqueue(Frame::RstStream(RstStreamFrame::new(
                self.shared.version,
                stream_id,
                RstStatus::ProtocolError,
            )))?;
            return Ok(());
        }
        let fin = frame.fin;
        self.route_payload(
            stream_id,
            StreamMsg::Reply {
                headers: frame.headers,
                fin,
            },
            fin,
        )
        .await
    }

    async fn on_rst_stream(&mut self, frame: RstStreamFrame) -> Result<(), Error> {
        let stream_id = frame.stream_id;
        match frame.status() {
            Some(RstStatus::ProtocolError) | Some(RstStatus::UnsupportedVersion) => {
                warn!(stream_id, status = frame.status_code, "fatal RST_STREAM");
                Err(Error::Protocol(stream_id))
            }
            Some(RstStatus::InvalidStream) => {
                self.benign_errors += 1;
                Ok(())
            }
            Some(RstStatus::RefusedStream) | Some(RstStatus::InternalError) => {
                self.close_stream(stream_id, frame.status_code).await;
                Ok(())
            }
            Some(RstStatus::Cancel) => {
                if stream_id % 2 == self.shared.role.remote_parity() {
                    self.close_stream(stream_id, frame.status_code).await;
                } else {
                    self.benign_errors += 1;
                }
                Ok(())
            }
            Some(RstStatus::FlowControlError)
            | Some(RstStatus::StreamInUse)
            | Some(RstStatus::StreamAlreadyClosed)
            | Some(RstStatus::InvalidCredentials) => {
                self.benign_errors += 1;
                self.close_stream(stream_id, frame.status_code).await;
                Ok(())
            }
            None => {
                warn!(stream_id, status = frame.status_code, "unknown RST_STREAM status");
                Err(Error::Protocol(stream_id))
            }
        }
    }

    fn on_settings(&mut self, frame: SettingsFrame) {
        let count = frame.entries.len();
        let mut settings = self.shared.settings.lock().unwrap();
        for entry in frame.entries {
            settings.insert(entry.id, (entry.flags, entry.value));
            if entry.id == setting::INITIAL_WINDOW_SIZE && self.shared.version.flow_controlled() {
                self.shared
                    .initial_window
                    .store(entry.value, Ordering::Release);
            }
        }
        debug!(count, "settings recorded");
    }

    fn on_ping(&mut self, frame: PingFrame) -> Result<(), Error> {
        if frame.id % 2 == self.shared.role.parity() {
            // Our parity: this is a reply to a ping we sent.
            if !self.shared.complete_ping(frame.id) {
                debug!(id = frame.id, "PING reply for unregistered id");
                self.benign_errors += 1;
            }
            Ok(())
        } else {
            trace!(id = frame.id, "PING echoed");
            self.shared.enqueue(Frame::Ping(frame))
        }
    }

    async fn on_goaway(&mut self, frame: GoawayFrame) -> Result<(), Error> {
        let last_good = frame.last_good_stream_id;
        debug!(last_good, status = frame.status, "GOAWAY received");
        self.shared.goaway_received.store(true, Ordering::Release);
        self.shared.ids.lock().unwrap().last_good_received = last_good;
        let local_parity = self.shared.role.parity();
        let doomed: Vec<u32> = self
            .shared
            .streams
            .read()
            .unwrap()
            .keys()
            .copied()
            .filter(|id| id % 2 == local_parity && *id > last_good)
            .collect();
        for stream_id in doomed {
            debug!(stream_id, "cancelling stream past GOAWAY horizon");
            self.shared.cancel_stream(stream_id).await;
        }
        Ok(())
    }

    async fn on_window_update(&mut self, frame: WindowUpdateFrame) -> Result<(), Error> {
        if frame.delta == 0 || frame.delta > MAX_DELTA_WINDOW_SIZE {
            warn!(stream_id = frame.stream_id, delta = frame.delta, "bad WINDOW_UPDATE delta");
            return Err(Error::Protocol(frame.stream_id));
        }
        // Window credit may legitimately arrive on remotely half-closed
        // streams (e.g. for pushed data), so this route skips the
        // payload-side half-close check.
        match self.shared.inbox(frame.stream_id) {
            Some(inbox) => {
                let _ = inbox
                    .send(StreamMsg::WindowUpdate { delta: frame.delta })
                    .await;
                Ok(())
            }
            None => {
                self.benign_errors += 1;
                self.shared.enqueue(Frame::RstStream(RstStreamFrame::new(
                    self.shared.version,
                    frame.stream_id,
                    RstStatus::InvalidStream,
                )))?;
                Ok(())
            }
        }
    }

    async fn on_data(&mut self, frame: DataFrame) -> Result<(), Error> {
        let (stream_id, fin) = (frame.stream_id, frame.fin);
        self.route_payload(
            stream_id,
            StreamMsg::Data {
                data: frame.data,
                fin,
            },
            fin,
        )
        .await
    }

    /// Deliver a payload frame to its stream, or answer INVALID_STREAM when
    /// the stream is absent or already half-closed on the remote side.
    async fn route_payload(
        &mut self,
        stream_id: u32,
        msg: StreamMsg,
        fin: bool,
    ) -> Result<(), Error> {
        match self.shared.payload_inbox(stream_id) {
            Some(inbox) => {
                let _ = inbox.send(msg).await;
                if fin {
                    self.shared.mark_remote_fin(stream_id);
                }
                Ok(())
            }
            None => {
                debug!(stream_id, "frame for unknown or half-closed stream");
                self.benign_errors += 1;
                self.shared.enqueue(Frame::RstStream(RstStreamFrame::new(
                    self.shared.version,
                    stream_id,
                    RstStatus::InvalidStream,
                )))?;
                Ok(())
            }
        }
    }

    async fn close_stream(&mut self, stream_id: u32, status: u32) {
        // Stream 0 does not exist as a data stream.
        if stream_id == 0 {
            warn!("RST_STREAM for stream 0 ignored");
            return;
        }
        if let Some(inbox) = self.shared.inbox(stream_id) {
            let _ = inbox.send(StreamMsg::Reset { status }).await;
        }
        self.shared.remove_stream(stream_id);
    }
}
