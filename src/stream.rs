//! Per-stream actor and the user-facing stream handles.
//!
//! Each accepted or opened stream runs a small actor task: the connection's
//! ingress loop is the sole producer of its inbox, the actor the sole
//! consumer. The actor forwards payload to the user-facing event channel and
//! keeps the send window fed; no locks are needed inside a stream.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::frame::{DataFrame, Frame, Headers, HeadersFrame, RstStatus, RstStreamFrame, SynReplyFrame};
use crate::session::Shared;
use crate::Error;

pub(crate) const INBOX_CAPACITY: usize = 32;

/// Messages routed from the connection to a stream actor.
#[derive(Debug)]
pub(crate) enum StreamMsg {
    Reply { headers: Headers, fin: bool },
    Headers { headers: Headers, fin: bool },
    Data { data: Bytes, fin: bool },
    WindowUpdate { delta: u32 },
    /// Peer reset the stream; the table entry is already gone.
    Reset { status: u32 },
    /// Local request to abort: emit RST CANCEL and stop.
    Cancel,
}

/// Payload surfaced to the stream's user. `fin` marks the peer's half-close;
/// after it the event channel yields `None`.
#[derive(Debug)]
pub enum StreamEvent {
    /// SYN_REPLY or HEADERS name/value pairs.
    Headers { headers: Headers, fin: bool },
    Data { data: Bytes, fin: bool },
}

/// SPDY/3 per-stream send window. The actor grants credit from
/// WINDOW_UPDATE frames; the user's send path consumes it. On SPDY/2 the
/// window starts effectively infinite.
pub(crate) struct FlowWindow {
    credit: AtomicI64,
    closed: AtomicBool,
    notify: Notify,
}

impl FlowWindow {
    pub(crate) fn new(initial: i64) -> Arc<Self> {
        Arc::new(Self {
            credit: AtomicI64::new(initial),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub(crate) fn grant(&self, delta: u32) {
        self.credit.fetch_add(i64::from(delta), Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Take up to `want` bytes of credit, waiting for a grant when the
    /// window is empty. `None` means the stream is gone.
    pub(crate) async fn consume(&self, want: usize) -> Option<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let have = self.credit.load(Ordering::Acquire);
            if have > 0 {
                let take = have.min(want as i64);
                if self
                    .credit
                    .compare_exchange(have, have - take, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(take as usize);
                }
                continue;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.credit.load(Ordering::Acquire) > 0 || self.closed.load(Ordering::Acquire) {
                continue;
            }
            notified.await;
        }
    }
}

pub(crate) struct StreamActor {
    id: u32,
    inbox: mpsc::Receiver<StreamMsg>,
    events: mpsc::Sender<StreamEvent>,
    window: Arc<FlowWindow>,
    shared: Arc<Shared>,
}

impl StreamActor {
    pub(crate) async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                StreamMsg::Reply { headers, fin } | StreamMsg::Headers { headers, fin } => {
                    if self
                        .events
                        .send(StreamEvent::Headers { headers, fin })
                        .await
                        .is_err()
                    {
                        self.cancel("stream handle dropped");
                        break;
                    }
                }
                StreamMsg::Data { data, fin } => {
                    if self
                        .events
                        .send(StreamEvent::Data { data, fin })
                        .await
                        .is_err()
                    {
                        self.cancel("stream handle dropped");
                        break;
                    }
                }
                StreamMsg::WindowUpdate { delta } => {
                    trace!(stream_id = self.id, delta, "window credit");
                    self.window.grant(delta);
                }
                StreamMsg::Reset { status } => {
                    debug!(stream_id = self.id, status, "stream reset by peer");
                    break;
                }
                StreamMsg::Cancel => {
                    self.cancel("stream cancelled");
                    break;
                }
            }
        }
        self.window.close();
        // Dropping `events` closes the user's channel: end of stream if a
        // FIN was forwarded, an abrupt cut otherwise.
    }

    /// Abort with RST CANCEL and drop the table entry.
    fn cancel(&self, why: &'static str) {
        debug!(stream_id = self.id, why, "cancelling stream");
        let _ = self.shared.enqueue(Frame::RstStream(RstStreamFrame::new(
            self.shared.version(),
            self.id,
            RstStatus::Cancel,
        )));
        self.shared.remove_stream(self.id);
    }
}

/// Create the inbox/actor/handle triple for one stream and start its actor.
pub(crate) fn spawn_stream(
    id: u32,
    shared: Arc<Shared>,
    initial_window: i64,
) -> (mpsc::Sender<StreamMsg>, StreamHandle) {
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel(INBOX_CAPACITY);
    let window = FlowWindow::new(initial_window);
    let actor = StreamActor {
        id,
        inbox: inbox_rx,
        events: events_tx,
        window: window.clone(),
        shared: shared.clone(),
    };
    tokio::spawn(actor.run());
    let handle = StreamHandle {
        id,
        shared,
        events: events_rx,
        window,
        local_fin: false,
    };
    (inbox_tx, handle)
}

/// User-facing side of one multiplexed stream.
pub struct StreamHandle {
    id: u32,
    shared: Arc<Shared>,
    events: mpsc::Receiver<StreamEvent>,
    window: Arc<FlowWindow>,
    local_fin: bool,
}

impl StreamHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Receive the next headers or data event. `None` once the peer
    /// half-closed (after a `fin` event) or the connection died (without
    /// one).
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Answer an accepted stream with SYN_REPLY (server role).
    pub fn reply(&mut self, headers: Headers, fin: bool) -> Result<(), Error> {
        if self.local_fin {
            return Err(Error::StreamClosed(self.id));
        }
        self.shared.enqueue(Frame::SynReply(SynReplyFrame {
            version: self.shared.version(),
            stream_id: self.id,
            headers,
            fin,
        }))?;
        if fin {
            self.finish_local();
        }
        Ok(())
    }

    /// Send additional name/value pairs.
    pub fn send_headers(&mut self, headers: Headers, fin: bool) -> Result<(), Error> {
        if self.local_fin {
            return Err(Error::StreamClosed(self.id));
        }
        self.shared.enqueue(Frame::Headers(HeadersFrame {
            version: self.shared.version(),
            stream_id: self.id,
            headers,
            fin,
        }))?;
        if fin {
            self.finish_local();
        }
        Ok(())
    }

    /// Send payload bytes, splitting into window-sized DATA frames when flow
    /// control applies.
    pub async fn send_data(&mut self, mut data: Bytes, fin: bool) -> Result<(), Error> {
        if self.local_fin {
            return Err(Error::StreamClosed(self.id));
        }
        if data.is_empty() {
            if fin {
                self.shared
                    .enqueue(Frame::Data(DataFrame::new(self.id, Bytes::new(), true)))?;
                self.finish_local();
            }
            return Ok(());
        }
        while !data.is_empty() {
            let granted = self
                .window
                .consume(data.len())
                .await
                .ok_or(Error::StreamClosed(self.id))?;
            let chunk = data.split_to(granted);
            let last = fin && data.is_empty();
            self.shared
                .enqueue(Frame::Data(DataFrame::new(self.id, chunk, last)))?;
        }
        if fin {
            self.finish_local();
        }
        Ok(())
    }

    /// Abort the stream with RST_STREAM CANCEL.
    pub async fn cancel(self) {
        self.shared.cancel_stream(self.id).await;
    }

    fn finish_local(&mut self) {
        self.local_fin = true;
        self.shared.mark_local_fin(self.id);
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").field("id", &self.id).finish()
    }
}

/// Write side of a pushed (unidirectional) stream, returned by
/// [`crate::Control::push`].
#[derive(Debug)]
pub struct PushWriter {
    inner: StreamHandle,
}

impl PushWriter {
    pub(crate) fn new(inner: StreamHandle) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    pub fn send_headers(&mut self, headers: Headers, fin: bool) -> Result<(), Error> {
        self.inner.send_headers(headers, fin)
    }

    pub async fn send_data(&mut self, data: Bytes, fin: bool) -> Result<(), Error> {
        self.inner.send_data(data, fin).await
    }

    pub async fn cancel(self) {
        self.inner.cancel().await;
    }
}
