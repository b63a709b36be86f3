//! Client role: odd stream and ping identifiers, opens streams toward the
//! server.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::frame::{Frame, Headers, SynStreamFrame, Version};
use crate::session::{Builder, Control, Incoming, Role, Session};
use crate::stream::{spawn_stream, StreamHandle};
use crate::Error;

/// Set up a client-role session over an already-negotiated transport with
/// default configuration. Pushed streams from the server arrive on the
/// returned [`Incoming`]; [`Session::run`] must be driven persistently.
pub fn handshake<IO>(io: IO, version: Version) -> Result<(Control, Incoming, Session<IO>), Error>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    Builder::new(version).client(io)
}

impl Control {
    /// Open a new stream: allocates the next local stream id, sends
    /// SYN_STREAM, and returns the handle whose event channel will carry the
    /// peer's SYN_REPLY, HEADERS, and DATA.
    ///
    /// Fails synchronously once GOAWAY has been sent or received.
    pub fn open(&self, headers: Headers, fin: bool) -> Result<StreamHandle, Error> {
        if self.shared.role() != Role::Client {
            return Err(Error::WrongRole(Role::Client));
        }
        let stream_id = self.shared.alloc_local_id()?;
        let window = self.shared.new_stream_window();
        let (inbox, handle) = spawn_stream(stream_id, self.shared.clone(), window);
        self.shared.insert_stream(stream_id, inbox, fin, false);
        let syn = Frame::SynStream(SynStreamFrame {
            version: self.shared.version(),
            stream_id,
            associated_stream_id: 0,
            priority: 0,
            slot: 0,
            headers,
            fin,
            unidirectional: false,
        });
        if let Err(err) = self.shared.enqueue(syn) {
            self.shared.remove_stream(stream_id);
            return Err(err);
        }
        Ok(handle)
    }
}
