//! Server role: even stream and ping identifiers, accepts client streams and
//! pushes resources.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::frame::{Frame, Headers, SynStreamFrame, Version};
use crate::session::{Builder, Control, Incoming, Role, Session};
use crate::stream::{spawn_stream, PushWriter};
use crate::Error;

/// Set up a server-role session over an already-negotiated transport with
/// default configuration. Client requests arrive on the returned
/// [`Incoming`]; [`Session::run`] must be driven persistently.
pub fn handshake<IO>(io: IO, version: Version) -> Result<(Control, Incoming, Session<IO>), Error>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    Builder::new(version).server(io)
}

impl Control {
    /// Push a resource to the client: allocates an even stream id and sends
    /// SYN_STREAM with the UNIDIRECTIONAL flag and the parent stream id.
    ///
    /// Fails synchronously once GOAWAY has been sent or received.
    pub fn push(&self, headers: Headers, parent: u32) -> Result<PushWriter, Error> {
        if self.shared.role() != Role::Server {
            return Err(Error::WrongRole(Role::Server));
        }
        let stream_id = self.shared.alloc_local_id()?;
        let window = self.shared.new_stream_window();
        let (inbox, handle) = spawn_stream(stream_id, self.shared.clone(), window);
        // The peer never sends payload on a pushed stream.
        self.shared.insert_stream(stream_id, inbox, false, true);
        let syn = Frame::SynStream(SynStreamFrame {
            version: self.shared.version(),
            stream_id,
            associated_stream_id: parent,
            priority: 0,
            slot: 0,
            headers,
            fin: false,
            unidirectional: true,
        });
        if let Err(err) = self.shared.enqueue(syn) {
            self.shared.remove_stream(stream_id);
            return Err(err);
        }
        Ok(PushWriter::new(handle))
    }
}
