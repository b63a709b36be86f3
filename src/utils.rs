use std::future::Future;
use std::io;
use std::time::Duration;

use crate::Error;

/// Run `fut` under an optional deadline; elapsing maps to a timed-out i/o
/// error, which the caller treats like any other transport fault.
pub(crate) async fn maybe_timeout<F, T>(deadline: Option<Duration>, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed")))?,
        None => fut.await,
    }
}
