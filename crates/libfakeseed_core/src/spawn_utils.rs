use tracing::{Instrument, debug, error, trace};

/// Spawns a future with tracing instrumentation. Errors are logged, never propagated:
/// background tasks have nobody to return them to.
pub fn spawn(
    span: tracing::Span,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    let fut = async move {
        trace!("started");
        match fut.await {
            Ok(()) => debug!("finished"),
            Err(e) => error!("finished with error: {:#}", e),
        }
    }
    .instrument(span);
    tokio::task::spawn(fut)
}
