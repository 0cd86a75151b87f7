use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Splice an upgraded client connection to an upgraded upstream connection.
///
/// Both sides are raw byte streams once the `101` has been relayed, so the
/// tunnel is protocol-agnostic. Closing either side ends the tunnel; so does
/// `shutdown`.
pub fn spawn(
    tracker: &TaskTracker,
    shutdown: CancellationToken,
    client: OnUpgrade,
    upstream: OnUpgrade,
    label: String,
) {
    tracker.spawn(async move {
        let (client, upstream) = match tokio::try_join!(client, upstream) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!("Upgrade for {} failed: {}", label, e);
                return;
            }
        };

        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);

        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => match result {
                Ok((to_upstream, to_client)) => tracing::debug!(
                    "Tunnel {} closed ({} bytes up, {} bytes down)",
                    label, to_upstream, to_client
                ),
                Err(e) => tracing::debug!("Tunnel {} closed with error: {}", label, e),
            },
            _ = shutdown.cancelled() => {
                tracing::debug!("Tunnel {} closed by proxy shutdown", label);
            }
        }
    });
}
