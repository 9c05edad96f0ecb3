//! Serving with a bounded drain

use axum::Router;
use std::future::{Future, IntoFuture};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Serve `app` until `shutdown` resolves, then give in-flight requests up to
/// `drain_timeout` to finish. Returns as soon as the last connection closes.
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    shutdown: F,
    drain_timeout: Duration,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (draining_tx, draining_rx) = oneshot::channel::<()>();

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = draining_tx.send(());
        })
        .into_future();

    let deadline = async move {
        if draining_rx.await.is_err() {
            std::future::pending::<()>().await;
        }
        info!(
            "Waiting up to {} seconds for connections to close",
            drain_timeout.as_secs()
        );
        tokio::time::sleep(drain_timeout).await;
    };

    tokio::select! {
        result = server => result,
        _ = deadline => {
            warn!(
                timeout_secs = drain_timeout.as_secs(),
                "Connections still open after drain timeout, shutting down"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::sync::Notify;

    async fn local_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_idle_server_stops_without_waiting_for_timeout() {
        let listener = local_listener().await;
        let app = Router::new().route("/health", get(|| async { "ok" }));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(serve(
            listener,
            app,
            async move {
                let _ = stop_rx.await;
            },
            Duration::from_secs(30),
        ));

        stop_tx.send(()).unwrap();
        let joined = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server kept running after shutdown");
        joined.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stuck_request_is_cut_off_after_timeout() {
        let listener = local_listener().await;
        let addr = listener.local_addr().unwrap();

        let started = Arc::new(Notify::new());
        let handler_started = started.clone();
        let app = Router::new().route(
            "/stuck",
            get(move || {
                let started = handler_started.clone();
                async move {
                    started.notify_one();
                    std::future::pending::<()>().await;
                    "unreachable"
                }
            }),
        );

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(serve(
            listener,
            app,
            async move {
                let _ = stop_rx.await;
            },
            Duration::from_millis(100),
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /stuck HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        started.notified().await;

        stop_tx.send(()).unwrap();
        let joined = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("drain timeout was not enforced");
        joined.unwrap().unwrap();
    }
}
