use hyper::body::{Body, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Whether the accept loops take new connections. Existing connections are served
/// in every state; `Stopped` additionally drains them and ends the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptState {
    Accepting,
    Paused,
    Stopped,
}

/// Accepts connections on `listener` while `control` says so, serving each one
/// with the service built by `make_service`. Returns once stopped and drained, or
/// once `drain_deadline` has passed after stopping.
pub async fn serve<F, S, B>(
    name: &'static str,
    listener: Arc<TcpListener>,
    mut control: watch::Receiver<AcceptState>,
    drain_deadline: Duration,
    make_service: F,
) where
    F: Fn(SocketAddr) -> S,
    S: Service<Request<Incoming>, Response = Response<B>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let builder = Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();

    loop {
        let state = *control.borrow_and_update();
        match state {
            AcceptState::Stopped => break,
            AcceptState::Paused => {
                tracing::info!(listener = name, "Accepting paused");
                if control.changed().await.is_err() {
                    break;
                }
                continue;
            }
            AcceptState::Accepting => {}
        }

        tokio::select! {
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(listener = name, error = %err, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);

                let connection = builder
                    .serve_connection(TokioIo::new(stream), make_service(peer_addr))
                    .into_owned();
                let connection = graceful.watch(connection);
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        tracing::debug!(error = %err, "Connection closed with error");
                    }
                });
            }
        }
    }

    tracing::info!(listener = name, "Stopped accepting, draining connections");
    tokio::select! {
        _ = graceful.shutdown() => {
            tracing::info!(listener = name, "All connections drained");
        }
        _ = tokio::time::sleep(drain_deadline) => {
            tracing::warn!(listener = name, "Drain deadline passed, closing remaining connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use std::convert::Infallible;
    use std::future::Ready;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Clone)]
    struct Hello;

    impl Service<Request<Incoming>> for Hello {
        type Response = Response<Full<Bytes>>;
        type Error = Infallible;
        type Future = Ready<Result<Self::Response, Self::Error>>;

        fn call(&self, _req: Request<Incoming>) -> Self::Future {
            std::future::ready(Ok(Response::new(Full::new(Bytes::from_static(b"hello")))))
        }
    }

    async fn get(addr: SocketAddr) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: x\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_pause_resume_stop() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let (control, rx) = watch::channel(AcceptState::Accepting);

        let server = tokio::spawn(serve(
            "test",
            listener,
            rx,
            Duration::from_secs(1),
            |_| Hello,
        ));
        assert!(get(addr).await.ends_with("hello"));

        // While paused, connections wait in the backlog and are served on resume.
        control.send_replace(AcceptState::Paused);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = tokio::spawn(get(addr));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        control.send_replace(AcceptState::Accepting);
        assert!(pending.await.unwrap().ends_with("hello"));

        control.send_replace(AcceptState::Stopped);
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
    }
}
