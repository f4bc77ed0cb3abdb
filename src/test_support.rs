//! In-process plaintext server used by unit tests

use crate::endpoint::Endpoint;
use crate::protocol::{
    decode_frontend_message, decode_negotiation, encode_backend_message,
    encode_negotiation_response, BackendMessage, FrontendMessage, NegotiationResponse,
    ServerStatus,
};
use bytes::{Buf, BytesMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

/// Answers the plaintext preamble, hello and status with a configurable status
pub(crate) struct MockServer {
    endpoint: Endpoint,
    status: Arc<Mutex<ServerStatus>>,
    tasks: Arc<Mutex<Vec<AbortHandle>>>,
}

impl MockServer {
    pub(crate) async fn start(status: ServerStatus) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let server = Self {
            endpoint,
            status: Arc::new(Mutex::new(status)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };
        server.accept(listener);
        server
    }

    pub(crate) async fn primary() -> Self {
        Self::start(ServerStatus {
            is_primary: true,
            ..Default::default()
        })
        .await
    }

    fn accept(&self, listener: TcpListener) {
        let status = self.status.clone();
        let tasks = self.tasks.clone();
        let acceptor = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let handle = tokio::spawn(serve(socket, status.clone()));
                tasks.lock().unwrap().push(handle.abort_handle());
            }
        });
        self.tasks.lock().unwrap().push(acceptor.abort_handle());
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    pub(crate) fn set_status(&self, status: ServerStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Stop accepting and drop every open connection
    pub(crate) fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Listen again on the same port after [`MockServer::stop`]
    pub(crate) async fn restart(&self) {
        // The aborted acceptor releases its socket once the runtime drops it
        for _ in 0..100 {
            if let Ok(listener) = TcpListener::bind(("127.0.0.1", self.endpoint.port())).await {
                self.accept(listener);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("could not rebind {}", self.endpoint);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(mut socket: TcpStream, status: Arc<Mutex<ServerStatus>>) {
    let mut preamble = [0u8; 8];
    if socket.read_exact(&mut preamble).await.is_err() || decode_negotiation(&preamble).is_err() {
        return;
    }
    let answer = encode_negotiation_response(NegotiationResponse::AcceptPlaintext);
    if socket.write_all(&[answer]).await.is_err() {
        return;
    }

    let mut buf = BytesMut::new();
    loop {
        match decode_frontend_message(&mut buf) {
            Ok((msg, consumed)) => {
                buf.advance(consumed);
                match msg {
                    FrontendMessage::Terminate => return,
                    FrontendMessage::Hello(_) | FrontendMessage::Status => {
                        let current = status.lock().unwrap().clone();
                        let reply = encode_backend_message(&BackendMessage::Status(current)).unwrap();
                        if socket.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(_) => {
                if socket.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
            }
        }
    }
}
