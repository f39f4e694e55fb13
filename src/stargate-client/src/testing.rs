//! Local stand-ins for the gateway's gRPC and auth ports.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::auth::TOKEN_HEADER;
use crate::proto::stargate_server::{Stargate, StargateServer};
use crate::proto::{self, ColumnSpec, ResultSet, Row, Value, value};

/// Serves one canned HTTP response and returns the raw request it got.
pub async fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request);
            if let Some(head_end) = text.find("\r\n\r\n") {
                let length = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if request.len() >= head_end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
        String::from_utf8_lossy(&request).into_owned()
    });
    (address, handle)
}

/// Accepts connections and reads from them without ever answering.
pub async fn silent_peer() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        return;
                    }
                }
            });
        }
    });
    (address, handle)
}

/// Gateway double: refuses calls without a token and answers the rest
/// with a single `system.local` row.
#[derive(Debug, Clone, Default)]
pub struct FakeGateway {
    tokens: Arc<Mutex<Vec<Option<String>>>>,
}

impl FakeGateway {
    /// Token header seen on each call, in arrival order.
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }

    /// Serves the gateway on a free local port.
    pub async fn spawn(self) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let server = Server::builder().add_service(StargateServer::new(self)).serve(address);
        let handle = tokio::spawn(async move {
            server.await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        (address, handle)
    }
}

#[tonic::async_trait]
impl Stargate for FakeGateway {
    async fn execute_query(&self, request: Request<proto::Query>) -> Result<Response<proto::Response>, Status> {
        let token = request
            .metadata()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.tokens.lock().unwrap().push(token.clone());

        if token.is_none() {
            return Err(Status::unauthenticated("No token provided"));
        }
        let result_set = ResultSet {
            columns: vec![ColumnSpec { name: "key".to_string() }],
            rows: vec![Row {
                values: vec![Value {
                    inner: Some(value::Inner::String("local".to_string())),
                }],
            }],
        };
        Ok(Response::new(proto::Response {
            result: Some(proto::response::Result::ResultSet(result_set)),
            warnings: vec![],
        }))
    }
}
