use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use smol::{io::AsyncWriteExt, net::TcpStream};

use crate::packet::read::{read_packet, read_timeout};
use crate::packet::{HttpError, Packet, ReadError, RequestPacket, ResponsePacket};
use crate::pool::{ConnPool, ConnectError, Lease};
use crate::telemetry::TelemetryStore;
use crate::transform::PacketTransformer;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
const KEEPALIVE_POLL: Duration = Duration::from_secs(1);
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

pub type Transformers = Arc<Vec<Box<dyn PacketTransformer>>>;

enum Flow {
    Continue,
    Done,
}

/// One worker per accepted client. Runs the keep-alive loop: parse a
/// request, rewrite, fetch upstream through the pool (with one
/// reset-and-retry on a stale socket), rewrite the response, reply, charge
/// telemetry. Protocol failures become an error page with
/// `Connection: close` and end the loop.
pub struct ProxyWorker {
    peer: SocketAddr,
    client: TcpStream,
    pool: Arc<ConnPool>,
    telemetry: Arc<TelemetryStore>,
    transformers: Transformers,
    /// Bytes read past the previous message, owed to the next one.
    carry: Vec<u8>,
    /// Telemetry origins this worker has started.
    origins: Vec<String>,
    /// Pool entry held between upstream fetch and release/close.
    lease: Option<Lease>,
}

impl ProxyWorker {
    pub fn new(
        client: TcpStream,
        peer: SocketAddr,
        pool: Arc<ConnPool>,
        telemetry: Arc<TelemetryStore>,
        transformers: Transformers,
    ) -> Self {
        Self {
            peer,
            client,
            pool,
            telemetry,
            transformers,
            carry: Vec::new(),
            origins: Vec::new(),
            lease: None,
        }
    }

    pub async fn run(mut self) {
        log::info!("peer={} new connection", self.peer);
        let mut first = true;
        loop {
            match self.cycle(first).await {
                Ok(Flow::Continue) => first = false,
                Ok(Flow::Done) => break,
                Err(err) => {
                    self.reply_error(err).await;
                    break;
                }
            }
        }
        self.finish().await;
    }

    async fn cycle(&mut self, first: bool) -> Result<Flow, HttpError> {
        // Between keep-alive requests, give the client one second to show a
        // byte before closing quietly.
        if !first && self.carry.is_empty() {
            let mut probe = [0u8; 1];
            match read_timeout(&mut self.client, &mut probe, KEEPALIVE_POLL).await {
                Ok(0) | Err(_) => return Ok(Flow::Done),
                Ok(n) => self.carry.extend_from_slice(&probe[..n]),
            }
        }

        let mut request: RequestPacket =
            match read_packet(&mut self.client, &mut self.carry, CLIENT_TIMEOUT).await {
                Ok(request) => request,
                Err(ReadError::Http(err)) => return Err(err),
                Err(err) if err.is_timeout() => return Err(HttpError::RequestTimeout),
                Err(ReadError::Io(err)) => {
                    // client went away mid-request; nobody left to answer
                    log::debug!("peer={} client read failed: {err}", self.peer);
                    return Ok(Flow::Done);
                }
            };

        log::info!("peer={} --> {}", self.peer, request.protocol_line());

        for transformer in self.transformers.iter() {
            transformer.incoming(&mut request);
        }

        let (host, port) = request.host_port()?;

        let origin = match request.headers.get(b"Referer") {
            Some(referer) => String::from_utf8_lossy(referer).into_owned(),
            None => request.url.clone(),
        };
        if !self.origins.contains(&origin) {
            self.telemetry.start(&origin);
            self.origins.push(origin.clone());
        }

        let mut response = if request.should_forward {
            self.forward(&request, &host, port).await?
        } else {
            // placeholder for the outgoing transformers to rewrite
            ResponsePacket::from_error(HttpError::Teapot)
        };

        for transformer in self.transformers.iter() {
            transformer.outgoing(&mut response);
        }

        if let Err(err) = self.reply(&response).await {
            log::debug!("peer={} client write failed: {err}", self.peer);
            return Ok(Flow::Done);
        }

        let bytes = response.body.len() as u64;
        self.telemetry.update(&origin, bytes);

        let closing = request.connection_close() || response.connection_close();
        if let Some(lease) = self.lease.take() {
            if closing {
                let _ = self.pool.close(lease, bytes).await;
            } else {
                self.pool.release(lease, bytes);
            }
        }

        if closing { Ok(Flow::Done) } else { Ok(Flow::Continue) }
    }

    /// Upstream leg: acquire the pooled socket, send, read the reply. On
    /// success the lease is parked in `self.lease` for the keep-alive
    /// decision; every failure path retires the entry so a broken socket is
    /// never handed to another worker.
    async fn forward(
        &mut self,
        request: &RequestPacket,
        host: &str,
        port: u16,
    ) -> Result<ResponsePacket, HttpError> {
        let mut lease = match self.pool.acquire(host, port).await {
            Ok(lease) => lease,
            Err(ConnectError::Resolve(err)) => {
                log::debug!("peer={} cannot resolve {host}: {err}", self.peer);
                return Err(HttpError::NotFound);
            }
            Err(err) => {
                log::debug!("peer={} connect {host}:{port} failed: {err}", self.peer);
                return Err(HttpError::InternalServerError);
            }
        };

        let payload = request.encode();
        if let Err(err) = send(lease.socket(), &payload).await {
            log::debug!("peer={} send on pooled socket failed, resetting: {err}", self.peer);
            let retry = match self.pool.reset(&mut lease, host, port).await {
                Ok(()) => send(lease.socket(), &payload).await,
                Err(err) => Err(io::Error::other(err)),
            };
            if let Err(err) = retry {
                log::debug!("peer={} resend failed: {err}", self.peer);
                let _ = self.pool.close(lease, 0).await;
                return Err(HttpError::BadGateway);
            }
        }

        let mut carry = Vec::new();
        match read_packet(lease.socket(), &mut carry, UPSTREAM_TIMEOUT).await {
            Ok(response) => {
                self.lease = Some(lease);
                Ok(response)
            }
            Err(err) => {
                let _ = self.pool.close(lease, 0).await;
                match err {
                    ReadError::Http(_) => Err(HttpError::BadGateway),
                    ReadError::Io(err) if err.kind() == io::ErrorKind::TimedOut => {
                        Err(HttpError::GatewayTimeout)
                    }
                    ReadError::Io(err) => {
                        log::debug!("peer={} upstream read failed: {err}", self.peer);
                        Err(HttpError::InternalServerError)
                    }
                }
            }
        }
    }

    async fn reply(&mut self, response: &ResponsePacket) -> io::Result<()> {
        self.client.write_all(&response.encode()).await?;
        self.client.flush().await?;
        log::info!("peer={} <-- {}", self.peer, response.protocol_line());
        Ok(())
    }

    async fn reply_error(&mut self, err: HttpError) {
        log::info!("peer={} error: {err}", self.peer);
        let page = ResponsePacket::from_error(err);
        let _ = self.reply(&page).await;
    }

    async fn finish(&mut self) {
        for origin in std::mem::take(&mut self.origins) {
            let _ = self.telemetry.close(&origin);
        }
        if let Some(lease) = self.lease.take() {
            let _ = self.pool.close(lease, 0).await;
        }
        let _ = self.client.shutdown(Shutdown::Both);
        log::info!("peer={} connection closed", self.peer);
    }
}

async fn send<S>(socket: &mut S, payload: &[u8]) -> io::Result<()>
where
    S: smol::io::AsyncWrite + Unpin,
{
    socket.write_all(payload).await?;
    socket.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::BlockServeTransformer;
    use smol::io::AsyncReadExt;
    use smol::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        client: TcpStream,
        carry: Vec<u8>,
        pool: Arc<ConnPool>,
        telemetry: Arc<TelemetryStore>,
        task: smol::Task<()>,
    }

    impl Harness {
        async fn spawn(transformers: Vec<Box<dyn PacketTransformer>>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let client = TcpStream::connect(addr).await.unwrap();
            let (stream, peer) = listener.accept().await.unwrap();

            let pool = Arc::new(ConnPool::new());
            let telemetry = Arc::new(TelemetryStore::new());
            let worker = ProxyWorker::new(
                stream,
                peer,
                pool.clone(),
                telemetry.clone(),
                Arc::new(transformers),
            );
            let task = smol::spawn(worker.run());
            Self {
                client,
                carry: Vec::new(),
                pool,
                telemetry,
                task,
            }
        }

        async fn send(&mut self, wire: &[u8]) {
            self.client.write_all(wire).await.unwrap();
            self.client.flush().await.unwrap();
        }

        async fn response(&mut self) -> ResponsePacket {
            read_packet(&mut self.client, &mut self.carry, TIMEOUT)
                .await
                .expect("worker should answer")
        }
    }

    /// Stub origin server: answers `responses` in order on one accepted
    /// connection, reading a request head before each.
    async fn spawn_upstream(responses: Vec<Vec<u8>>) -> (u16, smol::Task<Vec<Vec<u8>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = smol::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            for response in responses {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = conn.read(&mut buf).await.unwrap();
                    assert!(n > 0, "client hung up before request completed");
                    request.extend_from_slice(&buf[..n]);
                    if crate::packet::find_subslice(&request, b"\r\n\r\n").is_some() {
                        break;
                    }
                }
                seen.push(request);
                conn.write_all(&response).await.unwrap();
                conn.flush().await.unwrap();
            }
            seen
        });
        (port, task)
    }

    #[test]
    fn test_happy_path_keep_alive_reuses_entry() {
        smol::block_on(async {
            let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec();
            let (port, upstream) = spawn_upstream(vec![reply.clone(), reply.clone()]).await;
            let mut harness = Harness::spawn(Vec::new()).await;

            let head = format!(
                "GET http://127.0.0.1:{port}/x HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n"
            );
            harness.send(head.as_bytes()).await;
            let res = harness.response().await;
            assert_eq!(res.code, 200);
            assert_eq!(res.body, b"hello");
            // header order and values survive re-encoding verbatim
            assert_eq!(res.encode(), reply);
            assert_eq!(harness.pool.len().await, 1);

            harness.send(head.as_bytes()).await;
            let res = harness.response().await;
            assert_eq!(res.body, b"hello");
            assert_eq!(harness.pool.len().await, 1, "second request reuses the entry");

            // both requests went over one upstream connection
            drop(harness.client);
            harness.task.await;
            assert!(harness.telemetry.is_empty());

            let emitted = harness.pool.drain().await;
            assert_eq!(
                emitted,
                vec![(format!("127.0.0.1:{port}"), 10)],
                "five body bytes per request charged to the entry"
            );
            upstream.await;
        });
    }

    #[test]
    fn test_chunked_upstream_reframed_for_client() {
        smol::block_on(async {
            let reply =
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
                    .to_vec();
            let (port, upstream) = spawn_upstream(vec![reply]).await;
            let mut harness = Harness::spawn(Vec::new()).await;

            let head = format!(
                "GET http://127.0.0.1:{port}/x HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n"
            );
            harness.send(head.as_bytes()).await;
            let res = harness.response().await;

            assert_eq!(res.code, 200);
            assert_eq!(res.body, b"hello");
            assert_eq!(res.headers.get(b"Content-Length"), Some(&b"5"[..]));
            assert!(!res.headers.contains(b"Transfer-Encoding"));

            harness.task.await;
            upstream.await;
            // Connection: close retires the entry instead of releasing it
            assert_eq!(harness.pool.len().await, 0);
        });
    }

    #[test]
    fn test_send_failure_resets_socket_and_retries() {
        smol::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let mut harness = Harness::spawn(Vec::new()).await;

            // pre-seed the pool with an entry whose socket is already dead:
            // shutting down our side makes the worker's first send fail
            let mut lease = harness.pool.acquire("127.0.0.1", port).await.unwrap();
            let (_stale, _) = listener.accept().await.unwrap();
            lease.socket().shutdown();
            harness.pool.release(lease, 0);

            // the fresh connection opened by the reset serves the real reply
            let stub = smol::spawn(async move {
                let (mut conn, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = conn.read(&mut buf).await.unwrap();
                    assert!(n > 0, "worker hung up instead of resending");
                    request.extend_from_slice(&buf[..n]);
                    if crate::packet::find_subslice(&request, b"\r\n\r\n").is_some() {
                        break;
                    }
                }
                conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                    .await
                    .unwrap();
                conn.flush().await.unwrap();
            });

            let head = format!(
                "GET http://127.0.0.1:{port}/x HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n"
            );
            harness.send(head.as_bytes()).await;
            let res = harness.response().await;

            assert_eq!(res.code, 200);
            assert_eq!(res.body, b"hello", "client gets the real response after the retry");

            stub.await;
            harness.task.await;
            assert_eq!(harness.pool.len().await, 0);
        });
    }

    #[test]
    fn test_mismatched_host_gets_400() {
        smol::block_on(async {
            let mut harness = Harness::spawn(Vec::new()).await;
            harness
                .send(b"GET http://a.test/ HTTP/1.1\r\nHost: b.test\r\n\r\n")
                .await;
            let res = harness.response().await;
            assert_eq!(res.code, 400);
            assert!(res.connection_close());
            harness.task.await;
        });
    }

    #[test]
    fn test_unresolvable_host_gets_404() {
        smol::block_on(async {
            let mut harness = Harness::spawn(Vec::new()).await;
            harness
                .send(
                    b"GET http://does.not.resolve.invalid/ HTTP/1.1\r\nHost: does.not.resolve.invalid\r\n\r\n",
                )
                .await;
            let res = harness.response().await;
            assert_eq!(res.code, 404);
            assert!(res.connection_close());
            harness.task.await;
        });
    }

    #[test]
    fn test_block_transformer_serves_canned_page() {
        smol::block_on(async {
            let transformer = BlockServeTransformer::new("You are being attacked");
            let mut harness = Harness::spawn(vec![Box::new(transformer)]).await;

            harness
                .send(b"GET http://a.test/ HTTP/1.1\r\nHost: a.test\r\n\r\n")
                .await;
            let res = harness.response().await;

            assert_eq!(res.code, 200);
            assert_eq!(res.status, "OK");
            assert!(
                crate::packet::find_subslice(&res.body, b"You are being attacked").is_some()
            );
            assert_eq!(harness.pool.len().await, 0, "no upstream connection opened");

            harness.task.await;
            assert!(harness.telemetry.is_empty(), "origin closed and emitted on exit");
        });
    }
}
