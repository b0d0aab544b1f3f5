//! Fake printers for tests: a scripted HTTP API and a raw SACP socket peer.

use std::collections::VecDeque;
use std::net::SocketAddr;

use printlink_core::{encode_packet, next_packet, ChecksumPolicy, Message, Packet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// One request as seen by the fake HTTP device.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    pub method: String,
    /// Path including any query string.
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    body: String,
}

impl Reply {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

/// Answers requests with `Connection: close` replies taken from a script, one per connection.
/// Stops listening once the script runs out.
pub struct FakeHttpDevice {
    pub addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<HttpExchange>,
}

impl FakeHttpDevice {
    pub async fn serve(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, requests) = mpsc::unbounded_channel();
        let mut replies: VecDeque<Reply> = replies.into();
        tokio::spawn(async move {
            while let Some(reply) = replies.pop_front() {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let Some(exchange) = read_request(&mut stream).await else {
                    // Connection opened without a request; keep the reply for the next one.
                    replies.push_front(reply);
                    continue;
                };
                let _ = tx.send(exchange);
                let _ = write_reply(&mut stream, &reply).await;
                let _ = stream.shutdown().await;
            }
        });
        Self { addr, requests }
    }

    pub async fn next_request(&mut self) -> HttpExchange {
        self.requests.recv().await.unwrap()
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<HttpExchange> {
    let mut buf = Vec::new();
    let (method, path, head_len, content_len, chunked) = loop {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        if let httparse::Status::Complete(head_len) = req.parse(&buf).ok()? {
            let header = |name: &str| {
                req.headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case(name))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .map(str::to_string)
            };
            let content_len = header("content-length").and_then(|v| v.parse::<usize>().ok());
            let chunked = header("transfer-encoding").is_some_and(|v| v.contains("chunked"));
            break (
                req.method?.to_string(),
                req.path?.to_string(),
                head_len,
                content_len.unwrap_or(0),
                chunked,
            );
        }
    };
    loop {
        let body = &buf[head_len..];
        let done = if chunked {
            body.ends_with(b"0\r\n\r\n")
        } else {
            body.len() >= content_len
        };
        if done {
            break;
        }
        let mut chunk = [0u8; 16384];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(HttpExchange {
        method,
        path,
        body: buf[head_len..].to_vec(),
    })
}

async fn write_reply(stream: &mut TcpStream, reply: &Reply) -> std::io::Result<()> {
    let reason = match reply.status {
        200 => "OK",
        204 => "No Content",
        401 => "Unauthorized",
        403 => "Forbidden",
        _ => "Error",
    };
    let head = if reply.status == 204 {
        format!("HTTP/1.1 204 {}\r\nConnection: close\r\n\r\n", reason)
    } else {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            reply.status,
            reason,
            reply.body.len()
        )
    };
    stream.write_all(head.as_bytes()).await?;
    if reply.status != 204 {
        stream.write_all(reply.body.as_bytes()).await?;
    }
    stream.flush().await
}

/// Device end of a SACP socket.
pub struct FakeSacpDevice {
    pub stream: TcpStream,
    buf: Vec<u8>,
}

impl FakeSacpDevice {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Next host packet with its parsed body. Panics if the host hangs up.
    pub async fn recv(&mut self) -> (Packet, Message) {
        loop {
            if let Ok((packet, used)) = next_packet(&self.buf, ChecksumPolicy::Strict) {
                self.buf.drain(..used);
                let msg = Message::from_host(&packet).unwrap().unwrap();
                return (packet, msg);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "host closed early");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn send(&mut self, msg: Message, sequence: u16) {
        let bytes = encode_packet(&msg.to_packet(sequence).unwrap()).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }
}
