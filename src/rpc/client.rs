//! Transport client: one JSON-lines connection with a single-in-flight
//! call gate.
//!
//! The gate is held from request write to response read, so responses on
//! one connection always arrive in request order. The flip side is a
//! liveness hazard that callers must understand: a call issued without a
//! deadline holds the gate until the peer responds, however long that
//! takes. A later call on the same connection waits on the gate for that
//! whole duration; its own deadline bounds only its own wait (gate plus
//! response), it cannot interrupt the call already holding the gate.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::rpc::wire::{self, Request, Response};
use crate::types::TransportError;

struct ClientIo {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

/// A connected RPC client. Cheap to share behind an `Arc`; the in-flight
/// gate serializes callers.
pub struct RpcClient {
    io: Mutex<ClientIo>,
}

impl RpcClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    pub fn new(stream: TcpStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            io: Mutex::new(ClientIo {
                reader: BufReader::new(read),
                writer,
                line: String::new(),
            }),
        }
    }

    /// Issue one call. With a deadline, the whole wait (gate acquisition,
    /// request write, response read) is bounded and elapses into
    /// [`TransportError::Timeout`]. Without one, the call waits as long as
    /// the peer takes.
    pub async fn call(
        &self,
        method: &str,
        args: Value,
        deadline: Option<Instant>,
    ) -> Result<Value, TransportError> {
        match deadline {
            Some(deadline) => timeout_at(deadline, self.call_gated(method, args))
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => self.call_gated(method, args).await,
        }
    }

    async fn call_gated(&self, method: &str, args: Value) -> Result<Value, TransportError> {
        let frame = wire::encode_line(&Request::new(method, args))?;

        // gate held write-to-read; exactly one request in flight
        let mut io = self.io.lock().await;
        let ClientIo {
            reader,
            writer,
            line,
        } = &mut *io;

        trace!(method = method, "Sending request");
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await?;

        line.clear();
        let read = reader.read_line(line).await?;
        if read == 0 {
            debug!(method = method, "Peer closed connection mid-call");
            return Err(TransportError::ConnectionClosed);
        }

        let response: Response = wire::decode_line(line)?;
        response.into_result()
    }
}
