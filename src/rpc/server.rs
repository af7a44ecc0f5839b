//! Transport server: many concurrent connections, one backend.
//!
//! Each connection runs an independent read, dispatch, write loop, so
//! independent clients are never serialized against each other at the
//! transport layer. The backend itself holds non-reentrant session state
//! (attachment, cached handles), so a single global command gate is taken
//! immediately before each backend call and dropped immediately after it.
//! A malformed line gets an error response, not a connection drop.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};

use crate::backend::{AutomationBackend, BackendError, ElementRef, FindCriteria};
use crate::rpc::wire::{self, Request, Response};
use crate::types::TransportError;

/// Backend command parsed from one request frame. Parsing happens before
/// the command gate is taken so a bad frame never stalls other clients.
#[derive(Debug)]
enum Command {
    Attach { process_name: Option<String>, pid: Option<u32> },
    Find(FindCriteria),
    FindByPath { path: String },
    Click { target: ElementRef },
    RightClick { target: ElementRef },
    TypeText { text: String },
    SendKeys { keys: String },
    SetValue { target: ElementRef, value: String },
    GetValue { target: Option<ElementRef> },
    ReadProperty { target: ElementRef, name: String },
    GetChildren { target: Option<ElementRef> },
    Focus,
    Snapshot { depth: Option<u32> },
    Screenshot,
    LaunchAndAttach {
        path: String,
        args: Option<String>,
        working_dir: Option<String>,
        if_not_running: bool,
        timeout_secs: u64,
    },
    WaitForWindowReady { title_contains: String, timeout_secs: u64 },
    IsAttached,
    IsEnabled { target: ElementRef },
}

fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T, TransportError> {
    let value = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(value).map_err(|e| TransportError::Malformed {
        detail: format!("bad arguments: {}", e),
    })
}

impl Command {
    fn parse(request: &Request) -> Result<Command, TransportError> {
        use serde::Deserialize;

        #[derive(Deserialize)]
        struct RefArg {
            #[serde(rename = "ref")]
            target: ElementRef,
        }
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct OptRefArg {
            #[serde(rename = "ref")]
            target: Option<ElementRef>,
        }

        let args = &request.args;
        let command = match request.method.as_str() {
            "attach" => {
                #[derive(Deserialize, Default)]
                #[serde(default)]
                struct Args {
                    process_name: Option<String>,
                    pid: Option<u32>,
                }
                let a: Args = parse_args(args)?;
                Command::Attach {
                    process_name: a.process_name,
                    pid: a.pid,
                }
            }
            "find" => Command::Find(parse_args(args)?),
            "find_by_path" => {
                #[derive(Deserialize)]
                struct Args {
                    path: String,
                }
                let a: Args = parse_args(args)?;
                Command::FindByPath { path: a.path }
            }
            "click" => {
                let a: RefArg = parse_args(args)?;
                Command::Click { target: a.target }
            }
            "right_click" => {
                let a: RefArg = parse_args(args)?;
                Command::RightClick { target: a.target }
            }
            "type_text" => {
                #[derive(Deserialize)]
                struct Args {
                    text: String,
                }
                let a: Args = parse_args(args)?;
                Command::TypeText { text: a.text }
            }
            "send_keys" => {
                #[derive(Deserialize)]
                struct Args {
                    keys: String,
                }
                let a: Args = parse_args(args)?;
                Command::SendKeys { keys: a.keys }
            }
            "set_value" => {
                #[derive(Deserialize)]
                struct Args {
                    #[serde(rename = "ref")]
                    target: ElementRef,
                    value: String,
                }
                let a: Args = parse_args(args)?;
                Command::SetValue {
                    target: a.target,
                    value: a.value,
                }
            }
            "get_value" => {
                let a: OptRefArg = parse_args(args)?;
                Command::GetValue { target: a.target }
            }
            "read_property" => {
                #[derive(Deserialize)]
                struct Args {
                    #[serde(rename = "ref")]
                    target: ElementRef,
                    name: String,
                }
                let a: Args = parse_args(args)?;
                Command::ReadProperty {
                    target: a.target,
                    name: a.name,
                }
            }
            "get_children" => {
                let a: OptRefArg = parse_args(args)?;
                Command::GetChildren { target: a.target }
            }
            "focus" => Command::Focus,
            "snapshot" => {
                #[derive(Deserialize, Default)]
                #[serde(default)]
                struct Args {
                    depth: Option<u32>,
                }
                let a: Args = parse_args(args)?;
                Command::Snapshot { depth: a.depth }
            }
            "screenshot" => Command::Screenshot,
            "launch_and_attach" => {
                #[derive(Deserialize)]
                struct Args {
                    path: String,
                    #[serde(default)]
                    args: Option<String>,
                    #[serde(default)]
                    working_dir: Option<String>,
                    #[serde(default)]
                    if_not_running: bool,
                    #[serde(default = "default_timeout_secs")]
                    timeout_secs: u64,
                }
                let a: Args = parse_args(args)?;
                Command::LaunchAndAttach {
                    path: a.path,
                    args: a.args,
                    working_dir: a.working_dir,
                    if_not_running: a.if_not_running,
                    timeout_secs: a.timeout_secs,
                }
            }
            "wait_for_window_ready" => {
                #[derive(Deserialize)]
                struct Args {
                    title_contains: String,
                    #[serde(default = "default_timeout_secs")]
                    timeout_secs: u64,
                }
                let a: Args = parse_args(args)?;
                Command::WaitForWindowReady {
                    title_contains: a.title_contains,
                    timeout_secs: a.timeout_secs,
                }
            }
            "is_attached" => Command::IsAttached,
            "is_enabled" => {
                let a: RefArg = parse_args(args)?;
                Command::IsEnabled { target: a.target }
            }
            other => {
                return Err(TransportError::UnknownMethod {
                    method: other.to_string(),
                })
            }
        };
        Ok(command)
    }
}

fn default_timeout_secs() -> u64 {
    crate::engine::DEFAULT_STEP_TIMEOUT.as_secs()
}

/// Serves one [`AutomationBackend`] to any number of connections.
pub struct RpcServer {
    backend: Arc<dyn AutomationBackend>,
    command_gate: Mutex<()>,
}

impl RpcServer {
    pub fn new(backend: Arc<dyn AutomationBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            command_gate: Mutex::new(()),
        })
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), TransportError> {
        let local = listener.local_addr()?;
        info!(addr = %local, "Transport server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            let span = crate::logging::connection_span(&peer.to_string());
            tokio::spawn(
                async move {
                    if let Err(e) = server.serve_connection(stream, peer).await {
                        debug!(peer = %peer, error = %e, "Connection ended");
                    }
                }
                .instrument(span),
            );
        }
    }

    async fn serve_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), TransportError> {
        info!(peer = %peer, "Client connected");
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line, peer).await;
            let frame = wire::encode_line(&response)?;
            write.write_all(frame.as_bytes()).await?;
            write.flush().await?;
        }
        info!(peer = %peer, "Client disconnected");
        Ok(())
    }

    async fn handle_line(&self, line: &str, peer: SocketAddr) -> Response {
        let request: Request = match wire::decode_line(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Malformed request line");
                return Response::failure(e.to_string());
            }
        };
        let command = match Command::parse(&request) {
            Ok(command) => command,
            Err(e) => {
                warn!(peer = %peer, method = %request.method, error = %e, "Rejected request");
                return Response::failure(e.to_string());
            }
        };

        debug!(peer = %peer, method = %request.method, "Dispatching");
        match self.execute(command).await {
            Ok(result) => Response::success(result),
            Err(e) => Response::failure(e.to_string()),
        }
    }

    /// Run one backend command under the global gate. The gate spans
    /// exactly the backend call.
    async fn execute(&self, command: Command) -> Result<Value, BackendError> {
        let backend = &*self.backend;
        let _gate = self.command_gate.lock().await;

        let result = match command {
            Command::Attach { process_name, pid } => {
                backend.attach(process_name.as_deref(), pid).await?;
                Value::Null
            }
            Command::Find(criteria) => json!(backend.find(&criteria).await?),
            Command::FindByPath { path } => json!(backend.find_by_path(&path).await?),
            Command::Click { target } => {
                backend.click(&target).await?;
                Value::Null
            }
            Command::RightClick { target } => {
                backend.right_click(&target).await?;
                Value::Null
            }
            Command::TypeText { text } => {
                backend.type_text(&text).await?;
                Value::Null
            }
            Command::SendKeys { keys } => {
                backend.send_keys(&keys).await?;
                Value::Null
            }
            Command::SetValue { target, value } => {
                backend.set_value(&target, &value).await?;
                Value::Null
            }
            Command::GetValue { target } => json!(backend.get_value(target.as_ref()).await?),
            Command::ReadProperty { target, name } => {
                json!(backend.read_property(&target, &name).await?)
            }
            Command::GetChildren { target } => {
                json!(backend.get_children(target.as_ref()).await?)
            }
            Command::Focus => {
                backend.focus().await?;
                Value::Null
            }
            Command::Snapshot { depth } => json!(backend.snapshot(depth).await?),
            Command::Screenshot => json!(backend.screenshot().await?),
            Command::LaunchAndAttach {
                path,
                args,
                working_dir,
                if_not_running,
                timeout_secs,
            } => {
                backend
                    .launch_and_attach(
                        &path,
                        args.as_deref(),
                        working_dir.as_deref(),
                        if_not_running,
                        std::time::Duration::from_secs(timeout_secs),
                    )
                    .await?;
                Value::Null
            }
            Command::WaitForWindowReady {
                title_contains,
                timeout_secs,
            } => {
                backend
                    .wait_for_window_ready(
                        &title_contains,
                        std::time::Duration::from_secs(timeout_secs),
                    )
                    .await?;
                Value::Null
            }
            Command::IsAttached => json!(backend.is_attached().await?),
            Command::IsEnabled { target } => json!(backend.is_enabled(&target).await?),
        };
        Ok(result)
    }
}
