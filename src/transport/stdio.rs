//! Stdio transport: line-delimited JSON-RPC over a child process.
//!
//! Exactly one child per server, spawned on first use. Concurrent logical
//! calls multiplex over the one process: writes are serialized through the
//! stdin lock, responses are matched to waiters by correlation id and may
//! arrive out of order. A crash fails every in-flight call with
//! `UpstreamUnreachable`; the process is respawned on the next call, never
//! automatically (crash loops).

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{oneshot, Mutex},
};
use tracing::{debug, info, warn};

use super::{
    call_params, parse_tool_list, JsonRpcRequest, JsonRpcResponse, ToolTransport,
    METHOD_CALL_TOOL, METHOD_LIST_TOOLS,
};
use crate::{
    catalog::ToolDescriptor,
    error::{GatewayError, GatewayResult},
};

type PendingMap = Arc<DashMap<u64, oneshot::Sender<JsonRpcResponse>>>;

pub struct StdioTransport {
    server_name: String,
    command: String,
    args: Vec<String>,
    envs: HashMap<String, String>,
    next_id: AtomicU64,
    proc: Mutex<Option<Arc<StdioProcess>>>,
    closed: AtomicBool,
}

struct StdioProcess {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl StdioTransport {
    pub fn new(
        server_name: &str,
        command: &str,
        args: Vec<String>,
        envs: HashMap<String, String>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            command: command.to_string(),
            args,
            envs,
            next_id: AtomicU64::new(1),
            proc: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    async fn ensure_process(&self) -> GatewayResult<Arc<StdioProcess>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::GatewayClosed);
        }
        let mut guard = self.proc.lock().await;
        if let Some(proc) = guard.as_ref() {
            if proc.alive.load(Ordering::SeqCst) {
                return Ok(Arc::clone(proc));
            }
            info!("stdio server '{}' is down; respawning", self.server_name);
        }
        let proc = self.spawn().await?;
        *guard = Some(Arc::clone(&proc));
        Ok(proc)
    }

    async fn spawn(&self) -> GatewayResult<Arc<StdioProcess>> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(self.envs.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::UpstreamUnreachable {
                server: self.server_name.clone(),
                message: format!("failed to spawn '{}': {}", self.command, e),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| GatewayError::UpstreamUnreachable {
            server: self.server_name.clone(),
            message: "child stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::UpstreamUnreachable {
            server: self.server_name.clone(),
            message: "child stdout not captured".to_string(),
        })?;

        let pending: PendingMap = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            self.server_name.clone(),
            BufReader::new(stdout),
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));

        info!("spawned stdio server '{}' ({})", self.server_name, self.command);
        Ok(Arc::new(StdioProcess {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            alive,
            reader,
        }))
    }

    async fn request(&self, method: &str, params: Option<Value>) -> GatewayResult<Value> {
        let proc = self.ensure_process().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        proc.pending.insert(id, tx);

        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params)).map_err(
            |e| GatewayError::UpstreamProtocol {
                server: self.server_name.clone(),
                message: format!("failed to encode request: {}", e),
            },
        )?;

        // Serialize writes so concurrent request bodies never interleave.
        {
            let mut stdin = proc.stdin.lock().await;
            let write = async {
                stdin.write_all(frame.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                proc.pending.remove(&id);
                proc.alive.store(false, Ordering::SeqCst);
                return Err(GatewayError::UpstreamUnreachable {
                    server: self.server_name.clone(),
                    message: format!("write to server process failed: {}", e),
                });
            }
        }

        match rx.await {
            Ok(response) => response.into_result(&self.server_name),
            // Sender dropped: the reader hit EOF and drained the pending map.
            Err(_) => Err(GatewayError::UpstreamUnreachable {
                server: self.server_name.clone(),
                message: "server process exited before responding".to_string(),
            }),
        }
    }
}

/// Correlate response lines to waiting callers until EOF, then fail every
/// in-flight call by dropping its sender.
async fn read_loop<R>(server_name: String, reader: BufReader<R>, pending: PendingMap, alive: Arc<AtomicBool>)
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(line) {
                    Ok(response) => match response.id {
                        Some(id) => {
                            if let Some((_, tx)) = pending.remove(&id) {
                                let _ = tx.send(response);
                            } else {
                                warn!("'{}' sent a response for unknown id {}", server_name, id);
                            }
                        }
                        None => debug!("ignoring id-less message from '{}'", server_name),
                    },
                    Err(e) => warn!("unparseable line from '{}': {}", server_name, e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("read from '{}' failed: {}", server_name, e);
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    let stranded: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    if !stranded.is_empty() {
        warn!(
            "stdio server '{}' exited with {} call(s) in flight",
            server_name,
            stranded.len()
        );
    }
    for id in stranded {
        pending.remove(&id);
    }
}

#[async_trait]
impl ToolTransport for StdioTransport {
    async fn list_tools(&self) -> GatewayResult<Vec<ToolDescriptor>> {
        let result = self.request(METHOD_LIST_TOOLS, None).await?;
        parse_tool_list(&self.server_name, result)
    }

    async fn call_tool(
        &self,
        name: &str,
        args: Value,
        _bearer_override: Option<&str>,
    ) -> GatewayResult<Value> {
        // Stdio servers authenticate through their spawn-time environment,
        // not per-call headers.
        self.request(METHOD_CALL_TOOL, Some(call_params(name, args)))
            .await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.proc.lock().await;
        let Some(proc) = guard.take() else {
            return;
        };
        proc.alive.store(false, Ordering::SeqCst);
        let mut child = proc.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!("stdio server '{}' already exited: {}", self.server_name, e);
        }
        if let Err(e) = child.wait().await {
            warn!("waiting for stdio server '{}' failed: {}", self.server_name, e);
        } else {
            info!("stdio server '{}' terminated", self.server_name);
        }
        drop(child);
        proc.reader.abort();

        // The reader may have been cut off before draining; fail any call
        // still waiting on a response by dropping its sender.
        let stranded: Vec<u64> = proc.pending.iter().map(|entry| *entry.key()).collect();
        if !stranded.is_empty() {
            warn!(
                "closed stdio server '{}' with {} call(s) in flight",
                self.server_name,
                stranded.len()
            );
        }
        for id in stranded {
            proc.pending.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn transport(command: &str, args: &[&str]) -> StdioTransport {
        StdioTransport::new(
            "local-tools",
            command,
            args.iter().map(|s| s.to_string()).collect(),
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn test_out_of_order_responses_correlate_by_id() {
        let (client, server) = tokio::io::duplex(4096);
        let pending: PendingMap = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.insert(1, tx1);
        pending.insert(2, tx2);

        let reader = tokio::spawn(read_loop(
            "local-tools".to_string(),
            BufReader::new(client),
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));

        // Respond to id 2 before id 1.
        let mut server = server;
        server
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"second\":true}}\n")
            .await
            .expect("write");
        server
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"first\":true}}\n")
            .await
            .expect("write");

        let second = rx2.await.expect("id 2 response");
        assert_eq!(second.result.as_ref().map(|v| v["second"] == json!(true)), Some(true));
        let first = rx1.await.expect("id 1 response");
        assert!(first.result.is_some());

        drop(server);
        reader.await.expect("reader exits");
        assert!(!alive.load(Ordering::SeqCst));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_eof_strands_in_flight_calls() {
        let (client, server) = tokio::io::duplex(64);
        let pending: PendingMap = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let (tx, rx) = oneshot::channel();
        pending.insert(1, tx);

        let reader = tokio::spawn(read_loop(
            "local-tools".to_string(),
            BufReader::new(client),
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));

        drop(server); // EOF with the call still in flight
        reader.await.expect("reader exits");
        assert!(rx.await.is_err(), "sender must be dropped on EOF");
        assert!(!alive.load(Ordering::SeqCst));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crashing_process_surfaces_unreachable() {
        // `false` exits immediately; the call never gets a response.
        let transport = transport("false", &[]);
        let err = transport.list_tools().await.unwrap_err();
        assert!(
            matches!(err, GatewayError::UpstreamUnreachable { .. }),
            "got: {:?}",
            err
        );
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_round_trip_reaches_child_and_correlates() {
        // `cat` echoes the request line; the echo parses as an envelope with
        // our id but no result, so the call must come back as a protocol
        // error, which shows write, read, and correlation all ran.
        let transport = transport("cat", &[]);
        let err = transport
            .call_tool("search_rooms", json!({}), None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, GatewayError::UpstreamProtocol { .. }),
            "got: {:?}",
            err
        );
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_next_call_respawns_after_exit() {
        // `head -n 1` echoes one line then exits: each call consumes one
        // process. The second call only succeeds in reaching a child if the
        // transport respawned.
        let transport = transport("head", &["-n", "1"]);

        let first = transport.call_tool("a", json!({}), None).await.unwrap_err();
        assert!(matches!(first, GatewayError::UpstreamProtocol { .. }));

        // Give the reader task a moment to observe EOF.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let second = transport.call_tool("b", json!({}), None).await.unwrap_err();
        assert!(
            matches!(second, GatewayError::UpstreamProtocol { .. }),
            "respawn did not happen: {:?}",
            second
        );
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_fails_calls_still_waiting() {
        // The child consumes requests without ever answering, so the call
        // can only resolve through close() failing it.
        let transport = Arc::new(StdioTransport::new(
            "local-tools",
            "sh",
            vec!["-c".to_string(), "cat > /dev/null".to_string()],
            HashMap::new(),
        ));

        let in_flight = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.call_tool("a", json!({}), None).await })
        };
        // Let the request reach the child before closing.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        transport.close().await;

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), in_flight)
            .await
            .expect("call must resolve once the transport is closed")
            .expect("join");
        assert!(
            matches!(result, Err(GatewayError::UpstreamUnreachable { .. })),
            "got: {:?}",
            result
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_is_terminal_and_idempotent() {
        let transport = transport("cat", &[]);
        let _ = transport.call_tool("a", json!({}), None).await;
        transport.close().await;
        transport.close().await;
        let err = transport.list_tools().await.unwrap_err();
        assert!(matches!(err, GatewayError::GatewayClosed));
    }
}
