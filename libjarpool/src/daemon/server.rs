// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    net::{self, SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use anyhow::Context;
use jarpool_protocol::{
    CommandPayload, Reply, RetrieveLinesPayload, StopAllPayload, StopServerPayload, TargetServer,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::{
    daemon::{
        sessions::SessionManager,
        supervisor::{ServerManager, Status},
        Shutdown,
    },
    protocol,
};

pub struct Server {
    servers: Arc<ServerManager>,
    sessions: Arc<SessionManager>,
    shutdown: Arc<Shutdown>,
}

/// A parsed inbound frame bound to its connection. Whoever replies
/// closes the connection; the flag keeps that to exactly once.
struct Request {
    stream: TcpStream,
    peer: SocketAddr,
    data: Value,
    replied: bool,
}

impl Request {
    fn reply(&mut self, reply: &Reply) -> anyhow::Result<()> {
        if self.replied {
            // a second reply is an internal invariant violation,
            // not a client-visible condition
            debug_assert!(false, "double reply to a request");
            error!("attempted double reply to request from {}", self.peer);
            return Ok(());
        }
        self.replied = true;
        protocol::encode_to(reply, &mut self.stream).context("writing reply")?;
        let _ = self.stream.shutdown(net::Shutdown::Both);
        Ok(())
    }

    fn failed(&mut self, reason: String) -> anyhow::Result<()> {
        self.reply(&Reply::Failed { reason })
    }

    fn invalid(&mut self, reason: String) -> anyhow::Result<()> {
        self.reply(&Reply::InvalidRequest { reason })
    }
}

/// Whether a status code only runs with a valid sid. `None` means
/// the code is unknown.
fn requires_sid(status: &str) -> Option<bool> {
    match status {
        "ping" | "new_session" => Some(false),
        "remove_session" | "change_focus" | "start_server" | "stop_server"
        | "start_all_servers" | "stop_all_servers" | "command" | "status" | "update"
        | "retrieve_lines" => Some(true),
        _ => None,
    }
}

impl Server {
    pub fn new(
        servers: Arc<ServerManager>,
        sessions: Arc<SessionManager>,
        shutdown: Arc<Shutdown>,
    ) -> Arc<Self> {
        Arc::new(Server { servers, sessions, shutdown })
    }

    /// Accept connections until shutdown. Each connection carries
    /// exactly one request, handled on its own short-lived thread.
    #[instrument(skip_all)]
    pub fn serve(server: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let mut conn_counter = 0;
        for stream in listener.incoming() {
            if server.shutdown.is_set() {
                info!("listener asked to stop, no longer accepting");
                break;
            }
            match stream {
                Ok(stream) => {
                    conn_counter += 1;
                    let conn_id = conn_counter;
                    let server = Arc::clone(&server);
                    thread::spawn(move || {
                        if let Err(err) = server.handle_conn(stream, conn_id) {
                            error!("handling connection: {:?}", err);
                        }
                    });
                }
                Err(err) => {
                    if server.shutdown.is_set() {
                        break;
                    }
                    error!("accepting stream: {:?}", err);
                }
            }
        }

        Ok(())
    }

    /// Decode one frame and route it. A transport error drops just
    /// this connection; a protocol error earns an invalid_request
    /// reply.
    #[instrument(skip_all, fields(cid = conn_id))]
    fn handle_conn(&self, mut stream: TcpStream, conn_id: usize) -> anyhow::Result<()> {
        let peer = stream.peer_addr().context("resolving peer address")?;

        let payload = match protocol::read_frame(&mut stream) {
            Ok(payload) => payload,
            Err(e) => {
                if let Some(oversize) = e.downcast_ref::<protocol::OversizeFrame>() {
                    let reason = oversize.to_string();
                    let mut request =
                        Request { stream, peer, data: Value::Null, replied: false };
                    return request.invalid(reason);
                }
                return Err(e).context("reading request frame");
            }
        };

        let mut request = Request { stream, peer, data: Value::Null, replied: false };
        match serde_json::from_slice::<Value>(&payload) {
            Ok(data @ Value::Object(_)) => {
                debug!(
                    "received request from {} containing '{}'",
                    peer,
                    String::from_utf8_lossy(&payload).trim()
                );
                request.data = data;
                self.dispatch(&mut request)
            }
            Ok(_) => request.invalid(String::from("Request must be a JSON object")),
            Err(e) => request.invalid(format!("Invalid JSON: {e}")),
        }
    }

    /// Route on the `status` field, enforcing the sid gate and
    /// touching the session before the handler runs.
    fn dispatch(&self, request: &mut Request) -> anyhow::Result<()> {
        let status = match request.data.get("status").and_then(Value::as_str) {
            Some(status) => String::from(status),
            None => return request.invalid(String::from("Status code not found")),
        };

        let require_sid = match requires_sid(&status) {
            Some(require_sid) => require_sid,
            None => return request.invalid(String::from("Invalid status code")),
        };

        let sid = request.data.get("sid").and_then(Value::as_str).map(String::from);
        if require_sid {
            match &sid {
                None => return request.failed(String::from("SID not provided")),
                Some(sid) if !self.sessions.is_valid(sid) => {
                    return request.failed(String::from("Invalid SID"))
                }
                Some(_) => {}
            }
        }
        // keep any presented valid session alive, required or not
        if let Some(sid) = &sid {
            if self.sessions.is_valid(sid) {
                self.sessions.touch(sid);
            }
        }

        match status.as_str() {
            "ping" => request.reply(&Reply::Pong),
            "new_session" => self.handle_new_session(request),
            // the gate above guarantees a valid sid from here on
            "remove_session" => self.handle_remove_session(request, &sid.unwrap_or_default()),
            "change_focus" => self.handle_change_focus(request, &sid.unwrap_or_default()),
            "start_server" => self.handle_start_server(request),
            "stop_server" => self.handle_stop_server(request),
            "start_all_servers" => self.handle_start_all(request),
            "stop_all_servers" => self.handle_stop_all(request),
            "command" => self.handle_command(request, &sid.unwrap_or_default()),
            "status" => self.handle_status(request),
            "update" => self.handle_update(request, &sid.unwrap_or_default()),
            "retrieve_lines" => self.handle_retrieve_lines(request),
            _ => unreachable!("status codes are screened by requires_sid"),
        }
    }

    fn handle_new_session(&self, request: &mut Request) -> anyhow::Result<()> {
        match self.sessions.new_builtin_session() {
            Ok(sid) => request.reply(&Reply::SessionCreated { sid }),
            Err(e) => request.failed(format!("{e:#}")),
        }
    }

    fn handle_remove_session(&self, request: &mut Request, sid: &str) -> anyhow::Result<()> {
        self.sessions.remove(sid);
        request.reply(&Reply::Ok)
    }

    fn handle_change_focus(&self, request: &mut Request, sid: &str) -> anyhow::Result<()> {
        let payload: TargetServer = match parse_payload(request) {
            Ok(payload) => payload,
            Err(reason) => return request.invalid(reason),
        };
        if !self.servers.contains(&payload.server) {
            return request.failed(format!("Unknown server: {}", payload.server));
        }
        self.sessions.change_focus(sid, &payload.server);
        request.reply(&Reply::Ok)
    }

    fn handle_start_server(&self, request: &mut Request) -> anyhow::Result<()> {
        let payload: TargetServer = match parse_payload(request) {
            Ok(payload) => payload,
            Err(reason) => return request.invalid(reason),
        };
        match self.servers.get(&payload.server) {
            None => request.failed(format!("Server {} does not exist", payload.server)),
            Some(server) => match server.start() {
                Ok(()) => request.reply(&Reply::Ok),
                Err(e) => request.failed(format!("{e:#}")),
            },
        }
    }

    fn handle_stop_server(&self, request: &mut Request) -> anyhow::Result<()> {
        let payload: StopServerPayload = match parse_payload(request) {
            Ok(payload) => payload,
            Err(reason) => return request.invalid(reason),
        };
        match self.servers.get(&payload.server) {
            None => request.failed(format!("Server {} does not exist", payload.server)),
            Some(server) => match server.stop(payload.message.as_deref()) {
                Ok(()) => request.reply(&Reply::Ok),
                Err(e) => request.failed(format!("{e:#}")),
            },
        }
    }

    fn handle_start_all(&self, request: &mut Request) -> anyhow::Result<()> {
        let outcome = self.servers.start_all();
        if outcome.all_failed() {
            request.failed(outcome.reason())
        } else {
            request.reply(&Reply::Ok)
        }
    }

    fn handle_stop_all(&self, request: &mut Request) -> anyhow::Result<()> {
        let payload: StopAllPayload = match parse_payload(request) {
            Ok(payload) => payload,
            Err(reason) => return request.invalid(reason),
        };
        let outcome = self.servers.stop_all(payload.message.as_deref());
        if outcome.all_failed() {
            request.failed(outcome.reason())
        } else {
            request.reply(&Reply::Ok)
        }
    }

    /// Resolve the target server as: the explicit `server` field if
    /// it names a known server, else the session's focus if that
    /// does. Execution needs the target to be STARTED.
    fn handle_command(&self, request: &mut Request, sid: &str) -> anyhow::Result<()> {
        let payload: CommandPayload = match parse_payload(request) {
            Ok(payload) => payload,
            Err(reason) => return request.invalid(reason),
        };

        let target = payload
            .server
            .filter(|name| self.servers.contains(name))
            .or_else(|| self.sessions.focus_of(sid).filter(|name| self.servers.contains(name)));
        let server = match target.as_deref().and_then(|name| self.servers.get(name)) {
            Some(server) => server,
            None => return request.failed(String::from("Please specify a valid server")),
        };

        if server.status() != Status::Started {
            return request.failed(format!("Server {} is not running", server.name()));
        }
        match server.command(&payload.command) {
            Ok(()) => request.reply(&Reply::Ok),
            Err(e) => request.failed(format!("{e:#}")),
        }
    }

    fn handle_status(&self, request: &mut Request) -> anyhow::Result<()> {
        request.reply(&Reply::StatusResponse { servers: self.servers.status() })
    }

    fn handle_update(&self, request: &mut Request, sid: &str) -> anyhow::Result<()> {
        let (new_lines, focus) = self.sessions.drain(sid);
        let ram_used = focus
            .as_deref()
            .and_then(|name| self.servers.get(name))
            .map(|server| server.ram_percent())
            .unwrap_or(0.0);
        request.reply(&Reply::Updates {
            new_lines,
            servers: self.servers.online_list(),
            focus,
            ram_used,
        })
    }

    fn handle_retrieve_lines(&self, request: &mut Request) -> anyhow::Result<()> {
        let payload: RetrieveLinesPayload = match parse_payload(request) {
            Ok(payload) => payload,
            Err(reason) => return request.invalid(reason),
        };
        match self.servers.get(&payload.server) {
            None => request.failed(format!("Server {} does not exist", payload.server)),
            Some(server) => {
                let lines = server
                    .retrieve_lines(payload.start, payload.stop)
                    .into_iter()
                    .map(|(id, line)| (id.to_string(), line))
                    .collect();
                request.reply(&Reply::RetrieveLinesResponse { lines })
            }
        }
    }
}

fn parse_payload<T: DeserializeOwned>(request: &Request) -> Result<T, String> {
    serde_json::from_value(request.data.clone()).map_err(|e| e.to_string())
}
