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

use std::collections::{BTreeMap, HashMap};

use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A full request frame, as built by client processes.
///
/// Every frame on the wire is a 4 byte little endian unsigned
/// length followed by that many bytes of UTF-8 JSON. The JSON
/// object is routed on its `status` field, which is why the enum
/// is tagged that way.
///
/// The daemon does not deserialize this enum directly. It routes
/// on the raw `status` string and then decodes the per-handler
/// payload structs below, so that a missing sid or an unknown
/// status code can be reported with the exact reason string the
/// protocol promises rather than a generic serde error.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Request {
    /// Liveness probe. Responds with `pong`.
    Ping,
    /// Open a new session. Responds with `session_created`.
    NewSession,
    /// Discard the session named by `sid`.
    RemoveSession { sid: String },
    /// Point the session's focus at the named server. The focused
    /// server's output lines are queued for the session's next
    /// `update` pull.
    ChangeFocus { sid: String, server: String },
    /// Start a managed server.
    StartServer { sid: String, server: String },
    /// Stop a managed server, optionally overriding the shutdown
    /// message broadcast to players.
    StopServer {
        sid: String,
        server: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Start every server that is currently eligible to start.
    StartAllServers { sid: String },
    /// Stop every running server.
    StopAllServers {
        sid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Inject a console command into a running server's stdin. With
    /// no explicit `server` the session's focus is used.
    Command {
        sid: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<String>,
    },
    /// Full per-server status map.
    Status { sid: String },
    /// Drain the session's pending output lines and fetch the
    /// compact server list.
    Update { sid: String },
    /// Fetch a slice of a server's output history by line id.
    RetrieveLines { sid: String, server: String, start: i64, stop: i64 },
}

/// Payload of `change_focus`, `start_server` and `retrieve_lines`
/// style requests that just name a server.
#[derive(Deserialize, Debug)]
pub struct TargetServer {
    pub server: String,
}

/// Payload of `stop_server`.
#[derive(Deserialize, Debug)]
pub struct StopServerPayload {
    pub server: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of `stop_all_servers`.
#[derive(Deserialize, Debug, Default)]
pub struct StopAllPayload {
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of `command`.
#[derive(Deserialize, Debug)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default)]
    pub server: Option<String>,
}

/// Payload of `retrieve_lines`. Negative indices count from the
/// end of the history; `stop = -1` addresses the final line,
/// inclusive.
#[derive(Deserialize, Debug)]
pub struct RetrieveLinesPayload {
    pub server: String,
    pub start: i64,
    pub stop: i64,
}

/// Every reply the daemon can send. Exactly one reply is written
/// per accepted request, then the connection is closed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Pong,
    SessionCreated {
        sid: String,
    },
    Ok,
    StatusResponse {
        servers: HashMap<String, ServerStatus>,
    },
    Updates {
        new_lines: Vec<String>,
        servers: Vec<ServerOnline>,
        focus: Option<String>,
        ram_used: f64,
    },
    /// Lines keyed by their per-run identifier. JSON object keys
    /// are always strings, so the ids travel stringified; clients
    /// use them to deduplicate against lines they already hold.
    RetrieveLinesResponse {
        lines: BTreeMap<String, String>,
    },
    Failed {
        reason: String,
    },
    InvalidRequest {
        reason: String,
    },
}

/// One server's slot in a `status_response`. The timing and memory
/// fields are only present while the server is running.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_used: Option<f64>,
}

/// Compact per-server entry in an `updates` reply.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerOnline {
    pub name: String,
    pub online: bool,
}
