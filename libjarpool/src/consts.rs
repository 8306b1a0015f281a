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

use std::time;

/// Frames above this size are rejected before the payload is read.
/// The protocol itself does not bound payloads, so this is our own
/// defensible ceiling.
pub const MAX_FRAME_BYTES: u32 = 1024 * 1024;

pub const DEFAULT_PORT: u16 = 45342;

/// Seconds of inactivity after which a session id stops validating.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 900;

/// How often the reaper sweeps for expired sessions.
pub const DEFAULT_SESSION_SWEEP_SECS: u64 = 60;

/// How often the memory sampler refreshes ram_percent for a
/// running child.
pub const DEFAULT_USAGE_INTERVAL_SECS: u64 = 5;

/// Broadcast to players right before shutdown when neither the
/// request nor the server config carries a message.
pub const DEFAULT_STOP_MESSAGE: &str = "Server going down";

pub const JOIN_POLL_DURATION: time::Duration = time::Duration::from_millis(100);

/// Upper bound on how long ordered shutdown waits for children to
/// exit after their stop commands have been written.
pub const SHUTDOWN_DRAIN_TIMEOUT: time::Duration = time::Duration::from_secs(10);
