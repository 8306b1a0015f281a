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
    collections::HashMap,
    sync::{Arc, Mutex},
    thread, time,
};

use anyhow::anyhow;
use tracing::{debug, info, span, Level};
use uuid::Uuid;

/// The only user the built-in authenticator accepts. Sessions
/// already carry a user field, so a real authenticator can slot in
/// without touching the wire protocol.
const BUILTIN_USER: &str = "jarpool";

/// A table of live client sessions keyed by sid.
///
/// Everything goes through the single table mutex: request
/// handlers touching and draining, the output pipeline fanning
/// lines out, and the reaper sweeping expired entries.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    /// Seconds of inactivity after which a sid stops validating.
    ttl: u64,
}

/// One logical client.
#[derive(Debug)]
pub struct Session {
    pub sid: String,
    #[allow(dead_code)] // reserved for a future authenticator
    pub user: String,
    /// The server whose output this session is subscribed to.
    pub focus: Option<String>,
    /// Epoch seconds of the last request that presented this sid.
    pub last_packet: u64,
    /// Lines waiting to be drained by the next `update`.
    pub new_lines: Vec<String>,
}

fn epoch_secs() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl SessionManager {
    pub fn new(ttl: u64) -> Self {
        SessionManager { sessions: Mutex::new(HashMap::new()), ttl }
    }

    fn authenticate(&self, user: &str) -> bool {
        user == BUILTIN_USER
    }

    /// Create a session for the given user and return its sid.
    pub fn new_session(&self, user: &str) -> anyhow::Result<String> {
        if !self.authenticate(user) {
            return Err(anyhow!("Invalid credentials"));
        }

        let sid = Uuid::new_v4().to_string();
        let session = Session {
            sid: sid.clone(),
            user: String::from(user),
            focus: None,
            last_packet: epoch_secs(),
            new_lines: vec![],
        };
        self.sessions.lock().unwrap().insert(sid.clone(), session);
        info!("created a new session with sid {}", sid);
        Ok(sid)
    }

    /// Open a session as the daemon's single built-in user.
    pub fn new_builtin_session(&self) -> anyhow::Result<String> {
        self.new_session(BUILTIN_USER)
    }

    /// A sid is valid iff it exists and its last packet is younger
    /// than the ttl.
    pub fn is_valid(&self, sid: &str) -> bool {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(sid) {
            Some(session) => epoch_secs().saturating_sub(session.last_packet) < self.ttl,
            None => false,
        }
    }

    /// Refresh the last-packet stamp so the session outlives
    /// another ttl window.
    pub fn touch(&self, sid: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(sid) {
            session.last_packet = epoch_secs();
            debug!("touched session {}", sid);
        }
    }

    /// Remove a session. Idempotent so the reaper and explicit
    /// removal can race without drama.
    pub fn remove(&self, sid: &str) -> bool {
        let removed = self.sessions.lock().unwrap().remove(sid).is_some();
        if removed {
            info!("removed session with sid {}", sid);
        }
        removed
    }

    /// Point the session at a new server, dropping any lines
    /// queued for the old focus.
    pub fn change_focus(&self, sid: &str, server: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(sid) {
            session.focus = Some(String::from(server));
            session.new_lines.clear();
        }
    }

    pub fn focus_of(&self, sid: &str) -> Option<String> {
        self.sessions.lock().unwrap().get(sid).and_then(|s| s.focus.clone())
    }

    /// Queue a line for every session focused on the given server.
    pub fn add_line(&self, server: &str, line: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values_mut() {
            if session.focus.as_deref() == Some(server) {
                session.new_lines.push(String::from(line));
            }
        }
    }

    /// Atomically drain the pending lines and report the focus,
    /// for an `update` reply.
    pub fn drain(&self, sid: &str) -> (Vec<String>, Option<String>) {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(sid) {
            Some(session) => (std::mem::take(&mut session.new_lines), session.focus.clone()),
            None => (vec![], None),
        }
    }

    /// Drop every session that no longer validates. Called by the
    /// reaper thread.
    pub fn clear_expired(&self) {
        let now = epoch_secs();
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, session| now.saturating_sub(session.last_packet) < self.ttl);
        let swept = before - sessions.len();
        if swept > 0 {
            info!("reaped {} expired session(s)", swept);
        }
        debug!("finished sessions sweep");
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

/// Run the reaper loop in a dedicated thread. It wakes every
/// `check_every` to sweep, and exits as soon as the shutdown
/// channel closes.
pub fn spawn_reaper(
    sessions: Arc<SessionManager>,
    check_every: time::Duration,
    shutdown: crossbeam_channel::Receiver<()>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let _s = span!(Level::INFO, "session_reaper").entered();
        loop {
            match shutdown.recv_timeout(check_every) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    sessions.clear_expired();
                }
                Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    info!("bailing out of reaper loop");
                    return;
                }
            }
        }
    })
}
