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
    collections::{BTreeMap, HashMap},
    fmt, fs,
    io::Write as _,
    path::{Path, PathBuf},
    process::{self, Stdio},
    sync::{Arc, Mutex},
    thread, time,
};

use anyhow::{anyhow, Context};
use jarpool_protocol::{ServerOnline, ServerStatus};
use tracing::{debug, info, instrument, span, warn, Level};

use crate::{
    config::{ServerEntry, ServerKind},
    consts,
    daemon::{output, sessions::SessionManager, usage, Shutdown},
};

/// Where a managed server sits in its lifecycle.
///
/// The child handle (the stdin writer) is present iff the status
/// is one of the running states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
    Crashed,
}

impl Status {
    /// Running means a child process is attached: commands can be
    /// written and usage is being sampled.
    pub fn is_running(&self) -> bool {
        matches!(self, Status::Starting | Status::Started | Status::Stopping)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Stopped => "STOPPED",
            Status::Starting => "STARTING",
            Status::Started => "STARTED",
            Status::Stopping => "STOPPING",
            Status::Crashed => "CRASHED",
        };
        write!(f, "{name}")
    }
}

/// The registry of every managed server, in config order.
///
/// Servers are created at boot and never destroyed, so the vec
/// itself needs no lock; all mutable state hides behind each
/// server's own mutex.
pub struct ServerManager {
    servers: Vec<Arc<GameServer>>,
}

/// The result of a bulk start/stop sweep.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub attempted: usize,
    pub failures: Vec<(String, String)>,
}

impl BatchOutcome {
    /// Continue-on-failure policy: the batch only counts as failed
    /// when every attempted server failed.
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failures.len() == self.attempted
    }

    pub fn reason(&self) -> String {
        self.failures
            .iter()
            .map(|(name, reason)| format!("{name}: {reason}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl ServerManager {
    pub fn new(
        entries: Vec<ServerEntry>,
        sessions: Arc<SessionManager>,
        sample_interval: time::Duration,
        shutdown: Arc<Shutdown>,
    ) -> anyhow::Result<Self> {
        let mut servers: Vec<Arc<GameServer>> = vec![];
        for entry in entries {
            if servers.iter().any(|s| s.name() == entry.name) {
                return Err(anyhow!("server already exists: {}", entry.name));
            }
            debug!("registered server {}", entry.name);
            servers.push(Arc::new(GameServer::new(
                entry,
                Arc::clone(&sessions),
                sample_interval,
                Arc::clone(&shutdown),
            )));
        }
        Ok(ServerManager { servers })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<GameServer>> {
        self.servers.iter().find(|s| s.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Start every server currently eligible to start, in registry
    /// order. A per-server failure is recorded but does not abort
    /// the sweep.
    #[instrument(skip_all)]
    pub fn start_all(&self) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for server in &self.servers {
            if !matches!(server.status(), Status::Stopped | Status::Crashed) {
                continue;
            }
            outcome.attempted += 1;
            if let Err(e) = server.start() {
                warn!("starting {}: {:?}", server.name(), e);
                outcome.failures.push((String::from(server.name()), format!("{e:#}")));
            }
        }
        outcome
    }

    /// Stop every started server, in registry order.
    #[instrument(skip_all)]
    pub fn stop_all(&self, message: Option<&str>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for server in &self.servers {
            if server.status() != Status::Started {
                continue;
            }
            outcome.attempted += 1;
            if let Err(e) = server.stop(message) {
                warn!("stopping {}: {:?}", server.name(), e);
                outcome.failures.push((String::from(server.name()), format!("{e:#}")));
            }
        }
        outcome
    }

    pub fn status(&self) -> HashMap<String, ServerStatus> {
        self.servers
            .iter()
            .map(|s| (String::from(s.name()), s.server_status()))
            .collect()
    }

    pub fn online_list(&self) -> Vec<ServerOnline> {
        self.servers
            .iter()
            .map(|s| ServerOnline { name: String::from(s.name()), online: s.status().is_running() })
            .collect()
    }

    pub fn any_running(&self) -> bool {
        self.servers.iter().any(|s| s.status().is_running())
    }

    /// Poll until every child has wound down or the deadline
    /// passes. Used by ordered shutdown after the stop commands
    /// have been written.
    pub fn await_all_stopped(&self, timeout: time::Duration) -> bool {
        let deadline = time::Instant::now() + timeout;
        while self.any_running() {
            if time::Instant::now() > deadline {
                return false;
            }
            thread::sleep(consts::JOIN_POLL_DURATION);
        }
        true
    }
}

/// One managed server and its run state.
pub struct GameServer {
    entry: ServerEntry,
    sessions: Arc<SessionManager>,
    sample_interval: time::Duration,
    shutdown: Arc<Shutdown>,
    state: Mutex<RunState>,
}

/// Everything that only means something while a child is attached.
/// Guarded by the server mutex; state transitions only happen with
/// it held.
#[derive(Default)]
struct RunState {
    status: Status,
    stdin: Option<process::ChildStdin>,
    started_at: Option<u64>,
    ram_percent: f64,
    /// Output lines of the current run; a line's id is its index.
    history: Vec<String>,
    sampler_stop: Option<crossbeam_channel::Sender<()>>,
    sampler_h: Option<thread::JoinHandle<()>>,
}

struct Spawned {
    child: process::Child,
    stdin: process::ChildStdin,
    output: fs::File,
}

fn epoch_secs() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl GameServer {
    fn new(
        entry: ServerEntry,
        sessions: Arc<SessionManager>,
        sample_interval: time::Duration,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        GameServer {
            entry,
            sessions,
            sample_interval,
            shutdown,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status
    }

    fn transition(&self, state: &mut RunState, status: Status) {
        state.status = status;
        info!("changed status of server {} to {}", self.entry.name, status);
    }

    /// The full java invocation, run through the system shell.
    fn command_line(&self) -> String {
        let start = &self.entry.start_command;
        let mut command = String::from("java");
        if let Some(min) = &start.ram.min {
            command.push_str(&format!(" -Xms{min}"));
        }
        if let Some(max) = &start.ram.max {
            command.push_str(&format!(" -Xmx{max}"));
        }
        command.push_str(&format!(" -jar {}", start.jar.display()));
        if self.entry.kind.wants_nogui() {
            command.push_str(" nogui");
        }
        if let Some(flags) = &self.entry.flags {
            command.push(' ');
            command.push_str(flags);
        }
        command
    }

    /// The child's working directory: configured, or the jar's
    /// parent.
    fn working_dir(&self) -> PathBuf {
        match &self.entry.start_command.directory {
            Some(dir) => dir.clone(),
            None => self
                .entry
                .start_command
                .jar
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Start the child. Legal only from STOPPED or CRASHED. A
    /// spawn failure lands in CRASHED and surfaces the error.
    #[instrument(skip_all, fields(s = %self.entry.name))]
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !matches!(state.status, Status::Stopped | Status::Crashed) {
            return Err(anyhow!("Server {} was already started", self.entry.name));
        }
        self.transition(&mut state, Status::Starting);

        let command = self.command_line();
        let cwd = self.working_dir();
        info!("spawning `{}` in {}", command, cwd.display());
        let spawned = match spawn_child(&command, &cwd) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.transition(&mut state, Status::Crashed);
                return Err(e).with_context(|| format!("starting server {}", self.entry.name));
            }
        };

        self.transition(&mut state, Status::Started);
        let pid = spawned.child.id();
        state.stdin = Some(spawned.stdin);
        state.started_at = Some(epoch_secs());
        state.ram_percent = 0.0;
        state.history.clear();

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        state.sampler_stop = Some(stop_tx);
        state.sampler_h = Some(spawn_sampler(Arc::clone(self), pid, stop_rx));
        drop(state);

        output::spawn_watcher(Arc::clone(self), spawned.child, spawned.output);
        Ok(())
    }

    /// Ask the child to shut itself down by writing its stop
    /// command plus the shutdown message. Legal only from STARTED.
    #[instrument(skip_all, fields(s = %self.entry.name))]
    pub fn stop(&self, message: Option<&str>) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.status != Status::Started {
            return Err(anyhow!(
                "Server {} must be started before stopping it",
                self.entry.name
            ));
        }
        self.transition(&mut state, Status::Stopping);

        let message = message
            .or(self.entry.stop_message.as_deref())
            .unwrap_or(consts::DEFAULT_STOP_MESSAGE);
        let command = format!("{} {}", self.entry.kind.stop_command(), message);
        self.write_line(&mut state, &command)
    }

    /// Write a console command to the child's stdin. Legal while a
    /// child is attached (STARTING, STARTED or STOPPING).
    pub fn command(&self, command: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.status.is_running() {
            return Err(anyhow!(
                "Server {} must be alive to send a command",
                self.entry.name
            ));
        }
        self.write_line(&mut state, command)
    }

    fn write_line(&self, state: &mut RunState, line: &str) -> anyhow::Result<()> {
        let stdin = state
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("no stdin handle for {}", self.entry.name))?;
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .and_then(|_| stdin.flush())
            .with_context(|| format!("writing to stdin of {}", self.entry.name))
    }

    /// Everything the status handler reports for this server. The
    /// timing and memory fields only exist while running.
    pub fn server_status(&self) -> ServerStatus {
        let state = self.state.lock().unwrap();
        let mut status = ServerStatus {
            status: state.status.to_string(),
            started_at: None,
            uptime: None,
            ram_used: None,
        };
        if state.status.is_running() {
            status.started_at = state.started_at;
            status.uptime = state.started_at.map(|at| epoch_secs().saturating_sub(at));
            status.ram_used = Some(state.ram_percent);
        }
        status
    }

    pub fn ram_percent(&self) -> f64 {
        self.state.lock().unwrap().ram_percent
    }

    /// The inclusive `[start, stop]` slice of the current run's
    /// history, keyed by line id. Negative indices count from the
    /// end; a range that misses the history entirely is empty.
    pub fn retrieve_lines(&self, start: i64, stop: i64) -> BTreeMap<u64, String> {
        let state = self.state.lock().unwrap();
        let mut lines = BTreeMap::new();
        if let Some((lo, hi)) = resolve_range(state.history.len(), start, stop) {
            for (id, line) in state.history[lo..=hi].iter().enumerate() {
                lines.insert((lo + id) as u64, line.clone());
            }
        }
        lines
    }

    /// Called by the watcher thread for every completed line.
    pub(crate) fn on_line(&self, line: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.status.is_running() {
                return;
            }
            state.history.push(String::from(line));
        }
        self.sessions.add_line(&self.entry.name, line);
    }

    /// Called by the watcher thread once the child's output pipe
    /// hits EOF. Stops and joins the sampler first so no task is
    /// left publishing into state that is about to be reset.
    pub(crate) fn on_child_exit(&self, mut child: process::Child) {
        let (stop_tx, sampler_h) = {
            let mut state = self.state.lock().unwrap();
            (state.sampler_stop.take(), state.sampler_h.take())
        };
        drop(stop_tx);
        if let Some(h) = sampler_h {
            if h.join().is_err() {
                warn!("sampler for {} panicked", self.entry.name);
            }
        }

        match child.wait() {
            Ok(exit) => info!("child of {} exited with {}", self.entry.name, exit),
            Err(e) => warn!("reaping child of {}: {:?}", self.entry.name, e),
        }

        let mut state = self.state.lock().unwrap();
        self.transition(&mut state, Status::Stopped);
        state.stdin = None;
        state.started_at = None;
        state.ram_percent = 0.0;
        state.history.clear();
    }
}

/// Spawn the java command through the system shell with stdin
/// piped and stdout+stderr merged into one pipe.
fn spawn_child(command: &str, cwd: &Path) -> anyhow::Result<Spawned> {
    let (read_end, write_end) = nix::unistd::pipe().context("creating output pipe")?;
    let write_dup = write_end.try_clone().context("duping output pipe")?;

    let mut child = process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(write_end))
        .stderr(Stdio::from(write_dup))
        .spawn()
        .context("spawning child process")?;

    let stdin = child.stdin.take().ok_or_else(|| anyhow!("child has no stdin pipe"))?;
    Ok(Spawned { child, stdin, output: fs::File::from(read_end) })
}

/// Periodically refresh ram_percent for a running child. Exits on
/// the per-run stop channel, on daemon shutdown, and as soon as
/// the server leaves the running states.
fn spawn_sampler(
    server: Arc<GameServer>,
    pid: u32,
    stop: crossbeam_channel::Receiver<()>,
) -> thread::JoinHandle<()> {
    let interval = server.sample_interval;
    let shutdown = server.shutdown.subscribe();
    thread::spawn(move || {
        let _s = span!(Level::INFO, "usage_sampler", s = %server.name()).entered();
        let ticker = crossbeam_channel::tick(interval);
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => return,
                recv(shutdown) -> _ => return,
                recv(ticker) -> _ => {
                    match usage::ram_percent(pid) {
                        Ok(percent) => {
                            let mut state = server.state.lock().unwrap();
                            if !state.status.is_running() {
                                return;
                            }
                            state.ram_percent = percent;
                        }
                        Err(e) => {
                            debug!("sampling pid {}: {:?}", pid, e);
                        }
                    }
                }
            }
        }
    })
}

/// Map an inclusive, possibly-negative `[start, stop]` request
/// onto concrete history indices. `stop = -1` addresses the final
/// line.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let norm = |i: i64| if i < 0 { len + i } else { i };

    let lo = norm(start).max(0);
    let hi = norm(stop).min(len - 1);
    if lo > hi {
        return None;
    }
    Some((lo as usize, hi as usize))
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    fn server(entry: serde_json::Value) -> Arc<GameServer> {
        let entry: ServerEntry = serde_json::from_value(entry).expect("entry to parse");
        Arc::new(GameServer::new(
            entry,
            Arc::new(SessionManager::new(900)),
            time::Duration::from_secs(5),
            Arc::new(Shutdown::new()),
        ))
    }

    #[test]
    #[timeout(30000)]
    fn vanilla_command_line() {
        let server = server(serde_json::json!({
            "name": "survival",
            "type": "vanilla",
            "start_command": {
                "jar": "/srv/survival/server.jar",
                "ram": { "min": "512M", "max": "2G" }
            },
            "flags": "-o true"
        }));
        assert_eq!(
            server.command_line(),
            "java -Xms512M -Xmx2G -jar /srv/survival/server.jar nogui -o true"
        );
        assert_eq!(server.working_dir(), PathBuf::from("/srv/survival"));
    }

    #[test]
    #[timeout(30000)]
    fn bungeecord_command_line() {
        let server = server(serde_json::json!({
            "name": "hub",
            "type": "bungeecord",
            "start_command": {
                "jar": "/srv/hub/bungee.jar",
                "directory": "/var/lib/hub"
            }
        }));
        assert_eq!(server.command_line(), "java -jar /srv/hub/bungee.jar");
        assert_eq!(server.working_dir(), PathBuf::from("/var/lib/hub"));
        assert_eq!(server.entry.kind.stop_command(), "end");
    }

    #[test]
    #[timeout(30000)]
    fn stop_requires_started() {
        let server = server(serde_json::json!({
            "name": "survival",
            "type": "vanilla",
            "start_command": { "jar": "/srv/survival/server.jar" }
        }));
        assert_eq!(server.status(), Status::Stopped);
        assert!(server.stop(None).is_err());
        assert!(server.command("say hi").is_err());
    }

    #[test]
    #[timeout(30000)]
    fn duplicate_names_rejected() {
        let entry: ServerEntry = serde_json::from_value(serde_json::json!({
            "name": "survival",
            "type": "vanilla",
            "start_command": { "jar": "/srv/survival/server.jar" }
        }))
        .expect("entry to parse");

        let result = ServerManager::new(
            vec![entry.clone(), entry],
            Arc::new(SessionManager::new(900)),
            time::Duration::from_secs(5),
            Arc::new(Shutdown::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    #[timeout(30000)]
    fn range_resolution() {
        // (len, start, stop) -> expected
        let cases: Vec<((usize, i64, i64), Option<(usize, usize)>)> = vec![
            ((0, -1, -1), None),
            ((3, -1, -1), Some((2, 2))),
            ((3, 0, -1), Some((0, 2))),
            ((3, -10, -1), Some((0, 2))),
            ((3, 1, 1), Some((1, 1))),
            ((3, 1, 99), Some((1, 2))),
            ((3, 5, 9), None),
            ((3, 2, 1), None),
            ((3, -1, 0), None),
        ];

        for ((len, start, stop), want) in cases {
            assert_eq!(
                resolve_range(len, start, stop),
                want,
                "resolve_range({len}, {start}, {stop})"
            );
        }
    }

    #[test]
    #[timeout(30000)]
    fn batch_outcome_policy() {
        let mut outcome = BatchOutcome::default();
        assert!(!outcome.all_failed());

        outcome.attempted = 2;
        outcome.failures.push((String::from("hub"), String::from("boom")));
        assert!(!outcome.all_failed());

        outcome.failures.push((String::from("survival"), String::from("bang")));
        assert!(outcome.all_failed());
        assert_eq!(outcome.reason(), "hub: boom; survival: bang");
    }
}
