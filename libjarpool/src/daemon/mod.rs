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
    net::TcpListener,
    os::fd::AsRawFd as _,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time,
};

use anyhow::Context;
use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn};
use tracing::{info, instrument, warn};

use crate::{config, consts};

mod output;
mod server;
pub mod sessions;
mod signals;
pub mod supervisor;
mod usage;

/// Process-wide shutdown switch.
///
/// Periodic tasks subscribe to the channel (which closes on
/// shutdown, waking their `recv_timeout`/`select` sleeps), the
/// accept loop checks the flag, and the registered listening
/// socket gets a `shutdown(2)` so a blocked `accept` returns.
pub struct Shutdown {
    flag: AtomicBool,
    tx: Mutex<Option<crossbeam_channel::Sender<()>>>,
    rx: crossbeam_channel::Receiver<()>,
    listener_fd: Mutex<Option<std::os::fd::RawFd>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Shutdown {
            flag: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            rx,
            listener_fd: Mutex::new(None),
        }
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// A receiver that disconnects once shutdown begins.
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<()> {
        self.rx.clone()
    }

    fn register_listener(&self, fd: std::os::fd::RawFd) {
        *self.listener_fd.lock().unwrap() = Some(fd);
    }

    pub fn set(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        // closing the channel wakes every subscribed sleeper
        self.tx.lock().unwrap().take();
        if let Some(fd) = *self.listener_fd.lock().unwrap() {
            if let Err(e) = socket::shutdown(fd, socket::Shutdown::Both) {
                warn!("shutting down listener socket: {}", e);
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

#[instrument(skip_all)]
pub fn run(config: config::Config) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    let port = config.u64_of("networking.port", consts::DEFAULT_PORT as u64) as u16;
    let ttl = config.u64_of("sessions.expiration.time", consts::DEFAULT_SESSION_TTL_SECS);
    let check_every =
        config.u64_of("sessions.expiration.check_every", consts::DEFAULT_SESSION_SWEEP_SECS);
    let sample_every = config
        .u64_of("servers.update_usage_informations_every", consts::DEFAULT_USAGE_INTERVAL_SECS);

    let shutdown = Arc::new(Shutdown::new());
    let sessions = Arc::new(sessions::SessionManager::new(ttl));
    let servers = Arc::new(supervisor::ServerManager::new(
        config.server_entries()?,
        Arc::clone(&sessions),
        time::Duration::from_secs(sample_every),
        Arc::clone(&shutdown),
    )?);

    let server = server::Server::new(Arc::clone(&servers), Arc::clone(&sessions), Arc::clone(&shutdown));
    let listener = bind_listener(port)?;
    shutdown.register_listener(listener.as_raw_fd());

    // spawn the signal handler thread in the background
    signals::Handler::new(Arc::clone(&shutdown)).spawn()?;

    let reaper = sessions::spawn_reaper(
        Arc::clone(&sessions),
        time::Duration::from_secs(check_every),
        shutdown.subscribe(),
    );

    server::Server::serve(server, listener)?;

    // Ordered shutdown: the accept loop has stopped, now drain the
    // children and wind down the periodic tasks.
    shutdown.set();
    let outcome = servers.stop_all(None);
    if !outcome.failures.is_empty() {
        warn!("stopping servers on shutdown: {}", outcome.reason());
    }
    if !servers.await_all_stopped(consts::SHUTDOWN_DRAIN_TIMEOUT) {
        warn!("some children did not exit before the drain timeout");
    }
    if reaper.join().is_err() {
        warn!("session reaper panicked");
    }

    info!("bye!");
    Ok(())
}

/// Bind the listening socket on loopback with address reuse
/// enabled, so quick daemon restarts don't trip over TIME_WAIT.
fn bind_listener(port: u16) -> anyhow::Result<TcpListener> {
    let sock = socket::socket(AddressFamily::Inet, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .context("creating listener socket")?;
    socket::setsockopt(&sock, sockopt::ReuseAddr, &true).context("setting SO_REUSEADDR")?;

    let addr = SockaddrIn::new(127, 0, 0, 1, port);
    socket::bind(sock.as_raw_fd(), &addr).with_context(|| format!("binding port {port}"))?;
    socket::listen(&sock, Backlog::new(16).context("building backlog")?).context("listening")?;
    info!("bound port {}", port);

    Ok(TcpListener::from(sock))
}
