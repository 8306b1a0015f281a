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

//! The output pipeline: one watcher thread per running child that
//! assembles lines from the merged stdout+stderr pipe and fans
//! them out, then drives the child-exited transition at EOF.

use std::{
    fs,
    io::{BufRead, BufReader},
    process,
    sync::Arc,
    thread,
};

use tracing::{error, span, Level};

use crate::daemon::supervisor::GameServer;

/// Spawn the watcher thread for a freshly started child. The
/// thread owns the read end of the output pipe and the child
/// handle; it runs until EOF and then resets the server's run
/// state, so it is the last task standing for this run.
pub fn spawn_watcher(
    server: Arc<GameServer>,
    child: process::Child,
    output: fs::File,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let _s = span!(Level::INFO, "output_watcher", s = %server.name()).entered();
        let mut reader = BufReader::new(output);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                // EOF: the child closed its side of the pipe.
                Ok(0) => break,
                Ok(_) => {
                    // An unterminated tail only happens right
                    // before EOF and is not a completed line.
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        server.on_line(&String::from_utf8_lossy(&buf));
                    }
                }
                Err(e) => {
                    error!("reading output of {}: {:?}", server.name(), e);
                    break;
                }
            }
        }

        server.on_child_exit(child);
    })
}
