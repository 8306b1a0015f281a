use std::{
    env, fs,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    os::unix::fs::PermissionsExt as _,
    path::PathBuf,
    process,
    process::{Command, Stdio},
    thread, time,
};

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use serde_json::{json, Value};
use tempfile::TempDir;

use super::jarpool_bin;

/// A stand-in for the real jvm. Announces itself, echoes console
/// commands back on stdout, and exits when asked to stop.
const FAKE_JAVA: &str = r#"#!/bin/sh
echo "jar booted"
while IFS= read -r line; do
    case "$line" in
        stop*) echo "saving world"; exit 0 ;;
        end*) exit 0 ;;
        *) echo "$line" ;;
    esac
done
exit 0
"#;

pub struct ServerSpec {
    pub name: String,
    pub kind: String,
}

impl ServerSpec {
    pub fn vanilla(name: &str) -> Self {
        ServerSpec { name: String::from(name), kind: String::from("vanilla") }
    }

    pub fn bungeecord(name: &str) -> Self {
        ServerSpec { name: String::from(name), kind: String::from("bungeecord") }
    }
}

pub struct DaemonArgs {
    pub servers: Vec<ServerSpec>,
    pub session_ttl: u64,
}

impl Default for DaemonArgs {
    fn default() -> Self {
        DaemonArgs { servers: vec![], session_ttl: 900 }
    }
}

/// Proc is a helper handle for a `jarpool execute` subprocess.
/// It kills the subprocess when it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    pub port: u16,
    pub log_file: PathBuf,
    _tmp_dir: TempDir,
}

impl Proc {
    pub fn new(args: DaemonArgs) -> anyhow::Result<Proc> {
        let tmp_dir = tempfile::Builder::new()
            .prefix("jarpool-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;
        let dir = tmp_dir.path().to_path_buf();

        // a fake `java` takes precedence on the daemon's PATH
        let bin_dir = dir.join("bin");
        fs::create_dir(&bin_dir).context("creating bin dir")?;
        let java = bin_dir.join("java");
        fs::write(&java, FAKE_JAVA).context("writing fake java")?;
        fs::set_permissions(&java, fs::Permissions::from_mode(0o755))
            .context("marking fake java executable")?;

        let mut entries = vec![];
        for spec in &args.servers {
            let server_dir = dir.join(&spec.name);
            fs::create_dir(&server_dir).context("creating server dir")?;
            let jar = server_dir.join("server.jar");
            fs::write(&jar, b"").context("writing placeholder jar")?;
            entries.push(json!({
                "name": spec.name,
                "type": spec.kind,
                "start_command": { "jar": jar },
            }));
        }

        let port = free_port()?;
        let config = json!({
            "networking": { "port": port },
            "logging": { "level": "debug" },
            "sessions": { "expiration": { "time": args.session_ttl, "check_every": 1 } },
            "servers": { "update_usage_informations_every": 1 },
            "available_servers": entries,
        });
        let config_path = dir.join("jarpool.json");
        fs::write(&config_path, serde_json::to_vec_pretty(&config)?)
            .context("writing config")?;

        let log_file = dir.join("daemon.log");
        eprintln!("spawning daemon proc with log {:?}", &log_file);

        let path_env = match env::var("PATH") {
            Ok(path) => format!("{}:{}", bin_dir.display(), path),
            Err(_) => format!("{}", bin_dir.display()),
        };
        let proc = Command::new(jarpool_bin())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--configuration")
            .arg(&config_path)
            .arg("execute")
            .env("PATH", path_env)
            .spawn()
            .context("spawning daemon process")?;

        // spin until we can dial the port successfully
        let mut sleep_dur = time::Duration::from_millis(5);
        let mut dialable = false;
        for _ in 0..12 {
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                dialable = true;
                break;
            }
            thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
        if !dialable {
            let log = fs::read_to_string(&log_file).unwrap_or_default();
            return Err(anyhow!("daemon never came up, log:\n{}", log));
        }

        Ok(Proc { proc, port, log_file, _tmp_dir: tmp_dir })
    }

    /// One framed request, one framed reply, fresh connection.
    pub fn request(&self, request: &Value) -> anyhow::Result<Value> {
        let payload = serde_json::to_vec(request)?;
        let raw = self.raw_request(&payload)?;
        serde_json::from_slice(&raw).context("parsing reply")
    }

    /// Send arbitrary bytes as a frame and hand back the raw reply
    /// payload, for tests that pin down the framing itself.
    pub fn raw_request(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut stream =
            TcpStream::connect(("127.0.0.1", self.port)).context("dialing daemon")?;
        stream.write_u32::<LittleEndian>(payload.len() as u32)?;
        stream.write_all(payload)?;
        stream.flush()?;

        let len = stream.read_u32::<LittleEndian>().context("reading reply length")?;
        let mut buf = vec![0; len as usize];
        stream.read_exact(&mut buf).context("reading reply payload")?;
        Ok(buf)
    }

    pub fn open_session(&self) -> anyhow::Result<String> {
        let reply = self.request(&json!({ "status": "new_session" }))?;
        match (reply.get("status").and_then(Value::as_str), reply.get("sid")) {
            (Some("session_created"), Some(Value::String(sid))) => Ok(sid.clone()),
            _ => Err(anyhow!("unexpected new_session reply: {}", reply)),
        }
    }

    /// The status string the daemon currently reports for a server.
    pub fn server_status(&self, sid: &str, server: &str) -> anyhow::Result<String> {
        let reply = self.request(&json!({ "status": "status", "sid": sid }))?;
        reply
            .pointer(&format!("/servers/{server}/status"))
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| anyhow!("server {} missing from status reply: {}", server, reply))
    }

    /// Poll `status` until the server reports the wanted state.
    pub fn wait_for_status(
        &self,
        sid: &str,
        server: &str,
        want: &str,
        timeout: time::Duration,
    ) -> anyhow::Result<()> {
        super::wait_until(timeout, || Ok(self.server_status(sid, server)? == want))
    }

    /// Poll `retrieve_lines` until the server's history holds at
    /// least `count` lines, then return them in id order.
    pub fn wait_for_lines(
        &self,
        sid: &str,
        server: &str,
        count: usize,
        timeout: time::Duration,
    ) -> anyhow::Result<Vec<String>> {
        let mut lines = vec![];
        super::wait_until(timeout, || {
            let reply = self.request(&json!({
                "status": "retrieve_lines",
                "sid": sid,
                "server": server,
                "start": 0,
                "stop": -1,
            }))?;
            let map = reply
                .get("lines")
                .and_then(Value::as_object)
                .ok_or_else(|| anyhow!("no lines in reply: {}", reply))?;
            if map.len() < count {
                return Ok(false);
            }
            let mut ids: Vec<u64> = map.keys().map(|k| k.parse().unwrap_or(0)).collect();
            ids.sort_unstable();
            lines = ids
                .iter()
                .map(|id| {
                    map[&id.to_string()].as_str().map(String::from).unwrap_or_default()
                })
                .collect();
            Ok(true)
        })?;
        Ok(lines)
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if let Err(e) = self.proc.kill() {
            eprintln!("killing daemon proc: {:?}", e);
        }
        let _ = self.proc.wait();
    }
}

/// Grab an ephemeral port by binding and immediately releasing it.
/// The daemon sets SO_REUSEADDR so rebinding right after is fine.
fn free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("probing for a free port")?;
    Ok(listener.local_addr().context("resolving probe addr")?.port())
}
