use std::time;

use anyhow::Context;
use ntest::timeout;
use serde_json::{json, Value};

mod support;

use support::daemon::{DaemonArgs, Proc, ServerSpec};

fn reply_field<'v>(reply: &'v Value, key: &str) -> Option<&'v str> {
    reply.get(key).and_then(Value::as_str)
}

#[test]
#[timeout(30000)]
fn ping_round_trip() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs::default())?;

    let raw = daemon.raw_request(br#"{"status":"ping"}"#)?;
    assert_eq!(raw, br#"{"status":"pong"}"#);
    let reply: jarpool_protocol::Reply = serde_json::from_slice(&raw).context("parsing pong")?;
    assert_eq!(reply, jarpool_protocol::Reply::Pong);

    Ok(())
}

#[test]
#[timeout(30000)]
fn session_lifecycle() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs::default())?;

    let sid = daemon.open_session()?;
    assert_eq!(sid.len(), 36);

    let reply = daemon.request(&json!({ "status": "remove_session", "sid": sid }))?;
    assert_eq!(reply_field(&reply, "status"), Some("ok"));

    // the sid stops validating the moment it is removed
    let reply = daemon.request(&json!({ "status": "status", "sid": sid }))?;
    assert_eq!(reply_field(&reply, "status"), Some("failed"));
    assert_eq!(reply_field(&reply, "reason"), Some("Invalid SID"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn sessions_are_unique() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs::default())?;

    let first = daemon.open_session()?;
    let second = daemon.open_session()?;
    assert_ne!(first, second);

    Ok(())
}

#[test]
#[timeout(30000)]
fn missing_status_code() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs::default())?;

    let reply = daemon.request(&json!({ "sid": "whatever" }))?;
    assert_eq!(reply_field(&reply, "status"), Some("invalid_request"));
    assert_eq!(reply_field(&reply, "reason"), Some("Status code not found"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn unknown_status_code() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs::default())?;

    let reply = daemon.request(&json!({ "status": "frobnicate" }))?;
    assert_eq!(reply_field(&reply, "status"), Some("invalid_request"));
    assert_eq!(reply_field(&reply, "reason"), Some("Invalid status code"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn invalid_json() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs::default())?;

    let raw = daemon.raw_request(b"this is not json")?;
    let reply: Value = serde_json::from_slice(&raw).context("parsing reply")?;
    assert_eq!(reply_field(&reply, "status"), Some("invalid_request"));
    assert!(reply_field(&reply, "reason").unwrap_or_default().starts_with("Invalid JSON"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn oversize_frame_rejected() -> anyhow::Result<()> {
    use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
    use std::io::Read as _;
    use std::net::TcpStream;

    let daemon = Proc::new(DaemonArgs::default())?;

    // announce a 2 MiB payload but never send it
    let mut stream = TcpStream::connect(("127.0.0.1", daemon.port))?;
    stream.write_u32::<LittleEndian>(2 * 1024 * 1024)?;

    let len = stream.read_u32::<LittleEndian>()?;
    let mut buf = vec![0; len as usize];
    stream.read_exact(&mut buf)?;
    let reply: Value = serde_json::from_slice(&buf)?;
    assert_eq!(reply_field(&reply, "status"), Some("invalid_request"));
    assert!(reply_field(&reply, "reason").unwrap_or_default().contains("exceeds size limit"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn gated_requests_need_a_sid() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs::default())?;

    let reply = daemon.request(&json!({ "status": "start_server", "server": "survival" }))?;
    assert_eq!(reply_field(&reply, "status"), Some("failed"));
    assert_eq!(reply_field(&reply, "reason"), Some("SID not provided"));

    let reply = daemon.request(&json!({
        "status": "start_server",
        "server": "survival",
        "sid": "00000000-0000-0000-0000-000000000000",
    }))?;
    assert_eq!(reply_field(&reply, "status"), Some("failed"));
    assert_eq!(reply_field(&reply, "reason"), Some("Invalid SID"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn start_unknown_server() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs::default())?;
    let sid = daemon.open_session()?;

    let reply =
        daemon.request(&json!({ "status": "start_server", "server": "nope", "sid": sid }))?;
    assert_eq!(reply_field(&reply, "status"), Some("failed"));
    assert_eq!(reply_field(&reply, "reason"), Some("Server nope does not exist"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn command_without_focus() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs::default())?;
    let sid = daemon.open_session()?;

    let reply = daemon.request(&json!({ "status": "command", "command": "say hi", "sid": sid }))?;
    assert_eq!(reply_field(&reply, "status"), Some("failed"));
    assert_eq!(reply_field(&reply, "reason"), Some("Please specify a valid server"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn change_focus_to_unknown_server() -> anyhow::Result<()> {
    let daemon =
        Proc::new(DaemonArgs { servers: vec![ServerSpec::vanilla("survival")], ..Default::default() })?;
    let sid = daemon.open_session()?;

    let reply =
        daemon.request(&json!({ "status": "change_focus", "server": "nope", "sid": sid }))?;
    assert_eq!(reply_field(&reply, "status"), Some("failed"));
    assert_eq!(reply_field(&reply, "reason"), Some("Unknown server: nope"));

    let reply =
        daemon.request(&json!({ "status": "change_focus", "server": "survival", "sid": sid }))?;
    assert_eq!(reply_field(&reply, "status"), Some("ok"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn expired_sessions_stop_validating() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs { session_ttl: 1, ..Default::default() })?;
    let sid = daemon.open_session()?;

    std::thread::sleep(time::Duration::from_secs(2));

    let reply = daemon.request(&json!({ "status": "status", "sid": sid }))?;
    assert_eq!(reply_field(&reply, "status"), Some("failed"));
    assert_eq!(reply_field(&reply, "reason"), Some("Invalid SID"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn touches_keep_a_session_alive() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs { session_ttl: 2, ..Default::default() })?;
    let sid = daemon.open_session()?;

    // keep pinging under the ttl; the pre-handler touch should
    // keep the session fresh well past its original window
    for _ in 0..4 {
        std::thread::sleep(time::Duration::from_millis(900));
        let reply = daemon.request(&json!({ "status": "status", "sid": sid }))?;
        assert_eq!(reply_field(&reply, "status"), Some("status_response"));
    }

    Ok(())
}

#[test]
#[timeout(30000)]
fn status_reports_configured_servers() -> anyhow::Result<()> {
    let daemon = Proc::new(DaemonArgs {
        servers: vec![ServerSpec::vanilla("survival"), ServerSpec::bungeecord("hub")],
        ..Default::default()
    })?;
    let sid = daemon.open_session()?;

    let reply = daemon.request(&json!({ "status": "status", "sid": sid }))?;
    assert_eq!(reply_field(&reply, "status"), Some("status_response"));
    assert_eq!(
        reply.pointer("/servers/survival/status").and_then(Value::as_str),
        Some("STOPPED")
    );
    assert_eq!(reply.pointer("/servers/hub/status").and_then(Value::as_str), Some("STOPPED"));
    // stopped servers report no timing or memory details
    assert!(reply.pointer("/servers/survival/started_at").is_none());

    Ok(())
}
