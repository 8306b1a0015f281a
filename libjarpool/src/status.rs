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

use anyhow::anyhow;
use chrono::{Local, TimeZone};
use jarpool_protocol::{Reply, Request};

use crate::protocol::Client;

pub fn run(client: &Client) -> anyhow::Result<()> {
    let sid = client.open_session()?;
    let servers = match client.request(&Request::Status { sid })? {
        Reply::StatusResponse { servers } => servers,
        Reply::Failed { reason } => return Err(anyhow!("{}", reason)),
        other => return Err(anyhow!("unexpected reply to status: {:?}", other)),
    };

    println!("{:<15} {:<10} {:<16} {:<8} {}", "NAME", "STATUS", "STARTED AT", "RAM", "UPTIME");
    let mut names: Vec<&String> = servers.keys().collect();
    names.sort();
    for name in names {
        let details = &servers[name];
        match (details.started_at, details.uptime) {
            (Some(started_at), Some(uptime)) => {
                let started = Local
                    .timestamp_opt(started_at as i64, 0)
                    .single()
                    .map(|dt| dt.format("%d/%m/%y %H:%M").to_string())
                    .unwrap_or_else(|| String::from("-"));
                let ram = format!("{:.2}%", details.ram_used.unwrap_or(0.0));
                println!(
                    "{:<15} {:<10} {:<16} {:<8} {}",
                    name,
                    details.status,
                    started,
                    ram,
                    human_duration(uptime)
                );
            }
            _ => {
                println!("{:<15} {:<10} {:<16} {:<8} -", name, details.status, "-", "-");
            }
        }
    }

    Ok(())
}

/// 100 seconds -> "1m 40s"
fn human_duration(mut seconds: u64) -> String {
    let units = [(24 * 60 * 60, "d"), (60 * 60, "h"), (60, "m"), (1, "s")];
    let mut parts = vec![];
    for (unit, suffix) in units {
        if seconds >= unit {
            parts.push(format!("{}{}", seconds / unit, suffix));
            seconds %= unit;
        }
    }
    if parts.is_empty() {
        return String::from("0s");
    }
    parts.join(" ")
}
