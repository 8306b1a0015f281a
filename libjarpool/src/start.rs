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

use jarpool_protocol::Request;

use crate::protocol::{expect_ok, Client};

pub fn run(client: &Client, name: &str) -> anyhow::Result<()> {
    let sid = client.open_session()?;
    expect_ok(client.request(&Request::StartServer { sid, server: String::from(name) })?)?;
    println!("Server {name} is starting");
    Ok(())
}

pub fn run_all(client: &Client) -> anyhow::Result<()> {
    let sid = client.open_session()?;
    expect_ok(client.request(&Request::StartAllServers { sid })?)?;
    println!("Started every eligible server");
    Ok(())
}
