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
use jarpool_protocol::{Reply, Request};

use crate::protocol::Client;

pub fn run(client: &Client) -> anyhow::Result<()> {
    match client.request(&Request::Ping)? {
        Reply::Pong => {
            println!("pong: the daemon is alive");
            Ok(())
        }
        other => Err(anyhow!("unexpected reply to ping: {:?}", other)),
    }
}
