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
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use serde_derive::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

/// A read-only table of configuration entries keyed by dotted
/// paths.
///
/// Nested objects in the source files are flattened so that
/// `{"a": {"b": {"c": 1}}}` can be read as `a.b.c`. Arrays and
/// scalars sit at the leaves unflattened. Files merge in load
/// order: arrays concatenate when both sides are arrays, anything
/// else overwrites. An `include` list at the root of a file is
/// loaded first, so the including file's own entries win.
#[derive(Debug, Default, Clone)]
pub struct Config {
    entries: BTreeMap<String, Value>,
}

#[instrument(skip_all)]
pub fn read_config(config_file: &Path) -> anyhow::Result<Config> {
    info!("parsing config ({})", config_file.display());
    let entries = load_file(config_file)
        .with_context(|| format!("loading config file {}", config_file.display()))?;
    Ok(Config { entries })
}

fn load_file(path: &Path) -> anyhow::Result<BTreeMap<String, Value>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    let root = match parsed {
        Value::Object(map) => map,
        _ => return Err(anyhow!("{}: top level must be an object", path.display())),
    };

    let mut entries = BTreeMap::new();

    // Includes load before the rest of the file so the file's own
    // entries override what it pulled in. Relative include paths
    // resolve against the including file.
    if let Some(includes) = root.get("include") {
        let includes = includes
            .as_array()
            .ok_or_else(|| anyhow!("{}: include must be a list", path.display()))?;
        for include in includes {
            let include = include
                .as_str()
                .ok_or_else(|| anyhow!("{}: include entries must be strings", path.display()))?;
            let mut include_path = PathBuf::from(include);
            if include_path.is_relative() {
                if let Some(dir) = path.parent() {
                    include_path = dir.join(include_path);
                }
            }
            let included = load_file(&include_path)
                .with_context(|| format!("including {}", include_path.display()))?;
            merge_entries(&mut entries, included);
        }
    }

    let mut own = BTreeMap::new();
    for (key, value) in root {
        if key == "include" {
            continue;
        }
        flatten(&key, value, &mut own);
    }
    merge_entries(&mut entries, own);

    Ok(entries)
}

fn flatten(prefix: &str, value: Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                flatten(&format!("{prefix}.{key}"), value, out);
            }
        }
        other => {
            out.insert(String::from(prefix), other);
        }
    }
}

fn merge_entries(old: &mut BTreeMap<String, Value>, new: BTreeMap<String, Value>) {
    for (key, value) in new {
        match (old.get_mut(&key), value) {
            (Some(Value::Array(existing)), Value::Array(mut incoming)) => {
                existing.append(&mut incoming);
            }
            (_, value) => {
                old.insert(key, value);
            }
        }
    }
}

impl Config {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn str_of(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    pub fn u64_of(&self, key: &str, default: u64) -> u64 {
        self.entries.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    /// The server descriptors under `available_servers`.
    pub fn server_entries(&self) -> anyhow::Result<Vec<ServerEntry>> {
        let raw = match self.entries.get("available_servers") {
            Some(raw) => raw.clone(),
            None => return Ok(vec![]),
        };
        let entries: Vec<ServerEntry> =
            serde_json::from_value(raw).context("parsing available_servers")?;
        Ok(entries)
    }

    #[cfg(test)]
    fn from_entries(entries: BTreeMap<String, Value>) -> Self {
        Config { entries }
    }
}

/// One entry of `available_servers`.
#[derive(Deserialize, Debug, Clone)]
pub struct ServerEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub start_command: StartCommand,
    /// Extra flags appended verbatim to the java invocation.
    #[serde(default)]
    pub flags: Option<String>,
    /// Broadcast to players right before the stop command.
    #[serde(default)]
    pub stop_message: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Vanilla,
    Bukkit,
    Spigot,
    Bungeecord,
}

impl ServerKind {
    /// Vanilla servers pop a swing window unless told otherwise.
    pub fn wants_nogui(&self) -> bool {
        matches!(self, ServerKind::Vanilla)
    }

    /// The console command that asks this kind of server to shut
    /// itself down.
    pub fn stop_command(&self) -> &'static str {
        match self {
            ServerKind::Vanilla | ServerKind::Bukkit | ServerKind::Spigot => "stop",
            ServerKind::Bungeecord => "end",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct StartCommand {
    pub jar: PathBuf,
    #[serde(default)]
    pub ram: RamLimits,
    /// Working directory for the child. Defaults to the jar's
    /// parent directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct RamLimits {
    pub min: Option<String>,
    pub max: Option<String>,
}
