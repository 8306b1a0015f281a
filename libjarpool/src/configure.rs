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

use std::{fs, path::Path};

use anyhow::{anyhow, Context};

const STARTER_CONFIG: &str = r#"{
    "networking": {
        "port": 45342
    },
    "logging": {
        "level": "info"
    },
    "sessions": {
        "expiration": {
            "time": 900,
            "check_every": 60
        }
    },
    "servers": {
        "update_usage_informations_every": 5
    },
    "available_servers": []
}
"#;

/// Write a starter configuration file, refusing to clobber one
/// that already exists.
pub fn run(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        return Err(anyhow!("a file already exists at {}", path.display()));
    }
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
    }
    fs::write(path, STARTER_CONFIG).with_context(|| format!("writing {}", path.display()))?;
    println!("The jarpool configuration file is now at {}", path.display());
    Ok(())
}
