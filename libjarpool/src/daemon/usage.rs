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

//! Memory usage sampling for running children, straight from the
//! proc filesystem. Values are read fresh on every tick with no
//! smoothing.

use std::{
    fs,
    io::{BufRead, BufReader},
};

use anyhow::{anyhow, Context};

/// The share of the whole system's memory held by the given pid,
/// as a 0-100 percentage. Sums the VmRSS and VmPSS lines of
/// /proc/<pid>/status against MemTotal from /proc/meminfo.
pub fn ram_percent(pid: u32) -> anyhow::Result<f64> {
    let status = fs::File::open(format!("/proc/{pid}/status"))
        .with_context(|| format!("opening /proc/{pid}/status"))?;
    let used_kb = parse_vm_usage(BufReader::new(status))
        .with_context(|| format!("parsing /proc/{pid}/status"))?;

    let meminfo = fs::File::open("/proc/meminfo").context("opening /proc/meminfo")?;
    let total_kb =
        parse_mem_total(BufReader::new(meminfo)).context("parsing /proc/meminfo")?;

    Ok((used_kb as f64) * 100.0 / (total_kb as f64))
}

/// Sum of the VmRSS and VmPSS fields, in kB. Fields the kernel
/// does not report (VmPSS needs CONFIG_PROC_PAGE_MONITOR) just
/// don't contribute.
fn parse_vm_usage<R: BufRead>(r: R) -> anyhow::Result<u64> {
    let mut sum = 0;
    for line in r.lines() {
        let line = line.context("reading status line")?;
        let (key, value) = match line.split_once(':') {
            Some(parts) => parts,
            None => continue,
        };
        if matches!(key.trim(), "VmRSS" | "VmPSS") {
            sum += parse_kb(value)?;
        }
    }
    Ok(sum)
}

fn parse_mem_total<R: BufRead>(r: R) -> anyhow::Result<u64> {
    for line in r.lines() {
        let line = line.context("reading meminfo line")?;
        if let Some((key, value)) = line.split_once(':') {
            if key.trim() == "MemTotal" {
                let total = parse_kb(value)?;
                if total == 0 {
                    return Err(anyhow!("MemTotal is zero"));
                }
                return Ok(total);
            }
        }
    }
    Err(anyhow!("no MemTotal line"))
}

fn parse_kb(value: &str) -> anyhow::Result<u64> {
    let digits = value.trim().trim_end_matches("kB").trim();
    digits.parse().with_context(|| format!("parsing kB value {value:?}"))
}
