pub mod daemon;

use std::{path::PathBuf, thread, time};

pub fn jarpool_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_jarpool"))
}

/// Poll the given probe until it reports true or the timeout
/// passes. Most daemon-side effects (child output, state
/// transitions) land asynchronously, so tests observe them by
/// polling.
pub fn wait_until<F>(timeout: time::Duration, mut probe: F) -> anyhow::Result<()>
where
    F: FnMut() -> anyhow::Result<bool>,
{
    let deadline = time::Instant::now() + timeout;
    loop {
        if probe()? {
            return Ok(());
        }
        if time::Instant::now() > deadline {
            return Err(anyhow::anyhow!("timed out waiting for condition"));
        }
        thread::sleep(time::Duration::from_millis(50));
    }
}
