use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    time::Duration,
};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use ureq::{Agent, AgentBuilder};

pub fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {msg} {human_pos}/{human_len} {percent}% ({per_sec})")
        .expect("hardcoded")
}

pub fn progress_bar(len: u64, msg: &'static str) -> ProgressBar {
    ProgressBar::new(len)
        .with_style(progress_style())
        .with_message(msg)
}

pub fn agent(timeout: Duration) -> Agent {
    AgentBuilder::new()
        .timeout(timeout)
        .user_agent(concat!("doorstep/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Line reader over a plain or `.zst` compressed file.
pub fn open_lines(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    if path.extension().is_some_and(|x| x == "zst") {
        Ok(Box::new(BufReader::new(zstd::Decoder::new(file)?)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// `MAIN ST` -> `Main St`. Leaves mixed-case input alone.
pub fn title_case(s: &str) -> String {
    if s.chars().any(|x| x.is_lowercase()) {
        return s.to_string();
    }

    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|x| x.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
