//! Ctrl+C handling for the binary.
//!
//! The first Ctrl+C cancels the running execution through its token. A
//! second one exits immediately.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static TOKEN: OnceLock<CancellationToken> = OnceLock::new();

#[derive(Debug)]
pub struct InterruptedError;

impl std::fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

/// Installs the Ctrl+C handler.
pub fn init() -> Result<()> {
    ctrlc::set_handler(trigger_ctrl_c).context("set Ctrl+C handler")
}

/// Token cancelled by the first Ctrl+C.
pub fn token() -> CancellationToken {
    TOKEN.get_or_init(CancellationToken::new).clone()
}

fn trigger_ctrl_c() {
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        std::process::exit(130);
    }
    token().cancel();
}
