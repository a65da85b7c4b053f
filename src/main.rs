//! macvlan CNI plugin binary
//!
//! Invoked by the container runtime with `CNI_*` environment variables and
//! the network configuration on stdin. Logs go to stderr; stdout carries
//! only the protocol answer.

use anyhow::{anyhow, Result};
use clap::Parser;
use macvlan_cni::skel::{self, Invocation};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {e}"))
}

fn main() -> ExitCode {
    let invocation = Invocation::parse();

    if let Err(e) = init_tracing(invocation.verbose) {
        eprintln!("{e:#}");
    }

    skel::run(&invocation)
}
