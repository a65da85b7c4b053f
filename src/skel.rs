//! Plugin entry point
//!
//! Decodes the invocation from the `CNI_*` environment (or the equivalent
//! flags), reads the network configuration from stdin, runs the command on a
//! [`PinnedRuntime`] and writes the protocol answer to stdout.

use clap::Parser;
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{debug, error};

use crate::config::metadata_url;
use crate::error::{CniError, Result};
use crate::ipam::ExecIpam;
use crate::mac::MetadataClient;
use crate::plugin::{LinuxHost, Plugin};
use crate::runtime::PinnedRuntime;

/// Version reported when the configuration does not name one.
pub const LEGACY_VERSION: &str = "0.2.0";
pub const SUPPORTED_VERSIONS: [&str; 2] = ["0.1.0", "0.2.0"];

/// Command line of the plugin binary.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Macvlan CNI plugin", long_about = None)]
pub struct Invocation {
    /// ADD, DEL or VERSION
    #[arg(long, env = "CNI_COMMAND")]
    pub command: Option<String>,

    #[arg(long, env = "CNI_CONTAINERID")]
    pub container_id: Option<String>,

    /// Path of the container's network namespace; empty on DEL once the
    /// container is gone
    #[arg(long, env = "CNI_NETNS")]
    pub netns: Option<String>,

    /// Interface name inside the container
    #[arg(long, env = "CNI_IFNAME")]
    pub if_name: Option<String>,

    /// Extra `KEY=VALUE;...` arguments
    #[arg(long, env = "CNI_ARGS")]
    pub args: Option<String>,

    /// `:`-separated directories searched for the IPAM plugin
    #[arg(long, env = "CNI_PATH")]
    pub path: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Add,
    Del,
    Version,
}

impl FromStr for Verb {
    type Err = CniError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ADD" => Ok(Verb::Add),
            "DEL" => Ok(Verb::Del),
            "VERSION" => Ok(Verb::Version),
            "" => Err(CniError::InvalidEnvironment(
                "required env variable CNI_COMMAND missing".to_string(),
            )),
            other => Err(CniError::InvalidEnvironment(format!(
                "unknown CNI_COMMAND: {other}"
            ))),
        }
    }
}

/// Per-invocation parameters shared by ADD, DEL and the IPAM delegate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdArgs {
    pub container_id: String,
    /// `None` only for DEL, when the runtime no longer has a namespace.
    pub netns: Option<PathBuf>,
    pub if_name: String,
    pub args: String,
    pub path: String,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl Invocation {
    pub fn verb(&self) -> Result<Verb> {
        present(&self.command).unwrap_or_default().parse()
    }

    /// Validate the environment for `verb` and collect its parameters.
    pub fn cmd_args(&self, verb: Verb) -> Result<CmdArgs> {
        let netns = present(&self.netns).map(PathBuf::from);

        let mut missing = Vec::new();
        if present(&self.container_id).is_none() {
            missing.push("CNI_CONTAINERID");
        }
        if verb == Verb::Add && netns.is_none() {
            missing.push("CNI_NETNS");
        }
        if present(&self.if_name).is_none() {
            missing.push("CNI_IFNAME");
        }
        if present(&self.path).is_none() {
            missing.push("CNI_PATH");
        }
        if !missing.is_empty() {
            return Err(CniError::InvalidEnvironment(format!(
                "required env variables missing: {}",
                missing.join(", ")
            )));
        }

        Ok(CmdArgs {
            container_id: self.container_id.clone().unwrap_or_default(),
            netns,
            if_name: self.if_name.clone().unwrap_or_default(),
            args: self.args.clone().unwrap_or_default(),
            path: self.path.clone().unwrap_or_default(),
        })
    }
}

/// Answer to the VERSION command.
pub fn version_document() -> serde_json::Value {
    serde_json::json!({
        "cniVersion": LEGACY_VERSION,
        "supportedVersions": SUPPORTED_VERSIONS,
    })
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(rename = "cniVersion", default)]
    cni_version: Option<String>,
}

/// Version to put in an error document, read leniently from the config.
pub fn reported_version(config: &[u8]) -> String {
    serde_json::from_slice::<VersionProbe>(config)
        .ok()
        .and_then(|probe| probe.cni_version)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| LEGACY_VERSION.to_string())
}

/// Run one plugin invocation and write its answer to stdout.
pub fn run(invocation: &Invocation) -> ExitCode {
    let mut config = Vec::new();
    let outcome = invocation.verb().and_then(|verb| {
        if verb != Verb::Version {
            std::io::stdin().read_to_end(&mut config)?;
        }
        execute(verb, invocation, &config)
    });

    let mut stdout = std::io::stdout().lock();
    let written = match outcome {
        Ok(None) => return ExitCode::SUCCESS,
        Ok(Some(answer)) => writeln!(stdout, "{answer}").map(|()| ExitCode::SUCCESS),
        Err(e) => {
            error!("{}", e);
            let document = e.to_document(&reported_version(&config));
            serde_json::to_string(&document)
                .map_err(std::io::Error::from)
                .and_then(|text| writeln!(stdout, "{text}"))
                .map(|()| ExitCode::FAILURE)
        }
    };
    written.unwrap_or_else(|e| {
        error!("Failed to write to stdout: {}", e);
        ExitCode::FAILURE
    })
}

/// Run `verb`, returning the text to print on success, if any.
pub fn execute(verb: Verb, invocation: &Invocation, config: &[u8]) -> Result<Option<String>> {
    match verb {
        Verb::Version => Ok(Some(version_document().to_string())),
        Verb::Add => {
            let args = invocation.cmd_args(verb)?;
            debug!("ADD {:?}", args);
            let result = PinnedRuntime::new()?.run(async {
                linux_plugin()?.add(&args, config).await
            })?;
            Ok(Some(serde_json::to_string_pretty(&result)?))
        }
        Verb::Del => {
            let args = invocation.cmd_args(verb)?;
            debug!("DEL {:?}", args);
            PinnedRuntime::new()?.run(async { linux_plugin()?.del(&args, config).await })?;
            Ok(None)
        }
    }
}

fn linux_plugin() -> Result<Plugin<LinuxHost, ExecIpam, MetadataClient>> {
    let host = LinuxHost::connect()
        .map_err(|e| CniError::Io(std::io::Error::other(e.to_string())))?;
    Ok(Plugin::new(host, ExecIpam, MetadataClient::new(metadata_url())))
}
