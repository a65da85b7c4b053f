//! IPAM delegation
//!
//! Address allocation is delegated to a separate CNI plugin binary named by
//! `ipam.type`. It is looked up on `CNI_PATH`, fed the unmodified network
//! configuration on stdin, and answers with a result or error document on
//! stdout.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{CniError, ErrorDocument, Result};
use crate::skel::CmdArgs;
use crate::types::IpamResult;

/// Allocates and releases addresses for a container.
#[async_trait]
pub trait Ipam: Send + Sync {
    async fn add(&self, plugin: &str, args: &CmdArgs, config: &[u8]) -> Result<IpamResult>;

    async fn del(&self, plugin: &str, args: &CmdArgs, config: &[u8]) -> Result<()>;
}

/// Runs the IPAM plugin as a child process.
#[derive(Debug, Clone, Default)]
pub struct ExecIpam;

#[async_trait]
impl Ipam for ExecIpam {
    async fn add(&self, plugin: &str, args: &CmdArgs, config: &[u8]) -> Result<IpamResult> {
        let stdout = exec_plugin("ADD", plugin, args, config).await?;
        let result: IpamResult = serde_json::from_slice(&stdout)
            .map_err(|e| CniError::IpamFailed(format!("invalid result from {plugin}: {e}")))?;
        info!("IPAM plugin {} returned {:?}", plugin, result.ip4.as_ref().map(|ip4| ip4.ip));
        Ok(result)
    }

    async fn del(&self, plugin: &str, args: &CmdArgs, config: &[u8]) -> Result<()> {
        exec_plugin("DEL", plugin, args, config).await?;
        info!("IPAM plugin {} released addresses for {}", plugin, args.container_id);
        Ok(())
    }
}

/// Locate `plugin` in the `:`-separated `cni_path` directories.
pub fn find_plugin(plugin: &str, cni_path: &str) -> Result<PathBuf> {
    cni_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(plugin))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            CniError::IpamFailed(format!(
                "failed to find plugin {plugin:?} in path {cni_path:?}"
            ))
        })
}

async fn exec_plugin(
    command: &str,
    plugin: &str,
    args: &CmdArgs,
    config: &[u8],
) -> Result<Vec<u8>> {
    let path = find_plugin(plugin, &args.path)?;
    debug!("Executing IPAM plugin {} ({})", path.display(), command);

    let netns = args
        .netns
        .as_deref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut child = Command::new(&path)
        .env("CNI_COMMAND", command)
        .env("CNI_CONTAINERID", &args.container_id)
        .env("CNI_NETNS", netns)
        .env("CNI_IFNAME", &args.if_name)
        .env("CNI_ARGS", &args.args)
        .env("CNI_PATH", &args.path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CniError::IpamFailed(format!("failed to start {}: {e}", path.display())))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(config)
            .await
            .map_err(|e| CniError::IpamFailed(format!("failed to write config to {plugin}: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| CniError::IpamFailed(format!("failed to wait for {plugin}: {e}")))?;

    if !output.status.success() {
        return Err(CniError::IpamFailed(failure_message(
            plugin,
            &output.stdout,
            &output.stderr,
        )));
    }
    Ok(output.stdout)
}

/// Best description of a failed run: the plugin's error document if it
/// wrote one, otherwise whatever it printed.
fn failure_message(plugin: &str, stdout: &[u8], stderr: &[u8]) -> String {
    if let Ok(doc) = serde_json::from_slice::<ErrorDocument>(stdout) {
        return format!("{plugin}: {} (code {})", doc.msg, doc.code);
    }
    let text = if stderr.iter().all(u8::is_ascii_whitespace) {
        String::from_utf8_lossy(stdout)
    } else {
        String::from_utf8_lossy(stderr)
    };
    format!("{plugin}: {}", text.trim())
}
