//! Service-account and sshd provisioning
//!
//! Each logical service maps to one OS account whose SSH sessions are
//! forced through the helper. Provisioning shells out to the system
//! tools and is idempotent: existing accounts and existing sshd blocks
//! are left alone.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

/// sshd directives applied to every provisioned service account.
const MATCH_BLOCK: &str = r#"
Match User {user}
    AllowTCPForwarding yes
    X11Forwarding no
    AllowAgentForwarding no
    PermitTTY yes
    AcceptEnv SSH_RFWD
    GatewayPorts clientspecified
    ForceCommand /usr/local/bin/trafficrouter -f $SSH_ORIGINAL_COMMAND
"#;

/// Render the `Match User` block for one account.
pub fn match_block(user: &str) -> String {
    MATCH_BLOCK.replace("{user}", user)
}

/// Append the `Match User` block for `user` to the sshd configuration
/// unless one is already present.
pub fn ensure_match_block(sshd_config: &Path, user: &str) -> Result<()> {
    let mut config = fs::read_to_string(sshd_config)
        .with_context(|| format!("reading {:?}", sshd_config))?;

    if config.contains(&format!("Match User {user}")) {
        return Ok(());
    }

    config.push_str(&match_block(user));
    fs::write(sshd_config, config).with_context(|| format!("updating {:?}", sshd_config))?;
    tracing::info!(user, "sshd match block installed");
    Ok(())
}

/// Create the service account if it does not exist and return its uid.
pub fn ensure_user(name: &str, passwd: Option<&str>) -> Result<u32> {
    if let Some(uid) = lookup_uid(name)? {
        return Ok(uid);
    }

    let status = Command::new("useradd")
        .args(["-m", "-s", "/bin/bash", name])
        .status()
        .context("running useradd")?;
    if !status.success() {
        bail!("useradd for {} failed with {}", name, status);
    }
    tracing::info!(user = name, "service account created");

    if let Some(passwd) = passwd {
        set_password(name, passwd)?;
    }

    lookup_uid(name)?.with_context(|| format!("account {} missing after useradd", name))
}

/// Resolve an account's uid via `id -u`; `None` when the account does
/// not exist.
pub fn lookup_uid(name: &str) -> Result<Option<u32>> {
    let output = Command::new("id")
        .args(["-u", name])
        .output()
        .context("running id")?;
    if !output.status.success() {
        return Ok(None);
    }
    let uid = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u32>()
        .context("parsing id output")?;
    Ok(Some(uid))
}

fn set_password(name: &str, passwd: &str) -> Result<()> {
    let mut child = Command::new("chpasswd")
        .stdin(Stdio::piped())
        .spawn()
        .context("running chpasswd")?;
    if let Some(stdin) = child.stdin.as_mut() {
        writeln!(stdin, "{name}:{passwd}").context("writing to chpasswd")?;
    }
    let status = child.wait().context("waiting for chpasswd")?;
    if !status.success() {
        bail!("chpasswd for {} failed with {}", name, status);
    }
    Ok(())
}
