//! On-connect and on-disconnect hook scripts
//!
//! Optional operator-supplied executables, run as `bash <script>` with
//! the tunnel's parameters in the environment. Invocation is
//! fire-and-forget: a detached task reaps the child and logs its exit
//! status, which is never propagated.

use std::path::Path;

use tokio::process::Command;

use tr_core::paths;
use tr_core::types::Host;

pub fn on_connect(host: &Host) {
    run_hook(Path::new(paths::ON_CONNECT_HOOK), host);
}

pub fn on_disconnect(host: &Host) {
    run_hook(Path::new(paths::ON_DISCONNECT_HOOK), host);
}

pub fn run_hook(script: &Path, host: &Host) {
    if !script.exists() {
        return;
    }

    let mut command = Command::new("bash");
    command
        .arg(script)
        .env("INSTANCE", host.config.instance.to_string())
        .env("LABEL", &host.config.label)
        .env("REMOTEHOST", &host.remote_ip)
        .env("REMOTEPORT", host.config.port.to_string())
        .env("LOCALHOST", "127.0.0.1")
        .env("LOCALPORT", host.listen_port.to_string())
        // legacy names
        .env("REMOTEIP", &host.remote_ip)
        .env("LOCALIP", "127.0.0.1");

    match command.spawn() {
        Ok(mut child) => {
            let script = script.to_path_buf();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => tracing::debug!("hook {:?} exited with {}", script, status),
                    Err(e) => tracing::warn!("hook {:?} failed: {}", script, e),
                }
            });
        }
        Err(e) => tracing::warn!("spawning hook {:?} failed: {}", script, e),
    }
}
