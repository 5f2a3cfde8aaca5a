//! trafficrouter: route local TCP traffic across SSH reverse-tunnel
//! endpoints
//!
//! Two entry forms share this binary: the long-running router
//! (`trafficrouter -uid <uid> --require <req> ...`) and the per-tunnel
//! ForceCommand helper (`trafficrouter -f <json>`) that sshd runs for
//! every reverse tunnel.

use std::ffi::OsString;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tr_core::{paths, provision};
use tr_router::router::Router;
use tr_router::service::ServiceSpec;

#[derive(Parser)]
#[command(name = "trafficrouter")]
#[command(about = "Reverse-tunnel traffic router")]
#[command(version)]
struct Args {
    /// Uid tag helpers use to locate this router; give it before
    /// --require so the discovery match sees trailing arguments
    #[arg(long, value_name = "UID")]
    uid: Option<u32>,

    /// Service requirement rhost:rport[@lhost[:lspec]]; repeatable
    #[arg(long = "require", value_name = "REQ")]
    require: Vec<String>,

    /// Password assigned to provisioned service accounts
    #[arg(long, value_name = "PASSWD")]
    passwd: Option<String>,

    /// ForceCommand form: the trailing JSON client config
    #[arg(short = 'f', value_name = "JSON", conflicts_with_all = ["uid", "require"])]
    forcecmd: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_from(normalized_args());

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(config) = &args.forcecmd {
        return tr_forcecmd::run(config).await;
    }

    let Some(uid) = args.uid else {
        bail!("router mode requires -uid <uid>");
    };
    if args.require.is_empty() {
        bail!("router mode requires at least one --require option");
    }

    // parse every option up front so a bad one aborts before any
    // provisioning happens
    let mut specs = Vec::with_capacity(args.require.len());
    for opt in &args.require {
        specs.push(ServiceSpec::parse(opt)?);
    }

    tracing::info!(uid, "trafficrouter starting");

    let router = Router::new(
        paths::rendezvous_socket(std::process::id()),
        Some(Box::new(|| {
            tracing::info!("all required services connected");
        })),
    );

    for spec in specs {
        let account = spec.name();
        let account_uid = provision::ensure_user(account.as_str(), args.passwd.as_deref())
            .with_context(|| format!("provisioning account for {}", account))?;
        if let Err(e) = provision::ensure_match_block(Path::new(paths::SSHD_CONFIG), account.as_str())
        {
            tracing::warn!("sshd config for {} not updated: {:#}", account, e);
        }
        tracing::info!(service = %account, uid = account_uid, "service configured");
        router.add_service(spec, account_uid)?;
    }
    router.seal();

    let cancel = router.cancel_token();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
            _ = terminate => tracing::info!("received SIGTERM, shutting down"),
        }
        cancel.cancel();
    });

    router.run().await
}

/// Accept the documented single-dash `-uid` alongside clap's `--uid`;
/// the single-dash form is what helper discovery matches on.
fn normalized_args() -> Vec<OsString> {
    std::env::args_os()
        .map(|arg| {
            if arg == "-uid" {
                OsString::from("--uid")
            } else {
                arg
            }
        })
        .collect()
}
