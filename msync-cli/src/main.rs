use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use msync_core::{
    connect_session, FileWatcher, FramedReceiver, FramedSender, MountConfig, MountEndpoint,
    NativeFileAccess, NotifyFileWatcher, Server, SessionState,
};
use std::{fs, path::Path, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "msync", version, about = "msync – two-way directory mirror CLI")]
struct Cli {
    /// Path to config file (JSON / YAML) holding the mount list
    #[arg(short, long, default_value = "msync.yaml")]
    config: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept peers on an address and serve the configured mounts
    Serve {
        #[arg(long, default_value = "127.0.0.1:49200")]
        listen: String,
    },
    /// Connect to a serving peer and mirror one mount
    Connect {
        #[arg(long)]
        addr: String,
        /// Which configured mount to mirror
        #[arg(long)]
        mount: String,
    },
}

fn load_mounts(path: &str) -> Result<Vec<MountConfig>> {
    let text = fs::read_to_string(path).map_err(|e| anyhow!("read config {path} failed: {e}"))?;
    let ext = Path::new(path).extension().and_then(|s| s.to_str()).unwrap_or("");
    let mounts: Vec<MountConfig> = match ext {
        "json" => serde_json::from_str(&text)?,
        _ => serde_yaml::from_str(&text)?, // default to yaml
    };
    if mounts.is_empty() {
        return Err(anyhow!("no mounts defined in config"));
    }
    for mount in &mounts {
        mount.validate()?;
    }
    Ok(mounts)
}

fn endpoint_for(config: MountConfig) -> MountEndpoint {
    let root = config.mount_root.clone();
    MountEndpoint {
        fs: Arc::new(NativeFileAccess::new(root.clone())),
        watcher_factory: Arc::new(move |events| {
            Box::new(NotifyFileWatcher::new(root.clone(), events)) as Box<dyn FileWatcher>
        }),
        config,
    }
}

async fn serve(mounts: Vec<MountConfig>, listen: &str) -> Result<()> {
    let mut server = Server::new();
    for mount in mounts {
        info!(mount = %mount.mount_key, root = %mount.mount_root.display(), "serving mount");
        server.register_mount(endpoint_for(mount))?;
    }
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(listen, "accepting peers");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let (read, write) = stream.into_split();
                match server
                    .accept(Box::new(FramedSender::new(write)), Box::new(FramedReceiver::new(read)))
                    .await
                {
                    Ok(id) => info!(%addr, session = %id, "session started"),
                    Err(e) => error!(%addr, error = %e, "connect rejected"),
                }
            }
        }
    }
    info!("stopping all sessions");
    server.stop_all();
    Ok(())
}

async fn connect(mounts: Vec<MountConfig>, addr: &str, mount_key: &str) -> Result<()> {
    let config = mounts
        .into_iter()
        .find(|m| m.mount_key == mount_key)
        .ok_or_else(|| anyhow!("mount {mount_key:?} not in config"))?;
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting {addr}"))?;
    let (read, write) = stream.into_split();
    let watcher_root = config.mount_root.clone();
    let fs = Arc::new(NativeFileAccess::new(config.mount_root.clone()));
    let handle = connect_session(
        config,
        move |events| Box::new(NotifyFileWatcher::new(watcher_root, events)) as Box<dyn FileWatcher>,
        fs,
        Box::new(FramedSender::new(write)),
        Box::new(FramedReceiver::new(read)),
    )
    .await?;
    info!(mount = mount_key, "mirroring; press ctrl-c to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => handle.stop(),
        _ = watch_state(&handle) => {}
    }
    handle.wait().await;
    Ok(())
}

async fn watch_state(handle: &msync_core::SessionHandle) {
    loop {
        match handle.state() {
            SessionState::Stopped | SessionState::Failed(_) => break,
            _ => tokio::time::sleep(std::time::Duration::from_millis(200)).await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let mounts = load_mounts(&cli.config)?;
    match cli.command {
        Command::Serve { listen } => serve(mounts, &listen).await,
        Command::Connect { addr, mount } => connect(mounts, &addr, &mount).await,
    }
}
