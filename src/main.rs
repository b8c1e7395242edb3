//! Quota filesystem daemon.
//!
//! Mounts a backing directory through FUSE and enforces a soft usage quota
//! kept current by a remote counter store.
//!
//! # Usage
//!
//! ```bash
//! # All parameters can come from the environment
//! ROOT_DIR=/srv/data FSS_ID=tenant-a FSS_NODE_ID=node-1 QUOTA=1024 \
//! REDIS_IP=10.0.0.5 REDIS_PORT=6379 REDIS_PASSWD=secret \
//!     quotafs --mount-point /mnt/data
//!
//! # Or from flags
//! quotafs --mount-point /mnt/data --root-dir /srv/data --tenant-id tenant-a \
//!     --node-id node-1 --quota-mib 1024 --redis-host 10.0.0.5 --redis-port 6379
//! ```
//!
//! # Tiger Style
//!
//! - Explicit resource bounds (see constants.rs)
//! - Fail-fast on configuration errors: nothing is mounted until every
//!   parameter has been validated

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use fuse_backend_rs::api::server::Server;
use fuse_backend_rs::transport::FuseChannel;
use fuse_backend_rs::transport::FuseSession;
use fuse_backend_rs::transport::Writer;
use quotafs::Identity;
use quotafs::QuotaFs;
use quotafs::QuotaFsConfig;
use quotafs::QuotaGuard;
use quotafs::QuotaState;
use quotafs::RedisCounterStore;
use quotafs::RemoteStoreConfig;
use quotafs::SyncLauncher;
use quotafs::SyncTiming;
use quotafs::UsageSync;
use quotafs::constants::DEFAULT_FUSE_THREADS;
use quotafs::constants::SYNC_INTERVAL;
use quotafs::constants::SYNC_TIMEOUT;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Grace period for the sync runtime to wind down after unmount.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "quotafs")]
#[command(about = "Mount a directory with a soft, cluster-wide usage quota")]
struct Args {
    /// Mount point path.
    #[arg(long)]
    mount_point: PathBuf,

    /// Backing directory exposed through the mount.
    #[arg(long, env = "ROOT_DIR")]
    root_dir: PathBuf,

    /// Tenant id, used as the field in the counter store.
    #[arg(long, env = "FSS_ID")]
    tenant_id: String,

    /// Node id, used in the counter store hash keys.
    #[arg(long, env = "FSS_NODE_ID")]
    node_id: String,

    /// Quota limit in MiB.
    #[arg(long, env = "QUOTA")]
    quota_mib: u64,

    /// Counter store host.
    #[arg(long, env = "REDIS_IP")]
    redis_host: String,

    /// Counter store port.
    #[arg(long, env = "REDIS_PORT")]
    redis_port: u16,

    /// Counter store shared secret.
    #[arg(long, env = "REDIS_PASSWD", hide_env_values = true, default_value = "")]
    redis_password: String,

    /// Filesystem name for mount.
    #[arg(long, default_value = "quotafs")]
    fsname: String,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,

    /// Number of threads for handling FUSE requests.
    #[arg(long, default_value_t = DEFAULT_FUSE_THREADS)]
    threads: usize,

    /// Milliseconds between usage sync ticks.
    #[arg(long, default_value_t = SYNC_INTERVAL.as_millis() as u64, value_parser = clap::value_parser!(u64).range(1..))]
    sync_interval_ms: u64,

    /// Milliseconds allowed for connecting and for each counter store command.
    #[arg(long, default_value_t = SYNC_TIMEOUT.as_millis() as u64, value_parser = clap::value_parser!(u64).range(1..))]
    sync_timeout_ms: u64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn load_config(args: &Args) -> anyhow::Result<QuotaFsConfig> {
    let identity = Identity::new(args.tenant_id.as_str(), args.node_id.as_str()).context("invalid identity")?;
    let remote = RemoteStoreConfig {
        host: args.redis_host.clone(),
        port: args.redis_port,
        secret: args.redis_password.clone(),
    };
    let timing = SyncTiming {
        interval: Duration::from_millis(args.sync_interval_ms),
        timeout: Duration::from_millis(args.sync_timeout_ms),
    };
    QuotaFsConfig::new(&args.root_dir, args.quota_mib, identity, remote, timing).context("invalid configuration")
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!(
        root = %config.root_dir.display(),
        limit_bytes = config.limit_bytes,
        tenant_id = %config.identity.tenant_id,
        node_id = %config.identity.node_id,
        counter_store = %format!("{}:{}", config.remote.host, config.remote.port),
        "configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("quotafs-sync")
        .enable_all()
        .build()
        .context("failed to start sync runtime")?;

    let store = RedisCounterStore::new(&config.remote.host, config.remote.port)
        .context("invalid counter store address")?;
    let state = Arc::new(QuotaState::new(config.limit_bytes, config.identity.clone()));
    let sync = UsageSync::new(state.clone(), Arc::new(store), config.remote.secret.clone(), config.sync);
    let launcher = Arc::new(SyncLauncher::new(runtime.handle().clone(), sync));

    let fs = QuotaFs::new(config.root_dir.clone(), QuotaGuard::new(state)).with_sync_launcher(launcher.clone());

    let result = run_fuse(&args, fs);

    // The kernel does not always send DESTROY on unmount.
    launcher.stop();
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    result
}

/// FUSE server wrapper for multi-threaded request handling.
struct FuseServer {
    server: Arc<Server<QuotaFs>>,
    channel: FuseChannel,
}

impl FuseServer {
    /// Create a new FUSE server from session.
    fn new(server: Arc<Server<QuotaFs>>, session: &mut FuseSession) -> Result<Self, fuse_backend_rs::transport::Error> {
        let channel = session.new_channel()?;
        Ok(Self { server, channel })
    }

    /// Processes incoming FUSE requests until the kernel shuts down the session.
    fn service_loop(&mut self) {
        loop {
            match self.channel.get_request() {
                Ok(Some((reader, fuse_writer))) => {
                    let writer = Writer::FuseDev(fuse_writer);

                    if let Err(e) = self.server.handle_message(reader, writer, None, None) {
                        if let fuse_backend_rs::Error::EncodeMessage(ref io_err) = e
                            && io_err.raw_os_error() == Some(libc::EBADF)
                        {
                            info!("FUSE session closed by kernel");
                            break;
                        }
                        warn!(error = ?e, "error handling FUSE message");
                    }
                }
                Ok(None) => {
                    info!("FUSE session ended");
                    break;
                }
                Err(e) => {
                    let is_shutdown = matches!(
                        &e,
                        fuse_backend_rs::transport::Error::SessionFailure(msg)
                            if msg.contains("closed") || msg.contains("shutdown")
                    );
                    if is_shutdown {
                        info!("FUSE session closed");
                        break;
                    }
                    warn!(error = ?e, "error getting FUSE request");
                }
            }
        }
    }
}

fn run_fuse(args: &Args, fs: QuotaFs) -> anyhow::Result<()> {
    info!(
        mount_point = %args.mount_point.display(),
        fsname = %args.fsname,
        threads = args.threads,
        "starting FUSE server"
    );

    let server = Arc::new(Server::new(fs));

    let mut session =
        FuseSession::new(&args.mount_point, &args.fsname, "", false).context("failed to create FUSE session")?;
    session.set_allow_other(args.allow_other);
    session.mount().context("failed to mount filesystem")?;

    info!("filesystem mounted at {}", args.mount_point.display());

    let mut handles = Vec::with_capacity(args.threads);
    for i in 0..args.threads {
        let fuse_server = match FuseServer::new(server.clone(), &mut session) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, thread = i, "failed to create FUSE channel");
                continue;
            }
        };

        let spawned = thread::Builder::new().name(format!("fuse-worker-{i}")).spawn(move || {
            info!(thread = i, "FUSE worker started");
            let mut server = fuse_server;
            server.service_loop();
            info!(thread = i, "FUSE worker stopped");
        });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => error!(error = %e, thread = i, "failed to spawn FUSE worker thread"),
        }
    }

    if handles.is_empty() {
        if let Err(e) = session.umount() {
            error!(error = %e, "failed to unmount");
        }
        anyhow::bail!("no FUSE worker could be started");
    }

    info!(threads = handles.len(), "FUSE workers started, press Ctrl-C to unmount");

    let (tx, rx) = std::sync::mpsc::channel();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = tx.send(());
    }) {
        error!("failed to set Ctrl-C handler: {}", err);
    }

    let _ = rx.recv();

    info!("shutdown signal received, unmounting filesystem");

    if let Err(e) = session.umount() {
        error!(error = %e, "failed to unmount");
    }

    for handle in handles {
        let _ = handle.join();
    }

    info!("shutdown complete");
    Ok(())
}
