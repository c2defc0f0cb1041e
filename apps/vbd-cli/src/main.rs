mod workload;

use anyhow::{anyhow, ensure, Context, Result};
use clap::Parser;
use futures_channel::oneshot;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{info, warn};
use vbd_core::metrics::{self, StatSnapshot};
use vbd_core::{Backend, BackendConfig, Device, DEFAULT_CHANNEL_CAPACITY};
use vbd_volumes::DirectoryVolumeClient;
use workload::WorkerReport;

#[derive(Debug, Parser)]
#[command(name = "vbd-cli")]
#[command(about = "Drive I/O through vbd devices backed by a directory of images", long_about = None)]
struct Args {
    /// Directory holding `<pool>/<image>` backing files
    #[arg(long, value_name = "PATH")]
    root: PathBuf,
    /// Pool of the single device to create
    #[arg(long, default_value = "rbd")]
    pool: String,
    /// Image of the single device to create (ignored with --manifest)
    #[arg(long)]
    image: Option<String>,
    /// Device name (ignored with --manifest)
    #[arg(long, default_value = "vbd0")]
    name: String,
    /// Logical block size (bytes)
    #[arg(long, default_value_t = 512)]
    block_size: u32,
    /// JSON file listing devices to create
    #[arg(long, value_name = "PATH")]
    manifest: Option<PathBuf>,
    /// Create missing images with this size (bytes) before opening them
    #[arg(long, value_name = "BYTES")]
    create_size: Option<u64>,
    /// Worker threads per device, each with its own channel
    #[arg(long, default_value_t = 2)]
    threads: usize,
    /// Blocks written and read back by every worker
    #[arg(long, default_value_t = 256)]
    ops: u64,
    /// Maximum in-flight requests per channel
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct DeviceSpec {
    name: String,
    #[serde(default = "default_pool")]
    pool: String,
    image: String,
    #[serde(default = "default_block_size")]
    block_size: u32,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    devices: Vec<DeviceSpec>,
}

fn default_pool() -> String {
    "rbd".to_owned()
}

fn default_block_size() -> u32 {
    512
}

#[derive(Debug, Serialize)]
struct DeviceReport {
    name: String,
    block_size: u32,
    block_count: u64,
    #[serde(flatten)]
    io: WorkerReport,
}

#[derive(Debug, Serialize)]
struct OpReport {
    count: u64,
    bytes: u64,
    errors: u64,
    cancelled: u64,
    avg_ns: f64,
    max_ns: u64,
}

impl From<StatSnapshot> for OpReport {
    fn from(stat: StatSnapshot) -> Self {
        Self {
            count: stat.count,
            bytes: stat.bytes,
            errors: stat.errors,
            cancelled: stat.cancelled,
            avg_ns: stat.avg_ns,
            max_ns: stat.max_ns,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunReport {
    devices: Vec<DeviceReport>,
    read: OpReport,
    write: OpReport,
    flush: OpReport,
    unmap: OpReport,
    busy_rejects: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    ensure!(args.threads > 0, "at least one worker thread is required");

    let specs = device_specs(&args)?;
    let client = DirectoryVolumeClient::new(&args.root).context("open image root")?;
    if let Some(size) = args.create_size {
        for spec in &specs {
            if !client.root().join(&spec.pool).join(&spec.image).exists() {
                client
                    .create_image(&spec.pool, &spec.image, size)
                    .with_context(|| format!("create image {}/{}", spec.pool, spec.image))?;
            }
        }
    }

    let backend = Backend::new(
        Arc::new(client),
        BackendConfig {
            channel_capacity: args.queue_depth,
        },
    )
    .context("configure backend")?;

    let mut devices = Vec::with_capacity(specs.len());
    for spec in &specs {
        let device = backend
            .create_device(&spec.name, &spec.pool, &spec.image, spec.block_size)
            .await
            .with_context(|| format!("create device {}", spec.name))?;
        info!(
            device = device.name(),
            pool = device.pool(),
            image = device.image(),
            block_size = device.block_size(),
            block_count = device.block_count(),
            "device ready"
        );
        devices.push(device);
    }

    let reports = run_workload(&devices, args.threads, args.ops).await?;

    for device in &devices {
        delete_device(&backend, device).await?;
    }

    let snapshot = metrics::snapshot();
    let report = RunReport {
        devices: devices
            .iter()
            .zip(reports)
            .map(|(device, io)| DeviceReport {
                name: device.name().to_owned(),
                block_size: device.block_size(),
                block_count: device.block_count(),
                io,
            })
            .collect(),
        read: snapshot.read.into(),
        write: snapshot.write.into(),
        flush: snapshot.flush.into(),
        unmap: snapshot.unmap.into(),
        busy_rejects: snapshot.busy_rejects,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    let mismatches: u64 = report.devices.iter().map(|d| d.io.mismatches).sum();
    ensure!(mismatches == 0, "{mismatches} blocks read back corrupted");
    Ok(())
}

fn device_specs(args: &Args) -> Result<Vec<DeviceSpec>> {
    if let Some(path) = &args.manifest {
        let manifest = load_manifest(path)?;
        ensure!(!manifest.devices.is_empty(), "manifest lists no devices");
        return Ok(manifest.devices);
    }
    let image = args
        .image
        .clone()
        .ok_or_else(|| anyhow!("--image or --manifest is required"))?;
    Ok(vec![DeviceSpec {
        name: args.name.clone(),
        pool: args.pool.clone(),
        image,
        block_size: args.block_size,
    }])
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read manifest {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse manifest {}", path.display()))
}

/// Run `threads` workers per device until they finish or ctrl-c is received.
async fn run_workload(devices: &[Device], threads: usize, ops: u64) -> Result<Vec<WorkerReport>> {
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = JoinSet::new();
    for (index, device) in devices.iter().enumerate() {
        for worker in 0..threads {
            let device = device.clone();
            let stop = stop.clone();
            workers.spawn_blocking(move || {
                workload::run_worker(device, worker, ops, stop).map(|report| (index, report))
            });
        }
    }

    let mut reports = vec![WorkerReport::default(); devices.len()];
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            joined = workers.join_next() => {
                let Some(joined) = joined else {
                    break;
                };
                let (index, report) = joined.context("worker panicked")??;
                reports[index].merge(report);
            }
            _ = &mut ctrl_c, if !stop.load(Ordering::Relaxed) => {
                info!("shutdown requested");
                stop.store(true, Ordering::Relaxed);
            }
        }
    }
    Ok(reports)
}

async fn delete_device(backend: &Backend, device: &Device) -> Result<()> {
    let (done_tx, done_rx) = oneshot::channel();
    let task = backend
        .delete_device(device, move |result| {
            let _ = done_tx.send(result);
        })
        .with_context(|| format!("delete device {}", device.name()))?;
    task.await;
    match done_rx.await {
        Ok(Ok(())) => {
            info!(device = device.name(), "device deleted");
            Ok(())
        }
        Ok(Err(err)) => {
            warn!(device = device.name(), error = %err, "device deleted with errors");
            Err(err).context("release volume")
        }
        Err(_) => Err(anyhow!("delete of {} never reported", device.name())),
    }
}
