//! Synthetic capture self-test.
//!
//! Drives a full capture session with the in-process collaborators: one worker per CPU
//! submits random I/O while a poller drains every buffer, then the delivered stream is
//! checked against what the producers pushed.

use crate::config::{ProjectConfig, StressOptions};
use crate::prelude::*;
use clap::Args;
use iotrace_capture::{
    CaptureConfig, CaptureContext, Direction, HeapStorage, IoDescriptor, IoHook, QueueId,
    TracePoller, TracedDevices, online_cpus, pin_current_thread,
};
use iotrace_shared::Event;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tabled::settings::object::Columns;
use tabled::settings::{Alignment, Modify, Style};
use tabled::{Table, Tabled};

const DEFAULT_DEVICES: u32 = 4;
const DEFAULT_IOS_PER_CPU: u64 = 100_000;
const POLL_TIMEOUT_MS: u64 = 50;

#[derive(Args, Debug, Default)]
pub struct StressArgs {
    /// Total trace buffer size across all CPUs, in MiB
    #[arg(long, env = "IOTRACE_BUFFER_SIZE_MB")]
    pub buffer_size_mb: Option<u64>,

    /// Number of per-CPU buffers and workers (defaults to the online CPU count)
    #[arg(long)]
    pub cpus: Option<usize>,

    /// Number of synthetic devices to trace
    #[arg(long)]
    pub devices: Option<u32>,

    /// Number of I/Os each worker submits
    #[arg(long)]
    pub ios_per_cpu: Option<u64>,

    /// Seed of the synthetic workload (random when unset)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Path to the configuration file, discovered from the current directory when unset
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Stress settings after merging the config file and the CLI
#[derive(Debug, Clone, PartialEq)]
pub struct StressSettings {
    pub capture: CaptureConfig,
    pub devices: u32,
    pub ios_per_cpu: u64,
    pub seed: u64,
}

impl StressSettings {
    pub fn resolve(args: &StressArgs, project_config: Option<ProjectConfig>) -> Self {
        let ProjectConfig { capture, stress } = project_config.unwrap_or_default();
        let mut capture = capture.unwrap_or_default();
        let stress = stress.unwrap_or_default();

        if let Some(buffer_size_mb) = args.buffer_size_mb {
            capture.buffer_size_mb = buffer_size_mb;
        }
        if args.cpus.is_some() {
            capture.cpus = args.cpus;
        }

        let StressOptions {
            devices,
            ios_per_cpu,
        } = stress;

        Self {
            capture,
            devices: args.devices.or(devices).unwrap_or(DEFAULT_DEVICES),
            ios_per_cpu: args
                .ios_per_cpu
                .or(ios_per_cpu)
                .unwrap_or(DEFAULT_IOS_PER_CPU),
            seed: args.seed.unwrap_or_else(|| rand::thread_rng().r#gen()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Receipt {
    received: u64,
    last_sequence_id: u64,
    out_of_order: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Tabled)]
pub struct CpuReport {
    #[tabled(rename = "CPU")]
    pub cpu: usize,
    #[tabled(rename = "Pushed")]
    pub pushed: u64,
    #[tabled(rename = "Dropped")]
    pub dropped: u64,
    #[tabled(rename = "Received")]
    pub received: u64,
    #[tabled(rename = "Out of order")]
    pub out_of_order: u64,
}

impl CpuReport {
    pub fn is_verified(&self) -> bool {
        self.out_of_order == 0 && self.received == self.pushed
    }
}

#[derive(Debug)]
pub struct StressReport {
    pub per_cpu: Vec<CpuReport>,
    pub decode_errors: u64,
    pub elapsed_ms: u128,
}

impl StressReport {
    pub fn is_verified(&self) -> bool {
        self.decode_errors == 0 && self.per_cpu.iter().all(CpuReport::is_verified)
    }

    pub fn table(&self) -> String {
        let mut table = Table::new(&self.per_cpu);
        table
            .with(Style::rounded())
            .with(Modify::new(Columns::new(1..)).with(Alignment::right()));
        table.to_string()
    }
}

pub fn run(args: StressArgs) -> Result<()> {
    let current_dir = std::env::current_dir().context("Failed to read the current directory")?;
    let project_config = ProjectConfig::discover_and_load(args.config.as_deref(), &current_dir)?
        .map(|(path, config)| {
            info!("Using configuration from {}", path.display());
            config
        });

    let settings = StressSettings::resolve(&args, project_config);
    let report = execute(&settings)?;

    info!("Stress run finished in {} ms\n{}", report.elapsed_ms, report.table());
    if !report.is_verified() {
        bail!(
            "Event stream verification failed ({} decode error(s))",
            report.decode_errors
        );
    }
    info!("Per-buffer ordering verified");

    Ok(())
}

/// Run one capture session with a synthetic workload
pub fn execute(settings: &StressSettings) -> Result<StressReport> {
    let hook = Arc::new(IoHook::new());
    let devices = Arc::new(TracedDevices::new());
    let context = CaptureContext::new(
        &settings.capture,
        hook.clone(),
        devices.clone(),
        Arc::new(HeapStorage),
    )?;
    let cpus = context.cpu_count();
    info!(
        "Stressing {cpus} cpu(s) with {} I/O(s) each on {} device(s), seed {}",
        settings.ios_per_cpu, settings.devices, settings.seed
    );

    let mut rng = StdRng::seed_from_u64(settings.seed);
    context.attach()?;

    for device in 1..=settings.devices {
        devices.add(QueueId::from(device))?;
        let size = rng.gen_range(1..=64u64) << 30;
        context.emit_device_descriptor(
            device as usize % cpus,
            device,
            &format!("stress{device}"),
            size,
        )?;
    }

    let receipts = Arc::new(Mutex::new(vec![Receipt::default(); cpus]));
    let mut poller = {
        let receipts = receipts.clone();
        TracePoller::new(
            context.consumers()?,
            Box::new(move |(cpu, event): (usize, Event)| {
                let mut receipts = receipts.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(receipt) = receipts.get_mut(cpu) {
                    if event.sequence_id() <= receipt.last_sequence_id {
                        receipt.out_of_order += 1;
                    }
                    receipt.last_sequence_id = event.sequence_id();
                    receipt.received += 1;
                }
            }),
            POLL_TIMEOUT_MS,
        )?
    };

    let started = Instant::now();
    let online = online_cpus();
    std::thread::scope(|scope| {
        for cpu in 0..cpus {
            let hook = &hook;
            let seed = settings.seed.wrapping_add(cpu as u64 + 1);
            let ios = settings.ios_per_cpu;
            let device_count = settings.devices;
            scope.spawn(move || {
                if cpu < online {
                    if let Err(err) = pin_current_thread(cpu) {
                        warn!("Worker {cpu} runs unpinned: {err:#}");
                    }
                }

                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..ios {
                    let (queue, io) = random_io(&mut rng, device_count);
                    hook.submit(cpu, queue, &io);
                }
            });
        }
    });
    let elapsed_ms = started.elapsed().as_millis();

    context.detach();
    let summary = poller
        .shutdown()
        .context("Trace poller stopped abnormally")?;

    let stats = context.stats();
    let receipts = receipts.lock().unwrap_or_else(PoisonError::into_inner);
    let per_cpu = stats
        .per_cpu
        .iter()
        .zip(receipts.iter())
        .map(|(stats, receipt)| CpuReport {
            cpu: stats.cpu,
            pushed: stats.pushed,
            dropped: stats.dropped_events,
            received: receipt.received,
            out_of_order: receipt.out_of_order,
        })
        .collect();

    Ok(StressReport {
        per_cpu,
        decode_errors: summary.decode_errors,
        elapsed_ms,
    })
}

fn random_io(rng: &mut impl Rng, devices: u32) -> (QueueId, IoDescriptor) {
    let device_id = rng.gen_range(1..=devices.max(1));
    let io = IoDescriptor {
        device_id,
        sector: rng.gen_range(0..1u64 << 32),
        size_bytes: rng.gen_range(1..=256u32) << 9,
        direction: if rng.gen_bool(0.5) {
            Direction::Write
        } else {
            Direction::Read
        },
        discard: rng.gen_bool(0.05),
        flush: rng.gen_bool(0.02),
        fua: rng.gen_bool(0.05),
        io_class: rng.gen_range(0..4),
    };
    (QueueId::from(device_id), io)
}
