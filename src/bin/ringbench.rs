use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use ringcast::stats::{dump_lag_csv, mono_time_ns, Samples};
use ringcast::{
    create_producer, local_ring, open_consumer, Consumer, Producer, ReadStatus, RingMem, Slot,
    RING_CAPACITY,
};

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

/// Snapshot payload: 1 KiB, the ring's reference configuration.
/// `stamp_ns` carries the producer's clock, `words[0]` the block number.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct Snapshot {
    stamp_ns: u64,
    words: [u64; 127],
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            stamp_ns: 0,
            words: [0u64; 127],
        }
    }
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop(_signal: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn install_stop_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_stop as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_stop as libc::sighandler_t);
    }
}

fn pin_to(core: Option<usize>) {
    if let Some(id) = core {
        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
            eprintln!("failed to pin to core {id}");
            std::process::exit(1);
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Benchmarks for the shared-memory overwrite ring", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publishes a ring and streams snapshots into it.
    Feed {
        /// Logical ring name.
        #[arg(short, long, default_value = "ringcast-bench")]
        name: String,

        /// Minimum period between pushes in nanoseconds; 0 disables throttling.
        #[arg(short, long, default_value_t = 1_000)]
        period: u64,

        /// Number of snapshots to push; 0 streams until SIGINT/SIGTERM.
        #[arg(short, long, default_value_t = 0)]
        count: u64,

        /// Pin the feeder to this CPU core.
        #[arg(long)]
        core: Option<usize>,
    },

    /// Attaches to a ring and measures push-to-pop latency.
    Tap {
        /// Logical ring name.
        #[arg(short, long, default_value = "ringcast-bench")]
        name: String,

        /// Number of fresh snapshots to receive.
        #[arg(short, long, default_value_t = 1_000_000)]
        count: u64,

        /// Dump per-snapshot push/pop timestamps to this CSV file.
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Pin the tap to this CPU core.
        #[arg(long)]
        core: Option<usize>,
    },

    /// Runs one feeder and several taps in-process over a heap ring.
    Local {
        /// Minimum period between pushes in nanoseconds; 0 disables throttling.
        #[arg(short, long, default_value_t = 1_000)]
        period: u64,

        /// Number of snapshots to push and to receive per tap.
        #[arg(short, long, default_value_t = 1_000_000)]
        count: u64,

        /// Number of tap threads.
        #[arg(short, long, default_value_t = 2)]
        readers: usize,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("ringbench: {err}");
        std::process::exit(1);
    }
}

fn run() -> ringcast::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    println!(
        "slot size: {}, payload size: {}, ring capacity: {}, buffer size: {}",
        std::mem::size_of::<Slot<Snapshot>>(),
        std::mem::size_of::<Snapshot>(),
        RING_CAPACITY,
        std::mem::size_of::<Slot<Snapshot>>() * RING_CAPACITY,
    );

    match args.command {
        Commands::Feed {
            name,
            period,
            count,
            core,
        } => {
            pin_to(core);
            install_stop_handler();
            let tx = create_producer::<Snapshot>(&name)?;
            feed(&tx, period, count);
            Ok(())
        }

        Commands::Tap {
            name,
            count,
            csv,
            core,
        } => {
            pin_to(core);
            install_stop_handler();
            let rx = open_consumer::<Snapshot>(&name)?;
            tap(rx, count, csv.as_deref());
            Ok(())
        }

        Commands::Local {
            period,
            count,
            readers,
        } => {
            let (tx, rx) = local_ring::<Snapshot>();
            let cores = core_affinity::get_core_ids().unwrap_or_default();

            let taps: Vec<_> = (0..readers)
                .map(|i| {
                    let rx = rx.clone();
                    let core = cores.get(i + 1).copied();
                    std::thread::spawn(move || {
                        if let Some(core) = core {
                            core_affinity::set_for_current(core);
                        }
                        tap(rx, count, None);
                    })
                })
                .collect();

            if let Some(core) = cores.first().copied() {
                core_affinity::set_for_current(core);
            }
            install_stop_handler();
            feed(&tx, period, count);

            // Feeder is done; release taps that are short of their count.
            STOP.store(true, Ordering::Relaxed);
            for handle in taps {
                handle.join().expect("tap thread panicked");
            }
            Ok(())
        }
    }
}

#[inline(never)]
fn feed<M: RingMem<Snapshot>>(tx: &Producer<Snapshot, M>, period: u64, count: u64) {
    let mut snapshot = Snapshot::default();
    let mut pushed = 0u64;
    let started = mono_time_ns();
    let mut deadline = started;

    while !STOP.load(Ordering::Relaxed) {
        if count != 0 && pushed == count {
            break;
        }
        let now = mono_time_ns();
        if now < deadline {
            continue;
        }
        deadline = now + period;

        snapshot.stamp_ns = now;
        snapshot.words[0] = pushed + 1;
        tx.push(&snapshot);
        pushed += 1;
    }

    let elapsed = mono_time_ns() - started;
    println!(
        "pushed {pushed} snapshots in {:.3}s, last id {}",
        elapsed as f64 / 1e9,
        tx.last_block_id(),
    );
}

#[inline(never)]
fn tap<M: RingMem<Snapshot>>(mut rx: Consumer<Snapshot, M>, count: u64, csv: Option<&Path>) {
    let mut snapshot = Snapshot::default();
    let mut latency = Samples::with_capacity(count as usize);
    let mut pushed_ns = Vec::with_capacity(count as usize);
    let mut popped_ns = Vec::with_capacity(count as usize);
    let mut lapped = 0u64;
    let mut precaution = 0u64;

    while (latency.len() as u64) < count {
        match rx.pop(&mut snapshot) {
            ReadStatus::New => {
                let now = mono_time_ns();
                latency.record(now.saturating_sub(snapshot.stamp_ns));
                pushed_ns.push(snapshot.stamp_ns);
                popped_ns.push(now);
            }
            ReadStatus::NoNew => {
                if STOP.load(Ordering::Relaxed) {
                    break;
                }
                std::hint::spin_loop();
            }
            ReadStatus::Lapped => lapped += 1,
            ReadStatus::LappedPrecaution => precaution += 1,
        }
    }

    if latency.is_empty() {
        println!("received nothing");
        return;
    }
    println!("{}", latency.report("push->pop ns"));
    println!("lapped: {lapped}, lapped (precaution): {precaution}");

    if let Some(path) = csv {
        if let Err(err) = dump_lag_csv(path, &pushed_ns, &popped_ns) {
            eprintln!("failed to write {}: {err}", path.display());
        }
    }
}
