use anyhow::{ensure, Result};
use crossbeam_utils::thread::scope;
use log::{debug, trace};
use rand::prelude::*;
use std::cmp::max;
use std::io::{stdout, Write};
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::time::Instant;
use typenum::{Unsigned, U1, U4};

use shared_handle::config::stress::{setup, BenchWriter, Burst, Config, Op, Perf, PtrKind};
use shared_handle::Handle;

#[cfg(all(not(feature = "sanitize"), target_os = "linux"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Payloads dropped so far, through any teardown path.
static DROPPED: AtomicUsize = AtomicUsize::new(0);
/// Payloads that went through `recycle`.
static RECYCLED: AtomicUsize = AtomicUsize::new(0);

/// The object the workers share.
struct Payload {
    id: usize,
    hits: AtomicU64,
}

impl Payload {
    fn new(id: usize) -> Self {
        Self {
            id,
            hits: AtomicU64::new(0),
        }
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        DROPPED.fetch_add(1, Ordering::Relaxed);
    }
}

fn recycle(payload: Box<Payload>) {
    trace!(
        "recycling payload {} after {} hits",
        payload.id,
        payload.hits.load(Ordering::Relaxed)
    );
    RECYCLED.fetch_add(1, Ordering::Relaxed);
    drop(payload);
}

/// A shared pointer the workload can run against.
trait SharedPtr: Clone + Deref<Target = Payload> + Send + Sync {
    fn count(&self) -> usize;
}

impl SharedPtr for Handle<Payload> {
    fn count(&self) -> usize {
        self.ref_count()
    }
}

impl SharedPtr for Arc<Payload> {
    fn count(&self) -> usize {
        Arc::strong_count(self)
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let name = Path::new(file!())
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("stress");
    let Some((config, output)) = setup(name)? else {
        return Ok(());
    };
    match config.burst {
        Burst::One => bench::<U1>(&config, output),
        Burst::Four => bench::<U4>(&config, output),
    }
}

fn bench<N: Unsigned>(config: &Config, output: BenchWriter) -> Result<()> {
    println!("{}", config);
    let perf = match config.kind {
        PtrKind::Handle => bench_ptrs::<Handle<Payload>, N, _>(config, Handle::new)?,
        PtrKind::HandleTeardown => bench_ptrs::<Handle<Payload>, N, _>(config, |payload| {
            Handle::with_teardown(payload, recycle)
        })?,
        PtrKind::Arc => bench_ptrs::<Arc<Payload>, N, _>(config, Arc::from)?,
    };
    if config.kind == PtrKind::HandleTeardown {
        let recycled = RECYCLED.load(Ordering::Acquire);
        ensure!(
            recycled == config.objects,
            "custom teardown ran {} times for {} objects",
            recycled,
            config.objects
        );
    }
    output.write_record(config, &perf)?;
    println!("{}", perf);
    Ok(())
}

fn bench_ptrs<P, N, F>(config: &Config, share: F) -> Result<Perf>
where
    P: SharedPtr,
    N: Unsigned,
    F: Fn(Box<Payload>) -> P,
{
    let dropped_before = DROPPED.load(Ordering::Acquire);
    let roots = (0..config.objects)
        .map(|id| share(Box::new(Payload::new(id))))
        .collect::<Vec<_>>();
    print!("shared {} objects... ", roots.len());
    stdout().flush()?;

    let barrier = &Arc::new(Barrier::new(config.threads + config.aux_thread));
    let (ops_sender, ops_receiver) = mpsc::channel();
    let (mem_sender, mem_receiver) = mpsc::channel();

    let shared = &roots;
    scope(|s| {
        // sampling thread
        if config.aux_thread > 0 {
            let mem_sender = mem_sender.clone();
            s.spawn(move |_| {
                let mut samples = 0usize;
                let mut acc = 0usize;
                let mut peak = 0usize;
                barrier.clone().wait();

                let start = Instant::now();
                let mut next_sampling = start + config.sampling_period;
                while start.elapsed() < config.duration {
                    let now = Instant::now();
                    if now > next_sampling {
                        let allocated = config.mem_sampler.sample();
                        samples += 1;
                        acc += allocated;
                        peak = max(peak, allocated);
                        next_sampling = now + config.sampling_period;
                    }
                    std::thread::sleep(config.aux_thread_period);
                }

                let avg = if samples > 0 { acc / samples } else { 0 };
                mem_sender.send((peak, avg)).unwrap();
            });
        } else {
            mem_sender.send((0, 0)).unwrap();
        }

        for _ in 0..config.threads {
            let ops_sender = ops_sender.clone();
            s.spawn(move |_| {
                let mut ops: u64 = 0;
                let rng = &mut rand::thread_rng();
                let mut local: Vec<P> = Vec::new();
                barrier.clone().wait();
                let start = Instant::now();

                while start.elapsed() < config.duration {
                    let idx = config.object_dist.sample(rng);
                    match Op::OPS[config.op_dist.sample(rng)] {
                        Op::Read => {
                            let ptr = local
                                .get(idx % local.len().max(1))
                                .unwrap_or(&shared[idx]);
                            ptr.hits.fetch_add(1, Ordering::Relaxed);
                        }
                        Op::Clone => {
                            for _ in 0..N::to_usize() {
                                local.push(shared[idx].clone());
                            }
                        }
                        Op::Release => {
                            for _ in 0..N::to_usize() {
                                if local.pop().is_none() {
                                    break;
                                }
                            }
                        }
                    }
                    ops += 1;
                }

                debug!("worker done with {} local handles left", local.len());
                drop(local);
                ops_sender.send(ops).unwrap();
            });
        }
    })
    .unwrap();
    println!("end");

    let ops = ops_receiver.iter().take(config.threads).sum::<u64>();
    let (peak_mem, avg_mem) = mem_receiver.recv()?;

    for root in roots.iter() {
        ensure!(
            root.count() == 1,
            "object {} still has {} references after the workers finished",
            root.id,
            root.count()
        );
    }
    let hits = roots
        .iter()
        .map(|root| root.hits.load(Ordering::Relaxed))
        .sum::<u64>();
    debug!("{} reads through shared pointers", hits);

    drop(roots);
    let teardowns = DROPPED.load(Ordering::Acquire) - dropped_before;
    ensure!(
        teardowns == config.objects,
        "{} objects were torn down, expected {}",
        teardowns,
        config.objects
    );

    Ok(Perf {
        ops_per_sec: ops / config.interval.max(1),
        peak_mem,
        avg_mem,
        teardowns,
    })
}
