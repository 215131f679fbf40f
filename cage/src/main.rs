use clap::Parser as ClapParser;
use std::{
    process,
    ptr::NonNull,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use cage::{
    CrossThreadPersistent, HandleSlot, Heap, HeapCreateInfo, HeapMarker, PointerTag, sandbox,
};

const EXTERNAL_TAG: PointerTag = PointerTag::new(0x41);
const TRUSTED_TAG: PointerTag = PointerTag::new(0x42);

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Background threads allocating table entries
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Allocate-then-collect rounds per thread
    #[arg(long, default_value_t = 16)]
    rounds: usize,

    /// Objects allocated by each thread per round
    #[arg(long, default_value_t = 2048)]
    objects: usize,

    /// Root every n-th object; the rest become garbage
    #[arg(long, default_value_t = 4)]
    root_every: usize,

    /// log2 of the cage reservation
    #[arg(long)]
    cage_size_log2: Option<u32>,

    /// Table block size in bytes
    #[arg(long)]
    block_size: Option<usize>,

    /// Free-entry ratio that makes a table compact itself
    #[arg(long)]
    compaction_ratio: Option<f64>,
}

/// An object as the mutator would lay it out inside the cage: only handles,
/// never raw off-cage pointers.
struct Node {
    external: HandleSlot,
    trusted: HandleSlot,
    payload: Box<[u64; 2]>,
}

impl Node {
    fn payload_address(&self) -> usize {
        self.payload.as_ptr() as usize
    }

    fn address(&self) -> usize {
        self as *const Node as usize
    }
}

unsafe fn trace_node(object: NonNull<u8>, marker: &HeapMarker<'_>) {
    // SAFETY: the driver only roots Node values
    let node = unsafe { object.cast::<Node>().as_ref() };
    marker.mark_external(&node.external);
    marker.mark_trusted(&node.trusted);
}

fn allocate_node(heap: &Heap, seed: u64) -> Box<Node> {
    let node = Box::new(Node {
        external: HandleSlot::new(Default::default()),
        trusted: HandleSlot::new(Default::default()),
        payload: Box::new([seed, !seed]),
    });
    let external = heap
        .external_table()
        .allocate_and_initialize_entry(node.payload_address(), EXTERNAL_TAG);
    let trusted = heap
        .trusted_table()
        .allocate_and_initialize_entry(node.address(), TRUSTED_TAG);
    node.external.store(external);
    node.trusted.store(trusted);
    node
}

/// Rooted nodes must still resolve to their own addresses after a
/// collection, wherever compaction moved their entries.
fn verify(heap: &Heap, node: &Node) -> bool {
    let external = heap
        .external_table()
        .get(node.external.load(), EXTERNAL_TAG);
    let trusted = heap.trusted_table().get(node.trusted.load(), TRUSTED_TAG);
    external == node.payload_address() && trusted == node.address()
}

fn run_worker(
    heap: Arc<Heap>,
    rendezvous: Arc<Barrier>,
    cli: &Cli,
    id: usize,
    mismatches: &AtomicUsize,
) {
    for round in 0..cli.rounds {
        let nodes: Vec<Box<Node>> = (0..cli.objects)
            .map(|i| allocate_node(&heap, ((id as u64) << 32) | ((round as u64) << 16) | i as u64))
            .collect();
        let roots: Vec<CrossThreadPersistent<Node>> = nodes
            .iter()
            .step_by(cli.root_every)
            .map(|node| {
                CrossThreadPersistent::new(heap.roots().clone(), Some(NonNull::from(&**node)))
            })
            .collect();

        // nobody allocates while the main thread sweeps
        rendezvous.wait();
        let performed = heap.barrier().await_collection_background();
        rendezvous.wait();

        if !performed {
            log::warn!("worker {id}: round {round} released without a collection");
        }
        for root in &roots {
            let Some(node) = root.get() else { continue };
            // SAFETY: rooted nodes are owned by `nodes` for the whole round
            if !verify(&heap, unsafe { node.as_ref() }) {
                mismatches.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(roots);
        drop(nodes);
        log::trace!("worker {id}: round {round} done");
    }
}

fn main() {
    env_logger::init();
    let cli = Arc::new(Cli::parse());
    if cli.threads == 0 || cli.root_every == 0 {
        eprintln!("threads and root-every must be at least 1");
        process::exit(2);
    }

    let info = HeapCreateInfo {
        cage_size_log2: cli.cage_size_log2,
        table_block_size: cli.block_size,
        compaction_min_free_ratio: cli.compaction_ratio,
        ..Default::default()
    };
    let heap = match Heap::new(info, trace_node) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("Error creating heap: {err}");
            process::exit(2);
        }
    };
    sandbox::initialize_global(heap.cage());

    let started = Instant::now();
    let done = Arc::new(AtomicBool::new(false));
    let mismatches = Arc::new(AtomicUsize::new(0));
    let rendezvous = Arc::new(Barrier::new(cli.threads));

    let workers: Vec<_> = (0..cli.threads)
        .map(|id| {
            let heap = heap.clone();
            let rendezvous = rendezvous.clone();
            let cli = cli.clone();
            let mismatches = mismatches.clone();
            thread::Builder::new()
                .name(format!("mutator-{id}"))
                .spawn(move || run_worker(heap, rendezvous, &cli, id, &mismatches))
        })
        .collect::<Result<_, _>>()
        .unwrap_or_else(|err| {
            eprintln!("Error spawning worker: {err}");
            process::exit(2);
        });

    // main thread: serve collection requests until every worker is finished
    let watcher = {
        let done = done.clone();
        thread::spawn(move || {
            for worker in workers {
                if worker.join().is_err() {
                    log::error!("worker panicked");
                }
            }
            done.store(true, Ordering::Release);
        })
    };
    while !done.load(Ordering::Acquire) {
        if !heap.safepoint() {
            thread::sleep(Duration::from_micros(50));
        }
    }
    let _ = watcher.join();

    let stats = heap.collect_garbage();
    let failed = mismatches.load(Ordering::Relaxed);
    println!(
        "{} threads x {} rounds x {} objects in {:?}",
        cli.threads,
        cli.rounds,
        cli.objects,
        started.elapsed()
    );
    println!(
        "collections: {}, interrupts: {}, last time to collection: {:?}",
        heap.collections(),
        heap.interrupts(),
        heap.barrier().last_time_to_collection()
    );
    println!(
        "external capacity {} / trusted capacity {}, live after final gc: {} / {}",
        stats.external.capacity,
        stats.trusted.capacity,
        stats.external.live_entries,
        stats.trusted.live_entries
    );
    if failed > 0 {
        eprintln!("{failed} rooted entries resolved to the wrong address");
        process::exit(1);
    }
}
