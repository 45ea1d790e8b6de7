use clap::Parser;
use tracing_subscriber::EnvFilter;

use petek::{AlternatePolicy, Event, HeapSettings, Runtime, StmConfig, Value};

#[derive(Parser, Debug)]
#[command(author, version, about = "Parallel transactional event runtime demo", long_about = None)]
struct Cli {
    /// Worker threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Events to enqueue
    #[arg(long, default_value_t = 200)]
    events: usize,

    /// Counter increments per event
    #[arg(long, default_value_t = 1)]
    increments: i64,

    /// Run without transactional protection
    #[arg(long)]
    no_stm: bool,

    /// Force every other commit to abort (diagnostic)
    #[arg(long)]
    alternate_aborts: bool,

    /// Heap capacity in words
    #[arg(long, default_value_t = 1 << 16)]
    heap_words: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = StmConfig {
        enabled: !cli.no_stm,
        thread_count: cli.threads.max(1),
    };
    let heap = HeapSettings {
        capacity_words: cli.heap_words,
        ..HeapSettings::default()
    };

    let runtime = if cli.alternate_aborts {
        Runtime::with_policy(config, heap, Box::new(AlternatePolicy::new()))
    } else {
        Runtime::new(config, heap)
    };

    if let Err(err) = runtime.define_object("counter", &[0]) {
        eprintln!("failed to allocate the counter: {err}");
        std::process::exit(1);
    }

    let increments = cli.increments;
    for _ in 0..cli.events {
        runtime.enqueue(Event::new(move |ctx| {
            for _ in 0..increments {
                let h = ctx.open("counter")?;
                let n = ctx.load(h, 0)?.to_i64();
                ctx.store(h, 0, Value::from_i64(n + 1))?;
            }
            Ok(())
        }));
    }

    let report = runtime.run();
    let counter = runtime
        .read_global_slot("counter", 0)
        .map(Value::to_i64)
        .unwrap_or(0);

    println!("counter = {counter}");
    println!(
        "{} committed, {} aborted, {} gc cycles",
        report.committed, report.aborted, report.gc_cycles
    );
    println!("{} milliseconds elapsed.", report.elapsed.as_millis());
}
