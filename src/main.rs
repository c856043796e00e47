use anyhow::{Result, bail};
use clap::Parser;
use env_logger::Env;
use log::info;
use std::time::Instant;

use seqpipe::args::{Args, Commands, effective_threads};
use seqpipe::commands::{PairsOptions, ScanOptions, run_pairs, run_scan};
use seqpipe::utils::{format_duration, format_duration_verbose, rate_per_sec};

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Determine effective thread count
    let threads = effective_threads(&args);

    // Set rayon thread pool size (only affects the final sort)
    if threads > 1 {
        rayon::ThreadPoolBuilder::new().num_threads(threads).build_global().ok();
    }

    let total_start = Instant::now();
    info!(
        "seqpipe: using {} threads{}",
        threads,
        if args.single_threaded { " (single-threaded mode)" } else { "" }
    );

    match args.command {
        Commands::Pairs { r1, r2, queue_capacity, strict } => {
            let opts = PairsOptions { r1, r2, consumers: threads, queue_capacity, strict, cancel: None };
            let report = run_pairs(&opts)?;
            let elapsed = total_start.elapsed();

            println!("pairs\t{}", report.pairs);
            for (mate, stats) in [("R1", &report.r1), ("R2", &report.r2)] {
                println!(
                    "{mate}\treads={}\tbases={}\tgc={:.2}%",
                    stats.reads,
                    stats.bases,
                    stats.gc_percent()
                );
            }
            println!("name_mismatches\t{}", report.name_mismatches);
            info!(
                "Paired {} reads in {} ({:.0} pairs/sec)",
                report.pairs,
                format_duration_verbose(elapsed),
                rate_per_sec(report.pairs, elapsed)
            );
        }
        Commands::Scan { inputs, depth, keep_going } => {
            let opts = ScanOptions { inputs, threads, depth, keep_going, cancel: None };
            let report = run_scan(&opts)?;

            println!("file\treads\tbases\tgc_percent\tpeak_buffered");
            for scan in &report.scans {
                println!(
                    "{}\t{}\t{}\t{:.2}\t{}",
                    scan.path.display(),
                    scan.stats.reads,
                    scan.stats.bases,
                    scan.stats.gc_percent(),
                    scan.peak_buffered
                );
            }
            let total = report.total();
            println!("total\t{}\t{}\t{:.2}\t-", total.reads, total.bases, total.gc_percent());

            if !report.failures.is_empty() {
                for failure in &report.failures {
                    eprintln!("seqpipe: {}: {}", failure.path.display(), failure.error);
                }
                bail!(
                    "{} of {} files could not be scanned",
                    report.failures.len(),
                    report.failures.len() + report.scans.len()
                );
            }
        }
    }

    let (mins, secs) = format_duration(total_start.elapsed());
    info!("Total time: {} min {} sec", mins, secs);
    Ok(())
}
