//! tiermem-sim - Tiered Memory Simulator
//!
//! Runs a synthetic multi-vCPU workload against one simulated domain and
//! prints what the fault path and the swap-out worker did.
//! Usage: tiermem-sim [OPTIONS]

use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use tiermem::{Domain, DomainConfig, SimulatedReclaimer, WorkerState, Workload, WorkloadReport};

#[derive(Debug)]
struct Options {
    config: Option<PathBuf>,
    vcpus: usize,
    accesses: u64,
    working_set: Option<u64>,
    seed: Option<u64>,
    unmap_ratio: f64,
    huge_ratio: f64,
    reactivate_ratio: f64,
    json: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: None,
            vcpus: num_cpus::get(),
            accesses: 100_000,
            working_set: None,
            seed: None,
            unmap_ratio: 0.0,
            huge_ratio: 0.0,
            reactivate_ratio: 0.0,
            json: false,
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let Some(options) = parse_args(&args)? else {
        return Ok(());
    };

    let mut config = DomainConfig::load(options.config.as_deref()).context("failed to load configuration")?;
    if let Some(seed) = options.seed {
        config.selector_seed = Some(seed);
    }
    // Default working set overcommits the local pool by half.
    let working_set = options
        .working_set
        .unwrap_or(config.capacity_pages as u64 + config.capacity_pages as u64 / 2);

    log::info!("Starting tiermem-sim v{}", tiermem::VERSION);

    let reclaimer = SimulatedReclaimer::from_config(&config).with_ratios(1.0 - options.reactivate_ratio, options.reactivate_ratio);
    let domain = Domain::<u64>::new();
    domain.init(config, reclaimer)?;

    let mut workload = Workload::new(options.vcpus, options.accesses, working_set)
        .with_unmap_ratio(options.unmap_ratio)
        .with_huge_ratio(options.huge_ratio);
    if let Some(seed) = options.seed {
        workload = workload.with_seed(seed);
    }

    let report = workload.run(&domain);
    settle(&domain, Duration::from_secs(2));
    let report = WorkloadReport {
        pool: domain.free_pool().ok(),
        local_pages: domain.local_count(),
        remote_pages: domain.remote_count(),
        stats: domain.stats(),
        ..report
    };
    domain.shutdown();

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_table(&report);
    }

    if let Some(fatal) = &report.fatal {
        bail!("domain halted: {}", fatal);
    }
    Ok(())
}

/// Give the swapper a moment to finish the cycle in progress.
fn settle(domain: &Domain<u64>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if matches!(domain.worker_state(), WorkerState::Idle | WorkerState::Halted) {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// `Ok(None)` when the invocation only asked for help or the version.
fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("tiermem-sim {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "-c" | "--config" => options.config = Some(PathBuf::from(value(args, &mut i)?)),
            "--vcpus" => options.vcpus = parse(args, &mut i)?,
            "--accesses" => options.accesses = parse(args, &mut i)?,
            "--working-set" => options.working_set = Some(parse(args, &mut i)?),
            "--seed" => options.seed = Some(parse(args, &mut i)?),
            "--unmap-ratio" => options.unmap_ratio = ratio(args, &mut i)?,
            "--huge-ratio" => options.huge_ratio = ratio(args, &mut i)?,
            "--reactivate-ratio" => options.reactivate_ratio = ratio(args, &mut i)?,
            "--json" => options.json = true,
            other => {
                print_usage();
                bail!("unknown option: {}", other);
            }
        }
        i += 1;
    }

    if options.vcpus == 0 {
        bail!("--vcpus must be at least 1");
    }
    Ok(Some(options))
}

fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .with_context(|| format!("{} requires a value", flag))
}

fn parse<T: FromStr>(args: &[String], i: &mut usize) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let flag = args[*i].clone();
    let raw = value(args, i)?;
    raw.parse().with_context(|| format!("invalid value for {}: {}", flag, raw))
}

fn ratio(args: &[String], i: &mut usize) -> Result<f64> {
    let flag = args[*i].clone();
    let value: f64 = parse(args, i)?;
    if !(0.0..=1.0).contains(&value) {
        bail!("{} must be between 0 and 1, got {}", flag, value);
    }
    Ok(value)
}

fn print_table(report: &WorkloadReport) {
    let stats = &report.stats;
    println!("Workload");
    println!("  vCPUs              {}", report.vcpus);
    println!("  accesses           {}", report.accesses);
    println!("  elapsed            {} ms", report.elapsed_ms);
    println!();
    println!("Faults");
    println!("  admitted           {}", report.admitted);
    println!("  promoted           {}", report.promoted);
    println!("  already local      {}", report.already_local);
    println!("  unmapped           {}", report.unmapped);
    println!("  retries            {}", report.retries);
    println!("  dropped            {}", report.gave_up);
    println!();
    println!("Local pool");
    if let Some(pool) = &report.pool {
        println!("  total              {}", pool.total_pages);
        println!("  free               {}", pool.free_pages);
        println!("  under reclaim      {}", pool.under_reclaim);
    }
    println!("  local pages        {}", report.local_pages);
    println!("  remote pages       {}", report.remote_pages);
    println!();
    println!("Swapper");
    println!("  wakeups            {}", stats.wakeups);
    println!("  cycles             {} ({} abandoned)", stats.cycles_completed, stats.cycles_abandoned);
    println!("  selected           {}", stats.pages_selected);
    println!("  reclaimed          {}", stats.pages_reclaimed);
    println!("  reactivated        {}", stats.pages_reactivated);
    println!("  pruned             {}", stats.pages_pruned);
    println!("  spurious victims   {}", stats.spurious_victims);
    println!("  reclaim time       {} us", stats.reclaim_time_us);
    if let Some(fatal) = &report.fatal {
        println!();
        println!("HALTED: {}", fatal);
    }
}

fn print_usage() {
    println!("tiermem-sim - Tiered guest memory simulator");
    println!();
    println!("USAGE:");
    println!("    tiermem-sim [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help                 Show this help message");
    println!("    -V, --version              Show version information");
    println!("    -c, --config <FILE>        Domain configuration file (toml|yaml|json)");
    println!("        --vcpus <N>            Simulated vCPUs (default: CPU count)");
    println!("        --accesses <N>         Accesses per vCPU (default: 100000)");
    println!("        --working-set <N>      Distinct guest pages (default: 1.5x capacity)");
    println!("        --seed <N>             Seed for the workload, selector and primitive");
    println!("        --unmap-ratio <F>      Fraction of accesses that unmap the page");
    println!("        --huge-ratio <F>       Fraction of pages mapped as huge pages");
    println!("        --reactivate-ratio <F> Fraction of each batch the primitive keeps resident");
    println!("        --json                 Print the report as JSON");
    println!();
    println!("ENVIRONMENT:");
    println!("    TIERMEM_CAPACITY_PAGES, TIERMEM_WATERMARK, ...  Override configuration keys");
    println!("    RUST_LOG=debug                                  Enable logging");
    println!();
    println!("EXAMPLES:");
    println!("    tiermem-sim --vcpus 4 --accesses 50000 --seed 7");
    println!("    TIERMEM_CAPACITY_PAGES=4096 TIERMEM_WATERMARK=256 tiermem-sim --json");
}
