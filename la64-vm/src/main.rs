//! Run a LoongArch64 guest image on one core.
//!
//! Usage:
//!   la64-vm path/to/kernel.elf --budget 50000000
//!   la64-vm raw.bin --load-addr 0x1c000000 --entry 0x1c000000 -v
//!
//! The image is loaded into flat RAM at physical address 0, the core starts
//! in direct-address mode at the entry point and runs under the software
//! engine until the budget is spent or it idles with nothing to wake it.

use clap::Parser;
use la64_vm::bus::{DEFAULT_RAM_SIZE, RAM_BASE, Ram};
use la64_vm::loader::load_image;
use la64_vm::{CoreConfig, CpuState, ExecutionEngine, SoftwareEngine};
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about = "LoongArch64 guest CPU core")]
struct Args {
    /// Guest image (ELF64 or flat binary)
    image: PathBuf,

    /// Physical load address for flat images
    #[arg(long, default_value = "0x1c000000", value_parser = parse_u64)]
    load_addr: u64,

    /// Override the entry PC
    #[arg(long, value_parser = parse_u64)]
    entry: Option<u64>,

    /// Instructions to run before stopping
    #[arg(short, long, default_value_t = 10_000_000)]
    budget: u64,

    /// RAM size in MiB
    #[arg(long, default_value_t = DEFAULT_RAM_SIZE >> 20)]
    ram_mib: u64,

    /// Core configuration (JSON, missing fields keep defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Record execution events and print the last N at exit
    #[arg(long)]
    trace: Option<usize>,

    /// Write a state snapshot here when the run ends
    #[arg(long)]
    snapshot_out: Option<PathBuf>,

    /// Verbose logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_u64(text: &str) -> Result<u64, String> {
    let text = text.replace('_', "");
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", text, e))
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    if let Err(err) = run(args) {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => CoreConfig::from_json(&fs::read_to_string(path)?)?,
        None => CoreConfig::default(),
    };
    if let Some(count) = args.trace {
        config.trace_enabled = true;
        config.trace_capacity = config.trace_capacity.max(count);
    }

    let image = fs::read(&args.image)?;
    let ram_size = usize::try_from(args.ram_mib << 20)?;
    let mut ram = Ram::new(RAM_BASE, ram_size);
    let loaded = load_image(&mut ram, &image, args.load_addr, config.phys_mask())?;
    config.reset_pc = args.entry.unwrap_or(loaded.entry);

    let mut engine = SoftwareEngine::new(config)?;
    log::info!(
        "[CPU] Starting {} engine at {:#x}, budget {}",
        engine.name(),
        engine.cpu.pc,
        args.budget
    );
    let result = engine.run(&mut ram, args.budget)?;
    log::info!("[CPU] Stopped ({:?}) after {} instructions", result.stop, result.insns);

    dump_regs(&engine.cpu);
    let stats = engine.cache.stats();
    println!(
        "TB cache: {} blocks, {} hits / {} misses ({:.1}%), {} flushes",
        engine.cache.len(),
        stats.hits,
        stats.misses,
        stats.hit_ratio() * 100.0,
        stats.flushes
    );
    println!("Engine: {}", serde_json::to_string(engine.stats())?);

    if let Some(count) = args.trace {
        engine.trace.dump_recent(count);
        println!("{}", engine.trace.stats().format());
    }

    if let Some(path) = &args.snapshot_out {
        let bytes = engine.export_state()?.to_bytes()?;
        fs::write(path, &bytes)?;
        log::info!("[CPU] Snapshot written to {} ({} bytes)", path.display(), bytes.len());
    }
    Ok(())
}

fn dump_regs(cpu: &CpuState) {
    println!("pc  = {:016x}  plv={} icount={}", cpu.pc, cpu.plv(), cpu.icount);
    for row in 0..8 {
        let line: Vec<String> = (0..4)
            .map(|col| {
                let reg = row * 4 + col;
                format!("r{:<2} = {:016x}", reg, cpu.gpr[reg])
            })
            .collect();
        println!("{}", line.join("  "));
    }
    for id in [
        la64_vm::csr::CsrId::Crmd,
        la64_vm::csr::CsrId::Estat,
        la64_vm::csr::CsrId::Era,
        la64_vm::csr::CsrId::Badv,
    ] {
        println!("{:<6} = {:016x}", id.name(), cpu.csr.get(id));
    }
}
