use clap::{value_t, App, Arg, ArgMatches};
use log::error;
use rust_dbbench::options::StoreOptions;
use rust_dbbench::registry::Registry;
use rust_dbbench::workload::{BackendResult, BenchmarkConfig, Harness, PhaseSpan};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use std::process;

const DEFAULT_BACKENDS: &str = "hashdb,rocksdb,sled,lmdb,memdb";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = App::new("Key Value Store Benchmark")
        .version("0.1.0")
        .about("Runs a seeded load / mixed / range-scan workload against each backend")
        .arg(
            Arg::with_name("backends")
                .long("backends")
                .takes_value(true)
                .default_value(DEFAULT_BACKENDS)
                .help("comma-separated backends to run"),
        )
        .arg(
            Arg::with_name("keys")
                .long("keys")
                .takes_value(true)
                .default_value("10000")
                .help("number of keys to load"),
        )
        .arg(
            Arg::with_name("value-bytes")
                .long("value-bytes")
                .takes_value(true)
                .default_value("128")
                .help("value size in bytes"),
        )
        .arg(
            Arg::with_name("mixed-ops")
                .long("mixed-ops")
                .takes_value(true)
                .default_value("20000")
                .help("number of mixed ops (get/set/delete)"),
        )
        .arg(
            Arg::with_name("range-queries")
                .long("range-queries")
                .takes_value(true)
                .default_value("200")
                .help("number of range queries"),
        )
        .arg(
            Arg::with_name("range-span")
                .long("range-span")
                .takes_value(true)
                .default_value("100")
                .help("number of keys per range"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .default_value("1")
                .help("rng seed"),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .takes_value(true)
                .help("optional path to write JSON results"),
        )
        .arg(
            Arg::with_name("cpuprofile")
                .long("cpuprofile")
                .takes_value(true)
                .help("write a phase timeline to file"),
        )
        .get_matches();

    let config = parse_config(&matches);
    let registry = Registry::with_default_backends();
    let mut harness = Harness::new(&registry, config, StoreOptions::from_env());

    let mut results = Vec::new();
    for backend in matches
        .value_of("backends")
        .unwrap_or(DEFAULT_BACKENDS)
        .split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
    {
        let result = harness.run_backend(backend);
        print_result(&result);
        results.push(result);
    }

    if let Some(path) = matches.value_of("cpuprofile") {
        if let Err(e) = write_profile(Path::new(path), harness.timeline()) {
            error!("write profile: {}", e);
        }
    }

    if let Some(path) = matches.value_of("json") {
        if let Err(e) = write_json(Path::new(path), &results) {
            eprintln!("write json: {}", e);
            process::exit(1);
        }
        println!("JSON written to {}", path);
    }
}

fn parse_config(matches: &ArgMatches) -> BenchmarkConfig {
    BenchmarkConfig {
        key_count: value_t!(matches, "keys", usize).unwrap_or_else(|e| e.exit()),
        value_size: value_t!(matches, "value-bytes", usize).unwrap_or_else(|e| e.exit()),
        mixed_ops: value_t!(matches, "mixed-ops", usize).unwrap_or_else(|e| e.exit()),
        range_queries: value_t!(matches, "range-queries", usize).unwrap_or_else(|e| e.exit()),
        range_span: value_t!(matches, "range-span", usize).unwrap_or_else(|e| e.exit()),
        seed: value_t!(matches, "seed", u64).unwrap_or_else(|e| e.exit()),
    }
}

fn print_result(result: &BackendResult) {
    println!("=== {} ===", result.backend);
    if let Some(e) = &result.error {
        println!("error: {}\n", e);
        return;
    }
    println!(
        "load:   ops={} dur={:?} thr={:.1} ops/s",
        result.load.ops, result.load.duration, result.load.throughput_ops_per_sec
    );
    println!(
        "mixed:  ops={} dur={:?} thr={:.1} ops/s",
        result.mixed.ops, result.mixed.duration, result.mixed.throughput_ops_per_sec
    );
    println!(
        "range:  ranges={} span={} dur={:?} thr={:.1} ranges/s\n",
        result.range_scan.ranges,
        result.range_scan.span,
        result.range_scan.duration,
        result.range_scan.throughput_ranges_per_sec
    );
}

fn write_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(path, data)
}

fn write_json(path: &Path, results: &[BackendResult]) -> io::Result<()> {
    write_pretty(path, results)
}

fn write_profile(path: &Path, timeline: &[PhaseSpan]) -> io::Result<()> {
    write_pretty(path, timeline)
}
