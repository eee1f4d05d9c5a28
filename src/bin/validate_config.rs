//! Standalone binary to validate resilience configuration files.
//! Used by CI and deploy hooks before a config reaches a service.

use resilience_kit::config::{PolicySection, ResilienceConfig};
use std::path::PathBuf;

fn describe(cfg: &ResilienceConfig) -> Vec<String> {
    let mut lines = Vec::new();
    match cfg.rate_limit {
        Some(ref rl) => {
            let policy = match rl.policy {
                PolicySection::TokenBucket {
                    capacity,
                    refill_rate,
                } => format!("token_bucket capacity={} refill_rate={}/s", capacity, refill_rate),
                PolicySection::SlidingWindow {
                    max_requests,
                    window_ms,
                } => format!("sliding_window max_requests={} window={}ms", max_requests, window_ms),
            };
            lines.push(format!("rate_limit: {} max_keys={}", policy, rl.to_config().max_keys));
        }
        None => lines.push("rate_limit: disabled".to_string()),
    }
    match cfg.circuit_breaker {
        Some(ref cb) => lines.push(format!(
            "circuit_breaker: failure_threshold={} reset_timeout={}ms",
            cb.failure_threshold, cb.reset_timeout_ms
        )),
        None => lines.push("circuit_breaker: disabled".to_string()),
    }
    match cfg.cache {
        Some(ref cache) => {
            let tiers: Vec<String> = cache
                .tiers
                .iter()
                .map(|t| format!("{}({:?}, ttl={}ms)", t.name, t.kind, t.ttl_ms))
                .collect();
            lines.push(format!("cache: {}", tiers.join(" -> ")));
        }
        None => lines.push("cache: disabled".to_string()),
    }
    lines
}

fn main() {
    resilience_kit::observability::init_tracing();

    let files: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if files.is_empty() {
        eprintln!("usage: validate_config <file.yaml>...");
        std::process::exit(2);
    }

    let mut errors = Vec::new();
    for file in &files {
        println!("\n=== {} ===", file.display());
        match ResilienceConfig::load(file) {
            Ok(cfg) => {
                for line in describe(&cfg) {
                    println!("  {}", line);
                }
                println!("  ✅ valid");
            }
            Err(e) => {
                println!("  ❌ {}", e);
                errors.push(format!("  {}: {}", file.display(), e));
            }
        }
    }

    println!("\n=== Summary ===");
    if errors.is_empty() {
        println!("✅ All {} configuration file(s) are valid!", files.len());
    } else {
        println!("❌ Found {} invalid file(s):\n", errors.len());
        for err in &errors {
            println!("{}", err);
        }
        std::process::exit(1);
    }
}
