//! Human-readable text output

use crate::config::OutputConfig;
use crate::pipeline::GlobalStats;
use crate::util::time::format_duration;
use std::time::Duration;

/// Print the global statistics to the console
pub fn print_results(stats: &GlobalStats, elapsed: Duration, config: &OutputConfig) {
    println!("═══════════════════════════════════════════════════════════");
    println!("                  GLOBAL STATISTICS");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Elapsed Time: {}", format_duration(elapsed));
    println!("Sites:        {} ({})", stats.sites.len(), stats.sites.join(", "));
    println!("Rows:         {}", format_number(stats.summary.rows));
    println!(
        "Median:       {} round(s), {}",
        stats.median_rounds,
        if stats.median_converged {
            "converged"
        } else {
            "round cap reached"
        }
    );
    println!();

    println!(
        "{:<16} {:>10} {:>8} {:>12} {:>12} {:>12} {:>12} {:>12}",
        "Feature", "Count", "Missing", "Mean", "Std Dev", "Min", "Median", "Max"
    );
    for (name, feature) in &stats.summary.features {
        let std_dev = stats.dispersion.get(name).map(|d| d.std_dev);
        let median = stats.medians.get(name).copied().flatten();
        println!(
            "{:<16} {:>10} {:>8} {:>12} {:>12} {:>12} {:>12} {:>12}",
            name,
            format_number(feature.count),
            format_number(feature.missing),
            format_value(Some(feature.mean)),
            format_value(std_dev),
            format_value(Some(feature.min)),
            format_value(median),
            format_value(Some(feature.max)),
        );
    }

    if config.show_histogram && !stats.histograms.is_empty() {
        println!();
        println!("Histograms:");
        for (name, hist) in &stats.histograms {
            println!("  {}:", name);
            let peak = hist.buckets().iter().copied().max().unwrap_or(0).max(1);
            for ((low, high), count) in hist.ranges() {
                let bar = "█".repeat(((count * 40) / peak) as usize);
                println!("    [{:>10.3}, {:>10.3})  {:>8}  {}", low, high, count, bar);
            }
        }
    }

    if config.per_site && !stats.per_site.is_empty() {
        println!();
        println!("Per Site:");
        for (site, summary) in &stats.per_site {
            println!("  {} ({} rows)", site, format_number(summary.rows));
            for (name, f) in &summary.features {
                println!(
                    "    {:<14} count={} mean={} min={} max={}",
                    name,
                    f.count,
                    format_value(Some(f.mean)),
                    format_value(Some(f.min)),
                    format_value(Some(f.max))
                );
            }
        }
    }

    if !stats.dropped.is_empty() {
        println!();
        println!("Dropped contributions:");
        for (site, phase, code) in &stats.dropped {
            println!("  {} in {}: {}", site, phase, code);
        }
    }
    println!();
}

fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.4}", v),
        _ => "-".to_string(),
    }
}

/// Format number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}
