//! Store statistics.
//!
//! `tpr stats` prints two stable lines first, `records: N` and
//! `database size: B bytes`, for scripts to parse, followed by a
//! human-oriented breakdown by pattern type and most common tags.

use anyhow::Result;

use crate::config::Config;
use crate::models::PatternType;
use crate::store::VectorStore;

const TOP_TAGS: usize = 10;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = VectorStore::open(&config.db.path).await?;

    let stats = store.stats().await?;
    let types = store.type_counts().await?;
    let tags = store.top_tags(TOP_TAGS).await?;
    let latest = store.latest_created_at().await?;
    let dims = store.dims().await?;
    store.close().await;

    println!("records: {}", stats.record_count);
    println!(
        "database size: {} bytes ({})",
        stats.database_size_bytes,
        format_bytes(stats.database_size_bytes)
    );
    println!();
    println!("  Store:       {}", config.db.path.display());
    println!(
        "  Dimensions:  {}",
        dims.map(|d| d.to_string())
            .unwrap_or_else(|| "unset".to_string())
    );
    println!(
        "  Newest:      {}",
        latest
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    if !types.is_empty() {
        println!();
        println!("  By type:");
        for (ty, n) in &types {
            let label = PatternType::parse(ty).map_or(ty.as_str(), |t| t.label());
            println!("  {:<24} {:>8}", label, n);
        }
    }

    if !tags.is_empty() {
        println!();
        println!("  Top tags:");
        for (tag, n) in &tags {
            println!("  {:<24} {:>8}", tag, n);
        }
    }

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 2 * 86400 - 5), "2 days ago");
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00");
    }
}
