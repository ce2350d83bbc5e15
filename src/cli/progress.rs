//! Progress display module
//!
//! Renders [`SwarmStats`] snapshots as a single refreshing status line.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::swarm::SwarmStats;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Time left at `speed` bytes/s, if it can be estimated
pub fn calculate_eta(left: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || left == 0 {
        return None;
    }
    Some(Duration::from_secs_f64(left as f64 / speed))
}

/// Progress display for CLI
pub struct ProgressDisplay {
    start_time: Instant,
    last_update: Option<(Instant, u64, u64)>,
    update_interval: Duration,
    quiet: bool,
    total: u64,
}

impl ProgressDisplay {
    pub fn new(total: u64, quiet: bool) -> Self {
        Self::with_interval(total, quiet, Duration::from_millis(500))
    }

    pub fn with_interval(total: u64, quiet: bool, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: None,
            update_interval: interval,
            quiet,
            total,
        }
    }

    /// Speeds since the previous sample, recording `stats` as the new one
    fn sample(&mut self, stats: &SwarmStats, now: Instant) -> (f64, f64) {
        let speeds = match self.last_update {
            Some((at, down, up)) => {
                let secs = now.saturating_duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    (
                        stats.downloaded.saturating_sub(down) as f64 / secs,
                        stats.uploaded.saturating_sub(up) as f64 / secs,
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };
        self.last_update = Some((now, stats.downloaded, stats.uploaded));
        speeds
    }

    /// Redraw the status line if the update interval has passed
    pub fn update(&mut self, stats: &SwarmStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let now = Instant::now();
        if matches!(self.last_update, Some((at, _, _)) if now.saturating_duration_since(at) < self.update_interval) {
            return Ok(());
        }

        let (down_speed, up_speed) = self.sample(stats, now);
        let line = self.render(stats, down_speed, up_speed);
        print!("\r\x1b[2K{}", line);
        io::stdout().flush()
    }

    fn render(&self, stats: &SwarmStats, down_speed: f64, up_speed: f64) -> String {
        let progress_percent = stats.progress * 100.0;
        let bar_width: usize = 40;
        let filled = ((stats.progress * bar_width as f64) as usize).min(bar_width);
        let bar: String = "=".repeat(filled) + &" ".repeat(bar_width - filled);

        let eta_str = calculate_eta(stats.left, down_speed)
            .map(format_duration)
            .unwrap_or_else(|| "∞".to_string());

        format!(
            "[{}] {:.1}% | {} / {} | ↓ {} | ↑ {} | Peers: {} ({} known) | ETA: {}",
            bar,
            progress_percent,
            format_bytes(self.total - stats.left.min(self.total)),
            format_bytes(self.total),
            format_speed(down_speed),
            format_speed(up_speed),
            stats.peers,
            stats.known_peers,
            eta_str,
        )
    }

    /// Print the final summary
    pub fn print_summary(&self, stats: &SwarmStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        print!("\r\x1b[2K");
        io::stdout().flush()?;

        println!();
        println!("{}", if stats.complete { "Download Complete!" } else { "Stopped." });
        println!(
            "  Have: {} / {} ({:.1}%)",
            format_bytes(self.total - stats.left.min(self.total)),
            format_bytes(self.total),
            stats.progress * 100.0
        );
        println!("  Downloaded: {}", format_bytes(stats.downloaded));
        println!("  Uploaded: {}", format_bytes(stats.uploaded));
        println!("  Elapsed Time: {}", format_duration(self.start_time.elapsed()));

        Ok(())
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024.0), "1.00 KB/s");
        assert_eq!(format_speed(1024.0 * 1024.0), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_calculate_eta() {
        assert_eq!(calculate_eta(50, 10.0), Some(Duration::from_secs(5)));
        assert_eq!(calculate_eta(0, 10.0), None);
        assert_eq!(calculate_eta(50, 0.0), None);
    }

    #[test]
    fn test_speeds_from_samples() {
        let mut display = ProgressDisplay::new(1000, true);
        let start = Instant::now();
        let mut stats = SwarmStats::default();
        assert_eq!(display.sample(&stats, start), (0.0, 0.0));

        stats.downloaded = 400;
        stats.uploaded = 100;
        let (down, up) = display.sample(&stats, start + Duration::from_secs(2));
        assert_eq!(down, 200.0);
        assert_eq!(up, 50.0);
    }

    #[test]
    fn test_render_line() {
        let display = ProgressDisplay::new(2048, false);
        let stats = SwarmStats { peers: 3, known_peers: 7, left: 1024, progress: 0.5, ..SwarmStats::default() };
        let line = display.render(&stats, 512.0, 0.0);
        assert!(line.contains("50.0%"));
        assert!(line.contains("1.00 KB / 2.00 KB"));
        assert!(line.contains("Peers: 3 (7 known)"));
        assert!(line.contains("ETA: 2s"));
    }
}
