//! Run summary for loads and counts

use std::time::Duration;

use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use scopus_core::{PairingReport, fmt_num};

use crate::loader::LoadStats;

/// Totals for one load run.
#[derive(Debug, Default, Clone)]
pub struct Summary {
    pub pairing: PairingReport,
    pub load: LoadStats,
    /// Nested containers that could not be opened
    pub container_failures: usize,
    pub elapsed: Duration,
}

impl Summary {
    /// Format summary table as a string.
    pub fn format_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Scopus load")
                    .fg(Color::Cyan)
                    .add_attribute(comfy_table::Attribute::Bold),
                Cell::new("Value").fg(Color::Cyan),
                Cell::new("%").fg(Color::Cyan),
            ]);

        let processed = self.load.processed;
        let rows: [(&str, usize); 10] = [
            ("Pairs", self.pairing.pairs),
            ("Skipped files", self.pairing.skipped),
            ("Unpaired files", self.pairing.unpaired.len()),
            ("Duplicates", self.pairing.duplicates),
            ("Unreadable", self.pairing.read_failures + self.container_failures),
            ("Processed", processed),
            ("Extraction failures", self.load.extraction_failures),
            ("Failed groups", self.load.failed_groups),
            ("Batches", self.load.batches),
            ("Fallbacks", self.load.fallbacks),
        ];
        for (name, value) in rows {
            let share = match name {
                "Extraction failures" | "Failed groups" => {
                    format!("{:.2}", pct(value, processed))
                }
                _ => String::new(),
            };
            table.add_row(vec![Cell::new(name), Cell::new(fmt_num(value)), Cell::new(share)]);
        }
        table.add_row(vec![
            Cell::new("Committed").fg(Color::Green),
            Cell::new(fmt_num(self.load.committed)).fg(Color::Green),
            Cell::new(format!("{:.1}", pct(self.load.committed, processed))).fg(Color::Green),
        ]);
        table.add_row(vec![
            Cell::new("Sources"),
            Cell::new(format!(
                "{} new / {} reused",
                fmt_num(self.load.sources_created),
                fmt_num(self.load.sources_reused)
            )),
            Cell::new(""),
        ]);
        table.add_row(vec![
            Cell::new("Elapsed"),
            Cell::new(format!("{:.1}s", self.elapsed.as_secs_f64())),
            Cell::new(""),
        ]);

        format!("\n{table}")
    }

    /// Log minimal summary (non-TTY mode).
    pub fn log(&self) {
        log::info!(
            "Load complete: {} committed / {} processed from {} pairs \
             ({} extraction failures, {} failed groups, {} unpaired, {} duplicates, {} skipped) [{:.1}s]",
            fmt_num(self.load.committed),
            fmt_num(self.load.processed),
            fmt_num(self.pairing.pairs),
            fmt_num(self.load.extraction_failures),
            fmt_num(self.load.failed_groups),
            fmt_num(self.pairing.unpaired.len()),
            fmt_num(self.pairing.duplicates),
            fmt_num(self.pairing.skipped),
            self.elapsed.as_secs_f64()
        );
    }

    /// Whether any record was lost along the way.
    pub fn has_losses(&self) -> bool {
        self.load.extraction_failures > 0
            || self.load.failed_groups > 0
            || !self.pairing.unpaired.is_empty()
            || self.pairing.read_failures > 0
            || self.container_failures > 0
    }
}

fn pct(part: usize, total: usize) -> f64 {
    if total > 0 {
        part as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pct_zero_total() {
        assert_eq!(pct(3, 0), 0.0);
    }

    #[test]
    fn table_mentions_committed() {
        let summary = Summary {
            load: LoadStats {
                processed: 1200,
                committed: 1199,
                extraction_failures: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let table = summary.format_table();
        assert!(table.contains("Committed"));
        assert!(table.contains("1,199"));
        assert!(summary.has_losses());
    }

    #[test]
    fn clean_run_has_no_losses() {
        let summary = Summary {
            load: LoadStats {
                processed: 2,
                committed: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!summary.has_losses());
    }
}
