//! Terminal progress for loads and counts
//!
//! On a TTY every pipeline stage gets a spinner line with a running record
//! count and rate. Elsewhere the lines are hidden and the log carries
//! progress instead.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

const TICK: Duration = Duration::from_millis(80);

/// `⠋ load   12,345 records (850/s) 12,000 committed`
fn stage_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} {prefix:<6.cyan.bold} {human_pos:>11} records ({per_sec}) {wide_msg:.dim}",
    )
    .expect("invalid template")
}

/// Owns the terminal while a run is drawing progress.
pub struct ProgressContext {
    multi: MultiProgress,
    is_tty: bool,
}

impl ProgressContext {
    /// Detect whether stderr is a terminal.
    pub fn new() -> Self {
        Self::with_tty(std::io::stderr().is_terminal())
    }

    /// Context that never draws (tests, library callers).
    pub fn hidden() -> Self {
        Self::with_tty(false)
    }

    fn with_tty(is_tty: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            is_tty,
        }
    }

    /// Spinner line counting records for one stage.
    ///
    /// Advance with `pb.inc(1)` per record, put secondary counts in
    /// `pb.set_message(...)`, and call `pb.finish_and_clear()` at the end.
    pub fn stage_line(&self, name: &str) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::no_length());
        pb.set_style(stage_style());
        pb.set_prefix(name.to_string());
        pb.enable_steady_tick(TICK);
        pb
    }

    /// Print a finished report (summary table) without tearing live lines.
    pub fn report(&self, text: &str) {
        if self.is_tty {
            let _ = self.multi.println(text);
        } else {
            eprintln!("{text}");
        }
    }

    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    /// Used by the log bridge to suspend drawing around log lines.
    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

impl Default for ProgressContext {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedProgress = Arc<ProgressContext>;

/// Decimal with `,` thousand separators.
pub fn fmt_num(n: usize) -> String {
    let digits = n.to_string();
    let head = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.char_indices() {
        if i > 0 && (i + 3 - head) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmt_num_below_thousand() {
        assert_eq!(fmt_num(0), "0");
        assert_eq!(fmt_num(7), "7");
        assert_eq!(fmt_num(999), "999");
    }

    #[test]
    fn fmt_num_groups() {
        assert_eq!(fmt_num(1_000), "1,000");
        assert_eq!(fmt_num(45_000), "45,000");
        assert_eq!(fmt_num(123_456), "123,456");
        assert_eq!(fmt_num(1_234_567), "1,234,567");
    }

    #[test]
    fn hidden_context_draws_nothing() {
        let ctx = ProgressContext::hidden();
        assert!(!ctx.is_tty());
        let pb = ctx.stage_line("load");
        assert!(pb.is_hidden());
        pb.inc(3);
        pb.finish_and_clear();
    }
}
