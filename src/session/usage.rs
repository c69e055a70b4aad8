//! Per-session usage accounting.

use serde::{Deserialize, Serialize};

/// Lifetime token and cost counters for one session.
///
/// Applied from each query's terminal `Result` event, under the session's
/// send-serialization guarantee (one in-flight query, hence one `Result`, at
/// a time). Lifetime counters deliberately survive `clear()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    /// Number of queries that produced a `Result`.
    pub turns: u64,
}

impl UsageTotals {
    pub fn apply(&mut self, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.cost_usd += cost_usd;
        self.turns += 1;
    }
}
