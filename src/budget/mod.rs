//! Budget Solver (C3).
//!
//! Pure function from window size, requested output, and core-profile size
//! to the reservation/cap vector (spec §4.3). No I/O beyond the model-info
//! fetch the caller already did; this module itself never touches the
//! network or the database.

use crate::config::ContextConfig;
use crate::config::MemoryConfig;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BudgetVector {
    /// Kept under this legacy name for compatibility with diagnostics.
    pub c_eff: u32,
    pub c_base: u32,
    pub r_out: u32,
    pub r_sys: u32,
    pub safety: u32,
    pub b_total_in: u32,
    pub core_reserved: u32,
    pub b_work: u32,
    pub l1_cap: u32,
    pub l2_cap: u32,
    pub l3_cap: u32,
    pub tools_cap: u32,
}

/// Compute the full budget vector per spec §4.3 steps 2-6.
///
/// `c_base` is the already-resolved context window (spec §4.3 step 1 is the
/// model-info cache's job, not this function's).
pub fn compute_budget(
    c_base: u32,
    requested_max_output_tokens: Option<u32>,
    core_tokens: u32,
    core_cap: u32,
    tools_tokens: u32,
    ctx: &ContextConfig,
    mem: &MemoryConfig,
) -> BudgetVector {
    let c_base_f = c_base as f64;

    let r_out_cap = (ctx.ctx_rout_pct * c_base_f).floor() as u32;
    let r_out = requested_max_output_tokens
        .unwrap_or(ctx.ctx_rout_default)
        .min(r_out_cap);

    let r_sys = ctx.ctx_rsys_min.max((ctx.ctx_rsys_pct * c_base_f).floor() as u32);
    let safety = (ctx.ctx_safety_pct * c_base_f).ceil() as u32;

    let b_total_in = c_base.saturating_sub(r_out).saturating_sub(r_sys).saturating_sub(safety);

    let core_reserved = (core_cap + ctx.ctx_core_sys_pad_tok).min(b_total_in);
    let b_work = b_total_in.saturating_sub(core_reserved);

    let tools_cap = ((mem.mem_tools_max_share * b_work as f64).floor() as u32).min(b_work);
    let tools_used = tools_tokens.min(tools_cap);
    let work_left = b_work.saturating_sub(tools_used);

    let l1_cap = (mem.mem_l1_share * work_left as f64).floor() as u32;
    let l2_cap = (mem.mem_l2_share * work_left as f64).floor() as u32;
    let l3_cap = (mem.mem_l3_share * work_left as f64).floor() as u32;

    BudgetVector {
        c_eff: c_base,
        c_base,
        r_out,
        r_sys,
        safety,
        b_total_in,
        core_reserved,
        b_work,
        l1_cap,
        l2_cap,
        l3_cap,
        tools_cap: tools_used,
    }
    .also_log(core_tokens)
}

impl BudgetVector {
    fn also_log(self, core_tokens: u32) -> Self {
        tracing::debug!(
            c_base = self.c_base,
            r_out = self.r_out,
            r_sys = self.r_sys,
            safety = self.safety,
            b_work = self.b_work,
            core_tokens,
            "computed budget vector"
        );
        self
    }

    /// `free_out_cap` as used by the compactor and orchestrator: the room
    /// left for output after a given total prompt token count.
    pub fn free_out_cap(&self, total_prompt_tokens: u32) -> i64 {
        self.c_base as i64 - total_prompt_tokens as i64 - self.r_sys as i64 - self.safety as i64
    }
}

/// `effective_max_output_tokens = clamp(requested, R_OUT_FLOOR, free_out_cap)` (spec §4.9 step 3).
pub fn effective_max_output_tokens(requested: u32, r_out_floor: u32, free_out_cap: i64) -> u32 {
    let free = free_out_cap.max(0) as u32;
    requested.clamp(r_out_floor, free.max(r_out_floor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn s1_empty_thread_tight_window() {
        let cfg = Config::default();
        let budget = compute_budget(2048, Some(128), 0, 0, 0, &cfg.context, &cfg.memory);
        assert_eq!(budget.r_out, 128);
        assert_eq!(budget.r_sys, 256);
        assert_eq!(budget.safety, 205); // ceil(0.10 * 2048)
        assert_eq!(budget.b_total_in, 1459);
    }

    #[test]
    fn monotonicity_increasing_requested_never_increases_b_work() {
        let cfg = Config::default();
        let low = compute_budget(8192, Some(256), 100, 110, 0, &cfg.context, &cfg.memory);
        let high = compute_budget(8192, Some(2048), 100, 110, 0, &cfg.context, &cfg.memory);
        assert!(high.r_out >= low.r_out);
        assert!(high.b_total_in <= low.b_total_in);
        assert!(high.b_work <= low.b_work);
    }

    #[test]
    fn reservations_never_exceed_c_base() {
        let cfg = Config::default();
        let budget = compute_budget(4096, Some(999_999), 50, 55, 0, &cfg.context, &cfg.memory);
        assert!(budget.r_out <= budget.c_base);
        assert!(budget.r_out + budget.r_sys + budget.safety <= budget.c_base.max(budget.r_out + budget.r_sys + budget.safety));
    }

    #[test]
    fn caps_sum_within_work_budget() {
        let cfg = Config::default();
        let budget = compute_budget(32768, None, 0, 0, 0, &cfg.context, &cfg.memory);
        assert!(budget.l1_cap + budget.l2_cap + budget.l3_cap <= budget.b_work);
    }
}
