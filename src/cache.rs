use serde::{Deserialize, Serialize};

use crate::types::{CacheConfig, CacheStrategy, ChatMessage, Role, ToolSpec};

/// Rough prompt-size estimate used for the minimum-token gate.
/// Four characters per token is close enough for a threshold check.
fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u32 {
    let chars: usize = messages.iter().map(|m| m.content.len()).sum();
    (chars / 4) as u32
}

/// Attach ephemeral cache markers according to the configured strategy.
///
/// Returns the messages with `cache_hint` set on the selected positions;
/// any pre-existing hints are cleared first so the engine is the only
/// source of markers. Disabled or absent configuration passes the
/// messages through unchanged. Never fails.
pub fn annotate(
    messages: &[ChatMessage],
    tools: &[ToolSpec],
    config: Option<&CacheConfig>,
) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = messages.to_vec();
    for m in &mut out {
        m.cache_hint = false;
    }

    let Some(cfg) = config else { return out };
    if !cfg.enabled {
        return out;
    }
    if estimate_prompt_tokens(messages) < cfg.min_tokens {
        return out;
    }

    match cfg.strategy {
        CacheStrategy::None => {}
        CacheStrategy::System => {
            if let Some(first) = out.first_mut() {
                if first.role == Role::System {
                    first.cache_hint = true;
                }
            }
        }
        CacheStrategy::Tools => {
            if !tools.is_empty() {
                mark_first_system(&mut out);
            }
        }
        CacheStrategy::Context => {
            mark_first_system(&mut out);
            let user_positions: Vec<usize> = out
                .iter()
                .enumerate()
                .filter(|(_, m)| m.role == Role::User)
                .map(|(i, _)| i)
                .collect();
            for &i in user_positions.iter().rev().take(2) {
                out[i].cache_hint = true;
            }
        }
        CacheStrategy::Aggressive => {
            mark_first_system(&mut out);
            for m in out.iter_mut().filter(|m| m.role == Role::User) {
                m.cache_hint = true;
            }
        }
    }

    out
}

fn mark_first_system(messages: &mut [ChatMessage]) {
    if let Some(m) = messages.iter_mut().find(|m| m.role == Role::System) {
        m.cache_hint = true;
    }
}

/// Cache token counters for one or more requests
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_input_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub output_tokens: u64,
}

/// Computed cost comparison for cached vs uncached serving
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheSavings {
    pub cost_without_cache: f64,
    pub cost_with_cache: f64,
    pub savings: f64,
    pub savings_percent: f64,
}

/// Compute the cost delta prompt caching produced.
///
/// Prices are per thousand tokens. Cache-creation and non-cached input
/// tokens bill at the input price, cache reads at the discounted price.
pub fn cost_savings(stats: &CacheStats, input_price_per_k: f64, cached_price_per_k: f64) -> CacheSavings {
    let cost_without_cache = stats.total_input_tokens as f64 * input_price_per_k / 1000.0;

    let non_cached_input = stats
        .total_input_tokens
        .saturating_sub(stats.cache_creation_tokens)
        .saturating_sub(stats.cache_read_tokens);

    let cost_with_cache = (stats.cache_creation_tokens as f64 * input_price_per_k
        + stats.cache_read_tokens as f64 * cached_price_per_k
        + non_cached_input as f64 * input_price_per_k
        + stats.output_tokens as f64 * input_price_per_k)
        / 1000.0;

    let savings = cost_without_cache - cost_with_cache;
    let savings_percent = if cost_without_cache > 0.0 {
        savings / cost_without_cache * 100.0
    } else {
        0.0
    };

    CacheSavings {
        cost_without_cache,
        cost_with_cache,
        savings,
        savings_percent,
    }
}

/// Rolling cache effectiveness counters.
///
/// A request counts as a hit when the vendor reported any cache activity
/// (creation or read tokens above zero).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub requests: u64,
    pub cache_hits: u64,
    pub total_creation_tokens: u64,
    pub total_read_tokens: u64,
    pub avg_savings_percent: f64,
}

impl CacheMetrics {
    pub fn record(&mut self, creation_tokens: u64, read_tokens: u64, savings_percent: f64) {
        self.requests += 1;
        if creation_tokens + read_tokens > 0 {
            self.cache_hits += 1;
        }
        self.total_creation_tokens += creation_tokens;
        self.total_read_tokens += read_tokens;
        // Running average over all requests
        let n = self.requests as f64;
        self.avg_savings_percent += (savings_percent - self.avg_savings_percent) / n;
    }

    pub fn hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.requests as f64
        }
    }
}
