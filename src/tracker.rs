use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Usage;

/// Width of the sliding rate window
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Spending limits for a session / day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub max_tokens_per_request: u64,
    pub max_tokens_per_session: u64,
    pub max_cost_per_session: f64,
    pub max_cost_per_day: f64,
    pub max_requests_per_minute: usize,
    /// Fraction of a limit at which decisions carry a warning
    pub warning_threshold: f64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_tokens_per_request: 100_000,
            max_tokens_per_session: 1_000_000,
            max_cost_per_session: 10.0,
            max_cost_per_day: 50.0,
            max_requests_per_minute: 60,
            warning_threshold: 0.80,
        }
    }
}

/// Outcome of a budget check. A denial is a policy decision, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub reason: String,
    pub warning: bool,
}

impl BudgetDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "ok".to_string(),
            warning: false,
        }
    }

    fn warn(reason: &str) -> Self {
        Self {
            allowed: true,
            reason: reason.to_string(),
            warning: true,
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: reason.to_string(),
            warning: false,
        }
    }
}

#[derive(Debug, Default)]
struct SessionUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    thinking_tokens: u64,
    total_tokens: u64,
    cost: f64,
    request_times: VecDeque<Instant>,
    last_activity: Option<Instant>,
}

/// Read-only view of one session's accumulated usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub thinking_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

/// Calendar-day (UTC) aggregate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub total_tokens: u64,
    pub cost: f64,
}

/// Aggregate attributed to one model family
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FamilyUsage {
    pub total_tokens: u64,
    pub cost: f64,
}

#[derive(Default)]
struct TrackerState {
    sessions: HashMap<String, SessionUsage>,
    daily: HashMap<String, DailyUsage>,
    families: HashMap<String, FamilyUsage>,
}

/// Session and daily token/cost accounting with a sliding-window rate gate.
///
/// One mutex serializes all callers; every operation is O(rate window),
/// so contention stays acceptable.
pub struct TokenTracker {
    budget: Budget,
    state: Mutex<TrackerState>,
}

impl TokenTracker {
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// Gate a request before it reaches an adapter.
    ///
    /// Checks run in order: per-request tokens, session tokens, session
    /// cost, daily cost, then the 60-second rate window. An allowed call
    /// stamps the window.
    pub fn check_budget(
        &self,
        session_id: &str,
        estimated_tokens: u64,
        estimated_cost: f64,
    ) -> BudgetDecision {
        self.check_budget_at(Instant::now(), session_id, estimated_tokens, estimated_cost)
    }

    fn check_budget_at(
        &self,
        now: Instant,
        session_id: &str,
        estimated_tokens: u64,
        estimated_cost: f64,
    ) -> BudgetDecision {
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        let daily = state.daily.get(&day_key()).copied().unwrap_or_default();
        let session = state.sessions.entry(session_id.to_string()).or_default();

        while let Some(front) = session.request_times.front() {
            if now.duration_since(*front) >= RATE_WINDOW {
                session.request_times.pop_front();
            } else {
                break;
            }
        }

        if estimated_tokens > self.budget.max_tokens_per_request {
            return BudgetDecision::deny("per-request-exceeded");
        }
        if session.total_tokens + estimated_tokens > self.budget.max_tokens_per_session {
            return BudgetDecision::deny("session-tokens-exceeded");
        }
        if session.cost + estimated_cost > self.budget.max_cost_per_session {
            return BudgetDecision::deny("session-cost-exceeded");
        }
        if daily.cost + estimated_cost > self.budget.max_cost_per_day {
            return BudgetDecision::deny("daily-cost-exceeded");
        }
        if session.request_times.len() >= self.budget.max_requests_per_minute {
            return BudgetDecision::deny("rate-limit-exceeded");
        }

        let decision = self.warning_for(session, &daily, estimated_tokens, estimated_cost);

        session.request_times.push_back(now);
        session.last_activity = Some(now);
        decision
    }

    fn warning_for(
        &self,
        session: &SessionUsage,
        daily: &DailyUsage,
        estimated_tokens: u64,
        estimated_cost: f64,
    ) -> BudgetDecision {
        let t = self.budget.warning_threshold;
        let projected_tokens = (session.total_tokens + estimated_tokens) as f64;
        if projected_tokens >= t * self.budget.max_tokens_per_session as f64 {
            return BudgetDecision::warn("approaching-session-token-limit");
        }
        if session.cost + estimated_cost >= t * self.budget.max_cost_per_session {
            return BudgetDecision::warn("approaching-session-cost-limit");
        }
        if daily.cost + estimated_cost >= t * self.budget.max_cost_per_day {
            return BudgetDecision::warn("approaching-daily-cost-limit");
        }
        if session.request_times.len() + 1
            >= (t * self.budget.max_requests_per_minute as f64).ceil() as usize
        {
            return BudgetDecision::warn("approaching-rate-limit");
        }
        BudgetDecision::allow()
    }

    /// Record actual usage after a completed request, attributed to the
    /// serving model family
    pub fn track_request(
        &self,
        session_id: &str,
        usage: &Usage,
        thinking_tokens: u64,
        cost: f64,
        model_family: &str,
    ) {
        self.track_request_at(
            Instant::now(),
            session_id,
            usage,
            thinking_tokens,
            cost,
            model_family,
        )
    }

    fn track_request_at(
        &self,
        now: Instant,
        session_id: &str,
        usage: &Usage,
        thinking_tokens: u64,
        cost: f64,
        model_family: &str,
    ) {
        let mut state = self.state.lock().expect("tracker mutex poisoned");

        let session = state.sessions.entry(session_id.to_string()).or_default();
        session.prompt_tokens += usage.prompt_tokens;
        session.completion_tokens += usage.completion_tokens;
        session.thinking_tokens += thinking_tokens;
        session.total_tokens += usage.total_tokens + thinking_tokens;
        session.cost += cost;
        session.last_activity = Some(now);

        let daily = state.daily.entry(day_key()).or_default();
        daily.total_tokens += usage.total_tokens + thinking_tokens;
        daily.cost += cost;

        let family = state.families.entry(model_family.to_string()).or_default();
        family.total_tokens += usage.total_tokens + thinking_tokens;
        family.cost += cost;

        debug!(
            session = %session_id,
            family = %model_family,
            tokens = usage.total_tokens,
            cost,
            "tracked request usage"
        );
    }

    /// Per-family aggregates since process start
    pub fn family_usage(&self, model_family: &str) -> Option<FamilyUsage> {
        let state = self.state.lock().expect("tracker mutex poisoned");
        state.families.get(model_family).copied()
    }

    pub fn session_usage(&self, session_id: &str) -> Option<SessionSnapshot> {
        let state = self.state.lock().expect("tracker mutex poisoned");
        state.sessions.get(session_id).map(|s| SessionSnapshot {
            prompt_tokens: s.prompt_tokens,
            completion_tokens: s.completion_tokens,
            thinking_tokens: s.thinking_tokens,
            total_tokens: s.total_tokens,
            cost: s.cost,
        })
    }

    /// Today's (UTC) aggregate
    pub fn daily_usage(&self) -> DailyUsage {
        let state = self.state.lock().expect("tracker mutex poisoned");
        state.daily.get(&day_key()).copied().unwrap_or_default()
    }

    pub fn reset_session(&self, session_id: &str) {
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        state.sessions.remove(session_id);
    }

    /// Drop sessions idle longer than `max_age`; returns how many were removed
    pub fn cleanup_sessions(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        let before = state.sessions.len();
        state.sessions.retain(|_, s| match s.last_activity {
            Some(t) => now.duration_since(t) <= max_age,
            None => false,
        });
        before - state.sessions.len()
    }
}

fn day_key() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
