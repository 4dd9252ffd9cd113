use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// A listing page that grows as the user scrolls or presses "show more".
#[async_trait]
pub trait InfiniteList: Send + Sync {
    /// `(item_count, page_height)` right now.
    async fn snapshot(&self) -> Result<(usize, u64)>;
    /// Clicks a visible "show more" control; `false` when there is none.
    async fn click_load_more(&self) -> Result<bool>;
    async fn scroll_burst(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ScrollPolicy {
    /// Consecutive non-growing polls before an extra burst is spent.
    pub calm_rounds: usize,
    pub max_rounds: usize,
    pub max_no_growth_bursts: usize,
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            calm_rounds: 3,
            max_rounds: 60,
            max_no_growth_bursts: 3,
            poll_timeout: Duration::from_secs(6),
            poll_interval: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Stagnated,
    MaxRounds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollOutcome {
    pub rounds: usize,
    pub final_count: usize,
    pub reason: StopReason,
}

async fn poll_for_growth<L: InfiniteList + ?Sized>(
    list: &L,
    before: (usize, u64),
    policy: &ScrollPolicy,
) -> Result<((usize, u64), bool)> {
    let deadline = Instant::now() + policy.poll_timeout;
    let mut current = list.snapshot().await?;
    loop {
        if current.0 > before.0 || current.1 > before.1 {
            return Ok((current, true));
        }
        if Instant::now() >= deadline {
            return Ok((current, false));
        }
        sleep(policy.poll_interval).await;
        current = list.snapshot().await?;
    }
}

/// Keeps loading until the list stops growing.
///
/// Every round tries "show more" first and scrolls otherwise, then polls for
/// growth in either the item count or the document height. After
/// `calm_rounds` quiet rounds one more burst is spent; the loop ends once
/// `max_no_growth_bursts` of those bursts also changed nothing.
pub async fn scroll_until_exhausted<L: InfiniteList + ?Sized>(
    list: &L,
    policy: &ScrollPolicy,
) -> Result<ScrollOutcome> {
    let mut state = list.snapshot().await?;
    let mut calm = 0;
    let mut fruitless_bursts = 0;
    let mut rounds = 0;

    while rounds < policy.max_rounds {
        rounds += 1;

        if !list.click_load_more().await? {
            list.scroll_burst().await?;
        }

        let (next, grew) = poll_for_growth(list, state, policy).await?;
        if grew {
            debug!(
                "Round {}: {} -> {} items (height {} -> {})",
                rounds, state.0, next.0, state.1, next.1
            );
            state = next;
            calm = 0;
            fruitless_bursts = 0;
            continue;
        }

        calm += 1;
        if calm < policy.calm_rounds {
            continue;
        }

        list.scroll_burst().await?;
        let (next, grew) = poll_for_growth(list, state, policy).await?;
        if grew {
            state = next;
            calm = 0;
            fruitless_bursts = 0;
            continue;
        }

        fruitless_bursts += 1;
        calm = 0;
        if fruitless_bursts >= policy.max_no_growth_bursts {
            info!(
                "Listing stopped growing at {} items after {} rounds",
                state.0, rounds
            );
            return Ok(ScrollOutcome {
                rounds,
                final_count: state.0,
                reason: StopReason::Stagnated,
            });
        }
    }

    info!("Listing reached the {} round limit with {} items", policy.max_rounds, state.0);
    Ok(ScrollOutcome {
        rounds,
        final_count: state.0,
        reason: StopReason::MaxRounds,
    })
}
