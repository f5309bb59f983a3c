use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Placement strategy for candidate nodes.
///
/// `Best` is best-fit: the smallest remaining capacity that still satisfies
/// the request. `Largest` is worst-fit: the most remaining capacity, which
/// lowers the failure rate under skewed load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Best,
    Largest,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Best => "best",
            Strategy::Largest => "largest",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best" => Ok(Strategy::Best),
            "largest" => Ok(Strategy::Largest),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// Candidate ordering the gateway applies when selecting a node.
/// Ties are always broken by lowest node id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementOrder {
    RemainingAsc,
    RemainingDesc,
}

/// A request at or above `ratio * node_budget` is "large" and is steered to
/// the emptiest node regardless of strategy, so best-fit packing cannot
/// fragment it out of the pool.
pub fn is_large(tokens: i64, ratio: f64, node_budget: i64) -> bool {
    tokens as f64 >= ratio * node_budget as f64
}

/// Resolves the candidate ordering for one allocation call. The strategy is
/// read once by the caller; the large-request override wins over it.
pub fn placement_order(strategy: Strategy, large_request: bool) -> PlacementOrder {
    if large_request {
        return PlacementOrder::RemainingDesc;
    }
    match strategy {
        Strategy::Best => PlacementOrder::RemainingAsc,
        Strategy::Largest => PlacementOrder::RemainingDesc,
    }
}

/// Process-wide strategy cell.
///
/// A load observes either the old or the new value; allocations in flight
/// keep whichever value they read at entry.
pub struct StrategyCell(AtomicU8);

const STRATEGY_BEST: u8 = 0;
const STRATEGY_LARGEST: u8 = 1;

impl StrategyCell {
    pub fn new(initial: Strategy) -> Self {
        Self(AtomicU8::new(encode(initial)))
    }

    pub fn get(&self) -> Strategy {
        decode(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, value: Strategy) {
        self.0.store(encode(value), Ordering::SeqCst);
    }
}

fn encode(s: Strategy) -> u8 {
    match s {
        Strategy::Best => STRATEGY_BEST,
        Strategy::Largest => STRATEGY_LARGEST,
    }
}

fn decode(v: u8) -> Strategy {
    match v {
        STRATEGY_LARGEST => Strategy::Largest,
        _ => Strategy::Best,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_strategies() {
        assert_eq!("best".parse::<Strategy>().unwrap(), Strategy::Best);
        assert_eq!("LARGEST".parse::<Strategy>().unwrap(), Strategy::Largest);
        assert!("firstfit".parse::<Strategy>().is_err());
    }

    #[test]
    fn ordering_follows_strategy_for_small_requests() {
        assert_eq!(
            placement_order(Strategy::Best, false),
            PlacementOrder::RemainingAsc
        );
        assert_eq!(
            placement_order(Strategy::Largest, false),
            PlacementOrder::RemainingDesc
        );
    }

    #[test]
    fn large_requests_override_both_strategies() {
        assert_eq!(
            placement_order(Strategy::Best, true),
            PlacementOrder::RemainingDesc
        );
        assert_eq!(
            placement_order(Strategy::Largest, true),
            PlacementOrder::RemainingDesc
        );
    }

    #[test]
    fn threshold_is_inclusive() {
        // ratio 0.5 of budget 300 -> 150 is already large
        assert!(is_large(150, 0.5, 300));
        assert!(!is_large(149, 0.5, 300));
    }

    #[test]
    fn cell_swaps_atomically() {
        let cell = StrategyCell::new(Strategy::Best);
        assert_eq!(cell.get(), Strategy::Best);
        cell.set(Strategy::Largest);
        assert_eq!(cell.get(), Strategy::Largest);
    }
}
