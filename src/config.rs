use std::{path::PathBuf, str::FromStr, time::Duration};

// Piece selection policy, see piece::strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    Sequential,
    Random,
    RarestFirst,
    #[default]
    Smart,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(StrategyKind::Sequential),
            "random" => Ok(StrategyKind::Random),
            "rarest-first" => Ok(StrategyKind::RarestFirst),
            "smart" => Ok(StrategyKind::Smart),
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Sequential => write!(f, "sequential"),
            StrategyKind::Random => write!(f, "random"),
            StrategyKind::RarestFirst => write!(f, "rarest-first"),
            StrategyKind::Smart => write!(f, "smart"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Directory downloaded files are written into.
    pub output_dir: PathBuf,

    // Port reported to the tracker.
    pub port: u16,

    // Cap on concurrent peer sessions.
    pub max_peers: usize,

    // Cap on outstanding block requests per peer.
    pub max_inflight_per_peer: usize,

    // Cap on needed pieces considered per coordinator cycle.
    pub max_pieces_per_cycle: usize,

    pub strategy: StrategyKind,

    pub dial_timeout: Duration,

    pub handshake_timeout: Duration,

    // A session whose socket stays silent this long is closed.
    pub read_idle_timeout: Duration,

    // Keep-alive is sent after this much send idleness.
    pub keep_alive_interval: Duration,

    // Outstanding requests older than this are evicted for re-issue.
    pub request_timeout: Duration,

    pub cycle_interval: Duration,

    pub sweep_interval: Duration,

    pub pool_cleanup_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            port: 6881,
            max_peers: 50,
            max_inflight_per_peer: 10,
            max_pieces_per_cycle: 500,
            strategy: StrategyKind::default(),
            dial_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            read_idle_timeout: Duration::from_secs(5 * 60),
            keep_alive_interval: Duration::from_secs(2 * 60),
            request_timeout: Duration::from_secs(15),
            cycle_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(10),
            pool_cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("sequential".parse(), Ok(StrategyKind::Sequential));
        assert_eq!("rarest-first".parse(), Ok(StrategyKind::RarestFirst));
        assert_eq!("smart".parse(), Ok(StrategyKind::Smart));
        assert!("nope".parse::<StrategyKind>().is_err());
    }
}
