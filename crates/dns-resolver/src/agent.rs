//! An "agent" is one upstream nameserver the query engine may ask:
//! its address, how long to wait for it, and its priority relative to
//! the other configured agents. [`Strategy`] picks which agent(s) a
//! query tries, and in what order.

use std::net::SocketAddr;
use std::time::Duration;

/// One upstream nameserver the resolver is configured to ask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentParams {
    pub name: String,
    pub address: SocketAddr,
    pub timeout_millis: u64,
    /// Higher is tried first under the `Priority` strategy.
    pub priority: u32,
}

impl AgentParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }
}

/// Which transport a query starts a given agent attempt on. `Tcp`
/// skips the UDP round entirely (so a caller can start a query
/// directly on TCP, per §6); `Udp` is the usual case, with truncation
/// still promoting to TCP against the same agent regardless of which
/// transport the query started on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

/// How the query engine chooses which configured agent(s) to ask, and
/// in what order, for a single question.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Try agents in descending `priority` order (higher first).
    #[default]
    Priority,
    /// Try agents in ascending configured-timeout order, on the
    /// assumption that a tighter timeout budget implies a faster
    /// server.
    Speed,
    /// Rotate the starting agent on each call.
    RoundRobin,
    /// Pick a uniformly random starting agent.
    Random,
    /// Only ever ask the agent with this name.
    Named(String),
    /// Walk the DNS delegation chain from the root instead of asking
    /// a configured agent at all.
    Iterative,
}

/// Orders `agents` according to `strategy`, for a single query
/// attempt. `round_robin_counter` is an ever-incrementing counter the
/// caller owns; each call should pass a distinct value so repeated
/// `RoundRobin` queries advance through the list.
pub fn select_order(
    agents: &[AgentParams],
    strategy: &Strategy,
    round_robin_counter: u64,
) -> Vec<AgentParams> {
    if agents.is_empty() {
        return Vec::new();
    }

    match strategy {
        Strategy::Priority => {
            let mut ordered = agents.to_vec();
            ordered.sort_by_key(|a| std::cmp::Reverse(a.priority));
            ordered
        }
        Strategy::Speed => {
            let mut ordered = agents.to_vec();
            ordered.sort_by_key(|a| a.timeout_millis);
            ordered
        }
        Strategy::RoundRobin => {
            let start = (round_robin_counter as usize) % agents.len();
            agents[start..].iter().chain(agents[..start].iter()).cloned().collect()
        }
        Strategy::Random => {
            use rand::seq::SliceRandom;
            let mut ordered = agents.to_vec();
            ordered.shuffle(&mut rand::thread_rng());
            ordered
        }
        Strategy::Named(name) => agents.iter().filter(|a| &a.name == name).cloned().collect(),
        Strategy::Iterative => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, priority: u32) -> AgentParams {
        AgentParams {
            name: name.to_string(),
            address: "127.0.0.1:53".parse().unwrap(),
            timeout_millis: 1000,
            priority,
        }
    }

    #[test]
    fn priority_orders_highest_first() {
        let agents = vec![agent("b", 2), agent("a", 1), agent("c", 3)];
        let ordered = select_order(&agents, &Strategy::Priority, 0);
        assert_eq!(vec!["c", "b", "a"], ordered.iter().map(|a| a.name.clone()).collect::<Vec<_>>());
    }

    #[test]
    fn round_robin_rotates_by_counter() {
        let agents = vec![agent("a", 0), agent("b", 0), agent("c", 0)];
        let ordered = select_order(&agents, &Strategy::RoundRobin, 1);
        assert_eq!("b", ordered[0].name);
        let ordered = select_order(&agents, &Strategy::RoundRobin, 3);
        assert_eq!("a", ordered[0].name);
    }

    #[test]
    fn named_selects_only_that_agent() {
        let agents = vec![agent("a", 0), agent("b", 0)];
        let ordered = select_order(&agents, &Strategy::Named("b".to_string()), 0);
        assert_eq!(1, ordered.len());
        assert_eq!("b", ordered[0].name);
    }

    #[test]
    fn iterative_selects_no_configured_agent() {
        let agents = vec![agent("a", 0)];
        assert!(select_order(&agents, &Strategy::Iterative, 0).is_empty());
    }
}
