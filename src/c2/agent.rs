use crate::c2::command::Command;
use crate::protocol::Handler;
use log::warn;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::SystemTime;

/// A malware client that has connected to one of the emulated servers.
pub struct Agent {
    pub id: String,
    pub addr: SocketAddr,
    last_seen: Mutex<SystemTime>,
    handler: Weak<dyn Handler>,
}

impl Agent {
    pub fn last_seen(&self) -> SystemTime {
        *self.last_seen.lock().unwrap()
    }

    /// Route an operator command to the agent's connection. Handler
    /// operator methods may block on protocol acknowledgements, so the
    /// dispatch runs on its own thread, fire-and-forget.
    #[allow(dead_code)]
    pub fn send_command(&self, command: Command) {
        let handler = match self.handler.upgrade() {
            Some(h) => h,
            None => {
                warn!("agent {} is no longer connected", self.id);
                return;
            }
        };

        thread::spawn(move || match command {
            Command::Execute { name, args } => handler.execute(&name, &args),
            Command::Upload {
                source,
                destination,
            } => handler.upload(&source, &destination),
            Command::Download {
                source,
                destination,
            } => handler.download(&source, &destination),
        });
    }
}

/// Keyed store of every agent the server has seen. The sole resource
/// shared across connections; the mutex serialises insert-or-refresh
/// against lookups from other connections.
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, Arc<Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        AgentRegistry {
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Register a sighting. A new ID creates the agent; a repeat
    /// sighting only bumps its last-seen time.
    pub fn add_agent(&self, id: &str, addr: SocketAddr, handler: Weak<dyn Handler>) {
        let mut agents = self.agents.lock().unwrap();

        match agents.get(id) {
            Some(agent) => {
                *agent.last_seen.lock().unwrap() = SystemTime::now();
            }
            None => {
                agents.insert(
                    id.to_string(),
                    Arc::new(Agent {
                        id: id.to_string(),
                        addr,
                        last_seen: Mutex::new(SystemTime::now()),
                        handler,
                    }),
                );
            }
        }
    }

    #[allow(dead_code)]
    pub fn agent_by_id(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.lock().unwrap().get(id).cloned()
    }

    /// Every agent seen so far, ordered by ID for stable listings.
    pub fn agents(&self) -> Vec<Arc<Agent>> {
        let mut agents: Vec<Arc<Agent>> =
            self.agents.lock().unwrap().values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.agents.lock().unwrap().is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        AgentRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_addr() -> SocketAddr {
        "10.0.0.1:4444".parse().unwrap()
    }

    fn no_handler() -> Weak<dyn Handler> {
        let handler: Arc<dyn Handler> = Arc::new(crate::protocol::generic::Handler::new());
        // Downgrade of a dropped Arc: an agent with no live connection.
        let weak = Arc::downgrade(&handler);
        drop(handler);
        weak
    }

    #[test]
    fn test_add_agent_registers_once() {
        let registry = AgentRegistry::new();

        registry.add_agent("abc", test_addr(), no_handler());
        registry.add_agent("def", test_addr(), no_handler());

        assert_eq!(registry.len(), 2);
        assert!(registry.agent_by_id("abc").is_some());
        assert!(registry.agent_by_id("missing").is_none());
    }

    #[test]
    fn test_repeat_sighting_updates_last_seen_without_duplicating() {
        let registry = AgentRegistry::new();

        registry.add_agent("abc", test_addr(), no_handler());
        let first_seen = registry.agent_by_id("abc").unwrap().last_seen();

        std::thread::sleep(Duration::from_millis(20));
        registry.add_agent("abc", test_addr(), no_handler());

        assert_eq!(registry.len(), 1);
        let second_seen = registry.agent_by_id("abc").unwrap().last_seen();
        assert!(second_seen > first_seen);
    }

    #[test]
    fn test_agents_sorted_by_id() {
        let registry = AgentRegistry::new();

        registry.add_agent("zz", test_addr(), no_handler());
        registry.add_agent("aa", test_addr(), no_handler());

        let ids: Vec<String> = registry.agents().iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec!["aa", "zz"]);
    }

    #[test]
    fn test_send_command_to_disconnected_agent_is_harmless() {
        let registry = AgentRegistry::new();
        registry.add_agent("gone", test_addr(), no_handler());

        registry.agent_by_id("gone").unwrap().send_command(Command::Execute {
            name: "whoami".to_string(),
            args: Vec::new(),
        });
    }
}
