use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use shared::{domain::AgentId, protocol::Agent};
use tokio::{
    sync::{broadcast, Mutex},
    time::{interval, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tracing::warn;

use crate::{backend::ChatBackend, scheduler::ScheduledTask, ClientEvent};

pub const PLACEHOLDER_AVATAR: &str = "default-agent-avatar";

pub const THINKING_PHRASES: &[&str] = &[
    "Thinking",
    "Reading your message",
    "Gathering context",
    "Drafting a reply",
    "Polishing the answer",
];

pub fn phrase_for_tick(tick: u64) -> &'static str {
    let index = usize::try_from(tick).unwrap_or(0) % THINKING_PHRASES.len();
    THINKING_PHRASES[index]
}

pub fn avatar_for(agent: Option<&Agent>) -> String {
    agent
        .and_then(|agent| agent.avatar_url.as_deref())
        .filter(|url| !url.trim().is_empty())
        .unwrap_or(PLACEHOLDER_AVATAR)
        .to_string()
}

/// Caches agent details fetched from the backend. Lookup failures are not
/// cached so a later send can retry.
#[derive(Clone)]
pub struct AgentDirectory {
    backend: Arc<dyn ChatBackend>,
    cache: Arc<Mutex<HashMap<AgentId, Agent>>>,
}

impl AgentDirectory {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn resolve(&self, agent_id: AgentId) -> Option<Agent> {
        if let Some(agent) = self.cache.lock().await.get(&agent_id) {
            return Some(agent.clone());
        }
        match self.backend.get_agent(agent_id).await {
            Ok(agent) => {
                self.cache.lock().await.insert(agent_id, agent.clone());
                Some(agent)
            }
            Err(err) => {
                warn!(agent_id = agent_id.0, error = %err, "agent lookup failed; using placeholder avatar");
                None
            }
        }
    }
}

/// Rotating status line shown while a send is waiting on the backend.
/// Stops on `stop()` or drop; `ThinkingStopped` is emitted exactly once.
pub struct ThinkingIndicator {
    task: ScheduledTask,
    events: broadcast::Sender<ClientEvent>,
    stopped: bool,
}

impl ThinkingIndicator {
    pub fn start(
        agents: AgentDirectory,
        agent_id: AgentId,
        period: Duration,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let sink = events.clone();
        let task = ScheduledTask::spawn("thinking-indicator", async move {
            let avatar = avatar_for(agents.resolve(agent_id).await.as_ref());
            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = IntervalStream::new(ticker).enumerate();
            while let Some((tick, _)) = ticks.next().await {
                let _ = sink.send(ClientEvent::Thinking {
                    text: phrase_for_tick(tick as u64).to_string(),
                    avatar: avatar.clone(),
                });
            }
        });
        Self {
            task,
            events,
            stopped: false,
        }
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.task.cancel();
        let _ = self.events.send(ClientEvent::ThinkingStopped);
    }
}

impl Drop for ThinkingIndicator {
    fn drop(&mut self) {
        self.halt();
    }
}
