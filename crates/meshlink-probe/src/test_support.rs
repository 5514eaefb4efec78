//! Scripted agents for unit tests.

use crate::agent::{AgentBuilder, AgentState, Candidate, Credentials, IceAgent};
use crate::error::{ProbeError, Result};
use async_trait::async_trait;
use meshlink_core::{CoreError, Endpoint, PeerId, Shutdown, Transport, TransportKind};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub struct NullTransport {
    closed: AtomicBool,
}

impl NullTransport {
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for NullTransport {
    async fn write(&self, buf: &[u8]) -> meshlink_core::Result<usize> {
        Ok(buf.len())
    }
    async fn read(&self, _buf: &mut [u8]) -> meshlink_core::Result<usize> {
        Err(CoreError::Closed)
    }
    fn remote_addr(&self) -> String {
        "127.0.0.1:9".into()
    }
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }
    fn endpoint(&self) -> Endpoint {
        Endpoint::Direct(([127, 0, 0, 1], 9).into())
    }
    async fn close(&self) -> meshlink_core::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Shared record of what scripted agents did
#[derive(Default)]
pub struct Script {
    pub role: Mutex<Option<&'static str>>,
    pub builds: AtomicU32,
    pub fail_checks: AtomicBool,
}

pub struct ScriptedAgent {
    tie_breaker: u64,
    candidates: Vec<Candidate>,
    script: Arc<Script>,
    state: watch::Sender<AgentState>,
}

impl ScriptedAgent {
    fn finish(&self, role: &'static str) -> Result<Arc<dyn Transport>> {
        *self.script.role.lock().unwrap() = Some(role);
        if self.script.fail_checks.load(Ordering::SeqCst) {
            self.state.send_replace(AgentState::Failed);
            return Err(ProbeError::Agent("scripted check failure".into()));
        }
        self.state.send_replace(AgentState::Connected);
        Ok(Arc::new(NullTransport::new()))
    }
}

#[async_trait]
impl IceAgent for ScriptedAgent {
    fn credentials(&self) -> Credentials {
        Credentials {
            ufrag: "ufrag".into(),
            pwd: "pwd".into(),
        }
    }
    fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }
    async fn gather(&self) -> Result<Vec<Candidate>> {
        Ok(self.candidates.clone())
    }
    fn add_remote_candidate(&self, _candidate: Candidate) {}
    async fn dial(&self, _remote: &Credentials, _shutdown: &Shutdown) -> Result<Arc<dyn Transport>> {
        self.finish("dial")
    }
    async fn accept(&self, _remote: &Credentials, _shutdown: &Shutdown) -> Result<Arc<dyn Transport>> {
        self.finish("accept")
    }
    fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }
    async fn close(&self) {
        self.state.send_replace(AgentState::Closed);
    }
}

pub struct ScriptedBuilder {
    pub tie_breaker: u64,
    pub candidates: usize,
    pub script: Arc<Script>,
}

impl ScriptedBuilder {
    pub fn new(tie_breaker: u64, candidates: usize) -> (Self, Arc<Script>) {
        let script = Arc::new(Script::default());
        (
            Self {
                tie_breaker,
                candidates,
                script: script.clone(),
            },
            script,
        )
    }
}

#[async_trait]
impl AgentBuilder for ScriptedBuilder {
    async fn build(&self, _local: PeerId, _remote: PeerId) -> Result<Arc<dyn IceAgent>> {
        self.script.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedAgent {
            tie_breaker: self.tie_breaker,
            candidates: (0..self.candidates)
                .map(|i| Candidate::host(([127, 0, 0, 1], 4000 + i as u16).into()))
                .collect(),
            script: self.script.clone(),
            state: watch::channel(AgentState::New).0,
        }))
    }
}
