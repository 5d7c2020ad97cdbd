//! State every loop of a node shares

use hubchat_core::Transcript;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::NodeEvent;
use crate::tasks::Tasks;

#[derive(Debug, Clone)]
pub(crate) struct Context {
    pub username: String,
    pub transcript: Transcript,
    pub events: mpsc::UnboundedSender<NodeEvent>,
    pub tasks: Tasks,
    /// Raised once, by `Node::shutdown` or a fatal failover error
    pub shutdown: CancellationToken,
}

impl Context {
    pub fn new(username: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ctx = Self {
            username: username.into(),
            transcript: Transcript::new(),
            events,
            tasks: Tasks::default(),
            shutdown: CancellationToken::new(),
        };
        (ctx, rx)
    }

    /// Surface a status line. Nobody listening is fine.
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
