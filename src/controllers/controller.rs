use crate::metrics::{Diagnostics, Metrics};

use std::sync::Arc;
use tokio::sync::RwLock;

use super::{client::SandboxClient, credentials::NodeSelector};

// Context for the reconciler
#[derive(Clone)]
pub struct Context {
    /// Object store and exec access used by the reconcile loop
    pub sandbox: Arc<dyn SandboxClient>,
    /// Picks the node a node-port sandbox is reached through
    pub node_selector: Arc<dyn NodeSelector>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prom metrics
    pub metrics: Metrics,
}
