use serde::{Deserialize, Serialize};

use crate::{build::BuildEvent, deploy::DeployEvent, domain::Stage, simulate::SimulateEvent};

/// Wire frame as received: `{"stage": ..., "type": ..., "data": {...}}`.
///
/// The stage tag is split off first so each stage keeps its own event
/// vocabulary; the remaining `{type, data}` pair deserializes into the
/// matching stage event enum.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    pub stage: Stage,
    #[serde(flatten)]
    pub body: serde_json::Value,
}

/// A fully parsed inbound event, tagged with the stage it belongs to.
#[derive(Debug, Clone)]
pub enum StageEvent {
    Build(BuildEvent),
    Simulate(SimulateEvent),
    Deploy(DeployEvent),
}

impl StageEvent {
    pub fn stage(&self) -> Stage {
        match self {
            StageEvent::Build(_) => Stage::Build,
            StageEvent::Simulate(_) => Stage::Simulate,
            StageEvent::Deploy(_) => Stage::Deploy,
        }
    }
}

/// Outbound client frames. The backend only ever reacts to keepalive pings;
/// everything else travels over REST.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
}
