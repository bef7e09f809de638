//! Frame demultiplexing.
//!
//! Inbound text frames become [`StageEvent`]s in two steps: the stage tag is
//! split off, then the remaining `{type, data}` pair is decoded against that
//! stage's event vocabulary. Frames without a stage tag are backend control
//! chatter (`connected`, `pong`) and are dropped quietly; frames whose
//! payload does not decode are logged and dropped rather than tearing
//! anything down. Stage-tagged frames with an unrecognized `type` become the
//! stage's catch-all variant and no-op in the reducer.

use shared::domain::Stage;
use shared::envelope::{RawEnvelope, StageEvent};
use shared::{build::BuildEvent, deploy::DeployEvent, simulate::SimulateEvent};
use tracing::{debug, trace, warn};

/// Decode a raw text frame, keeping it only if it belongs to `active`.
pub fn route(text: &str, active: Stage) -> Option<StageEvent> {
    let event = decode_frame(text)?;
    if event.stage() != active {
        debug!(frame_stage = %event.stage(), active = %active, "dropping cross-stage frame");
        return None;
    }
    Some(event)
}

pub fn decode_frame(text: &str) -> Option<StageEvent> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "dropping malformed frame");
            return None;
        }
    };
    if value.get("stage").is_none() {
        // Connection banner, pong, and the like.
        trace!("dropping stageless control frame");
        return None;
    }

    let envelope: RawEnvelope = match serde_json::from_value(value) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "dropping frame with unrecognized stage");
            return None;
        }
    };
    let kind = envelope
        .body
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_owned);

    let event = match envelope.stage {
        Stage::Build => serde_json::from_value(envelope.body).map(StageEvent::Build),
        Stage::Simulate => serde_json::from_value(envelope.body).map(StageEvent::Simulate),
        Stage::Deploy => serde_json::from_value(envelope.body).map(StageEvent::Deploy),
    };

    match event {
        Ok(event) => Some(event),
        Err(err) => {
            if let Some(kind) = &kind {
                if is_unrecognized_type(&err, kind) {
                    debug!(stage = %envelope.stage, event_type = %kind, "unrecognized event type");
                    return Some(unknown_event(envelope.stage));
                }
            }
            warn!(stage = %envelope.stage, error = %err, "dropping undecodable stage frame");
            None
        }
    }
}

/// serde reports an unrecognized tag as ``unknown variant `<tag>`, ...``.
/// Anchoring on the frame's own `type` keeps unknown variants nested inside
/// `data` (a bad status string, say) on the malformed path.
fn is_unrecognized_type(err: &serde_json::Error, kind: &str) -> bool {
    err.to_string()
        .starts_with(&format!("unknown variant `{kind}`"))
}

fn unknown_event(stage: Stage) -> StageEvent {
    match stage {
        Stage::Build => StageEvent::Build(BuildEvent::Unknown),
        Stage::Simulate => StageEvent::Simulate(SimulateEvent::Unknown),
        Stage::Deploy => StageEvent::Deploy(DeployEvent::Unknown),
    }
}
