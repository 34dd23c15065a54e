// SPDX-License-Identifier: MIT OR Apache-2.0
//! Provenance taint.
//!
//! A session event is tainted when its own label marks untrusted origin
//! (`"external"`) or when any earlier event in the session is tainted. A
//! derived taint carries the id of the most recent tainted predecessor.
//! Taint is recomputed from the chain by every verifier; the recorded blocks
//! are never trusted on their own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use settld_chain::ChainedEvent;

/// Label marking untrusted origin.
pub const EXTERNAL_LABEL: &str = "external";

/// Recorded provenance block inside `payload.provenance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// Source label (`"external"`, `"internal"`, …), when declared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Whether this event is tainted.
    pub is_tainted: bool,
    /// The most recent tainted predecessor, when taint was inherited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derived_from_event_id: Option<String>,
}

fn recorded(event: &ChainedEvent) -> Option<Provenance> {
    event
        .payload
        .get("provenance")
        .and_then(|p| serde_json::from_value(p.clone()).ok())
}

fn label_of(event: &ChainedEvent) -> Option<String> {
    event
        .payload
        .get("provenance")
        .and_then(|p| p.get("label"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Compute the expected provenance of every event from the chain alone.
///
/// Events with neither a label nor inherited taint get `None` — an absent
/// provenance block is correct for them.
#[must_use]
pub fn expected_provenance(events: &[ChainedEvent]) -> Vec<Option<Provenance>> {
    let mut out = Vec::with_capacity(events.len());
    let mut last_tainted: Option<String> = None;
    for event in events {
        let label = label_of(event);
        let source_tainted = label.as_deref() == Some(EXTERNAL_LABEL);
        let inherited = last_tainted.clone();
        let is_tainted = source_tainted || inherited.is_some();

        let expected = if is_tainted || label.is_some() {
            Some(Provenance {
                label,
                is_tainted,
                derived_from_event_id: inherited,
            })
        } else {
            None
        };
        if is_tainted {
            last_tainted = Some(event.id.clone());
        }
        out.push(expected);
    }
    out
}

/// Provenance to stamp on the next event of a session, given its history and
/// the caller-declared label.
///
/// Returns `None` when no block is needed (no label, no inherited taint).
#[must_use]
pub fn stamp_for_next(prior: &[ChainedEvent], label: Option<&str>) -> Option<Provenance> {
    let mut last_tainted: Option<String> = None;
    for event in prior {
        let tainted = recorded(event).is_some_and(|p| p.is_tainted)
            || label_of(event).as_deref() == Some(EXTERNAL_LABEL);
        if tainted {
            last_tainted = Some(event.id.clone());
        }
    }
    let source_tainted = label == Some(EXTERNAL_LABEL);
    let is_tainted = source_tainted || last_tainted.is_some();
    if !is_tainted && label.is_none() {
        return None;
    }
    Some(Provenance {
        label: label.map(str::to_string),
        is_tainted,
        derived_from_event_id: last_tainted,
    })
}

/// Count of tainted events according to the recorded blocks.
#[must_use]
pub fn recorded_tainted_count(events: &[ChainedEvent]) -> u64 {
    events
        .iter()
        .filter(|e| recorded(e).is_some_and(|p| p.is_tainted))
        .count() as u64
}

/// Compare recorded provenance against the recomputed expectation.
///
/// Returns the index of the first disagreeing event, or `None` when all
/// recorded blocks match.
#[must_use]
pub fn first_provenance_mismatch(events: &[ChainedEvent]) -> Option<usize> {
    let expected = expected_provenance(events);
    for (i, (event, expect)) in events.iter().zip(&expected).enumerate() {
        let got = recorded(event);
        let matches = match (expect, &got) {
            (None, None) => true,
            // An untainted label-only block may be recorded or omitted.
            (Some(e), None) => !e.is_tainted,
            (None, Some(g)) => !g.is_tainted,
            (Some(e), Some(g)) => {
                e.is_tainted == g.is_tainted
                    && e.derived_from_event_id == g.derived_from_event_id
            }
        };
        if !matches {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use settld_chain::{ChainedEventDraft, EventActor};

    fn event(prev: Option<String>, payload: Value) -> ChainedEvent {
        ChainedEventDraft::new(
            "sess_test",
            "MESSAGE",
            EventActor::new("agent", "agt_a"),
            payload,
            None,
        )
        .unwrap()
        .finalize(prev, None)
        .unwrap()
    }

    fn chain(payloads: Vec<Value>) -> Vec<ChainedEvent> {
        let mut events: Vec<ChainedEvent> = Vec::new();
        for payload in payloads {
            let prev = events.last().map(|e| e.chain_hash.clone());
            events.push(event(prev, payload));
        }
        events
    }

    #[test]
    fn untainted_session_expects_no_blocks() {
        let events = chain(vec![json!({"a": 1}), json!({"b": 2})]);
        assert!(expected_provenance(&events).iter().all(Option::is_none));
        assert_eq!(first_provenance_mismatch(&events), None);
        assert_eq!(recorded_tainted_count(&events), 0);
    }

    #[test]
    fn external_label_taints_source_and_descendants() {
        let events = chain(vec![
            json!({"provenance": {"label": "external"}}),
            json!({"x": 1}),
            json!({"y": 2}),
        ]);
        let expected = expected_provenance(&events);
        let p0 = expected[0].as_ref().unwrap();
        assert!(p0.is_tainted);
        assert_eq!(p0.derived_from_event_id, None);

        let p1 = expected[1].as_ref().unwrap();
        assert!(p1.is_tainted);
        assert_eq!(p1.derived_from_event_id.as_deref(), Some(events[0].id.as_str()));

        // The nearest tainted ancestor of the third event is the second.
        let p2 = expected[2].as_ref().unwrap();
        assert_eq!(p2.derived_from_event_id.as_deref(), Some(events[1].id.as_str()));
    }

    #[test]
    fn stamp_matches_expectation() {
        let mut events: Vec<ChainedEvent> = Vec::new();
        for (label, body) in [
            (Some(EXTERNAL_LABEL), json!({"m": 1})),
            (None, json!({"m": 2})),
        ] {
            let stamp = stamp_for_next(&events, label);
            let mut payload = body;
            if let Some(stamp) = &stamp {
                payload["provenance"] = serde_json::to_value(stamp).unwrap();
            }
            let prev = events.last().map(|e| e.chain_hash.clone());
            events.push(event(prev, payload));
        }
        assert_eq!(first_provenance_mismatch(&events), None);
        assert_eq!(recorded_tainted_count(&events), 2);
    }

    #[test]
    fn forged_clean_taint_is_detected() {
        let events = chain(vec![
            json!({"provenance": {"label": "external", "isTainted": true}}),
            // Forged: claims untainted despite the tainted predecessor.
            json!({"provenance": {"isTainted": false}}),
        ]);
        assert_eq!(first_provenance_mismatch(&events), Some(1));
    }

    #[test]
    fn non_external_label_alone_is_not_taint() {
        let events = chain(vec![json!({"provenance": {"label": "internal", "isTainted": false}})]);
        assert_eq!(first_provenance_mismatch(&events), None);
        assert_eq!(recorded_tainted_count(&events), 0);
    }
}
