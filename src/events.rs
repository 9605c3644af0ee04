//! Event marker extraction (§4.F).
//!
//! The assistant communicates structured signals by embedding
//! `<event topic="NAME">PAYLOAD</event>` markers in its output.

use crate::models::Event;
use regex::Regex;
use std::sync::OnceLock;

fn event_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?s)<event\s+topic="([^"]+)">(.*?)</event>"#).expect("valid event regex")
    })
}

/// Extract all event markers from `output`, in lexical order. Nested or
/// malformed tags are simply not matched by the pattern, so they are
/// silently ignored rather than erroring.
pub fn parse_events(output: &str) -> Vec<Event> {
    event_pattern()
        .captures_iter(output)
        .map(|caps| Event {
            topic: caps[1].trim().to_string(),
            payload: caps[2].trim().to_string(),
        })
        .collect()
}

const COMPLETION_TOPICS: [&str; 2] = ["build.done", "init.done"];
const BLOCKED_TOPIC: &str = "build.blocked";

pub fn has_completion(events: &[Event]) -> bool {
    events
        .iter()
        .any(|e| COMPLETION_TOPICS.contains(&e.topic.as_str()))
}

pub fn has_blocked(events: &[Event]) -> bool {
    events.iter().any(|e| e.topic == BLOCKED_TOPIC)
}

/// The first completion event, if any.
pub fn completion_event(events: &[Event]) -> Option<&Event> {
    events
        .iter()
        .find(|e| COMPLETION_TOPICS.contains(&e.topic.as_str()))
}

pub fn event_payload<'a>(events: &'a [Event], topic: &str) -> Option<&'a str> {
    events
        .iter()
        .find(|e| e.topic == topic)
        .map(|e| e.payload.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_markers_in_order() {
        let output = r#"working...
<event topic="build.done">tests: pass, lint: pass</event>
trailing text
<event topic="memory.store">remember this</event>
"#;
        let events = parse_events(output);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].topic, "build.done");
        assert_eq!(events[0].payload, "tests: pass, lint: pass");
        assert_eq!(events[1].topic, "memory.store");
    }

    #[test]
    fn ignores_malformed_tags() {
        let output = "<event topic=build.done>no quotes</event> <event>no topic</event>";
        assert!(parse_events(output).is_empty());
    }

    #[test]
    fn completion_and_blocked_helpers() {
        let events = parse_events(r#"<event topic="init.done">plan ready</event>"#);
        assert!(has_completion(&events));
        assert!(!has_blocked(&events));

        let blocked = parse_events(r#"<event topic="build.blocked">stuck</event>"#);
        assert!(has_blocked(&blocked));
        assert!(!has_completion(&blocked));
    }

    #[test]
    fn no_events_present() {
        assert!(parse_events("just plain output, no markers").is_empty());
    }
}
