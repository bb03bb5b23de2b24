//! # Query Executor
//!
//! Evaluates a parsed [`Query`] against the committed events of a topic. Events are
//! read in commit order; the predicate is evaluated against the fields of the event
//! (see [`fields`]), then OFFSET and LIMIT are applied to the matches and named
//! projections are rendered as JSON objects.

use std::collections::HashMap;

use ensign_api::rlid::Rlid;
use ensign_api::v1beta1::{Event, EventWrapper, MimeType};
use serde_json::{Map, Value};

use super::errors::Error;
use super::parser::Query;

/// Summary of an execution, used for logging and explanations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub scanned: u64,
    pub matched: u64,
    pub returned: u64,
    pub skipped_duplicates: u64,
}

/// Execute the query over the events of its topic, returned in commit order.
pub fn execute(
    query: &Query,
    events: &[EventWrapper],
    include_duplicates: bool,
) -> Result<(Vec<EventWrapper>, Stats), Error> {
    let by_id: HashMap<Rlid, &EventWrapper> = events
        .iter()
        .filter_map(|e| e.parse_id().ok().map(|id| (id, e)))
        .collect();

    let offset = query.offset.unwrap_or(0);
    let mut stats = Stats::default();
    let mut results = Vec::new();

    for wrapper in events {
        if query.limit.is_some_and(|limit| stats.returned >= limit) {
            break;
        }
        stats.scanned += 1;

        let mut wrapper = wrapper.clone();
        if wrapper.is_duplicate {
            if !include_duplicates {
                stats.skipped_duplicates += 1;
                continue;
            }
            resolve_duplicate(&mut wrapper, &by_id);
        }

        let event = match wrapper.unwrap_event() {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "could not unwrap event during query execution");
                continue;
            }
        };

        if !matches_type(query, &event) {
            continue;
        }

        let vars = fields(&event);
        if let Some(predicate) = &query.predicate {
            if !predicate.evaluate(&vars)? {
                continue;
            }
        }

        stats.matched += 1;
        if stats.matched <= offset {
            continue;
        }

        if !query.select_all() {
            project(query, &mut wrapper, event, &vars);
        }

        stats.returned += 1;
        results.push(wrapper);
    }

    tracing::debug!(
        query = %query.raw,
        scanned = stats.scanned,
        matched = stats.matched,
        returned = stats.returned,
        "executed query"
    );
    Ok((results, stats))
}

/// Variables a predicate is evaluated against: the top level fields of a JSON
/// object datagram, plus the event metadata for keys the datagram does not define.
pub fn fields(event: &Event) -> Map<String, Value> {
    let mut vars = match serde_json::from_slice::<Value>(&event.data) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };

    for (key, val) in &event.metadata {
        vars.entry(key.clone())
            .or_insert_with(|| Value::String(val.clone()));
    }
    vars
}

fn matches_type(query: &Query, event: &Event) -> bool {
    let topic = &query.topic;
    if topic.schema.is_empty() && topic.version == 0 {
        return true;
    }

    let etype = event.resolve_type();
    if !topic.schema.is_empty() && !etype.name.eq_ignore_ascii_case(&topic.schema) {
        return false;
    }
    topic.version == 0 || etype.major_version == topic.version
}

fn resolve_duplicate(wrapper: &mut EventWrapper, by_id: &HashMap<Rlid, &EventWrapper>) {
    let Ok(target) = Rlid::from_slice(&wrapper.duplicate_id) else {
        return;
    };

    if let Some(original) = by_id.get(&target) {
        if let Err(err) = wrapper.duplicate_from(original) {
            tracing::warn!(error = %err, "could not resolve duplicate event");
        }
    }
}

fn project(query: &Query, wrapper: &mut EventWrapper, mut event: Event, vars: &Map<String, Value>) {
    let mut projection = Map::new();
    for field in &query.fields {
        let value = vars.get(&field.text).cloned().unwrap_or(Value::Null);
        projection.insert(query.alias(&field.text).to_string(), value);
    }

    event.data = serde_json::to_vec(&Value::Object(projection)).unwrap_or_default();
    event.set_mimetype(MimeType::ApplicationJson);
    wrapper.wrap(&event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensql::parse;
    use ensign_api::v1beta1::Type;
    use serde_json::json;
    use ulid::Ulid;

    fn events(topic: Ulid) -> Vec<EventWrapper> {
        let people = [
            json!({"name": "ada", "age": 36, "color": "red"}),
            json!({"name": "grace", "age": 85, "color": "blue"}),
            json!({"name": "alan", "age": 41, "color": "red"}),
            json!({"name": "edsger", "age": 72, "color": "green"}),
        ];

        people
            .iter()
            .enumerate()
            .map(|(i, person)| {
                let event = Event {
                    data: serde_json::to_vec(person).unwrap(),
                    mimetype: MimeType::ApplicationJson as i32,
                    r#type: Some(Type {
                        name: "Person".into(),
                        major_version: 1 + (i as u32 % 2),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                let mut wrapper = EventWrapper::for_topic(topic, &event);
                wrapper.id = Rlid::from_parts(1_700_000_000, i as u32 + 1).unwrap().to_vec();
                wrapper
            })
            .collect()
    }

    fn data(wrapper: &EventWrapper) -> Value {
        serde_json::from_slice(&wrapper.unwrap_event().unwrap().data).unwrap()
    }

    #[test]
    fn test_select_all_with_predicate() {
        let events = events(Ulid::new());
        let query = parse("SELECT * FROM people WHERE color = 'red' OR age > 80").unwrap();
        let (results, stats) = execute(&query, &events, false).unwrap();

        let names: Vec<_> = results.iter().map(|e| data(e)["name"].clone()).collect();
        assert_eq!(names, vec![json!("ada"), json!("grace"), json!("alan")]);
        assert_eq!(stats.scanned, 4);
        assert_eq!(stats.matched, 3);
    }

    #[test]
    fn test_projection_offset_limit() {
        let events = events(Ulid::new());
        let query = parse("SELECT name AS who, missing FROM people OFFSET 1 LIMIT 2").unwrap();
        let (results, stats) = execute(&query, &events, false).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(data(&results[0]), json!({"who": "grace", "missing": null}));
        assert_eq!(data(&results[1]), json!({"who": "alan", "missing": null}));
        assert_eq!(stats.returned, 2);
        assert_eq!(results[0].id, events[1].id);
    }

    #[test]
    fn test_type_filter() {
        let events = events(Ulid::new());
        let query = parse("SELECT * FROM people.person.2").unwrap();
        let (results, _) = execute(&query, &events, false).unwrap();
        assert_eq!(results.len(), 2);

        let query = parse("SELECT * FROM people.Other").unwrap();
        let (results, _) = execute(&query, &events, false).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_duplicates() {
        let mut events = events(Ulid::new());
        let mut dup = events[0].clone();
        dup.id = Rlid::from_parts(1_700_000_001, 1).unwrap().to_vec();
        dup.is_duplicate = true;
        dup.duplicate_id = events[0].id.clone();
        dup.event.clear();
        events.push(dup);

        let query = parse("SELECT * FROM people WHERE name = 'ada'").unwrap();
        let (results, stats) = execute(&query, &events, false).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(stats.skipped_duplicates, 1);

        let (results, _) = execute(&query, &events, true).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[1].is_duplicate);
        assert_eq!(data(&results[1])["name"], json!("ada"));
    }

    #[test]
    fn test_metadata_fields() {
        let event = Event {
            data: b"not json".to_vec(),
            metadata: [("region".to_string(), "us-east".to_string())].into(),
            ..Default::default()
        };
        let vars = fields(&event);
        assert_eq!(vars.get("region"), Some(&json!("us-east")));

        let event = Event {
            data: br#"{"region": "eu"}"#.to_vec(),
            metadata: [("region".to_string(), "us-east".to_string())].into(),
            ..Default::default()
        };
        assert_eq!(fields(&event).get("region"), Some(&json!("eu")));
    }
}
