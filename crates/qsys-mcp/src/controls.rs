//! Control read/write contract.
//!
//! Paths are `Component.control`; the first dot separates the component, so
//! control names may themselves contain dots. Batch operations settle every
//! item independently and return results in input order.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{ControlState, ControlType, ControlValue, EngineClient};
use crate::error::ToolError;

pub const MAX_GET_BATCH: usize = 100;
pub const MAX_SET_BATCH: usize = 50;

const MAX_SUGGESTIONS: usize = 5;

/// Numeric writes count as confirmed within this distance.
const CONFIRM_TOLERANCE: f64 = 0.001;

/// Guard rules for controls that silence or power down a venue.
/// Matched case-insensitively against the full path.
enum Guard {
    Prefix(&'static str),
    Suffix(&'static str),
}

const PROTECTED: &[Guard] = &[
    Guard::Prefix("master."),
    Guard::Prefix("emergency."),
    Guard::Suffix(".power"),
    Guard::Prefix("systemmute"),
];

pub fn is_protected(path: &str) -> bool {
    let path = path.to_lowercase();
    PROTECTED.iter().any(|guard| match guard {
        Guard::Prefix(p) => path.starts_with(p),
        Guard::Suffix(s) => path.ends_with(s),
    })
}

/// Split on the first dot. An empty side is left for resolution to report.
pub fn parse_path(path: &str) -> Result<(&str, &str), ToolError> {
    path.split_once('.').ok_or_else(|| ToolError::InvalidPath(path.to_string()))
}

/// Up to five names, those sharing a substring with `query` first.
fn suggest(query: &str, names: Vec<String>) -> Vec<String> {
    let q = query.to_lowercase();
    let (mut close, rest): (Vec<String>, Vec<String>) = names.into_iter().partition(|name| {
        let n = name.to_lowercase();
        n.contains(&q) || q.contains(&n)
    });
    close.extend(rest);
    close.truncate(MAX_SUGGESTIONS);
    close
}

/// A resolved control.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub component: String,
    pub control: String,
    pub state: ControlState,
}

pub fn resolve(client: &dyn EngineClient, path: &str) -> Result<Resolved, ToolError> {
    let (component, control) = parse_path(path)?;

    let Some(controls) = client.control_names(component) else {
        return Err(ToolError::NotFound {
            what: format!("Component '{}'", component),
            alternatives: suggest(component, client.component_names()),
        });
    };

    match client.control(component, control) {
        Some(state) => Ok(Resolved {
            component: component.to_string(),
            control: control.to_string(),
            state,
        }),
        None => Err(ToolError::NotFound {
            what: format!("Control '{}' on component '{}'", control, component),
            alternatives: suggest(control, controls),
        }),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum GetItem {
    Value {
        control: String,
        #[serde(flatten)]
        state: ControlState,
    },
    Failed {
        control: String,
        #[serde(flatten)]
        error: Value,
    },
}

impl GetItem {
    pub fn is_error(&self) -> bool {
        matches!(self, GetItem::Failed { .. })
    }
}

/// Read each path. Unresolvable paths become error items, never a batch failure.
pub fn get(client: &dyn EngineClient, paths: &[String]) -> Result<Vec<GetItem>, ToolError> {
    if paths.is_empty() || paths.len() > MAX_GET_BATCH {
        return Err(ToolError::InvalidArgument(format!(
            "controls must contain 1-{} paths, got {}",
            MAX_GET_BATCH,
            paths.len()
        )));
    }

    Ok(paths
        .iter()
        .map(|path| match resolve(client, path) {
            Ok(resolved) => GetItem::Value {
                control: path.clone(),
                state: resolved.state,
            },
            Err(e) => GetItem::Failed {
                control: path.clone(),
                error: e.to_json(),
            },
        })
        .collect())
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    pub path: String,
    pub value: Value,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SetItem {
    Confirmed {
        control: String,
        value: ControlValue,
        string: String,
        position: Option<f64>,
        confirmed: bool,
    },
    Failed {
        control: String,
        confirmed: bool,
        #[serde(flatten)]
        error: Value,
    },
}

impl SetItem {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SetItem::Confirmed { .. })
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            SetItem::Failed { error, .. } => error.get("code").and_then(Value::as_str),
            SetItem::Confirmed { .. } => None,
        }
    }
}

/// Write every request concurrently; output order matches input.
pub async fn set(client: &dyn EngineClient, updates: Vec<SetRequest>) -> Result<Vec<SetItem>, ToolError> {
    if updates.is_empty() || updates.len() > MAX_SET_BATCH {
        return Err(ToolError::InvalidArgument(format!(
            "controls must contain 1-{} updates, got {}",
            MAX_SET_BATCH,
            updates.len()
        )));
    }

    Ok(join_all(updates.into_iter().map(|req| set_one(client, req))).await)
}

async fn set_one(client: &dyn EngineClient, req: SetRequest) -> SetItem {
    match try_set(client, &req).await {
        Ok(state) => SetItem::Confirmed {
            control: req.path,
            value: state.value,
            string: state.string,
            position: state.position,
            confirmed: true,
        },
        Err(e) => SetItem::Failed {
            control: req.path,
            confirmed: false,
            error: e.to_json(),
        },
    }
}

async fn try_set(client: &dyn EngineClient, req: &SetRequest) -> Result<ControlState, ToolError> {
    let target = resolve(client, &req.path)?;

    if !req.force && is_protected(&req.path) {
        return Err(ToolError::Protected(req.path.clone()));
    }
    if target.state.direction.is_read_only() {
        return Err(ToolError::ReadOnly(req.path.clone()));
    }

    let value = validate(&target.state, &req.value)?;
    let after = client
        .update(&target.component, &target.control, value.clone())
        .await?;

    if target.state.control_type != ControlType::Trigger && !confirms(&value, &after) {
        return Err(ToolError::WriteRejected {
            requested: req.value.clone(),
            actual: after.value.to_json(),
        });
    }
    Ok(after)
}

/// Check `value` against the control's type and range.
pub fn validate(state: &ControlState, value: &Value) -> Result<ControlValue, ToolError> {
    let invalid = |msg: String| Err(ToolError::Validation(msg));

    match state.control_type {
        ControlType::Boolean => match value {
            Value::Bool(b) => Ok(ControlValue::Bool(*b)),
            _ => invalid("Boolean control requires true/false".to_string()),
        },
        ControlType::Float | ControlType::Integer => {
            let Some(n) = value.as_f64() else {
                return invalid("Numeric control requires number".to_string());
            };
            if state.control_type == ControlType::Integer && n.fract() != 0.0 {
                return invalid("Integer control requires whole number".to_string());
            }
            if let Some(min) = state.min {
                if n < min {
                    return invalid(format!("Value {} below minimum {}", n, min));
                }
            }
            if let Some(max) = state.max {
                if n > max {
                    return invalid(format!("Value {} above maximum {}", n, max));
                }
            }
            Ok(ControlValue::Number(n))
        }
        ControlType::String => {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return invalid("String control requires text".to_string()),
            };
            if let Some(choices) = &state.choices {
                if !choices.is_empty() && !choices.contains(&text) {
                    return invalid(format!("Value '{}' is not one of: {}", text, choices.join(", ")));
                }
            }
            Ok(ControlValue::Text(text))
        }
        ControlType::Trigger => Ok(ControlValue::from_json(value).unwrap_or(ControlValue::Number(1.0))),
    }
}

fn confirms(requested: &ControlValue, after: &ControlState) -> bool {
    match requested {
        ControlValue::Bool(b) => after.bool == Some(*b) || after.value == ControlValue::Bool(*b),
        ControlValue::Number(n) => after
            .value
            .as_f64()
            .is_some_and(|actual| (actual - n).abs() <= CONFIRM_TOLERANCE),
        ControlValue::Text(s) => &after.string == s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Direction;
    use crate::offline::{Design, OfflineEngine};
    use serde_json::json;

    fn engine() -> OfflineEngine {
        let design = Design::from_json(
            r#"{"components": [
                {"name": "Mixer", "controls": [
                    {"name": "gain", "type": "Float", "value": 0, "min": -60, "max": 20},
                    {"name": "mute", "type": "Boolean"},
                    {"name": "ch.1.level", "type": "Integer", "value": 0, "min": 0, "max": 10},
                    {"name": "meter", "type": "Float", "direction": "Read Only"},
                    {"name": "stuck", "type": "Float", "value": 0, "min": -10, "max": 10, "locked": true},
                    {"name": "preset", "type": "Trigger"}
                ]},
                {"name": "Master", "controls": [{"name": "mute", "type": "Boolean"}]},
                {"name": "Amp", "controls": [{"name": "power", "type": "Boolean", "value": true}]},
                {"name": "Router", "controls": [
                    {"name": "input", "type": "String", "value": "hdmi", "choices": ["hdmi", "sdi"]}
                ]}
            ]}"#,
        )
        .unwrap();
        OfflineEngine::new(&design, None).unwrap()
    }

    fn req(path: &str, value: Value) -> SetRequest {
        SetRequest {
            path: path.to_string(),
            value,
            force: false,
        }
    }

    #[test]
    fn test_parse_path_splits_on_first_dot() {
        assert_eq!(parse_path("Mixer.ch.1.level").unwrap(), ("Mixer", "ch.1.level"));
        assert!(matches!(parse_path("Mixer"), Err(ToolError::InvalidPath(_))));
        assert_eq!(parse_path(".gain").unwrap(), ("", "gain"));
        assert_eq!(parse_path("Mixer.").unwrap(), ("Mixer", ""));
    }

    #[test]
    fn test_empty_side_resolves_to_not_found_with_suggestions() {
        let e = engine();
        let items = get(&e, &[".gain".into(), "Mixer.".into()]).unwrap();

        let no_component = serde_json::to_value(&items[0]).unwrap();
        assert_eq!(no_component["code"], "NotFound");
        assert_eq!(no_component["alternatives"][0], "Mixer");

        let no_control = serde_json::to_value(&items[1]).unwrap();
        assert_eq!(no_control["code"], "NotFound");
        assert_eq!(no_control["alternatives"][0], "gain");
    }

    #[test]
    fn test_protected_guards() {
        assert!(is_protected("Master.mute"));
        assert!(is_protected("master.gain"));
        assert!(is_protected("Emergency.page"));
        assert!(is_protected("Amp.Power"));
        assert!(is_protected("SystemMuteAll.enable"));
        assert!(!is_protected("Mixer.gain"));
        assert!(!is_protected("Amp.powered_on_led"));
    }

    #[test]
    fn test_suggest_ranks_substring_matches_first() {
        let names = vec!["Router".into(), "Mixer".into(), "Amp".into(), "MixerB".into()];
        assert_eq!(suggest("mix", names), vec!["Mixer", "MixerB", "Router", "Amp"]);
    }

    #[test]
    fn test_suggest_caps_at_five() {
        let names = (0..9).map(|i| format!("c{}", i)).collect();
        assert_eq!(suggest("zzz", names).len(), 5);
    }

    #[test]
    fn test_get_mixes_values_and_errors() {
        let e = engine();
        let items = get(&e, &["Mixer.gain".into(), "Mixr.gain".into(), "Mixer.gian".into()]).unwrap();
        assert_eq!(items.len(), 3);
        assert!(!items[0].is_error());

        let bad_component = serde_json::to_value(&items[1]).unwrap();
        assert_eq!(bad_component["code"], "NotFound");
        assert!(bad_component.get("value").is_none());
        assert_eq!(bad_component["alternatives"][0], "Mixer");

        let bad_control = serde_json::to_value(&items[2]).unwrap();
        assert_eq!(bad_control["control"], "Mixer.gian");
        assert!(bad_control["alternatives"].as_array().unwrap().contains(&json!("gain")));
    }

    #[test]
    fn test_get_item_shape() {
        let e = engine();
        let items = get(&e, &["Mixer.gain".into()]).unwrap();
        let v = serde_json::to_value(&items[0]).unwrap();
        for key in ["control", "value", "string", "position", "bool", "direction", "choices", "min", "max"] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        assert_eq!(v["min"], json!(-60.0));
    }

    #[test]
    fn test_get_batch_bounds() {
        let e = engine();
        assert!(matches!(get(&e, &[]), Err(ToolError::InvalidArgument(_))));
        let many: Vec<String> = (0..101).map(|_| "Mixer.gain".to_string()).collect();
        assert!(matches!(get(&e, &many), Err(ToolError::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_messages() {
        let e = engine();
        let gain = e.control("Mixer", "gain").unwrap();
        assert_eq!(
            validate(&gain, &json!(-100)),
            Err(ToolError::Validation("Value -100 below minimum -60".into()))
        );
        assert_eq!(
            validate(&gain, &json!(21)),
            Err(ToolError::Validation("Value 21 above maximum 20".into()))
        );
        assert_eq!(
            validate(&gain, &json!("loud")),
            Err(ToolError::Validation("Numeric control requires number".into()))
        );

        let level = e.control("Mixer", "ch.1.level").unwrap();
        assert_eq!(
            validate(&level, &json!(2.5)),
            Err(ToolError::Validation("Integer control requires whole number".into()))
        );

        let input = e.control("Router", "input").unwrap();
        assert!(validate(&input, &json!("vga")).is_err());
        assert_eq!(validate(&input, &json!("sdi")), Ok(ControlValue::Text("sdi".into())));
    }

    #[tokio::test]
    async fn test_set_keeps_order_and_settles_each() {
        let e = engine();
        let items = set(
            &e,
            vec![
                req("Mixer.gain", json!(-12)),
                req("Mixer.mute", json!("yes")),
                req("Master.mute", json!(true)),
                req("Mixer.meter", json!(0)),
                req("Nope.x", json!(1)),
                req("Mixer.ch.1.level", json!(3)),
            ],
        )
        .await
        .unwrap();

        let codes: Vec<Option<&str>> = items.iter().map(|i| i.code()).collect();
        assert_eq!(
            codes,
            vec![None, Some("Validation"), Some("Protected"), Some("ReadOnly"), Some("NotFound"), None]
        );
        assert_eq!(e.control("Mixer", "gain").unwrap().value, ControlValue::Number(-12.0));
    }

    #[tokio::test]
    async fn test_boolean_validation_skips_engine_write() {
        let e = engine();
        let items = set(&e, vec![req("Mixer.mute", json!(1))]).await.unwrap();
        assert_eq!(items[0].code(), Some("Validation"));
        assert_eq!(e.write_count(), 0);
    }

    #[tokio::test]
    async fn test_force_bypasses_protection_but_not_validation() {
        let e = engine();
        let mut forced = req("Master.mute", json!(true));
        forced.force = true;
        let mut forced_bad = req("Amp.power", json!("off"));
        forced_bad.force = true;

        let items = set(&e, vec![forced, forced_bad]).await.unwrap();
        assert!(items[0].is_confirmed());
        assert_eq!(items[1].code(), Some("Validation"));
    }

    #[tokio::test]
    async fn test_locked_control_reports_write_rejected() {
        let e = engine();
        let items = set(&e, vec![req("Mixer.stuck", json!(5))]).await.unwrap();
        let v = serde_json::to_value(&items[0]).unwrap();
        assert_eq!(v["code"], "WriteRejected");
        assert_eq!(v["confirmed"], json!(false));
        assert_eq!(v["requested"], json!(5));
        assert_eq!(v["actual"], json!(0.0));
    }

    #[tokio::test]
    async fn test_trigger_skips_confirmation() {
        let e = engine();
        let items = set(&e, vec![req("Mixer.preset", json!(true))]).await.unwrap();
        assert!(items[0].is_confirmed());
    }

    #[tokio::test]
    async fn test_set_batch_bounds() {
        let e = engine();
        let many = (0..51).map(|_| req("Mixer.gain", json!(0))).collect();
        assert!(matches!(set(&e, many).await, Err(ToolError::InvalidArgument(_))));
    }

    #[test]
    fn test_read_only_direction() {
        let e = engine();
        assert_eq!(e.control("Mixer", "meter").unwrap().direction, Direction::Read);
    }
}
