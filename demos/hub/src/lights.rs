//! Demo controller domain: a handful of lights and scenes.

use lumen_sync::delta::{StateTree, apply};
use lumen_sync::server::{CommandHandler, Identity};
use lumen_sync::sync::Command;
use serde_json::{Value, json};

/// State the demo controller starts with.
pub fn initial_state() -> StateTree {
    let state = json!({
        "lights": {
            "l1": {"name": "Kitchen", "on": false, "level": 80},
            "l2": {"name": "Hall", "on": true, "level": 35}
        },
        "scenes": {
            "evening": {"l1": {"on": true, "level": 30}, "l2": {"on": false}},
            "bright": {"l1": {"on": true, "level": 100}, "l2": {"on": true, "level": 100}}
        },
        "users": {
            "alice": {"name": "Alice", "role": "admin"},
            "bob": {"name": "Bob", "role": "member"}
        },
        "_hardware": {"bus": "dali0"}
    });
    match state {
        Value::Object(map) => map,
        _ => StateTree::new(),
    }
}

/// Executes light and scene commands against the state tree.
#[derive(Debug, Default)]
pub struct Lights;

fn light<'a>(state: &'a mut StateTree, id: &str) -> Result<&'a mut Value, String> {
    state
        .get_mut("lights")
        .and_then(|lights| lights.get_mut(id))
        .ok_or_else(|| format!("unknown device: {id}"))
}

impl CommandHandler for Lights {
    fn handle(
        &mut self,
        identity: &Identity,
        command: Command,
        state: &mut StateTree,
    ) -> Result<Value, String> {
        match command {
            Command::Toggle(cmd) => {
                let light = light(state, cmd.target.as_str())?;
                let on = light["on"].as_bool().unwrap_or(false);
                light["on"] = Value::Bool(!on);
            }
            Command::SetState(cmd) => {
                let Value::Object(fields) = light(state, cmd.target.as_str())? else {
                    return Err(format!("device {} has no state", cmd.target));
                };
                apply(fields, &cmd.state);
            }
            Command::RecallScene(cmd) => {
                let scene = state
                    .get("scenes")
                    .and_then(|scenes| scenes.get(cmd.scene.as_str()))
                    .and_then(Value::as_object)
                    .cloned()
                    .ok_or_else(|| format!("unknown scene: {}", cmd.scene))?;
                for (id, fields) in &scene {
                    if let (Value::Object(target), Value::Object(patch)) = (light(state, id)?, fields) {
                        apply(target, patch);
                    }
                }
                state.insert("active_scene".into(), Value::from(cmd.scene.as_str()));
            }
            Command::Rename(cmd) => {
                if !identity.privileged {
                    return Err("permission denied".into());
                }
                light(state, cmd.target.as_str())?["name"] = Value::from(cmd.name);
            }
            Command::Ping(_) => {}
        }
        Ok(Value::Null)
    }
}
