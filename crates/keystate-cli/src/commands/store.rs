use anyhow::{bail, Context};
use keystate::{StateEngine, StateValue};
use tracing::debug;

pub fn get(engine: &StateEngine, key: &str) -> anyhow::Result<()> {
    match engine.get(key) {
        Some(value) => {
            println!("{}", serde_json::to_string_pretty(value.as_value())?);
            Ok(())
        }
        None => bail!("key `{key}` not found"),
    }
}

pub async fn set(engine: &StateEngine, assignments: &[String]) -> anyhow::Result<()> {
    let entries = assignments
        .iter()
        .map(|a| parse_assignment(a))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let changed = engine.batch_update(entries);
    engine.flush().await;
    println!("✓ {changed} key(s) updated");
    Ok(())
}

pub async fn remove(engine: &StateEngine, key: &str) -> anyhow::Result<()> {
    if engine.remove(key).is_none() {
        bail!("key `{key}` not found");
    }
    engine.flush().await;
    println!("✓ Removed {key}");
    Ok(())
}

pub fn dump(engine: &StateEngine, format: &str) -> anyhow::Result<()> {
    let snapshot = engine.get_all();
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        _ => {
            for (key, value) in &snapshot {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}

pub async fn clear(engine: &StateEngine) -> anyhow::Result<()> {
    let count = engine.len();
    engine.clear();
    engine.flush().await;
    println!("✓ Cleared {count} key(s)");
    Ok(())
}

pub async fn purge(engine: &StateEngine) -> anyhow::Result<()> {
    let coordinator = engine
        .coordinator()
        .context("store has no persistence attached")?;
    coordinator.purge().await;
    println!("✓ Purged {}", coordinator.storage_key());
    Ok(())
}

/// Split `key=value`. The value is JSON when it parses, a string otherwise.
fn parse_assignment(assignment: &str) -> anyhow::Result<(String, StateValue)> {
    let Some((key, raw)) = assignment.split_once('=') else {
        bail!("expected KEY=VALUE, got `{assignment}`");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("empty key in `{assignment}`");
    }
    let value = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => value,
        Err(_) => {
            debug!(%key, "value is not JSON, storing as string");
            serde_json::Value::String(raw.to_string())
        }
    };
    Ok((key.to_string(), StateValue::from(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{open, StoreOptions};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn parse_json_and_plain_values() {
        let (key, value) = parse_assignment("count=3").unwrap();
        assert_eq!(key, "count");
        assert_eq!(value, StateValue::from(json!(3)));

        let (_, value) = parse_assignment(r#"user={"name":"ada"}"#).unwrap();
        assert_eq!(value, StateValue::from(json!({"name": "ada"})));

        let (_, value) = parse_assignment("theme=dark").unwrap();
        assert_eq!(value, StateValue::from(json!("dark")));

        let (_, value) = parse_assignment("url=a=b").unwrap();
        assert_eq!(value, StateValue::from(json!("a=b")));
    }

    #[test]
    fn reject_malformed_assignments() {
        assert!(parse_assignment("no-equals").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[tokio::test]
    async fn edits_survive_reopening_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let options = StoreOptions {
            store: Some(dir.path().join("cli.redb")),
            prefix: Some("cli".to_string()),
            ..Default::default()
        };

        {
            let engine = open(&options).await.unwrap();
            set(&engine, &["a=1".to_string(), "b=two".to_string()])
                .await
                .unwrap();
            remove(&engine, "a").await.unwrap();
            let adapter = engine
                .coordinator()
                .map(|c| Arc::clone(&c.config().adapter))
                .unwrap();
            drop(engine);
            // The writer holds the database until it sees the channel close.
            for _ in 0..1000 {
                if Arc::strong_count(&adapter) == 1 {
                    break;
                }
                tokio::task::yield_now().await;
            }
            assert_eq!(Arc::strong_count(&adapter), 1);
        }

        let engine = open(&options).await.unwrap();
        assert_eq!(engine.get("a"), None);
        assert_eq!(engine.get("b"), Some(StateValue::from(json!("two"))));
    }
}
