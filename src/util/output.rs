#![allow(clippy::print_stdout)]

use anyhow::{Context, Result};
use serde_json::{Map, Value};

/**
 * Collects the results of an action. In plain mode values are printed as they
 * arrive, in JSON mode they are gathered and printed as one object by
 * `finish`.
 */
pub struct Output {
    json: bool,
    values: Map<String, Value>,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Output {
            json,
            values: Map::new(),
        }
    }

    pub fn value(&mut self, key: &str, value: Value, with_key: bool) {
        if !self.json {
            let text = match &value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if with_key {
                println!("{}={}", key, text);
            } else {
                println!("{}", text);
            }
        }
        self.values.insert(key.to_string(), value);
    }

    #[cfg(test)]
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn finish(self) -> Result<()> {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&Value::Object(self.values))
                    .context("Error serializing JSON")?
            );
        }
        Ok(())
    }
}
