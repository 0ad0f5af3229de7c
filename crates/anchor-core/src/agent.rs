//! Agents and their versioned configuration.
//!
//! An agent's config arrives as free JSON but is held as [`AgentConfig`]:
//! typed policies plus a bounded map of unknown keys. Writes through the API
//! are validated strictly; configs already in storage are read leniently so
//! that a bad policy degrades (and blocks) instead of failing the read.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{
  Error, Result,
  policy::{Diagnostic, MAX_EXTRA_KEYS, Policy},
};

pub const MAX_AGENT_ID_LEN: usize = 128;

/// Agent ids appear in URLs and export headers: ASCII letters, digits and
/// `-_.:` only.
pub fn validate_agent_id(id: &str) -> Result<()> {
  let ok = !id.is_empty()
    && id.len() <= MAX_AGENT_ID_LEN
    && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
  if ok { Ok(()) } else { Err(Error::InvalidAgentId(id.to_owned())) }
}

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
  Active,
  /// Readable, but governed mutations are refused.
  Suspended,
  /// Data is gone for every reader; the audit chain is retained.
  Deleted,
}

impl AgentStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Active => "active",
      Self::Suspended => "suspended",
      Self::Deleted => "deleted",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "active" => Ok(Self::Active),
      "suspended" => Ok(Self::Suspended),
      "deleted" => Ok(Self::Deleted),
      other => Err(Error::UnknownVariant { kind: "agent status", value: other.to_owned() }),
    }
  }
}

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentConfig {
  pub policies: Vec<Policy>,
  pub extra:    BTreeMap<String, Value>,
}

impl AgentConfig {
  /// Read a config without failing. `policies` may be an array of policy
  /// objects or a map keyed by subject prefix.
  pub fn from_value_lenient(value: &Value) -> (AgentConfig, Vec<Diagnostic>) {
    let mut diagnostics = Vec::new();
    let mut config = AgentConfig::default();

    let obj = match value {
      Value::Object(obj) => obj,
      Value::Null => return (config, diagnostics),
      _ => {
        diagnostics.push(Diagnostic::new("config", "config is not an object; ignored"));
        return (config, diagnostics);
      }
    };

    for (field, raw) in obj {
      if field != "policies" {
        if config.extra.len() < MAX_EXTRA_KEYS {
          config.extra.insert(field.clone(), raw.clone());
        } else {
          diagnostics.push(Diagnostic::new(
            format!("config.{field}"),
            "extra key limit reached; dropped",
          ));
        }
        continue;
      }

      match raw {
        Value::Array(items) => {
          for (i, item) in items.iter().enumerate() {
            config.policies.push(Policy::from_value_lenient(
              item,
              &format!("policies[{i}]"),
              None,
              &mut diagnostics,
            ));
          }
        }
        Value::Object(by_prefix) => {
          for (prefix, item) in by_prefix {
            config.policies.push(Policy::from_value_lenient(
              item,
              &format!("policies.{prefix}"),
              Some(prefix.as_str()),
              &mut diagnostics,
            ));
          }
        }
        Value::Null => {}
        _ => {
          // Unreadable policy list: block everything for this agent.
          diagnostics.push(Diagnostic::new(
            "policies",
            "expected an array or object; blocking all writes",
          ));
          let mut catch_all = Policy::new("");
          catch_all.malformed = Some("policies: expected an array or object".into());
          config.policies.push(catch_all);
        }
      }
    }

    (config, diagnostics)
  }

  /// Read a config for a write, refusing anything lenient parsing would have
  /// had to paper over.
  pub fn from_value_strict(value: &Value) -> Result<AgentConfig> {
    if let Value::Object(obj) = value {
      let extras = obj.keys().filter(|k| *k != "policies").count();
      if extras > MAX_EXTRA_KEYS {
        return Err(Error::InvalidConfig(format!(
          "more than {MAX_EXTRA_KEYS} unknown keys"
        )));
      }
    }
    let (config, diagnostics) = Self::from_value_lenient(value);
    if let Some(d) = diagnostics.first() {
      return Err(Error::InvalidConfig(format!("{}: {}", d.scope, d.message)));
    }
    for policy in &config.policies {
      policy.validate()?;
    }
    Ok(config)
  }

  pub fn to_value(&self) -> Value {
    let mut obj: Map<String, Value> =
      self.extra.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    if !self.policies.is_empty() {
      obj.insert(
        "policies".into(),
        serde_json::to_value(&self.policies).unwrap_or(Value::Array(Vec::new())),
      );
    }
    Value::Object(obj)
  }
}

impl Serialize for AgentConfig {
  fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
    self.to_value().serialize(s)
  }
}

impl<'de> Deserialize<'de> for AgentConfig {
  fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(Self::from_value_lenient(&value).0)
  }
}

// ─── Agent ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
  pub agent_id:     String,
  pub workspace_id: String,
  pub name:         String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description:  Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub owner:        Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub team:         Option<String>,
  pub status:       AgentStatus,
  pub config:       AgentConfig,
  #[serde(default)]
  pub tags:         Vec<String>,
  /// Current config version; bumped on every config change.
  pub version:      u64,
  pub created_at:   DateTime<Utc>,
  pub updated_at:   DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAgent {
  /// Generated when absent.
  #[serde(default)]
  pub agent_id:    Option<String>,
  pub name:        String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub owner:       Option<String>,
  #[serde(default)]
  pub team:        Option<String>,
  #[serde(default)]
  pub tags:        Vec<String>,
  #[serde(default)]
  pub config:      Option<Value>,
}

impl NewAgent {
  pub fn named(name: impl Into<String>) -> Self {
    Self { name: name.into(), ..Default::default() }
  }

  pub fn validate(&self) -> Result<AgentConfig> {
    if let Some(id) = &self.agent_id {
      validate_agent_id(id)?;
    }
    validate_name(&self.name)?;
    AgentConfig::from_value_strict(self.config.as_ref().unwrap_or(&Value::Null))
  }
}

fn validate_name(name: &str) -> Result<()> {
  if name.trim().is_empty() {
    return Err(Error::InvalidAgent("name must not be empty".into()));
  }
  if name.len() > 256 {
    return Err(Error::InvalidAgent("name exceeds 256 bytes".into()));
  }
  Ok(())
}

/// `PATCH /agents/{id}`. A present `config` replaces the whole config and
/// creates a new version.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentUpdate {
  #[serde(default)]
  pub name:        Option<String>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub owner:       Option<String>,
  #[serde(default)]
  pub team:        Option<String>,
  #[serde(default)]
  pub tags:        Option<Vec<String>>,
  #[serde(default)]
  pub config:      Option<Value>,
}

impl AgentUpdate {
  /// Validate and return the parsed config, if one is being replaced.
  pub fn validate(&self) -> Result<Option<AgentConfig>> {
    if let Some(name) = &self.name {
      validate_name(name)?;
    }
    self.config.as_ref().map(AgentConfig::from_value_strict).transpose()
  }

  /// Names of the descriptive fields this update touches.
  pub fn changed_fields(&self) -> Vec<&'static str> {
    [
      ("name", self.name.is_some()),
      ("description", self.description.is_some()),
      ("owner", self.owner.is_some()),
      ("team", self.team.is_some()),
      ("tags", self.tags.is_some()),
    ]
    .into_iter()
    .filter_map(|(name, set)| set.then_some(name))
    .collect()
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentQuery {
  /// Deleted agents are only listed when asked for explicitly.
  #[serde(default)]
  pub status: Option<AgentStatus>,
  #[serde(default)]
  pub owner:  Option<String>,
  #[serde(default)]
  pub limit:  Option<usize>,
  #[serde(default)]
  pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentPage {
  pub data:     Vec<Agent>,
  pub has_more: bool,
  pub total:    u64,
}

// ─── Config versions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigVersion {
  pub agent_id:   String,
  pub version:    u64,
  pub config:     AgentConfig,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigVersionPage {
  pub data:     Vec<ConfigVersion>,
  pub has_more: bool,
  pub total:    u64,
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::policy::PiiMode;

  #[test]
  fn agent_ids_are_restricted() {
    assert!(validate_agent_id("support-bot_1").is_ok());
    assert!(validate_agent_id("").is_err());
    assert!(validate_agent_id("a/b").is_err());
  }

  #[test]
  fn policies_accept_array_and_map_forms() {
    let (arr, d1) = AgentConfig::from_value_lenient(&json!({
      "policies": [{ "subjectPrefix": "tmp/", "retentionDays": 1 }]
    }));
    let (map, d2) = AgentConfig::from_value_lenient(&json!({
      "policies": { "tmp/": { "retentionDays": 1 } }
    }));
    assert!(d1.is_empty() && d2.is_empty());
    assert_eq!(arr.policies, map.policies);
    assert_eq!(arr.policies[0].retention_days, Some(1));
  }

  #[test]
  fn strict_parse_rejects_what_lenient_tolerates() {
    let raw = json!({ "policies": [{ "subjectPrefix": "x/", "piiMode": "maybe" }] });
    let (lenient, diags) = AgentConfig::from_value_lenient(&raw);
    assert_eq!(lenient.policies[0].pii_mode, PiiMode::Block);
    assert_eq!(diags.len(), 1);
    assert!(matches!(
      AgentConfig::from_value_strict(&raw),
      Err(Error::InvalidConfig(_))
    ));
  }

  #[test]
  fn too_many_extra_keys_is_invalid() {
    let mut obj = Map::new();
    for i in 0..=MAX_EXTRA_KEYS {
      obj.insert(format!("k{i}"), json!(i));
    }
    assert!(AgentConfig::from_value_strict(&Value::Object(obj)).is_err());
  }

  #[test]
  fn config_serializes_back_to_json() {
    let raw = json!({
      "model": "small",
      "policies": [{ "subjectPrefix": "a/", "doNotStore": true }]
    });
    let config = AgentConfig::from_value_strict(&raw).unwrap();
    let v = config.to_value();
    assert_eq!(v["model"], json!("small"));
    assert_eq!(v["policies"][0]["subjectPrefix"], json!("a/"));
    assert_eq!(v["policies"][0]["doNotStore"], json!(true));
  }
}
