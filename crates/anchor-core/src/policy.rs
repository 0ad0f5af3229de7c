//! Policies and the policy engine that gates every governed write.
//!
//! A policy governs writes under a subject-key prefix. For any key, exactly
//! one policy is selected by longest-prefix match across the workspace's
//! policies and the agent's own `config.policies`; no match means the
//! permissive default (allow everything, keep forever).
//!
//! Untyped policy JSON (agent config) is parsed leniently: a broken field
//! never aborts evaluation, it degrades the policy towards the most
//! restrictive reading and leaves a [`Diagnostic`] behind.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  Error, Result,
  detect::{Detectors, redact},
};

/// Upper bound on forward-compatible unknown keys carried by a policy or an agent config.
pub const MAX_EXTRA_KEYS: usize = 64;

/// Longest accepted retention period, about a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

// ─── Memory categories ───────────────────────────────────────────────────────

/// Content category a value is classified into before type gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
  Profile,
  Episodic,
  Semantic,
  Procedural,
}

impl MemoryType {
  pub const ALL: [MemoryType; 4] =
    [MemoryType::Profile, MemoryType::Episodic, MemoryType::Semantic, MemoryType::Procedural];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Profile => "profile",
      Self::Episodic => "episodic",
      Self::Semantic => "semantic",
      Self::Procedural => "procedural",
    }
  }

  /// Parse a category name, accepting a few common aliases.
  pub fn parse(s: &str) -> Option<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "profile" | "user" | "identity" => Some(Self::Profile),
      "episodic" | "episode" | "episodes" | "event" | "events" | "conversation" => {
        Some(Self::Episodic)
      }
      "semantic" | "fact" | "facts" | "knowledge" => Some(Self::Semantic),
      "procedural" | "procedure" | "procedures" | "skill" | "skills" | "howto" => {
        Some(Self::Procedural)
      }
      _ => None,
    }
  }
}

// ─── Policy fields ───────────────────────────────────────────────────────────

/// How personally identifiable information in a value is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PiiMode {
  Block,
  #[default]
  Allow,
  Redact,
}

impl PiiMode {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Block => "block",
      Self::Allow => "allow",
      Self::Redact => "redact",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "block" => Some(Self::Block),
      "allow" => Some(Self::Allow),
      "redact" => Some(Self::Redact),
      _ => None,
    }
  }

  fn strictness(self) -> u8 {
    match self {
      Self::Allow => 0,
      Self::Redact => 1,
      Self::Block => 2,
    }
  }

  /// The stricter of two modes.
  pub fn strictest(self, other: Self) -> Self {
    if other.strictness() > self.strictness() { other } else { self }
  }
}

fn yes() -> bool { true }

/// Per-category allow list. Missing categories default to allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowTypes {
  #[serde(default = "yes")]
  pub profile:    bool,
  #[serde(default = "yes")]
  pub episodic:   bool,
  #[serde(default = "yes")]
  pub semantic:   bool,
  #[serde(default = "yes")]
  pub procedural: bool,
}

impl Default for AllowTypes {
  fn default() -> Self {
    Self { profile: true, episodic: true, semantic: true, procedural: true }
  }
}

impl AllowTypes {
  pub const NONE: AllowTypes =
    AllowTypes { profile: false, episodic: false, semantic: false, procedural: false };

  pub fn allows(&self, t: MemoryType) -> bool {
    match t {
      MemoryType::Profile => self.profile,
      MemoryType::Episodic => self.episodic,
      MemoryType::Semantic => self.semantic,
      MemoryType::Procedural => self.procedural,
    }
  }

  fn set(&mut self, t: MemoryType, allowed: bool) {
    match t {
      MemoryType::Profile => self.profile = allowed,
      MemoryType::Episodic => self.episodic = allowed,
      MemoryType::Semantic => self.semantic = allowed,
      MemoryType::Procedural => self.procedural = allowed,
    }
  }

  /// A category is allowed only if both sides allow it.
  pub fn intersect(self, other: Self) -> Self {
    Self {
      profile:    self.profile && other.profile,
      episodic:   self.episodic && other.episodic,
      semantic:   self.semantic && other.semantic,
      procedural: self.procedural && other.procedural,
    }
  }
}

// ─── Diagnostics ─────────────────────────────────────────────────────────────

/// A problem found while reading policy configuration. Evaluation continues;
/// the diagnostic travels with the decision and into the audit metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
  /// Where the problem was found, e.g. `policies[2].piiMode`.
  pub scope:   String,
  pub message: String,
}

impl Diagnostic {
  pub fn new(scope: impl Into<String>, message: impl Into<String>) -> Self {
    Self { scope: scope.into(), message: message.into() }
  }
}

// ─── Policy ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
  pub subject_prefix: String,
  #[serde(default)]
  pub do_not_store:   bool,
  #[serde(default)]
  pub allow_types:    AllowTypes,
  #[serde(default)]
  pub pii_mode:       PiiMode,
  /// `None` keeps entries forever.
  #[serde(default)]
  pub retention_days: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_at:     Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub extra:          BTreeMap<String, Value>,
  /// Set when the source JSON could not be read faithfully; a malformed
  /// policy blocks every write it matches.
  #[serde(skip)]
  pub malformed:      Option<String>,
}

impl Policy {
  /// A policy with every setting at its permissive default.
  pub fn new(subject_prefix: impl Into<String>) -> Self {
    Self {
      subject_prefix: subject_prefix.into(),
      do_not_store:   false,
      allow_types:    AllowTypes::default(),
      pii_mode:       PiiMode::default(),
      retention_days: None,
      updated_at:     None,
      extra:          BTreeMap::new(),
      malformed:      None,
    }
  }

  pub fn matches(&self, key: &str) -> bool { key.starts_with(&self.subject_prefix) }

  /// Combine two policies for the same prefix, keeping the stricter reading of every field.
  pub fn merge_restrictive(mut self, other: &Policy) -> Policy {
    self.do_not_store |= other.do_not_store;
    self.allow_types = self.allow_types.intersect(other.allow_types);
    self.pii_mode = self.pii_mode.strictest(other.pii_mode);
    self.retention_days = match (self.retention_days, other.retention_days) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (a, b) => a.or(b),
    };
    if self.malformed.is_none() {
      self.malformed = other.malformed.clone();
    }
    for (k, v) in &other.extra {
      self.extra.entry(k.clone()).or_insert_with(|| v.clone());
    }
    self
  }

  /// Strict validation used on the write path of policy configuration.
  pub fn validate(&self) -> Result<()> {
    if self.subject_prefix.chars().any(char::is_control) {
      return Err(Error::InvalidPolicy("subjectPrefix contains control characters".into()));
    }
    if self.extra.len() > MAX_EXTRA_KEYS {
      return Err(Error::InvalidPolicy(format!("more than {MAX_EXTRA_KEYS} unknown keys")));
    }
    if let Some(days) = self.retention_days
      && days > MAX_RETENTION_DAYS
    {
      return Err(Error::InvalidPolicy(format!(
        "retentionDays must be at most {MAX_RETENTION_DAYS}, got {days}"
      )));
    }
    if let Some(reason) = &self.malformed {
      return Err(Error::InvalidPolicy(reason.clone()));
    }
    Ok(())
  }

  /// Read a policy from untyped JSON without ever failing.
  ///
  /// `scope` prefixes diagnostic locations; `fallback_prefix` is used when the object carries no
  /// prefix of its own (the map-keyed config form).
  pub fn from_value_lenient(
    value: &Value,
    scope: &str,
    fallback_prefix: Option<&str>,
    diagnostics: &mut Vec<Diagnostic>,
  ) -> Policy {
    let Some(obj) = value.as_object() else {
      diagnostics.push(Diagnostic::new(scope, "policy is not an object"));
      let mut p = Policy::new(fallback_prefix.unwrap_or_default());
      p.malformed = Some(format!("{scope}: policy is not an object"));
      return p;
    };

    let prefix = obj
      .get("subjectPrefix")
      .or_else(|| obj.get("subject_prefix"))
      .and_then(Value::as_str)
      .or(fallback_prefix);

    let mut policy = match prefix {
      Some(p) => Policy::new(p),
      None => {
        diagnostics.push(Diagnostic::new(
          format!("{scope}.subjectPrefix"),
          "missing subject prefix; applying to every key",
        ));
        let mut p = Policy::new("");
        p.malformed = Some(format!("{scope}: missing subjectPrefix"));
        p
      }
    };

    for (field, raw) in obj {
      let at = format!("{scope}.{field}");
      match field.as_str() {
        "subjectPrefix" | "subject_prefix" => {}
        "doNotStore" | "do_not_store" => match raw {
          Value::Bool(b) => policy.do_not_store = *b,
          Value::Null => {}
          _ => {
            diagnostics.push(Diagnostic::new(&at, "expected a boolean"));
            policy.malformed = Some(format!("{at}: expected a boolean"));
          }
        },
        "allowTypes" | "allow_types" => match raw {
          Value::Object(map) => {
            for (name, allowed) in map {
              let Some(t) = MemoryType::parse(name) else {
                let message = "unknown memory type ignored";
                diagnostics.push(Diagnostic::new(format!("{at}.{name}"), message));
                continue;
              };
              match allowed {
                Value::Bool(b) => policy.allow_types.set(t, *b),
                _ => {
                  diagnostics.push(Diagnostic::new(
                    format!("{at}.{name}"),
                    "expected a boolean; treating as not allowed",
                  ));
                  policy.allow_types.set(t, false);
                }
              }
            }
          }
          Value::Null => {}
          _ => {
            diagnostics.push(Diagnostic::new(&at, "expected an object; no types allowed"));
            policy.allow_types = AllowTypes::NONE;
          }
        },
        "piiMode" | "pii_mode" => match raw.as_str().and_then(PiiMode::parse) {
          Some(mode) => policy.pii_mode = mode,
          None if raw.is_null() => {}
          None => {
            diagnostics.push(Diagnostic::new(&at, "unknown pii mode; using block"));
            policy.pii_mode = PiiMode::Block;
          }
        },
        "retentionDays" | "retention_days" => match raw {
          Value::Null => policy.retention_days = None,
          other => match other.as_u64() {
            Some(days) if days <= u64::from(MAX_RETENTION_DAYS) => {
              policy.retention_days = u32::try_from(days).ok();
            }
            Some(_) => {
              let message = format!("retention period exceeds {MAX_RETENTION_DAYS} days");
              diagnostics.push(Diagnostic::new(&at, &message));
              policy.malformed = Some(format!("{at}: {message}"));
            }
            None => {
              let message = "expected a non-negative whole number of days";
              diagnostics.push(Diagnostic::new(&at, message));
              policy.malformed = Some(format!("{at}: invalid retention period"));
            }
          },
        },
        "updatedAt" | "updated_at" | "id" => {}
        _ => {
          if policy.extra.len() < MAX_EXTRA_KEYS {
            policy.extra.insert(field.clone(), raw.clone());
          } else {
            diagnostics.push(Diagnostic::new(&at, "extra key limit reached; dropped"));
          }
        }
      }
    }

    policy
  }
}

/// A partial update applied by `PUT /policy`. Absent fields keep their current value;
/// `retentionDays: null` clears the retention period.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyUpdate {
  #[serde(default)]
  pub subject_prefix: Option<String>,
  pub do_not_store:   Option<bool>,
  pub allow_types:    Option<PartialAllowTypes>,
  pub pii_mode:       Option<PiiMode>,
  #[serde(default, deserialize_with = "double_option")]
  pub retention_days: Option<Option<i64>>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PartialAllowTypes {
  pub profile:    Option<bool>,
  pub episodic:   Option<bool>,
  pub semantic:   Option<bool>,
  pub procedural: Option<bool>,
}

fn double_option<'de, D>(de: D) -> std::result::Result<Option<Option<i64>>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  Ok(Some(Option::<i64>::deserialize(de)?))
}

impl PolicyUpdate {
  /// The prefix being updated; required and non-empty.
  pub fn target_prefix(&self) -> Result<&str> {
    match self.subject_prefix.as_deref() {
      Some(p) if !p.is_empty() => Ok(p),
      _ => Err(Error::InvalidPolicy("subjectPrefix is required".into())),
    }
  }

  /// Apply this update on top of `base`, validating the result.
  pub fn apply(&self, mut base: Policy) -> Result<Policy> {
    if let Some(v) = self.do_not_store {
      base.do_not_store = v;
    }
    if let Some(types) = self.allow_types {
      if let Some(v) = types.profile {
        base.allow_types.profile = v;
      }
      if let Some(v) = types.episodic {
        base.allow_types.episodic = v;
      }
      if let Some(v) = types.semantic {
        base.allow_types.semantic = v;
      }
      if let Some(v) = types.procedural {
        base.allow_types.procedural = v;
      }
    }
    if let Some(mode) = self.pii_mode {
      base.pii_mode = mode;
    }
    if let Some(days) = self.retention_days {
      base.retention_days = match days {
        None => None,
        Some(d) => Some(u32::try_from(d).map_err(|_| {
          Error::InvalidPolicy(format!("retentionDays must be non-negative, got {d}"))
        })?),
      };
    }
    base.validate()?;
    Ok(base)
  }
}

// ─── Policy set ──────────────────────────────────────────────────────────────

/// Where a policy was defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
  Workspace,
  Agent,
}

impl PolicyScope {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Workspace => "workspace",
      Self::Agent => "agent",
    }
  }
}

#[derive(Debug, Clone)]
pub struct ScopedPolicy {
  pub scope:  PolicyScope,
  pub policy: Policy,
}

/// All policies that govern one agent, with same-prefix duplicates already
/// merged within each scope.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
  policies:        Vec<ScopedPolicy>,
  pub diagnostics: Vec<Diagnostic>,
}

impl PolicySet {
  pub fn new(workspace: Vec<Policy>, agent: Vec<Policy>) -> Self {
    let mut set = PolicySet::default();
    set.extend(PolicyScope::Workspace, workspace);
    set.extend(PolicyScope::Agent, agent);
    set
  }

  fn extend(&mut self, scope: PolicyScope, policies: Vec<Policy>) {
    for policy in policies {
      let existing = self
        .policies
        .iter_mut()
        .find(|sp| sp.scope == scope && sp.policy.subject_prefix == policy.subject_prefix);
      match existing {
        Some(sp) => {
          self.diagnostics.push(Diagnostic::new(
            format!("{}:{}", scope.as_str(), policy.subject_prefix),
            "duplicate subject prefix; merged most restrictively",
          ));
          sp.policy = sp.policy.clone().merge_restrictive(&policy);
        }
        None => self.policies.push(ScopedPolicy { scope, policy }),
      }
    }
  }

  /// Longest-prefix match; an agent policy beats a workspace policy with the same prefix.
  pub fn matching(&self, key: &str) -> Option<&ScopedPolicy> {
    self
      .policies
      .iter()
      .filter(|sp| sp.policy.matches(key))
      .max_by_key(|sp| (sp.policy.subject_prefix.len(), matches!(sp.scope, PolicyScope::Agent)))
  }

  pub fn len(&self) -> usize { self.policies.len() }

  pub fn is_empty(&self) -> bool { self.policies.is_empty() }
}

// ─── Decision ────────────────────────────────────────────────────────────────

/// Identifier of the rule that blocked a write; recorded as `blocked_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockedBy {
  #[serde(rename = "policy:malformed")]
  Malformed,
  #[serde(rename = "policy:do_not_store")]
  DoNotStore,
  #[serde(rename = "policy:type_not_allowed")]
  TypeNotAllowed,
  #[serde(rename = "policy:block_pii")]
  BlockPii,
  #[serde(rename = "policy:block_secrets")]
  BlockSecrets,
}

impl BlockedBy {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Malformed => "policy:malformed",
      Self::DoNotStore => "policy:do_not_store",
      Self::TypeNotAllowed => "policy:type_not_allowed",
      Self::BlockPii => "policy:block_pii",
      Self::BlockSecrets => "policy:block_secrets",
    }
  }
}

impl std::fmt::Display for BlockedBy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A proposed write, as seen by the engine.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
  pub agent_id: &'a str,
  pub key:      &'a str,
  pub value:    &'a str,
  pub metadata: &'a Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
  pub allowed:        bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub blocked_by:     Option<BlockedBy>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reason:         Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub expires_at:     Option<DateTime<Utc>>,
  /// The value to store; differs from the input when PII was redacted.
  #[serde(skip)]
  pub value:          String,
  pub redacted:       bool,
  pub memory_type:    MemoryType,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub matched_prefix: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub matched_scope:  Option<PolicyScope>,
  /// Kinds of sensitive content found (e.g. `email`, `aws_access_key`).
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub findings:       Vec<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub diagnostics:    Vec<Diagnostic>,
}

impl Decision {
  fn block(mut self, by: BlockedBy, reason: impl Into<String>) -> Self {
    self.allowed = false;
    self.blocked_by = Some(by);
    self.reason = Some(reason.into());
    self.expires_at = None;
    self
  }

  /// The decision as audit-event metadata. `blocked_by` and `reason` are included here so the
  /// chain hash covers them.
  pub fn audit_metadata(&self) -> Value {
    serde_json::to_value(self).unwrap_or(Value::Null)
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Stateless evaluator over a [`PolicySet`] using pluggable detectors.
#[derive(Clone, Default)]
pub struct PolicyEngine {
  detectors: Detectors,
}

impl PolicyEngine {
  pub fn new(detectors: Detectors) -> Self { Self { detectors } }

  pub fn detectors(&self) -> &Detectors { &self.detectors }

  /// Decide whether `input` may be stored.
  ///
  /// Checks run in a fixed order and the first failing check wins: malformed policy,
  /// do-not-store, type gate, PII block, secrets block. Redaction happens only once every
  /// blocking check has passed. A retention period whose expiry cannot be represented blocks
  /// like a malformed policy.
  pub fn evaluate(
    &self,
    set: &PolicySet,
    input: EvaluationInput<'_>,
    now: DateTime<Utc>,
  ) -> Decision {
    let memory_type = self.detectors.classifier.classify(input.key, input.value, input.metadata);

    let matched = set.matching(input.key);

    let mut decision = Decision {
      allowed: true,
      blocked_by: None,
      reason: None,
      expires_at: None,
      value: input.value.to_owned(),
      redacted: false,
      memory_type,
      matched_prefix: matched.map(|sp| sp.policy.subject_prefix.clone()),
      matched_scope: matched.map(|sp| sp.scope),
      findings: Vec::new(),
      diagnostics: set.diagnostics.clone(),
    };

    // Permissive default: allow, unlimited retention.
    let Some(ScopedPolicy { policy, .. }) = matched else {
      return decision;
    };

    if let Some(why) = &policy.malformed {
      return decision.block(
        BlockedBy::Malformed,
        format!("policy for prefix {:?} is malformed: {why}", policy.subject_prefix),
      );
    }

    if policy.do_not_store {
      return decision.block(
        BlockedBy::DoNotStore,
        format!("prefix {:?} is marked do-not-store", policy.subject_prefix),
      );
    }

    if !policy.allow_types.allows(memory_type) {
      return decision.block(
        BlockedBy::TypeNotAllowed,
        format!(
          "{} memories are not allowed under prefix {:?}",
          memory_type.as_str(),
          policy.subject_prefix
        ),
      );
    }

    let pii = match policy.pii_mode {
      PiiMode::Allow => Vec::new(),
      PiiMode::Block | PiiMode::Redact => self.detectors.pii.detect(input.value),
    };

    if policy.pii_mode == PiiMode::Block && !pii.is_empty() {
      decision.findings = kinds(&pii);
      let reason = format!("value contains PII: {}", decision.findings.join(", "));
      return decision.block(BlockedBy::BlockPii, reason);
    }

    let secrets = self.detectors.secrets.detect(input.value);
    if !secrets.is_empty() {
      decision.findings = kinds(&secrets);
      let reason = format!("value contains secrets: {}", decision.findings.join(", "));
      return decision.block(BlockedBy::BlockSecrets, reason);
    }

    if policy.pii_mode == PiiMode::Redact && !pii.is_empty() {
      decision.findings = kinds(&pii);
      decision.value = redact(input.value, &pii);
      decision.redacted = true;
    }

    if let Some(days) = policy.retention_days {
      match expiry(now, days) {
        Some(at) => decision.expires_at = Some(at),
        None => {
          return decision.block(
            BlockedBy::Malformed,
            format!("retention period for prefix {:?} is out of range", policy.subject_prefix),
          );
        }
      }
    }
    decision
  }
}

/// `now + days`, or `None` when the result overflows or leaves the four-digit years that
/// stored timestamps can represent.
fn expiry(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
  Duration::try_days(i64::from(days))
    .and_then(|d| now.checked_add_signed(d))
    .filter(|at| at.year() <= 9999)
}

fn kinds(findings: &[crate::detect::Finding]) -> Vec<String> {
  let mut out: Vec<String> = findings.iter().map(|f| f.kind.to_owned()).collect();
  out.sort();
  out.dedup();
  out
}
