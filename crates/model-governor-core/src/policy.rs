// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Policy documents, immutable snapshots, and the swappable store.
//!
//! A [`PolicyDocument`] is the JSON shape on disk:
//!
//! ```json
//! {
//!   "maxInFlight": 4,
//!   "dailyBudgetCents": 5000,
//!   "allowedModels": ["small-model", "large-model"],
//!   "allowedCapabilities": { "ChatCompletion": ["read"], "ToolCall": ["read", "search"] },
//!   "riskRequiresApproval": ["pii", "financial"]
//! }
//! ```
//!
//! It is validated into a [`PolicySnapshot`], which is never mutated.  The
//! [`PolicyStore`] holds the current snapshot behind an `Arc` and replaces it
//! wholesale, so a reader always sees one complete snapshot.  A document that
//! fails to parse or validate never displaces the snapshot already in place.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PolicyError;
use crate::types::ActionType;

// ---------------------------------------------------------------------------
// PolicyDocument
// ---------------------------------------------------------------------------

/// Policy as written in the backing JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    pub max_in_flight: u32,
    pub daily_budget_cents: u64,
    pub allowed_models: Vec<String>,
    /// Action type wire name → allowed capability strings.
    #[serde(default)]
    pub allowed_capabilities: std::collections::BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub risk_requires_approval: Vec<String>,
}

impl PolicyDocument {
    /// Parse a JSON policy document.
    pub fn from_json(raw: &str) -> Result<Self, PolicyError> {
        Ok(serde_json::from_str(raw)?)
    }
}

// ---------------------------------------------------------------------------
// PolicySnapshot
// ---------------------------------------------------------------------------

/// Immutable, validated set of limits and allow-lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub max_in_flight: u32,
    pub daily_budget_cents: u64,
    pub allowed_models: HashSet<String>,
    pub allowed_capabilities: HashMap<ActionType, HashSet<String>>,
    pub risk_requires_approval: HashSet<String>,
}

impl PolicySnapshot {
    /// Validate `document` into a snapshot.
    ///
    /// Capability lists keyed by an unknown action type are rejected rather
    /// than silently dropped.
    pub fn from_document(document: PolicyDocument) -> Result<Self, PolicyError> {
        let mut allowed_capabilities = HashMap::new();
        for (action, capabilities) in document.allowed_capabilities {
            let action: ActionType = action
                .parse()
                .map_err(|_| PolicyError::UnknownActionType(action.clone()))?;
            allowed_capabilities.insert(action, capabilities.into_iter().collect());
        }

        Ok(Self {
            max_in_flight: document.max_in_flight,
            daily_budget_cents: document.daily_budget_cents,
            allowed_models: document.allowed_models.into_iter().collect(),
            allowed_capabilities,
            risk_requires_approval: document.risk_requires_approval.into_iter().collect(),
        })
    }

    /// Parse and validate a JSON policy document.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use model_governor_core::policy::PolicySnapshot;
    /// use model_governor_core::types::ActionType;
    ///
    /// let snapshot = PolicySnapshot::from_json(r#"{
    ///     "maxInFlight": 2,
    ///     "dailyBudgetCents": 100,
    ///     "allowedModels": ["small-model"],
    ///     "allowedCapabilities": { "ToolCall": ["search"] },
    ///     "riskRequiresApproval": ["pii"]
    /// }"#).unwrap();
    ///
    /// assert!(snapshot.is_model_allowed("small-model"));
    /// assert!(snapshot.is_capability_allowed(ActionType::ToolCall, "search"));
    /// assert!(!snapshot.is_capability_allowed(ActionType::ChatCompletion, "search"));
    /// ```
    pub fn from_json(raw: &str) -> Result<Self, PolicyError> {
        Self::from_document(PolicyDocument::from_json(raw)?)
    }

    pub fn is_model_allowed(&self, model_id: &str) -> bool {
        self.allowed_models.contains(model_id)
    }

    /// A capability is allowed only if it is listed for this action type.
    pub fn is_capability_allowed(&self, action: ActionType, capability: &str) -> bool {
        self.allowed_capabilities
            .get(&action)
            .is_some_and(|allowed| allowed.contains(capability))
    }

    pub fn requires_approval(&self, risk_flag: &str) -> bool {
        self.risk_requires_approval.contains(risk_flag)
    }
}

// ---------------------------------------------------------------------------
// PolicyStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Current {
    snapshot: Arc<PolicySnapshot>,
    version: u64,
}

/// Holder of the current [`PolicySnapshot`].
///
/// Readers clone the inner `Arc` and release the lock immediately; they never
/// hold it across a decision.  Writers swap in a complete new snapshot.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Current>,
}

impl PolicyStore {
    /// Create a store holding `snapshot` as version 1.
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            current: RwLock::new(Current {
                snapshot: Arc::new(snapshot),
                version: 1,
            }),
        }
    }

    /// Load the initial snapshot from a JSON file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        Ok(Self::new(read_policy_file(path.as_ref())?))
    }

    /// The snapshot in force right now.
    pub fn current(&self) -> Arc<PolicySnapshot> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current.snapshot)
    }

    /// Monotonic counter bumped on every successful swap.
    pub fn version(&self) -> u64 {
        self.current.read().unwrap_or_else(PoisonError::into_inner).version
    }

    /// Install `snapshot` as the new current snapshot.  Returns the new version.
    pub fn replace(&self, snapshot: PolicySnapshot) -> u64 {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        current.snapshot = Arc::new(snapshot);
        current.version += 1;
        current.version
    }

    /// Parse `raw` and, only if it is valid, swap it in.
    ///
    /// On failure the previous snapshot stays authoritative.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use model_governor_core::policy::{PolicySnapshot, PolicyStore};
    ///
    /// let initial = r#"{"maxInFlight":1,"dailyBudgetCents":10,"allowedModels":["m"]}"#;
    /// let store = PolicyStore::new(PolicySnapshot::from_json(initial).unwrap());
    ///
    /// assert!(store.reload_from_str("{ not json").is_err());
    /// assert_eq!(store.current().max_in_flight, 1);
    ///
    /// store.reload_from_str(r#"{"maxInFlight":3,"dailyBudgetCents":10,"allowedModels":["m"]}"#).unwrap();
    /// assert_eq!(store.current().max_in_flight, 3);
    /// assert_eq!(store.version(), 2);
    /// ```
    pub fn reload_from_str(&self, raw: &str) -> Result<u64, PolicyError> {
        match PolicySnapshot::from_json(raw) {
            Ok(snapshot) => {
                let version = self.replace(snapshot);
                info!(version, "policy snapshot replaced");
                Ok(version)
            }
            Err(error) => {
                warn!(%error, "policy reload rejected; keeping previous snapshot");
                Err(error)
            }
        }
    }
}

fn read_policy_file(path: &Path) -> Result<PolicySnapshot, PolicyError> {
    let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    PolicySnapshot::from_json(&raw)
}
