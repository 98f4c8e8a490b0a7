//! Security contexts and their namespace prefixes

use crate::error::{CfstoreError, Result};
use crate::validation::KeyName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a registered context, unique for the store's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextId(pub u32);

/// A caller identity bound to a namespace prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub id: ContextId,
    pub prefix: KeyName,
}

impl SecurityContext {
    /// The context owns every key whose leading PDEs equal its prefix
    pub fn owns(&self, key: &str) -> bool {
        crate::validation::has_leading_segments(key, self.prefix.as_str())
    }
}

/// Registered contexts of one store instance
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: BTreeMap<ContextId, SecurityContext>,
    next_id: u32,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new prefix
    ///
    /// The prefix must be a valid key name and not already registered.
    pub fn register(&mut self, prefix: &str) -> Result<SecurityContext> {
        let prefix = KeyName::new(prefix)?;
        if self.contexts.values().any(|ctx| ctx.prefix == prefix) {
            return Err(CfstoreError::AlreadyExists(format!(
                "security prefix '{}'",
                prefix
            )));
        }

        let ctx = SecurityContext {
            id: ContextId(self.next_id),
            prefix,
        };
        self.next_id += 1;
        self.contexts.insert(ctx.id, ctx.clone());
        tracing::debug!("Registered security context {} for '{}'", ctx.id.0, ctx.prefix);
        Ok(ctx)
    }

    pub fn unregister(&mut self, id: ContextId) -> Result<SecurityContext> {
        self.contexts
            .remove(&id)
            .ok_or_else(|| CfstoreError::NotFound(format!("security context {}", id.0)))
    }

    /// Confirm `ctx` is a currently registered context
    pub fn verify(&self, ctx: &SecurityContext) -> Result<()> {
        match self.contexts.get(&ctx.id) {
            Some(registered) if registered == ctx => Ok(()),
            _ => Err(CfstoreError::PermissionDenied(format!(
                "security context {} is not registered",
                ctx.id.0
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
