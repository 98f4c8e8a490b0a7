//! Access control for config store objects
//!
//! A caller is the *owner* of a key when its registered prefix matches the
//! key's leading PDEs. Owner bits of the ACL govern owners, other bits govern
//! everyone else. DDSP attributes are reported alongside each decision but
//! never enforced here; the medium is responsible for those.

pub mod context;
pub mod pattern;

pub use context::{ContextId, ContextRegistry, SecurityContext};
pub use pattern::KeyPattern;

use crate::flags::{Acl, Ddsp, Permissions};
use serde::{Deserialize, Serialize};

/// Operation being checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Obtain a handle on an existing object
    Open,
    Read,
    Write,
    Execute,
    /// Create a new object (owner only)
    Create,
    /// Delete an object (owner only)
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Allow,
    Deny,
}

/// Result of an access check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCheck {
    pub verdict: Verdict,
    /// Requested protection the medium does not advertise
    pub advisory: Ddsp,
}

impl AccessCheck {
    pub fn allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}

/// Check whether `ctx` may perform `op` on `key` with `perms`
///
/// `available` is the DDSP set advertised by the medium.
pub fn check(
    ctx: &SecurityContext,
    key: &str,
    perms: Permissions,
    op: Operation,
    available: Ddsp,
) -> AccessCheck {
    let owner = ctx.owns(key);
    let acl = perms.acl;

    let allowed = match op {
        Operation::Create | Operation::Delete => owner,
        Operation::Open => owner || acl.grants_other(),
        Operation::Read => bit(owner, acl, Acl::OWNER_READ, Acl::OTHER_READ),
        Operation::Write => bit(owner, acl, Acl::OWNER_WRITE, Acl::OTHER_WRITE),
        Operation::Execute => bit(owner, acl, Acl::OWNER_EXE, Acl::OTHER_EXE),
    };

    AccessCheck {
        verdict: if allowed { Verdict::Allow } else { Verdict::Deny },
        advisory: perms.ddsp.unmet_by(available),
    }
}

fn bit(owner: bool, acl: Acl, owner_bit: Acl, other_bit: Acl) -> bool {
    if owner {
        acl.contains(owner_bit)
    } else {
        acl.contains(other_bit)
    }
}
