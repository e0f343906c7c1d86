//! Row-level policy evaluation.
//!
//! The storage core consumes an external policy engine through the
//! [`PolicyEngine`] trait: given a logical table and an auth context, the
//! engine returns a trusted SQL boolean fragment constraining which rows
//! the caller may read, insert, or delete.
//!
//! Trust boundary: fragments are trusted SQL and must never embed
//! request values.  They reference the caller through the `auth(user_id,
//! email, role)` relation and proposed rows through `new(bucket_id,
//! name, owner_id)`; the metadata store materializes both as
//! parameter-bound CTEs.  An empty fragment while enforcement is enabled
//! means the operation is denied.

use std::collections::HashMap;

use crate::auth::AuthContext;
use crate::config::PolicyConfig;

/// Logical table name for object rows.
pub const OBJECTS_TABLE: &str = "storage_objects";

/// Produces SQL predicate fragments for a (table, action, auth) triple.
pub trait PolicyEngine: Send + Sync + 'static {
    /// Whether row-level enforcement is active for `table`.
    fn is_enabled(&self, table: &str) -> bool;

    /// Predicate constraining reads.
    fn select_predicate(&self, table: &str, auth: &AuthContext) -> anyhow::Result<String>;

    /// Predicate checked against proposed rows.
    fn insert_predicate(&self, table: &str, auth: &AuthContext) -> anyhow::Result<String>;

    /// Predicate constraining deletes.
    fn delete_predicate(&self, table: &str, auth: &AuthContext) -> anyhow::Result<String>;
}

/// Per-role fragments for one table.
#[derive(Debug, Clone, Default)]
struct RoleFragments {
    select: String,
    insert: String,
    delete: String,
}

/// Policy engine configured from YAML.
///
/// Each role maps to three fragments; roles without an entry get empty
/// fragments and are therefore denied while enforcement is enabled.
pub struct ConfigPolicyEngine {
    enabled: bool,
    roles: HashMap<String, RoleFragments>,
}

impl ConfigPolicyEngine {
    pub fn new(config: &PolicyConfig) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|(role, fragments)| {
                (
                    role.clone(),
                    RoleFragments {
                        select: fragments.select.clone(),
                        insert: fragments.insert.clone(),
                        delete: fragments.delete.clone(),
                    },
                )
            })
            .collect();
        Self {
            enabled: config.enabled,
            roles,
        }
    }

    fn fragments(&self, auth: &AuthContext) -> RoleFragments {
        self.roles.get(&auth.role).cloned().unwrap_or_default()
    }
}

impl PolicyEngine for ConfigPolicyEngine {
    fn is_enabled(&self, table: &str) -> bool {
        self.enabled && table == OBJECTS_TABLE
    }

    fn select_predicate(&self, _table: &str, auth: &AuthContext) -> anyhow::Result<String> {
        Ok(self.fragments(auth).select)
    }

    fn insert_predicate(&self, _table: &str, auth: &AuthContext) -> anyhow::Result<String> {
        Ok(self.fragments(auth).insert)
    }

    fn delete_predicate(&self, _table: &str, auth: &AuthContext) -> anyhow::Result<String> {
        Ok(self.fragments(auth).delete)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
