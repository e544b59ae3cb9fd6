//! Shared defaults for graph decoding, compilation and validation.
//!
//! The resolver, the storage codec and the validator all fall back to these
//! values, so they are kept in one place.

use crate::graph::{Cardinality, JoinType};

/// Join type of an edge that does not specify one.
pub const DEFAULT_JOIN_TYPE: JoinType = JoinType::Left;

/// Cardinality assumed until the validator measures the edge.
pub const DEFAULT_CARDINALITY: Cardinality = Cardinality::OneToMany;

/// Key column used when an edge omits a column or its key cannot be decoded.
pub const DEFAULT_KEY_COLUMN: &str = "id";

/// Prefix of the compiled alias given to each table (`t1`, `t2`, ...).
pub const TABLE_ALIAS_PREFIX: &str = "t";

pub(crate) fn default_key_column() -> String {
    DEFAULT_KEY_COLUMN.to_string()
}

/// Compiled alias of the table at `index` (zero based) in model order.
pub fn table_alias(index: usize) -> String {
    format!("{TABLE_ALIAS_PREFIX}{}", index + 1)
}
