mod change;
mod row;
mod value;

use indexmap::IndexMap;
use rustc_hash::FxHasher;
use smol_str::SmolStr;
use std::hash::BuildHasherDefault;

pub type FastMap<K, V> = std::collections::HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FastSet<K> = std::collections::HashSet<K, BuildHasherDefault<FxHasher>>;

/// Insertion-ordered column map. Column order is part of what clients see.
pub type FieldMap = IndexMap<SmolStr, DbValue, BuildHasherDefault<FxHasher>>;

pub use change::{format_lsn, group_changes, parse_lsn, ChangeBatch, ChangeOp, GroupedChanges, ReplicationChange};
pub use row::{
    id_key, merge_row, row_from_json, row_id, row_key, row_to_json, union_rows,
    union_table_rows, Row, RowKey, TableRows, ID,
};
pub use value::DbValue;
