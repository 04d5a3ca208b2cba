use super::{Row, RowKey, row_key};
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use smol_str::SmolStr;
use std::hash::BuildHasherDefault;

/// One row-level change as decoded from the write-ahead log.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOp {
    Insert { columns: Row },
    Update { columns: Row, old_keys: Row },
    Delete { old_keys: Row },
}

impl ChangeOp {
    /// Column values after the change (insert/update).
    pub fn new_row(&self) -> Option<&Row> {
        match self {
            ChangeOp::Insert { columns } | ChangeOp::Update { columns, .. } => Some(columns),
            ChangeOp::Delete { .. } => None,
        }
    }

    /// Old key columns (update/delete). May hold only `id` depending on replica identity.
    pub fn old_row(&self) -> Option<&Row> {
        match self {
            ChangeOp::Update { old_keys, .. } | ChangeOp::Delete { old_keys } => Some(old_keys),
            ChangeOp::Insert { .. } => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeOp::Delete { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeOp::Insert { .. } => "insert",
            ChangeOp::Update { .. } => "update",
            ChangeOp::Delete { .. } => "delete",
        }
    }

    /// Id the change touches, taken from the new values first.
    pub fn key(&self) -> Option<RowKey> {
        self.new_row()
            .and_then(row_key)
            .or_else(|| self.old_row().and_then(row_key))
    }
}

/// A change scoped to one physical table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationChange {
    pub table: SmolStr,
    pub op: ChangeOp,
}

impl ReplicationChange {
    pub fn new(table: impl Into<SmolStr>, op: ChangeOp) -> Self {
        Self {
            table: table.into(),
            op,
        }
    }
}

/// One ordered batch from the replication feed with its log position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeBatch {
    pub lsn: Option<SmolStr>,
    pub changes: Vec<ReplicationChange>,
}

impl ChangeBatch {
    /// Numeric log position, when the batch carries a well-formed one.
    pub fn position(&self) -> Option<u64> {
        self.lsn.as_deref().and_then(parse_lsn)
    }
}

/// Parse a `hi/lo` hex log position (`"0/16B3748"`) into a comparable integer.
pub fn parse_lsn(lsn: &str) -> Option<u64> {
    let (hi, lo) = lsn.split_once('/')?;
    let hi = u32::from_str_radix(hi, 16).ok()?;
    let lo = u32::from_str_radix(lo, 16).ok()?;
    Some((u64::from(hi) << 32) | u64::from(lo))
}

pub fn format_lsn(position: u64) -> String {
    format!("{:X}/{:X}", position >> 32, position & 0xFFFF_FFFF)
}

/// `logical table -> changes` for one batch, in arrival order.
pub type GroupedChanges = IndexMap<SmolStr, Vec<ChangeOp>, BuildHasherDefault<FxHasher>>;

/// Group a batch by logical table. `resolve` maps a physical table name to its
/// model key; changes on unmapped tables are dropped.
pub fn group_changes<I, F>(changes: I, resolve: F) -> GroupedChanges
where
    I: IntoIterator<Item = ReplicationChange>,
    F: Fn(&str) -> Option<SmolStr>,
{
    let mut grouped = GroupedChanges::default();
    for change in changes {
        match resolve(change.table.as_str()) {
            Some(table) => grouped.entry(table).or_default().push(change.op),
            None => {
                tracing::debug!(table = %change.table, "Dropping change for unmapped table");
            }
        }
    }
    grouped
}
