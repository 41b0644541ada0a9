//! Trigger-less schema drift detection.
//!
//! When DDL event triggers are not installed upstream, the only signal
//! of a schema change is the relation metadata that pgoutput re-sends
//! before the next data message. Comparing the cached relation against
//! the fresh one lets us derive a small set of supported DDL changes;
//! anything ambiguous or unsupported fails the stream, because applying
//! a wrong guess would silently corrupt the replica.

use zero_core::change::{ColumnSpec, DataChange, Relation};

use super::ChangeSourceError;

/// Derives the DDL changes separating `old` from `new`.
pub fn diff_relations(
    old: &Relation,
    new: &Relation,
) -> Result<Vec<DataChange>, ChangeSourceError> {
    if old.id != new.id {
        return Ok(vec![DataChange::RenameTable { id: old.id.clone(), new: new.id.clone() }]);
    }
    if old.row_key.columns != new.row_key.columns {
        return Err(ChangeSourceError::UnsupportedSchemaChange(format!(
            "{}: row key (e.g. PRIMARY KEY or INDEX) has changed",
            new.id
        )));
    }

    let mut changes = Vec::new();
    if old.row_key.identity != new.row_key.identity {
        changes.push(DataChange::ChangeReplicaIdentity {
            id: new.id.clone(),
            identity: new.row_key.identity,
        });
    }

    let old_cols = &old.columns;
    let new_cols = &new.columns;

    // Appended columns are additions.
    let shared = old_cols.len().min(new_cols.len());
    for spec in new_cols.iter().skip(shared) {
        changes.push(DataChange::AddColumn { id: new.id.clone(), column: spec.clone() });
    }
    // Trailing drops.
    for spec in old_cols.iter().skip(shared) {
        changes.push(DataChange::DropColumn { id: new.id.clone(), column: spec.name.clone() });
    }

    // Positionally shared columns may rename or change type, but not
    // both at once: that is indistinguishable from a drop + add.
    for (old_col, new_col) in old_cols.iter().take(shared).zip(new_cols.iter().take(shared)) {
        match (old_col.name == new_col.name, old_col.metadata == new_col.metadata) {
            (true, true) => {}
            (false, true) => {
                ensure_unambiguous_rename(old_col, new_cols, &new.id)?;
                changes.push(DataChange::RenameColumn {
                    id: new.id.clone(),
                    old: old_col.name.clone(),
                    new: new_col.name.clone(),
                });
            }
            (true, false) => {
                changes.push(DataChange::UpdateColumn {
                    id: new.id.clone(),
                    column: new_col.clone(),
                });
            }
            (false, false) => {
                return Err(ChangeSourceError::UnsupportedSchemaChange(format!(
                    "{}: column {} changed name and type at once",
                    new.id, old_col.name
                )));
            }
        }
    }
    Ok(changes)
}

fn ensure_unambiguous_rename(
    old_col: &ColumnSpec,
    new_cols: &[ColumnSpec],
    table: &zero_core::change::TableId,
) -> Result<(), ChangeSourceError> {
    // The old name still existing elsewhere means columns were swapped
    // or shuffled; positions alone cannot say which is which.
    if new_cols.iter().any(|c| c.name == old_col.name) {
        return Err(ChangeSourceError::UnsupportedSchemaChange(format!(
            "{table}: ambiguous reordering of column {}",
            old_col.name
        )));
    }
    Ok(())
}
