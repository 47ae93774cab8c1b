//! Ordered-column reducer behind every kanban board (leads, tasks, service
//! orders).
//!
//! A board is a sequence of columns, each holding an ordered list of item
//! ids. A drag-and-drop gesture is described by a [`CardMove`]; applying it
//! removes the id from the source column and inserts it into the
//! destination column at the requested index. Callers persist the resulting
//! orderings and, when the column changed, the item's status.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoardError {
    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    #[error("Item {item_id} is not in column '{column}'")]
    ItemNotInColumn { item_id: i64, column: String },
}

/// One drag-and-drop gesture as reported by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardMove<C> {
    pub item_id: i64,
    pub from: C,
    /// Index the client saw the card at. Used when it still points at the
    /// card; otherwise the card is located by id.
    pub from_index: Option<usize>,
    pub to: C,
    /// Index in the destination column after the card was removed from
    /// its source. Clamped to the column length.
    pub to_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome {
    /// Final index of the card in the destination column.
    pub index: usize,
    /// True when the card changed column, i.e. its status must follow.
    pub status_changed: bool,
}

#[derive(Debug, Clone)]
pub struct Board<C> {
    columns: Vec<(C, Vec<i64>)>,
}

impl<C> Default for Board<C> {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
        }
    }
}

impl<C> Board<C>
where
    C: Clone + PartialEq + std::fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column with its current ordering.
    pub fn push_column(&mut self, key: C, ids: Vec<i64>) {
        self.columns.push((key, ids));
    }

    pub fn column(&self, key: &C) -> Option<&[i64]> {
        self.columns
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, ids)| ids.as_slice())
    }

    pub fn columns(&self) -> impl Iterator<Item = (&C, &[i64])> {
        self.columns.iter().map(|(k, ids)| (k, ids.as_slice()))
    }

    /// Locate an item anywhere on the board.
    pub fn position_of(&self, item_id: i64) -> Option<(&C, usize)> {
        self.columns.iter().find_map(|(key, ids)| {
            ids.iter()
                .position(|id| *id == item_id)
                .map(|idx| (key, idx))
        })
    }

    pub fn apply_move(&mut self, mv: &CardMove<C>) -> Result<MoveOutcome, BoardError> {
        let from_col = self.column_index(&mv.from)?;
        let to_col = self.column_index(&mv.to)?;

        let source = &mut self.columns[from_col].1;
        let remove_at = match mv.from_index {
            Some(idx) if source.get(idx) == Some(&mv.item_id) => idx,
            _ => source
                .iter()
                .position(|id| *id == mv.item_id)
                .ok_or_else(|| BoardError::ItemNotInColumn {
                    item_id: mv.item_id,
                    column: mv.from.to_string(),
                })?,
        };
        source.remove(remove_at);

        let dest = &mut self.columns[to_col].1;
        let index = mv.to_index.min(dest.len());
        dest.insert(index, mv.item_id);

        Ok(MoveOutcome {
            index,
            status_changed: from_col != to_col,
        })
    }

    fn column_index(&self, key: &C) -> Result<usize, BoardError> {
        self.columns
            .iter()
            .position(|(k, _)| k == key)
            .ok_or_else(|| BoardError::UnknownColumn(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> Board<String> {
        let mut b = Board::new();
        b.push_column("a".to_string(), vec![1, 2, 3]);
        b.push_column("b".to_string(), vec![10, 11, 12]);
        b.push_column("c".to_string(), vec![]);
        b
    }

    fn mv(item_id: i64, from: &str, from_index: Option<usize>, to: &str, to_index: usize) -> CardMove<String> {
        CardMove {
            item_id,
            from: from.to_string(),
            from_index,
            to: to.to_string(),
            to_index,
        }
    }

    #[test]
    fn move_across_columns_updates_both_orderings() {
        let mut b = board();
        let outcome = b.apply_move(&mv(1, "a", Some(0), "b", 2)).unwrap();

        assert_eq!(b.column(&"a".to_string()).unwrap(), &[2, 3]);
        assert_eq!(b.column(&"b".to_string()).unwrap(), &[10, 11, 1, 12]);
        assert_eq!(outcome.index, 2);
        assert!(outcome.status_changed);
    }

    #[test]
    fn reorder_within_column_keeps_status() {
        let mut b = board();
        let outcome = b.apply_move(&mv(1, "a", Some(0), "a", 2)).unwrap();

        assert_eq!(b.column(&"a".to_string()).unwrap(), &[2, 3, 1]);
        assert!(!outcome.status_changed);
    }

    #[test]
    fn destination_index_is_clamped() {
        let mut b = board();
        let outcome = b.apply_move(&mv(2, "a", Some(1), "c", 99)).unwrap();
        assert_eq!(b.column(&"c".to_string()).unwrap(), &[2]);
        assert_eq!(outcome.index, 0);
    }

    #[test]
    fn stale_source_index_falls_back_to_search() {
        let mut b = board();
        // Client believes card 3 is at index 0; it is at index 2.
        b.apply_move(&mv(3, "a", Some(0), "b", 0)).unwrap();
        assert_eq!(b.column(&"a".to_string()).unwrap(), &[1, 2]);
        assert_eq!(b.column(&"b".to_string()).unwrap(), &[3, 10, 11, 12]);
    }

    #[test]
    fn unknown_column_is_rejected_without_mutation() {
        let mut b = board();
        let err = b.apply_move(&mv(1, "a", None, "zzz", 0)).unwrap_err();
        assert_eq!(err, BoardError::UnknownColumn("zzz".into()));
        assert_eq!(b.column(&"a".to_string()).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn item_missing_from_source_is_rejected() {
        let mut b = board();
        let err = b.apply_move(&mv(10, "a", None, "c", 0)).unwrap_err();
        assert!(matches!(err, BoardError::ItemNotInColumn { item_id: 10, .. }));
    }

    #[test]
    fn position_of_finds_item() {
        let b = board();
        assert_eq!(b.position_of(11), Some((&"b".to_string(), 1)));
        assert_eq!(b.position_of(99), None);
    }
}
