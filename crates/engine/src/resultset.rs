//! Result sets
//!
//! A query produces one row per matched entry and one column per fetch
//! item. A cell holds a linked list of results, because one fetch can
//! legitimately surface several values (multiple attributes, or several
//! sources tied at the best priority). Rows are reference-counted and
//! borrow nothing from the store: every result clones the interned `Arc`s.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sonata_core::{CmpMode, SharedStr, Value};
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

/// One result: an attribute with its source, plus the rest of the cell's
/// list.
pub struct ResultNode {
    key: SharedStr,
    val: Value,
    src: Option<SharedStr>,
    next: Option<Box<ResultNode>>,
}

impl ResultNode {
    pub(crate) fn new(
        key: SharedStr,
        val: Value,
        src: Option<SharedStr>,
        next: Option<Box<ResultNode>>,
    ) -> ResultNode {
        ResultNode {
            key,
            val,
            src,
            next,
        }
    }

    /// The attribute key.
    pub fn key(&self) -> &str {
        self.key.as_str()
    }

    /// The attribute value.
    pub fn value(&self) -> &Value {
        &self.val
    }

    /// The asserting source; `None` on entry-identity results.
    pub fn src(&self) -> Option<&str> {
        self.src.as_ref().map(SharedStr::as_str)
    }

    /// The next result of this cell.
    pub fn next(&self) -> Option<&ResultNode> {
        self.next.as_deref()
    }

    pub(crate) fn key_shared(&self) -> &SharedStr {
        &self.key
    }

    pub(crate) fn src_shared(&self) -> Option<&SharedStr> {
        self.src.as_ref()
    }

    /// Iterates this node and its successors.
    pub fn iter(&self) -> impl Iterator<Item = &ResultNode> {
        std::iter::successors(Some(self), |node| node.next())
    }
}

impl std::fmt::Debug for ResultNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key.as_str(), self.val)?;
        if let Some(src) = self.src() {
            write!(f, " ({src})")?;
        }
        Ok(())
    }
}

/// One row of a result set.
pub struct ResultRow {
    cols: Vec<Option<ResultNode>>,
}

impl ResultRow {
    pub(crate) fn new(cols: Vec<Option<ResultNode>>) -> ResultRow {
        ResultRow { cols }
    }

    /// The cell at `col`, if non-empty.
    pub fn col(&self, col: usize) -> Option<&ResultNode> {
        self.cols.get(col).and_then(Option::as_ref)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.cols.len()
    }

    /// True when the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }
}

/// Sort direction of one order entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Smallest first
    Ascending,
    /// Largest first
    Descending,
}

enum OrderEntry {
    /// Sort by the first non-empty column of `choices`.
    Columns {
        choices: Vec<usize>,
        direction: Direction,
        mode: CmpMode,
    },
    /// Shuffle deterministically from a seed.
    Random { seed: u64 },
}

/// A multi-entry sort order for [`ResultSet::sort`].
#[derive(Default)]
pub struct Order {
    entries: Vec<OrderEntry>,
}

impl Order {
    /// Creates an empty order.
    pub fn new() -> Order {
        Order {
            entries: Vec::new(),
        }
    }

    /// Adds a column order entry: the first column in `choices` with a
    /// non-empty cell supplies the sort value. Rows without any value
    /// order first (before direction is applied).
    pub fn add_columns(&mut self, choices: Vec<usize>, direction: Direction, mode: CmpMode) {
        self.entries.push(OrderEntry::Columns {
            choices,
            direction,
            mode,
        });
    }

    /// Adds a seeded random order entry.
    pub fn add_random(&mut self, seed: u64) {
        self.entries.push(OrderEntry::Random { seed });
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entry was added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The materialized result of a query.
pub struct ResultSet {
    col_count: usize,
    rows: Vec<Arc<ResultRow>>,
}

impl ResultSet {
    pub(crate) fn new(col_count: usize) -> ResultSet {
        ResultSet {
            col_count,
            rows: Vec::new(),
        }
    }

    pub(crate) fn add_row(&mut self, row: ResultRow) {
        self.rows.push(Arc::new(row));
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns.
    pub fn col_count(&self) -> usize {
        self.col_count
    }

    /// The row at `i`.
    pub fn row(&self, i: usize) -> Option<&Arc<ResultRow>> {
        self.rows.get(i)
    }

    /// The cell at `(row, col)`.
    pub fn result(&self, row: usize, col: usize) -> Option<&ResultNode> {
        self.rows.get(row).and_then(|r| r.col(col))
    }

    /// Iterates the rows in order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResultRow>> {
        self.rows.iter()
    }

    /// Sorts the rows by `order`. The sort is stable: ties keep their
    /// original relative position.
    pub fn sort(&mut self, order: &Order) {
        if order.is_empty() || self.rows.len() < 2 {
            return;
        }

        // Random entries get one key per row, drawn from the seeded
        // generator in original row order.
        let random_keys: Vec<Option<Vec<u64>>> = order
            .entries
            .iter()
            .map(|entry| match entry {
                OrderEntry::Random { seed } => {
                    let mut rng = StdRng::seed_from_u64(*seed);
                    Some((0..self.rows.len()).map(|_| rng.gen()).collect())
                }
                OrderEntry::Columns { .. } => None,
            })
            .collect();

        let mut indexed: Vec<(usize, Arc<ResultRow>)> =
            std::mem::take(&mut self.rows).into_iter().enumerate().collect();

        indexed.sort_by(|(ia, a), (ib, b)| {
            for (ei, entry) in order.entries.iter().enumerate() {
                let ord = match entry {
                    OrderEntry::Columns {
                        choices,
                        direction,
                        mode,
                    } => {
                        let va = first_value(a, choices);
                        let vb = first_value(b, choices);
                        let ord = match (va, vb) {
                            (None, None) => CmpOrdering::Equal,
                            (None, Some(_)) => CmpOrdering::Less,
                            (Some(_), None) => CmpOrdering::Greater,
                            (Some(x), Some(y)) => x.cmp_mode(y, *mode),
                        };
                        match direction {
                            Direction::Ascending => ord,
                            Direction::Descending => ord.reverse(),
                        }
                    }
                    OrderEntry::Random { .. } => {
                        let keys = random_keys[ei].as_ref().expect("random keys precomputed");
                        keys[*ia].cmp(&keys[*ib])
                    }
                };
                if ord != CmpOrdering::Equal {
                    return ord;
                }
            }
            CmpOrdering::Equal
        });

        self.rows = indexed.into_iter().map(|(_, row)| row).collect();
    }

    /// Shuffles the rows into a random order.
    pub fn shuffle(&mut self) {
        self.rows.shuffle(&mut rand::thread_rng());
    }
}

fn first_value<'r>(row: &'r ResultRow, choices: &[usize]) -> Option<&'r Value> {
    choices
        .iter()
        .find_map(|&col| row.col(col))
        .map(ResultNode::value)
}
