//! Invalidation tags and tag derivation.
//!
//! A tag labels the data a cache entry depends on: a whole table, or one row
//! pinned by primary key. Mutations invalidate by tag, so a query touching N
//! tables carries the union of those tables' tags and dies when any of them
//! changes.

use std::collections::HashSet;
use std::fmt;

use crate::descriptor::{Operation, QueryDescriptor};

/// Invalidation-granularity label attached to a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    /// All rows of a table.
    Table(String),
    /// One row of a table, identified by its rendered primary key.
    Row { table: String, pk: String },
}

impl Tag {
    pub fn table(name: impl Into<String>) -> Self {
        Tag::Table(name.into())
    }

    pub fn row(table: impl Into<String>, pk: impl Into<String>) -> Self {
        Tag::Row {
            table: table.into(),
            pk: pk.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Table(table) => write!(f, "table:{table}"),
            Tag::Row { table, pk } => write!(f, "row:{table}:{pk}"),
        }
    }
}

/// Derives the tag set a descriptor touches.
///
/// Default posture is table-level tags only, which is always safe: false
/// invalidation is acceptable, a false hit on stale data is not. Row-level
/// tagging narrows the blast radius of point writes and is a
/// correctness-sensitive opt-in, see [`TagDeriver::new`].
pub struct TagDeriver {
    row_level: bool,
}

impl TagDeriver {
    /// `row_level` enables row tags.
    ///
    /// With row tags on, a point mutation (update/delete with a statically
    /// complete primary-key set) invalidates only the matching row tags, so a
    /// cached read pinned to a different row survives. This is only correct
    /// when every cached select that could observe a mutated row is itself
    /// pinned by primary key: an unpinned table scan carries no row tags and
    /// is not invalidated by a point write. Hosts that cache table scans must
    /// leave row-level tagging off.
    pub fn new(row_level: bool) -> Self {
        Self { row_level }
    }

    /// The tag set for a descriptor, read or mutation.
    pub fn tags(&self, descriptor: &QueryDescriptor) -> HashSet<Tag> {
        if descriptor.operation.is_mutation() {
            self.mutation_tags(descriptor)
        } else {
            self.read_tags(descriptor)
        }
    }

    /// Reads carry the table tag of every referenced table, plus row tags for
    /// tables pinned by primary key when row-level tagging is on.
    fn read_tags(&self, descriptor: &QueryDescriptor) -> HashSet<Tag> {
        let mut tags: HashSet<Tag> = descriptor
            .tables
            .iter()
            .map(|table| Tag::table(table.clone()))
            .collect();

        if self.row_level {
            for predicate in &descriptor.pk_predicates {
                tags.insert(Tag::row(predicate.table.clone(), predicate.value.render()));
            }
        }

        tags
    }

    /// Point mutations narrow to row tags; everything else falls back to the
    /// target tables' table tags, which also sweeps row-tagged reads because
    /// reads always keep their table tags.
    fn mutation_tags(&self, descriptor: &QueryDescriptor) -> HashSet<Tag> {
        if self.row_level && is_point_mutation(descriptor) {
            return descriptor
                .pk_predicates
                .iter()
                .map(|p| Tag::row(p.table.clone(), p.value.render()))
                .collect();
        }

        descriptor
            .tables
            .iter()
            .map(|table| Tag::table(table.clone()))
            .collect()
    }
}

/// An update or delete whose affected rows are statically identified.
///
/// Inserts never qualify: a new row can satisfy an existing pinned read's
/// predicate, so they invalidate at table granularity.
fn is_point_mutation(descriptor: &QueryDescriptor) -> bool {
    matches!(descriptor.operation, Operation::Update | Operation::Delete)
        && !descriptor.pk_predicates.is_empty()
}
