//! Query and mutation descriptors.
//!
//! A descriptor is the normalized, comparable form of one statement, produced
//! by the host's data-access layer before execution. It is independent of the
//! live query-builder object that produced it and is discarded after the
//! request completes.

/// The kind of statement a descriptor represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    /// DDL, administrative statements, anything the host could not classify.
    Other,
}

impl Operation {
    /// Returns true for statements that only read data.
    pub fn is_read(self) -> bool {
        matches!(self, Operation::Select)
    }

    /// Returns true for statements that change rows.
    pub fn is_mutation(self) -> bool {
        matches!(self, Operation::Insert | Operation::Update | Operation::Delete)
    }
}

/// A bound parameter value in placeholder order.
///
/// Covers the scalar value space the relational layer binds. `Float` carries
/// its IEEE-754 bit pattern through hashing so key derivation stays total and
/// deterministic, NaN included.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlParam {
    /// Canonical textual rendering, used for row-tag identity.
    pub(crate) fn render(&self) -> String {
        match self {
            SqlParam::Null => "null".to_string(),
            SqlParam::Bool(b) => b.to_string(),
            SqlParam::Int(i) => i.to_string(),
            SqlParam::Float(f) => format!("f{:016x}", f.to_bits()),
            SqlParam::Text(s) => s.clone(),
            SqlParam::Bytes(b) => hex::encode(b),
        }
    }
}

/// A statically known primary-key equality constraint.
///
/// Recorded by the host when a statement pins a row by primary key, e.g.
/// `WHERE id = ?` with a bound value. Row-level tags are derived from these.
#[derive(Debug, Clone, PartialEq)]
pub struct PkPredicate {
    pub table: String,
    pub column: String,
    pub value: SqlParam,
}

impl PkPredicate {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        value: SqlParam,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            value,
        }
    }
}

/// Normalized description of one query or mutation.
///
/// Immutable by contract: construct once per statement, never mutate. The
/// caller contract requires `raw_text` and `params` to be produced
/// deterministically for equivalent statements; key derivation does not
/// normalize formatting.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub operation: Operation,
    /// Referenced tables in from-clause order, joins included.
    pub tables: Vec<String>,
    /// Referenced (table, column) pairs, populated by hosts that track
    /// column-level usage; key derivation and policy ignore it.
    pub columns: Vec<(String, String)>,
    /// Canonical statement text with parameter placeholders.
    pub raw_text: String,
    /// Bound parameter values in placeholder order.
    pub params: Vec<SqlParam>,
    /// Primary-key equality constraints the host identified statically.
    pub pk_predicates: Vec<PkPredicate>,
}

impl QueryDescriptor {
    /// Describe a read query.
    pub fn select(
        tables: Vec<String>,
        raw_text: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Self {
        Self {
            operation: Operation::Select,
            tables,
            columns: Vec::new(),
            raw_text: raw_text.into(),
            params,
            pk_predicates: Vec::new(),
        }
    }

    /// Describe a mutation against a single target table.
    pub fn mutation(
        operation: Operation,
        table: impl Into<String>,
        raw_text: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Self {
        Self {
            operation,
            tables: vec![table.into()],
            columns: Vec::new(),
            raw_text: raw_text.into(),
            params,
            pk_predicates: Vec::new(),
        }
    }

    /// Attach a statically known primary-key constraint.
    pub fn with_pk_predicate(mut self, predicate: PkPredicate) -> Self {
        self.pk_predicates.push(predicate);
        self
    }

    /// Attach referenced (table, column) pairs.
    pub fn with_columns(mut self, columns: Vec<(String, String)>) -> Self {
        self.columns = columns;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_constructor_sets_operation() {
        let d = QueryDescriptor::select(
            vec!["users".to_string()],
            "select * from users",
            vec![],
        );
        assert_eq!(d.operation, Operation::Select);
        assert!(d.operation.is_read());
        assert!(!d.operation.is_mutation());
    }

    #[test]
    fn mutation_constructor_targets_one_table() {
        let d = QueryDescriptor::mutation(
            Operation::Delete,
            "users",
            "delete from users where id = ?",
            vec![SqlParam::Int(5)],
        );
        assert_eq!(d.tables, vec!["users".to_string()]);
        assert!(d.operation.is_mutation());
    }

    #[test]
    fn pk_predicates_chain() {
        let d = QueryDescriptor::select(
            vec!["users".to_string()],
            "select * from users where id = ?",
            vec![SqlParam::Int(7)],
        )
        .with_pk_predicate(PkPredicate::new("users", "id", SqlParam::Int(7)));

        assert_eq!(d.pk_predicates.len(), 1);
        assert_eq!(d.pk_predicates[0].table, "users");
    }

    #[test]
    fn float_params_render_via_bit_pattern() {
        let nan_a = SqlParam::Float(f64::NAN).render();
        let nan_b = SqlParam::Float(f64::NAN).render();
        assert_eq!(nan_a, nan_b);
        assert_ne!(
            SqlParam::Float(1.0).render(),
            SqlParam::Float(2.0).render()
        );
    }
}
