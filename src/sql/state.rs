//! The rolling fold-time state for SQL compilation (spec §3 "SqlState").

use crate::ir::{ScalarValue, SortSpec};

/// A parenthesisable SQL fragment and the parameters it references, kept in
/// lockstep: `params[i]` is the value bound by the `i`-th `?` in `sql`,
/// reading left to right.
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<ScalarValue>,
}

impl SqlFragment {
    pub fn new(sql: impl Into<String>, params: Vec<ScalarValue>) -> Self {
        SqlFragment {
            sql: sql.into(),
            params,
        }
    }
}

/// The fold-time state threaded through `applySqlStep`. Each step produces a
/// new `SqlState`; nothing is mutated in place, matching the purely
/// functional boundary described for the whole compiler.
#[derive(Debug, Clone)]
pub struct SqlState {
    pub fragment: SqlFragment,
    /// Current output column ordering, when known. Many steps refuse to
    /// fold once this is `None` (selectColumns, removeColumns, groupBy
    /// output-name checks all need it).
    pub columns: Option<Vec<String>>,
    /// A pending sort spec not yet embedded in `fragment.sql` — used only
    /// for SQL Server, which rejects `ORDER BY` inside a derived table.
    pub sort_by: Option<Vec<SortSpec>>,
    /// Whether the last emitted `ORDER BY` already lives inside `fragment.sql`
    /// (true for every other dialect once a sort step runs; also true for the
    /// SQL Server `take` case, which is the one place a sort may ride along
    /// with a `TOP` clause inside a derived table).
    pub sort_in_fragment: bool,
    pub connection_id: Option<String>,
    pub connection: String,
}

impl SqlState {
    pub fn from_source(sql: impl Into<String>, connection: impl Into<String>) -> Self {
        SqlState {
            fragment: SqlFragment::new(sql, Vec::new()),
            columns: None,
            sort_by: None,
            sort_in_fragment: false,
            connection_id: None,
            connection: connection.into(),
        }
    }

    pub fn with_columns(mut self, columns: Option<Vec<String>>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_connection_id(mut self, connection_id: Option<String>) -> Self {
        self.connection_id = connection_id;
        self
    }

    /// Wraps the current fragment as `(<prev>) AS <alias>` and replaces its
    /// SQL with `new_sql`, which is expected to reference the alias. The
    /// wrapped fragment's params are carried over unchanged; `extra_params`
    /// are appended after them (new params introduced by the wrapping step
    /// always sort after whatever the inner fragment already bound, since
    /// the inner fragment's placeholders appear first in the text).
    pub fn wrap(&self, new_sql: impl Into<String>, extra_params: Vec<ScalarValue>) -> SqlFragment {
        let mut params = self.fragment.params.clone();
        params.extend(extra_params);
        SqlFragment::new(new_sql, params)
    }

    /// Like [`SqlState::wrap`] but prepends `leading_params` ahead of the
    /// inner fragment's own params — needed when a step's own placeholders
    /// textually precede the wrapped subquery (e.g. `addColumn`'s expression
    /// sits in the outer SELECT list, before `FROM (<prev>) AS t`).
    pub fn wrap_with_leading_params(
        &self,
        new_sql: impl Into<String>,
        leading_params: Vec<ScalarValue>,
    ) -> SqlFragment {
        let mut params = leading_params;
        params.extend(self.fragment.params.clone());
        SqlFragment::new(new_sql, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_appends_extra_params_after_inner_ones() {
        let state = SqlState {
            fragment: SqlFragment::new("SELECT * FROM sales", vec![ScalarValue::Int(1)]),
            columns: None,
            sort_by: None,
            sort_in_fragment: false,
            connection_id: None,
            connection: "db1".into(),
        };
        let wrapped = state.wrap(
            "SELECT * FROM (prev) AS t WHERE t.x = ?",
            vec![ScalarValue::Int(2)],
        );
        assert_eq!(wrapped.params, vec![ScalarValue::Int(1), ScalarValue::Int(2)]);
    }

    #[test]
    fn wrap_with_leading_params_prepends() {
        let state = SqlState {
            fragment: SqlFragment::new("SELECT * FROM sales", vec![ScalarValue::Int(1)]),
            columns: None,
            sort_by: None,
            sort_in_fragment: false,
            connection_id: None,
            connection: "db1".into(),
        };
        let wrapped =
            state.wrap_with_leading_params("SELECT ?, t.* FROM (prev) AS t", vec![ScalarValue::Int(0)]);
        assert_eq!(wrapped.params, vec![ScalarValue::Int(0), ScalarValue::Int(1)]);
    }
}
