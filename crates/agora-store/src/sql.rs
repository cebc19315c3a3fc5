//! Translation of [`Filter`]s into parameterized SQL.
//!
//! Every clause binds its values; nothing from a filter is interpolated into
//! the SQL text except placeholder lists.

use agora_core::Filter;
use rusqlite::types::Value;

/// Columns selected for a full event row, in [`crate::store`] row order.
pub(crate) const EVENT_COLUMNS: &str = "id, pubkey, created_at, kind, tags, content, sig";

/// A `WHERE` body plus its bound parameters.
#[derive(Debug, Default)]
pub(crate) struct Clause {
    pub sql: String,
    pub params: Vec<Value>,
}

/// `?, ?, ?` for `n` parameters.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Build the predicate for one filter.
///
/// `since`/`until` from the query options tighten the filter's own bounds.
/// Masked (deleted) rows are always excluded.
pub(crate) fn filter_clause(filter: &Filter, since: Option<u64>, until: Option<u64>) -> Clause {
    let mut conditions = vec!["deleted = 0".to_string()];
    let mut params = Vec::new();

    // `ids` first so SQLite resolves it against the primary key.
    if let Some(ids) = &filter.ids {
        conditions.push(format!("id IN ({})", placeholders(ids.len())));
        params.extend(ids.iter().cloned().map(Value::Text));
    }
    if let Some(authors) = &filter.authors {
        conditions.push(format!("pubkey IN ({})", placeholders(authors.len())));
        params.extend(authors.iter().cloned().map(Value::Text));
    }
    if let Some(kinds) = &filter.kinds {
        conditions.push(format!("kind IN ({})", placeholders(kinds.len())));
        params.extend(kinds.iter().map(|k| Value::Integer(i64::from(*k))));
    }
    for (name, values) in &filter.tags {
        conditions.push(format!(
            "id IN (SELECT event_id FROM event_tags WHERE name = ? AND value IN ({}))",
            placeholders(values.len())
        ));
        params.push(Value::Text(name.clone()));
        params.extend(values.iter().cloned().map(Value::Text));
    }

    let since = tightest(filter.since, since, u64::max);
    let until = tightest(filter.until, until, u64::min);
    if let Some(since) = since {
        conditions.push("created_at >= ?".to_string());
        params.push(Value::Integer(to_sql_int(since)));
    }
    if let Some(until) = until {
        conditions.push("created_at <= ?".to_string());
        params.push(Value::Integer(to_sql_int(until)));
    }

    Clause {
        sql: conditions.join(" AND "),
        params,
    }
}

/// SQLite integers are signed; larger bounds saturate.
fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn tightest(a: Option<u64>, b: Option<u64>, pick: fn(u64, u64) -> u64) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, b) => a.or(b),
    }
}

/// Newest-first select for one filter, ties broken by ascending id.
pub(crate) fn select_events(filter: &Filter, since: Option<u64>, until: Option<u64>, limit: Option<usize>) -> Clause {
    let clause = filter_clause(filter, since, until);
    let mut sql = format!(
        "SELECT {} FROM events WHERE {} ORDER BY created_at DESC, id ASC",
        EVENT_COLUMNS, clause.sql
    );
    if let Some(limit) = limit {
        let limit = u64::try_from(limit).map_or(i64::MAX, to_sql_int);
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    Clause {
        sql,
        params: clause.params,
    }
}

/// Count of distinct rows matching any of the filters.
pub(crate) fn count_events(filters: &[&Filter], since: Option<u64>, until: Option<u64>) -> Clause {
    let mut params = Vec::new();
    let predicates: Vec<String> = filters
        .iter()
        .map(|filter| {
            let clause = filter_clause(filter, since, until);
            params.extend(clause.params);
            format!("({})", clause.sql)
        })
        .collect();
    Clause {
        sql: format!(
            "SELECT COUNT(*) FROM events WHERE {}",
            predicates.join(" OR ")
        ),
        params,
    }
}
