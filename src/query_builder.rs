//! Helpers that assemble SQL fragments paired with named parameters.
//!
//! Every builder returns `(sql, params)` where the parameters are keyed
//! with a `_QB_` prefix, so fragments can be merged into larger statements
//! without name collisions. Fields are emitted in sorted order, which keeps
//! the generated text stable.

use std::collections::BTreeMap;

use crate::params::Param;

/// Builds a simple `` `field`=%(_QB_field)s `` expression ready to be glued
/// onto another statement.
pub fn simple_expression<I>(joiner: &str, fields: I) -> (String, BTreeMap<String, Param>)
where
    I: IntoIterator<Item = (String, Param)>,
{
    let fields: BTreeMap<String, Param> = fields.into_iter().collect();

    let mut expression = Vec::with_capacity(fields.len());
    let mut params = BTreeMap::new();
    for (name, value) in fields {
        let key = format!("_QB_{name}");
        expression.push(format!("`{name}`=%({key})s"));
        params.insert(key, value);
    }

    (expression.join(joiner), params)
}

/// Builds an UPDATE statement over the given fields.
pub fn update<I>(table_name: &str, fields: I) -> (String, BTreeMap<String, Param>)
where
    I: IntoIterator<Item = (String, Param)>,
{
    let (sets, params) = simple_expression(", ", fields);
    (format!("UPDATE `{table_name}` SET {sets}"), params)
}

/// Builds a multi-row INSERT. Each row maps column name to value; all rows
/// must share the first row's columns.
pub fn multi_insert(
    table_name: &str,
    rows: &[BTreeMap<String, mysql_async::Value>],
) -> (String, BTreeMap<String, Param>) {
    build_multi_insert(table_name, rows, false)
}

/// Builds a multi-row REPLACE.
pub fn multi_replace(
    table_name: &str,
    rows: &[BTreeMap<String, mysql_async::Value>],
) -> (String, BTreeMap<String, Param>) {
    build_multi_insert(table_name, rows, true)
}

fn build_multi_insert(
    table_name: &str,
    rows: &[BTreeMap<String, mysql_async::Value>],
    replace: bool,
) -> (String, BTreeMap<String, Param>) {
    let columns: Vec<&String> = rows.first().map(|row| row.keys().collect()).unwrap_or_default();
    let column_list = columns
        .iter()
        .map(|column| format!("`{column}`"))
        .collect::<Vec<_>>()
        .join(", ");

    let verb = if replace { "REPLACE" } else { "INSERT" };
    let mut sql = Vec::with_capacity(rows.len());
    let mut params = BTreeMap::new();

    for (index, row) in rows.iter().enumerate() {
        let key = format!("_QB_ROW_{index}");
        let values: Vec<mysql_async::Value> = columns
            .iter()
            .map(|column| row.get(*column).cloned().unwrap_or(mysql_async::Value::NULL))
            .collect();
        params.insert(key.clone(), Param::List(values));
        sql.push(format!("(%({key})s)"));
    }

    (
        format!(
            "{verb} INTO `{table_name}` ({column_list}) VALUES {}",
            sql.join(", ")
        ),
        params,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{escape_query, Params};
    use mysql_async::Value;

    #[test]
    fn simple_expression_sorts_fields() {
        let (sql, params) = simple_expression(
            " AND ",
            [
                ("role".to_owned(), Param::value("admin")),
                ("name".to_owned(), Param::value("bob")),
            ],
        );
        assert_eq!(sql, "`name`=%(_QB_name)s AND `role`=%(_QB_role)s");

        let escaped = escape_query(&sql, &Params::Named(params)).unwrap();
        assert_eq!(escaped, "`name`='bob' AND `role`='admin'");
    }

    #[test]
    fn update_statement() {
        let (sql, params) = update(
            "foo_table",
            [
                ("a".to_owned(), Param::value(5)),
                ("b".to_owned(), Param::value(2)),
            ],
        );
        assert_eq!(sql, "UPDATE `foo_table` SET `a`=%(_QB_a)s, `b`=%(_QB_b)s");
        assert_eq!(
            escape_query(&sql, &Params::Named(params)).unwrap(),
            "UPDATE `foo_table` SET `a`=5, `b`=2"
        );
    }

    #[test]
    fn multi_insert_expands_rows() {
        let row = |a: i64, b: i64| {
            BTreeMap::from([
                ("a".to_owned(), Value::from(a)),
                ("b".to_owned(), Value::from(b)),
            ])
        };
        let (sql, params) = multi_insert("foo_table", &[row(5, 2), row(6, 3)]);
        assert_eq!(
            sql,
            "INSERT INTO `foo_table` (`a`, `b`) VALUES (%(_QB_ROW_0)s), (%(_QB_ROW_1)s)"
        );
        assert_eq!(
            escape_query(&sql, &Params::Named(params)).unwrap(),
            "INSERT INTO `foo_table` (`a`, `b`) VALUES (5,2), (6,3)"
        );
    }

    #[test]
    fn multi_replace_uses_replace_verb() {
        let row = BTreeMap::from([("a".to_owned(), Value::from(1))]);
        let (sql, _) = multi_replace("t", &[row]);
        assert!(sql.starts_with("REPLACE INTO `t`"));
    }
}
