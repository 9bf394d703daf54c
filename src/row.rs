//! Rows and result sets.

use std::collections::BTreeMap;
use std::ops::Index;
use std::sync::Arc;

use chrono::NaiveDateTime;
use mysql_async::prelude::FromValue;
use mysql_async::{from_value_opt, Value};

use crate::error::{Error, Result};

/// A single row of a result set.
///
/// Columns are addressable by ordinal position or by field name. A row can
/// be amended in place: [`set`](Row::set) overwrites a known column or
/// appends a new one. There are deliberately no whole-row mutators; rows
/// only ever grow.
#[derive(Debug, Clone)]
pub struct Row {
    fields: Arc<Vec<String>>,
    values: Vec<Value>,
}

/// A type that can locate a column within a [`Row`], either an integer
/// ordinal or a field name.
pub trait RowIndex {
    fn index(&self, row: &Row) -> Result<usize>;
}

impl RowIndex for usize {
    fn index(&self, row: &Row) -> Result<usize> {
        if *self >= row.len() {
            return Err(Error::ColumnNotFound(self.to_string().into_boxed_str()));
        }
        Ok(*self)
    }
}

impl RowIndex for &str {
    fn index(&self, row: &Row) -> Result<usize> {
        row.fields
            .iter()
            .position(|field| field == self)
            .ok_or_else(|| Error::ColumnNotFound((*self).into()))
    }
}

impl Row {
    pub(crate) fn new(fields: Arc<Vec<String>>, values: Vec<Value>) -> Row {
        Row { fields, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// The raw value at `index`.
    pub fn value(&self, index: impl RowIndex) -> Result<&Value> {
        let index = index.index(self)?;
        Ok(&self.values[index])
    }

    /// Decodes the value at `index` through the driver's conversions.
    pub fn get<T: FromValue>(&self, index: impl RowIndex) -> Result<T> {
        let value = self.value(index)?.clone();
        from_value_opt::<T>(value).map_err(|err| Error::Decode(err.to_string()))
    }

    /// Reads a nullable DATETIME column.
    pub fn get_datetime(&self, index: impl RowIndex) -> Result<Option<NaiveDateTime>> {
        match self.value(index)? {
            Value::NULL => Ok(None),
            Value::Date(year, month, day, hour, minute, second, micros) => {
                chrono::NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day))
                    .and_then(|date| {
                        date.and_hms_micro_opt(
                            u32::from(*hour),
                            u32::from(*minute),
                            u32::from(*second),
                            *micros,
                        )
                    })
                    .map(Some)
                    .ok_or_else(|| Error::Decode("DATETIME out of range".to_owned()))
            }
            Value::Bytes(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|err| Error::Decode(err.to_string()))?;
                NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                    .map(Some)
                    .map_err(|err| Error::Decode(format!("bad DATETIME {text:?}: {err}")))
            }
            other => Err(Error::Decode(format!("expected DATETIME, found {other:?}"))),
        }
    }

    /// Reads a nullable JSON column.
    pub fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        index: impl RowIndex,
    ) -> Result<Option<T>> {
        match self.value(index)? {
            Value::NULL => Ok(None),
            Value::Bytes(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            other => Err(Error::Decode(format!("expected JSON, found {other:?}"))),
        }
    }

    /// Overwrites a known column in place, or appends a new one.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.iter().position(|field| field == name) {
            Some(index) => self.values[index] = value,
            None => {
                Arc::make_mut(&mut self.fields).push(name.to_owned());
                self.values.push(value);
            }
        }
    }

    /// The row as a name → value mapping; the basis of row equality.
    pub fn to_map(&self) -> BTreeMap<&str, &Value> {
        self.fields
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
            .collect()
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Row) -> bool {
        self.to_map() == other.to_map()
    }
}

impl PartialEq<BTreeMap<&str, Value>> for Row {
    fn eq(&self, other: &BTreeMap<&str, Value>) -> bool {
        self.len() == other.len()
            && other
                .iter()
                .all(|(name, value)| self.value(*name).map_or(false, |found| found == value))
    }
}

impl<I: RowIndex> Index<I> for Row {
    type Output = Value;

    fn index(&self, index: I) -> &Value {
        self.value(index).expect("no column at index")
    }
}

/// An ordered result set: rows plus the shared field-name tuple.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    fields: Arc<Vec<String>>,
    rows: Vec<Row>,
}

impl RowSet {
    pub(crate) fn new(fields: Vec<String>, raw_rows: Vec<Vec<Value>>) -> RowSet {
        let fields = Arc::new(fields);
        let rows = raw_rows
            .into_iter()
            .map(|values| Row::new(Arc::clone(&fields), values))
            .collect();
        RowSet { fields, rows }
    }

    pub(crate) fn from_driver(
        columns: &[mysql_async::Column],
        rows: Vec<mysql_async::Row>,
    ) -> RowSet {
        let fields = columns
            .iter()
            .map(|column| column.name_str().into_owned())
            .collect();
        RowSet::new(fields, rows.into_iter().map(mysql_async::Row::unwrap).collect())
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// The number of columns each row carries.
    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn get(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }
}

impl std::ops::Deref for RowSet {
    type Target = [Row];

    fn deref(&self) -> &[Row] {
        &self.rows
    }
}

impl IntoIterator for RowSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a RowSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RowSet {
        RowSet::new(
            vec!["id".to_owned(), "name".to_owned()],
            vec![
                vec![Value::Int(1), Value::Bytes(b"one".to_vec())],
                vec![Value::Int(2), Value::Bytes(b"two".to_vec())],
            ],
        )
    }

    #[test]
    fn positional_and_named_access_agree() {
        let rows = sample();
        let row = &rows[0];

        assert_eq!(row.get::<i64>(0).unwrap(), row.get::<i64>("id").unwrap());
        assert_eq!(row.get::<String>("name").unwrap(), "one");
        assert_eq!(rows.width(), 2);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn missing_column_is_an_error() {
        let rows = sample();
        assert!(matches!(
            rows[0].get::<i64>("absent"),
            Err(Error::ColumnNotFound(_))
        ));
        assert!(matches!(
            rows[0].get::<i64>(7),
            Err(Error::ColumnNotFound(_))
        ));
    }

    #[test]
    fn set_overwrites_known_and_appends_unknown() {
        let rows = sample();
        let mut row = rows[0].clone();

        row.set("name", "uno");
        assert_eq!(row.get::<String>("name").unwrap(), "uno");
        assert_eq!(row.len(), 2);

        row.set("extra", 9_i64);
        assert_eq!(row.get::<i64>("extra").unwrap(), 9);
        assert_eq!(row.len(), 3);

        // sibling rows keep the original field tuple
        assert_eq!(rows[1].len(), 2);
        assert!(rows[1].get::<i64>("extra").is_err());
    }

    #[test]
    fn equality_is_by_name_value_mapping() {
        let left = sample();
        let right = RowSet::new(
            vec!["name".to_owned(), "id".to_owned()],
            vec![vec![Value::Bytes(b"one".to_vec()), Value::Int(1)]],
        );
        assert_eq!(left[0], right[0]);
        assert_ne!(left[1], right[0]);

        let mut map = BTreeMap::new();
        map.insert("id", Value::Int(1));
        map.insert("name", Value::Bytes(b"one".to_vec()));
        assert_eq!(left[0], map);
    }

    #[test]
    fn datetime_decoding_accepts_text_and_binary_forms() {
        let rows = RowSet::new(
            vec!["a".to_owned(), "b".to_owned(), "c".to_owned()],
            vec![vec![
                Value::Bytes(b"2020-05-01 10:20:30".to_vec()),
                Value::Date(2020, 5, 1, 10, 20, 30, 42),
                Value::NULL,
            ]],
        );
        let row = &rows[0];

        let text = row.get_datetime("a").unwrap().unwrap();
        let binary = row.get_datetime("b").unwrap().unwrap();
        assert_eq!(text.and_utc().timestamp(), binary.and_utc().timestamp());
        assert_eq!(row.get_datetime("c").unwrap(), None);
    }
}
