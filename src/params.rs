//! Client-side statement parameters and escaping.
//!
//! Statements use `%s` positional and `%(name)s` named placeholders, never
//! both in one call. Every value passes through the driver's literal
//! escaper before substitution, so the produced text is safe to send over
//! the text protocol. A statement that carries no parameters is passed
//! through untouched; with parameters, write `%%` for a literal percent
//! sign.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDateTime, Timelike};
use mysql_async::Value;

use crate::error::{Error, Result};

/// A single statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Value(Value),
    /// Expands to a comma-joined sequence of individually escaped values,
    /// for `IN (%s)` predicates and multi-column `VALUES (%s)` rows.
    List(Vec<Value>),
}

impl Param {
    pub fn value(value: impl Into<Value>) -> Param {
        Param::Value(value.into())
    }

    pub fn list<I, T>(values: I) -> Param
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Param::List(values.into_iter().map(Into::into).collect())
    }

    pub fn datetime(datetime: NaiveDateTime) -> Param {
        Param::Value(datetime_value(datetime))
    }

    pub fn duration(duration: std::time::Duration) -> Param {
        Param::Value(duration_value(duration))
    }

    pub fn json<T: serde::Serialize>(value: &T) -> Result<Param> {
        Ok(Param::value(serde_json::to_string(value)?))
    }

    pub fn null() -> Param {
        Param::Value(Value::NULL)
    }

    fn render(&self) -> String {
        match self {
            Param::Value(value) => value.as_sql(false),
            Param::List(values) => {
                let escaped: Vec<String> = values.iter().map(|v| v.as_sql(false)).collect();
                escaped.join(",")
            }
        }
    }
}

/// Conversion into a [`Param`]; lets the `params!` macros accept plain
/// values, datetimes, and pre-built parameters alike.
pub trait IntoParam {
    fn into_param(self) -> Param;
}

impl IntoParam for Param {
    fn into_param(self) -> Param {
        self
    }
}

impl IntoParam for NaiveDateTime {
    fn into_param(self) -> Param {
        Param::datetime(self)
    }
}

impl<T: IntoParam> IntoParam for Option<T> {
    fn into_param(self) -> Param {
        match self {
            Some(value) => value.into_param(),
            None => Param::null(),
        }
    }
}

macro_rules! impl_into_param {
    ($($ty:ty),* $(,)?) => {
        $(impl IntoParam for $ty {
            fn into_param(self) -> Param {
                Param::Value(self.into())
            }
        })*
    };
}

impl_into_param!(
    String, &str, bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64, Vec<u8>,
    &[u8],
);

/// The full parameter set for one statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Params {
    #[default]
    Empty,
    Positional(Vec<Param>),
    Named(BTreeMap<String, Param>),
}

impl From<()> for Params {
    fn from(_: ()) -> Params {
        Params::Empty
    }
}

impl From<Vec<Param>> for Params {
    fn from(params: Vec<Param>) -> Params {
        Params::Positional(params)
    }
}

impl From<BTreeMap<String, Param>> for Params {
    fn from(params: BTreeMap<String, Param>) -> Params {
        Params::Named(params)
    }
}

impl From<Param> for Params {
    fn from(param: Param) -> Params {
        Params::Positional(vec![param])
    }
}

/// Builds positional [`Params`]: `params![5, "name", now]`.
#[macro_export]
macro_rules! params {
    () => { $crate::params::Params::Empty };
    ($($value:expr),+ $(,)?) => {
        $crate::params::Params::Positional(vec![
            $($crate::params::IntoParam::into_param($value)),+
        ])
    };
}

/// Builds named [`Params`]: `named_params! { "now" => now, "ttl" => 60 }`.
#[macro_export]
macro_rules! named_params {
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = ::std::collections::BTreeMap::new();
        $(
            map.insert(
                ::std::string::String::from($name),
                $crate::params::IntoParam::into_param($value),
            );
        )+
        $crate::params::Params::Named(map)
    }};
}

/// Substitutes escaped parameters into the statement's placeholders.
pub fn escape_query(query: &str, params: &Params) -> Result<String> {
    let (mut positional, named) = match params {
        Params::Empty => return Ok(query.to_owned()),
        Params::Positional(values) => (Some(values.iter()), None),
        Params::Named(map) => (None, Some(map)),
    };

    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }

        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some('s') => {
                chars.next();
                let values = positional.as_mut().ok_or_else(|| {
                    Error::Format(
                        "positional placeholder used with named parameters".to_owned(),
                    )
                })?;
                let param = values.next().ok_or_else(|| {
                    Error::Format("not enough parameters for format string".to_owned())
                })?;
                out.push_str(&param.render());
            }
            Some('(') => {
                chars.next();
                let name = take_name(&mut chars)?;
                let map = named.ok_or_else(|| {
                    Error::Format(
                        "named placeholder used with positional parameters".to_owned(),
                    )
                })?;
                let param = map.get(&name).ok_or_else(|| {
                    Error::Format(format!("unknown parameter name {name:?}"))
                })?;
                out.push_str(&param.render());
            }
            other => {
                return Err(Error::Format(format!(
                    "unsupported format character {:?}",
                    other.unwrap_or('%')
                )));
            }
        }
    }

    if let Some(mut values) = positional {
        if values.next().is_some() {
            return Err(Error::Format(
                "not all parameters converted during formatting".to_owned(),
            ));
        }
    }

    Ok(out)
}

fn take_name(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<String> {
    let mut name = String::new();
    while let Some(ch) = chars.next() {
        if ch == ')' {
            return match chars.next() {
                Some('s') => Ok(name),
                _ => Err(Error::Format(format!(
                    "named placeholder %({name})s is missing its trailing 's'"
                ))),
            };
        }
        name.push(ch);
    }
    Err(Error::Format("unterminated named placeholder".to_owned()))
}

pub(crate) fn datetime_value(datetime: NaiveDateTime) -> Value {
    Value::Date(
        datetime.year() as u16,
        datetime.month() as u8,
        datetime.day() as u8,
        datetime.hour() as u8,
        datetime.minute() as u8,
        datetime.second() as u8,
        datetime.nanosecond() % 1_000_000_000 / 1_000,
    )
}

pub(crate) fn duration_value(duration: std::time::Duration) -> Value {
    let secs = duration.as_secs();
    Value::Time(
        false,
        (secs / 86_400) as u32,
        (secs % 86_400 / 3_600) as u8,
        (secs % 3_600 / 60) as u8,
        (secs % 60) as u8,
        duration.subsec_micros(),
    )
}

/// The current wall-clock instant as a naive UTC timestamp, the form every
/// DATETIME predicate in this crate compares against.
pub(crate) fn utcnow() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{named_params, params};

    #[test]
    fn passthrough_without_parameters() {
        let sql = "SELECT 100 % 3 AS m";
        assert_eq!(escape_query(sql, &Params::Empty).unwrap(), sql);
    }

    #[test]
    fn positional_substitution() {
        let sql = escape_query("SELECT %s, %s", &params![1, "it's"]).unwrap();
        assert_eq!(sql, r"SELECT 1, 'it\'s'");
    }

    #[test]
    fn named_substitution() {
        let sql = escape_query(
            "SELECT %(a)s + %(a)s, %(b)s",
            &named_params! { "a" => 2, "b" => "x" },
        )
        .unwrap();
        assert_eq!(sql, "SELECT 2 + 2, 'x'");
    }

    #[test]
    fn literal_percent() {
        let sql = escape_query("SELECT 100 %% %s", &params![3]).unwrap();
        assert_eq!(sql, "SELECT 100 % 3");
    }

    #[test]
    fn list_expansion() {
        let sql = escape_query(
            "SELECT 1 FROM t WHERE id IN (%s)",
            &Params::Positional(vec![Param::list([1, 2, 3])]),
        )
        .unwrap();
        assert_eq!(sql, "SELECT 1 FROM t WHERE id IN (1,2,3)");
    }

    #[test]
    fn booleans_render_as_integers() {
        let sql = escape_query("SELECT %s, %s", &params![true, false]).unwrap();
        assert_eq!(sql, "SELECT 1, 0");
    }

    #[test]
    fn null_renders() {
        let sql = escape_query("SELECT %s", &params![Option::<i64>::None]).unwrap();
        assert_eq!(sql, "SELECT NULL");
    }

    #[test]
    fn datetimes_render_as_sql_literals() {
        let dt = chrono::NaiveDate::from_ymd_opt(2014, 11, 28)
            .unwrap()
            .and_hms_micro_opt(14, 17, 31, 21)
            .unwrap();
        let sql = escape_query("SELECT %s", &params![dt]).unwrap();
        assert_eq!(sql, "SELECT '2014-11-28 14:17:31.000021'");
    }

    #[test]
    fn mixing_styles_is_rejected() {
        assert!(matches!(
            escape_query("SELECT %(a)s", &params![1]),
            Err(Error::Format(_))
        ));
        assert!(matches!(
            escape_query("SELECT %s", &named_params! { "a" => 1 }),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        assert!(matches!(
            escape_query("SELECT %s, %s", &params![1]),
            Err(Error::Format(_))
        ));
        assert!(matches!(
            escape_query("SELECT %s", &params![1, 2]),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(matches!(
            escape_query("SELECT %(missing)s", &named_params! { "a" => 1 }),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn stray_format_character_is_rejected() {
        assert!(matches!(
            escape_query("SELECT 100 % 3, %s", &params![1]),
            Err(Error::Format(_))
        ));
    }
}
