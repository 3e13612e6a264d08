//! Row and field views over a parsed arena.

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::warn;

use crate::decoder::RowArena;
use crate::errors::{CsvError, Result};
use crate::infer::{self, data_type, DataType};

/// Ordered column names with name-to-position lookup.
///
/// Built once per stream from the header row (or explicit names) and shared
/// read-only by every row.
#[derive(Debug, Clone, Default)]
pub struct ColumnIndex {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl ColumnIndex {
    /// Build from header names. Duplicate names keep the first occurrence.
    pub fn from_names(names: impl IntoIterator<Item = String>) -> Self {
        let names: Vec<String> = names.into_iter().collect();
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(names.len());
        for (pos, name) in names.iter().enumerate() {
            if positions.contains_key(name) {
                warn!(column = %name, "duplicate column name, keeping first occurrence");
                continue;
            }
            positions.insert(name.clone(), pos);
        }
        ColumnIndex { names, positions }
    }

    /// 0-based position of a column, or None if absent.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Immutable view over one row in an arena.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    arena: &'a RowArena,
    row_idx: usize,
}

impl<'a> Row<'a> {
    pub(crate) fn new(arena: &'a RowArena, row_idx: usize) -> Self {
        Row { arena, row_idx }
    }

    /// Number of fields in this row.
    pub fn len(&self) -> usize {
        self.arena.row_meta(self.row_idx).field_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes of the row, escapes and structural bytes included,
    /// terminator excluded.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.arena.row_bytes(self.row_idx)
    }

    /// Absolute input offset of the row's terminator.
    pub(crate) fn end_offset(&self) -> u64 {
        self.arena.row_meta(self.row_idx).end_offset
    }

    /// Checked field access by position.
    pub fn get(&self, idx: usize) -> Result<Field<'a>> {
        let meta = self.arena.row_meta(self.row_idx);
        if idx >= meta.field_count {
            return Err(CsvError::IndexOutOfRange {
                index: idx,
                len: meta.field_count,
            });
        }
        Ok(Field {
            arena: self.arena,
            field_idx: meta.fields_start + idx,
        })
    }

    /// Field access by column name.
    pub fn get_by_name(&self, name: &str) -> Result<Field<'a>> {
        let index = self
            .arena
            .column_index()
            .ok_or_else(|| CsvError::UnknownColumn(name.to_string()))?;
        let pos = index
            .lookup(name)
            .ok_or_else(|| CsvError::UnknownColumn(name.to_string()))?;
        self.get(pos)
    }

    /// Double-ended, exact-size cursor over the fields in column order.
    pub fn iter(&self) -> RowIter<'a> {
        RowIter {
            row: *self,
            front: 0,
            back: self.len(),
        }
    }

    /// Materialize every field into an owned string.
    pub fn to_vec(&self) -> Result<Vec<String>> {
        self.iter()
            .map(|field| field.raw_view().map(str::to_string))
            .collect()
    }

    /// Render the row as a JSON object keyed by column name.
    ///
    /// Numeric fields are written unquoted; nulls as `null`. Rows without a
    /// column index fall back to generated `columnN` names.
    pub fn to_json(&self) -> Result<String> {
        let mut out = String::from("{");
        for (idx, field) in self.iter().enumerate() {
            if idx > 0 {
                out.push(',');
            }
            let name = self.column_name(idx);
            out.push_str(
                &serde_json::to_string(name.as_ref()).expect("string to serialize as json"),
            );
            out.push(':');
            field.write_json_value(&mut out)?;
        }
        out.push('}');
        Ok(out)
    }

    /// Render the row's values as a JSON array.
    pub fn to_json_array(&self) -> Result<String> {
        let mut out = String::from("[");
        for (idx, field) in self.iter().enumerate() {
            if idx > 0 {
                out.push(',');
            }
            field.write_json_value(&mut out)?;
        }
        out.push(']');
        Ok(out)
    }

    fn column_name(&self, idx: usize) -> Cow<'a, str> {
        match self.arena.column_index() {
            Some(index) if idx < index.len() => Cow::Borrowed(&index.names()[idx]),
            _ => Cow::Owned(format!("column{idx}")),
        }
    }
}

impl<'a> IntoIterator for Row<'a> {
    type Item = Field<'a>;
    type IntoIter = RowIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Cursor over `(row, index)` pairs. No per-field allocation.
#[derive(Debug, Clone)]
pub struct RowIter<'a> {
    row: Row<'a>,
    front: usize,
    back: usize,
}

impl<'a> Iterator for RowIter<'a> {
    type Item = Field<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let field = self.row.get(self.front).expect("index in range");
        self.front += 1;
        Some(field)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rem = self.back - self.front;
        (rem, Some(rem))
    }
}

impl DoubleEndedIterator for RowIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(self.row.get(self.back).expect("index in range"))
    }
}

impl ExactSizeIterator for RowIter<'_> {}

/// Zero-copy view of a single field.
#[derive(Debug, Clone, Copy)]
pub struct Field<'a> {
    arena: &'a RowArena,
    field_idx: usize,
}

impl<'a> Field<'a> {
    /// Raw content bytes, escapes intact.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.arena.field_bytes(self.field_idx)
    }

    /// Field content as text.
    ///
    /// Zero-copy for fields without embedded quotes. Fields with embedded
    /// quotes materialize once into the arena's escape cache (doubled quotes
    /// collapsed) and return the cached slice on every later call.
    pub fn raw_view(&self) -> Result<&'a str> {
        self.arena.field_text(self.field_idx)
    }

    /// Classify the field content. See [`crate::infer::data_type`].
    pub fn classify(&self) -> (DataType, Option<f64>) {
        data_type(self.as_bytes())
    }

    /// True for an empty field or one containing only spaces.
    pub fn is_null(&self) -> bool {
        self.classify().0 == DataType::Null
    }

    /// True for non-empty, non-numeric text.
    pub fn is_str(&self) -> bool {
        self.classify().0 == DataType::String
    }

    pub fn is_int(&self) -> bool {
        self.classify().0.is_int()
    }

    pub fn is_float(&self) -> bool {
        self.classify().0 == DataType::Double
    }

    pub fn is_num(&self) -> bool {
        self.classify().0.is_num()
    }

    /// The field as a signed integer. Floating-point content is refused
    /// rather than truncated.
    pub fn as_int(&self) -> Result<i64> {
        let (dtype, _) = self.classify();
        if !dtype.is_int() {
            return Err(self.coercion_error("int"));
        }
        let text = self.raw_view()?;
        text.trim_matches(' ')
            .parse::<i64>()
            .map_err(|_| self.coercion_error("int"))
    }

    /// The field as a double. Integer content widens.
    pub fn as_double(&self) -> Result<f64> {
        match self.classify() {
            (dtype, Some(value)) if dtype.is_num() => Ok(value),
            _ => Err(self.coercion_error("double")),
        }
    }

    /// The field as a boolean (`t`/`true`/`TRUE`/`T` and the `f`
    /// counterparts).
    pub fn as_bool(&self) -> Result<bool> {
        let text = self.raw_view()?;
        infer::parse_bool(text.trim_matches(' ')).ok_or_else(|| self.coercion_error("bool"))
    }

    pub fn as_string(&self) -> Result<String> {
        self.raw_view().map(str::to_string)
    }

    fn coercion_error(&self, target: &'static str) -> CsvError {
        CsvError::TypeCoercionFailed {
            value: String::from_utf8_lossy(self.as_bytes()).into_owned(),
            target,
        }
    }

    fn write_json_value(&self, out: &mut String) -> Result<()> {
        match self.classify() {
            (DataType::Null, _) => out.push_str("null"),
            (dtype, Some(value)) if dtype.is_int() => {
                // Exact rendering through the integer parser.
                match self.as_int() {
                    Ok(v) => out.push_str(&v.to_string()),
                    Err(_) => out.push_str(&value.to_string()),
                }
            }
            (DataType::Double, Some(value)) => match serde_json::Number::from_f64(value) {
                Some(number) => out.push_str(&number.to_string()),
                // Overflowed to infinity; fall back to the raw text.
                None => out.push_str(
                    &serde_json::to_string(self.raw_view()?).expect("string to serialize as json"),
                ),
            },
            _ => out.push_str(
                &serde_json::to_string(self.raw_view()?).expect("string to serialize as json"),
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::CsvDecoder;
    use crate::dialect::DialectOptions;

    fn parse(input: &str) -> RowArena {
        let dialect = DialectOptions::default();
        let mut decoder = CsvDecoder::new(&dialect).unwrap();
        let mut arena = RowArena::new(dialect.quote);
        decoder.decode(input.as_bytes(), &mut arena).unwrap();
        decoder.finish(&mut arena).unwrap();
        arena
    }

    fn parse_with_header(input: &str) -> RowArena {
        let mut arena = parse(input);
        let names = arena.row(0).to_vec().unwrap();
        arena.set_column_index(std::sync::Arc::new(ColumnIndex::from_names(names)));
        arena
    }

    #[test]
    fn column_index_first_wins() {
        let index = ColumnIndex::from_names(
            ["a", "b", "a", "c"].into_iter().map(String::from),
        );
        assert_eq!(Some(0), index.lookup("a"));
        assert_eq!(Some(1), index.lookup("b"));
        assert_eq!(Some(3), index.lookup("c"));
        assert_eq!(None, index.lookup("missing"));
        assert_eq!(4, index.len());
    }

    #[test]
    fn indexed_and_named_access() {
        let arena = parse_with_header("name,score\nmario,9.5\n");
        let row = arena.row(1);

        assert_eq!(2, row.len());
        assert_eq!("mario", row.get(0).unwrap().raw_view().unwrap());
        assert_eq!("9.5", row.get_by_name("score").unwrap().raw_view().unwrap());

        assert!(matches!(
            row.get(2),
            Err(CsvError::IndexOutOfRange { index: 2, len: 2 })
        ));
        assert!(matches!(
            row.get_by_name("rank"),
            Err(CsvError::UnknownColumn(_))
        ));
    }

    #[test]
    fn named_access_without_index_fails() {
        let arena = parse("mario,9.5\n");
        assert!(matches!(
            arena.row(0).get_by_name("score"),
            Err(CsvError::UnknownColumn(_))
        ));
    }

    #[test]
    fn iteration_both_directions() {
        let arena = parse("a,b,c\n");
        let row = arena.row(0);

        let forward: Vec<_> = row.iter().map(|f| f.raw_view().unwrap()).collect();
        assert_eq!(vec!["a", "b", "c"], forward);

        let reverse: Vec<_> = row.iter().rev().map(|f| f.raw_view().unwrap()).collect();
        assert_eq!(vec!["c", "b", "a"], reverse);

        assert_eq!(3, row.iter().len());
        assert_eq!("b", row.iter().nth(1).unwrap().raw_view().unwrap());
    }

    #[test]
    fn escape_materialization_cached() {
        let arena = parse("\"he said \"\"hi\"\"\",done\n");
        let row = arena.row(0);

        let first = row.get(0).unwrap().raw_view().unwrap();
        assert_eq!("he said \"hi\"", first);

        // Second access returns the same cached allocation.
        let second = row.get(0).unwrap().raw_view().unwrap();
        assert!(std::ptr::eq(first.as_ptr(), second.as_ptr()));

        // Raw bytes keep the doubled quotes.
        assert_eq!(b"he said \"\"hi\"\"", row.get(0).unwrap().as_bytes());
    }

    #[test]
    fn typed_accessors() {
        let arena = parse("42, 3.5 ,true,text,\n");
        let row = arena.row(0);

        assert_eq!(42, row.get(0).unwrap().as_int().unwrap());
        assert_eq!(42.0, row.get(0).unwrap().as_double().unwrap());
        assert_eq!(3.5, row.get(1).unwrap().as_double().unwrap());
        assert!(row.get(2).unwrap().as_bool().unwrap());
        assert_eq!("text", row.get(3).unwrap().as_string().unwrap());

        assert!(matches!(
            row.get(1).unwrap().as_int(),
            Err(CsvError::TypeCoercionFailed { target: "int", .. })
        ));
        assert!(matches!(
            row.get(3).unwrap().as_double(),
            Err(CsvError::TypeCoercionFailed { .. })
        ));
        assert!(matches!(
            row.get(3).unwrap().as_bool(),
            Err(CsvError::TypeCoercionFailed { .. })
        ));
        assert!(row.get(4).unwrap().is_null());
    }

    #[test]
    fn predicates() {
        let arena = parse("2018,3.14,,510-123-4567\n");
        let row = arena.row(0);

        assert!(row.get(0).unwrap().is_int());
        assert!(row.get(0).unwrap().is_num());
        assert!(!row.get(0).unwrap().is_float());
        assert!(row.get(1).unwrap().is_float());
        assert!(row.get(2).unwrap().is_null());
        assert!(row.get(3).unwrap().is_str());
    }

    #[test]
    fn to_vec_materializes() {
        let arena = parse("\"a,b\",c\n");
        assert_eq!(vec!["a,b", "c"], arena.row(0).to_vec().unwrap());
    }

    #[test]
    fn json_object_and_array() {
        let arena = parse_with_header("name,score,wins,note\nmario,9.5,8000,\n");
        let row = arena.row(1);

        assert_eq!(
            r#"{"name":"mario","score":9.5,"wins":8000,"note":null}"#,
            row.to_json().unwrap()
        );
        assert_eq!(r#"["mario",9.5,8000,null]"#, row.to_json_array().unwrap());
    }

    #[test]
    fn json_generated_names_without_header() {
        let arena = parse("x,1\n");
        assert_eq!(
            r#"{"column0":"x","column1":1}"#,
            arena.row(0).to_json().unwrap()
        );
    }

    #[test]
    fn json_escapes_strings() {
        let arena = parse("\"he said \"\"hi\"\"\"\n");
        assert_eq!(
            r#"{"column0":"he said \"hi\""}"#,
            arena.row(0).to_json().unwrap()
        );
    }
}
