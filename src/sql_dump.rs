//! `INSERT INTO` fragments from SQL dumps.
//!
//! Only the subset admins paste from exports is understood: an optional column
//! list followed by one or more parenthesised value tuples. Single-quoted
//! strings are atomic, so commas and parentheses inside them never split a
//! value.

use regex::Regex;

/// One value tuple of an `INSERT` statement, with its column list.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    pub columns: Vec<String>,
    pub values: Vec<Option<String>>,
}

impl InsertRow {
    /// Value under `column`; `None` when the column is absent or the value is `NULL`.
    pub fn get(&self, column: &str) -> Option<&str> {
        let index = self
            .columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(column))?;
        self.positional(index)
    }

    pub fn positional(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|value| value.as_deref())
    }

    /// Named value when present and non-empty, otherwise the value at `index`.
    pub fn get_or_positional(&self, column: &str, index: usize) -> Option<&str> {
        self.get(column)
            .filter(|value| !value.is_empty())
            .or_else(|| self.positional(index))
    }
}

/// Every row inserted into `table`, in file order.
pub fn insert_rows(text: &str, table: &str) -> Vec<InsertRow> {
    let pattern = format!(
        r#"(?is)INSERT\s+INTO\s+[`"]?(?:\w+[`"]?\.[`"]?)?{}[`"]?\s*(?:\(([^)]*)\))?\s*VALUES\s*"#,
        regex::escape(table)
    );
    let Ok(head) = Regex::new(&pattern) else {
        return Vec::new();
    };

    let mut rows = Vec::new();
    for captures in head.captures_iter(text) {
        let columns: Vec<String> = captures
            .get(1)
            .map(|list| {
                list.as_str()
                    .split(',')
                    .map(|name| name.trim().trim_matches(|c| c == '`' || c == '"').to_string())
                    .collect()
            })
            .unwrap_or_default();

        let Some(whole) = captures.get(0) else {
            continue;
        };
        for tuple in value_tuples(&text[whole.end()..]) {
            rows.push(InsertRow {
                columns: columns.clone(),
                values: split_values(tuple),
            });
        }
    }
    rows
}

/// Splits a value list on commas outside single-quoted strings and strips
/// one pair of surrounding quotes from each value. Bare `NULL` becomes `None`.
pub fn split_values(list: &str) -> Vec<Option<String>> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_string = false;

    for ch in list.chars() {
        match ch {
            '\'' => {
                in_string = !in_string;
                current.push(ch);
            }
            ',' if !in_string => {
                values.push(clean_value(&current));
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() || !values.is_empty() {
        values.push(clean_value(&current));
    }
    values
}

fn clean_value(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("null") {
        return None;
    }
    let unquoted = strip_pair(trimmed, '\'')
        .or_else(|| strip_pair(trimmed, '"'))
        .map(|inner| inner.replace("''", "'"))
        .unwrap_or_else(|| trimmed.to_string());
    Some(unquoted)
}

fn strip_pair(value: &str, quote: char) -> Option<&str> {
    value
        .strip_prefix(quote)
        .and_then(|rest| rest.strip_suffix(quote))
}

/// Bodies of the `( ... )` tuples that follow `VALUES`, stopping at the first
/// character that is neither a tuple nor a separating comma.
fn value_tuples(rest: &str) -> Vec<&str> {
    let mut tuples = Vec::new();
    let mut cursor = 0;
    let bytes = rest.as_bytes();

    loop {
        while cursor < bytes.len() && (bytes[cursor] as char).is_whitespace() {
            cursor += 1;
        }
        if cursor >= bytes.len() || bytes[cursor] != b'(' {
            break;
        }
        let start = cursor + 1;
        let mut in_string = false;
        let mut depth = 0_usize;
        let mut end = None;
        for (offset, byte) in bytes[start..].iter().enumerate() {
            match byte {
                b'\'' => in_string = !in_string,
                b'(' if !in_string => depth += 1,
                b')' if !in_string => {
                    if depth == 0 {
                        end = Some(start + offset);
                        break;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
        let Some(end) = end else {
            break;
        };
        tuples.push(&rest[start..end]);
        cursor = end + 1;

        while cursor < bytes.len() && (bytes[cursor] as char).is_whitespace() {
            cursor += 1;
        }
        if cursor < bytes.len() && bytes[cursor] == b',' {
            cursor += 1;
        } else {
            break;
        }
    }
    tuples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_commas_stay_in_one_value() {
        assert_eq!(
            split_values("'a,b', 2"),
            vec![Some("a,b".to_string()), Some("2".to_string())]
        );
    }

    #[test]
    fn doubled_quotes_and_nulls() {
        assert_eq!(
            split_values("'O''Higgins', NULL, \"x\""),
            vec![Some("O'Higgins".to_string()), None, Some("x".to_string())]
        );
        assert!(split_values("   ").is_empty());
    }

    #[test]
    fn reads_named_columns() {
        let dump = "-- export\nINSERT INTO `rutas` (`nombre`, municipio, costo_minimo)\n  VALUES ('Ruta (Centro)', 'Huamantla', 8.5);";
        let rows = insert_rows(dump, "rutas");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("nombre"), Some("Ruta (Centro)"));
        assert_eq!(rows[0].get("MUNICIPIO"), Some("Huamantla"));
        assert_eq!(rows[0].get("costo_minimo"), Some("8.5"));
        assert_eq!(rows[0].get("notas"), None);
    }

    #[test]
    fn collects_every_statement_and_tuple_in_order() {
        let dump = "insert into paradas (id, nombre, ruta_id, coordenada_lng, coordenada_lat) values (1, 'A', 9, -97.9, 19.3);\n\
                    INSERT INTO paradas VALUES (2, 'B', 9, -97.85, 19.25), (3, 'C', 9, -97.8, 19.2);\n\
                    INSERT INTO rutas_archivo (nombre) VALUES ('ignored');";
        let rows = insert_rows(dump, "paradas");
        let names: Vec<_> = rows
            .iter()
            .map(|row| row.get_or_positional("nombre", 1).unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(rows[2].get_or_positional("coordenada_lat", 4), Some("19.2"));
    }

    #[test]
    fn table_name_must_match_exactly() {
        let dump = "INSERT INTO rutas_historial (nombre) VALUES ('old');";
        assert!(insert_rows(dump, "rutas").is_empty());
    }
}
