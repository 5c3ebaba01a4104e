//! Column type compatibility rules
//!
//! Decides whether a column modification can break existing readers/writers.
//! Types are normalized into a family plus a rank inside the family, so that
//! widening (INTEGER → BIGINT) and narrowing (BIGINT → INTEGER) are told apart.

use crate::introspection::ColumnDef;
use once_cell::sync::Lazy;
use regex::Regex;

/// `NAME[(len[,scale])][ suffix][[]...]`, which also covers catalog spellings
/// such as `timestamp(3) with time zone` and `integer[]`
static TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*([A-Za-z][A-Za-z0-9_ ]*?)\s*(?:\(\s*(\d+)\s*(?:,\s*(\d+)\s*)?\)\s*([A-Za-z][A-Za-z ]*?)?)?\s*((?:\[\d*\])+)?\s*$",
    )
    .expect("type pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Integer,
    Float,
    Decimal,
    String,
    Boolean,
    Temporal,
    Other,
}

/// A column type reduced to its comparable parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedType {
    base: String,
    family: Family,
    rank: u8,
    length: Option<u32>,
    scale: Option<u32>,
    array: bool,
}

/// Cross-family transitions known to fail on existing data
const INCOMPATIBLE: &[(Family, Family)] = &[
    (Family::String, Family::Integer),
    (Family::String, Family::Float),
    (Family::String, Family::Decimal),
    (Family::String, Family::Boolean),
    (Family::String, Family::Temporal),
    (Family::Integer, Family::Boolean),
    (Family::Float, Family::Integer),
    (Family::Float, Family::Boolean),
    (Family::Decimal, Family::Integer),
    (Family::Decimal, Family::Boolean),
    (Family::Temporal, Family::Integer),
    (Family::Temporal, Family::Boolean),
    (Family::Boolean, Family::Temporal),
    (Family::Other, Family::Integer),
    (Family::Other, Family::Float),
    (Family::Other, Family::Decimal),
    (Family::Other, Family::Boolean),
    (Family::Other, Family::Temporal),
];

impl NormalizedType {
    pub fn parse(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        let (name, length, scale, array) = match TYPE_RE.captures(&upper) {
            Some(caps) => {
                let head = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
                let name = match caps.get(4) {
                    Some(suffix) => format!("{} {}", head, suffix.as_str().trim()),
                    None => head.to_string(),
                };
                (
                    name.split_whitespace().collect::<Vec<_>>().join(" "),
                    caps.get(2).and_then(|m| m.as_str().parse().ok()),
                    caps.get(3).and_then(|m| m.as_str().parse().ok()),
                    caps.get(5).is_some(),
                )
            }
            None => (upper.clone(), None, None, false),
        };

        let (base, family, rank) = match name.as_str() {
            "SMALLINT" | "INT2" | "TINYINT" => ("SMALLINT", Family::Integer, 1),
            "INTEGER" | "INT" | "INT4" | "SERIAL" => ("INTEGER", Family::Integer, 2),
            "BIGINT" | "INT8" | "BIGSERIAL" => ("BIGINT", Family::Integer, 3),
            "REAL" | "FLOAT4" => ("REAL", Family::Float, 1),
            "DOUBLE PRECISION" | "DOUBLE" | "FLOAT8" | "FLOAT" => ("DOUBLE", Family::Float, 2),
            "DECIMAL" | "NUMERIC" => ("DECIMAL", Family::Decimal, 1),
            "CHAR" | "CHARACTER" | "BPCHAR" => ("CHAR", Family::String, 1),
            "VARCHAR" | "CHARACTER VARYING" | "STRING" | "NVARCHAR" => ("VARCHAR", Family::String, 2),
            "TEXT" | "CLOB" => ("TEXT", Family::String, 3),
            "BOOLEAN" | "BOOL" => ("BOOLEAN", Family::Boolean, 1),
            "DATE" => ("DATE", Family::Temporal, 1),
            "TIMESTAMP" | "TIMESTAMP WITHOUT TIME ZONE" | "DATETIME" => {
                ("TIMESTAMP", Family::Temporal, 2)
            }
            "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => ("TIMESTAMPTZ", Family::Temporal, 3),
            other => {
                return Self {
                    base: other.to_string(),
                    family: Family::Other,
                    rank: 0,
                    length,
                    scale,
                    array,
                }
            }
        };

        Self {
            base: base.to_string(),
            family,
            rank,
            length,
            scale,
            array,
        }
    }

    /// Moving from `self` to `to` loses precision or range
    fn narrows_to(&self, to: &NormalizedType) -> bool {
        if to.rank < self.rank {
            return true;
        }
        if self.base != to.base {
            // Bounded → unbounded (VARCHAR(n) → TEXT) is always a widening
            return false;
        }
        let length_narrows = match (self.length, to.length) {
            (None, Some(_)) => true,
            (Some(old), Some(new)) => new < old,
            _ => false,
        };
        let scale_narrows = matches!((self.scale, to.scale), (Some(old), Some(new)) if new < old);
        length_narrows || scale_narrows
    }
}

/// Whether changing a column's type from `old` to `new` is breaking
pub fn is_type_change_breaking(old: &str, new: &str) -> bool {
    let from = NormalizedType::parse(old);
    let to = NormalizedType::parse(new);

    if from == to {
        return false;
    }
    if from.array != to.array {
        return true;
    }
    if from.family == to.family {
        if from.family == Family::Other && from.base != to.base {
            return true;
        }
        return from.narrows_to(&to);
    }
    INCOMPATIBLE.contains(&(from.family, to.family))
}

/// Whether a column modification can break consumers: an incompatible or
/// narrowing type change, or nullable → NOT NULL. Default changes never break.
pub fn is_column_modification_breaking(old: &ColumnDef, new: &ColumnDef) -> bool {
    let type_breaking = old.data_type != new.data_type
        && is_type_change_breaking(&old.data_type, &new.data_type);
    let nullability_breaking = old.nullable && !new.nullable;
    type_breaking || nullability_breaking
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_incompatible_pairs() {
        assert!(is_type_change_breaking("VARCHAR(255)", "INTEGER"));
        assert!(is_type_change_breaking("TEXT", "INTEGER"));
        assert!(is_type_change_breaking("INTEGER", "BOOLEAN"));
        assert!(is_type_change_breaking("DECIMAL(10,2)", "INTEGER"));
    }

    #[test]
    fn test_widening_is_safe() {
        assert!(!is_type_change_breaking("INTEGER", "BIGINT"));
        assert!(!is_type_change_breaking("SMALLINT", "INTEGER"));
        assert!(!is_type_change_breaking("VARCHAR(50)", "VARCHAR(255)"));
        assert!(!is_type_change_breaking("VARCHAR(255)", "TEXT"));
        assert!(!is_type_change_breaking("REAL", "DOUBLE PRECISION"));
        assert!(!is_type_change_breaking("character varying", "varchar"));
    }

    #[test]
    fn test_narrowing_is_breaking() {
        assert!(is_type_change_breaking("BIGINT", "INTEGER"));
        assert!(is_type_change_breaking("VARCHAR(255)", "VARCHAR(50)"));
        assert!(is_type_change_breaking("TEXT", "VARCHAR(100)"));
        assert!(is_type_change_breaking("TIMESTAMP", "DATE"));
    }

    #[test]
    fn test_cross_family_to_text_is_safe() {
        assert!(!is_type_change_breaking("INTEGER", "TEXT"));
        assert!(!is_type_change_breaking("BOOLEAN", "VARCHAR(10)"));
        assert!(!is_type_change_breaking("INTEGER", "NUMERIC(12,2)"));
    }

    #[test]
    fn test_catalog_spellings() {
        assert!(is_type_change_breaking("numeric(12,2)", "numeric(8,2)"));
        assert!(is_type_change_breaking("numeric(12,4)", "numeric(12,2)"));
        assert!(!is_type_change_breaking("numeric(8,2)", "numeric(12,2)"));
        assert!(is_type_change_breaking("character varying(255)", "character varying(50)"));
        assert!(is_type_change_breaking("timestamp(3) with time zone", "date"));
        assert!(!is_type_change_breaking("timestamp(3) without time zone", "timestamp with time zone"));
        assert!(is_type_change_breaking("integer[]", "integer"));
        assert!(is_type_change_breaking("text[]", "integer[]"));
        assert_eq!(
            NormalizedType::parse("timestamp(6) with time zone"),
            NormalizedType::parse("TIMESTAMPTZ(6)")
        );
    }

    #[test]
    fn test_unknown_types() {
        assert!(is_type_change_breaking("UUID", "INTEGER"));
        assert!(is_type_change_breaking("JSONB", "HSTORE"));
        assert!(!is_type_change_breaking("UUID", "TEXT"));
    }

    #[test]
    fn test_nullability_rules() {
        let nullable = ColumnDef::new("phone", "VARCHAR(32)");
        let required = nullable.clone().not_null();
        assert!(is_column_modification_breaking(&nullable, &required));
        assert!(!is_column_modification_breaking(&required, &nullable));
    }

    #[test]
    fn test_default_change_never_breaks() {
        let old = ColumnDef::new("status", "VARCHAR(20)").with_default("'new'");
        let new = ColumnDef::new("status", "VARCHAR(20)").with_default("'pending'");
        assert!(!is_column_modification_breaking(&old, &new));
    }
}
