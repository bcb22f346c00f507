//! The document value type.
//!
//! The storage engine and query compiler are external collaborators; this crate only
//! needs a concrete value type to move rows through the wire layer and the limit
//! window comparator. `serde_json::Value` has the same shape as a tagged-union
//! document value (null / bool / number / string / array / object) and gives the
//! wire layer serialization for free.

use std::cmp::Ordering;

pub use serde_json::Value as Datum;

/// `datum_t::null()` equivalent.
pub fn null() -> Datum {
    Datum::Null
}

/// Reads a named field off an object datum, returning `None` if the datum isn't an
/// object or the field is absent (the `NOTHROW` variant of `datum_t::get_field`).
pub fn get_field<'a>(datum: &'a Datum, name: &str) -> Option<&'a Datum> {
    datum.as_object().and_then(|obj| obj.get(name))
}

/// Total order over datums, used for secondary-index sort-key comparisons. Mirrors
/// `datum_t::cmp`: type-tag order first (null < bool < number < string < array <
/// object), then a by-type comparison within a tag. `f64::partial_cmp` never returns
/// `None` for values that arrived through JSON (no NaN), so we collapse to `Equal` on
/// the pathological case rather than panic.
pub fn cmp(a: &Datum, b: &Datum) -> Ordering {
    fn tag(d: &Datum) -> u8 {
        match d {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Number(_) => 2,
            Datum::String(_) => 3,
            Datum::Array(_) => 4,
            Datum::Object(_) => 5,
        }
    }
    match (a, b) {
        (Datum::Null, Datum::Null) => Ordering::Equal,
        (Datum::Bool(x), Datum::Bool(y)) => x.cmp(y),
        (Datum::Number(x), Datum::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(Ordering::Equal),
        (Datum::String(x), Datum::String(y)) => x.cmp(y),
        (Datum::Array(x), Datum::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match cmp(xi, yi) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Datum::Object(x), Datum::Object(y)) => {
            let mut xk: Vec<_> = x.keys().collect();
            let mut yk: Vec<_> = y.keys().collect();
            xk.sort();
            yk.sort();
            xk.cmp(&yk)
        }
        (a, b) => tag(a).cmp(&tag(b)),
    }
}
