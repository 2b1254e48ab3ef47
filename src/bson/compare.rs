//! Total ordering across value kinds.
//!
//! Kinds sort in bracket order (null, numbers, strings, documents, arrays,
//! binary, object ids, booleans, dates, timestamps, regexes); numbers compare
//! by value regardless of their representation.

use std::cmp::Ordering;

use super::{Bson, Document};

/// Sort bracket of a value kind.
pub fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::Null => 1,
        Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
    }
}

pub fn compare(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Bson::Document(x), Bson::Document(y)) => compare_documents(x, y),
        (Bson::Array(x), Bson::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then(x.subtype.cmp(&y.subtype))
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => x.cmp(y),
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => x
            .pattern
            .cmp(&y.pattern)
            .then_with(|| x.options.cmp(&y.options)),
        (Bson::Null, Bson::Null) => Ordering::Equal,
        _ => compare_numbers(a, b),
    }
}

/// Equality under the query ordering, so `1 == 1.0`.
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    compare(a, b) == Ordering::Equal
}

fn compare_documents(x: &Document, y: &Document) -> Ordering {
    let mut left = x.iter();
    let mut right = y.iter();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((lk, lv)), Some((rk, rv))) => {
                let ord = type_rank(lv)
                    .cmp(&type_rank(rv))
                    .then_with(|| lk.cmp(rk))
                    .then_with(|| compare(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn compare_numbers(a: &Bson, b: &Bson) -> Ordering {
    match (integral(a), integral(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(x), None) => cmp_i64_f64(x, b.as_f64().unwrap_or(f64::NAN)),
        (None, Some(y)) => cmp_i64_f64(y, a.as_f64().unwrap_or(f64::NAN)).reverse(),
        (None, None) => cmp_f64(
            a.as_f64().unwrap_or(f64::NAN),
            b.as_f64().unwrap_or(f64::NAN),
        ),
    }
}

fn integral(v: &Bson) -> Option<i64> {
    match v {
        Bson::Int32(i) => Some(*i as i64),
        Bson::Int64(i) => Some(*i),
        _ => None,
    }
}

/// NaN sorts below every other number.
fn cmp_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn cmp_i64_f64(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return Ordering::Greater;
    }
    if f >= 9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    if f < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => {
            let frac = f - whole;
            if frac > 0.0 {
                Ordering::Less
            } else if frac < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_numbers_compare_across_kinds() {
        assert!(values_equal(&Bson::Int32(1), &Bson::Double(1.0)));
        assert!(values_equal(&Bson::Int64(7), &Bson::Int32(7)));
        assert_eq!(compare(&Bson::Int32(1), &Bson::Double(1.5)), Ordering::Less);
        assert_eq!(compare(&Bson::Double(-0.5), &Bson::Int64(-1)), Ordering::Greater);
        assert_eq!(
            compare(&Bson::Int64(i64::MAX), &Bson::Double(9.3e18)),
            Ordering::Less
        );
        assert_eq!(compare(&Bson::Double(f64::NAN), &Bson::Int32(i32::MIN)), Ordering::Less);
    }

    #[test]
    fn test_type_brackets() {
        assert_eq!(compare(&Bson::Null, &Bson::Int32(0)), Ordering::Less);
        assert_eq!(compare(&Bson::Int32(100), &Bson::String("".into())), Ordering::Less);
        assert_eq!(compare(&Bson::Boolean(true), &Bson::DateTime(0)), Ordering::Less);
    }

    #[test]
    fn test_documents_and_arrays() {
        let a = Bson::Document(doc! { "a": 1 });
        let b = Bson::Document(doc! { "a": 1.0 });
        assert!(values_equal(&a, &b));
        let c = Bson::Document(doc! { "a": 1, "b": 1 });
        assert_eq!(compare(&a, &c), Ordering::Less);

        let x = Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)]);
        let y = Bson::Array(vec![Bson::Int32(1), Bson::Int32(3)]);
        assert_eq!(compare(&x, &y), Ordering::Less);
    }
}
