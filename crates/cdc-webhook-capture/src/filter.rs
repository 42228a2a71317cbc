//! Update-column filter.
//!
//! Decides whether an UPDATE is interesting to a binding by comparing the
//! listed columns between the old and new row. A column missing from a row
//! snapshot compares as SQL NULL, so NULL to non-NULL is a change.

use serde_json::Value;

/// Column filter of one binding.
#[derive(Debug, Clone, Copy)]
pub struct UpdateColumnFilter<'a> {
    columns: Option<&'a [String]>,
}

impl<'a> UpdateColumnFilter<'a> {
    /// `None` admits every UPDATE; an empty list admits none.
    pub fn new(columns: Option<&'a [String]>) -> Self {
        Self { columns }
    }

    /// Whether the UPDATE from `old` to `new` passes the filter.
    pub fn admits(&self, old: Option<&Value>, new: Option<&Value>) -> bool {
        match self.columns {
            None => true,
            Some(columns) => columns.iter().any(|column| column_changed(column, old, new)),
        }
    }
}

fn column_changed(column: &str, old: Option<&Value>, new: Option<&Value>) -> bool {
    let before = old.and_then(|row| row.get(column)).unwrap_or(&Value::Null);
    let after = new.and_then(|row| row.get(column)).unwrap_or(&Value::Null);
    before != after
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    #[test]
    fn change_outside_filter_is_ignored() {
        let filter = columns(&["salary"]);
        let old = json!({"id": 1, "name": "Ada", "salary": 1000});
        let new = json!({"id": 1, "name": "Grace", "salary": 1000});

        assert!(!UpdateColumnFilter::new(Some(&filter)).admits(Some(&old), Some(&new)));
    }

    #[test]
    fn change_inside_filter_passes() {
        let filter = columns(&["name", "salary"]);
        let old = json!({"salary": 1000});
        let new = json!({"salary": 1200});

        assert!(UpdateColumnFilter::new(Some(&filter)).admits(Some(&old), Some(&new)));
    }

    #[test]
    fn null_to_value_is_a_change() {
        let filter = columns(&["manager_id"]);
        let old = json!({"manager_id": null});
        let new = json!({"manager_id": 7});

        assert!(UpdateColumnFilter::new(Some(&filter)).admits(Some(&old), Some(&new)));
    }

    #[test]
    fn no_filter_admits_everything() {
        let row = json!({"id": 1});
        assert!(UpdateColumnFilter::new(None).admits(Some(&row), Some(&row)));
    }

    fn row() -> impl Strategy<Value = serde_json::Map<String, Value>> {
        proptest::collection::btree_map(
            "[a-d]",
            prop_oneof![Just(Value::Null), any::<i32>().prop_map(Value::from)],
            0..4,
        )
        .prop_map(|map| map.into_iter().collect())
    }

    proptest! {
        #[test]
        fn empty_filter_never_admits(old in row(), new in row()) {
            let empty: Vec<String> = Vec::new();
            let (old, new) = (Value::Object(old), Value::Object(new));
            prop_assert!(!UpdateColumnFilter::new(Some(&empty)).admits(Some(&old), Some(&new)));
        }

        #[test]
        fn admits_iff_a_listed_column_differs(
            old in row(),
            new in row(),
            listed in proptest::collection::vec("[a-d]", 1..3),
        ) {
            let expected = listed.iter().any(|column| {
                old.get(column).unwrap_or(&Value::Null) != new.get(column).unwrap_or(&Value::Null)
            });
            let (old, new) = (Value::Object(old), Value::Object(new));

            prop_assert_eq!(
                UpdateColumnFilter::new(Some(&listed)).admits(Some(&old), Some(&new)),
                expected
            );
        }
    }
}
