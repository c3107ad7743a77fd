use serde::de::DeserializeOwned;
use serde_json::Value;

/// A PATCH field: left out, explicitly cleared, or set.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    Omitted,
    Null,
    Value(T),
}

impl<T> Patch<T> {
    /// Folds the patch into the stored value.
    pub fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            Patch::Omitted => current,
            Patch::Null => None,
            Patch::Value(value) => Some(value),
        }
    }

    pub fn is_omitted(&self) -> bool {
        matches!(self, Patch::Omitted)
    }
}

/// Reads `field` from a JSON object body, distinguishing a missing key from `null`.
pub fn classify_nullable<T: DeserializeOwned>(
    body: &Value,
    field: &str,
) -> Result<Patch<T>, String> {
    match body.get(field) {
        None => Ok(Patch::Omitted),
        Some(Value::Null) => Ok(Patch::Null),
        Some(value) => serde_json::from_value(value.clone())
            .map(Patch::Value)
            .map_err(|err| format!("invalid value for {field}: {err}")),
    }
}

/// Like [`classify_nullable`] for fields that cannot be cleared.
pub fn required_if_present<T: DeserializeOwned>(
    body: &Value,
    field: &str,
) -> Result<Option<T>, String> {
    match classify_nullable(body, field)? {
        Patch::Omitted => Ok(None),
        Patch::Null => Err(format!("{field} cannot be null")),
        Patch::Value(value) => Ok(Some(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn distinguishes_missing_null_and_value() {
        let id = Uuid::new_v4();
        let body = json!({ "reviewer_id": null, "approver_id": id });

        assert_eq!(classify_nullable::<Uuid>(&body, "reviewer_id"), Ok(Patch::Null));
        assert_eq!(classify_nullable::<Uuid>(&body, "approver_id"), Ok(Patch::Value(id)));
        assert_eq!(classify_nullable::<Uuid>(&body, "title"), Ok(Patch::Omitted));
    }

    #[test]
    fn rejects_wrong_types() {
        let body = json!({ "effective_date": "next tuesday" });
        assert!(classify_nullable::<NaiveDate>(&body, "effective_date").is_err());
    }

    #[test]
    fn apply_keeps_or_replaces() {
        assert_eq!(Patch::Omitted.apply(Some(1)), Some(1));
        assert_eq!(Patch::<i32>::Null.apply(Some(1)), None);
        assert_eq!(Patch::Value(2).apply(Some(1)), Some(2));
    }

    #[test]
    fn non_nullable_fields_reject_null() {
        let body = json!({ "title": null });
        assert!(required_if_present::<String>(&body, "title").is_err());
        assert_eq!(required_if_present::<String>(&json!({}), "title"), Ok(None));
    }
}
