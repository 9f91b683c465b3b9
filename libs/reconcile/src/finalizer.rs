//! Deletion-guard token operations.
//!
//! Pure functions over a finalizer list with set semantics. Nothing here
//! mutates a declaration in place: callers build the new list, put it on a
//! copy of the record and persist that copy explicitly.

/// Build the guard token for a declaration group, e.g.
/// `bigquerytables.mahdi.dev/finalizer`.
pub fn token_for_group(group: &str) -> String {
    format!("bigquerytables.{group}/finalizer")
}

/// Whether `token` is present.
pub fn has(finalizers: &[String], token: &str) -> bool {
    finalizers.iter().any(|f| f == token)
}

/// Return the list with `token` present. Existing order is preserved and the
/// token is appended only if it is absent.
pub fn add(finalizers: &[String], token: &str) -> Vec<String> {
    let mut out = finalizers.to_vec();
    if !has(finalizers, token) {
        out.push(token.to_string());
    }
    out
}

/// Return the list with every occurrence of `token` removed.
pub fn remove(finalizers: &[String], token: &str) -> Vec<String> {
    finalizers.iter().filter(|f| *f != token).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TOKEN: &str = "bigquerytables.mahdi.dev/finalizer";

    #[test]
    fn test_token_for_group() {
        assert_eq!(token_for_group("mahdi.dev"), TOKEN);
    }

    #[test]
    fn test_add_and_remove() {
        let empty: Vec<String> = Vec::new();
        let added = add(&empty, TOKEN);
        assert_eq!(added, vec![TOKEN.to_string()]);
        assert!(empty.is_empty());

        // Adding again is a no-op.
        assert_eq!(add(&added, TOKEN), added);

        let other = vec!["foregroundDeletion".to_string(), TOKEN.to_string()];
        assert_eq!(remove(&other, TOKEN), vec!["foregroundDeletion".to_string()]);

        // Removing an absent token is a no-op.
        assert_eq!(remove(&empty, TOKEN), empty);
    }

    proptest! {
        #[test]
        fn prop_add_then_has(list in proptest::collection::vec("[a-z./]{1,12}", 0..6)) {
            let added = add(&list, TOKEN);
            prop_assert!(has(&added, TOKEN));
            prop_assert_eq!(added.iter().filter(|f| *f == TOKEN).count(), 1);
            prop_assert_eq!(add(&added, TOKEN), added.clone());
        }

        #[test]
        fn prop_remove_keeps_others(list in proptest::collection::vec("[a-z./]{1,12}", 0..6)) {
            let with = add(&list, TOKEN);
            let without = remove(&with, TOKEN);
            prop_assert!(!has(&without, TOKEN));
            prop_assert_eq!(without, remove(&list, TOKEN));
        }
    }
}
