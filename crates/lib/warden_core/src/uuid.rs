// Identifier helpers.
//
// Every entity id in Warden is a UUIDv7 generated app-side so rows sort by
// creation time in both the in-memory and the Postgres store.

use uuid::Uuid;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn uuidv7() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuidv7_is_valid() {
        let id = uuidv7();
        assert_eq!(id.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn ids_are_distinct() {
        assert_ne!(uuidv7(), uuidv7());
    }
}
