//! Storage key layout.
//!
//! Every key is namespaced by collection so independent collections never share tokens.

const NAMESPACE: &str = "gazette";

/// Per-context adopted version token.
pub fn version_key(collection: &str) -> String {
    format!("{NAMESPACE}:{collection}:version")
}

/// Per-context serialized cache entry.
pub fn snapshot_key(collection: &str) -> String {
    format!("{NAMESPACE}:{collection}:snapshot")
}

/// Origin-shared slot the storage transport writes messages into.
pub fn coherence_key(collection: &str) -> String {
    format!("{NAMESPACE}:coherence:{collection}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_collection() {
        assert_eq!(version_key("articles"), "gazette:articles:version");
        assert_eq!(snapshot_key("articles"), "gazette:articles:snapshot");
        assert_eq!(coherence_key("articles"), "gazette:coherence:articles");
        assert_ne!(version_key("articles"), version_key("categories"));
    }
}
