//! Reference data registrar
//!
//! Keeps the shared name dictionary (resource type names and the like)
//! populated. Concurrent loaders may try to add the same name at once; the
//! insert-ignore idiom leaves exactly one row per name and a plain read then
//! resolves every id.

use std::collections::{BTreeSet, HashMap};

use crate::db::Store;
use crate::error::{LoaderError, LoaderResult};

#[derive(Debug, Clone)]
pub struct ReferenceDataRegistrar {
    store: Store,
}

impl ReferenceDataRegistrar {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Make sure every name has a dictionary row and return name -> id
    pub async fn ensure<S>(&self, names: &[S]) -> LoaderResult<HashMap<String, i32>>
    where
        S: AsRef<str>,
    {
        // Sorted so concurrent callers insert in the same order.
        let unique: BTreeSet<&str> = names.iter().map(|n| n.as_ref()).collect();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }

        let d = self.store.dialect();
        let classify = |e| self.store.classify(e);

        let insert = d.upsert_statement("reference_dictionary", &["name"], &["name"], unique.len());
        let mut query = sqlx::query(&insert);
        for name in &unique {
            query = query.bind(*name);
        }
        let created = query
            .execute(self.store.pool())
            .await
            .map_err(classify)?
            .rows_affected();

        if created > 0 {
            tracing::info!(created, "Added reference dictionary entries");
        }

        let select = format!(
            "SELECT name, id FROM reference_dictionary WHERE name IN ({})",
            self.store.placeholders(1, unique.len())
        );
        let mut query = sqlx::query_as::<_, (String, i32)>(&select);
        for name in &unique {
            query = query.bind(*name);
        }
        let ids: HashMap<String, i32> = query
            .fetch_all(self.store.pool())
            .await
            .map_err(classify)?
            .into_iter()
            .collect();

        if ids.len() != unique.len() {
            let missing: Vec<&str> = unique
                .iter()
                .copied()
                .filter(|n| !ids.contains_key(*n))
                .collect();
            return Err(LoaderError::invariant(format!(
                "reference names not resolvable after insert: {}",
                missing.join(", ")
            )));
        }

        Ok(ids)
    }
}
