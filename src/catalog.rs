use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::backend::CatalogLookup;
use crate::errors::AppResult;
use crate::models::{Municipio, RutaPublica};

struct CachedList {
    fetched_at: Instant,
    municipios: Vec<Municipio>,
}

/// Municipality list with a TTL. Concurrent misses share one backend request.
pub struct MunicipioCache {
    ttl: Duration,
    entry: Mutex<Option<CachedList>>,
    refresh: AsyncMutex<()>,
}

impl MunicipioCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
            refresh: AsyncMutex::new(()),
        }
    }

    pub async fn get(&self, lookup: &dyn CatalogLookup) -> AppResult<Vec<Municipio>> {
        if let Some(hit) = self.fresh() {
            return Ok(hit);
        }

        let _refresh = self.refresh.lock().await;
        // Another caller may have filled the entry while this one waited.
        if let Some(hit) = self.fresh() {
            return Ok(hit);
        }

        let municipios = lookup.municipios().await?;
        debug!(target: "catalog", count = municipios.len(), "municipality list refreshed");
        *self.entry.lock() = Some(CachedList {
            fetched_at: Instant::now(),
            municipios: municipios.clone(),
        });
        Ok(municipios)
    }

    pub fn invalidate(&self) {
        self.entry.lock().take();
    }

    fn fresh(&self) -> Option<Vec<Municipio>> {
        let entry = self.entry.lock();
        entry
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.municipios.clone())
    }
}

/// Turns municipality and company names into backend ids.
#[derive(Clone)]
pub struct FieldResolver {
    lookup: Arc<dyn CatalogLookup>,
    municipios: Arc<MunicipioCache>,
    default_municipio_id: String,
}

impl FieldResolver {
    pub fn new(
        lookup: Arc<dyn CatalogLookup>,
        municipios: Arc<MunicipioCache>,
        default_municipio_id: impl Into<String>,
    ) -> Self {
        Self {
            lookup,
            municipios,
            default_municipio_id: default_municipio_id.into(),
        }
    }

    pub fn default_municipio_id(&self) -> &str {
        &self.default_municipio_id
    }

    /// A non-empty explicit id wins without any existence check.
    pub async fn municipio_id(&self, explicit: Option<&str>, name: &str) -> Option<String> {
        if let Some(id) = explicit_id(explicit) {
            return Some(id);
        }
        let wanted = normalized_name(name)?;
        match self.municipios.get(self.lookup.as_ref()).await {
            Ok(list) => list
                .into_iter()
                .find(|m| m.nombre.to_lowercase() == wanted)
                .map(|m| m.id),
            Err(err) => {
                warn!(target: "catalog", ?err, name, "municipality lookup failed");
                None
            }
        }
    }

    pub async fn empresa_id(
        &self,
        municipio_id: &str,
        explicit: Option<&str>,
        name: &str,
    ) -> Option<String> {
        if let Some(id) = explicit_id(explicit) {
            return Some(id);
        }
        let wanted = normalized_name(name)?;
        match self.lookup.empresas_by_municipio(municipio_id).await {
            Ok(list) => list
                .into_iter()
                .find(|e| e.nombre.to_lowercase() == wanted)
                .map(|e| e.id),
            Err(err) => {
                warn!(target: "catalog", ?err, municipio_id, name, "company lookup failed");
                None
            }
        }
    }

    /// Companies never drop a row over an unknown municipality.
    pub async fn municipio_id_or_default(&self, explicit: Option<&str>, name: &str) -> String {
        match self.municipio_id(explicit, name).await {
            Some(id) => id,
            None => {
                debug!(
                    target: "catalog",
                    name,
                    default = %self.default_municipio_id,
                    "municipality unresolved; using default"
                );
                self.default_municipio_id.clone()
            }
        }
    }
}

fn explicit_id(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn normalized_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Case-insensitive substring match on the route name. A blank query matches nothing.
pub fn search_routes<'a>(query: &str, routes: &'a [RutaPublica]) -> Vec<&'a RutaPublica> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    routes
        .iter()
        .filter(|route| route.nombre.to_lowercase().contains(&needle))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::models::EmpresaPublica;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCatalog {
        municipio_calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CatalogLookup for CountingCatalog {
        async fn municipios(&self) -> AppResult<Vec<Municipio>> {
            self.municipio_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                return Err(AppError::Timeout);
            }
            Ok(vec![Municipio {
                id: "m1".into(),
                nombre: "Huamantla".into(),
                centro: None,
            }])
        }

        async fn empresas_by_municipio(&self, municipio_id: &str) -> AppResult<Vec<EmpresaPublica>> {
            assert_eq!(municipio_id, "m1");
            Ok(vec![EmpresaPublica {
                id: "e1".into(),
                nombre: "ACME".into(),
            }])
        }
    }

    fn resolver(catalog: Arc<CountingCatalog>, ttl: Duration) -> FieldResolver {
        FieldResolver::new(catalog, Arc::new(MunicipioCache::new(ttl)), "huamantla")
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_request() {
        let catalog = CountingCatalog::default();
        let cache = MunicipioCache::new(Duration::from_secs(300));
        let (a, b) = tokio::join!(cache.get(&catalog), cache.get(&catalog));
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        assert_eq!(catalog.municipio_calls.load(Ordering::SeqCst), 1);

        cache.get(&catalog).await.unwrap();
        assert_eq!(catalog.municipio_calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        cache.get(&catalog).await.unwrap();
        assert_eq!(catalog.municipio_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entries_refetch() {
        let catalog = CountingCatalog::default();
        let cache = MunicipioCache::new(Duration::ZERO);
        cache.get(&catalog).await.unwrap();
        cache.get(&catalog).await.unwrap();
        assert_eq!(catalog.municipio_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resolves_names_case_insensitively() {
        let catalog = Arc::new(CountingCatalog::default());
        let resolver = resolver(catalog.clone(), Duration::from_secs(300));
        assert_eq!(
            resolver.municipio_id(None, "  huamantla ").await.as_deref(),
            Some("m1")
        );
        assert_eq!(
            resolver.empresa_id("m1", None, "acme").await.as_deref(),
            Some("e1")
        );
        assert_eq!(resolver.municipio_id(None, "Atlantis").await, None);
        assert_eq!(resolver.municipio_id(None, "").await, None);
    }

    #[tokio::test]
    async fn explicit_ids_skip_the_lookup() {
        let catalog = Arc::new(CountingCatalog::default());
        let resolver = resolver(catalog.clone(), Duration::from_secs(300));
        assert_eq!(
            resolver.municipio_id(Some(" m9 "), "whatever").await.as_deref(),
            Some("m9")
        );
        assert_eq!(catalog.municipio_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_lookup_counts_as_unresolved() {
        let catalog = Arc::new(CountingCatalog {
            fail: true,
            ..CountingCatalog::default()
        });
        let resolver = resolver(catalog, Duration::from_secs(300));
        assert_eq!(resolver.municipio_id(None, "Huamantla").await, None);
        assert_eq!(
            resolver.municipio_id_or_default(None, "Huamantla").await,
            "huamantla"
        );
    }

    #[test]
    fn search_matches_substrings() {
        let routes: Vec<RutaPublica> = ["Ruta Centro", "Circuito Norte", "centro - terminal"]
            .iter()
            .enumerate()
            .map(|(i, name)| RutaPublica {
                id: format!("r{i}"),
                nombre: name.to_string(),
                origen: String::new(),
                destino: String::new(),
                empresa_id: None,
                costo_minimo: None,
                costo_maximo: None,
                moneda: None,
            })
            .collect();
        let hits: Vec<_> = search_routes("CENTRO", &routes)
            .into_iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(hits, vec!["r0", "r2"]);
        assert!(search_routes("   ", &routes).is_empty());
    }
}
