use crate::entities::catalog::MarketCatalog;
use std::path::Path;

pub trait CatalogRepository {
    fn load_catalog(&self, path: &Path) -> Result<MarketCatalog, String>;
}
