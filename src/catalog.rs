//! Read-only view of the waste-bank and waste-type catalog.
//!
//! The catalog itself is maintained elsewhere; the core only needs to know
//! whether a bank or waste type is active and what a kilogram is worth.
use super::error::Result;
use super::types::Fixed;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct WasteBank {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct WasteType {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub category: String, // e.g. "plastic", "paper", "metal"
    #[n(3)]
    pub price_per_kg: Fixed,
    #[n(4)]
    pub is_active: bool,
}

/// Lookup port for catalog data owned by another service.
pub trait Catalog: Send + Sync {
    fn bank(&self, id: &str) -> Result<Option<WasteBank>>;
    fn waste_type(&self, id: &str) -> Result<Option<WasteType>>;
}

/// Catalog mirror kept in the same sled database as the core.
#[derive(Clone)]
pub struct SledCatalog {
    banks: sled::Tree,
    waste_types: sled::Tree,
}

impl SledCatalog {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            banks: db.open_tree("catalog_banks")?,
            waste_types: db.open_tree("catalog_waste_types")?,
        })
    }

    /// Insert or replace a bank, as the catalog sync would.
    pub fn upsert_bank(&self, bank: &WasteBank) -> Result<()> {
        self.banks.insert(bank.id.as_bytes(), minicbor::to_vec(bank)?)?;
        Ok(())
    }

    pub fn upsert_waste_type(&self, waste_type: &WasteType) -> Result<()> {
        self.waste_types
            .insert(waste_type.id.as_bytes(), minicbor::to_vec(waste_type)?)?;
        Ok(())
    }

    /// Drop a waste type from the mirror. Submissions already priced keep their stored price.
    pub fn remove_waste_type(&self, id: &str) -> Result<()> {
        self.waste_types.remove(id.as_bytes())?;
        Ok(())
    }
}

impl Catalog for SledCatalog {
    fn bank(&self, id: &str) -> Result<Option<WasteBank>> {
        match self.banks.get(id.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn waste_type(&self, id: &str) -> Result<Option<WasteType>> {
        match self.waste_types.get(id.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw)?)),
            None => Ok(None),
        }
    }
}
