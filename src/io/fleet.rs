//! Static fleet file: warehouses with stock levels and the technician roster
//!
//! ```toml
//! [[warehouses]]
//! id = "w1"
//! name = "Centru"
//! latitude = 47.0245
//! longitude = 28.8322
//! [warehouses.stock]
//! "vacuum pump" = 2
//!
//! [[technicians]]
//! id = "t1"
//! latitude = 47.01
//! longitude = 28.85
//! ```

use crate::domain::error::StoreError;
use crate::domain::requirement::StockRequirement;
use crate::domain::types::{
    Coordinate, TechnicianId, TechnicianRecord, WarehouseCandidate, WarehouseId,
};
use crate::services::collaborators::{StockDirectory, TechnicianRoster};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
struct WarehouseEntry {
    id: WarehouseId,
    #[serde(default)]
    name: Option<String>,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    stock: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct TechnicianEntry {
    id: TechnicianId,
    #[serde(default)]
    name: Option<String>,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FleetToml {
    #[serde(default)]
    warehouses: Vec<WarehouseEntry>,
    #[serde(default)]
    technicians: Vec<TechnicianEntry>,
}

#[derive(Debug, Clone)]
struct Warehouse {
    id: WarehouseId,
    name: Option<String>,
    coordinate: Coordinate,
    stock: BTreeMap<String, u32>,
}

impl Warehouse {
    fn covers(&self, requirement: &StockRequirement) -> bool {
        requirement
            .items()
            .iter()
            .all(|(item, qty)| self.stock.get(item).is_some_and(|have| have >= qty))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FleetFile {
    warehouses: Vec<Warehouse>,
    technicians: Vec<TechnicianRecord>,
}

impl FleetFile {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let raw: FleetToml = toml::from_str(content).context("Failed to parse fleet file")?;

        let warehouses = raw
            .warehouses
            .into_iter()
            .map(|w| -> anyhow::Result<Warehouse> {
                let coordinate = Coordinate::new(w.latitude, w.longitude)
                    .with_context(|| format!("warehouse {}", w.id))?;
                Ok(Warehouse { id: w.id, name: w.name, coordinate, stock: w.stock })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let technicians = raw
            .technicians
            .into_iter()
            .map(|t| -> anyhow::Result<TechnicianRecord> {
                let coordinate = Coordinate::new(t.latitude, t.longitude)
                    .with_context(|| format!("technician {}", t.id))?;
                let record = TechnicianRecord::available(t.id, coordinate);
                Ok(match t.name {
                    Some(name) => record.with_name(name),
                    None => record,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self { warehouses, technicians })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read fleet file {}", path.display()))?;
        let fleet = Self::parse(&content)
            .with_context(|| format!("Invalid fleet file {}", path.display()))?;
        info!(
            file = %path.display(),
            warehouses = fleet.warehouses.len(),
            technicians = fleet.technicians.len(),
            "fleet_loaded"
        );
        Ok(fleet)
    }

    pub fn technician_records(&self) -> &[TechnicianRecord] {
        &self.technicians
    }
}

#[async_trait]
impl StockDirectory for FleetFile {
    async fn warehouses_for(
        &self,
        requirement: &StockRequirement,
    ) -> Result<Vec<WarehouseCandidate>, StoreError> {
        Ok(self
            .warehouses
            .iter()
            .map(|w| WarehouseCandidate {
                id: w.id.clone(),
                name: w.name.clone(),
                coordinate: w.coordinate,
                stock_sufficient: w.covers(requirement),
            })
            .collect())
    }
}

#[async_trait]
impl TechnicianRoster for FleetFile {
    async fn technicians(&self) -> Result<Vec<TechnicianRecord>, StoreError> {
        Ok(self.technicians.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLEET: &str = r#"
[[warehouses]]
id = "w1"
latitude = 47.0245
longitude = 28.8322
[warehouses.stock]
"sealant" = 1

[[warehouses]]
id = "w2"
name = "Botanica"
latitude = 46.9850
longitude = 28.8590
[warehouses.stock]
"sealant" = 4
"multimeter" = 1

[[technicians]]
id = "t1"
name = "Ion"
latitude = 47.01
longitude = 28.85
"#;

    #[tokio::test]
    async fn test_stock_sufficiency() {
        let fleet = FleetFile::parse(FLEET).unwrap();
        let req = StockRequirement::new().with_item("sealant", 2).with_item("multimeter", 1);

        let candidates = fleet.warehouses_for(&req).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(!candidates[0].stock_sufficient);
        assert!(candidates[1].stock_sufficient);
        assert_eq!(candidates[1].name.as_deref(), Some("Botanica"));
    }

    #[tokio::test]
    async fn test_roster() {
        let fleet = FleetFile::parse(FLEET).unwrap();
        let techs = fleet.technicians().await.unwrap();
        assert_eq!(techs.len(), 1);
        assert_eq!(techs[0].name(), Some("Ion"));
    }

    #[test]
    fn test_rejects_bad_coordinates() {
        let bad = "[[technicians]]\nid = \"t1\"\nlatitude = 120.0\nlongitude = 28.0\n";
        let err = FleetFile::parse(bad).unwrap_err();
        assert!(format!("{err:#}").contains("technician t1"));
    }

    #[test]
    fn test_empty_fleet() {
        let fleet = FleetFile::parse("").unwrap();
        assert!(fleet.technician_records().is_empty());
    }
}
