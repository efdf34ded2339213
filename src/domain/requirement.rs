//! Stock requirements for an order

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Installation,
    Maintenance,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Installation => f.write_str("installation"),
            OrderType::Maintenance => f.write_str("maintenance"),
        }
    }
}

const INSTALLATION_MATERIALS: &[&str] = &["copper pipe 1/4\"", "refrigerant R410A", "anchor bolts"];
const INSTALLATION_TOOLS: &[&str] = &["vacuum pump", "manifold gauge", "hammer drill"];
const MAINTENANCE_MATERIALS: &[&str] = &["refrigerant R410A", "antiseptic solution", "sealant"];
const MAINTENANCE_TOOLS: &[&str] = &["gas torch", "multimeter", "ratchet wrench"];

/// Ordered list of (item, quantity) a warehouse must hold for an order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRequirement {
    items: Vec<(String, u32)>,
}

impl StockRequirement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item. Repeated names accumulate; zero quantities are ignored.
    pub fn with_item(mut self, name: impl Into<String>, quantity: u32) -> Self {
        if quantity == 0 {
            return self;
        }
        let name = name.into();
        match self.items.iter_mut().find(|(n, _)| *n == name) {
            Some((_, q)) => *q = q.saturating_add(quantity),
            None => self.items.push((name, quantity)),
        }
        self
    }

    /// Standard kit for an order type, plus one unit of the equipment model if given
    pub fn for_order(order_type: OrderType, equipment_model: Option<&str>) -> Self {
        let (materials, tools) = match order_type {
            OrderType::Installation => (INSTALLATION_MATERIALS, INSTALLATION_TOOLS),
            OrderType::Maintenance => (MAINTENANCE_MATERIALS, MAINTENANCE_TOOLS),
        };

        let mut req = Self::new();
        if let Some(model) = equipment_model.map(str::trim).filter(|m| !m.is_empty()) {
            req = req.with_item(model, 1);
        }
        for item in materials.iter().chain(tools.iter()) {
            req = req.with_item(*item, 1);
        }
        req
    }

    pub fn items(&self) -> &[(String, u32)] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
