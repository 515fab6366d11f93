//! Foreign key graph over the ghost tables of a migration.

use crate::catalog::{Catalog, ForeignKey};
use crate::error::Result;
use std::collections::{BTreeMap, BTreeSet};

/// Tables sharing the extreme foreign key count of a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphResult {
    pub count: usize,
    pub tables: BTreeSet<String>,
}

/// Ghost tables and the foreign keys between them.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<String, Vec<ForeignKey>>,
}

impl Graph {
    /// Build the graph of `tables`, keeping only foreign keys between them.
    pub fn from_catalog(catalog: &Catalog, tables: &BTreeSet<String>) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for name in tables {
            let table = catalog.table(name)?;
            let foreign_keys = table
                .foreign_keys
                .iter()
                .filter(|fk| tables.contains(&fk.referred_table))
                .cloned()
                .collect();
            nodes.insert(name.clone(), foreign_keys);
        }
        Ok(Self { nodes })
    }

    pub fn contains(&self, table: &str) -> bool {
        self.nodes.contains_key(table)
    }

    pub fn tables(&self) -> BTreeSet<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Among `selection`, the tables referring to the fewest distinct other tables of
    /// `selection`. Self references do not count.
    pub fn least_outgoing_foreign_keys(&self, selection: &BTreeSet<String>) -> GraphResult {
        let counts: BTreeMap<&String, usize> = self
            .nodes
            .iter()
            .filter(|(name, _)| selection.contains(*name))
            .map(|(name, foreign_keys)| {
                let referred: BTreeSet<&String> = foreign_keys
                    .iter()
                    .filter(|fk| !fk.is_self_referencing(name))
                    .filter(|fk| selection.contains(&fk.referred_table))
                    .map(|fk| &fk.referred_table)
                    .collect();
                (name, referred.len())
            })
            .collect();

        let Some(minimum) = counts.values().copied().min() else {
            return GraphResult {
                count: 0,
                tables: selection.clone(),
            };
        };
        GraphResult {
            count: minimum,
            tables: counts
                .into_iter()
                .filter(|(_, count)| *count == minimum)
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }

    /// Among `selection`, the tables referred to by the most distinct tables of the
    /// whole catalog through NOT NULL foreign keys.
    pub fn most_incoming_foreign_keys(
        &self,
        catalog: &Catalog,
        selection: &BTreeSet<String>,
    ) -> GraphResult {
        let counts: BTreeMap<&String, usize> = self
            .nodes
            .keys()
            .filter(|name| selection.contains(*name))
            .map(|name| (name, catalog.not_nullable_incoming(name)))
            .collect();

        let Some(maximum) = counts.values().copied().max() else {
            return GraphResult {
                count: 0,
                tables: selection.clone(),
            };
        };
        GraphResult {
            count: maximum,
            tables: counts
                .into_iter()
                .filter(|(_, count)| *count == maximum)
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ColumnType, TableDef};

    fn create_catalog() -> Catalog {
        let customers = TableDef::new("customers")
            .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
            .with_column(ColumnDef::new("referrer_id", ColumnType::BigInt))
            .with_foreign_key(ForeignKey::new("referrer_fk", ["referrer_id"], "customers", ["id"]));
        let orders = TableDef::new("orders")
            .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
            .with_column(ColumnDef::new("customer_id", ColumnType::BigInt).not_null())
            .with_foreign_key(ForeignKey::new("customer_fk", ["customer_id"], "customers", ["id"]));
        let items = TableDef::new("items")
            .with_column(ColumnDef::new("id", ColumnType::BigInt).identity())
            .with_column(ColumnDef::new("order_id", ColumnType::BigInt).not_null())
            .with_foreign_key(ForeignKey::new("order_fk", ["order_id"], "orders", ["id"]));
        Catalog::new("shop")
            .with_table(customers)
            .unwrap()
            .with_table(orders)
            .unwrap()
            .with_table(items)
            .unwrap()
    }

    fn all() -> BTreeSet<String> {
        ["customers", "orders", "items"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_least_outgoing_ignores_self_references() {
        let catalog = create_catalog();
        let graph = Graph::from_catalog(&catalog, &all()).unwrap();
        let least = graph.least_outgoing_foreign_keys(&all());
        assert_eq!(least.count, 0);
        assert_eq!(least.tables, BTreeSet::from(["customers".to_string()]));
    }

    #[test]
    fn test_least_outgoing_within_selection() {
        let catalog = create_catalog();
        let graph = Graph::from_catalog(&catalog, &all()).unwrap();
        let selection = BTreeSet::from(["orders".to_string(), "items".to_string()]);
        let least = graph.least_outgoing_foreign_keys(&selection);
        assert_eq!(least.count, 0);
        assert_eq!(least.tables, BTreeSet::from(["orders".to_string()]));
    }

    #[test]
    fn test_most_incoming() {
        let catalog = create_catalog();
        let graph = Graph::from_catalog(&catalog, &all()).unwrap();
        let most = graph.most_incoming_foreign_keys(&catalog, &all());
        assert_eq!(most.count, 1);
        assert_eq!(
            most.tables,
            BTreeSet::from(["customers".to_string(), "orders".to_string()])
        );
    }

    #[test]
    fn test_foreign_keys_outside_graph_dropped() {
        let catalog = create_catalog();
        let selection = BTreeSet::from(["orders".to_string()]);
        let graph = Graph::from_catalog(&catalog, &selection).unwrap();
        let least = graph.least_outgoing_foreign_keys(&selection);
        assert_eq!(least.count, 0);
        assert!(graph.contains("orders"));
        assert!(!graph.contains("customers"));
    }
}
