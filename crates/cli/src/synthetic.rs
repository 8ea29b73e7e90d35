//! In-memory object model the driver loads from.

use std::sync::Arc;

use chrono::NaiveDate;
use preload_core::Record;
use preload_loader::{ClassHandle, MemoryCache, MemoryTable, StaticCatalog};

pub const ISSUERS: i64 = 50;

/// Contract -> Product -> Issuer, with `owners` contracts spread evenly over
/// `products` products. Contracts are dated when `dates` is non-empty.
pub fn catalog(owners: i64, products: i64, dates: &[NaiveDate]) -> StaticCatalog {
    let products = products.max(1);
    let contracts: Vec<Record> = (0..owners)
        .map(|i| {
            let record = Record::new().with("id", i).with("productId", i % products);
            match dates {
                [] => record,
                _ => record.with("businessDate", dates[i as usize % dates.len()]),
            }
        })
        .collect();
    let product_rows: Vec<Record> = (0..products)
        .map(|i| {
            Record::new()
                .with("id", i)
                .with("name", format!("P{:06}", i))
                .with("issuerId", i % ISSUERS)
        })
        .collect();
    let issuers: Vec<Record> = (0..ISSUERS)
        .map(|i| Record::new().with("id", i).with("name", format!("I{:03}", i)))
        .collect();

    let mut contract = class("Contract", contracts);
    if !dates.is_empty() {
        contract = contract.dated("businessDate");
    }
    StaticCatalog::new()
        .with(contract)
        .with(class("Product", product_rows))
        .with(class("Issuer", issuers))
}

fn class(name: &str, records: Vec<Record>) -> ClassHandle {
    ClassHandle::new(
        name,
        Arc::new(MemoryCache::new(name)),
        Arc::new(MemoryTable::new(name, records)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use preload_loader::ClassCatalog;

    #[test]
    fn test_contracts_are_dated_only_with_dates() {
        let undated = catalog(10, 3, &[]);
        assert!(!undated.class("Contract").unwrap().is_dated());

        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let dated = catalog(10, 3, &[date]);
        assert!(dated.class("Contract").unwrap().is_dated());
        assert!(dated.class("Issuer").is_ok());
    }
}
