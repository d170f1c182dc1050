use crate::{
    database::{DbHandle, InstalledSet},
    planner::TargetSet,
    utils::split_names,
};
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub group: String,
    pub category: String,
    pub names: Vec<String>,
}

impl CatalogEntry {
    pub fn new(group: &str, category: &str, names: &[&str]) -> Self {
        Self {
            group: group.to_string(),
            category: category.to_string(),
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularApp {
    pub category: String,
    pub name: String,
    pub description: String,
    pub install_names: String,
    pub uninstall_names: String,
    pub group: String,
}

impl PopularApp {
    pub fn install_targets(&self) -> TargetSet {
        split_names(&self.install_names)
    }

    pub fn is_installed(&self, installed: &InstalledSet) -> bool {
        installed.contains_all(&self.install_targets())
    }
}

pub fn build_rows(entries: &[CatalogEntry], db: &DbHandle) -> Vec<PopularApp> {
    let mut rows: Vec<PopularApp> = entries
        .iter()
        .filter_map(|entry| {
            let primary = entry.names.first()?;
            let description = db
                .lookup_sync(primary)
                .map(|p| p.description.clone())
                .unwrap_or_default();
            let names = entry.names.join(" ");
            Some(PopularApp {
                category: entry.category.clone(),
                name: primary.clone(),
                description,
                install_names: names.clone(),
                uninstall_names: names,
                group: entry.group.clone(),
            })
        })
        .collect();
    rows.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
    debug!("Built {} catalog rows from {} entries", rows.len(), entries.len());
    rows
}

pub fn batch_targets<S: AsRef<str>>(apps: &[PopularApp], selected: &[S]) -> TargetSet {
    let mut targets = TargetSet::new();
    for name in selected {
        for app in apps.iter().filter(|a| a.name == name.as_ref()) {
            for target in app.install_targets() {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
    }
    targets
}
