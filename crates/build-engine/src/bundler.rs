//! Dependency bundling
//!
//! Expands the manifest's requirements through the recipe book, picks one
//! release per dependency and fills the store with the sources of every
//! `(dependency, ABI)` pair the build needs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use semver::Version;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use apkforge_core::error::DependencyError;
use apkforge_core::events::{Event, EventBus};
use apkforge_core::{Abi, BuildError};
use apkforge_manifest::Requirement;

use crate::recipes::{Recipe, RecipeBook, RecipeKind, Release};
use crate::store::{DependencyStore, StoreEntry};

/// One resolved dependency for one ABI (`None` for pure dependencies)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEntry {
    pub name: String,
    pub version: Version,
    pub abi: Option<Abi>,
    pub kind: RecipeKind,
    /// Store fingerprint of the fetched sources
    pub fingerprint: String,
    /// Fetched sources
    pub source_dir: PathBuf,
    /// Build script, native dependencies only
    pub script: Option<String>,
}

/// Resolved dependencies, dependencies before their dependents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    entries: Vec<DependencyEntry>,
}

impl DependencySet {
    pub fn new(entries: Vec<DependencyEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[DependencyEntry] {
        &self.entries
    }

    /// Native entries for one ABI, in build order
    pub fn native_for(&self, abi: Abi) -> impl Iterator<Item = &DependencyEntry> {
        self.entries
            .iter()
            .filter(move |e| e.kind == RecipeKind::Native && e.abi == Some(abi))
    }

    /// ABI-independent entries
    pub fn pure(&self) -> impl Iterator<Item = &DependencyEntry> {
        self.entries.iter().filter(|e| e.kind == RecipeKind::Pure)
    }

    /// Distinct `(name, version)` pairs in build order
    pub fn packages(&self) -> Vec<(&str, &Version)> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| seen.insert(e.name.as_str()))
            .map(|e| (e.name.as_str(), &e.version))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A constraint and who imposed it (`None` = the manifest)
#[derive(Debug, Clone)]
struct Constraint {
    requirement: Requirement,
    required_by: Option<String>,
}

/// Resolves requirements and fills the dependency store
pub struct DependencyBundler {
    recipes: Arc<RecipeBook>,
    store: Arc<DependencyStore>,
    jobs: usize,
    relax_conflicts: bool,
    events: Option<Arc<EventBus>>,
}

impl DependencyBundler {
    pub fn new(recipes: Arc<RecipeBook>, store: Arc<DependencyStore>) -> Self {
        Self {
            recipes,
            store,
            jobs: 1,
            relax_conflicts: false,
            events: None,
        }
    }

    /// Number of concurrent fetches
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Fall back to the manifest's own constraint on conflicts
    pub fn with_relaxed_conflicts(mut self, relax: bool) -> Self {
        self.relax_conflicts = relax;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Resolve `requirements` for `abis` and fetch everything into the store.
    ///
    /// Every failure is collected; the stage fails once with all of them.
    pub async fn bundle(
        &self,
        requirements: &[Requirement],
        abis: &[Abi],
    ) -> Result<DependencySet, BuildError> {
        let mut errors = Vec::new();

        let constraints = self.collect_constraints(requirements, &mut errors);
        let chosen = self.choose_releases(&constraints, &mut errors);
        self.check_abis(&constraints, &chosen, abis, &mut errors);
        if !errors.is_empty() {
            return Err(BuildError::Dependencies(errors));
        }

        let order = self
            .build_order(requirements, &chosen)
            .map_err(|e| BuildError::Dependencies(vec![e]))?;

        let mut planned = Vec::new();
        for name in &order {
            let (recipe, release) = &chosen[name];
            match recipe.kind {
                RecipeKind::Pure => planned.push((*recipe, *release, None)),
                RecipeKind::Native => {
                    planned.extend(abis.iter().map(|abi| (*recipe, *release, Some(*abi))))
                }
            }
        }
        info!(
            "Resolved {} dependencies ({} store entries)",
            order.len(),
            planned.len()
        );

        self.fetch_all(planned).await
    }

    /// Walk requirements and recipe `depends`, gathering every constraint per name
    fn collect_constraints(
        &self,
        requirements: &[Requirement],
        errors: &mut Vec<DependencyError>,
    ) -> IndexMap<String, Vec<Constraint>> {
        let mut constraints: IndexMap<String, Vec<Constraint>> = IndexMap::new();
        let mut queue: Vec<Constraint> = requirements
            .iter()
            .rev()
            .map(|r| Constraint {
                requirement: r.clone(),
                required_by: None,
            })
            .collect();
        let mut reported = HashSet::new();

        while let Some(constraint) = queue.pop() {
            let name = constraint.requirement.name().to_string();
            let Some(recipe) = self.recipes.get(&name) else {
                if reported.insert(name.clone()) {
                    errors.push(DependencyError::Unresolvable {
                        name: name.clone(),
                        requirement: constraint.requirement.to_string(),
                        reason: match &constraint.required_by {
                            Some(parent) => format!("no recipe (required by '{}')", parent),
                            None => "no recipe".to_string(),
                        },
                    });
                }
                continue;
            };

            let first_visit = !constraints.contains_key(&name);
            constraints.entry(name.clone()).or_default().push(constraint);
            if first_visit {
                for dep in recipe.depends.iter().rev() {
                    queue.push(Constraint {
                        requirement: dep.clone(),
                        required_by: Some(name.clone()),
                    });
                }
            }
        }
        constraints
    }

    fn choose_releases<'a>(
        &'a self,
        constraints: &IndexMap<String, Vec<Constraint>>,
        errors: &mut Vec<DependencyError>,
    ) -> HashMap<String, (&'a Recipe, &'a Release)> {
        let mut chosen = HashMap::new();

        for (name, list) in constraints {
            let Some(recipe) = self.recipes.get(name) else {
                continue;
            };
            let reqs = list.iter().map(|c| &c.requirement);
            if let Some(release) = recipe.newest_matching(reqs) {
                debug!("{} resolved to {}", name, release.version);
                chosen.insert(name.clone(), (recipe, release));
                continue;
            }

            let distinct: BTreeSet<String> =
                list.iter().map(|c| c.requirement.to_string()).collect();
            if distinct.len() <= 1 {
                errors.push(DependencyError::Unresolvable {
                    name: name.clone(),
                    requirement: list[0].requirement.to_string(),
                    reason: format!(
                        "no release matches (available: {})",
                        recipe
                            .releases
                            .iter()
                            .map(|r| r.version.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                });
                continue;
            }

            let relaxed = if self.relax_conflicts {
                let own: Vec<&Requirement> = list
                    .iter()
                    .filter(|c| c.required_by.is_none())
                    .map(|c| &c.requirement)
                    .collect();
                recipe.newest_matching(own)
            } else {
                None
            };
            match relaxed {
                Some(release) => {
                    let message = format!(
                        "version conflict for '{}' ([{}]) relaxed to {}",
                        name,
                        distinct.iter().cloned().collect::<Vec<_>>().join(", "),
                        release.version
                    );
                    warn!("{}", message);
                    self.emit(Event::Warning { message });
                    chosen.insert(name.clone(), (recipe, release));
                }
                None => errors.push(DependencyError::VersionConflict {
                    name: name.clone(),
                    constraints: distinct.into_iter().collect(),
                }),
            }
        }
        chosen
    }

    /// Every dependent -> dependency edge must work on every target ABI
    fn check_abis(
        &self,
        constraints: &IndexMap<String, Vec<Constraint>>,
        chosen: &HashMap<String, (&Recipe, &Release)>,
        abis: &[Abi],
        errors: &mut Vec<DependencyError>,
    ) {
        let mut reported = HashSet::new();
        for (name, list) in constraints {
            let Some((recipe, _)) = chosen.get(name) else {
                continue;
            };
            for abi in abis {
                if recipe.supports_abi(*abi) {
                    continue;
                }
                for constraint in list {
                    let key = (name.clone(), *abi, constraint.required_by.clone());
                    if reported.insert(key) {
                        errors.push(DependencyError::UnsupportedAbi {
                            name: name.clone(),
                            abi: abi.to_string(),
                            required_by: constraint.required_by.clone(),
                        });
                    }
                }
            }
        }
    }

    /// Depth-first post-order over `depends`, roots in manifest order
    fn build_order(
        &self,
        requirements: &[Requirement],
        chosen: &HashMap<String, (&Recipe, &Release)>,
    ) -> Result<Vec<String>, DependencyError> {
        fn visit(
            name: &str,
            chosen: &HashMap<String, (&Recipe, &Release)>,
            visiting: &mut Vec<String>,
            done: &mut HashSet<String>,
            order: &mut Vec<String>,
        ) -> Result<(), DependencyError> {
            if done.contains(name) {
                return Ok(());
            }
            if visiting.iter().any(|v| v == name) {
                visiting.push(name.to_string());
                return Err(DependencyError::InvalidRecipe {
                    name: name.to_string(),
                    reason: format!("dependency cycle: {}", visiting.join(" -> ")),
                });
            }
            let Some((recipe, _)) = chosen.get(name) else {
                return Ok(());
            };
            visiting.push(name.to_string());
            for dep in &recipe.depends {
                visit(dep.name(), chosen, visiting, done, order)?;
            }
            visiting.pop();
            done.insert(name.to_string());
            order.push(name.to_string());
            Ok(())
        }

        let mut order = Vec::new();
        let mut done = HashSet::new();
        for req in requirements {
            visit(req.name(), chosen, &mut Vec::new(), &mut done, &mut order)?;
        }
        Ok(order)
    }

    /// Fetch planned entries on a bounded pool, keeping plan order
    async fn fetch_all(
        &self,
        planned: Vec<(&Recipe, &Release, Option<Abi>)>,
    ) -> Result<DependencySet, BuildError> {
        let semaphore = Arc::new(Semaphore::new(self.jobs));
        let mut tasks = JoinSet::new();

        for (index, (recipe, release, abi)) in planned.iter().enumerate() {
            let store = self.store.clone();
            let semaphore = semaphore.clone();
            let entry = StoreEntry {
                name: recipe.name.clone(),
                version: release.version.to_string(),
                abi: *abi,
            };
            let source = release.source.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| DependencyError::Fetch {
                        name: entry.name.clone(),
                        version: entry.version.clone(),
                        message: e.to_string(),
                    })?;
                let fp = store.ensure(&entry, &source).await?;
                Ok::<_, DependencyError>((index, fp))
            });
        }

        let mut fingerprints = vec![None; planned.len()];
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((index, fp))) => fingerprints[index] = Some(fp),
                Ok(Err(e)) => errors.push(e),
                Err(e) => return Err(BuildError::Internal(format!("fetch task failed: {}", e))),
            }
        }
        if !errors.is_empty() {
            return Err(BuildError::Dependencies(errors));
        }

        let entries = planned
            .into_iter()
            .zip(fingerprints)
            .filter_map(|((recipe, release, abi), fp)| {
                let fp = fp?;
                Some(DependencyEntry {
                    name: recipe.name.clone(),
                    version: release.version.clone(),
                    abi,
                    kind: recipe.kind,
                    source_dir: self.store.source_dir(&fp),
                    fingerprint: fp,
                    script: recipe.script.clone(),
                })
            })
            .collect();
        Ok(DependencySet::new(entries))
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}
