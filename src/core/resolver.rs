// src/core/resolver.rs

//! Turns the registry and a scan's inputs into an activation plan.
//!
//! Two kinds of edges exist between modules. Event edges (`A` produces a type
//! `B` watches) may form cycles; those terminate at runtime through
//! deduplication. Dependency edges (`B` explicitly depends on `A`) encode setup
//! ordering and must form a DAG, otherwise resolution fails for the whole scan.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::core::descriptor::{ModuleContract, ModuleDescriptor, OptionValue};
use crate::core::error::ResolutionError;
use crate::core::models::EventType;
use crate::core::registry::{LifecycleState, RegistryEntry};

/// A scan's module selection inputs.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub seed_types: BTreeSet<EventType>,
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
    /// When non-empty, only modules that help produce these types are candidates.
    pub wanted_types: BTreeSet<EventType>,
    pub module_options: BTreeMap<String, BTreeMap<String, OptionValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Event,
    Dependency,
}

/// The per-scan result of resolution.
///
/// Descriptors are captured at resolution time: they are the contracts this
/// scan routes by. Implementations are not captured; dispatch looks them up
/// per submission.
#[derive(Debug, Clone)]
pub struct ActivationPlan {
    modules: BTreeMap<String, Arc<ModuleDescriptor>>,
    seed_types: BTreeSet<EventType>,
    setup_order: Vec<String>,
    edges: BTreeSet<(String, String, EdgeKind)>,
    options: BTreeMap<String, Arc<BTreeMap<String, OptionValue>>>,
    consumers: HashMap<EventType, Vec<String>>,
    wildcard_consumers: Vec<String>,
}

impl ActivationPlan {
    pub fn activation_set(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.modules.contains_key(module_id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Event types the scan is seeded with.
    pub fn seed_types(&self) -> &BTreeSet<EventType> {
        &self.seed_types
    }

    /// Dependency-first order for the one-time setup hooks.
    pub fn setup_order(&self) -> &[String] {
        &self.setup_order
    }

    pub fn edges(&self) -> impl Iterator<Item = (&str, &str, EdgeKind)> {
        self.edges.iter().map(|(from, to, kind)| (from.as_str(), to.as_str(), *kind))
    }

    pub fn descriptor(&self, module_id: &str) -> Option<&Arc<ModuleDescriptor>> {
        self.modules.get(module_id)
    }

    pub fn options(&self, module_id: &str) -> Arc<BTreeMap<String, OptionValue>> {
        self.options.get(module_id).cloned().unwrap_or_default()
    }

    /// The contracts this plan was computed from, keyed by module id.
    pub fn contracts(&self) -> BTreeMap<String, ModuleContract> {
        self.modules.iter().map(|(id, d)| (id.clone(), d.contract())).collect()
    }

    /// Modules in the activation set that watch `event_type`, wildcard
    /// watchers included.
    pub fn consumers_of<'a>(&'a self, event_type: &EventType) -> impl Iterator<Item = &'a str> {
        self.consumers
            .get(event_type)
            .into_iter()
            .flatten()
            .chain(&self.wildcard_consumers)
            .map(String::as_str)
    }

    /// Every module that depends on `module_id`, directly or transitively.
    pub fn dependents_of(&self, module_id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![module_id.to_string()];
        while let Some(current) = frontier.pop() {
            for (id, descriptor) in &self.modules {
                if descriptor.dependencies.contains(&current) && found.insert(id.clone()) {
                    frontier.push(id.clone());
                }
            }
        }
        found
    }
}

/// Computes the activation plan for a scan.
///
/// `entries` is the whole registry; only `Active` entries are candidates.
/// Excluded modules, and modules whose explicit dependencies lead to an
/// excluded or inactive module, are removed before the fixed point runs, so
/// anything reachable only through them drops out too.
///
/// # Errors
/// * [`ResolutionError::NoSeedTypes`] with neither seed types nor includes.
/// * [`ResolutionError::UnknownModule`] for an include that is not active.
/// * [`ResolutionError::UnresolvedDependency`] when an activated module depends
///   on a module that was never registered.
/// * [`ResolutionError::CyclicDependency`] when explicit dependencies cycle.
/// * [`ResolutionError::InvalidOption`] for a bad per-scan option override.
pub fn resolve(entries: &[Arc<RegistryEntry>], selection: &Selection) -> Result<ActivationPlan, ResolutionError> {
    if selection.seed_types.is_empty() && selection.include.is_empty() {
        return Err(ResolutionError::NoSeedTypes);
    }

    let catalog: BTreeMap<&str, &Arc<ModuleDescriptor>> = entries
        .iter()
        .filter(|e| e.state() == LifecycleState::Active)
        .map(|e| (e.id(), e.descriptor()))
        .collect();
    let registered: BTreeSet<&str> = entries.iter().map(|e| e.id()).collect();

    if let Some(unknown) = selection.include.iter().find(|id| !catalog.contains_key(id.as_str())) {
        return Err(ResolutionError::UnknownModule { id: unknown.clone() });
    }

    let mut candidates: BTreeSet<&str> = catalog
        .keys()
        .copied()
        .filter(|id| !selection.exclude.contains(*id))
        .collect();
    prune_blocked_dependents(&catalog, &registered, &selection.exclude, &mut candidates);

    if !selection.wanted_types.is_empty() {
        let producers = backwards_closure(&catalog, &candidates, &selection.wanted_types);
        candidates.retain(|id| producers.contains(id) || selection.include.contains(*id));
    }

    let active = forward_closure(&catalog, &candidates, selection)?;
    let setup_order = dependency_order(&catalog, &active)?;

    let modules: BTreeMap<String, Arc<ModuleDescriptor>> = active
        .iter()
        .map(|id| (id.to_string(), Arc::clone(catalog[id])))
        .collect();

    let mut options = BTreeMap::new();
    for (id, descriptor) in &modules {
        let resolved = descriptor.resolve_options(selection.module_options.get(id))?;
        options.insert(id.clone(), Arc::new(resolved));
    }
    for id in selection.module_options.keys().filter(|id| !modules.contains_key(*id)) {
        debug!(module = %id, "Ignoring options for a module outside the activation set.");
    }

    let mut consumers: HashMap<EventType, Vec<String>> = HashMap::new();
    let mut wildcard_consumers = Vec::new();
    for (id, descriptor) in &modules {
        for watched in &descriptor.watched {
            if watched.is_wildcard() {
                wildcard_consumers.push(id.clone());
            } else {
                consumers.entry(watched.clone()).or_default().push(id.clone());
            }
        }
    }

    let edges = build_edges(&modules);
    info!(
        modules = modules.len(),
        edges = edges.len(),
        setup = setup_order.len(),
        "Activation plan resolved."
    );

    Ok(ActivationPlan {
        modules,
        seed_types: selection.seed_types.clone(),
        setup_order,
        edges,
        options,
        consumers,
        wildcard_consumers,
    })
}

/// Removes candidates whose explicit dependency is excluded, or registered
/// but not a candidate (inactive, or itself removed), repeating until stable.
/// Dependencies that were never registered are left for the forward closure
/// to report.
fn prune_blocked_dependents(
    catalog: &BTreeMap<&str, &Arc<ModuleDescriptor>>,
    registered: &BTreeSet<&str>,
    exclude: &BTreeSet<String>,
    candidates: &mut BTreeSet<&str>,
) {
    loop {
        let blocked: Vec<&str> = candidates
            .iter()
            .copied()
            .filter(|id| {
                catalog[id].dependencies.iter().any(|dep| {
                    exclude.contains(dep) || (registered.contains(dep.as_str()) && !candidates.contains(dep.as_str()))
                })
            })
            .collect();
        if blocked.is_empty() {
            return;
        }
        for id in blocked {
            debug!(module = id, "Dropping module whose dependency is excluded or inactive.");
            candidates.remove(id);
        }
    }
}

/// Modules that produce a wanted type, the producers of what those watch,
/// and their explicit dependencies.
fn backwards_closure<'a>(
    catalog: &BTreeMap<&'a str, &Arc<ModuleDescriptor>>,
    candidates: &BTreeSet<&'a str>,
    wanted: &BTreeSet<EventType>,
) -> BTreeSet<&'a str> {
    let mut needed = wanted.clone();
    let mut selected: BTreeSet<&str> = BTreeSet::new();
    loop {
        let mut changed = false;
        for &id in candidates {
            if selected.contains(id) {
                continue;
            }
            let descriptor = catalog[id];
            let helps = descriptor.produced.iter().any(|p| needed.contains(p))
                || selected.iter().any(|s| catalog[s].dependencies.contains(id));
            if helps {
                selected.insert(id);
                needed.extend(descriptor.watched.iter().filter(|w| !w.is_wildcard()).cloned());
                changed = true;
            }
        }
        if !changed {
            return selected;
        }
    }
}

/// Seeds with watchers of the seed types and explicit includes, then expands
/// over produced→watched types and explicit dependencies until stable.
fn forward_closure<'a>(
    catalog: &BTreeMap<&'a str, &Arc<ModuleDescriptor>>,
    candidates: &BTreeSet<&'a str>,
    selection: &Selection,
) -> Result<BTreeSet<&'a str>, ResolutionError> {
    let mut active: BTreeSet<&str> = BTreeSet::new();
    let mut available: BTreeSet<EventType> = selection.seed_types.clone();

    loop {
        let mut changed = false;

        for &id in candidates {
            if active.contains(id) {
                continue;
            }
            let descriptor = catalog[id];
            let reached = selection.include.contains(id)
                || descriptor
                    .watched
                    .iter()
                    .any(|w| if w.is_wildcard() { !available.is_empty() } else { available.contains(w) });
            if reached {
                active.insert(id);
                available.extend(descriptor.produced.iter().cloned());
                changed = true;
            }
        }

        let pending: Vec<(&str, &str)> = active
            .iter()
            .flat_map(|&id| catalog[id].dependencies.iter().map(move |dep| (id, dep.as_str())))
            .filter(|(_, dep)| !active.contains(dep))
            .collect();
        for (module, dependency) in pending {
            let Some((&dep_id, descriptor)) = catalog.get_key_value(dependency) else {
                return Err(ResolutionError::UnresolvedDependency {
                    module: module.to_string(),
                    dependency: dependency.to_string(),
                });
            };
            if !candidates.contains(dep_id) {
                // Pruning guarantees this only happens for wanted-type narrowing.
                return Err(ResolutionError::UnresolvedDependency {
                    module: module.to_string(),
                    dependency: dependency.to_string(),
                });
            }
            if active.insert(dep_id) {
                debug!(module, dependency, "Pulled in explicit dependency.");
                available.extend(descriptor.produced.iter().cloned());
                changed = true;
            }
        }

        if !changed {
            return Ok(active);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first topological sort over explicit dependencies, dependencies first.
fn dependency_order(
    catalog: &BTreeMap<&str, &Arc<ModuleDescriptor>>,
    active: &BTreeSet<&str>,
) -> Result<Vec<String>, ResolutionError> {
    fn visit<'a>(
        id: &'a str,
        catalog: &BTreeMap<&'a str, &'a Arc<ModuleDescriptor>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), ResolutionError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|p| p.to_string()).collect();
                cycle.push(id.to_string());
                return Err(ResolutionError::CyclicDependency { modules: cycle });
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        path.push(id);
        for dep in &catalog[id].dependencies {
            if let Some((&dep_id, _)) = catalog.get_key_value(dep.as_str()) {
                visit(dep_id, catalog, marks, path, order)?;
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        order.push(id.to_string());
        Ok(())
    }

    let scoped: BTreeMap<&str, &Arc<ModuleDescriptor>> =
        active.iter().map(|&id| (id, catalog[id])).collect();
    let mut marks = HashMap::new();
    let mut order = Vec::with_capacity(active.len());
    for &id in active {
        let mut path = Vec::new();
        visit(id, &scoped, &mut marks, &mut path, &mut order)?;
    }
    Ok(order)
}

fn build_edges(modules: &BTreeMap<String, Arc<ModuleDescriptor>>) -> BTreeSet<(String, String, EdgeKind)> {
    let mut edges = BTreeSet::new();
    for (producer, p) in modules {
        for (consumer, c) in modules {
            if producer != consumer && p.produced.iter().any(|t| c.watches_type(t)) {
                edges.insert((producer.clone(), consumer.clone(), EdgeKind::Event));
            }
        }
    }
    for (id, descriptor) in modules {
        for dep in &descriptor.dependencies {
            edges.insert((dep.clone(), id.clone(), EdgeKind::Dependency));
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::ModuleVersion;
    use crate::core::error::ModuleError;
    use crate::core::models::{Emission, ScanEvent};
    use crate::core::module::{ModuleContext, ScanModule};
    use crate::core::registry::Registry;
    use async_trait::async_trait;
    use rstest::rstest;

    struct Idle;

    #[async_trait]
    impl ScanModule for Idle {
        async fn handle(&self, _: &ScanEvent, _: &ModuleContext) -> Result<Vec<Emission>, ModuleError> {
            Ok(Vec::new())
        }
    }

    fn module(id: &str) -> ModuleDescriptor {
        ModuleDescriptor::new(id, ModuleVersion::new(1, 0, 0))
    }

    fn registry(descriptors: Vec<ModuleDescriptor>) -> Vec<Arc<RegistryEntry>> {
        let registry = Registry::new();
        for d in descriptors {
            let id = d.id.clone();
            registry.register(d, Arc::new(Idle)).expect("register");
            registry.set_state(&id, LifecycleState::Active).expect("activate");
        }
        registry.active()
    }

    fn seeded(types: &[&str]) -> Selection {
        Selection { seed_types: types.iter().map(|t| EventType::from(*t)).collect(), ..Selection::default() }
    }

    fn ids(plan: &ActivationPlan) -> Vec<&str> {
        plan.activation_set().collect()
    }

    #[test]
    fn expands_along_event_types() {
        let entries = registry(vec![
            module("x").watches("SEED").produces("ALPHA"),
            module("y").watches("ALPHA"),
            module("z").watches("UNRELATED"),
        ]);
        let plan = resolve(&entries, &seeded(&["SEED"])).expect("resolves");
        assert_eq!(ids(&plan), vec!["x", "y"]);
        assert_eq!(plan.consumers_of(&EventType::from("ALPHA")).collect::<Vec<_>>(), vec!["y"]);
        assert!(plan.edges().any(|e| e == ("x", "y", EdgeKind::Event)));
    }

    #[test]
    fn event_cycles_are_allowed() {
        let entries = registry(vec![
            module("p").watches("SEED").watches("B").produces("A"),
            module("q").watches("A").produces("B"),
        ]);
        let plan = resolve(&entries, &seeded(&["SEED"])).expect("event cycles resolve");
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn dependency_cycles_are_fatal() {
        let entries = registry(vec![
            module("a").watches("SEED").depends_on("b"),
            module("b").depends_on("c"),
            module("c").depends_on("a"),
        ]);
        let err = resolve(&entries, &seeded(&["SEED"])).expect_err("cycle");
        let ResolutionError::CyclicDependency { modules } = err else {
            panic!("expected a cycle, got {err:?}");
        };
        assert_eq!(modules.first(), modules.last());
        for id in ["a", "b", "c"] {
            assert!(modules.iter().any(|m| m == id));
        }
    }

    #[test]
    fn unreachable_cycles_do_not_matter() {
        let entries = registry(vec![
            module("a").watches("SEED"),
            module("b").watches("ELSEWHERE").depends_on("c"),
            module("c").depends_on("b"),
        ]);
        let plan = resolve(&entries, &seeded(&["SEED"])).expect("resolves");
        assert_eq!(ids(&plan), vec!["a"]);
    }

    #[test]
    fn setup_order_puts_dependencies_first() {
        let entries = registry(vec![
            module("scanner").watches("SEED").depends_on("session"),
            module("session").depends_on("keystore"),
            module("keystore"),
        ]);
        let plan = resolve(&entries, &seeded(&["SEED"])).expect("resolves");
        assert_eq!(plan.setup_order(), ["keystore", "session", "scanner"]);
    }

    #[test]
    fn missing_dependency_is_unresolved() {
        let entries = registry(vec![module("scanner").watches("SEED").depends_on("ghost")]);
        assert_eq!(
            resolve(&entries, &seeded(&["SEED"])).expect_err("unresolved"),
            ResolutionError::UnresolvedDependency { module: "scanner".into(), dependency: "ghost".into() }
        );
    }

    #[test]
    fn exclusion_drops_everything_only_reachable_through_it() {
        let entries = registry(vec![
            module("x").watches("SEED").produces("ALPHA"),
            module("y").watches("ALPHA").produces("BETA"),
            module("w").watches("BETA"),
            module("v").watches("SEED").depends_on("x"),
        ]);
        let mut selection = seeded(&["SEED"]);
        selection.exclude.insert("x".into());
        let plan = resolve(&entries, &selection).expect("resolves");
        assert!(plan.is_empty(), "{:?}", ids(&plan));
    }

    #[test]
    fn excluding_an_inactive_dependency_drops_its_dependents() {
        let registry_ = Registry::new();
        for d in [
            module("session"),
            module("crawler").watches("SEED").depends_on("session"),
            module("bystander").watches("SEED"),
        ] {
            let id = d.id.clone();
            registry_.register(d, Arc::new(Idle)).expect("register");
            registry_.set_state(&id, LifecycleState::Active).expect("activate");
        }
        registry_.set_state("session", LifecycleState::Retired).expect("retire");
        let entries = registry_.list(&Default::default());

        let plan = resolve(&entries, &seeded(&["SEED"])).expect("retired dependency prunes");
        assert_eq!(ids(&plan), vec!["bystander"]);

        let mut selection = seeded(&["SEED"]);
        selection.exclude.insert("session".into());
        let plan = resolve(&entries, &selection).expect("excluded dependency prunes");
        assert_eq!(ids(&plan), vec!["bystander"]);
    }

    #[test]
    fn includes_activate_modules_without_seed_watchers() {
        let entries = registry(vec![module("manual").produces("ALPHA"), module("y").watches("ALPHA")]);
        let mut selection = seeded(&["SEED"]);
        selection.include.insert("manual".into());
        let plan = resolve(&entries, &selection).expect("resolves");
        assert_eq!(ids(&plan), vec!["manual", "y"]);
    }

    #[test]
    fn unknown_include_is_fatal() {
        let entries = registry(vec![module("x").watches("SEED")]);
        let mut selection = seeded(&["SEED"]);
        selection.include.insert("nope".into());
        assert!(matches!(resolve(&entries, &selection), Err(ResolutionError::UnknownModule { .. })));
    }

    #[test]
    fn wildcard_watchers_join_any_scan() {
        let entries = registry(vec![module("sink").watches("*"), module("x").watches("SEED").produces("ALPHA")]);
        let plan = resolve(&entries, &seeded(&["SEED"])).expect("resolves");
        assert_eq!(ids(&plan), vec!["sink", "x"]);
        let alpha: Vec<_> = plan.consumers_of(&EventType::from("ALPHA")).collect();
        assert_eq!(alpha, vec!["sink"]);
    }

    #[test]
    fn wanted_types_narrow_to_contributing_modules() {
        let entries = registry(vec![
            module("names").watches("SEED").produces("INTERNET_NAME"),
            module("resolve").watches("INTERNET_NAME").produces("IP_ADDRESS"),
            module("ports").watches("IP_ADDRESS").produces("TCP_PORT_OPEN"),
            module("emails").watches("SEED").produces("EMAILADDR"),
        ]);
        let mut selection = seeded(&["SEED"]);
        selection.wanted_types.insert("IP_ADDRESS".into());
        let plan = resolve(&entries, &selection).expect("resolves");
        assert_eq!(ids(&plan), vec!["names", "resolve"]);
    }

    #[test]
    fn non_active_entries_are_not_candidates() {
        let registry_ = Registry::new();
        registry_
            .register(module("x").watches("SEED"), Arc::new(Idle))
            .expect("register");
        let plan = resolve(&registry_.list(&Default::default()), &seeded(&["SEED"])).expect("resolves");
        assert!(plan.is_empty());
    }

    #[rstest]
    #[case(OptionValue::Int(3), true)]
    #[case(OptionValue::Text("3".into()), false)]
    fn option_overrides_are_type_checked(#[case] value: OptionValue, #[case] accepted: bool) {
        let entries = registry(vec![module("x").watches("SEED").option("depth", 1_i64, "Recursion depth.")]);
        let mut selection = seeded(&["SEED"]);
        selection
            .module_options
            .insert("x".into(), BTreeMap::from([("depth".to_string(), value.clone())]));
        match resolve(&entries, &selection) {
            Ok(plan) => {
                assert!(accepted);
                assert_eq!(plan.options("x")["depth"], value);
            }
            Err(err) => {
                assert!(!accepted);
                assert!(matches!(err, ResolutionError::InvalidOption { .. }));
            }
        }
    }

    #[test]
    fn no_seeds_and_no_includes_is_an_error() {
        let entries = registry(vec![module("x").watches("SEED")]);
        assert_eq!(resolve(&entries, &Selection::default()).expect_err("empty"), ResolutionError::NoSeedTypes);
    }

    #[test]
    fn plan_keeps_the_seed_types() {
        let entries = registry(vec![module("x").watches("SEED")]);
        let plan = resolve(&entries, &seeded(&["ROOT", "SEED"])).expect("resolves");
        let seeds: Vec<_> = plan.seed_types().iter().map(EventType::as_str).collect();
        assert_eq!(seeds, vec!["ROOT", "SEED"]);
    }

    #[test]
    fn dependents_are_found_transitively() {
        let entries = registry(vec![
            module("scanner").watches("SEED").depends_on("session"),
            module("session").depends_on("keystore"),
            module("keystore"),
        ]);
        let plan = resolve(&entries, &seeded(&["SEED"])).expect("resolves");
        let dependents = plan.dependents_of("keystore");
        assert_eq!(dependents.into_iter().collect::<Vec<_>>(), vec!["scanner", "session"]);
    }
}
