// Event-emitting storage decorator

use std::collections::HashMap;

use tracing::debug;

use super::{
    AccessModifierRow, Constant, FunctionLike, Import, IndexStats, MetaStaticMethodType,
    NamespaceBlock, NewConstant, NewFunction, NewImport, NewNamespace, NewProperty, NewStructure,
    Result, SourceFile, Storage, Structure, StructureTypeRow, TraitAlias, TraitPrecedence,
};

/// The invalidation events downstream caches subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NamespaceUpdated,
    NamespaceRemoved,
    ImportInserted,
    ConstantUpdated,
    ConstantRemoved,
    FunctionUpdated,
    FunctionRemoved,
    StructureUpdated,
    StructureRemoved,
}

/// A fired invalidation event. `identity` is the FQCN for structures,
/// functions, and constants where one exists, and a file-scoped key
/// otherwise; consumers drop memoized results keyed on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEvent {
    pub kind: EventKind,
    pub identity: String,
}

type Listener = Box<dyn Fn(&IndexEvent) + Send>;

/// Wraps a storage engine transparently for reads and schedules one
/// invalidation event per `(kind, identity)` pair for every entity
/// persisted or deleted inside the open transaction. Repeated persists
/// of the same entity collapse to a single notification. On commit all
/// scheduled events fire and the schedule is cleared; on rollback the
/// schedule is discarded without firing.
pub struct EventedStorage<S: Storage> {
    inner: S,
    scheduled: Vec<IndexEvent>,
    listeners: HashMap<EventKind, Vec<Listener>>,
}

impl<S: Storage> EventedStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            scheduled: Vec::new(),
            listeners: HashMap::new(),
        }
    }

    /// Register a callback for one event kind.
    pub fn subscribe(&mut self, kind: EventKind, listener: impl Fn(&IndexEvent) + Send + 'static) {
        self.listeners.entry(kind).or_default().push(Box::new(listener));
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn schedule(&mut self, kind: EventKind, identity: String) {
        let event = IndexEvent { kind, identity };
        if !self.scheduled.contains(&event) {
            self.scheduled.push(event);
        }
    }

    fn fire_scheduled(&mut self) {
        let events = std::mem::take(&mut self.scheduled);
        for event in &events {
            debug!("Firing index event {:?} for {}", event.kind, event.identity);
            if let Some(listeners) = self.listeners.get(&event.kind) {
                for listener in listeners {
                    listener(event);
                }
            }
        }
    }

    /// Schedule removal events for everything the file owns. Runs before
    /// the delegated delete so the owned set can still be read.
    fn schedule_removals_for_file(&mut self, file_id: i64) -> Result<()> {
        for structure in self.inner.structures_in_file(file_id)? {
            self.schedule(EventKind::StructureRemoved, structure.fqcn);
        }
        for function in self.inner.functions_in_file(file_id)? {
            // Methods disappear with their structure; only free functions
            // carry their own identity.
            if function.structure_id.is_none() {
                let identity = function.fqcn.unwrap_or(function.name);
                self.schedule(EventKind::FunctionRemoved, identity);
            }
        }
        for constant in self.inner.constants_in_file(file_id)? {
            if constant.structure_id.is_none() {
                let identity = constant.fqcn.unwrap_or(constant.name);
                self.schedule(EventKind::ConstantRemoved, identity);
            }
        }
        for namespace in self.inner.namespaces_in_file(file_id)? {
            self.schedule(
                EventKind::NamespaceRemoved,
                namespace_identity(file_id, namespace.name.as_deref()),
            );
        }
        Ok(())
    }
}

fn namespace_identity(file_id: i64, name: Option<&str>) -> String {
    format!("file#{file_id}:{}", name.unwrap_or("\\"))
}

impl<S: Storage> Storage for EventedStorage<S> {
    fn begin_transaction(&mut self) -> Result<()> {
        self.scheduled.clear();
        self.inner.begin_transaction()
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.inner.commit_transaction()?;
        self.fire_scheduled();
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        self.inner.rollback_transaction()?;
        self.scheduled.clear();
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    fn upsert_file(
        &mut self,
        uri: &str,
        last_indexed: i64,
        source_hash: Option<&str>,
    ) -> Result<i64> {
        self.inner.upsert_file(uri, last_indexed, source_hash)
    }

    fn set_file_source_hash(&mut self, file_id: i64, hash: &str) -> Result<()> {
        self.inner.set_file_source_hash(file_id, hash)
    }

    fn file_by_uri(&self, uri: &str) -> Result<SourceFile> {
        self.inner.file_by_uri(uri)
    }

    fn file_by_id(&self, id: i64) -> Result<SourceFile> {
        self.inner.file_by_id(id)
    }

    fn files(&self) -> Result<Vec<SourceFile>> {
        self.inner.files()
    }

    fn delete_file(&mut self, file_id: i64) -> Result<()> {
        self.schedule_removals_for_file(file_id)?;
        self.inner.delete_file(file_id)
    }

    fn delete_file_entities(&mut self, file_id: i64) -> Result<()> {
        self.schedule_removals_for_file(file_id)?;
        self.inner.delete_file_entities(file_id)
    }

    fn access_modifiers(&self) -> Result<Vec<AccessModifierRow>> {
        self.inner.access_modifiers()
    }

    fn structure_types(&self) -> Result<Vec<StructureTypeRow>> {
        self.inner.structure_types()
    }

    fn insert_namespace(&mut self, ns: &NewNamespace) -> Result<i64> {
        let id = self.inner.insert_namespace(ns)?;
        self.schedule(
            EventKind::NamespaceUpdated,
            namespace_identity(ns.file_id, ns.name.as_deref()),
        );
        Ok(id)
    }

    fn namespaces_in_file(&self, file_id: i64) -> Result<Vec<NamespaceBlock>> {
        self.inner.namespaces_in_file(file_id)
    }

    fn insert_import(&mut self, import: &NewImport) -> Result<i64> {
        let id = self.inner.insert_import(import)?;
        self.schedule(
            EventKind::ImportInserted,
            format!("ns#{}:{}", import.namespace_id, import.alias),
        );
        Ok(id)
    }

    fn imports_in_namespace(&self, namespace_id: i64) -> Result<Vec<Import>> {
        self.inner.imports_in_namespace(namespace_id)
    }

    fn insert_structure(&mut self, s: &NewStructure) -> Result<i64> {
        let id = self.inner.insert_structure(s)?;
        self.schedule(EventKind::StructureUpdated, s.fqcn.clone());
        Ok(id)
    }

    fn structure_by_fqcn(&self, fqcn: &str) -> Result<Structure> {
        self.inner.structure_by_fqcn(fqcn)
    }

    fn structures_in_file(&self, file_id: i64) -> Result<Vec<Structure>> {
        self.inner.structures_in_file(file_id)
    }

    fn add_structure_parent(&mut self, structure_id: i64, parent_fqcn: &str) -> Result<()> {
        self.inner.add_structure_parent(structure_id, parent_fqcn)
    }

    fn add_structure_interface(&mut self, structure_id: i64, interface_fqcn: &str) -> Result<()> {
        self.inner.add_structure_interface(structure_id, interface_fqcn)
    }

    fn add_structure_trait(&mut self, structure_id: i64, trait_fqcn: &str) -> Result<()> {
        self.inner.add_structure_trait(structure_id, trait_fqcn)
    }

    fn add_trait_alias(&mut self, alias: &TraitAlias) -> Result<()> {
        self.inner.add_trait_alias(alias)
    }

    fn add_trait_precedence(&mut self, precedence: &TraitPrecedence) -> Result<()> {
        self.inner.add_trait_precedence(precedence)
    }

    fn structure_parents(&self, structure_id: i64) -> Result<Vec<String>> {
        self.inner.structure_parents(structure_id)
    }

    fn structure_interfaces(&self, structure_id: i64) -> Result<Vec<String>> {
        self.inner.structure_interfaces(structure_id)
    }

    fn structure_traits(&self, structure_id: i64) -> Result<Vec<String>> {
        self.inner.structure_traits(structure_id)
    }

    fn trait_aliases(&self, structure_id: i64) -> Result<Vec<TraitAlias>> {
        self.inner.trait_aliases(structure_id)
    }

    fn trait_precedences(&self, structure_id: i64) -> Result<Vec<TraitPrecedence>> {
        self.inner.trait_precedences(structure_id)
    }

    fn child_structures_of(&self, fqcn: &str) -> Result<Vec<Structure>> {
        self.inner.child_structures_of(fqcn)
    }

    fn insert_function(&mut self, f: &NewFunction) -> Result<i64> {
        let id = self.inner.insert_function(f)?;
        let identity = f
            .fqcn
            .clone()
            .unwrap_or_else(|| format!("file#{}::{}", f.file_id, f.name));
        self.schedule(EventKind::FunctionUpdated, identity);
        Ok(id)
    }

    fn functions_in_file(&self, file_id: i64) -> Result<Vec<FunctionLike>> {
        self.inner.functions_in_file(file_id)
    }

    fn methods_of_structure(&self, structure_id: i64) -> Result<Vec<FunctionLike>> {
        self.inner.methods_of_structure(structure_id)
    }

    fn insert_property(&mut self, p: &NewProperty) -> Result<i64> {
        self.inner.insert_property(p)
    }

    fn properties_of_structure(&self, structure_id: i64) -> Result<Vec<super::Property>> {
        self.inner.properties_of_structure(structure_id)
    }

    fn insert_constant(&mut self, c: &NewConstant) -> Result<i64> {
        let id = self.inner.insert_constant(c)?;
        let identity = c
            .fqcn
            .clone()
            .unwrap_or_else(|| format!("file#{}::{}", c.file_id, c.name));
        self.schedule(EventKind::ConstantUpdated, identity);
        Ok(id)
    }

    fn constants_of_structure(&self, structure_id: i64) -> Result<Vec<Constant>> {
        self.inner.constants_of_structure(structure_id)
    }

    fn constants_in_file(&self, file_id: i64) -> Result<Vec<Constant>> {
        self.inner.constants_in_file(file_id)
    }

    fn add_meta_static_method_type(&mut self, m: &MetaStaticMethodType) -> Result<()> {
        self.inner.add_meta_static_method_type(m)
    }

    fn meta_static_method_types(
        &self,
        fqcn: &str,
        method: &str,
    ) -> Result<Vec<MetaStaticMethodType>> {
        self.inner.meta_static_method_types(fqcn, method)
    }

    fn stats(&self) -> Result<IndexStats> {
        self.inner.stats()
    }
}
