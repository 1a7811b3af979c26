//! Mapping model: how entities map onto tables and columns.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::query::spi::MultiTableStrategy;
use crate::sql::SqlPredicate;
use crate::types::{PlanError, Result, Value};

/// A physical table backing part of an entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableMapping {
    /// Table name.
    pub name: Arc<str>,
    /// Primary key columns. Secondary tables join to the root on these, positionally.
    pub key_columns: Vec<Arc<str>>,
}

/// Column backing one attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeMapping {
    /// Attribute name.
    pub name: Arc<str>,
    /// Index into [`EntityDescriptor::tables`].
    pub table: usize,
    /// Column name in that table.
    pub column: Arc<str>,
}

/// Column flipped instead of physically deleting rows.
#[derive(Clone, Debug, PartialEq)]
pub struct SoftDeleteMapping {
    /// Indicator column on the root table.
    pub column: Arc<str>,
    /// Literal written when a row is deleted.
    pub deleted_value: Value,
}

/// A collection-valued attribute stored in its own table.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectionTableMapping {
    /// Collection attribute name.
    pub attribute: Arc<str>,
    /// Collection table name.
    pub table: Arc<str>,
    /// Foreign key columns in the collection table.
    pub key_columns: Vec<Arc<str>>,
    /// Owner columns (root table) the foreign key refers to.
    pub owner_key_columns: Vec<Arc<str>>,
    /// Restriction always applied to the collection table.
    pub base_restriction: Option<SqlPredicate>,
}

/// Complete mapping of one concrete entity.
#[derive(Clone)]
pub struct EntityDescriptor {
    name: Arc<str>,
    tables: Vec<TableMapping>,
    attributes: IndexMap<Arc<str>, AttributeMapping>,
    id_attributes: Vec<Arc<str>>,
    soft_delete: Option<SoftDeleteMapping>,
    collection_tables: Vec<CollectionTableMapping>,
    multi_table_strategy: Option<Arc<dyn MultiTableStrategy>>,
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("name", &self.name)
            .field("tables", &self.tables)
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .field("soft_delete", &self.soft_delete)
            .field("collection_tables", &self.collection_tables.len())
            .field("multi_table", &self.multi_table_strategy.is_some())
            .finish()
    }
}

impl EntityDescriptor {
    /// Starts a descriptor whose root table is `root_table`.
    pub fn builder(name: &str, root_table: &str, key_columns: &[&str]) -> EntityDescriptorBuilder {
        EntityDescriptorBuilder {
            descriptor: EntityDescriptor {
                name: Arc::from(name),
                tables: vec![TableMapping {
                    name: Arc::from(root_table),
                    key_columns: key_columns.iter().map(|c| Arc::from(*c)).collect(),
                }],
                attributes: IndexMap::new(),
                id_attributes: Vec::new(),
                soft_delete: None,
                collection_tables: Vec::new(),
                multi_table_strategy: None,
            },
        }
    }

    /// Entity name.
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Backing tables; the first is the root table.
    pub fn tables(&self) -> &[TableMapping] {
        &self.tables
    }

    /// Root table.
    pub fn root_table(&self) -> &TableMapping {
        &self.tables[0]
    }

    /// Returns `true` when the entity spans more than one table.
    pub fn is_multi_table(&self) -> bool {
        self.tables.len() > 1
    }

    /// Looks up an attribute mapping.
    pub fn attribute(&self, name: &str) -> Result<&AttributeMapping> {
        self.attributes
            .get(name)
            .ok_or_else(|| PlanError::UnknownAttribute {
                entity: self.name.to_string(),
                attribute: name.to_owned(),
            })
    }

    /// Attributes in declaration order.
    pub fn attributes(&self) -> impl Iterator<Item = &AttributeMapping> {
        self.attributes.values()
    }

    /// Identifier attributes.
    pub fn id_attributes(&self) -> &[Arc<str>] {
        &self.id_attributes
    }

    /// Soft-delete mapping, if any.
    pub fn soft_delete(&self) -> Option<&SoftDeleteMapping> {
        self.soft_delete.as_ref()
    }

    /// Collection tables in declaration order.
    pub fn collection_tables(&self) -> &[CollectionTableMapping] {
        &self.collection_tables
    }

    /// Strategy used to mutate this entity across its tables.
    pub fn multi_table_strategy(&self) -> Option<&Arc<dyn MultiTableStrategy>> {
        self.multi_table_strategy.as_ref()
    }
}

/// Builder for [`EntityDescriptor`].
pub struct EntityDescriptorBuilder {
    descriptor: EntityDescriptor,
}

impl EntityDescriptorBuilder {
    /// Adds a secondary table joined to the root on its key columns.
    pub fn secondary_table(mut self, name: &str, key_columns: &[&str]) -> Self {
        self.descriptor.tables.push(TableMapping {
            name: Arc::from(name),
            key_columns: key_columns.iter().map(|c| Arc::from(*c)).collect(),
        });
        self
    }

    /// Maps an attribute to a column of the table at `table`.
    pub fn attribute(mut self, name: &str, table: usize, column: &str) -> Self {
        let name: Arc<str> = Arc::from(name);
        self.descriptor.attributes.insert(
            name.clone(),
            AttributeMapping {
                name,
                table,
                column: Arc::from(column),
            },
        );
        self
    }

    /// Maps an identifier attribute to a root-table column.
    pub fn id(mut self, name: &str, column: &str) -> Self {
        self = self.attribute(name, 0, column);
        self.descriptor.id_attributes.push(Arc::from(name));
        self
    }

    /// Declares soft-delete semantics.
    pub fn soft_delete(mut self, column: &str, deleted_value: Value) -> Self {
        self.descriptor.soft_delete = Some(SoftDeleteMapping {
            column: Arc::from(column),
            deleted_value,
        });
        self
    }

    /// Declares a collection table.
    pub fn collection_table(mut self, mapping: CollectionTableMapping) -> Self {
        self.descriptor.collection_tables.push(mapping);
        self
    }

    /// Installs the multi-table mutation strategy.
    pub fn multi_table_strategy(mut self, strategy: Arc<dyn MultiTableStrategy>) -> Self {
        self.descriptor.multi_table_strategy = Some(strategy);
        self
    }

    /// Validates and finishes the descriptor.
    pub fn build(self) -> Result<EntityDescriptor> {
        let descriptor = self.descriptor;
        let table_count = descriptor.tables.len();
        let root_keys = descriptor.tables[0].key_columns.len();
        if root_keys == 0 {
            return Err(PlanError::invalid(format!(
                "entity '{}' root table has no key columns",
                descriptor.name
            )));
        }
        for table in &descriptor.tables[1..] {
            if table.key_columns.len() != root_keys {
                return Err(PlanError::invalid(format!(
                    "secondary table '{}' key arity differs from the root table",
                    table.name
                )));
            }
        }
        for attribute in descriptor.attributes.values() {
            if attribute.table >= table_count {
                return Err(PlanError::invalid(format!(
                    "attribute '{}' refers to table #{} of {table_count}",
                    attribute.name, attribute.table
                )));
            }
        }
        for collection in &descriptor.collection_tables {
            if collection.key_columns.len() != collection.owner_key_columns.len() {
                return Err(PlanError::invalid(format!(
                    "collection table '{}' key arity differs from its owner key",
                    collection.table
                )));
            }
        }
        Ok(descriptor)
    }
}

/// Source of entity mappings.
pub trait MappingModel: Send + Sync {
    /// Returns the descriptor of a concrete entity.
    fn entity(&self, name: &str) -> Option<Arc<EntityDescriptor>>;

    /// Returns the concrete entities a query against `name` must cover.
    fn implementors(&self, name: &str) -> Vec<Arc<str>>;

    /// Like [`MappingModel::entity`] but fails for unknown names.
    fn descriptor(&self, name: &str) -> Result<Arc<EntityDescriptor>> {
        self.entity(name).ok_or_else(|| PlanError::UnknownEntity {
            entity: name.to_owned(),
        })
    }
}

/// Mapping model assembled in memory.
#[derive(Default)]
pub struct InMemoryMappingModel {
    entities: FxHashMap<Arc<str>, Arc<EntityDescriptor>>,
    hierarchies: FxHashMap<Arc<str>, Vec<Arc<str>>>,
}

impl InMemoryMappingModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a concrete entity.
    pub fn with_entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.entities
            .insert(descriptor.name().clone(), Arc::new(descriptor));
        self
    }

    /// Registers an abstract (polymorphic) name covering the given concrete entities.
    pub fn with_hierarchy(mut self, name: &str, implementors: &[&str]) -> Self {
        self.hierarchies.insert(
            Arc::from(name),
            implementors.iter().map(|i| Arc::from(*i)).collect(),
        );
        self
    }
}

impl MappingModel for InMemoryMappingModel {
    fn entity(&self, name: &str) -> Option<Arc<EntityDescriptor>> {
        self.entities.get(name).cloned()
    }

    fn implementors(&self, name: &str) -> Vec<Arc<str>> {
        if let Some(list) = self.hierarchies.get(name) {
            return list.clone();
        }
        match self.entities.get_key_value(name) {
            Some((key, _)) => vec![key.clone()],
            None => Vec::new(),
        }
    }
}
