//! Key-based (seek) pagination.
//!
//! [`paginate`] rewrites a select so that it orders by a key definition,
//! projects the key tuple next to the selected entity, and, when continuing
//! from a boundary row, restricts to rows strictly past that row in key
//! order.

use std::sync::Arc;

use crate::tree::{
    ComparisonOp, Expression, Predicate, SelectStatement, Selection, SortDirection,
    SortSpecification,
};
use crate::types::{PlanError, Result, Value};

/// One key column of a key definition.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyOrder {
    /// Key attribute of the selected entity.
    pub attribute: Arc<str>,
    /// Sort direction.
    pub direction: SortDirection,
}

impl KeyOrder {
    /// Ascending key.
    pub fn asc(attribute: &str) -> Self {
        Self {
            attribute: Arc::from(attribute),
            direction: SortDirection::Ascending,
        }
    }

    /// Descending key.
    pub fn desc(attribute: &str) -> Self {
        Self {
            attribute: Arc::from(attribute),
            direction: SortDirection::Descending,
        }
    }
}

/// Ordered key over one entity. The keys must identify rows uniquely.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyDefinition {
    entity: Arc<str>,
    keys: Vec<KeyOrder>,
}

impl KeyDefinition {
    /// Creates a key definition; at least one key is required.
    pub fn new(entity: &str, keys: Vec<KeyOrder>) -> Result<Self> {
        if keys.is_empty() {
            return Err(PlanError::invalid("key definition without key columns"));
        }
        Ok(Self {
            entity: Arc::from(entity),
            keys,
        })
    }

    /// Entity the keys belong to.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Keys in significance order.
    pub fn keys(&self) -> &[KeyOrder] {
        &self.keys
    }

    /// The same keys with every direction flipped.
    pub fn reversed(&self) -> Self {
        Self {
            entity: self.entity.clone(),
            keys: self
                .keys
                .iter()
                .map(|key| KeyOrder {
                    attribute: key.attribute.clone(),
                    direction: key.direction.reverse(),
                })
                .collect(),
        }
    }
}

/// Rewrites `select` for key-based pagination.
///
/// The select must have a single selection item naming its entity root, and
/// that entity must be the one `definition` is declared for. With `key`, the
/// restriction gains a predicate matching rows strictly after the boundary.
pub fn paginate(
    definition: &KeyDefinition,
    key: Option<&[Value]>,
    select: &SelectStatement,
) -> Result<SelectStatement> {
    if select.selections.len() != 1 {
        return Err(PlanError::MultipleSelections {
            count: select.selections.len(),
        });
    }
    let alias = match &select.selections[0] {
        Selection::Entity(alias) if *alias == select.from.alias => alias.clone(),
        _ => return Err(PlanError::NonEntitySelection),
    };
    if select.from.entity.as_ref() != definition.entity() {
        return Err(PlanError::WrongEntityType {
            expected: definition.entity().to_owned(),
            found: select.from.entity.to_string(),
        });
    }
    if let Some(values) = key {
        if values.len() != definition.keys.len() {
            return Err(PlanError::KeyArity {
                expected: definition.keys.len(),
                found: values.len(),
            });
        }
        if let Some(index) = values.iter().position(Value::is_null) {
            return Err(PlanError::NullKey { index });
        }
    }

    let paths: Vec<Expression> = definition
        .keys
        .iter()
        .map(|order| Expression::path(&alias, &order.attribute))
        .collect();
    let mut rewritten = select.clone();
    rewritten.order_by = definition
        .keys
        .iter()
        .zip(&paths)
        .map(|(order, path)| SortSpecification {
            expression: path.clone(),
            direction: order.direction,
        })
        .collect();
    rewritten.selections = vec![Selection::Keyed {
        selection: Box::new(Selection::Entity(alias)),
        key: paths.clone(),
    }];
    if let Some(values) = key {
        let seek = seek_predicate(&definition.keys, &paths, values);
        rewritten.restriction = Some(Predicate::conjoin(rewritten.restriction.take(), seek));
    }
    Ok(rewritten)
}

// (k0 past v0) OR (k0 = v0 AND k1 past v1) OR ...
fn seek_predicate(keys: &[KeyOrder], paths: &[Expression], values: &[Value]) -> Predicate {
    let mut clauses = Vec::with_capacity(keys.len());
    for (i, order) in keys.iter().enumerate() {
        let mut parts = Vec::with_capacity(i + 1);
        for j in 0..i {
            parts.push(Predicate::eq(
                paths[j].clone(),
                Expression::Literal(values[j].clone()),
            ));
        }
        let op = match order.direction {
            SortDirection::Ascending => ComparisonOp::Gt,
            SortDirection::Descending => ComparisonOp::Lt,
        };
        parts.push(Predicate::compare(
            paths[i].clone(),
            op,
            Expression::Literal(values[i].clone()),
        ));
        clauses.push(Predicate::and(parts));
    }
    if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        Predicate::Or(clauses)
    }
}

/// A result paired with its key tuple.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedResult<R> {
    /// The selected value.
    pub result: R,
    /// Key values in key-definition order.
    pub key: Vec<Value>,
}

/// How the key of a [`KeyedPage`] relates to the page.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum KeyInterpretation {
    /// First page; no key.
    #[default]
    NoKey,
    /// The key is that of the last row of the previous page.
    KeyOfLastOnPreviousPage,
    /// The key is that of the first row of the next page.
    KeyOfFirstOnNextPage,
}

/// Page size and number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Page {
    size: u32,
    number: u32,
}

impl Page {
    /// Page `number` (zero-based) of `size` rows.
    pub fn new(size: u32, number: u32) -> Result<Self> {
        if size == 0 {
            return Err(PlanError::invalid("page size must be positive"));
        }
        Ok(Self { size, number })
    }

    /// First page of `size` rows.
    pub fn first(size: u32) -> Result<Self> {
        Self::new(size, 0)
    }

    /// Rows per page.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Zero-based page number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Returns `true` for page zero.
    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    /// Offset of the first row.
    pub fn first_row(&self) -> u64 {
        u64::from(self.size) * u64::from(self.number)
    }

    /// Following page.
    pub fn next(&self) -> Self {
        Self {
            size: self.size,
            number: self.number.saturating_add(1),
        }
    }

    /// Preceding page, `None` on the first page.
    pub fn previous(&self) -> Option<Self> {
        (!self.is_first()).then(|| Self {
            size: self.size,
            number: self.number - 1,
        })
    }
}

/// A page addressed by key rather than offset.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedPage {
    definition: Arc<KeyDefinition>,
    page: Page,
    key: Option<Vec<Value>>,
    interpretation: KeyInterpretation,
}

impl KeyedPage {
    /// First page under `definition`.
    pub fn first(definition: KeyDefinition, size: u32) -> Result<Self> {
        Ok(Self {
            definition: Arc::new(definition),
            page: Page::first(size)?,
            key: None,
            interpretation: KeyInterpretation::NoKey,
        })
    }

    /// Key definition.
    pub fn definition(&self) -> &KeyDefinition {
        &self.definition
    }

    /// Page size and number.
    pub fn page(&self) -> Page {
        self.page
    }

    /// Boundary key.
    pub fn key(&self) -> Option<&[Value]> {
        self.key.as_deref()
    }

    /// Meaning of the boundary key.
    pub fn interpretation(&self) -> KeyInterpretation {
        self.interpretation
    }

    /// Page following this one, starting after `key_of_last`.
    pub fn next_page(&self, key_of_last: Vec<Value>) -> Self {
        Self {
            definition: Arc::clone(&self.definition),
            page: self.page.next(),
            key: Some(key_of_last),
            interpretation: KeyInterpretation::KeyOfLastOnPreviousPage,
        }
    }

    /// Page preceding this one, ending before `key_of_first`; `None` on the
    /// first page.
    pub fn previous_page(&self, key_of_first: Vec<Value>) -> Option<Self> {
        Some(Self {
            definition: Arc::clone(&self.definition),
            page: self.page.previous()?,
            key: Some(key_of_first),
            interpretation: KeyInterpretation::KeyOfFirstOnNextPage,
        })
    }

    /// Key definition used for the rewrite; reversed when walking backwards.
    pub fn effective_definition(&self) -> KeyDefinition {
        match self.interpretation {
            KeyInterpretation::KeyOfFirstOnNextPage => self.definition.reversed(),
            _ => self.definition.as_ref().clone(),
        }
    }

    /// Rows skipped by offset; only applied when no key is present.
    pub fn first_row(&self) -> Option<u64> {
        match self.key {
            None => Some(self.page.first_row()),
            Some(_) => None,
        }
    }

    /// Rows fetched per execution: one extra row detects a following page.
    pub fn fetch_size(&self) -> u64 {
        u64::from(self.page.size) + 1
    }
}

/// One page of keyed results with navigation to its neighbours.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedResultList<R> {
    results: Vec<R>,
    keys: Vec<Vec<Value>>,
    page: KeyedPage,
    next_page: Option<KeyedPage>,
    previous_page: Option<KeyedPage>,
}

impl<R> KeyedResultList<R> {
    /// Builds the page from up to `size + 1` executed rows.
    ///
    /// Rows of a backwards page arrive in reverse order and are flipped back,
    /// keys included, so both lists follow the key definition's order.
    pub fn from_executed(executed: Vec<KeyedResult<R>>, page: KeyedPage) -> Self {
        let size = page.page.size as usize;
        let has_more = executed.len() > size;
        let backwards = page.interpretation == KeyInterpretation::KeyOfFirstOnNextPage;

        let first_key = executed.first().map(|row| row.key.clone());
        let boundary_key = if has_more {
            Some(executed[size - 1].key.clone())
        } else {
            None
        };
        let (next_page, previous_page) = if backwards {
            (
                first_key.map(|key| page.next_page(key)),
                boundary_key.and_then(|key| page.previous_page(key)),
            )
        } else {
            (
                boundary_key.map(|key| page.next_page(key)),
                first_key.and_then(|key| page.previous_page(key)),
            )
        };

        let mut results = Vec::with_capacity(size.min(executed.len()));
        let mut keys = Vec::with_capacity(size.min(executed.len()));
        for row in executed.into_iter().take(size) {
            results.push(row.result);
            keys.push(row.key);
        }
        if backwards {
            results.reverse();
            keys.reverse();
        }
        Self {
            results,
            keys,
            page,
            next_page,
            previous_page,
        }
    }

    /// Results of this page.
    pub fn results(&self) -> &[R] {
        &self.results
    }

    /// Consumes the list, returning the results.
    pub fn into_results(self) -> Vec<R> {
        self.results
    }

    /// Key of each result.
    pub fn keys(&self) -> &[Vec<Value>] {
        &self.keys
    }

    /// The page that produced these results.
    pub fn page(&self) -> &KeyedPage {
        &self.page
    }

    /// Following page, `None` when this is the last one.
    pub fn next_page(&self) -> Option<&KeyedPage> {
        self.next_page.as_ref()
    }

    /// Preceding page, `None` on the first page.
    pub fn previous_page(&self) -> Option<&KeyedPage> {
        self.previous_page.as_ref()
    }

    /// Returns `true` when no page follows.
    pub fn is_last_page(&self) -> bool {
        self.next_page.is_none()
    }

    /// Returns `true` on page zero.
    pub fn is_first_page(&self) -> bool {
        self.page.page.is_first()
    }
}
