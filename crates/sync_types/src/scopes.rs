//! Scope dimensions and the coverage algebra used for change fan-out.
//!
//! A change carries a concrete [`ScopeMap`] (dimension → value). A
//! subscription declares a [`ScopeSelector`] (dimension → value set or `*`).
//! The resolver intersects the selector with the actor's authorized
//! selector; a change is delivered iff every tag on the change is covered by
//! the intersected selector.

use std::collections::{
    BTreeMap,
    BTreeSet,
};

use serde::{
    Deserialize,
    Serialize,
};

/// Named scope dimension, e.g. `user_id` or `project_id`.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct ScopeDimension(String);

impl ScopeDimension {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScopeDimension {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ScopeDimension {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Concrete value within a scope dimension.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct ScopeValue(String);

impl ScopeValue {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScopeValue {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ScopeValue {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Concrete scope tags on a change or row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeMap(BTreeMap<ScopeDimension, ScopeValue>);

impl ScopeMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, dimension: impl Into<ScopeDimension>, value: impl Into<ScopeValue>) {
        self.0.insert(dimension.into(), value.into());
    }

    pub fn get(&self, dimension: &ScopeDimension) -> Option<&ScopeValue> {
        self.0.get(dimension)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ScopeDimension, &ScopeValue)> {
        self.0.iter()
    }

    pub fn contains_value(&self, value: &ScopeValue) -> bool {
        self.0.values().any(|v| v == value)
    }
}

impl FromIterator<(ScopeDimension, ScopeValue)> for ScopeMap {
    fn from_iter<T: IntoIterator<Item = (ScopeDimension, ScopeValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Declared values for one dimension of a subscription: either every
/// accessible value (`*` on the wire) or an explicit set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScopeValues {
    Any,
    Values(BTreeSet<ScopeValue>),
}

impl ScopeValues {
    pub fn one(value: impl Into<ScopeValue>) -> Self {
        Self::Values(BTreeSet::from([value.into()]))
    }

    pub fn covers(&self, value: &ScopeValue) -> bool {
        match self {
            ScopeValues::Any => true,
            ScopeValues::Values(values) => values.contains(value),
        }
    }

    fn intersect(&self, other: &ScopeValues) -> ScopeValues {
        match (self, other) {
            (ScopeValues::Any, other) => other.clone(),
            (this, ScopeValues::Any) => this.clone(),
            (ScopeValues::Values(a), ScopeValues::Values(b)) => {
                ScopeValues::Values(a.intersection(b).cloned().collect())
            },
        }
    }
}

// `*` on the wire means "all accessible values"; anything else is a single
// value or a list of values.
impl Serialize for ScopeValues {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ScopeValues::Any => serializer.serialize_str("*"),
            ScopeValues::Values(values) if values.len() == 1 => {
                values.iter().next().unwrap().serialize(serializer)
            },
            ScopeValues::Values(values) => values.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ScopeValues {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(BTreeSet<String>),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::One(s) if s == "*" => ScopeValues::Any,
            Repr::One(s) => ScopeValues::Values(BTreeSet::from([ScopeValue::from(s)])),
            Repr::Many(values) => {
                ScopeValues::Values(values.into_iter().map(ScopeValue::from).collect())
            },
        })
    }
}

/// Mapping from dimension to declared values. Used both for subscription
/// declarations and for an actor's resolved (authorized) scope set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSelector(BTreeMap<ScopeDimension, ScopeValues>);

impl ScopeSelector {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, dimension: impl Into<ScopeDimension>, values: ScopeValues) {
        self.0.insert(dimension.into(), values);
    }

    pub fn with(mut self, dimension: impl Into<ScopeDimension>, values: ScopeValues) -> Self {
        self.insert(dimension, values);
        self
    }

    pub fn get(&self, dimension: &ScopeDimension) -> Option<&ScopeValues> {
        self.0.get(dimension)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ScopeDimension, &ScopeValues)> {
        self.0.iter()
    }

    /// Intersect a declared selector with the actor's authorized selector.
    /// Dimensions the authorized side does not mention are dropped: an actor
    /// with no resolution for a dimension sees nothing tagged with it.
    pub fn intersect(&self, authorized: &ScopeSelector) -> ScopeSelector {
        let mut out = BTreeMap::new();
        for (dimension, declared) in &self.0 {
            if let Some(granted) = authorized.0.get(dimension) {
                out.insert(dimension.clone(), declared.intersect(granted));
            }
        }
        ScopeSelector(out)
    }

    /// Whether a change tagged with `scopes` is visible through this
    /// selector: every tag on the change must be covered per dimension.
    pub fn covers(&self, scopes: &ScopeMap) -> bool {
        scopes.iter().all(|(dimension, value)| {
            self.0
                .get(dimension)
                .map(|values| values.covers(value))
                .unwrap_or(false)
        })
    }

    /// Deterministic cache key for the concrete scope set this selector
    /// serves, used to key snapshot chunk pages.
    pub fn scope_key(&self) -> String {
        let mut parts = Vec::with_capacity(self.0.len());
        for (dimension, values) in &self.0 {
            let rendered = match values {
                ScopeValues::Any => "*".to_owned(),
                ScopeValues::Values(values) => {
                    let values: Vec<_> = values.iter().map(|v| v.as_str()).collect();
                    values.join("|")
                },
            };
            parts.push(format!("{dimension}={rendered}"));
        }
        parts.join("&")
    }

    /// Whether this selector serves anything at all. An explicit empty value
    /// set on any dimension means the intersection is vacuous.
    pub fn is_vacuous(&self) -> bool {
        self.0
            .values()
            .any(|v| matches!(v, ScopeValues::Values(values) if values.is_empty()))
    }
}

impl FromIterator<(ScopeDimension, ScopeValues)> for ScopeSelector {
    fn from_iter<T: IntoIterator<Item = (ScopeDimension, ScopeValues)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// How an effective selector moved between two pulls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScopeChange {
    Unchanged,
    /// Something previously served is no longer covered. The client must
    /// resync.
    Contracted,
    /// Strictly more is covered. When exactly one dimension grew by an
    /// enumerable value set, the payload is the delta selector to bootstrap;
    /// otherwise `None` and the subscription resyncs in full.
    Widened(Option<ScopeSelector>),
}

impl ScopeValues {
    fn is_subset_of(&self, other: &ScopeValues) -> bool {
        match (self, other) {
            (_, ScopeValues::Any) => true,
            (ScopeValues::Any, ScopeValues::Values(_)) => false,
            (ScopeValues::Values(a), ScopeValues::Values(b)) => a.is_subset(b),
        }
    }
}

impl ScopeSelector {
    /// Whether every change visible through `self` is visible through
    /// `other`. A selector's unmentioned dimensions block tagged changes, so
    /// containment requires `other` to mention every dimension of `self`
    /// with at least the same values.
    pub fn is_subset_of(&self, other: &ScopeSelector) -> bool {
        self.0.iter().all(|(dimension, values)| {
            other
                .0
                .get(dimension)
                .map(|granted| values.is_subset_of(granted))
                .unwrap_or(false)
        })
    }

    /// Classify the movement from `old` to `new`.
    pub fn change_from(old: &ScopeSelector, new: &ScopeSelector) -> ScopeChange {
        if old == new {
            return ScopeChange::Unchanged;
        }
        if !old.is_subset_of(new) {
            return ScopeChange::Contracted;
        }
        // Pure widening. Enumerable single-dimension growth gets a delta.
        let mut grown: Vec<(&ScopeDimension, &ScopeValues, &ScopeValues)> = Vec::new();
        for (dimension, new_values) in &new.0 {
            match old.0.get(dimension) {
                Some(old_values) if old_values == new_values => {},
                Some(old_values) => grown.push((dimension, old_values, new_values)),
                // A dimension old never mentioned covers rows old never
                // served; treat as growth from the empty set.
                None => grown.push((dimension, &EMPTY_VALUES, new_values)),
            }
        }
        if let [(dimension, old_values, new_values)] = grown[..] {
            if let (ScopeValues::Values(old_set), ScopeValues::Values(new_set)) =
                (old_values, new_values)
            {
                let added: BTreeSet<ScopeValue> =
                    new_set.difference(old_set).cloned().collect();
                let mut delta = new.clone();
                delta.insert(dimension.clone(), ScopeValues::Values(added));
                return ScopeChange::Widened(Some(delta));
            }
        }
        ScopeChange::Widened(None)
    }
}

static EMPTY_VALUES: ScopeValues = ScopeValues::Values(BTreeSet::new());
