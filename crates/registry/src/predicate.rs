use std::sync::Arc;

use keel_core::{Selector, Set};

/// Projects an object onto its queryable `(labels, fields)`.
pub type AttrFn<T> = Arc<dyn Fn(&T) -> (Set, Set) + Send + Sync>;

/// Label + field selector pair evaluated against an attribute projection.
pub struct SelectionPredicate<T> {
    pub label: Selector,
    pub field: Selector,
    pub get_attrs: AttrFn<T>,
}

impl<T> Clone for SelectionPredicate<T> {
    fn clone(&self) -> Self {
        Self { label: self.label.clone(), field: self.field.clone(), get_attrs: Arc::clone(&self.get_attrs) }
    }
}

impl<T> SelectionPredicate<T> {
    pub fn new(label: Selector, field: Selector, get_attrs: AttrFn<T>) -> Self {
        Self { label, field, get_attrs }
    }

    pub fn everything(get_attrs: AttrFn<T>) -> Self {
        Self::new(Selector::everything(), Selector::everything(), get_attrs)
    }

    /// True when no selector constrains anything.
    pub fn is_empty(&self) -> bool {
        self.label.is_empty() && self.field.is_empty()
    }

    pub fn matches(&self, obj: &T) -> bool {
        if self.is_empty() {
            return true;
        }
        let (labels, fields) = (self.get_attrs)(obj);
        self.label.matches(&labels) && self.field.matches(&fields)
    }
}
