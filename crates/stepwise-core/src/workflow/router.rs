//! Conditional routing at branch points.
//!
//! A [`Router`] is a pure function of the job state that returns a label from
//! a finite, declared set. Each label maps to a target step; the mapping is
//! checked when the workflow graph is built, so only the label returned at
//! runtime can be wrong.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::state::StateBag;

type Decide = Arc<dyn Fn(&StateBag) -> String + Send + Sync>;

/// Errors raised while resolving a route.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("router '{router}' returned undeclared label '{label}'")]
    UndeclaredLabel { router: String, label: String },

    #[error("router '{router}' panicked")]
    Panicked { router: String },
}

/// Label-returning decision function plus its label -> step table.
#[derive(Clone)]
pub struct Router {
    name: String,
    routes: BTreeMap<String, String>,
    decide: Decide,
}

impl Router {
    pub fn new<F>(name: impl Into<String>, decide: F) -> Self
    where
        F: Fn(&StateBag) -> String + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            routes: BTreeMap::new(),
            decide: Arc::new(decide),
        }
    }

    /// Route on a boolean field: `true` -> `when_true`, otherwise `when_false`.
    pub fn on_flag(
        field: impl Into<String>,
        when_true: impl Into<String>,
        when_false: impl Into<String>,
    ) -> Self {
        let field = field.into();
        let name = format!("on_{field}");
        Router::new(name, move |state| {
            if state.get_bool(&field) {
                "true".to_string()
            } else {
                "false".to_string()
            }
        })
        .route("true", when_true)
        .route("false", when_false)
    }

    /// Declare a label and the step it leads to.
    pub fn route(mut self, label: impl Into<String>, target: impl Into<String>) -> Self {
        self.routes.insert(label.into(), target.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.routes.values().map(String::as_str)
    }

    /// Evaluate the router and map its label to a target step.
    pub fn resolve(&self, state: &StateBag) -> Result<&str, RouteError> {
        let label = std::panic::catch_unwind(AssertUnwindSafe(|| (self.decide)(state)))
            .map_err(|_| RouteError::Panicked {
                router: self.name.clone(),
            })?;
        self.routes
            .get(&label)
            .map(String::as_str)
            .ok_or_else(|| RouteError::UndeclaredLabel {
                router: self.name.clone(),
                label,
            })
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}
