//! Named nodes of the asset tree and rule-based view resolution.
//!
//! A view (capability) is any `Clone + Send + Sync + 'static` value, usually
//! an `Arc` of a store or of a trait object. An asset caches at most one view
//! per type. Views it does not hold yet are built by rules registered on the
//! asset or on one of its ancestors, tried in registration order.

use crate::error::{EngineError, Result};
use crate::request_context::RequestContext;
use crate::tree::EngineContext;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace};

/// Resources an asset closes when it is closed.
pub trait Closeable: Send + Sync {
    fn close(&self);
}

type AnyView = Box<dyn Any + Send + Sync>;

/// `Ok(None)` means the rule does not apply because its predicate view could
/// not be resolved.
type Factory = Box<dyn Fn(&RequestContext, &Arc<Asset>) -> Result<Option<AnyView>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    Leaf,
    /// Decorates the view named by `predicate`.
    Wrapping { predicate: &'static str },
}

pub struct Rule {
    capability: TypeId,
    capability_name: &'static str,
    description: String,
    kind: RuleKind,
    factory: Factory,
}

impl Rule {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn capability_name(&self) -> &'static str {
        self.capability_name
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("capability", &self.capability_name)
            .field("description", &self.description)
            .field("kind", &self.kind)
            .finish()
    }
}

pub struct Asset {
    name: String,
    full_name: String,
    parent: Option<Weak<Asset>>,
    context: Arc<EngineContext>,
    views: RwLock<HashMap<TypeId, AnyView>>,
    children: RwLock<BTreeMap<String, Arc<Asset>>>,
    rules: RwLock<Vec<Arc<Rule>>>,
    closeables: Mutex<Vec<Arc<dyn Closeable>>>,
    /// Held while building views. Re-entrant so factories can resolve their
    /// predicates on the same asset; the set holds the types being built.
    resolving: ReentrantMutex<RefCell<HashSet<TypeId>>>,
    closed: AtomicBool,
}

impl Asset {
    pub fn new_root(context: Arc<EngineContext>) -> Arc<Self> {
        Arc::new(Self::new(String::new(), "/".to_string(), None, context))
    }

    fn new(
        name: String,
        full_name: String,
        parent: Option<Weak<Asset>>,
        context: Arc<EngineContext>,
    ) -> Self {
        Self {
            name,
            full_name,
            parent,
            context,
            views: RwLock::new(HashMap::new()),
            children: RwLock::new(BTreeMap::new()),
            rules: RwLock::new(Vec::new()),
            closeables: Mutex::new(Vec::new()),
            resolving: ReentrantMutex::new(RefCell::new(HashSet::new())),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `/a/b/name`; the root is `/`.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn parent(&self) -> Option<Arc<Asset>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the asset at `path` relative to this one, creating it and any
    /// missing ancestors. Empty segments are ignored, so `""` and `"/"` name
    /// this asset.
    pub fn acquire_asset(self: &Arc<Self>, path: &str) -> Arc<Asset> {
        let mut asset = self.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            asset = asset.acquire_child(segment);
        }
        asset
    }

    fn acquire_child(self: &Arc<Self>, name: &str) -> Arc<Asset> {
        if let Some(child) = self.children.read().get(name) {
            return child.clone();
        }
        let mut children = self.children.write();
        children
            .entry(name.to_string())
            .or_insert_with(|| {
                let full_name = if self.parent.is_none() {
                    format!("/{name}")
                } else {
                    format!("{}/{name}", self.full_name)
                };
                trace!(asset = %full_name, "created asset");
                Arc::new(Asset::new(
                    name.to_string(),
                    full_name,
                    Some(Arc::downgrade(self)),
                    self.context.clone(),
                ))
            })
            .clone()
    }

    pub fn get_child(&self, name: &str) -> Option<Arc<Asset>> {
        self.children.read().get(name).cloned()
    }

    pub fn children(&self) -> Vec<Arc<Asset>> {
        self.children.read().values().cloned().collect()
    }

    /// Detaches and closes a child.
    pub fn remove_child(&self, name: &str) -> Option<Arc<Asset>> {
        let child = self.children.write().remove(name)?;
        child.close();
        Some(child)
    }

    /// Registers a view under its own type, replacing any previous one.
    pub fn add_view<C>(&self, view: C)
    where
        C: Clone + Send + Sync + 'static,
    {
        self.views.write().insert(TypeId::of::<C>(), Box::new(view));
    }

    /// The cached view of type `C`, without resolving.
    pub fn get_view<C>(&self) -> Option<C>
    where
        C: Clone + Send + Sync + 'static,
    {
        self.views
            .read()
            .get(&TypeId::of::<C>())
            .and_then(|view| view.downcast_ref::<C>())
            .cloned()
    }

    /// The cached view of type `C` on this asset or its nearest ancestor
    /// holding one.
    pub fn find_view<C>(&self) -> Option<C>
    where
        C: Clone + Send + Sync + 'static,
    {
        if let Some(view) = self.get_view::<C>() {
            return Some(view);
        }
        let mut parent = self.parent();
        while let Some(asset) = parent {
            if let Some(view) = asset.get_view::<C>() {
                return Some(view);
            }
            parent = asset.parent();
        }
        None
    }

    pub fn add_closeable(&self, closeable: Arc<dyn Closeable>) {
        self.closeables.lock().push(closeable);
    }

    /// Adds a rule building `C` from nothing.
    pub fn add_leaf_rule<C, F>(&self, description: impl Into<String>, factory: F)
    where
        C: Clone + Send + Sync + 'static,
        F: Fn(&RequestContext, &Arc<Asset>) -> Result<C> + Send + Sync + 'static,
    {
        self.push_rule(Rule {
            capability: TypeId::of::<C>(),
            capability_name: type_name::<C>(),
            description: description.into(),
            kind: RuleKind::Leaf,
            factory: Box::new(move |rc: &RequestContext, asset: &Arc<Asset>| {
                factory(rc, asset).map(|view| Some(Box::new(view) as AnyView))
            }),
        });
    }

    /// Adds a rule building `C` by decorating the asset's `U` view. The rule
    /// is skipped when `U` cannot be resolved.
    pub fn add_wrapping_rule<C, U, F>(&self, description: impl Into<String>, factory: F)
    where
        C: Clone + Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
        F: Fn(&RequestContext, &Arc<Asset>, U) -> Result<C> + Send + Sync + 'static,
    {
        self.push_rule(Rule {
            capability: TypeId::of::<C>(),
            capability_name: type_name::<C>(),
            description: description.into(),
            kind: RuleKind::Wrapping {
                predicate: type_name::<U>(),
            },
            factory: Box::new(move |rc: &RequestContext, asset: &Arc<Asset>| {
                match asset.acquire_view_with::<U>(rc) {
                    Ok(underlying) => factory(rc, asset, underlying)
                        .map(|view| Some(Box::new(view) as AnyView)),
                    Err(EngineError::CapabilityNotFound { .. }) => Ok(None),
                    Err(err) => Err(err),
                }
            }),
        });
    }

    fn push_rule(&self, rule: Rule) {
        trace!(asset = %self.full_name, rule = ?rule, "added rule");
        self.rules.write().push(Arc::new(rule));
    }

    /// Rules for `capability` on this asset, then on each ancestor.
    fn rules_for(&self, capability: TypeId) -> Vec<Arc<Rule>> {
        let mut rules: Vec<Arc<Rule>> = self
            .rules
            .read()
            .iter()
            .filter(|r| r.capability == capability)
            .cloned()
            .collect();
        let mut parent = self.parent();
        while let Some(asset) = parent {
            rules.extend(
                asset
                    .rules
                    .read()
                    .iter()
                    .filter(|r| r.capability == capability)
                    .cloned(),
            );
            parent = asset.parent();
        }
        rules
    }

    /// Resolves `C` with a request context naming this asset.
    pub fn acquire_view<C>(self: &Arc<Self>) -> Result<C>
    where
        C: Clone + Send + Sync + 'static,
    {
        let rc = RequestContext::parse(&self.full_name);
        self.acquire_view_with::<C>(&rc)
    }

    /// Returns the cached `C`, building and caching it on first use.
    pub fn acquire_view_with<C>(self: &Arc<Self>, rc: &RequestContext) -> Result<C>
    where
        C: Clone + Send + Sync + 'static,
    {
        if let Some(view) = self.get_view::<C>() {
            return Ok(view);
        }
        if self.is_closed() {
            return Err(EngineError::Closed);
        }

        let guard = self.resolving.lock();
        // Another thread may have finished while we waited.
        if let Some(view) = self.get_view::<C>() {
            return Ok(view);
        }
        let capability = TypeId::of::<C>();
        if !guard.borrow_mut().insert(capability) {
            trace!(asset = %self.full_name, capability = type_name::<C>(), "cyclic resolution");
            return Err(self.not_found::<C>());
        }
        let result = self.resolve::<C>(rc);
        guard.borrow_mut().remove(&capability);

        let view = result?;
        self.views.write().insert(capability, Box::new(view.clone()));
        Ok(view)
    }

    fn resolve<C>(self: &Arc<Self>, rc: &RequestContext) -> Result<C>
    where
        C: Clone + Send + Sync + 'static,
    {
        for rule in self.rules_for(TypeId::of::<C>()) {
            let Some(view) = (rule.factory)(rc, self)? else {
                trace!(asset = %self.full_name, rule = %rule.description, "rule skipped");
                continue;
            };
            return match view.downcast::<C>() {
                Ok(view) => {
                    debug!(
                        asset = %self.full_name,
                        capability = type_name::<C>(),
                        rule = %rule.description,
                        "resolved view"
                    );
                    Ok(*view)
                }
                Err(_) => Err(self.not_found::<C>()),
            };
        }
        Err(self.not_found::<C>())
    }

    fn not_found<C>(&self) -> EngineError {
        EngineError::CapabilityNotFound {
            capability: type_name::<C>(),
            path: self.full_name.clone(),
        }
    }

    /// Closes children first, then this asset's resources, and drops every
    /// cached view. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let children: Vec<Arc<Asset>> = {
            let mut children = self.children.write();
            let all = children.values().cloned().collect();
            children.clear();
            all
        };
        for child in children {
            child.close();
        }
        let closeables: Vec<Arc<dyn Closeable>> = self.closeables.lock().drain(..).collect();
        for closeable in closeables.iter().rev() {
            closeable.close();
        }
        self.views.write().clear();
        if !closeables.is_empty() {
            info!(asset = %self.full_name, "closed asset");
        }
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("full_name", &self.full_name)
            .field("views", &self.views.read().len())
            .field("children", &self.children.read().len())
            .finish()
    }
}
