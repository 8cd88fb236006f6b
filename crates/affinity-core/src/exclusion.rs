//! # Exclusion Resolution
//!
//! Computes the immutable [`ExclusionProfile`] of a type from its declared
//! markers and caches it per (type name, version digest).
//!
//! ## Rules
//!
//! | Declaration | Effect |
//! |-------------|--------|
//! | `Excluded` on the type or an in-scope supertype | the type is never rewritten; its fields are excluded |
//! | `Excluded` on a field, or a final field | accesses to the field are never instrumented |
//! | `Excluded` on a method | accesses inside the method are never instrumented |
//! | `AllowCrossCategoryRead` on a field | Owner reads are not checked |
//! | `IgnoreDuringInit` on a field | writes recorded during initialization never produce findings |
//! | `TrackInitWrites` on a field | accesses inside `<init>`/`<clinit>` are instrumented |
//!
//! Supertype chains are followed through the lookup path while they stay in
//! the instrumentation scope. A supertype that is in scope but missing from
//! the lookup path is a resolution failure.

use crate::config::TargetScope;
use crate::errors::RewriteError;
use crate::ledger::SiteContext;
use crate::resolver::TypeLookup;
use affinity_audit_types::{markers, unit_digest, CompiledUnit};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Profiles
// =============================================================================

/// Exclusion decisions for one field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FieldPolicy {
    pub excluded: bool,
    pub static_init_exempt: bool,
    pub owner_read_allowed: bool,
    pub track_init_writes: bool,
    pub is_static: bool,
    pub is_final: bool,
}

/// Immutable exclusion decisions for one type version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExclusionProfile {
    pub type_name: String,
    /// Version digest of the unit the profile was built from.
    pub digest: String,
    pub super_name: Option<String>,
    pub class_excluded: bool,
    /// Supertype that carried `Excluded`, when the exclusion is inherited.
    pub excluded_via: Option<String>,
    pub fields: BTreeMap<String, FieldPolicy>,
    /// Excluded methods as `name + descriptor`.
    pub excluded_methods: BTreeSet<String>,
}

impl ExclusionProfile {
    pub fn is_class_excluded(&self) -> bool {
        self.class_excluded
    }

    /// Fields of excluded classes are excluded. Undeclared fields are not.
    pub fn is_field_excluded(&self, field: &str) -> bool {
        self.fields
            .get(field)
            .is_some_and(|f| self.class_excluded || f.excluded)
    }

    pub fn is_static_init_exempt(&self, field: &str) -> bool {
        self.fields.get(field).is_some_and(|f| f.static_init_exempt)
    }

    pub fn is_owner_read_allowed(&self, field: &str) -> bool {
        self.fields.get(field).is_some_and(|f| f.owner_read_allowed)
    }

    pub fn tracks_init_writes(&self, field: &str) -> bool {
        self.fields.get(field).is_some_and(|f| f.track_init_writes)
    }

    pub fn is_method_excluded(&self, name: &str, descriptor: &str) -> bool {
        self.excluded_methods
            .contains(&method_signature(name, descriptor))
    }

    pub fn declares_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Context bits for an access to `field` of this type.
    pub fn site_context(&self, field: &str) -> SiteContext {
        let mut ctx = SiteContext::empty();
        if self.class_excluded {
            ctx = ctx.with(SiteContext::CLASS_EXCLUDED);
        }
        if let Some(policy) = self.fields.get(field) {
            if policy.excluded {
                ctx = ctx.with(SiteContext::FIELD_EXCLUDED);
            }
            if policy.owner_read_allowed {
                ctx = ctx.with(SiteContext::OWNER_READ_ALLOWED);
            }
            if policy.static_init_exempt {
                ctx = ctx.with(SiteContext::INIT_EXEMPT);
            }
        }
        ctx
    }
}

fn method_signature(name: &str, descriptor: &str) -> String {
    format!("{}{}", name, descriptor)
}

// =============================================================================
// Profile Cache
// =============================================================================

/// Profiles keyed by (type name, version digest), shared by loading threads.
#[derive(Debug, Default)]
pub struct ProfileCache {
    profiles: RwLock<HashMap<(String, String), Arc<ExclusionProfile>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, type_name: &str, digest: &str) -> Option<Arc<ExclusionProfile>> {
        let found = self
            .profiles
            .read()
            .get(&(type_name.to_string(), digest.to_string()))
            .cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Insert unless another thread got there first; returns the cached value.
    pub fn insert(&self, profile: ExclusionProfile) -> Arc<ExclusionProfile> {
        let key = (profile.type_name.clone(), profile.digest.clone());
        self.profiles
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(profile))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.read().is_empty()
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn clear(&self) {
        self.profiles.write().clear();
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Where a field is declared, as seen from an access site.
#[derive(Debug, Clone)]
pub enum FieldResolution {
    /// Declared by this in-scope type.
    Declared(Arc<ExclusionProfile>),
    /// The chain left the instrumentation scope before the field was found.
    OutOfScope,
}

/// Builds and caches exclusion profiles.
pub struct ExclusionResolver {
    lookup: Arc<dyn TypeLookup>,
    cache: Arc<ProfileCache>,
    scope: TargetScope,
}

impl ExclusionResolver {
    pub fn new(lookup: Arc<dyn TypeLookup>, scope: TargetScope) -> Self {
        Self {
            lookup,
            cache: Arc::new(ProfileCache::new()),
            scope,
        }
    }

    /// Share a cache with other resolvers.
    pub fn with_cache(mut self, cache: Arc<ProfileCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<ProfileCache> {
        &self.cache
    }

    pub fn scope(&self) -> &TargetScope {
        &self.scope
    }

    /// Profile of `unit`, from the cache when this version was seen before.
    pub fn profile_for_unit(
        &self,
        unit: &CompiledUnit,
    ) -> Result<Arc<ExclusionProfile>, RewriteError> {
        let digest = unit_digest(unit).map_err(|e| RewriteError::Encode {
            type_name: unit.name.clone(),
            message: e.to_string(),
        })?;
        if let Some(profile) = self.cache.get(&unit.name, &digest) {
            return Ok(profile);
        }
        let profile = self.build_profile(unit, digest)?;
        Ok(self.cache.insert(profile))
    }

    /// Profile of a type on the lookup path.
    pub fn profile_for(
        &self,
        type_name: &str,
        needed_by: &str,
    ) -> Result<Arc<ExclusionProfile>, RewriteError> {
        let unit = self
            .lookup
            .lookup(type_name)
            .ok_or_else(|| RewriteError::Resolution {
                type_name: needed_by.to_string(),
                missing: type_name.to_string(),
                context: format!("referenced by {}", needed_by),
            })?;
        self.profile_for_unit(&unit)
    }

    /// Start resolving field accesses of `current`, the unit being rewritten.
    ///
    /// `current` is profiled here once and consulted directly, so it need not
    /// be on the lookup path yet.
    pub fn session(&self, current: &CompiledUnit) -> Result<ResolutionSession<'_>, RewriteError> {
        let profile = self.profile_for_unit(current)?;
        Ok(ResolutionSession {
            resolver: self,
            seen: HashMap::from([(current.name.clone(), profile.clone())]),
            current: profile,
        })
    }

    /// Find the declaring type of `owner.field` as seen from `current`.
    pub fn resolve_field(
        &self,
        current: &CompiledUnit,
        owner: &str,
        field: &str,
    ) -> Result<FieldResolution, RewriteError> {
        self.session(current)?.resolve_field(owner, field)
    }

    fn build_profile(
        &self,
        unit: &CompiledUnit,
        digest: String,
    ) -> Result<ExclusionProfile, RewriteError> {
        let mut class_excluded = unit.has_annotation(markers::EXCLUDED);
        let mut excluded_via = None;
        if !class_excluded {
            excluded_via = self.inherited_exclusion(unit)?;
            class_excluded = excluded_via.is_some();
        }

        let mut fields = BTreeMap::new();
        for field in &unit.fields {
            let policy = FieldPolicy {
                excluded: field.has_annotation(markers::EXCLUDED) || field.is_final,
                static_init_exempt: field.has_annotation(markers::IGNORE_DURING_INIT),
                owner_read_allowed: field.has_annotation(markers::ALLOW_CROSS_CATEGORY_READ),
                track_init_writes: field.has_annotation(markers::TRACK_INIT_WRITES),
                is_static: field.is_static,
                is_final: field.is_final,
            };
            if policy.excluded && !class_excluded {
                info!(
                    type_name = %unit.name,
                    field = %field.name,
                    final_field = field.is_final,
                    "field excluded from tracking"
                );
            }
            if policy.static_init_exempt {
                info!(
                    type_name = %unit.name,
                    field = %field.name,
                    "field will ignore initialization writes"
                );
            }
            if policy.owner_read_allowed {
                info!(
                    type_name = %unit.name,
                    field = %field.name,
                    "field allows cross-category reads"
                );
            }
            fields.insert(field.name.clone(), policy);
        }

        let excluded_methods: BTreeSet<String> = unit
            .methods
            .iter()
            .filter(|m| m.has_annotation(markers::EXCLUDED))
            .map(|m| method_signature(&m.name, &m.descriptor))
            .collect();
        for method in &excluded_methods {
            info!(type_name = %unit.name, method = %method, "method excluded from tracking");
        }
        if class_excluded {
            info!(
                type_name = %unit.name,
                inherited_from = excluded_via.as_deref().unwrap_or("-"),
                "class excluded from tracking"
            );
        }
        debug!(type_name = %unit.name, digest = %digest, "built exclusion profile");

        Ok(ExclusionProfile {
            type_name: unit.name.clone(),
            digest,
            super_name: unit.super_name.clone(),
            class_excluded,
            excluded_via,
            fields,
            excluded_methods,
        })
    }

    /// First in-scope supertype declaring `Excluded`, if any.
    fn inherited_exclusion(&self, unit: &CompiledUnit) -> Result<Option<String>, RewriteError> {
        let mut visited = HashSet::from([unit.name.clone()]);
        let mut next = unit.super_name.clone();
        while let Some(super_name) = next {
            if !self.scope.contains(&super_name) {
                return Ok(None);
            }
            if !visited.insert(super_name.clone()) {
                return Err(RewriteError::Resolution {
                    type_name: unit.name.clone(),
                    missing: super_name,
                    context: "supertype cycle".to_string(),
                });
            }
            let parent = self
                .lookup
                .lookup(&super_name)
                .ok_or_else(|| RewriteError::Resolution {
                    type_name: unit.name.clone(),
                    missing: super_name.clone(),
                    context: format!("supertype of {}", unit.name),
                })?;
            if parent.has_annotation(markers::EXCLUDED) {
                return Ok(Some(super_name));
            }
            next = parent.super_name.clone();
        }
        Ok(None)
    }
}

/// Profiles consulted while planning one unit.
///
/// Every type is profiled at most once per session, however many access
/// sites refer to it.
pub struct ResolutionSession<'r> {
    resolver: &'r ExclusionResolver,
    current: Arc<ExclusionProfile>,
    seen: HashMap<String, Arc<ExclusionProfile>>,
}

impl ResolutionSession<'_> {
    /// Profile of the unit being rewritten.
    pub fn current(&self) -> &Arc<ExclusionProfile> {
        &self.current
    }

    /// Number of distinct types profiled so far, the current one included.
    pub fn profiled(&self) -> usize {
        self.seen.len()
    }

    /// Find the declaring type of `owner.field`, walking supertypes.
    pub fn resolve_field(
        &mut self,
        owner: &str,
        field: &str,
    ) -> Result<FieldResolution, RewriteError> {
        let current_name = self.current.type_name.clone();
        let mut visited = HashSet::new();
        let mut next = Some(owner.to_string());
        while let Some(type_name) = next {
            if !self.resolver.scope.contains(&type_name) {
                return Ok(FieldResolution::OutOfScope);
            }
            if !visited.insert(type_name.clone()) {
                return Err(RewriteError::Resolution {
                    type_name: current_name,
                    missing: type_name,
                    context: "supertype cycle".to_string(),
                });
            }
            let profile = self.profile(&type_name)?;
            if profile.declares_field(field) {
                return Ok(FieldResolution::Declared(profile));
            }
            next = profile.super_name.clone();
        }
        Err(RewriteError::Resolution {
            type_name: current_name,
            missing: format!("{}.{}", owner, field),
            context: "field not declared in the supertype chain".to_string(),
        })
    }

    fn profile(&mut self, type_name: &str) -> Result<Arc<ExclusionProfile>, RewriteError> {
        if let Some(profile) = self.seen.get(type_name) {
            return Ok(profile.clone());
        }
        let profile = self
            .resolver
            .profile_for(type_name, &self.current.type_name)?;
        self.seen.insert(type_name.to_string(), profile.clone());
        Ok(profile)
    }
}

impl std::fmt::Debug for ExclusionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusionResolver")
            .field("scope", &self.scope)
            .field("cached_profiles", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::LocalUnitResolver;
    use affinity_audit_types::builder::{MethodBuilder, UnitBuilder};
    use affinity_audit_types::Instruction;

    fn resolver_with(units: Vec<CompiledUnit>) -> ExclusionResolver {
        let lookup = Arc::new(LocalUnitResolver::new());
        for unit in units {
            lookup.register(unit);
        }
        ExclusionResolver::new(lookup, TargetScope::new(vec!["com/model".to_string()]))
    }

    #[test]
    fn test_field_markers() {
        let unit = UnitBuilder::new("com/model/Model")
            .field("value", "I")
            .field_with("cfg", "I", true, false, &[markers::IGNORE_DURING_INIT])
            .field_with("shared", "I", false, false, &[markers::ALLOW_CROSS_CATEGORY_READ])
            .field_with("skip", "I", false, false, &[markers::EXCLUDED])
            .field_with("constant", "I", true, true, &[])
            .field_with("early", "I", true, false, &[markers::TRACK_INIT_WRITES])
            .method(
                MethodBuilder::new("debug", "()V")
                    .annotate(markers::EXCLUDED)
                    .op(Instruction::Return),
            )
            .build();
        let resolver = resolver_with(vec![]);
        let profile = resolver.profile_for_unit(&unit).unwrap();

        assert!(!profile.is_class_excluded());
        assert!(!profile.is_field_excluded("value"));
        assert!(profile.is_static_init_exempt("cfg"));
        assert!(profile.is_owner_read_allowed("shared"));
        assert!(profile.is_field_excluded("skip"));
        assert!(profile.is_field_excluded("constant"));
        assert!(profile.tracks_init_writes("early"));
        assert!(profile.is_method_excluded("debug", "()V"));
        assert!(!profile.is_method_excluded("debug", "(I)V"));

        let ctx = profile.site_context("cfg");
        assert!(ctx.contains(SiteContext::INIT_EXEMPT));
        assert!(!ctx.is_excluded());
    }

    #[test]
    fn test_class_exclusion_is_inherited() {
        let base = UnitBuilder::new("com/model/Base")
            .annotate(markers::EXCLUDED)
            .build();
        let child = UnitBuilder::new("com/model/Child")
            .extends("com/model/Base")
            .field("x", "I")
            .build();
        let resolver = resolver_with(vec![base]);
        let profile = resolver.profile_for_unit(&child).unwrap();
        assert!(profile.is_class_excluded());
        assert_eq!(profile.excluded_via.as_deref(), Some("com/model/Base"));
        assert!(profile.is_field_excluded("x"));
    }

    #[test]
    fn test_missing_in_scope_supertype_is_resolution_failure() {
        let child = UnitBuilder::new("com/model/Child")
            .extends("com/model/Missing")
            .build();
        let err = resolver_with(vec![]).profile_for_unit(&child).unwrap_err();
        assert!(err.is_resolution_failure());
    }

    #[test]
    fn test_out_of_scope_supertype_is_not_resolved() {
        let child = UnitBuilder::new("com/model/Child")
            .extends("java/lang/Thread")
            .build();
        let profile = resolver_with(vec![]).profile_for_unit(&child).unwrap();
        assert!(!profile.is_class_excluded());
    }

    #[test]
    fn test_resolve_inherited_field_to_declaring_type() {
        let base = UnitBuilder::new("com/model/Base").field("count", "I").build();
        let child = UnitBuilder::new("com/model/Child")
            .extends("com/model/Base")
            .build();
        let resolver = resolver_with(vec![base]);
        match resolver.resolve_field(&child, "com/model/Child", "count").unwrap() {
            FieldResolution::Declared(profile) => assert_eq!(profile.type_name, "com/model/Base"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            resolver.resolve_field(&child, "org/lib/Thing", "x").unwrap(),
            FieldResolution::OutOfScope
        ));
        assert!(resolver
            .resolve_field(&child, "com/model/Child", "nope")
            .unwrap_err()
            .is_resolution_failure());
    }

    #[test]
    fn test_session_profiles_each_type_once() {
        let base = UnitBuilder::new("com/model/Base").field("count", "I").build();
        let child = UnitBuilder::new("com/model/Child")
            .extends("com/model/Base")
            .field("own", "I")
            .build();
        let resolver = resolver_with(vec![base]);
        let mut session = resolver.session(&child).unwrap();
        for _ in 0..10 {
            for (owner, field) in [
                ("com/model/Child", "own"),
                ("com/model/Child", "count"),
                ("com/model/Base", "count"),
            ] {
                assert!(matches!(
                    session.resolve_field(owner, field).unwrap(),
                    FieldResolution::Declared(_)
                ));
            }
        }
        assert_eq!(session.profiled(), 2);
        // One lookup per type: the unit itself and its supertype.
        assert_eq!(resolver.cache().stats(), (0, 2));
    }

    #[test]
    fn test_cache_keyed_by_version() {
        let resolver = resolver_with(vec![]);
        let v1 = UnitBuilder::new("com/model/Model").field("a", "I").build();
        let v2 = UnitBuilder::new("com/model/Model").field("b", "I").build();

        let first = resolver.profile_for_unit(&v1).unwrap();
        let again = resolver.profile_for_unit(&v1).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        let second = resolver.profile_for_unit(&v2).unwrap();
        assert!(second.declares_field("b"));
        assert_eq!(resolver.cache().len(), 2);
        assert_eq!(resolver.cache().stats(), (1, 2));
    }

    #[test]
    fn test_supertype_cycle_is_rejected() {
        let a = UnitBuilder::new("com/model/A").extends("com/model/B").build();
        let b = UnitBuilder::new("com/model/B").extends("com/model/A").build();
        let resolver = resolver_with(vec![a.clone(), b]);
        assert!(resolver.profile_for_unit(&a).unwrap_err().is_resolution_failure());
    }
}
