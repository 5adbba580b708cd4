//! Include directives and the navigation-path resolver.
//!
//! Directives are recorded as written and resolved into a
//! [`NavigationTree`] in one pass, before any store I/O:
//!
//! ```ignore
//! let includes = Includes::new()
//!     .include("Parent.Child1")
//!     .include("Parent.Child2")
//!     .then_include("Baby");
//! let tree = includes.resolve(&GRAND_PARENT, &registry)?;
//! ```
//!
//! A path is a dotted list of navigation names. A dotted step may not pass
//! *through* a collection; `Children[].Baby` addresses every element of
//! `Children` explicitly. `then_include` continues from the node the previous
//! directive ended at, whatever its cardinality.

use entitymodel_core::{
    EntityDescriptor, EntityRegistry, Error, NavigationErrorKind, NavigationTree, Result,
};
use regex::Regex;
use std::sync::OnceLock;

/// One path segment: a navigation name, optionally marked `[]` to step into
/// each element of a collection.
const SEGMENT_PATTERN: &str = r"^([A-Za-z_][A-Za-z0-9_]*)(\[\])?$";

fn segment_regex() -> Option<&'static Regex> {
    static SEGMENT: OnceLock<Option<Regex>> = OnceLock::new();
    SEGMENT
        .get_or_init(|| Regex::new(SEGMENT_PATTERN).ok())
        .as_ref()
}

/// A single include directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeDirective {
    /// Path relative to the query root.
    Include(String),
    /// Path relative to where the previous directive ended.
    ThenInclude(String),
}

impl IncludeDirective {
    /// The directive's path text.
    pub fn path(&self) -> &str {
        match self {
            IncludeDirective::Include(p) | IncludeDirective::ThenInclude(p) => p,
        }
    }
}

/// A parsed path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment<'a> {
    name: &'a str,
    each: bool,
}

fn parse_path(path: &str) -> Result<Vec<Segment<'_>>> {
    let path = path.trim();
    if path.is_empty() {
        return Err(Error::navigation(
            NavigationErrorKind::Empty,
            path,
            "include path is empty",
        ));
    }
    let regex = segment_regex()
        .ok_or_else(|| Error::Custom("include segment pattern failed to compile".to_string()))?;
    path.split('.')
        .map(|raw| {
            let caps = regex.captures(raw).ok_or_else(|| {
                Error::navigation(
                    NavigationErrorKind::InvalidSegment,
                    path,
                    format!("'{}' is not a navigation name", raw),
                )
            })?;
            Ok(Segment {
                name: caps.get(1).map_or("", |m| m.as_str()),
                each: caps.get(2).is_some(),
            })
        })
        .collect()
}

/// Ordered include directives for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Includes {
    directives: Vec<IncludeDirective>,
}

impl Includes {
    /// No includes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Include a root-relative path.
    #[must_use]
    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.directives.push(IncludeDirective::Include(path.into()));
        self
    }

    /// Continue from the node the previous directive ended at.
    #[must_use]
    pub fn then_include(mut self, path: impl Into<String>) -> Self {
        self.directives
            .push(IncludeDirective::ThenInclude(path.into()));
        self
    }

    /// Recorded directives, in order.
    pub fn directives(&self) -> &[IncludeDirective] {
        &self.directives
    }

    /// True when no directive was given.
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Resolve the directives into a tree rooted at `root`.
    pub fn resolve(
        &self,
        root: &'static EntityDescriptor,
        registry: &EntityRegistry,
    ) -> Result<NavigationTree> {
        let mut tree = NavigationTree::new(root);
        let mut last: Option<Vec<usize>> = None;
        for directive in &self.directives {
            let start = match directive {
                IncludeDirective::Include(_) => Vec::new(),
                IncludeDirective::ThenInclude(path) => last.clone().ok_or_else(|| {
                    Error::navigation(
                        NavigationErrorKind::NoPreviousInclude,
                        path.as_str(),
                        "then_include must follow an include",
                    )
                })?,
            };
            last = Some(add_path(&mut tree, start, directive.path(), registry)?);
        }
        tracing::trace!(root = root.name, paths = ?tree.paths(), "Includes resolved");
        Ok(tree)
    }
}

/// Add one path below the node at `at`, returning the index path of the
/// node it ends at.
fn add_path(
    tree: &mut NavigationTree,
    mut at: Vec<usize>,
    path: &str,
    registry: &EntityRegistry,
) -> Result<Vec<usize>> {
    let segments = parse_path(path)?;
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        let holder = tree
            .descriptor_at(&at)
            .ok_or_else(|| Error::Custom(format!("include cursor lost at '{}'", path)))?;
        let info = holder.navigation(segment.name).ok_or_else(|| {
            Error::navigation(
                NavigationErrorKind::UnknownNavigation,
                path,
                format!("'{}' has no navigation '{}'", holder.name, segment.name),
            )
        })?;
        if segment.each && !info.is_many() {
            return Err(Error::navigation(
                NavigationErrorKind::InvalidSegment,
                path,
                format!("'{}.{}' is not a collection", holder.name, info.name),
            ));
        }
        if info.is_many() && !segment.each && i < last {
            return Err(Error::navigation(
                NavigationErrorKind::ThroughCollection,
                path,
                format!(
                    "cannot step through collection '{}.{}'; use '{}[]' or then_include",
                    holder.name, info.name, info.name
                ),
            ));
        }
        let target = registry.target_of(info)?;
        at = tree
            .ensure_child(&at, info, target)
            .ok_or_else(|| Error::Custom(format!("include cursor lost at '{}'", path)))?;
    }
    Ok(at)
}

/// Check that configured auto-include entries (`"Entity.Navigation"`) name
/// real navigations.
pub fn validate_auto_includes(registry: &EntityRegistry, entries: &[String]) -> Result<()> {
    for entry in entries {
        let valid = entry.split_once('.').is_some_and(|(entity, nav)| {
            registry
                .get(entity)
                .is_some_and(|d| d.navigation(nav).is_some())
        });
        if !valid {
            return Err(Error::Config(entitymodel_core::ConfigError {
                message: format!("auto_include entry '{}' does not name a navigation", entry),
                source: None,
            }));
        }
    }
    Ok(())
}

/// Add the navigations every query loads by default: owned navigations
/// always, auto-included ones (declared or configured) unless
/// `ignore_auto_includes` is set.
///
/// Defaults are applied below every node, including explicitly included
/// ones. A default navigation is skipped when its target already appears on
/// the path from the root, so cyclic auto-includes terminate.
pub fn apply_default_includes(
    tree: &mut NavigationTree,
    registry: &EntityRegistry,
    ignore_auto_includes: bool,
    configured: &[String],
) -> Result<()> {
    let mut pending: Vec<(Vec<usize>, Vec<&'static str>)> =
        vec![(Vec::new(), vec![tree.root().name])];
    while let Some((at, lineage)) = pending.pop() {
        let Some(holder) = tree.descriptor_at(&at) else {
            continue;
        };
        for info in holder.navigations {
            let configured_here = !ignore_auto_includes
                && configured
                    .iter()
                    .any(|e| e.split_once('.') == Some((holder.name, info.name)));
            if !(info.loads_by_default(ignore_auto_includes) || configured_here)
                || lineage.contains(&info.target)
            {
                continue;
            }
            let target = registry.target_of(info)?;
            tree.ensure_child(&at, info, target);
        }
        let children = tree.children_at(&at).unwrap_or(&[]);
        for (i, child) in children.iter().enumerate() {
            let mut path = at.clone();
            path.push(i);
            let mut lineage = lineage.clone();
            lineage.push(child.target().name);
            pending.push((path, lineage));
        }
    }
    Ok(())
}
