//! Flattening of nested configuration trees into a single parameter namespace.

use std::collections::BTreeMap;

use crate::models::{ParamTree, ParamValue};

/// Default separator between nested keys.
pub const DEFAULT_SEPARATOR: &str = "/";

/// Flat parameter namespace: full key path -> leaf value.
pub type FlatParams = BTreeMap<String, ParamValue>;

/// Walk `tree` depth-first and emit every leaf under its full key path,
/// joined with `sep`. Empty nested mappings contribute nothing.
pub fn flatten(tree: &ParamTree, sep: &str) -> FlatParams {
    let mut out = FlatParams::new();
    walk(tree, None, sep, &mut out);
    out
}

fn walk(tree: &ParamTree, parent: Option<&str>, sep: &str, out: &mut FlatParams) {
    for (key, value) in tree {
        let path = match parent {
            Some(p) => format!("{p}{sep}{key}"),
            None => key.clone(),
        };
        match value {
            ParamValue::Nested(child) => walk(child, Some(&path), sep, out),
            leaf => {
                out.insert(path, leaf.clone());
            }
        }
    }
}
