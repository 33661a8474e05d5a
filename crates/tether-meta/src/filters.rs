//! Declaration filters run by the serializer

use rustc_hash::{FxHashMap, FxHashSet};

use crate::decl::{Declaration, DeclarationGraph};
use crate::error::{CreationError, DeclarationInfo};
use crate::serializer::{
    Body, Item, ItemKind, Prepared, PreparedClass, PreparedMethod, PreparedProperty,
};

/// Fold every category into the interface it extends
///
/// A category of an unknown interface is reported and dropped.
pub(crate) fn merge_categories(
    graph: &DeclarationGraph,
    items: &mut [Item],
    skipped: &mut Vec<CreationError>,
) {
    let interfaces: FxHashMap<String, usize> = items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| match &item.decl {
            Declaration::Interface(d) => Some((d.common.name.clone(), i)),
            _ => None,
        })
        .collect();

    for module in &graph.modules {
        for decl in &module.declarations {
            let Declaration::Category(category) = decl else {
                continue;
            };
            let target = match interfaces.get(&category.extends) {
                Some(&i) => match &mut items[i].decl {
                    Declaration::Interface(d) => Some(d),
                    _ => None,
                },
                None => None,
            };
            let Some(interface) = target else {
                skipped.push(
                    CreationError::soft(format!(
                        "Category extends unknown interface '{}'.",
                        category.extends
                    ))
                    .with_declaration(DeclarationInfo {
                        name: category.name.clone(),
                        js_name: category.name.clone(),
                        module: module.name.clone(),
                    }),
                );
                continue;
            };
            log::trace!("merging category {}({})", category.extends, category.name);
            interface.methods.extend(category.methods.iter().cloned());
            interface.properties.extend(category.properties.iter().cloned());
            for protocol in &category.protocols {
                if !interface.protocols.contains(protocol) {
                    interface.protocols.push(protocol.clone());
                }
            }
        }
    }
}

/// Give every declaration of a top-level module a distinct script name
///
/// The declaration with the highest kind priority keeps its name; the others
/// get their kind suffix, plus an index when that name is also taken.
pub(crate) fn resolve_name_collisions(graph: &DeclarationGraph, items: &mut [Item]) {
    let mut groups: FxHashMap<(&str, String), Vec<usize>> = FxHashMap::default();
    for (i, item) in items.iter().enumerate() {
        let module = graph.modules[item.module].top_level_name();
        groups
            .entry((module, item.js_name.clone()))
            .or_default()
            .push(i);
    }

    let mut taken: FxHashMap<&str, FxHashSet<String>> = FxHashMap::default();
    for (module, js_name) in groups.keys() {
        taken.entry(*module).or_default().insert(js_name.clone());
    }

    let mut colliding: Vec<_> = groups.into_iter().filter(|(_, g)| g.len() > 1).collect();
    // deterministic output
    colliding.sort_by(|a, b| a.1[0].cmp(&b.1[0]));

    for ((module, _), mut group) in colliding {
        group.sort_by(|&a, &b| items[b].kind.cmp(&items[a].kind).then(a.cmp(&b)));
        let names = taken.entry(module).or_default();
        for &i in &group[1..] {
            let item = &mut items[i];
            let base = format!("{}{}", item.js_name, item.kind.rename_suffix());
            let mut index = 1;
            let renamed = loop {
                let candidate = if index > 1 {
                    format!("{}{}", base, index)
                } else {
                    base.clone()
                };
                if names.insert(candidate.clone()) {
                    break candidate;
                }
                index += 1;
            };
            log::debug!("renamed {} to {} in module {}", item.js_name, renamed, module);
            item.js_name = renamed;
        }
    }
}

/// Drop members whose selector and encodings match one inherited from a base
/// interface or an adopted protocol
pub(crate) fn remove_duplicate_members(prepared: &mut [Prepared]) {
    let mut interfaces = FxHashMap::default();
    let mut protocols = FxHashMap::default();
    for (i, item) in prepared.iter().enumerate() {
        if let Body::Class(_) = item.body {
            match item.kind {
                ItemKind::Protocol => protocols.insert(item.name.clone(), i),
                _ => interfaces.insert(item.name.clone(), i),
            };
        }
    }

    let snapshot: Vec<Option<PreparedClass>> = prepared
        .iter()
        .map(|item| match &item.body {
            Body::Class(class) => Some(class.clone()),
            _ => None,
        })
        .collect();

    for (i, item) in prepared.iter_mut().enumerate() {
        let Body::Class(class) = &mut item.body else {
            continue;
        };
        let ancestors = ancestors_of(i, &snapshot, &interfaces, &protocols);
        if ancestors.is_empty() {
            continue;
        }
        let instance_methods = inherited(&ancestors, &snapshot, |c| &c.instance_methods);
        let static_methods = inherited(&ancestors, &snapshot, |c| &c.static_methods);
        class
            .instance_methods
            .retain(|m| !instance_methods.iter().any(|p| same_method(m, p)));
        class
            .static_methods
            .retain(|m| !static_methods.iter().any(|p| same_method(m, p)));

        let instance_properties = inherited(&ancestors, &snapshot, |c| &c.instance_properties);
        let static_properties = inherited(&ancestors, &snapshot, |c| &c.static_properties);
        class
            .instance_properties
            .retain(|p| !instance_properties.iter().any(|q| same_property(p, q)));
        class
            .static_properties
            .retain(|p| !static_properties.iter().any(|q| same_property(p, q)));
    }
}

fn inherited<'a, T>(
    ancestors: &[usize],
    snapshot: &'a [Option<PreparedClass>],
    pick: impl Fn(&'a PreparedClass) -> &'a Vec<T>,
) -> Vec<&'a T> {
    ancestors
        .iter()
        .filter_map(|&a| snapshot[a].as_ref())
        .flat_map(|c| pick(c).iter())
        .collect()
}

fn same_method(a: &PreparedMethod, b: &PreparedMethod) -> bool {
    a.selector == b.selector && a.encodings == b.encodings
}

fn same_property(a: &PreparedProperty, b: &PreparedProperty) -> bool {
    let accessor = |x: &Option<PreparedMethod>, y: &Option<PreparedMethod>| match (x, y) {
        (Some(x), Some(y)) => same_method(x, y),
        (None, None) => true,
        _ => false,
    };
    a.name == b.name && accessor(&a.getter, &b.getter) && accessor(&a.setter, &b.setter)
}

/// Base chain and adopted protocols, transitively, excluding `start`
fn ancestors_of(
    start: usize,
    classes: &[Option<PreparedClass>],
    interfaces: &FxHashMap<String, usize>,
    protocols: &FxHashMap<String, usize>,
) -> Vec<usize> {
    let mut visited = FxHashSet::default();
    visited.insert(start);
    let mut stack = vec![start];
    let mut result = Vec::new();
    while let Some(current) = stack.pop() {
        let Some(class) = &classes[current] else {
            continue;
        };
        let parents = class
            .base
            .iter()
            .filter_map(|b| interfaces.get(b))
            .chain(class.protocols.iter().filter_map(|p| protocols.get(p)));
        for &parent in parents {
            if visited.insert(parent) {
                result.push(parent);
                stack.push(parent);
            }
        }
    }
    result
}
