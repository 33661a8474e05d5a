//! `tether dump`: human-readable listing of a metadata file

use std::path::Path;

use anyhow::Context;
use tether_meta::{ClassMeta, Meta, MetadataStore, MethodMeta, NameTable, TypeEncoding};

fn open(file: &Path) -> anyhow::Result<MetadataStore> {
    MetadataStore::open(file)
        .with_context(|| format!("Cannot open metadata file {}", file.display()))
}

pub fn execute(file: &Path, name: Option<&str>) -> anyhow::Result<()> {
    let store = open(file)?;

    if let Some(name) = name {
        let meta = store
            .try_lookup(name)?
            .with_context(|| format!("No declaration named {}", name))?;
        print!("{}", describe(&meta));
        return Ok(());
    }

    let mut metas = Vec::new();
    for offset in store.file().entries(NameTable::Global)? {
        metas.push(store.meta_at(offset)?);
    }
    metas.sort_by(|a, b| a.js_name().cmp(b.js_name()));
    for meta in &metas {
        print!("{}", describe(meta));
    }
    println!("{} declarations", metas.len());
    Ok(())
}

pub fn modules(file: &Path) -> anyhow::Result<()> {
    let store = open(file)?;
    for module in store.modules()? {
        let framework = if module.is_framework() { " (framework)" } else { "" };
        println!("{}{}", module.name, framework);
        for library in &module.libraries {
            println!("  links {}", library.name);
        }
    }
    Ok(())
}

fn describe(meta: &Meta) -> String {
    let mut out = format!("{:?} {}", meta.kind(), meta.js_name());
    if meta.name() != meta.js_name() {
        out.push_str(&format!(" [{}]", meta.name()));
    }
    out.push('\n');

    match meta {
        Meta::Class(class) => describe_class(&mut out, class),
        Meta::Function(function) => {
            out.push_str(&format!("  {}\n", signature(&function.encodings)));
        }
        Meta::Record(record) => {
            for field in &record.fields {
                out.push_str(&format!("  {}: {:?}\n", field.name, field.encoding));
            }
        }
        Meta::JsCode(code) => out.push_str(&format!("  = {}\n", code.js_code)),
        Meta::Var(var) => out.push_str(&format!("  : {:?}\n", var.encoding)),
    }
    out
}

fn describe_class(out: &mut String, class: &ClassMeta) {
    if let Some(base) = &class.base_name {
        out.push_str(&format!("  extends {}\n", base));
    }
    if !class.protocols.is_empty() {
        out.push_str(&format!("  implements {}\n", class.protocols.join(", ")));
    }
    for method in &class.static_methods {
        out.push_str(&format!("  static {}\n", method_line(method)));
    }
    for method in &class.instance_methods {
        out.push_str(&format!("  {}\n", method_line(method)));
    }
    for property in class.static_properties.iter().chain(&class.instance_properties) {
        let access = match (&property.getter, &property.setter) {
            (Some(_), Some(_)) => "get set",
            (Some(_), None) => "get",
            (None, Some(_)) => "set",
            (None, None) => "",
        };
        out.push_str(&format!("  property {} {{ {} }}\n", property.js_name(), access));
    }
}

fn method_line(method: &MethodMeta) -> String {
    let mut line = format!(
        "{} -[{}] {}",
        method.js_name(),
        method.selector(),
        signature(&method.encodings)
    );
    if method.is_initializer() {
        line.push_str(" init");
    }
    if method.owns_returned_object() {
        line.push_str(" owned");
    }
    if method.has_error_out_parameter() {
        line.push_str(" throws");
    }
    line
}

/// `(params) -> ret`
fn signature(encodings: &[TypeEncoding]) -> String {
    match encodings.split_first() {
        Some((ret, params)) => {
            let params: Vec<String> = params.iter().map(|p| format!("{:?}", p)).collect();
            format!("({}) -> {:?}", params.join(", "), ret)
        }
        None => "()".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature() {
        assert_eq!(signature(&[TypeEncoding::Void]), "() -> Void");
        assert_eq!(
            signature(&[TypeEncoding::Int, TypeEncoding::Double]),
            "(Double) -> Int"
        );
        assert_eq!(signature(&[]), "()");
    }
}
